// src/config.rs

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use arrow::record_batch::RecordBatch;
use serde::Deserialize;
use url::Url;

use crate::error::MetricError;
use crate::metrics::{Aggregation, GeographyArea, MetricTable, RatioMetric, RollupMetric};
use crate::portal::ALL_FEATURES;
use crate::publish::{OutputMode, OutputTarget};
use crate::table::{FieldSelector, Predicate};

/// Year token width for ratio key/weighted fields (`JOBAUTO_21`).
const RATIO_YEAR_WIDTH: usize = 2;
/// Year token width for rollup key fields (`YEAR2050`).
const ROLLUP_YEAR_WIDTH: usize = 4;

/// Top-level run configuration.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Portal hosting the source layers and the output.
    pub portal: PortalConfig,

    /// What happens when a key pattern matches no source column. Default: strict.
    #[serde(default)]
    pub field_matching: FieldMatching,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Layer the merged metrics are joined to before output.
    pub boundaries: BoundaryConfig,

    #[serde(default)]
    pub output: OutputConfig,

    /// Metrics in run order.
    pub metrics: Vec<MetricConfig>,
}

#[derive(Debug, Deserialize)]
pub struct PortalConfig {
    /// Portal root, e.g. "https://wfrc.maps.arcgis.com".
    pub url: String,

    /// Account to sign in as. Without one, requests are anonymous.
    #[serde(default)]
    pub username: Option<String>,

    /// Environment variable holding the account password.
    #[serde(default = "default_password_env")]
    pub password_env: String,

    #[serde(default = "default_referer")]
    pub referer: String,

    /// Requested token lifetime. Default: 60.
    #[serde(default = "default_token_expiration")]
    pub token_expiration_minutes: u32,

    /// Features per query page. Default: 2000.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldMatching {
    #[default]
    Strict,
    Lenient,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Directory for the per-run log file; `null` disables file logging.
    #[serde(default = "default_log_directory")]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_log_directory(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BoundaryConfig {
    pub item_id: String,

    #[serde(default)]
    pub layer_index: usize,

    /// Boundary attribute matched against `geoname`. Default: "GeoName".
    #[serde(default = "default_geoname_field")]
    pub geoname_field: String,

    /// Boundary attributes left out of the output.
    #[serde(default = "default_drop_fields")]
    pub drop_fields: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub mode: OutputMode,

    /// File written by the csv and parquet modes.
    #[serde(default = "default_output_path")]
    pub path: PathBuf,

    /// Title of the hosted layer (feature_layer mode).
    #[serde(default)]
    pub item_title: String,

    /// Service name used when the layer is first created. Default: the title.
    #[serde(default)]
    pub service_name: Option<String>,

    #[serde(default)]
    pub tags: String,

    #[serde(default = "default_add_batch_size")]
    pub batch_size: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            mode: OutputMode::default(),
            path: default_output_path(),
            item_title: String::new(),
            service_name: None,
            tags: String::new(),
            batch_size: default_add_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricConfig {
    pub name: String,
    pub item_id: String,
    #[serde(default)]
    pub layer_index: usize,

    /// Where-clause sent with the layer query. Default: "1=1".
    #[serde(default = "default_query")]
    pub query: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    pub geography_fields: Vec<String>,

    #[serde(default)]
    pub geography_areas: Vec<AreaConfig>,

    pub key_field_pattern: String,
    pub out_field_pattern: String,
    pub method: MethodConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AreaConfig {
    pub name: String,
    pub filter: String,
    #[serde(default)]
    pub query_fields: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MethodConfig {
    Ratio {
        weighted_field_pattern: String,
        weighted_field_prefix: String,
    },
    Rollup {
        #[serde(default)]
        aggregation: Aggregation,
    },
}

fn default_password_env() -> String {
    "PORTAL_PASSWORD".into()
}
fn default_referer() -> String {
    "https://www.arcgis.com".into()
}
fn default_token_expiration() -> u32 {
    60
}
fn default_page_size() -> usize {
    2000
}
fn default_log_directory() -> Option<PathBuf> {
    Some(PathBuf::from("Logs"))
}
fn default_geoname_field() -> String {
    "GeoName".into()
}
fn default_drop_fields() -> Vec<String> {
    vec!["Shape__Area".into(), "Shape__Length".into()]
}
fn default_output_path() -> PathBuf {
    PathBuf::from("Outputs").join("metrics.csv")
}
fn default_add_batch_size() -> usize {
    1000
}
fn default_query() -> String {
    ALL_FEATURES.into()
}
fn default_true() -> bool {
    true
}

/// How a metric is computed once its source table is in hand.
#[derive(Debug, Clone)]
pub enum Method {
    Ratio(RatioMetric),
    Rollup(RollupMetric),
}

/// A validated metric, ready to fetch and aggregate.
#[derive(Debug, Clone)]
pub struct MetricPlan {
    pub name: String,
    pub item_id: String,
    pub layer_index: usize,
    pub query: String,
    pub method: Method,
}

impl MetricPlan {
    pub fn aggregate(&self, source: &RecordBatch, strict: bool) -> Result<MetricTable, MetricError> {
        match &self.method {
            Method::Ratio(m) => m.aggregate(&self.name, source, strict),
            Method::Rollup(m) => m.aggregate(&self.name, source, strict),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.method {
            Method::Ratio(_) => "ratio",
            Method::Rollup(_) => "rollup",
        }
    }
}

fn selector(metric: &str, what: &str, pattern: &str, year_width: usize) -> Result<FieldSelector> {
    let sel = FieldSelector::new(pattern, year_width)
        .with_context(|| format!("metric '{metric}': invalid {what} `{pattern}`"))?;
    if !sel.is_anchored() {
        bail!("metric '{metric}': {what} `{pattern}` must be anchored with ^ and $");
    }
    Ok(sel)
}

impl MetricConfig {
    /// Compile patterns and filters into a runnable plan.
    pub fn compile(&self) -> Result<MetricPlan> {
        let name = self.name.as_str();
        if self.geography_fields.is_empty() {
            bail!("metric '{name}': geography_fields must not be empty");
        }
        if self.out_field_pattern.is_empty() {
            bail!("metric '{name}': out_field_pattern must not be empty");
        }

        let areas = self
            .geography_areas
            .iter()
            .map(|a| {
                let predicate = Predicate::parse(&a.filter)
                    .with_context(|| format!("metric '{name}': area '{}'", a.name))?;
                Ok(GeographyArea {
                    name: a.name.clone(),
                    predicate,
                    query_fields: a.query_fields.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let method = match &self.method {
            MethodConfig::Ratio {
                weighted_field_pattern,
                weighted_field_prefix,
            } => Method::Ratio(RatioMetric {
                geography_fields: self.geography_fields.clone(),
                areas,
                key_fields: selector(name, "key_field_pattern", &self.key_field_pattern, RATIO_YEAR_WIDTH)?,
                weighted_fields: selector(
                    name,
                    "weighted_field_pattern",
                    weighted_field_pattern,
                    RATIO_YEAR_WIDTH,
                )?,
                weighted_field_prefix: weighted_field_prefix.clone(),
                out_field_pattern: self.out_field_pattern.clone(),
            }),
            MethodConfig::Rollup { aggregation } => Method::Rollup(RollupMetric {
                geography_fields: self.geography_fields.clone(),
                areas,
                key_fields: selector(name, "key_field_pattern", &self.key_field_pattern, ROLLUP_YEAR_WIDTH)?,
                aggregation: *aggregation,
                out_field_pattern: self.out_field_pattern.clone(),
            }),
        };

        Ok(MetricPlan {
            name: self.name.clone(),
            item_id: self.item_id.clone(),
            layer_index: self.layer_index,
            query: self.query.clone(),
            method,
        })
    }
}

impl Config {
    /// Read, parse and validate a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_yaml(&data).with_context(|| format!("loading config file {}", path.display()))
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data).context("parsing YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check required fields and cross-metric consistency.
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.portal.url)
            .with_context(|| format!("portal.url `{}` is not a valid url", self.portal.url))?;
        if self.portal.page_size == 0 {
            bail!("portal.page_size must be positive");
        }
        if self.boundaries.item_id.is_empty() {
            bail!("boundaries.item_id is required");
        }
        if self.output.mode == OutputMode::FeatureLayer && self.output.item_title.is_empty() {
            bail!("output.item_title is required for feature_layer output");
        }
        if self.metrics.is_empty() {
            bail!("at least one metric is required");
        }

        let mut names = HashSet::new();
        let mut outs = HashSet::new();
        for m in &self.metrics {
            if !names.insert(m.name.as_str()) {
                bail!("duplicate metric name: {}", m.name);
            }
            if !outs.insert(m.out_field_pattern.as_str()) {
                bail!(
                    "metric '{}': out_field_pattern `{}` is already used",
                    m.name,
                    m.out_field_pattern
                );
            }
            m.compile()?;
        }
        Ok(())
    }

    pub fn strict(&self) -> bool {
        self.field_matching == FieldMatching::Strict
    }

    /// Plans for enabled metrics in configuration order. A non-empty `only`
    /// restricts the run to those names, enabled or not.
    pub fn plans(&self, only: &[String]) -> Result<Vec<MetricPlan>> {
        for name in only {
            if !self.metrics.iter().any(|m| &m.name == name) {
                bail!("unknown metric: {name}");
            }
        }
        self.metrics
            .iter()
            .filter(|m| {
                if only.is_empty() {
                    m.enabled
                } else {
                    only.contains(&m.name)
                }
            })
            .map(MetricConfig::compile)
            .collect()
    }

    pub fn output_target(&self) -> OutputTarget {
        let o = &self.output;
        OutputTarget {
            mode: o.mode,
            path: o.path.clone(),
            item_title: o.item_title.clone(),
            service_name: o.service_name.clone().unwrap_or_else(|| o.item_title.clone()),
            tags: o.tags.clone(),
            batch_size: o.batch_size.max(1),
        }
    }

    /// Password from `portal.password_env`, when a username is configured.
    pub fn password(&self) -> Result<Option<String>> {
        if self.portal.username.is_none() {
            return Ok(None);
        }
        std::env::var(&self.portal.password_env)
            .map(Some)
            .with_context(|| format!("environment variable {} is not set", self.portal.password_env))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
portal:
  url: https://wfrc.maps.arcgis.com
  username: analytics_wfrc
  password_env: TEST_PORTAL_PASSWORD_UNSET
boundaries:
  item_id: 98bfc2eb26d94adcb6ae9cab2f7d57a8
metrics:
  - name: Jobs By Auto
    item_id: d485928e777740c7963a5b68a37db116
    geography_fields: [CITYAREA, CO_NAME]
    geography_areas:
      - name: Wasatch Front Region
        filter: CO_FIPS==CO_FIPS
        query_fields: [CO_FIPS]
    key_field_pattern: ^JOBAUTO_[0-9]{2}$
    out_field_pattern: weighted_ato_jobauto_
    method:
      kind: ratio
      weighted_field_pattern: ^HH_[0-9]{2}$
      weighted_field_prefix: HH_
  - name: Housing Costs
    item_id: 82fdb720f4bf43f98c1b7cac14a93c0f
    geography_fields: [CityArea]
    key_field_pattern: ^h_ami_[0-9]{4}$
    out_field_pattern: h_ami_
    method:
      kind: rollup
      aggregation: mean
  - name: Households with Access to Parks
    item_id: b964fa04b6184b5ebc9ec2ae24a586ab
    enabled: false
    geography_fields: [CITYAREA]
    key_field_pattern: ^HH_[0-9]{4}$
    out_field_pattern: hh_20min_walk_parks_
    method:
      kind: rollup
"#;

    #[test]
    fn test_defaults_and_plans() -> Result<()> {
        let cfg = Config::from_yaml(BASE)?;
        assert!(cfg.strict());
        assert_eq!(cfg.output.mode, OutputMode::Csv);
        assert_eq!(cfg.boundaries.geoname_field, "GeoName");
        assert_eq!(cfg.boundaries.drop_fields, vec!["Shape__Area", "Shape__Length"]);
        assert_eq!(cfg.logging.directory, Some(PathBuf::from("Logs")));

        let plans = cfg.plans(&[])?;
        let names: Vec<&str> = plans.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Jobs By Auto", "Housing Costs"]);
        assert_eq!(plans[0].query, "1=1");
        assert_eq!(plans[0].kind(), "ratio");
        match &plans[1].method {
            Method::Rollup(r) => assert_eq!(r.aggregation, Aggregation::Mean),
            other => panic!("expected rollup, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_only_selects_disabled_metrics_too() -> Result<()> {
        let cfg = Config::from_yaml(BASE)?;
        let plans = cfg.plans(&["Households with Access to Parks".to_string()])?;
        assert_eq!(plans.len(), 1);
        assert!(cfg.plans(&["Nope".to_string()]).is_err());
        Ok(())
    }

    fn expect_invalid(yaml: &str, needle: &str) {
        let err = Config::from_yaml(yaml).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains(needle), "`{msg}` does not mention `{needle}`");
    }

    #[test]
    fn test_rejects_unanchored_pattern() {
        expect_invalid(
            &BASE.replace("^h_ami_[0-9]{4}$", "h_ami_[0-9]{4}"),
            "must be anchored",
        );
    }

    #[test]
    fn test_rejects_duplicate_out_pattern() {
        expect_invalid(
            &BASE.replace("out_field_pattern: h_ami_", "out_field_pattern: weighted_ato_jobauto_"),
            "already used",
        );
    }

    #[test]
    fn test_rejects_duplicate_names() {
        expect_invalid(
            &BASE.replace("name: Housing Costs", "name: Jobs By Auto"),
            "duplicate metric name",
        );
    }

    #[test]
    fn test_rejects_bad_filter() {
        expect_invalid(&BASE.replace("CO_FIPS==CO_FIPS", "CO_FIPS =="), "area 'Wasatch Front Region'");
    }

    #[test]
    fn test_rejects_empty_geography_fields() {
        expect_invalid(
            &BASE.replace("geography_fields: [CityArea]", "geography_fields: []"),
            "geography_fields must not be empty",
        );
    }

    #[test]
    fn test_rejects_unknown_method() {
        expect_invalid(&BASE.replace("kind: ratio", "kind: median"), "parsing YAML");
    }

    #[test]
    fn test_feature_layer_needs_title() {
        let yaml = format!("{BASE}\noutput:\n  mode: feature_layer\n");
        expect_invalid(&yaml, "item_title");
    }

    #[test]
    fn test_missing_password_env() -> Result<()> {
        let cfg = Config::from_yaml(BASE)?;
        let err = cfg.password().unwrap_err();
        assert!(err.to_string().contains("TEST_PORTAL_PASSWORD_UNSET"));
        Ok(())
    }

    #[test]
    fn test_service_name_defaults_to_title() -> Result<()> {
        let yaml = format!(
            "{BASE}\noutput:\n  mode: feature_layer\n  item_title: WFRC_PerformanceMetrics\n  tags: wfrc, metrics\n"
        );
        let cfg = Config::from_yaml(&yaml)?;
        let t = cfg.output_target();
        assert_eq!(t.service_name, "WFRC_PerformanceMetrics");
        assert_eq!(t.mode, OutputMode::FeatureLayer);
        Ok(())
    }

    #[test]
    fn test_shipped_catalogue_loads() -> Result<()> {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("metrics.yaml");
        let cfg = Config::load(&path)?;
        assert_eq!(cfg.metrics.len(), 23);
        let plans = cfg.plans(&[])?;
        assert_eq!(plans.len(), 21);
        assert_eq!(plans[0].kind(), "ratio");
        assert!(plans.iter().skip(2).all(|p| p.kind() == "rollup"));
        Ok(())
    }
}
