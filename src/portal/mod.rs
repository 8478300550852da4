// src/portal/mod.rs
//
// REST client for the GIS portal that hosts the source layers, the boundary
// layer and the published output.

pub mod features;
pub mod hosted;
pub mod query;

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use tracing::{debug, info, instrument};
use url::Url;

pub use features::{EsriFeature, EsriField, FeatureSet, QueryPage};

/// Where-clause that matches every feature.
pub const ALL_FEATURES: &str = "1=1";

/// Anything that can hand the pipeline a layer as a [`FeatureSet`].
#[async_trait]
pub trait LayerSource: Send + Sync {
    async fn query_layer(
        &self,
        item_id: &str,
        layer_index: usize,
        where_clause: &str,
        with_geometry: bool,
    ) -> Result<FeatureSet>;
}

/// Subset of the item description the client needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ItemInfo {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "type")]
    pub item_type: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
    #[serde(default)]
    expires: Option<i64>,
}

pub struct Portal {
    client: Client,
    base: Url,
    referer: String,
    page_size: usize,
    token: Option<String>,
    username: Option<String>,
}

impl Portal {
    pub fn new(base_url: &str, referer: &str, page_size: usize) -> Result<Self> {
        // trailing slash so joins stay under the portal path
        let mut base =
            Url::parse(base_url).with_context(|| format!("parsing portal url {base_url}"))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .gzip(true)
            .build()
            .context("building http client")?;
        Ok(Self {
            client,
            base,
            referer: referer.to_string(),
            page_size: page_size.max(1),
            token: None,
            username: None,
        })
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Exchange credentials for a token used on every later request.
    #[instrument(level = "info", skip(self, password))]
    pub async fn sign_in(
        &mut self,
        username: &str,
        password: &str,
        expiration_minutes: u32,
    ) -> Result<()> {
        let url = self.sharing_url("generateToken")?;
        let expiration = expiration_minutes.to_string();
        let form = [
            ("username", username),
            ("password", password),
            ("referer", self.referer.as_str()),
            ("expiration", expiration.as_str()),
            ("f", "json"),
        ];
        let resp: TokenResponse = self.post_form(url, &form).await.context("signing in")?;
        debug!(expires = ?resp.expires, "token issued");
        self.token = Some(resp.token);
        self.username = Some(username.to_string());
        info!(portal = %self.base, user = username, "connected to portal");
        Ok(())
    }

    /// `{portal}/sharing/rest/{path}`
    pub(crate) fn sharing_url(&self, path: &str) -> Result<Url> {
        self.base
            .join(&format!("sharing/rest/{path}"))
            .with_context(|| format!("building portal url for {path}"))
    }

    /// `{portal}/sharing/rest/content/users/{user}/{path}`; needs a signed-in user.
    pub(crate) fn user_content_url(&self, path: &str) -> Result<Url> {
        let user = self
            .username
            .as_deref()
            .ok_or_else(|| anyhow!("portal content changes need a signed-in user"))?;
        self.sharing_url(&format!("content/users/{user}/{path}"))
    }

    fn with_token(&self, params: &mut Vec<(&str, String)>) {
        if let Some(token) = &self.token {
            params.push(("token", token.clone()));
        }
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        params: &[(&str, String)],
    ) -> Result<T> {
        let mut query: Vec<(&str, String)> = params.to_vec();
        self.with_token(&mut query);
        let resp = self
            .client
            .get(url.clone())
            .header(reqwest::header::REFERER, &self.referer)
            .query(&query)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url}"))?;
        let body: Value = resp
            .json()
            .await
            .with_context(|| format!("decoding response from {url}"))?;
        decode_envelope(body).with_context(|| format!("GET {url}"))
    }

    pub(crate) async fn post_form<T: DeserializeOwned>(
        &self,
        url: Url,
        form: &[(&str, &str)],
    ) -> Result<T> {
        let mut fields: Vec<(&str, String)> =
            form.iter().map(|(k, v)| (*k, v.to_string())).collect();
        self.with_token(&mut fields);
        let resp = self
            .client
            .post(url.clone())
            .header(reqwest::header::REFERER, &self.referer)
            .form(&fields)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?
            .error_for_status()
            .with_context(|| format!("POST {url}"))?;
        let body: Value = resp
            .json()
            .await
            .with_context(|| format!("decoding response from {url}"))?;
        decode_envelope(body).with_context(|| format!("POST {url}"))
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn item(&self, item_id: &str) -> Result<ItemInfo> {
        let url = self.sharing_url(&format!("content/items/{item_id}"))?;
        self.get_json(url, &[("f", "json".to_string())])
            .await
            .with_context(|| format!("looking up item {item_id}"))
    }

    /// Service URL of an item's layer `layer_index`.
    pub async fn layer_url(&self, item_id: &str, layer_index: usize) -> Result<Url> {
        let item = self.item(item_id).await?;
        let service = item
            .url
            .ok_or_else(|| anyhow!("item {item_id} ({}) has no service url", item.title))?;
        let layer = format!("{}/{}", service.trim_end_matches('/'), layer_index);
        Url::parse(&layer).with_context(|| format!("parsing layer url {layer}"))
    }
}

#[async_trait]
impl LayerSource for Portal {
    async fn query_layer(
        &self,
        item_id: &str,
        layer_index: usize,
        where_clause: &str,
        with_geometry: bool,
    ) -> Result<FeatureSet> {
        let layer = self.layer_url(item_id, layer_index).await?;
        self.query(&layer, where_clause, with_geometry)
            .await
            .with_context(|| format!("querying item {item_id} layer {layer_index}"))
    }
}

/// Turn a `{"error": {...}}` body into an error, otherwise decode it.
fn decode_envelope<T: DeserializeOwned>(body: Value) -> Result<T> {
    if let Some(err) = body.get("error") {
        let code = err.get("code").and_then(Value::as_i64).unwrap_or_default();
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown portal error");
        let details = err
            .get("details")
            .and_then(Value::as_array)
            .map(|d| {
                d.iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join("; ")
            })
            .unwrap_or_default();
        if details.is_empty() {
            bail!("portal error {code}: {message}");
        }
        bail!("portal error {code}: {message} ({details})");
    }
    serde_json::from_value(body).context("unexpected response shape")
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use super::*;

    /// Canned layers keyed by `(item_id, layer_index)`.
    #[derive(Default)]
    pub struct MemorySource {
        layers: HashMap<(String, usize), FeatureSet>,
    }

    impl MemorySource {
        pub fn with_layer(mut self, item_id: &str, layer_index: usize, layer: FeatureSet) -> Self {
            self.layers.insert((item_id.to_string(), layer_index), layer);
            self
        }
    }

    #[async_trait]
    impl LayerSource for MemorySource {
        async fn query_layer(
            &self,
            item_id: &str,
            layer_index: usize,
            where_clause: &str,
            _with_geometry: bool,
        ) -> Result<FeatureSet> {
            debug!(item_id, layer_index, where_clause, "memory layer query");
            self.layers
                .get(&(item_id.to_string(), layer_index))
                .cloned()
                .ok_or_else(|| anyhow!("no layer {item_id}/{layer_index}"))
        }
    }
}
