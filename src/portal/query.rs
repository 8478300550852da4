// src/portal/query.rs

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};
use url::Url;

use super::{EsriFeature, EsriField, FeatureSet, Portal, QueryPage};

/// Output spatial reference for geometry-bearing queries (WGS84).
const OUT_SR: &str = "4326";

impl Portal {
    /// Run `where_clause` against a layer, following `exceededTransferLimit`
    /// until every page is collected.
    #[instrument(level = "info", skip(self), fields(layer = %layer))]
    pub async fn query(
        &self,
        layer: &Url,
        where_clause: &str,
        with_geometry: bool,
    ) -> Result<FeatureSet> {
        let url = Url::parse(&format!("{}/query", layer.as_str().trim_end_matches('/')))
            .with_context(|| format!("building query url for {layer}"))?;

        let mut fields: Vec<EsriField> = Vec::new();
        let mut features: Vec<EsriFeature> = Vec::new();
        let mut geometry_type = None;
        let mut spatial_reference = None;
        let mut offset = 0usize;

        loop {
            let mut params = vec![
                ("where", where_clause.to_string()),
                ("outFields", "*".to_string()),
                ("returnGeometry", with_geometry.to_string()),
                ("resultOffset", offset.to_string()),
                ("resultRecordCount", self.page_size().to_string()),
                ("f", "json".to_string()),
            ];
            if with_geometry {
                params.push(("outSR", OUT_SR.to_string()));
            }

            let page: QueryPage = self
                .get_json(url.clone(), &params)
                .await
                .with_context(|| format!("fetching page at offset {offset}"))?;

            let n = page.features.len();
            debug!(offset, rows = n, more = page.exceeded_transfer_limit, "page fetched");
            if fields.is_empty() {
                fields = page.fields;
            }
            geometry_type = geometry_type.or(page.geometry_type);
            spatial_reference = spatial_reference.or(page.spatial_reference);
            features.extend(page.features);

            if !page.exceeded_transfer_limit || n == 0 {
                break;
            }
            offset += n;
        }

        info!(rows = features.len(), "layer query complete");
        FeatureSet::from_features(&fields, features, geometry_type, spatial_reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::AsArray;
    use arrow::datatypes::Float64Type;
    use httpmock::prelude::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_query_follows_transfer_limit() -> Result<()> {
        let server = MockServer::start();
        let fields = json!([
            {"name": "CO_NAME", "type": "esriFieldTypeString"},
            {"name": "YEAR2020", "type": "esriFieldTypeDouble"}
        ]);
        let first = server.mock(|when, then| {
            when.method(GET)
                .path("/layer/0/query")
                .query_param("where", "CO_FIPS in (3, 57)")
                .query_param("resultOffset", "0")
                .query_param("resultRecordCount", "2");
            then.status(200).json_body(json!({
                "fields": fields,
                "features": [
                    {"attributes": {"CO_NAME": "DAVIS", "YEAR2020": 1.0}},
                    {"attributes": {"CO_NAME": "WEBER", "YEAR2020": 2.0}}
                ],
                "exceededTransferLimit": true
            }));
        });
        let second = server.mock(|when, then| {
            when.method(GET)
                .path("/layer/0/query")
                .query_param("resultOffset", "2");
            then.status(200).json_body(json!({
                "fields": fields,
                "features": [{"attributes": {"CO_NAME": "UTAH", "YEAR2020": 4.0}}]
            }));
        });

        let portal = Portal::new(&server.base_url(), "", 2)?;
        let layer = Url::parse(&server.url("/layer/0"))?;
        let fs = portal.query(&layer, "CO_FIPS in (3, 57)", false).await?;

        first.assert();
        second.assert();
        assert_eq!(fs.num_rows(), 3);
        let years = fs.batch.column(1).as_primitive::<Float64Type>();
        assert_eq!(years.value(2), 4.0);
        Ok(())
    }

    #[tokio::test]
    async fn test_query_requests_wgs84_geometry() -> Result<()> {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(GET)
                .path("/layer/0/query")
                .query_param("returnGeometry", "true")
                .query_param("outSR", "4326");
            then.status(200).json_body(json!({
                "geometryType": "esriGeometryPolygon",
                "spatialReference": {"wkid": 4326},
                "fields": [{"name": "GeoName", "type": "esriFieldTypeString"}],
                "features": [{
                    "attributes": {"GeoName": "Ogden"},
                    "geometry": {"rings": [[[0.0, 0.0], [0.0, 1.0], [1.0, 1.0], [0.0, 0.0]]]}
                }]
            }));
        });

        let portal = Portal::new(&server.base_url(), "", 1000)?;
        let layer = Url::parse(&server.url("/layer/0"))?;
        let fs = portal.query(&layer, "1=1", true).await?;

        m.assert();
        assert_eq!(fs.geometry_type.as_deref(), Some("esriGeometryPolygon"));
        assert!(fs.geometry[0].is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_query_error_envelope_aborts() -> Result<()> {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/layer/0/query");
            then.status(200)
                .json_body(json!({"error": {"code": 400, "message": "Invalid where clause"}}));
        });
        let portal = Portal::new(&server.base_url(), "", 1000)?;
        let layer = Url::parse(&server.url("/layer/0"))?;
        let err = portal.query(&layer, "nope(", false).await.unwrap_err();
        assert!(format!("{err:#}").contains("Invalid where clause"));
        Ok(())
    }
}
