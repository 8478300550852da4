// src/portal/hosted.rs
//
// Content operations behind publishing a hosted feature layer: item search,
// item delete, GeoJSON upload + publish, and feature truncate/append.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{EsriField, ItemInfo, Portal};

pub const FEATURE_SERVICE: &str = "Feature Service";
pub const GEOJSON: &str = "GeoJson";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<ItemInfo>,
}

#[derive(Debug, Deserialize)]
struct SuccessResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EditResult {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddFeaturesResponse {
    #[serde(default)]
    add_results: Vec<EditResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteFeaturesResponse {
    #[serde(default)]
    delete_results: Vec<EditResult>,
}

/// `{layer}?f=json`; only the field list is read.
#[derive(Debug, Deserialize)]
struct LayerDescription {
    #[serde(default)]
    fields: Vec<EsriField>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishedService {
    #[serde(default)]
    service_item_id: Option<String>,
    #[serde(default)]
    serviceurl: Option<String>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct PublishResponse {
    #[serde(default)]
    services: Vec<PublishedService>,
}

impl Portal {
    /// Items of `item_type` whose title is exactly `title`. The portal search
    /// is fuzzy, so results are filtered here.
    #[instrument(level = "debug", skip(self))]
    pub async fn find_items(&self, title: &str, item_type: &str) -> Result<Vec<ItemInfo>> {
        let url = self.sharing_url("search")?;
        let q = format!("title:\"{title}\" AND type:\"{item_type}\"");
        let resp: SearchResponse = self
            .get_json(
                url,
                &[
                    ("q", q),
                    ("num", "100".to_string()),
                    ("f", "json".to_string()),
                ],
            )
            .await
            .with_context(|| format!("searching for {item_type} '{title}'"))?;
        let hits: Vec<ItemInfo> = resp
            .results
            .into_iter()
            .filter(|i| i.title == title && i.item_type == item_type)
            .collect();
        debug!(hits = hits.len(), "search complete");
        Ok(hits)
    }

    #[instrument(level = "info", skip(self, item), fields(id = %item.id, title = %item.title))]
    pub async fn delete_item(&self, item: &ItemInfo) -> Result<()> {
        let url = match item.owner.as_deref() {
            Some(owner) => self.sharing_url(&format!("content/users/{owner}/items/{}/delete", item.id))?,
            None => self.user_content_url(&format!("items/{}/delete", item.id))?,
        };
        let resp: SuccessResponse = self
            .post_form(url, &[("f", "json")])
            .await
            .with_context(|| format!("deleting item {}", item.id))?;
        if !resp.success {
            bail!("portal refused to delete item {}", item.id);
        }
        info!("item deleted");
        Ok(())
    }

    /// Upload a GeoJSON document as a new item; returns the item id.
    #[instrument(level = "info", skip(self, geojson))]
    pub async fn add_geojson_item(&self, title: &str, tags: &str, geojson: &Value) -> Result<String> {
        let url = self.user_content_url("addItem")?;
        let text = serde_json::to_string(geojson).context("serializing GeoJSON")?;
        let resp: SuccessResponse = self
            .post_form(
                url,
                &[
                    ("type", GEOJSON),
                    ("title", title),
                    ("tags", tags),
                    ("text", text.as_str()),
                    ("f", "json"),
                ],
            )
            .await
            .with_context(|| format!("adding GeoJSON item '{title}'"))?;
        match resp.id {
            Some(id) if resp.success => Ok(id),
            _ => bail!("portal did not return an id for GeoJSON item '{title}'"),
        }
    }

    /// Publish a GeoJSON item as a hosted feature service; returns the
    /// service item id and url.
    #[instrument(level = "info", skip(self))]
    pub async fn publish_geojson(&self, item_id: &str, service_name: &str) -> Result<(String, String)> {
        let url = self.user_content_url("publish")?;
        let params = serde_json::json!({ "name": service_name }).to_string();
        let resp: PublishResponse = self
            .post_form(
                url,
                &[
                    ("itemid", item_id),
                    ("filetype", "geojson"),
                    ("publishParameters", params.as_str()),
                    ("f", "json"),
                ],
            )
            .await
            .with_context(|| format!("publishing item {item_id}"))?;
        let service = resp
            .services
            .into_iter()
            .next()
            .context("publish response listed no services")?;
        if let Some(err) = service.error {
            bail!("publishing item {item_id} failed: {err}");
        }
        match (service.service_item_id, service.serviceurl) {
            (Some(id), Some(url)) => Ok((id, url)),
            _ => bail!("publish response for item {item_id} is missing the service id or url"),
        }
    }

    /// Attribute field names of a hosted layer.
    #[instrument(level = "debug", skip(self), fields(layer = %layer))]
    pub async fn layer_fields(&self, layer: &Url) -> Result<Vec<String>> {
        let desc: LayerDescription = self
            .get_json(layer.clone(), &[("f", "json".to_string())])
            .await
            .context("reading layer description")?;
        Ok(desc.fields.into_iter().map(|f| f.name).collect())
    }

    /// Remove every feature from a layer. Any rejected delete is an error.
    #[instrument(level = "info", skip(self), fields(layer = %layer))]
    pub async fn truncate_layer(&self, layer: &Url) -> Result<usize> {
        let url = Url::parse(&format!("{}/deleteFeatures", layer.as_str().trim_end_matches('/')))?;
        let resp: DeleteFeaturesResponse = self
            .post_form(url, &[("where", super::ALL_FEATURES), ("f", "json")])
            .await
            .context("deleting existing features")?;
        let failed: Vec<&EditResult> = resp.delete_results.iter().filter(|r| !r.success).collect();
        if let Some(first) = failed.first() {
            warn!(failed = failed.len(), error = ?first.error, "feature deletes rejected");
            bail!(
                "{} of {} existing features could not be deleted",
                failed.len(),
                resp.delete_results.len()
            );
        }
        debug!(deleted = resp.delete_results.len(), "layer truncated");
        Ok(resp.delete_results.len())
    }

    /// Append features in batches of `batch_size`; returns how many were added.
    #[instrument(level = "info", skip(self, features), fields(layer = %layer, features = features.len()))]
    pub async fn add_features(&self, layer: &Url, features: &[Value], batch_size: usize) -> Result<usize> {
        let url = Url::parse(&format!("{}/addFeatures", layer.as_str().trim_end_matches('/')))?;
        let mut added = 0usize;
        for (n, chunk) in features.chunks(batch_size.max(1)).enumerate() {
            let body = serde_json::to_string(chunk).context("serializing features")?;
            let resp: AddFeaturesResponse = self
                .post_form(url.clone(), &[("features", body.as_str()), ("f", "json")])
                .await
                .with_context(|| format!("adding feature batch {n}"))?;
            let failed: Vec<&EditResult> = resp.add_results.iter().filter(|r| !r.success).collect();
            if let Some(first) = failed.first() {
                warn!(batch = n, failed = failed.len(), error = ?first.error, "features rejected");
                bail!("{} features in batch {n} were rejected", failed.len());
            }
            if resp.add_results.len() != chunk.len() {
                bail!(
                    "batch {n}: portal acknowledged {} of {} features",
                    resp.add_results.len(),
                    chunk.len()
                );
            }
            added += resp.add_results.len();
            debug!(batch = n, added, "feature batch added");
        }
        Ok(added)
    }
}
