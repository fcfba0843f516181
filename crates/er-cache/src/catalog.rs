//! HTTP catalog fetchers
//!
//! The client catalog is served as a JSON array of client entries; the
//! capability fetcher and the webhook fetcher read different fields of
//! the same shape. Entries missing the relevant fields are skipped with
//! a warning rather than failing the whole refresh.

use anyhow::{Context, Result};
use async_trait::async_trait;
use er_common::{CapabilityMap, Webhook, WebhookMap};
use serde::Deserialize;
use tracing::warn;

use crate::SnapshotFetcher;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogEntry {
    client_id: String,
    #[serde(default)]
    capabilities: Option<Vec<String>>,
    #[serde(default)]
    webhook_url: Option<String>,
    #[serde(default)]
    enabled: Option<bool>,
}

async fn fetch_entries(http: &reqwest::Client, url: &str) -> Result<Vec<CatalogEntry>> {
    let response = http
        .get(url)
        .send()
        .await
        .with_context(|| format!("catalog request to {url} failed"))?
        .error_for_status()
        .with_context(|| format!("catalog request to {url} rejected"))?;

    response
        .json::<Vec<CatalogEntry>>()
        .await
        .with_context(|| format!("catalog response from {url} is not a client list"))
}

fn capability_map_from(entries: Vec<CatalogEntry>) -> CapabilityMap {
    let mut map = CapabilityMap::new();
    for entry in entries {
        match entry.capabilities {
            Some(capabilities) => {
                map.insert(entry.client_id, capabilities.into_iter().collect());
            }
            None => {
                warn!(client_id = %entry.client_id, "catalog entry without capabilities, skipping");
            }
        }
    }
    map
}

fn webhook_map_from(entries: Vec<CatalogEntry>) -> WebhookMap {
    let mut map = WebhookMap::new();
    for entry in entries {
        match entry.webhook_url {
            Some(url) => {
                map.insert(
                    entry.client_id,
                    Webhook {
                        url,
                        enabled: entry.enabled.unwrap_or(true),
                    },
                );
            }
            None => {
                warn!(client_id = %entry.client_id, "catalog entry without webhook URL, skipping");
            }
        }
    }
    map
}

pub struct CapabilityCatalogFetcher {
    http: reqwest::Client,
    url: String,
}

impl CapabilityCatalogFetcher {
    pub fn new(http: reqwest::Client, url: String) -> Self {
        Self { http, url }
    }
}

#[async_trait]
impl SnapshotFetcher<CapabilityMap> for CapabilityCatalogFetcher {
    async fn fetch(&self) -> Result<CapabilityMap> {
        let entries = fetch_entries(&self.http, &self.url).await?;
        Ok(capability_map_from(entries))
    }
}

pub struct WebhookCatalogFetcher {
    http: reqwest::Client,
    url: String,
}

impl WebhookCatalogFetcher {
    pub fn new(http: reqwest::Client, url: String) -> Self {
        Self { http, url }
    }
}

#[async_trait]
impl SnapshotFetcher<WebhookMap> for WebhookCatalogFetcher {
    async fn fetch(&self) -> Result<WebhookMap> {
        let entries = fetch_entries(&self.http, &self.url).await?;
        Ok(webhook_map_from(entries))
    }
}
