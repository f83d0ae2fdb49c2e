use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeSet;
use tracing::debug;

use super::wire::{decode_rows, CountRequest};
use crate::cache::{AuthContext, CountRecord, CountSource, EntityId};
use crate::config::{Config, SourceConfig};

/// Count source that POSTs each batch to an HTTP endpoint.
#[derive(Clone)]
pub struct HttpCountSource {
  client: reqwest::Client,
  url: url::Url,
  token: Option<String>,
}

impl HttpCountSource {
  pub fn new(config: &SourceConfig) -> Result<Self> {
    let url = url::Url::parse(&config.url)
      .map_err(|e| eyre!("Invalid source url '{}': {}", config.url, e))?;

    let client = reqwest::Client::builder()
      .timeout(config.timeout())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      url,
      token: Config::get_token(),
    })
  }
}

impl CountSource for HttpCountSource {
  async fn fetch_counts(
    &self,
    ids: &BTreeSet<EntityId>,
    namespace: &str,
    auth: &AuthContext,
  ) -> Result<Vec<CountRecord>> {
    let request = CountRequest {
      related_entity_ids: ids.iter().map(String::as_str).collect(),
      related_table: namespace,
      auth,
    };
    let body =
      serde_json::to_vec(&request).map_err(|e| eyre!("Failed to encode count request: {}", e))?;

    let mut builder = self
      .client
      .post(self.url.clone())
      .header(reqwest::header::CONTENT_TYPE, "application/json")
      .body(body);
    if let Some(token) = &self.token {
      builder = builder.bearer_auth(token);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to request counts for {}: {}", namespace, e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!("Count endpoint returned {} for {}", status, namespace));
    }

    let bytes = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read count response: {}", e))?;

    let records =
      decode_rows(&bytes).map_err(|e| eyre!("Failed to parse count response: {}", e))?;
    debug!(namespace, requested = ids.len(), received = records.len(), "Fetched counts");

    Ok(records)
  }
}
