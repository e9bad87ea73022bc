//! Token metadata: reading the JSON document behind a token URI, and forging the document of a new IOU.

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::{
    error::{RelayError, RelayResult},
    migration::{MigrationData, MigrationId},
    serde_util::token_id,
};

/// Where an IOU came from. Forged IOU metadata embeds this, which is what lets a redeem find its way back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataOrigin {
    pub origin_universe: String,
    pub origin_world: Address,
    #[serde(with = "token_id")]
    pub origin_token_id: U256,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenMetadata {
    #[serde(default)]
    pub migration_data: Option<MetadataOrigin>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[async_trait]
pub trait MetadataService: Send + Sync {
    async fn fetch_metadata(&self, uri: &str) -> RelayResult<TokenMetadata>;

    /// Build the metadata document of the IOU minted for a forward migration and return its URI.
    async fn forge_iou_metadata(
        &self,
        origin_token_uri: &str,
        id: MigrationId,
        data: &MigrationData,
    ) -> RelayResult<String>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ForgeRequest<'a> {
    origin_token_uri: &'a str,
    migration_id: MigrationId,
    migration_data: &'a MigrationData,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForgeResponse {
    token_uri: String,
}

/// Talks to the metadata forge over HTTP.
#[derive(Debug, Clone)]
pub struct HttpMetadata {
    client: Client,
    forge_url: Option<Url>,
}

impl HttpMetadata {
    pub fn new(forge_url: Option<Url>) -> RelayResult<Self> {
        let client = Client::builder()
            .user_agent("nft-relay")
            .build()
            .map_err(|e| RelayError::Metadata(e.to_string()))?;
        Ok(HttpMetadata { client, forge_url })
    }
}

#[async_trait]
impl MetadataService for HttpMetadata {
    async fn fetch_metadata(&self, uri: &str) -> RelayResult<TokenMetadata> {
        debug!(uri, "fetching token metadata");
        let response = self
            .client
            .get(uri)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RelayError::Metadata(format!("{uri}: {e}")))?;
        response
            .json()
            .await
            .map_err(|e| RelayError::Metadata(format!("{uri}: {e}")))
    }

    async fn forge_iou_metadata(
        &self,
        origin_token_uri: &str,
        id: MigrationId,
        data: &MigrationData,
    ) -> RelayResult<String> {
        let Some(forge_url) = &self.forge_url else {
            return Ok(origin_token_uri.to_owned());
        };
        let endpoint = forge_url
            .join("forge")
            .map_err(|e| RelayError::Metadata(e.to_string()))?;
        let response: ForgeResponse = self
            .client
            .post(endpoint)
            .json(&ForgeRequest {
                origin_token_uri,
                migration_id: id,
                migration_data: data,
            })
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RelayError::Metadata(format!("forge: {e}")))?
            .json()
            .await
            .map_err(|e| RelayError::Metadata(format!("forge: {e}")))?;
        Ok(response.token_uri)
    }
}
