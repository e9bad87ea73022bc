use alloy::primitives::{Address, B256, Bytes, TxHash, U256};
use serde::{Deserialize, Serialize};

use crate::{
    migration::{MigrationData, MigrationId, MigrationRecord, Step},
    serde_util::token_id,
};

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UniverseRequest {
    pub universe: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenIdRequest {
    pub universe: String,
    pub world: Address,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitMigrationRequest {
    pub migration_data: MigrationData,
    /// Either this or `migrationData.redeem` marks a redeem.
    #[serde(default)]
    pub redeem: bool,
}

impl InitMigrationRequest {
    pub fn into_data(self) -> MigrationData {
        let mut data = self.migration_data;
        data.redeem |= self.redeem;
        data
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationIdRequest {
    pub migration_id: MigrationId,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueMigrationRequest {
    pub migration_id: MigrationId,
    pub migration_hash_signature: Bytes,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseMigrationRequest {
    pub migration_id: MigrationId,
    pub escrow_hash_signature: Bytes,
}

#[derive(Clone, Debug, Serialize)]
pub struct WorldsResponse {
    pub worlds: Vec<Address>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenIdResponse {
    #[serde(with = "token_id")]
    pub token_id: U256,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationIdResponse {
    pub migration_id: MigrationId,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn new(status: impl Into<String>) -> Self {
        StatusResponse {
            status: status.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum PollingMigrationResponse {
    Ready { migration_hash: B256 },
    Pending(StatusResponse),
}

impl From<Option<B256>> for PollingMigrationResponse {
    fn from(hash: Option<B256>) -> Self {
        match hash {
            Some(migration_hash) => PollingMigrationResponse::Ready { migration_hash },
            None => PollingMigrationResponse::Pending(StatusResponse::new("No migration hash yet")),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum PollingEscrowResponse {
    Ready { escrow_hash: B256 },
    Pending(StatusResponse),
}

impl From<Option<B256>> for PollingEscrowResponse {
    fn from(hash: Option<B256>) -> Self {
        match hash {
            Some(escrow_hash) => PollingEscrowResponse::Ready { escrow_hash },
            None => PollingEscrowResponse::Pending(StatusResponse::new("No escrow hash yet")),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndMigrationResponse {
    pub migration_status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<TxHash>,
}

impl From<Option<TxHash>> for EndMigrationResponse {
    fn from(transaction_hash: Option<TxHash>) -> Self {
        EndMigrationResponse {
            migration_status: if transaction_hash.is_some() {
                "Ok"
            } else {
                "Running"
            },
            transaction_hash,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUriResponse {
    pub token_uri: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatusResponse {
    pub migration_id: MigrationId,
    pub step: Step,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migration_hash: Option<B256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escrow_hash: Option<B256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<TxHash>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<u64>,
}

impl From<MigrationRecord> for MigrationStatusResponse {
    fn from(record: MigrationRecord) -> Self {
        MigrationStatusResponse {
            migration_id: record.id,
            step: record.step,
            migration_hash: record.migration_hash,
            escrow_hash: record.escrow_hash,
            transaction_hash: record.transaction_hash,
            last_error: record.last_error,
            last_error_at: record.last_error_at,
        }
    }
}
