//! Access to one configured chain.
//!
//! Each universe gets exactly one [ChainConnector]. The connector owns the relay wallet for that chain and serializes
//! every call that spends a nonce through its [MutationGate]. Reads and signature recovery are not gated.

mod evm;
mod gate;

use alloy::primitives::{Address, B256, Bytes, TxHash, U256};
use async_trait::async_trait;
pub use evm::EvmConnector;
pub use gate::MutationGate;

use crate::{error::RelayResult, migration::MigrationData};

/// What the origin bridge emits once a departure has been pre-registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationRegistration {
    pub migration_hash: B256,
    pub block_timestamp: u64,
}

/// Every method fails with [crate::error::RelayError::ChainCall] when the RPC call or the contract fails. Nothing is
/// retried here.
#[async_trait]
pub trait ChainConnector: Send + Sync {
    /// Mint a fresh IOU token owned by the relay and return its id.
    async fn premint_token(&self, world: Address) -> RelayResult<U256>;

    async fn is_erc721(&self, world: Address) -> RelayResult<bool>;

    async fn is_owner(&self, world: Address, token_id: U256, owner: Address) -> RelayResult<bool>;

    /// Announce a departure on the origin bridge and wait for the matching pre-registration event. There is no timeout
    /// in here; callers bound the wait themselves and dropping the future tears the subscription down.
    async fn migrate_to_erc721_iou(
        &self,
        origin_bridge: Address,
        destination_bridge: Address,
        data: &MigrationData,
    ) -> RelayResult<MigrationRegistration>;

    async fn verify_signature(&self, hash: B256, signature: &Bytes) -> RelayResult<Address>;

    async fn safe_transfer_from(
        &self,
        world: Address,
        from: Address,
        to: Address,
        token_id: U256,
    ) -> RelayResult<TxHash>;

    async fn get_proof_of_escrow_hash(
        &self,
        bridge: Address,
        migration_hash: B256,
    ) -> RelayResult<B256>;

    async fn register_escrow_hash_signature(
        &self,
        bridge: Address,
        migration_hash: B256,
        escrow_hash_signature: &Bytes,
    ) -> RelayResult<TxHash>;

    /// Finalize the migration on the destination bridge. The migration hash signature doubles as the proof that the
    /// origin owner agreed to it.
    async fn migrate_from_iou_erc721_to_erc721(
        &self,
        destination_bridge: Address,
        origin_bridge: Address,
        data: &MigrationData,
        migration_hash_signature: &Bytes,
        block_timestamp: u64,
    ) -> RelayResult<TxHash>;

    async fn get_token_uri(&self, world: Address, token_id: U256) -> RelayResult<String>;

    async fn set_token_uri(&self, world: Address, token_id: U256, uri: &str)
    -> RelayResult<TxHash>;
}
