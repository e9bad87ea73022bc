//! A single migration and the protocol that moves it from one chain to another.
//!
//! A [Migration] walks through the [Step]s below. Every step method takes the migration's turn lock, so steps of one
//! migration never interleave, works on a copy of the record and publishes the copy only after it has been written to
//! the database. Polls read the last published copy and never wait for a step in progress.
//!
//! ```text
//! registered -> annonceToBridge -> transferToBridge -> updateEscrowHash -> closeMigration ------> registerTransferOnOriginBridge -> completed
//!      \              |                  /                          \--> closeRedeemMigration --/
//!       `-------------+----> canceled <-'
//! ```

use std::{
    fmt,
    str::FromStr,
    sync::{Arc, LazyLock},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use alloy::primitives::{Address, B256, Bytes, TxHash, U256};
use opentelemetry::{KeyValue, metrics::Counter};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    connector::ChainConnector,
    db::Db,
    error::{RelayError, RelayResult},
    forge::MetadataService,
    pool::PremintPool,
    serde_util::token_id,
};

static TRANSITIONS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    opentelemetry::global::meter("")
        .u64_counter("relay.migration.transitions")
        .build()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MigrationId(Uuid);

impl MigrationId {
    pub fn random() -> Self {
        MigrationId(Uuid::new_v4())
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for MigrationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(MigrationId(s.parse()?))
    }
}

/// The payload of a migration. Fixed once the migration exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationData {
    pub origin_universe: String,
    pub origin_world: Address,
    #[serde(with = "token_id")]
    pub origin_token_id: U256,
    pub origin_owner: Address,
    pub destination_universe: String,
    pub destination_world: Address,
    #[serde(with = "token_id")]
    pub destination_token_id: U256,
    pub destination_owner: Address,
    /// Whether this returns an IOU to the token it stands for, rather than minting a new IOU.
    #[serde(default)]
    pub redeem: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Step {
    Registered,
    AnnonceToBridge,
    TransferToBridge,
    UpdateEscrowHash,
    CloseMigration,
    CloseRedeemMigration,
    RegisterTransferOnOriginBridge,
    Completed,
    Canceled,
}

impl Step {
    pub const ALL: [Step; 9] = [
        Step::Registered,
        Step::AnnonceToBridge,
        Step::TransferToBridge,
        Step::UpdateEscrowHash,
        Step::CloseMigration,
        Step::CloseRedeemMigration,
        Step::RegisterTransferOnOriginBridge,
        Step::Completed,
        Step::Canceled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Step::Registered => "registered",
            Step::AnnonceToBridge => "annonceToBridge",
            Step::TransferToBridge => "transferToBridge",
            Step::UpdateEscrowHash => "updateEscrowHash",
            Step::CloseMigration => "closeMigration",
            Step::CloseRedeemMigration => "closeRedeemMigration",
            Step::RegisterTransferOnOriginBridge => "registerTransferOnOriginBridge",
            Step::Completed => "completed",
            Step::Canceled => "canceled",
        }
    }

    /// The steps that may directly follow this one.
    pub fn successors(self) -> &'static [Step] {
        match self {
            Step::Registered => &[Step::AnnonceToBridge, Step::Canceled],
            Step::AnnonceToBridge => &[Step::TransferToBridge, Step::Canceled],
            Step::TransferToBridge => &[Step::UpdateEscrowHash, Step::Canceled],
            Step::UpdateEscrowHash => &[Step::CloseMigration, Step::CloseRedeemMigration],
            Step::CloseMigration | Step::CloseRedeemMigration => {
                &[Step::RegisterTransferOnOriginBridge]
            }
            Step::RegisterTransferOnOriginBridge => &[Step::Completed],
            Step::Completed | Step::Canceled => &[],
        }
    }

    pub fn is_terminal(self) -> bool {
        self.successors().is_empty()
    }

    /// Once the escrow hash exists the token is committed to the migration.
    pub fn is_cancelable(self) -> bool {
        self.successors().contains(&Step::Canceled)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Step::ALL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| RelayError::Validation(format!("unknown step {s}")))
    }
}

/// The durable state of a migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub id: MigrationId,
    pub data: MigrationData,
    pub step: Step,
    pub migration_hash: Option<B256>,
    pub block_timestamp: Option<u64>,
    pub migration_hash_signature: Option<Bytes>,
    pub escrow_hash: Option<B256>,
    pub escrow_hash_signature: Option<Bytes>,
    pub transaction_hash: Option<TxHash>,
    pub created_at: u64,
    pub last_error: Option<String>,
    pub last_error_at: Option<u64>,
}

impl MigrationRecord {
    pub fn new(data: MigrationData) -> Self {
        MigrationRecord {
            id: MigrationId::random(),
            data,
            step: Step::Registered,
            migration_hash: None,
            block_timestamp: None,
            migration_hash_signature: None,
            escrow_hash: None,
            escrow_hash_signature: None,
            transaction_hash: None,
            created_at: unix_now(),
            last_error: None,
            last_error_at: None,
        }
    }

    pub fn advance(&mut self, to: Step) -> RelayResult<()> {
        if !self.step.successors().contains(&to) {
            return Err(RelayError::InvalidStep {
                operation: to.as_str(),
                step: self.step,
            });
        }
        self.step = to;
        Ok(())
    }

    fn require(&self, operation: &'static str, steps: &[Step]) -> RelayResult<()> {
        if steps.contains(&self.step) {
            Ok(())
        } else {
            Err(RelayError::InvalidStep {
                operation,
                step: self.step,
            })
        }
    }

    fn fill<T: PartialEq>(
        slot: &mut Option<T>,
        value: T,
        operation: &'static str,
        step: Step,
    ) -> RelayResult<()> {
        match slot {
            Some(existing) if *existing != value => Err(RelayError::InvalidStep { operation, step }),
            Some(_) => Ok(()),
            None => {
                *slot = Some(value);
                Ok(())
            }
        }
    }

    pub fn set_migration_hash(&mut self, hash: B256, block_timestamp: u64) -> RelayResult<()> {
        Self::fill(&mut self.migration_hash, hash, "set migration hash", self.step)?;
        Self::fill(
            &mut self.block_timestamp,
            block_timestamp,
            "set block timestamp",
            self.step,
        )
    }

    pub fn set_escrow_hash(&mut self, hash: B256) -> RelayResult<()> {
        Self::fill(&mut self.escrow_hash, hash, "set escrow hash", self.step)
    }

    pub fn set_transaction_hash(&mut self, hash: TxHash) -> RelayResult<()> {
        Self::fill(
            &mut self.transaction_hash,
            hash,
            "set transaction hash",
            self.step,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled,
    AlreadyCanceled,
}

impl CancelOutcome {
    pub fn status(self) -> &'static str {
        match self {
            CancelOutcome::Canceled => "Migration stopped. Origin token sent back to owner.",
            CancelOutcome::AlreadyCanceled => "Migration already canceled.",
        }
    }
}

/// Everything a migration needs to drive its steps.
#[derive(Clone)]
pub struct MigrationContext {
    pub origin: Arc<dyn ChainConnector>,
    pub destination: Arc<dyn ChainConnector>,
    pub origin_bridge: Address,
    pub destination_bridge: Address,
    pub db: Arc<Db>,
    pub pool: Arc<PremintPool>,
    pub metadata: Arc<dyn MetadataService>,
    pub event_timeout: Duration,
}

pub struct Migration {
    ctx: MigrationContext,
    state: RwLock<MigrationRecord>,
    turn: Mutex<()>,
}

impl Migration {
    pub fn new(ctx: MigrationContext, record: MigrationRecord) -> Self {
        Migration {
            ctx,
            state: RwLock::new(record),
            turn: Mutex::new(()),
        }
    }

    pub fn id(&self) -> MigrationId {
        self.state.read().id
    }

    pub fn step(&self) -> Step {
        self.state.read().step
    }

    pub fn data(&self) -> MigrationData {
        self.state.read().data.clone()
    }

    pub fn record(&self) -> MigrationRecord {
        self.state.read().clone()
    }

    pub fn migration_hash(&self) -> Option<B256> {
        self.state.read().migration_hash
    }

    pub fn escrow_hash(&self) -> Option<B256> {
        self.state.read().escrow_hash
    }

    pub fn transaction_hash(&self) -> Option<TxHash> {
        self.state.read().transaction_hash
    }

    /// Pre-register the departure on the origin bridge and wait, at most `event_timeout`, for the migration hash.
    pub async fn announce(&self) -> RelayResult<()> {
        let _turn = self.turn.lock().await;
        let result = self.announce_inner().await;
        self.note_failure("announce", &result);
        result
    }

    async fn announce_inner(&self) -> RelayResult<()> {
        let mut record = self.record();
        record.require("announce", &[Step::Registered])?;

        let timeout = self.ctx.event_timeout;
        let registration = tokio::time::timeout(
            timeout,
            self.ctx.origin.migrate_to_erc721_iou(
                self.ctx.origin_bridge,
                self.ctx.destination_bridge,
                &record.data,
            ),
        )
        .await
        .map_err(|_| RelayError::Timeout(timeout))??;

        record.set_migration_hash(registration.migration_hash, registration.block_timestamp)?;
        record.advance(Step::AnnonceToBridge)?;
        self.commit(record)
    }

    /// Move the origin token into escrow. The signer of the migration hash is only logged here; the owner proves
    /// themselves when signing the escrow hash.
    pub async fn transfer_to_bridge(&self, signature: Bytes) -> RelayResult<()> {
        let _turn = self.turn.lock().await;
        let result = self.transfer_to_bridge_inner(signature).await;
        self.note_failure("transfer to bridge", &result);
        result
    }

    async fn transfer_to_bridge_inner(&self, signature: Bytes) -> RelayResult<()> {
        let mut record = self.record();
        record.require("transfer to bridge", &[Step::AnnonceToBridge])?;
        let migration_hash = record
            .migration_hash
            .ok_or(RelayError::InvalidMigrationHash)?;

        let signer = self
            .ctx
            .origin
            .verify_signature(migration_hash, &signature)
            .await?;
        if signer != record.data.origin_owner {
            warn!(
                id = %record.id,
                %signer,
                owner = %record.data.origin_owner,
                "migration hash was not signed by the origin owner"
            );
        }

        let data = &record.data;
        self.ctx
            .origin
            .safe_transfer_from(
                data.origin_world,
                data.origin_owner,
                self.ctx.origin_bridge,
                data.origin_token_id,
            )
            .await?;

        record.migration_hash_signature = Some(signature);
        record.advance(Step::TransferToBridge)?;
        self.commit(record)
    }

    /// Ask the origin bridge for its proof that the token is in escrow.
    pub async fn update_escrow_hash(&self) -> RelayResult<()> {
        let _turn = self.turn.lock().await;
        let result = self.update_escrow_hash_inner().await;
        self.note_failure("update escrow hash", &result);
        result
    }

    async fn update_escrow_hash_inner(&self) -> RelayResult<()> {
        let mut record = self.record();
        let migration_hash = record
            .migration_hash
            .ok_or(RelayError::InvalidMigrationHash)?;
        record.require("update escrow hash", &[Step::TransferToBridge])?;

        let escrow_hash = self
            .ctx
            .origin
            .get_proof_of_escrow_hash(self.ctx.origin_bridge, migration_hash)
            .await?;
        if escrow_hash.is_zero() {
            return Err(RelayError::chain(anyhow::anyhow!(
                "origin bridge has no escrow proof for {migration_hash}"
            )));
        }

        record.set_escrow_hash(escrow_hash)?;
        record.advance(Step::UpdateEscrowHash)?;
        self.commit(record)
    }

    /// Both halves of `continueMigration`.
    pub async fn continue_migration(&self, signature: Bytes) -> RelayResult<()> {
        self.transfer_to_bridge(signature).await?;
        self.update_escrow_hash().await
    }

    /// Check the owner's escrow hash signature and finish the migration on both chains.
    ///
    /// From `updateEscrowHash` a signature is required. From the later, non-terminal steps the stored signature is
    /// used and the call resumes wherever the last attempt stopped.
    pub async fn close(&self, signature: Option<Bytes>, redeem: bool) -> RelayResult<()> {
        let _turn = self.turn.lock().await;
        let result = self.close_inner(signature, redeem).await;
        self.note_failure("close", &result);
        result
    }

    async fn close_inner(&self, signature: Option<Bytes>, redeem: bool) -> RelayResult<()> {
        let mut record = self.record();
        if record.data.redeem != redeem {
            return Err(RelayError::Validation(format!(
                "migration {} is {}a redeem migration",
                record.id,
                if record.data.redeem { "" } else { "not " }
            )));
        }

        if record.step == Step::UpdateEscrowHash {
            let Some(signature) = signature else {
                return Err(RelayError::InvalidStep {
                    operation: "close without a signature",
                    step: record.step,
                });
            };
            let escrow_hash = record.escrow_hash.ok_or(RelayError::InvalidMigrationHash)?;
            let signer = self
                .ctx
                .origin
                .verify_signature(escrow_hash, &signature)
                .await?;
            if signer != record.data.origin_owner {
                return Err(RelayError::SignatureMismatch {
                    expected: record.data.origin_owner,
                    recovered: signer,
                });
            }
            info!(id = %record.id, "escrow hash signature verified");

            record.escrow_hash_signature = Some(signature);
            record.advance(if redeem {
                Step::CloseRedeemMigration
            } else {
                Step::CloseMigration
            })?;
            self.commit(record.clone())?;
        }

        if matches!(record.step, Step::CloseMigration | Step::CloseRedeemMigration) {
            let forward = record.step == Step::CloseMigration;
            let transaction_hash = if forward {
                self.mint_iou(&record).await?
            } else {
                self.finalize_on_destination(&record).await?
            };
            record.set_transaction_hash(transaction_hash)?;
            record.advance(Step::RegisterTransferOnOriginBridge)?;
            self.commit(record.clone())?;
            if forward {
                self.mark_minted(&record);
            }
        }

        record.require("close", &[Step::RegisterTransferOnOriginBridge])?;
        let migration_hash = record
            .migration_hash
            .ok_or(RelayError::InvalidMigrationHash)?;
        let signature = record
            .escrow_hash_signature
            .clone()
            .ok_or(RelayError::InvalidStep {
                operation: "register escrow hash signature",
                step: record.step,
            })?;
        self.ctx
            .origin
            .register_escrow_hash_signature(self.ctx.origin_bridge, migration_hash, &signature)
            .await?;
        record.advance(Step::Completed)?;
        self.commit(record)
    }

    /// Forward close: give the IOU its metadata, then hand it over on the destination bridge.
    async fn mint_iou(&self, record: &MigrationRecord) -> RelayResult<TxHash> {
        let data = &record.data;
        let origin_uri = self
            .ctx
            .origin
            .get_token_uri(data.origin_world, data.origin_token_id)
            .await?;
        let iou_uri = self
            .ctx
            .metadata
            .forge_iou_metadata(&origin_uri, record.id, data)
            .await?;
        self.ctx
            .destination
            .set_token_uri(data.destination_world, data.destination_token_id, &iou_uri)
            .await?;

        self.finalize_on_destination(record).await
    }

    /// The transaction hash is already committed, so a pool failure here must not fail the close. Startup marks the
    /// token again.
    fn mark_minted(&self, record: &MigrationRecord) {
        let data = &record.data;
        if let Err(e) = self.ctx.pool.mark_minted(
            &data.destination_universe,
            data.destination_world,
            data.destination_token_id,
        ) {
            error!(id = %record.id, %e, "failed to mark the destination token as minted");
        }
    }

    async fn finalize_on_destination(&self, record: &MigrationRecord) -> RelayResult<TxHash> {
        let signature =
            record
                .migration_hash_signature
                .as_ref()
                .ok_or(RelayError::InvalidStep {
                    operation: "finalize without a migration hash signature",
                    step: record.step,
                })?;
        let block_timestamp = record
            .block_timestamp
            .ok_or(RelayError::InvalidMigrationHash)?;
        self.ctx
            .destination
            .migrate_from_iou_erc721_to_erc721(
                self.ctx.destination_bridge,
                self.ctx.origin_bridge,
                &record.data,
                signature,
                block_timestamp,
            )
            .await
    }

    /// Stop the migration and give the origin token back if the bridge already holds it. Only possible before the
    /// escrow hash has been proven.
    pub async fn cancel(&self) -> RelayResult<CancelOutcome> {
        let _turn = self.turn.lock().await;
        let result = self.cancel_inner().await;
        self.note_failure("cancel", &result);
        result
    }

    async fn cancel_inner(&self) -> RelayResult<CancelOutcome> {
        let mut record = self.record();
        if record.step == Step::Canceled {
            return Ok(CancelOutcome::AlreadyCanceled);
        }
        if !record.step.is_cancelable() {
            return Err(RelayError::InvalidCancelState(record.step));
        }

        let data = &record.data;
        let in_escrow = self
            .ctx
            .origin
            .is_owner(data.origin_world, data.origin_token_id, self.ctx.origin_bridge)
            .await?;
        if in_escrow {
            self.ctx
                .origin
                .safe_transfer_from(
                    data.origin_world,
                    self.ctx.origin_bridge,
                    data.origin_owner,
                    data.origin_token_id,
                )
                .await?;
        } else {
            info!(id = %record.id, step = %record.step, "origin token never reached the bridge");
        }

        let release = (!data.redeem).then(|| {
            (
                data.destination_universe.clone(),
                data.destination_world,
                data.destination_token_id,
            )
        });
        record.advance(Step::Canceled)?;
        self.commit(record)?;

        if let Some((universe, world, token_id)) = release {
            self.ctx.pool.release(&universe, world, token_id)?;
        }
        Ok(CancelOutcome::Canceled)
    }

    /// Check that [Migration::resume] has something to do, without doing it.
    pub fn check_resumable(&self) -> RelayResult<()> {
        match self.step() {
            Step::Registered
            | Step::TransferToBridge
            | Step::CloseMigration
            | Step::CloseRedeemMigration
            | Step::RegisterTransferOnOriginBridge => Ok(()),
            step => Err(RelayError::InvalidStep {
                operation: "retry",
                step,
            }),
        }
    }

    /// Re-drive the relay's side of the protocol from the current step using the stored artifacts.
    pub async fn resume(&self) -> RelayResult<()> {
        self.check_resumable()?;
        match self.step() {
            Step::Registered => self.announce().await,
            Step::TransferToBridge => self.update_escrow_hash().await,
            _ => {
                let redeem = self.state.read().data.redeem;
                self.close(None, redeem).await
            }
        }
    }

    fn commit(&self, mut record: MigrationRecord) -> RelayResult<()> {
        record.last_error = None;
        record.last_error_at = None;
        self.ctx.db.save_migration(&record)?;

        let step = record.step;
        let id = record.id;
        let previous = std::mem::replace(&mut *self.state.write(), record).step;
        if previous != step {
            TRANSITIONS.add(1, &[KeyValue::new("step", step.as_str())]);
            info!(%id, %step, "migration advanced");
        }
        Ok(())
    }

    /// Failures after the caller was acknowledged have nowhere to go, so keep them on the record.
    fn note_failure<T>(&self, operation: &'static str, result: &RelayResult<T>) {
        let Err(e) = result else {
            return;
        };
        if matches!(
            e,
            RelayError::InvalidStep { .. }
                | RelayError::InvalidCancelState(_)
                | RelayError::Validation(_)
        ) {
            return;
        }

        let mut record = self.record();
        error!(id = %record.id, step = %record.step, operation, %e, "migration step failed");
        record.last_error = Some(format!("{operation}: {e}"));
        record.last_error_at = Some(unix_now());
        if let Err(e) = self.ctx.db.save_migration(&record) {
            error!(id = %record.id, %e, "failed to persist migration error");
        }
        *self.state.write() = record;
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
