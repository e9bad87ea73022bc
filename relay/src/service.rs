//! The operations the JSON-RPC boundary exposes, on top of the registry, the pool and the chain connectors.
//!
//! Operations that drive chain work acknowledge as soon as their input has been checked and continue in a spawned
//! task. What happens next is visible by polling.

use std::{collections::HashMap, sync::Arc};

use alloy::primitives::{Address, B256, Bytes, TxHash, U256};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{
    cfg::{Config, UniverseConfig},
    connector::ChainConnector,
    crypto,
    db::Db,
    error::{RelayError, RelayResult},
    forge::MetadataService,
    migration::{
        CancelOutcome, Migration, MigrationContext, MigrationData, MigrationId, MigrationRecord,
        Step,
    },
    pool::PremintPool,
    registry::Registry,
};

pub struct Relay {
    config: Config,
    connectors: HashMap<String, Arc<dyn ChainConnector>>,
    db: Arc<Db>,
    pool: Arc<PremintPool>,
    registry: Registry,
    metadata: Arc<dyn MetadataService>,
    /// Held from checking a destination token until the migration bound to it is registered.
    bindings: Mutex<()>,
}

impl Relay {
    /// Build the service and recover the state of the previous run: reset abandoned pool reservations, reload every
    /// migration and re-bind the pool tokens of forward migrations that are still alive. Tokens of forward migrations
    /// that already finished on the destination chain are marked minted again.
    pub fn new(
        config: &Config,
        connectors: HashMap<String, Arc<dyn ChainConnector>>,
        db: Arc<Db>,
        metadata: Arc<dyn MetadataService>,
    ) -> RelayResult<Relay> {
        let pool = Arc::new(PremintPool::new(
            db.clone(),
            connectors.clone(),
            config.premint_threshold,
        ));
        let relay = Relay {
            config: config.clone(),
            connectors,
            db,
            pool,
            registry: Registry::new(),
            metadata,
            bindings: Mutex::new(()),
        };

        relay.pool.reset_undelivered()?;
        for record in relay.db.load_migrations()? {
            let ctx = match relay.context(&record.data) {
                Ok(ctx) => ctx,
                Err(e) => {
                    warn!(id = %record.id, %e, "skipping migration of an unknown universe");
                    continue;
                }
            };
            let data = &record.data;
            if !data.redeem && record.step != Step::Canceled {
                let (universe, world, token_id) = (
                    &data.destination_universe,
                    data.destination_world,
                    data.destination_token_id,
                );
                if record.transaction_hash.is_some() {
                    relay.pool.mark_minted(universe, world, token_id)?;
                } else {
                    relay.pool.claim(universe, world, token_id)?;
                }
            }
            relay
                .registry
                .insert(Arc::new(Migration::new(ctx, record)));
        }
        info!(migrations = relay.registry.len(), "relay state restored");

        Ok(relay)
    }

    fn universe(&self, id: &str) -> RelayResult<&UniverseConfig> {
        self.config
            .universe(id)
            .ok_or_else(|| RelayError::not_found("universe", id))
    }

    fn connector(&self, id: &str) -> RelayResult<Arc<dyn ChainConnector>> {
        self.connectors
            .get(id)
            .cloned()
            .ok_or_else(|| RelayError::not_found("universe", id))
    }

    fn context(&self, data: &MigrationData) -> RelayResult<MigrationContext> {
        let origin = self.universe(&data.origin_universe)?;
        let destination = self.universe(&data.destination_universe)?;
        Ok(MigrationContext {
            origin: self.connector(&origin.unique_id)?,
            destination: self.connector(&destination.unique_id)?,
            origin_bridge: origin.bridge_address,
            destination_bridge: destination.bridge_address,
            db: self.db.clone(),
            pool: self.pool.clone(),
            metadata: self.metadata.clone(),
            event_timeout: self.config.event_timeout,
        })
    }

    pub fn migration(&self, id: MigrationId) -> RelayResult<Arc<Migration>> {
        self.registry.get(id)
    }

    pub fn pool(&self) -> &PremintPool {
        &self.pool
    }

    pub fn get_available_worlds(&self, universe: &str) -> RelayResult<Vec<Address>> {
        Ok(self.universe(universe)?.world_addresses())
    }

    pub async fn get_available_token_id(&self, universe: &str, world: Address) -> RelayResult<U256> {
        if self.universe(universe)?.world(world).is_none() {
            return Err(RelayError::not_found("world", world));
        }
        self.pool.reserve_or_mint_token_id(universe, world).await
    }

    /// Check a migration request against both chains, create it and start announcing it in the background.
    pub async fn init_migration(&self, data: MigrationData) -> RelayResult<MigrationId> {
        let origin_universe = self.universe(&data.origin_universe)?;
        let destination_universe = self.universe(&data.destination_universe)?;
        if !data.redeem && destination_universe.world(data.destination_world).is_none() {
            return Err(RelayError::not_found("destination world", data.destination_world));
        }

        let origin = self.connector(&origin_universe.unique_id)?;
        if !origin.is_erc721(data.origin_world).await? {
            return Err(RelayError::Validation(format!(
                "{} is not an ERC-721 contract",
                data.origin_world
            )));
        }
        if !origin
            .is_owner(data.origin_world, data.origin_token_id, data.origin_owner)
            .await?
        {
            return Err(RelayError::Validation(format!(
                "{} is not the owner of token {}",
                data.origin_owner, data.origin_token_id
            )));
        }

        if data.redeem {
            if origin_universe.world(data.origin_world).is_none() {
                return Err(RelayError::not_found("origin world", data.origin_world));
            }
            let uri = origin
                .get_token_uri(data.origin_world, data.origin_token_id)
                .await?;
            let metadata = self.metadata.fetch_metadata(&uri).await?;
            let matches = metadata.migration_data.is_some_and(|m| {
                m.origin_universe == data.destination_universe
                    && m.origin_world == data.destination_world
                    && m.origin_token_id == data.destination_token_id
            });
            if !matches {
                return Err(RelayError::Validation(
                    "token metadata does not match the migration".to_owned(),
                ));
            }
        }

        let ctx = self.context(&data)?;
        let record = MigrationRecord::new(data);
        let migration = Arc::new(Migration::new(ctx, record.clone()));
        {
            let _bindings = self.bindings.lock();
            let data = &record.data;
            if !data.redeem {
                self.check_destination_token(data)?;
            }
            self.db.save_migration(&record)?;
            if !data.redeem {
                self.pool.claim(
                    &data.destination_universe,
                    data.destination_world,
                    data.destination_token_id,
                )?;
            }
            self.registry.insert(migration.clone());
        }
        let id = record.id;
        info!(
            %id,
            origin_universe = record.data.origin_universe,
            origin_world = %record.data.origin_world,
            origin_token_id = %record.data.origin_token_id,
            destination_universe = record.data.destination_universe,
            destination_world = %record.data.destination_world,
            destination_token_id = %record.data.destination_token_id,
            redeem = record.data.redeem,
            "migration created"
        );

        // Failures are kept on the migration itself.
        tokio::spawn(async move {
            let _ = migration.announce().await;
        });

        Ok(id)
    }

    /// A forward migration needs a destination token from the pool that was never minted and is not bound to another
    /// live migration. Callers hold `bindings`.
    fn check_destination_token(&self, data: &MigrationData) -> RelayResult<()> {
        let (universe, world, token_id) = (
            &data.destination_universe,
            data.destination_world,
            data.destination_token_id,
        );
        let Some(token) = self.pool.token(universe, world, token_id)? else {
            return Err(RelayError::Validation(format!(
                "token {token_id} of {world} was not handed out by this relay"
            )));
        };
        if token.minted {
            return Err(RelayError::Validation(format!(
                "token {token_id} of {world} is already minted"
            )));
        }
        let bound = self.registry.migrations().into_iter().find(|m| {
            let record = m.record();
            let other = &record.data;
            !other.redeem
                && !record.step.is_terminal()
                && other.destination_universe == *universe
                && other.destination_world == world
                && other.destination_token_id == token_id
        });
        if let Some(other) = bound {
            return Err(RelayError::Validation(format!(
                "token {token_id} of {world} is bound to migration {}",
                other.id()
            )));
        }
        Ok(())
    }

    pub fn polling_migration(&self, id: MigrationId) -> RelayResult<Option<B256>> {
        Ok(self.migration(id)?.migration_hash())
    }

    /// Take the owner's signature of the migration hash, then escrow the token and fetch the escrow proof in the
    /// background. Repeated once the token is in escrow, only the escrow proof is fetched again.
    pub fn continue_migration(&self, id: MigrationId, signature: Bytes) -> RelayResult<()> {
        check_signature(&signature)?;
        let migration = self.migration(id)?;
        match migration.step() {
            Step::AnnonceToBridge => {
                info!(%id, "migration hash signed");
                tokio::spawn(async move {
                    let _ = migration.continue_migration(signature).await;
                });
            }
            Step::TransferToBridge => {
                info!(%id, "fetching the escrow proof again");
                tokio::spawn(async move {
                    let _ = migration.update_escrow_hash().await;
                });
            }
            step => {
                return Err(RelayError::InvalidStep {
                    operation: "continueMigration",
                    step,
                });
            }
        }
        Ok(())
    }

    pub fn polling_escrow(&self, id: MigrationId) -> RelayResult<Option<B256>> {
        Ok(self.migration(id)?.escrow_hash())
    }

    /// Take the owner's signature of the escrow hash, then finish the migration in the background.
    pub fn close_migration(&self, id: MigrationId, signature: Bytes, redeem: bool) -> RelayResult<()> {
        check_signature(&signature)?;
        let migration = self.migration(id)?;
        let operation = if redeem {
            "closeRedeemMigration"
        } else {
            "closeMigration"
        };
        if migration.data().redeem != redeem {
            return Err(RelayError::Validation(format!(
                "{operation} called for a migration with redeem = {}",
                !redeem
            )));
        }
        let step = migration.step();
        if matches!(
            step,
            Step::Registered
                | Step::AnnonceToBridge
                | Step::TransferToBridge
                | Step::Completed
                | Step::Canceled
        ) {
            return Err(RelayError::InvalidStep { operation, step });
        }

        info!(%id, redeem, "escrow hash signed");
        tokio::spawn(async move {
            let _ = migration.close(Some(signature), redeem).await;
        });
        Ok(())
    }

    pub fn polling_end_migration(&self, id: MigrationId) -> RelayResult<Option<TxHash>> {
        Ok(self.migration(id)?.transaction_hash())
    }

    pub async fn cancel_migration(&self, id: MigrationId) -> RelayResult<CancelOutcome> {
        let outcome = self.migration(id)?.cancel().await?;
        info!(%id, ?outcome, "cancel requested");
        Ok(outcome)
    }

    pub async fn get_destination_token_uri(&self, id: MigrationId) -> RelayResult<String> {
        let migration = self.migration(id)?;
        if migration.transaction_hash().is_none() {
            return Err(RelayError::InvalidStep {
                operation: "getDestinationTokenUri",
                step: migration.step(),
            });
        }
        let data = migration.data();
        self.connector(&data.destination_universe)?
            .get_token_uri(data.destination_world, data.destination_token_id)
            .await
    }

    pub fn migration_status(&self, id: MigrationId) -> RelayResult<MigrationRecord> {
        Ok(self.migration(id)?.record())
    }

    /// Re-drive a stalled migration from where it stopped.
    pub fn retry_migration(&self, id: MigrationId) -> RelayResult<()> {
        let migration = self.migration(id)?;
        migration.check_resumable()?;
        info!(%id, step = %migration.step(), "retrying migration");
        tokio::spawn(async move {
            let _ = migration.resume().await;
        });
        Ok(())
    }

    /// Start one replenishment loop per configured world.
    pub fn spawn_replenishment(&self) -> Vec<JoinHandle<()>> {
        self.config
            .universes
            .iter()
            .flat_map(|universe| {
                universe.worlds.iter().map(move |world| {
                    tokio::spawn(self.pool.clone().run_replenishment(
                        universe.unique_id.clone(),
                        world.address,
                        self.config.premint_interval,
                    ))
                })
            })
            .collect()
    }
}

fn check_signature(signature: &Bytes) -> RelayResult<()> {
    crypto::parse_signature(signature)
        .map(|_| ())
        .map_err(|e| RelayError::Validation(e.to_string()))
}
