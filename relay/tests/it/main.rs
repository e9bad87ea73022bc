mod api;
mod migration;

use std::{
    collections::HashMap,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use alloy::{
    primitives::{Address, B256, Bytes, U256},
    signers::{SignerSync, local::PrivateKeySigner},
};
use relay::{
    cfg::{Config, UniverseConfig, WorldConfig},
    connector::ChainConnector,
    db::Db,
    migration::{MigrationData, MigrationId, MigrationRecord, Step},
    service::Relay,
    test_util::{MockConnector, MockMetadata},
};

pub const ORIGIN_WORLD: Address = Address::repeat_byte(0x11);
pub const IOU_WORLD: Address = Address::repeat_byte(0x22);
pub const U1_BRIDGE: Address = Address::repeat_byte(0xb1);
pub const U2_BRIDGE: Address = Address::repeat_byte(0xb2);

/// Two universes: `U1` holds the original tokens in [ORIGIN_WORLD], `U2` holds their IOUs in [IOU_WORLD].
pub fn config() -> Config {
    Config {
        event_timeout: Duration::from_secs(5),
        universes: vec![
            UniverseConfig {
                unique_id: "U1".to_owned(),
                rpc_url: "ws://localhost:8546".to_owned(),
                bridge_address: U1_BRIDGE,
                worlds: vec![WorldConfig {
                    address: ORIGIN_WORLD,
                }],
            },
            UniverseConfig {
                unique_id: "U2".to_owned(),
                rpc_url: "ws://localhost:8547".to_owned(),
                bridge_address: U2_BRIDGE,
                worlds: vec![WorldConfig { address: IOU_WORLD }],
            },
        ],
        ..Default::default()
    }
}

pub struct Harness {
    pub relay: Arc<Relay>,
    pub u1: Arc<MockConnector>,
    pub u2: Arc<MockConnector>,
    pub metadata: Arc<MockMetadata>,
    pub db: Arc<Db>,
    pub owner: PrivateKeySigner,
    pub receiver: Address,
}

impl Harness {
    pub fn new() -> Harness {
        Self::build(config(), None)
    }

    pub fn build(config: Config, data_dir: Option<&Path>) -> Harness {
        let u1 = Arc::new(MockConnector::new("U1"));
        let u2 = Arc::new(MockConnector::new("U2"));
        let mut connectors: HashMap<String, Arc<dyn ChainConnector>> = HashMap::new();
        connectors.insert("U1".to_owned(), u1.clone());
        connectors.insert("U2".to_owned(), u2.clone());

        let db = Arc::new(Db::new(data_dir).unwrap());
        let metadata = MockMetadata::new();
        let relay = Relay::new(&config, connectors, db.clone(), metadata.clone()).unwrap();

        Harness {
            relay: Arc::new(relay),
            u1,
            u2,
            metadata,
            db,
            owner: PrivateKeySigner::random(),
            receiver: Address::repeat_byte(0xee),
        }
    }

    /// A forward migration of `token_id` in [ORIGIN_WORLD], owned by [Harness::owner], to `iou_token_id`.
    pub fn forward(&self, token_id: u64, iou_token_id: U256) -> MigrationData {
        let token_id = U256::from(token_id);
        self.u1.set_owner(ORIGIN_WORLD, token_id, self.owner.address());
        self.u1
            .set_token_uri_directly(ORIGIN_WORLD, token_id, &origin_uri(token_id));
        MigrationData {
            origin_universe: "U1".to_owned(),
            origin_world: ORIGIN_WORLD,
            origin_token_id: token_id,
            origin_owner: self.owner.address(),
            destination_universe: "U2".to_owned(),
            destination_world: IOU_WORLD,
            destination_token_id: iou_token_id,
            destination_owner: self.receiver,
            redeem: false,
        }
    }

    /// Reserve an IOU token id and start a forward migration into it.
    pub async fn start_forward(&self, token_id: u64) -> MigrationId {
        let iou_token_id = self
            .relay
            .get_available_token_id("U2", IOU_WORLD)
            .await
            .unwrap();
        let data = self.forward(token_id, iou_token_id);
        self.relay.init_migration(data).await.unwrap()
    }

    pub fn sign(&self, hash: B256) -> Bytes {
        sign_with(&self.owner, hash)
    }

    pub fn record(&self, id: MigrationId) -> MigrationRecord {
        self.relay.migration_status(id).unwrap()
    }

    pub fn step(&self, id: MigrationId) -> Step {
        self.record(id).step
    }

    pub async fn wait_for_step(&self, id: MigrationId, step: Step) {
        wait_until(|| self.step(id) == step).await;
    }

    /// Drive a migration from its announcement to the point where the owner signs the escrow hash.
    pub async fn escrow(&self, id: MigrationId) -> B256 {
        self.wait_for_step(id, Step::AnnonceToBridge).await;
        let migration_hash = self.relay.polling_migration(id).unwrap().unwrap();
        self.relay
            .continue_migration(id, self.sign(migration_hash))
            .unwrap();
        self.wait_for_step(id, Step::UpdateEscrowHash).await;
        self.relay.polling_escrow(id).unwrap().unwrap()
    }
}

pub fn origin_uri(token_id: U256) -> String {
    format!("ipfs://origin/{token_id}")
}

pub fn sign_with(signer: &PrivateKeySigner, hash: B256) -> Bytes {
    let signature = signer.sign_message_sync(hash.as_slice()).unwrap();
    Bytes::from(signature.as_bytes().to_vec())
}

/// Poll `condition` until it holds, letting spawned migration tasks run in between.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
