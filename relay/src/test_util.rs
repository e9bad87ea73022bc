//! In-memory stand-ins for the chains and the metadata forge, used by the tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use alloy::primitives::{Address, B256, Bytes, TxHash, U256, keccak256};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    connector::{ChainConnector, MigrationRegistration, MutationGate},
    crypto,
    error::{RelayError, RelayResult},
    forge::{MetadataService, TokenMetadata},
    migration::{MigrationData, MigrationId},
};

pub const BLOCK_TIMESTAMP: u64 = 1_700_000_000;

/// A chain call made against a [MockConnector].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Premint {
        world: Address,
    },
    MigrateToErc721Iou {
        origin_bridge: Address,
        destination_bridge: Address,
    },
    SafeTransferFrom {
        world: Address,
        from: Address,
        to: Address,
        token_id: U256,
    },
    RegisterEscrowHashSignature {
        bridge: Address,
        migration_hash: B256,
    },
    MigrateFromIou {
        destination_bridge: Address,
        origin_bridge: Address,
        block_timestamp: u64,
    },
    SetTokenUri {
        world: Address,
        token_id: U256,
        uri: String,
    },
}

#[derive(Default)]
struct ChainState {
    owners: HashMap<(Address, U256), Address>,
    uris: HashMap<(Address, U256), String>,
    minted: HashMap<Address, u64>,
    not_erc721: HashSet<Address>,
    failing: HashSet<&'static str>,
    calls: Vec<Call>,
}

/// A chain that lives in memory. Mutating calls go through a [MutationGate] like the real connector, and the highest
/// number of mutating calls ever in flight at once is recorded.
pub struct MockConnector {
    universe_id: String,
    state: Mutex<ChainState>,
    gate: MutationGate,
    nonce: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    mutation_delay: Mutex<Duration>,
    announce_delay: Mutex<Option<Duration>>,
}

impl MockConnector {
    pub fn new(universe_id: &str) -> Self {
        MockConnector {
            universe_id: universe_id.to_owned(),
            state: Mutex::new(ChainState::default()),
            gate: MutationGate::new(),
            nonce: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            mutation_delay: Mutex::new(Duration::ZERO),
            announce_delay: Mutex::new(None),
        }
    }

    pub fn set_owner(&self, world: Address, token_id: U256, owner: Address) {
        self.state.lock().owners.insert((world, token_id), owner);
    }

    pub fn owner_of(&self, world: Address, token_id: U256) -> Option<Address> {
        self.state.lock().owners.get(&(world, token_id)).copied()
    }

    pub fn set_token_uri_directly(&self, world: Address, token_id: U256, uri: &str) {
        self.state.lock().uris.insert((world, token_id), uri.to_owned());
    }

    pub fn token_uri(&self, world: Address, token_id: U256) -> Option<String> {
        self.state.lock().uris.get(&(world, token_id)).cloned()
    }

    pub fn set_not_erc721(&self, world: Address) {
        self.state.lock().not_erc721.insert(world);
    }

    /// Make every call of `operation` (a [ChainConnector] method name) fail until [MockConnector::heal] is called.
    pub fn fail(&self, operation: &'static str) {
        self.state.lock().failing.insert(operation);
    }

    pub fn heal(&self, operation: &'static str) {
        self.state.lock().failing.remove(operation);
    }

    /// How long each mutating call takes.
    pub fn set_mutation_delay(&self, delay: Duration) {
        *self.mutation_delay.lock() = delay;
    }

    /// Delay the pre-registration event. `Duration::MAX` means it never arrives.
    pub fn set_announce_delay(&self, delay: Option<Duration>) {
        *self.announce_delay.lock() = delay;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn transfers(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::SafeTransferFrom { .. }))
            .collect()
    }

    pub fn minted_count(&self, world: Address) -> u64 {
        self.state.lock().minted.get(&world).copied().unwrap_or_default()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// The escrow hash the bridge derives from a migration hash.
    pub fn escrow_hash_for(migration_hash: B256) -> B256 {
        keccak256([migration_hash.as_slice(), &b"escrow"[..]].concat())
    }

    fn check(&self, operation: &'static str) -> RelayResult<()> {
        if self.state.lock().failing.contains(operation) {
            return Err(RelayError::chain(anyhow::anyhow!(
                "{operation} reverted on {}",
                self.universe_id
            )));
        }
        Ok(())
    }

    fn next_hash(&self) -> B256 {
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        keccak256([self.universe_id.as_bytes(), &nonce.to_be_bytes()[..]].concat())
    }

    /// Run a mutating call through the gate, the way a wallet-backed connector would. Only calls that go through are
    /// recorded.
    async fn mutate<T>(
        &self,
        operation: &'static str,
        call: Call,
        apply: impl FnOnce(&mut ChainState) -> RelayResult<T>,
    ) -> RelayResult<T> {
        let _permit = self.gate.enter().await;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.mutation_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let result = self.check(operation).and_then(|()| {
            let mut state = self.state.lock();
            let value = apply(&mut state)?;
            state.calls.push(call);
            Ok(value)
        });

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl ChainConnector for MockConnector {
    async fn premint_token(&self, world: Address) -> RelayResult<U256> {
        self.mutate("premint_token", Call::Premint { world }, |state| {
            let count = state.minted.entry(world).or_default();
            *count += 1;
            Ok(U256::from(*count))
        })
        .await
    }

    async fn is_erc721(&self, world: Address) -> RelayResult<bool> {
        self.check("is_erc721")?;
        Ok(!self.state.lock().not_erc721.contains(&world))
    }

    async fn is_owner(&self, world: Address, token_id: U256, owner: Address) -> RelayResult<bool> {
        self.check("is_owner")?;
        Ok(self.owner_of(world, token_id) == Some(owner))
    }

    async fn migrate_to_erc721_iou(
        &self,
        origin_bridge: Address,
        destination_bridge: Address,
        _data: &MigrationData,
    ) -> RelayResult<MigrationRegistration> {
        self.mutate(
            "migrate_to_erc721_iou",
            Call::MigrateToErc721Iou {
                origin_bridge,
                destination_bridge,
            },
            |_| Ok(()),
        )
        .await?;

        let delay = *self.announce_delay.lock();
        match delay {
            Some(delay) if delay == Duration::MAX => std::future::pending::<()>().await,
            Some(delay) => tokio::time::sleep(delay).await,
            None => {}
        }
        Ok(MigrationRegistration {
            migration_hash: self.next_hash(),
            block_timestamp: BLOCK_TIMESTAMP,
        })
    }

    async fn verify_signature(&self, hash: B256, signature: &Bytes) -> RelayResult<Address> {
        crypto::recover_signer(hash, signature).map_err(RelayError::chain)
    }

    async fn safe_transfer_from(
        &self,
        world: Address,
        from: Address,
        to: Address,
        token_id: U256,
    ) -> RelayResult<TxHash> {
        self.mutate(
            "safe_transfer_from",
            Call::SafeTransferFrom {
                world,
                from,
                to,
                token_id,
            },
            |state| {
                if state.owners.get(&(world, token_id)) != Some(&from) {
                    return Err(RelayError::chain(anyhow::anyhow!(
                        "ERC721: transfer from incorrect owner"
                    )));
                }
                state.owners.insert((world, token_id), to);
                Ok(())
            },
        )
        .await?;
        Ok(self.next_hash())
    }

    async fn get_proof_of_escrow_hash(
        &self,
        _bridge: Address,
        migration_hash: B256,
    ) -> RelayResult<B256> {
        self.check("get_proof_of_escrow_hash")?;
        Ok(Self::escrow_hash_for(migration_hash))
    }

    async fn register_escrow_hash_signature(
        &self,
        bridge: Address,
        migration_hash: B256,
        _escrow_hash_signature: &Bytes,
    ) -> RelayResult<TxHash> {
        self.mutate(
            "register_escrow_hash_signature",
            Call::RegisterEscrowHashSignature {
                bridge,
                migration_hash,
            },
            |_| Ok(()),
        )
        .await?;
        Ok(self.next_hash())
    }

    async fn migrate_from_iou_erc721_to_erc721(
        &self,
        destination_bridge: Address,
        origin_bridge: Address,
        data: &MigrationData,
        _migration_hash_signature: &Bytes,
        block_timestamp: u64,
    ) -> RelayResult<TxHash> {
        let (world, token_id, owner) = (
            data.destination_world,
            data.destination_token_id,
            data.destination_owner,
        );
        self.mutate(
            "migrate_from_iou_erc721_to_erc721",
            Call::MigrateFromIou {
                destination_bridge,
                origin_bridge,
                block_timestamp,
            },
            |state| {
                state.owners.insert((world, token_id), owner);
                Ok(())
            },
        )
        .await?;
        Ok(self.next_hash())
    }

    async fn get_token_uri(&self, world: Address, token_id: U256) -> RelayResult<String> {
        self.check("get_token_uri")?;
        self.token_uri(world, token_id).ok_or_else(|| {
            RelayError::chain(anyhow::anyhow!("ERC721: URI query for nonexistent token"))
        })
    }

    async fn set_token_uri(
        &self,
        world: Address,
        token_id: U256,
        uri: &str,
    ) -> RelayResult<TxHash> {
        let call = Call::SetTokenUri {
            world,
            token_id,
            uri: uri.to_owned(),
        };
        self.mutate("set_token_uri", call, |state| {
            state.uris.insert((world, token_id), uri.to_owned());
            Ok(())
        })
        .await?;
        Ok(self.next_hash())
    }
}

/// Metadata documents served from memory. Forged IOU documents are stored too, under `forged://<migration id>`.
#[derive(Default)]
pub struct MockMetadata {
    documents: Mutex<HashMap<String, TokenMetadata>>,
    forged: Mutex<Vec<(String, MigrationId)>>,
}

impl MockMetadata {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, uri: &str, metadata: TokenMetadata) {
        self.documents.lock().insert(uri.to_owned(), metadata);
    }

    /// `(origin token URI, migration)` for each forged document.
    pub fn forged(&self) -> Vec<(String, MigrationId)> {
        self.forged.lock().clone()
    }
}

#[async_trait]
impl MetadataService for MockMetadata {
    async fn fetch_metadata(&self, uri: &str) -> RelayResult<TokenMetadata> {
        self.documents
            .lock()
            .get(uri)
            .cloned()
            .ok_or_else(|| RelayError::Metadata(format!("{uri}: 404 Not Found")))
    }

    async fn forge_iou_metadata(
        &self,
        origin_token_uri: &str,
        id: MigrationId,
        _data: &MigrationData,
    ) -> RelayResult<String> {
        self.forged.lock().push((origin_token_uri.to_owned(), id));
        Ok(format!("forged://{id}"))
    }
}
