use std::pin::pin;

use alloy::{
    eips::BlockNumberOrTag,
    network::{Ethereum, EthereumWallet, ReceiptResponse},
    primitives::{Address, B256, Bytes, TxHash, U64, U256},
    providers::{DynProvider, PendingTransactionBuilder, Provider, ProviderBuilder, WsConnect},
    signers::local::PrivateKeySigner,
};
use anyhow::anyhow;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{ChainConnector, MigrationRegistration, MutationGate};
use crate::{
    cfg::UniverseConfig,
    contracts::{
        ERC721_INTERFACE_ID, IBridge, IERC721, IERC721IOU, address_word, number_word, universe_key,
    },
    crypto,
    error::{RelayError, RelayResult},
    migration::MigrationData,
};

/// A [ChainConnector] backed by a WebSocket JSON-RPC endpoint and the relay wallet.
#[derive(Clone)]
pub struct EvmConnector {
    universe_id: String,
    rpc_url: String,
    provider: DynProvider,
    signer_address: Address,
    gate: MutationGate,
}

#[derive(Debug, Deserialize)]
struct BlockTimestamp {
    timestamp: U64,
}

impl EvmConnector {
    pub async fn connect(config: &UniverseConfig, signer: PrivateKeySigner) -> anyhow::Result<Self> {
        let signer_address = signer.address();
        let wallet = EthereumWallet::from(signer);
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .on_ws(WsConnect::new(&config.rpc_url))
            .await?
            .erased();
        let chain_id = provider.get_chain_id().await?;
        info!(
            universe = config.unique_id,
            rpc_url = config.rpc_url,
            chain_id,
            relay = %signer_address,
            "connected"
        );

        Ok(EvmConnector {
            universe_id: config.unique_id.clone(),
            rpc_url: config.rpc_url.clone(),
            provider,
            signer_address,
            gate: MutationGate::new(),
        })
    }

    /// Wait for a sent transaction to be mined and check it succeeded.
    async fn confirm(
        &self,
        pending: PendingTransactionBuilder<Ethereum>,
    ) -> RelayResult<TxHash> {
        let receipt = pending.get_receipt().await.map_err(RelayError::chain)?;
        let hash = receipt.transaction_hash;
        if !receipt.status() {
            return Err(RelayError::chain(anyhow!("transaction {hash} reverted")));
        }
        debug!(rpc_url = self.rpc_url, %hash, "transaction confirmed");
        Ok(hash)
    }

    async fn block_timestamp(&self, number: u64) -> RelayResult<u64> {
        let block: Option<BlockTimestamp> = self
            .provider
            .raw_request(
                "eth_getBlockByNumber".into(),
                (BlockNumberOrTag::Number(number), false),
            )
            .await
            .map_err(RelayError::chain)?;
        let block = block.ok_or_else(|| RelayError::chain(anyhow!("block {number} not found")))?;
        Ok(block.timestamp.to())
    }
}

#[async_trait]
impl ChainConnector for EvmConnector {
    async fn premint_token(&self, world: Address) -> RelayResult<U256> {
        let token = IERC721IOU::new(world, self.provider.clone());
        // Hold the gate over the read-back too, so the count we read is ours.
        let _permit = self.gate.enter().await;
        let pending = token
            .premintFor(self.signer_address)
            .send()
            .await
            .map_err(RelayError::chain)?;
        let hash = self.confirm(pending).await?;
        let token_id = token
            .mintedTokens()
            .call()
            .await
            .map_err(RelayError::chain)?
            .count;
        info!(universe = self.universe_id, %world, %token_id, %hash, "preminted a token");
        Ok(token_id)
    }

    async fn is_erc721(&self, world: Address) -> RelayResult<bool> {
        let token = IERC721::new(world, self.provider.clone());
        match token.supportsInterface(ERC721_INTERFACE_ID).call().await {
            Ok(result) => Ok(result.supported),
            // A contract without ERC-165 reverts, which just means it is not an ERC-721.
            Err(alloy::contract::Error::TransportError(e)) if e.is_error_resp() => Ok(false),
            Err(e) => Err(RelayError::chain(e)),
        }
    }

    async fn is_owner(&self, world: Address, token_id: U256, owner: Address) -> RelayResult<bool> {
        let token = IERC721::new(world, self.provider.clone());
        let actual = token
            .ownerOf(token_id)
            .call()
            .await
            .map_err(RelayError::chain)?
            .owner;
        Ok(actual == owner)
    }

    async fn migrate_to_erc721_iou(
        &self,
        origin_bridge: Address,
        destination_bridge: Address,
        data: &MigrationData,
    ) -> RelayResult<MigrationRegistration> {
        let destination_universe = universe_key(&data.destination_universe).ok_or_else(|| {
            RelayError::Validation(format!(
                "universe id {} does not fit in 32 bytes",
                data.destination_universe
            ))
        })?;
        let bridge = IBridge::new(origin_bridge, self.provider.clone());

        // Install the filter before sending, so the event cannot slip past us.
        let events = bridge
            .MigrationDeparturePreRegisteredERC721IOU_filter()
            .watch()
            .await
            .map_err(RelayError::chain)?
            .into_stream();
        let mut events = pin!(events);

        {
            let _permit = self.gate.enter().await;
            let pending = bridge
                .migrateToERC721IOU(
                    data.origin_world,
                    data.origin_token_id,
                    destination_universe,
                    address_word(destination_bridge),
                    address_word(data.destination_world),
                    number_word(data.destination_token_id),
                    address_word(data.destination_owner),
                    address_word(data.origin_owner),
                )
                .send()
                .await
                .map_err(RelayError::chain)?;
            self.confirm(pending).await?;
        }

        while let Some(event) = events.next().await {
            let (event, log) = match event {
                Ok(event) => event,
                Err(e) => {
                    warn!(universe = self.universe_id, %e, "undecodable bridge event");
                    continue;
                }
            };
            if event._signee != data.origin_owner {
                continue;
            }
            let block_timestamp = match (log.block_timestamp, log.block_number) {
                (Some(timestamp), _) => timestamp,
                (None, Some(number)) => self.block_timestamp(number).await?,
                (None, None) => {
                    return Err(RelayError::chain(anyhow!(
                        "pre-registration event without a block"
                    )));
                }
            };
            return Ok(MigrationRegistration {
                migration_hash: event.migrationHash,
                block_timestamp,
            });
        }

        Err(RelayError::chain(anyhow!(
            "event stream of {} closed before the migration was pre-registered",
            self.rpc_url
        )))
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
        let token = IERC721::new(world, self.provider.clone());
        let _permit = self.gate.enter().await;
        let pending = token
            .safeTransferFrom(from, to, token_id)
            .send()
            .await
            .map_err(RelayError::chain)?;
        self.confirm(pending).await
    }

    async fn get_proof_of_escrow_hash(
        &self,
        bridge: Address,
        migration_hash: B256,
    ) -> RelayResult<B256> {
        let bridge = IBridge::new(bridge, self.provider.clone());
        Ok(bridge
            .getProofOfEscrowHash(migration_hash)
            .call()
            .await
            .map_err(RelayError::chain)?
            .escrowHash)
    }

    async fn register_escrow_hash_signature(
        &self,
        bridge: Address,
        migration_hash: B256,
        escrow_hash_signature: &Bytes,
    ) -> RelayResult<TxHash> {
        let bridge = IBridge::new(bridge, self.provider.clone());
        let _permit = self.gate.enter().await;
        let pending = bridge
            .registerEscrowHashSignature(migration_hash, escrow_hash_signature.clone())
            .send()
            .await
            .map_err(RelayError::chain)?;
        self.confirm(pending).await
    }

    async fn migrate_from_iou_erc721_to_erc721(
        &self,
        destination_bridge: Address,
        origin_bridge: Address,
        data: &MigrationData,
        migration_hash_signature: &Bytes,
        block_timestamp: u64,
    ) -> RelayResult<TxHash> {
        let origin_universe = universe_key(&data.origin_universe).ok_or_else(|| {
            RelayError::Validation(format!(
                "universe id {} does not fit in 32 bytes",
                data.origin_universe
            ))
        })?;
        let bridge = IBridge::new(destination_bridge, self.provider.clone());
        let _permit = self.gate.enter().await;
        let pending = bridge
            .migrateFromIOUERC721ToERC721(
                origin_universe,
                address_word(origin_bridge),
                address_word(data.origin_world),
                number_word(data.origin_token_id),
                address_word(data.origin_owner),
                data.destination_world,
                data.destination_token_id,
                data.destination_owner,
                data.origin_owner,
                number_word(U256::from(block_timestamp)),
                migration_hash_signature.clone(),
            )
            .send()
            .await
            .map_err(RelayError::chain)?;
        self.confirm(pending).await
    }

    async fn get_token_uri(&self, world: Address, token_id: U256) -> RelayResult<String> {
        let token = IERC721::new(world, self.provider.clone());
        Ok(token
            .tokenURI(token_id)
            .call()
            .await
            .map_err(RelayError::chain)?
            .uri)
    }

    async fn set_token_uri(
        &self,
        world: Address,
        token_id: U256,
        uri: &str,
    ) -> RelayResult<TxHash> {
        let token = IERC721IOU::new(world, self.provider.clone());
        let _permit = self.gate.enter().await;
        let pending = token
            .setTokenUri(token_id, uri.to_owned())
            .send()
            .await
            .map_err(RelayError::chain)?;
        self.confirm(pending).await
    }
}
