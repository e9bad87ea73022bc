//! The preminted token pool.
//!
//! Minting an IOU token takes a round trip to the chain, which is too slow to do while a user waits for a token id. So
//! we keep a few tokens minted in advance for every configured world and hand them out on request.

use std::{collections::HashMap, sync::Arc, time::Duration};

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    connector::ChainConnector,
    db::Db,
    error::{RelayError, RelayResult},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PremintedToken {
    pub universe: String,
    pub world: Address,
    pub token_id: U256,
    /// Handed to a migration. Cleared on restart unless the token was also minted.
    pub delivered: bool,
    /// The migration it was handed to finished on the destination chain.
    pub minted: bool,
}

pub struct PremintPool {
    db: Arc<Db>,
    connectors: HashMap<String, Arc<dyn ChainConnector>>,
    threshold: usize,
}

impl PremintPool {
    pub fn new(
        db: Arc<Db>,
        connectors: HashMap<String, Arc<dyn ChainConnector>>,
        threshold: usize,
    ) -> Self {
        PremintPool {
            db,
            connectors,
            threshold,
        }
    }

    fn connector(&self, universe: &str) -> RelayResult<&Arc<dyn ChainConnector>> {
        self.connectors
            .get(universe)
            .ok_or_else(|| RelayError::not_found("universe", universe))
    }

    /// Return reservations whose migration never completed. Must run before any reservation is served after a
    /// restart.
    pub fn reset_undelivered(&self) -> RelayResult<usize> {
        let reset = self.db.reset_undelivered_tokens()?;
        if reset > 0 {
            info!(reset, "returned undelivered preminted tokens to the pool");
        }
        Ok(reset)
    }

    /// Hand out a token id for `world`, minting one on the spot if the pool is empty.
    pub async fn reserve_or_mint_token_id(&self, universe: &str, world: Address) -> RelayResult<U256> {
        let connector = self.connector(universe)?;
        if let Some(token_id) = self.db.take_available_token(universe, world)? {
            info!(universe, %world, %token_id, "preminted token delivered");
            return Ok(token_id);
        }

        let token_id = connector.premint_token(world).await?;
        self.db.insert_preminted_token(&PremintedToken {
            universe: universe.to_owned(),
            world,
            token_id,
            delivered: true,
            minted: false,
        })?;
        info!(universe, %world, %token_id, "token minted on demand and delivered");
        Ok(token_id)
    }

    /// Bind a token to a live migration again. Returns false if the token did not come from the pool.
    pub fn claim(&self, universe: &str, world: Address, token_id: U256) -> RelayResult<bool> {
        let known = self.db.set_token_delivered(universe, world, token_id, true)?;
        if !known {
            warn!(universe, %world, %token_id, "destination token is not a preminted token");
        }
        Ok(known)
    }

    pub fn release(&self, universe: &str, world: Address, token_id: U256) -> RelayResult<()> {
        match self.token(universe, world, token_id)? {
            Some(token) if !token.minted => {
                self.db.set_token_delivered(universe, world, token_id, false)?;
                debug!(universe, %world, %token_id, "preminted token released");
            }
            _ => {}
        }
        Ok(())
    }

    pub fn mark_minted(&self, universe: &str, world: Address, token_id: U256) -> RelayResult<()> {
        if !self.db.set_token_minted(universe, world, token_id)? {
            warn!(universe, %world, %token_id, "minted token is not a preminted token");
        }
        Ok(())
    }

    pub fn token(
        &self,
        universe: &str,
        world: Address,
        token_id: U256,
    ) -> RelayResult<Option<PremintedToken>> {
        self.db.get_preminted_token(universe, world, token_id)
    }

    pub fn available(&self, universe: &str, world: Address) -> RelayResult<usize> {
        self.db.count_available_tokens(universe, world)
    }

    /// Premint one token if the world's buffer is below the threshold. Returns the new token, if any.
    pub async fn replenish_once(&self, universe: &str, world: Address) -> RelayResult<Option<U256>> {
        let connector = self.connector(universe)?;
        if self.available(universe, world)? >= self.threshold {
            return Ok(None);
        }

        let token_id = connector.premint_token(world).await?;
        self.db.insert_preminted_token(&PremintedToken {
            universe: universe.to_owned(),
            world,
            token_id,
            delivered: false,
            minted: false,
        })?;
        info!(universe, %world, %token_id, "preminted token added to the pool");
        Ok(Some(token_id))
    }

    /// Keep the buffer of one world topped up. Never returns; failures are logged and retried on the next tick.
    pub async fn run_replenishment(self: Arc<Self>, universe: String, world: Address, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = self.replenish_once(&universe, world).await {
                error!(universe, %world, %e, "can't premint a token");
            }
        }
    }
}
