use std::{collections::HashMap, net::Ipv4Addr, sync::Arc};

use alloy::signers::local::PrivateKeySigner;
use anyhow::{Result, anyhow};
use http::{Method, header};
use jsonrpsee::server::{RpcServiceBuilder, Server, ServerHandle};
use tokio::{signal, task::JoinHandle};
use tower_http::cors::{Any, CorsLayer};
use tracing::*;
use url::Url;

use crate::{
    api,
    cfg::Config,
    connector::{ChainConnector, EvmConnector},
    db::Db,
    forge::HttpMetadata,
    ratelimit::{CallerIdLayer, Limiter, Rate, RateLimit},
    service::Relay,
};

pub struct RelayLauncher {
    pub relay: Arc<Relay>,
    config: Config,
    rpc_launched: bool,
    /// Loops that run for as long as the relay does. Aborted on shutdown.
    background: Vec<JoinHandle<()>>,
}

impl RelayLauncher {
    /// Connect to every configured universe and restore the state of the previous run.
    pub async fn new(signer: PrivateKeySigner, config: Config) -> Result<Self> {
        info!(relay = %signer.address(), "starting relay");

        let mut connectors: HashMap<String, Arc<dyn ChainConnector>> = HashMap::new();
        for universe in &config.universes {
            let connector = EvmConnector::connect(universe, signer.clone()).await?;
            connectors.insert(universe.unique_id.clone(), Arc::new(connector));
        }

        let db = Arc::new(Db::new(config.data_dir.as_ref())?);
        let forge_url = config
            .forge_url
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(|e| anyhow!("invalid forge_url: {e}"))?;
        let metadata = Arc::new(HttpMetadata::new(forge_url)?);

        let relay = Arc::new(Relay::new(&config, connectors, db, metadata)?);

        Ok(Self {
            relay,
            config,
            rpc_launched: false,
            background: vec![],
        })
    }

    pub async fn launch_rpc_server(&mut self) -> Result<ServerHandle> {
        if self.rpc_launched {
            return Err(anyhow!("RPC server already running!"));
        }
        trace!("Launching JSON-RPC server");
        // Construct the JSON-RPC API server. We inject a [CorsLayer] to ensure web browsers can call our API directly.
        let cors = CorsLayer::new()
            .allow_methods(Method::POST)
            .allow_origin(Any)
            .allow_headers([header::CONTENT_TYPE]);
        let http_middleware = tower::ServiceBuilder::new()
            .layer(cors)
            .layer(CallerIdLayer);

        let limit = self.config.token_id_rate_limit;
        let limiter = Limiter::new(Rate::new(limit.calls, limit.period));
        self.background
            .push(tokio::spawn(limiter.clone().run_eviction()));
        let rpc_middleware =
            RpcServiceBuilder::new().layer_fn(move |s| RateLimit::new(s, limiter.clone()));

        let port = self.config.api_port;
        let server = Server::builder()
            .set_http_middleware(http_middleware)
            .set_rpc_middleware(rpc_middleware)
            .build((Ipv4Addr::UNSPECIFIED, port))
            .await?;
        info!(addr = %server.local_addr()?, "JSON-RPC server listening");

        let handle = server.start(api::rpc_module(self.relay.clone()));
        self.rpc_launched = true;
        Ok(handle)
    }

    /// Serve until interrupted.
    pub async fn run(mut self) -> Result<()> {
        let replenishers = self.relay.spawn_replenishment();
        self.background.extend(replenishers);
        let handle = self.launch_rpc_server().await?;

        signal::ctrl_c().await?;
        info!("shutting down");

        for task in self.background.drain(..) {
            task.abort();
        }
        handle.stop()?;
        handle.stopped().await;
        Ok(())
    }
}
