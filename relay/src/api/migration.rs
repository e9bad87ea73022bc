//! The migration protocol as seen by the front end.

use std::sync::Arc;

use jsonrpsee::{RpcModule, types::Params};
use serde::de::DeserializeOwned;

use super::types::{
    CloseMigrationRequest, ContinueMigrationRequest, EndMigrationResponse, InitMigrationRequest,
    MigrationIdRequest, MigrationIdResponse, MigrationStatusResponse, PollingEscrowResponse,
    PollingMigrationResponse, StatusResponse, TokenIdRequest, TokenIdResponse, TokenUriResponse,
    UniverseRequest, WorldsResponse,
};
use crate::{
    error::{RelayError, RelayResult},
    service::Relay,
};

pub fn rpc_module(relay: Arc<Relay>) -> RpcModule<Arc<Relay>> {
    super::declare_module!(
        relay,
        [
            ("getAvailableWorlds", get_available_worlds),
            ("getAvailableTokenId", get_available_token_id),
            ("initMigration", init_migration),
            ("pollingMigration", polling_migration),
            ("continueMigration", continue_migration),
            ("pollingEscrow", polling_escrow),
            ("closeMigration", close_migration),
            ("closeRedeemMigration", close_redeem_migration),
            ("pollingEndMigration", polling_end_migration),
            ("cancelMigration", cancel_migration),
            ("getDestinationTokenUri", get_destination_token_uri),
            ("getMigrationStatus", get_migration_status),
            ("retryMigration", retry_migration),
        ],
    )
}

/// Every method takes a single object of named parameters.
fn request<T: DeserializeOwned>(params: Params<'static>) -> RelayResult<T> {
    params
        .one()
        .or_else(|_| params.parse())
        .map_err(|e| RelayError::Validation(e.message().to_owned()))
}

async fn get_available_worlds(params: Params<'static>, relay: &Relay) -> RelayResult<WorldsResponse> {
    let UniverseRequest { universe } = request(params)?;
    Ok(WorldsResponse {
        worlds: relay.get_available_worlds(&universe)?,
    })
}

async fn get_available_token_id(
    params: Params<'static>,
    relay: &Relay,
) -> RelayResult<TokenIdResponse> {
    let TokenIdRequest { universe, world } = request(params)?;
    Ok(TokenIdResponse {
        token_id: relay.get_available_token_id(&universe, world).await?,
    })
}

async fn init_migration(params: Params<'static>, relay: &Relay) -> RelayResult<MigrationIdResponse> {
    let request: InitMigrationRequest = request(params)?;
    Ok(MigrationIdResponse {
        migration_id: relay.init_migration(request.into_data()).await?,
    })
}

async fn polling_migration(
    params: Params<'static>,
    relay: &Relay,
) -> RelayResult<PollingMigrationResponse> {
    let MigrationIdRequest { migration_id } = request(params)?;
    Ok(relay.polling_migration(migration_id)?.into())
}

async fn continue_migration(params: Params<'static>, relay: &Relay) -> RelayResult<StatusResponse> {
    let ContinueMigrationRequest {
        migration_id,
        migration_hash_signature,
    } = request(params)?;
    relay.continue_migration(migration_id, migration_hash_signature)?;
    Ok(StatusResponse::new("Migration continuing."))
}

async fn polling_escrow(params: Params<'static>, relay: &Relay) -> RelayResult<PollingEscrowResponse> {
    let MigrationIdRequest { migration_id } = request(params)?;
    Ok(relay.polling_escrow(migration_id)?.into())
}

async fn close_migration(params: Params<'static>, relay: &Relay) -> RelayResult<StatusResponse> {
    let CloseMigrationRequest {
        migration_id,
        escrow_hash_signature,
    } = request(params)?;
    relay.close_migration(migration_id, escrow_hash_signature, false)?;
    Ok(StatusResponse::new("Minting of the token initiated"))
}

async fn close_redeem_migration(
    params: Params<'static>,
    relay: &Relay,
) -> RelayResult<StatusResponse> {
    let CloseMigrationRequest {
        migration_id,
        escrow_hash_signature,
    } = request(params)?;
    relay.close_migration(migration_id, escrow_hash_signature, true)?;
    Ok(StatusResponse::new("Redeem of the token initiated"))
}

async fn polling_end_migration(
    params: Params<'static>,
    relay: &Relay,
) -> RelayResult<EndMigrationResponse> {
    let MigrationIdRequest { migration_id } = request(params)?;
    Ok(relay.polling_end_migration(migration_id)?.into())
}

async fn cancel_migration(params: Params<'static>, relay: &Relay) -> RelayResult<StatusResponse> {
    let MigrationIdRequest { migration_id } = request(params)?;
    let outcome = relay.cancel_migration(migration_id).await?;
    Ok(StatusResponse::new(outcome.status()))
}

async fn get_destination_token_uri(
    params: Params<'static>,
    relay: &Relay,
) -> RelayResult<TokenUriResponse> {
    let MigrationIdRequest { migration_id } = request(params)?;
    Ok(TokenUriResponse {
        token_uri: relay.get_destination_token_uri(migration_id).await?,
    })
}

async fn get_migration_status(
    params: Params<'static>,
    relay: &Relay,
) -> RelayResult<MigrationStatusResponse> {
    let MigrationIdRequest { migration_id } = request(params)?;
    Ok(relay.migration_status(migration_id)?.into())
}

async fn retry_migration(params: Params<'static>, relay: &Relay) -> RelayResult<StatusResponse> {
    let MigrationIdRequest { migration_id } = request(params)?;
    relay.retry_migration(migration_id)?;
    Ok(StatusResponse::new("Migration retrying."))
}
