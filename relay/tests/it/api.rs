use std::sync::Arc;

use alloy::primitives::{B256, U256};
use jsonrpsee::{
    RpcModule,
    core::params::{ArrayParams, ObjectParams},
};
use relay::{
    api,
    migration::{MigrationId, Step},
    service::Relay,
};
use serde_json::{Value, json};

use crate::{Harness, IOU_WORLD, ORIGIN_WORLD};

fn params(value: Value) -> ArrayParams {
    let mut params = ArrayParams::new();
    params.insert(value).unwrap();
    params
}

async fn call(module: &RpcModule<Arc<Relay>>, method: &str, value: Value) -> Value {
    module.call(method, params(value)).await.unwrap()
}

#[tokio::test]
async fn migration_over_json_rpc() {
    let h = Harness::new();
    let module = api::rpc_module(h.relay.clone());

    let worlds = call(&module, "getAvailableWorlds", json!({ "universe": "U2" })).await;
    assert_eq!(worlds, json!({ "worlds": [IOU_WORLD] }));

    let token = call(
        &module,
        "getAvailableTokenId",
        json!({ "universe": "U2", "world": IOU_WORLD }),
    )
    .await;
    assert_eq!(token, json!({ "tokenId": "1" }));

    let data = h.forward(7, U256::from(1));
    let created = call(
        &module,
        "initMigration",
        json!({ "migrationData": serde_json::to_value(&data).unwrap() }),
    )
    .await;
    let migration_id = created["migrationId"].as_str().unwrap().to_owned();
    let id: MigrationId = migration_id.parse().unwrap();
    let by_id = json!({ "migrationId": migration_id });

    h.wait_for_step(id, Step::AnnonceToBridge).await;
    let polled = call(&module, "pollingMigration", by_id.clone()).await;
    let migration_hash: B256 =
        serde_json::from_value(polled["migrationHash"].clone()).unwrap();

    let escrow_pending = call(&module, "pollingEscrow", by_id.clone()).await;
    assert_eq!(escrow_pending, json!({ "status": "No escrow hash yet" }));

    let continued = call(
        &module,
        "continueMigration",
        json!({ "migrationId": migration_id, "migrationHashSignature": h.sign(migration_hash) }),
    )
    .await;
    assert_eq!(continued, json!({ "status": "Migration continuing." }));

    h.wait_for_step(id, Step::UpdateEscrowHash).await;
    let polled = call(&module, "pollingEscrow", by_id.clone()).await;
    let escrow_hash: B256 =
        serde_json::from_value(polled["escrowHash"].clone()).unwrap();

    let running = call(&module, "pollingEndMigration", by_id.clone()).await;
    assert_eq!(running, json!({ "migrationStatus": "Running" }));

    let closed = call(
        &module,
        "closeMigration",
        json!({ "migrationId": migration_id, "escrowHashSignature": h.sign(escrow_hash) }),
    )
    .await;
    assert_eq!(closed, json!({ "status": "Minting of the token initiated" }));

    h.wait_for_step(id, Step::Completed).await;
    let ended = call(&module, "pollingEndMigration", by_id.clone()).await;
    assert_eq!(ended["migrationStatus"], "Ok");
    assert!(ended["transactionHash"].is_string());

    let uri = call(&module, "getDestinationTokenUri", by_id.clone()).await;
    assert_eq!(uri, json!({ "tokenUri": format!("forged://{migration_id}") }));

    let status = call(&module, "getMigrationStatus", by_id).await;
    assert_eq!(status["step"], "completed");
    assert_eq!(status["migrationId"], migration_id.as_str());
    assert!(status.get("lastError").is_none());
}

#[tokio::test]
async fn named_params_and_cancel() {
    let h = Harness::new();
    let module = api::rpc_module(h.relay.clone());
    let id = h.start_forward(7).await;
    h.wait_for_step(id, Step::AnnonceToBridge).await;

    let mut named = ObjectParams::new();
    named.insert("migrationId", id).unwrap();
    let canceled: Value = module.call("cancelMigration", named).await.unwrap();
    assert_eq!(
        canceled,
        json!({ "status": "Migration stopped. Origin token sent back to owner." })
    );

    let again = call(&module, "cancelMigration", json!({ "migrationId": id })).await;
    assert_eq!(again, json!({ "status": "Migration already canceled." }));
    assert_eq!(h.step(id), Step::Canceled);
}

#[tokio::test]
async fn bad_requests_are_errors() {
    let h = Harness::new();
    let module = api::rpc_module(h.relay.clone());

    let unknown_universe: Result<Value, _> = module
        .call("getAvailableWorlds", params(json!({ "universe": "U9" })))
        .await;
    assert!(unknown_universe.is_err());

    let missing_field: Result<Value, _> = module
        .call("getAvailableTokenId", params(json!({ "universe": "U1" })))
        .await;
    assert!(missing_field.is_err());

    let unknown_migration: Result<Value, _> = module
        .call(
            "pollingMigration",
            params(json!({ "migrationId": "3f0e2b8c-6a0c-4a53-9a8e-0d6c5f3b1a2e" })),
        )
        .await;
    assert!(unknown_migration.is_err());

    let short_signature: Result<Value, _> = module
        .call(
            "continueMigration",
            params(json!({
                "migrationId": "3f0e2b8c-6a0c-4a53-9a8e-0d6c5f3b1a2e",
                "migrationHashSignature": "0x1234",
            })),
        )
        .await;
    assert!(short_signature.is_err());

    let worlds = call(&module, "getAvailableWorlds", json!({ "universe": "U1" })).await;
    assert_eq!(worlds, json!({ "worlds": [ORIGIN_WORLD] }));
}
