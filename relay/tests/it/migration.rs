use std::time::Duration;

use alloy::{
    primitives::{Address, U256},
    signers::local::PrivateKeySigner,
};
use relay::{
    error::RelayError,
    forge::{MetadataOrigin, TokenMetadata},
    migration::{CancelOutcome, MigrationData, MigrationId, Step},
    test_util::{BLOCK_TIMESTAMP, Call, MockConnector},
};

use crate::{
    Harness, IOU_WORLD, ORIGIN_WORLD, U1_BRIDGE, U2_BRIDGE, config, origin_uri, sign_with,
    wait_until,
};

#[tokio::test]
async fn forward_migration_mints_an_iou() {
    let h = Harness::new();
    let id = h.start_forward(7).await;
    let iou_token_id = h.record(id).data.destination_token_id;

    let escrow_hash = h.escrow(id).await;
    let migration_hash = h.relay.polling_migration(id).unwrap().unwrap();
    assert_eq!(escrow_hash, MockConnector::escrow_hash_for(migration_hash));
    assert_eq!(
        h.u1.owner_of(ORIGIN_WORLD, U256::from(7)),
        Some(U1_BRIDGE),
        "origin token is in escrow"
    );
    assert!(h.relay.polling_end_migration(id).unwrap().is_none());

    h.relay
        .close_migration(id, h.sign(escrow_hash), false)
        .unwrap();
    h.wait_for_step(id, Step::Completed).await;

    let record = h.record(id);
    assert!(record.transaction_hash.is_some());
    assert_eq!(
        h.relay.polling_end_migration(id).unwrap(),
        record.transaction_hash
    );
    assert!(record.last_error.is_none());

    // The IOU carries forged metadata and belongs to the receiver.
    let forged_uri = format!("forged://{id}");
    assert_eq!(
        h.metadata.forged(),
        vec![(origin_uri(U256::from(7)), id)]
    );
    assert_eq!(
        h.u2.token_uri(IOU_WORLD, iou_token_id).as_deref(),
        Some(forged_uri.as_str())
    );
    assert_eq!(
        h.relay.get_destination_token_uri(id).await.unwrap(),
        forged_uri
    );
    assert_eq!(h.u2.owner_of(IOU_WORLD, iou_token_id), Some(h.receiver));
    assert!(h.u2.calls().contains(&Call::MigrateFromIou {
        destination_bridge: U2_BRIDGE,
        origin_bridge: U1_BRIDGE,
        block_timestamp: BLOCK_TIMESTAMP,
    }));
    assert!(h.u1.calls().contains(&Call::RegisterEscrowHashSignature {
        bridge: U1_BRIDGE,
        migration_hash,
    }));

    let token = h
        .db
        .get_preminted_token("U2", IOU_WORLD, iou_token_id)
        .unwrap()
        .unwrap();
    assert!(token.delivered && token.minted);
}

#[tokio::test]
async fn escrow_signature_of_another_wallet_is_refused() {
    let h = Harness::new();
    let id = h.start_forward(7).await;
    let escrow_hash = h.escrow(id).await;

    let stranger = PrivateKeySigner::random();
    h.relay
        .close_migration(id, sign_with(&stranger, escrow_hash), false)
        .unwrap();
    wait_until(|| h.record(id).last_error.is_some()).await;

    let record = h.record(id);
    assert_eq!(record.step, Step::UpdateEscrowHash);
    assert!(record.escrow_hash_signature.is_none());
    assert!(record.last_error.unwrap().contains("expected"));
    assert!(
        !h.u2
            .calls()
            .iter()
            .any(|c| matches!(c, Call::MigrateFromIou { .. }))
    );

    // The owner can still close it.
    h.relay
        .close_migration(id, h.sign(escrow_hash), false)
        .unwrap();
    h.wait_for_step(id, Step::Completed).await;
    assert!(h.record(id).last_error.is_none());
}

#[tokio::test]
async fn cancel_returns_the_token_and_the_reservation() {
    let h = Harness::new();
    let id = h.start_forward(7).await;
    h.wait_for_step(id, Step::AnnonceToBridge).await;
    let migration_hash = h.relay.polling_migration(id).unwrap().unwrap();
    h.relay
        .continue_migration(id, h.sign(migration_hash))
        .unwrap();
    // Keep the migration short of the escrow proof.
    h.u1.fail("get_proof_of_escrow_hash");
    wait_until(|| h.record(id).last_error.is_some()).await;
    assert_eq!(h.step(id), Step::TransferToBridge);

    let outcome = h.relay.cancel_migration(id).await.unwrap();
    assert_eq!(outcome, CancelOutcome::Canceled);
    assert_eq!(h.step(id), Step::Canceled);
    assert_eq!(
        h.u1.owner_of(ORIGIN_WORLD, U256::from(7)),
        Some(h.owner.address())
    );
    assert_eq!(
        h.u1.transfers().last(),
        Some(&Call::SafeTransferFrom {
            world: ORIGIN_WORLD,
            from: U1_BRIDGE,
            to: h.owner.address(),
            token_id: U256::from(7),
        })
    );

    let iou_token_id = h.record(id).data.destination_token_id;
    let token = h
        .db
        .get_preminted_token("U2", IOU_WORLD, iou_token_id)
        .unwrap()
        .unwrap();
    assert!(!token.delivered);
    assert_eq!(h.relay.pool().available("U2", IOU_WORLD).unwrap(), 1);

    // Canceling again changes nothing.
    let transfers = h.u1.transfers().len();
    let outcome = h.relay.cancel_migration(id).await.unwrap();
    assert_eq!(outcome, CancelOutcome::AlreadyCanceled);
    assert_eq!(h.u1.transfers().len(), transfers);

    assert!(matches!(
        h.relay.continue_migration(id, h.sign(migration_hash)),
        Err(RelayError::InvalidStep {
            step: Step::Canceled,
            ..
        })
    ));
}

#[tokio::test]
async fn early_cancel_leaves_the_token_with_its_owner() {
    let h = Harness::new();
    h.u1.fail("migrate_to_erc721_iou");
    let id = h.start_forward(7).await;
    wait_until(|| h.record(id).last_error.is_some()).await;
    assert_eq!(h.step(id), Step::Registered);

    let outcome = h.relay.cancel_migration(id).await.unwrap();
    assert_eq!(outcome, CancelOutcome::Canceled);
    assert_eq!(h.step(id), Step::Canceled);
    assert_eq!(
        h.u1.owner_of(ORIGIN_WORLD, U256::from(7)),
        Some(h.owner.address())
    );
    assert!(h.u1.transfers().is_empty(), "the bridge never held the token");
    assert_eq!(h.relay.pool().available("U2", IOU_WORLD).unwrap(), 1);
}

#[tokio::test]
async fn cancel_is_refused_once_escrow_is_proven() {
    let h = Harness::new();
    let id = h.start_forward(7).await;
    h.escrow(id).await;

    let transfers = h.u1.transfers().len();
    assert!(matches!(
        h.relay.cancel_migration(id).await,
        Err(RelayError::InvalidCancelState(Step::UpdateEscrowHash))
    ));
    assert_eq!(h.step(id), Step::UpdateEscrowHash);
    assert_eq!(h.u1.transfers().len(), transfers);
    assert!(h.record(id).last_error.is_none());
}

/// An IOU on `U2` that stands for token 7 of [ORIGIN_WORLD] on `U1`, owned by the harness owner.
fn iou(h: &Harness, metadata_token_id: u64) -> MigrationData {
    let iou_token_id = U256::from(5);
    let uri = "ipfs://iou/5";
    h.u2.set_owner(IOU_WORLD, iou_token_id, h.owner.address());
    h.u2.set_token_uri_directly(IOU_WORLD, iou_token_id, uri);
    h.metadata.insert(
        uri,
        TokenMetadata {
            migration_data: Some(MetadataOrigin {
                origin_universe: "U1".to_owned(),
                origin_world: ORIGIN_WORLD,
                origin_token_id: U256::from(metadata_token_id),
            }),
            extra: Default::default(),
        },
    );
    h.u1.set_owner(ORIGIN_WORLD, U256::from(7), U1_BRIDGE);

    MigrationData {
        origin_universe: "U2".to_owned(),
        origin_world: IOU_WORLD,
        origin_token_id: iou_token_id,
        origin_owner: h.owner.address(),
        destination_universe: "U1".to_owned(),
        destination_world: ORIGIN_WORLD,
        destination_token_id: U256::from(7),
        destination_owner: h.receiver,
        redeem: true,
    }
}

#[tokio::test]
async fn redeem_returns_the_original_token() {
    let h = Harness::new();
    let id = h.relay.init_migration(iou(&h, 7)).await.unwrap();
    let escrow_hash = h.escrow(id).await;
    assert_eq!(
        h.u2.owner_of(IOU_WORLD, U256::from(5)),
        Some(U2_BRIDGE),
        "IOU is in escrow"
    );

    // The forward close does not apply to a redeem.
    assert!(matches!(
        h.relay.close_migration(id, h.sign(escrow_hash), false),
        Err(RelayError::Validation(_))
    ));

    h.relay
        .close_migration(id, h.sign(escrow_hash), true)
        .unwrap();
    h.wait_for_step(id, Step::Completed).await;

    assert_eq!(h.u1.owner_of(ORIGIN_WORLD, U256::from(7)), Some(h.receiver));
    assert!(h.metadata.forged().is_empty());
    assert!(
        !h.u1
            .calls()
            .iter()
            .any(|c| matches!(c, Call::SetTokenUri { .. }))
    );
    assert!(h.u1.calls().contains(&Call::MigrateFromIou {
        destination_bridge: U1_BRIDGE,
        origin_bridge: U2_BRIDGE,
        block_timestamp: BLOCK_TIMESTAMP,
    }));
    assert!(h.u2.calls().iter().any(|c| matches!(
        c,
        Call::RegisterEscrowHashSignature {
            bridge: U2_BRIDGE,
            ..
        }
    )));
}

#[tokio::test]
async fn redeem_must_match_the_iou_metadata() {
    let h = Harness::new();
    assert!(matches!(
        h.relay.init_migration(iou(&h, 8)).await,
        Err(RelayError::Validation(_))
    ));

    // An IOU whose metadata can't be found is refused as well.
    let mut data = iou(&h, 7);
    data.origin_token_id = U256::from(6);
    h.u2.set_owner(IOU_WORLD, U256::from(6), h.owner.address());
    h.u2.set_token_uri_directly(IOU_WORLD, U256::from(6), "ipfs://iou/6");
    assert!(matches!(
        h.relay.init_migration(data).await,
        Err(RelayError::Metadata(_))
    ));
}

#[tokio::test]
async fn init_checks_the_request_against_the_chains() {
    let h = Harness::new();

    let mut data = h.forward(7, U256::from(1));
    data.origin_owner = Address::repeat_byte(0x99);
    assert!(matches!(
        h.relay.init_migration(data).await,
        Err(RelayError::Validation(_))
    ));

    let data = h.forward(7, U256::from(1));
    h.u1.set_not_erc721(ORIGIN_WORLD);
    assert!(matches!(
        h.relay.init_migration(data).await,
        Err(RelayError::Validation(_))
    ));

    let mut data = h.forward(7, U256::from(1));
    data.destination_universe = "U3".to_owned();
    assert!(matches!(
        h.relay.init_migration(data).await,
        Err(RelayError::NotFound {
            kind: "universe",
            ..
        })
    ));

    let mut data = h.forward(7, U256::from(1));
    data.destination_world = Address::repeat_byte(0x33);
    assert!(matches!(
        h.relay.init_migration(data).await,
        Err(RelayError::NotFound { .. })
    ));

    assert!(h.u1.calls().is_empty());
}

#[tokio::test]
async fn steps_are_refused_out_of_order() {
    let h = Harness::new();
    h.u1.set_announce_delay(Some(Duration::MAX));
    let id = h.start_forward(7).await;
    let signature = h.sign(Default::default());

    assert_eq!(h.step(id), Step::Registered);
    assert!(h.relay.polling_migration(id).unwrap().is_none());
    assert!(h.relay.polling_escrow(id).unwrap().is_none());
    assert!(matches!(
        h.relay.continue_migration(id, signature.clone()),
        Err(RelayError::InvalidStep {
            step: Step::Registered,
            ..
        })
    ));
    assert!(matches!(
        h.relay.close_migration(id, signature.clone(), false),
        Err(RelayError::InvalidStep { .. })
    ));
    assert!(matches!(
        h.relay.get_destination_token_uri(id).await,
        Err(RelayError::InvalidStep { .. })
    ));
    assert!(matches!(
        h.relay.continue_migration(id, vec![0u8; 64].into()),
        Err(RelayError::Validation(_))
    ));
    assert!(matches!(
        h.relay.polling_migration(MigrationId::random()),
        Err(RelayError::NotFound { .. })
    ));
}

#[tokio::test]
async fn announce_timeout_is_kept_on_the_migration() {
    let mut config = config();
    config.event_timeout = Duration::from_millis(50);
    let h = Harness::build(config, None);
    h.u1.set_announce_delay(Some(Duration::MAX));

    let id = h.start_forward(7).await;
    wait_until(|| h.record(id).last_error.is_some()).await;
    let record = h.record(id);
    assert_eq!(record.step, Step::Registered);
    assert!(record.last_error.unwrap().contains("timed out"));
    assert!(record.last_error_at.is_some());

    h.u1.set_announce_delay(None);
    h.relay.retry_migration(id).unwrap();
    h.wait_for_step(id, Step::AnnonceToBridge).await;
    let record = h.record(id);
    assert!(record.migration_hash.is_some());
    assert!(record.last_error.is_none());
}

#[tokio::test]
async fn retry_finishes_an_interrupted_close() {
    let h = Harness::new();
    let id = h.start_forward(7).await;
    let escrow_hash = h.escrow(id).await;
    assert!(matches!(
        h.relay.retry_migration(id),
        Err(RelayError::InvalidStep {
            step: Step::UpdateEscrowHash,
            ..
        })
    ));

    h.u2.fail("migrate_from_iou_erc721_to_erc721");
    h.relay
        .close_migration(id, h.sign(escrow_hash), false)
        .unwrap();
    wait_until(|| h.record(id).last_error.is_some()).await;
    let record = h.record(id);
    assert_eq!(record.step, Step::CloseMigration);
    assert!(record.escrow_hash_signature.is_some());
    assert!(record.transaction_hash.is_none());

    h.u2.heal("migrate_from_iou_erc721_to_erc721");
    h.relay.retry_migration(id).unwrap();
    h.wait_for_step(id, Step::Completed).await;
    assert!(h.record(id).transaction_hash.is_some());
}

#[tokio::test]
async fn artifacts_survive_every_later_step() {
    let h = Harness::new();
    let id = h.start_forward(7).await;
    let escrow_hash = h.escrow(id).await;
    let before = h.record(id);

    h.relay
        .close_migration(id, h.sign(escrow_hash), false)
        .unwrap();
    h.wait_for_step(id, Step::Completed).await;

    let after = h.record(id);
    assert_eq!(after.data, before.data);
    assert_eq!(after.migration_hash, before.migration_hash);
    assert_eq!(after.block_timestamp, before.block_timestamp);
    assert_eq!(after.migration_hash_signature, before.migration_hash_signature);
    assert_eq!(after.escrow_hash, before.escrow_hash);
    assert_eq!(after.created_at, before.created_at);

    // A completed migration has nothing left to drive.
    assert!(h.relay.retry_migration(id).is_err());
    assert!(matches!(
        h.relay.close_migration(id, h.sign(escrow_hash), false),
        Err(RelayError::InvalidStep {
            step: Step::Completed,
            ..
        })
    ));
}

#[tokio::test]
async fn repeated_continue_fetches_the_escrow_proof_again() {
    let h = Harness::new();
    let id = h.start_forward(7).await;
    h.wait_for_step(id, Step::AnnonceToBridge).await;
    let migration_hash = h.relay.polling_migration(id).unwrap().unwrap();

    h.u1.fail("get_proof_of_escrow_hash");
    h.relay
        .continue_migration(id, h.sign(migration_hash))
        .unwrap();
    wait_until(|| h.record(id).last_error.is_some()).await;
    assert_eq!(h.step(id), Step::TransferToBridge);
    let transfers = h.u1.transfers().len();

    h.u1.heal("get_proof_of_escrow_hash");
    h.relay
        .continue_migration(id, h.sign(migration_hash))
        .unwrap();
    h.wait_for_step(id, Step::UpdateEscrowHash).await;
    assert_eq!(h.u1.transfers().len(), transfers, "the token is escrowed once");
    assert!(h.record(id).last_error.is_none());
    assert!(h.relay.polling_escrow(id).unwrap().is_some());

    assert!(matches!(
        h.relay.continue_migration(id, h.sign(migration_hash)),
        Err(RelayError::InvalidStep {
            step: Step::UpdateEscrowHash,
            ..
        })
    ));
}

#[tokio::test]
async fn destination_token_is_bound_to_one_live_migration() {
    let h = Harness::new();
    let iou_token_id = h
        .relay
        .get_available_token_id("U2", IOU_WORLD)
        .await
        .unwrap();
    let first = h
        .relay
        .init_migration(h.forward(7, iou_token_id))
        .await
        .unwrap();

    assert!(matches!(
        h.relay.init_migration(h.forward(8, iou_token_id)).await,
        Err(RelayError::Validation(_))
    ));
    // A token id the relay never handed out.
    assert!(matches!(
        h.relay.init_migration(h.forward(8, U256::from(999))).await,
        Err(RelayError::Validation(_))
    ));

    // Canceling the first migration frees the token.
    h.wait_for_step(first, Step::AnnonceToBridge).await;
    h.relay.cancel_migration(first).await.unwrap();
    let second = h
        .relay
        .init_migration(h.forward(8, iou_token_id))
        .await
        .unwrap();
    assert_eq!(h.record(second).data.destination_token_id, iou_token_id);
    let token = h
        .db
        .get_preminted_token("U2", IOU_WORLD, iou_token_id)
        .unwrap()
        .unwrap();
    assert!(token.delivered);
}

#[tokio::test]
async fn minted_token_cannot_be_bound_again() {
    let h = Harness::new();
    let id = h.start_forward(7).await;
    let escrow_hash = h.escrow(id).await;
    h.relay
        .close_migration(id, h.sign(escrow_hash), false)
        .unwrap();
    h.wait_for_step(id, Step::Completed).await;

    let iou_token_id = h.record(id).data.destination_token_id;
    let token = h
        .db
        .get_preminted_token("U2", IOU_WORLD, iou_token_id)
        .unwrap()
        .unwrap();
    assert!(token.minted);

    let result = h.relay.init_migration(h.forward(8, iou_token_id)).await;
    assert!(
        matches!(&result, Err(RelayError::Validation(message)) if message.contains("minted")),
        "{result:?}"
    );
}
