//! Reset, chain removal and bulk re-signing after an incident.

use std::sync::Arc;

use chrono::Duration;
use protected_log::audit::entry::{EVENT_CHAIN_REMOVED, EVENT_LOG_RESET};
use protected_log::audit::{open_bundle, FailureCause, ResetOutcome, SigningSummary};
use protected_log::database::{LogStore, MemoryLogStore};
use protected_log::error::ProtectedLogError;

mod common;
use common::*;

#[tokio::test]
async fn test_reset_after_tampering_verifies_clean() {
    let store = Arc::new(MemoryLogStore::new());
    let device = create_test_device(protected_config("node-1"), store.clone(), create_test_key_ring());
    write_events(&device, 4).await;

    store
        .tamper("node-1", 2, |entry| entry.comment = "nothing happened".to_string())
        .unwrap();
    let report = device.verify_entire_log(Duration::hours(1)).await.unwrap();
    assert_eq!(report.cause, FailureCause::ModifiedLogRow);

    let outcome = device.reset_entire_log(false, "tampering confirmed").await.unwrap();
    let genesis = match outcome {
        ResetOutcome::Reset {
            removed_entries,
            epoch,
            genesis,
        } => {
            assert_eq!(removed_entries, 5);
            assert_eq!(epoch, 1);
            genesis
        }
        ResetOutcome::AlreadyReset => panic!("log was not reset"),
    };
    assert!(genesis.is_genesis());
    assert_eq!(genesis.event_kind, EVENT_LOG_RESET);

    let tail = store.newest_entry(None).await.unwrap().unwrap();
    assert!(tail.is_checkpoint());
    assert_eq!(store.count().await.unwrap(), 1);

    let report = device.verify_entire_log(Duration::hours(1)).await.unwrap();
    assert_eq!(report.cause, FailureCause::VerifySuccess);

    let entry = device.log(admin_event("after reset")).await.unwrap();
    assert_eq!(entry.sequence_number, 1);
    let report = device.verify_entire_log(Duration::hours(1)).await.unwrap();
    assert_eq!(report.cause, FailureCause::VerifySuccess);
}

#[tokio::test]
async fn test_reset_is_idempotent() {
    let store = Arc::new(MemoryLogStore::new());
    let device = create_test_device(protected_config("node-1"), store.clone(), create_test_key_ring());
    write_events(&device, 2).await;

    let first = device.reset_entire_log(false, "decommission").await.unwrap();
    assert!(matches!(first, ResetOutcome::Reset { .. }));

    let second = device.reset_entire_log(false, "decommission").await.unwrap();
    assert_eq!(second, ResetOutcome::AlreadyReset);
    assert_eq!(store.reset_epoch().await.unwrap(), 1);
}

#[tokio::test]
async fn test_reset_survives_session_restart() {
    let store = Arc::new(MemoryLogStore::new());
    let ring = create_test_key_ring();
    let first = create_test_device(protected_config("node-1"), store.clone(), ring.clone());
    write_events(&first, 2).await;

    let outcome = first.reset_entire_log(false, "decommission").await.unwrap();
    assert!(matches!(outcome, ResetOutcome::Reset { epoch: 1, .. }));
    first.shutdown().await.unwrap();
    assert_eq!(store.count().await.unwrap(), 2);

    let second = create_test_device(protected_config("node-1"), store.clone(), ring);
    let outcome = second.reset_entire_log(false, "decommission").await.unwrap();
    assert_eq!(outcome, ResetOutcome::AlreadyReset);
    assert_eq!(store.reset_epoch().await.unwrap(), 1);
    assert_eq!(store.count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_reset_exports_remainder_first() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryLogStore::new());
    let ring = create_test_key_ring();
    let device = create_test_device(
        with_export(protected_config("node-1"), dir.path()),
        store.clone(),
        ring.clone(),
    );
    write_events(&device, 3).await;

    device.reset_entire_log(false, "planned").await.unwrap();

    let bundles: Vec<_> = std::fs::read_dir(dir.path().join("bundles"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(bundles.len(), 1);
    let slice = open_bundle(&bundles[0], ring.as_ref()).await.unwrap();
    assert_eq!(slice.entry_count(), 4);
    assert_eq!(slice.epoch, 0);

    // The cursor of the old epoch does not hide the new genesis.
    let receipt = device.export_log().await.unwrap().unwrap();
    assert_eq!(receipt.entry_count, 1);
    assert_eq!(receipt.cursor.epoch, 1);
}

#[tokio::test]
async fn test_reset_aborts_when_export_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryLogStore::new());
    let device = create_test_device(
        with_export(protected_config("node-1"), dir.path()),
        store.clone(),
        create_test_key_ring(),
    );
    write_events(&device, 3).await;
    store.delete_entry("node-1", 1).unwrap();

    let result = device.reset_entire_log(false, "planned").await;
    assert!(matches!(result, Err(ProtectedLogError::Integrity { .. })));
    assert_eq!(store.count().await.unwrap(), 3);

    let outcome = device.reset_entire_log(true, "forced").await.unwrap();
    assert!(matches!(outcome, ResetOutcome::Reset { removed_entries: 3, .. }));
}

#[tokio::test]
async fn test_remove_decommissioned_node() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryLogStore::new());
    let ring = create_test_key_ring();

    let retired = create_test_device(protected_config("node-a"), store.clone(), ring.clone());
    write_events(&retired, 3).await;

    let operator = create_test_device(
        with_export(protected_config("node-b"), dir.path()),
        store.clone(),
        ring,
    );
    write_events(&operator, 1).await;
    operator.export_log().await.unwrap().unwrap();
    assert!(operator.verify_entire_log(Duration::hours(1)).await.unwrap().is_success());

    let removed = operator.remove_node_chain("node-a").await.unwrap();
    assert_eq!(removed, 4);
    assert_eq!(store.node_ids().await.unwrap(), vec!["node-b"]);

    let tail = store.newest_entry(Some("node-b")).await.unwrap().unwrap();
    assert_eq!(tail.event_kind, EVENT_CHAIN_REMOVED);

    let report = operator.verify_entire_log(Duration::hours(1)).await.unwrap();
    assert_eq!(report.cause, FailureCause::VerifySuccess);

    let destination = operator.config().export_path.as_deref().unwrap();
    let cursor = store.load_cursor(destination).await.unwrap().unwrap();
    assert!(cursor.boundary("node-a").is_none());
}

#[tokio::test]
async fn test_node_cannot_remove_own_chain() {
    let store = Arc::new(MemoryLogStore::new());
    let device = create_test_device(protected_config("node-1"), store.clone(), create_test_key_ring());
    write_events(&device, 1).await;

    assert!(matches!(
        device.remove_node_chain("node-1").await,
        Err(ProtectedLogError::Misuse(_))
    ));
    assert_eq!(store.count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_force_resign_replaces_stale_signatures() {
    let store = Arc::new(MemoryLogStore::new());
    let writer = create_test_device(protected_config("node-a"), store.clone(), create_test_key_ring());
    write_events(&writer, 2).await;

    // A new CA key replaced the one the chain was signed with.
    let operator = create_test_device(protected_config("node-b"), store.clone(), create_test_key_ring());
    let report = operator.verify_entire_log(Duration::hours(1)).await.unwrap();
    assert_eq!(report.cause, FailureCause::UnverifiableChain);

    let summary = operator.sign_all_unsigned_chains(false).await.unwrap();
    assert_eq!(summary, SigningSummary::default());

    let summary = operator.sign_all_unsigned_chains(true).await.unwrap();
    assert_eq!(summary.signatures_replaced, 3);
    assert_eq!(summary.chains_signed, 0);

    let report = operator.verify_entire_log(Duration::hours(1)).await.unwrap();
    assert_eq!(report.cause, FailureCause::VerifySuccess);
}

#[tokio::test]
async fn test_resign_skips_modified_tail() {
    let store = Arc::new(MemoryLogStore::new());
    let writer = create_test_device(unprotected_config("node-a"), store.clone(), create_test_key_ring());
    write_events(&writer, 2).await;
    store
        .tamper("node-a", 2, |entry| entry.comment = "nothing happened".to_string())
        .unwrap();

    let operator = create_test_device(protected_config("node-b"), store.clone(), create_test_key_ring());
    let summary = operator.sign_all_unsigned_chains(false).await.unwrap();
    assert_eq!(summary.chains_signed, 0);

    let tail = store.newest_entry(Some("node-a")).await.unwrap().unwrap();
    assert!(tail.protection.is_none());
}
