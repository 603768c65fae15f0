use coldchain_types::error::ColdchainError;
use coldchain_types::ChainId;

use crate::catalog::{
    Archive, ArchiveCatalog, CatalogDocument, CatalogStore, ChainStatus, UploadState,
};
use crate::testutil::{aid, catalog_of, ts, uploaded};

fn pending(id: u8, chain: &str, level: u32) -> Archive {
    Archive::new(aid(id), ChainId::new(chain), level, ts(1, level), 100, None)
}

#[test]
fn record_rejects_duplicates() {
    let mut catalog = ArchiveCatalog::new();
    catalog.record(pending(1, "c1", 0)).unwrap();
    let err = catalog.record(pending(1, "c1", 0)).unwrap_err();
    assert!(matches!(err, ColdchainError::DuplicateArchive(_)));
}

#[test]
fn incremental_needs_a_live_full() {
    let mut catalog = ArchiveCatalog::new();
    let err = catalog.record(pending(2, "c1", 1)).unwrap_err();
    assert!(matches!(err, ColdchainError::ChainIntegrity(_)));

    catalog.record(pending(1, "c1", 0)).unwrap();
    catalog.record(pending(2, "c1", 1)).unwrap();
    let err = catalog.record(pending(3, "c1", 0)).unwrap_err();
    assert!(matches!(err, ColdchainError::ChainIntegrity(_)), "second FULL: {err}");
}

#[test]
fn upload_lifecycle() {
    let mut catalog = catalog_of(vec![pending(1, "c1", 0)]);
    catalog.mark_uploading(&aid(1)).unwrap();
    assert!(catalog.mark_uploaded(&aid(1), "r1", ts(2, 0)).unwrap());
    // Same confirmation again is a no-op.
    assert!(!catalog.mark_uploaded(&aid(1), "r1", ts(3, 0)).unwrap());
    let archive = catalog.get(&aid(1)).unwrap();
    assert_eq!(archive.upload_state, UploadState::Uploaded);
    assert_eq!(archive.uploaded_at, Some(ts(2, 0)));

    let err = catalog.mark_uploaded(&aid(1), "r2", ts(3, 0)).unwrap_err();
    assert!(matches!(err, ColdchainError::ReconciliationConflict(_)));
    assert_eq!(catalog.total_uploaded_size(), 100);
}

#[test]
fn hold_returns_archive_to_pending_with_a_timestamp() {
    let mut catalog = catalog_of(vec![pending(1, "c1", 0)]);
    catalog.mark_uploading(&aid(1)).unwrap();
    catalog.hold_for_inventory(&aid(1), ts(5, 0)).unwrap();
    let archive = catalog.get(&aid(1)).unwrap();
    assert_eq!(archive.upload_state, UploadState::Pending);
    assert_eq!(archive.awaiting_inventory_since, Some(ts(5, 0)));
    assert!(archive.last_error.is_some());

    catalog.release_hold(&aid(1)).unwrap();
    assert!(catalog.get(&aid(1)).unwrap().awaiting_inventory_since.is_none());
}

#[test]
fn chain_deletion_requires_every_member_uploaded() {
    let mut catalog = catalog_of(vec![
        uploaded(1, "c1", 0, ts(1, 0), 10),
        pending(2, "c1", 1),
    ]);
    let err = catalog.stage_chain_deletion(&ChainId::new("c1")).unwrap_err();
    assert!(matches!(err, ColdchainError::ChainIntegrity(_)));
    assert_eq!(catalog.get(&aid(1)).unwrap().upload_state, UploadState::Uploaded);
}

#[test]
fn full_is_deleted_last() {
    let chain = ChainId::new("c1");
    let mut catalog = catalog_of(vec![
        uploaded(1, "c1", 0, ts(1, 0), 10),
        uploaded(2, "c1", 1, ts(1, 1), 5),
        uploaded(3, "c1", 2, ts(1, 2), 5),
    ]);
    let staged = catalog.stage_chain_deletion(&chain).unwrap();
    assert_eq!(staged.len(), 3);
    assert_eq!(catalog.total_uploaded_size(), 0);
    assert_eq!(catalog.chains_pending_deletion(), vec![chain.clone()]);

    let err = catalog.mark_deleted(&aid(1)).unwrap_err();
    assert!(matches!(err, ColdchainError::ChainIntegrity(_)));

    catalog.mark_deleted(&aid(3)).unwrap();
    catalog.mark_deleted(&aid(2)).unwrap();
    catalog.mark_deleted(&aid(1)).unwrap();
    // Repeated confirmation is harmless.
    catalog.mark_deleted(&aid(1)).unwrap();

    let summary = &catalog.chains()[0];
    assert_eq!(summary.status, ChainStatus::Deleted);
    assert!(catalog.chains_pending_deletion().is_empty());
}

#[test]
fn deleted_chain_cannot_be_reuploaded() {
    let mut catalog = catalog_of(vec![uploaded(1, "c1", 0, ts(1, 0), 10)]);
    catalog.stage_chain_deletion(&ChainId::new("c1")).unwrap();
    let err = catalog.mark_pending(&aid(1), None).unwrap_err();
    assert!(matches!(err, ColdchainError::ChainIntegrity(_)));
}

#[test]
fn chain_summaries_track_status() {
    let catalog = catalog_of(vec![
        uploaded(1, "c1", 0, ts(1, 0), 10),
        uploaded(2, "c1", 1, ts(1, 1), 5),
        pending(3, "c2", 0),
    ]);
    let chains = catalog.chains();
    assert_eq!(chains.len(), 2);
    assert_eq!(chains[0].chain_id, ChainId::new("c1"));
    assert_eq!(chains[0].status, ChainStatus::Uploaded);
    assert_eq!(chains[0].size_bytes, 15);
    assert_eq!(chains[0].max_level, 1);
    assert_eq!(chains[0].full_created_at, Some(ts(1, 0)));
    assert_eq!(chains[1].status, ChainStatus::Pending);
}

#[test]
fn store_round_trips_and_starts_empty() {
    let tmp = tempfile::tempdir().unwrap();
    let store = CatalogStore::new(tmp.path().join("catalog.json"));
    let empty = store.load().unwrap();
    assert!(empty.catalog.is_empty());
    assert_eq!(empty.version, 1);

    let mut doc = CatalogDocument::default();
    doc.catalog.record(uploaded(1, "c1", 0, ts(1, 0), 10)).unwrap();
    doc.sequencer.chain_counter = 4;
    store.save(&doc).unwrap();
    assert_eq!(store.load().unwrap(), doc);
}

#[test]
fn unknown_catalog_version_is_corrupt_state() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("catalog.json");
    std::fs::write(&path, r#"{"version": 9}"#).unwrap();
    let err = CatalogStore::new(&path).load().unwrap_err();
    assert!(matches!(err, ColdchainError::CorruptState { .. }));

    std::fs::write(&path, "not json").unwrap();
    let err = CatalogStore::new(&path).load().unwrap_err();
    assert!(matches!(err, ColdchainError::CorruptState { .. }));
}
