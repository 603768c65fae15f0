use chrono::{DateTime, Utc};
use coldchain_types::{ArchiveId, ChainId};
use coldchain_vault::{InventoryEntry, InventorySnapshot};

use crate::catalog::{Archive, UploadState};
use crate::reconcile::{encode_description, parse_description, reconcile};
use crate::testutil::{aid, catalog_of, ts, uploaded};

fn entry(remote: &str, size: u64, created: DateTime<Utc>, description: &str) -> InventoryEntry {
    InventoryEntry {
        remote_archive_id: remote.to_string(),
        size_bytes: size,
        created_at: created,
        description: description.to_string(),
    }
}

fn snapshot(date: DateTime<Utc>, archives: Vec<InventoryEntry>) -> InventorySnapshot {
    InventorySnapshot {
        inventory_date: date,
        archives,
    }
}

#[test]
fn description_encodes_identity() {
    let archive = Archive::new(aid(7), ChainId::new("c000003-20240101T000000"), 4, ts(1, 0), 1, None);
    let parsed = parse_description(&encode_description(&archive)).unwrap();
    assert_eq!(parsed.archive_id, aid(7));
    assert_eq!(parsed.chain_id, archive.chain_id);
    assert_eq!(parsed.level, 4);
    assert!(parse_description("tarball from 2019").is_none());
    assert!(parse_description("coldchain:v1:abc:chain:x").is_none());
}

#[test]
fn matching_inventory_is_clean() {
    let mut catalog = catalog_of(vec![uploaded(1, "c1", 0, ts(1, 0), 10)]);
    let report = reconcile(
        &snapshot(ts(2, 0), vec![entry("remote-01", 10, ts(1, 0), "")]),
        &mut catalog,
    )
    .unwrap();
    assert!(report.is_clean());
}

#[test]
fn missing_archive_is_flagged_for_reupload() {
    let mut catalog = catalog_of(vec![
        uploaded(1, "c1", 0, ts(1, 0), 10),
        uploaded(2, "c1", 1, ts(1, 5), 3),
    ]);
    let report = reconcile(
        &snapshot(ts(2, 0), vec![entry("remote-01", 10, ts(1, 0), "")]),
        &mut catalog,
    )
    .unwrap();
    assert_eq!(report.orphans, vec![aid(2)]);
    assert!(report.orphan_chains.contains(&ChainId::new("c1")));
    let orphan = catalog.get(&aid(2)).unwrap();
    assert_eq!(orphan.upload_state, UploadState::Pending);
    assert!(orphan.remote_archive_id.is_none());
    // Local state is kept.
    assert_eq!(catalog.len(), 2);
}

#[test]
fn uploads_newer_than_the_inventory_are_trusted() {
    let mut catalog = catalog_of(vec![uploaded(1, "c1", 0, ts(3, 0), 10)]);
    let report = reconcile(&snapshot(ts(2, 0), vec![]), &mut catalog).unwrap();
    assert!(report.orphans.is_empty());
    assert_eq!(catalog.get(&aid(1)).unwrap().upload_state, UploadState::Uploaded);
}

#[test]
fn lost_upload_is_adopted_from_its_description() {
    let pending = Archive::new(aid(1), ChainId::new("c1"), 0, ts(1, 0), 10, None);
    let description = encode_description(&pending);
    let mut catalog = catalog_of(vec![pending]);
    catalog.hold_for_inventory(&aid(1), ts(1, 2)).unwrap();

    let report = reconcile(
        &snapshot(ts(1, 6), vec![entry("vault-9", 10, ts(1, 1), &description)]),
        &mut catalog,
    )
    .unwrap();
    assert_eq!(report.adopted, vec![aid(1)]);
    assert!(report.ghosts.is_empty());
    let archive = catalog.get(&aid(1)).unwrap();
    assert_eq!(archive.upload_state, UploadState::Uploaded);
    assert_eq!(archive.remote_archive_id.as_deref(), Some("vault-9"));
    assert!(archive.awaiting_inventory_since.is_none());
}

#[test]
fn held_upload_absent_from_inventory_is_released() {
    let pending = Archive::new(aid(1), ChainId::new("c1"), 0, ts(1, 0), 10, None);
    let mut catalog = catalog_of(vec![pending]);
    catalog.hold_for_inventory(&aid(1), ts(1, 2)).unwrap();

    // An inventory older than the hold settles nothing.
    let report = reconcile(&snapshot(ts(1, 1), vec![]), &mut catalog).unwrap();
    assert!(report.released_holds.is_empty());

    let report = reconcile(&snapshot(ts(1, 3), vec![]), &mut catalog).unwrap();
    assert_eq!(report.released_holds, vec![aid(1)]);
    assert!(catalog.get(&aid(1)).unwrap().awaiting_inventory_since.is_none());
}

#[test]
fn unknown_archives_become_ghosts() {
    let mut catalog = catalog_of(vec![]);
    let foreign = Archive::new(aid(5), ChainId::new("c9"), 0, ts(1, 0), 8, None);
    let foreign_inc = Archive::new(aid(6), ChainId::new("c9"), 1, ts(1, 1), 2, None);
    let report = reconcile(
        &snapshot(
            ts(2, 0),
            vec![
                entry("v-inc", 2, ts(1, 1), &encode_description(&foreign_inc)),
                entry("v-full", 8, ts(1, 0), &encode_description(&foreign)),
                entry("v-anon-0123456789abcdef", 4, ts(1, 0), "manual upload"),
            ],
        ),
        &mut catalog,
    )
    .unwrap();
    assert_eq!(report.ghosts.len(), 3);

    // FULL first, so the incremental joins its chain.
    let inc = catalog.get(&aid(6)).unwrap();
    assert_eq!(inc.chain_id, ChainId::new("c9"));
    assert_eq!(inc.level, 1);
    assert_eq!(inc.upload_state, UploadState::Uploaded);

    let anon = catalog
        .get(&ArchiveId::ghost("v-anon-0123456789abcdef"))
        .unwrap();
    assert!(anon.archive_id.is_ghost());
    assert_eq!(anon.level, 0);
    assert!(anon.chain_id.as_str().starts_with("ghost-"));
    assert_eq!(catalog.total_uploaded_size(), 14);
}

#[test]
fn orphaned_incremental_ghost_stands_alone() {
    let mut catalog = catalog_of(vec![]);
    let inc = Archive::new(aid(6), ChainId::new("c9"), 2, ts(1, 1), 2, None);
    let report = reconcile(
        &snapshot(ts(2, 0), vec![entry("v-inc", 2, ts(1, 1), &encode_description(&inc))]),
        &mut catalog,
    )
    .unwrap();
    let ghost = &report.ghosts[0];
    assert_eq!(ghost.level, 0);
    assert_eq!(ghost.archive_id, aid(6));
    assert_eq!(ghost.chain_id, ChainId::ghost("v-inc"));
    assert!(ghost.note.is_some());
}

#[test]
fn second_copy_of_an_uploaded_archive_is_reported_not_adopted() {
    let original = uploaded(1, "c1", 0, ts(1, 0), 10);
    let description = encode_description(&original);
    let mut catalog = catalog_of(vec![original]);
    let report = reconcile(
        &snapshot(
            ts(2, 0),
            vec![
                entry("remote-01", 10, ts(1, 0), &description),
                entry("remote-dup", 10, ts(1, 3), &description),
            ],
        ),
        &mut catalog,
    )
    .unwrap();
    assert_eq!(report.duplicates.len(), 1);
    assert_eq!(report.duplicates[0].remote_archive_id, "remote-dup");
    assert_eq!(
        catalog.get(&aid(1)).unwrap().remote_archive_id.as_deref(),
        Some("remote-01")
    );
}

#[test]
fn size_disagreement_keeps_catalog_size() {
    let mut catalog = catalog_of(vec![uploaded(1, "c1", 0, ts(1, 0), 10)]);
    let report = reconcile(
        &snapshot(ts(2, 0), vec![entry("remote-01", 12, ts(1, 0), "")]),
        &mut catalog,
    )
    .unwrap();
    assert_eq!(report.size_mismatches.len(), 1);
    assert_eq!(report.size_mismatches[0].vault_size, 12);
    assert_eq!(catalog.get(&aid(1)).unwrap().size_bytes, 10);
}

#[test]
fn staged_archives_gone_from_vault_are_confirmed_deleted() {
    let mut catalog = catalog_of(vec![
        uploaded(1, "c1", 0, ts(1, 0), 10),
        uploaded(2, "c1", 1, ts(1, 1), 3),
    ]);
    catalog.stage_chain_deletion(&ChainId::new("c1")).unwrap();
    let report = reconcile(&snapshot(ts(3, 0), vec![]), &mut catalog).unwrap();
    assert_eq!(report.confirmed_deletions, vec![aid(2), aid(1)]);
    assert!(catalog.archives().iter().all(|a| a.upload_state == UploadState::Deleted));
}

#[test]
fn remote_ids_sharing_a_long_prefix_are_separate_ghosts() {
    let mut catalog = catalog_of(vec![]);
    let report = reconcile(
        &snapshot(
            ts(2, 0),
            vec![
                entry("archive-000000001", 4, ts(1, 0), ""),
                entry("archive-000000002", 6, ts(1, 1), ""),
            ],
        ),
        &mut catalog,
    )
    .unwrap();
    assert_eq!(report.ghosts.len(), 2);
    assert!(report.conflicts.is_empty());
    assert_ne!(report.ghosts[0].archive_id, report.ghosts[1].archive_id);
    assert_ne!(report.ghosts[0].chain_id, report.ghosts[1].chain_id);
    assert_eq!(catalog.total_uploaded_size(), 10);
}

#[test]
fn non_ascii_description_is_recorded_and_printable() {
    let mut catalog = catalog_of(vec![]);
    let report = reconcile(
        &snapshot(
            ts(2, 0),
            vec![entry("v-1", 3, ts(1, 0), "coldchain:v1:a\u{e9}\u{e9}\u{e9}\u{e9}\u{e9}\u{e9}\u{e9}\u{e9}\u{e9}\u{e9}:chain-x:0")],
        ),
        &mut catalog,
    )
    .unwrap();
    let ghost = &report.ghosts[0];
    assert_eq!(ghost.chain_id, ChainId::new("chain-x"));
    let shown = format!("{} {:?}", ghost.archive_id, ghost.archive_id);
    assert!(shown.starts_with('a'));
}

#[test]
fn remote_id_listed_twice_is_recorded_once() {
    let mut catalog = catalog_of(vec![]);
    let report = reconcile(
        &snapshot(
            ts(2, 0),
            vec![
                entry("v-twice", 5, ts(1, 0), "manual upload"),
                entry("v-twice", 5, ts(1, 0), "manual upload"),
            ],
        ),
        &mut catalog,
    )
    .unwrap();
    assert_eq!(report.ghosts.len(), 1);
    assert_eq!(report.duplicates.len(), 1);
    assert_eq!(report.duplicates[0].archive_id, ArchiveId::ghost("v-twice"));
    assert!(report.conflicts.is_empty());
    assert_eq!(catalog.len(), 1);
}

#[test]
fn unmergeable_remote_copy_is_a_conflict_not_an_error() {
    // A described FULL already occupies the chain the anonymous copy needs.
    let squatter = Archive::new(aid(5), ChainId::ghost("foreign-x"), 0, ts(1, 0), 8, None);
    let mut catalog = catalog_of(vec![uploaded(1, "c1", 0, ts(1, 0), 10)]);
    let report = reconcile(
        &snapshot(
            ts(2, 0),
            vec![
                entry("remote-01", 10, ts(1, 0), ""),
                entry("v-squat", 8, ts(1, 0), &encode_description(&squatter)),
                entry("foreign-x", 4, ts(1, 2), ""),
            ],
        ),
        &mut catalog,
    )
    .unwrap();
    assert_eq!(report.ghosts.len(), 1);
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].remote_archive_id, "foreign-x");
    assert!(!report.is_clean());
    assert!(catalog.find_by_remote_id("foreign-x").is_none());
    assert_eq!(catalog.total_uploaded_size(), 18);
}
