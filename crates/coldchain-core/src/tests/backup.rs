use coldchain_types::error::ColdchainError;

use crate::catalog::{CatalogStore, UploadState};
use crate::commands::backup::{self, BackupRequest};
use crate::lock::acquire_lock;
use crate::marker::MarkerStore;
use crate::store::StatePaths;
use crate::testutil::{
    test_config, test_config_with, ts, FailingProducer, RepeatingProducer, StubProducer,
};

#[test]
fn first_run_records_a_pending_full() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let producer = StubProducer::new();
    let report = backup::run(&config, BackupRequest { producer: &producer, now: ts(1, 0) }).unwrap();

    assert_eq!(report.archive.level, 0);
    assert_eq!(report.archive.upload_state, UploadState::Pending);
    assert!(report.archive.local_path.as_ref().unwrap().is_file());
    assert!(report.markers.is_empty());

    let paths = StatePaths::new(config.state_dir());
    let doc = CatalogStore::new(paths.catalog()).load().unwrap();
    assert_eq!(doc.catalog.len(), 1);
    assert_eq!(doc.sequencer.open_chain(), Some(&report.plan.chain_id));
}

#[test]
fn sealing_writes_a_marker_and_the_next_run_starts_over() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config_with(tmp.path(), 2, 1_000_000);
    let producer = StubProducer::new();
    let markers = MarkerStore::new(StatePaths::new(config.state_dir()).markers());

    let mut reports = Vec::new();
    for hour in 0..4 {
        reports.push(
            backup::run(&config, BackupRequest { producer: &producer, now: ts(1, hour) }).unwrap(),
        );
    }
    let levels: Vec<u32> = reports.iter().map(|r| r.archive.level).collect();
    assert_eq!(levels, vec![0, 1, 2, 0]);

    let first_chain = reports[0].plan.chain_id.clone();
    assert_eq!(reports[2].markers, vec![first_chain.clone()]);
    assert!(markers.exists(&first_chain));
    assert_eq!(reports[3].plan.closes, Some(first_chain.clone()));
    assert_ne!(reports[3].plan.chain_id, first_chain);
    assert_eq!(markers.list().unwrap().len(), 1);
}

#[test]
fn producer_failure_leaves_no_trace() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let err = backup::run(&config, BackupRequest { producer: &FailingProducer, now: ts(1, 0) })
        .unwrap_err();
    assert!(matches!(err, ColdchainError::ArchiveProduction(_)));

    let paths = StatePaths::new(config.state_dir());
    assert!(CatalogStore::new(paths.catalog()).load().unwrap().catalog.is_empty());
    // Lock released, so a retry goes through with the same level.
    let report = backup::run(&config, BackupRequest { producer: &StubProducer::new(), now: ts(1, 1) })
        .unwrap();
    assert_eq!(report.archive.level, 0);
}

#[test]
fn concurrent_run_is_refused() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let _held = acquire_lock(&config.state_dir()).unwrap();
    let err = backup::run(&config, BackupRequest { producer: &StubProducer::new(), now: ts(1, 0) })
        .unwrap_err();
    assert!(matches!(err, ColdchainError::Locked(_)));
}

#[test]
fn identical_archive_is_refused_and_its_file_removed() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config_with(tmp.path(), 3, 1_000_000);
    let first = backup::run(&config, BackupRequest { producer: &RepeatingProducer, now: ts(1, 0) })
        .unwrap();
    let kept = first.archive.local_path.clone().unwrap();

    let err = backup::run(&config, BackupRequest { producer: &RepeatingProducer, now: ts(1, 1) })
        .unwrap_err();
    assert!(matches!(err, ColdchainError::DuplicateArchive(_)));

    assert!(kept.is_file());
    let files: Vec<_> = std::fs::read_dir(config.archive_dir())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.is_file())
        .collect();
    assert_eq!(files, vec![kept]);
    let doc = CatalogStore::new(StatePaths::new(config.state_dir()).catalog())
        .load()
        .unwrap();
    assert_eq!(doc.catalog.len(), 1);
    assert_eq!(doc.sequencer.open_chain(), Some(&first.plan.chain_id));
}
