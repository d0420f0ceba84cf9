use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use paddock_core::{Operation, SyncStatus};
use paddock_engine::{
    ConnectivityMonitor, MergedRow, OfflineSync, OfflineWriter, RemoteStore, SyncConfig,
    WriteOutcome,
};
use paddock_harness::{ScriptedRemote, TestRig, init_tracing, row};
use serde_json::json;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn recorder() -> (Arc<Mutex<Vec<SyncStatus>>>, impl Fn(&SyncStatus) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |s: &SyncStatus| sink.lock().unwrap().push(s.clone()))
}

// ============================================================================
// Status broadcast
// ============================================================================

#[test]
fn late_subscriber_gets_current_status() -> TestResult {
    let rig = TestRig::new()?;
    rig.remote.fail_next(1);
    rig.queue()
        .enqueue("animals", Operation::Insert, row(json!({"id": 1})))?;
    rig.engine.process_queue();

    let (seen, listener) = recorder();
    let _sub = rig.engine.status().subscribe(listener);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0], rig.engine.status().current());
    assert_eq!(seen[0].pending_count, 1);
    assert!(seen[0].last_error.is_some());
    Ok(())
}

#[test]
fn drain_publishes_start_and_finish() -> TestResult {
    let rig = TestRig::new()?;
    rig.queue()
        .enqueue("animals", Operation::Insert, row(json!({"id": 1})))?;
    rig.engine.refresh_status()?;

    let (seen, listener) = recorder();
    let _sub = rig.engine.status().subscribe(listener);
    rig.engine.process_queue();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert!(!seen[0].is_syncing);
    assert_eq!(seen[0].pending_count, 1);
    assert!(seen[1].is_syncing);
    assert!(!seen[2].is_syncing);
    assert_eq!(seen[2].pending_count, 0);
    assert!(seen[2].last_sync_at.is_some());
    Ok(())
}

#[test]
fn every_subscriber_sees_the_same_sequence() -> TestResult {
    let rig = TestRig::offline()?;
    let (first, a) = recorder();
    let (second, b) = recorder();
    let _a = rig.engine.status().subscribe(a);
    let _b = rig.engine.status().subscribe(b);

    rig.writer.insert("animals", row(json!({"id": "x"})))?;
    rig.writer.insert("animals", row(json!({"id": "y"})))?;
    rig.go_online();
    rig.engine.process_queue();

    assert_eq!(*first.lock().unwrap(), *second.lock().unwrap());
    assert_eq!(first.lock().unwrap().last().map(|s| s.pending_count), Some(0));
    Ok(())
}

#[test]
fn status_listener_may_write_while_drain_runs() -> TestResult {
    let rig = TestRig::new()?;
    rig.queue()
        .enqueue("animals", Operation::Insert, row(json!({"id": "a1", "pen": "A"})))?;
    rig.engine.refresh_status()?;

    let writer = Arc::new(OfflineWriter::new(Arc::clone(&rig.engine)));
    let fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fired);
    let sub = rig.engine.status().subscribe(move |s: &SyncStatus| {
        if s.is_syncing && !flag.swap(true, Ordering::SeqCst) {
            let outcome = writer.update("animals", &json!("a1"), row(json!({"pen": "B"})));
            assert!(matches!(outcome, Ok(WriteOutcome::Queued(_))));
        }
    });

    let report = rig.engine.process_queue();
    drop(sub);

    assert!(fired.load(Ordering::SeqCst));
    assert_eq!(report.success, 2);
    assert_eq!(rig.pending(), 0);
    assert_eq!(rig.remote.rows("animals")[0]["pen"], json!("B"));
    Ok(())
}

#[test]
fn dropped_subscription_stops_delivery() -> TestResult {
    let rig = TestRig::offline()?;
    let (seen, listener) = recorder();
    let sub = rig.engine.status().subscribe(listener);
    assert_eq!(rig.engine.status().subscriber_count(), 1);
    drop(sub);
    assert_eq!(rig.engine.status().subscriber_count(), 0);

    rig.writer.insert("animals", row(json!({"id": 1})))?;
    assert_eq!(seen.lock().unwrap().len(), 1);
    Ok(())
}

// ============================================================================
// Wired layer
// ============================================================================

#[test]
fn open_persists_queue_across_restarts() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let config = SyncConfig {
        database_path: dir.path().join("farm.db"),
        prefetch_collections: vec!["animals".into()],
        ..SyncConfig::default()
    };
    let remote = ScriptedRemote::new();
    remote.seed("animals", vec![row(json!({"id": "cow-1", "name": "Bluebell"}))]);

    {
        let monitor = Arc::new(ConnectivityMonitor::new(false));
        let remote = Arc::clone(&remote) as Arc<dyn RemoteStore>;
        let sync = OfflineSync::open(&config, remote, monitor)?;
        let outcome = sync
            .writer()
            .update("animals", &json!("cow-1"), row(json!({"pen": "Barn 2"})))?;
        assert!(matches!(outcome, WriteOutcome::Queued(_)));
        assert_eq!(sync.status().current().pending_count, 1);
    }

    let monitor = Arc::new(ConnectivityMonitor::new(false));
    let shared = Arc::clone(&remote) as Arc<dyn RemoteStore>;
    let sync = OfflineSync::open(&config, shared, Arc::clone(&monitor))?;
    assert_eq!(sync.status().current().pending_count, 1);

    let view: Vec<MergedRow> = sync.optimistic_rows("animals")?;
    assert_eq!(view.len(), 1);
    assert!(view[0].is_pending());
    assert_eq!(view[0].row["pen"], json!("Barn 2"));

    monitor.report(true);
    assert_eq!(sync.status().current().pending_count, 0);
    assert_eq!(remote.rows("animals")[0]["pen"], json!("Barn 2"));

    assert!(!sync.prefetch().check_offline_readiness()?.is_ready);
    assert!(sync.prefetch().prefetch_all()?);
    assert!(sync.prefetch().check_offline_readiness()?.is_ready);
    assert!(sync.prefetch_progress().current().is_complete);
    Ok(())
}
