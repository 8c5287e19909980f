//! Integration tests for the environment lifecycle
//!
//! These exercise the public API end to end against a temporary root, with the external
//! toolchain and process table faked.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use testbox::chain::runner::ChainRunner;
use testbox::chain::suite::SuiteCatalog;
use testbox::config::settings::HarnessConfig;
use testbox::env::registry::{Provisioned, Registry};
use testbox::observability::events::{read_events, EventKind, EVENT_LOG_FILE};
use testbox::safety::lock_manager::LockManager;
use testbox::safety::process::{ProcessProbe, SystemProbe};
use testbox::state::pollution::{PollutionReason, Verdict};
use testbox::testing::{FakeProbe, FnSuite, RecordingToolchain};
use testbox::{EnvError, MarkerStatus, FOUNDATION};

const CHAIN: [&str; 5] = ["00-validate", "01-meta", "02-dist", "03-install", "04-test"];

type Journal = Arc<Mutex<Vec<String>>>;

struct Harness {
    dir: tempfile::TempDir,
    journal: Journal,
    tools: Arc<RecordingToolchain>,
    probe: Arc<FakeProbe>,
    runner: ChainRunner,
}

fn config(dir: &Path) -> HarnessConfig {
    let framework = dir.join("framework-src");
    fs::create_dir_all(&framework).unwrap();
    fs::write(framework.join("base.mk"), b"all:\n").unwrap();
    HarnessConfig {
        root_dir: dir.join("root"),
        framework_repo: framework,
        template_repo: dir.join("template"),
        ..HarnessConfig::default()
    }
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let journal: Journal = Arc::new(Mutex::new(Vec::new()));
    let mut catalog = SuiteCatalog::new();
    for name in CHAIN {
        catalog
            .add_sequential(FnSuite::recording(name, journal.clone()))
            .unwrap();
    }
    catalog
        .add_independent(FnSuite::recording("doc", journal.clone()))
        .unwrap();

    let tools = Arc::new(RecordingToolchain::new());
    let probe = Arc::new(FakeProbe::new(4000));
    let registry = Registry::new(config(dir.path()), catalog, tools.clone(), probe.clone());
    Harness {
        dir,
        journal,
        tools,
        probe,
        runner: ChainRunner::new(registry),
    }
}

fn take(journal: &Journal) -> Vec<String> {
    std::mem::take(&mut *journal.lock().unwrap())
}

#[test]
fn test_resolving_clean_foundation_twice_does_no_work() {
    let h = harness();
    let registry = h.runner.registry();
    assert_eq!(registry.ensure_foundation().unwrap(), Provisioned::Built);
    let built = h.tools.calls().len();
    assert!(built > 0);

    assert_eq!(registry.ensure_foundation().unwrap(), Provisioned::Reused);
    assert_eq!(h.tools.calls().len(), built);
}

#[test]
fn test_start_without_complete_forces_full_rebuild() {
    let h = harness();
    let registry = h.runner.registry();
    registry.ensure_foundation().unwrap();

    let foundation = registry.foundation().unwrap();
    fs::write(foundation.repo().join("stale-artifact"), b"old").unwrap();
    foundation
        .markers(h.probe.as_ref())
        .record_start(FOUNDATION)
        .unwrap();
    assert_eq!(
        registry.detector().evaluate(&foundation, FOUNDATION).unwrap(),
        Verdict::Polluted(PollutionReason::Incomplete)
    );

    h.tools.reset();
    assert_eq!(registry.ensure_foundation().unwrap(), Provisioned::Built);
    assert_eq!(h.tools.count("clone_template"), 1);
    assert!(!foundation.repo().join("stale-artifact").exists());
    assert_eq!(
        registry.detector().evaluate(&foundation, FOUNDATION).unwrap(),
        Verdict::Clean
    );
}

#[test]
fn test_concurrent_acquire_exactly_one_wins() {
    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path().join(".bats-state");
    let probe: Arc<dyn ProcessProbe> = Arc::new(SystemProbe::new());
    let start = Arc::new(Barrier::new(2));
    let hold = Arc::new(Barrier::new(2));

    let workers: Vec<_> = (0..2)
        .map(|_| {
            let locks = LockManager::new(state_dir.clone(), Arc::clone(&probe));
            let start = Arc::clone(&start);
            let hold = Arc::clone(&hold);
            thread::spawn(move || {
                start.wait();
                let result = locks.acquire("sequential");
                let outcome = match &result {
                    Ok(_) => Ok(()),
                    Err(EnvError::Busy { .. }) => Err("busy"),
                    Err(e) => panic!("unexpected error: {}", e),
                };
                // Keep the winner's handle alive until both have tried
                hold.wait();
                drop(result);
                outcome
            })
        })
        .collect();

    let outcomes: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
    assert_eq!(outcomes.iter().filter(|o| o.is_err()).count(), 1);
}

#[test]
fn test_lock_of_dead_process_is_reclaimed() {
    let dir = tempfile::tempdir().unwrap();
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let dead_pid = child.id();
    child.wait().unwrap();

    let locks = LockManager::new(dir.path().to_path_buf(), Arc::new(SystemProbe::new()));
    fs::create_dir_all(locks.lock_dir("doc")).unwrap();
    fs::write(locks.lock_dir("doc").join("pid"), format!("{}\n", dead_pid)).unwrap();

    let handle = locks.acquire("doc").unwrap();
    assert_eq!(handle.reclaimed_from(), Some(dead_pid));
    assert_eq!(locks.owner("doc").unwrap().unwrap().pid, std::process::id());
}

#[test]
fn test_requesting_suite_k_runs_predecessors_in_order() {
    let h = harness();
    h.runner.run("3").unwrap();
    assert_eq!(take(&h.journal), &CHAIN[..4]);

    let seq = h.runner.registry().sequential().unwrap();
    let markers = seq.markers(h.probe.as_ref());
    for unit in &CHAIN[..4] {
        assert_eq!(markers.status(unit).unwrap(), MarkerStatus::Completed);
    }
    assert_eq!(markers.status("04-test").unwrap(), MarkerStatus::Absent);
}

#[test]
fn test_requesting_suite_zero_runs_nothing_else() {
    let h = harness();
    h.runner.run("00-validate").unwrap();
    assert_eq!(take(&h.journal), ["00-validate"]);

    // Re-running it is also self-contained
    h.runner.run("00-validate").unwrap();
    assert_eq!(take(&h.journal), ["00-validate"]);
}

#[test]
fn test_polluted_middle_suite_restarts_whole_chain() {
    let h = harness();
    h.runner.run("04-test").unwrap();
    take(&h.journal);

    let seq = h.runner.registry().sequential().unwrap();
    fs::write(seq.repo().join("torn-write"), b"partial").unwrap();
    seq.markers(h.probe.as_ref()).record_start("02-dist").unwrap();

    h.runner.run("04-test").unwrap();
    assert_eq!(take(&h.journal), CHAIN);
    assert!(!seq.repo().join("torn-write").exists());
}

#[test]
fn test_unit_held_by_live_peer_is_busy_not_reset() {
    let h = harness();
    h.runner.run("01-meta").unwrap();
    take(&h.journal);

    let seq = h.runner.registry().sequential().unwrap();
    seq.markers(h.probe.as_ref()).record_start("02-dist").unwrap();
    let lock_dir = seq.state_dir().join(".lock-02-dist");
    fs::create_dir_all(&lock_dir).unwrap();
    fs::write(lock_dir.join("pid"), b"5000\n").unwrap();
    h.probe.set_alive(5000, true);

    assert!(matches!(
        h.runner.run("03-install"),
        Err(EnvError::Busy { owner_pid: Some(5000), .. })
    ));
    assert!(take(&h.journal).is_empty());
    assert_eq!(
        seq.markers(h.probe.as_ref()).status("01-meta").unwrap(),
        MarkerStatus::Completed
    );

    // Once the peer is gone its work is treated as torn
    h.probe.set_alive(5000, false);
    h.runner.run("03-install").unwrap();
    assert_eq!(take(&h.journal), &CHAIN[..4]);
}

#[test]
fn test_independent_suite_end_to_end() {
    let h = harness();
    let registry = h.runner.registry();

    h.runner.run("doc").unwrap();
    assert_eq!(h.tools.count("clone_template"), 1);
    let doc = registry.resolve("doc").unwrap();
    assert!(doc.repo().join("Makefile").exists());
    assert!(doc.repo().join("ran-doc").exists());
    assert_eq!(
        doc.markers(h.probe.as_ref()).status("doc").unwrap(),
        MarkerStatus::Completed
    );

    // Private tree is rebuilt, foundation is not
    fs::write(doc.repo().join("scratch"), b"x").unwrap();
    h.runner.run("doc").unwrap();
    assert_eq!(h.tools.count("clone_template"), 1);
    assert!(!doc.repo().join("scratch").exists());

    // Unless the foundation itself is polluted
    let foundation = registry.foundation().unwrap();
    foundation
        .markers(h.probe.as_ref())
        .record_start(FOUNDATION)
        .unwrap();
    h.runner.run("doc").unwrap();
    assert_eq!(h.tools.count("clone_template"), 2);
    assert_eq!(take(&h.journal), ["doc", "doc", "doc"]);

    let events = read_events(&h.dir.path().join("root").join(EVENT_LOG_FILE)).unwrap();
    let count = |kind: EventKind| events.iter().filter(|e| e.kind == kind).count();
    assert_eq!(count(EventKind::FoundationBuilt), 2);
    assert_eq!(count(EventKind::EnvironmentDerived), 3);
    assert_eq!(count(EventKind::SuiteCompleted), 3);
    assert_eq!(count(EventKind::PollutionDetected), 1);
}

#[test]
fn test_failed_foundation_build_is_retried_next_invocation() {
    let dir = tempfile::tempdir().unwrap();
    let mut catalog = SuiteCatalog::new();
    catalog.add_independent(FnSuite::new("doc", |_| Ok(()))).unwrap();
    let probe = Arc::new(FakeProbe::new(4000));

    let broken = Arc::new(
        RecordingToolchain::new().failing_at(testbox::BuildStep::Setup),
    );
    let registry = Registry::new(config(dir.path()), catalog, broken, probe.clone());
    let err = ChainRunner::new(registry).run("doc").unwrap_err();
    assert!(matches!(
        err,
        EnvError::Build { step: testbox::BuildStep::Setup, .. }
    ));

    let mut catalog = SuiteCatalog::new();
    catalog.add_independent(FnSuite::new("doc", |_| Ok(()))).unwrap();
    let fixed = Arc::new(RecordingToolchain::new());
    let registry = Registry::new(config(dir.path()), catalog, fixed.clone(), probe);
    let runner = ChainRunner::new(registry);
    runner.run("doc").unwrap();
    assert_eq!(fixed.count("clone_template"), 1);
}
