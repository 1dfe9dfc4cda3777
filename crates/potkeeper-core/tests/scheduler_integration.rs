//! Rotation scheduler integration tests: cold start, overlap and shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FailPoint, FakeRuntime, LABEL, eventually};
use potkeeper_core::docker::ContainerRuntime;
use potkeeper_core::journal::{JournalStatus, RotationJournal};
use potkeeper_core::rotation::RotationContext;
use potkeeper_core::scheduler::{RotationScheduler, SchedulerConfig};
use potkeeper_core::signal::SignalBus;
use tempfile::TempDir;
use tokio::sync::watch;

fn scheduler(runtime: &Arc<FakeRuntime>, root: &std::path::Path, interval: Duration) -> RotationScheduler {
    let ctx = RotationContext::new(
        Arc::clone(runtime) as Arc<dyn ContainerRuntime>,
        SignalBus::new(),
        root,
        Duration::from_secs(5),
    );
    RotationScheduler::new(
        Arc::new(ctx),
        SchedulerConfig {
            interval,
            pot_label: LABEL.to_string(),
            shutdown_grace: Duration::from_millis(100),
        },
    )
}

fn archives(root: &std::path::Path) -> usize {
    std::fs::read_dir(root)
        .unwrap()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tar.gz"))
        .count()
}

#[tokio::test(start_paused = true)]
async fn first_rotation_waits_one_full_interval() {
    let tmp = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    let sched = scheduler(&runtime, tmp.path(), Duration::from_secs(60));
    let (shutdown, rx) = watch::channel(false);
    let task = tokio::spawn(sched.run(rx));

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert_eq!(runtime.call_count("list_containers"), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(runtime.call_count("list_containers"), 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(runtime.call_count("list_containers"), 2);

    shutdown.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn tick_rotates_every_pot() {
    let tmp = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    runtime.add_pot("cowrie01", &["cowrie01"]);
    runtime.add_pot("glastopf", &["web", "db"]);
    let mut sched = scheduler(&runtime, tmp.path(), Duration::from_secs(3600));

    let launched = sched.tick().await;
    assert_eq!(launched, vec!["cowrie01".to_string(), "glastopf".to_string()]);
    sched.wait_idle().await;

    assert_eq!(archives(tmp.path()), 2);
    assert!(sched.in_flight().is_empty());
    assert_eq!(runtime.containers_of("glastopf").len(), 2);
}

#[tokio::test]
async fn pot_still_rotating_is_skipped() {
    let tmp = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    runtime.add_pot("cowrie01", &["cowrie01"]);
    let gate = runtime.gate_commits();
    let mut sched = scheduler(&runtime, tmp.path(), Duration::from_secs(3600));

    assert_eq!(sched.tick().await, vec!["cowrie01".to_string()]);
    assert_eq!(sched.in_flight(), vec!["cowrie01".to_string()]);

    // Previous rotation blocked in commit, so this tick launches nothing.
    assert!(sched.tick().await.is_empty());

    gate.add_permits(1);
    sched.wait_idle().await;
    assert!(sched.in_flight().is_empty());
    assert_eq!(archives(tmp.path()), 1);

    gate.add_permits(1);
    assert_eq!(sched.tick().await, vec!["cowrie01".to_string()]);
    sched.wait_idle().await;
    assert_eq!(runtime.call_count("commit"), 2);
}

#[tokio::test]
async fn failed_listing_skips_the_tick() {
    let tmp = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    runtime.add_pot("cowrie01", &["cowrie01"]);
    runtime.fail(FailPoint::ListContainers);
    let mut sched = scheduler(&runtime, tmp.path(), Duration::from_secs(3600));

    assert!(sched.tick().await.is_empty());
    assert_eq!(runtime.call_count("commit"), 0);

    runtime.heal(FailPoint::ListContainers);
    assert_eq!(sched.tick().await.len(), 1);
    sched.wait_idle().await;
}

#[tokio::test(flavor = "current_thread")]
async fn unreachable_daemon_is_logged_as_an_error() {
    let tmp = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    runtime.add_pot("cowrie01", &["cowrie01"]);
    runtime.stop_daemon();
    let mut sched = scheduler(&runtime, tmp.path(), Duration::from_secs(3600));
    let (logs, _guard) = common::capture_logs();

    assert!(sched.tick().await.is_empty());
    let logs = logs.contents();
    assert!(
        logs.lines()
            .any(|l| l.contains("ERROR") && l.contains("Docker unavailable")),
        "{logs}"
    );
}

#[tokio::test]
async fn one_failing_pot_does_not_block_the_others() {
    let tmp = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    runtime.add_pot("cowrie01", &["cowrie01"]);
    runtime.add_pot("glastopf", &["web"]);
    runtime.fail(FailPoint::Save);
    let mut sched = scheduler(&runtime, tmp.path(), Duration::from_secs(3600));

    assert_eq!(sched.tick().await.len(), 2);
    sched.wait_idle().await;

    let records = RotationJournal::new(tmp.path()).list().unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.status == JournalStatus::Failed));
    assert_eq!(archives(tmp.path()), 0);
}

#[tokio::test]
async fn shutdown_aborts_rotations_past_the_grace_period() {
    let tmp = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    runtime.add_pot("cowrie01", &["cowrie01"]);
    let _gate = runtime.gate_commits();
    let sched = scheduler(&runtime, tmp.path(), Duration::from_millis(50));
    let (shutdown, rx) = watch::channel(false);
    let task = tokio::spawn(sched.run(rx));

    assert!(eventually(Duration::from_secs(5), || runtime.call_count("diff") == 1).await);
    shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("scheduler stops after grace")
        .unwrap();

    // Aborted mid-pipeline: the journal still says in progress, which is
    // what the next start recovers from.
    let records = RotationJournal::new(tmp.path()).list().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, JournalStatus::InProgress);
    assert_eq!(runtime.call_count("commit"), 0);
}
