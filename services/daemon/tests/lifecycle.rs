//! Integration tests for the instance lifecycle.
//!
//! Every test runs a full daemon (registry, vault and event loop) on top of
//! the mock platform in a temporary data directory.

mod common;

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use tokio::sync::mpsc;

use vmhost_daemon::daemon::{CreateRequest, InstanceState, ResizeRequest};
use vmhost_daemon::platform::mock::MockStats;
use vmhost_daemon::platform::{DriverState, MockPlatform, ResourceSpec};
use vmhost_daemon::DaemonError;

use common::{
    start_daemon, wait_for_state, CountingSource, GENERATED_NAME, IMAGE, PRIVATE_KEY,
};

fn named(name: &str) -> CreateRequest {
    CreateRequest {
        name: Some(name.to_string()),
        image: IMAGE.to_string(),
        ..CreateRequest::default()
    }
}

#[tokio::test]
async fn test_create_stop_start() {
    let dir = tempfile::tempdir().unwrap();
    let platform = MockPlatform::new();
    let source = Arc::new(CountingSource::new());
    let daemon = start_daemon(dir.path(), &platform, &source).await;

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let request = CreateRequest {
        image: IMAGE.to_string(),
        ..CreateRequest::default()
    };
    let info = daemon.create(request, Some(progress_tx)).await.unwrap();
    assert_eq!(info.name, GENERATED_NAME);
    assert_eq!(info.state, InstanceState::Running);
    assert!(info.address.is_some());
    assert!(!info.deleted);
    assert_eq!(platform.vm_state(GENERATED_NAME), Some(DriverState::Running));

    let mut progress = Vec::new();
    while let Ok(message) = progress_rx.try_recv() {
        progress.push(message);
    }
    assert_eq!(progress.first().map(String::as_str), Some("Retrieving image noble"));
    assert!(progress.iter().any(|m| m == "Starting instance"));

    let hash = info.image_hash.clone().unwrap();
    assert_eq!(daemon.vault().ref_count(&hash).await, Some(1));

    let info = daemon.stop(GENERATED_NAME).await.unwrap();
    assert_eq!(info.state, InstanceState::Off);
    assert!(info.address.is_none());
    assert_eq!(platform.vm_state(GENERATED_NAME), Some(DriverState::Off));

    let info = daemon.start(GENERATED_NAME).await.unwrap();
    assert_eq!(info.state, InstanceState::Running);
    assert!(info.address.is_some());

    // The image is fetched once for the whole lifecycle
    assert_eq!(source.resolves(), 1);
    assert_eq!(daemon.vault().ref_count(&hash).await, Some(1));
}

#[tokio::test]
async fn test_generation_increases_with_every_transition() {
    let dir = tempfile::tempdir().unwrap();
    let platform = MockPlatform::new();
    let source = Arc::new(CountingSource::new());
    let daemon = start_daemon(dir.path(), &platform, &source).await;

    let created = daemon.create(named("foo"), None).await.unwrap();
    let stopped = daemon.stop("foo").await.unwrap();
    let started = daemon.start("foo").await.unwrap();
    assert!(stopped.generation > created.generation);
    assert!(started.generation > stopped.generation);
}

#[tokio::test]
async fn test_duplicate_name_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let platform = MockPlatform::new();
    let source = Arc::new(CountingSource::new());
    let daemon = start_daemon(dir.path(), &platform, &source).await;

    daemon.create(named("foo"), None).await.unwrap();
    let err = daemon.create(named("foo"), None).await.unwrap_err();
    assert!(matches!(err, DaemonError::NameConflict(_)));
    assert_eq!(daemon.list().await.len(), 1);
    assert_eq!(MockStats::get(&platform.stats().creates), 1);
}

#[tokio::test]
async fn test_invalid_create_requests_touch_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let platform = MockPlatform::new();
    let source = Arc::new(CountingSource::new());
    let daemon = start_daemon(dir.path(), &platform, &source).await;

    let err = daemon.create(named("foo_bar"), None).await.unwrap_err();
    assert!(matches!(err, DaemonError::InvalidName { .. }));

    let request = CreateRequest {
        resources: ResourceSpec {
            cpus: 0,
            ..ResourceSpec::default()
        },
        ..named("foo")
    };
    let err = daemon.create(request, None).await.unwrap_err();
    assert!(matches!(err, DaemonError::InvalidResources(_)));

    let err = daemon.start("ghost").await.unwrap_err();
    assert!(matches!(err, DaemonError::NameUnknown(_)));

    assert!(daemon.list().await.is_empty());
    assert_eq!(source.resolves(), 0);
}

#[tokio::test]
async fn test_unknown_image_fails_create() {
    let dir = tempfile::tempdir().unwrap();
    let platform = MockPlatform::new();
    let source = Arc::new(CountingSource::new());
    let daemon = start_daemon(dir.path(), &platform, &source).await;

    let request = CreateRequest {
        image: "plan9".to_string(),
        ..named("foo")
    };
    let err = daemon.create(request, None).await.unwrap_err();
    assert!(matches!(err, DaemonError::ImageNotFound(_)));
    assert!(daemon.list().await.is_empty());
}

#[tokio::test]
async fn test_concurrent_commands_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let platform = MockPlatform::new();
    let source = Arc::new(CountingSource::new());
    let daemon = start_daemon(dir.path(), &platform, &source).await;

    daemon.create(named("foo"), None).await.unwrap();
    daemon.stop("foo").await.unwrap();

    platform.set_op_delay(Duration::from_millis(100));
    let (first, second) = tokio::join!(daemon.start("foo"), daemon.start("foo"));

    let results = [first, second];
    let refused = results
        .iter()
        .filter(|r| matches!(r, Err(DaemonError::OperationInProgress { .. })))
        .count();
    let started = results
        .iter()
        .filter(|r| matches!(r, Ok(info) if info.state == InstanceState::Running))
        .count();
    assert_eq!(refused, 1);
    assert_eq!(started, 1);
    assert_eq!(MockStats::get(&platform.stats().starts), 2);
}

#[tokio::test]
async fn test_noop_commands() {
    let dir = tempfile::tempdir().unwrap();
    let platform = MockPlatform::new();
    let source = Arc::new(CountingSource::new());
    let daemon = start_daemon(dir.path(), &platform, &source).await;

    let created = daemon.create(named("foo"), None).await.unwrap();
    let info = daemon.start("foo").await.unwrap();
    assert_eq!(info.state, InstanceState::Running);
    assert_eq!(info.generation, created.generation);

    let stopped = daemon.stop("foo").await.unwrap();
    let info = daemon.stop("foo").await.unwrap();
    assert_eq!(info.state, InstanceState::Off);
    assert_eq!(info.generation, stopped.generation);
    assert_eq!(MockStats::get(&platform.stats().stops), 1);
}

#[tokio::test]
async fn test_suspend_and_resume() {
    let dir = tempfile::tempdir().unwrap();
    let platform = MockPlatform::new();
    let source = Arc::new(CountingSource::new());
    let daemon = start_daemon(dir.path(), &platform, &source).await;

    daemon.create(named("foo"), None).await.unwrap();

    let info = daemon.suspend("foo").await.unwrap();
    assert_eq!(info.state, InstanceState::Suspended);
    assert!(info.address.is_none());
    assert_eq!(platform.vm_state("foo"), Some(DriverState::Suspended));

    // Suspending a suspended instance changes nothing
    let again = daemon.suspend("foo").await.unwrap();
    assert_eq!(again.generation, info.generation);

    let err = daemon.restart("foo").await.unwrap_err();
    assert!(matches!(err, DaemonError::InvalidStateTransition { .. }));

    let info = daemon.start("foo").await.unwrap();
    assert_eq!(info.state, InstanceState::Running);
    assert!(info.address.is_some());
    assert_eq!(MockStats::get(&platform.stats().resumes), 1);

    daemon.suspend("foo").await.unwrap();
    let info = daemon.stop("foo").await.unwrap();
    assert_eq!(info.state, InstanceState::Off);
}

#[tokio::test]
async fn test_suspend_unsupported_by_backend() {
    let dir = tempfile::tempdir().unwrap();
    let platform = MockPlatform::without_suspend();
    let source = Arc::new(CountingSource::new());
    let daemon = start_daemon(dir.path(), &platform, &source).await;

    let created = daemon.create(named("foo"), None).await.unwrap();
    let err = daemon.suspend("foo").await.unwrap_err();
    assert!(matches!(err, DaemonError::Unsupported(_)));

    let info = daemon.info("foo").await.unwrap();
    assert_eq!(info.state, InstanceState::Running);
    assert_eq!(info.generation, created.generation);
}

#[tokio::test]
async fn test_suspend_requires_running() {
    let dir = tempfile::tempdir().unwrap();
    let platform = MockPlatform::new();
    let source = Arc::new(CountingSource::new());
    let daemon = start_daemon(dir.path(), &platform, &source).await;

    daemon.create(named("foo"), None).await.unwrap();
    daemon.stop("foo").await.unwrap();
    let err = daemon.suspend("foo").await.unwrap_err();
    assert_eq!(err.code(), "invalid_state_transition");
}

#[tokio::test]
async fn test_restart() {
    let dir = tempfile::tempdir().unwrap();
    let platform = MockPlatform::new();
    let source = Arc::new(CountingSource::new());
    let daemon = start_daemon(dir.path(), &platform, &source).await;

    let created = daemon.create(named("foo"), None).await.unwrap();
    let info = daemon.restart("foo").await.unwrap();
    assert_eq!(info.state, InstanceState::Running);
    assert!(info.generation > created.generation);
    assert_eq!(MockStats::get(&platform.stats().stops), 1);
    assert_eq!(MockStats::get(&platform.stats().starts), 2);

    daemon.stop("foo").await.unwrap();
    let info = daemon.restart("foo").await.unwrap();
    assert_eq!(info.state, InstanceState::Running);
    assert_eq!(MockStats::get(&platform.stats().stops), 2);
}

#[tokio::test]
async fn test_failed_start_reverts_to_off() {
    let dir = tempfile::tempdir().unwrap();
    let platform = MockPlatform::new();
    let source = Arc::new(CountingSource::new());
    let daemon = start_daemon(dir.path(), &platform, &source).await;

    daemon.create(named("foo"), None).await.unwrap();
    daemon.stop("foo").await.unwrap();

    platform.set_fail_starts(true);
    let err = daemon.start("foo").await.unwrap_err();
    assert!(matches!(err, DaemonError::Backend(_)));

    let info = daemon.info("foo").await.unwrap();
    assert_eq!(info.state, InstanceState::Off);

    platform.set_fail_starts(false);
    let info = daemon.start("foo").await.unwrap();
    assert_eq!(info.state, InstanceState::Running);
}

#[tokio::test]
async fn test_failed_stop_keeps_instance_running() {
    let dir = tempfile::tempdir().unwrap();
    let platform = MockPlatform::new();
    let source = Arc::new(CountingSource::new());
    let daemon = start_daemon(dir.path(), &platform, &source).await;

    daemon.create(named("foo"), None).await.unwrap();
    platform.set_fail_stops(true);
    daemon.stop("foo").await.unwrap_err();

    let info = daemon.info("foo").await.unwrap();
    assert_eq!(info.state, InstanceState::Running);
    assert!(info.address.is_some());
}

#[tokio::test]
async fn test_failed_restart_lands_on_backend_state() {
    let dir = tempfile::tempdir().unwrap();
    let platform = MockPlatform::new();
    let source = Arc::new(CountingSource::new());
    let daemon = start_daemon(dir.path(), &platform, &source).await;

    let created = daemon.create(named("foo"), None).await.unwrap();
    platform.set_fail_starts(true);
    let err = daemon.restart("foo").await.unwrap_err();
    assert!(matches!(err, DaemonError::Backend(_)));

    // The stop half went through, so the guest is down
    let info = daemon.info("foo").await.unwrap();
    assert_eq!(info.state, InstanceState::Off);
    assert!(info.address.is_none());
    assert!(info.generation > created.generation);
    assert_eq!(platform.vm_state("foo"), Some(DriverState::Off));

    platform.set_fail_starts(false);
    let info = daemon.start("foo").await.unwrap();
    assert_eq!(info.state, InstanceState::Running);
}

#[tokio::test]
async fn test_failed_suspend_reverts_to_running() {
    let dir = tempfile::tempdir().unwrap();
    let platform = MockPlatform::new();
    let source = Arc::new(CountingSource::new());
    let daemon = start_daemon(dir.path(), &platform, &source).await;

    let created = daemon.create(named("foo"), None).await.unwrap();
    platform.set_fail_suspends(true);
    let err = daemon.suspend("foo").await.unwrap_err();
    assert!(matches!(err, DaemonError::Backend(_)));

    let info = daemon.info("foo").await.unwrap();
    assert_eq!(info.state, InstanceState::Running);
    assert_eq!(info.address, created.address);
    assert_eq!(platform.vm_state("foo"), Some(DriverState::Running));
    assert_eq!(MockStats::get(&platform.stats().suspends), 0);

    platform.set_fail_suspends(false);
    let info = daemon.suspend("foo").await.unwrap();
    assert_eq!(info.state, InstanceState::Suspended);
}

#[tokio::test]
async fn test_failed_create_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let platform = MockPlatform::new();
    let source = Arc::new(CountingSource::new());
    let daemon = start_daemon(dir.path(), &platform, &source).await;

    platform.set_fail_creates(true);
    let err = daemon.create(named("foo"), None).await.unwrap_err();
    assert_eq!(err.code(), "backend_failure");

    assert!(daemon.list().await.is_empty());
    assert!(matches!(
        daemon.info("foo").await,
        Err(DaemonError::NameUnknown(_))
    ));
    assert_eq!(platform.removed(), vec!["foo".to_string()]);

    let entries = daemon.vault().entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].ref_count, 0);

    // The name is free again
    platform.set_fail_creates(false);
    let info = daemon.create(named("foo"), None).await.unwrap();
    assert_eq!(info.state, InstanceState::Running);
}

#[tokio::test]
async fn test_crash_is_noticed() {
    let dir = tempfile::tempdir().unwrap();
    let platform = MockPlatform::new();
    let source = Arc::new(CountingSource::new());
    let daemon = start_daemon(dir.path(), &platform, &source).await;

    daemon.create(named("foo"), None).await.unwrap();
    platform.crash("foo");

    let info = wait_for_state(&daemon, "foo", InstanceState::Off).await;
    assert!(info.address.is_none());

    let info = daemon.start("foo").await.unwrap();
    assert_eq!(info.state, InstanceState::Running);
}

#[tokio::test]
async fn test_exit_of_previous_run_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let platform = MockPlatform::new();
    let source = Arc::new(CountingSource::new());
    let daemon = start_daemon(dir.path(), &platform, &source).await;

    daemon.create(named("foo"), None).await.unwrap();
    daemon.stop("foo").await.unwrap();
    let started = daemon.start("foo").await.unwrap();

    // Let the watcher of the first run report its exit
    tokio::time::sleep(Duration::from_millis(50)).await;

    let info = daemon.info("foo").await.unwrap();
    assert_eq!(info.state, InstanceState::Running);
    assert_eq!(info.generation, started.generation);
}

#[tokio::test]
async fn test_reconcile_picks_up_late_address() {
    let dir = tempfile::tempdir().unwrap();
    let platform = MockPlatform::new();
    let source = Arc::new(CountingSource::new());
    let daemon = start_daemon(dir.path(), &platform, &source).await;

    platform.set_addresses_ready(false);
    let info = daemon.create(named("foo"), None).await.unwrap();
    assert_eq!(info.state, InstanceState::Running);
    assert!(info.address.is_none());

    let err = daemon.ssh_info("foo").await.unwrap_err();
    assert!(matches!(err, DaemonError::OperationInProgress { .. }));

    platform.set_addresses_ready(true);
    daemon.reconcile().await;

    let mut address = None;
    for _ in 0..100 {
        address = daemon.info("foo").await.unwrap().address;
        if address.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(address.is_some());
}

#[tokio::test]
async fn test_reconcile_notices_exit() {
    let dir = tempfile::tempdir().unwrap();
    let platform = MockPlatform::new();
    let source = Arc::new(CountingSource::new());
    let daemon = start_daemon(dir.path(), &platform, &source).await;

    daemon.create(named("foo"), None).await.unwrap();
    platform.power_off_all();
    daemon.reconcile().await;

    wait_for_state(&daemon, "foo", InstanceState::Off).await;
}

#[tokio::test]
async fn test_unhealthy_backend_refuses_lifecycle_commands() {
    let dir = tempfile::tempdir().unwrap();
    let platform = MockPlatform::new();
    platform.set_healthy(false);
    let source = Arc::new(CountingSource::new());
    let daemon = start_daemon(dir.path(), &platform, &source).await;

    assert!(!daemon.backend_healthy());
    let err = daemon.create(named("foo"), None).await.unwrap_err();
    assert!(matches!(err, DaemonError::BackendUnhealthy(_)));

    // Read-only commands keep working
    assert!(daemon.list().await.is_empty());
    assert!(!daemon.version().is_empty());
    assert_eq!(source.resolves(), 0);
}

#[tokio::test]
async fn test_trash_recover_purge() {
    let dir = tempfile::tempdir().unwrap();
    let platform = MockPlatform::new();
    let source = Arc::new(CountingSource::new());
    let daemon = start_daemon(dir.path(), &platform, &source).await;

    let created = daemon.create(named("foo"), None).await.unwrap();
    let hash = created.image_hash.clone().unwrap();

    let info = daemon.trash("foo", false).await.unwrap();
    assert_eq!(info.state, InstanceState::Off);
    assert!(info.deleted);
    assert_eq!(platform.vm_state("foo"), Some(DriverState::Off));

    let err = daemon.start("foo").await.unwrap_err();
    assert!(matches!(err, DaemonError::InvalidStateTransition { .. }));

    // Trashing twice changes nothing
    let again = daemon.trash("foo", false).await.unwrap();
    assert_eq!(again.generation, info.generation);

    let info = daemon.recover("foo").await.unwrap();
    assert!(!info.deleted);
    let info = daemon.start("foo").await.unwrap();
    assert_eq!(info.state, InstanceState::Running);

    daemon.trash("foo", false).await.unwrap();
    let purged = daemon.purge(&[]).await.unwrap();
    assert_eq!(purged.len(), 1);
    assert_eq!(purged[0].name, "foo");
    assert_eq!(purged[0].state, InstanceState::Deleted);

    assert!(daemon.list().await.is_empty());
    assert_eq!(platform.removed(), vec!["foo".to_string()]);
    assert_eq!(platform.vm_state("foo"), None);
    assert_eq!(daemon.vault().ref_count(&hash).await, Some(0));
}

#[tokio::test]
async fn test_purge_named_requires_trash() {
    let dir = tempfile::tempdir().unwrap();
    let platform = MockPlatform::new();
    let source = Arc::new(CountingSource::new());
    let daemon = start_daemon(dir.path(), &platform, &source).await;

    daemon.create(named("foo"), None).await.unwrap();
    daemon.create(named("bar"), None).await.unwrap();
    daemon.trash("bar", false).await.unwrap();

    let err = daemon.purge(&["foo".to_string()]).await.unwrap_err();
    assert!(matches!(err, DaemonError::InvalidStateTransition { .. }));
    assert_eq!(daemon.list().await.len(), 2);

    let purged = daemon.purge(&["bar".to_string()]).await.unwrap();
    assert_eq!(purged.len(), 1);

    // Nothing left in the trash
    assert!(daemon.purge(&[]).await.unwrap().is_empty());
    let names: Vec<String> = daemon.list().await.into_iter().map(|i| i.name).collect();
    assert_eq!(names, vec!["foo".to_string()]);
}

#[tokio::test]
async fn test_trash_with_purge_destroys_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let platform = MockPlatform::new();
    let source = Arc::new(CountingSource::new());
    let daemon = start_daemon(dir.path(), &platform, &source).await;

    daemon.create(named("foo"), None).await.unwrap();
    daemon.suspend("foo").await.unwrap();

    let info = daemon.trash("foo", true).await.unwrap();
    assert_eq!(info.state, InstanceState::Deleted);
    assert!(daemon.list().await.is_empty());
    assert_eq!(platform.removed(), vec!["foo".to_string()]);
}

#[tokio::test]
async fn test_resize() {
    let dir = tempfile::tempdir().unwrap();
    let platform = MockPlatform::new();
    let source = Arc::new(CountingSource::new());
    let daemon = start_daemon(dir.path(), &platform, &source).await;

    daemon.create(named("foo"), None).await.unwrap();

    let grow = ResizeRequest {
        cpus: Some(4),
        ..ResizeRequest::default()
    };
    let err = daemon.resize("foo", grow.clone()).await.unwrap_err();
    assert!(matches!(err, DaemonError::InvalidStateTransition { .. }));

    daemon.stop("foo").await.unwrap();
    let info = daemon.resize("foo", grow).await.unwrap();
    assert_eq!(info.resources.cpus, 4);
    assert_eq!(info.state, InstanceState::Off);
    assert_eq!(platform.vm_resources("foo").map(|r| r.cpus), Some(4));

    let shrink = ResizeRequest {
        disk_bytes: Some(info.resources.disk_bytes / 2),
        ..ResizeRequest::default()
    };
    let err = daemon.resize("foo", shrink).await.unwrap_err();
    assert!(matches!(err, DaemonError::InvalidResources(_)));

    let too_small = ResizeRequest {
        memory_bytes: Some(1024),
        ..ResizeRequest::default()
    };
    let err = daemon.resize("foo", too_small).await.unwrap_err();
    assert!(matches!(err, DaemonError::InvalidResources(_)));

    let info = daemon.start("foo").await.unwrap();
    assert_eq!(info.resources.cpus, 4);
}

#[tokio::test]
async fn test_resize_does_not_block_readers() {
    let dir = tempfile::tempdir().unwrap();
    let platform = MockPlatform::new();
    let source = Arc::new(CountingSource::new());
    let daemon = start_daemon(dir.path(), &platform, &source).await;

    let created = daemon.create(named("foo"), None).await.unwrap();
    daemon.stop("foo").await.unwrap();

    platform.set_op_delay(Duration::from_millis(300));
    let grow = ResizeRequest {
        cpus: Some(created.resources.cpus + 1),
        ..ResizeRequest::default()
    };
    let readers = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let info = tokio::time::timeout(Duration::from_millis(100), daemon.info("foo"))
            .await
            .expect("info waited for the resize")
            .unwrap();
        let listed = tokio::time::timeout(Duration::from_millis(100), daemon.list())
            .await
            .expect("list waited for the resize");
        let refused = daemon.start("foo").await.unwrap_err();
        (info, listed, refused)
    };
    let (resized, (info, listed, refused)) = tokio::join!(daemon.resize("foo", grow), readers);

    assert_eq!(info.resources.cpus, created.resources.cpus);
    assert_eq!(listed.len(), 1);
    assert!(matches!(refused, DaemonError::OperationInProgress { .. }));

    let resized = resized.unwrap();
    assert_eq!(resized.resources.cpus, created.resources.cpus + 1);
    assert_eq!(MockStats::get(&platform.stats().starts), 1);

    platform.set_op_delay(Duration::ZERO);
    let info = daemon.start("foo").await.unwrap();
    assert_eq!(info.state, InstanceState::Running);
    assert_eq!(info.resources.cpus, created.resources.cpus + 1);
}

#[tokio::test]
async fn test_ssh_info_and_exec() {
    let dir = tempfile::tempdir().unwrap();
    let platform = MockPlatform::new();
    let source = Arc::new(CountingSource::new());
    let daemon = start_daemon(dir.path(), &platform, &source).await;

    let created = daemon.create(named("foo"), None).await.unwrap();

    let ssh = daemon.ssh_info("foo").await.unwrap();
    assert_eq!(Some(ssh.host.clone()), created.address.map(|a| a.to_string()));
    assert_eq!(ssh.port, 22);
    assert_eq!(ssh.username, "ubuntu");
    let key = base64::engine::general_purpose::STANDARD
        .decode(&ssh.private_key_base64)
        .unwrap();
    assert_eq!(key, PRIVATE_KEY.as_bytes());

    let exec = daemon
        .exec("foo", vec!["uname".to_string(), "-a".to_string()])
        .await
        .unwrap();
    assert_eq!(exec.ssh, ssh);
    assert_eq!(exec.command, vec!["uname", "-a"]);

    assert!(daemon.exec("foo", vec![]).await.is_err());

    daemon.stop("foo").await.unwrap();
    let err = daemon.ssh_info("foo").await.unwrap_err();
    assert!(matches!(err, DaemonError::InvalidStateTransition { .. }));
}
