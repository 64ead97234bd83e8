//! Supervisor loop behaviour: idle check-ins with watermarking, and
//! blocked-instance advisories routed to the parent's poll path.

use madrox_core::{Config, InstanceKind, InstanceState, Role};
use madrox_orchestrator::{InstanceManager, SpawnRequest, Supervisor};
use madrox_term::MockSession;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn test_manager(tmp: &TempDir) -> (Arc<InstanceManager>, MockSession) {
    let mock = MockSession::new();
    let mut config = Config::default();
    config.workspace_dir = tmp.path().join("workspaces");
    config.artifacts_dir = tmp.path().join("artifacts");
    let manager = Arc::new(InstanceManager::new(config, Arc::new(mock.clone())));
    (manager, mock)
}

fn spawn_req(name: &str, parent: Option<String>) -> SpawnRequest {
    SpawnRequest {
        name: name.to_string(),
        role: Role::General,
        kind: InstanceKind::Claude,
        model: None,
        parent_id: parent,
        team_session_id: None,
        enable_madrox: false,
    }
}

fn age_last_activity(manager: &InstanceManager, id: &str, secs: i64) {
    manager
        .registry()
        .with_record_mut(id, |r| {
            r.last_activity = chrono::Utc::now() - chrono::Duration::seconds(secs);
        })
        .unwrap();
}

#[tokio::test]
async fn idle_instance_gets_one_checkin_per_idle_stretch() {
    let tmp = TempDir::new().unwrap();
    let (manager, _mock) = test_manager(&tmp);
    let root = manager
        .spawn(spawn_req("main-orchestrator", None))
        .await
        .unwrap();
    let a = manager
        .spawn(spawn_req("a", Some(root.id.clone())))
        .await
        .unwrap();
    age_last_activity(&manager, &a.id, 600);
    age_last_activity(&manager, &root.id, 0);

    let mut supervisor =
        Supervisor::new(manager.clone()).with_idle_threshold(Duration::from_secs(300));
    supervisor.scan_once().await;
    assert_eq!(manager.bus().inbox_len(&a.id), 1);

    // Same idle stretch: the watermark suppresses a second check-in.
    supervisor.scan_once().await;
    assert_eq!(manager.bus().inbox_len(&a.id), 1);
}

#[tokio::test]
async fn active_instance_is_left_alone() {
    let tmp = TempDir::new().unwrap();
    let (manager, _mock) = test_manager(&tmp);
    let root = manager
        .spawn(spawn_req("main-orchestrator", None))
        .await
        .unwrap();

    let mut supervisor =
        Supervisor::new(manager.clone()).with_idle_threshold(Duration::from_secs(300));
    supervisor.scan_once().await;
    assert_eq!(manager.bus().inbox_len(&root.id), 0);
}

#[tokio::test]
async fn blocked_child_produces_parent_advisory_not_termination() {
    let tmp = TempDir::new().unwrap();
    let (manager, mock) = test_manager(&tmp);
    let root = manager
        .spawn(spawn_req("main-orchestrator", None))
        .await
        .unwrap();
    let a = manager
        .spawn(spawn_req("a", Some(root.id.clone())))
        .await
        .unwrap();

    // Script a crash signature into the child's pane.
    let session = a.session_handle.as_deref().unwrap();
    mock.set_pane_content(session, "thread 'main' panicked at src/main.rs:10");

    let mut supervisor = Supervisor::new(manager.clone());
    supervisor.scan_once().await;

    // The advisory shows up where the parent polls: the child's reply queue.
    let replies = manager.get_pending_replies(&a.id).unwrap();
    assert_eq!(replies["count"], 1);
    let advisory = &replies["replies"][0];
    assert_eq!(advisory["sender_id"], "supervisor");
    assert!(advisory["payload"]
        .as_str()
        .unwrap()
        .contains("appears blocked"));

    // Never auto-terminates.
    let record = manager.registry().get(&a.id).unwrap();
    assert_ne!(record.state, InstanceState::Terminated);
    assert!(!mock.is_killed(session));
}

#[tokio::test]
async fn error_state_instance_is_classified_blocked() {
    let tmp = TempDir::new().unwrap();
    let (manager, mock) = test_manager(&tmp);
    let root = manager
        .spawn(spawn_req("main-orchestrator", None))
        .await
        .unwrap();
    let a = manager
        .spawn(spawn_req("a", Some(root.id.clone())))
        .await
        .unwrap();
    mock.mark_gone(a.session_handle.as_deref().unwrap());

    let mut supervisor = Supervisor::new(manager.clone());
    // First pass flips the instance to error (dead session), and the same
    // pass already advises the parent.
    supervisor.scan_once().await;
    assert_eq!(
        manager.registry().get(&a.id).unwrap().state,
        InstanceState::Error
    );
    let replies = manager.get_pending_replies(&a.id).unwrap();
    assert_eq!(replies["count"], 1);
}

#[tokio::test]
async fn terminated_instances_are_skipped() {
    let tmp = TempDir::new().unwrap();
    let (manager, _mock) = test_manager(&tmp);
    let root = manager
        .spawn(spawn_req("main-orchestrator", None))
        .await
        .unwrap();
    manager.terminate(&root.id).await.unwrap();
    age_last_activity(&manager, &root.id, 3600);

    let mut supervisor =
        Supervisor::new(manager.clone()).with_idle_threshold(Duration::from_secs(1));
    supervisor.scan_once().await;
    assert_eq!(manager.bus().inbox_len(&root.id), 0);
}
