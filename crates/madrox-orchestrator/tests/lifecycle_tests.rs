//! Integration tests for instance lifecycle: spawning, the forest
//! invariant, paste-path selection, termination idempotency, and workspace
//! browsing.

use madrox_core::{Config, InstanceKind, InstanceState, Role, ToolErrorKind};
use madrox_orchestrator::{InstanceManager, SpawnRequest};
use madrox_term::{MockCall, MockSession};
use std::sync::Arc;
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

#[tokio::test]
async fn spawn_creates_session_workspace_and_ready_state() {
    let tmp = TempDir::new().unwrap();
    let (manager, mock) = test_manager(&tmp);

    let root = manager
        .spawn(spawn_req("main-orchestrator", None))
        .await
        .unwrap();
    assert_eq!(root.state, InstanceState::Ready);
    assert!(root.workspace_path.is_dir());
    assert!(root.session_handle.is_some());
    assert!(mock
        .calls()
        .iter()
        .any(|c| matches!(c, MockCall::Start { command, .. } if command == "claude")));
}

#[tokio::test]
async fn model_flag_reaches_the_launch_command() {
    let tmp = TempDir::new().unwrap();
    let (manager, mock) = test_manager(&tmp);
    manager
        .spawn(SpawnRequest {
            model: Some("opus".to_string()),
            kind: InstanceKind::Codex,
            ..spawn_req("main-orchestrator", None)
        })
        .await
        .unwrap();
    assert!(mock.calls().iter().any(
        |c| matches!(c, MockCall::Start { command, .. } if command == "codex --model opus")
    ));
}

#[tokio::test]
async fn non_root_without_parent_is_parent_required() {
    let tmp = TempDir::new().unwrap();
    let (manager, _mock) = test_manager(&tmp);
    let err = manager.spawn(spawn_req("worker", None)).await.unwrap_err();
    assert_eq!(err.kind, ToolErrorKind::ParentRequired);
    // No instance was created.
    assert_eq!(manager.registry().snapshot().len(), 0);
}

#[tokio::test]
async fn second_root_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let (manager, _mock) = test_manager(&tmp);
    manager
        .spawn(spawn_req("main-orchestrator", None))
        .await
        .unwrap();
    let err = manager
        .spawn(spawn_req("main-orchestrator", None))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ToolErrorKind::ParentRequired);
}

#[tokio::test]
async fn parent_must_reference_existing_instance() {
    let tmp = TempDir::new().unwrap();
    let (manager, _mock) = test_manager(&tmp);
    let err = manager
        .spawn(spawn_req("worker", Some("no-such-id".to_string())))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ToolErrorKind::InvalidInstanceId);
}

#[tokio::test]
async fn workspaces_are_unique_per_instance() {
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
    let b = manager
        .spawn(spawn_req("b", Some(root.id.clone())))
        .await
        .unwrap();
    assert_ne!(a.workspace_path, b.workspace_path);
    assert_ne!(root.workspace_path, a.workspace_path);
    // All live under the configured workspace root.
    for rec in [&root, &a, &b] {
        assert!(rec.workspace_path.starts_with(tmp.path().join("workspaces")));
    }
}

#[tokio::test]
async fn large_message_pastes_exactly_once_small_message_never_pastes() {
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
    mock.clear_calls();

    // 4096 bytes: paste path, exactly one paste, zero text send_keys.
    let big = "m".repeat(4096);
    manager
        .send_to_instance(Some(&root.id), &a.id, &big, false, None, None)
        .await
        .unwrap();
    let calls = mock.calls();
    assert_eq!(
        calls.iter().filter(|c| matches!(c, MockCall::Paste { .. })).count(),
        1
    );
    assert!(!calls.iter().any(|c| matches!(c, MockCall::SendKeys { .. })));
    // The message shows up in one pane capture.
    let record = manager.registry().get(&a.id).unwrap();
    let pane = mock.pane_content(record.session_handle.as_deref().unwrap());
    assert_eq!(pane.matches(&big).count(), 1);

    mock.clear_calls();
    manager
        .send_to_instance(Some(&root.id), &a.id, "short", false, None, None)
        .await
        .unwrap();
    let calls = mock.calls();
    assert!(!calls.iter().any(|c| matches!(c, MockCall::Paste { .. })));
    assert!(calls
        .iter()
        .any(|c| matches!(c, MockCall::SendKeys { text, .. } if text == "short")));
}

#[tokio::test]
async fn send_marks_instance_busy_and_bumps_counters() {
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

    manager
        .send_to_instance(Some(&root.id), &a.id, "do the thing", false, None, None)
        .await
        .unwrap();
    let record = manager.registry().get(&a.id).unwrap();
    assert_eq!(record.state, InstanceState::Busy);
    assert_eq!(record.counters.request_count, 1);
    assert!(record.counters.tokens_used > 0);
}

#[tokio::test]
async fn terminate_is_idempotent_and_keeps_workspace() {
    let tmp = TempDir::new().unwrap();
    let (manager, mock) = test_manager(&tmp);
    let root = manager
        .spawn(spawn_req("main-orchestrator", None))
        .await
        .unwrap();

    let first = manager.terminate(&root.id).await.unwrap();
    assert_eq!(first["already_terminated"], false);
    let record = manager.registry().get(&root.id).unwrap();
    assert_eq!(record.state, InstanceState::Terminated);
    assert!(record.terminated_at.is_some());
    assert!(record.workspace_path.is_dir(), "workspace outlives the instance");
    assert!(mock.is_killed(record.session_handle.as_deref().unwrap()));

    let second = manager.terminate(&root.id).await.unwrap();
    assert_eq!(second["already_terminated"], true);
}

#[tokio::test]
async fn terminate_completes_when_session_already_gone() {
    let tmp = TempDir::new().unwrap();
    let (manager, mock) = test_manager(&tmp);
    let root = manager
        .spawn(spawn_req("main-orchestrator", None))
        .await
        .unwrap();
    mock.mark_gone(root.session_handle.as_deref().unwrap());

    let result = manager.terminate(&root.id).await.unwrap();
    assert_eq!(result["status"], "success");
    assert_eq!(
        manager.registry().get(&root.id).unwrap().state,
        InstanceState::Terminated
    );
}

#[tokio::test]
async fn send_to_terminated_instance_is_session_gone() {
    let tmp = TempDir::new().unwrap();
    let (manager, _mock) = test_manager(&tmp);
    let root = manager
        .spawn(spawn_req("main-orchestrator", None))
        .await
        .unwrap();
    manager.terminate(&root.id).await.unwrap();

    let err = manager
        .send_to_instance(None, &root.id, "hello?", false, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ToolErrorKind::SessionGone);
}

#[tokio::test]
async fn dead_session_moves_instance_to_error_on_refresh() {
    let tmp = TempDir::new().unwrap();
    let (manager, mock) = test_manager(&tmp);
    let root = manager
        .spawn(spawn_req("main-orchestrator", None))
        .await
        .unwrap();
    mock.mark_gone(root.session_handle.as_deref().unwrap());

    manager.refresh_activity(&root.id).await.unwrap();
    assert_eq!(
        manager.registry().get(&root.id).unwrap().state,
        InstanceState::Error
    );
}

#[tokio::test]
async fn instance_tree_reflects_the_forest() {
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
    manager
        .spawn(spawn_req("grandchild", Some(a.id.clone())))
        .await
        .unwrap();

    let tree = manager.instance_tree();
    let roots = tree["tree"].as_array().unwrap();
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0]["name"], "main-orchestrator");
    let kids = roots[0]["children"].as_array().unwrap();
    assert_eq!(kids.len(), 1);
    assert_eq!(kids[0]["children"][0]["name"], "grandchild");
}

#[tokio::test]
async fn workspace_browse_lists_and_retrieves_but_never_escapes() {
    let tmp = TempDir::new().unwrap();
    let (manager, _mock) = test_manager(&tmp);
    let root = manager
        .spawn(spawn_req("main-orchestrator", None))
        .await
        .unwrap();
    std::fs::create_dir_all(root.workspace_path.join("notes")).unwrap();
    std::fs::write(root.workspace_path.join("notes/plan.md"), "the plan").unwrap();

    let listing = manager.list_files(&root.id, None).unwrap();
    let files = listing["files"].as_array().unwrap();
    assert!(files.iter().any(|f| f.as_str() == Some("notes/plan.md")));

    let file = manager.retrieve_file(&root.id, "notes/plan.md").unwrap();
    assert_eq!(file["content"], "the plan");

    let err = manager
        .retrieve_file(&root.id, "../../etc/passwd")
        .unwrap_err();
    assert_eq!(err.kind, ToolErrorKind::Io);
}

#[tokio::test]
async fn max_instances_cap_is_enforced() {
    let tmp = TempDir::new().unwrap();
    let mock = MockSession::new();
    let mut config = Config::default();
    config.workspace_dir = tmp.path().join("workspaces");
    config.max_instances = 2;
    let manager = Arc::new(InstanceManager::new(config, Arc::new(mock)));

    let root = manager
        .spawn(spawn_req("main-orchestrator", None))
        .await
        .unwrap();
    manager
        .spawn(spawn_req("a", Some(root.id.clone())))
        .await
        .unwrap();
    let err = manager
        .spawn(spawn_req("b", Some(root.id.clone())))
        .await
        .unwrap_err();
    assert!(err.message.contains("cap"));
}
