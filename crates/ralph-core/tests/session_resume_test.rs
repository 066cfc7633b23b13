//! Crash-and-resume behavior across session manager instances, driving
//! the on-disk session format the way a restarted process would see it.

use ralph_core::session::{SessionManager, SessionStatus};

#[test]
fn crash_after_start_task_yields_orphan_and_resume() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("sessions");

    // First process: create a session and dispatch a task.
    let session_id = {
        let mgr = SessionManager::new(&dir).unwrap();
        let session = mgr
            .create_session(serde_json::json!({"iterations": 5}), "main", "abc123")
            .unwrap();
        mgr.start_task("T").unwrap();
        session.session_id
    };

    // Simulate the process dying: rewrite the session file with a pid
    // that no longer exists, exactly as a crashed supervisor leaves it.
    let session_path = dir.join(format!("{session_id}.json"));
    let mut raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&session_path).unwrap()).unwrap();
    assert_eq!(raw["status"], "running");
    assert_eq!(raw["currentTask"], "T");
    raw["pid"] = serde_json::json!(999_999_999u32);
    std::fs::write(&session_path, serde_json::to_string_pretty(&raw).unwrap()).unwrap();

    // Second process: startup detects the dead pid and reclassifies.
    let mgr = SessionManager::new(&dir).unwrap();
    mgr.detect_crashes().unwrap();

    let loaded = mgr.load_session(&session_id).unwrap();
    assert_eq!(loaded.status, SessionStatus::Crashed);
    assert!(loaded.last_error.is_some());

    // The active pointer survived the crash, so resume can find it.
    assert_eq!(
        mgr.active_session().unwrap().session_id,
        session_id,
        "active pointer must be preserved for resume"
    );
    assert_eq!(
        mgr.get_orphaned_task(&session_id).unwrap(),
        Some("T".to_string())
    );

    let (resumed, orphaned) = mgr.resume_session(&session_id).unwrap();
    assert_eq!(resumed.status, SessionStatus::Running);
    assert_eq!(orphaned, Some("T".to_string()));
    assert!(resumed.current_task.is_none());

    // The resumed session can complete normally.
    mgr.start_task("T").unwrap();
    mgr.complete_task("T").unwrap();
    mgr.complete_session().unwrap();
    assert!(mgr.active_session().is_none());
    assert_eq!(
        mgr.load_session(&session_id).unwrap().status,
        SessionStatus::Completed
    );
}

#[test]
fn list_sessions_refreshes_statuses_across_instances() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("sessions");

    let first_id = {
        let mgr = SessionManager::new(&dir).unwrap();
        let session = mgr
            .create_session(serde_json::json!({}), "main", "abc")
            .unwrap();
        mgr.complete_session().unwrap();
        session.session_id
    };
    let second_id = {
        let mgr = SessionManager::new(&dir).unwrap();
        let session = mgr
            .create_session(serde_json::json!({}), "main", "def")
            .unwrap();
        mgr.abort_session(None).unwrap();
        session.session_id
    };

    let mgr = SessionManager::new(&dir).unwrap();
    let sessions = mgr.list_sessions().unwrap();
    assert_eq!(sessions.len(), 2);

    let status_of = |id: &str| {
        sessions
            .iter()
            .find(|s| s.session_id == id)
            .map(|s| s.status)
            .unwrap()
    };
    assert_eq!(status_of(&first_id), SessionStatus::Completed);
    assert_eq!(status_of(&second_id), SessionStatus::Aborted);
}
