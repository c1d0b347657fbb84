//! Fresh-run lifecycle against the fake driver: registry membership, output
//! flow, terminal events, cleanup.
mod support;

use std::time::Duration;

use adz_runner::engine::Engine;
use adz_runner::orchestrator::{StartRequest, StopOutcome, EXIT_MARKER_PREFIX};
use support::{mk_orchestrator, scratch_dir, wait_until, FakeDriver};

fn start_req(ws: &std::path::Path, cr: &std::path::Path, prefer_warm: bool) -> StartRequest {
    StartRequest {
        engine: Engine::Codex,
        workspace: ws.display().to_string(),
        creds: cr.display().to_string(),
        read_only: false,
        uid_gid: None,
        extra_env: Vec::new(),
        prefer_warm,
        argv: Vec::new(),
    }
}

#[test]
fn test_fresh_run_output_reaches_transcript_and_listener() {
    let root = scratch_dir("fresh-output");
    let ws = root.join("ws");
    let cr = root.join("cr");
    std::fs::create_dir_all(&ws).unwrap();
    std::fs::create_dir_all(&cr).unwrap();

    let driver = FakeDriver::new();
    let orch = mk_orchestrator(driver.clone(), &root);
    let events = orch.bus().subscribe();

    let resp = orch.start(start_req(&ws, &cr, false)).unwrap();
    assert!(resp.container_name.starts_with("adz-codex-"));

    // run-started precedes any chunk
    let first = events.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(first.name(), "run-started");

    let rx = orch.add_listener(&resp.run_id).expect("listener");
    driver.emit(&resp.container_name, b"hello from engine\n");

    let chunk = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(chunk, b"hello from engine\n");

    let view = orch.view(&resp.run_id).unwrap();
    assert!(wait_until(
        || std::fs::read(&view.transcript_path)
            .map(|b| b.windows(5).any(|w| w == b"hello"))
            .unwrap_or(false),
        Duration::from_secs(2)
    ));
    assert!(view.transcript_path.starts_with(ws.join(".runs")));

    // stream end: run leaves the registry, one terminal event fires
    driver.close_stream(&resp.container_name);
    assert!(wait_until(|| orch.view(&resp.run_id).is_none(), Duration::from_secs(2)));
    let terminal = events.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(terminal.name(), "run-exited");
    assert!(events.try_recv().is_err(), "exactly one terminal event");

    // marker delivered to the listener before close
    let mut saw_marker = false;
    while let Ok(chunk) = rx.recv_timeout(Duration::from_millis(500)) {
        if String::from_utf8_lossy(&chunk).contains(EXIT_MARKER_PREFIX) {
            saw_marker = true;
        }
    }
    assert!(saw_marker, "terminal marker not delivered");

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn test_input_round_trip_and_activity() {
    let root = scratch_dir("input");
    let ws = root.join("ws");
    std::fs::create_dir_all(&ws).unwrap();

    let driver = FakeDriver::new();
    let orch = mk_orchestrator(driver.clone(), &root);
    let resp = orch.start(start_req(&ws, &root, false)).unwrap();

    orch.input(&resp.run_id, b"help\n").unwrap();
    let handle = driver.handle(&resp.container_name);
    assert_eq!(handle.input.lock().unwrap().as_slice(), b"help\n");

    let err = orch.input("missing", b"x").unwrap_err();
    assert_eq!(err.kind(), "not-found");

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn test_stop_fresh_removes_container() {
    let root = scratch_dir("stop-fresh");
    let ws = root.join("ws");
    std::fs::create_dir_all(&ws).unwrap();

    let driver = FakeDriver::new();
    let orch = mk_orchestrator(driver.clone(), &root);
    let events = orch.bus().subscribe();
    let resp = orch.start(start_req(&ws, &root, false)).unwrap();
    assert_eq!(events.recv_timeout(Duration::from_secs(2)).unwrap().name(), "run-started");

    assert_eq!(orch.stop(&resp.run_id).unwrap(), StopOutcome::Done);
    assert!(orch.view(&resp.run_id).is_none());
    assert!(driver.stopped.lock().unwrap().contains(&resp.container_name));
    assert!(driver.removed.lock().unwrap().contains(&resp.container_name));
    assert_eq!(events.recv_timeout(Duration::from_secs(2)).unwrap().name(), "run-stopped");

    // terminal transitions are single-firing: a second stop is a 404-free no-op
    // only via fallback; with no labeled container left it reports not-found
    let err = orch.stop(&resp.run_id).unwrap_err();
    assert_eq!(err.kind(), "not-found");

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn test_warm_exec_stop_preserves_warm_container() {
    let root = scratch_dir("warm-stop");
    let ws = root.join("ws");
    std::fs::create_dir_all(&ws).unwrap();

    let driver = FakeDriver::new();
    let orch = mk_orchestrator(driver.clone(), &root);

    let fp = adz_runner::docker::labels::MountFingerprint::new(
        Engine::Codex,
        &ws,
        &root,
        false,
        None,
    );
    let warm = orch.pool().ensure(&fp).unwrap();

    let resp = orch.start(start_req(&ws, &root, true)).unwrap();
    // warm reuse: the run rides the warm container
    assert_eq!(resp.container_name, warm.name);

    let handle = driver.handle(&warm.id);
    assert_eq!(orch.stop(&resp.run_id).unwrap(), StopOutcome::Done);

    // graceful warm stop writes Ctrl-C then exit to the TTY
    assert!(wait_until(
        || {
            let input = handle.input.lock().unwrap();
            input.starts_with(&[0x03]) && input.ends_with(b"exit\n")
        },
        Duration::from_secs(2)
    ));

    // the warm container survives; the run does not
    assert!(driver.container_exists(&warm.id));
    assert!(orch.view(&resp.run_id).is_none());
    assert!(!driver.removed.lock().unwrap().contains(&warm.id));

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn test_kill_warm_signals_engines_only() {
    let root = scratch_dir("warm-kill");
    let ws = root.join("ws");
    std::fs::create_dir_all(&ws).unwrap();

    let driver = FakeDriver::new();
    let orch = mk_orchestrator(driver.clone(), &root);

    let fp = adz_runner::docker::labels::MountFingerprint::new(
        Engine::Gemini,
        &ws,
        &root,
        false,
        None,
    );
    let warm = orch.pool().ensure(&fp).unwrap();
    let mut req = start_req(&ws, &root, true);
    req.engine = Engine::Gemini;
    let resp = orch.start(req).unwrap();

    orch.kill(&resp.run_id).unwrap();
    let execs = driver.detached_execs.lock().unwrap();
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].0, warm.id);
    assert!(execs[0].1.join(" ").contains("pkill -9 -x gemini"));
    assert!(driver.container_exists(&warm.id));

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn test_stop_fallback_cleans_labeled_container() {
    let root = scratch_dir("fallback");
    let driver = FakeDriver::new();
    let orch = mk_orchestrator(driver.clone(), &root);

    // no such run, no container: 404
    let err = orch.stop("rghost").unwrap_err();
    assert_eq!(err.kind(), "not-found");

    // labeled container without a registry entry: fallback teardown
    driver.register_orphan(
        "adz-codex-orphan",
        &[("adz.runId".to_string(), "rghost".to_string())],
    );
    assert_eq!(orch.stop("rghost").unwrap(), StopOutcome::Fallback);
    assert!(!driver.container_exists("adz-codex-orphan"));

    // subsequent stop is a clean 404 again
    let err = orch.stop("rghost").unwrap_err();
    assert_eq!(err.kind(), "not-found");

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn test_path_guard_rejections_are_distinct() {
    let root = scratch_dir("guard");
    let driver = FakeDriver::new();
    let orch = mk_orchestrator(driver, &root);

    let mut req = start_req(std::path::Path::new("/etc"), &root, false);
    let err = orch.start(req.clone()).unwrap_err();
    assert_eq!(err.kind(), "path-not-allowed");

    req.workspace = "relative/path".to_string();
    let err = orch.start(req).unwrap_err();
    assert_eq!(err.kind(), "invalid-path");

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn test_artifact_events_published_on_bus() {
    let root = scratch_dir("artifacts-bus");
    let ws = root.join("ws");
    std::fs::create_dir_all(&ws).unwrap();

    let driver = FakeDriver::new();
    let orch = mk_orchestrator(driver.clone(), &root);
    let events = orch.bus().subscribe();
    let resp = orch.start(start_req(&ws, &root, false)).unwrap();
    assert_eq!(events.recv_timeout(Duration::from_secs(2)).unwrap().name(), "run-started");

    driver.emit(
        &resp.container_name,
        b"opened https://github.com/x/y/pull/3\n",
    );
    let ev = events.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(ev.name(), "artifact");
    let json = serde_json::to_value(&ev).unwrap();
    assert_eq!(json["kind"], "pr");
    assert_eq!(json["runId"], resp.run_id);

    let _ = std::fs::remove_dir_all(&root);
}
