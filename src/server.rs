//! HTTP/stream front-end: JSON endpoints, SSE log/event streams, and the
//! bidirectional TTY socket. One thread per connection over a nonblocking
//! accept loop so the daemon can notice shutdown requests.
use std::fs;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use serde_json::{json, Value};

use crate::color::{color_enabled_stderr, log_error_stderr, log_info_stderr};
use crate::config::Config;
use crate::creds;
use crate::docker::labels::MountFingerprint;
use crate::engine::Engine;
use crate::errors::ApiError;
use crate::orchestrator::{Orchestrator, StartRequest, StopOutcome};
use crate::pathguard;
use crate::transcript::{self, TAIL_MAX_BYTES};
use crate::util::http::{
    read_http_request, respond_bytes, respond_error, respond_json, sse_chunk, sse_frame,
    sse_prelude, HttpRequest,
};
use crate::util::ws;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);
/// recentFiles window and cap for the artifacts endpoint.
const RECENT_FILE_WINDOW: Duration = Duration::from_secs(15 * 60);
const RECENT_FILE_CAP: usize = 50;
const WALK_DEPTH: usize = 4;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Ask the accept loop to tear everything down and exit.
pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

pub struct HttpServer {
    listener: TcpListener,
    orch: Arc<Orchestrator>,
    cfg: Config,
}

impl HttpServer {
    pub fn bind(cfg: Config, orch: Arc<Orchestrator>) -> io::Result<HttpServer> {
        let listener = TcpListener::bind((cfg.bind_host.as_str(), cfg.port))?;
        listener.set_nonblocking(true)?;
        Ok(HttpServer {
            listener,
            orch,
            cfg,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn run(self) {
        let use_err = color_enabled_stderr();
        if let Ok(addr) = self.local_addr() {
            log_info_stderr(use_err, &format!("adz-runner: listening on http://{addr}"));
        }
        loop {
            if SHUTDOWN.load(Ordering::SeqCst) {
                log_info_stderr(use_err, "adz-runner: shutting down; closing runs");
                self.orch.close_all();
                break;
            }
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    let orch = self.orch.clone();
                    let cfg = self.cfg.clone();
                    let _ = std::thread::Builder::new()
                        .name("http-conn".to_string())
                        .spawn(move || handle_connection(&cfg, &orch, stream));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    log_error_stderr(use_err, &format!("adz-runner: accept failed: {e}"));
                    std::thread::sleep(ACCEPT_POLL);
                }
            }
        }
    }
}

/// Peek enough of the request line to route upgrades before consuming bytes.
fn sniff_ws(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 8];
    for _ in 0..200 {
        match stream.peek(&mut buf) {
            Ok(n) if n >= buf.len() => return &buf == b"GET /ws/",
            Ok(0) => return false,
            Ok(_) => std::thread::sleep(Duration::from_millis(5)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(5))
            }
            Err(_) => return false,
        }
    }
    false
}

fn handle_connection(cfg: &Config, orch: &Arc<Orchestrator>, stream: TcpStream) {
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_read_timeout(Some(HEADER_READ_TIMEOUT));
    if sniff_ws(&stream) {
        handle_ws(orch, stream);
        return;
    }
    let mut stream = stream;
    let req = match read_http_request(&mut stream) {
        Ok(req) => req,
        Err(_) => {
            respond_bytes(&mut stream, 400, "text/plain", b"bad request\n");
            return;
        }
    };
    route(cfg, orch, &req, &mut stream);
}

fn route(cfg: &Config, orch: &Arc<Orchestrator>, req: &HttpRequest, stream: &mut TcpStream) {
    let segments: Vec<&str> = req.path.split('/').filter(|s| !s.is_empty()).collect();
    let method = req.method.as_str();

    match (method, segments.as_slice()) {
        ("GET", ["health"]) => handle_health(cfg, stream),
        ("GET", ["whoami"]) => handle_whoami(stream),
        ("POST", ["runs"]) => handle_start(orch, req, stream),
        ("GET", ["runs"]) => {
            respond_json(stream, 200, &json!({ "runs": orch.list() }));
        }
        ("POST", ["runs", "stop-all"]) => {
            let include_warm = req.query_param("includeWarm") == Some("1");
            let stopped = orch.stop_all(include_warm);
            respond_json(stream, 200, &json!({ "ok": true, "stopped": stopped }));
        }
        ("POST", ["runs", "kill-all"]) => {
            let include_warm = req.query_param("includeWarm") == Some("1");
            let killed = orch.kill_all(include_warm);
            respond_json(stream, 200, &json!({ "ok": true, "killed": killed }));
        }
        ("GET", ["runs", id, "meta"]) => match orch.meta(id) {
            Ok(meta) => respond_json(stream, 200, &serde_json::to_value(meta).unwrap_or_default()),
            Err(e) => respond_error(stream, &e),
        },
        ("GET", ["runs", id, "logs"]) => handle_logs(orch, req, stream, id),
        ("POST", ["runs", id, "input"]) => handle_input(orch, req, stream, id),
        ("DELETE", ["runs", id]) => respond_outcome(stream, orch.stop(id)),
        ("POST", ["runs", id, "kill"]) => respond_outcome(stream, orch.kill(id)),
        ("POST", ["runs", id, "close"]) => respond_outcome(stream, orch.close(id)),
        ("GET", ["runs", id, "artifacts"]) => handle_artifacts(orch, stream, id),
        ("GET", ["runs", id, "file"]) => handle_file(orch, req, stream, id),
        ("GET", ["events"]) => handle_events(orch, stream),
        ("GET", ["warm"]) => match orch.pool().list() {
            Ok(list) => respond_json(stream, 200, &json!({ "warm": list })),
            Err(e) => respond_error(stream, &ApiError::RuntimeError(e.to_string())),
        },
        ("POST", ["warm", "ensure"]) => handle_warm_ensure(orch, req, stream),
        ("DELETE", ["warm", id]) => {
            if orch.pool().destroy(id) {
                respond_json(stream, 200, &json!({ "ok": true }));
            } else {
                respond_error(
                    stream,
                    &ApiError::NotFound(format!("no such warm container: {id}")),
                );
            }
        }
        ("GET", ["creds", "check"]) => handle_creds_check(orch, req, stream),
        ("POST", ["creds", "write-env"]) => handle_creds_write(orch, req, stream),
        _ => respond_error(
            stream,
            &ApiError::NotFound(format!("{} {}", req.method, req.path)),
        ),
    }
}

fn respond_outcome(stream: &mut TcpStream, result: Result<StopOutcome, ApiError>) {
    match result {
        Ok(StopOutcome::Done) => respond_json(stream, 200, &json!({ "ok": true })),
        Ok(StopOutcome::Fallback) => {
            respond_json(stream, 200, &json!({ "ok": true, "fallback": true }))
        }
        Err(e) => respond_error(stream, &e),
    }
}

fn handle_health(cfg: &Config, stream: &mut TcpStream) {
    let workspaces: Vec<String> = cfg
        .allow_workspace_roots
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    let creds: Vec<String> = cfg
        .allow_creds_roots
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    respond_json(
        stream,
        200,
        &json!({
            "ok": true,
            "image": cfg.image,
            "allow": { "workspaces": workspaces, "creds": creds },
        }),
    );
}

fn handle_whoami(stream: &mut TcpStream) {
    #[cfg(unix)]
    let (uid, gid) = {
        use nix::unistd::{getgid, getuid};
        (
            Some(u32::from(getuid())),
            Some(u32::from(getgid())),
        )
    };
    #[cfg(not(unix))]
    let (uid, gid): (Option<u32>, Option<u32>) = (None, None);

    respond_json(
        stream,
        200,
        &json!({
            "uid": uid,
            "gid": gid,
            "platform": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
        }),
    );
}

fn body_json(req: &HttpRequest) -> Value {
    serde_json::from_slice(&req.body).unwrap_or(Value::Null)
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(|s| s.as_str()).map(|s| s.to_string())
}

fn handle_start(orch: &Arc<Orchestrator>, req: &HttpRequest, stream: &mut TcpStream) {
    let body = body_json(req);
    let engine_raw = str_field(&body, "engine").unwrap_or_default();
    let engine = match Engine::parse(&engine_raw) {
        Ok(e) => e,
        Err(e) => return respond_error(stream, &e),
    };
    let workspace = str_field(&body, "workspace").unwrap_or_default();
    let creds = str_field(&body, "creds").unwrap_or_default();
    let read_only = body.get("readOnly").and_then(|v| v.as_bool()).unwrap_or(false);
    let uid_gid = str_field(&body, "uidgid").filter(|s| !s.trim().is_empty());
    let prefer_warm = body
        .get("preferWarm")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let mut extra_env = Vec::new();
    if let Some(map) = body.get("extraEnv").and_then(|v| v.as_object()) {
        for (k, v) in map {
            if let Some(s) = v.as_str() {
                extra_env.push((k.clone(), s.to_string()));
            }
        }
    }
    let argv: Vec<String> = body
        .get("argv")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|x| x.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();

    let start = StartRequest {
        engine,
        workspace,
        creds,
        read_only,
        uid_gid,
        extra_env,
        prefer_warm,
        argv,
    };
    match orch.start(start) {
        Ok(resp) => respond_json(stream, 200, &serde_json::to_value(resp).unwrap_or_default()),
        Err(e) => respond_error(stream, &e),
    }
}

fn handle_input(orch: &Arc<Orchestrator>, req: &HttpRequest, stream: &mut TcpStream, id: &str) {
    let body = body_json(req);
    let data = str_field(&body, "data").unwrap_or_default();
    match orch.input(id, data.as_bytes()) {
        Ok(()) => respond_json(stream, 200, &json!({ "ok": true })),
        Err(e) => respond_error(stream, &e),
    }
}

fn handle_logs(orch: &Arc<Orchestrator>, req: &HttpRequest, stream: &mut TcpStream, id: &str) {
    let Some(view) = orch.view(id) else {
        return respond_error(stream, &ApiError::NotFound(format!("no such run: {id}")));
    };
    let follow = req.query_param("follow") == Some("1");
    // Attach before reading the tail; duplicates across the seam are fine,
    // gaps are not.
    let rx = if follow { orch.add_listener(id) } else { None };

    if sse_prelude(stream).is_err() {
        return;
    }
    let tail = transcript::tail(&view.transcript_path, TAIL_MAX_BYTES).unwrap_or_default();
    if sse_chunk(stream, &tail).is_err() {
        return;
    }
    if let Some(rx) = rx {
        while let Ok(chunk) = rx.recv() {
            if sse_chunk(stream, &chunk).is_err() {
                break;
            }
        }
    }
}

fn handle_events(orch: &Arc<Orchestrator>, stream: &mut TcpStream) {
    let rx = orch.bus().subscribe();
    if sse_prelude(stream).is_err() {
        return;
    }
    let _ = write!(stream, ": connected\n\n");
    let _ = stream.flush();
    while let Ok(event) = rx.recv() {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        if sse_frame(stream, event.name(), &data).is_err() {
            break;
        }
    }
}

fn handle_artifacts(orch: &Arc<Orchestrator>, stream: &mut TcpStream, id: &str) {
    let Some(view) = orch.view(id) else {
        return respond_error(stream, &ApiError::NotFound(format!("no such run: {id}")));
    };
    let runs_dir = view.workspace.join(".runs");
    let mut transcripts: Vec<String> = fs::read_dir(&runs_dir)
        .map(|rd| {
            rd.flatten()
                .filter_map(|e| e.file_name().into_string().ok())
                .filter(|n| n.ends_with(".log"))
                .collect()
        })
        .unwrap_or_default();
    transcripts.sort();
    transcripts.reverse();

    let mut recent: Vec<(SystemTime, String)> = Vec::new();
    collect_recent_files(&view.workspace, &view.workspace, 0, &mut recent);
    recent.sort_by(|a, b| b.0.cmp(&a.0));
    recent.truncate(RECENT_FILE_CAP);
    let recent_files: Vec<String> = recent.into_iter().map(|(_, p)| p).collect();

    respond_json(
        stream,
        200,
        &json!({ "transcripts": transcripts, "recentFiles": recent_files }),
    );
}

fn collect_recent_files(
    root: &Path,
    dir: &Path,
    depth: usize,
    out: &mut Vec<(SystemTime, String)>,
) {
    if depth > WALK_DEPTH {
        return;
    }
    let Ok(rd) = fs::read_dir(dir) else { return };
    let cutoff = SystemTime::now()
        .checked_sub(RECENT_FILE_WINDOW)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    for ent in rd.flatten() {
        let name = ent.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || name == "node_modules" || name == "target" {
            continue;
        }
        let path = ent.path();
        let Ok(md) = ent.metadata() else { continue };
        if md.is_dir() {
            collect_recent_files(root, &path, depth + 1, out);
        } else if md.is_file() {
            if let Ok(mtime) = md.modified() {
                if mtime >= cutoff {
                    if let Ok(rel) = path.strip_prefix(root) {
                        out.push((mtime, rel.display().to_string()));
                    }
                }
            }
        }
    }
}

fn handle_file(orch: &Arc<Orchestrator>, req: &HttpRequest, stream: &mut TcpStream, id: &str) {
    let Some(view) = orch.view(id) else {
        return respond_error(stream, &ApiError::NotFound(format!("no such run: {id}")));
    };
    let Some(raw) = req.query_param("path") else {
        return respond_error(stream, &ApiError::InvalidPath("missing path".to_string()));
    };
    let candidate = if raw.starts_with('/') {
        PathBuf::from(raw)
    } else {
        view.workspace.join(raw)
    };
    let norm = pathguard::normalize(&candidate);
    if !pathguard::is_under(&norm, &view.workspace) {
        return respond_error(
            stream,
            &ApiError::PathNotAllowed(format!(
                "{} is outside the run workspace",
                norm.display()
            )),
        );
    }
    match fs::read(&norm) {
        Ok(bytes) => respond_bytes(stream, 200, "application/octet-stream", &bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => respond_error(
            stream,
            &ApiError::NotFound(format!("no such file: {}", norm.display())),
        ),
        Err(e) => respond_error(stream, &ApiError::RuntimeError(e.to_string())),
    }
}

fn handle_warm_ensure(orch: &Arc<Orchestrator>, req: &HttpRequest, stream: &mut TcpStream) {
    let body = body_json(req);
    let engine = match Engine::parse(&str_field(&body, "engine").unwrap_or_default()) {
        Ok(e) => e,
        Err(e) => return respond_error(stream, &e),
    };
    let workspace = match pathguard::validate(
        &str_field(&body, "workspace").unwrap_or_default(),
        orch.allow_workspace_roots(),
    ) {
        Ok(p) => p,
        Err(e) => return respond_error(stream, &e),
    };
    let creds = match pathguard::validate(
        &str_field(&body, "creds").unwrap_or_default(),
        orch.allow_creds_roots(),
    ) {
        Ok(p) => p,
        Err(e) => return respond_error(stream, &e),
    };
    let read_only = body.get("readOnly").and_then(|v| v.as_bool()).unwrap_or(false);
    let uid_gid = str_field(&body, "uidgid").filter(|s| !s.trim().is_empty());

    let fp = MountFingerprint::new(engine, &workspace, &creds, read_only, uid_gid);
    match orch.pool().ensure(&fp) {
        Ok(warm) => respond_json(stream, 200, &json!({ "id": warm.id, "name": warm.name })),
        Err(e) => respond_error(stream, &e),
    }
}

fn handle_creds_check(orch: &Arc<Orchestrator>, req: &HttpRequest, stream: &mut TcpStream) {
    let engine = match Engine::parse(req.query_param("engine").unwrap_or_default()) {
        Ok(e) => e,
        Err(e) => return respond_error(stream, &e),
    };
    let creds_dir = match pathguard::validate(
        req.query_param("creds").unwrap_or_default(),
        orch.allow_creds_roots(),
    ) {
        Ok(p) => p,
        Err(e) => return respond_error(stream, &e),
    };
    let readiness = creds::check_readiness(engine, &creds_dir);
    respond_json(
        stream,
        200,
        &serde_json::to_value(readiness).unwrap_or_default(),
    );
}

fn handle_creds_write(orch: &Arc<Orchestrator>, req: &HttpRequest, stream: &mut TcpStream) {
    let body = body_json(req);
    let creds_dir = match pathguard::validate(
        &str_field(&body, "creds").unwrap_or_default(),
        orch.allow_creds_roots(),
    ) {
        Ok(p) => p,
        Err(e) => return respond_error(stream, &e),
    };
    let mut updates = std::collections::BTreeMap::new();
    if let Some(map) = body.get("updates").and_then(|v| v.as_object()) {
        for (k, v) in map {
            if let Some(s) = v.as_str() {
                updates.insert(k.clone(), s.to_string());
            }
        }
    }
    match creds::write_env(&creds_dir, &updates) {
        Ok(env) => respond_json(stream, 200, &json!({ "ok": true, "env": env })),
        Err(e) => respond_error(stream, &ApiError::RuntimeError(e.to_string())),
    }
}

/// Bidirectional TTY socket: inbound frames are stdin bytes (text frames may
/// carry a JSON resize control), outbound frames are raw TTY bytes.
fn handle_ws(orch: &Arc<Orchestrator>, mut stream: TcpStream) {
    let req = match read_http_request(&mut stream) {
        Ok(r) => r,
        Err(_) => return,
    };
    let segments: Vec<&str> = req.path.split('/').filter(|s| !s.is_empty()).collect();
    let id = match segments.as_slice() {
        ["ws", "runs", id] => (*id).to_string(),
        _ => {
            respond_error(
                &mut stream,
                &ApiError::NotFound(format!("{} {}", req.method, req.path)),
            );
            return;
        }
    };
    if orch.view(&id).is_none() {
        respond_error(&mut stream, &ApiError::NotFound(format!("no such run: {id}")));
        return;
    }
    let Some(key) = req.header("sec-websocket-key").map(|s| s.to_string()) else {
        respond_bytes(&mut stream, 400, "text/plain", b"missing Sec-WebSocket-Key\n");
        return;
    };
    if stream
        .write_all(ws::handshake_response(&key).as_bytes())
        .is_err()
    {
        return;
    }
    let _ = stream.set_read_timeout(None);

    let Some(rx) = orch.add_listener(&id) else {
        let _ = ws::write_close(&mut stream);
        return;
    };

    let writer = Arc::new(Mutex::new(match stream.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    }));

    // Inbound pump: client frames → stdin / resize.
    let orch_in = orch.clone();
    let id_in = id.clone();
    let writer_in = writer.clone();
    let mut read_half = stream;
    let inbound = std::thread::Builder::new()
        .name(format!("ws-in-{id}"))
        .spawn(move || loop {
            match ws::read_frame(&mut read_half) {
                Ok(frame) => match frame.opcode {
                    ws::OP_TEXT => {
                        if let Some((cols, rows)) = parse_resize(&frame.payload) {
                            let _ = orch_in.resize(&id_in, cols, rows);
                        } else if !looks_like_control(&frame.payload) {
                            let _ = orch_in.input(&id_in, &frame.payload);
                        }
                    }
                    ws::OP_BINARY | ws::OP_CONTINUATION => {
                        let _ = orch_in.input(&id_in, &frame.payload);
                    }
                    ws::OP_PING => {
                        if let Ok(mut w) = writer_in.lock() {
                            let _ = ws::write_frame(&mut *w, ws::OP_PONG, &frame.payload);
                        }
                    }
                    ws::OP_CLOSE => break,
                    _ => {}
                },
                Err(_) => break,
            }
        });

    // Outbound pump: TTY bytes → binary frames.
    while let Ok(chunk) = rx.recv() {
        let mut w = match writer.lock() {
            Ok(w) => w,
            Err(_) => break,
        };
        if ws::write_frame(&mut *w, ws::OP_BINARY, &chunk).is_err() {
            break;
        }
    }
    if let Ok(mut w) = writer.lock() {
        let _ = ws::write_close(&mut *w);
        let _ = w.shutdown(Shutdown::Both);
    }
    if let Ok(handle) = inbound {
        let _ = handle.join();
    }
}

fn parse_resize(payload: &[u8]) -> Option<(u16, u16)> {
    let v: Value = serde_json::from_slice(payload).ok()?;
    if v.get("type").and_then(|t| t.as_str()) != Some("resize") {
        return None;
    }
    let cols = v.get("cols").and_then(|c| c.as_u64())? as u16;
    let rows = v.get("rows").and_then(|r| r.as_u64())? as u16;
    Some((cols, rows))
}

/// JSON objects with a `type` key are control-channel traffic; unrecognized
/// control types are dropped rather than typed into the TTY.
fn looks_like_control(payload: &[u8]) -> bool {
    serde_json::from_slice::<Value>(payload)
        .map(|v| v.get("type").is_some())
        .unwrap_or(false)
}
