//! The bidirectional TTY socket: handshake, outbound TTY bytes as binary
//! frames, inbound frames as stdin, resize control frames.
mod support;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use adz_runner::config::Config;
use adz_runner::engine::Engine;
use adz_runner::orchestrator::StartRequest;
use adz_runner::server::HttpServer;
use support::{mk_orchestrator, scratch_dir, wait_until, ws_client_frame, FakeDriver};

const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

fn read_until(stream: &mut TcpStream, marker: &[u8], timeout: Duration) -> Vec<u8> {
    let _ = stream.set_read_timeout(Some(timeout));
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    while !out.windows(marker.len()).any(|w| w == marker) {
        match stream.read(&mut byte) {
            Ok(1) => out.push(byte[0]),
            _ => break,
        }
    }
    out
}

/// Read one server frame (unmasked, len < 126) from the stream.
fn read_server_frame(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).ok()?;
    let opcode = head[0] & 0x0f;
    let len = (head[1] & 0x7f) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).ok()?;
    Some((opcode, payload))
}

#[test]
fn test_ws_tty_round_trip() {
    let root = scratch_dir("ws-tty");
    let ws_dir = root.join("ws");
    std::fs::create_dir_all(&ws_dir).unwrap();

    let driver = FakeDriver::new();
    let orch = mk_orchestrator(driver.clone(), &root);
    let cfg = Config {
        port: 0,
        bind_host: "127.0.0.1".to_string(),
        image: "adz/test:latest".to_string(),
        idle_timeout_sec: 0,
        allow_workspace_roots: vec![root.clone()],
        allow_creds_roots: vec![root.clone()],
        verbose: false,
    };
    let server = HttpServer::bind(cfg, orch.clone()).unwrap();
    let addr = server.local_addr().unwrap();
    std::thread::spawn(move || server.run());

    let resp = orch
        .start(StartRequest {
            engine: Engine::Codex,
            workspace: ws_dir.display().to_string(),
            creds: root.display().to_string(),
            read_only: false,
            uid_gid: None,
            extra_env: Vec::new(),
            prefer_warm: false,
            argv: Vec::new(),
        })
        .unwrap();

    let mut stream = TcpStream::connect(addr).unwrap();
    let upgrade = format!(
        "GET /ws/runs/{} HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n\r\n",
        resp.run_id, SAMPLE_KEY
    );
    stream.write_all(upgrade.as_bytes()).unwrap();

    let head = read_until(&mut stream, b"\r\n\r\n", Duration::from_secs(5));
    let head = String::from_utf8_lossy(&head);
    assert!(head.contains("101 Switching Protocols"), "{head}");
    assert!(head.contains(SAMPLE_ACCEPT), "{head}");

    // outbound: TTY bytes arrive as a binary frame
    driver.emit(&resp.container_name, b"prompt> ");
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let (opcode, payload) = read_server_frame(&mut stream).expect("frame");
    assert_eq!(opcode, 0x2);
    assert_eq!(payload, b"prompt> ");

    // inbound binary frame goes to stdin
    stream
        .write_all(&ws_client_frame(0x2, b"ls -la\n"))
        .unwrap();
    let handle = driver.handle(&resp.container_name);
    assert!(wait_until(
        || handle.input.lock().unwrap().ends_with(b"ls -la\n"),
        Duration::from_secs(2)
    ));

    // resize control frame routes to the PTY, not stdin
    stream
        .write_all(&ws_client_frame(
            0x1,
            br#"{"type":"resize","cols":120,"rows":40}"#,
        ))
        .unwrap();
    assert!(wait_until(
        || handle.control.resizes.lock().unwrap().contains(&(120, 40)),
        Duration::from_secs(2)
    ));
    assert!(!handle
        .input
        .lock()
        .unwrap()
        .windows(6)
        .any(|w| w == b"resize"));

    // non-JSON text frames are raw stdin bytes
    stream.write_all(&ws_client_frame(0x1, b"echo hi\n")).unwrap();
    assert!(wait_until(
        || handle.input.lock().unwrap().ends_with(b"echo hi\n"),
        Duration::from_secs(2)
    ));

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn test_ws_unknown_run_rejected() {
    let root = scratch_dir("ws-404");
    let driver = FakeDriver::new();
    let orch = mk_orchestrator(driver, &root);
    let cfg = Config {
        port: 0,
        bind_host: "127.0.0.1".to_string(),
        image: "adz/test:latest".to_string(),
        idle_timeout_sec: 0,
        allow_workspace_roots: vec![root.clone()],
        allow_creds_roots: vec![root.clone()],
        verbose: false,
    };
    let server = HttpServer::bind(cfg, orch).unwrap();
    let addr = server.local_addr().unwrap();
    std::thread::spawn(move || server.run());

    let mut stream = TcpStream::connect(addr).unwrap();
    let upgrade = format!(
        "GET /ws/runs/rnone HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: {SAMPLE_KEY}\r\n\r\n"
    );
    stream.write_all(upgrade.as_bytes()).unwrap();
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let mut out = Vec::new();
    let _ = stream.read_to_end(&mut out);
    let text = String::from_utf8_lossy(&out);
    assert!(text.contains("404"), "{text}");

    let _ = std::fs::remove_dir_all(&root);
}
