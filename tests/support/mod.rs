/*!
Test support shared across integration tests: an in-process fake container
driver (no docker daemon required), scratch directories, raw HTTP helpers
and a websocket client-side frame encoder.
*/
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use adz_runner::docker::driver::{
    AttachControl, AttachStream, ContainerDriver, ContainerInspect, ContainerSummary, ExecSpec,
    FreshSpec, MountPoint,
};
use adz_runner::docker::labels::MountFingerprint;
use adz_runner::errors::ApiError;
use adz_runner::events::EventBus;
use adz_runner::orchestrator::Orchestrator;
use adz_runner::warmpool::WarmPool;

pub fn scratch_dir(tag: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!("adz-runner-test-{}-{}", tag, std::process::id()));
    let _ = std::fs::remove_dir_all(&p);
    std::fs::create_dir_all(&p).unwrap();
    p
}

/// Poll `pred` until it holds or the timeout expires.
pub fn wait_until<F: FnMut() -> bool>(mut pred: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    pred()
}

// ---------------------------------------------------------------------------
// Fake driver

pub struct FakeControl {
    pub resizes: Mutex<Vec<(u16, u16)>>,
    pub shutdowns: AtomicUsize,
}

impl FakeControl {
    fn new() -> Arc<FakeControl> {
        Arc::new(FakeControl {
            resizes: Mutex::new(Vec::new()),
            shutdowns: AtomicUsize::new(0),
        })
    }
}

impl AttachControl for FakeControl {
    fn resize(&self, cols: u16, rows: u16) -> io::Result<()> {
        self.resizes.lock().unwrap().push((cols, rows));
        Ok(())
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }

    fn wait_client(&self) -> Option<i32> {
        Some(0)
    }
}

struct ChanReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for ChanReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(bytes) => self.pending = bytes,
                Err(_) => return Ok(0),
            }
        }
        let n = out.len().min(self.pending.len());
        out[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct FakeHandle {
    pub output: Sender<Vec<u8>>,
    pub input: Arc<Mutex<Vec<u8>>>,
    pub control: Arc<FakeControl>,
}

#[derive(Clone)]
struct FakeContainer {
    id: String,
    name: String,
    labels: BTreeMap<String, String>,
    status: String,
}

#[derive(Default)]
pub struct FakeDriver {
    containers: Mutex<HashMap<String, FakeContainer>>,
    handles: Mutex<HashMap<String, FakeHandle>>,
    pub stopped: Mutex<Vec<String>>,
    pub killed: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    pub detached_execs: Mutex<Vec<(String, Vec<String>)>>,
    seq: AtomicUsize,
}

impl FakeDriver {
    pub fn new() -> Arc<FakeDriver> {
        Arc::new(FakeDriver::default())
    }

    fn make_stream(&self, key: &str) -> AttachStream {
        let (tx, rx) = channel::<Vec<u8>>();
        let input = Arc::new(Mutex::new(Vec::new()));
        let control = FakeControl::new();
        self.handles.lock().unwrap().insert(
            key.to_string(),
            FakeHandle {
                output: tx,
                input: input.clone(),
                control: control.clone(),
            },
        );
        AttachStream {
            reader: Box::new(ChanReader {
                rx,
                pending: Vec::new(),
            }),
            writer: Box::new(SharedWriter(input)),
            control,
        }
    }

    /// Handle for pushing output / observing input on a live fake stream.
    pub fn handle(&self, key: &str) -> FakeHandle {
        self.handles.lock().unwrap().get(key).cloned().expect("no such fake stream")
    }

    /// Emit engine output on the fake TTY.
    pub fn emit(&self, key: &str, bytes: &[u8]) {
        let _ = self.handle(key).output.send(bytes.to_vec());
    }

    /// Close the fake TTY stream (engine exit).
    pub fn close_stream(&self, key: &str) {
        self.handles.lock().unwrap().remove(key);
    }

    pub fn container_exists(&self, key: &str) -> bool {
        let containers = self.containers.lock().unwrap();
        containers.contains_key(key) || containers.values().any(|c| c.id == key || c.name == key)
    }

    /// Register a container that no live run knows about (fallback path).
    pub fn register_orphan(&self, name: &str, labels: &[(String, String)]) {
        let mut map = BTreeMap::new();
        for (k, v) in labels {
            map.insert(k.clone(), v.clone());
        }
        self.containers.lock().unwrap().insert(
            name.to_string(),
            FakeContainer {
                id: name.to_string(),
                name: name.to_string(),
                labels: map,
                status: "running".to_string(),
            },
        );
    }

    fn find(&self, key: &str) -> Option<FakeContainer> {
        let containers = self.containers.lock().unwrap();
        containers
            .get(key)
            .cloned()
            .or_else(|| containers.values().find(|c| c.id == key || c.name == key).cloned())
    }

    fn remove_entry(&self, key: &str) {
        let mut containers = self.containers.lock().unwrap();
        if containers.remove(key).is_none() {
            if let Some(name) = containers
                .values()
                .find(|c| c.id == key || c.name == key)
                .map(|c| c.name.clone())
            {
                containers.remove(&name);
            }
        }
    }
}

impl ContainerDriver for FakeDriver {
    fn create_fresh(&self, spec: &FreshSpec) -> Result<AttachStream, ApiError> {
        let mut labels = BTreeMap::new();
        for (k, v) in spec.fingerprint.run_labels(&spec.run_id) {
            labels.insert(k, v);
        }
        self.containers.lock().unwrap().insert(
            spec.container_name.clone(),
            FakeContainer {
                id: spec.container_name.clone(),
                name: spec.container_name.clone(),
                labels,
                status: "running".to_string(),
            },
        );
        Ok(self.make_stream(&spec.container_name))
    }

    fn exec_in_warm(&self, warm_ref: &str, _spec: &ExecSpec) -> Result<AttachStream, ApiError> {
        if self.find(warm_ref).is_none() {
            return Err(ApiError::RuntimeError(format!(
                "no such warm container: {warm_ref}"
            )));
        }
        Ok(self.make_stream(warm_ref))
    }

    fn create_warm(
        &self,
        fp: &MountFingerprint,
        _image: &str,
        name: &str,
    ) -> Result<String, ApiError> {
        let id = format!("warmid{}", self.seq.fetch_add(1, Ordering::SeqCst));
        let mut labels = BTreeMap::new();
        for (k, v) in fp.warm_labels() {
            labels.insert(k, v);
        }
        self.containers.lock().unwrap().insert(
            name.to_string(),
            FakeContainer {
                id: id.clone(),
                name: name.to_string(),
                labels,
                status: "running".to_string(),
            },
        );
        Ok(id)
    }

    fn stop(&self, cref: &str, _grace_secs: u64) {
        self.stopped.lock().unwrap().push(cref.to_string());
    }

    fn kill(&self, cref: &str) {
        self.killed.lock().unwrap().push(cref.to_string());
    }

    fn remove(&self, cref: &str, _force: bool) {
        self.removed.lock().unwrap().push(cref.to_string());
        self.remove_entry(cref);
    }

    fn wait(&self, _cref: &str, _timeout: Duration) -> Option<i32> {
        Some(0)
    }

    fn inspect(&self, cref: &str) -> io::Result<ContainerInspect> {
        let c = self
            .find(cref)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such container"))?;
        let workspace = c
            .labels
            .get("adz.workspace")
            .cloned()
            .unwrap_or_default();
        Ok(ContainerInspect {
            status: c.status,
            labels: c.labels,
            mounts: vec![MountPoint {
                source: workspace,
                destination: "/workspace".to_string(),
                rw: true,
            }],
        })
    }

    fn list(&self, label_filters: &[(String, String)]) -> io::Result<Vec<ContainerSummary>> {
        let containers = self.containers.lock().unwrap();
        Ok(containers
            .values()
            .filter(|c| {
                label_filters
                    .iter()
                    .all(|(k, v)| c.labels.get(k).map(|lv| lv == v).unwrap_or(false))
            })
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.name.clone(),
            })
            .collect())
    }

    fn exec_detached(&self, cref: &str, argv: &[String]) {
        self.detached_execs
            .lock()
            .unwrap()
            .push((cref.to_string(), argv.to_vec()));
    }
}

// ---------------------------------------------------------------------------
// Wiring

pub fn mk_orchestrator(driver: Arc<FakeDriver>, allow_root: &Path) -> Arc<Orchestrator> {
    let pool = Arc::new(WarmPool::new(driver.clone(), "adz/test:latest".to_string()));
    let bus = Arc::new(EventBus::new());
    Arc::new(Orchestrator::new(
        driver,
        pool,
        bus,
        "adz/test:latest".to_string(),
        vec![allow_root.to_path_buf()],
        vec![allow_root.to_path_buf()],
        false,
    ))
}

// ---------------------------------------------------------------------------
// Raw HTTP / WS helpers

pub fn http_send_raw(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream.write_all(request.as_bytes()).expect("send");
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let mut out = Vec::new();
    let _ = stream.read_to_end(&mut out);
    String::from_utf8_lossy(&out).to_string()
}

pub fn http_get(addr: SocketAddr, path: &str) -> String {
    http_send_raw(
        addr,
        &format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"),
    )
}

pub fn http_post_json(addr: SocketAddr, path: &str, body: &str) -> String {
    http_send_raw(
        addr,
        &format!(
            "POST {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        ),
    )
}

pub fn http_delete(addr: SocketAddr, path: &str) -> String {
    http_send_raw(
        addr,
        &format!("DELETE {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"),
    )
}

/// Extract the JSON body of a Content-Length response.
pub fn response_body(raw: &str) -> String {
    raw.split("\r\n\r\n").nth(1).unwrap_or("").to_string()
}

pub fn response_json(raw: &str) -> serde_json::Value {
    serde_json::from_str(&response_body(raw)).unwrap_or(serde_json::Value::Null)
}

/// Client-side (masked) websocket frame.
pub fn ws_client_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let key = [0x11u8, 0x22, 0x33, 0x44];
    let mut out = vec![0x80 | (opcode & 0x0f)];
    let len = payload.len();
    if len < 126 {
        out.push(0x80 | len as u8);
    } else {
        out.push(0x80 | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    }
    out.extend_from_slice(&key);
    for (i, b) in payload.iter().enumerate() {
        out.push(b ^ key[i % 4]);
    }
    out
}
