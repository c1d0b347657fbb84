//! The run orchestrator: owns the registry of live runs, the per-run output
//! pump, listener fan-out, and every teardown path.
//!
//! A run is in the registry exactly while it is running. Terminal
//! transitions are single-firing: the first path to claim a run performs
//! teardown and emits the one terminal lifecycle event; later requests are
//! no-ops that report success.
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use serde::Serialize;

#[cfg(feature = "otel")]
use tracing::instrument;

use crate::artifacts::{Artifact, ArtifactScanner};
use crate::color::{color_enabled_stderr, log_info_stderr, warn_print};
use crate::docker::driver::{AttachControl, ContainerDriver, ExecSpec, FreshSpec, MountPoint};
use crate::docker::labels::{MountFingerprint, LABEL_RUN_ID};
use crate::engine::Engine;
use crate::errors::ApiError;
use crate::events::{now_ms, ArtifactEvent, BusEvent, EventBus, LifecycleEvent, LifecycleKind};
use crate::pathguard;
use crate::transcript::TranscriptWriter;
use crate::util::id::{run_id, short_hex8, timestamp_safe};
use crate::warmpool::WarmPool;

pub const EXIT_MARKER_PREFIX: &str = "[[PROCESS EXITED]] status=";
pub const IDLE_MARKER: &str = "[[AUTO-STOP]] idle timeout exceeded";

const LISTENER_QUEUE: usize = 1024;
const STOP_GRACE_SECS: u64 = 2;
const CONTAINER_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace between writing Ctrl-C + exit into a warm exec and detaching its
/// client, so the bytes reach the engine first.
const WARM_STOP_DETACH_DELAY: Duration = Duration::from_millis(300);

static MONO_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic milliseconds since process start; activity timestamps never go
/// backwards with wall-clock adjustments.
pub fn mono_ms() -> u64 {
    MONO_START.elapsed().as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunMode {
    #[serde(rename = "fresh")]
    Fresh,
    #[serde(rename = "warm-exec")]
    WarmExec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Running,
    Exited,
    Stopped,
    Killed,
    IdleStopped,
    Closed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Exited => "exited",
            RunStatus::Stopped => "stopped",
            RunStatus::Killed => "killed",
            RunStatus::IdleStopped => "idle-stopped",
            RunStatus::Closed => "closed",
        }
    }

    fn terminal_event(&self) -> LifecycleKind {
        match self {
            RunStatus::Exited => LifecycleKind::RunExited,
            RunStatus::Stopped => LifecycleKind::RunStopped,
            RunStatus::Killed => LifecycleKind::RunKilled,
            RunStatus::IdleStopped => LifecycleKind::RunIdleStopped,
            RunStatus::Closed | RunStatus::Running => LifecycleKind::RunClosed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub engine: Engine,
    pub workspace: String,
    pub creds: String,
    pub read_only: bool,
    pub uid_gid: Option<String>,
    pub extra_env: Vec<(String, String)>,
    pub prefer_warm: bool,
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartResponse {
    #[serde(rename = "runId")]
    pub run_id: String,
    #[serde(rename = "containerName")]
    pub container_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    #[serde(rename = "runId")]
    pub run_id: String,
    pub engine: Engine,
    pub workspace: String,
    pub status: String,
    #[serde(rename = "startedAt")]
    pub started_at: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunMeta {
    #[serde(rename = "runId")]
    pub run_id: String,
    pub engine: Engine,
    pub workspace: String,
    pub creds: String,
    pub mode: RunMode,
    #[serde(rename = "containerName")]
    pub container_name: String,
    #[serde(rename = "containerId")]
    pub container_id: String,
    #[serde(rename = "transcriptPath")]
    pub transcript_path: String,
    #[serde(rename = "startedAt")]
    pub started_at: u64,
    pub warm: bool,
    pub mounts: Vec<MountPoint>,
}

/// Read-only view of a live run for the front-end.
#[derive(Debug, Clone)]
pub struct RunView {
    pub run_id: String,
    pub engine: Engine,
    pub workspace: PathBuf,
    pub creds: PathBuf,
    pub mode: RunMode,
    pub container_name: String,
    pub container_ref: String,
    pub transcript_path: PathBuf,
    pub started_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Done,
    Fallback,
}

struct Listener {
    tx: SyncSender<Vec<u8>>,
}

struct RunInner {
    run_id: String,
    engine: Engine,
    fingerprint: MountFingerprint,
    container_ref: String,
    container_name: String,
    mode: RunMode,
    started_at: u64,
    transcript_path: PathBuf,
    writer: Mutex<Box<dyn Write + Send>>,
    control: Arc<dyn AttachControl>,
    last_activity_ms: AtomicU64,
    listeners: Mutex<Vec<Listener>>,
    finished: AtomicBool,
}

impl RunInner {
    fn touch(&self) {
        self.last_activity_ms.store(mono_ms(), Ordering::Relaxed);
    }

    fn is_warm(&self) -> bool {
        self.mode == RunMode::WarmExec
    }
}

pub struct Orchestrator {
    driver: Arc<dyn ContainerDriver>,
    pool: Arc<WarmPool>,
    bus: Arc<EventBus>,
    image: String,
    allow_workspace_roots: Vec<PathBuf>,
    allow_creds_roots: Vec<PathBuf>,
    verbose: bool,
    runs: Mutex<HashMap<String, Arc<RunInner>>>,
}

impl Orchestrator {
    pub fn new(
        driver: Arc<dyn ContainerDriver>,
        pool: Arc<WarmPool>,
        bus: Arc<EventBus>,
        image: String,
        allow_workspace_roots: Vec<PathBuf>,
        allow_creds_roots: Vec<PathBuf>,
        verbose: bool,
    ) -> Orchestrator {
        Orchestrator {
            driver,
            pool,
            bus,
            image,
            allow_workspace_roots,
            allow_creds_roots,
            verbose,
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn pool(&self) -> &Arc<WarmPool> {
        &self.pool
    }

    pub fn allow_workspace_roots(&self) -> &[PathBuf] {
        &self.allow_workspace_roots
    }

    pub fn allow_creds_roots(&self) -> &[PathBuf] {
        &self.allow_creds_roots
    }

    fn get(&self, run_id: &str) -> Option<Arc<RunInner>> {
        self.runs.lock().unwrap().get(run_id).cloned()
    }

    #[cfg_attr(feature = "otel", instrument(level = "info", skip(self, req), fields(engine = %req.engine)))]
    pub fn start(self: &Arc<Self>, req: StartRequest) -> Result<StartResponse, ApiError> {
        let workspace = pathguard::validate(&req.workspace, &self.allow_workspace_roots)?;
        let creds = pathguard::validate(&req.creds, &self.allow_creds_roots)?;

        let ts = timestamp_safe();
        let transcript_path = workspace
            .join(".runs")
            .join(format!("{}-{}.log", req.engine, ts));
        let transcript =
            TranscriptWriter::open(&transcript_path).map_err(|e| {
                ApiError::RuntimeError(format!("could not open transcript: {e}"))
            })?;

        let fingerprint = MountFingerprint::new(
            req.engine,
            &workspace,
            &creds,
            req.read_only,
            req.uid_gid.clone(),
        );
        let id = run_id();

        let warm_hit = if req.prefer_warm {
            self.pool.find(&fingerprint)
        } else {
            None
        };

        let (mode, container_ref, container_name, stream) = match warm_hit {
            Some(warm) => {
                let spec = ExecSpec {
                    engine: req.engine,
                    extra_env: req.extra_env.clone(),
                    argv: req.argv.clone(),
                };
                let stream = self.driver.exec_in_warm(&warm.id, &spec)?;
                (RunMode::WarmExec, warm.id, warm.name, stream)
            }
            None => {
                let name = format!("adz-{}-{}-{}", req.engine, ts, short_hex8());
                let spec = FreshSpec {
                    image: self.image.clone(),
                    fingerprint: fingerprint.clone(),
                    run_id: id.clone(),
                    container_name: name.clone(),
                    extra_env: req.extra_env.clone(),
                    argv: req.argv.clone(),
                };
                let stream = self.driver.create_fresh(&spec)?;
                (RunMode::Fresh, name.clone(), name, stream)
            }
        };

        let run = Arc::new(RunInner {
            run_id: id.clone(),
            engine: req.engine,
            fingerprint,
            container_ref,
            container_name: container_name.clone(),
            mode,
            started_at: now_ms(),
            transcript_path,
            writer: Mutex::new(stream.writer),
            control: stream.control,
            last_activity_ms: AtomicU64::new(mono_ms()),
            listeners: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
        });

        self.runs.lock().unwrap().insert(id.clone(), run.clone());
        self.publish_lifecycle(&run, LifecycleKind::RunStarted);
        self.spawn_pump(run, stream.reader, transcript);

        Ok(StartResponse {
            run_id: id,
            container_name,
        })
    }

    /// Per-run output pump: transcript, listener fan-out, artifact scan.
    fn spawn_pump(
        self: &Arc<Self>,
        run: Arc<RunInner>,
        mut reader: Box<dyn Read + Send>,
        mut transcript: TranscriptWriter,
    ) {
        let orch = self.clone();
        let builder = std::thread::Builder::new().name(format!("pump-{}", run.run_id));
        let _ = builder.spawn(move || {
            let mut scanner = ArtifactScanner::new();
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = &buf[..n];
                        run.touch();
                        transcript.write(chunk);
                        fan_out(&run, chunk);
                        for artifact in scanner.scan_chunk(chunk) {
                            orch.publish_artifact(&run, artifact);
                        }
                    }
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            for artifact in scanner.finish() {
                orch.publish_artifact(&run, artifact);
            }
            transcript.close();
            let _ = run.control.wait_client();

            // Stream end while still registered: the engine finished on its
            // own. Fresh containers report an exit code; warm execs default
            // to exited and the warm container stays up.
            if !run.finished.load(Ordering::SeqCst) {
                if run.mode == RunMode::Fresh {
                    let code = orch
                        .driver
                        .wait(&run.container_ref, CONTAINER_WAIT_TIMEOUT);
                    if orch.verbose {
                        log_info_stderr(
                            color_enabled_stderr(),
                            &format!(
                                "adz-runner: run {} container exit code {:?}",
                                run.run_id, code
                            ),
                        );
                    }
                }
                orch.finalize(&run, RunStatus::Exited);
            }
        });
    }

    fn publish_lifecycle(&self, run: &RunInner, kind: LifecycleKind) {
        self.bus.publish(BusEvent::Lifecycle(LifecycleEvent {
            event: kind,
            run_id: run.run_id.clone(),
            engine: run.engine,
            workspace: run.fingerprint.workspace.display().to_string(),
            warm: run.is_warm(),
            ts: now_ms(),
        }));
    }

    fn publish_artifact(&self, run: &RunInner, artifact: Artifact) {
        self.bus.publish(BusEvent::Artifact(ArtifactEvent {
            artifact,
            run_id: run.run_id.clone(),
            engine: run.engine,
            workspace: run.fingerprint.workspace.display().to_string(),
            ts: now_ms(),
        }));
    }

    /// First terminal path wins: deregister, deliver the exit marker, close
    /// listeners, emit the one terminal event.
    fn finalize(&self, run: &Arc<RunInner>, status: RunStatus) -> bool {
        if run.finished.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.runs.lock().unwrap().remove(&run.run_id);

        let marker = format!("\n{}{}\n", EXIT_MARKER_PREFIX, status.as_str());
        let mut listeners = run.listeners.lock().unwrap();
        for l in listeners.iter() {
            let _ = l.tx.try_send(marker.clone().into_bytes());
        }
        listeners.clear();
        drop(listeners);

        self.publish_lifecycle(run, status.terminal_event());
        true
    }

    pub fn input(&self, run_id: &str, bytes: &[u8]) -> Result<(), ApiError> {
        let run = self
            .get(run_id)
            .ok_or_else(|| ApiError::NotFound(format!("no such run: {run_id}")))?;
        let mut w = run.writer.lock().unwrap();
        w.write_all(bytes)
            .and_then(|_| w.flush())
            .map_err(|e| ApiError::WriteFailed(e.to_string()))?;
        drop(w);
        run.touch();
        Ok(())
    }

    /// Cosmetic: resize failures are swallowed.
    pub fn resize(&self, run_id: &str, cols: u16, rows: u16) -> Result<(), ApiError> {
        let run = self
            .get(run_id)
            .ok_or_else(|| ApiError::NotFound(format!("no such run: {run_id}")))?;
        let _ = run.control.resize(cols, rows);
        Ok(())
    }

    #[cfg_attr(feature = "otel", instrument(level = "info", skip(self)))]
    pub fn stop(&self, run_id: &str) -> Result<StopOutcome, ApiError> {
        match self.get(run_id) {
            Some(run) => {
                self.stop_run(&run, RunStatus::Stopped);
                Ok(StopOutcome::Done)
            }
            None => self.fallback_cleanup(run_id).map(|_| StopOutcome::Fallback),
        }
    }

    fn stop_run(&self, run: &Arc<RunInner>, status: RunStatus) {
        if run.is_warm() {
            // Interrupt whatever runs on the TTY, then leave the shellish
            // entrypoint; the warm container itself is preserved.
            {
                let mut w = run.writer.lock().unwrap();
                let _ = w.write_all(&[0x03]);
                let _ = w.write_all(b"exit\n");
                let _ = w.flush();
            }
            self.finalize(run, status);
            let control = run.control.clone();
            std::thread::spawn(move || {
                std::thread::sleep(WARM_STOP_DETACH_DELAY);
                control.shutdown();
            });
        } else {
            self.driver.stop(&run.container_ref, STOP_GRACE_SECS);
            self.driver.remove(&run.container_ref, true);
            self.finalize(run, status);
            run.control.shutdown();
        }
    }

    #[cfg_attr(feature = "otel", instrument(level = "info", skip(self)))]
    pub fn kill(&self, run_id: &str) -> Result<StopOutcome, ApiError> {
        match self.get(run_id) {
            Some(run) => {
                if run.is_warm() {
                    self.driver
                        .exec_detached(&run.container_ref, &pkill_argv(false));
                } else {
                    self.driver.kill(&run.container_ref);
                    self.driver.remove(&run.container_ref, true);
                }
                run.control.shutdown();
                self.finalize(&run, RunStatus::Killed);
                Ok(StopOutcome::Done)
            }
            None => self.fallback_cleanup(run_id).map(|_| StopOutcome::Fallback),
        }
    }

    /// Unconditional teardown used by UI shutdown: the attach stream goes
    /// first, then the broadest process match.
    #[cfg_attr(feature = "otel", instrument(level = "info", skip(self)))]
    pub fn close(&self, run_id: &str) -> Result<StopOutcome, ApiError> {
        match self.get(run_id) {
            Some(run) => {
                run.control.shutdown();
                if run.is_warm() {
                    self.driver
                        .exec_detached(&run.container_ref, &pkill_argv(true));
                } else {
                    self.driver.kill(&run.container_ref);
                    self.driver.remove(&run.container_ref, true);
                }
                self.finalize(&run, RunStatus::Closed);
                Ok(StopOutcome::Done)
            }
            None => self.fallback_cleanup(run_id).map(|_| StopOutcome::Fallback),
        }
    }

    /// A run may be gone from the registry while its labeled container
    /// lingers (e.g. control-plane restart). Tear such containers down.
    fn fallback_cleanup(&self, run_id: &str) -> Result<(), ApiError> {
        let refs = self
            .driver
            .list(&[(LABEL_RUN_ID.to_string(), run_id.to_string())])
            .map_err(|e| ApiError::RuntimeError(e.to_string()))?;
        if refs.is_empty() {
            return Err(ApiError::NotFound(format!("no such run: {run_id}")));
        }
        for r in refs {
            self.driver.stop(&r.id, STOP_GRACE_SECS);
            self.driver.remove(&r.id, true);
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<RunSummary> {
        let snapshot: Vec<Arc<RunInner>> =
            self.runs.lock().unwrap().values().cloned().collect();
        snapshot
            .into_iter()
            .map(|run| {
                let status = if run.mode == RunMode::Fresh {
                    self.driver
                        .inspect(&run.container_ref)
                        .map(|i| i.status)
                        .unwrap_or_else(|_| RunStatus::Running.as_str().to_string())
                } else {
                    RunStatus::Running.as_str().to_string()
                };
                RunSummary {
                    run_id: run.run_id.clone(),
                    engine: run.engine,
                    workspace: run.fingerprint.workspace.display().to_string(),
                    status,
                    started_at: run.started_at,
                }
            })
            .collect()
    }

    pub fn meta(&self, run_id: &str) -> Result<RunMeta, ApiError> {
        let run = self
            .get(run_id)
            .ok_or_else(|| ApiError::NotFound(format!("no such run: {run_id}")))?;
        let mounts = self
            .driver
            .inspect(&run.container_ref)
            .map(|i| i.mounts)
            .unwrap_or_default();
        Ok(RunMeta {
            run_id: run.run_id.clone(),
            engine: run.engine,
            workspace: run.fingerprint.workspace.display().to_string(),
            creds: run.fingerprint.creds.display().to_string(),
            mode: run.mode,
            container_name: run.container_name.clone(),
            container_id: run.container_ref.clone(),
            transcript_path: run.transcript_path.display().to_string(),
            started_at: run.started_at,
            warm: run.is_warm(),
            mounts,
        })
    }

    pub fn view(&self, run_id: &str) -> Option<RunView> {
        self.get(run_id).map(|run| RunView {
            run_id: run.run_id.clone(),
            engine: run.engine,
            workspace: run.fingerprint.workspace.clone(),
            creds: run.fingerprint.creds.clone(),
            mode: run.mode,
            container_name: run.container_name.clone(),
            container_ref: run.container_ref.clone(),
            transcript_path: run.transcript_path.clone(),
            started_at: run.started_at,
        })
    }

    /// Attach a log follower; chunks flow in receipt order. Returns None for
    /// unknown runs.
    pub fn add_listener(&self, run_id: &str) -> Option<Receiver<Vec<u8>>> {
        let run = self.get(run_id)?;
        let (tx, rx) = sync_channel(LISTENER_QUEUE);
        run.listeners.lock().unwrap().push(Listener { tx });
        Some(rx)
    }

    pub fn run_ids(&self) -> Vec<String> {
        self.runs.lock().unwrap().keys().cloned().collect()
    }

    pub fn stop_all(&self, include_warm: bool) -> usize {
        let ids = self.run_ids();
        let n = ids.len();
        for id in ids {
            let _ = self.stop(&id);
        }
        if include_warm {
            self.destroy_all_warm();
        }
        n
    }

    pub fn kill_all(&self, include_warm: bool) -> usize {
        let ids = self.run_ids();
        let n = ids.len();
        for id in ids {
            let _ = self.kill(&id);
        }
        if include_warm {
            self.destroy_all_warm();
        }
        n
    }

    /// Best-effort teardown of everything, for daemon shutdown.
    pub fn close_all(&self) {
        for id in self.run_ids() {
            let _ = self.close(&id);
        }
    }

    fn destroy_all_warm(&self) {
        match self.pool.list() {
            Ok(warm) => {
                for w in warm {
                    self.pool.destroy(&w.id);
                }
            }
            Err(e) => warn_print(&format!("warm pool listing failed: {e}")),
        }
    }

    /// One reaper pass: stop every run idle for at least `timeout_secs`.
    /// Returns the ids that were stopped.
    pub fn sweep_idle(&self, timeout_secs: u64) -> Vec<String> {
        if timeout_secs == 0 {
            return Vec::new();
        }
        let now = mono_ms();
        let snapshot: Vec<Arc<RunInner>> =
            self.runs.lock().unwrap().values().cloned().collect();
        let mut stopped = Vec::new();
        for run in snapshot {
            let idle_ms = now.saturating_sub(run.last_activity_ms.load(Ordering::Relaxed));
            if idle_ms < timeout_secs.saturating_mul(1000) {
                continue;
            }
            let marker = format!("\n{}\n", IDLE_MARKER);
            // The pump owns the live writer; idle markers go through a
            // separate append handle, which is safe on an append-only file.
            if let Ok(mut t) = TranscriptWriter::open(&run.transcript_path) {
                t.write(marker.as_bytes());
            }
            fan_out(&run, marker.as_bytes());
            self.stop_run(&run, RunStatus::IdleStopped);
            stopped.push(run.run_id.clone());
        }
        stopped
    }
}

fn fan_out(run: &RunInner, chunk: &[u8]) {
    let mut listeners = run.listeners.lock().unwrap();
    listeners.retain(|l| l.tx.try_send(chunk.to_vec()).is_ok());
}

/// Best-effort SIGKILL of engine processes inside a warm container; the
/// broad variant also targets the entrypoint.
fn pkill_argv(broad: bool) -> Vec<String> {
    let mut names: Vec<String> = Engine::ALL
        .iter()
        .map(|e| e.process_name().to_string())
        .collect();
    if broad {
        names.push(crate::docker::driver::entrypoint_bin());
    }
    let script = names
        .iter()
        .map(|n| format!("pkill -9 -x {} 2>/dev/null", n))
        .collect::<Vec<_>>()
        .join("; ");
    vec!["sh".to_string(), "-c".to_string(), format!("{script}; true")]
}
