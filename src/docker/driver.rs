//! The driver is the only component that talks to the container runtime.
//!
//! All verbs shell out to the docker CLI. Interactive attach (fresh run,
//! warm exec) runs the CLI client under a host pseudo-TTY so the container
//! side gets a real terminal; resizing the host PTY propagates through the
//! client via SIGWINCH. Killing the client detaches without touching the
//! container, which is what keeps warm containers alive across runs.
use std::collections::BTreeMap;
use std::env;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};

#[cfg(feature = "otel")]
use tracing::instrument;

use crate::color::{color_enabled_stderr, log_info_stderr};
use crate::docker::labels::MountFingerprint;
use crate::engine::Engine;
use crate::errors::ApiError;
use crate::util::exec::run_capture;
use crate::util::shell_join;

const QUERY_TIMEOUT: Duration = Duration::from_secs(20);
const START_PROBE_ATTEMPTS: usize = 20;
const START_PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// In-container binary executed for warm attach; the same entrypoint the
/// image runs for fresh containers.
pub fn entrypoint_bin() -> String {
    env::var("ADZ_RUNNER_ENTRYPOINT")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "adz-entrypoint".to_string())
}

/// Side-channel handle for a live attach: resize, detach, reap.
pub trait AttachControl: Send + Sync {
    fn resize(&self, cols: u16, rows: u16) -> io::Result<()>;
    /// Kill the CLI client (detach). Never touches the container itself.
    fn shutdown(&self);
    /// Reap the CLI client; returns its exit code when available.
    fn wait_client(&self) -> Option<i32>;
}

/// One bidirectional TTY stream plus its control handle.
pub struct AttachStream {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub control: Arc<dyn AttachControl>,
}

struct PtyAttach {
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
}

impl AttachControl for PtyAttach {
    fn resize(&self, cols: u16, rows: u16) -> io::Result<()> {
        let master = self.master.lock().unwrap();
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }

    fn shutdown(&self) {
        if let Ok(mut killer) = self.killer.lock() {
            let _ = killer.kill();
        }
    }

    fn wait_client(&self) -> Option<i32> {
        self.child
            .lock()
            .ok()
            .and_then(|mut c| c.wait().ok())
            .map(|status| status.exit_code() as i32)
    }
}

#[derive(Debug, Clone)]
pub struct FreshSpec {
    pub image: String,
    pub fingerprint: MountFingerprint,
    pub run_id: String,
    pub container_name: String,
    pub extra_env: Vec<(String, String)>,
    pub argv: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub engine: Engine,
    pub extra_env: Vec<(String, String)>,
    pub argv: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MountPoint {
    pub source: String,
    pub destination: String,
    pub rw: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerInspect {
    pub status: String,
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<MountPoint>,
}

/// Capability set consumed by the orchestrator and warm pool. Everything
/// above this trait is runtime-agnostic.
pub trait ContainerDriver: Send + Sync {
    fn create_fresh(&self, spec: &FreshSpec) -> Result<AttachStream, ApiError>;
    fn exec_in_warm(&self, warm_ref: &str, spec: &ExecSpec) -> Result<AttachStream, ApiError>;
    fn create_warm(
        &self,
        fp: &MountFingerprint,
        image: &str,
        name: &str,
    ) -> Result<String, ApiError>;
    fn stop(&self, cref: &str, grace_secs: u64);
    fn kill(&self, cref: &str);
    fn remove(&self, cref: &str, force: bool);
    /// Block until the container exits; returns its exit code.
    fn wait(&self, cref: &str, timeout: Duration) -> Option<i32>;
    fn inspect(&self, cref: &str) -> io::Result<ContainerInspect>;
    fn list(&self, label_filters: &[(String, String)]) -> io::Result<Vec<ContainerSummary>>;
    /// Fire-and-forget exec inside a running container (signal delivery).
    fn exec_detached(&self, cref: &str, argv: &[String]);
}

/// docker-CLI implementation.
pub struct CliDriver {
    runtime: PathBuf,
    verbose: bool,
}

impl CliDriver {
    pub fn new(runtime: PathBuf, verbose: bool) -> CliDriver {
        CliDriver { runtime, verbose }
    }

    fn log_invocation(&self, args: &[String]) {
        if self.verbose {
            let mut preview = vec!["docker".to_string()];
            preview.extend(args.iter().cloned());
            log_info_stderr(
                color_enabled_stderr(),
                &format!("adz-runner: docker: {}", shell_join(&preview)),
            );
        }
    }

    fn status_quiet(&self, args: &[String]) -> bool {
        self.log_invocation(args);
        Command::new(&self.runtime)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn spawn_attached(&self, args: Vec<String>) -> Result<(AttachStream, Arc<PtyAttach>), ApiError> {
        self.log_invocation(&args);
        let pty = native_pty_system();
        let pair = pty
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ApiError::RuntimeError(format!("openpty failed: {e}")))?;

        let mut cmd = CommandBuilder::new(&self.runtime);
        cmd.args(&args);
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| ApiError::RuntimeError(format!("failed to spawn docker client: {e}")))?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ApiError::RuntimeError(format!("pty reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| ApiError::RuntimeError(format!("pty writer: {e}")))?;
        let killer = child.clone_killer();

        let pty = Arc::new(PtyAttach {
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
            child: Mutex::new(child),
        });

        let stream = AttachStream {
            reader,
            writer,
            control: pty.clone(),
        };
        Ok((stream, pty))
    }

    /// Brief retry probe that the container actually started; absorbs the
    /// gap between spawning the CLI client and the daemon creating state.
    fn probe_started(&self, name: &str, pty: &PtyAttach) -> Result<(), ApiError> {
        for _ in 0..START_PROBE_ATTEMPTS {
            if self.inspect(name).is_ok() {
                return Ok(());
            }
            // Client already gone and no container: startup failed.
            if let Ok(mut child) = pty.child.lock() {
                if let Ok(Some(_)) = child.try_wait() {
                    return Err(ApiError::RuntimeError(format!(
                        "container {name} failed to start"
                    )));
                }
            }
            std::thread::sleep(START_PROBE_INTERVAL);
        }
        Ok(())
    }
}

pub fn build_fresh_args(spec: &FreshSpec) -> Vec<String> {
    let fp = &spec.fingerprint;
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "-it".to_string(),
        "--name".to_string(),
        spec.container_name.clone(),
    ];
    args.push("-v".to_string());
    args.push(format!("{}:/workspace:rw", fp.workspace.display()));
    args.push("-v".to_string());
    args.push(format!("{}:/home/agent/.creds:rw", fp.creds.display()));
    args.push("-w".to_string());
    args.push("/workspace".to_string());
    args.push("-e".to_string());
    args.push(format!("ENGINE={}", fp.engine));
    args.push("-e".to_string());
    args.push("TERM=xterm-256color".to_string());
    for (k, v) in &spec.extra_env {
        args.push("-e".to_string());
        args.push(format!("{k}={v}"));
    }
    if fp.read_only_root {
        args.push("--read-only".to_string());
        args.push("--tmpfs".to_string());
        args.push("/tmp:rw,noexec,nosuid,size=256m".to_string());
    }
    if let Some(ug) = &fp.uid_gid {
        args.push("--user".to_string());
        args.push(ug.clone());
    }
    for (k, v) in fp.run_labels(&spec.run_id) {
        args.push("-l".to_string());
        args.push(format!("{k}={v}"));
    }
    args.push(spec.image.clone());
    args.extend(spec.argv.iter().cloned());
    args
}

pub fn build_warm_create_args(fp: &MountFingerprint, image: &str, name: &str) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        name.to_string(),
    ];
    args.push("-v".to_string());
    args.push(format!("{}:/workspace:rw", fp.workspace.display()));
    args.push("-v".to_string());
    args.push(format!("{}:/home/agent/.creds:rw", fp.creds.display()));
    args.push("-w".to_string());
    args.push("/workspace".to_string());
    args.push("-e".to_string());
    args.push(format!("ENGINE={}", fp.engine));
    if fp.read_only_root {
        args.push("--read-only".to_string());
        args.push("--tmpfs".to_string());
        args.push("/tmp:rw,noexec,nosuid,size=256m".to_string());
    }
    if let Some(ug) = &fp.uid_gid {
        args.push("--user".to_string());
        args.push(ug.clone());
    }
    for (k, v) in fp.warm_labels() {
        args.push("-l".to_string());
        args.push(format!("{k}={v}"));
    }
    // The runtime keeps the TTY-less container alive on an indefinite sleep;
    // exec sessions supply the real command.
    args.push("--entrypoint".to_string());
    args.push("sleep".to_string());
    args.push(image.to_string());
    args.push("infinity".to_string());
    args
}

pub fn build_exec_args(warm_ref: &str, spec: &ExecSpec) -> Vec<String> {
    let mut args = vec![
        "exec".to_string(),
        "-it".to_string(),
        "-e".to_string(),
        format!("ENGINE={}", spec.engine),
        "-e".to_string(),
        "TERM=xterm-256color".to_string(),
    ];
    for (k, v) in &spec.extra_env {
        args.push("-e".to_string());
        args.push(format!("{k}={v}"));
    }
    args.push("-w".to_string());
    args.push("/workspace".to_string());
    args.push(warm_ref.to_string());
    args.push(entrypoint_bin());
    args.extend(spec.argv.iter().cloned());
    args
}

impl ContainerDriver for CliDriver {
    #[cfg_attr(feature = "otel", instrument(level = "info", skip(self, spec), fields(container = %spec.container_name)))]
    fn create_fresh(&self, spec: &FreshSpec) -> Result<AttachStream, ApiError> {
        let (stream, pty) = self.spawn_attached(build_fresh_args(spec))?;
        self.probe_started(&spec.container_name, &pty)?;
        Ok(stream)
    }

    #[cfg_attr(feature = "otel", instrument(level = "info", skip(self, spec)))]
    fn exec_in_warm(&self, warm_ref: &str, spec: &ExecSpec) -> Result<AttachStream, ApiError> {
        self.spawn_attached(build_exec_args(warm_ref, spec))
            .map(|(stream, _)| stream)
    }

    fn create_warm(
        &self,
        fp: &MountFingerprint,
        image: &str,
        name: &str,
    ) -> Result<String, ApiError> {
        let args = build_warm_create_args(fp, image, name);
        self.log_invocation(&args);
        let out = run_capture(&self.runtime, &args, QUERY_TIMEOUT)
            .map_err(|e| ApiError::RuntimeError(e.to_string()))?;
        if !out.success() {
            return Err(ApiError::RuntimeError(format!(
                "warm container create failed: {}",
                out.stderr.trim()
            )));
        }
        let id = out.stdout.trim().to_string();
        Ok(if id.is_empty() { name.to_string() } else { id })
    }

    fn stop(&self, cref: &str, grace_secs: u64) {
        let _ = self.status_quiet(&[
            "stop".to_string(),
            "--time".to_string(),
            grace_secs.to_string(),
            cref.to_string(),
        ]);
    }

    fn kill(&self, cref: &str) {
        let _ = self.status_quiet(&["kill".to_string(), cref.to_string()]);
    }

    fn remove(&self, cref: &str, force: bool) {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(cref.to_string());
        let _ = self.status_quiet(&args);
    }

    fn wait(&self, cref: &str, timeout: Duration) -> Option<i32> {
        let args = vec!["wait".to_string(), cref.to_string()];
        self.log_invocation(&args);
        run_capture(&self.runtime, &args, timeout)
            .ok()
            .filter(|o| o.success())
            .and_then(|o| o.stdout.trim().parse::<i32>().ok())
    }

    fn inspect(&self, cref: &str) -> io::Result<ContainerInspect> {
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{json .}}".to_string(),
            cref.to_string(),
        ];
        let out = run_capture(&self.runtime, &args, QUERY_TIMEOUT)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        if !out.success() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such container: {cref}"),
            ));
        }
        let value: serde_json::Value = serde_json::from_str(out.stdout.trim())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        Ok(parse_inspect(&value))
    }

    fn list(&self, label_filters: &[(String, String)]) -> io::Result<Vec<ContainerSummary>> {
        let mut args = vec!["ps".to_string(), "--no-trunc".to_string()];
        for (k, v) in label_filters {
            args.push("--filter".to_string());
            args.push(format!("label={k}={v}"));
        }
        args.push("--format".to_string());
        args.push("{{.ID}}\t{{.Names}}".to_string());
        let out = run_capture(&self.runtime, &args, QUERY_TIMEOUT)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        if !out.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("docker ps failed: {}", out.stderr.trim()),
            ));
        }
        let mut refs = Vec::new();
        for line in out.stdout.lines() {
            let mut cols = line.split('\t');
            let id = cols.next().unwrap_or("").trim();
            let name = cols.next().unwrap_or("").trim();
            if !id.is_empty() {
                refs.push(ContainerSummary {
                    id: id.to_string(),
                    name: name.to_string(),
                });
            }
        }
        Ok(refs)
    }

    fn exec_detached(&self, cref: &str, argv: &[String]) {
        let mut args = vec!["exec".to_string(), "-d".to_string(), cref.to_string()];
        args.extend(argv.iter().cloned());
        let _ = self.status_quiet(&args);
    }
}

fn parse_inspect(value: &serde_json::Value) -> ContainerInspect {
    let status = value
        .pointer("/State/Status")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    let mut labels = BTreeMap::new();
    if let Some(map) = value.pointer("/Config/Labels").and_then(|v| v.as_object()) {
        for (k, v) in map {
            if let Some(s) = v.as_str() {
                labels.insert(k.clone(), s.to_string());
            }
        }
    }
    let mut mounts = Vec::new();
    if let Some(list) = value.get("Mounts").and_then(|v| v.as_array()) {
        for m in list {
            mounts.push(MountPoint {
                source: m
                    .get("Source")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                destination: m
                    .get("Destination")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                rw: m.get("RW").and_then(|v| v.as_bool()).unwrap_or(false),
            });
        }
    }
    ContainerInspect {
        status,
        labels,
        mounts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::labels::MountFingerprint;
    use std::path::Path;

    fn fresh_spec() -> FreshSpec {
        FreshSpec {
            image: "adz/cli-runner:latest".to_string(),
            fingerprint: MountFingerprint::new(
                Engine::Codex,
                Path::new("/tmp/ws"),
                Path::new("/tmp/cr"),
                false,
                None,
            ),
            run_id: "r1".to_string(),
            container_name: "adz-codex-t-aabbccdd".to_string(),
            extra_env: vec![("FOO".to_string(), "bar".to_string())],
            argv: vec!["--resume".to_string()],
        }
    }

    #[test]
    fn test_fresh_args_shape() {
        let args = build_fresh_args(&fresh_spec());
        let joined = args.join(" ");
        assert!(joined.starts_with("run --rm -it --name adz-codex-t-aabbccdd"));
        assert!(joined.contains("-v /tmp/ws:/workspace:rw"));
        assert!(joined.contains("-v /tmp/cr:/home/agent/.creds:rw"));
        assert!(joined.contains("-w /workspace"));
        assert!(joined.contains("-e ENGINE=codex"));
        assert!(joined.contains("-e TERM=xterm-256color"));
        assert!(joined.contains("-e FOO=bar"));
        assert!(joined.contains("-l adz.runId=r1"));
        assert!(!joined.contains("--read-only"));
        assert!(joined.ends_with("adz/cli-runner:latest --resume"));
    }

    #[test]
    fn test_fresh_args_read_only_and_user() {
        let mut spec = fresh_spec();
        spec.fingerprint.read_only_root = true;
        spec.fingerprint.uid_gid = Some("1000:1000".to_string());
        let joined = build_fresh_args(&spec).join(" ");
        assert!(joined.contains("--read-only --tmpfs /tmp:rw,noexec,nosuid,size=256m"));
        assert!(joined.contains("--user 1000:1000"));
    }

    #[test]
    fn test_warm_create_args_sleep_entrypoint_and_labels() {
        let fp = MountFingerprint::new(
            Engine::Gemini,
            Path::new("/tmp/ws"),
            Path::new("/tmp/cr"),
            true,
            None,
        );
        let joined = build_warm_create_args(&fp, "img:1", "adz-warm-gemini-x").join(" ");
        assert!(joined.starts_with("run -d --name adz-warm-gemini-x"));
        assert!(joined.contains("-l adz.warm=true"));
        assert!(joined.contains("-l adz.readonly=1"));
        assert!(joined.ends_with("--entrypoint sleep img:1 infinity"));
        assert!(!joined.contains("adz.runId"));
    }

    #[test]
    fn test_exec_args_use_entrypoint() {
        let spec = ExecSpec {
            engine: Engine::Opencode,
            extra_env: Vec::new(),
            argv: vec!["--help".to_string()],
        };
        let joined = build_exec_args("warmref", &spec).join(" ");
        assert!(joined.starts_with("exec -it -e ENGINE=opencode"));
        assert!(joined.contains("-w /workspace warmref adz-entrypoint --help"));
    }

    #[test]
    fn test_parse_inspect_extracts_fields() {
        let raw = serde_json::json!({
            "State": {"Status": "running"},
            "Config": {"Labels": {"adz.engine": "codex", "adz.warm": "true"}},
            "Mounts": [
                {"Source": "/tmp/ws", "Destination": "/workspace", "RW": true},
                {"Source": "/tmp/cr", "Destination": "/home/agent/.creds", "RW": true}
            ]
        });
        let info = parse_inspect(&raw);
        assert_eq!(info.status, "running");
        assert_eq!(info.labels.get("adz.engine").unwrap(), "codex");
        assert_eq!(info.mounts.len(), 2);
        assert!(info.mounts[0].rw);
    }
}
