//! Periodic idle sweep: stops runs whose activity clock has gone quiet.
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::color::{color_enabled_stderr, log_info_stderr};
use crate::orchestrator::Orchestrator;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Spawn the reaper thread. A zero timeout disables the reaper entirely and
/// returns None.
pub fn spawn(orch: Arc<Orchestrator>, idle_timeout_sec: u64) -> Option<JoinHandle<()>> {
    if idle_timeout_sec == 0 {
        return None;
    }
    let builder = std::thread::Builder::new().name("idle-reaper".to_string());
    builder
        .spawn(move || loop {
            std::thread::sleep(SWEEP_INTERVAL);
            let stopped = orch.sweep_idle(idle_timeout_sec);
            for id in stopped {
                log_info_stderr(
                    color_enabled_stderr(),
                    &format!("adz-runner: idle timeout ({idle_timeout_sec}s) stopped run {id}"),
                );
            }
        })
        .ok()
}
