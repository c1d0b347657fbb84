//! adz-runner: a host-side control plane that spawns, attaches to, and reaps
//! short-lived containerized CLI agent sessions.
//!
//! Each session ("run") executes one engine (`codex`, `gemini` or
//! `opencode`) inside a disposable container whose only persistent state
//! is a host-mounted workspace and a credentials pocket. Operators drive
//! the daemon over HTTP: create runs, stream the pseudo-TTY both ways,
//! follow lifecycle and artifact events, and maintain a warm pool of idle
//! containers for fast exec-based attach.
pub mod artifacts;
pub mod banner;
pub mod cli;
pub mod color;
pub mod config;
pub mod creds;
pub mod docker;
pub mod doctor;
pub mod engine;
pub mod errors;
pub mod events;
pub mod orchestrator;
pub mod pathguard;
pub mod reaper;
pub mod server;
#[cfg(feature = "otel")]
pub mod telemetry;
pub mod transcript;
pub mod util;
pub mod warmpool;

pub use color::{color_enabled_stderr, log_error_stderr, log_info_stderr, paint, set_color_mode,
    warn_print, ColorMode};
pub use config::Config;
pub use docker::driver::{CliDriver, ContainerDriver};
pub use docker::runtime::container_runtime_path;
pub use engine::Engine;
pub use errors::{exit_code_for_io_error, ApiError};
pub use events::EventBus;
pub use orchestrator::Orchestrator;
pub use server::HttpServer;
pub use warmpool::WarmPool;
