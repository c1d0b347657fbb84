use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::color::ColorMode;

#[derive(Parser, Debug)]
#[command(
    name = "adz-runner",
    version,
    about = "Spawn, attach to and reap containerized CLI agent sessions (codex, gemini, opencode) over HTTP.",
    after_long_help = "Examples:\n  adz-runner serve --port 8080 --allow-workspace-root /srv/workspaces\n  ALLOW_WORKSPACE_ROOTS=/srv/ws IDLE_TIMEOUT_SEC=900 adz-runner serve\n  adz-runner doctor --creds ~/.adz-creds\n"
)]
pub struct Cli {
    /// Print detailed execution info (every docker invocation)
    #[arg(long)]
    pub verbose: bool,

    /// Suppress the startup banner
    #[arg(long, short = 'q')]
    pub quiet: bool,

    /// Colorize output: auto|always|never
    #[arg(long = "color", value_enum)]
    pub color: Option<ColorMode>,

    #[command(subcommand)]
    pub command: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Start the control-plane HTTP server
    Serve {
        /// Listen port (overrides PORT)
        #[arg(long)]
        port: Option<u16>,
        /// Bind host (overrides BIND_HOST)
        #[arg(long)]
        bind: Option<String>,
        /// Container image for sessions (overrides CLI_RUNNER_IMAGE)
        #[arg(long)]
        image: Option<String>,
        /// Idle timeout in seconds; 0 disables the reaper (overrides IDLE_TIMEOUT_SEC)
        #[arg(long = "idle-timeout")]
        idle_timeout: Option<u64>,
        /// Allowed workspace root (repeatable; overrides ALLOW_WORKSPACE_ROOTS)
        #[arg(long = "allow-workspace-root")]
        allow_workspace_root: Vec<PathBuf>,
        /// Allowed credentials root (repeatable; overrides ALLOW_CREDS_ROOTS)
        #[arg(long = "allow-creds-root")]
        allow_creds_root: Vec<PathBuf>,
    },

    /// Run diagnostics to check environment and configuration
    Doctor {
        /// Credentials pocket to evaluate per-engine readiness for
        #[arg(long)]
        creds: Option<PathBuf>,
    },
}
