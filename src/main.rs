use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use adz_runner::cli::{Cli, Cmd};
use adz_runner::{
    banner, color_enabled_stderr, container_runtime_path, doctor, exit_code_for_io_error,
    log_error_stderr, reaper, server, set_color_mode, CliDriver, Config, EventBus, HttpServer,
    Orchestrator, WarmPool,
};

#[cfg(unix)]
fn install_signal_handlers() {
    use nix::sys::signal::{self, SigHandler, Signal};
    extern "C" fn on_signal(_: i32) {
        server::request_shutdown();
    }
    unsafe {
        let _ = signal::signal(Signal::SIGINT, SigHandler::Handler(on_signal));
        let _ = signal::signal(Signal::SIGTERM, SigHandler::Handler(on_signal));
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Some(mode) = cli.color {
        set_color_mode(mode);
    }
    if cli.verbose {
        std::env::set_var("ADZ_RUNNER_VERBOSE", "1");
    }

    #[cfg(feature = "otel")]
    let _telemetry = adz_runner::telemetry::telemetry_init();

    match cli.command {
        Cmd::Serve {
            port,
            bind,
            image,
            idle_timeout,
            allow_workspace_root,
            allow_creds_root,
        } => {
            let mut cfg = Config::from_env();
            if let Some(p) = port {
                cfg.port = p;
            }
            if let Some(b) = bind {
                cfg.bind_host = b;
            }
            if let Some(i) = image {
                cfg.image = i;
            }
            if let Some(t) = idle_timeout {
                cfg.idle_timeout_sec = t;
            }
            if !allow_workspace_root.is_empty() {
                cfg.allow_workspace_roots = allow_workspace_root;
            }
            if !allow_creds_root.is_empty() {
                cfg.allow_creds_roots = allow_creds_root;
            }
            cfg.verbose = cfg.verbose || cli.verbose;

            if !cli.quiet {
                banner::print_startup_banner(&cfg.image);
            }

            let runtime = match container_runtime_path() {
                Ok(p) => p,
                Err(e) => {
                    log_error_stderr(
                        color_enabled_stderr(),
                        &format!("adz-runner: error: {e}"),
                    );
                    return ExitCode::from(exit_code_for_io_error(&e));
                }
            };

            let driver = Arc::new(CliDriver::new(runtime, cfg.verbose));
            let pool = Arc::new(WarmPool::new(driver.clone(), cfg.image.clone()));
            let bus = Arc::new(EventBus::new());
            let orch = Arc::new(Orchestrator::new(
                driver,
                pool,
                bus,
                cfg.image.clone(),
                cfg.allow_workspace_roots.clone(),
                cfg.allow_creds_roots.clone(),
                cfg.verbose,
            ));

            let _reaper = reaper::spawn(orch.clone(), cfg.idle_timeout_sec);
            install_signal_handlers();

            match HttpServer::bind(cfg, orch) {
                Ok(server) => {
                    server.run();
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    log_error_stderr(
                        color_enabled_stderr(),
                        &format!("adz-runner: error: bind failed: {e}"),
                    );
                    ExitCode::from(1)
                }
            }
        }
        Cmd::Doctor { creds } => {
            let cfg = Config::from_env();
            ExitCode::from(doctor::run(&cfg, creds.as_deref()))
        }
    }
}
