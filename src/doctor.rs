//! Environment diagnostics: runtime presence, daemon reachability, allow
//! roots, credential readiness.
use std::path::Path;
use std::time::Duration;

use crate::color::{color_enabled_stderr, paint};
use crate::config::Config;
use crate::creds::check_readiness;
use crate::docker::driver::{build_fresh_args, FreshSpec};
use crate::docker::labels::MountFingerprint;
use crate::docker::runtime::container_runtime_path;
use crate::engine::Engine;
use crate::util::exec::run_capture;
use crate::util::shell_join;

fn check_line(use_color: bool, ok: bool, label: &str, detail: &str) {
    let mark = if ok {
        paint(use_color, "\x1b[32m", "ok")
    } else {
        paint(use_color, "\x1b[31m", "FAIL")
    };
    eprintln!("  [{mark}] {label}: {detail}");
}

/// Run diagnostics; returns the process exit code.
pub fn run(cfg: &Config, creds_dir: Option<&Path>) -> u8 {
    let use_color = color_enabled_stderr();
    let mut failed = false;
    eprintln!("adz-runner doctor");

    let runtime = container_runtime_path();
    match &runtime {
        Ok(p) => check_line(use_color, true, "container runtime", &p.display().to_string()),
        Err(e) => {
            check_line(use_color, false, "container runtime", &e.to_string());
            failed = true;
        }
    }

    if let Ok(rt) = &runtime {
        let daemon = run_capture(
            rt,
            &[
                "info".to_string(),
                "--format".to_string(),
                "{{.ServerVersion}}".to_string(),
            ],
            Duration::from_secs(10),
        );
        match daemon {
            Ok(out) if out.success() => {
                check_line(use_color, true, "daemon", out.stdout.trim());
            }
            Ok(out) => {
                check_line(use_color, false, "daemon", out.stderr.trim());
                failed = true;
            }
            Err(e) => {
                check_line(use_color, false, "daemon", &e.to_string());
                failed = true;
            }
        }
    }

    check_line(use_color, true, "image", &cfg.image);
    for (label, roots) in [
        ("workspace roots", &cfg.allow_workspace_roots),
        ("creds roots", &cfg.allow_creds_roots),
    ] {
        for root in roots.iter() {
            let exists = root.is_dir();
            check_line(use_color, exists, label, &root.display().to_string());
            if !exists {
                failed = true;
            }
        }
    }

    if let Some(dir) = creds_dir {
        for engine in Engine::ALL {
            let r = check_readiness(engine, dir);
            let detail = if r.ready {
                format!(
                    "ready (keys: {:?}, dirs: {:?})",
                    r.found.keys, r.found.dirs
                )
            } else {
                r.reasons.join("; ")
            };
            check_line(use_color, r.ready, engine.as_str(), &detail);
        }
    }

    // Sample invocation preview for the first allowed workspace/creds pair.
    if let (Some(ws), Some(cr)) = (
        cfg.allow_workspace_roots.first(),
        cfg.allow_creds_roots.first(),
    ) {
        let spec = FreshSpec {
            image: cfg.image.clone(),
            fingerprint: MountFingerprint::new(Engine::Codex, ws, cr, false, None),
            run_id: "rPREVIEW".to_string(),
            container_name: "adz-codex-PREVIEW".to_string(),
            extra_env: Vec::new(),
            argv: Vec::new(),
        };
        let mut preview = vec!["docker".to_string()];
        preview.extend(build_fresh_args(&spec));
        eprintln!("  sample run: {}", shell_join(&preview));
    }

    if failed {
        1
    } else {
        0
    }
}
