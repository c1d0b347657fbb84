//! Credential pocket: the `<creds>/.env` key/value file and per-engine
//! readiness rules.
//!
//! File format is deliberately dumb: one `KEY=VALUE` per line, `#` comments,
//! surrounding single or double quotes stripped on read, no escaping.
//! Writes overlay the current map and rewrite the whole file; keys are never
//! deleted (an explicit empty value is the only way to blank one).
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::Serialize;

use crate::engine::Engine;
use crate::util::strip_outer_quotes;

pub const ENV_FILE: &str = ".env";

pub fn read_env(creds_dir: &Path) -> io::Result<BTreeMap<String, String>> {
    let path = creds_dir.join(ENV_FILE);
    let raw = match fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e),
    };
    let mut map = BTreeMap::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        map.insert(key.to_string(), strip_outer_quotes(v.trim()).to_string());
    }
    Ok(map)
}

/// Overlay `updates` on the current map and atomically rewrite the file.
/// Creates `creds_dir` if missing. Returns the merged map.
pub fn write_env(
    creds_dir: &Path,
    updates: &BTreeMap<String, String>,
) -> io::Result<BTreeMap<String, String>> {
    fs::create_dir_all(creds_dir)?;
    let mut merged = read_env(creds_dir)?;
    for (k, v) in updates {
        let key = k.trim();
        // Keys that would corrupt the line format are silently skipped.
        if key.is_empty() || key.contains('=') || key.contains('\n') || v.contains('\n') {
            continue;
        }
        merged.insert(key.to_string(), v.clone());
    }

    let mut out = String::new();
    for (k, v) in &merged {
        out.push_str(k);
        out.push('=');
        out.push_str(v);
        out.push('\n');
    }

    let path = creds_dir.join(ENV_FILE);
    let tmp = creds_dir.join(format!("{}.tmp-{}", ENV_FILE, std::process::id()));
    fs::write(&tmp, out)?;
    fs::rename(&tmp, &path)?;
    Ok(merged)
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessFound {
    pub keys: Vec<String>,
    pub dirs: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub engine: Engine,
    pub ready: bool,
    pub indeterminate: bool,
    pub reasons: Vec<String>,
    pub found: ReadinessFound,
}

fn dir_non_empty(creds_dir: &Path, name: &str) -> io::Result<bool> {
    let p = creds_dir.join(name);
    match fs::read_dir(&p) {
        Ok(mut rd) => Ok(rd.next().is_some()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Per-engine readiness. Pure with respect to its inputs: unchanged files
/// yield an identical report.
pub fn check_readiness(engine: Engine, creds_dir: &Path) -> Readiness {
    let mut reasons = Vec::new();
    let mut found = ReadinessFound {
        keys: Vec::new(),
        dirs: Vec::new(),
    };

    let env = match read_env(creds_dir) {
        Ok(m) => m,
        Err(e) => {
            return Readiness {
                engine,
                ready: false,
                indeterminate: true,
                reasons: vec![format!("could not read {}: {}", ENV_FILE, e)],
                found,
            }
        }
    };

    let has_key = |name: &str| env.get(name).map(|v| !v.is_empty()).unwrap_or(false);

    let (key_names, dir_names): (&[&str], &[&str]) = match engine {
        Engine::Codex => (&["OPENAI_API_KEY"], &["codex"]),
        Engine::Gemini => (&["GEMINI_API_KEY"], &["gemini", "gcloud"]),
        Engine::Opencode => (
            &["OPENAI_API_KEY", "ANTHROPIC_API_KEY", "GEMINI_API_KEY"],
            &["opencode"],
        ),
    };

    for k in key_names {
        if has_key(k) {
            found.keys.push((*k).to_string());
        }
    }
    let mut indeterminate = false;
    for d in dir_names {
        match dir_non_empty(creds_dir, d) {
            Ok(true) => found.dirs.push((*d).to_string()),
            Ok(false) => {}
            Err(e) => {
                indeterminate = true;
                reasons.push(format!("could not inspect {}/: {}", d, e));
            }
        }
    }

    let ready = !found.keys.is_empty() || !found.dirs.is_empty();
    if !ready {
        reasons.push(format!(
            "set one of {} in {} or populate one of {} under the credentials pocket",
            key_names.join("/"),
            ENV_FILE,
            dir_names.join("/, ")
        ));
    }

    Readiness {
        engine,
        ready,
        indeterminate,
        reasons,
        found,
    }
}
