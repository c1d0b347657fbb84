//! Container label schema and the mount fingerprint.
//!
//! Labels fully determine container identity: warm containers carry the
//! fingerprint plus `adz.warm=true`; fresh run containers carry the
//! fingerprint core plus `adz.runId`. A warm container never has a run id
//! label and a fresh container never has the warm marker.
use std::path::PathBuf;

use crate::engine::Engine;
use crate::pathguard::normalize;

pub const LABEL_ENGINE: &str = "adz.engine";
pub const LABEL_WORKSPACE: &str = "adz.workspace";
pub const LABEL_CREDS: &str = "adz.creds";
pub const LABEL_RUN_ID: &str = "adz.runId";
pub const LABEL_WARM: &str = "adz.warm";
pub const LABEL_READONLY: &str = "adz.readonly";
pub const LABEL_UIDGID: &str = "adz.uidgid";

/// The tuple that makes container configurations interchangeable. Two
/// fingerprints are equal iff every field matches after path normalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MountFingerprint {
    pub engine: Engine,
    pub workspace: PathBuf,
    pub creds: PathBuf,
    pub read_only_root: bool,
    /// "uid:gid" when the container should run as a specific user.
    pub uid_gid: Option<String>,
}

impl MountFingerprint {
    pub fn new(
        engine: Engine,
        workspace: &std::path::Path,
        creds: &std::path::Path,
        read_only_root: bool,
        uid_gid: Option<String>,
    ) -> MountFingerprint {
        MountFingerprint {
            engine,
            workspace: normalize(workspace),
            creds: normalize(creds),
            read_only_root,
            uid_gid: uid_gid.filter(|s| !s.trim().is_empty()),
        }
    }

    /// Label set for a warm container (byte-for-byte schema).
    pub fn warm_labels(&self) -> Vec<(String, String)> {
        vec![
            (LABEL_WARM.to_string(), "true".to_string()),
            (LABEL_ENGINE.to_string(), self.engine.as_str().to_string()),
            (
                LABEL_WORKSPACE.to_string(),
                self.workspace.display().to_string(),
            ),
            (LABEL_CREDS.to_string(), self.creds.display().to_string()),
            (
                LABEL_READONLY.to_string(),
                if self.read_only_root { "1" } else { "0" }.to_string(),
            ),
            (
                LABEL_UIDGID.to_string(),
                self.uid_gid.clone().unwrap_or_default(),
            ),
        ]
    }

    /// Label set for a fresh run container.
    pub fn run_labels(&self, run_id: &str) -> Vec<(String, String)> {
        vec![
            (LABEL_ENGINE.to_string(), self.engine.as_str().to_string()),
            (
                LABEL_WORKSPACE.to_string(),
                self.workspace.display().to_string(),
            ),
            (LABEL_CREDS.to_string(), self.creds.display().to_string()),
            (LABEL_RUN_ID.to_string(), run_id.to_string()),
        ]
    }
}
