//! Warm pool: long-lived idle containers indexed by mount fingerprint,
//! reusable for fast exec-based attach.
use std::io;
use std::sync::Arc;

use serde::Serialize;

use crate::docker::driver::{ContainerDriver, ContainerSummary};
use crate::docker::labels::{
    MountFingerprint, LABEL_CREDS, LABEL_ENGINE, LABEL_READONLY, LABEL_UIDGID, LABEL_WARM,
    LABEL_WORKSPACE,
};
use crate::errors::ApiError;
use crate::util::id::short_hex8;

#[derive(Debug, Clone, Serialize)]
pub struct WarmContainer {
    pub id: String,
    pub name: String,
    pub engine: String,
    pub workspace: String,
    pub creds: String,
    pub readonly: bool,
    pub uidgid: String,
    pub status: String,
}

pub struct WarmPool {
    driver: Arc<dyn ContainerDriver>,
    image: String,
}

impl WarmPool {
    pub fn new(driver: Arc<dyn ContainerDriver>, image: String) -> WarmPool {
        WarmPool { driver, image }
    }

    /// A running container whose labels equal the fingerprint. Labels fully
    /// determine identity, so the first hit is the only possible hit.
    pub fn find(&self, fp: &MountFingerprint) -> Option<ContainerSummary> {
        let filters = fp.warm_labels();
        self.driver
            .list(&filters)
            .ok()
            .and_then(|mut refs| refs.drain(..).next())
    }

    /// Return the existing warm container for the fingerprint, or create and
    /// start one.
    pub fn ensure(&self, fp: &MountFingerprint) -> Result<ContainerSummary, ApiError> {
        if let Some(existing) = self.find(fp) {
            return Ok(existing);
        }
        let name = format!("adz-warm-{}-{}", fp.engine, short_hex8());
        let id = self.driver.create_warm(fp, &self.image, &name)?;
        Ok(ContainerSummary { id, name })
    }

    pub fn list(&self) -> io::Result<Vec<WarmContainer>> {
        let refs = self
            .driver
            .list(&[(LABEL_WARM.to_string(), "true".to_string())])?;
        let mut out = Vec::new();
        for r in refs {
            let Ok(info) = self.driver.inspect(&r.id) else {
                continue;
            };
            let get = |k: &str| info.labels.get(k).cloned().unwrap_or_default();
            out.push(WarmContainer {
                id: r.id,
                name: r.name,
                engine: get(LABEL_ENGINE),
                workspace: get(LABEL_WORKSPACE),
                creds: get(LABEL_CREDS),
                readonly: get(LABEL_READONLY) == "1",
                uidgid: get(LABEL_UIDGID),
                status: info.status,
            });
        }
        Ok(out)
    }

    /// Stop and remove a warm container by id or name. Returns false when no
    /// such warm container exists.
    pub fn destroy(&self, id: &str) -> bool {
        let known = match self.driver.inspect(id) {
            Ok(info) => info.labels.get(LABEL_WARM).map(|v| v == "true").unwrap_or(false),
            Err(_) => false,
        };
        if !known {
            return false;
        }
        self.driver.stop(id, 1);
        self.driver.remove(id, true);
        true
    }
}
