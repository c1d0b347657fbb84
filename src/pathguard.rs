//! Path admission: the only defense between the HTTP surface and the host
//! filesystem. Purely lexical; never touches the filesystem.
use std::path::{Component, Path, PathBuf};

use crate::errors::ApiError;

/// Lexically normalize an absolute path: resolve `.` and `..`, collapse
/// separators. `..` at the root stays at the root.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::RootDir | Component::Prefix(_) => out.push(comp.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
                if out.as_os_str().is_empty() {
                    out.push("/");
                }
            }
            Component::Normal(seg) => out.push(seg),
        }
    }
    if out.as_os_str().is_empty() {
        out.push("/");
    }
    out
}

/// Accept `path` only if it is absolute after normalization and equal to, or
/// a strict descendant of, at least one allow-list root. Containment is
/// component-wise: `/a/b` never admits `/a/bc`.
pub fn validate(path: &str, allow: &[PathBuf]) -> Result<PathBuf, ApiError> {
    let raw = Path::new(path);
    if !raw.is_absolute() {
        return Err(ApiError::InvalidPath(format!(
            "path must be absolute: {path:?}"
        )));
    }
    let norm = normalize(raw);
    for root in allow {
        let root_norm = normalize(root);
        if norm == root_norm || norm.starts_with(&root_norm) {
            return Ok(norm);
        }
    }
    Err(ApiError::PathNotAllowed(format!(
        "path {} is outside the allowed roots",
        norm.display()
    )))
}

/// Containment check for already-normalized paths.
pub fn is_under(path: &Path, root: &Path) -> bool {
    let p = normalize(path);
    let r = normalize(root);
    p == r || p.starts_with(&r)
}
