//! In-line artifact detection over the engine's output stream.
//!
//! The scanner is line-oriented: each outbound chunk is decoded as UTF-8
//! (lossy), split on `\r?\n`, and complete lines are matched for URLs, pull
//! request links, workspace file paths and authentication warnings. A
//! per-run residual buffer carries partial lines across chunk boundaries so
//! a URL split over two reads is still detected.
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Cap on the carry buffer; a pathological unterminated line is flushed
/// through the scanner once it exceeds this.
const RESIDUAL_CAP: usize = 8 * 1024;

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s"'<>\)\]]+"#).expect("url regex"));
static PR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)github\.com/[^/\s]+/[^/\s]+/pull/\d*").expect("pr regex"));
static FILE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/workspace/[A-Za-z0-9_\.\-/]+").expect("file regex"));
static AUTH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)invalid (api )?key|unauthorized|401|permission denied|unauthenticated")
        .expect("auth regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum Artifact {
    File(String),
    Url(String),
    Pr(String),
    AuthWarning(String),
}

impl Artifact {
    pub fn kind(&self) -> &'static str {
        match self {
            Artifact::File(_) => "file",
            Artifact::Url(_) => "url",
            Artifact::Pr(_) => "pr",
            Artifact::AuthWarning(_) => "auth-warning",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Artifact::File(v) | Artifact::Url(v) | Artifact::Pr(v) | Artifact::AuthWarning(v) => v,
        }
    }
}

fn trim_url(url: &str) -> &str {
    url.trim_end_matches(['.', ',', ';', ':', '!', '?'])
}

/// Scan one complete line.
pub fn scan_line(line: &str) -> Vec<Artifact> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::new();

    for m in URL_RE.find_iter(line) {
        let url = trim_url(m.as_str()).to_string();
        if PR_RE.is_match(&url) {
            out.push(Artifact::Pr(url));
        } else {
            out.push(Artifact::Url(url));
        }
    }
    for m in FILE_RE.find_iter(line) {
        out.push(Artifact::File(m.as_str().to_string()));
    }
    if AUTH_RE.is_match(line) {
        out.push(Artifact::AuthWarning(line.to_string()));
    }
    out
}

/// Per-run stateful scanner carrying partial lines across chunks.
#[derive(Default)]
pub struct ArtifactScanner {
    residual: String,
}

impl ArtifactScanner {
    pub fn new() -> ArtifactScanner {
        ArtifactScanner::default()
    }

    pub fn scan_chunk(&mut self, chunk: &[u8]) -> Vec<Artifact> {
        self.residual.push_str(&String::from_utf8_lossy(chunk));
        let mut out = Vec::new();

        while let Some(pos) = self.residual.find('\n') {
            let mut line: String = self.residual.drain(..=pos).collect();
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            out.extend(scan_line(&line));
        }

        if self.residual.len() > RESIDUAL_CAP {
            let overflow = std::mem::take(&mut self.residual);
            out.extend(scan_line(&overflow));
        }
        out
    }

    /// Flush the trailing partial line at end of stream.
    pub fn finish(&mut self) -> Vec<Artifact> {
        let rest = std::mem::take(&mut self.residual);
        scan_line(&rest)
    }
}
