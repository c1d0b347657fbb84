//! Append-only per-run transcript with bounded tail reads. The core never
//! rotates, truncates or deletes transcripts.
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::color::warn_print;

/// Default tail window handed to newly-attaching followers.
pub const TAIL_MAX_BYTES: usize = 64 * 1024;

pub struct TranscriptWriter {
    file: Option<File>,
    path: PathBuf,
    warned: bool,
}

impl TranscriptWriter {
    /// Create the parent directory and open the file for append.
    pub fn open(path: &Path) -> io::Result<TranscriptWriter> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(TranscriptWriter {
            file: Some(file),
            path: path.to_path_buf(),
            warned: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Best-effort append: a failed write is logged once and never fails the
    /// run.
    pub fn write(&mut self, bytes: &[u8]) {
        if let Some(f) = self.file.as_mut() {
            if let Err(e) = f.write_all(bytes) {
                if !self.warned {
                    warn_print(&format!(
                        "transcript write failed for {}: {}",
                        self.path.display(),
                        e
                    ));
                    self.warned = true;
                }
            }
        }
    }

    pub fn close(&mut self) {
        if let Some(mut f) = self.file.take() {
            let _ = f.flush();
        }
    }
}

impl Drop for TranscriptWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read the last `min(file size, max_bytes)` bytes of a transcript.
pub fn tail(path: &Path, max_bytes: usize) -> io::Result<Vec<u8>> {
    let mut f = File::open(path)?;
    let size = f.metadata()?.len();
    let want = (max_bytes as u64).min(size);
    f.seek(SeekFrom::End(-(want as i64)))?;
    let mut buf = Vec::with_capacity(want as usize);
    f.read_to_end(&mut buf)?;
    Ok(buf)
}
