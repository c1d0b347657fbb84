use std::io::Read;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use wait_timeout::ChildExt;

/// Captured output of a finished subprocess.
#[derive(Debug)]
pub struct ExecOutput {
    pub status: std::process::ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Run a command with captured output and a hard timeout. The child is killed
/// and reaped on expiry.
pub fn run_capture(program: &std::path::Path, args: &[String], timeout: Duration) -> Result<ExecOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {:?} with args {:?}", program, args))?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let status = if timeout.is_zero() {
        child.wait().context("failed to wait for process")?
    } else {
        match child
            .wait_timeout(timeout)
            .context("failed to wait with timeout")?
        {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(anyhow!("command {:?} timed out after {:?}", program, timeout));
            }
        }
    };

    let stdout = read_stream(stdout_pipe.as_mut())?;
    let stderr = read_stream(stderr_pipe.as_mut())?;
    Ok(ExecOutput {
        status,
        stdout,
        stderr,
    })
}

fn read_stream(stream: Option<&mut impl Read>) -> Result<String> {
    let mut buf = String::new();
    if let Some(reader) = stream {
        reader
            .read_to_string(&mut buf)
            .context("failed to read process output")?;
    }
    Ok(buf)
}
