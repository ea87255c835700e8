//! External command execution
//!
//! Every provisioner step that drives `kubeadm`, `kubectl`, `helm` or
//! `systemctl` goes through [`run`] so failures carry the step name and the
//! tool's combined output.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::{Error, Result};

/// Run `program args...` and return stdout
///
/// `stdin` is piped to the child when given. A non-zero exit becomes a
/// [`Error::Generation`] for `step` carrying stdout and stderr.
pub async fn run(step: &str, program: &str, args: &[String], stdin: Option<&str>) -> Result<String> {
    debug!(step, program, args = %args.join(" "), "Running command");

    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::generation(step, format!("failed to run {}: {}", program, e)))?;

    // Feed stdin while stdout and stderr are drained, so neither side can
    // fill a pipe buffer and stall the other
    let pipe = child.stdin.take();
    let feed = async move {
        if let (Some(input), Some(mut pipe)) = (stdin, pipe) {
            pipe.write_all(input.as_bytes()).await?;
            // Close stdin so the child sees EOF
            drop(pipe);
        }
        Ok::<(), std::io::Error>(())
    };
    let (fed, output) = tokio::join!(feed, child.wait_with_output());

    let output = output
        .map_err(|e| Error::generation(step, format!("failed to wait for {}: {}", program, e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::generation(
            step,
            format!("{} failed ({}): {} {}", program, output.status, stdout.trim(), stderr.trim()),
        ));
    }
    match fed {
        // The child may legitimately exit without reading all of its input
        Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(Error::generation(
            step,
            format!("failed to write stdin of {}: {}", program, e),
        )),
        _ => Ok(stdout),
    }
}

/// Build an owned argument vector from string slices
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
