//! Verifier Runner (C5): executes a task's `verify.<ext>` program against the
//! post-execution world state and maps its exit code to pass/fail.
//!
//! Modelled on the subprocess lifecycle of the teacher's bash tool: spawn via
//! `tokio::process::Command`, capture stdout/stderr, and wrap the wait in
//! `tokio::time::timeout`, killing the child on expiry.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::model::VerificationOutcome;

/// Drain an optional child pipe to completion; `None` (the pipe was never attached) yields
/// nothing rather than erroring.
async fn drain<R: tokio::io::AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    match pipe {
        Some(mut reader) => {
            let mut buf = Vec::new();
            let _ = reader.read_to_end(&mut buf).await;
            buf
        }
        None => Vec::new(),
    }
}

/// The verifier process itself failed to run — as opposed to running and
/// reporting a verification failure via a non-zero exit code.
#[derive(Debug, Clone)]
pub enum VerifierError {
    Spawn(String),
    Timeout,
}

impl fmt::Display for VerifierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifierError::Spawn(msg) => write!(f, "failed to spawn verifier: {msg}"),
            VerifierError::Timeout => write!(f, "verifier timed out"),
        }
    }
}

impl std::error::Error for VerifierError {}

/// Locate the task's `verify.<ext>` sibling of `description.md`, whatever its extension.
pub fn find_verifier(task_root: &Path) -> Option<std::path::PathBuf> {
    std::fs::read_dir(task_root)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| {
            p.file_stem().and_then(|s| s.to_str()) == Some("verify")
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("verify."))
                    .unwrap_or(false)
        })
}

/// Run `verifier_path` with `env` set, working directory `task_root`, bounded by `timeout`.
///
/// Exit code 0 is a pass; any other code (including the synthetic `-1` used on timeout) is a
/// fail. Never retried by the caller: verification failures are signal, not noise.
pub async fn verify(
    verifier_path: &Path,
    task_root: &Path,
    env: &HashMap<String, String>,
    timeout: Duration,
) -> VerificationOutcome {
    let start = Instant::now();

    let mut command = Command::new(verifier_path);
    command
        .current_dir(task_root)
        .envs(env)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    // Spawned outside the timed race, and kept alive afterwards: `wait_with_output` would
    // consume the `Child` into the very future the timeout drops on expiry, losing the handle
    // needed to actually kill the process (§8 "observed during Verifying kills the verifier
    // process within its kill timeout"; §9 allows SIGTERM then SIGKILL).
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return VerificationOutcome {
                passed: false,
                exit_code: -1,
                stdout: String::new(),
                stderr: VerifierError::Spawn(e.to_string()).to_string(),
                duration: start.elapsed(),
                infra_failure: true,
            }
        }
    };
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    let run = async {
        let (status, stdout, stderr) =
            tokio::join!(child.wait(), drain(stdout_pipe), drain(stderr_pipe));
        (status, stdout, stderr)
    };

    match tokio::time::timeout(timeout, run).await {
        Ok((Ok(status), stdout, stderr)) => VerificationOutcome {
            passed: status.success(),
            exit_code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            duration: start.elapsed(),
            infra_failure: false,
        },
        Ok((Err(e), _, _)) => VerificationOutcome {
            passed: false,
            exit_code: -1,
            stdout: String::new(),
            stderr: e.to_string(),
            duration: start.elapsed(),
            infra_failure: true,
        },
        Err(_) => {
            if let Err(e) = child.kill().await {
                log::warn!("verifier_runner: failed to kill timed-out verifier: {e}");
            }
            let _ = child.wait().await;
            VerificationOutcome {
                passed: false,
                exit_code: -1,
                stdout: String::new(),
                stderr: VerifierError::Timeout.to_string(),
                duration: start.elapsed(),
                infra_failure: true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\n{body}").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn find_verifier_matches_any_extension() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "verify.sh", "exit 0");
        let found = find_verifier(dir.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "verify.sh");
    }

    #[tokio::test]
    async fn exit_zero_passes() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "verify.sh", "exit 0");
        let outcome = verify(&script, dir.path(), &HashMap::new(), Duration::from_secs(5)).await;
        assert!(outcome.passed);
        assert_eq!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn nonzero_exit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "verify.sh", "exit 7");
        let outcome = verify(&script, dir.path(), &HashMap::new(), Duration::from_secs(5)).await;
        assert!(!outcome.passed);
        assert_eq!(outcome.exit_code, 7);
        assert!(!outcome.infra_failure);
    }

    #[tokio::test]
    async fn timeout_yields_synthetic_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "verify.sh", "sleep 5; exit 0");
        let outcome = verify(
            &script,
            dir.path(),
            &HashMap::new(),
            Duration::from_millis(100),
        )
        .await;
        assert!(!outcome.passed);
        assert_eq!(outcome.exit_code, -1);
        assert!(outcome.infra_failure);
    }
}
