// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use crate::fs::path_to_str;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL_MS: u64 = 50;

/// External cryptography operations.
///
/// Every method writes exactly one file at `out`. The executor always passes
/// a staging path and renames it into place afterwards, so implementations
/// need not be atomic themselves.
pub trait CryptoTool: Send + Sync {
    /// Fail early if the tool cannot be run at all.
    fn ensure_available(&self) -> Result<()>;

    /// Generate an RSA private key of `bits` bits in PEM form.
    fn generate_key(&self, out: &Path, bits: u32) -> Result<()>;

    /// Generate a CSR for `key` using the request config at `config`.
    fn generate_csr(&self, config: &Path, key: &Path, out: &Path) -> Result<()>;

    /// Generate a certificate signed by `key` itself, valid for `days`.
    fn self_sign(&self, config: &Path, key: &Path, out: &Path, days: u32) -> Result<()>;

    /// Dump the human-readable form of `csr`.
    fn csr_text(&self, csr: &Path, out: &Path) -> Result<()>;
}

/// [`CryptoTool`] backed by the `openssl` command line.
#[derive(Debug, Clone)]
pub struct OpensslTool {
    program: String,
    timeout: Duration,
}

impl OpensslTool {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        let label = match args.first() {
            Some(sub) => format!("{} {}", self.program, sub),
            None => self.program.clone(),
        };
        tracing::debug!(command = %label, args = ?args, "running");

        let output = run_command_with_timeout(&self.program, args, self.timeout)?;
        if !output.status.success() {
            return Err(Error::Command {
                command: label,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

impl Default for OpensslTool {
    fn default() -> Self {
        Self::new("openssl", Duration::from_secs(120))
    }
}

impl CryptoTool for OpensslTool {
    fn ensure_available(&self) -> Result<()> {
        let output = self.run(&["version"])?;
        tracing::debug!(
            version = %String::from_utf8_lossy(&output.stdout).trim(),
            "crypto tool available"
        );
        Ok(())
    }

    fn generate_key(&self, out: &Path, bits: u32) -> Result<()> {
        let bits = bits.to_string();
        self.run(&["genrsa", "-out", path_to_str(out)?, &bits])?;
        Ok(())
    }

    fn generate_csr(&self, config: &Path, key: &Path, out: &Path) -> Result<()> {
        self.run(&[
            "req",
            "-new",
            "-config",
            path_to_str(config)?,
            "-key",
            path_to_str(key)?,
            "-out",
            path_to_str(out)?,
        ])?;
        Ok(())
    }

    fn self_sign(&self, config: &Path, key: &Path, out: &Path, days: u32) -> Result<()> {
        let days = days.to_string();
        self.run(&[
            "req",
            "-new",
            "-x509",
            "-days",
            &days,
            "-config",
            path_to_str(config)?,
            "-key",
            path_to_str(key)?,
            "-out",
            path_to_str(out)?,
        ])?;
        Ok(())
    }

    fn csr_text(&self, csr: &Path, out: &Path) -> Result<()> {
        self.run(&[
            "req",
            "-in",
            path_to_str(csr)?,
            "-noout",
            "-text",
            "-out",
            path_to_str(out)?,
        ])?;
        Ok(())
    }
}

/// Run a command with a timeout. Returns the command output or an error.
///
/// Output is drained on reader threads while waiting, so a child writing more
/// than the pipe buffer does not stall. On timeout the child is killed and
/// reaped before returning.
pub fn run_command_with_timeout(
    command: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<Output> {
    let mut child = Command::new(command)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::CommandNotFound {
                    command: command.to_string(),
                    hint: get_install_hint(command),
                }
            } else {
                Error::Command {
                    command: command.to_string(),
                    status: "not started".to_string(),
                    stderr: e.to_string(),
                }
            }
        })?;

    let stdout_reader = {
        let pipe = child.stdout.take();
        thread::spawn(move || drain(pipe))
    };
    let stderr_reader = {
        let pipe = child.stderr.take();
        thread::spawn(move || drain(pipe))
    };

    let start = Instant::now();

    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return Ok(Output {
                    status,
                    stdout: stdout_reader.join().unwrap_or_default(),
                    stderr: stderr_reader.join().unwrap_or_default(),
                });
            }
            Ok(None) => {
                if start.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Error::CommandTimeout {
                        command: command.to_string(),
                        seconds: timeout.as_secs(),
                    });
                }
                thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
            }
            Err(e) => {
                return Err(Error::Command {
                    command: command.to_string(),
                    status: "unknown".to_string(),
                    stderr: e.to_string(),
                });
            }
        }
    }
}

fn drain(pipe: Option<impl Read>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf) {
            tracing::debug!(error = %e, "failed to read command output");
        }
    }
    buf
}

/// Get installation hint for missing commands
fn get_install_hint(command: &str) -> String {
    let name = Path::new(command)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| command.to_string());
    match name.as_str() {
        "openssl" => "Install the openssl package (apt install openssl, dnf install openssl, \
                      apk add openssl) or set runtime.openssl in the config file."
            .to_string(),
        _ => format!("Please install the '{}' command", command),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_command_reports_hint() {
        let err = run_command_with_timeout(
            "certkeeper-no-such-binary",
            &[],
            Duration::from_secs(1),
        )
        .expect_err("missing binary should fail");
        assert!(matches!(err, Error::CommandNotFound { .. }));

        let tool = OpensslTool::new("/nonexistent/openssl", Duration::from_secs(1));
        match tool.ensure_available() {
            Err(Error::CommandNotFound { hint, .. }) => assert!(hint.contains("openssl")),
            other => panic!("expected CommandNotFound, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_command_timeout_kills_child() {
        let start = Instant::now();
        let err = run_command_with_timeout("sleep", &["5"], Duration::from_millis(200))
            .expect_err("sleep should time out");
        assert!(matches!(err, Error::CommandTimeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn test_nonzero_exit_is_command_error() {
        let tool = OpensslTool::new("false", Duration::from_secs(5));
        match tool.ensure_available() {
            Err(Error::Command { command, .. }) => assert_eq!(command, "false version"),
            other => panic!("expected Command error, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_large_output_does_not_stall() {
        let output = run_command_with_timeout(
            "head",
            &["-c", "300000", "/dev/zero"],
            Duration::from_secs(10),
        )
        .expect("head should finish before the timeout");
        assert!(output.status.success());
        assert_eq!(output.stdout.len(), 300_000);
    }

    #[cfg(unix)]
    #[test]
    fn test_successful_command_output() {
        let output = run_command_with_timeout("echo", &["hello"], Duration::from_secs(5))
            .expect("echo should succeed");
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
    }
}
