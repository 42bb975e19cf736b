//! Helpers for running external commands.

use std::fmt::Display;
use std::process::{Command, Stdio};

use anyhow::Result;

/// Arguments whose following value must never appear in logs.
const SENSITIVE_FLAGS: &[&str] = &["--src-creds", "--creds", "--password"];

/// Extension trait for [`Command`].
pub trait CommandRunExt {
    /// Execute the child process, capturing stderr. On failure the error
    /// carries the exit status and the captured stderr text.
    fn run_capture_stderr(&mut self) -> Result<()>;
}

impl CommandRunExt for Command {
    fn run_capture_stderr(&mut self) -> Result<()> {
        tracing::debug!("exec: {}", CommandDisplay::new(self));
        let output = self
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "Subprocess failed: {:?}\n{}",
                output.status,
                stderr.trim_end()
            );
        }
        Ok(())
    }
}

/// Helper to format a command line for logging. Arguments are quoted
/// the way a POSIX shell would parse them, and credential values are masked.
#[derive(Debug)]
pub struct CommandDisplay<'a> {
    cmd: &'a Command,
}

impl<'a> CommandDisplay<'a> {
    /// Wrap a command for display.
    pub fn new(cmd: &'a Command) -> Self {
        Self { cmd }
    }
}

impl Display for CommandDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let program = self.cmd.get_program().to_string_lossy();
        f.write_str(&program)?;
        let mut mask_next = false;
        for arg in self.cmd.get_args() {
            let arg = arg.to_string_lossy();
            if mask_next {
                f.write_str(" <redacted>")?;
                mask_next = false;
                continue;
            }
            if let Some((flag, _)) = arg.split_once('=') {
                if SENSITIVE_FLAGS.contains(&flag) {
                    write!(f, " {flag}=<redacted>")?;
                    continue;
                }
            }
            mask_next = SENSITIVE_FLAGS.contains(&arg.as_ref());
            match shlex::try_quote(&arg) {
                Ok(quoted) => write!(f, " {quoted}")?,
                Err(_) => write!(f, " {arg:?}")?,
            }
        }
        Ok(())
    }
}
