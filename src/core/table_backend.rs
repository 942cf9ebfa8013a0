//! Access to the host's packet-filter tables
//!
//! [`IptablesCommand`] shells out to `iptables-save -c` / `iptables-restore -c`
//! (and the ip6tables variants). [`MemoryTables`] keeps the dump text in
//! memory; it backs `vmfw render` and the tests.

use crate::core::error::{Error, Result};
use crate::core::model::IpFamily;
use crate::elevation::{ElevatedProgram, create_elevated_command};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{error, info};

/// Dump and load of a whole address-family table set
pub trait TableBackend: Send + Sync {
    /// Current tables in save format, with counters
    fn save(&self, family: IpFamily) -> impl Future<Output = Result<String>> + Send;

    /// Atomically replaces the tables with `text`, preserving counters
    fn restore(&self, family: IpFamily, text: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Runs the real iptables tools through [`crate::elevation`]
#[derive(Debug, Clone, Copy, Default)]
pub struct IptablesCommand;

fn tool_error(program: ElevatedProgram, output: &std::process::Output) -> Error {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Error::Tool {
        tool: program.to_string(),
        message: if stderr.is_empty() {
            format!("exited with {}", output.status)
        } else {
            stderr.clone()
        },
        stderr: Some(stderr),
        exit_code: output.status.code(),
    }
}

/// Decodes tool output that is later written back or parsed.
///
/// A lossy decode would silently rewrite foreign rules on the next restore,
/// so invalid UTF-8 is refused instead.
pub(crate) fn decode_stdout(program: ElevatedProgram, stdout: Vec<u8>) -> Result<String> {
    String::from_utf8(stdout).map_err(|e| {
        let message = format!(
            "output is not valid UTF-8 at byte {}; refusing to use it",
            e.utf8_error().valid_up_to()
        );
        error!("{program}: {message}");
        Error::Tool {
            tool: program.to_string(),
            message,
            stderr: None,
            exit_code: None,
        }
    })
}

/// Outcome of a restore whose input may not have been fully written.
///
/// When the tool exits early it breaks the pipe; its own diagnostic is the
/// useful error, the write failure only matters if it still reported success.
fn restore_outcome(
    program: ElevatedProgram,
    written: std::io::Result<()>,
    output: &std::process::Output,
) -> Result<()> {
    if !output.status.success() {
        let err = tool_error(program, output);
        error!("{program} failed: {err}");
        return Err(err);
    }
    if let Err(e) = written {
        error!("{program} exited cleanly but its input was cut short: {e}");
        return Err(e.into());
    }
    Ok(())
}

impl TableBackend for IptablesCommand {
    async fn save(&self, family: IpFamily) -> Result<String> {
        let program = ElevatedProgram::save(family);
        let output = create_elevated_command(program, &["-c"])?
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                error!("Failed to spawn {program}: {e}");
                Error::Internal(format!("Failed to spawn {program}: {e}"))
            })?;

        if output.status.success() {
            decode_stdout(program, output.stdout)
        } else {
            let err = tool_error(program, &output);
            error!("{program} failed: {err}");
            Err(err)
        }
    }

    async fn restore(&self, family: IpFamily, text: &str) -> Result<()> {
        let program = ElevatedProgram::restore(family);
        let mut child = create_elevated_command(program, &["-c"])?
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| {
                error!("Failed to spawn {program}: {e}");
                Error::Internal(format!("Failed to spawn {program}: {e}"))
            })?;

        let written = match child.stdin.take() {
            Some(mut stdin) => {
                use tokio::io::AsyncWriteExt;
                stdin.write_all(text.as_bytes()).await
                // Dropping stdin closes the pipe so restore sees EOF
            }
            None => Ok(()),
        };

        let output = child.wait_with_output().await?;
        restore_outcome(program, written, &output)?;
        info!(%family, "{program} successful");
        Ok(())
    }
}

/// In-memory tables: `save` returns the last restored text
#[derive(Debug, Default)]
pub struct MemoryTables {
    tables: Mutex<HashMap<IpFamily, String>>,
    fail_restore: Mutex<Option<String>>,
    restores: AtomicUsize,
}

impl MemoryTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from existing dumps, as if the host already had rules
    pub fn with_tables(v4: impl Into<String>, v6: impl Into<String>) -> Self {
        let tables = Self::default();
        if let Ok(mut map) = tables.tables.lock() {
            map.insert(IpFamily::V4, v4.into());
            map.insert(IpFamily::V6, v6.into());
        }
        tables
    }

    /// Current text of one family, empty when nothing was loaded
    pub fn dump(&self, family: IpFamily) -> String {
        self.tables
            .lock()
            .ok()
            .and_then(|map| map.get(&family).cloned())
            .unwrap_or_default()
    }

    /// Makes every following restore fail with `stderr` until cleared
    pub fn fail_restores_with(&self, stderr: Option<&str>) {
        if let Ok(mut fail) = self.fail_restore.lock() {
            *fail = stderr.map(str::to_string);
        }
    }

    /// Number of successful restores so far
    pub fn restore_count(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }

    fn lock_err() -> Error {
        Error::Internal("memory table lock poisoned".to_string())
    }
}

impl TableBackend for MemoryTables {
    async fn save(&self, family: IpFamily) -> Result<String> {
        Ok(self.dump(family))
    }

    async fn restore(&self, family: IpFamily, text: &str) -> Result<()> {
        let failure = self
            .fail_restore
            .lock()
            .map_err(|_| Self::lock_err())?
            .clone();
        if let Some(stderr) = failure {
            return Err(Error::Tool {
                tool: ElevatedProgram::restore(family).to_string(),
                message: stderr.clone(),
                stderr: Some(stderr),
                exit_code: Some(1),
            });
        }

        self.tables
            .lock()
            .map_err(|_| Self::lock_err())?
            .insert(family, text.to_string());
        self.restores.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
