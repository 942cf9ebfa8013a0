//! Privilege elevation for enforcement tools
//!
//! vmfw normally runs as root inside the compute agent, but the CLI can be
//! run by an operator. Only a closed set of programs may be elevated:
//!
//! - **iptables-save / ip6tables-save**: dumping the live tables
//! - **iptables-restore / ip6tables-restore**: loading the merged tables
//! - **virsh**: defining, inspecting and undefining network filters
//!
//! # Elevation Strategy
//!
//! - **Root**: programs run directly
//! - **Preferred otherwise**: `run0` when available (systemd v256+, no SUID)
//! - **Fallback**: `sudo`
//!
//! # Environment Variables
//!
//! - `VMFW_ELEVATION_METHOD`: Force a specific elevation method (`sudo`, `run0`, or `pkexec`).
//!   Useful with sudoers NOPASSWD rules.
//!   Example: `VMFW_ELEVATION_METHOD=sudo vmfw apply --policy policy.json`
//!
//! - `VMFW_TEST_NO_ELEVATION`: Bypass elevation entirely (for testing only).
//!
//! # Security
//!
//! - Only the programs in [`ElevatedProgram`] can be elevated
//! - Commands are constructed without shell interpolation
//! - Audit logging tracks all privileged operations (via caller)
//!
//! # Example
//!
//! ```no_run
//! use vmfw::elevation::{create_elevated_command, ElevatedProgram};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut cmd = create_elevated_command(ElevatedProgram::IptablesSave, &["-c"])?;
//! let output = cmd.output().await?;
//! # Ok(())
//! # }
//! ```

use crate::core::model::IpFamily;
use std::io;
use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `VMFW_ELEVATION_METHOD`
    #[error("Invalid VMFW_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// No way to gain root was found
    #[error("Not running as root and neither run0 nor sudo is installed")]
    NoMethodAvailable,

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Programs vmfw is allowed to run with elevated privileges
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum ElevatedProgram {
    #[strum(serialize = "iptables-save")]
    IptablesSave,
    #[strum(serialize = "iptables-restore")]
    IptablesRestore,
    #[strum(serialize = "ip6tables-save")]
    Ip6tablesSave,
    #[strum(serialize = "ip6tables-restore")]
    Ip6tablesRestore,
    #[strum(serialize = "virsh")]
    Virsh,
}

impl ElevatedProgram {
    pub const fn save(family: IpFamily) -> Self {
        match family {
            IpFamily::V4 => Self::IptablesSave,
            IpFamily::V6 => Self::Ip6tablesSave,
        }
    }

    pub const fn restore(family: IpFamily) -> Self {
        match family {
            IpFamily::V4 => Self::IptablesRestore,
            IpFamily::V6 => Self::Ip6tablesRestore,
        }
    }
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

/// Reads `VMFW_ELEVATION_METHOD`, rejecting unknown values even when no
/// elevation turns out to be needed.
fn method_override() -> Result<Option<&'static str>, ElevationError> {
    let Ok(method) = std::env::var("VMFW_ELEVATION_METHOD") else {
        return Ok(None);
    };
    match method.to_lowercase().as_str() {
        "" => Ok(None),
        "sudo" => Ok(Some("sudo")),
        "run0" => Ok(Some("run0")),
        "pkexec" => Ok(Some("pkexec")),
        other => Err(ElevationError::InvalidMethod(other.to_string())),
    }
}

fn wrapped(elevator: &str, program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(elevator);
    cmd.arg(program).args(args);
    cmd
}

/// Creates a command running `program` with root privileges.
///
/// Arguments are passed directly without shell interpretation; callers must
/// validate anything derived from user input first.
///
/// # Testing
///
/// Set `VMFW_TEST_NO_ELEVATION=1` to run the program directly.
pub fn create_elevated_command(
    program: ElevatedProgram,
    args: &[&str],
) -> Result<Command, ElevationError> {
    let program = program.as_ref();

    // 1. Strict Test Mode Override (Highest Priority)
    if std::env::var("VMFW_TEST_NO_ELEVATION").is_ok() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    let method = method_override()?;

    // 2. Direct Root Execution (No prompt needed)
    if nix::unistd::getuid().is_root() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    // 3. Explicit elevation method override
    if let Some(method) = method {
        if !binary_exists(method) {
            return Err(ElevationError::MethodNotAvailable(method.into()));
        }
        return Ok(wrapped(method, program, args));
    }

    // 4. Automatic detection - prefer run0 (no SUID), fall back to sudo
    if binary_exists("run0") {
        return Ok(wrapped("run0", program, args));
    }
    if binary_exists("sudo") {
        return Ok(wrapped("sudo", program, args));
    }
    Err(ElevationError::NoMethodAvailable)
}
