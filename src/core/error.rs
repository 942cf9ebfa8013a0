use thiserror::Error;
use uuid::Uuid;

/// Core error types for vmfw
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An external enforcement tool (iptables-save/restore, virsh) failed
    #[error("{tool} failed: {message}")]
    Tool {
        tool: String,
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// A filter name is already bound to a different identity
    #[error("Filter '{name}' already exists with uuid {existing} (requested {requested})")]
    FilterConflict {
        name: String,
        existing: Uuid,
        requested: Uuid,
    },

    /// Interface filter parameter outside the recognized set
    #[error("Invalid filter parameter: {0}")]
    InvalidParameter(String),

    /// A filter references a filter that is not defined (or not yet defined)
    #[error("Filter '{filter}' references undefined filter '{reference}'")]
    UndefinedDependency { filter: String, reference: String },

    /// Filter lookup/undefine on a name the hypervisor does not know
    #[error("Filter not found: {0}")]
    FilterNotFound(String),

    /// Undefine refused because other filters (or a running domain) still use it
    #[error("Filter still in use: {0}")]
    FilterInUse(String),

    /// Input validation failed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// The policy source could not answer a query
    #[error("Policy source error: {0}")]
    Policy(String),

    /// Snapshot operation failed
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Diagnostic text reported by the external tool, when there is one
    pub fn tool_output(&self) -> Option<&str> {
        match self {
            Self::Tool { stderr, .. } => stderr.as_deref(),
            _ => None,
        }
    }
}

/// Snapshot-specific errors
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot corrupted: invalid structure")]
    Corrupted,

    #[error("Snapshot checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Snapshot not found: {0}")]
    NotFound(String),

    #[error("Snapshot is empty")]
    Empty,
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Known diagnostics from iptables-restore and virsh, mapped to operator hints
pub struct ToolErrorPattern;

impl ToolErrorPattern {
    /// Matches a tool's stderr against known patterns and returns a translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new("Insufficient permissions to modify the host firewall")
                .with_suggestion("Run vmfw as root or set VMFW_ELEVATION_METHOD=sudo")
                .with_suggestion("Check that CAP_NET_ADMIN is available to the agent");
        }

        if lower.contains("another app is currently holding the xtables lock") {
            return ErrorTranslation::new("The xtables lock is held by another process")
                .with_suggestion("Another firewall manager is applying rules; retry shortly")
                .with_suggestion("Check for firewalld or docker reloading rules");
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables or virsh is not installed or not in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables")
                .with_suggestion("Install libvirt clients: sudo apt install libvirt-clients");
        }

        if lower.contains("line") && lower.contains("failed") {
            return ErrorTranslation::new("The restore input was rejected by iptables-restore")
                .with_suggestion("The failing line number is reported in the tool output")
                .with_suggestion("Run `vmfw render` to inspect the generated table");
        }

        if lower.contains("couldn't load target")
            || (lower.contains("chain") && lower.contains("does not exist"))
        {
            return ErrorTranslation::new("A rule jumps to a chain that does not exist")
                .with_suggestion("Another tool may have flushed the filter table mid-cycle")
                .with_suggestion("Refresh the affected instances to rebuild their chains");
        }

        if lower.contains("already exists with uuid") {
            return ErrorTranslation::new("A network filter with this name has a different identity")
                .with_suggestion("Inspect it with: virsh nwfilter-dumpxml <name>")
                .with_suggestion("Undefine the stale filter before redefining it");
        }

        if lower.contains("in use") {
            return ErrorTranslation::new("The network filter is still referenced")
                .with_suggestion("Make sure the instance domain has been destroyed")
                .with_suggestion("List references with: virsh nwfilter-list");
        }

        if lower.contains("failed to connect") || lower.contains("libvirt") {
            return ErrorTranslation::new("Could not talk to libvirt")
                .with_suggestion("Check that libvirtd is running: systemctl status libvirtd");
        }

        ErrorTranslation::new(format!("Enforcement error: {msg}"))
            .with_suggestion("Check the tool output above for more information")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
