//! vmfw - VM Firewall
//!
//! Compiles security-group policy into host enforcement for virtual machines.
//!
//! # Architecture
//!
//! - [`core`] - Rule model, iptables and nwfilter compilers, refresh orchestration
//! - [`audit`] - Audit logging for every change made to the host
//! - [`validators`] - Chain, filter and parameter validation
//! - [`config`] - Configuration persistence
//! - [`elevation`] - Running iptables and virsh with the required privileges
//! - [`utils`] - Utility functions (XDG directories, etc.)
//!
//! # Safety Features
//!
//! - Only `<prefix>-*` chains and rules are ever rewritten
//! - The replacement table is fully built before any restore
//! - Pre-apply snapshots with SHA-256 checksums
//! - One process-wide gate around every host mutation
//! - Atomic file operations with secure permissions

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::driver::{Firewall, PolicyEvent};
pub use core::error::{Error, Result};
pub use core::model::{Instance, IpFamily, NetworkInfo, Protocol};
pub use core::packet_filter::{RefreshOutcome, RefreshReport};
