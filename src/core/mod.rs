//! Core enforcement logic
//!
//! This module turns security-group policy into host enforcement state.
//! It provides:
//!
//! - [`model`]: Groups, rules, instances and their network attachments
//! - [`policy`]: The policy source queried on every compile
//! - [`rules`]: Grantee expansion into concrete permit rules
//! - [`iptables`]: Owned chains and the dump/merge/restore text model
//! - [`packet_filter`]: Per-instance chains, provider chain and refresh
//! - [`nwfilter`]: Tiered libvirt network filters
//! - [`driver`]: The orchestrator over both compilers
//! - [`table_backend`] / [`filter_backend`]: Host access, real and in-memory
//! - [`gate`]: Process-wide serialization of every host mutation
//! - [`snapshot`]: Pre-apply table snapshots
//! - [`error`]: Error types for enforcement operations

pub mod driver;
pub mod error;
pub mod filter_backend;
pub mod gate;
pub mod iptables;
pub mod model;
pub mod nwfilter;
pub mod packet_filter;
pub mod policy;
pub mod rules;
pub mod snapshot;
pub mod table_backend;

#[cfg(test)]
pub mod test_helpers;
