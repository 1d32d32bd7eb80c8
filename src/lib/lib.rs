//! A package manager and build driver for native C and C++ libraries.
//!
//! The two subsystems that make up the core engine:
//!
//! - [`resolve`]: turns unresolved package requests into a fully-resolved,
//!   unpacked, content-verified local tree, resolving against the local
//!   packages db first and the configured remotes second.
//! - [`checks`]: executes a DAG of compile/link/run probes (feature
//!   detection) exactly once per logical configuration, with results cached
//!   persistently per configuration hash.
//!
//! A [`session::Session`] owns the state both share: the storage layout,
//! the settings, the remote list and the process-wide latches.

pub mod checks;
pub mod config;
pub mod package;
pub mod remote;
pub mod resolve;
pub mod session;
pub mod util;
