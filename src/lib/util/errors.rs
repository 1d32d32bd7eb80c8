//! Error types shared across the resolver and the check engine.
//!
//! Most failures are contextualized `failure::Error`s built with
//! `format_err!`; the enum below provides the broad kind, and the dedicated
//! structs exist for the few errors the coordinating thread has to inspect
//! after they crossed the Executor boundary (retry-on-stale-db, cycles,
//! pending manual checks).

pub use failure::Fail;
use failure::Error;

pub type Res<T> = Result<T, Error>;

#[derive(Copy, Clone, Eq, PartialEq, Debug, Fail)]
pub enum ErrorKind {
    #[fail(display = "no remote could resolve the requested packages")]
    DependencyNotResolved,
    #[fail(display = "archive checksum mismatch")]
    Integrity,
    #[fail(display = "archive extraction failed")]
    Unpack,
    #[fail(display = "remote request failed")]
    Remote,
    #[fail(display = "package not found in the local packages db")]
    PackageNotFound,
    #[fail(display = "invalid package path")]
    InvalidPackagePath,
    #[fail(display = "invalid version")]
    InvalidVersion,
    #[fail(display = "invalid package config")]
    InvalidConfig,
    #[fail(display = "check could not be executed")]
    CheckExecution,
    #[fail(display = "resource is locked")]
    Locked,
}

/// The local packages db predicted a different archive hash than what the
/// remote actually served. Recoverable exactly once: the resolver re-runs
/// resolution against the remote. Workers raise this through the Executor;
/// the coordinator matches it with [`is_local_db_hash`].
#[derive(Clone, Debug, Fail)]
#[fail(
    display = "hashes do not match for package {}: local db predicted {}, archive is {}",
    package, expected, actual
)]
pub struct LocalDbHashError {
    pub package: String,
    pub expected: String,
    pub actual: String,
}

/// The check graph could not be linearised. The Graphviz dump named here is
/// written before the error is raised.
#[derive(Clone, Debug, Fail)]
#[fail(display = "cyclic check dependencies; graph dumped to {}", dot_file)]
pub struct CycleError {
    pub dot_file: String,
}

/// One or more run-probes produced binaries that cannot execute on this
/// host, and no automatic fallback is configured.
#[derive(Clone, Debug, Fail)]
#[fail(
    display = "some checks must be run manually; execute the runner in {} on the target host, \
               then fill in {}",
    cc_dir, sidecar
)]
pub struct ManualCheckRequired {
    pub sidecar: String,
    pub cc_dir: String,
}

/// True when `e` is (or wraps) a [`LocalDbHashError`].
pub fn is_local_db_hash(e: &Error) -> bool {
    e.iter_chain()
        .any(|c| c.downcast_ref::<LocalDbHashError>().is_some())
}

pub fn is_cycle(e: &Error) -> bool {
    e.iter_chain().any(|c| c.downcast_ref::<CycleError>().is_some())
}
