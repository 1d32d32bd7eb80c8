//! The seam between the check engine and the actual compiler machinery.
//!
//! The engine writes a minimal translation unit to a scratch directory and
//! asks the [`Compiler`] to take it to one of three stages. How the
//! compiler is located, invoked and parsed is someone else's problem; the
//! engine only consumes the outcome.

use std::path::{Path, PathBuf};

use crate::util::errors::Res;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProbeMode {
    /// Succeed iff the source compiles.
    Compile,
    /// Succeed iff the source compiles and links into an executable.
    Link,
    /// Link, then execute; the probe result is the exit code.
    Run,
}

/// One probe handed to the compiler.
#[derive(Debug)]
pub struct Probe<'a> {
    /// The translation unit (`x.c` or `x.cpp`) the engine wrote.
    pub source: &'a Path,
    pub mode: ProbeMode,
    pub cpp: bool,
    pub include_dirs: &'a [PathBuf],
    pub libraries: &'a [String],
    pub options: &'a [String],
    /// The probe's scratch directory; intermediates and the produced
    /// binary (if any) go here.
    pub out_dir: &'a Path,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The requested stage failed (a legitimate negative result).
    Failed,
    /// Compile/Link modes: the requested stage succeeded.
    Built,
    /// Run mode: the binary ran and exited with this code.
    Ran(i32),
    /// Run mode: the binary was built for a target this host cannot
    /// execute; the path survives so it can be shipped to the target.
    CrossCompiled(PathBuf),
}

pub trait Compiler: Send + Sync {
    fn probe(&self, probe: &Probe<'_>) -> Res<ProbeOutcome>;
}
