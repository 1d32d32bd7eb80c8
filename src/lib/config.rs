//! Global `quarry` settings.
//!
//! Settings change the behavior of the tool itself; they are orthogonal to
//! per-package configs. Everything defaults to off so that a plain
//! `Settings::default()` gives the stock behavior.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use failure::{Error, ResultExt};

use crate::util::errors::{ErrorKind, Res};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Settings {
    /// Bypass the local packages db and always resolve against the remote.
    #[serde(default)]
    pub force_server_query: bool,
    /// Run the verifier pass on every archive before unpacking it.
    #[serde(default)]
    pub verify_all: bool,
    /// Run the check executor with a single worker (for debugging).
    #[serde(default)]
    pub checks_single_thread: bool,
    /// Emit a per-target dump of every definition, value and hash.
    #[serde(default)]
    pub print_checks: bool,
    /// Block in-process until manual checks have been filled in, instead of
    /// failing.
    #[serde(default)]
    pub wait_for_cc_checks: bool,
    /// A command to run (from the `cc/` directory) that performs the manual
    /// checks automatically.
    #[serde(default)]
    pub cc_checks_command: Option<String>,
    /// Worker pool size; defaults to `max(8, cpu count)`.
    #[serde(default = "default_threads")]
    pub threads: usize,
}

fn default_threads() -> usize {
    crate::util::executor::max_threads()
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            force_server_query: false,
            verify_all: false,
            checks_single_thread: false,
            print_checks: false,
            wait_for_cc_checks: false,
            cc_checks_command: None,
            threads: default_threads(),
        }
    }
}

impl FromStr for Settings {
    type Err = Error;

    fn from_str(s: &str) -> Res<Self> {
        toml::from_str(s)
            .context(ErrorKind::InvalidConfig)
            .map_err(Error::from)
    }
}
