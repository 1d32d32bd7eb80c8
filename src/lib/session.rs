//! The session ties the pieces together: the on-disk layout, the settings,
//! the ordered remote list, the local packages db and the process-wide
//! bookkeeping both engines need.
//!
//! The two bits of state the original design kept as hidden globals live
//! here as explicit handles: the "client call already reported" latch and
//! the manual-checks re-entry gate.

use slog::Logger;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use crate::{
    config::Settings,
    package::PackageId,
    remote::{db::LocalPackagesDb, Remote},
    util::errors::Res,
};

/// Layouts encapsulate the logic behind our directory structure.
#[derive(Debug, Clone)]
pub struct Layout {
    /// Root directory of the Layout
    pub root: PathBuf,
    /// Unpacked package storage
    pub pkg: PathBuf,
    /// Persistent check caches, keyed by configuration hash
    pub checks: PathBuf,
    /// Local packages db
    pub db: PathBuf,
    /// Scratch space (probe builds, cycle diagnostics)
    pub misc: PathBuf,
    /// Temporary downloads
    pub tmp: PathBuf,
}

impl Layout {
    pub fn new(root: &Path) -> Res<Self> {
        let layout = Layout {
            root: root.to_path_buf(),
            pkg: root.join("pkg"),
            checks: root.join("etc").join("quarry").join("checks"),
            db: root.join("db"),
            misc: root.join("misc"),
            tmp: root.join("tmp"),
        };

        // create_dir_all ignores pre-existing folders
        fs::create_dir_all(&layout.root)?;
        fs::create_dir_all(&layout.pkg)?;
        fs::create_dir_all(&layout.checks)?;
        fs::create_dir_all(&layout.db)?;
        fs::create_dir_all(&layout.misc)?;
        fs::create_dir_all(&layout.tmp)?;

        Ok(layout)
    }

    /// Where a package unpacks: `pkg/<path>/<version>/`.
    pub fn package_dir(&self, id: &PackageId) -> PathBuf {
        self.pkg
            .join(id.path.as_str())
            .join(id.version.to_string())
    }

    /// The stamp holding the archive sha256 recorded at last successful
    /// unpack, inside the package directory.
    pub fn stamp_path(&self, id: &PackageId) -> PathBuf {
        self.package_dir(id).join(".stamp")
    }

    /// The cross-process lock guarding a package's directory. A sibling of
    /// the directory so that re-downloads never touch it.
    pub fn package_lock(&self, id: &PackageId) -> PathBuf {
        self.pkg
            .join(id.path.as_str())
            .join(format!("{}.lock", id.version))
    }

    /// The check cache directory for one configuration hash.
    pub fn checks_dir(&self, config_hash: &str) -> PathBuf {
        self.checks.join(config_hash)
    }

    /// Ephemeral per-probe build directories.
    pub fn checks_scratch(&self) -> PathBuf {
        self.misc.join("checks")
    }

    /// Where cycle diagnostics get dumped.
    pub fn cyclic_dir(&self) -> PathBuf {
        self.misc.join("cyclic")
    }
}

pub struct Session {
    pub layout: Layout,
    pub settings: Settings,
    /// Remotes in fallback order; dependency records refer to these by
    /// index.
    pub remotes: Vec<Remote>,
    pub local_db: LocalPackagesDb,
    pub logger: Logger,
    client_call_sent: AtomicBool,
    pub(crate) manual_gate: Mutex<()>,
}

impl Session {
    pub fn new(
        plog: &Logger,
        root: &Path,
        settings: Settings,
        remotes: Vec<Remote>,
    ) -> Res<Self> {
        let layout = Layout::new(root)?;
        let local_db = LocalPackagesDb::new(&layout.db, plog);
        let logger = plog.new(slog::o!("storage" => root.to_string_lossy().into_owned()));

        Ok(Session {
            layout,
            settings,
            remotes,
            local_db,
            logger,
            client_call_sent: AtomicBool::new(false),
            manual_gate: Mutex::new(()),
        })
    }

    /// True exactly once per session: whether this call should report the
    /// client invocation to the remote.
    pub fn take_client_call_latch(&self) -> bool {
        !self.client_call_sent.swap(true, Ordering::SeqCst)
    }
}
