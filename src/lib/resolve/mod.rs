//! Module `resolve` turns a set of unresolved package requests into a
//! fully-resolved, unpacked, content-verified local tree.
//!
//! Resolution is two-tier: the local packages db answers first (it's fast
//! and works offline), and any gap or staleness falls back to the remotes
//! in their configured order. Downloads run on a worker pool, one task per
//! package, each guarded by a cross-process file lock and a stamp file so
//! that concurrent quarry processes targeting the same package produce
//! exactly one download between them.
//!
//! A hash mismatch against a local-db prediction is not fatal: the db
//! refreshes on a delay and can lag the server. The worker raises a typed
//! [`LocalDbHashError`] through the executor; the coordinator catches it
//! and re-runs the whole resolution against the remote, once.

pub mod dependency;

use console::style;
use flate2::read::GzDecoder;
use indexmap::{IndexMap, IndexSet};
use slog::{debug, info, o, warn, Logger};
use std::{
    fs,
    path::Path,
    str::FromStr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tar::Archive;

use failure::{bail, format_err, ResultExt};

use self::dependency::{DownloadDependency, IdDependencies};
use crate::{
    package::{
        config::{PackageConfig, CONFIG_FILENAME},
        PackageFlags, PackageId, PackagePath, Packages,
    },
    remote::{Remote, RemoteClient, RemoteId},
    session::{Layout, Session},
    util::{
        copy_dir,
        errors::{is_local_db_hash, ErrorKind, LocalDbHashError, Res},
        executor::Executor,
        hash::{read_stamp, write_stamp},
        lock::FileLock,
    },
};

/// A package after resolution: its parsed config and its materialised
/// dependency edges.
#[derive(Clone, Debug, Default)]
pub struct ResolvedPackage {
    pub config: PackageConfig,
    pub dependencies: IndexMap<PackagePath, DownloadDependency>,
}

/// Everything a session has resolved so far. Written only by the
/// coordinating thread between executor waits; the download counter is the
/// one field workers touch.
#[derive(Debug, Default)]
pub struct ResolvedData {
    /// Requests and packages already resolved this session; used to dedup
    /// repeated `resolve_dependencies` calls.
    pub resolved_packages: IndexSet<PackageId>,
    pub packages: IndexMap<PackageId, ResolvedPackage>,
    /// Archives actually downloaded (not served from the cache).
    pub downloads: Arc<AtomicUsize>,
}

impl ResolvedData {
    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

pub struct Resolver<'a> {
    session: &'a Session,
    data: &'a mut ResolvedData,
    client: RemoteClient,
    pub logger: Logger,
    download_dependencies: IdDependencies,
    query_local_db: bool,
    current_remote: RemoteId,
}

impl<'a> Resolver<'a> {
    pub fn new(plog: &Logger, session: &'a Session, data: &'a mut ResolvedData) -> Self {
        let logger = plog.new(o!());
        Resolver {
            client: RemoteClient::new(&logger),
            session,
            data,
            logger,
            download_dependencies: IndexMap::new(),
            query_local_db: true,
            current_remote: 0,
        }
    }

    /// Entry point: resolves, downloads, verifies and unpacks every
    /// requested package (and its transitive closure), then re-reads the
    /// package configs and materialises dependency edges.
    pub fn resolve_dependencies(&mut self, dependencies: &Packages) -> Res<()> {
        let mut deps = Packages::new();
        for (path, version) in dependencies {
            // local projects are never fetched
            if path.is_loc() {
                continue;
            }
            // skip packages already resolved this session
            let id = PackageId::new(path.clone(), version.clone());
            if self.data.resolved_packages.contains(&id) {
                continue;
            }
            deps.insert(path.clone(), version.clone());
        }

        if deps.is_empty() {
            return Ok(());
        }

        self.resolve(&deps)?;

        // mark both the requests and the concrete resolved set
        for (path, version) in &deps {
            self.data
                .resolved_packages
                .insert(PackageId::new(path.clone(), version.clone()));
        }
        for d in self.download_dependencies.values() {
            self.data.resolved_packages.insert(d.package_id());
        }

        self.read_configs()?;
        self.post_download()
    }

    /// Two-tier resolution with the one-shot stale-db retry.
    fn resolve(&mut self, deps: &Packages) -> Res<()> {
        if self.session.remotes.is_empty() {
            bail!("{}: no remotes configured", ErrorKind::DependencyNotResolved)
        }
        self.current_remote = 0;
        self.query_local_db = !self.session.settings.force_server_query;

        // two attempts at most: local db, then remote after a stale hash
        let mut attempts = if self.query_local_db { 2 } else { 1 };
        while attempts > 0 {
            attempts -= 1;

            if self.query_local_db {
                match self
                    .session
                    .local_db
                    .find_dependencies(deps, self.current_remote)
                {
                    Ok(dd) => self.download_dependencies = dd,
                    Err(e) => {
                        warn!(
                            self.logger,
                            "cannot resolve from the local packages db: {}", e
                        );
                        self.query_local_db = false;
                        self.resolve_remote(deps)?;
                    }
                }
            } else {
                self.resolve_remote(deps)?;
            }

            match self.download_and_unpack() {
                Ok(()) => break,
                Err(e) => {
                    if self.query_local_db && attempts > 0 && is_local_db_hash(&e) {
                        warn!(
                            self.logger,
                            "local db data caused issues, trying the remote instead: {}", e
                        );
                        self.query_local_db = false;
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Tries each configured remote in order, keeping the first that
    /// answers.
    fn resolve_remote(&mut self, deps: &Packages) -> Res<()> {
        while self.current_remote < self.session.remotes.len() {
            let remote = &self.session.remotes[self.current_remote];
            info!(self.logger, "trying remote"; "remote" => &remote.name);
            match self
                .client
                .find_dependencies(deps, remote, self.current_remote)
            {
                Ok(dd) => {
                    self.download_dependencies = dd;
                    return Ok(());
                }
                Err(e) => {
                    warn!(self.logger, "{}", e; "remote" => &remote.name);
                    self.current_remote += 1;
                }
            }
        }
        bail!(
            "{}: tried every configured remote",
            ErrorKind::DependencyNotResolved
        )
    }

    /// Downloads and unpacks every resolved package on a worker pool, then
    /// fires the best-effort telemetry reports on the same pool.
    fn download_and_unpack(&self) -> Res<()> {
        if self.download_dependencies.is_empty() {
            return Ok(());
        }

        let executor = Executor::new(self.session.settings.threads);
        executor.set_throw_on_error(true);

        for dep in self.download_dependencies.values() {
            let task = DownloadTask {
                dep: dep.clone(),
                remote: self.session.remotes[dep.remote].clone(),
                layout: self.session.layout.clone(),
                verify_all: self.session.settings.verify_all,
                allow_stale: self.query_local_db,
                downloads: self.data.downloads.clone(),
                logger: self.logger.clone(),
            };
            executor.submit(move || task.exec());
        }

        executor.wait()?;

        // telemetry, in parallel on the same pool; all failures swallowed
        let remote = self.session.remotes[self.current_remote].clone();
        let ids: Vec<u64> = self.download_dependencies.keys().cloned().collect();
        let client = self.client.clone();
        executor.submit(move || {
            client.add_downloads(&remote, &ids);
            Ok(())
        });

        if self.session.take_client_call_latch() {
            let remote = self.session.remotes[self.current_remote].clone();
            let client = self.client.clone();
            executor.submit(move || {
                client.add_client_call(&remote);
                Ok(())
            });
        }

        executor.wait()
    }

    /// Re-reads the config of every downloaded package. A config that fails
    /// to parse takes its package directory with it, forcing a re-download
    /// on the next run.
    fn read_configs(&mut self) -> Res<()> {
        if self.download_dependencies.is_empty() {
            return Ok(());
        }
        debug!(self.logger, "reading package configs");

        for dep in self.download_dependencies.values() {
            let id = dep.package_id();
            let dir = self.session.layout.package_dir(&id);
            if !dir.exists() {
                continue;
            }

            let config = match PackageConfig::from_dir(&dir) {
                Ok(c) => c,
                Err(e) => {
                    // something is wrong with the unpacked tree; remove it
                    // so the next run re-downloads, but don't swallow
                    let _ = remove_dir_all::remove_dir_all(&dir);
                    return Err(e);
                }
            };

            self.data
                .packages
                .entry(id)
                .or_insert_with(ResolvedPackage::default)
                .config = config;
        }
        Ok(())
    }

    /// Materialises real dependency edges: each resolved package's id edges
    /// are matched against its config's declared dependencies. A declared
    /// root namespace (`org.boost`) matches all resolved subprojects
    /// (`org.boost.algorithm`, ...) and is replaced by them.
    fn post_download(&mut self) -> Res<()> {
        for dep in self.download_dependencies.values() {
            if dep.flags.contains(PackageFlags::LOCAL_PROJECT) {
                continue;
            }
            let id = dep.package_id();
            let edges = dep.dependencies(&self.download_dependencies)?;

            let rp = match self.data.packages.get_mut(&id) {
                Some(rp) => rp,
                None => continue,
            };

            for (dpath, ddep) in &edges {
                if let Some(spec) = rp.config.dependencies.get(dpath.as_str()) {
                    let mut d: DownloadDependency = (**ddep).clone();
                    if spec.include_directories_only {
                        d.flags.insert(PackageFlags::INCLUDE_DIRECTORIES_ONLY);
                    }
                    rp.dependencies.insert(dpath.clone(), d);
                    continue;
                }

                // maybe a declared root project covers this subproject
                let mut to_add: Vec<(PackagePath, DownloadDependency)> = vec![];
                let mut to_remove: Vec<String> = vec![];
                for (decl, spec) in &rp.config.dependencies {
                    let decl_path = match PackagePath::from_str(decl) {
                        Ok(p) => p,
                        Err(_) => continue,
                    };
                    for (cpath, cdep) in &edges {
                        if decl_path.is_root_of(cpath) {
                            let mut d: DownloadDependency = (**cdep).clone();
                            if spec.include_directories_only {
                                d.flags.insert(PackageFlags::INCLUDE_DIRECTORIES_ONLY);
                            }
                            to_add.push((cpath.clone(), d));
                            to_remove.push(decl.clone());
                        }
                    }
                }
                if to_add.is_empty() {
                    bail!(
                        "dependency {} of package {} is not declared in its config",
                        dpath,
                        id
                    )
                }
                for decl in to_remove {
                    rp.config.dependencies.shift_remove(&decl);
                }
                for (p, d) in to_add {
                    rp.dependencies.insert(p, d);
                }
            }
        }
        Ok(())
    }
}

/// One package's download+unpack job; everything it needs is owned so it
/// can run on a pool worker.
struct DownloadTask {
    dep: DownloadDependency,
    remote: Remote,
    layout: Layout,
    verify_all: bool,
    allow_stale: bool,
    downloads: Arc<AtomicUsize>,
    logger: Logger,
}

impl DownloadTask {
    fn exec(&self) -> Res<()> {
        let id = self.dep.package_id();
        let version_dir = self.layout.package_dir(&id);
        let stamp = self.layout.stamp_path(&id);

        if self.is_fresh(&version_dir, &stamp) {
            return Ok(());
        }

        // lock, so only one quarry process at a time downloads this package
        let lock_path = self.layout.package_lock(&id);
        let _guard = match FileLock::try_lock(&lock_path)? {
            Some(guard) => guard,
            None => {
                // download in progress elsewhere; wait for it to finish
                let _guard = FileLock::lock(&lock_path)?;
                return Ok(());
            }
        };

        // the other holder may have completed the work before we checked
        if self.is_fresh(&version_dir, &stamp) {
            return Ok(());
        }

        // verify before any destructive action, so a bad archive stops us
        // while the old tree is still intact
        if self.verify_all {
            self.verify(&id)?;
        }

        if version_dir.exists() {
            remove_dir_all::remove_dir_all(&version_dir).with_context(|e| {
                format_err!("couldn't clean {}:\n{}", version_dir.display(), e)
            })?;
        }

        println!(
            "{:>7} {}",
            style("[get]").dim(),
            self.dep.target_name()
        );
        debug!(self.logger, "downloading"; "package" => self.dep.target_name());

        let archive = self.layout.tmp.join(format!("{}.tar.gz", id));
        let actual =
            self.remote
                .download_package(&self.dep, &self.dep.sha256, &archive, self.allow_stale)?;

        if !self.dep.sha256.is_empty() && actual != self.dep.sha256 {
            // only reachable on the allow_stale path (local db predictions)
            return Err(LocalDbHashError {
                package: self.dep.target_name(),
                expected: self.dep.sha256.clone(),
                actual,
            }
            .into());
        }

        self.downloads.fetch_add(1, Ordering::SeqCst);
        fs::create_dir_all(&version_dir)?;
        write_stamp(&stamp, &self.dep.sha256)?;

        println!(
            "{:>7} {}",
            style("[unp]").dim(),
            self.dep.target_name()
        );
        if let Err(e) = self.unpack(&archive, &version_dir) {
            let _ = remove_dir_all::remove_dir_all(&version_dir);
            return Err(e);
        }
        let _ = fs::remove_file(&archive);

        self.relocate_unpacked(&version_dir)?;

        Ok(())
    }

    /// The cache hit test: directory present and stamp matching the
    /// expected archive hash. An empty expected hash always re-downloads.
    fn is_fresh(&self, version_dir: &Path, stamp: &Path) -> bool {
        let must_download = self.dep.sha256.is_empty()
            || read_stamp(stamp).as_deref() != Some(self.dep.sha256.as_str());
        version_dir.exists() && !must_download
    }

    /// The `verify_all` pass: fetch the archive to scratch and check it
    /// strictly against the advertised hash before touching anything.
    fn verify(&self, id: &PackageId) -> Res<()> {
        if self.dep.sha256.is_empty() {
            return Ok(());
        }
        let scratch = self.layout.tmp.join(format!("{}.verify.tar.gz", id));
        let result = self
            .remote
            .download_package(&self.dep, &self.dep.sha256, &scratch, false)
            .with_context(|e| {
                format_err!("verification failed for {}: {}", self.dep.target_name(), e)
            });
        let _ = fs::remove_file(&scratch);
        result.map(|_| ()).map_err(Into::into)
    }

    fn unpack(&self, archive: &Path, version_dir: &Path) -> Res<()> {
        let file = fs::File::open(archive)?;
        let tar = GzDecoder::new(file);
        let mut tar = Archive::new(tar);
        tar.unpack(version_dir).with_context(|_| {
            format_err!(
                "{}: couldn't unpack archive for {}",
                ErrorKind::Unpack,
                self.dep.target_name()
            )
        })?;
        Ok(())
    }

    /// Post-unpack move: when the package config names an
    /// `unpack_directory`, everything except the config itself is moved
    /// under it.
    fn relocate_unpacked(&self, version_dir: &Path) -> Res<()> {
        let config = PackageConfig::from_dir(version_dir)?;
        let ud = match &config.unpack_directory {
            Some(sub) => version_dir.join(&sub.0),
            None => return Ok(()),
        };

        if ud.exists() {
            bail!(
                "cannot create unpack_directory {} for {}: an fs object with that name \
                 already exists",
                ud.display(),
                self.dep.target_name()
            )
        }
        fs::create_dir_all(&ud)?;

        for entry in fs::read_dir(version_dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name();
            if name == CONFIG_FILENAME || name == ".stamp" || ud.starts_with(&path) {
                continue;
            }
            let dest = ud.join(&name);
            if path.is_dir() {
                copy_dir(&path, &dest)?;
                remove_dir_all::remove_dir_all(&path)?;
            } else {
                fs::copy(&path, &dest)?;
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}
