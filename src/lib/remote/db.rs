//! The local packages db: cached package metadata that answers resolution
//! queries without touching the network.
//!
//! The store is a directory of files, one per dotted package path, each
//! line a JSON record for one published version. Records carry the same
//! stable ids the remote hands out, so a db answer has exactly the same
//! shape as a remote one. Any gap in the data (missing package, missing
//! version, dangling reference) is an error, which sends the resolver to
//! the remote path instead.
//!
//! The db mirrors server state with a refresh delay, so its archive hashes
//! can be stale; the resolver treats a hash mismatch during download as a
//! signal to redo the whole resolution remotely.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use slog::{o, trace, Logger};
use std::{
    collections::VecDeque,
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    str::FromStr,
};

use failure::{format_err, ResultExt};

use crate::{
    package::{PackageFlags, PackagePath, Packages, Version},
    remote::RemoteId,
    resolve::dependency::{prepare_dependencies, DownloadDependency, IdDependencies},
    util::errors::{ErrorKind, Res},
};

/// One version of one package, as stored in the db.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DbRecord {
    pub id: u64,
    pub version: String,
    #[serde(default)]
    pub flags: u64,
    #[serde(default)]
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DbDepRef>,
}

/// A reference to another db record by path and exact version.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DbDepRef {
    pub path: String,
    pub version: String,
}

pub struct LocalPackagesDb {
    root: PathBuf,
    logger: Logger,
}

impl LocalPackagesDb {
    pub fn new(root: &Path, plog: &Logger) -> Self {
        LocalPackagesDb {
            root: root.to_path_buf(),
            logger: plog.new(o!("db" => root.to_string_lossy().into_owned())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Same contract as `RemoteClient::find_dependencies`, served from the
    /// local store: resolves the request set transitively and returns a
    /// prepared id-keyed answer stamped with `remote`.
    pub fn find_dependencies(
        &self,
        request: &Packages,
        remote: RemoteId,
    ) -> Res<IdDependencies> {
        let mut id_deps: IdDependencies = IndexMap::new();
        let mut queue: VecDeque<(PackagePath, Version)> = request
            .iter()
            .map(|(p, v)| (p.clone(), v.clone()))
            .collect();

        while let Some((path, version)) = queue.pop_front() {
            let record = self.select(&path, &version)?;
            if id_deps.contains_key(&record.id) {
                continue;
            }
            trace!(self.logger, "resolved locally";
                   "package" => %path, "version" => &record.version);

            let mut dependency_ids = std::collections::BTreeSet::new();
            for dep in &record.dependencies {
                let dpath = PackagePath::from_str(&dep.path)?;
                let dversion = Version::from_str(&dep.version)?;
                let drec = self.select(&dpath, &dversion)?;
                dependency_ids.insert(drec.id);
                queue.push_back((dpath, dversion));
            }

            let resolved_version = Version::from_str(&record.version)?;
            id_deps.insert(
                record.id,
                DownloadDependency {
                    id: record.id,
                    path,
                    version: resolved_version,
                    sha256: record.sha256.clone(),
                    flags: PackageFlags(record.flags),
                    dependency_ids,
                    remote,
                },
            );
        }

        prepare_dependencies(&mut id_deps, remote)?;
        Ok(id_deps)
    }

    /// Picks the record answering `version`: an exact match, or the highest
    /// semver entry for the any-version query `*`.
    fn select(&self, path: &PackagePath, version: &Version) -> Res<DbRecord> {
        let entries = self.entries(path)?;

        let found = match version {
            Version::Branch(b) if b == "*" => entries
                .into_iter()
                .filter_map(|e| {
                    let v = Version::from_str(&e.version).ok()?;
                    if v.is_branch() {
                        None
                    } else {
                        Some((v, e))
                    }
                })
                .max_by(|(a, _), (b, _)| a.cmp(b))
                .map(|(_, e)| e),
            v => {
                let want = v.to_string();
                entries.into_iter().find(|e| e.version == want)
            }
        };

        found.ok_or_else(|| {
            format_err!(
                "{}: no record of {} at version {}",
                ErrorKind::PackageNotFound,
                path,
                version
            )
        })
    }

    fn entries(&self, path: &PackagePath) -> Res<Vec<DbRecord>> {
        let file = self.root.join(path.as_str());
        let file = fs::File::open(&file).with_context(|_| {
            format_err!("{}: {} is not in the local db", ErrorKind::PackageNotFound, path)
        })?;

        let mut entries = vec![];
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: DbRecord = serde_json::from_str(&line)
                .with_context(|e| format_err!("bad db record for {}: {}", path, e))?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

/// Appends a record to the db, creating the package file if needed. Used to
/// refresh the cache from remote answers.
pub fn append_record(root: &Path, path: &PackagePath, record: &DbRecord) -> Res<()> {
    fs::create_dir_all(root)?;
    let file = root.join(path.as_str());
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    use std::io::Write;
    let mut f = fs::OpenOptions::new().create(true).append(true).open(&file)?;
    f.write_all(line.as_bytes())?;
    Ok(())
}
