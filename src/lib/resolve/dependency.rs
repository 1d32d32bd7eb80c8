//! Resolved dependency records, as returned by a remote or the local
//! packages db.
//!
//! One resolution answer is a flat map from remote-assigned numeric ids to
//! `DownloadDependency` records; edges between packages are expressed as id
//! sets and only materialised into per-package maps after
//! [`prepare_dependencies`] has validated that no id dangles.

use indexmap::IndexMap;
use std::collections::BTreeSet;

use failure::{bail, format_err};

use crate::{
    package::{PackageFlags, PackageId, PackagePath, Version},
    remote::RemoteId,
    util::errors::Res,
};

/// Everything needed to fetch and verify one package's archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadDependency {
    /// Remote-assigned numeric id, stable within one resolution answer.
    pub id: u64,
    pub path: PackagePath,
    pub version: Version,
    /// Hex digest of the archive; empty means "force download".
    pub sha256: String,
    pub flags: PackageFlags,
    /// Ids of the packages this one depends on, within the same answer.
    pub dependency_ids: BTreeSet<u64>,
    /// The remote that produced this record, as an index into the session's
    /// remote list.
    pub remote: RemoteId,
}

impl DownloadDependency {
    pub fn package_id(&self) -> PackageId {
        PackageId::new(self.path.clone(), self.version.clone())
    }

    pub fn target_name(&self) -> String {
        format!("{}-{}", self.path, self.version)
    }

    /// Materialises this package's dependency edges against the full answer.
    /// Only valid after [`prepare_dependencies`].
    pub fn dependencies<'a>(
        &self,
        all: &'a IdDependencies,
    ) -> Res<IndexMap<PackagePath, &'a DownloadDependency>> {
        let mut deps = IndexMap::new();
        for id in &self.dependency_ids {
            let d = all.get(id).ok_or_else(|| {
                format_err!(
                    "package {} references unknown dependency id {}",
                    self.target_name(),
                    id
                )
            })?;
            deps.insert(d.path.clone(), d);
        }
        Ok(deps)
    }
}

/// A flat resolution answer: `remote id -> DownloadDependency`.
pub type IdDependencies = IndexMap<u64, DownloadDependency>;

/// Stamps every record with its originating remote and checks that each
/// `dependency_ids` entry is present as a key of the map.
pub fn prepare_dependencies(deps: &mut IdDependencies, remote: RemoteId) -> Res<()> {
    let known: BTreeSet<u64> = deps.keys().cloned().collect();
    for d in deps.values_mut() {
        d.remote = remote;
        for id in &d.dependency_ids {
            if !known.contains(id) {
                bail!(
                    "package {} depends on id {} which is missing from the resolution answer",
                    d.target_name(),
                    id
                )
            }
        }
    }
    Ok(())
}
