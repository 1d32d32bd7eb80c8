//! Data structures related to packages.
//!
//! Packages are namespaced under dotted paths (`org.example.libfoo`) and
//! pinned to either a semantic version or a branch name. A `PackageId` is
//! the pair of both, and is what the resolver, the on-disk cache and the
//! check engine key on.

pub mod config;

use indexmap::IndexMap;
use semver;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{
    cmp::Ordering,
    fmt,
    ops::{BitOr, BitOrAssign},
    str::FromStr,
};

use failure::{bail, Error};

use crate::util::errors::{ErrorKind, Res};

/// An unresolved request set: the packages the caller wants, with the
/// version (or branch, or `*`) each should resolve at.
pub type Packages = IndexMap<PackagePath, Version>;

/// A dotted package namespace identifier, e.g. `org.example.libfoo`.
///
/// The `loc` root namespace is reserved for local/workspace projects which
/// must never be fetched from a remote.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackagePath(String);

impl PackagePath {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// True if `self` is a proper prefix of `other` under the dot separator:
    /// `org.boost` is a root of `org.boost.algorithm`, but not of
    /// `org.boosted`.
    pub fn is_root_of(&self, other: &PackagePath) -> bool {
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'.'
    }

    /// True for local/workspace identifiers which are resolved in-tree and
    /// never requested from a remote.
    pub fn is_loc(&self) -> bool {
        self.segments().next() == Some("loc")
    }
}

impl FromStr for PackagePath {
    type Err = Error;

    fn from_str(s: &str) -> Res<Self> {
        let ok = !s.is_empty()
            && s.split('.').all(|seg| {
                !seg.is_empty()
                    && seg
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            });
        if !ok {
            bail!(
                "{}: package paths are dot-separated alphanumeric segments, got {:?}",
                ErrorKind::InvalidPackagePath,
                s
            )
        }
        Ok(PackagePath(s.to_string()))
    }
}

impl fmt::Display for PackagePath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for PackagePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PackagePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(de::Error::custom)
    }
}

/// A package version: either a semantic version or a branch name.
///
/// The branch query `*` stands for "any version" and resolves to the highest
/// published semver.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Version {
    Semver(semver::Version),
    Branch(String),
}

impl Version {
    /// The query string the remote accepts for this version.
    pub fn to_any_version(&self) -> String {
        match self {
            Version::Semver(v) => v.to_string(),
            Version::Branch(b) => b.clone(),
        }
    }

    pub fn is_branch(&self) -> bool {
        match self {
            Version::Branch(_) => true,
            _ => false,
        }
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Res<Self> {
        if s.is_empty() {
            bail!("{}: empty version", ErrorKind::InvalidVersion)
        }
        if let Ok(v) = semver::Version::parse(s) {
            return Ok(Version::Semver(v));
        }
        if s.contains(char::is_whitespace) || s.contains('/') {
            bail!("{}: bad branch name {:?}", ErrorKind::InvalidVersion, s)
        }
        Ok(Version::Branch(s.to_string()))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Version::Semver(v) => write!(f, "{}", v),
            Version::Branch(b) => write!(f, "{}", b),
        }
    }
}

// Semvers order among themselves and sort before branches; branches order
// lexicographically. Only used for deterministic iteration, not resolution.
impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        use self::Version::*;
        match (self, other) {
            (Semver(a), Semver(b)) => a.cmp(b),
            (Branch(a), Branch(b)) => a.cmp(b),
            (Semver(_), Branch(_)) => Ordering::Less,
            (Branch(_), Semver(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(de::Error::custom)
    }
}

/// A fully pinned package: path plus version.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageId {
    pub path: PackagePath,
    pub version: Version,
}

impl PackageId {
    pub fn new(path: PackagePath, version: Version) -> Self {
        PackageId { path, version }
    }

    /// The name used for archives and log lines: `org.example.libfoo-1.2.0`.
    pub fn target_name(&self) -> String {
        format!("{}-{}", self.path, self.version)
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.path, self.version)
    }
}

/// A fixed bit set of per-package flags.
///
/// Unknown bits coming from a remote are preserved verbatim so that newer
/// servers can introduce flags without older clients corrupting them.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageFlags(pub u64);

impl PackageFlags {
    /// The package is a local/workspace project.
    pub const LOCAL_PROJECT: PackageFlags = PackageFlags(1);
    /// The package was requested directly rather than pulled in transitively.
    pub const DIRECT_DEPENDENCY: PackageFlags = PackageFlags(1 << 1);
    /// Only the package's include directories are consumed; nothing is built
    /// or linked from it.
    pub const INCLUDE_DIRECTORIES_ONLY: PackageFlags = PackageFlags(1 << 2);

    pub fn contains(self, other: PackageFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PackageFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: PackageFlags) {
        self.0 &= !other.0;
    }
}

impl BitOr for PackageFlags {
    type Output = PackageFlags;

    fn bitor(self, rhs: PackageFlags) -> PackageFlags {
        PackageFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for PackageFlags {
    fn bitor_assign(&mut self, rhs: PackageFlags) {
        self.0 |= rhs.0;
    }
}
