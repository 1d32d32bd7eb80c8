//! Module `package/config` parses the per-package `quarry.toml` file found
//! at the root of every unpacked archive.
//!
//! The config is deliberately small: the core only needs the declared
//! dependency table (to materialise real dependency edges after a resolve)
//! and the optional `unpack_directory` relocation. Header-only archives may
//! ship no config at all, in which case everything defaults.

use indexmap::IndexMap;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{
    fs,
    path::{Component, Path, PathBuf},
    str::FromStr,
};

use failure::{bail, format_err, Error, ResultExt};

use crate::util::errors::{ErrorKind, Res};

pub const CONFIG_FILENAME: &str = "quarry.toml";

/// A path that is guaranteed relative and free of `..` components, safe to
/// join under a package directory.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubPath(pub PathBuf);

impl SubPath {
    pub fn is_subpath(p: &Path) -> bool {
        p.is_relative() && p.components().all(|x| x != Component::ParentDir)
    }

    pub fn from_path(p: &Path) -> Res<Self> {
        if SubPath::is_subpath(p) {
            Ok(SubPath(p.to_path_buf()))
        } else {
            bail!("{} isn't a strict subdirectory", p.display())
        }
    }
}

impl FromStr for SubPath {
    type Err = Error;

    fn from_str(s: &str) -> Res<Self> {
        SubPath::from_path(&PathBuf::from(s))
    }
}

impl Serialize for SubPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.0.to_string_lossy().as_ref())
    }
}

impl<'de> Deserialize<'de> for SubPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(de::Error::custom)
    }
}

/// A dependency as declared in a package's own config.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct DepSpec {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub include_directories_only: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct PackageConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// When set, everything unpacked next to the config is moved under this
    /// subdirectory after extraction.
    #[serde(default)]
    pub unpack_directory: Option<SubPath>,
    /// Declared dependencies, keyed by dotted package path. Keys may name a
    /// root namespace that matches several resolved subprojects.
    #[serde(default)]
    pub dependencies: IndexMap<String, DepSpec>,
}

impl FromStr for PackageConfig {
    type Err = Error;

    fn from_str(s: &str) -> Res<Self> {
        toml::from_str(s)
            .context(ErrorKind::InvalidConfig)
            .map_err(Error::from)
    }
}

impl PackageConfig {
    /// Loads the config from an unpacked package directory. A missing file
    /// is not an error; a malformed one is.
    pub fn from_dir(dir: &Path) -> Res<Self> {
        let path = dir.join(CONFIG_FILENAME);
        if !path.exists() {
            return Ok(PackageConfig::default());
        }
        let contents = fs::read_to_string(&path)
            .with_context(|e| format_err!("couldn't read {}:\n{}", path.display(), e))?;
        PackageConfig::from_str(&contents)
            .with_context(|e| format_err!("in {}:\n{}", path.display(), e))
            .map_err(Error::from)
    }
}
