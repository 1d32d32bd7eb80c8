//! Persistent storage of check results, one file per configuration hash.
//!
//! The main file is one `<hash> <value>` pair per line, sorted by hash on
//! save so the output is deterministic. The `.manual.txt` sidecar lists
//! checks awaiting human input: a comment line with the macro names, then
//! `<hash> ?` until someone (or the generated runner script) replaces the
//! `?` with an exit code. Resolved sidecar entries are absorbed on load and
//! migrated into the main file by the next save.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use failure::{format_err, ResultExt};

use crate::{checks::Check, util::errors::Res};

pub const MANUAL_CHECKS_SUFFIX: &str = ".manual.txt";

/// The sidecar path for a checks file: `checks.3.txt` ->
/// `checks.3.txt.manual.txt`.
pub fn manual_path(file: &Path) -> PathBuf {
    let mut name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(MANUAL_CHECKS_SUFFIX);
    file.with_file_name(name)
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChecksStorage {
    /// check hash -> recorded value
    pub all_checks: BTreeMap<u64, i64>,
    /// check hash -> definitions, for checks awaiting manual input
    pub manual_checks: BTreeMap<u64, Vec<String>>,
    /// Set when the sidecar contributed freshly-resolved values on load;
    /// the next save migrates them into the main file.
    pub new_manual_checks_loaded: bool,
    loaded: bool,
}

impl ChecksStorage {
    /// Loads the main file and the sidecar. Loading twice is a no-op.
    /// A missing file just leaves the storage empty.
    pub fn load(&mut self, file: &Path) -> Res<()> {
        if self.loaded {
            return Ok(());
        }

        if file.exists() {
            let contents = fs::read_to_string(file)
                .with_context(|e| format_err!("couldn't read {}:\n{}", file.display(), e))?;
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let (hash, value) = parse_line(line)
                    .ok_or_else(|| format_err!("bad check line in {}: {:?}", file.display(), line))?;
                self.all_checks.insert(hash, value);
            }
        }

        self.load_manual(file)?;
        self.loaded = true;
        Ok(())
    }

    /// Loads only the sidecar, absorbing entries whose `?` has been
    /// replaced with an integer.
    pub fn load_manual(&mut self, file: &Path) -> Res<()> {
        let sidecar = manual_path(file);
        if !sidecar.exists() {
            return Ok(());
        }
        let contents = fs::read_to_string(&sidecar)
            .with_context(|e| format_err!("couldn't read {}:\n{}", sidecar.display(), e))?;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.ends_with(" ?") {
                continue;
            }
            let (hash, value) = parse_line(line).ok_or_else(|| {
                format_err!("bad manual check line in {}: {:?}", sidecar.display(), line)
            })?;
            self.all_checks.insert(hash, value);
            self.new_manual_checks_loaded = true;
        }
        Ok(())
    }

    /// Saves the main file (sorted, deterministic) and, when manual checks
    /// are pending, the sidecar.
    pub fn save(&self, file: &Path) -> Res<()> {
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = String::new();
        for (hash, value) in &self.all_checks {
            out.push_str(&format!("{} {}\n", hash, value));
        }
        fs::write(file, out)
            .with_context(|e| format_err!("couldn't write {}:\n{}", file.display(), e))?;

        if !self.manual_checks.is_empty() {
            let mut out = String::new();
            for (hash, definitions) in &self.manual_checks {
                out.push_str("# ");
                out.push_str(&definitions.join(" "));
                out.push('\n');
                out.push_str(&format!("{} ?\n\n", hash));
            }
            let sidecar = manual_path(file);
            fs::write(&sidecar, out)
                .with_context(|e| format_err!("couldn't write {}:\n{}", sidecar.display(), e))?;
        }

        Ok(())
    }

    /// Records one check. Unvalued checks that require manual setup go into
    /// the manual map; unvalued checks that don't are skipped entirely (a
    /// failed probe must not poison the cache).
    pub fn add(&mut self, check: &Check) {
        let hash = check.hash();
        match check.value {
            Some(v) => {
                self.all_checks.insert(hash, v);
            }
            None if check.requires_manual_setup => {
                self.manual_checks
                    .insert(hash, check.definitions.iter().cloned().collect());
            }
            None => {}
        }
    }

    pub fn has_pending_manual(&self) -> bool {
        !self.manual_checks.is_empty()
    }
}

fn parse_line(line: &str) -> Option<(u64, i64)> {
    let mut parts = line.split_whitespace();
    let hash = parts.next()?.parse().ok()?;
    let value = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((hash, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_save_round_trip() {
        let dir = tempdir::TempDir::new("checks").unwrap();
        let file = dir.path().join("checks.3.txt");

        let mut s = ChecksStorage::default();
        s.all_checks.insert(42, 1);
        s.all_checks.insert(7, -3);
        s.all_checks.insert(100, 0);
        s.save(&file).unwrap();

        // sorted by hash, newline-terminated
        let text = fs::read_to_string(&file).unwrap();
        assert_eq!(text, "7 -3\n42 1\n100 0\n");

        let mut loaded = ChecksStorage::default();
        loaded.load(&file).unwrap();
        assert_eq!(loaded.all_checks, s.all_checks);
    }

    #[test]
    fn comments_and_blanks_ignored() {
        let dir = tempdir::TempDir::new("checks").unwrap();
        let file = dir.path().join("checks.3.txt");
        fs::write(&file, "# a comment\n\n12 1\n").unwrap();

        let mut s = ChecksStorage::default();
        s.load(&file).unwrap();
        assert_eq!(s.all_checks.get(&12), Some(&1));
    }

    #[test]
    fn sidecar_entries_absorbed_when_resolved() {
        let dir = tempdir::TempDir::new("checks").unwrap();
        let file = dir.path().join("checks.3.txt");
        fs::write(&file, "1 1\n").unwrap();
        fs::write(
            manual_path(&file),
            "# WORDS_BIGENDIAN\n5 ?\n\n# HAVE_FOO\n9 0\n\n",
        )
        .unwrap();

        let mut s = ChecksStorage::default();
        s.load(&file).unwrap();
        assert_eq!(s.all_checks.get(&9), Some(&0));
        assert!(s.all_checks.get(&5).is_none());
        assert!(s.new_manual_checks_loaded);
    }

    #[test]
    fn malformed_lines_error() {
        let dir = tempdir::TempDir::new("checks").unwrap();
        let file = dir.path().join("checks.3.txt");
        fs::write(&file, "not a line\n").unwrap();
        let mut s = ChecksStorage::default();
        assert!(s.load(&file).is_err());
    }
}
