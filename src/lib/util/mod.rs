//! Utility functions.

pub mod errors;
pub mod executor;
pub mod graph;
pub mod hash;
pub mod lock;

use std::{fs, path::Path};

use failure::{format_err, ResultExt};
use slog::{o, Drain, Logger};
use walkdir::{DirEntry, WalkDir};

use crate::util::errors::Res;

/// Removes a directory tree if it exists and recreates it empty.
pub fn clear_dir(dir: &Path) -> Res<()> {
    if dir.exists() {
        remove_dir_all::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    Ok(())
}

pub fn valid_file(entry: &DirEntry) -> bool {
    entry.file_type().is_file()
}

/// Recursively copies the files under `from` into `to`.
pub fn copy_dir(from: &Path, to: &Path) -> Res<()> {
    let walker = WalkDir::new(from)
        .follow_links(true)
        .into_iter()
        .filter_map(|x| x.ok().filter(valid_file));

    for entry in walker {
        let to_p = to.join(entry.path().strip_prefix(from).unwrap());
        // Make sure that the file exists before we try copying
        fs::create_dir_all(to_p.parent().unwrap())?;
        let _ = fs::copy(entry.path(), &to_p).with_context(|e| {
            format_err!(
                "couldn't copy {} to {}:\n{}",
                entry.path().display(),
                to_p.display(),
                e
            )
        })?;
    }

    Ok(())
}

/// A terminal logger for callers that don't bring their own.
pub fn default_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}
