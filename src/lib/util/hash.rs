//! Content hashing and stamp files.
//!
//! The persisted check cache (`checks.3.txt`) is keyed by raw 64-bit hashes,
//! so the mixing functions here are frozen: `hash_combine` uses the
//! golden-ratio mix below and strings are folded in with FNV-1a 64. Changing
//! either invalidates every cache on disk and requires bumping the checks
//! file name to `checks.4.txt`.

use blake2::{Blake2b, Digest as _};
use failure::{format_err, ResultExt};
use sha2::{Digest, Sha256};
use std::{
    fs,
    io::{self, Read},
    path::Path,
};

use crate::util::errors::Res;

/// Lowercase hex sha256 of a byte slice.
pub fn sha256(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes).as_slice())
}

/// Streaming sha256 of a file's contents.
pub fn sha256_file(path: &Path) -> Res<String> {
    let mut file = fs::File::open(path)
        .with_context(|e| format_err!("couldn't open {} for hashing:\n{}", path.display(), e))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.result().as_slice()))
}

/// Lowercase hex blake2b-512 of a byte slice.
pub fn blake2b_512(bytes: &[u8]) -> String {
    let mut hasher = Blake2b::new();
    hasher.input(bytes);
    hex::encode(hasher.result().as_slice())
}

/// The first `n` characters of a hex digest.
pub fn shorten(hash: &str, n: usize) -> String {
    hash.chars().take(n).collect()
}

/// Frozen mixing function (do not change; see module docs).
pub fn hash_combine(seed: u64, v: u64) -> u64 {
    seed ^ (v
        .wrapping_add(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(seed << 6)
        .wrapping_add(seed >> 2))
}

/// Frozen FNV-1a 64 (do not change; see module docs).
pub fn str_hash(s: &str) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in s.as_bytes() {
        h ^= u64::from(*b);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

/// Reads a stamp file: the sha256 recorded at last successful unpack.
/// Returns `None` when the stamp is missing or unreadable.
pub fn read_stamp(path: &Path) -> Option<String> {
    let mut s = String::new();
    fs::File::open(path)
        .and_then(|mut f| f.read_to_string(&mut s))
        .ok()?;
    let s = s.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Writes a stamp file atomically (temp file + rename).
pub fn write_stamp(path: &Path, hash: &str) -> Res<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, hash)
        .with_context(|e| format_err!("couldn't write stamp {}:\n{}", tmp.display(), e))?;
    fs::rename(&tmp, path)
        .with_context(|e| format_err!("couldn't commit stamp {}:\n{}", path.display(), e))?;
    Ok(())
}
