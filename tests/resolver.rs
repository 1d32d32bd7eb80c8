//! End-to-end resolver scenarios: cache hits, stale stamps, stale local-db
//! predictions, shared dependencies and the cross-process download lock.
//!
//! Most tests resolve from the local packages db and download over a
//! `file://` remote; the stale-db recovery test runs a minimal HTTP
//! responder so the remote fallback path is exercised for real.

use quarry::{
    config::Settings,
    package::{PackagePath, Packages, Version},
    remote::{
        db::{append_record, DbDepRef, DbRecord},
        Remote,
    },
    resolve::{ResolvedData, Resolver},
    session::Session,
    util::errors::Res,
};

use flate2::{write::GzEncoder, Compression};
use sha2::{Digest, Sha256};
use slog::{o, Discard, Logger};
use std::{
    fs,
    io::{Read, Write},
    net::TcpListener,
    path::Path,
    str::FromStr,
    sync::{Arc, Barrier},
    thread,
};
use tempdir::TempDir;
use url::Url;

fn logger() -> Logger {
    Logger::root(Discard, o!())
}

fn ppath(s: &str) -> PackagePath {
    PackagePath::from_str(s).unwrap()
}

fn request(reqs: &[(&str, &str)]) -> Packages {
    reqs.iter()
        .map(|(p, v)| (ppath(p), Version::from_str(v).unwrap()))
        .collect()
}

/// Builds a gzipped tarball out of `files`, stores it where a `file://`
/// remote will serve it (`<root>/data/<path>/<version>.tar.gz`) and returns
/// its sha256.
fn make_archive(remote_root: &Path, path: &str, version: &str, files: &[(&str, &str)]) -> String {
    let mut tar_gz = Vec::new();
    {
        let enc = GzEncoder::new(&mut tar_gz, Compression::default());
        let mut builder = tar::Builder::new(enc);
        for (name, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    let dir = remote_root.join("data").join(path);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(format!("{}.tar.gz", version)), &tar_gz).unwrap();

    hex::encode(Sha256::digest(&tar_gz).as_slice())
}

fn file_remote(root: &Path) -> Remote {
    Remote::new("files", Url::from_directory_path(root).unwrap())
}

fn seed_db(session: &Session, path: &str, record: DbRecord) {
    append_record(session.local_db.root(), &ppath(path), &record).unwrap();
}

fn record(id: u64, version: &str, sha256: &str, deps: &[(&str, &str)]) -> DbRecord {
    DbRecord {
        id,
        version: version.to_string(),
        flags: 0,
        sha256: sha256.to_string(),
        dependencies: deps
            .iter()
            .map(|(p, v)| DbDepRef {
                path: (*p).to_string(),
                version: (*v).to_string(),
            })
            .collect(),
    }
}

fn resolve(session: &Session, data: &mut ResolvedData, reqs: &[(&str, &str)]) -> Res<()> {
    let mut resolver = Resolver::new(&logger(), session, data);
    resolver.resolve_dependencies(&request(reqs))
}

#[test]
fn cached_resolve_downloads_nothing() {
    let storage = TempDir::new("storage").unwrap();
    let remote_root = TempDir::new("remote").unwrap();

    // the remote has no data at all: a cache hit must not fetch
    let session = Session::new(
        &logger(),
        storage.path(),
        Settings::default(),
        vec![file_remote(remote_root.path())],
    )
    .unwrap();

    let digest = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
    seed_db(&session, "org.example.libfoo", record(1, "1.0.0", digest, &[]));

    let id = quarry::package::PackageId::new(ppath("org.example.libfoo"), "1.0.0".parse().unwrap());
    let dir = session.layout.package_dir(&id);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("foo.h"), "#pragma once\n").unwrap();
    fs::write(session.layout.stamp_path(&id), digest).unwrap();

    let mut data = ResolvedData::default();
    resolve(&session, &mut data, &[("org.example.libfoo", "1.0.0")]).unwrap();

    assert_eq!(data.download_count(), 0);
    assert!(data.resolved_packages.contains(&id));
    assert!(dir.join("foo.h").exists());
}

#[test]
fn stale_stamp_forces_redownload() {
    let storage = TempDir::new("storage").unwrap();
    let remote_root = TempDir::new("remote").unwrap();

    let digest = make_archive(
        remote_root.path(),
        "org.example.libfoo",
        "1.0.0",
        &[("include/foo.h", "#pragma once\n")],
    );

    let session = Session::new(
        &logger(),
        storage.path(),
        Settings::default(),
        vec![file_remote(remote_root.path())],
    )
    .unwrap();
    seed_db(&session, "org.example.libfoo", record(1, "1.0.0", &digest, &[]));

    let id = quarry::package::PackageId::new(ppath("org.example.libfoo"), "1.0.0".parse().unwrap());
    let dir = session.layout.package_dir(&id);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("stale.txt"), "left over from an older archive\n").unwrap();
    fs::write(session.layout.stamp_path(&id), "deadbeef").unwrap();

    let mut data = ResolvedData::default();
    resolve(&session, &mut data, &[("org.example.libfoo", "1.0.0")]).unwrap();

    assert_eq!(data.download_count(), 1);
    assert_eq!(
        fs::read_to_string(session.layout.stamp_path(&id)).unwrap(),
        digest
    );
    assert!(!dir.join("stale.txt").exists());
    assert!(dir.join("include/foo.h").exists());
}

#[test]
fn shared_dependency_downloads_once_each() {
    let storage = TempDir::new("storage").unwrap();
    let remote_root = TempDir::new("remote").unwrap();

    let a_cfg = "[dependencies.\"org.example.c\"]\nversion = \"2.0.0\"\n";
    let b_cfg = "[dependencies.\"org.example.c\"]\nversion = \"2.0.0\"\n";
    let sha_a = make_archive(
        remote_root.path(),
        "org.example.a",
        "1.0.0",
        &[("quarry.toml", a_cfg), ("a.h", "// a\n")],
    );
    let sha_b = make_archive(
        remote_root.path(),
        "org.example.b",
        "1.0.0",
        &[("quarry.toml", b_cfg), ("b.h", "// b\n")],
    );
    let sha_c = make_archive(
        remote_root.path(),
        "org.example.c",
        "2.0.0",
        &[("c.h", "// c\n")],
    );

    let session = Session::new(
        &logger(),
        storage.path(),
        Settings::default(),
        vec![file_remote(remote_root.path())],
    )
    .unwrap();
    seed_db(
        &session,
        "org.example.a",
        record(1, "1.0.0", &sha_a, &[("org.example.c", "2.0.0")]),
    );
    seed_db(
        &session,
        "org.example.b",
        record(2, "1.0.0", &sha_b, &[("org.example.c", "2.0.0")]),
    );
    seed_db(&session, "org.example.c", record(3, "2.0.0", &sha_c, &[]));

    let mut data = ResolvedData::default();
    resolve(
        &session,
        &mut data,
        &[("org.example.a", "1.0.0"), ("org.example.b", "1.0.0")],
    )
    .unwrap();

    // one download for each of a, b, c
    assert_eq!(data.download_count(), 3);

    for (p, v) in &[
        ("org.example.a", "1.0.0"),
        ("org.example.b", "1.0.0"),
        ("org.example.c", "2.0.0"),
    ] {
        let id = quarry::package::PackageId::new(ppath(p), v.parse().unwrap());
        assert!(
            data.resolved_packages.contains(&id),
            "{} missing from resolved set",
            id
        );
    }

    // edges were materialised against the declared configs
    let a = quarry::package::PackageId::new(ppath("org.example.a"), "1.0.0".parse().unwrap());
    let edges = &data.packages[&a].dependencies;
    assert!(edges.contains_key(&ppath("org.example.c")));
}

#[test]
fn declared_root_matches_resolved_subprojects() {
    let storage = TempDir::new("storage").unwrap();
    let remote_root = TempDir::new("remote").unwrap();

    // x declares a dependency on the org.vendor root; resolution delivers
    // the concrete subproject org.vendor.sub
    let x_cfg = "[dependencies.\"org.vendor\"]\ninclude_directories_only = true\n";
    let sha_x = make_archive(
        remote_root.path(),
        "org.example.x",
        "1.0.0",
        &[("quarry.toml", x_cfg)],
    );
    let sha_sub = make_archive(
        remote_root.path(),
        "org.vendor.sub",
        "3.0.0",
        &[("sub.h", "// sub\n")],
    );

    let session = Session::new(
        &logger(),
        storage.path(),
        Settings::default(),
        vec![file_remote(remote_root.path())],
    )
    .unwrap();
    seed_db(
        &session,
        "org.example.x",
        record(1, "1.0.0", &sha_x, &[("org.vendor.sub", "3.0.0")]),
    );
    seed_db(&session, "org.vendor.sub", record(2, "3.0.0", &sha_sub, &[]));

    let mut data = ResolvedData::default();
    resolve(&session, &mut data, &[("org.example.x", "1.0.0")]).unwrap();

    let x = quarry::package::PackageId::new(ppath("org.example.x"), "1.0.0".parse().unwrap());
    let edges = &data.packages[&x].dependencies;
    let sub = ppath("org.vendor.sub");
    assert!(edges.contains_key(&sub));
    assert!(edges[&sub]
        .flags
        .contains(quarry::package::PackageFlags::INCLUDE_DIRECTORIES_ONLY));
}

#[test]
fn unpack_directory_relocates_contents() {
    let storage = TempDir::new("storage").unwrap();
    let remote_root = TempDir::new("remote").unwrap();

    let cfg = "unpack_directory = \"include/foo\"\n";
    let digest = make_archive(
        remote_root.path(),
        "org.example.libfoo",
        "1.0.0",
        &[
            ("quarry.toml", cfg),
            ("foo.h", "#pragma once\n"),
            ("detail/impl.h", "// impl\n"),
        ],
    );

    let session = Session::new(
        &logger(),
        storage.path(),
        Settings::default(),
        vec![file_remote(remote_root.path())],
    )
    .unwrap();
    seed_db(&session, "org.example.libfoo", record(1, "1.0.0", &digest, &[]));

    let mut data = ResolvedData::default();
    resolve(&session, &mut data, &[("org.example.libfoo", "1.0.0")]).unwrap();

    let id = quarry::package::PackageId::new(ppath("org.example.libfoo"), "1.0.0".parse().unwrap());
    let dir = session.layout.package_dir(&id);
    assert!(dir.join("quarry.toml").exists());
    assert!(dir.join(".stamp").exists());
    assert!(dir.join("include/foo/foo.h").exists());
    assert!(dir.join("include/foo/detail/impl.h").exists());
    assert!(!dir.join("foo.h").exists());
    assert!(!dir.join("detail").exists());
}

#[test]
fn concurrent_resolvers_download_exactly_once() {
    let storage = TempDir::new("storage").unwrap();
    let remote_root = TempDir::new("remote").unwrap();

    let digest = make_archive(
        remote_root.path(),
        "org.example.libfoo",
        "1.0.0",
        &[("foo.h", "#pragma once\n")],
    );

    // seed the db once; both sessions share the storage root
    {
        let session = Session::new(
            &logger(),
            storage.path(),
            Settings::default(),
            vec![file_remote(remote_root.path())],
        )
        .unwrap();
        seed_db(&session, "org.example.libfoo", record(1, "1.0.0", &digest, &[]));
    }

    let barrier = Arc::new(Barrier::new(2));
    let mut handles = vec![];
    for _ in 0..2 {
        let barrier = barrier.clone();
        let storage_path = storage.path().to_path_buf();
        let remote_path = remote_root.path().to_path_buf();
        handles.push(thread::spawn(move || -> usize {
            let session = Session::new(
                &logger(),
                &storage_path,
                Settings::default(),
                vec![file_remote(&remote_path)],
            )
            .unwrap();
            let mut data = ResolvedData::default();
            barrier.wait();
            resolve(&session, &mut data, &[("org.example.libfoo", "1.0.0")]).unwrap();
            data.download_count()
        }));
    }

    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, 1);
}

#[test]
fn all_remotes_exhausted_is_fatal() {
    let storage = TempDir::new("storage").unwrap();

    // nothing in the db, and the remote's port is closed
    let session = Session::new(
        &logger(),
        storage.path(),
        Settings::default(),
        vec![Remote::new(
            "dead",
            Url::parse("http://127.0.0.1:9/").unwrap(),
        )],
    )
    .unwrap();

    let mut data = ResolvedData::default();
    let err = resolve(&session, &mut data, &[("org.example.libfoo", "1.0.0")]).unwrap_err();
    assert!(err.to_string().contains("remote"));
}

// ---------------------------------------------------------------------------
// stale local db prediction, recovered from a live remote

/// A single-purpose HTTP responder: answers `find_dependencies` with the
/// given JSON and serves one archive; telemetry endpoints get `{}`.
fn spawn_remote(resolve_body: String, archive: Vec<u8>) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(s) => s,
                Err(_) => break,
            };

            // read the head, then drain the body per content-length
            let mut buf = Vec::new();
            let mut byte = [0u8; 1];
            while !buf.ends_with(b"\r\n\r\n") {
                match stream.read(&mut byte) {
                    Ok(1) => buf.push(byte[0]),
                    _ => break,
                }
            }
            let head = String::from_utf8_lossy(&buf).into_owned();
            let content_length: usize = head
                .lines()
                .find_map(|l| {
                    let l = l.to_ascii_lowercase();
                    l.strip_prefix("content-length:")
                        .map(|v| v.trim().parse().unwrap_or(0))
                })
                .unwrap_or(0);
            let mut body = vec![0u8; content_length];
            if content_length > 0 {
                let _ = stream.read_exact(&mut body);
            }

            let path = head
                .lines()
                .next()
                .and_then(|l| l.split_whitespace().nth(1))
                .unwrap_or("/")
                .to_string();

            let (content_type, payload): (&str, Vec<u8>) = if path.ends_with(".tar.gz") {
                ("application/octet-stream", archive.clone())
            } else if path.contains("find_dependencies") {
                ("application/json", resolve_body.clone().into_bytes())
            } else {
                ("application/json", b"{}".to_vec())
            };

            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                content_type,
                payload.len()
            );
            let _ = stream.write_all(header.as_bytes());
            let _ = stream.write_all(&payload);
        }
    });

    Url::parse(&format!("http://{}/", addr)).unwrap()
}

#[test]
fn stale_local_db_hash_recovers_via_remote() {
    let storage = TempDir::new("storage").unwrap();
    let scratch = TempDir::new("archive").unwrap();

    // build the archive the server will actually serve
    let digest = make_archive(
        scratch.path(),
        "org.example.libfoo",
        "1.0.0",
        &[("foo.h", "#pragma once\n")],
    );
    let archive = fs::read(
        scratch
            .path()
            .join("data/org.example.libfoo/1.0.0.tar.gz"),
    )
    .unwrap();

    let resolve_body = format!(
        r#"{{"api":1,"packages":{{"org.example.libfoo":{{"id":1,"version":"1.0.0","flags":0,"sha256":"{}"}}}}}}"#,
        digest
    );
    let url = spawn_remote(resolve_body, archive);

    let session = Session::new(
        &logger(),
        storage.path(),
        Settings::default(),
        vec![Remote::new("server", url)],
    )
    .unwrap();

    // the local db predicts a hash the server no longer serves
    let stale = "1111111111111111111111111111111111111111111111111111111111111111";
    seed_db(&session, "org.example.libfoo", record(1, "1.0.0", stale, &[]));

    let mut data = ResolvedData::default();
    resolve(&session, &mut data, &[("org.example.libfoo", "1.0.0")]).unwrap();

    let id = quarry::package::PackageId::new(ppath("org.example.libfoo"), "1.0.0".parse().unwrap());
    assert_eq!(
        fs::read_to_string(session.layout.stamp_path(&id)).unwrap(),
        digest
    );
    assert_eq!(data.download_count(), 1);
    assert!(session.layout.package_dir(&id).join("foo.h").exists());
}
