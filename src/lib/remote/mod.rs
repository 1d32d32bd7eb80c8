//! Remotes: the servers packages are resolved against and downloaded from.
//!
//! Resolution is one POST to `/api/find_dependencies`; the request is the
//! dotted package paths in nested-tree JSON form, the response is a flat
//! id-keyed package map (see [`WireResponse`]). Archives are fetched from
//! `<remote>/data/<path>/<version>.tar.gz`; `file://` remotes are served
//! straight from disk, which the tests and air-gapped mirrors rely on.

pub mod db;

use indexmap::IndexMap;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use slog::{info, o, warn, Logger};
use std::{fs, io, path::Path, str::FromStr, time::Duration};
use url::Url;

use failure::{bail, format_err, Error, ResultExt};

use crate::{
    package::{PackageFlags, PackagePath, Packages, Version},
    resolve::dependency::{prepare_dependencies, DownloadDependency, IdDependencies},
    util::errors::{ErrorKind, Res},
};

/// The protocol level this client speaks. A response is accepted iff its
/// `api` field is this level or the one below.
pub const CURRENT_API_LEVEL: i64 = 1;

/// An index into the session's ordered remote list. Dependency records
/// carry this instead of a back-reference to the remote itself.
pub type RemoteId = usize;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Remote {
    pub name: String,
    pub url: Url,
}

impl Remote {
    pub fn new(name: &str, url: Url) -> Self {
        Remote {
            name: name.to_string(),
            url,
        }
    }

    fn archive_url(&self, path: &PackagePath, version: &Version) -> Res<Url> {
        self.url
            .join(&format!("data/{}/{}.tar.gz", path, version))
            .with_context(|e| format_err!("bad archive url for {}: {}", path, e))
            .map_err(Error::from)
    }

    /// Downloads one package archive to `dest` and returns the archive's
    /// actual sha256.
    ///
    /// When `expected_sha256` is non-empty and the content doesn't match, a
    /// fatal integrity error is raised, unless `allow_stale` is set: then
    /// the actual hash is handed back so the caller can classify the
    /// mismatch (local-db predictions go stale within the server's refresh
    /// window and are retried against the remote instead of failing).
    pub fn download_package(
        &self,
        dep: &DownloadDependency,
        expected_sha256: &str,
        dest: &Path,
        allow_stale: bool,
    ) -> Res<String> {
        let url = self.archive_url(&dep.path, &dep.version)?;
        let bytes = self.fetch(&url).with_context(|e| {
            format_err!("couldn't download package {}: {}", dep.target_name(), e)
        })?;

        let actual = hex::encode(Sha256::digest(&bytes).as_slice());
        if !expected_sha256.is_empty() && actual != expected_sha256 && !allow_stale {
            bail!(
                "{}: archive for {} from {} hashes to {}, expected {}",
                ErrorKind::Integrity,
                dep.target_name(),
                self.name,
                actual,
                expected_sha256
            )
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(dest, &bytes)
            .with_context(|e| format_err!("couldn't write archive {}:\n{}", dest.display(), e))?;

        Ok(actual)
    }

    fn fetch(&self, url: &Url) -> Res<Vec<u8>> {
        match url.scheme() {
            "http" | "https" => {
                let client = Client::new();
                let mut resp = client
                    .get(url.as_str())
                    .send()
                    .and_then(|resp| resp.error_for_status())?;
                let mut buf: Vec<u8> = vec![];
                resp.copy_to(&mut buf)?;
                Ok(buf)
            }
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| format_err!("bad file url {}", url))?;
                let mut buf = vec![];
                let mut f = fs::File::open(&path)
                    .with_context(|e| format_err!("couldn't open {}:\n{}", path.display(), e))?;
                io::Read::read_to_end(&mut f, &mut buf)?;
                Ok(buf)
            }
            s => bail!("unsupported remote scheme {}", s),
        }
    }
}

/// One package entry of a resolution response. Unknown sibling fields are
/// ignored on read; the fields read here round-trip unchanged.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct WirePackage {
    pub id: u64,
    pub version: String,
    #[serde(default)]
    pub flags: u64,
    #[serde(default)]
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<u64>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct WireResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(default)]
    pub packages: IndexMap<String, WirePackage>,
}

/// Serialises a request set into the nested tree form the server expects:
/// every dot segment becomes an object key, the leaf holds the version
/// query.
pub fn request_tree(request: &Packages) -> serde_json::Value {
    use serde_json::{json, Map, Value};

    let mut root = Map::new();
    for (path, version) in request {
        let mut node = &mut root;
        let segments: Vec<&str> = path.segments().collect();
        for seg in &segments {
            node = match node
                .entry(seg.to_string())
                .or_insert_with(|| Value::Object(Map::new()))
            {
                Value::Object(m) => m,
                _ => unreachable!(),
            };
        }
        node.insert(
            "version".to_string(),
            json!(version.to_any_version()),
        );
    }
    serde_json::Value::Object(root)
}

/// Converts a parsed response into an id-keyed dependency map, stamped with
/// the originating remote.
pub fn response_to_dependencies(
    resp: &WireResponse,
    remote: RemoteId,
) -> Res<IdDependencies> {
    let mut id_deps: IdDependencies = IndexMap::new();
    for (path, entry) in &resp.packages {
        let d = DownloadDependency {
            id: entry.id,
            path: PackagePath::from_str(path)?,
            version: Version::from_str(&entry.version)?,
            sha256: entry.sha256.clone(),
            flags: PackageFlags(entry.flags),
            dependency_ids: entry.dependencies.iter().cloned().collect(),
            remote,
        };
        id_deps.insert(entry.id, d);
    }
    prepare_dependencies(&mut id_deps, remote)?;
    Ok(id_deps)
}

/// Writes a dependency map back into response form. Inverse of
/// [`response_to_dependencies`] for the fields the client reads.
pub fn dependencies_to_wire(deps: &IdDependencies) -> WireResponse {
    let mut resp = WireResponse::default();
    resp.api = Some(CURRENT_API_LEVEL);
    for d in deps.values() {
        resp.packages.insert(
            d.path.to_string(),
            WirePackage {
                id: d.id,
                version: d.version.to_string(),
                flags: d.flags.0,
                sha256: d.sha256.clone(),
                dependencies: d.dependency_ids.iter().cloned().collect(),
            },
        );
    }
    resp
}

/// The HTTP client for the resolution and telemetry endpoints.
#[derive(Clone)]
pub struct RemoteClient {
    logger: Logger,
}

impl RemoteClient {
    pub fn new(plog: &Logger) -> Self {
        RemoteClient {
            logger: plog.new(o!("client" => "remote")),
        }
    }

    /// Resolves a request set against one remote.
    ///
    /// Three attempts; connection-level failures halve both timeouts before
    /// the retry (5 s connect / 10 s read initially), HTTP errors retry with
    /// the same timeouts. A well-formed response that carries `error` fails
    /// immediately and is reported exactly once.
    pub fn find_dependencies(
        &self,
        request: &Packages,
        remote: &Remote,
        remote_id: RemoteId,
    ) -> Res<IdDependencies> {
        let url = remote
            .url
            .join("api/find_dependencies")
            .with_context(|e| format_err!("bad remote url {}: {}", remote.url, e))?;
        let body = request_tree(request);

        let mut connect_timeout = Duration::from_secs(5);
        let mut timeout = Duration::from_secs(10);

        let mut tries = 3;
        let resp: WireResponse = loop {
            let attempt = Client::builder()
                .connect_timeout(connect_timeout)
                .timeout(timeout)
                .build()?
                .post(url.as_str())
                .json(&body)
                .send();

            match attempt {
                Ok(resp) => {
                    if !resp.status().is_success() {
                        tries -= 1;
                        if tries == 0 {
                            bail!(
                                "{}: {} answered {}",
                                ErrorKind::Remote,
                                remote.name,
                                resp.status()
                            )
                        }
                        info!(self.logger, "retrying"; "remote" => &remote.name,
                              "status" => resp.status().as_u16());
                        continue;
                    }
                    match resp.json::<WireResponse>() {
                        Ok(parsed) => break parsed,
                        Err(e) => {
                            tries -= 1;
                            if tries == 0 {
                                return Err(Error::from(e)
                                    .context(ErrorKind::Remote)
                                    .into());
                            }
                            info!(self.logger, "retrying"; "remote" => &remote.name);
                        }
                    }
                }
                Err(e) => {
                    tries -= 1;
                    if tries == 0 {
                        warn!(self.logger, "could not reach server"; "remote" => &remote.name);
                        return Err(Error::from(e).context(ErrorKind::Remote).into());
                    }
                    if e.status().is_none() {
                        // transport-level failure: halve both timeouts
                        connect_timeout /= 2;
                        timeout /= 2;
                    }
                    info!(self.logger, "retrying"; "remote" => &remote.name);
                }
            }
        };

        if let Some(err) = &resp.error {
            bail!("{}: {} said: {}", ErrorKind::Remote, remote.name, err)
        }
        if let Some(msg) = &resp.info {
            info!(self.logger, "{}", msg; "remote" => &remote.name);
        }

        let api = match resp.api {
            Some(api) => api,
            None => bail!(
                "{}: {} response is missing the api level",
                ErrorKind::Remote,
                remote.name
            ),
        };
        if api > CURRENT_API_LEVEL {
            bail!(
                "{} uses a newer api level ({}); please upgrade the client",
                remote.name,
                api
            )
        }
        if api < CURRENT_API_LEVEL - 1 {
            bail!(
                "this client's api level is too new for {} (server has {}); \
                 please wait for a server upgrade",
                remote.name,
                api
            )
        }

        if request.len() > resp.packages.len() {
            bail!(
                "{}: {} package(s) are unresolved",
                ErrorKind::DependencyNotResolved,
                request.len() - resp.packages.len()
            )
        }

        response_to_dependencies(&resp, remote_id)
    }

    /// Reports the set of downloaded package ids. Best-effort: every failure
    /// is swallowed.
    pub fn add_downloads(&self, remote: &Remote, ids: &[u64]) {
        let body = serde_json::json!({ "vids": ids });
        let _ = self.post_json(remote, "api/add_downloads", &body);
    }

    /// Reports one client invocation. Callers guard this with the session's
    /// once-per-process latch; failures are swallowed.
    pub fn add_client_call(&self, remote: &Remote) {
        let body = serde_json::json!({});
        let _ = self.post_json(remote, "api/add_client_call", &body);
    }

    fn post_json(&self, remote: &Remote, endpoint: &str, body: &serde_json::Value) -> Res<()> {
        let url = remote.url.join(endpoint)?;
        Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()?
            .post(url.as_str())
            .json(body)
            .send()?;
        Ok(())
    }
}
