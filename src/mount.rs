//! The mount table: URL path prefixes mapped to file-server backends.

use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::Response;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};

use crate::fileserver::{self, FileRequest, FileServer, Params, Registry};

/// Stable identifier for a mount target: the first 7 hex digits of its SHA-1.
pub fn mount_id(target: &str) -> String {
    let mut id = sha1_hex(target.as_bytes());
    id.truncate(7);
    id
}

pub(crate) fn sha1_hex(data: &[u8]) -> String {
    let digest = Sha1::digest(data);
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{:02x}", byte);
    }
    hex
}

#[derive(Debug)]
pub enum MountError {
    /// The target does not start with `/`, or ends with `/` without being `/`.
    InvalidTarget,
    /// The source is not an absolute path.
    InvalidSource,
    /// The source could not be stat'ed, or is not a directory.
    SourcePerm(String),
}

impl fmt::Display for MountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountError::InvalidTarget => write!(f, "invalid mount target value"),
            MountError::InvalidSource => write!(f, "invalid mount source value"),
            MountError::SourcePerm(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for MountError {}

/// Concurrent prefix map from mount targets to backends, with
/// longest-prefix request dispatch.
pub struct MountTable {
    m: Mutex<HashMap<String, Arc<dyn FileServer>>>,
    registry: Arc<Registry>,
}

impl MountTable {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            m: Mutex::new(HashMap::new()),
            registry,
        }
    }

    /// Mount `source` at `target`, served by a backend of `fs_type`.
    /// Returns whether the target already existed; the previous backend is
    /// replaced atomically from the point of view of concurrent requests.
    ///
    /// The source directory is stat'ed before the table lock is taken, so
    /// table operations never wait on the filesystem.
    pub async fn put(
        &self,
        target: &str,
        source: &str,
        fs_type: &str,
        params: &Params,
    ) -> Result<bool, MountError> {
        if !target.starts_with('/') {
            return Err(MountError::InvalidTarget);
        }
        if target != "/" && target.ends_with('/') {
            return Err(MountError::InvalidTarget);
        }
        if !Path::new(source).is_absolute() {
            return Err(MountError::InvalidSource);
        }

        let meta = tokio::fs::metadata(source)
            .await
            .map_err(|e| MountError::SourcePerm(format!("{}: {}", source, e)))?;
        if !meta.is_dir() {
            return Err(MountError::SourcePerm(format!(
                "{}: not a directory",
                source
            )));
        }

        let backend = self.registry.new_server(source, fs_type, params);
        let existed = self.m.lock().insert(target.to_string(), backend).is_some();
        Ok(existed)
    }

    /// Remove a mount target. Returns whether it existed.
    pub fn delete_target(&self, target: &str) -> bool {
        self.m.lock().remove(target).is_some()
    }

    /// Snapshot of the current mount targets, in no particular order.
    pub fn targets(&self) -> Vec<String> {
        self.m.lock().keys().cloned().collect()
    }

    /// The source directory mounted at `target`, or `""` if absent.
    pub fn source_of(&self, target: &str) -> String {
        self.m
            .lock()
            .get(target)
            .map(|fs| fs.root().to_string())
            .unwrap_or_default()
    }

    /// Dispatch a request to the backend whose target is the longest prefix
    /// of the request path. The backend reference is captured under the
    /// table lock and invoked after it is released.
    pub async fn serve(&self, mut req: FileRequest) -> Response<Full<Bytes>> {
        let selected = {
            let m = self.m.lock();
            let mut best: Option<(&String, &Arc<dyn FileServer>)> = None;
            for (target, backend) in m.iter() {
                if req.path.starts_with(target.as_str())
                    && best.map_or(true, |(t, _)| target.len() >= t.len())
                {
                    best = Some((target, backend));
                }
            }
            best.map(|(target, backend)| (target.clone(), Arc::clone(backend)))
        };

        let (target, backend) = match selected {
            Some(s) => s,
            None => return fileserver::not_found(&req.path),
        };

        if target != "/" {
            let rest = req.path[target.len()..].to_string();
            if rest.is_empty() {
                // A bare prefix hit gets directory semantics.
                return fileserver::redirect(&format!("{}/", target));
            }
            req.path = rest;
        }
        backend.serve(req).await
    }
}
