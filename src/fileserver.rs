//! File-server backends and the registry that constructs them.
//!
//! A backend serves files below one root directory. Backends are produced by
//! named constructors held in a [`Registry`]; the name `default` is reserved
//! for the built-in backend, which every registry can construct even when
//! nothing else is registered.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue};
use hyper::{header, Method, Response, StatusCode};
use serde_json::Value;

/// Free-form backend parameters, decoded from the `fs_params` JSON object.
/// Backends ignore keys they do not recognize.
pub type Params = HashMap<String, Value>;

/// The reserved name of the built-in backend.
pub const DEFAULT_TYPE: &str = "default";

/// The parts of an HTTP request a file-server backend needs. The path has
/// already been rewritten by the mount table (mount prefix stripped).
#[derive(Debug, Clone)]
pub struct FileRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
}

impl FileRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
        }
    }
}

pub type ServeFuture = Pin<Box<dyn Future<Output = Response<Full<Bytes>>> + Send>>;

/// A request-handling capability rooted at one directory.
pub trait FileServer: Send + Sync {
    /// The absolute directory this backend serves from.
    fn root(&self) -> &str;

    /// Serve a request whose path is relative to the mount target.
    fn serve(&self, req: FileRequest) -> ServeFuture;
}

/// Builds a backend from a root directory and parameters.
pub type Constructor = Box<dyn Fn(&str, &Params) -> Arc<dyn FileServer> + Send + Sync>;

#[derive(Debug)]
pub enum RegistryError {
    /// The name is empty or equals the reserved `default`.
    BadName(String),
    /// A constructor is already registered under this name.
    Duplicate(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::BadName(name) => {
                write!(f, "fileserver: invalid type name {:?}", name)
            }
            RegistryError::Duplicate(name) => {
                write!(f, "fileserver: type {:?} is already registered", name)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Maps backend-type names to constructors.
#[derive(Default)]
pub struct Registry {
    constructors: HashMap<String, Constructor>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under `name`. `default` cannot be taken.
    pub fn register(&mut self, name: &str, constructor: Constructor) -> Result<(), RegistryError> {
        if name.is_empty() || name == DEFAULT_TYPE {
            return Err(RegistryError::BadName(name.to_string()));
        }
        if self.constructors.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        self.constructors.insert(name.to_string(), constructor);
        Ok(())
    }

    /// Build a backend of the given type. Unknown or empty types silently
    /// fall back to the built-in backend; this never fails.
    pub fn new_server(&self, root: &str, fs_type: &str, params: &Params) -> Arc<dyn FileServer> {
        match self.constructors.get(fs_type) {
            Some(constructor) => constructor(root, params),
            None => Arc::new(DefaultServer::new(root)),
        }
    }

    /// The registered type names plus `default`, in no particular order.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.constructors.keys().cloned().collect();
        types.push(DEFAULT_TYPE.to_string());
        types
    }
}

/// The built-in backend: plain static files with conditional-request support
/// and an unstyled directory listing.
pub struct DefaultServer {
    root: String,
}

impl DefaultServer {
    pub fn new(root: &str) -> Self {
        Self {
            root: root.to_string(),
        }
    }
}

impl FileServer for DefaultServer {
    fn root(&self) -> &str {
        &self.root
    }

    fn serve(&self, req: FileRequest) -> ServeFuture {
        let root = PathBuf::from(self.root.clone());
        Box::pin(async move {
            let fs_path = match resolve_path(&root, &req.path) {
                Some(p) => p,
                None => return text_response(StatusCode::BAD_REQUEST, "invalid path"),
            };
            let meta = match tokio::fs::metadata(&fs_path).await {
                Ok(m) => m,
                Err(_) => return not_found(&req.path),
            };

            if meta.is_dir() {
                if !req.path.ends_with('/') {
                    return redirect(&format!("{}/", req.path));
                }
                // An index.html shadows the listing.
                let index = fs_path.join("index.html");
                if let Ok(index_meta) = tokio::fs::metadata(&index).await {
                    if index_meta.is_file() {
                        return serve_file(&index, &index_meta, &req).await;
                    }
                }
                return list_dir(&fs_path, &req.path).await;
            }

            serve_file(&fs_path, &meta, &req).await
        })
    }
}

/// Map a URL path onto the filesystem below `root`, rejecting any path that
/// could escape it.
pub(crate) fn resolve_path(root: &Path, url_path: &str) -> Option<PathBuf> {
    let rel = url_path.trim_start_matches('/');
    let rel_path = Path::new(rel);
    for component in rel_path.components() {
        match component {
            Component::Normal(_) => {}
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(root.join(rel_path))
}

/// Serve a regular file, honoring `If-None-Match` and `If-Modified-Since`.
pub(crate) async fn serve_file(
    fs_path: &Path,
    meta: &std::fs::Metadata,
    req: &FileRequest,
) -> Response<Full<Bytes>> {
    let modified = meta.modified().ok();
    let etag = modified.map(|m| file_etag(meta.len(), m));

    if let Some(ref etag) = etag {
        if let Some(inm) = header_str(&req.headers, header::IF_NONE_MATCH) {
            if inm == "*" || inm.split(',').any(|t| t.trim() == etag.as_str()) {
                return not_modified();
            }
        }
    }
    if let (Some(modified), Some(ims)) = (
        modified,
        header_str(&req.headers, header::IF_MODIFIED_SINCE),
    ) {
        if let Some(since) = parse_http_date(ims) {
            // HTTP dates have second granularity.
            let modified: DateTime<Utc> = modified.into();
            if modified.timestamp() <= since.timestamp() {
                return not_modified();
            }
        }
    }

    let body = match tokio::fs::read(fs_path).await {
        Ok(b) => b,
        Err(_) => return text_response(StatusCode::NOT_FOUND, "file not found"),
    };

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type(fs_path))
        .header(header::CONTENT_LENGTH, body.len());
    if let Some(modified) = modified {
        builder = builder.header(header::LAST_MODIFIED, http_date(modified));
    }
    if let Some(etag) = etag {
        builder = builder.header(header::ETAG, etag);
    }

    let body = if req.method == Method::HEAD {
        Bytes::new()
    } else {
        Bytes::from(body)
    };
    builder
        .body(Full::new(body))
        .unwrap_or_else(|_| text_response(StatusCode::INTERNAL_SERVER_ERROR, "response error"))
}

async fn list_dir(fs_path: &Path, url_path: &str) -> Response<Full<Bytes>> {
    let mut entries = match tokio::fs::read_dir(fs_path).await {
        Ok(e) => e,
        Err(_) => return not_found(url_path),
    };
    let mut names = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            name.push('/');
        }
        names.push(name);
    }
    names.sort();

    let mut page = String::from("<!DOCTYPE html>\n<pre>\n");
    for name in &names {
        page.push_str(&format!(
            "<a href=\"{}\">{}</a>\n",
            html_escape(name),
            html_escape(name)
        ));
    }
    page.push_str("</pre>\n");
    html_response(StatusCode::OK, page)
}

fn file_etag(len: u64, modified: SystemTime) -> String {
    let secs = modified
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("W/\"{:x}-{:x}\"", len, secs)
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub(crate) fn http_date(t: SystemTime) -> String {
    let t: DateTime<Utc> = t.into();
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn parse_http_date(s: &str) -> Option<DateTime<Utc>> {
    chrono::NaiveDateTime::parse_from_str(s, "%a, %d %b %Y %H:%M:%S GMT")
        .ok()
        .map(|naive| naive.and_utc())
}

pub(crate) fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    match ext {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" => "text/javascript; charset=utf-8",
        "json" => "application/json",
        "txt" | "md" | "log" => "text/plain; charset=utf-8",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}

pub(crate) fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub(crate) fn text_response(status: StatusCode, msg: &str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(format!("{}\n", msg))));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

pub(crate) fn html_response(status: StatusCode, page: String) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(page)));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    resp
}

pub(crate) fn not_found(path: &str) -> Response<Full<Bytes>> {
    text_response(
        StatusCode::NOT_FOUND,
        &format!("{}: mount target or file not found", path),
    )
}

fn not_modified() -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::new()));
    *resp.status_mut() = StatusCode::NOT_MODIFIED;
    resp
}

pub(crate) fn redirect(location: &str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::new()));
    *resp.status_mut() = StatusCode::MOVED_PERMANENTLY;
    if let Ok(value) = HeaderValue::from_str(location) {
        resp.headers_mut().insert(header::LOCATION, value);
    }
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_rejects_reserved_and_empty_names() {
        let mut registry = Registry::new();
        let ctor: Constructor = Box::new(|root, _| Arc::new(DefaultServer::new(root)));
        assert!(matches!(
            registry.register("default", ctor),
            Err(RegistryError::BadName(_))
        ));
        let ctor: Constructor = Box::new(|root, _| Arc::new(DefaultServer::new(root)));
        assert!(matches!(
            registry.register("", ctor),
            Err(RegistryError::BadName(_))
        ));
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = Registry::new();
        let ctor: Constructor = Box::new(|root, _| Arc::new(DefaultServer::new(root)));
        registry.register("mock", ctor).unwrap();
        let ctor: Constructor = Box::new(|root, _| Arc::new(DefaultServer::new(root)));
        assert!(matches!(
            registry.register("mock", ctor),
            Err(RegistryError::Duplicate(_))
        ));
    }

    #[test]
    fn test_types_always_includes_default() {
        let registry = Registry::new();
        assert_eq!(registry.types(), vec!["default".to_string()]);

        let mut registry = Registry::new();
        let ctor: Constructor = Box::new(|root, _| Arc::new(DefaultServer::new(root)));
        registry.register("mock", ctor).unwrap();
        let mut types = registry.types();
        types.sort();
        assert_eq!(types, vec!["default".to_string(), "mock".to_string()]);
    }

    #[test]
    fn test_unknown_type_falls_back_to_default() {
        let registry = Registry::new();
        let params = Params::new();
        let srv = registry.new_server("/tmp", "no-such-type", &params);
        assert_eq!(srv.root(), "/tmp");
        let srv = registry.new_server("/tmp", "", &params);
        assert_eq!(srv.root(), "/tmp");
    }

    #[test]
    fn test_resolve_path_rejects_traversal() {
        let root = Path::new("/srv/files");
        assert!(resolve_path(root, "/../etc/passwd").is_none());
        assert!(resolve_path(root, "/a/../../b").is_none());
        assert_eq!(
            resolve_path(root, "/a/b.txt"),
            Some(PathBuf::from("/srv/files/a/b.txt"))
        );
        assert_eq!(resolve_path(root, "/"), Some(PathBuf::from("/srv/files/")));
    }

    #[test]
    fn test_content_type_lookup() {
        assert_eq!(
            content_type(Path::new("a/index.html")),
            "text/html; charset=utf-8"
        );
        assert_eq!(content_type(Path::new("a.png")), "image/png");
        assert_eq!(content_type(Path::new("blob")), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_serve_file_conditional_get() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("hello.txt");
        std::fs::write(&file, b"hello").unwrap();
        let meta = std::fs::metadata(&file).unwrap();

        let req = FileRequest::new(Method::GET, "/hello.txt");
        let resp = serve_file(&file, &meta, &req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let etag = resp
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap()
            .to_string();

        let mut req = FileRequest::new(Method::GET, "/hello.txt");
        req.headers
            .insert(header::IF_NONE_MATCH, etag.parse().unwrap());
        let resp = serve_file(&file, &meta, &req).await;
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
    }

    #[tokio::test]
    async fn test_default_server_redirects_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let srv = DefaultServer::new(dir.path().to_str().unwrap());

        let resp = srv.serve(FileRequest::new(Method::GET, "/sub")).await;
        assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            resp.headers().get(header::LOCATION).unwrap(),
            &HeaderValue::from_static("/sub/")
        );
    }

    #[tokio::test]
    async fn test_default_server_lists_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::create_dir(dir.path().join("b")).unwrap();
        let srv = DefaultServer::new(dir.path().to_str().unwrap());

        let resp = srv.serve(FileRequest::new(Method::GET, "/")).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
