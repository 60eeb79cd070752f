//! beachplug, a file-server backend with a styled directory listing.
//!
//! Files are served exactly like the default backend; directories render as
//! an HTML page listing subdirectories first, then files with their sizes
//! and modification times. Registered by `krakend` under the type name
//! `beachplug`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

use crate::fileserver::{
    self, Constructor, FileRequest, FileServer, ServeFuture,
};

const STYLE: &str = "\
body { font-family: sans-serif; margin: 2em auto; max-width: 50em; color: #333; }\n\
h1 { font-size: 1.2em; border-bottom: 2px solid #06c; padding-bottom: .3em; }\n\
ul { list-style: none; padding-left: 0; }\n\
li { padding: .15em 0; }\n\
a { color: #06c; text-decoration: none; }\n\
a:hover { text-decoration: underline; }\n\
table { border-collapse: collapse; width: 100%; }\n\
td { padding: .15em .8em .15em 0; }\n\
td.size, td.mtime { color: #888; white-space: nowrap; text-align: right; }\n";

pub fn constructor() -> Constructor {
    Box::new(|root, _params| Arc::new(BeachplugServer::new(root)))
}

pub struct BeachplugServer {
    root: String,
}

impl BeachplugServer {
    pub fn new(root: &str) -> Self {
        Self {
            root: root.to_string(),
        }
    }
}

impl FileServer for BeachplugServer {
    fn root(&self) -> &str {
        &self.root
    }

    fn serve(&self, req: FileRequest) -> ServeFuture {
        let root = PathBuf::from(self.root.clone());
        Box::pin(async move {
            let fs_path = match fileserver::resolve_path(&root, &req.path) {
                Some(p) => p,
                None => return fileserver::text_response(StatusCode::BAD_REQUEST, "invalid path"),
            };
            let meta = match tokio::fs::metadata(&fs_path).await {
                Ok(m) => m,
                Err(_) => return fileserver::not_found(&req.path),
            };

            if !meta.is_dir() {
                return fileserver::serve_file(&fs_path, &meta, &req).await;
            }
            if !req.path.ends_with('/') {
                return fileserver::redirect(&format!("{}/", req.path));
            }
            render_listing(&fs_path, &req.path).await
        })
    }
}

struct FileRow {
    name: String,
    size: u64,
    modified: Option<SystemTime>,
}

async fn render_listing(fs_path: &std::path::Path, url_path: &str) -> Response<Full<Bytes>> {
    let mut entries = match tokio::fs::read_dir(fs_path).await {
        Ok(e) => e,
        Err(_) => return fileserver::not_found(url_path),
    };

    let mut directories = Vec::new();
    let mut files = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        match entry.metadata().await {
            Ok(meta) if meta.is_dir() => directories.push(name),
            Ok(meta) => files.push(FileRow {
                name,
                size: meta.len(),
                modified: meta.modified().ok(),
            }),
            Err(_) => {}
        }
    }
    directories.sort();
    files.sort_by(|a, b| a.name.cmp(&b.name));

    let title = fileserver::html_escape(url_path);
    let mut page = String::with_capacity(1 << 10);
    page.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
    page.push_str(&format!("<title>{}</title>\n", title));
    page.push_str(&format!("<style>\n{}</style>\n</head>\n<body>\n", STYLE));
    page.push_str(&format!("<h1>{}</h1>\n", title));

    if !directories.is_empty() {
        page.push_str("<ul>\n");
        for name in &directories {
            let escaped = fileserver::html_escape(name);
            page.push_str(&format!("<li><a href=\"{0}/\">{0}/</a></li>\n", escaped));
        }
        page.push_str("</ul>\n");
    }

    if !files.is_empty() {
        page.push_str("<table>\n");
        for row in &files {
            let escaped = fileserver::html_escape(&row.name);
            let mtime = row
                .modified
                .map(fileserver::http_date)
                .unwrap_or_default();
            page.push_str(&format!(
                "<tr><td><a href=\"{0}\">{0}</a></td><td class=\"size\">{1}</td><td class=\"mtime\">{2}</td></tr>\n",
                escaped,
                human_size(row.size),
                mtime
            ));
        }
        page.push_str("</table>\n");
    }

    page.push_str("</body>\n</html>\n");
    fileserver::html_response(StatusCode::OK, page)
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}
