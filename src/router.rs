//! Turns a parsed request into a response: static files for GET, an echo for POST, 405 otherwise.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use crate::request::Request;
use crate::response::{Response, StatusCode};

pub const DEFAULT_DOCUMENT_ROOT: &str = "resource";
pub const DEFAULT_INDEX_DOCUMENT: &str = "index.html";

const POST_ECHO_PREFIX: &[u8] = b"Received POST data:\n";

#[derive(Debug, Clone)]
pub struct Router {
    document_root: PathBuf,
    index_document: String,
}

impl Router {
    pub fn new(document_root: impl Into<PathBuf>, index_document: impl Into<String>) -> Self {
        Self {
            document_root: document_root.into(),
            index_document: index_document.into(),
        }
    }

    pub fn document_root(&self) -> &Path {
        &self.document_root
    }

    pub fn respond(&self, request: &Request) -> Response {
        match request.method.as_str() {
            "GET" => self.serve_file(&request.target),
            "POST" => {
                let mut body = Vec::with_capacity(POST_ECHO_PREFIX.len() + request.body.len());
                body.extend_from_slice(POST_ECHO_PREFIX);
                body.extend_from_slice(&request.body);
                Response::new(StatusCode::Ok, "text/plain", body)
            }
            _ => Response::error(StatusCode::MethodNotAllowed),
        }
    }

    fn serve_file(&self, target: &str) -> Response {
        let Some(path) = self.resolve(target) else {
            debug!(target, "target outside document root");
            return Response::error(StatusCode::NotFound);
        };

        if path.is_dir() {
            debug!(path = %path.display(), "target is a directory");
            return Response::error(StatusCode::NotFound);
        }

        match fs::read(&path) {
            Ok(content) => Response::new(StatusCode::Ok, content_type_for(&path), content),
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), "cannot read resource: {err}");
                }
                Response::error(StatusCode::NotFound)
            }
        }
    }

    /// Maps a request target onto a file under the document root. `None` for anything that would
    /// leave the root.
    pub fn resolve(&self, target: &str) -> Option<PathBuf> {
        let path = target
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .strip_prefix('/')?;

        let mut resolved = self.document_root.clone();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        if path.is_empty() || path.ends_with('/') {
            resolved.push(&self.index_document);
        }
        Some(resolved)
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(DEFAULT_DOCUMENT_ROOT, DEFAULT_INDEX_DOCUMENT)
    }
}

pub fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("html" | "htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("txt") => "text/plain",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}
