//! Static file serving from a document root.

use std::path::{Component, Path, PathBuf};

use crate::config::StaticFilesConfig;
use crate::http::request::{Method, Request};
use crate::http::response::{Response, StatusCode};

#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
    index_files: Vec<String>,
}

impl StaticFiles {
    pub fn new(root: impl Into<PathBuf>, index_files: Vec<String>) -> Self {
        Self {
            root: root.into(),
            index_files,
        }
    }

    pub fn from_config(config: &StaticFilesConfig) -> Self {
        Self::new(config.document_root.clone(), config.index_files.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Serves the file a request names, or `None` for methods other than
    /// GET and HEAD.
    pub fn serve(&self, request: &Request) -> Option<Response> {
        if !matches!(request.method, Method::GET | Method::HEAD) {
            return None;
        }
        Some(self.resolve(request))
    }

    fn resolve(&self, request: &Request) -> Response {
        let root = match self.root.canonicalize() {
            Ok(root) => root,
            Err(e) => {
                tracing::warn!(root = %self.root.display(), error = %e, "document root unavailable");
                return Response::error_page(StatusCode::NotFound, "File not found");
            }
        };

        let relative = request.path.trim_start_matches('/');
        if Path::new(relative)
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Response::error_page(StatusCode::Forbidden, "Access denied");
        }

        let requested = root.join(relative);
        // Symlinks may still point outside the root.
        let resolved = match requested.canonicalize() {
            Ok(resolved) => resolved,
            Err(_) => return Response::error_page(StatusCode::NotFound, "File not found"),
        };
        if !resolved.starts_with(&root) {
            return Response::error_page(StatusCode::Forbidden, "Access denied");
        }

        if resolved.is_dir() {
            return match self.index_for(&resolved) {
                Some(index) => Response::conditional_file_response(index, request),
                None => Response::error_page(StatusCode::Forbidden, "Directory listing disabled"),
            };
        }
        if !resolved.is_file() {
            return Response::error_page(StatusCode::NotFound, "File not found");
        }

        Response::conditional_file_response(&resolved, request)
    }

    fn index_for(&self, dir: &Path) -> Option<PathBuf> {
        self.index_files
            .iter()
            .map(|name| dir.join(name))
            .find(|candidate| candidate.is_file())
    }
}
