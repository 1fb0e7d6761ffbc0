//! Static file origin for file exposures.
//!
//! Serves the session workspace: explorer or zip index at `/`, individual
//! files at their manifest URLs, the bundle at `/download.zip` in zip mode.
//! Only `GET` and `HEAD` are accepted. Successful file and bundle responses
//! are counted as downloads and can exhaust the session's quota.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::header::{
    HeaderValue, ACCEPT_RANGES, CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE,
    CONTENT_TYPE, RANGE, X_CONTENT_TYPE_OPTIONS,
};
use hyper::{Method, Request, Response, StatusCode};
use tracing::debug;

use super::range::{parse_range, RangeOutcome};
use super::render;
use super::{empty_body, full_body, json_error, now_iso, unauthorized_response, OriginBody, OriginService};
use crate::access::{authorize, path_allowed, AuthOutcome};
use crate::netutil::is_sub_path;
use crate::session::record::{LogComponent, Presentation, SessionShared, ShareMode};
use crate::workspace::manifest::{ManifestEntry, BUNDLE_NAME, BUNDLE_URL_NAME};

/// Extensions rendered as HTML when presentation is `preview`.
const MARKDOWN_EXTENSIONS: &[&str] = &["md", "rmd", "qmd"];

/// The static file origin.
pub struct FilesOrigin {
    workspace_dir: PathBuf,
    files: Vec<ManifestEntry>,
    bundle: Option<ManifestEntry>,
    mode: ShareMode,
    presentation: Presentation,
    shared: Arc<SessionShared>,
}

impl FilesOrigin {
    /// Create the origin over a built workspace.
    ///
    /// `files` is the per-file manifest; `bundle` is the bundle's manifest
    /// entry in zip mode.
    pub fn new(
        workspace_dir: PathBuf,
        files: Vec<ManifestEntry>,
        bundle: Option<ManifestEntry>,
        mode: ShareMode,
        presentation: Presentation,
        shared: Arc<SessionShared>,
    ) -> Self {
        Self {
            workspace_dir,
            files,
            bundle,
            mode,
            presentation,
            shared,
        }
    }

    /// The manifest as exposed through the public surface: just the bundle
    /// entry in zip mode, the per-file entries otherwise.
    pub fn public_manifest(&self) -> Vec<ManifestEntry> {
        match (&self.mode, &self.bundle) {
            (ShareMode::Zip, Some(bundle)) => vec![bundle.clone()],
            _ => self.files.clone(),
        }
    }

    fn html_response(&self, html: String, head: bool) -> Response<OriginBody> {
        let bytes = html.into_bytes();
        let len = bytes.len();
        let mut response = Response::new(if head { empty_body() } else { full_body(bytes) });
        let headers = response.headers_mut();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        headers.insert(
            X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        );
        headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
        response
    }

    async fn serve_root(&self, req: &Request<Incoming>, head: bool) -> Response<OriginBody> {
        match self.mode {
            ShareMode::Zip => {
                let Some(bundle) = &self.bundle else {
                    return json_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        serde_json::json!({"error": "internal_error"}),
                    );
                };
                self.html_response(render::zip_index_page(&self.files, bundle), head)
            }
            ShareMode::Normal => {
                // Single-file preview shortcut.
                if self.files.len() == 1 && self.presentation == Presentation::Preview {
                    let entry = self.files[0].clone();
                    let disk_path = self.workspace_dir.join(&entry.name);
                    return self.serve_file(req, &disk_path, &entry.name, head, false).await;
                }
                self.html_response(render::explorer_page(&self.files), head)
            }
        }
    }

    async fn serve_file(
        &self,
        req: &Request<Incoming>,
        disk_path: &Path,
        public_name: &str,
        head: bool,
        is_bundle: bool,
    ) -> Response<OriginBody> {
        let contents = match tokio::fs::read(disk_path).await {
            Ok(contents) => contents,
            Err(e) => {
                debug!("read failed for {:?}: {e}", disk_path);
                return json_error(
                    StatusCode::NOT_FOUND,
                    serde_json::json!({"error": "not_found"}),
                );
            }
        };

        // Markdown preview renders to HTML and bypasses range handling.
        if !is_bundle && self.presentation == Presentation::Preview && is_markdown(public_name) {
            let source = String::from_utf8_lossy(&contents);
            let page = render::markdown_page(public_name, &source);
            let page_len = page.len() as u64;
            let response = self.html_response(page, head);
            if !head {
                self.shared.record_download(now_iso(), page_len);
            }
            return response;
        }

        let size = contents.len() as u64;
        let range_header = req.headers().get(RANGE).and_then(|v| v.to_str().ok());
        let (status, body_bytes, content_range) = match parse_range(range_header, size) {
            RangeOutcome::Full => (StatusCode::OK, contents, None),
            RangeOutcome::Partial(start, end) => (
                StatusCode::PARTIAL_CONTENT,
                contents[start as usize..=end as usize].to_vec(),
                Some(format!("bytes {start}-{end}/{size}")),
            ),
            RangeOutcome::Invalid => {
                return json_error(
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    serde_json::json!({"error": "invalid_range"}),
                );
            }
        };

        let body_len = body_bytes.len() as u64;
        let mut response = Response::new(if head {
            empty_body()
        } else {
            full_body(body_bytes)
        });
        *response.status_mut() = status;

        let content_type = if is_bundle {
            "application/zip".to_string()
        } else {
            effective_mime(public_name, self.presentation)
        };
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&content_type) {
            headers.insert(CONTENT_TYPE, value);
        }
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body_len));
        if let Some(content_range) = content_range {
            if let Ok(value) = HeaderValue::from_str(&content_range) {
                headers.insert(CONTENT_RANGE, value);
            }
        }
        if let Some(disposition) = disposition_for(public_name, self.presentation, is_bundle) {
            if let Ok(value) = HeaderValue::from_str(&disposition) {
                headers.insert(CONTENT_DISPOSITION, value);
            }
        }

        if !head {
            self.shared.record_download(now_iso(), body_len);
        }
        response
    }
}

impl OriginService for FilesOrigin {
    async fn call(self: Arc<Self>, req: Request<Incoming>, remote: SocketAddr) -> Response<OriginBody> {
        self.shared.note_request(now_iso());

        if !self.shared.limiter.check(remote.ip()) {
            self.shared.log(
                now_iso(),
                LogComponent::Origin,
                format!("rate limited {} from {}", req.uri().path(), remote.ip()),
            );
            return json_error(
                StatusCode::TOO_MANY_REQUESTS,
                serde_json::json!({"error": "rate_limited"}),
            );
        }

        let raw_path = req.uri().path().to_string();
        if !path_allowed(&self.shared.access.allowlist_paths, &raw_path) {
            return json_error(
                StatusCode::FORBIDDEN,
                serde_json::json!({"error": "path_not_allowed", "path": raw_path}),
            );
        }

        if authorize(&self.shared.access, req.uri().query(), req.headers()) == AuthOutcome::Unauthorized
        {
            return unauthorized_response(&self.shared.access);
        }

        let head = match req.method() {
            &Method::GET => false,
            &Method::HEAD => true,
            _ => {
                return json_error(
                    StatusCode::METHOD_NOT_ALLOWED,
                    serde_json::json!({"error": "method_not_allowed"}),
                );
            }
        };

        if raw_path == "/" {
            return self.serve_root(&req, head).await;
        }

        let decoded = match urlencoding::decode(&raw_path) {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => {
                return json_error(
                    StatusCode::NOT_FOUND,
                    serde_json::json!({"error": "not_found"}),
                );
            }
        };
        let rel = decoded.trim_start_matches('/');

        // The bundle is served under its public alias only.
        if rel == BUNDLE_NAME {
            return json_error(
                StatusCode::NOT_FOUND,
                serde_json::json!({"error": "not_found"}),
            );
        }
        if rel == BUNDLE_URL_NAME && self.mode == ShareMode::Zip {
            let disk_path = self.workspace_dir.join(BUNDLE_NAME);
            return self.serve_file(&req, &disk_path, BUNDLE_URL_NAME, head, true).await;
        }

        let target = self.workspace_dir.join(rel);
        if !is_sub_path(&target, &self.workspace_dir) {
            return json_error(
                StatusCode::NOT_FOUND,
                serde_json::json!({"error": "not_found"}),
            );
        }
        if !target.is_file() {
            return json_error(
                StatusCode::NOT_FOUND,
                serde_json::json!({"error": "not_found"}),
            );
        }

        self.serve_file(&req, &target, rel, head, false).await
    }
}

fn is_markdown(name: &str) -> bool {
    extension(name)
        .map(|ext| MARKDOWN_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

fn extension(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// MIME type from extension, with the `raw` text-plain override applied.
fn effective_mime(name: &str, presentation: Presentation) -> String {
    let mime = mime_for(name);
    if presentation == Presentation::Raw && is_text_like(mime) {
        return "text/plain; charset=utf-8".to_string();
    }
    mime.to_string()
}

fn is_text_like(mime: &str) -> bool {
    mime.starts_with("text/")
        || mime == "application/json"
        || mime.ends_with("+json")
        || mime.ends_with("+xml")
        || matches!(
            mime,
            "application/javascript" | "application/xml" | "application/x-sh"
        )
}

/// Determine MIME type from the file extension.
fn mime_for(name: &str) -> &'static str {
    match extension(name).as_deref().unwrap_or("") {
        "txt" | "log" => "text/plain",
        "md" | "rmd" | "qmd" | "markdown" => "text/markdown",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "xml" => "application/xml",
        "js" | "mjs" => "application/javascript",
        "json" => "application/json",
        "yaml" | "yml" => "text/yaml",
        "toml" => "text/toml",
        "rs" => "text/x-rust",
        "py" => "text/x-python",
        "sh" => "application/x-sh",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" | "tgz" => "application/gzip",
        "tar" => "application/x-tar",
        "wasm" => "application/wasm",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}

/// Content-disposition header per presentation; `raw` omits it entirely.
fn disposition_for(name: &str, presentation: Presentation, is_bundle: bool) -> Option<String> {
    let kind = if is_bundle {
        "attachment"
    } else {
        match presentation {
            Presentation::Preview => "inline",
            Presentation::Download => "attachment",
            Presentation::Raw => return None,
        }
    };
    let basename = name.rsplit('/').next().unwrap_or(name);
    let fallback: String = basename
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
        .filter(|c| *c != '"' && *c != '\\')
        .collect();
    Some(format!(
        "{kind}; filename=\"{fallback}\"; filename*=UTF-8''{}",
        urlencoding::encode(basename)
    ))
}
