//! Static file runtime.
//!
//! Serves an app directory as-is. Unknown extension-less paths fall back to
//! the entry document so client-side routers work, and HTML documents get
//! their `<base href>` pointed at the mount path from the `x-base` header.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderValue, Method, Response, StatusCode};

use super::AppRuntime;
use crate::base_href;
use crate::error::WorkerError;
use crate::{WorkerRequest, WorkerResponse, BASE_HEADER};

pub struct StaticRuntime {
    root: PathBuf,
    entry: PathBuf,
}

impl StaticRuntime {
    pub fn new(root: &Path, entrypoint: &str) -> Result<Self, WorkerError> {
        let entry = safe_join(root, entrypoint).ok_or_else(|| {
            WorkerError::Startup(format!("invalid entrypoint '{}'", entrypoint))
        })?;
        Ok(Self {
            root: root.to_path_buf(),
            entry,
        })
    }

    async fn locate(&self, request_path: &str) -> Option<PathBuf> {
        let decoded = urlencoding::decode_binary(request_path.as_bytes());
        let decoded = String::from_utf8_lossy(&decoded);
        let relative = decoded.trim_start_matches('/');

        if relative.is_empty() {
            return Some(self.entry.clone());
        }

        let candidate = safe_join(&self.root, relative)?;
        match tokio::fs::metadata(&candidate).await {
            Ok(meta) if meta.is_file() => return Some(candidate),
            Ok(meta) if meta.is_dir() => {
                let index = candidate.join("index.html");
                if is_file(&index).await {
                    return Some(index);
                }
            }
            _ => {}
        }

        // SPA fallback only for route-like paths, never for missing assets.
        let last = relative.rsplit('/').next().unwrap_or_default();
        if !last.contains('.') {
            return Some(self.entry.clone());
        }
        None
    }
}

#[async_trait(?Send)]
impl AppRuntime for StaticRuntime {
    async fn handle(&self, request: WorkerRequest) -> Result<WorkerResponse, WorkerError> {
        if request.method() != Method::GET && request.method() != Method::HEAD {
            return Ok(text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed"));
        }

        let Some(path) = self.locate(request.uri().path()).await else {
            return Ok(text_response(StatusCode::NOT_FOUND, "Not Found"));
        };

        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(text_response(StatusCode::NOT_FOUND, "Not Found"));
            }
            Err(e) => return Err(WorkerError::App(e.to_string())),
        };

        let mime = content_type(&path);
        let body = match request.headers().get(BASE_HEADER).and_then(|v| v.to_str().ok()) {
            Some(base) if mime.starts_with("text/html") => {
                let html = String::from_utf8_lossy(&contents);
                Bytes::from(base_href::rewrite(&html, base))
            }
            _ => Bytes::from(contents),
        };

        let len = body.len();
        let body = if request.method() == Method::HEAD {
            Bytes::new()
        } else {
            body
        };

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, HeaderValue::from_static(mime))
            .header(header::CONTENT_LENGTH, len)
            .body(body)
            .map_err(|e| WorkerError::App(e.to_string()))
    }
}

fn text_response(status: StatusCode, text: &'static str) -> WorkerResponse {
    let mut response = Response::new(Bytes::from_static(text.as_bytes()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Join `relative` onto `root`, refusing anything that would escape it.
fn safe_join(root: &Path, relative: &str) -> Option<PathBuf> {
    let mut out = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(out)
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" | "map" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "wasm" => "application/wasm",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn app_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("index.html"),
            "<html><head><title>todo</title></head><body></body></html>",
        )
        .unwrap();
        std::fs::create_dir(dir.path().join("assets")).unwrap();
        std::fs::write(dir.path().join("assets/app.js"), "console.log(1)").unwrap();
        dir
    }

    fn get(path: &str, base: Option<&str>) -> WorkerRequest {
        let mut builder = http::Request::builder().method(Method::GET).uri(path);
        if let Some(base) = base {
            builder = builder.header(BASE_HEADER, base);
        }
        builder.body(Bytes::new()).unwrap()
    }

    #[tokio::test]
    async fn test_serves_entry_with_base_href() {
        let dir = app_dir();
        let runtime = StaticRuntime::new(dir.path(), "index.html").unwrap();

        let response = runtime.handle(get("/", Some("/todo"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = String::from_utf8(response.body().to_vec()).unwrap();
        assert!(body.contains(r#"<base href="/todo/">"#));
    }

    #[tokio::test]
    async fn test_serves_assets_untouched() {
        let dir = app_dir();
        let runtime = StaticRuntime::new(dir.path(), "index.html").unwrap();

        let response = runtime.handle(get("/assets/app.js", Some("/todo"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/javascript; charset=utf-8"
        );
        assert_eq!(response.body().as_ref(), b"console.log(1)");
    }

    #[tokio::test]
    async fn test_spa_fallback_and_missing_asset() {
        let dir = app_dir();
        let runtime = StaticRuntime::new(dir.path(), "index.html").unwrap();

        let response = runtime.handle(get("/settings/profile", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = runtime.handle(get("/assets/missing.css", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let dir = app_dir();
        let runtime = StaticRuntime::new(dir.path(), "index.html").unwrap();

        let response = runtime.handle(get("/../secret.txt", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_rejects_writes() {
        let dir = app_dir();
        let runtime = StaticRuntime::new(dir.path(), "index.html").unwrap();

        let request = http::Request::builder()
            .method(Method::POST)
            .uri("/")
            .body(Bytes::new())
            .unwrap();
        let response = runtime.handle(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_decodes_escaped_paths() {
        let dir = app_dir();
        std::fs::write(dir.path().join("assets/my file.css"), "body {}").unwrap();
        let runtime = StaticRuntime::new(dir.path(), "index.html").unwrap();

        let response = runtime.handle(get("/assets/my%20file.css", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), b"body {}");

        // an encoded `..` is still a traversal once decoded
        let response = runtime.handle(get("/%2e%2e/secret.txt", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
