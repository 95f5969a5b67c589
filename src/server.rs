//! HTTP surface of the search service.
//!
//! A single `tiny_http` listener is drained by a fixed pool of worker threads.
//! Each request is handled start to finish on the worker that received it.

use std::io::{Cursor, Read};
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use multipart::server::Multipart;
use serde::{Deserialize, Serialize};
use tiny_http::{Header, Method, Request, Response, Server};

use crate::service::{ImageSource, SearchService};
use crate::types::{ErrorResponse, SearchResponse};
use crate::{MatcherError, Result};

/// Liveness text served at `/`.
pub const LIVENESS_TEXT: &str = "Visual Product Matcher is running!";

/// Origin allowed by default for cross-origin requests.
pub const DEFAULT_ALLOWED_ORIGIN: &str = "https://visual-product-matcher3.netlify.app";

const MAX_JSON_BODY: u64 = 64 * 1024;
const STATIC_EXTENSIONS: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("webp", "image/webp"),
    ("gif", "image/gif"),
];

type HttpResponse = Response<Cursor<Vec<u8>>>;

/// Settings for the HTTP layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    /// Exact origin echoed in `Access-Control-Allow-Origin`; `*` allows any.
    pub allowed_origin: Option<String>,
    /// Directory catalog images are served from; `None` disables static files.
    pub static_root: Option<PathBuf>,
    pub workers: usize,
    pub max_upload_bytes: u64,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            allowed_origin: Some(DEFAULT_ALLOWED_ORIGIN.to_string()),
            static_root: Some(PathBuf::from(".")),
            workers: 4,
            max_upload_bytes: 16 * 1024 * 1024,
        }
    }
}

struct AppState {
    service: Arc<SearchService>,
    options: ServerOptions,
    shutdown: AtomicBool,
}

/// A running server. Dropping the handle leaves the workers running; call
/// [`ServerHandle::shutdown`] to stop them.
pub struct ServerHandle {
    server: Arc<Server>,
    state: Arc<AppState>,
    addr: SocketAddr,
    workers: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Block until every worker exits.
    pub fn wait(self) {
        for worker in self.workers {
            let _ = worker.join();
        }
    }

    /// Stop accepting requests and join the workers.
    pub fn shutdown(self) {
        self.state.shutdown.store(true, Ordering::SeqCst);
        for _ in &self.workers {
            self.server.unblock();
        }
        self.wait();
    }
}

/// Bind `addr` and start the worker pool.
pub fn start(addr: &str, service: Arc<SearchService>, options: ServerOptions) -> Result<ServerHandle> {
    let server = Server::http(addr)
        .map_err(|e| MatcherError::config(format!("failed to bind {addr}: {e}")))?;
    let local = server
        .server_addr()
        .to_ip()
        .ok_or_else(|| MatcherError::config(format!("{addr} is not an IP listener")))?;
    let server = Arc::new(server);

    let worker_count = options.workers.max(1);
    let state = Arc::new(AppState {
        service,
        options,
        shutdown: AtomicBool::new(false),
    });

    let mut workers = Vec::with_capacity(worker_count);
    for i in 0..worker_count {
        let server = Arc::clone(&server);
        let state = Arc::clone(&state);
        let worker = thread::Builder::new()
            .name(format!("http-worker-{i}"))
            .spawn(move || worker_loop(&server, &state))
            .map_err(MatcherError::from)?;
        workers.push(worker);
    }

    tracing::info!(addr = %local, workers = worker_count, "search service listening");
    Ok(ServerHandle {
        server,
        state,
        addr: local,
        workers,
    })
}

fn worker_loop(server: &Server, state: &AppState) {
    loop {
        match server.recv() {
            Ok(request) => handle(state, request),
            Err(err) => {
                if state.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                tracing::warn!(error = %err, "failed to receive request");
            }
        }
    }
}

fn handle(state: &AppState, mut request: Request) {
    let started = Instant::now();
    let method = request.method().clone();
    let url = request.url().to_string();
    let (path, query) = url.split_once('?').unwrap_or((url.as_str(), ""));
    let origin = header_value(&request, "Origin");

    let response = match (&method, path) {
        (Method::Options, "/api/search") => {
            let response = Response::from_data(Vec::new()).with_status_code(204);
            let response = add_header(response, "Access-Control-Allow-Methods", "GET, POST, OPTIONS");
            add_header(response, "Access-Control-Allow-Headers", "Content-Type")
        }
        (Method::Get, "/") => add_header(
            Response::from_string(LIVENESS_TEXT),
            "Content-Type",
            "text/plain; charset=utf-8",
        ),
        (Method::Post, "/api/search") => match search(state, &mut request, query) {
            Ok(body) => json_response(200, &body),
            Err(err) => error_response(&err),
        },
        (_, "/api/search") => json_response(
            405,
            &ErrorResponse {
                error: format!("Method {method} not allowed"),
                kind: Some("method_not_allowed".into()),
            },
        ),
        (Method::Get | Method::Head, _) => serve_static(&state.options, path),
        _ => not_found(),
    };

    let response = with_cors(response, &state.options, origin.as_deref());
    let status = response.status_code().0;
    if let Err(err) = request.respond(response) {
        tracing::warn!(error = %err, path, "failed to send response");
    }
    tracing::info!(
        method = %method,
        path,
        status,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
}

/// Optional JSON body of a search request.
#[derive(Debug, Default, Deserialize)]
struct SearchBody {
    image_url: Option<String>,
    top_k: Option<usize>,
}

fn search(state: &AppState, request: &mut Request, query: &str) -> Result<SearchResponse> {
    let mut top_k = parse_top_k(query)?;
    let content_type = header_value(request, "Content-Type").unwrap_or_default();

    let source = if let Some(boundary) = multipart_boundary(&content_type) {
        let upload = read_upload(request, &boundary, state.options.max_upload_bytes)?;
        ImageSource::select(upload, None)?
    } else {
        let body = read_json_body(request)?;
        top_k = top_k.or(body.top_k);
        ImageSource::select(None, body.image_url)?
    };

    let results = state.service.search(source, top_k)?;
    Ok(SearchResponse { results })
}

fn parse_top_k(query: &str) -> Result<Option<usize>> {
    let Some(raw) = url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "top_k")
        .map(|(_, value)| value.into_owned())
    else {
        return Ok(None);
    };
    raw.trim()
        .parse::<usize>()
        .map(Some)
        .map_err(|_| MatcherError::invalid_request(format!("top_k must be a positive integer, got '{raw}'")))
}

fn read_json_body(request: &mut Request) -> Result<SearchBody> {
    let mut body = String::new();
    request
        .as_reader()
        .take(MAX_JSON_BODY + 1)
        .read_to_string(&mut body)
        .map_err(|e| MatcherError::invalid_request(format!("read body: {e}")))?;
    if body.len() as u64 > MAX_JSON_BODY {
        return Err(MatcherError::invalid_request("request body too large"));
    }
    if body.trim().is_empty() {
        return Ok(SearchBody::default());
    }
    serde_json::from_str(&body).map_err(|e| MatcherError::invalid_request(format!("json: {e}")))
}

/// Read the `file` field of a multipart body, if present.
fn read_upload(request: &mut Request, boundary: &str, limit: u64) -> Result<Option<Vec<u8>>> {
    let mut multipart = Multipart::with_body(request.as_reader(), boundary);
    let mut upload = None;
    while let Some(mut field) = multipart
        .read_entry()
        .map_err(|e| MatcherError::invalid_request(format!("malformed multipart body: {e}")))?
    {
        if upload.is_some() || &*field.headers.name != "file" {
            continue;
        }
        let mut bytes = Vec::new();
        field
            .data
            .by_ref()
            .take(limit.saturating_add(1))
            .read_to_end(&mut bytes)
            .map_err(|e| MatcherError::invalid_request(format!("read upload: {e}")))?;
        if bytes.len() as u64 > limit {
            return Err(MatcherError::invalid_request(format!(
                "uploaded file exceeds {limit} bytes"
            )));
        }
        upload = Some(bytes);
    }
    Ok(upload)
}

fn multipart_boundary(content_type: &str) -> Option<String> {
    let mut parts = content_type.split(';');
    let mime = parts.next()?.trim();
    if !mime.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    parts.find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}

fn serve_static(options: &ServerOptions, path: &str) -> HttpResponse {
    let Some(root) = options.static_root.as_deref() else {
        return not_found();
    };
    let Some(file) = static_path(root, path) else {
        return not_found();
    };
    let Some(content_type) = content_type_for(&file) else {
        return not_found();
    };
    match std::fs::read(&file) {
        Ok(bytes) => add_header(Response::from_data(bytes), "Content-Type", content_type),
        Err(_) => not_found(),
    }
}

/// Map a request path onto a file under `root`, refusing anything that could escape it.
fn static_path(root: &Path, request_path: &str) -> Option<PathBuf> {
    let decoded = urlencoding::decode(request_path).ok()?;
    let relative = Path::new(decoded.trim_start_matches('/'));
    if relative.as_os_str().is_empty() || decoded.contains('\\') {
        return None;
    }
    let mut resolved = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    resolved.is_file().then_some(resolved)
}

fn content_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    STATIC_EXTENSIONS
        .iter()
        .find(|(known, _)| *known == ext)
        .map(|(_, mime)| *mime)
}

fn with_cors(response: HttpResponse, options: &ServerOptions, origin: Option<&str>) -> HttpResponse {
    let Some(allowed) = options.allowed_origin.as_deref() else {
        return response;
    };
    let value = match origin {
        _ if allowed == "*" => "*",
        Some(origin) if origin == allowed => origin,
        _ => return response,
    };
    let response = add_header(response, "Access-Control-Allow-Origin", value);
    add_header(response, "Vary", "Origin")
}

fn error_response(err: &MatcherError) -> HttpResponse {
    let status = err.status_code();
    if status >= 500 {
        tracing::error!(kind = err.kind(), error = %err, "search failed");
    } else {
        tracing::debug!(kind = err.kind(), error = %err, "rejected search request");
    }
    json_response(
        status,
        &ErrorResponse {
            error: err.to_string(),
            kind: Some(err.kind().to_string()),
        },
    )
}

fn not_found() -> HttpResponse {
    json_response(
        404,
        &ErrorResponse {
            error: "Not found".into(),
            kind: Some("not_found".into()),
        },
    )
}

fn json_response<T: Serialize>(status: u16, body: &T) -> HttpResponse {
    let payload = serde_json::to_vec(body)
        .unwrap_or_else(|_| br#"{"error":"failed to encode response"}"#.to_vec());
    add_header(
        Response::from_data(payload).with_status_code(status),
        "Content-Type",
        "application/json",
    )
}

/// Attach a header; values that are not valid header text are dropped.
fn add_header(response: HttpResponse, name: &str, value: &str) -> HttpResponse {
    match Header::from_bytes(name.as_bytes(), value.as_bytes()) {
        Ok(header) => response.with_header(header),
        Err(()) => {
            tracing::warn!(header = name, "dropping invalid header value");
            response
        }
    }
}

fn header_value(request: &Request, name: &'static str) -> Option<String> {
    request
        .headers()
        .iter()
        .find(|h| h.field.equiv(name))
        .map(|h| h.value.as_str().to_string())
}
