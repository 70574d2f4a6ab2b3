use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::llm::LlmClient;
use crate::mcp::McpClient;
use crate::relay::run_batch;

const READ_CHUNK_BYTES: usize = 8 * 1024;
const MAX_REQUEST_BYTES: usize = 1024 * 1024;

/// Categories the asset endpoint is allowed to serve. Requests outside this
/// list are rejected before touching the filesystem.
pub const ALLOWED_CATEGORIES: &[&str] = &["character", "scene", "video", "webtoon"];

/// Shared per-process relay state. Batches are request-scoped and share only
/// the read-only session inside the MCP client.
pub struct ServerState {
    pub llm: LlmClient,
    pub mcp: McpClient,
    pub public_base: String,
    pub asset_dir: PathBuf,
    pub started_at: Instant,
}

pub struct RelayServer {
    state: Arc<ServerState>,
}

impl RelayServer {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    pub async fn run(self, bind: &str) -> Result<()> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("relay server failed to bind {bind}"))?;
        let bound = listener
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| bind.to_owned());
        info!("relay server listening on http://{bound}");
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, remote_addr)) => {
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, state).await {
                            warn!("relay connection {remote_addr} failed: {err}");
                        }
                    });
                }
                Err(err) => {
                    warn!("relay server accept failed: {err}");
                }
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, state: Arc<ServerState>) -> Result<()> {
    let Some(request) = read_http_request(&mut stream).await? else {
        return Ok(());
    };

    if request.method == "GET" {
        if let Some((category, filename)) = parse_image_path(&request.path) {
            return serve_asset(&mut stream, &state, &category, &filename).await;
        }
    }

    match (request.method.as_str(), request.path.as_str()) {
        ("POST", "/route") => handle_route(&mut stream, &state, &request.body).await,
        ("GET", "/health") => {
            let payload = json!({
                "ok": true,
                "service": env!("CARGO_PKG_NAME"),
                "uptimeMs": state.started_at.elapsed().as_millis() as u64
            });
            write_http_json_response(&mut stream, 200, &payload).await
        }
        ("GET", _) | ("POST", _) => {
            let payload = json!({
                "error": "not_found",
                "path": request.path
            });
            write_http_json_response(&mut stream, 404, &payload).await
        }
        _ => {
            let payload = json!({ "error": "method_not_allowed" });
            write_http_json_response(&mut stream, 405, &payload).await
        }
    }
}

async fn handle_route(
    stream: &mut TcpStream,
    state: &ServerState,
    body: &[u8],
) -> Result<()> {
    let prompt = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|payload| {
            payload
                .get("prompt")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|prompt| !prompt.is_empty())
                .map(str::to_owned)
        });
    let Some(prompt) = prompt else {
        let payload = json!({ "error": "prompt is required" });
        return write_http_json_response(stream, 400, &payload).await;
    };

    match run_batch(&state.llm, &state.mcp, &state.public_base, &prompt).await {
        Ok(result) => write_http_json_response(stream, 200, &result).await,
        Err(err) => {
            warn!("relay batch failed: {err}");
            let payload = json!({ "error": err.message });
            write_http_json_response(stream, err.http_status(), &payload).await
        }
    }
}

/// Splits `/image/<category>/<filename>` into its two segments. Returns None
/// for any other path shape.
fn parse_image_path(path: &str) -> Option<(String, String)> {
    let rest = path.strip_prefix("/image/")?;
    let (category, filename) = rest.split_once('/')?;
    if category.is_empty() || filename.is_empty() || filename.contains('/') {
        return None;
    }
    Some((category.to_owned(), filename.to_owned()))
}

async fn serve_asset(
    stream: &mut TcpStream,
    state: &ServerState,
    category: &str,
    filename: &str,
) -> Result<()> {
    if !ALLOWED_CATEGORIES.contains(&category) {
        let payload = json!({ "error": "invalid image category" });
        return write_http_json_response(stream, 400, &payload).await;
    }
    // keep lookups inside the category directory
    if filename.contains("..") || filename.contains('\\') {
        let payload = json!({ "error": "invalid filename" });
        return write_http_json_response(stream, 400, &payload).await;
    }

    let full_path = state.asset_dir.join(category).join(filename);
    match tokio::fs::read(&full_path).await {
        Ok(bytes) => {
            write_http_response(stream, 200, content_type_for(filename), &bytes).await
        }
        Err(_) => {
            let payload = json!({ "error": "file not found" });
            write_http_json_response(stream, 404, &payload).await
        }
    }
}

fn content_type_for(filename: &str) -> &'static str {
    if filename.ends_with(".png") {
        "image/png"
    } else if filename.ends_with(".mp4") {
        "video/mp4"
    } else {
        "application/octet-stream"
    }
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

fn header_block_end(buf: &[u8]) -> Option<(usize, usize)> {
    if let Some(idx) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
        return Some((idx, 4));
    }
    buf.windows(2)
        .position(|window| window == b"\n\n")
        .map(|idx| (idx, 2))
}

fn content_length_of(headers: &str) -> usize {
    headers
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0)
}

/// Reads one request off the socket: accumulate until the header block is
/// complete, then until `Content-Length` more bytes have arrived. Returns
/// None for a connection closed without sending anything.
async fn read_http_request(stream: &mut TcpStream) -> Result<Option<HttpRequest>> {
    let mut buffer: Vec<u8> = Vec::with_capacity(READ_CHUNK_BYTES);
    let mut chunk = vec![0_u8; READ_CHUNK_BYTES];
    let mut expected_total: Option<usize> = None;

    loop {
        if let Some(total) = expected_total {
            if buffer.len() >= total {
                break;
            }
        }
        let read = stream
            .read(&mut chunk)
            .await
            .context("failed reading relay request bytes")?;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
        if buffer.len() > MAX_REQUEST_BYTES {
            anyhow::bail!("relay request exceeds {MAX_REQUEST_BYTES} bytes");
        }
        if expected_total.is_none() {
            if let Some((end, separator)) = header_block_end(&buffer) {
                let headers = String::from_utf8_lossy(&buffer[..end]);
                expected_total = Some(end + separator + content_length_of(&headers));
            }
        }
    }

    if buffer.is_empty() {
        return Ok(None);
    }
    let (end, separator) = header_block_end(&buffer)
        .context("invalid relay request: header block never terminated")?;
    let headers = String::from_utf8_lossy(&buffer[..end]);
    let mut request_line = headers.lines().next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_ascii_uppercase();
    if method.is_empty() {
        anyhow::bail!("invalid relay request line");
    }
    let path = request_line
        .next()
        .unwrap_or("/")
        .split('?')
        .next()
        .unwrap_or("/")
        .to_owned();

    let body_start = end + separator;
    let body_len = content_length_of(&headers);
    if buffer.len() < body_start + body_len {
        anyhow::bail!("truncated relay request body");
    }
    let body = buffer[body_start..body_start + body_len].to_vec();
    Ok(Some(HttpRequest { method, path, body }))
}

async fn write_http_json_response(
    stream: &mut TcpStream,
    status_code: u16,
    payload: &Value,
) -> Result<()> {
    let body = serde_json::to_vec(payload).context("failed serializing relay JSON body")?;
    write_http_response(stream, status_code, "application/json; charset=utf-8", &body).await
}

async fn write_http_response(
    stream: &mut TcpStream,
    status_code: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_text = match status_code {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        _ => "OK",
    };
    let mut response = format!(
        "HTTP/1.1 {status_code} {status_text}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body);
    stream
        .write_all(&response)
        .await
        .context("failed writing relay response")?;
    let _ = stream.shutdown().await;
    Ok(())
}
