use serde_json::{json, Value};
use tracing::{debug, info};

use crate::alias::{AliasMap, BatchContext};
use crate::llm::LlmClient;
use crate::mcp::McpClient;
use crate::planner::CallPlan;
use crate::rewriter::rewrite_call_result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayErrorKind {
    MissingPrompt,
    InvalidModelOutput,
    LlmTransport,
    McpTransport,
    McpProtocol,
}

impl RelayErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingPrompt => "missing_prompt",
            Self::InvalidModelOutput => "invalid_model_output",
            Self::LlmTransport => "llm_transport",
            Self::McpTransport => "mcp_transport",
            Self::McpProtocol => "mcp_protocol",
        }
    }
}

/// Relay failure surfaced to the HTTP caller. Client-input kinds map to 400,
/// downstream kinds to 500; a batch that fails downstream returns no partial
/// results, although side effects of already-completed calls persist on the
/// tool server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayError {
    pub kind: RelayErrorKind,
    pub message: String,
}

impl RelayError {
    pub fn new(kind: RelayErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn http_status(&self) -> u16 {
        match self.kind {
            RelayErrorKind::MissingPrompt | RelayErrorKind::InvalidModelOutput => 400,
            RelayErrorKind::LlmTransport
            | RelayErrorKind::McpTransport
            | RelayErrorKind::McpProtocol => 500,
        }
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

/// Runs one batch: plan the calls from the prompt, then execute them strictly
/// in order, substituting aliases before each dispatch and rewriting each
/// result before the next call starts. Returns the flat `{"result": [...]}`
/// document handed back to the caller.
pub async fn run_batch(
    llm: &LlmClient,
    mcp: &McpClient,
    public_base: &str,
    prompt: &str,
) -> Result<Value, RelayError> {
    let output = llm.generate(prompt).await?;
    debug!("model output: {output}");
    let calls = CallPlan::parse(&output)?.into_calls();
    info!("planned {} call(s) for prompt", calls.len());

    let mut aliases = AliasMap::new();
    let mut context = BatchContext::new();
    let mut all_results: Vec<Value> = Vec::new();

    for (seq, mut call) in calls.into_iter().enumerate() {
        aliases.substitute_input(&mut call.input);
        let mut entries = mcp.call_tool(&call.tool, &call.input, seq).await?;
        let produced = rewrite_call_result(
            &mut entries,
            &call.tool,
            public_base,
            &mut aliases,
            &mut context,
        );
        debug!(
            "call {seq} ({}) returned {} entr{} and {} id(s)",
            call.tool,
            entries.len(),
            if entries.len() == 1 { "y" } else { "ies" },
            produced.len()
        );
        all_results.extend(entries);
    }

    info!(
        "batch complete: {} result(s), {} alias(es), {} character id(s), {} scene id(s)",
        all_results.len(),
        aliases.len(),
        context.character_ids.len(),
        context.scene_ids.len()
    );
    Ok(json!({ "result": all_results }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Client;
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpListener};
    use std::sync::{Arc, Mutex};

    const PUBLIC_BASE: &str = "http://203.0.113.7:8001";

    fn spawn_llm(output: Value) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind llm listener");
        let addr = listener.local_addr().expect("llm addr");
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept llm request");
            let mut buffer = vec![0_u8; 32 * 1024];
            let _ = stream.read(&mut buffer).expect("read llm request");
            let body = json!({ "output": output }).to_string();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream
                .write_all(response.as_bytes())
                .expect("write llm response");
        });
        addr
    }

    /// Serves the initialize handshake and then one scripted body per call,
    /// capturing every request. Bodies are served in order.
    fn spawn_mcp(
        call_bodies: Vec<String>,
    ) -> (SocketAddr, Arc<Mutex<Vec<String>>>, std::thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mcp listener");
        let addr = listener.local_addr().expect("mcp addr");
        let captured = Arc::new(Mutex::new(Vec::new()));
        let captured_server = Arc::clone(&captured);
        let handle = std::thread::spawn(move || {
            let mut responses = Vec::with_capacity(call_bodies.len() + 1);
            responses.push((
                json!({ "result": {} }).to_string(),
                Some("sess-e2e".to_owned()),
            ));
            for body in call_bodies {
                responses.push((body, None));
            }
            for (body, session_header) in responses {
                let (mut stream, _) = listener.accept().expect("accept mcp request");
                let mut buffer = vec![0_u8; 64 * 1024];
                let read = stream.read(&mut buffer).expect("read mcp request");
                captured_server
                    .lock()
                    .expect("lock captured")
                    .push(String::from_utf8_lossy(&buffer[..read]).to_string());
                let header = session_header
                    .map(|token| format!("Mcp-Session-Id: {token}\r\n"))
                    .unwrap_or_default();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                    header,
                    body.len(),
                    body
                );
                stream
                    .write_all(response.as_bytes())
                    .expect("write mcp response");
            }
        });
        (addr, captured, handle)
    }

    fn creator_body(field: &str, id: &str) -> String {
        json!([{
            "result": {
                "content": [
                    { "type": "text", "text": json!({ (field): id }).to_string() }
                ]
            }
        }])
        .to_string()
    }

    #[tokio::test]
    async fn batch_resolves_alias_from_earlier_call() {
        let llm_addr = spawn_llm(json!([
            { "tool": "createCharacter", "input": {} },
            { "tool": "createScene", "input": { "character_ids": ["c-1"] } }
        ]));
        let (mcp_addr, captured, server) = spawn_mcp(vec![
            creator_body("character_id", "abc123"),
            creator_body("scene_id", "sc-777"),
        ]);

        let http = Client::new();
        let llm = LlmClient::new(http.clone(), format!("http://{llm_addr}/generate"), 30_000);
        let mcp = McpClient::connect(http, format!("http://{mcp_addr}/mcp"), 30_000)
            .await
            .expect("connect");

        let result = run_batch(&llm, &mcp, PUBLIC_BASE, "a character, then a scene with them")
            .await
            .expect("batch result");
        server.join().expect("join mcp server");

        let entries = result
            .get("result")
            .and_then(Value::as_array)
            .expect("result array");
        assert_eq!(entries.len(), 2);

        // second tools/call must carry the resolved identifier, not the alias
        let requests = captured.lock().expect("lock captured").clone();
        assert_eq!(requests.len(), 3);
        assert!(requests[2].contains("\"character_ids\":[\"abc123\"]"));
        assert!(!requests[2].contains("c-1"));
    }

    #[tokio::test]
    async fn empty_call_list_yields_empty_result_without_dispatching() {
        let llm_addr = spawn_llm(json!([]));
        let (mcp_addr, captured, server) = spawn_mcp(Vec::new());

        let http = Client::new();
        let llm = LlmClient::new(http.clone(), format!("http://{llm_addr}/generate"), 30_000);
        let mcp = McpClient::connect(http, format!("http://{mcp_addr}/mcp"), 30_000)
            .await
            .expect("connect");

        let result = run_batch(&llm, &mcp, PUBLIC_BASE, "nothing to do")
            .await
            .expect("empty batch result");
        server.join().expect("join mcp server");

        let entries = result
            .get("result")
            .and_then(Value::as_array)
            .expect("result array");
        assert!(entries.is_empty());
        // only the handshake ever hit the tool server
        assert_eq!(captured.lock().expect("lock captured").len(), 1);
    }

    #[tokio::test]
    async fn creator_input_is_dispatched_before_its_own_alias_exists() {
        let llm_addr = spawn_llm(json!([
            { "tool": "createCharacter", "input": { "character_ids": ["c-1"] } }
        ]));
        let (mcp_addr, captured, server) =
            spawn_mcp(vec![creator_body("character_id", "abc123")]);

        let http = Client::new();
        let llm = LlmClient::new(http.clone(), format!("http://{llm_addr}/generate"), 30_000);
        let mcp = McpClient::connect(http, format!("http://{mcp_addr}/mcp"), 30_000)
            .await
            .expect("connect");

        let result = run_batch(&llm, &mcp, PUBLIC_BASE, "a self-referencing character")
            .await
            .expect("batch result");
        server.join().expect("join mcp server");

        assert_eq!(
            result
                .get("result")
                .and_then(Value::as_array)
                .map(Vec::len),
            Some(1)
        );

        // the call registers c-1 itself, so its own input must go out unresolved
        let requests = captured.lock().expect("lock captured").clone();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].contains("\"character_ids\":[\"c-1\"]"));
        assert!(!requests[1].contains("abc123"));
    }

    #[tokio::test]
    async fn malformed_mcp_response_aborts_before_later_calls() {
        let llm_addr = spawn_llm(json!([
            { "tool": "createCharacter", "input": {} },
            { "tool": "createScene", "input": {} },
            { "tool": "renderWebtoon", "input": {} }
        ]));
        let (mcp_addr, captured, server) = spawn_mcp(vec![
            creator_body("character_id", "abc123"),
            "not a json-rpc body".to_owned(),
        ]);

        let http = Client::new();
        let llm = LlmClient::new(http.clone(), format!("http://{llm_addr}/generate"), 30_000);
        let mcp = McpClient::connect(http, format!("http://{mcp_addr}/mcp"), 30_000)
            .await
            .expect("connect");

        let err = run_batch(&llm, &mcp, PUBLIC_BASE, "three calls")
            .await
            .expect_err("batch aborts");
        server.join().expect("join mcp server");

        assert_eq!(err.http_status(), 500);
        // initialize + call 1 + call 2, never call 3
        assert_eq!(captured.lock().expect("lock captured").len(), 3);
    }

    #[tokio::test]
    async fn invalid_model_output_never_reaches_the_tool_server() {
        let llm_addr = spawn_llm(json!("just some prose"));
        let (mcp_addr, captured, server) = spawn_mcp(Vec::new());

        let http = Client::new();
        let llm = LlmClient::new(http.clone(), format!("http://{llm_addr}/generate"), 30_000);
        let mcp = McpClient::connect(http, format!("http://{mcp_addr}/mcp"), 30_000)
            .await
            .expect("connect");

        let err = run_batch(&llm, &mcp, PUBLIC_BASE, "do something")
            .await
            .expect_err("invalid output");
        server.join().expect("join mcp server");

        assert_eq!(err.http_status(), 400);
        // only the handshake ever hit the tool server
        assert_eq!(captured.lock().expect("lock captured").len(), 1);
    }
}
