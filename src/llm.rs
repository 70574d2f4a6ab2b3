use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};

use crate::relay::{RelayError, RelayErrorKind};

/// Client for the opaque prompt-to-tool-calls model endpoint.
#[derive(Debug, Clone)]
pub struct LlmClient {
    http: Client,
    url: String,
    timeout: Duration,
}

impl LlmClient {
    pub fn new(http: Client, url: String, timeout_ms: u64) -> Self {
        Self {
            http,
            url,
            timeout: Duration::from_millis(timeout_ms.max(1_000)),
        }
    }

    /// Sends the prompt and returns the model's `output` value. Transport and
    /// decode failures are downstream errors; a response without `output` is
    /// an invalid-model-output error, since the relay cannot plan from it.
    pub async fn generate(&self, prompt: &str) -> Result<Value, RelayError> {
        let payload = json!({
            "messages": [
                { "role": "user", "content": prompt }
            ]
        });
        let response = self
            .http
            .post(&self.url)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                RelayError::new(
                    RelayErrorKind::LlmTransport,
                    format!("llm request failed: {err}"),
                )
            })?;
        let status = response.status();
        let body = response.text().await.map_err(|err| {
            RelayError::new(
                RelayErrorKind::LlmTransport,
                format!("failed reading llm response body: {err}"),
            )
        })?;
        if !status.is_success() {
            return Err(RelayError::new(
                RelayErrorKind::LlmTransport,
                format!(
                    "llm responded with status {}: {}",
                    status.as_u16(),
                    truncate_text(&body, 240)
                ),
            ));
        }
        let parsed: Value = serde_json::from_str(&body).map_err(|err| {
            RelayError::new(
                RelayErrorKind::LlmTransport,
                format!("llm response is not valid JSON: {err}"),
            )
        })?;
        parsed.get("output").cloned().ok_or_else(|| {
            RelayError::new(
                RelayErrorKind::InvalidModelOutput,
                "llm response has no output field",
            )
        })
    }
}

pub(crate) fn truncate_text(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_owned();
    }
    let mut end = max_len;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = value[..end].to_owned();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn spawn_one_shot_server(status_line: &'static str, body: String) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
        let addr = listener.local_addr().expect("listener addr");
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept request");
            let mut buffer = vec![0_u8; 32 * 1024];
            let _ = stream.read(&mut buffer).expect("read request");
            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream
                .write_all(response.as_bytes())
                .expect("write response");
        });
        addr
    }

    #[tokio::test]
    async fn generate_returns_output_field() {
        let body = json!({
            "output": { "tool": "createCharacter", "input": {} }
        })
        .to_string();
        let addr = spawn_one_shot_server("200 OK", body);
        let client = LlmClient::new(Client::new(), format!("http://{addr}/generate"), 30_000);
        let output = client.generate("make a character").await.expect("output");
        assert_eq!(
            output.get("tool").and_then(Value::as_str),
            Some("createCharacter")
        );
    }

    #[tokio::test]
    async fn missing_output_field_is_invalid_model_output() {
        let addr = spawn_one_shot_server("200 OK", json!({ "text": "hello" }).to_string());
        let client = LlmClient::new(Client::new(), format!("http://{addr}/generate"), 30_000);
        let err = client.generate("hi").await.expect_err("missing output");
        assert_eq!(err.kind, RelayErrorKind::InvalidModelOutput);
        assert_eq!(err.http_status(), 400);
    }

    #[tokio::test]
    async fn upstream_error_status_is_transport_failure() {
        let addr = spawn_one_shot_server(
            "503 Service Unavailable",
            json!({ "error": "overloaded" }).to_string(),
        );
        let client = LlmClient::new(Client::new(), format!("http://{addr}/generate"), 30_000);
        let err = client.generate("hi").await.expect_err("upstream error");
        assert_eq!(err.kind, RelayErrorKind::LlmTransport);
        assert_eq!(err.http_status(), 500);
        assert!(err.message.contains("503"));
    }

    #[tokio::test]
    async fn non_json_body_is_transport_failure() {
        let addr = spawn_one_shot_server("200 OK", "<html>oops</html>".to_owned());
        let client = LlmClient::new(Client::new(), format!("http://{addr}/generate"), 30_000);
        let err = client.generate("hi").await.expect_err("bad body");
        assert_eq!(err.kind, RelayErrorKind::LlmTransport);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "한글자막이라도괜찮다";
        let truncated = truncate_text(text, 7);
        assert!(truncated.ends_with("..."));
        assert!(truncated.len() <= 10);
    }
}
