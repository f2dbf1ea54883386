//! Answer-generation capability consumed by the synthesis engine.
//!
//! A provider exposes two entry points: a blocking-style [`GenerationClient::complete`] that
//! resolves to the full answer, and [`GenerationClient::stream`] that yields text increments as
//! the model produces them. The Ollama adapter speaks `/api/generate` in both modes.

use std::pin::Pin;

use async_stream::try_stream;
use async_trait::async_trait;
use futures_core::Stream;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

/// Stream of text increments produced by a generation provider.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, GenerationError>> + Send>>;

/// Errors surfaced while generating an answer.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// Provider was unreachable.
    #[error("Generation provider unavailable: {0}")]
    ProviderUnavailable(String),
    /// Provider returned an error response or aborted mid-stream.
    #[error("Failed to generate answer: {0}")]
    GenerationFailed(String),
    /// Provider response could not be parsed.
    #[error("Malformed provider response: {0}")]
    InvalidResponse(String),
}

/// Interface implemented by text generation providers.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Generate the complete answer for `prompt`.
    async fn complete(&self, prompt: &str) -> Result<String, GenerationError>;

    /// Generate an answer for `prompt` as a stream of text increments.
    async fn stream(&self, prompt: &str) -> Result<TokenStream, GenerationError>;
}

/// Generation client backed by a local Ollama runtime.
pub struct OllamaGenerationClient {
    http: Client,
    base_url: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

impl OllamaGenerationClient {
    /// Build a client for `model` served at `base_url`.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let http = Client::builder()
            .user_agent("ragdomains/generate")
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.into(),
            model: model.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/generate", self.base_url.trim_end_matches('/'))
    }

    async fn send(&self, prompt: &str, stream: bool) -> Result<reqwest::Response, GenerationError> {
        let payload = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": stream,
            "options": {
                "temperature": 0.1,
            }
        });

        let response = self
            .http
            .post(self.endpoint())
            .json(&payload)
            .send()
            .await
            .map_err(|error| {
                GenerationError::ProviderUnavailable(format!(
                    "failed to reach Ollama at {}: {error}",
                    self.base_url
                ))
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(GenerationError::ProviderUnavailable(format!(
                "Ollama endpoint {} returned 404",
                self.endpoint()
            )));
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::GenerationFailed(format!(
                "Ollama returned {status}: {body}"
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl GenerationClient for OllamaGenerationClient {
    async fn complete(&self, prompt: &str) -> Result<String, GenerationError> {
        let response = self.send(prompt, false).await?;
        let body: OllamaGenerateChunk = response.json().await.map_err(|error| {
            GenerationError::InvalidResponse(format!("failed to decode Ollama response: {error}"))
        })?;

        if let Some(message) = body.error {
            return Err(GenerationError::GenerationFailed(message));
        }
        if !body.done {
            return Err(GenerationError::InvalidResponse(
                "Ollama response incomplete".into(),
            ));
        }
        Ok(body.response)
    }

    async fn stream(&self, prompt: &str) -> Result<TokenStream, GenerationError> {
        let response = self.send(prompt, true).await?;
        let mut bytes = Box::pin(response.bytes_stream());

        let tokens = try_stream! {
            let mut lines = LineBuffer::default();
            let mut finished = false;

            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|error| {
                    GenerationError::GenerationFailed(format!("stream interrupted: {error}"))
                })?;
                lines.extend(&chunk);

                while let Some(line) = lines.next_line() {
                    let Some(parsed) = parse_stream_line(&line)? else {
                        continue;
                    };
                    if !parsed.response.is_empty() {
                        yield parsed.response;
                    }
                    if parsed.done {
                        finished = true;
                    }
                }
            }

            if let Some(parsed) = parse_stream_line(&lines.finish())? {
                if !parsed.response.is_empty() {
                    yield parsed.response;
                }
                finished |= parsed.done;
            }

            if !finished {
                Err(GenerationError::GenerationFailed(
                    "stream ended before the model reported completion".into(),
                ))?;
            }
        };

        Ok(Box::pin(tokens))
    }
}

/// Raw NDJSON bytes split into whole lines. Network chunks may end inside a UTF-8 sequence, so
/// bytes are only decoded once their line is complete.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Option<Vec<u8>> {
        let end = self.pending.iter().position(|byte| *byte == b'\n')?;
        Some(self.pending.drain(..=end).collect())
    }

    /// Trailing bytes not terminated by a newline.
    fn finish(self) -> Vec<u8> {
        self.pending
    }
}

fn parse_stream_line(line: &[u8]) -> Result<Option<OllamaGenerateChunk>, GenerationError> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Ok(None);
    }
    let chunk: OllamaGenerateChunk = serde_json::from_slice(line).map_err(|error| {
        GenerationError::InvalidResponse(format!("failed to decode stream line: {error}"))
    })?;
    if let Some(message) = chunk.error {
        return Err(GenerationError::GenerationFailed(message));
    }
    Ok(Some(chunk))
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};

    #[tokio::test]
    async fn complete_returns_full_answer() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/generate")
                    .json_body_partial(r#"{"stream": false}"#);
                then.status(200).json_body(json!({
                    "response": "The answer.",
                    "done": true
                }));
            })
            .await;

        let client = OllamaGenerationClient::new(server.base_url(), "llama3.1");
        let answer = client.complete("question").await.expect("answer");

        mock.assert();
        assert_eq!(answer, "The answer.");
    }

    #[tokio::test]
    async fn stream_yields_increments_from_ndjson() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/generate")
                    .json_body_partial(r#"{"stream": true}"#);
                then.status(200).body(
                    "{\"response\":\"Hel\",\"done\":false}\n{\"response\":\"lo\",\"done\":false}\n{\"response\":\"\",\"done\":true}\n",
                );
            })
            .await;

        let client = OllamaGenerationClient::new(server.base_url(), "llama3.1");
        let stream = client.stream("question").await.expect("stream");
        let tokens: Vec<String> = stream
            .map(|token| token.expect("token"))
            .collect()
            .await;

        assert_eq!(tokens, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[tokio::test]
    async fn stream_reports_truncated_output() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate");
                then.status(200)
                    .body("{\"response\":\"partial\",\"done\":false}\n");
            })
            .await;

        let client = OllamaGenerationClient::new(server.base_url(), "llama3.1");
        let results: Vec<Result<String, GenerationError>> =
            client.stream("question").await.expect("stream").collect().await;

        assert_eq!(results.len(), 2);
        assert!(matches!(results[0].as_deref(), Ok("partial")));
        assert!(matches!(results[1], Err(GenerationError::GenerationFailed(_))));
    }

    #[tokio::test]
    async fn complete_surfaces_error_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate");
                then.status(500).body("boom");
            })
            .await;

        let client = OllamaGenerationClient::new(server.base_url(), "llama3.1");
        let error = client.complete("question").await.expect_err("error");
        assert!(
            matches!(error, GenerationError::GenerationFailed(message) if message.contains("500"))
        );
    }

    #[test]
    fn line_buffer_decodes_characters_split_across_chunks() {
        let line = "{\"response\":\"café\",\"done\":true}\n".as_bytes();
        let split = line.iter().position(|byte| *byte == 0xC3).expect("lead byte") + 1;

        let mut lines = LineBuffer::default();
        lines.extend(&line[..split]);
        assert!(lines.next_line().is_none());
        lines.extend(&line[split..]);

        let whole = lines.next_line().expect("complete line");
        let parsed = parse_stream_line(&whole).expect("valid").expect("non-empty");
        assert_eq!(parsed.response, "café");
        assert!(lines.finish().is_empty());
    }

    /// Serve one chunked NDJSON response, flushing each part as its own HTTP chunk.
    async fn serve_chunked(parts: Vec<Vec<u8>>) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            let body_start = loop {
                let read = socket.read(&mut buf).await.expect("read");
                request.extend_from_slice(&buf[..read]);
                if let Some(end) = request.windows(4).position(|window| window == b"\r\n\r\n") {
                    break end + 4;
                }
            };
            let headers = String::from_utf8_lossy(&request[..body_start]).to_ascii_lowercase();
            let length: usize = headers
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse().ok())
                .unwrap_or(0);
            while request.len() < body_start + length {
                let read = socket.read(&mut buf).await.expect("read body");
                request.extend_from_slice(&buf[..read]);
            }

            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: application/x-ndjson\r\ntransfer-encoding: chunked\r\nconnection: close\r\n\r\n",
                )
                .await
                .expect("head");
            for part in parts {
                socket
                    .write_all(format!("{:x}\r\n", part.len()).as_bytes())
                    .await
                    .expect("size");
                socket.write_all(&part).await.expect("part");
                socket.write_all(b"\r\n").await.expect("crlf");
                socket.flush().await.expect("flush");
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
            socket.write_all(b"0\r\n\r\n").await.expect("end");
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn stream_keeps_multibyte_text_split_by_the_network() {
        let body = "{\"response\":\"café\",\"done\":false}\n{\"response\":\"\",\"done\":true}\n"
            .as_bytes()
            .to_vec();
        let split = body.iter().position(|byte| *byte == 0xC3).expect("lead byte") + 1;
        let base_url = serve_chunked(vec![body[..split].to_vec(), body[split..].to_vec()]).await;

        let client = OllamaGenerationClient::new(base_url, "llama3.1");
        let tokens: Vec<String> = client
            .stream("question")
            .await
            .expect("stream")
            .map(|token| token.expect("token"))
            .collect()
            .await;

        assert_eq!(tokens.concat(), "café");
    }
}
