//! Streaming client for an OpenAI-compatible chat completions API.
//!
//! The upstream speaks Server-Sent Events; this module turns that into a
//! plain stream of text deltas so the relay never has to know about SSE.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::request::NormalizedQuery;

/// Ordered, finite text chunks for one request. Dropping it tears down the
/// upstream connection.
pub type CompletionStream = BoxStream<'static, Result<String, UpstreamError>>;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("request to upstream failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upstream returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("no response from upstream within {0:?}")]
    Timeout(Duration),
    #[error("upstream stream failed: {0}")]
    Stream(String),
}

/// Persona sent as the system message on every request.
pub fn system_prompt(language: &str) -> String {
    format!(
        "You are a professional trading strategy optimization expert. Analyze user's trading \
         strategies and provide improvement suggestions focusing on technical analysis, risk \
         management, and backtest results. Respond in {}.",
        language
    )
}

/// Anything that can turn a question into a stream of answer text.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn open_stream(
        &self,
        system_prompt: &str,
        query: &NormalizedQuery,
    ) -> Result<CompletionStream, UpstreamError>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    temperature: f32,
    stream: bool,
    messages: [ChatCompletionMessage<'a>; 2],
}

#[derive(Debug, Serialize)]
struct ChatCompletionMessage<'a> {
    role: &'static str,
    content: &'a str,
}

pub struct OpenAiBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    first_byte_timeout: Duration,
}

impl OpenAiBackend {
    pub fn new(config: &Config, api_key: String) -> Result<Self, UpstreamError> {
        // No overall request timeout: it would cut long answers mid-stream.
        let client = reqwest::Client::builder()
            .connect_timeout(config.upstream_timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            first_byte_timeout: config.upstream_timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    async fn open_stream(
        &self,
        system_prompt: &str,
        query: &NormalizedQuery,
    ) -> Result<CompletionStream, UpstreamError> {
        let body = ChatCompletionRequest {
            model: &self.model,
            temperature: self.temperature,
            stream: true,
            messages: [
                ChatCompletionMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatCompletionMessage {
                    role: "user",
                    content: query.as_str(),
                },
            ],
        };

        info!(
            "🚀 Opening completion stream (model: {}, timeout: {:?})",
            self.model, self.first_byte_timeout
        );

        let send = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();

        let response = tokio::time::timeout(self.first_byte_timeout, send)
            .await
            .map_err(|_| UpstreamError::Timeout(self.first_byte_timeout))??;

        let status = response.status();
        debug!("📬 Upstream response status: {}", status);

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status { status, body });
        }

        Ok(sse_text_stream(response.bytes_stream()).boxed())
    }
}

/// Longest SSE line buffered while waiting for its newline.
pub const MAX_SSE_LINE_BYTES: usize = 1024 * 1024;

enum SseLine {
    Text(String),
    Done,
    Failed(String),
    Skip,
}

struct SseState<E> {
    upstream: BoxStream<'static, Result<Bytes, E>>,
    buf: BytesMut,
    upstream_finished: bool,
    done: bool,
}

/// Decode an SSE byte stream into the `delta.content` text it carries.
///
/// Events may be split across network chunks; only complete lines are
/// parsed. The stream ends at `data: [DONE]` or when the body ends.
pub fn sse_text_stream<S, E>(
    byte_stream: S,
) -> impl Stream<Item = Result<String, UpstreamError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let state = SseState {
        upstream: byte_stream.boxed(),
        buf: BytesMut::new(),
        upstream_finished: false,
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if st.done {
                return None;
            }

            let line = if let Some(pos) = st.buf.iter().position(|&b| b == b'\n') {
                Some(st.buf.split_to(pos + 1))
            } else if st.upstream_finished {
                // trailing line without a newline, then we are finished
                st.done = true;
                if st.buf.is_empty() {
                    return None;
                }
                Some(st.buf.split())
            } else if st.buf.len() > MAX_SSE_LINE_BYTES {
                st.done = true;
                let message = format!(
                    "SSE line exceeds {} bytes without a newline",
                    MAX_SSE_LINE_BYTES
                );
                return Some((Err(UpstreamError::Stream(message)), st));
            } else {
                None
            };

            if let Some(line) = line {
                match parse_sse_line(&line) {
                    SseLine::Text(text) => return Some((Ok(text), st)),
                    SseLine::Done => {
                        debug!("Upstream signalled [DONE]");
                        st.done = true;
                        return None;
                    }
                    SseLine::Failed(message) => {
                        st.done = true;
                        return Some((Err(UpstreamError::Stream(message)), st));
                    }
                    SseLine::Skip => continue,
                }
            }

            match st.upstream.next().await {
                Some(Ok(chunk)) => st.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(UpstreamError::Stream(e.to_string())), st));
                }
                None => st.upstream_finished = true,
            }
        }
    })
}

fn parse_sse_line(raw: &[u8]) -> SseLine {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches(['\r', '\n']);

    // blank separators, comments, and non-data fields
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.strip_prefix(' ').unwrap_or(data).trim_end();

    if data == "[DONE]" {
        return SseLine::Done;
    }

    let event: Value = match serde_json::from_str(data) {
        Ok(event) => event,
        Err(e) => {
            warn!("Skipping undecodable SSE event: {}", e);
            return SseLine::Skip;
        }
    };

    if let Some(error) = event.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return SseLine::Failed(message);
    }

    match event["choices"][0]["delta"]["content"].as_str() {
        Some(content) if !content.is_empty() => SseLine::Text(content.to_string()),
        _ => SseLine::Skip,
    }
}
