//! HTTP transport for the provider adapters.
//!
//! Adapters build an [`HttpRequest`] and hand it to a [`Transport`]; they
//! never touch `reqwest` directly, which lets tests swap in a scripted
//! transport.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::backoff::RetryPolicy;

/// How a streaming response body is framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Server-sent events, one JSON document per `data:` line.
    Sse,
    /// Newline-delimited JSON.
    Ndjson,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
    pub framing: Framing,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("undecodable response: {0}")]
    Decode(String),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Timeouts, connection failures, 408, 429 and 5xx.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Timeout | Self::Connect(_) => true,
            Self::Status { status, .. } => matches!(status, 408 | 429 | 500..=599),
            Self::Decode(_) | Self::Other(_) => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Other(err.to_string())
        }
    }
}

/// Decoded events of a streaming response.
pub type EventStream = BoxStream<'static, Result<Value, TransportError>>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a request and decodes the JSON response body.
    async fn post(&self, request: HttpRequest) -> Result<Value, TransportError>;

    /// Sends a request and yields the events of the streamed response.
    async fn post_stream(&self, request: HttpRequest) -> Result<EventStream, TransportError>;
}

// ── reqwest implementation ───────────────────────────

pub struct HttpTransport {
    client: Client,
    retry: RetryPolicy,
}

impl HttpTransport {
    pub fn new(timeout: Duration, retry: RetryPolicy) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, retry })
    }

    async fn send_once(&self, request: &HttpRequest) -> Result<reqwest::Response, TransportError> {
        let mut builder = self.client.post(&request.url).json(&request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Sends with retries on recoverable failures. Only the initial
    /// response is retried; a stream that breaks midway is not resumed.
    async fn send(&self, request: &HttpRequest) -> Result<reqwest::Response, TransportError> {
        let mut backoff = self.retry.backoff();
        loop {
            match self.send_once(request).await {
                Err(err) if err.is_retriable() => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            "Request to {} failed ({err}), retry {} in {delay:?}",
                            request.url, backoff.attempt
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(err),
                },
                other => return other,
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, request: HttpRequest) -> Result<Value, TransportError> {
        debug!("POST {}", request.url);
        let response = self.send(&request).await?;
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| TransportError::Decode(e.to_string()))
    }

    async fn post_stream(&self, request: HttpRequest) -> Result<EventStream, TransportError> {
        debug!("POST {} (streaming)", request.url);
        let response = self.send(&request).await?;
        Ok(match request.framing {
            Framing::Sse => sse_events(response),
            Framing::Ndjson => ndjson_events(response.bytes_stream().boxed()),
        })
    }
}

fn sse_events(response: reqwest::Response) -> EventStream {
    response
        .bytes_stream()
        .eventsource()
        .filter_map(|event| async move {
            match event {
                Ok(event) if event.data.is_empty() || event.data == "[DONE]" => None,
                Ok(event) => Some(
                    serde_json::from_str(&event.data).map_err(|e| TransportError::Decode(e.to_string())),
                ),
                Err(err) => Some(Err(TransportError::Other(err.to_string()))),
            }
        })
        .boxed()
}

/// Splits a byte stream into newline-delimited JSON documents.
fn ndjson_events<B>(body: BoxStream<'static, Result<B, reqwest::Error>>) -> EventStream
where
    B: AsRef<[u8]> + Send + 'static,
{
    let state = (
        body,
        Vec::<u8>::new(),
        VecDeque::<Result<Value, TransportError>>::new(),
        false,
    );
    stream::unfold(state, |(mut body, mut buffer, mut pending, mut done)| async move {
        loop {
            if let Some(item) = pending.pop_front() {
                return Some((item, (body, buffer, pending, done)));
            }
            if done {
                return None;
            }
            match body.next().await {
                Some(Ok(chunk)) => {
                    buffer.extend_from_slice(chunk.as_ref());
                    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = buffer.drain(..=pos).collect();
                        if let Some(item) = parse_line(&line).transpose() {
                            let failed = item.is_err();
                            pending.push_back(item);
                            if failed {
                                done = true;
                                break;
                            }
                        }
                    }
                }
                Some(Err(err)) => {
                    pending.push_back(Err(err.into()));
                    done = true;
                }
                None => {
                    done = true;
                    if let Some(item) = parse_line(&buffer).transpose() {
                        pending.push_back(item);
                    }
                    buffer.clear();
                }
            }
        }
    })
    .boxed()
}

fn parse_line(line: &[u8]) -> Result<Option<Value>, TransportError> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(text)
        .map(Some)
        .map_err(|e| TransportError::Decode(e.to_string()))
}

// ── Scripted transport for tests ─────────────────────


#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&'static str]) -> BoxStream<'static, Result<&'static [u8], reqwest::Error>> {
        stream::iter(parts.iter().copied().map(|p| Ok(p.as_bytes())).collect::<Vec<_>>()).boxed()
    }

    #[test]
    fn test_retriable_classification() {
        assert!(TransportError::Timeout.is_retriable());
        assert!(TransportError::Connect("refused".to_string()).is_retriable());
        for status in [408, 429, 500, 503] {
            let err = TransportError::Status {
                status,
                body: String::new(),
            };
            assert!(err.is_retriable(), "{status}");
        }
        for status in [400, 401, 403, 404] {
            let err = TransportError::Status {
                status,
                body: String::new(),
            };
            assert!(!err.is_retriable(), "{status}");
        }
        assert!(!TransportError::Decode("eof".to_string()).is_retriable());
    }

    #[tokio::test]
    async fn test_ndjson_split_across_chunks() {
        let events: Vec<_> = ndjson_events(chunks(&[
            "{\"a\":1}\n{\"b\"",
            ":2}\n\n",
            "{\"c\":3}",
        ]))
        .collect()
        .await;
        let values: Vec<Value> = events.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            values,
            vec![serde_json::json!({"a": 1}), serde_json::json!({"b": 2}), serde_json::json!({"c": 3})]
        );
    }

    #[tokio::test]
    async fn test_ndjson_decode_error_ends_stream() {
        let events: Vec<_> = ndjson_events(chunks(&["{\"a\":1}\nnot json\n{\"b\":2}\n"]))
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        assert!(events[0].is_ok());
        assert!(matches!(events[1], Err(TransportError::Decode(_))));
    }

    #[tokio::test]
    async fn test_scripted_transport() {
        let transport = scripted::ScriptedTransport::default();
        transport.respond(serde_json::json!({"ok": true}));
        let request = HttpRequest {
            url: "http://localhost/api".to_string(),
            headers: vec![],
            body: serde_json::json!({}),
            framing: Framing::Sse,
        };
        assert_eq!(
            transport.post(request.clone()).await.unwrap(),
            serde_json::json!({"ok": true})
        );
        assert!(transport.post(request).await.is_err());
        assert_eq!(transport.requests().len(), 2);
    }
}
