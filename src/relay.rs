use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{stream, StreamExt};
use std::io;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::upstream::{CompletionStream, UpstreamError};

/// Chunks buffered between the forwarding task and the response body.
const CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("client disconnected after {chunks} chunks")]
    ClientDisconnected { chunks: usize },
    #[error("no chunk from upstream for {0:?}")]
    Idle(Duration),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RelayStats {
    pub chunks: usize,
    pub bytes: usize,
    pub elapsed: Duration,
}

/// Wait for the first text chunk before any status is committed.
///
/// The first-byte bound covers content, not just response headers. The chunk
/// is put back in front of the returned stream.
pub async fn await_first_chunk(
    mut upstream: CompletionStream,
    first_byte_timeout: Duration,
) -> Result<CompletionStream, UpstreamError> {
    match tokio::time::timeout(first_byte_timeout, upstream.next()).await {
        Ok(Some(Ok(first))) => Ok(stream::once(async move { Ok(first) }).chain(upstream).boxed()),
        Ok(Some(Err(e))) => Err(e),
        Ok(None) => Ok(stream::empty().boxed()),
        Err(_) => Err(UpstreamError::Timeout(first_byte_timeout)),
    }
}

/// Stream completion text to the caller as it arrives.
///
/// The body is fed from a channel by a spawned task, so the first chunk goes
/// out as soon as upstream produces it. Failures after the 200 has been sent
/// end the body with an error, which the caller sees as an abrupt close.
pub fn relay_completion(stream: CompletionStream, idle_timeout: Duration) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        match forward_chunks(stream, tx, idle_timeout).await {
            Ok(stats) => {
                info!(
                    "✅ Stream completed: {} chunks, {} bytes in {:?}",
                    stats.chunks, stats.bytes, stats.elapsed
                );
            }
            Err(RelayError::ClientDisconnected { chunks }) => {
                warn!(
                    "⚠️  Client disconnected after {} chunks, upstream stream dropped",
                    chunks
                );
            }
            Err(e) => error!("❌ Relay ended early: {}", e),
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::X_CONTENT_TYPE_OPTIONS, "nosniff")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Pump chunks from `stream` into `tx` in arrival order until upstream ends.
///
/// Returns as soon as the receiving side goes away; `stream` is dropped on
/// return, which closes the upstream connection.
pub async fn forward_chunks(
    mut stream: CompletionStream,
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
    idle_timeout: Duration,
) -> Result<RelayStats, RelayError> {
    let start = Instant::now();
    let mut stats = RelayStats::default();

    loop {
        let next = tokio::select! {
            biased;
            _ = tx.closed() => {
                return Err(RelayError::ClientDisconnected { chunks: stats.chunks });
            }
            next = tokio::time::timeout(idle_timeout, stream.next()) => next,
        };

        let text = match next {
            Ok(Some(Ok(text))) => text,
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                let _ = tx.send(Err(io::Error::other(e.to_string()))).await;
                return Err(e.into());
            }
            Err(_) => {
                let _ = tx
                    .send(Err(io::Error::new(io::ErrorKind::TimedOut, "upstream went idle")))
                    .await;
                return Err(RelayError::Idle(idle_timeout));
            }
        };

        stats.chunks += 1;
        stats.bytes += text.len();
        if stats.chunks == 1 {
            debug!("📦 First chunk after {:?}", start.elapsed());
        }

        if tx.send(Ok(Bytes::from(text))).await.is_err() {
            return Err(RelayError::ClientDisconnected { chunks: stats.chunks - 1 });
        }
    }

    stats.elapsed = start.elapsed();
    Ok(stats)
}
