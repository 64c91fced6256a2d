//! Stream relay: wire framing and exactly-once channel closure

use crate::metrics::METRICS;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Serialize;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tracing::debug;

/// The client side of the channel went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("client disconnected")]
pub struct Disconnected;

#[derive(Serialize)]
struct ContentFrame<'a> {
    content: &'a str,
}

#[derive(Serialize)]
struct ErrorFrame<'a> {
    error: &'a str,
}

fn frame<T: Serialize>(payload: &T) -> Bytes {
    // Serializing a struct of string slices cannot fail
    let json = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("data: {}\n\n", json))
}

/// `data: {"content":"..."}` followed by a blank line
pub fn encode_content(content: &str) -> Bytes {
    frame(&ContentFrame { content })
}

/// `data: {"error":"..."}` followed by a blank line
pub fn encode_error(message: &str) -> Bytes {
    frame(&ErrorFrame { error: message })
}

/// Outbound half of one turn's event stream.
///
/// Frames are delivered in the order they are sent. The channel ends when the
/// relay is closed or failed; whichever happens first wins and every later
/// close, fail or send is a no-op.
pub struct StreamRelay {
    tx: Option<mpsc::Sender<Bytes>>,
    frames: usize,
}

impl StreamRelay {
    /// Create a relay and the receiver that feeds the response body
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx: Some(tx),
                frames: 0,
            },
            rx,
        )
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }

    /// Number of content frames delivered so far
    pub fn frames_sent(&self) -> usize {
        self.frames
    }

    /// Forward one text fragment as a frame
    pub async fn send(&mut self, content: &str) -> Result<(), Disconnected> {
        self.write(encode_content(content)).await?;
        self.frames += 1;
        METRICS.frames_emitted.inc();
        Ok(())
    }

    /// End the stream normally. Returns whether this call closed it.
    pub fn close(&mut self) -> bool {
        if self.tx.take().is_some() {
            debug!("Relay closed after {} frames", self.frames);
            true
        } else {
            false
        }
    }

    /// Emit an in-band error frame and end the stream.
    ///
    /// Never waits for buffer space: a client that stopped reading or already
    /// left loses the error frame, but the stream still ends. Returns whether
    /// this call closed it.
    pub fn fail(&mut self, message: &str) -> bool {
        let Some(tx) = self.tx.take() else {
            return false;
        };
        if let Err(e) = tx.try_send(encode_error(message)) {
            debug!("Error frame dropped: {}", e);
        }
        debug!("Relay failed after {} frames: {}", self.frames, message);
        true
    }

    /// Resolves once the receiving side has been dropped.
    ///
    /// Never resolves after the relay itself has been closed.
    pub async fn disconnected(&self) {
        match &self.tx {
            Some(tx) => tx.closed().await,
            None => std::future::pending().await,
        }
    }

    async fn write(&mut self, chunk: Bytes) -> Result<(), Disconnected> {
        let tx = self.tx.as_ref().ok_or(Disconnected)?;
        if tx.send(chunk).await.is_err() {
            self.tx = None;
            return Err(Disconnected);
        }
        Ok(())
    }
}

fn sse_body_stream(
    mut rx: mpsc::Receiver<Bytes>,
) -> impl futures::Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    async_stream::stream! {
        while let Some(chunk) = rx.recv().await {
            yield Ok::<Bytes, Infallible>(chunk);
        }
    }
}

/// Wrap a relay receiver as a `text/event-stream` response
pub fn sse_response(rx: mpsc::Receiver<Bytes>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream; charset=utf-8"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-transform"),
    );
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    (headers, Body::from_stream(sse_body_stream(rx))).into_response()
}
