//! Bidirectional byte bridge shared by both terminal hops.
//!
//! A hop is two [`Endpoint`]s. [`bridge`] pumps bytes from each endpoint's
//! source into the other's sink, races the two directions and tears the whole
//! session down as soon as either direction ends.

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tracing::debug;

pub mod adapters;

pub use adapters::{AxumWsSink, AxumWsSource, StreamSource, TungsteniteSink, TungsteniteSource, WriterSink};

/// Upper bound for flushing and closing a sink after the session ended.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Readable half of an endpoint. `Ok(None)` is end of stream.
#[async_trait]
pub trait ByteSource: Send {
    async fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>>;
}

/// Writable half of an endpoint.
#[async_trait]
pub trait ByteSink: Send {
    async fn send_chunk(&mut self, chunk: Vec<u8>) -> io::Result<()>;

    async fn close(&mut self) -> io::Result<()>;
}

pub struct Endpoint {
    pub source: Box<dyn ByteSource>,
    pub sink: Box<dyn ByteSink>,
}

impl Endpoint {
    pub fn new(source: impl ByteSource + 'static, sink: impl ByteSink + 'static) -> Self {
        Self {
            source: Box::new(source),
            sink: Box::new(sink),
        }
    }

    /// Endpoint over a websocket accepted by an axum handler.
    pub fn from_axum(socket: axum::extract::ws::WebSocket) -> Self {
        let (source, sink) = adapters::split_axum(socket);
        Self::new(source, sink)
    }

    /// Endpoint over an outbound websocket client connection.
    pub fn from_tungstenite<S>(stream: tokio_tungstenite::WebSocketStream<S>) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (source, sink) = adapters::split_tungstenite(stream);
        Self::new(source, sink)
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint").finish_non_exhaustive()
    }
}

/// Which pump finished first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `a` -> `b`
    Forward,
    /// `b` -> `a`
    Backward,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeOutcome {
    pub ended_by: Direction,
    /// Bytes read from `a` and handed to `b`.
    pub forwarded: u64,
    /// Bytes read from `b` and handed to `a`.
    pub returned: u64,
}

/// Bridges `a` and `b` until either direction reaches end of stream or fails.
///
/// The surviving pump is dropped, which cancels its pending read, and both
/// sinks are closed. I/O errors end the session and are only logged.
pub async fn bridge(a: Endpoint, b: Endpoint) -> BridgeOutcome {
    let Endpoint {
        source: mut a_source,
        sink: mut a_sink,
    } = a;
    let Endpoint {
        source: mut b_source,
        sink: mut b_sink,
    } = b;

    let mut forwarded = 0u64;
    let mut returned = 0u64;

    let ended_by = {
        let forward = pump(a_source.as_mut(), b_sink.as_mut(), &mut forwarded);
        let backward = pump(b_source.as_mut(), a_sink.as_mut(), &mut returned);

        tokio::select! {
            result = forward => {
                log_pump_end(Direction::Forward, result);
                Direction::Forward
            }
            result = backward => {
                log_pump_end(Direction::Backward, result);
                Direction::Backward
            }
        }
    };

    close_sink(b_sink.as_mut()).await;
    close_sink(a_sink.as_mut()).await;

    debug!(?ended_by, forwarded, returned, "Relay session closed");
    BridgeOutcome {
        ended_by,
        forwarded,
        returned,
    }
}

async fn pump(
    source: &mut dyn ByteSource,
    sink: &mut dyn ByteSink,
    counter: &mut u64,
) -> io::Result<()> {
    while let Some(chunk) = source.next_chunk().await? {
        if chunk.is_empty() {
            continue;
        }
        let len = chunk.len() as u64;
        sink.send_chunk(chunk).await?;
        *counter += len;
    }
    Ok(())
}

fn log_pump_end(direction: Direction, result: io::Result<()>) {
    match result {
        Ok(()) => debug!(?direction, "Relay source reached end of stream"),
        Err(e) => debug!(?direction, error = %e, "Relay pump failed"),
    }
}

async fn close_sink(sink: &mut dyn ByteSink) {
    match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "Error closing relay sink"),
        Err(_) => debug!("Timed out closing relay sink"),
    }
}
