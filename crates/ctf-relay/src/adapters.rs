//! [`ByteSource`]/[`ByteSink`] implementations for the transports the relay
//! runs over: axum server websockets, tungstenite client websockets and
//! plain async byte pipes (exec sessions).

use crate::{ByteSink, ByteSource};
use async_trait::async_trait;
use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures::stream::{BoxStream, SplitSink, SplitStream};
use futures::{SinkExt, Stream, StreamExt};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;

// --- axum (server side) ---

pub struct AxumWsSource {
    inner: SplitStream<WebSocket>,
}

pub struct AxumWsSink {
    inner: SplitSink<WebSocket, AxumMessage>,
}

pub fn split_axum(socket: WebSocket) -> (AxumWsSource, AxumWsSink) {
    let (sink, stream) = socket.split();
    (AxumWsSource { inner: stream }, AxumWsSink { inner: sink })
}

#[async_trait]
impl ByteSource for AxumWsSource {
    async fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            match self.inner.next().await {
                None | Some(Ok(AxumMessage::Close(_))) => return Ok(None),
                Some(Ok(AxumMessage::Text(text))) => return Ok(Some(text.into_bytes())),
                Some(Ok(AxumMessage::Binary(data))) => return Ok(Some(data)),
                // Ping/pong are answered by the protocol layer.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(io::Error::other(e)),
            }
        }
    }
}

#[async_trait]
impl ByteSink for AxumWsSink {
    async fn send_chunk(&mut self, chunk: Vec<u8>) -> io::Result<()> {
        self.inner
            .send(AxumMessage::Binary(chunk))
            .await
            .map_err(io::Error::other)
    }

    async fn close(&mut self) -> io::Result<()> {
        self.inner.close().await.map_err(io::Error::other)
    }
}

// --- tungstenite (client side) ---

pub struct TungsteniteSource<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

pub struct TungsteniteSink<S> {
    inner: SplitSink<WebSocketStream<S>, WsMessage>,
}

pub fn split_tungstenite<S>(stream: WebSocketStream<S>) -> (TungsteniteSource<S>, TungsteniteSink<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (sink, stream) = stream.split();
    (TungsteniteSource { inner: stream }, TungsteniteSink { inner: sink })
}

fn closed(err: &WsError) -> bool {
    matches!(err, WsError::ConnectionClosed | WsError::AlreadyClosed)
}

#[async_trait]
impl<S> ByteSource for TungsteniteSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            match self.inner.next().await {
                None | Some(Ok(WsMessage::Close(_))) => return Ok(None),
                Some(Ok(WsMessage::Text(text))) => return Ok(Some(text.into_bytes())),
                Some(Ok(WsMessage::Binary(data))) => return Ok(Some(data)),
                Some(Ok(_)) => continue,
                Some(Err(e)) if closed(&e) => return Ok(None),
                Some(Err(e)) => return Err(io::Error::other(e)),
            }
        }
    }
}

#[async_trait]
impl<S> ByteSink for TungsteniteSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_chunk(&mut self, chunk: Vec<u8>) -> io::Result<()> {
        self.inner
            .send(WsMessage::Binary(chunk))
            .await
            .map_err(io::Error::other)
    }

    async fn close(&mut self) -> io::Result<()> {
        match self.inner.close().await {
            Err(e) if !closed(&e) => Err(io::Error::other(e)),
            _ => Ok(()),
        }
    }
}

// --- byte pipes ---

/// Source over a stream of byte chunks, e.g. the output of an exec session.
pub struct StreamSource {
    inner: BoxStream<'static, io::Result<Vec<u8>>>,
}

impl StreamSource {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Vec<u8>>> + Send + 'static,
    {
        Self {
            inner: stream.boxed(),
        }
    }
}

#[async_trait]
impl ByteSource for StreamSource {
    async fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        self.inner.next().await.transpose()
    }
}

pub struct WriterSink<W> {
    inner: W,
}

impl<W> WriterSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W> ByteSink for WriterSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send_chunk(&mut self, chunk: Vec<u8>) -> io::Result<()> {
        self.inner.write_all(&chunk).await?;
        self.inner.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}
