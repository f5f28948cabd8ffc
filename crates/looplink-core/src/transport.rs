//! Request/response transport over a byte stream.
//!
//! [`FramedTransport`] multiplexes calls in both directions over one
//! stream: outgoing calls are matched to responses by call ID, incoming
//! requests are handed to a [`FrameHandler`] one at a time in arrival
//! order. Sequential dispatch keeps Data frames of a loop ordered; running
//! it apart from the reader keeps a handler that issues its own calls from
//! blocking response delivery.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::frame::{Frame, FrameError, FrameHeader, FrameKind, FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD};

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("remote error: {0}")]
    Remote(String),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("payload too large: {0} bytes, maximum {1}")]
    TooLarge(usize, usize),

    #[error("too many calls in flight")]
    Busy,

    #[error("transport is already being served")]
    AlreadyServing,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handles requests arriving on a transport.
pub trait FrameHandler: Send + Sync + 'static {
    type Error: std::fmt::Display + Send;

    /// Handle one request. The returned bytes become the response payload;
    /// an error is sent back to the caller as its message.
    fn handle(&self, frame: Frame) -> impl Future<Output = Result<Bytes, Self::Error>> + Send;
}

/// The link between an app and its host.
pub trait Transport: Send + Sync + 'static {
    /// Send a request and wait for its response payload.
    fn call(&self, frame: Frame) -> impl Future<Output = Result<Bytes, TransportError>> + Send;

    /// Dispatch incoming requests to `handler` until the link ends.
    fn serve<H: FrameHandler>(
        &self,
        handler: Arc<H>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Shut the link down. Pending and later calls fail with
    /// [`TransportError::Closed`].
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Largest payload accepted in either direction.
    pub max_payload: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_payload: MAX_FRAME_PAYLOAD,
        }
    }
}

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;
type CallResult = Result<Bytes, TransportError>;

#[derive(Default)]
struct PendingCalls {
    next_id: u16,
    calls: HashMap<u16, oneshot::Sender<CallResult>>,
    closed: bool,
}

/// [`Transport`] over any async reader/writer pair.
pub struct FramedTransport {
    config: TransportConfig,
    reader: Mutex<Option<BoxReader>>,
    writer: tokio::sync::Mutex<Option<BoxWriter>>,
    pending: Mutex<PendingCalls>,
    shutdown: watch::Sender<bool>,
}

impl FramedTransport {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_config(reader, writer, TransportConfig::default())
    }

    pub fn with_config<R, W>(reader: R, writer: W, config: TransportConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            reader: Mutex::new(Some(Box::new(reader))),
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            pending: Mutex::new(PendingCalls::default()),
            shutdown,
        }
    }

    /// Split a bidirectional stream into a transport.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, PendingCalls> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register_call(&self, tx: oneshot::Sender<CallResult>) -> Result<u16, TransportError> {
        let mut pending = self.pending();
        if pending.closed {
            return Err(TransportError::Closed);
        }
        for _ in 0..=u16::MAX {
            let id = pending.next_id;
            pending.next_id = pending.next_id.wrapping_add(1);
            if !pending.calls.contains_key(&id) {
                pending.calls.insert(id, tx);
                return Ok(id);
            }
        }
        Err(TransportError::Busy)
    }

    fn forget_call(&self, id: u16) {
        self.pending().calls.remove(&id);
    }

    fn resolve_call(&self, header: FrameHeader, payload: Bytes) {
        let Some(tx) = self.pending().calls.remove(&header.id) else {
            warn!(id = header.id, "response for unknown call");
            return;
        };
        let result = match header.kind {
            FrameKind::ResponseOk => Ok(payload),
            _ => Err(TransportError::Remote(
                String::from_utf8_lossy(&payload).into_owned(),
            )),
        };
        // The caller may have given up waiting.
        let _ = tx.send(result);
    }

    fn fail_pending(&self) {
        let calls: Vec<_> = {
            let mut pending = self.pending();
            pending.closed = true;
            pending.calls.drain().map(|(_, tx)| tx).collect()
        };
        for tx in calls {
            let _ = tx.send(Err(TransportError::Closed));
        }
    }

    async fn write_frame(&self, kind: FrameKind, id: u16, payload: &[u8]) -> Result<(), TransportError> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        FrameHeader::new(kind, id, payload.len())?.encode(&mut header)?;

        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(TransportError::Closed)?;
        writer.write_all(&header).await?;
        writer.write_all(payload).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_frame(
        &self,
        reader: &mut BoxReader,
    ) -> Result<Option<(FrameHeader, Bytes)>, TransportError> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let header = FrameHeader::decode(&header)?;
        let len = header.len as usize;
        if len > self.config.max_payload {
            return Err(TransportError::TooLarge(len, self.config.max_payload));
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Ok(Some((header, Bytes::from(payload))))
    }
}

impl Transport for FramedTransport {
    async fn call(&self, frame: Frame) -> Result<Bytes, TransportError> {
        let payload = frame.encode_payload();
        if payload.len() > self.config.max_payload {
            return Err(TransportError::TooLarge(payload.len(), self.config.max_payload));
        }

        let (tx, rx) = oneshot::channel();
        let id = self.register_call(tx)?;
        trace!(id, kind = ?frame.kind(), len = payload.len(), "call");

        if let Err(e) = self.write_frame(frame.kind(), id, &payload).await {
            self.forget_call(id);
            return Err(e);
        }
        rx.await.unwrap_or(Err(TransportError::Closed))
    }

    async fn serve<H: FrameHandler>(&self, handler: Arc<H>) -> Result<(), TransportError> {
        let mut reader = {
            let mut slot = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
            slot.take().ok_or(TransportError::AlreadyServing)?
        };
        let mut shutdown = self.shutdown.subscribe();
        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<(FrameHeader, Bytes)>();

        let reading = async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait_for(|closed| *closed) => break Ok(()),
                    frame = self.read_frame(&mut reader) => match frame {
                        Ok(Some((header, payload))) if header.kind.is_response() => {
                            self.resolve_call(header, payload);
                        }
                        Ok(Some(request)) => {
                            if request_tx.send(request).is_err() {
                                break Ok(());
                            }
                        }
                        Ok(None) => {
                            debug!("transport reached end of stream");
                            break Ok(());
                        }
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        let dispatching = async {
            while let Some((header, payload)) = request_rx.recv().await {
                let result = match Frame::decode(header.kind, payload) {
                    Ok(frame) => handler.handle(frame).await.map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };
                let (kind, body) = match result {
                    Ok(body) => (FrameKind::ResponseOk, body),
                    Err(message) => {
                        debug!(id = header.id, kind = ?header.kind, %message, "request failed");
                        (FrameKind::ResponseErr, Bytes::from(message))
                    }
                };
                match self.write_frame(kind, header.id, &body).await {
                    Ok(()) => {}
                    Err(TransportError::Closed) => {}
                    Err(e) => warn!(id = header.id, "failed to send response: {}", e),
                }
            }
        };

        let (result, ()) = tokio::join!(reading, dispatching);
        self.fail_pending();
        result
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown.send_replace(true);
        self.fail_pending();

        let writer = self.writer.lock().await.take();
        match writer {
            Some(mut writer) => {
                writer.shutdown().await?;
                Ok(())
            }
            None => Err(TransportError::Closed),
        }
    }
}
