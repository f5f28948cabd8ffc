//! Local byte streams backing each loop.
//!
//! A loop is an in-memory duplex pipe. The application holds one end as a
//! [`LoopConn`]; the session holds the other as a [`LoopPipe`], writes
//! inbound Data into it and pumps whatever the application writes out as
//! Data frames.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use looplink_core::{LoopAddr, LoopMeta, MAX_DATA_LEN};
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf, ReadHalf,
    WriteHalf,
};
use tokio::sync::{watch, Mutex};

/// Bytes buffered in each direction of a loop pipe.
pub const LOOP_BUFFER_SIZE: usize = 64 * 1024;

/// The application's end of a loop.
#[derive(Debug)]
pub struct LoopConn {
    meta: LoopMeta,
    stream: DuplexStream,
}

impl LoopConn {
    pub fn meta(&self) -> LoopMeta {
        self.meta
    }

    pub fn local_addr(&self) -> LoopAddr {
        self.meta.local
    }

    pub fn remote_addr(&self) -> LoopAddr {
        self.meta.remote
    }
}

impl AsyncRead for LoopConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for LoopConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// The session's end of a loop.
#[derive(Debug)]
pub struct LoopPipe {
    meta: LoopMeta,
    writer: Mutex<Option<WriteHalf<DuplexStream>>>,
    closed: watch::Sender<bool>,
}

/// Outbound half of a loop, consumed by the pump task.
#[derive(Debug)]
pub struct PipeReader {
    reader: ReadHalf<DuplexStream>,
    closed: watch::Receiver<bool>,
    buf: Vec<u8>,
}

impl LoopPipe {
    /// Create a loop's pipe and hand back all three ends.
    pub fn open(meta: LoopMeta) -> (LoopConn, LoopPipe, PipeReader) {
        let (app_end, session_end) = tokio::io::duplex(LOOP_BUFFER_SIZE);
        let (reader, writer) = tokio::io::split(session_end);
        let (closed, closed_rx) = watch::channel(false);

        let conn = LoopConn {
            meta,
            stream: app_end,
        };
        let pipe = LoopPipe {
            meta,
            writer: Mutex::new(Some(writer)),
            closed,
        };
        let reader = PipeReader {
            reader,
            closed: closed_rx,
            buf: vec![0u8; MAX_DATA_LEN],
        };
        (conn, pipe, reader)
    }

    pub fn meta(&self) -> LoopMeta {
        self.meta
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Deliver inbound bytes to the application.
    ///
    /// Waits while the application is not reading. Closing the pipe aborts
    /// a pending write with `BrokenPipe`.
    pub async fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut closed = self.closed.subscribe();
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or_else(loop_closed)?;
        tokio::select! {
            _ = closed.wait_for(|closed| *closed) => Err(loop_closed()),
            res = writer.write_all(data) => res,
        }
    }

    /// Close both directions. The application reads end of file and the
    /// pump stops. Safe to call more than once.
    pub async fn close(&self) {
        self.closed.send_replace(true);
        if let Some(mut writer) = self.writer.lock().await.take() {
            // Only fails if the application end is already gone.
            let _ = writer.shutdown().await;
        }
    }
}

fn loop_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "loop closed")
}

impl PipeReader {
    /// Next chunk the application wrote, or `None` once the application
    /// closed its end or the pipe was closed.
    pub async fn next_chunk(&mut self) -> io::Result<Option<&[u8]>> {
        if *self.closed.borrow() {
            return Ok(None);
        }
        let n = tokio::select! {
            _ = self.closed.wait_for(|closed| *closed) => return Ok(None),
            n = self.reader.read(&mut self.buf) => n?,
        };
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(&self.buf[..n]))
    }
}
