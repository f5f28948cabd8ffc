//! Application session: loops multiplexed over one host transport.
//!
//! The session answers the host's requests (ConfirmLoop, CloseLoop, Data)
//! and exposes [`AppSession::dial`] and [`AppSession::accept`] to the
//! application. Every open loop lives in the [`LoopRegistry`] until either
//! side closes it or the session shuts down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use bytes::Bytes;
use looplink_core::{
    DataFrame, Frame, FrameHandler, FrameKind, LoopAddr, LoopMeta, Transport, TransportError,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bootstrap::Meta;
use crate::config::AppConfig;
use crate::error::AppError;
use crate::pipe::{LoopConn, LoopPipe, PipeReader};
use crate::registry::LoopRegistry;

/// Loops announced by the host but not yet accepted. Further
/// announcements are dropped while the queue is full.
pub const ACCEPT_QUEUE_CAPACITY: usize = 1;

/// A running application session.
pub struct AppSession<T: Transport> {
    inner: Arc<SessionInner<T>>,
}

impl<T: Transport> Clone for AppSession<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct SessionInner<T> {
    config: AppConfig,
    transport: Arc<T>,
    loops: LoopRegistry<Arc<LoopPipe>>,
    accept_tx: Mutex<Option<mpsc::Sender<LoopMeta>>>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<LoopMeta>>,
    closed: AtomicBool,
}

impl<T: Transport> AppSession<T> {
    /// Start a session over `transport` and begin serving host requests in
    /// a background task.
    pub fn setup(config: AppConfig, transport: T) -> Self {
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE_CAPACITY);
        let inner = Arc::new(SessionInner {
            config,
            transport: Arc::new(transport),
            loops: LoopRegistry::new(),
            accept_tx: Mutex::new(Some(accept_tx)),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            closed: AtomicBool::new(false),
        });

        let transport = inner.transport.clone();
        let handler = inner.clone();
        tokio::spawn(async move {
            match transport.serve(handler.clone()).await {
                Ok(()) => debug!("host transport finished"),
                Err(e) => warn!("host transport failed: {}", e),
            }
            // Without the host there is nothing left to serve.
            handler.close().await;
        });

        info!(
            app = %inner.config.app_name,
            version = %inner.config.app_version,
            host = %inner.config.host_pk,
            "app session started"
        );
        Self { inner }
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    /// The application's self-description.
    pub fn info(&self) -> Meta {
        Meta::from_config(&self.inner.config)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of open loops.
    pub fn loop_count(&self) -> usize {
        self.inner.loops.len()
    }

    /// Open a loop to `remote` through the host.
    ///
    /// A response naming a different remote address means the host is
    /// broken; the session is shut down and
    /// [`AppError::ProtocolViolation`] is returned.
    pub async fn dial(&self, remote: LoopAddr) -> Result<LoopConn, AppError> {
        self.inner.ensure_open()?;

        let response = self.inner.transport.call(Frame::CreateLoop(remote)).await?;
        let meta = LoopMeta::decode(&response)?;
        if meta.remote != remote {
            error!(requested = %remote, assigned = %meta.remote, "host assigned a loop to the wrong remote");
            self.close().await;
            return Err(AppError::ProtocolViolation(format!(
                "dialed {remote}, host returned loop {meta}"
            )));
        }

        let conn = self.inner.open_loop(meta)?;
        debug!(%meta, "loop dialed");
        Ok(conn)
    }

    /// Wait for the host to announce an incoming loop.
    pub async fn accept(&self) -> Result<LoopConn, AppError> {
        self.inner.ensure_open()?;
        let meta = {
            let mut rx = self.inner.accept_rx.lock().await;
            rx.recv().await.ok_or(AppError::Closed)?
        };
        self.inner.ensure_open()?;

        let conn = self.inner.open_loop(meta)?;
        debug!(%meta, "loop accepted");
        Ok(conn)
    }

    /// Close one loop and tell the host. Closing an unknown or already
    /// closed loop does nothing.
    pub async fn close_loop(&self, meta: LoopMeta) {
        self.inner.close_loop(meta).await
    }

    /// Close every loop, the transport and the accept queue. Later calls
    /// do nothing.
    pub async fn close(&self) {
        self.inner.close().await
    }

    /// Listener view of this session.
    pub fn listener(&self) -> AppListener<T> {
        AppListener {
            session: self.clone(),
        }
    }
}

impl<T: Transport> SessionInner<T> {
    fn ensure_open(&self) -> Result<(), AppError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::Closed);
        }
        Ok(())
    }

    fn open_loop(self: &Arc<Self>, meta: LoopMeta) -> Result<LoopConn, AppError> {
        let (conn, pipe, reader) = LoopPipe::open(meta);
        let pipe = Arc::new(pipe);
        self.loops.register(meta, pipe.clone())?;
        tokio::spawn(pump(Arc::downgrade(self), pipe, reader));
        Ok(conn)
    }

    async fn send_data(&self, meta: LoopMeta, data: &[u8]) -> Result<(), AppError> {
        let frame = Frame::Data(DataFrame::new(meta, Bytes::copy_from_slice(data)));
        self.transport.call(frame).await?;
        Ok(())
    }

    async fn close_loop(&self, meta: LoopMeta) {
        if let Some(pipe) = self.loops.remove(&meta) {
            self.finish_loop(&pipe).await;
        }
    }

    /// Close `pipe` if it is still the registered loop for its endpoints.
    /// A newer loop reusing the same endpoints is left alone.
    async fn close_pipe(&self, pipe: &Arc<LoopPipe>) {
        let meta = pipe.meta();
        if self
            .loops
            .remove_if(&meta, |current| Arc::ptr_eq(current, pipe))
            .is_some()
        {
            self.finish_loop(pipe).await;
        }
    }

    async fn finish_loop(&self, pipe: &LoopPipe) {
        let meta = pipe.meta();
        pipe.close().await;
        self.notify_closed(meta).await;
        debug!(%meta, "loop closed");
    }

    /// Best-effort CloseLoop to the host.
    async fn notify_closed(&self, meta: LoopMeta) {
        match self.transport.call(Frame::CloseLoop(meta)).await {
            Ok(_) => {}
            Err(TransportError::Closed) => {
                debug!(%meta, "transport closed before close notification")
            }
            Err(e) => warn!(%meta, "failed to notify host of loop close: {}", e),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Dropping the only sender wakes any pending accept.
        self.accept_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let loops = self.loops.drain();
        let count = loops.len();
        for (meta, pipe) in loops {
            pipe.close().await;
            self.notify_closed(meta).await;
        }

        match self.transport.close().await {
            Ok(()) | Err(TransportError::Closed) => {}
            Err(e) => warn!("failed to close host transport: {}", e),
        }
        info!(loops = count, "app session closed");
    }

    fn confirm_loop(&self, meta: LoopMeta) {
        let accept_tx = self.accept_tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = accept_tx.as_ref() else {
            debug!(%meta, "session closed, dropping loop confirmation");
            return;
        };
        match tx.try_send(meta) {
            Ok(()) => debug!(%meta, "loop confirmed"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(%meta, "accept queue full, dropping loop confirmation")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(%meta, "accept queue closed, dropping loop confirmation")
            }
        }
    }

    async fn deliver(&self, frame: DataFrame) -> Result<(), AppError> {
        let pipe = self
            .loops
            .lookup(&frame.meta)
            .ok_or(AppError::UnknownLoop(frame.meta))?;
        pipe.write(&frame.data).await?;
        Ok(())
    }
}

impl<T: Transport> FrameHandler for SessionInner<T> {
    type Error = AppError;

    async fn handle(&self, frame: Frame) -> Result<Bytes, AppError> {
        match frame {
            Frame::ConfirmLoop(meta) => self.confirm_loop(meta),
            Frame::CloseLoop(meta) => {
                // Closed by the remote side: no CloseLoop goes back.
                if let Some(pipe) = self.loops.remove(&meta) {
                    pipe.close().await;
                    debug!(%meta, "loop closed by remote");
                }
            }
            Frame::Data(data) => self.deliver(data).await?,
            Frame::CreateLoop(_) => return Err(AppError::UnexpectedFrame(FrameKind::CreateLoop)),
        }
        Ok(Bytes::new())
    }
}

/// Forward what the application writes into a loop as Data frames until
/// either end closes it.
async fn pump<T: Transport>(
    session: Weak<SessionInner<T>>,
    pipe: Arc<LoopPipe>,
    mut reader: PipeReader,
) {
    let meta = pipe.meta();
    loop {
        let chunk = match reader.next_chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                debug!(%meta, "loop read failed: {}", e);
                break;
            }
        };
        let Some(session) = session.upgrade() else {
            return;
        };
        if let Err(e) = session.send_data(meta, chunk).await {
            debug!(%meta, "failed to send loop data: {}", e);
            break;
        }
    }

    if let Some(session) = session.upgrade() {
        session.close_pipe(&pipe).await;
    }
}

/// Accepts loops on behalf of a session.
pub struct AppListener<T: Transport> {
    session: AppSession<T>,
}

impl<T: Transport> AppListener<T> {
    pub async fn accept(&self) -> Result<LoopConn, AppError> {
        self.session.accept().await
    }

    /// Closes the whole session.
    pub async fn close(&self) {
        self.session.close().await
    }

    /// The host's address; loops are accepted on behalf of the host key.
    pub fn addr(&self) -> LoopAddr {
        LoopAddr::new(self.session.config().host_pk, 0)
    }
}
