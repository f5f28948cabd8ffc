//! Session behaviour against a scripted host over an in-memory link.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;

use looplink_app::{AppConfig, AppError, AppSession};
use looplink_core::{
    DataFrame, Frame, FrameHandler, FramedTransport, LoopAddr, LoopMeta, Transport,
    TransportError,
};
use looplink_crypto::{PubKey, StaticKeypair};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(100);

/// Host stand-in: assigns loops and reports every request it receives.
struct FakeHost {
    host_pk: PubKey,
    next_port: AtomicU16,
    misroute: bool,
    /// When set, each Data request waits for a permit before it is answered.
    data_gate: Option<Arc<Semaphore>>,
    events: mpsc::UnboundedSender<Frame>,
}

impl FrameHandler for FakeHost {
    type Error = String;

    async fn handle(&self, frame: Frame) -> Result<Bytes, String> {
        let _ = self.events.send(frame.clone());
        match frame {
            Frame::CreateLoop(remote) => {
                let local = LoopAddr::new(self.host_pk, self.next_port.fetch_add(1, Ordering::SeqCst));
                let remote = if self.misroute {
                    LoopAddr::new(remote.pk, remote.port.wrapping_add(1))
                } else {
                    remote
                };
                Ok(LoopMeta::new(local, remote).to_bytes())
            }
            Frame::Data(_) => {
                if let Some(gate) = &self.data_gate {
                    gate.acquire().await.map_err(|e| e.to_string())?.forget();
                }
                Ok(Bytes::new())
            }
            _ => Ok(Bytes::new()),
        }
    }
}

struct Harness {
    session: AppSession<FramedTransport>,
    host: Arc<FramedTransport>,
    host_pk: PubKey,
    events: mpsc::UnboundedReceiver<Frame>,
}

impl Harness {
    fn new() -> Self {
        Self::build(false, None)
    }

    fn with_routing(misroute: bool) -> Self {
        Self::build(misroute, None)
    }

    fn with_data_gate(gate: Arc<Semaphore>) -> Self {
        Self::build(false, Some(gate))
    }

    fn build(misroute: bool, data_gate: Option<Arc<Semaphore>>) -> Self {
        let (app_io, host_io) = duplex(256 * 1024);
        let host_pk = StaticKeypair::generate().public_key();
        let (events_tx, events) = mpsc::unbounded_channel();

        let host = Arc::new(FramedTransport::from_stream(host_io));
        let handler = Arc::new(FakeHost {
            host_pk,
            next_port: AtomicU16::new(1000),
            misroute,
            data_gate,
            events: events_tx,
        });
        let served = host.clone();
        tokio::spawn(async move { served.serve(handler).await });

        let config = AppConfig::new("test-app", "0.1.0", host_pk);
        let session = AppSession::setup(config, FramedTransport::from_stream(app_io));

        Self {
            session,
            host,
            host_pk,
            events,
        }
    }

    async fn next_event(&mut self) -> Frame {
        timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for host event")
            .expect("host event channel closed")
    }

    async fn assert_quiet(&mut self) {
        if let Ok(Some(frame)) = timeout(QUIET, self.events.recv()).await {
            panic!("unexpected frame at host: {:?}", frame);
        }
    }
}

fn peer(port: u16) -> LoopAddr {
    LoopAddr::new(StaticKeypair::generate().public_key(), port)
}

fn remote_meta(h: &Harness, port: u16) -> LoopMeta {
    LoopMeta::new(LoopAddr::new(h.host_pk, port), peer(7))
}

#[tokio::test]
async fn test_dial_and_exchange() {
    let mut h = Harness::new();
    let remote = peer(80);

    let mut conn = h.session.dial(remote).await.unwrap();
    assert_eq!(conn.remote_addr(), remote);
    assert_eq!(conn.local_addr().pk, h.host_pk);
    assert_eq!(h.session.loop_count(), 1);
    assert!(matches!(h.next_event().await, Frame::CreateLoop(addr) if addr == remote));

    conn.write_all(b"hello").await.unwrap();
    match h.next_event().await {
        Frame::Data(df) => {
            assert_eq!(df.meta, conn.meta());
            assert_eq!(df.data.as_ref(), b"hello");
        }
        other => panic!("expected data, got {:?}", other),
    }

    h.host
        .call(Frame::Data(DataFrame::new(conn.meta(), &b"world"[..])))
        .await
        .unwrap();
    let mut buf = [0u8; 5];
    timeout(WAIT, conn.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"world");
}

#[tokio::test]
async fn test_accept_confirmed_loop() {
    let h = Harness::new();
    let meta = remote_meta(&h, 2000);

    let session = h.session.clone();
    let accepting = tokio::spawn(async move { session.accept().await });

    h.host.call(Frame::ConfirmLoop(meta)).await.unwrap();
    let mut conn = timeout(WAIT, accepting).await.unwrap().unwrap().unwrap();
    assert_eq!(conn.meta(), meta);

    h.host
        .call(Frame::Data(DataFrame::new(meta, &b"inbound"[..])))
        .await
        .unwrap();
    let mut buf = [0u8; 7];
    timeout(WAIT, conn.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"inbound");
}

#[tokio::test]
async fn test_confirm_dropped_when_queue_full() {
    let h = Harness::new();
    let first = remote_meta(&h, 1);
    let second = remote_meta(&h, 2);

    // Nobody is accepting: the second confirmation finds the queue full.
    h.host.call(Frame::ConfirmLoop(first)).await.unwrap();
    h.host.call(Frame::ConfirmLoop(second)).await.unwrap();

    let conn = timeout(WAIT, h.session.accept()).await.unwrap().unwrap();
    assert_eq!(conn.meta(), first);
    assert!(timeout(QUIET, h.session.accept()).await.is_err());
    assert_eq!(h.session.loop_count(), 1);
}

#[tokio::test]
async fn test_data_for_unknown_loop() {
    let h = Harness::new();
    let meta = remote_meta(&h, 3);

    let result = h
        .host
        .call(Frame::Data(DataFrame::new(meta, &b"lost"[..])))
        .await;
    match result {
        Err(TransportError::Remote(message)) => assert!(message.contains("unknown loop")),
        other => panic!("expected remote error, got {:?}", other),
    }
    assert_eq!(h.session.loop_count(), 0);

    // The session keeps serving after a failed request.
    h.host.call(Frame::ConfirmLoop(meta)).await.unwrap();
    assert!(timeout(WAIT, h.session.accept()).await.unwrap().is_ok());
}

#[tokio::test]
async fn test_create_loop_towards_app_rejected() {
    let h = Harness::new();
    let result = h.host.call(Frame::CreateLoop(peer(1))).await;
    assert!(matches!(result, Err(TransportError::Remote(_))));
}

#[tokio::test]
async fn test_remote_close_is_not_echoed() {
    let mut h = Harness::new();
    let mut conn = h.session.dial(peer(81)).await.unwrap();
    h.next_event().await;

    h.host.call(Frame::CloseLoop(conn.meta())).await.unwrap();
    let mut rest = Vec::new();
    timeout(WAIT, conn.read_to_end(&mut rest)).await.unwrap().unwrap();
    assert!(rest.is_empty());
    assert_eq!(h.session.loop_count(), 0);

    // A repeated remote close is a no-op as well.
    h.host.call(Frame::CloseLoop(conn.meta())).await.unwrap();
    h.assert_quiet().await;
}

#[tokio::test]
async fn test_local_close_notifies_once() {
    let mut h = Harness::new();
    let conn = h.session.dial(peer(82)).await.unwrap();
    let meta = conn.meta();
    h.next_event().await;

    h.session.close_loop(meta).await;
    h.session.close_loop(meta).await;
    assert!(matches!(h.next_event().await, Frame::CloseLoop(m) if m == meta));

    // The host closing it too changes nothing.
    h.host.call(Frame::CloseLoop(meta)).await.unwrap();
    h.assert_quiet().await;
    assert_eq!(h.session.loop_count(), 0);
}

#[tokio::test]
async fn test_dropping_conn_closes_loop() {
    let mut h = Harness::new();
    let conn = h.session.dial(peer(83)).await.unwrap();
    let meta = conn.meta();
    h.next_event().await;

    drop(conn);
    assert!(matches!(h.next_event().await, Frame::CloseLoop(m) if m == meta));
    assert_eq!(h.session.loop_count(), 0);
    h.assert_quiet().await;
}

#[tokio::test]
async fn test_dial_mismatch_is_fatal() {
    let h = Harness::with_routing(true);

    let result = h.session.dial(peer(84)).await;
    assert!(matches!(result, Err(AppError::ProtocolViolation(_))));
    assert!(h.session.is_closed());
    assert_eq!(h.session.loop_count(), 0);

    assert!(matches!(h.session.dial(peer(85)).await, Err(AppError::Closed)));
    assert!(matches!(h.session.accept().await, Err(AppError::Closed)));
}

#[tokio::test]
async fn test_close_session() {
    let mut h = Harness::new();
    let mut first = h.session.dial(peer(90)).await.unwrap();
    let second = h.session.dial(peer(91)).await.unwrap();
    h.next_event().await;
    h.next_event().await;

    let listener = h.session.listener();
    assert_eq!(listener.addr(), LoopAddr::new(h.host_pk, 0));
    let accepting = tokio::spawn(async move { listener.accept().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.session.close().await;
    assert!(h.session.is_closed());
    assert!(matches!(
        timeout(WAIT, accepting).await.unwrap().unwrap(),
        Err(AppError::Closed)
    ));

    let mut closed = vec![h.next_event().await, h.next_event().await];
    closed.sort_by_key(|frame| match frame {
        Frame::CloseLoop(meta) => meta.remote.port,
        _ => 0,
    });
    assert!(matches!(&closed[0], Frame::CloseLoop(m) if *m == first.meta()));
    assert!(matches!(&closed[1], Frame::CloseLoop(m) if *m == second.meta()));

    let mut rest = Vec::new();
    timeout(WAIT, first.read_to_end(&mut rest)).await.unwrap().unwrap();
    assert_eq!(h.session.loop_count(), 0);

    h.session.close().await;
    h.assert_quiet().await;
}

#[tokio::test]
async fn test_close_with_unread_loop() {
    let h = Harness::new();
    let meta = remote_meta(&h, 2100);

    h.host.call(Frame::ConfirmLoop(meta)).await.unwrap();
    let conn = timeout(WAIT, h.session.accept()).await.unwrap().unwrap();

    // The application never reads, so delivery stalls once the loop
    // buffer is full.
    let host = h.host.clone();
    tokio::spawn(async move {
        for _ in 0..4 {
            let frame = Frame::Data(DataFrame::new(meta, vec![0u8; 32 * 1024]));
            if host.call(frame).await.is_err() {
                break;
            }
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    timeout(WAIT, h.session.close())
        .await
        .expect("session close stalled on an unread loop");
    assert!(h.session.is_closed());
    assert_eq!(h.session.loop_count(), 0);
    drop(conn);
}

#[tokio::test]
async fn test_stale_pump_spares_reopened_loop() {
    let gate = Arc::new(Semaphore::new(0));
    let mut h = Harness::with_data_gate(gate.clone());
    let meta = remote_meta(&h, 2200);

    h.host.call(Frame::ConfirmLoop(meta)).await.unwrap();
    let mut first = timeout(WAIT, h.session.accept()).await.unwrap().unwrap();

    // Hold the first loop's pump inside a Data call.
    first.write_all(b"x").await.unwrap();
    assert!(matches!(h.next_event().await, Frame::Data(df) if df.meta == meta));

    // Remote close, then the host hands out the same endpoints again.
    h.host.call(Frame::CloseLoop(meta)).await.unwrap();
    h.host.call(Frame::ConfirmLoop(meta)).await.unwrap();
    let mut second = timeout(WAIT, h.session.accept()).await.unwrap().unwrap();
    assert_eq!(second.meta(), meta);

    // The first pump finishes now and must leave the new loop alone.
    gate.add_permits(1);
    let mut rest = Vec::new();
    timeout(WAIT, first.read_to_end(&mut rest)).await.unwrap().unwrap();
    h.assert_quiet().await;
    assert_eq!(h.session.loop_count(), 1);

    h.host
        .call(Frame::Data(DataFrame::new(meta, &b"again"[..])))
        .await
        .unwrap();
    let mut buf = [0u8; 5];
    timeout(WAIT, second.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"again");
}

#[tokio::test]
async fn test_info_reports_meta() {
    let h = Harness::new();
    let meta = h.session.info();
    assert_eq!(meta.app_name, "test-app");
    assert_eq!(meta.app_version, "0.1.0");
    assert_eq!(meta.protocol_version, looplink_core::PROTOCOL_VERSION);
    assert_eq!(meta.host, h.host_pk);
}

#[tokio::test]
async fn test_host_disconnect_closes_session() {
    let h = Harness::new();
    let session = h.session.clone();
    let accepting = tokio::spawn(async move { session.accept().await });

    h.host.close().await.unwrap();
    assert!(matches!(
        timeout(WAIT, accepting).await.unwrap().unwrap(),
        Err(AppError::Closed)
    ));
    assert!(h.session.is_closed());
}
