//! Per-connection worker.
//!
//! The reader half runs on the caller's task: frames are decoded by
//! [`FrameCodec`], fed to the [`FrameAssembler`] and complete messages are
//! delivered to the session. The writer half runs on its own task and drains
//! the session's outbound queue, which also carries pongs and close frames
//! produced by the reader. A client that stops reading until the session's
//! outbound limit is hit gets a 1008 close in place of the queued text.
//! Whatever ends the connection, the session's disconnect callbacks run
//! exactly once, from [`run`].

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, warn};

use crate::assembler::{Action, FrameAssembler};
use crate::errors::ProtocolError;
use crate::frame::{Frame, FrameCodec, OpCode, close_code};
use crate::session::{ConnectionSession, Outbound, OutboundReceiver};

/// How long the writer may take to flush a final close frame.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Why the read loop stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer sent a close frame.
    PeerClose,
    /// The transport reached EOF or failed.
    TransportClosed,
    /// The writer stopped: a handler called `close()` or a write failed.
    WriterStopped,
    /// A protocol violation; carries the close code sent.
    Protocol(u16),
    /// The gateway is shutting down.
    Shutdown,
    /// The client fell behind by more than the outbound limit.
    Overloaded,
}

/// Drive one upgraded connection until it closes.
pub async fn run<S>(
    io: S,
    session: Arc<ConnectionSession>,
    outbound: OutboundReceiver,
    max_message_size: usize,
    shutdown: CancellationToken,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(io);
    let mut frames = FramedRead::new(read_half, FrameCodec::server(max_message_size));
    let sink = FramedWrite::new(write_half, FrameCodec::server(max_message_size));

    let writer_done = CancellationToken::new();
    let overflow = session.overflow();
    let mut writer = tokio::spawn(
        write_loop(sink, outbound, Arc::clone(&session), writer_done.clone())
            .instrument(tracing::Span::current()),
    );

    let mut assembler = FrameAssembler::new(max_message_size);
    let reason = loop {
        let next = tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                queue_control(&session, Frame::close(close_code::GOING_AWAY, "server shutting down"));
                break CloseReason::Shutdown;
            }
            () = overflow.cancelled() => break CloseReason::Overloaded,
            () = writer_done.cancelled() => break CloseReason::WriterStopped,
            next = frames.next() => next,
        };

        let frame = match next {
            None => break CloseReason::TransportClosed,
            Some(Ok(frame)) => frame,
            Some(Err(err)) => break fail(&session, &err),
        };
        match assembler.push(frame) {
            Ok(Action::Deliver(text)) => session.deliver(text),
            Ok(Action::Reply(reply)) => queue_control(&session, reply),
            Ok(Action::Close(reply)) => {
                queue_control(&session, reply);
                break CloseReason::PeerClose;
            }
            Ok(Action::Continue) => {}
            Err(err) => break fail(&session, &err),
        }
    };

    match reason {
        CloseReason::TransportClosed | CloseReason::WriterStopped => writer.abort(),
        _ => {
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut writer).await.is_err() {
                debug!("close frame not flushed in time");
                writer.abort();
            }
        }
    }

    debug!(?reason, "connection closed");
    session.disconnect();
    reason
}

fn fail(session: &ConnectionSession, err: &ProtocolError) -> CloseReason {
    match err.close_code() {
        Some(code) => {
            warn!(close_code = code, error = %err, "protocol error, closing connection");
            queue_control(session, Frame::close(code, &err.to_string()));
            CloseReason::Protocol(code)
        }
        None => {
            debug!(error = %err, "transport error");
            CloseReason::TransportClosed
        }
    }
}

fn queue_control(session: &ConnectionSession, frame: Frame) {
    session.queue(Outbound::Control(frame));
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, FrameCodec>,
    mut outbound: OutboundReceiver,
    session: Arc<ConnectionSession>,
    done: CancellationToken,
) where
    W: AsyncWrite + Send + Unpin,
{
    let _done = done.drop_guard();
    let overflow = session.overflow();
    loop {
        let item = tokio::select! {
            biased;
            () = overflow.cancelled() => {
                // queued text is dropped, the client gets the close next
                let close = Frame::close(close_code::POLICY_VIOLATION, "outbound queue limit exceeded");
                if let Err(err) = sink.send(close).await {
                    debug!(error = %err, "write failed");
                    return;
                }
                break;
            }
            item = outbound.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        let frame = match item {
            Outbound::Text(text) => {
                session.dequeued(text.len());
                Frame::text(text)
            }
            Outbound::Control(frame) => frame,
        };
        let closing = frame.opcode == OpCode::Close;
        if let Err(err) = sink.send(frame).await {
            debug!(error = %err, "write failed");
            return;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::DuplexStream;
    use tokio_util::codec::Framed;

    use super::*;
    use crate::session::SessionInfo;
    use crate::tokens::UserId;
    use crate::uri::QueryParams;

    type Client = Framed<DuplexStream, FrameCodec>;

    type Started = (
        Client,
        Arc<ConnectionSession>,
        CancellationToken,
        tokio::task::JoinHandle<CloseReason>,
    );

    fn start(max: usize) -> Started {
        start_with_limit(max, 64 * 1024)
    }

    fn start_with_limit(max: usize, outbound_limit: usize) -> Started {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (session, rx) = ConnectionSession::channel_with_limit(
            SessionInfo {
                tenant: "wiki".into(),
                handler_name: "echo".into(),
                user: UserId::from("alice"),
                parameters: QueryParams::default(),
            },
            outbound_limit,
        );
        session.on_message(|s| {
            s.send(s.recv().unwrap_or_default())?;
            Ok(())
        });
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(server_io, Arc::clone(&session), rx, max, shutdown.clone()));
        (
            Framed::new(client_io, FrameCodec::client(usize::MAX)),
            session,
            shutdown,
            task,
        )
    }

    #[tokio::test]
    async fn echoes_text() {
        let (mut client, _session, _shutdown, _task) = start(1024);
        client.send(Frame::text("hello")).await.unwrap();
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply, Frame::text("hello"));
    }

    #[tokio::test]
    async fn reassembles_fragments() {
        let (mut client, _session, _shutdown, _task) = start(1024);
        client
            .send(Frame::new(false, OpCode::Text, "Hello, "))
            .await
            .unwrap();
        client.send(Frame::ping("mid")).await.unwrap();
        client
            .send(Frame::new(true, OpCode::Continuation, "World!"))
            .await
            .unwrap();
        assert_eq!(client.next().await.unwrap().unwrap(), Frame::pong("mid"));
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Frame::text("Hello, World!")
        );
    }

    #[tokio::test]
    async fn client_close_is_echoed_and_disconnects_once() {
        let (mut client, session, _shutdown, task) = start(1024);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        session.on_disconnect(move |_| {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        client.send(Frame::close(close_code::NORMAL, "bye")).await.unwrap();
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply.close_code(), Some(close_code::NORMAL));
        assert_eq!(task.await.unwrap(), CloseReason::PeerClose);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn oversized_message_closes_with_1009() {
        let (mut client, _session, _shutdown, task) = start(8);
        client
            .send(Frame::new(false, OpCode::Text, "12345"))
            .await
            .unwrap();
        client
            .send(Frame::new(true, OpCode::Continuation, "67890"))
            .await
            .unwrap();
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply.close_code(), Some(close_code::MESSAGE_TOO_BIG));
        assert_eq!(
            task.await.unwrap(),
            CloseReason::Protocol(close_code::MESSAGE_TOO_BIG)
        );
    }

    #[tokio::test]
    async fn binary_frame_closes_with_1003() {
        let (mut client, _session, _shutdown, task) = start(1024);
        client
            .send(Frame::new(true, OpCode::Binary, &b"\x01\x02"[..]))
            .await
            .unwrap();
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply.close_code(), Some(close_code::UNSUPPORTED_DATA));
        assert_eq!(
            task.await.unwrap(),
            CloseReason::Protocol(close_code::UNSUPPORTED_DATA)
        );
    }

    #[tokio::test]
    async fn dropped_transport_disconnects() {
        let (client, session, _shutdown, task) = start(1024);
        drop(client);
        assert_eq!(task.await.unwrap(), CloseReason::TransportClosed);
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn shutdown_sends_going_away() {
        let (mut client, _session, shutdown, task) = start(1024);
        shutdown.cancel();
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply.close_code(), Some(close_code::GOING_AWAY));
        assert_eq!(task.await.unwrap(), CloseReason::Shutdown);
    }

    #[tokio::test]
    async fn handler_close_stops_connection() {
        let (mut client, session, _shutdown, task) = start(1024);
        session.close();
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply.close_code(), Some(close_code::NORMAL));
        assert_eq!(task.await.unwrap(), CloseReason::WriterStopped);
    }

    #[tokio::test]
    async fn backlogged_client_is_closed_with_1008() {
        let (mut client, session, _shutdown, task) = start_with_limit(1024, 16);
        let second = Arc::new(parking_lot::Mutex::new(None));
        let slot = Arc::clone(&second);
        session.on_message(move |s| {
            // The writer cannot run between these on a current-thread runtime
            s.send("0123456789")?;
            *slot.lock() = Some(s.send("0123456789"));
            Ok(())
        });

        client.send(Frame::text("go")).await.unwrap();
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply.close_code(), Some(close_code::POLICY_VIOLATION));
        assert_eq!(task.await.unwrap(), CloseReason::Overloaded);
        assert_eq!(
            *second.lock(),
            Some(Err(crate::errors::SessionError::Backlogged { limit: 16 }))
        );
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn writer_releases_pending_bytes() {
        let (mut client, session, _shutdown, _task) = start_with_limit(1024, 16);
        for _ in 0..4 {
            client.send(Frame::text("12345678")).await.unwrap();
            assert_eq!(
                client.next().await.unwrap().unwrap(),
                Frame::text("12345678")
            );
        }
        assert_eq!(session.pending_bytes(), 0);
    }
}
