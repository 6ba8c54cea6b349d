//! Outbound half of a client WebSocket, shared by consumer and producer.

use std::fmt::Display;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt};
use tokio::sync::Mutex;

use super::session::SessionError;

type BoxSink = Pin<Box<dyn Sink<Message, Error = SessionError> + Send>>;

/// Progress of the closing handshake on our side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseState {
    Open,
    /// The close frame is queued on the sink but not yet flushed.
    Queued,
    Closed,
}

struct Outbound {
    sink: BoxSink,
    close: CloseState,
}

/// Write side of a client connection.
///
/// Tracks whether the socket is still open so the producer can stop as soon
/// as either side closes it. Whether the close frame actually went out is
/// tracked separately, under the sink lock, so an interrupted `close` can be
/// finished by a later call.
pub struct ClientSocket {
    outbound: Mutex<Outbound>,
    open: AtomicBool,
}

impl ClientSocket {
    pub fn new<S, E>(sink: S) -> Arc<Self>
    where
        S: Sink<Message, Error = E> + Send + 'static,
        E: Display,
    {
        let sink = sink.sink_map_err(|e| SessionError::Socket(e.to_string()));
        Arc::new(Self {
            outbound: Mutex::new(Outbound {
                sink: Box::pin(sink),
                close: CloseState::Open,
            }),
            open: AtomicBool::new(true),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Mark the socket closed without sending a close frame, e.g. after the
    /// peer went away.
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub async fn send_text(&self, text: &str) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::SocketClosed);
        }
        let mut out = self.outbound.lock().await;
        if let Err(e) = out.sink.send(Message::Text(text.into())).await {
            self.mark_closed();
            return Err(e);
        }
        Ok(())
    }

    /// Send a close frame and close the sink. The frame is sent at most
    /// once; a call interrupted part way is completed by the next one.
    pub async fn close(&self) -> Result<(), SessionError> {
        self.open.store(false, Ordering::SeqCst);

        let mut out = self.outbound.lock().await;
        if out.close == CloseState::Open {
            out.sink.feed(Message::Close(None)).await?;
            out.close = CloseState::Queued;
        }
        if out.close == CloseState::Queued {
            out.sink.close().await?;
            out.close = CloseState::Closed;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_socket() -> (
    Arc<ClientSocket>,
    futures::channel::mpsc::UnboundedReceiver<Message>,
) {
    let (tx, rx) = futures::channel::mpsc::unbounded();
    (ClientSocket::new(tx), rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_send_then_close_once() {
        let (socket, mut rx) = test_socket();

        socket.send_text("{\"type\":\"text\"}").await.unwrap();
        socket.close().await.unwrap();
        socket.close().await.unwrap();

        assert!(matches!(rx.next().await, Some(Message::Text(t)) if t.as_str() == "{\"type\":\"text\"}"));
        assert!(matches!(rx.next().await, Some(Message::Close(None))));
        assert!(rx.next().await.is_none());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (socket, _rx) = test_socket();
        socket.close().await.unwrap();
        assert!(!socket.is_connected());
        assert!(matches!(
            socket.send_text("late").await,
            Err(SessionError::SocketClosed)
        ));
    }

    #[tokio::test]
    async fn test_interrupted_close_is_completed_later() {
        let (socket, mut rx) = test_socket();

        // Hold the sink so the first close stalls after marking the socket
        // closed, then cancel it like a supervisor abort would.
        let guard = socket.outbound.lock().await;
        let first = tokio::spawn({
            let socket = socket.clone();
            async move { socket.close().await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!socket.is_connected());
        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());
        drop(guard);

        socket.close().await.unwrap();
        assert!(matches!(rx.next().await, Some(Message::Close(None))));
        assert!(rx.next().await.is_none());
    }

    #[tokio::test]
    async fn test_send_to_dropped_peer_marks_closed() {
        let (socket, rx) = test_socket();
        drop(rx);
        assert!(socket.send_text("hello").await.is_err());
        assert!(!socket.is_connected());
    }
}
