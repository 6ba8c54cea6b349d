//! Topic -> client forwarding loop.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use cychat_pubsub::Delivery;

use super::session::SharedSubscription;
use super::socket::ClientSocket;

/// How a producer loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerExit {
    /// The client socket is no longer connected.
    ClientGone,
    /// The subscription failed; the error has been logged.
    TransportError(String),
}

/// Forward every message published on the subscribed topic to the client,
/// verbatim, as a text frame.
///
/// Acknowledgements are skipped. The subscription must already be
/// established; each poll waits at most `poll` so a closed client is
/// noticed promptly.
pub async fn run_producer(
    socket: Arc<ClientSocket>,
    subscription: SharedSubscription,
    poll: Duration,
) -> ProducerExit {
    loop {
        if !socket.is_connected() {
            debug!("Client socket closed, stopping producer");
            return ProducerExit::ClientGone;
        }

        let next = {
            let mut sub = subscription.lock().await;
            sub.next_message(true, poll).await
        };

        let payload = match next {
            Ok(Some(Delivery::Message { payload, .. })) => payload,
            Ok(Some(Delivery::SubscribeAck { .. })) | Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "Subscription failed, stopping producer");
                return ProducerExit::TransportError(e.to_string());
            }
        };

        let text = match std::str::from_utf8(&payload) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Dropping non UTF-8 payload");
                continue;
            }
        };

        debug!(payload = %text, "Forwarding to client");
        if let Err(e) = socket.send_text(text).await {
            debug!(error = %e, "Client send failed, stopping producer");
            return ProducerExit::ClientGone;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::Message;
    use futures::StreamExt;
    use tokio::sync::Mutex;

    use bytes::Bytes;
    use cychat_pubsub::{Broker, MemoryBroker};
    use cychat_shared::Topic;

    use crate::ws::socket::test_socket;

    const POLL: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_forwards_published_payloads() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        let topic = Topic::direct(cychat_shared::UserId(1), cychat_shared::UserId(2));
        let sub: SharedSubscription = Arc::new(Mutex::new(conn.subscribe(&topic).await.unwrap()));
        let (socket, mut rx) = test_socket();

        let producer = tokio::spawn(run_producer(socket.clone(), sub, POLL));

        conn.publish(&topic, Bytes::from_static(b"{\"content\":\"hi\"}"))
            .await
            .unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(frame, Message::Text(t) if t.as_str() == "{\"content\":\"hi\"}"));

        socket.close().await.unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, ProducerExit::ClientGone);
    }

    #[tokio::test]
    async fn test_stops_on_closed_subscription() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        let topic = Topic::room("general").unwrap();
        let sub: SharedSubscription = Arc::new(Mutex::new(conn.subscribe(&topic).await.unwrap()));
        sub.lock().await.close().await.unwrap();
        let (socket, _rx) = test_socket();

        let exit = tokio::time::timeout(Duration::from_secs(1), run_producer(socket, sub, POLL))
            .await
            .unwrap();
        assert!(matches!(exit, ProducerExit::TransportError(_)));
    }
}
