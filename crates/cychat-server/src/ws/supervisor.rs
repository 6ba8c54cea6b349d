//! Connection supervisor: one per accepted WebSocket.
//!
//! Opens the pub/sub connection and subscription, runs the consumer and
//! producer as two tasks, and tears everything down as soon as either ends.

use std::fmt::Display;
use std::sync::Arc;

use axum::extract::ws::Message;
use futures::{Sink, Stream};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use cychat_pubsub::Connection;

use crate::context::AppContext;

use super::consumer::{run_consumer, ConsumerContext, ConsumerExit};
use super::producer::{run_producer, ProducerExit};
use super::session::{SessionError, SessionResources, SessionRoute, SessionTasks, SharedSubscription};
use super::socket::ClientSocket;

/// Which side ended the session first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    Consumer(ConsumerExit),
    Producer(ProducerExit),
    /// The session never started.
    Setup(String),
}

/// Drive one client connection to completion.
///
/// `sink` and `stream` are the two halves of the accepted socket.
pub async fn run_session<Si, SiE, St, StE>(
    app: AppContext,
    route: SessionRoute,
    sink: Si,
    stream: St,
) -> SessionEnd
where
    Si: Sink<Message, Error = SiE> + Send + 'static,
    SiE: Display,
    St: Stream<Item = Result<Message, StE>> + Unpin + Send + 'static,
    StE: Display + Send + 'static,
{
    let socket = ClientSocket::new(sink);

    // -----------------------------------------------------------------------
    // 1. Open the pub/sub connection and subscription
    // -----------------------------------------------------------------------
    let (topic, connection, subscription) = match open_transport(&app, &route).await {
        Ok(parts) => parts,
        Err((e, connection)) => {
            error!(error = %e, ?route, "Session setup failed");
            SessionResources::new(socket, None, connection).teardown().await;
            return SessionEnd::Setup(e.to_string());
        }
    };

    let resources =
        SessionResources::new(socket.clone(), Some(subscription.clone()), Some(connection.clone()));

    // -----------------------------------------------------------------------
    // 2. Session-scoped store handle
    // -----------------------------------------------------------------------
    let backend = match app.backends.open_session().await {
        Ok(backend) => backend,
        Err(e) => {
            error!(error = %e, "Failed to open session store");
            resources.teardown().await;
            return SessionEnd::Setup(e.to_string());
        }
    };

    info!(sender = %route.sender(), topic = %topic, "Session started");

    // -----------------------------------------------------------------------
    // 3. Race consumer and producer
    // -----------------------------------------------------------------------
    let tasks = Arc::new(SessionTasks::new(app.config.session_task_limit));
    let consumer_ctx = ConsumerContext {
        route: route.clone(),
        topic: topic.clone(),
        connection,
        socket: socket.clone(),
        backend,
        attachments: app.attachments.clone(),
        tasks: tasks.clone(),
    };

    let mut consumer = tokio::spawn(run_consumer(consumer_ctx, stream));
    let mut producer = tokio::spawn(run_producer(
        socket,
        subscription,
        app.config.producer_poll,
    ));

    let end = tokio::select! {
        res = &mut consumer => {
            producer.abort();
            let _ = (&mut producer).await;
            SessionEnd::Consumer(res.unwrap_or_else(|e| ConsumerExit::Failed(e.to_string())))
        }
        res = &mut producer => {
            consumer.abort();
            let _ = (&mut consumer).await;
            SessionEnd::Producer(res.unwrap_or_else(|e| ProducerExit::TransportError(e.to_string())))
        }
    };
    debug!(?end, topic = %topic, "Session task finished, tearing down");

    // -----------------------------------------------------------------------
    // 4. Let background writes finish, then release resources
    // -----------------------------------------------------------------------
    let aborted = tasks.drain(app.config.teardown_timeout).await;
    if aborted > 0 {
        warn!(aborted, topic = %topic, "Background tasks aborted at teardown");
    }
    resources.teardown().await;

    info!(sender = %route.sender(), topic = %topic, ?end, "Session ended");
    end
}

type Transport = (cychat_shared::Topic, Arc<dyn Connection>, SharedSubscription);

/// On failure the connection, if it was opened, is handed back so the
/// caller can close it.
async fn open_transport(
    app: &AppContext,
    route: &SessionRoute,
) -> Result<Transport, (SessionError, Option<Arc<dyn Connection>>)> {
    let topic = match route.topic() {
        Ok(topic) => topic,
        Err(e) => return Err((SessionError::from(e), None)),
    };
    let connection: Arc<dyn Connection> = match app.broker.connect().await {
        Ok(conn) => Arc::from(conn),
        Err(e) => return Err((SessionError::from(e), None)),
    };

    // Subscribe before the tasks start so nothing published by the peer in
    // the meantime is missed.
    match connection.subscribe(&topic).await {
        Ok(sub) => Ok((topic, connection, Arc::new(Mutex::new(sub)))),
        Err(e) => Err((SessionError::from(e), Some(connection))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::time::Duration;

    use futures::channel::mpsc;
    use futures::StreamExt;
    use tempfile::TempDir;

    use cychat_pubsub::{Broker, MemoryBroker};
    use cychat_shared::UserId;
    use cychat_store::{Database, NewUser};

    use crate::attachments::AttachmentStore;
    use crate::backend::SqliteBackendFactory;
    use crate::config::ServerConfig;

    const WAIT: Duration = Duration::from_secs(2);

    async fn app(dir: &TempDir, broker: MemoryBroker) -> AppContext {
        let db_path = dir.path().join("chat.db");
        {
            let db = Database::open_at(&db_path).unwrap();
            db.create_user(&NewUser::new("ana", "ana@example.com")).unwrap();
            db.create_user(&NewUser::new("bo", "bo@example.com")).unwrap();
        }
        let config = ServerConfig {
            database_path: db_path.clone(),
            upload_dir: dir.path().join("uploads"),
            producer_poll: Duration::from_millis(20),
            teardown_timeout: Duration::from_millis(500),
            ..ServerConfig::default()
        };
        AppContext {
            attachments: Arc::new(
                AttachmentStore::new(config.upload_dir.clone(), config.max_attachment_size)
                    .await
                    .unwrap(),
            ),
            config: Arc::new(config),
            broker: Arc::new(broker),
            backends: Arc::new(SqliteBackendFactory::new(db_path)),
        }
    }

    #[tokio::test]
    async fn test_leave_ends_both_tasks() {
        let dir = TempDir::new().unwrap();
        let broker = MemoryBroker::new();
        let app = app(&dir, broker.clone()).await;

        let (out_tx, mut out_rx) = mpsc::unbounded::<Message>();
        let (in_tx, in_rx) = mpsc::unbounded::<Result<Message, Infallible>>();
        let route = SessionRoute::Direct {
            sender: UserId(1),
            receiver: UserId(2),
        };
        let session = tokio::spawn(run_session(app, route, out_tx, in_rx));

        // Own online announcement comes back through the producer.
        let first = tokio::time::timeout(WAIT, out_rx.next()).await.unwrap().unwrap();
        assert!(matches!(&first, Message::Text(t) if t.as_str().contains("is online!")));

        in_tx
            .unbounded_send(Ok(Message::Text(r#"{"type":"leave"}"#.into())))
            .unwrap();

        // Both sides notice the leave; either may finish first.
        let end = tokio::time::timeout(WAIT, session).await.unwrap().unwrap();
        assert!(matches!(
            end,
            SessionEnd::Consumer(ConsumerExit::Left) | SessionEnd::Producer(ProducerExit::ClientGone)
        ));
        assert_eq!(broker.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_client_disconnect_releases_topic() {
        let dir = TempDir::new().unwrap();
        let broker = MemoryBroker::new();
        let app = app(&dir, broker.clone()).await;

        let (out_tx, _out_rx) = mpsc::unbounded::<Message>();
        let (in_tx, in_rx) = mpsc::unbounded::<Result<Message, Infallible>>();
        let route = SessionRoute::Direct {
            sender: UserId(2),
            receiver: UserId(1),
        };
        let session = tokio::spawn(run_session(app, route, out_tx, in_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.topic_count(), 1);
        drop(in_tx);

        let end = tokio::time::timeout(WAIT, session).await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::Consumer(ConsumerExit::ClientClosed));
        assert_eq!(broker.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_room_topic_is_setup_failure() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir, MemoryBroker::new()).await;

        let (out_tx, mut out_rx) = mpsc::unbounded::<Message>();
        let (_in_tx, in_rx) = mpsc::unbounded::<Result<Message, Infallible>>();
        let route = SessionRoute::Room {
            sender: UserId(1),
            room_name: "  ".into(),
        };

        let end = run_session(app, route, out_tx, in_rx).await;
        assert!(matches!(end, SessionEnd::Setup(_)));
        assert!(matches!(out_rx.next().await, Some(Message::Close(None))));
    }

    #[tokio::test]
    async fn test_peer_messages_reach_other_session() {
        let dir = TempDir::new().unwrap();
        let broker = MemoryBroker::new();
        let app = app(&dir, broker.clone()).await;

        let (out_tx, mut out_rx) = mpsc::unbounded::<Message>();
        let (_in_tx, in_rx) = mpsc::unbounded::<Result<Message, Infallible>>();
        let route = SessionRoute::Direct {
            sender: UserId(2),
            receiver: UserId(1),
        };
        tokio::spawn(run_session(app, route, out_tx, in_rx));
        tokio::time::timeout(WAIT, out_rx.next()).await.unwrap().unwrap();

        let peer = broker.connect().await.unwrap();
        let topic = cychat_shared::Topic::direct(UserId(1), UserId(2));
        peer.publish(&topic, bytes::Bytes::from_static(br#"{"type":"text","content":"yo"}"#))
            .await
            .unwrap();

        let frame = tokio::time::timeout(WAIT, out_rx.next()).await.unwrap().unwrap();
        assert!(matches!(frame, Message::Text(t) if t.as_str() == r#"{"type":"text","content":"yo"}"#));
    }
}
