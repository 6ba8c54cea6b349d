//! Per-connection state shared by the supervisor, consumer and producer.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use cychat_pubsub::{Connection, PubSubError, Subscription};
use cychat_shared::{ProtocolError, Topic, UserId};

use crate::backend::BackendError;

use super::socket::ClientSocket;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("User {0} not found")]
    UserNotFound(UserId),

    #[error("Room '{0}' not found")]
    RoomNotFound(String),

    #[error("Client socket error: {0}")]
    Socket(String),

    #[error("Client socket closed")]
    SocketClosed,

    #[error(transparent)]
    PubSub(#[from] PubSubError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Which endpoint a session was opened on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRoute {
    Direct { sender: UserId, receiver: UserId },
    Room { sender: UserId, room_name: String },
}

impl SessionRoute {
    pub fn sender(&self) -> UserId {
        match self {
            Self::Direct { sender, .. } | Self::Room { sender, .. } => *sender,
        }
    }

    pub fn topic(&self) -> Result<Topic, ProtocolError> {
        match self {
            Self::Direct { sender, receiver } => Ok(Topic::direct(*sender, *receiver)),
            Self::Room { room_name, .. } => Topic::room(room_name),
        }
    }
}

// ---------------------------------------------------------------------------
// Background work
// ---------------------------------------------------------------------------

/// Bounded group of background tasks owned by one session.
///
/// Spawning waits for a free slot. At teardown the group is drained with a
/// timeout and whatever is still running is aborted.
pub struct SessionTasks {
    set: Mutex<JoinSet<()>>,
    slots: Arc<Semaphore>,
}

impl SessionTasks {
    pub fn new(limit: usize) -> Self {
        Self {
            set: Mutex::new(JoinSet::new()),
            slots: Arc::new(Semaphore::new(limit.max(1))),
        }
    }

    pub async fn spawn<F>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = match self.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!(task = name, "Session task group closed, dropping task");
                return;
            }
        };

        let mut set = self.set.lock().await;
        // Reap finished tasks so the set does not grow for the whole session.
        while set.try_join_next().is_some() {}
        set.spawn(async move {
            fut.await;
            drop(permit);
        });
        debug!(task = name, in_flight = set.len(), "Spawned session task");
    }

    pub async fn in_flight(&self) -> usize {
        let mut set = self.set.lock().await;
        while set.try_join_next().is_some() {}
        set.len()
    }

    /// Wait up to `timeout` for outstanding tasks, then abort the rest.
    /// Returns the number of aborted tasks.
    pub async fn drain(&self, timeout: Duration) -> usize {
        self.slots.close();
        let mut set = self.set.lock().await;

        let drained = tokio::time::timeout(timeout, async {
            while let Some(res) = set.join_next().await {
                if let Err(e) = res {
                    if e.is_panic() {
                        warn!(error = %e, "Session task panicked");
                    }
                }
            }
        })
        .await;

        if drained.is_ok() {
            return 0;
        }

        let aborted = set.len();
        warn!(aborted, "Session tasks did not finish in time, aborting");
        set.abort_all();
        while set.join_next().await.is_some() {}
        aborted
    }
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

pub type SharedSubscription = Arc<Mutex<Box<dyn Subscription>>>;

/// The three resources a session must release: client socket, topic
/// subscription and pub/sub connection.
pub struct SessionResources {
    pub socket: Arc<ClientSocket>,
    pub subscription: Option<SharedSubscription>,
    pub connection: Option<Arc<dyn Connection>>,
    torn_down: AtomicBool,
}

impl SessionResources {
    pub fn new(
        socket: Arc<ClientSocket>,
        subscription: Option<SharedSubscription>,
        connection: Option<Arc<dyn Connection>>,
    ) -> Self {
        Self {
            socket,
            subscription,
            connection,
            torn_down: AtomicBool::new(false),
        }
    }

    /// Close everything, once. Each close is attempted even if an earlier
    /// one failed. Returns `false` when teardown had already run.
    pub async fn teardown(&self) -> bool {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            debug!("Session already torn down");
            return false;
        }

        if let Err(e) = self.socket.close().await {
            debug!(error = %e, "Client socket close failed");
        }

        if let Some(sub) = &self.subscription {
            let mut sub = sub.lock().await;
            if let Err(e) = sub.close().await {
                warn!(error = %e, topic = sub.topic(), "Subscription close failed");
            }
        }

        if let Some(conn) = &self.connection {
            if let Err(e) = conn.close().await {
                warn!(error = %e, "Pub/sub connection close failed");
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use cychat_pubsub::{Broker, MemoryBroker};

    use crate::ws::socket::test_socket;

    #[test]
    fn test_route_topics() {
        let a = SessionRoute::Direct {
            sender: UserId(9),
            receiver: UserId(5),
        };
        let b = SessionRoute::Direct {
            sender: UserId(5),
            receiver: UserId(9),
        };
        assert_eq!(a.topic().unwrap(), b.topic().unwrap());
        assert_eq!(a.topic().unwrap().as_str(), "5_9");

        let room = SessionRoute::Room {
            sender: UserId(1),
            room_name: "general".into(),
        };
        assert_eq!(room.topic().unwrap().as_str(), "general");
        assert_eq!(room.sender(), UserId(1));
    }

    #[tokio::test]
    async fn test_tasks_drain_waits_for_work() {
        let tasks = SessionTasks::new(4);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let done = done.clone();
            tasks
                .spawn("test", async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }

        assert_eq!(tasks.drain(Duration::from_secs(1)).await, 0);
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_tasks_drain_aborts_stragglers() {
        let tasks = SessionTasks::new(4);
        tasks
            .spawn("stuck", std::future::pending::<()>())
            .await;
        assert_eq!(tasks.drain(Duration::from_millis(20)).await, 1);
        assert_eq!(tasks.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_tasks_bounded() {
        let tasks = Arc::new(SessionTasks::new(1));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tasks
            .spawn("first", async move {
                let _ = rx.await;
            })
            .await;

        let second = {
            let tasks = tasks.clone();
            tokio::spawn(async move { tasks.spawn("second", async {}).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let broker = MemoryBroker::new();
        let conn: Arc<dyn Connection> = Arc::from(broker.connect().await.unwrap());
        let topic = Topic::room("general").unwrap();
        let sub: SharedSubscription = Arc::new(Mutex::new(conn.subscribe(&topic).await.unwrap()));
        let (socket, _outbound) = test_socket();

        let resources = SessionResources::new(socket.clone(), Some(sub), Some(conn.clone()));
        let (first, second) = tokio::join!(resources.teardown(), resources.teardown());

        assert!(first ^ second);
        assert!(!socket.is_connected());
        assert!(conn.is_closed());
        assert_eq!(broker.topic_count(), 0);
        assert!(!resources.teardown().await);
    }
}
