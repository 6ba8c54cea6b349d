//! Client -> topic loop.
//!
//! The consumer owns the inbound half of the client socket. It announces
//! the user, then handles one envelope at a time in arrival order:
//! presence, attachments, moderation and plain messages.

use std::fmt::Display;
use std::sync::Arc;

use axum::extract::ws::Message;
use base64::Engine;
use futures::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

use cychat_pubsub::Connection;
use cychat_shared::{
    ChatStatus, Envelope, EnvelopeKind, MessageTarget, Topic, UserId, UserSnapshot,
};
use cychat_store::Room;

use crate::attachments::AttachmentStore;
use crate::backend::ChatBackend;

use super::session::{SessionError, SessionRoute, SessionTasks};
use super::socket::ClientSocket;

/// Everything one consumer needs, handed over by the supervisor.
pub struct ConsumerContext {
    pub route: SessionRoute,
    pub topic: Topic,
    pub connection: Arc<dyn Connection>,
    pub socket: Arc<ClientSocket>,
    pub backend: Arc<dyn ChatBackend>,
    pub attachments: Arc<AttachmentStore>,
    pub tasks: Arc<SessionTasks>,
}

/// How a consumer loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerExit {
    /// The user sent `leave`.
    Left,
    /// The client closed the socket or the stream ended.
    ClientClosed,
    /// An error reached the outer boundary; the connection was closed.
    Failed(String),
}

enum ConsumerState {
    Announcing,
    Listening,
    Dispatching(Envelope),
    Closed(ConsumerExit),
}

/// Conversation the session is bound to, resolved while announcing.
enum Scope {
    Direct { receiver: UserId },
    Room { room: Room },
}

struct Resolved {
    user: UserSnapshot,
    scope: Scope,
}

pub async fn run_consumer<St, E>(ctx: ConsumerContext, inbound: St) -> ConsumerExit
where
    St: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: Display,
{
    match drive(&ctx, inbound).await {
        Ok(exit) => exit,
        Err(e) => {
            error!(error = %e, topic = %ctx.topic, "Consumer failed");
            if let Err(e) = ctx.connection.close().await {
                warn!(error = %e, "Pub/sub connection close failed");
            }
            ConsumerExit::Failed(e.to_string())
        }
    }
}

async fn drive<St, E>(ctx: &ConsumerContext, mut inbound: St) -> Result<ConsumerExit, SessionError>
where
    St: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: Display,
{
    let mut state = ConsumerState::Announcing;
    let mut resolved: Option<Resolved> = None;

    loop {
        state = match state {
            ConsumerState::Announcing => {
                resolved = Some(announce(ctx).await?);
                ConsumerState::Listening
            }
            ConsumerState::Listening => match inbound.next().await {
                None => ConsumerState::Closed(ConsumerExit::ClientClosed),
                Some(Err(e)) => {
                    warn!(error = %e, "Client socket read failed");
                    ctx.socket.mark_closed();
                    ConsumerState::Closed(ConsumerExit::ClientClosed)
                }
                Some(Ok(Message::Text(text))) => match Envelope::from_text(text.as_str()) {
                    Ok(envelope) => ConsumerState::Dispatching(envelope),
                    Err(e) => {
                        warn!(error = %e, "Dropping malformed envelope");
                        ConsumerState::Listening
                    }
                },
                Some(Ok(Message::Close(_))) => {
                    ctx.socket.mark_closed();
                    ConsumerState::Closed(ConsumerExit::ClientClosed)
                }
                Some(Ok(_)) => ConsumerState::Listening,
            },
            ConsumerState::Dispatching(envelope) => {
                let session = resolved
                    .as_ref()
                    .ok_or(SessionError::UserNotFound(ctx.route.sender()))?;
                dispatch(ctx, session, envelope).await?
            }
            ConsumerState::Closed(exit) => return Ok(exit),
        };
    }
}

/// Resolve the session identity and scope, mark the user online and
/// publish the `online` presence envelope.
async fn announce(ctx: &ConsumerContext) -> Result<Resolved, SessionError> {
    let sender = ctx.route.sender();
    let user = ctx
        .backend
        .find_user_by_id(sender)
        .await?
        .ok_or(SessionError::UserNotFound(sender))?;

    let (scope, room_name) = match &ctx.route {
        SessionRoute::Direct { receiver, .. } => (Scope::Direct { receiver: *receiver }, None),
        SessionRoute::Room { room_name, .. } => {
            let room = ctx
                .backend
                .find_room(room_name)
                .await?
                .ok_or_else(|| SessionError::RoomNotFound(room_name.clone()))?;
            if ctx.backend.find_membership(sender, room.id).await?.is_none() {
                debug!(user = %sender, room = %room.room_name, "User is not a member of the room");
            }
            (Scope::Room { room }, Some(ctx.topic.as_str()))
        }
    };

    if let Err(e) = ctx.backend.set_presence(sender, ChatStatus::Online).await {
        warn!(error = %e, user = %sender, "Presence update failed");
    }

    let online = Envelope::presence(EnvelopeKind::Online, &user, room_name);
    ctx.connection.publish(&ctx.topic, online.to_bytes()?).await?;
    info!(user = %sender, topic = %ctx.topic, "User online");

    Ok(Resolved { user, scope })
}

async fn dispatch(
    ctx: &ConsumerContext,
    session: &Resolved,
    mut envelope: Envelope,
) -> Result<ConsumerState, SessionError> {
    envelope.user = Some(session.user.clone());
    let attachment = envelope.kind.is_attachment();

    match envelope.kind {
        EnvelopeKind::Leave => {
            leave(ctx, session).await?;
            Ok(ConsumerState::Closed(ConsumerExit::Left))
        }
        _ if attachment => {
            if let Some(rewritten) = store_attachment(ctx, session, envelope).await {
                ctx.connection
                    .publish(&ctx.topic, rewritten.to_bytes()?)
                    .await?;
            }
            Ok(ConsumerState::Listening)
        }
        EnvelopeKind::Ban | EnvelopeKind::Unban => {
            spawn_moderation(ctx, session, &envelope).await;
            ctx.connection
                .publish(&ctx.topic, envelope.to_bytes()?)
                .await?;
            Ok(ConsumerState::Listening)
        }
        _ => {
            let payload = envelope.to_bytes()?;
            info!(
                user = %session.user.id,
                topic = %ctx.topic,
                kind = envelope.kind.as_str(),
                "Consumer received envelope"
            );
            ctx.connection.publish(&ctx.topic, payload).await?;
            spawn_persist(ctx, session, envelope).await;
            Ok(ConsumerState::Listening)
        }
    }
}

async fn leave(ctx: &ConsumerContext, session: &Resolved) -> Result<(), SessionError> {
    let user = &session.user;
    info!(user = %user.id, topic = %ctx.topic, "User leaving");

    if let Err(e) = ctx.backend.set_presence(user.id, ChatStatus::Offline).await {
        warn!(error = %e, user = %user.id, "Presence update failed");
    }

    let offline = Envelope::presence(EnvelopeKind::Offline, user, None);
    ctx.connection.publish(&ctx.topic, offline.to_bytes()?).await?;

    if let Err(e) = ctx.socket.close().await {
        debug!(error = %e, "Client socket close failed");
    }
    Ok(())
}

/// Decode, store and persist an attachment, then return the envelope as
/// peers should see it. `None` means the envelope was dropped.
async fn store_attachment(
    ctx: &ConsumerContext,
    session: &Resolved,
    mut envelope: Envelope,
) -> Option<Envelope> {
    let sender = session.user.id;
    // Wrapped (MIME style) base64 is accepted.
    let encoded: String = envelope
        .content
        .take()
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let data = match base64::engine::general_purpose::STANDARD.decode(&encoded) {
        Ok(data) => data,
        Err(e) => {
            warn!(error = %e, user = %sender, "Dropping attachment with invalid base64");
            return None;
        }
    };

    // Validate the addressee before anything touches the disk.
    let target = match &session.scope {
        Scope::Direct { receiver } => match ctx.backend.find_user_by_id(*receiver).await {
            Ok(Some(user)) => MessageTarget::Direct { receiver: user.id },
            Ok(None) => {
                warn!(receiver = %receiver, "Dropping attachment, receiver not found");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Dropping attachment, receiver lookup failed");
                return None;
            }
        },
        Scope::Room { room } => match ctx.backend.find_membership(sender, room.id).await {
            Ok(Some(_)) => MessageTarget::Room { room_id: room.id },
            Ok(None) => {
                warn!(user = %sender, room = %room.room_name, "Dropping attachment, not a member");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Dropping attachment, membership lookup failed");
                return None;
            }
        },
    };

    let original_filename = envelope.filename.clone().filter(|n| !n.trim().is_empty());
    let stored = match ctx
        .attachments
        .save(sender, &data, original_filename.as_deref())
        .await
    {
        Ok(stored) => stored,
        Err(e) => {
            warn!(error = %e, user = %sender, "Dropping attachment, save failed");
            return None;
        }
    };
    info!(
        user = %sender,
        url = %stored.url,
        category = %stored.category,
        size = stored.size,
        "Attachment saved"
    );

    let kind = envelope.kind.as_str().to_string();
    let media = Some(stored.url.clone());
    let persisted = match target {
        MessageTarget::Direct { receiver } => {
            ctx.backend
                .persist_direct(sender, receiver, String::new(), kind, media)
                .await
        }
        MessageTarget::Room { room_id } => {
            ctx.backend
                .persist_room(sender, room_id, String::new(), kind, media)
                .await
        }
    };
    if let Err(e) = persisted {
        warn!(error = %e, user = %sender, "Dropping attachment, persistence failed");
        return None;
    }

    envelope.media = Some(stored.url.clone());
    envelope.file_info = Some(stored.file_info());
    envelope.preview = None;
    Some(envelope)
}

/// Queue the ban/unban action described by `envelope`. The action never
/// gates the echo.
async fn spawn_moderation(ctx: &ConsumerContext, session: &Resolved, envelope: &Envelope) {
    let admin = session.user.id;
    let Some(target) = envelope.text_field("receiver").map(str::to_string) else {
        warn!(user = %admin, "Moderation envelope without receiver, skipping action");
        return;
    };
    let room_name = envelope
        .text_field("room_name")
        .map(str::to_string)
        .or_else(|| match &session.scope {
            Scope::Room { .. } => Some(ctx.topic.as_str().to_string()),
            Scope::Direct { .. } => None,
        });
    let Some(room_name) = room_name else {
        warn!(user = %admin, "Moderation envelope without room, skipping action");
        return;
    };

    let ban = envelope.kind == EnvelopeKind::Ban;
    let backend = ctx.backend.clone();
    ctx.tasks
        .spawn("moderation", async move {
            let result = if ban {
                backend.ban(admin, &target, &room_name).await
            } else {
                backend.unban(admin, &target, &room_name).await
            };
            match result {
                Ok(()) => info!(%admin, %target, room = %room_name, ban, "Moderation applied"),
                Err(e) => warn!(error = %e, %admin, %target, ban, "Moderation failed"),
            }
        })
        .await;
}

/// Queue the durable write of a message that has already been published.
async fn spawn_persist(ctx: &ConsumerContext, session: &Resolved, envelope: Envelope) {
    let sender = session.user.id;
    let content = envelope.content.unwrap_or_default();
    let kind = envelope.kind.as_str().to_string();
    let media = envelope.media;
    let backend = ctx.backend.clone();

    match &session.scope {
        Scope::Direct { receiver } => {
            let receiver = *receiver;
            ctx.tasks
                .spawn("persist_direct", async move {
                    if let Err(e) = backend
                        .persist_direct(sender, receiver, content, kind, media)
                        .await
                    {
                        warn!(error = %e, %sender, %receiver, "Message not stored");
                    }
                })
                .await;
        }
        Scope::Room { room } => {
            let room_id = room.id;
            ctx.tasks
                .spawn("persist_room", async move {
                    if let Err(e) = backend
                        .persist_room(sender, room_id, content, kind, media)
                        .await
                    {
                        warn!(error = %e, %sender, room = %room_id, "Message not stored");
                    }
                })
                .await;
        }
    }
}
