use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Multipart, Path, State,
    },
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::StreamExt;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use cychat_shared::constants::API_PREFIX;
use cychat_shared::files::static_mime_type;
use cychat_shared::UserId;

use crate::attachments::StoredAttachment;
use crate::context::AppContext;
use crate::error::ServerError;
use crate::ws::{run_session, SessionRoute};

/// Multipart framing on top of the attachment itself.
const UPLOAD_OVERHEAD: usize = 64 * 1024;

pub fn build_router(app: AppContext) -> Router {
    let body_limit = app.config.max_attachment_size + UPLOAD_OVERHEAD;

    let api = Router::new()
        .route("/health", get(health_check))
        .route("/ws/{sender_id}/{room_name}", get(ws_room))
        .route("/ws/chat/{sender_id}/{receiver_id}", get(ws_direct))
        .route(
            "/chat/files/user/{user_id}",
            axum::routing::post(attachment_upload),
        )
        .route(
            "/chat/files/user/{user_id}/{filename}",
            get(attachment_download),
        );

    Router::new()
        .nest(API_PREFIX, api)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    pubsub: &'static str,
}

async fn health_check(State(app): State<AppContext>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        pubsub: app.broker.name(),
    })
}

// ---------------------------------------------------------------------------
// WebSocket endpoints
// ---------------------------------------------------------------------------

async fn ws_room(
    ws: WebSocketUpgrade,
    State(app): State<AppContext>,
    Path((sender_id, room_name)): Path<(i64, String)>,
) -> Response {
    let route = SessionRoute::Room {
        sender: UserId(sender_id),
        room_name,
    };
    upgrade(ws, app, route)
}

async fn ws_direct(
    ws: WebSocketUpgrade,
    State(app): State<AppContext>,
    Path((sender_id, receiver_id)): Path<(i64, i64)>,
) -> Response {
    let route = SessionRoute::Direct {
        sender: UserId(sender_id),
        receiver: UserId(receiver_id),
    };
    upgrade(ws, app, route)
}

/// Attachments travel base64-encoded inside a single text frame, so the
/// frame and message limits follow the attachment size limit.
fn upgrade(ws: WebSocketUpgrade, app: AppContext, route: SessionRoute) -> Response {
    let limit = app.config.max_ws_message_size();
    ws.max_frame_size(limit)
        .max_message_size(limit)
        .on_upgrade(move |socket| serve_socket(app, route, socket))
}

async fn serve_socket(app: AppContext, route: SessionRoute, socket: WebSocket) {
    let (sink, stream) = socket.split();
    run_session(app, route, sink, stream).await;
}

// ---------------------------------------------------------------------------
// Attachments
// ---------------------------------------------------------------------------

async fn attachment_upload(
    State(app): State<AppContext>,
    Path(user_id): Path<i64>,
    mut multipart: Multipart,
) -> Result<Json<StoredAttachment>, ServerError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("Multipart error: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let original_filename = field.file_name().map(str::to_string);
        let data = field
            .bytes()
            .await
            .map_err(|e| ServerError::BadRequest(format!("Failed to read field: {}", e)))?;

        let stored = app
            .attachments
            .save(UserId(user_id), &data, original_filename.as_deref())
            .await?;

        info!(url = %stored.url, size = stored.size, "Attachment uploaded via API");
        return Ok(Json(stored));
    }

    Err(ServerError::BadRequest(
        "Missing 'file' field in multipart form".to_string(),
    ))
}

async fn attachment_download(
    State(app): State<AppContext>,
    Path((user_id, filename)): Path<(i64, String)>,
) -> Result<Response, ServerError> {
    let data = app.attachments.read(UserId(user_id), &filename).await?;
    let content_type = content_type_for(&filename);
    Ok(([(header::CONTENT_TYPE, content_type)], data).into_response())
}

/// Static table first, then `mime_guess`, then opaque binary.
fn content_type_for(filename: &str) -> String {
    if let Some(mime) = static_mime_type(filename) {
        return mime.to_string();
    }
    mime_guess::from_path(filename)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_string()
}

pub async fn serve(app: AppContext, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let router = build_router(app);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use cychat_pubsub::MemoryBroker;

    use crate::attachments::AttachmentStore;
    use crate::backend::SqliteBackendFactory;
    use crate::config::ServerConfig;

    async fn test_app() -> (AppContext, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            database_path: dir.path().join("chat.db"),
            upload_dir: dir.path().join("uploads"),
            ..ServerConfig::default()
        };
        let app = AppContext {
            attachments: Arc::new(
                AttachmentStore::new(config.upload_dir.clone(), 1024 * 1024)
                    .await
                    .unwrap(),
            ),
            backends: Arc::new(SqliteBackendFactory::new(config.database_path.clone())),
            config: Arc::new(config),
            broker: Arc::new(MemoryBroker::new()),
        };
        (app, dir)
    }

    async fn body_json(res: Response) -> serde_json::Value {
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_content_type_fallbacks() {
        assert_eq!(content_type_for("a.png"), "image/png");
        assert_eq!(content_type_for("a.pdf"), "application/pdf");
        assert_eq!(content_type_for("a.csv"), "text/csv");
        assert_eq!(content_type_for("a.zzz"), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _dir) = test_app().await;
        let res = build_router(app)
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let json = body_json(res).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["pubsub"], "memory");
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let (app, _dir) = test_app().await;
        let router = build_router(app);

        let boundary = "cychat-boundary";
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"report.pdf\"\r\n\
             Content-Type: application/pdf\r\n\r\n\
             %PDF-1.4\r\n\
             --{boundary}--\r\n"
        );
        let res = router
            .clone()
            .oneshot(
                Request::post("/api/v1/chat/files/user/3")
                    .header(
                        header::CONTENT_TYPE,
                        format!("multipart/form-data; boundary={boundary}"),
                    )
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let json = body_json(res).await;
        assert_eq!(json["category"], "document");
        assert_eq!(json["filename"], "report.pdf");
        assert_eq!(json["size"], 8);
        let url = json["url"].as_str().unwrap().to_string();
        assert!(url.starts_with("/api/v1/chat/files/user/3/"));

        let res = router
            .oneshot(Request::get(url.as_str()).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "application/pdf");
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"%PDF-1.4");
    }

    #[tokio::test]
    async fn test_missing_file_is_404() {
        let (app, _dir) = test_app().await;
        let res = build_router(app)
            .oneshot(
                Request::get("/api/v1/chat/files/user/3/nope.png")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        let json = body_json(res).await;
        assert!(json["error"].as_str().unwrap().contains("nope.png"));
    }

    #[tokio::test]
    async fn test_empty_upload_is_bad_request() {
        let (app, _dir) = test_app().await;
        let boundary = "b";
        let body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"empty.png\"\r\n\r\n\r\n--{boundary}--\r\n"
        );
        let res = build_router(app)
            .oneshot(
                Request::post("/api/v1/chat/files/user/3")
                    .header(
                        header::CONTENT_TYPE,
                        format!("multipart/form-data; boundary={boundary}"),
                    )
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let json = body_json(res).await;
        assert!(json["error"].as_str().unwrap().contains("Empty attachment"));
    }

    #[tokio::test]
    async fn test_upload_without_file_field() {
        let (app, _dir) = test_app().await;
        let boundary = "b";
        let body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"other\"\r\n\r\nx\r\n--{boundary}--\r\n"
        );
        let res = build_router(app)
            .oneshot(
                Request::post("/api/v1/chat/files/user/3")
                    .header(
                        header::CONTENT_TYPE,
                        format!("multipart/form-data; boundary={boundary}"),
                    )
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }
}
