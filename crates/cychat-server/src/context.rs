use std::sync::Arc;

use cychat_pubsub::{select_broker, Broker};

use crate::attachments::AttachmentStore;
use crate::backend::{BackendFactory, SqliteBackendFactory};
use crate::config::ServerConfig;

/// Process-wide state handed to every request handler.
///
/// Built once at startup and injected as the router state.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub broker: Arc<dyn Broker>,
    pub attachments: Arc<AttachmentStore>,
    pub backends: Arc<dyn BackendFactory>,
}

impl AppContext {
    /// Wire the production collaborators from `config`.
    pub async fn from_config(config: ServerConfig) -> anyhow::Result<Self> {
        let broker = select_broker(&config.broker_selection()).await?;

        let attachments = Arc::new(
            AttachmentStore::new(config.upload_dir.clone(), config.max_attachment_size).await?,
        );

        // Run migrations once up front so sessions never race on them.
        let db_path = config.database_path.clone();
        tokio::task::spawn_blocking(move || cychat_store::Database::open_at(&db_path)).await??;

        let backends = Arc::new(SqliteBackendFactory::new(config.database_path.clone()));

        Ok(Self {
            config: Arc::new(config),
            broker,
            attachments,
            backends,
        })
    }
}
