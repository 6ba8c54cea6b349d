/// Prefix of every HTTP and WebSocket route
pub const API_PREFIX: &str = "/api/v1";

/// Application name
pub const APP_NAME: &str = "Cychat";

/// Joins the two sorted participant ids of a direct-chat topic
pub const TOPIC_SEPARATOR: &str = "_";

/// Extension used when an original filename has no extension
pub const DEFAULT_FILE_EXTENSION: &str = ".bin";

/// Extension used when no original filename is supplied at all
pub const DEFAULT_IMAGE_EXTENSION: &str = ".png";

/// Sub-directory (below the upload root) holding chat attachments
pub const SENT_FILES_DIR: &str = "sent-files";

/// Public URL prefix of stored attachments, followed by `<owner>/<file>`
pub const ATTACHMENT_URL_PREFIX: &str = "/api/v1/chat/files/user";

/// Maximum attachment size in bytes (50 MiB)
pub const MAX_ATTACHMENT_SIZE: usize = 50 * 1024 * 1024;

/// Display name used when a user has no nickname
pub const FALLBACK_DISPLAY_NAME: &str = "User";

/// Default HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Default Redis port
pub const DEFAULT_REDIS_PORT: u16 = 6379;
