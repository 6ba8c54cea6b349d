use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::constants::FALLBACK_DISPLAY_NAME;
use crate::error::ProtocolError;
use crate::files::FileCategory;
use crate::types::UserId;

/// Discriminant of an [`Envelope`], carried in its `type` field.
///
/// Unknown values are preserved as [`EnvelopeKind::Other`] and handled like
/// text; a missing `type` defaults to [`EnvelopeKind::Text`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EnvelopeKind {
    #[default]
    Text,
    Media,
    File,
    Online,
    Offline,
    Leave,
    Ban,
    Unban,
    Other(String),
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Text => "text",
            Self::Media => "media",
            Self::File => "file",
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Leave => "leave",
            Self::Ban => "ban",
            Self::Unban => "unban",
            Self::Other(s) => s,
        }
    }

    /// Whether the `content` field carries a base64 binary payload.
    pub fn is_attachment(&self) -> bool {
        matches!(self, Self::Media | Self::File)
    }
}

impl From<String> for EnvelopeKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "text" => Self::Text,
            "media" => Self::Media,
            "file" => Self::File,
            "online" => Self::Online,
            "offline" => Self::Offline,
            "leave" => Self::Leave,
            "ban" => Self::Ban,
            "unban" => Self::Unban,
            _ => Self::Other(s),
        }
    }
}

impl From<EnvelopeKind> for String {
    fn from(kind: EnvelopeKind) -> Self {
        match kind {
            EnvelopeKind::Other(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

/// Denormalized snapshot of the sending user, stamped by the server on
/// every envelope it publishes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSnapshot {
    pub id: UserId,
    pub nickname: String,
    pub email: String,
    pub user_role: String,
    pub admin: bool,
}

impl UserSnapshot {
    pub fn display_name(&self) -> &str {
        if self.nickname.trim().is_empty() {
            FALLBACK_DISPLAY_NAME
        } else {
            &self.nickname
        }
    }
}

/// Descriptor attached to media/file envelopes once the payload is stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileInfo {
    pub filename: String,
    pub extension: String,
    pub category: FileCategory,
    pub size: u64,
}

/// Message unit exchanged over client WebSockets and pub/sub topics.
///
/// Fields the server does not interpret (`receiver`, `room_name`, client
/// extensions) round-trip untouched through `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Envelope {
    #[serde(rename = "type", default)]
    pub kind: EnvelopeKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,

    #[serde(
        default,
        deserialize_with = "lenient_user",
        skip_serializing_if = "Option::is_none"
    )]
    pub user: Option<UserSnapshot>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<String>,

    #[serde(rename = "fileInfo", default, skip_serializing_if = "Option::is_none")]
    pub file_info: Option<FileInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Client-supplied `user` objects are overwritten by the server, so a
/// malformed one must not reject the whole envelope.
fn lenient_user<'de, D>(deserializer: D) -> Result<Option<UserSnapshot>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: Some(content.into()),
            ..Self::default()
        }
    }

    /// Presence announcement (`online`/`offline`) for `user`.
    pub fn presence(kind: EnvelopeKind, user: &UserSnapshot, room_name: Option<&str>) -> Self {
        let content = match kind {
            EnvelopeKind::Offline => format!("{} went offline!", user.display_name()),
            _ => format!("{} is online!", user.display_name()),
        };
        let mut envelope = Self::new(kind, content);
        envelope.user = Some(user.clone());
        if let Some(room) = room_name {
            envelope.set_field("room_name", Value::String(room.to_string()));
        }
        envelope
    }

    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// String value of an uninterpreted field such as `receiver`.
    pub fn text_field(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }

    pub fn set_field(&mut self, key: &str, value: Value) {
        self.extra.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot() -> UserSnapshot {
        UserSnapshot {
            id: UserId(5),
            nickname: "ana".into(),
            email: "ana@example.com".into(),
            user_role: "user".into(),
            admin: false,
        }
    }

    #[test]
    fn test_missing_type_defaults_to_text() {
        let env = Envelope::from_text(r#"{"content":"hi"}"#).unwrap();
        assert_eq!(env.kind, EnvelopeKind::Text);
        assert_eq!(env.content.as_deref(), Some("hi"));
    }

    #[test]
    fn test_unknown_type_is_preserved() {
        let env = Envelope::from_text(r#"{"type":"sticker","content":"x"}"#).unwrap();
        assert_eq!(env.kind, EnvelopeKind::Other("sticker".into()));

        let out: Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(out["type"], "sticker");
    }

    #[test]
    fn test_extra_fields_round_trip() {
        let input = json!({
            "type": "ban",
            "receiver": "bob@example.com",
            "room_name": "general",
            "clientId": 7
        });
        let env: Envelope = serde_json::from_value(input.clone()).unwrap();
        assert_eq!(env.kind, EnvelopeKind::Ban);
        assert_eq!(env.text_field("receiver"), Some("bob@example.com"));
        assert_eq!(env.text_field("room_name"), Some("general"));

        let out: Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn test_malformed_client_user_is_ignored() {
        let env = Envelope::from_text(r#"{"type":"text","content":"hi","user":"me"}"#).unwrap();
        assert!(env.user.is_none());
    }

    #[test]
    fn test_file_info_uses_camel_case_key() {
        let mut env = Envelope::new(EnvelopeKind::Media, "");
        env.file_info = Some(FileInfo {
            filename: "cat.png".into(),
            extension: ".png".into(),
            category: FileCategory::Image,
            size: 3,
        });
        let out: Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(out["fileInfo"]["category"], "image");
        assert_eq!(out["fileInfo"]["size"], 3);
    }

    #[test]
    fn test_presence_envelopes() {
        let user = snapshot();
        let online = Envelope::presence(EnvelopeKind::Online, &user, Some("general"));
        assert_eq!(online.content.as_deref(), Some("ana is online!"));
        assert_eq!(online.text_field("room_name"), Some("general"));

        let offline = Envelope::presence(EnvelopeKind::Offline, &user, None);
        assert_eq!(offline.content.as_deref(), Some("ana went offline!"));
        assert!(offline.text_field("room_name").is_none());
    }

    #[test]
    fn test_display_name_fallback() {
        let mut user = snapshot();
        user.nickname = String::new();
        assert_eq!(user.display_name(), "User");
    }
}
