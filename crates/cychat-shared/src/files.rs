//! Attachment classification: extension resolution, category lookup and
//! the static MIME table used when serving stored files.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_FILE_EXTENSION, DEFAULT_IMAGE_EXTENSION};

const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".webp", ".bmp", ".svg"];
const DOCUMENT_EXTENSIONS: &[&str] = &[
    ".pdf", ".doc", ".docx", ".xls", ".xlsx", ".ppt", ".pptx", ".txt", ".rtf", ".odt",
];
const VIDEO_EXTENSIONS: &[&str] = &[".mp4", ".avi", ".mov", ".wmv", ".flv", ".webm", ".mkv"];
const AUDIO_EXTENSIONS: &[&str] = &[".mp3", ".wav", ".ogg", ".flac", ".aac", ".m4a"];
const ARCHIVE_EXTENSIONS: &[&str] = &[".zip", ".rar", ".7z", ".tar", ".gz"];
const CODE_EXTENSIONS: &[&str] = &[
    ".py", ".js", ".ts", ".html", ".css", ".json", ".xml", ".yaml", ".yml", ".md",
];

/// Coarse kind of an attachment, derived from its extension only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FileCategory {
    Image,
    Document,
    Video,
    Audio,
    Archive,
    Code,
    File,
}

impl FileCategory {
    /// Classify a dotted extension such as `.PNG`; case-insensitive.
    pub fn from_extension(extension: &str) -> Self {
        let ext = extension.to_ascii_lowercase();
        let ext = ext.as_str();
        if IMAGE_EXTENSIONS.contains(&ext) {
            Self::Image
        } else if DOCUMENT_EXTENSIONS.contains(&ext) {
            Self::Document
        } else if VIDEO_EXTENSIONS.contains(&ext) {
            Self::Video
        } else if AUDIO_EXTENSIONS.contains(&ext) {
            Self::Audio
        } else if ARCHIVE_EXTENSIONS.contains(&ext) {
            Self::Archive
        } else if CODE_EXTENSIONS.contains(&ext) {
            Self::Code
        } else {
            Self::File
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Document => "document",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Archive => "archive",
            Self::Code => "code",
            Self::File => "file",
        }
    }
}

impl fmt::Display for FileCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dotted, lower-cased extension for a stored attachment.
///
/// * original name with an extension -> that extension
/// * original name without one (or empty) -> [`DEFAULT_FILE_EXTENSION`]
/// * no original name -> [`DEFAULT_IMAGE_EXTENSION`]
pub fn resolve_extension(original_filename: Option<&str>) -> String {
    match original_filename {
        Some(name) => match Path::new(name).extension().and_then(|e| e.to_str()) {
            Some(ext) if !ext.is_empty() => format!(".{}", ext.to_ascii_lowercase()),
            _ => DEFAULT_FILE_EXTENSION.to_string(),
        },
        None => DEFAULT_IMAGE_EXTENSION.to_string(),
    }
}

/// MIME type from the static table, keyed on the filename's extension.
pub fn static_mime_type(filename: &str) -> Option<&'static str> {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())?
        .to_ascii_lowercase();

    let mime = match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "txt" => "text/plain",
        "rtf" => "application/rtf",
        "odt" => "application/vnd.oasis.opendocument.text",
        "mp4" => "video/mp4",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "wmv" => "video/x-ms-wmv",
        "flv" => "video/x-flv",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        "aac" => "audio/aac",
        "m4a" => "audio/mp4",
        "zip" => "application/zip",
        "rar" => "application/vnd.rar",
        "7z" => "application/x-7z-compressed",
        "tar" => "application/x-tar",
        "gz" => "application/gzip",
        "py" => "text/x-python",
        "js" => "text/javascript",
        "ts" => "text/typescript",
        "html" => "text/html",
        "css" => "text/css",
        "json" => "application/json",
        "xml" => "application/xml",
        "yaml" | "yml" => "text/yaml",
        "md" => "text/markdown",
        _ => return None,
    };
    Some(mime)
}
