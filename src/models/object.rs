//! Represents a stored object (file) addressed by its virtual path.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Metadata of a file in the local tier.
///
/// The same slash-delimited path is the relative filesystem path under the
/// local root and, once encoded, the object key in the bucket. Directories are
/// implicit prefixes and never appear as objects.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    /// Canonical path: no leading or trailing slash.
    pub path: String,

    /// Size in bytes.
    pub size_bytes: u64,

    /// Hex MD5 of the content, only known right after a write.
    pub etag: Option<String>,

    /// Filesystem modification time.
    pub last_modified: DateTime<Utc>,
}

/// Metadata reported by the cloud tier for one object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: String,
    pub size_bytes: u64,
    /// Unquoted ETag.
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub content_type: Option<String>,
}

impl RemoteObject {
    /// True when the remote copy has the given MD5 hex digest and length.
    pub fn matches(&self, md5_hex: &str, size_bytes: u64) -> bool {
        self.size_bytes == size_bytes
            && self
                .etag
                .as_deref()
                .is_some_and(|etag| etag.eq_ignore_ascii_case(md5_hex))
    }
}

/// Strip the surrounding quotes S3 puts around ETags.
pub fn unquote_etag(raw: &str) -> String {
    raw.trim().trim_matches('"').to_string()
}

/// Infer a MIME type from the path's extension.
pub fn content_type_for(path: &str) -> &'static str {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    let extension = match file_name.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return "application/octet-stream",
    };
    match extension.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" | "map" => "application/json",
        "txt" | "md" => "text/plain; charset=utf-8",
        "csv" => "text/csv; charset=utf-8",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "wasm" => "application/wasm",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" | "tgz" => "application/gzip",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_uses_last_extension() {
        assert_eq!(content_type_for("a/b/index.HTML"), "text/html; charset=utf-8");
        assert_eq!(content_type_for("bundle.min.js"), "text/javascript; charset=utf-8");
        assert_eq!(content_type_for("dir.v2/README"), "application/octet-stream");
        assert_eq!(content_type_for("game.wasm"), "application/wasm");
    }

    #[test]
    fn remote_match_requires_digest_and_length() {
        let remote = RemoteObject {
            key: "k".into(),
            size_bytes: 5,
            etag: Some(unquote_etag("\"5D41402ABC4B2A76B9719D911017C592\"")),
            last_modified: None,
            content_type: None,
        };
        assert!(remote.matches("5d41402abc4b2a76b9719d911017c592", 5));
        assert!(!remote.matches("5d41402abc4b2a76b9719d911017c592", 6));
        assert!(!remote.matches("00000000000000000000000000000000", 5));
    }
}
