//! MIME type detection based on file extensions.

use std::path::Path;

/// Fallback for unknown or missing extensions.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Maps a file extension (without the dot, any case) to a MIME type.
///
/// # Example
///
/// ```
/// # use lantern::http::mime::mime_type_for_extension;
/// assert_eq!(mime_type_for_extension("HTML"), "text/html");
/// assert_eq!(mime_type_for_extension("unknown"), "application/octet-stream");
/// ```
pub fn mime_type_for_extension(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "txt" => "text/plain",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "eot" => "application/vnd.ms-fontobject",
        _ => DEFAULT_MIME_TYPE,
    }
}

pub fn mime_type_for_path(path: &Path) -> &'static str {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(mime_type_for_extension)
        .unwrap_or(DEFAULT_MIME_TYPE)
}
