//! Validators for conditional GET: ETags and HTTP dates.

use chrono::{DateTime, Utc};
use sha1::{Digest, Sha1};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Opaque content tag: the first 8 bytes of a SHA-1 digest, hex encoded.
pub fn generate_etag(content: &[u8]) -> String {
    let digest = Sha1::digest(content);
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// Tag derived from a file's path, size and modification time, so the file
/// body never has to be read to compute it.
pub fn file_etag(path: &Path, size: u64, modified: SystemTime) -> String {
    let nanos = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    generate_etag(format!("{}{}{}", path.display(), size, nanos).as_bytes())
}

pub fn generate_file_etag(path: &Path) -> Option<String> {
    let meta = std::fs::metadata(path).ok()?;
    let modified = meta.modified().unwrap_or(UNIX_EPOCH);
    Some(file_etag(path, meta.len(), modified))
}

/// Matches `etag` against an `If-None-Match` value.
///
/// `*` matches anything. Otherwise the value is a comma-separated list and
/// each entry is compared after stripping a leading `W/` from both sides.
pub fn etag_matches(etag: &str, if_none_match: &str) -> bool {
    let if_none_match = if_none_match.trim();
    if if_none_match == "*" {
        return true;
    }

    let wanted = strip_weak(etag);
    if_none_match
        .split(',')
        .map(str::trim)
        .any(|candidate| candidate == etag || strip_weak(candidate) == wanted)
}

fn strip_weak(tag: &str) -> &str {
    tag.strip_prefix("W/").unwrap_or(tag)
}

/// RFC 1123 date, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn format_http_time(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

pub fn parse_http_time(value: &str) -> Option<SystemTime> {
    let parsed = DateTime::parse_from_rfc2822(value.trim()).ok()?;
    let secs = u64::try_from(parsed.timestamp()).ok()?;
    Some(UNIX_EPOCH + Duration::from_secs(secs))
}

/// HTTP dates carry whole seconds; comparisons must drop the fraction.
pub fn truncate_to_secs(time: SystemTime) -> SystemTime {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    UNIX_EPOCH + Duration::from_secs(secs)
}
