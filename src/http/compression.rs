//! Gzip support for response bodies.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};

/// Bodies smaller than this are not worth compressing.
pub const DEFAULT_MIN_SIZE: usize = 1024;

/// Default zlib compression level.
pub const DEFAULT_LEVEL: u32 = 6;

/// Content-type prefixes eligible for compression.
pub const COMPRESSIBLE_PREFIXES: &[&str] = &[
    "text/",
    "application/json",
    "application/javascript",
    "application/xml",
];

pub fn gzip_compress(data: &[u8], level: u32) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(level.min(9)));
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn gzip_decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Case-insensitive substring match on `Accept-Encoding`.
pub fn supports_gzip(accept_encoding: &str) -> bool {
    accept_encoding.to_ascii_lowercase().contains("gzip")
}

/// Splits an `Accept-Encoding` value into coding names, dropping q-values.
pub fn parse_accept_encoding(accept_encoding: &str) -> Vec<String> {
    accept_encoding
        .split(',')
        .filter_map(|token| {
            let coding = token.split(';').next().unwrap_or("").trim();
            (!coding.is_empty()).then(|| coding.to_string())
        })
        .collect()
}

pub fn is_compressible(content_type: &str) -> bool {
    COMPRESSIBLE_PREFIXES
        .iter()
        .any(|prefix| content_type.starts_with(prefix))
}
