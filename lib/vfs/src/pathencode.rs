/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Store path encoding.
//!
//! Filelog paths are mapped to filesystem locations by an injective,
//! case-insensitivity-safe codec: lowercase ASCII passes through,
//! uppercase is `_`-escaped (`_` itself doubles), control bytes,
//! non-ASCII and Windows-special bytes become `~XX`, and reserved
//! basenames get their third byte hex-escaped. Paths whose encoded form
//! exceeds [`MAX_ENCODED_LEN`] switch to a hashed layout (`dh/...`)
//! that stays injective via a full content hash but is not decodable;
//! the fncache maps those back to real names.

use sha1::Digest;
use sha1::Sha1;
use thiserror::Error;

/// Longest encoded path stored without hashing.
pub const MAX_ENCODED_LEN: usize = 120;

/// Directory prefix of hashed encodings.
const HASHED_PREFIX: &str = "dh/";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathEncodeError {
    #[error("malformed encoded path: {0}")]
    Malformed(String),

    #[error("hashed path cannot be decoded: {0}")]
    Hashed(String),
}

/// Bytes that are unsafe on some supported filesystem, plus `~` itself
/// so that `~XX` sequences in original names cannot forge escapes.
fn needs_hex_escape(byte: u8) -> bool {
    matches!(byte, 0..=0x1f | 0x7e..=0xff | b'\\' | b':' | b'*' | b'?' | b'"' | b'<' | b'>' | b'|')
}

fn push_hex(out: &mut String, byte: u8) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    out.push('~');
    out.push(HEX[(byte >> 4) as usize] as char);
    out.push(HEX[(byte & 0xf) as usize] as char);
}

/// Encode one path component, without the reserved-name pass.
fn encode_component_bytes(component: &[u8], out: &mut String) {
    for &byte in component {
        match byte {
            b'_' => out.push_str("__"),
            b'A'..=b'Z' => {
                out.push('_');
                out.push(byte.to_ascii_lowercase() as char);
            }
            _ if needs_hex_escape(byte) => push_hex(out, byte),
            _ => out.push(byte as char),
        }
    }
}

/// Escape a reserved basename (`con` -> `co~6e`) after the main pass.
/// Operates on the already-encoded component, which is safe because
/// reserved names are all lowercase ASCII and pass through verbatim.
fn escape_reserved(encoded: &str) -> String {
    let base_len = encoded.find('.').unwrap_or(encoded.len());
    let base = &encoded[..base_len];
    let reserved = matches!(base, "con" | "prn" | "aux" | "nul")
        || (base.len() == 4
            && (base.starts_with("com") || base.starts_with("lpt"))
            && base.as_bytes()[3].is_ascii_digit());
    if reserved {
        let mut out = String::with_capacity(encoded.len() + 2);
        out.push_str(&encoded[..2]);
        push_hex(&mut out, encoded.as_bytes()[2]);
        out.push_str(&encoded[3..]);
        out
    } else {
        encoded.to_string()
    }
}

/// Encode a repo path for storage. Always succeeds; long results fall
/// back to the hashed layout.
pub fn encode(path: &str) -> String {
    let mut encoded = String::with_capacity(path.len() * 2);
    for (i, component) in path.split('/').enumerate() {
        if i > 0 {
            encoded.push('/');
        }
        let mut enc = String::with_capacity(component.len() * 2);
        encode_component_bytes(component.as_bytes(), &mut enc);
        encoded.push_str(&escape_reserved(&enc));
    }
    if encoded.len() <= MAX_ENCODED_LEN {
        encoded
    } else {
        hashed_encode(path, &encoded)
    }
}

/// The hashed layout: keep a readable truncated prefix for humans, and
/// append the sha1 of the original path for injectivity.
fn hashed_encode(path: &str, encoded: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(path.as_bytes());
    let digest: [u8; 20] = hasher.finalize().into();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();

    // Truncate on a character boundary that does not split an escape.
    let keep = MAX_ENCODED_LEN - HASHED_PREFIX.len() - hex.len() - 1;
    let mut cut = keep.min(encoded.len());
    while cut > 0 && !encoded.is_char_boundary(cut) {
        cut -= 1;
    }
    // Do not end inside a `~XX` or `_x` escape.
    let prefix = &encoded[..cut];
    let trimmed = trim_partial_escape(prefix);
    format!("{}{}~{}", HASHED_PREFIX, trimmed, hex)
}

fn trim_partial_escape(s: &str) -> &str {
    let bytes = s.as_bytes();
    if bytes.last() == Some(&b'~') {
        return &s[..s.len() - 1];
    }
    if bytes.len() >= 2 && bytes[bytes.len() - 2] == b'~' {
        return &s[..s.len() - 2];
    }
    if bytes.last() == Some(&b'_') && !s.ends_with("__") {
        return &s[..s.len() - 1];
    }
    s
}

/// Decode a non-hashed encoded path back to the repo path.
pub fn decode(encoded: &str) -> Result<String, PathEncodeError> {
    if encoded.starts_with(HASHED_PREFIX) {
        return Err(PathEncodeError::Hashed(encoded.to_string()));
    }
    let mut out: Vec<u8> = Vec::with_capacity(encoded.len());
    let bytes = encoded.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => {
                let next = *bytes.get(i + 1).ok_or_else(|| {
                    PathEncodeError::Malformed(encoded.to_string())
                })?;
                match next {
                    b'_' => out.push(b'_'),
                    b'a'..=b'z' => out.push(next.to_ascii_uppercase()),
                    _ => return Err(PathEncodeError::Malformed(encoded.to_string())),
                }
                i += 2;
            }
            b'~' => {
                if i + 2 >= bytes.len() {
                    return Err(PathEncodeError::Malformed(encoded.to_string()));
                }
                let hi = hex_value(bytes[i + 1], encoded)?;
                let lo = hex_value(bytes[i + 2], encoded)?;
                out.push((hi << 4) | lo);
                i += 3;
            }
            b if b.is_ascii() => {
                out.push(b);
                i += 1;
            }
            _ => return Err(PathEncodeError::Malformed(encoded.to_string())),
        }
    }
    String::from_utf8(out).map_err(|_| PathEncodeError::Malformed(encoded.to_string()))
}

fn hex_value(byte: u8, context: &str) -> Result<u8, PathEncodeError> {
    match byte {
        b'0'..=b'9' => Ok(byte - b'0'),
        b'a'..=b'f' => Ok(byte - b'a' + 10),
        _ => Err(PathEncodeError::Malformed(context.to_string())),
    }
}
