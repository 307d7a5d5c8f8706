/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Per-chunk compression.
//!
//! Every stored chunk is compressed independently and self-describing:
//! the first byte selects the algorithm. `x` (the zlib header byte) is
//! zlib, `u` is an explicit "stored raw" marker, an empty chunk stands
//! for the empty payload, and a leading NUL is raw data stored as-is
//! (NUL never begins a zlib stream or a `u` chunk). Other leading bytes
//! are reserved for extensions.

use std::io::Read;
use std::io::Write;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::errors::RevlogError;

/// Compress a chunk for storage. Picks whichever representation is
/// smallest; never fails.
pub fn compress(data: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    let compressed = encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .ok();
    match compressed {
        Some(z) if z.len() < data.len() => z,
        _ => {
            if data[0] == 0 {
                data.to_vec()
            } else {
                let mut out = Vec::with_capacity(data.len() + 1);
                out.push(b'u');
                out.extend_from_slice(data);
                out
            }
        }
    }
}

/// Undo [`compress`].
pub fn decompress(chunk: &[u8]) -> Result<Vec<u8>, RevlogError> {
    match chunk.first() {
        None => Ok(Vec::new()),
        Some(b'u') => Ok(chunk[1..].to_vec()),
        Some(0) => Ok(chunk.to_vec()),
        Some(b'x') => {
            let mut out = Vec::with_capacity(chunk.len() * 3);
            ZlibDecoder::new(chunk)
                .read_to_end(&mut out)
                .map_err(|e| RevlogError::Corrupt(format!("zlib: {}", e)))?;
            Ok(out)
        }
        Some(other) => Err(RevlogError::Corrupt(format!(
            "unknown compression marker {:#04x}",
            other
        ))),
    }
}
