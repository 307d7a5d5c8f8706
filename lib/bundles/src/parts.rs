/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Part framing.
//!
//! Each part on the wire:
//!
//! ```text
//! u32 header-length (0 ends the bundle)
//! header: u8 name-len, name, u32 part-id,
//!         u8 mandatory-param-count, u8 advisory-param-count,
//!         (u8 key-len, u8 value-len)*, keys and values
//! chunks: u32 len, bytes ... u32 0
//! ```
//!
//! A chunk length with the high bit set announces an inline interrupt
//! part: its header (of the indicated size) and chunks are parsed out
//! of the middle of the surrounding part's payload stream.

use std::io::Read;
use std::io::Write;

use byteorder::BigEndian;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::BundleError;
use crate::CHUNK_SIZE;
use crate::MAGIC;

/// Everything after magic and params, optionally zlib-wrapped
/// (`compression=zlib` stream parameter).
enum OutStream<W: Write> {
    Plain(W),
    Zlib(ZlibEncoder<W>),
}

impl<W: Write> Write for OutStream<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            OutStream::Plain(w) => w.write(buf),
            OutStream::Zlib(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            OutStream::Plain(w) => w.flush(),
            OutStream::Zlib(w) => w.flush(),
        }
    }
}

enum InStream<R: Read> {
    Plain(R),
    Zlib(ZlibDecoder<R>),
}

impl<R: Read> Read for InStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            InStream::Plain(r) => r.read(buf),
            InStream::Zlib(r) => r.read(buf),
        }
    }
}

/// One decoded part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// Name as transmitted (case carries the mandatory bit).
    pub name: String,
    pub id: u32,
    pub mandatory_params: Vec<(String, String)>,
    pub advisory_params: Vec<(String, String)>,
    pub payload: Vec<u8>,
    /// Arrived as an inline interrupt inside another part.
    pub interrupt: bool,
}

impl Part {
    pub fn new(name: impl Into<String>, payload: Vec<u8>) -> Self {
        Part {
            name: name.into(),
            id: 0,
            mandatory_params: Vec::new(),
            advisory_params: Vec::new(),
            payload,
            interrupt: false,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.mandatory_params.push((key.into(), value.into()));
        self
    }

    pub fn with_advisory_param(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.advisory_params.push((key.into(), value.into()));
        self
    }

    /// Mark the part mandatory (uppercases the first letter on the
    /// wire).
    pub fn mandatory(mut self) -> Self {
        if let Some(first) = self.name.get(0..1) {
            let upper = first.to_ascii_uppercase();
            self.name.replace_range(0..1, &upper);
        }
        self
    }

    /// Mandatory parts carry at least one uppercase letter in their
    /// transmitted name.
    pub fn is_mandatory(&self) -> bool {
        self.name.bytes().any(|b| b.is_ascii_uppercase())
    }

    /// Canonical lowercase name for dispatch.
    pub fn canonical_name(&self) -> String {
        self.name.to_ascii_lowercase()
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.mandatory_params
            .iter()
            .chain(&self.advisory_params)
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Streaming writer.
pub struct BundleWriter<W: Write> {
    out: OutStream<W>,
    next_id: u32,
    finished: bool,
}

impl<W: Write> BundleWriter<W> {
    /// Start a bundle. `params` land in the stream-level parameter
    /// blob, space-separated `key=value` with `%`-escaping. A
    /// `compression=zlib` param switches the part stream (not the
    /// header) to zlib.
    pub fn new(mut out: W, params: &[(&str, &str)]) -> Result<Self, BundleError> {
        out.write_all(MAGIC)?;
        let blob = encode_params(params);
        out.write_u32::<BigEndian>(blob.len() as u32)?;
        out.write_all(&blob)?;
        let compress = params
            .iter()
            .any(|(k, v)| *k == "compression" && *v == "zlib");
        let out = if compress {
            OutStream::Zlib(ZlibEncoder::new(out, Compression::default()))
        } else {
            OutStream::Plain(out)
        };
        Ok(BundleWriter {
            out,
            next_id: 0,
            finished: false,
        })
    }

    /// Write one part. The part id is assigned here and returned (for
    /// pairing `reply:` parts).
    pub fn add_part(&mut self, mut part: Part) -> Result<u32, BundleError> {
        assert!(!self.finished, "bundle already finished");
        part.id = self.next_id;
        self.next_id += 1;

        let header = encode_part_header(&part)?;
        self.out.write_u32::<BigEndian>(header.len() as u32)?;
        self.out.write_all(&header)?;
        for chunk in part.payload.chunks(CHUNK_SIZE) {
            self.out.write_u32::<BigEndian>(chunk.len() as u32)?;
            self.out.write_all(chunk)?;
        }
        self.out.write_u32::<BigEndian>(0)?;
        tracing::trace!(name = %part.name, id = part.id, bytes = part.payload.len(), "bundle part written");
        Ok(part.id)
    }

    /// Terminate the part stream. Must be called exactly once.
    pub fn finish(mut self) -> Result<W, BundleError> {
        self.out.write_u32::<BigEndian>(0)?;
        self.finished = true;
        match self.out {
            OutStream::Plain(w) => Ok(w),
            OutStream::Zlib(w) => Ok(w.finish()?),
        }
    }
}

fn encode_params(params: &[(&str, &str)]) -> Vec<u8> {
    let mut blob = String::new();
    for (i, (key, value)) in params.iter().enumerate() {
        if i > 0 {
            blob.push(' ');
        }
        blob.push_str(&escape_param(key));
        if !value.is_empty() {
            blob.push('=');
            blob.push_str(&escape_param(value));
        }
    }
    blob.into_bytes()
}

fn escape_param(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' => out.push_str("%25"),
            ' ' => out.push_str("%20"),
            '=' => out.push_str("%3d"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape_param(s: &str) -> Result<String, BundleError> {
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let value = s
                .get(i + 1..i + 3)
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| BundleError::Malformed(format!("bad escape in {:?}", s)))?;
            out.push(value as char);
            i += 3;
        } else {
            let c = s[i..].chars().next().unwrap();
            out.push(c);
            i += c.len_utf8();
        }
    }
    Ok(out)
}

fn encode_part_header(part: &Part) -> Result<Vec<u8>, BundleError> {
    let mut header = Vec::new();
    if part.name.len() > u8::MAX as usize {
        return Err(BundleError::Malformed("part name too long".to_string()));
    }
    header.push(part.name.len() as u8);
    header.extend_from_slice(part.name.as_bytes());
    header.write_u32::<BigEndian>(part.id)?;
    let mandatory = part.mandatory_params.len();
    let advisory = part.advisory_params.len();
    if mandatory > u8::MAX as usize || advisory > u8::MAX as usize {
        return Err(BundleError::Malformed("too many part parameters".to_string()));
    }
    header.push(mandatory as u8);
    header.push(advisory as u8);
    let all = part.mandatory_params.iter().chain(&part.advisory_params);
    for (key, value) in all.clone() {
        if key.len() > u8::MAX as usize || value.len() > u8::MAX as usize {
            return Err(BundleError::Malformed("part parameter too long".to_string()));
        }
        header.push(key.len() as u8);
        header.push(value.len() as u8);
    }
    for (key, value) in all {
        header.extend_from_slice(key.as_bytes());
        header.extend_from_slice(value.as_bytes());
    }
    Ok(header)
}

/// Streaming reader: magic and params at construction, then
/// [`BundleReader::next_part`] until `None`.
pub struct BundleReader<R: Read> {
    input: InStream<R>,
    params: Vec<(String, String)>,
    done: bool,
    /// Interrupt parts read from inside a payload, delivered before
    /// further regular parts.
    pending_interrupts: Vec<Part>,
}

impl<R: Read> BundleReader<R> {
    pub fn new(mut input: R) -> Result<Self, BundleError> {
        let mut magic = [0u8; 4];
        input.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(BundleError::BadMagic(magic.to_vec()));
        }
        let params_len = input.read_u32::<BigEndian>()? as usize;
        let mut blob = vec![0u8; params_len];
        input.read_exact(&mut blob)?;
        let params = decode_params(&blob)?;
        let compressed = params
            .iter()
            .any(|(k, v)| k == "compression" && v == "zlib");
        let input = if compressed {
            InStream::Zlib(ZlibDecoder::new(input))
        } else {
            InStream::Plain(input)
        };
        Ok(BundleReader {
            input,
            params,
            done: false,
            pending_interrupts: Vec::new(),
        })
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The next part, or `None` at the end-of-bundle marker.
    pub fn next_part(&mut self) -> Result<Option<Part>, BundleError> {
        if let Some(interrupt) = self.pending_interrupts.pop() {
            return Ok(Some(interrupt));
        }
        if self.done {
            return Ok(None);
        }
        let header_len = self.input.read_u32::<BigEndian>()? as usize;
        if header_len == 0 {
            self.done = true;
            return Ok(None);
        }
        let mut header = vec![0u8; header_len];
        self.input.read_exact(&mut header)?;
        let mut part = decode_part_header(&header)?;
        let (payload, interrupts) = self.read_chunks()?;
        part.payload = payload;
        self.pending_interrupts = interrupts;
        self.pending_interrupts.reverse();
        Ok(Some(part))
    }

    /// Read payload chunks up to the zero terminator, collecting any
    /// inline interrupt parts.
    fn read_chunks(&mut self) -> Result<(Vec<u8>, Vec<Part>), BundleError> {
        let mut payload = Vec::new();
        let mut interrupts = Vec::new();
        loop {
            let raw = self.input.read_u32::<BigEndian>()?;
            if raw == 0 {
                return Ok((payload, interrupts));
            }
            if raw & 0x8000_0000 != 0 {
                // Interrupt: the low bits give the inline header size.
                let header_len = (!raw).wrapping_add(1) as usize;
                let mut header = vec![0u8; header_len];
                self.input.read_exact(&mut header)?;
                let mut part = decode_part_header(&header)?;
                part.interrupt = true;
                let (inline_payload, nested) = self.read_chunks()?;
                if !nested.is_empty() {
                    return Err(BundleError::Malformed(
                        "nested interrupt parts".to_string(),
                    ));
                }
                part.payload = inline_payload;
                interrupts.push(part);
                continue;
            }
            let len = raw as usize;
            let start = payload.len();
            payload.resize(start + len, 0);
            self.input.read_exact(&mut payload[start..])?;
        }
    }
}

fn decode_params(blob: &[u8]) -> Result<Vec<(String, String)>, BundleError> {
    let text = std::str::from_utf8(blob)
        .map_err(|_| BundleError::Malformed("params are not utf-8".to_string()))?;
    let mut params = Vec::new();
    for word in text.split(' ').filter(|w| !w.is_empty()) {
        match word.split_once('=') {
            Some((key, value)) => {
                params.push((unescape_param(key)?, unescape_param(value)?));
            }
            None => params.push((unescape_param(word)?, String::new())),
        }
    }
    Ok(params)
}

fn decode_part_header(header: &[u8]) -> Result<Part, BundleError> {
    let mut pos = 0usize;
    let take = |pos: &mut usize, n: usize| -> Result<&[u8], BundleError> {
        if *pos + n > header.len() {
            return Err(BundleError::Malformed("truncated part header".to_string()));
        }
        let slice = &header[*pos..*pos + n];
        *pos += n;
        Ok(slice)
    };
    let name_len = take(&mut pos, 1)?[0] as usize;
    let name = String::from_utf8(take(&mut pos, name_len)?.to_vec())
        .map_err(|_| BundleError::Malformed("part name is not utf-8".to_string()))?;
    let id_bytes = take(&mut pos, 4)?;
    let id = u32::from_be_bytes([id_bytes[0], id_bytes[1], id_bytes[2], id_bytes[3]]);
    let mandatory_count = take(&mut pos, 1)?[0] as usize;
    let advisory_count = take(&mut pos, 1)?[0] as usize;
    let mut sizes = Vec::with_capacity(mandatory_count + advisory_count);
    for _ in 0..mandatory_count + advisory_count {
        let pair = take(&mut pos, 2)?;
        sizes.push((pair[0] as usize, pair[1] as usize));
    }
    let mut params = Vec::with_capacity(sizes.len());
    for (key_len, value_len) in sizes {
        let key = String::from_utf8(take(&mut pos, key_len)?.to_vec())
            .map_err(|_| BundleError::Malformed("param key is not utf-8".to_string()))?;
        let value = String::from_utf8(take(&mut pos, value_len)?.to_vec())
            .map_err(|_| BundleError::Malformed("param value is not utf-8".to_string()))?;
        params.push((key, value));
    }
    let advisory_params = params.split_off(mandatory_count);
    Ok(Part {
        name,
        id,
        mandatory_params: params,
        advisory_params,
        payload: Vec::new(),
        interrupt: false,
    })
}
