/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! The changegroup: history serialized for transfer.
//!
//! Sections in order: changelog entries, manifest entries, then one
//! section per touched file (filename chunk first). Each entry is
//!
//! ```text
//! [node 20][p1 20][p2 20][link-node 20][delta-base 20][delta bytes]
//! ```
//!
//! delivered as one length-prefixed chunk; a zero-length chunk closes a
//! section, and a second zero closes the file-section list. A
//! delta-base of the null node means the delta applies against empty
//! bytes (a full snapshot).

use std::io::Read;
use std::io::Write;

use byteorder::BigEndian;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;
use types::Node;
use types::RepoPathBuf;

use crate::BundleError;

const ENTRY_HEADER_LEN: usize = 100;

/// One revlog entry on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub node: Node,
    pub p1: Node,
    pub p2: Node,
    /// Changelog node that introduced this entry.
    pub link_node: Node,
    /// Node the delta applies against; null = empty base.
    pub delta_base: Node,
    pub delta: Vec<u8>,
}

/// A decoded changegroup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changegroup {
    pub changelog: Vec<Entry>,
    pub manifests: Vec<Entry>,
    pub files: Vec<(RepoPathBuf, Vec<Entry>)>,
}

impl Changegroup {
    pub fn is_empty(&self) -> bool {
        self.changelog.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>, BundleError> {
        let mut out = Vec::new();
        write_section(&mut out, &self.changelog)?;
        write_section(&mut out, &self.manifests)?;
        for (path, entries) in &self.files {
            write_chunk(&mut out, path.as_bytes())?;
            write_section(&mut out, entries)?;
        }
        out.write_u32::<BigEndian>(0)?;
        Ok(out)
    }

    pub fn decode(mut input: impl Read) -> Result<Self, BundleError> {
        let changelog = read_section(&mut input)?;
        let manifests = read_section(&mut input)?;
        let mut files = Vec::new();
        loop {
            let name = match read_chunk(&mut input)? {
                None => break,
                Some(name) => name,
            };
            let path = RepoPathBuf::from_utf8(name)
                .map_err(|e| BundleError::Malformed(e.to_string()))?;
            let entries = read_section(&mut input)?;
            files.push((path, entries));
        }
        Ok(Changegroup {
            changelog,
            manifests,
            files,
        })
    }
}

fn write_section(out: &mut Vec<u8>, entries: &[Entry]) -> Result<(), BundleError> {
    for entry in entries {
        let mut chunk = Vec::with_capacity(ENTRY_HEADER_LEN + entry.delta.len());
        chunk.extend_from_slice(entry.node.as_bytes());
        chunk.extend_from_slice(entry.p1.as_bytes());
        chunk.extend_from_slice(entry.p2.as_bytes());
        chunk.extend_from_slice(entry.link_node.as_bytes());
        chunk.extend_from_slice(entry.delta_base.as_bytes());
        chunk.extend_from_slice(&entry.delta);
        write_chunk(out, &chunk)?;
    }
    out.write_u32::<BigEndian>(0)?;
    Ok(())
}

fn read_section(input: &mut impl Read) -> Result<Vec<Entry>, BundleError> {
    let mut entries = Vec::new();
    while let Some(chunk) = read_chunk(input)? {
        if chunk.len() < ENTRY_HEADER_LEN {
            return Err(BundleError::Malformed(format!(
                "changegroup entry of {} bytes",
                chunk.len()
            )));
        }
        let node_at = |i: usize| {
            Node::from_slice(&chunk[i * 20..(i + 1) * 20]).expect("20-byte slice")
        };
        entries.push(Entry {
            node: node_at(0),
            p1: node_at(1),
            p2: node_at(2),
            link_node: node_at(3),
            delta_base: node_at(4),
            delta: chunk[ENTRY_HEADER_LEN..].to_vec(),
        });
    }
    Ok(entries)
}

fn write_chunk(out: &mut Vec<u8>, data: &[u8]) -> Result<(), BundleError> {
    out.write_u32::<BigEndian>(data.len() as u32)?;
    out.write_all(data)?;
    Ok(())
}

/// `None` for the zero-length section terminator.
fn read_chunk(input: &mut impl Read) -> Result<Option<Vec<u8>>, BundleError> {
    let len = input.read_u32::<BigEndian>()? as usize;
    if len == 0 {
        return Ok(None);
    }
    let mut data = vec![0u8; len];
    input.read_exact(&mut data)?;
    Ok(Some(data))
}
