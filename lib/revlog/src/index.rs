/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! The revlog index: fixed 64-byte records, one per rev.
//!
//! Record layout (big-endian): u48 data-offset, u16 flags,
//! u32 compressed-length, u32 uncompressed-length, i32 base-rev,
//! i32 link-rev, i32 p1-rev, i32 p2-rev, 32 bytes of node (20
//! significant, zero-padded). The first record doubles as the header:
//! its offset field carries the version word (the real offset of rev 0
//! is always 0).

use std::collections::HashMap;

use bitflags::bitflags;
use byteorder::BigEndian;
use byteorder::ByteOrder;
use types::Node;
use types::Rev;
use types::NULL_REV;

use crate::errors::RevlogError;

pub const RECORD_LEN: usize = 64;

/// Format version stored in the low 16 bits of the version word.
pub const VERSION: u32 = 1;

/// Version word flag: data interleaved with the index.
pub const FLAG_INLINE_DATA: u32 = 1 << 16;

/// Version word flag: base-rev may be any earlier rev. Always set by
/// this implementation; required on open.
pub const FLAG_GENERAL_DELTA: u32 = 1 << 17;

bitflags! {
    /// Per-rev flags (the u16 in each record).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RevFlags: u16 {
        /// Payload replaced by zeros; node preserved.
        const CENSORED = 1 << 15;
        /// Payload carries external metadata before the content.
        const EXTMETA = 1 << 14;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Logical offset of the chunk in the data stream.
    pub offset: u64,
    pub flags: RevFlags,
    pub compressed_len: u32,
    pub uncompressed_len: u32,
    pub base_rev: Rev,
    pub link_rev: Rev,
    pub p1_rev: Rev,
    pub p2_rev: Rev,
    pub node: Node,
}

impl IndexEntry {
    pub fn serialize(&self, rev: Rev, version_word: u32) -> [u8; RECORD_LEN] {
        let mut record = [0u8; RECORD_LEN];
        let offset = if rev == 0 {
            version_word as u64
        } else {
            self.offset
        };
        // u48 offset: high 6 bytes of a u64.
        record[0] = (offset >> 40) as u8;
        record[1] = (offset >> 32) as u8;
        BigEndian::write_u32(&mut record[2..6], offset as u32);
        BigEndian::write_u16(&mut record[6..8], self.flags.bits());
        BigEndian::write_u32(&mut record[8..12], self.compressed_len);
        BigEndian::write_u32(&mut record[12..16], self.uncompressed_len);
        BigEndian::write_i32(&mut record[16..20], self.base_rev);
        BigEndian::write_i32(&mut record[20..24], self.link_rev);
        BigEndian::write_i32(&mut record[24..28], self.p1_rev);
        BigEndian::write_i32(&mut record[28..32], self.p2_rev);
        // Node left-padded with zeros to 32 bytes.
        record[32..52].copy_from_slice(self.node.as_bytes());
        record
    }

    pub fn deserialize(record: &[u8], rev: Rev) -> Result<Self, RevlogError> {
        debug_assert!(record.len() >= RECORD_LEN);
        let offset = ((record[0] as u64) << 40)
            | ((record[1] as u64) << 32)
            | (BigEndian::read_u32(&record[2..6]) as u64);
        let offset = if rev == 0 { 0 } else { offset };
        let raw_flags = BigEndian::read_u16(&record[6..8]);
        let flags = RevFlags::from_bits(raw_flags).ok_or_else(|| {
            RevlogError::Corrupt(format!("rev {}: unknown flags {:#06x}", rev, raw_flags))
        })?;
        Ok(IndexEntry {
            offset,
            flags,
            compressed_len: BigEndian::read_u32(&record[8..12]),
            uncompressed_len: BigEndian::read_u32(&record[12..16]),
            base_rev: BigEndian::read_i32(&record[16..20]),
            link_rev: BigEndian::read_i32(&record[20..24]),
            p1_rev: BigEndian::read_i32(&record[24..28]),
            p2_rev: BigEndian::read_i32(&record[28..32]),
            node: Node::from_slice(&record[32..52])
                .expect("20-byte slice always forms a node"),
        })
    }
}

/// Parsed view of an index file.
pub struct Index {
    entries: Vec<IndexEntry>,
    /// node -> rev, rebuilt on open and maintained on append.
    nodemap: HashMap<Node, Rev>,
    version_word: u32,
    /// True if a trailing partial record was ignored on open (a
    /// crashed transaction's tail; recovery truncates it).
    pub truncated_tail: bool,
    /// Physical offset in the index file where each rev's record
    /// starts. Only interesting for inline revlogs, where records and
    /// chunks interleave.
    record_offsets: Vec<u64>,
}

impl Index {
    pub fn empty(inline: bool) -> Self {
        let version_word = VERSION | FLAG_GENERAL_DELTA | if inline { FLAG_INLINE_DATA } else { 0 };
        Index {
            entries: Vec::new(),
            nodemap: HashMap::new(),
            version_word,
            truncated_tail: false,
            record_offsets: Vec::new(),
        }
    }

    /// Parse index bytes. For inline revlogs each record is followed by
    /// its data chunk; otherwise records are densely packed.
    pub fn parse(data: &[u8]) -> Result<Self, RevlogError> {
        if data.is_empty() {
            // A missing or empty index is an empty revlog; the version
            // word is fixed on the first append.
            return Ok(Index::empty(true));
        }
        if data.len() < RECORD_LEN {
            return Ok(Index {
                truncated_tail: true,
                ..Index::empty(true)
            });
        }
        let first = IndexEntry::deserialize(data, 1)?; // rev != 0: keep raw offset
        let version_word = first.offset as u32;
        let version = version_word & 0xffff;
        if version != VERSION {
            return Err(RevlogError::UnsupportedVersion(version_word));
        }
        if version_word & FLAG_GENERAL_DELTA == 0 {
            return Err(RevlogError::UnsupportedVersion(version_word));
        }
        let inline = version_word & FLAG_INLINE_DATA != 0;

        let mut index = Index {
            entries: Vec::new(),
            nodemap: HashMap::new(),
            version_word,
            truncated_tail: false,
            record_offsets: Vec::new(),
        };
        let mut pos = 0u64;
        let mut rev: Rev = 0;
        while (pos as usize) < data.len() {
            if data.len() - (pos as usize) < RECORD_LEN {
                index.truncated_tail = true;
                break;
            }
            let entry = IndexEntry::deserialize(&data[pos as usize..], rev)?;
            let stride = RECORD_LEN as u64
                + if inline { entry.compressed_len as u64 } else { 0 };
            if inline && (pos + stride) as usize > data.len() {
                // Record is whole but its inline chunk is cut short.
                index.truncated_tail = true;
                break;
            }
            index.record_offsets.push(pos);
            index.nodemap.insert(entry.node, rev);
            index.entries.push(entry);
            pos += stride;
            rev += 1;
        }
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn version_word(&self) -> u32 {
        self.version_word
    }

    pub fn set_inline(&mut self, inline: bool) {
        debug_assert!(self.is_empty(), "inline-ness is fixed at creation");
        if inline {
            self.version_word |= FLAG_INLINE_DATA;
        } else {
            self.version_word &= !FLAG_INLINE_DATA;
        }
    }

    pub fn is_inline(&self) -> bool {
        self.version_word & FLAG_INLINE_DATA != 0
    }

    pub fn get(&self, rev: Rev) -> Result<&IndexEntry, RevlogError> {
        if rev < 0 {
            return Err(RevlogError::UnknownRev(rev));
        }
        self.entries
            .get(rev as usize)
            .ok_or(RevlogError::UnknownRev(rev))
    }

    pub fn rev_of_node(&self, node: &Node) -> Option<Rev> {
        self.nodemap.get(node).copied()
    }

    /// Physical position of the record for `rev` in the index file.
    pub fn record_offset(&self, rev: Rev) -> u64 {
        if self.is_inline() {
            self.record_offsets[rev as usize]
        } else {
            rev as u64 * RECORD_LEN as u64
        }
    }

    /// Physical end of the last record (and chunk, if inline): the
    /// length a reader should treat as the index snapshot.
    pub fn physical_len(&self) -> u64 {
        match self.entries.last() {
            None => 0,
            Some(last) => {
                let rev = (self.len() - 1) as Rev;
                self.record_offset(rev)
                    + RECORD_LEN as u64
                    + if self.is_inline() { last.compressed_len as u64 } else { 0 }
            }
        }
    }

    pub fn push(&mut self, entry: IndexEntry) -> Rev {
        let rev = self.len() as Rev;
        self.record_offsets.push(self.physical_len());
        self.nodemap.insert(entry.node, rev);
        self.entries.push(entry);
        rev
    }

    /// Drop all revs >= `rev` (strip support).
    pub fn truncate(&mut self, rev: Rev) {
        if rev < 0 || rev as usize >= self.len() {
            return;
        }
        for entry in &self.entries[rev as usize..] {
            self.nodemap.remove(&entry.node);
        }
        self.entries.truncate(rev as usize);
        self.record_offsets.truncate(rev as usize);
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.iter()
    }

    pub fn parents(&self, rev: Rev) -> Result<[Rev; 2], RevlogError> {
        let entry = self.get(rev)?;
        Ok([entry.p1_rev, entry.p2_rev])
    }

    /// Revs with no child in the index. The null rev is returned for an
    /// empty revlog.
    pub fn head_revs(&self) -> Vec<Rev> {
        if self.is_empty() {
            return vec![NULL_REV];
        }
        let mut is_head = vec![true; self.len()];
        for entry in &self.entries {
            for parent in [entry.p1_rev, entry.p2_rev] {
                if parent != NULL_REV {
                    is_head[parent as usize] = false;
                }
            }
        }
        is_head
            .iter()
            .enumerate()
            .filter_map(|(rev, &head)| head.then_some(rev as Rev))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use types::NULL_ID;

    use super::*;

    fn entry(base_rev: Rev, p1_rev: Rev, p2_rev: Rev, payload: &[u8]) -> IndexEntry {
        IndexEntry {
            offset: 0,
            flags: RevFlags::empty(),
            compressed_len: payload.len() as u32,
            uncompressed_len: payload.len() as u32,
            base_rev,
            link_rev: 0,
            p1_rev,
            p2_rev,
            node: Node::from_content(payload, &NULL_ID, &NULL_ID),
        }
    }

    #[test]
    fn test_record_roundtrip() {
        let e = IndexEntry {
            offset: 0x0102030405,
            flags: RevFlags::CENSORED,
            compressed_len: 77,
            uncompressed_len: 100,
            base_rev: 3,
            link_rev: 9,
            p1_rev: 4,
            p2_rev: NULL_REV,
            node: Node::from_content(b"x", &NULL_ID, &NULL_ID),
        };
        let record = e.serialize(5, VERSION | FLAG_GENERAL_DELTA);
        assert_eq!(IndexEntry::deserialize(&record, 5).unwrap(), e);
    }

    #[test]
    fn test_rev0_record_carries_version() {
        let e = entry(0, NULL_REV, NULL_REV, b"root");
        let word = VERSION | FLAG_GENERAL_DELTA;
        let record = e.serialize(0, word);
        // The version word sits in the offset field.
        assert_eq!(BigEndian::read_u32(&record[2..6]), word);
        // Parsing rev 0 masks the offset back to zero.
        let parsed = IndexEntry::deserialize(&record, 0).unwrap();
        assert_eq!(parsed.offset, 0);
    }

    #[test]
    fn test_parse_rejects_unknown_version() {
        let e = entry(0, NULL_REV, NULL_REV, b"root");
        let record = e.serialize(0, 0xbeef0000 | 99);
        assert!(matches!(
            Index::parse(&record),
            Err(RevlogError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_parse_ignores_truncated_tail() {
        let word = VERSION | FLAG_GENERAL_DELTA;
        let mut data = Vec::new();
        data.extend_from_slice(&entry(0, NULL_REV, NULL_REV, b"a").serialize(0, word));
        data.extend_from_slice(&entry(1, 0, NULL_REV, b"b").serialize(1, word));
        data.extend_from_slice(&[0u8; 10]); // crashed partial record
        let index = Index::parse(&data).unwrap();
        assert_eq!(index.len(), 2);
        assert!(index.truncated_tail);
        assert_eq!(index.physical_len(), 2 * RECORD_LEN as u64);
    }

    #[test]
    fn test_inline_stride_and_offsets() {
        let word = VERSION | FLAG_GENERAL_DELTA | FLAG_INLINE_DATA;
        let mut data = Vec::new();
        data.extend_from_slice(&entry(0, NULL_REV, NULL_REV, b"aaaa").serialize(0, word));
        data.extend_from_slice(b"aaaa");
        data.extend_from_slice(&entry(1, 0, NULL_REV, b"bb").serialize(1, word));
        data.extend_from_slice(b"bb");
        let index = Index::parse(&data).unwrap();
        assert!(index.is_inline());
        assert_eq!(index.len(), 2);
        assert_eq!(index.record_offset(0), 0);
        assert_eq!(index.record_offset(1), RECORD_LEN as u64 + 4);
        assert_eq!(index.physical_len(), data.len() as u64);
    }

    #[test]
    fn test_inline_partial_chunk_is_truncated_tail() {
        let word = VERSION | FLAG_GENERAL_DELTA | FLAG_INLINE_DATA;
        let mut data = Vec::new();
        data.extend_from_slice(&entry(0, NULL_REV, NULL_REV, b"aaaa").serialize(0, word));
        data.extend_from_slice(b"aa"); // chunk cut short
        let index = Index::parse(&data).unwrap();
        assert_eq!(index.len(), 0);
        assert!(index.truncated_tail);
    }

    #[test]
    fn test_head_revs() {
        let mut index = Index::empty(false);
        assert_eq!(index.head_revs(), vec![NULL_REV]);
        index.push(entry(0, NULL_REV, NULL_REV, b"a"));
        index.push(entry(1, 0, NULL_REV, b"b"));
        index.push(entry(2, 0, NULL_REV, b"c"));
        assert_eq!(index.head_revs(), vec![1, 2]);
        index.push(entry(3, 1, 2, b"m"));
        assert_eq!(index.head_revs(), vec![3]);
    }

    #[test]
    fn test_nodemap() {
        let mut index = Index::empty(false);
        let e = entry(0, NULL_REV, NULL_REV, b"a");
        let node = e.node;
        index.push(e);
        assert_eq!(index.rev_of_node(&node), Some(0));
        assert_eq!(index.rev_of_node(&Node::default()), None);
        index.truncate(0);
        assert_eq!(index.rev_of_node(&node), None);
    }
}
