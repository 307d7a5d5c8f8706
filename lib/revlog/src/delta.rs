/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Binary deltas between revlog payloads.
//!
//! A delta is a sequence of fragments, each replacing `base[start..end]`
//! with replacement bytes, ordered by offset and non-overlapping. The
//! wire encoding per fragment is `u32 start, u32 end, u32 len, bytes`,
//! big-endian.
//!
//! The generator is deliberately simple: it trims the longest common
//! line-aligned prefix and suffix and replaces the middle in one
//! fragment. That is enough for the delta-vs-snapshot decision in the
//! revlog to work well on real histories; `apply` accepts any
//! well-formed fragment list, so smarter generators stay compatible.

use byteorder::BigEndian;
use byteorder::ByteOrder;

use crate::errors::RevlogError;

/// Replace `base[start..end]` with `data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub start: u32,
    pub end: u32,
    pub data: Vec<u8>,
}

/// Compute a delta turning `old` into `new`.
pub fn compute(old: &[u8], new: &[u8]) -> Vec<Fragment> {
    if old == new {
        return Vec::new();
    }
    let prefix = common_line_prefix(old, new);
    let suffix = common_line_suffix(&old[prefix..], &new[prefix..]);
    vec![Fragment {
        start: prefix as u32,
        end: (old.len() - suffix) as u32,
        data: new[prefix..new.len() - suffix].to_vec(),
    }]
}

/// Length of the longest common prefix ending on a line boundary.
fn common_line_prefix(a: &[u8], b: &[u8]) -> usize {
    let common = a
        .iter()
        .zip(b.iter())
        .take_while(|(x, y)| x == y)
        .count();
    // Back off to just past the last newline inside the common region.
    match a[..common].iter().rposition(|&byte| byte == b'\n') {
        Some(pos) => pos + 1,
        None => 0,
    }
}

/// Length of the longest common suffix starting on a line boundary.
fn common_line_suffix(a: &[u8], b: &[u8]) -> usize {
    let common = a
        .iter()
        .rev()
        .zip(b.iter().rev())
        .take_while(|(x, y)| x == y)
        .count();
    if common == a.len() && common == b.len() {
        return common;
    }
    // Keep only the part of the common suffix that begins a line: the
    // byte before it must be a newline.
    let tail = &a[a.len() - common..];
    match tail.iter().position(|&byte| byte == b'\n') {
        Some(pos) if common > pos + 1 => common - pos - 1,
        _ => 0,
    }
}

/// Apply a delta to `base`.
pub fn apply(base: &[u8], fragments: &[Fragment]) -> Result<Vec<u8>, RevlogError> {
    let mut out = Vec::with_capacity(base.len());
    let mut cursor = 0usize;
    for fragment in fragments {
        let start = fragment.start as usize;
        let end = fragment.end as usize;
        if start < cursor || end < start || end > base.len() {
            return Err(RevlogError::Corrupt(format!(
                "bad delta fragment {}..{} over base of {} bytes",
                start,
                end,
                base.len()
            )));
        }
        out.extend_from_slice(&base[cursor..start]);
        out.extend_from_slice(&fragment.data);
        cursor = end;
    }
    out.extend_from_slice(&base[cursor..]);
    Ok(out)
}

/// Serialize fragments to the wire encoding.
pub fn serialize(fragments: &[Fragment]) -> Vec<u8> {
    let size: usize = fragments.iter().map(|f| 12 + f.data.len()).sum();
    let mut out = Vec::with_capacity(size);
    for fragment in fragments {
        let mut header = [0u8; 12];
        BigEndian::write_u32(&mut header[0..4], fragment.start);
        BigEndian::write_u32(&mut header[4..8], fragment.end);
        BigEndian::write_u32(&mut header[8..12], fragment.data.len() as u32);
        out.extend_from_slice(&header);
        out.extend_from_slice(&fragment.data);
    }
    out
}

/// Parse the wire encoding.
pub fn deserialize(mut data: &[u8]) -> Result<Vec<Fragment>, RevlogError> {
    let mut fragments = Vec::new();
    while !data.is_empty() {
        if data.len() < 12 {
            return Err(RevlogError::Corrupt(format!(
                "truncated delta header: {} bytes left",
                data.len()
            )));
        }
        let start = BigEndian::read_u32(&data[0..4]);
        let end = BigEndian::read_u32(&data[4..8]);
        let len = BigEndian::read_u32(&data[8..12]) as usize;
        if data.len() < 12 + len {
            return Err(RevlogError::Corrupt(format!(
                "truncated delta data: want {}, have {}",
                len,
                data.len() - 12
            )));
        }
        fragments.push(Fragment {
            start,
            end,
            data: data[12..12 + len].to_vec(),
        });
        data = &data[12 + len..];
    }
    Ok(fragments)
}

#[cfg(test)]
mod tests {
    use quickcheck::quickcheck;

    use super::*;

    fn roundtrip(old: &[u8], new: &[u8]) {
        let delta = compute(old, new);
        assert_eq!(apply(old, &delta).unwrap(), new);
        assert_eq!(deserialize(&serialize(&delta)).unwrap(), delta);
    }

    #[test]
    fn test_identity_is_empty_delta() {
        assert!(compute(b"same\n", b"same\n").is_empty());
    }

    #[test]
    fn test_append_modify_delete() {
        roundtrip(b"1\n2\n3\n", b"1\n2\n3\n4\n");
        roundtrip(b"1\n2\n3\n", b"1\nX\n3\n");
        roundtrip(b"1\n2\n3\n", b"1\n3\n");
        roundtrip(b"", b"full\ncontent\n");
        roundtrip(b"full\ncontent\n", b"");
    }

    #[test]
    fn test_no_trailing_newline() {
        roundtrip(b"a\nb", b"a\nc");
        roundtrip(b"ab", b"ac");
        roundtrip(b"a", b"a\n");
    }

    #[test]
    fn test_binaryish_content() {
        roundtrip(b"\x00\x01\x02", b"\x00\xff\x02");
        roundtrip(b"\xff\xfe", b"\xff\xfe\xfd");
    }

    #[test]
    fn test_apply_rejects_bad_fragments() {
        let overlap = vec![
            Fragment { start: 4, end: 8, data: vec![] },
            Fragment { start: 2, end: 6, data: vec![] },
        ];
        assert!(apply(b"0123456789", &overlap).is_err());
        let oob = vec![Fragment { start: 0, end: 99, data: vec![] }];
        assert!(apply(b"short", &oob).is_err());
    }

    #[test]
    fn test_deserialize_rejects_truncation() {
        let wire = serialize(&compute(b"a\n", b"b\n"));
        assert!(deserialize(&wire[..wire.len() - 1]).is_err());
        assert!(deserialize(&wire[..6]).is_err());
    }

    quickcheck! {
        fn quickcheck_apply_compute_roundtrip(old: Vec<u8>, new: Vec<u8>) -> bool {
            let delta = compute(&old, &new);
            apply(&old, &delta).unwrap() == new
        }

        fn quickcheck_wire_roundtrip(old: Vec<u8>, new: Vec<u8>) -> bool {
            let delta = compute(&old, &new);
            deserialize(&serialize(&delta)).unwrap() == delta
        }
    }
}
