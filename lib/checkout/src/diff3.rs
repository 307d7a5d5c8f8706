/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Line-based three-way merge.
//!
//! Both sides are diffed against the base (LCS over lines); stable
//! anchors where both sides kept the base line split the inputs into
//! regions, and each region resolves independently:
//!
//! - one side unchanged: take the other side,
//! - both sides identical: take either,
//! - both sides *inserted* (no base lines touched): take local's
//!   insertion, then other's,
//! - anything else: a conflict, rendered with markers.
//!
//! The both-insert rule keeps two independent appends mergeable, which
//! is what users expect from "I added a line and so did they".

/// Outcome of [`merge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    pub content: Vec<u8>,
    pub conflicts: usize,
}

impl MergeResult {
    pub fn is_clean(&self) -> bool {
        self.conflicts == 0
    }
}

/// Split into lines, keeping terminators. A missing final newline
/// leaves a shorter last element.
fn lines(data: &[u8]) -> Vec<&[u8]> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, &b) in data.iter().enumerate() {
        if b == b'\n' {
            out.push(&data[start..=i]);
            start = i + 1;
        }
    }
    if start < data.len() {
        out.push(&data[start..]);
    }
    out
}

/// For every base line, the matched line index on the side, per LCS.
fn lcs_match(base: &[&[u8]], side: &[&[u8]]) -> Vec<Option<usize>> {
    let n = base.len();
    let m = side.len();
    // Classic DP table of LCS lengths.
    let mut table = vec![0u32; (n + 1) * (m + 1)];
    let idx = |i: usize, j: usize| i * (m + 1) + j;
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[idx(i, j)] = if base[i] == side[j] {
                table[idx(i + 1, j + 1)] + 1
            } else {
                table[idx(i + 1, j)].max(table[idx(i, j + 1)])
            };
        }
    }
    let mut matched = vec![None; n];
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if base[i] == side[j] {
            matched[i] = Some(j);
            i += 1;
            j += 1;
        } else if table[idx(i + 1, j)] >= table[idx(i, j + 1)] {
            i += 1;
        } else {
            j += 1;
        }
    }
    matched
}

struct Region {
    base: (usize, usize),
    local: (usize, usize),
    other: (usize, usize),
}

/// Merge `local` and `other`, both derived from `base`.
pub fn merge(
    base: &[u8],
    local: &[u8],
    other: &[u8],
    local_label: &str,
    other_label: &str,
) -> MergeResult {
    // Trivial shapes first.
    if local == other {
        return MergeResult {
            content: local.to_vec(),
            conflicts: 0,
        };
    }
    if base == local {
        return MergeResult {
            content: other.to_vec(),
            conflicts: 0,
        };
    }
    if base == other {
        return MergeResult {
            content: local.to_vec(),
            conflicts: 0,
        };
    }

    let base_lines = lines(base);
    let local_lines = lines(local);
    let other_lines = lines(other);
    let match_local = lcs_match(&base_lines, &local_lines);
    let match_other = lcs_match(&base_lines, &other_lines);

    let mut content = Vec::with_capacity(local.len().max(other.len()));
    let mut conflicts = 0;

    let regions = regions(
        base_lines.len(),
        local_lines.len(),
        other_lines.len(),
        &match_local,
        &match_other,
    );
    for region in regions {
        let base_seg = &base_lines[region.base.0..region.base.1];
        let local_seg = &local_lines[region.local.0..region.local.1];
        let other_seg = &other_lines[region.other.0..region.other.1];

        if local_seg == base_seg {
            push_lines(&mut content, other_seg);
        } else if other_seg == base_seg || local_seg == other_seg {
            push_lines(&mut content, local_seg);
        } else if base_seg.is_empty() {
            // Independent insertions at the same anchor.
            push_lines(&mut content, local_seg);
            push_lines(&mut content, other_seg);
        } else {
            conflicts += 1;
            content.extend_from_slice(format!("<<<<<<< {}\n", local_label).as_bytes());
            push_lines(&mut content, local_seg);
            ensure_newline(&mut content);
            content.extend_from_slice(b"=======\n");
            push_lines(&mut content, other_seg);
            ensure_newline(&mut content);
            content.extend_from_slice(format!(">>>>>>> {}\n", other_label).as_bytes());
        }
    }

    MergeResult { content, conflicts }
}

/// Cut the three inputs into alternating regions at stable anchors
/// (base lines kept verbatim by both sides).
fn regions(
    base_len: usize,
    local_len: usize,
    other_len: usize,
    match_local: &[Option<usize>],
    match_other: &[Option<usize>],
) -> Vec<Region> {
    let mut out = Vec::new();
    let (mut bi, mut li, mut oi) = (0usize, 0usize, 0usize);
    loop {
        // Next stable anchor at or after the cursors.
        let mut anchor = None;
        for b in bi..base_len {
            if let (Some(l), Some(o)) = (match_local[b], match_other[b]) {
                if l >= li && o >= oi {
                    anchor = Some((b, l, o));
                    break;
                }
            }
        }
        match anchor {
            Some((b, l, o)) => {
                if b > bi || l > li || o > oi {
                    out.push(Region {
                        base: (bi, b),
                        local: (li, l),
                        other: (oi, o),
                    });
                }
                // The anchor line itself: identical on all sides.
                out.push(Region {
                    base: (b, b + 1),
                    local: (l, l + 1),
                    other: (o, o + 1),
                });
                bi = b + 1;
                li = l + 1;
                oi = o + 1;
            }
            None => {
                if bi < base_len || li < local_len || oi < other_len {
                    out.push(Region {
                        base: (bi, base_len),
                        local: (li, local_len),
                        other: (oi, other_len),
                    });
                }
                break;
            }
        }
    }
    out
}

fn push_lines(out: &mut Vec<u8>, lines: &[&[u8]]) {
    for line in lines {
        out.extend_from_slice(line);
    }
}

fn ensure_newline(out: &mut Vec<u8>) {
    if out.last() != Some(&b'\n') {
        out.push(b'\n');
    }
}

/// Quick binary sniff: NUL in the first kilobyte.
pub fn looks_binary(data: &[u8]) -> bool {
    data.iter().take(1024).any(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(base: &str, local: &str, other: &str) -> MergeResult {
        merge(
            base.as_bytes(),
            local.as_bytes(),
            other.as_bytes(),
            "local",
            "other",
        )
    }

    #[test]
    fn test_trivial_laws() {
        // merge(A, A, X) == X and merge(A, X, X) == X.
        let a = "one\ntwo\n";
        let x = "one\nthree\n";
        assert_eq!(m(a, a, x).content, x.as_bytes());
        assert_eq!(m(a, x, a).content, x.as_bytes());
        assert_eq!(m(a, x, x).content, x.as_bytes());
    }

    #[test]
    fn test_disjoint_edits_merge_clean() {
        let base = "a\nb\nc\nd\ne\n";
        let local = "A\nb\nc\nd\ne\n";
        let other = "a\nb\nc\nd\nE\n";
        let result = m(base, local, other);
        assert!(result.is_clean());
        assert_eq!(result.content, b"A\nb\nc\nd\nE\n");
    }

    #[test]
    fn test_both_append_concatenates() {
        let result = m("1\n", "1\n2\n", "1\n3\n");
        assert!(result.is_clean());
        assert_eq!(result.content, b"1\n2\n3\n");
    }

    #[test]
    fn test_same_line_edit_conflicts() {
        let result = m("x\n", "left\n", "right\n");
        assert_eq!(result.conflicts, 1);
        let text = String::from_utf8(result.content).unwrap();
        assert!(text.contains("<<<<<<< local\nleft\n"));
        assert!(text.contains("=======\nright\n"));
        assert!(text.contains(">>>>>>> other\n"));
    }

    #[test]
    fn test_delete_vs_edit_conflicts() {
        let result = m("a\nb\nc\n", "a\nc\n", "a\nB\nc\n");
        assert_eq!(result.conflicts, 1);
    }

    #[test]
    fn test_delete_both_sides() {
        let result = m("a\nb\nc\n", "a\nc\n", "a\nc\n");
        assert!(result.is_clean());
        assert_eq!(result.content, b"a\nc\n");
    }

    #[test]
    fn test_missing_trailing_newline() {
        let result = m("a\nb", "a\nb\nx", "a\nb");
        assert!(result.is_clean());
        assert_eq!(result.content, b"a\nb\nx");
    }

    #[test]
    fn test_looks_binary() {
        assert!(looks_binary(b"ELF\x00\x01"));
        assert!(!looks_binary(b"plain text\n"));
    }
}
