/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Content similarity for rename detection.
//!
//! The metric is line-set Jaccard: |A ∩ B| / |A ∪ B|, scaled to 0-100.
//! It is only computed when file sizes are comparable (within 4x), so
//! wildly different files never pay for a line scan. A threshold of 100
//! demands byte equality, not just equal line sets.

use std::collections::HashSet;

/// Sizes close enough to be worth comparing.
pub fn sizes_comparable(a: usize, b: usize) -> bool {
    let (small, large) = if a < b { (a, b) } else { (b, a) };
    large <= small.saturating_mul(4).max(1024)
}

/// Similarity score in percent.
pub fn score(a: &[u8], b: &[u8]) -> u8 {
    if a == b {
        return 100;
    }
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let lines_a: HashSet<&[u8]> = a.split_inclusive(|&byte| byte == b'\n').collect();
    let lines_b: HashSet<&[u8]> = b.split_inclusive(|&byte| byte == b'\n').collect();
    let intersection = lines_a.intersection(&lines_b).count();
    let union = lines_a.len() + lines_b.len() - intersection;
    if union == 0 {
        return 0;
    }
    // Equal line *sets* of unequal content cap at 99: only byte
    // equality scores 100, so a threshold of 100 means exact match.
    let raw = (intersection * 100 / union) as u8;
    raw.min(99)
}

/// The best source among `candidates` for `content`, at or above
/// `threshold` percent.
pub fn best_match<'a>(
    content: &[u8],
    candidates: impl Iterator<Item = (&'a str, Vec<u8>)>,
    threshold: u8,
) -> Option<(String, u8)> {
    let mut best: Option<(String, u8)> = None;
    for (name, candidate) in candidates {
        if !sizes_comparable(content.len(), candidate.len()) {
            continue;
        }
        let got = score(content, &candidate);
        if got >= threshold && best.as_ref().map_or(true, |(_, b)| got > *b) {
            best = Some((name.to_string(), got));
        }
    }
    best
}
