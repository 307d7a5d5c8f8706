/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! The revlog proper: an append-only, delta-compressed, content-addressed
//! sequence of payloads.
//!
//! A revlog is an index file (`.i`) and, unless the revlog is inline, a
//! data file (`.d`). Small revlogs interleave each chunk after its index
//! record; the mode is chosen at creation and never changes. Appends run
//! inside a [`transaction::Transaction`], which records pre-write
//! lengths so aborts are plain truncation.
//!
//! Readers parse the index once at open and never look past the lengths
//! observed then, so they coexist with a concurrent appender without
//! locking.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use parking_lot::Mutex;
use transaction::Transaction;
use types::Node;
use types::Rev;
use types::NULL_ID;
use types::NULL_REV;

use crate::compress;
use crate::delta;
use crate::errors::RevlogError;
use crate::index::Index;
use crate::index::IndexEntry;
use crate::index::RevFlags;
use crate::index::RECORD_LEN;

/// Delta-chain tuning. The defaults match the documented bounds: a
/// chain may cost at most `chain_span_ratio` times the payload it
/// reconstructs, and may not grow longer than `chain_len_cap`.
#[derive(Debug, Clone)]
pub struct RevlogConfig {
    pub chain_len_cap: usize,
    pub chain_span_ratio: u64,
    /// Interleave data with the index. Picked at creation; ignored when
    /// opening an existing revlog.
    pub inline: bool,
}

impl Default for RevlogConfig {
    fn default() -> Self {
        RevlogConfig {
            chain_len_cap: 1000,
            chain_span_ratio: 4,
            inline: true,
        }
    }
}

pub struct Revlog {
    index_path: PathBuf,
    data_path: PathBuf,
    index: Index,
    config: RevlogConfig,
    /// Most recently reconstructed payload; appends usually delta
    /// against the previous rev or a parent, so this saves a chain walk.
    text_cache: Mutex<Option<(Rev, Vec<u8>)>>,
}

impl Revlog {
    /// Open (or create as empty) the revlog at `index_path`.
    pub fn open(index_path: impl Into<PathBuf>, config: RevlogConfig) -> Result<Self, RevlogError> {
        let index_path = index_path.into();
        let data_path = index_path.with_extension("d");
        let data = util::file::read_opt(&index_path)?.unwrap_or_default();
        let mut index = Index::parse(&data)?;
        if index.is_empty() && !index.truncated_tail {
            index.set_inline(config.inline);
        }
        if index.truncated_tail {
            tracing::warn!(
                index = %index_path.display(),
                revs = index.len(),
                "ignoring truncated tail of crashed transaction"
            );
        }
        Ok(Revlog {
            index_path,
            data_path,
            index,
            config,
            text_cache: Mutex::new(None),
        })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// The highest rev, or the null rev when empty.
    pub fn tip(&self) -> Rev {
        self.index.len() as Rev - 1
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn node(&self, rev: Rev) -> Result<Node, RevlogError> {
        if rev == NULL_REV {
            return Ok(NULL_ID);
        }
        Ok(self.index.get(rev)?.node)
    }

    /// Rev of `node`, or `None` when absent. The null node is always
    /// known.
    pub fn rev_of_node(&self, node: &Node) -> Option<Rev> {
        if node.is_null() {
            return Some(NULL_REV);
        }
        self.index.rev_of_node(node)
    }

    pub fn parents(&self, rev: Rev) -> Result<[Rev; 2], RevlogError> {
        self.index.parents(rev)
    }

    pub fn parent_nodes(&self, rev: Rev) -> Result<(Node, Node), RevlogError> {
        let [p1, p2] = self.parents(rev)?;
        Ok((self.node(p1)?, self.node(p2)?))
    }

    pub fn link_rev(&self, rev: Rev) -> Result<Rev, RevlogError> {
        Ok(self.index.get(rev)?.link_rev)
    }

    pub fn flags(&self, rev: Rev) -> Result<RevFlags, RevlogError> {
        Ok(self.index.get(rev)?.flags)
    }

    pub fn is_censored(&self, rev: Rev) -> Result<bool, RevlogError> {
        Ok(self.flags(rev)?.contains(RevFlags::CENSORED))
    }

    pub fn uncompressed_len(&self, rev: Rev) -> Result<u32, RevlogError> {
        Ok(self.index.get(rev)?.uncompressed_len)
    }

    /// Nodes of the revs with no children.
    pub fn heads(&self) -> Vec<Node> {
        self.index
            .head_revs()
            .into_iter()
            .map(|rev| if rev == NULL_REV { NULL_ID } else { self.index.get(rev).unwrap().node })
            .collect()
    }

    pub fn head_revs(&self) -> Vec<Rev> {
        self.index.head_revs()
    }

    /// The ordered list of revs whose chunks reconstruct `rev`,
    /// starting at the snapshot.
    pub fn delta_chain(&self, rev: Rev) -> Result<Vec<Rev>, RevlogError> {
        let mut chain = vec![rev];
        let mut current = rev;
        loop {
            let entry = self.index.get(current)?;
            if entry.base_rev == current {
                break;
            }
            if entry.base_rev > current || entry.base_rev < 0 {
                return Err(RevlogError::Corrupt(format!(
                    "rev {} has base {} outside 0..={}",
                    current, entry.base_rev, current
                )));
            }
            current = entry.base_rev;
            chain.push(current);
            if chain.len() > self.index.len() {
                return Err(RevlogError::Corrupt(format!(
                    "delta chain of rev {} does not terminate",
                    rev
                )));
            }
        }
        chain.reverse();
        Ok(chain)
    }

    /// Total compressed bytes a chain occupies.
    fn chain_span(&self, chain: &[Rev]) -> Result<u64, RevlogError> {
        let mut span = 0u64;
        for &rev in chain {
            span += self.index.get(rev)?.compressed_len as u64;
        }
        Ok(span)
    }

    /// Raw stored chunk of `rev`, decompressed but not delta-applied.
    fn chunk(&self, rev: Rev) -> Result<Vec<u8>, RevlogError> {
        let entry = self.index.get(rev)?;
        let (path, offset) = if self.index.is_inline() {
            (&self.index_path, self.index.record_offset(rev) + RECORD_LEN as u64)
        } else {
            (&self.data_path, entry.offset)
        };
        let raw = read_exact_at(path, offset, entry.compressed_len as usize)?;
        compress::decompress(&raw)
    }

    /// Reconstruct and verify the full payload of `rev`.
    pub fn text(&self, rev: Rev) -> Result<Vec<u8>, RevlogError> {
        if rev == NULL_REV {
            return Ok(Vec::new());
        }
        let entry = self.index.get(rev)?;
        if entry.flags.contains(RevFlags::CENSORED) {
            return Err(RevlogError::Censored {
                path: self.index_path.clone(),
                rev,
            });
        }
        if let Some((cached_rev, text)) = &*self.text_cache.lock() {
            if *cached_rev == rev {
                return Ok(text.clone());
            }
        }
        let chain = self.delta_chain(rev)?;
        let mut text = self.chunk(chain[0])?;
        for &delta_rev in &chain[1..] {
            let fragments = delta::deserialize(&self.chunk(delta_rev)?)?;
            text = delta::apply(&text, &fragments)?;
        }
        self.check_hash(rev, &text)?;
        *self.text_cache.lock() = Some((rev, text.clone()));
        Ok(text)
    }

    fn check_hash(&self, rev: Rev, text: &[u8]) -> Result<(), RevlogError> {
        let entry = self.index.get(rev)?;
        let (p1, p2) = self.parent_nodes(rev)?;
        let computed = Node::from_content(text, &p1, &p2);
        if computed != entry.node {
            return Err(RevlogError::Integrity(format!(
                "rev {} of {:?}: node mismatch (stored {}, computed {})",
                rev, self.index_path, entry.node, computed
            )));
        }
        Ok(())
    }

    /// Append a payload. Duplicate nodes are a no-op returning the
    /// existing rev. The write is covered by `txn`.
    pub fn append(
        &mut self,
        txn: &mut Transaction,
        payload: &[u8],
        p1: Rev,
        p2: Rev,
        link_rev: Rev,
        flags: RevFlags,
    ) -> Result<(Rev, Node), RevlogError> {
        let p1_node = self.node(p1)?;
        let p2_node = self.node(p2)?;
        let node = Node::from_content(payload, &p1_node, &p2_node);
        if let Some(existing) = self.index.rev_of_node(&node) {
            return Ok((existing, node));
        }

        let rev = self.index.len() as Rev;
        let full_chunk = compress::compress(payload);
        let (base_rev, chunk) = self.pick_delta(rev, payload, &full_chunk, p1, p2)?;
        tracing::trace!(
            rev,
            base_rev,
            chunk_len = chunk.len(),
            full_len = full_chunk.len(),
            "revlog append"
        );

        let offset = match self.index.iter().last() {
            None => 0,
            Some(last) => last.offset + last.compressed_len as u64,
        };
        let entry = IndexEntry {
            offset,
            flags,
            compressed_len: chunk.len() as u32,
            uncompressed_len: payload.len() as u32,
            base_rev,
            link_rev,
            p1_rev: p1,
            p2_rev: p2,
            node,
        };

        txn.add(&self.index_path)?;
        if !self.index.is_inline() {
            txn.add(&self.data_path)?;
        }
        let record = entry.serialize(rev, self.index.version_word());
        if self.index.is_inline() {
            let mut buf = Vec::with_capacity(RECORD_LEN + chunk.len());
            buf.extend_from_slice(&record);
            buf.extend_from_slice(&chunk);
            append_bytes(&self.index_path, &buf)?;
        } else {
            append_bytes(&self.data_path, &chunk)?;
            append_bytes(&self.index_path, &record)?;
        }

        self.index.push(entry);
        *self.text_cache.lock() = Some((rev, payload.to_vec()));
        Ok((rev, node))
    }

    /// Choose the stored representation for a new rev: a delta against
    /// one of the candidates, or a full snapshot.
    ///
    /// Candidates, in order: p1, p2, the previous rev, then the chain
    /// base of the best candidate found. A candidate is viable if its
    /// delta compresses below the full snapshot and the resulting chain
    /// respects both the length cap and the span ratio. Ties go to the
    /// shorter chain, then to candidate order.
    fn pick_delta(
        &self,
        rev: Rev,
        payload: &[u8],
        full_chunk: &[u8],
        p1: Rev,
        p2: Rev,
    ) -> Result<(Rev, Vec<u8>), RevlogError> {
        let prev = rev - 1;
        let mut candidates = Vec::new();
        for candidate in [p1, p2, prev] {
            if candidate != NULL_REV && !candidates.contains(&candidate) {
                candidates.push(candidate);
            }
        }

        let mut best: Option<(usize, Rev, Vec<u8>)> = None;
        let mut tried_base_of_best = false;
        let mut i = 0;
        while i < candidates.len() {
            let candidate = candidates[i];
            i += 1;
            if let Some((chain_len, chunk)) =
                self.try_delta_candidate(candidate, payload, full_chunk)?
            {
                let better = match &best {
                    None => true,
                    Some((best_len, _, _)) => chain_len < *best_len,
                };
                if better {
                    best = Some((chain_len, candidate, chunk));
                }
            }
            // Candidate (d): the chain base of the best candidate so
            // far, appended once all the direct candidates are in.
            if i == candidates.len() && !tried_base_of_best {
                tried_base_of_best = true;
                if let Some((_, best_rev, _)) = &best {
                    let base = self.delta_chain(*best_rev)?[0];
                    if !candidates.contains(&base) {
                        candidates.push(base);
                    }
                }
            }
        }

        match best {
            Some((_, base_rev, chunk)) => Ok((base_rev, chunk)),
            None => Ok((rev, full_chunk.to_vec())),
        }
    }

    fn try_delta_candidate(
        &self,
        candidate: Rev,
        payload: &[u8],
        full_chunk: &[u8],
    ) -> Result<Option<(usize, Vec<u8>)>, RevlogError> {
        if self.is_censored(candidate)? {
            return Ok(None);
        }
        let base_text = self.text(candidate)?;
        let fragments = delta::compute(&base_text, payload);
        let chunk = compress::compress(&delta::serialize(&fragments));
        if chunk.len() >= full_chunk.len() {
            return Ok(None);
        }
        let chain = self.delta_chain(candidate)?;
        if chain.len() + 1 > self.config.chain_len_cap {
            return Ok(None);
        }
        let span = self.chain_span(&chain)? + chunk.len() as u64;
        if span > self.config.chain_span_ratio * payload.len() as u64 {
            return Ok(None);
        }
        Ok(Some((chain.len() + 1, chunk)))
    }

    /// Replace the payload of `rev` with zeros, keeping its node: the
    /// censored entry still hashes into its descendants, but its bytes
    /// are gone. Revs delta-ed on top of `rev` must already have been
    /// re-anchored (verify reports them otherwise).
    pub fn censor(&mut self, txn: &mut Transaction, rev: Rev) -> Result<(), RevlogError> {
        // Censoring rewrites the whole revlog: lengths change, so this
        // is the one operation that is not an append. A full backup
        // makes it transactional.
        txn.add_backup(&self.index_path)?;
        if !self.index.is_inline() {
            txn.add_backup(&self.data_path)?;
        }
        let mut texts = Vec::new();
        for r in 0..self.index.len() as Rev {
            let entry = self.index.get(r)?.clone();
            let text = if r == rev {
                Vec::new()
            } else if entry.flags.contains(RevFlags::CENSORED) {
                Vec::new()
            } else {
                self.text(r)?
            };
            texts.push((entry, text));
        }
        let inline = self.index.is_inline();
        let config = self.config.clone();
        util::file::unlink_opt(&self.index_path)?;
        util::file::unlink_opt(&self.data_path)?;
        let mut rebuilt = Revlog::open(&self.index_path, config)?;
        rebuilt.index.set_inline(inline);
        for (r, (entry, text)) in texts.into_iter().enumerate() {
            let flags = if r as Rev == rev {
                entry.flags | RevFlags::CENSORED
            } else {
                entry.flags
            };
            rebuilt.append_raw(
                &text,
                entry.p1_rev,
                entry.p2_rev,
                entry.link_rev,
                flags,
                entry.node,
            )?;
        }
        self.index = rebuilt.index;
        *self.text_cache.lock() = None;
        Ok(())
    }

    /// Append with a caller-supplied node, bypassing the hash check.
    /// Only used while rebuilding for censorship, where the payload is
    /// deliberately not what hashed to the node.
    fn append_raw(
        &mut self,
        payload: &[u8],
        p1: Rev,
        p2: Rev,
        link_rev: Rev,
        flags: RevFlags,
        node: Node,
    ) -> Result<Rev, RevlogError> {
        let rev = self.index.len() as Rev;
        let chunk = compress::compress(payload);
        let offset = match self.index.iter().last() {
            None => 0,
            Some(last) => last.offset + last.compressed_len as u64,
        };
        let entry = IndexEntry {
            offset,
            flags,
            compressed_len: chunk.len() as u32,
            uncompressed_len: payload.len() as u32,
            base_rev: rev,
            link_rev,
            p1_rev: p1,
            p2_rev: p2,
            node,
        };
        let record = entry.serialize(rev, self.index.version_word());
        if self.index.is_inline() {
            let mut buf = Vec::with_capacity(RECORD_LEN + chunk.len());
            buf.extend_from_slice(&record);
            buf.extend_from_slice(&chunk);
            append_bytes(&self.index_path, &buf)?;
        } else {
            append_bytes(&self.data_path, &chunk)?;
            append_bytes(&self.index_path, &record)?;
        }
        self.index.push(entry);
        Ok(rev)
    }

    /// Remove all revs >= `rev` from disk and memory. Destructive; the
    /// caller is responsible for saving a backup bundle first.
    pub fn strip(&mut self, rev: Rev) -> Result<(), RevlogError> {
        if rev < 0 || rev as usize >= self.index.len() {
            return Ok(());
        }
        let index_len = self.index.record_offset(rev);
        let data_len = self.index.get(rev)?.offset;
        util::file::truncate(&self.index_path, index_len)?;
        if !self.index.is_inline() {
            util::file::truncate(&self.data_path, data_len)?;
        }
        self.index.truncate(rev);
        *self.text_cache.lock() = None;
        tracing::info!(index = %self.index_path.display(), rev, "stripped");
        Ok(())
    }
}

fn append_bytes(path: &Path, bytes: &[u8]) -> Result<(), RevlogError> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(bytes)?;
    Ok(())
}

#[cfg(unix)]
fn read_exact_at(path: &Path, offset: u64, len: usize) -> Result<Vec<u8>, RevlogError> {
    use std::os::unix::fs::FileExt;
    let file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; len];
    file.read_exact_at(&mut buf, offset)?;
    Ok(buf)
}

#[cfg(not(unix))]
fn read_exact_at(path: &Path, offset: u64, len: usize) -> Result<Vec<u8>, RevlogError> {
    use std::io::Read;
    use std::io::Seek;
    let mut file = std::fs::File::open(path)?;
    file.seek(std::io::SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestRevlog {
        dir: tempfile::TempDir,
        revlog: Revlog,
    }

    impl TestRevlog {
        fn new(config: RevlogConfig) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let revlog = Revlog::open(dir.path().join("00test.i"), config).unwrap();
            TestRevlog { dir, revlog }
        }

        fn txn(&self) -> Transaction {
            Transaction::open(self.dir.path().join("journal")).unwrap()
        }

        fn append(&mut self, payload: &[u8], p1: Rev, p2: Rev) -> (Rev, Node) {
            let mut txn = self.txn();
            let result = self
                .revlog
                .append(&mut txn, payload, p1, p2, 0, RevFlags::empty())
                .unwrap();
            txn.commit(&self.dir.path().join("undo")).unwrap();
            result
        }

        fn reopen(&mut self) {
            self.revlog = Revlog::open(
                self.dir.path().join("00test.i"),
                RevlogConfig::default(),
            )
            .unwrap();
        }
    }

    #[test]
    fn test_append_and_read_back() {
        for inline in [true, false] {
            let config = RevlogConfig {
                inline,
                ..Default::default()
            };
            let mut t = TestRevlog::new(config);
            let (r0, n0) = t.append(b"v1\n", NULL_REV, NULL_REV);
            let (r1, _) = t.append(b"v1\nv2\n", r0, NULL_REV);
            assert_eq!((r0, r1), (0, 1));
            assert_eq!(t.revlog.text(0).unwrap(), b"v1\n");
            assert_eq!(t.revlog.text(1).unwrap(), b"v1\nv2\n");
            assert_eq!(t.revlog.rev_of_node(&n0), Some(0));
            assert_eq!(t.revlog.parents(1).unwrap(), [0, NULL_REV]);

            t.reopen();
            assert_eq!(t.revlog.len(), 2);
            assert_eq!(t.revlog.text(1).unwrap(), b"v1\nv2\n");
        }
    }

    #[test]
    fn test_duplicate_append_is_noop() {
        let mut t = TestRevlog::new(Default::default());
        let (r0, n0) = t.append(b"same\n", NULL_REV, NULL_REV);
        let (r1, n1) = t.append(b"same\n", NULL_REV, NULL_REV);
        assert_eq!((r0, n0), (r1, n1));
        assert_eq!(t.revlog.len(), 1);
    }

    #[test]
    fn test_delta_chain_and_snapshot() {
        let mut t = TestRevlog::new(Default::default());
        let mut text = b"line 0\nline 1\nline 2\nline 3\nline 4\n".to_vec();
        let (mut prev, _) = t.append(&text, NULL_REV, NULL_REV);
        for i in 0..5 {
            text.extend_from_slice(format!("line {}\n", i + 5).as_bytes());
            let (rev, _) = t.append(&text, prev, NULL_REV);
            prev = rev;
        }
        // Later revs should be deltas anchored on the rev 0 snapshot.
        let chain = t.revlog.delta_chain(5).unwrap();
        assert_eq!(chain[0], 0);
        assert!(chain.len() > 1);
        assert_eq!(t.revlog.text(5).unwrap(), text);
    }

    #[test]
    fn test_span_ratio_forces_snapshot() {
        let config = RevlogConfig {
            chain_span_ratio: 1,
            ..Default::default()
        };
        let mut t = TestRevlog::new(config);
        let incompressible: Vec<u8> = (0..2000u32).flat_map(|i| i.to_be_bytes()).collect();
        let (r0, _) = t.append(&incompressible, NULL_REV, NULL_REV);
        // A tiny change would delta well, but the 1x span budget cannot
        // hold the existing chain plus anything.
        let mut changed = incompressible.clone();
        changed.truncate(16);
        let (r1, _) = t.append(&changed, r0, NULL_REV);
        assert_eq!(t.revlog.delta_chain(r1).unwrap(), vec![r1]);
        assert_eq!(t.revlog.text(r1).unwrap(), changed);
    }

    #[test]
    fn test_chain_len_cap() {
        let config = RevlogConfig {
            chain_len_cap: 3,
            ..Default::default()
        };
        let mut t = TestRevlog::new(config);
        let mut text = b"base line with some content\n".to_vec();
        let (mut prev, _) = t.append(&text, NULL_REV, NULL_REV);
        for i in 0..10 {
            text.extend_from_slice(format!("extra line number {}\n", i).as_bytes());
            let (rev, _) = t.append(&text, prev, NULL_REV);
            prev = rev;
            assert!(t.revlog.delta_chain(rev).unwrap().len() <= 3);
        }
        assert_eq!(t.revlog.text(prev).unwrap(), text);
    }

    #[test]
    fn test_abort_truncates_cleanly() {
        let mut t = TestRevlog::new(Default::default());
        t.append(b"keep\n", NULL_REV, NULL_REV);
        {
            let mut txn = t.txn();
            t.revlog
                .append(&mut txn, b"discard\n", 0, NULL_REV, 1, RevFlags::empty())
                .unwrap();
            txn.abort().unwrap();
        }
        t.reopen();
        assert_eq!(t.revlog.len(), 1);
        assert_eq!(t.revlog.text(0).unwrap(), b"keep\n");
    }

    #[test]
    fn test_truncated_tail_ignored_on_open() {
        let mut t = TestRevlog::new(Default::default());
        t.append(b"one\n", NULL_REV, NULL_REV);
        let path = t.dir.path().join("00test.i");
        let mut data = std::fs::read(&path).unwrap();
        data.extend_from_slice(&[0xab; 30]); // half a record
        std::fs::write(&path, &data).unwrap();
        t.reopen();
        assert_eq!(t.revlog.len(), 1);
        assert_eq!(t.revlog.text(0).unwrap(), b"one\n");
    }

    #[test]
    fn test_corrupt_payload_fails_integrity() {
        let mut t = TestRevlog::new(RevlogConfig {
            inline: false,
            ..Default::default()
        });
        t.append(b"padded content that is long enough\n", NULL_REV, NULL_REV);
        // Flip a byte in the data file.
        let data_path = t.dir.path().join("00test.d");
        let mut data = std::fs::read(&data_path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        std::fs::write(&data_path, &data).unwrap();
        t.reopen();
        match t.revlog.text(0) {
            Err(RevlogError::Integrity(_)) | Err(RevlogError::Corrupt(_)) => {}
            other => panic!("expected integrity failure, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_censor_keeps_node_hides_bytes() {
        let mut t = TestRevlog::new(Default::default());
        let (r0, n0) = t.append(b"public\n", NULL_REV, NULL_REV);
        let (r1, _) = t.append(b"secret password\n", r0, NULL_REV);
        let (r2, _) = t.append(b"fixed\n", r1, NULL_REV);

        let mut txn = t.txn();
        t.revlog.censor(&mut txn, r1).unwrap();
        txn.commit(&t.dir.path().join("undo")).unwrap();

        assert!(t.revlog.is_censored(r1).unwrap());
        assert!(matches!(
            t.revlog.text(r1),
            Err(RevlogError::Censored { rev: 1, .. })
        ));
        // Neighbors are unharmed, nodes unchanged.
        assert_eq!(t.revlog.text(r0).unwrap(), b"public\n");
        assert_eq!(t.revlog.text(r2).unwrap(), b"fixed\n");
        assert_eq!(t.revlog.node(r0).unwrap(), n0);

        t.reopen();
        assert!(t.revlog.is_censored(r1).unwrap());
    }

    #[test]
    fn test_strip() {
        let mut t = TestRevlog::new(Default::default());
        t.append(b"a\n", NULL_REV, NULL_REV);
        t.append(b"a\nb\n", 0, NULL_REV);
        t.append(b"a\nb\nc\n", 1, NULL_REV);
        t.revlog.strip(1).unwrap();
        assert_eq!(t.revlog.len(), 1);
        t.reopen();
        assert_eq!(t.revlog.len(), 1);
        assert_eq!(t.revlog.text(0).unwrap(), b"a\n");
    }

    #[test]
    fn test_heads() {
        let mut t = TestRevlog::new(Default::default());
        assert_eq!(t.revlog.heads(), vec![NULL_ID]);
        let (r0, _) = t.append(b"root\n", NULL_REV, NULL_REV);
        let (r1, n1) = t.append(b"left\n", r0, NULL_REV);
        let (_, n2) = t.append(b"right\n", r0, NULL_REV);
        assert_eq!(t.revlog.heads(), vec![n1, n2]);
        let (_, n3) = t.append(b"merge\n", r1, 2);
        assert_eq!(t.revlog.heads(), vec![n3]);
    }

    #[test]
    fn test_censored_text_of_merge_verifies() {
        // A rev whose payload hashes with two parents.
        let mut t = TestRevlog::new(Default::default());
        let (r0, _) = t.append(b"a\n", NULL_REV, NULL_REV);
        let (r1, _) = t.append(b"b\n", NULL_REV, NULL_REV);
        let (r2, _) = t.append(b"ab\n", r0, r1);
        assert_eq!(t.revlog.text(r2).unwrap(), b"ab\n");
    }
}
