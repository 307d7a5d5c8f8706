/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use sha1::Digest;
use sha1::Sha1;

use crate::errors::TypeError;

/// Length of a node in bytes.
pub const NODE_LEN: usize = 20;

/// Length of a hex-encoded node.
pub const HEX_LEN: usize = 40;

/// The all-zero node. Parent of root entries, and the "no parent"
/// sentinel wherever a `Node` is stored rather than an `Option<Node>`.
pub const NULL_ID: Node = Node([0u8; NODE_LEN]);

/// A 20-byte content-addressed identifier.
///
/// The node of an entry with parents `p1`, `p2` and payload `text` is
/// `sha1(min(p1, p2) || max(p1, p2) || text)`. Parents are unordered
/// for hashing but ordered everywhere else.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize
)]
pub struct Node([u8; NODE_LEN]);

impl Node {
    pub const fn null_id() -> &'static Self {
        &NULL_ID
    }

    pub fn is_null(&self) -> bool {
        self == &NULL_ID
    }

    pub const fn len() -> usize {
        NODE_LEN
    }

    pub const fn hex_len() -> usize {
        HEX_LEN
    }

    pub fn from_byte_array(bytes: [u8; NODE_LEN]) -> Self {
        Node(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, TypeError> {
        if bytes.len() != NODE_LEN {
            return Err(TypeError::InvalidNode(format!(
                "invalid length {} (expected {})",
                bytes.len(),
                NODE_LEN
            )));
        }
        let mut fixed = [0u8; NODE_LEN];
        fixed.copy_from_slice(bytes);
        Ok(Node(fixed))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_byte_array(self) -> [u8; NODE_LEN] {
        self.0
    }

    pub fn to_hex(&self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut out = String::with_capacity(HEX_LEN);
        for &b in self.0.iter() {
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0xf) as usize] as char);
        }
        out
    }

    pub fn from_hex(hex: &[u8]) -> Result<Self, TypeError> {
        if hex.len() != HEX_LEN {
            return Err(TypeError::InvalidNode(format!(
                "invalid hex length {} (expected {})",
                hex.len(),
                HEX_LEN
            )));
        }
        let mut bytes = [0u8; NODE_LEN];
        for (i, chunk) in hex.chunks(2).enumerate() {
            let hi = hex_value(chunk[0])?;
            let lo = hex_value(chunk[1])?;
            bytes[i] = (hi << 4) | lo;
        }
        Ok(Node(bytes))
    }

    /// Compute the node of a payload with the given parents.
    ///
    /// Parents are sorted before hashing, so `(p1, p2)` and `(p2, p1)`
    /// yield the same node.
    pub fn from_content(text: &[u8], p1: &Node, p2: &Node) -> Self {
        let mut hasher = Sha1::new();
        if p1 <= p2 {
            hasher.update(p1.as_bytes());
            hasher.update(p2.as_bytes());
        } else {
            hasher.update(p2.as_bytes());
            hasher.update(p1.as_bytes());
        }
        hasher.update(text);
        let digest: [u8; NODE_LEN] = hasher.finalize().into();
        Node(digest)
    }
}

fn hex_value(byte: u8) -> Result<u8, TypeError> {
    match byte {
        b'0'..=b'9' => Ok(byte - b'0'),
        b'a'..=b'f' => Ok(byte - b'a' + 10),
        b'A'..=b'F' => Ok(byte - b'A' + 10),
        _ => Err(TypeError::InvalidNode(format!(
            "invalid hex byte {:?}",
            byte as char
        ))),
    }
}

impl FromStr for Node {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Node::from_hex(s.as_bytes())
    }
}

impl fmt::Display for Node {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.to_hex())
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        // The short form is enough to identify a node in logs.
        write!(fmt, "Node({})", &self.to_hex()[..12])
    }
}

impl AsRef<[u8]> for Node {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Default for Node {
    fn default() -> Self {
        NULL_ID
    }
}

#[cfg(test)]
mod tests {
    use quickcheck::quickcheck;

    use super::*;

    impl quickcheck::Arbitrary for Node {
        fn arbitrary(g: &mut quickcheck::Gen) -> Self {
            let mut bytes = [0u8; NODE_LEN];
            for b in bytes.iter_mut() {
                *b = u8::arbitrary(g);
            }
            Node(bytes)
        }
    }

    #[test]
    fn test_null_is_all_zeros() {
        assert!(NULL_ID.is_null());
        assert_eq!(NULL_ID.to_hex(), "0".repeat(HEX_LEN));
    }

    #[test]
    fn test_hex_roundtrip() {
        let node = Node::from_content(b"hello", &NULL_ID, &NULL_ID);
        let hex = node.to_hex();
        assert_eq!(Node::from_hex(hex.as_bytes()).unwrap(), node);
        assert_eq!(hex.parse::<Node>().unwrap(), node);
    }

    #[test]
    fn test_bad_hex() {
        assert!(Node::from_hex(b"abcd").is_err());
        assert!(Node::from_hex("g".repeat(HEX_LEN).as_bytes()).is_err());
    }

    #[test]
    fn test_hash_is_parent_order_independent() {
        let a = Node::from_content(b"a", &NULL_ID, &NULL_ID);
        let b = Node::from_content(b"b", &NULL_ID, &NULL_ID);
        assert_eq!(
            Node::from_content(b"text", &a, &b),
            Node::from_content(b"text", &b, &a)
        );
    }

    #[test]
    fn test_hash_depends_on_parents_and_text() {
        let a = Node::from_content(b"a", &NULL_ID, &NULL_ID);
        let base = Node::from_content(b"text", &NULL_ID, &NULL_ID);
        assert_ne!(Node::from_content(b"text", &a, &NULL_ID), base);
        assert_ne!(Node::from_content(b"other", &NULL_ID, &NULL_ID), base);
    }

    quickcheck! {
        fn quickcheck_hex_roundtrip(node: Node) -> bool {
            Node::from_hex(node.to_hex().as_bytes()).unwrap() == node
        }

        fn quickcheck_slice_roundtrip(node: Node) -> bool {
            Node::from_slice(node.as_bytes()).unwrap() == node
        }
    }
}
