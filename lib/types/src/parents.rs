/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

use serde::Deserialize;
use serde::Serialize;

use crate::node::Node;
use crate::node::NULL_ID;

/// The ordered parent pair of an entry.
///
/// Null nodes mark missing parents. `p2` being non-null implies a merge;
/// `p1` null with `p2` non-null never occurs in a well-formed store.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default
)]
pub struct Parents {
    pub p1: Node,
    pub p2: Node,
}

impl Parents {
    pub fn new(p1: Node, p2: Node) -> Self {
        Parents { p1, p2 }
    }

    pub fn root() -> Self {
        Parents {
            p1: NULL_ID,
            p2: NULL_ID,
        }
    }

    pub fn is_merge(&self) -> bool {
        !self.p2.is_null()
    }

    pub fn p1(&self) -> Option<&Node> {
        if self.p1.is_null() { None } else { Some(&self.p1) }
    }

    pub fn p2(&self) -> Option<&Node> {
        if self.p2.is_null() { None } else { Some(&self.p2) }
    }

    /// Iterate over the non-null parents, in (p1, p2) order.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.p1().into_iter().chain(self.p2())
    }
}

impl From<(Node, Node)> for Parents {
    fn from((p1, p2): (Node, Node)) -> Self {
        Parents { p1, p2 }
    }
}
