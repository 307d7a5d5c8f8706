/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TypeError {
    #[error("invalid node: {0}")]
    InvalidNode(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),
}
