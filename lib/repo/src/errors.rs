/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

use thiserror::Error;
use types::Node;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("repository {0} not found")]
    NotFound(String),

    #[error("repository requires unsupported feature: {0}")]
    UnsupportedRequirement(String),

    #[error("{0}")]
    State(#[from] StateError),

    #[error("{hook} hook failed: {message}")]
    HookAbort { hook: String, message: String },

    #[error("unknown revision {0:?}")]
    UnknownRevision(String),

    #[error("corrupt repository file: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Config(#[from] configmodel::ConfigError),

    #[error(transparent)]
    Lock(#[from] repolock::LockError),

    #[error(transparent)]
    Transaction(#[from] transaction::TransactionError),

    #[error(transparent)]
    Revlog(#[from] revlog::RevlogError),

    #[error(transparent)]
    Changelog(#[from] changelog::ChangelogError),

    #[error(transparent)]
    Manifest(#[from] manifest::ManifestError),

    #[error(transparent)]
    Filelog(#[from] filelog::FilelogError),

    #[error(transparent)]
    Obsolescence(#[from] obsstore::ObsError),

    #[error(transparent)]
    Dirstate(#[from] dirstate::DirstateError),

    #[error(transparent)]
    Dag(#[from] dag::DagError),

    #[error(transparent)]
    Revset(#[from] revsets::RevsetError),

    #[error(transparent)]
    Vfs(#[from] vfs::VfsError),

    #[error("path error: {0}")]
    Path(#[from] vfs::audit::AuditError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The operation is impossible in the current repository state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("unresolved merge conflicts (use resolve)")]
    UnresolvedMerge,

    #[error("cannot obsolete public changeset {0}")]
    ObsoletePublic(Node),

    #[error("cannot publish hidden changeset {0}")]
    PublishHidden(Node),

    #[error("nothing to commit")]
    NothingToCommit,

    #[error("working copy parent is not a head (run update first)")]
    NotAtHead,
}

/// Exit code mapping: 0 success, 1 non-fatal no-op / needs-input, 255
/// abort. Hooks bubble as 255 with their name in the message.
pub fn exit_code(err: &RepoError) -> i32 {
    match err {
        RepoError::State(StateError::UnresolvedMerge) => 1,
        RepoError::State(StateError::NothingToCommit) => 1,
        _ => 255,
    }
}

/// The single `abort:` line (plus hints) for an error.
pub fn format_abort(err: &RepoError) -> String {
    let hints: &[&str] = match err {
        RepoError::Revlog(revlog::RevlogError::Integrity(_)) => {
            &["run verify to check the repository"]
        }
        RepoError::State(StateError::UnresolvedMerge) => &["use resolve to retry the merge"],
        RepoError::Lock(_) => &["wait for the other process or break a stale lock"],
        _ => &[],
    };
    ui::format_abort(&err.to_string(), hints)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&RepoError::State(StateError::UnresolvedMerge)), 1);
        assert_eq!(
            exit_code(&RepoError::HookAbort {
                hook: "pretxncommit".to_string(),
                message: "rejected".to_string(),
            }),
            255
        );
    }

    #[test]
    fn test_abort_formatting() {
        let err = RepoError::Revlog(revlog::RevlogError::Integrity("bad node".to_string()));
        let rendered = format_abort(&err);
        assert!(rendered.starts_with("abort: "));
        assert!(rendered.contains("(hint: run verify"));
        assert_eq!(rendered.lines().filter(|l| l.starts_with("abort:")).count(), 1);
    }
}
