/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Named extension points.
//!
//! Instead of runtime method patching, the core exposes a fixed set of
//! events with typed arguments. Built-ins and loaded extensions
//! register plain closures; the core fires events by name at the
//! documented moments. A non-`Ok` return from a `pre*` hook aborts the
//! surrounding operation with the hook's name.

use std::collections::HashMap;
use std::path::Path;

use types::Node;

use crate::errors::RepoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    /// Before a commit transaction commits; may veto.
    PreTxnCommit,
    /// Before an incoming changegroup commits; may veto.
    PreTxnChangegroup,
    /// After a transaction commits. Failures are logged, not raised.
    TxnClose,
    /// Before a pushkey namespace update (bookmarks, phases); may veto.
    PrePushkey,
}

impl HookEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HookEvent::PreTxnCommit => "pretxncommit",
            HookEvent::PreTxnChangegroup => "pretxnchangegroup",
            HookEvent::TxnClose => "txnclose",
            HookEvent::PrePushkey => "prepushkey",
        }
    }
}

/// Arguments passed to every hook.
pub struct HookArgs<'a> {
    pub event: HookEvent,
    pub repo_root: &'a Path,
    /// First new node, for transaction hooks.
    pub node: Option<Node>,
    /// Namespace and key, for pushkey hooks.
    pub key: Option<(&'a str, &'a str)>,
}

type HookFn = Box<dyn Fn(&HookArgs) -> Result<(), String> + Send + Sync>;

#[derive(Default)]
pub struct Hooks {
    registered: HashMap<HookEvent, Vec<(String, HookFn)>>,
}

impl Hooks {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn register(
        &mut self,
        event: HookEvent,
        name: impl Into<String>,
        hook: impl Fn(&HookArgs) -> Result<(), String> + Send + Sync + 'static,
    ) {
        self.registered
            .entry(event)
            .or_default()
            .push((name.into(), Box::new(hook)));
    }

    /// Run the hooks for `event` in registration order. The first
    /// failing pre-hook aborts; `TxnClose` failures only warn.
    pub fn fire(&self, args: &HookArgs) -> Result<(), RepoError> {
        for (name, hook) in self.registered.get(&args.event).into_iter().flatten() {
            if let Err(message) = hook(args) {
                if args.event == HookEvent::TxnClose {
                    tracing::warn!(hook = %name, %message, "post-transaction hook failed");
                    continue;
                }
                return Err(RepoError::HookAbort {
                    hook: format!("{}.{}", args.event.name(), name),
                    message,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use super::*;

    fn args(event: HookEvent) -> HookArgs<'static> {
        HookArgs {
            event,
            repo_root: Path::new("/repo"),
            node: None,
            key: None,
        }
    }

    #[test]
    fn test_hooks_run_in_order_and_veto() {
        let mut hooks = Hooks::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        hooks.register(HookEvent::PreTxnCommit, "count", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        hooks.register(HookEvent::PreTxnCommit, "veto", |_| {
            Err("changeset rejected".to_string())
        });
        hooks.register(HookEvent::PreTxnCommit, "after-veto", |_| {
            panic!("must not run after a veto");
        });

        let err = hooks.fire(&args(HookEvent::PreTxnCommit)).unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match err {
            RepoError::HookAbort { hook, message } => {
                assert_eq!(hook, "pretxncommit.veto");
                assert_eq!(message, "changeset rejected");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_txnclose_failures_do_not_abort() {
        let mut hooks = Hooks::new();
        hooks.register(HookEvent::TxnClose, "flaky", |_| Err("boom".to_string()));
        assert!(hooks.fire(&args(HookEvent::TxnClose)).is_ok());
    }

    #[test]
    fn test_unregistered_event_is_noop() {
        let hooks = Hooks::new();
        assert!(hooks.fire(&args(HookEvent::PrePushkey)).is_ok());
    }
}
