/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! An explicit UI handle.
//!
//! Components never print directly; they are handed a [`Ui`] value and
//! use its narrow contract: `status`, `warn`, `out`, `prompt` and
//! `progress`. The default handle writes to stdio; tests swap in a
//! capturing handle.

use std::io;
use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

/// Behavior switches, fixed at construction.
#[derive(Debug, Clone)]
pub struct UiOptions {
    pub quiet: bool,
    pub verbose: bool,
    /// Answer returned by prompts when no terminal is attached.
    pub default_answer: usize,
}

impl Default for UiOptions {
    fn default() -> Self {
        UiOptions {
            quiet: false,
            verbose: false,
            default_answer: 0,
        }
    }
}

/// Output and prompting for one logical operation.
#[derive(Clone)]
pub struct Ui {
    inner: Arc<Inner>,
}

struct Inner {
    out: Mutex<Box<dyn Write + Send>>,
    err: Mutex<Box<dyn Write + Send>>,
    options: UiOptions,
}

impl Ui {
    pub fn stdio() -> Self {
        Ui::new(
            UiOptions::default(),
            Box::new(io::stdout()),
            Box::new(io::stderr()),
        )
    }

    pub fn new(
        options: UiOptions,
        out: Box<dyn Write + Send>,
        err: Box<dyn Write + Send>,
    ) -> Self {
        Ui {
            inner: Arc::new(Inner {
                out: Mutex::new(out),
                err: Mutex::new(err),
                options,
            }),
        }
    }

    /// A handle that swallows all output. Used by tests and by callers
    /// that only want the return value of an operation.
    pub fn null() -> Self {
        Ui::new(
            UiOptions::default(),
            Box::new(io::sink()),
            Box::new(io::sink()),
        )
    }

    /// One line of progress narration, suppressed by `quiet`.
    pub fn status(&self, msg: &str) {
        if self.inner.options.quiet {
            return;
        }
        let mut err = self.inner.err.lock();
        let _ = writeln!(err, "{}", msg);
    }

    /// A warning line. Never suppressed.
    pub fn warn(&self, msg: &str) {
        let mut err = self.inner.err.lock();
        let _ = writeln!(err, "warning: {}", msg);
    }

    /// Verbose-only narration.
    pub fn note(&self, msg: &str) {
        if self.inner.options.verbose {
            self.status(msg);
        }
    }

    /// Raw command output.
    pub fn out(&self, bytes: &[u8]) {
        let mut out = self.inner.out.lock();
        let _ = out.write_all(bytes);
    }

    /// Ask the user to pick one of `choices`. Returns the index of the
    /// chosen item. Without a terminal the configured default wins.
    pub fn prompt(&self, msg: &str, choices: &[&str]) -> usize {
        let answer = self
            .inner
            .options
            .default_answer
            .min(choices.len().saturating_sub(1));
        tracing::debug!(msg, ?choices, answer, "non-interactive prompt");
        self.status(&format!("{} [{}]", msg, choices.get(answer).unwrap_or(&"")));
        answer
    }

    /// Report progress on `topic`. `total` of `None` means unbounded.
    pub fn progress(&self, topic: &str, position: u64, total: Option<u64>) {
        if self.inner.options.quiet {
            return;
        }
        match total {
            Some(total) => tracing::trace!(topic, position, total, "progress"),
            None => tracing::trace!(topic, position, "progress"),
        }
    }
}

/// Render an abort for the user: exactly one `abort:` line, then one
/// `(hint: ...)` line per hint.
pub fn format_abort(message: &str, hints: &[&str]) -> String {
    let mut out = format!("abort: {}\n", message);
    for hint in hints {
        out.push_str(&format!("(hint: {})\n", hint));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct Buf(Arc<Mutex<Vec<u8>>>);

    impl Write for Buf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_status_goes_to_err_stream() {
        let out = Buf::default();
        let err = Buf::default();
        let ui = Ui::new(
            UiOptions::default(),
            Box::new(out.clone()),
            Box::new(err.clone()),
        );
        ui.status("pulling");
        ui.out(b"raw\n");
        assert_eq!(&*err.0.lock(), b"pulling\n");
        assert_eq!(&*out.0.lock(), b"raw\n");
    }

    #[test]
    fn test_quiet_suppresses_status_but_not_warn() {
        let err = Buf::default();
        let options = UiOptions {
            quiet: true,
            ..Default::default()
        };
        let ui = Ui::new(options, Box::new(io::sink()), Box::new(err.clone()));
        ui.status("noise");
        ui.warn("trouble");
        assert_eq!(&*err.0.lock(), b"warning: trouble\n");
    }

    #[test]
    fn test_prompt_returns_default() {
        let ui = Ui::null();
        assert_eq!(ui.prompt("use (c)hanged version?", &["c", "d"]), 0);
    }

    #[test]
    fn test_format_abort() {
        assert_eq!(
            format_abort("push creates new remote head", &["pull and merge"]),
            "abort: push creates new remote head\n(hint: pull and merge)\n"
        );
    }
}
