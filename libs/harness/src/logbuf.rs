//! Append-only log buffer shared between a deployment and its log streams.
//!
//! The platform exposes deployment output as a growing text stream with no
//! completion signal. Writers (the push output pipe and the log tail process)
//! append; readers only ever take a full snapshot. Since the buffer never
//! shrinks or reorders, anything a snapshot matches stays matched.

use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;

/// Cloneable handle to an append-only text buffer.
#[derive(Debug, Clone, Default)]
pub struct LogBuffer {
    inner: Arc<RwLock<String>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one line, terminating it with `\n` when the caller did not.
    pub fn append(&self, line: &str) {
        let mut buf = self.inner.write();
        buf.push_str(line);
        if !line.ends_with('\n') {
            buf.push('\n');
        }
    }

    /// Returns the full buffer contents as of now.
    pub fn snapshot(&self) -> String {
        self.inner.read().clone()
    }

    /// Snapshot with terminal color escapes removed.
    pub fn plain_snapshot(&self) -> String {
        strip_color(&self.inner.read())
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.plain_snapshot().contains(needle)
    }

    pub fn is_match(&self, pattern: &Regex) -> bool {
        pattern.is_match(&self.plain_snapshot())
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// Removes ANSI CSI sequences (`ESC [ ... letter`) from `text`.
pub fn strip_color(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\u{1b}' && chars.peek() == Some(&'[') {
            chars.next();
            for c in chars.by_ref() {
                if c.is_ascii_alphabetic() {
                    break;
                }
            }
            continue;
        }
        out.push(c);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_append_terminates_lines() {
        let buf = LogBuffer::new();
        buf.append("-----> Installing binaries");
        buf.append("       NodeJS 6.11.1\n");
        assert_eq!(
            buf.snapshot(),
            "-----> Installing binaries\n       NodeJS 6.11.1\n"
        );
    }

    #[test]
    fn test_clones_share_contents() {
        let buf = LogBuffer::new();
        let writer = buf.clone();
        writer.append("hello");
        assert!(buf.contains("hello"));
        assert_eq!(buf.len(), 6);
    }

    #[test]
    fn test_strip_color() {
        let colored = "\u{1b}[1;32mNodeJS\u{1b}[0m 6.\u{1b}[33m11\u{1b}[0m.1";
        assert_eq!(strip_color(colored), "NodeJS 6.11.1");
        assert_eq!(strip_color("no escapes"), "no escapes");
    }

    #[test]
    fn test_version_banner_matches_through_color() {
        let buf = LogBuffer::new();
        buf.append("\u{1b}[1mNodeJS 6\u{1b}[0m.11.1");
        let re = Regex::new(r"NodeJS 6\.\d+\.\d+").unwrap();
        assert!(buf.is_match(&re));
    }

    proptest! {
        #[test]
        fn prop_snapshot_match_is_monotonic(
            before in proptest::collection::vec("[a-z .]{0,12}", 0..6),
            after in proptest::collection::vec("[a-zA-Z0-9 .]{0,12}", 0..6),
        ) {
            let re = Regex::new(r"NodeJS \d+\.\d+\.\d+").unwrap();
            let buf = LogBuffer::new();
            for line in &before {
                buf.append(line);
            }
            buf.append("NodeJS 6.11.1");

            let first = buf.snapshot();
            prop_assert!(buf.is_match(&re));

            for line in &after {
                buf.append(line);
                let snap = buf.snapshot();
                prop_assert!(snap.starts_with(&first));
                prop_assert!(buf.is_match(&re));
            }
        }
    }
}
