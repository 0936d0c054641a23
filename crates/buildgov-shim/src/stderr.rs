//! Bounded stderr capture and the diagnostic predicates.
//!
//! The shim tees the child's stderr: every chunk is forwarded unmodified
//! and also pushed into a fixed-size tail buffer. The point is a boolean
//! "did the tool produce a diagnostic of its own", plus a short digest for
//! the release request, never a transcript.

use std::collections::VecDeque;

/// Bytes of stderr tail retained for predicate matching.
pub const TAIL_CAPACITY_BYTES: usize = 4096;

/// Characters of tail included in the release request's digest.
pub const DIGEST_CHARS: usize = 500;

/// Fixed-size byte tail: keeps the last [`TAIL_CAPACITY_BYTES`] of
/// whatever is pushed, evicting the oldest bytes on overflow.
#[derive(Debug)]
pub struct StderrTail {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl StderrTail {
    /// Creates a tail with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(TAIL_CAPACITY_BYTES)
    }

    /// Creates a tail with an explicit capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "StderrTail capacity must be > 0");
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a chunk, evicting the oldest bytes beyond capacity.
    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.capacity {
            self.buf.clear();
            self.buf.extend(&chunk[chunk.len() - self.capacity..]);
            return;
        }
        let overflow = (self.buf.len() + chunk.len()).saturating_sub(self.capacity);
        self.buf.drain(..overflow);
        self.buf.extend(chunk);
    }

    /// The retained tail as text (lossy where the cut fell mid-UTF-8).
    #[must_use]
    pub fn as_text(&self) -> String {
        let (front, back) = self.buf.as_slices();
        let mut bytes = Vec::with_capacity(self.buf.len());
        bytes.extend_from_slice(front);
        bytes.extend_from_slice(back);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// The last [`DIGEST_CHARS`] characters of the tail, for the release
    /// request.
    #[must_use]
    pub fn digest(&self) -> String {
        let text = self.as_text();
        let chars: Vec<char> = text.chars().collect();
        let start = chars.len().saturating_sub(DIGEST_CHARS);
        chars[start..].iter().collect()
    }

    /// Whether nothing has been captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Default for StderrTail {
    fn default() -> Self {
        Self::new()
    }
}

/// Diagnostic predicate for compiler output: generic severity words, or an
/// MSVC compiler code like `C2065`.
#[must_use]
pub fn compiler_diagnostics(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("error") || lower.contains("warning") || lower.contains("fatal")
        || has_code(&lower, "c")
}

/// Diagnostic predicate for linker output: severity words, or a linker
/// code like `LNK2019`.
#[must_use]
pub fn linker_diagnostics(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("error") || lower.contains("warning") || lower.contains("fatal")
        || has_code(&lower, "lnk")
}

/// Scans lowercased text for `<prefix><4 digits>` with a non-alphanumeric
/// boundary on the left, e.g. "c2065" in " error c2065:" but not in
/// "abc2065".
fn has_code(lower: &str, prefix: &str) -> bool {
    let bytes = lower.as_bytes();
    let mut from = 0;
    while let Some(rel) = lower[from..].find(prefix) {
        let at = from + rel;
        let digits = &bytes[at + prefix.len()..];
        let left_ok = at == 0 || !bytes[at - 1].is_ascii_alphanumeric();
        if left_ok && digits.len() >= 4 && digits[..4].iter().all(u8::is_ascii_digit) {
            return true;
        }
        from = at + 1;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_the_newest_bytes() {
        let mut tail = StderrTail::with_capacity(8);
        tail.push(b"abcdef");
        tail.push(b"ghij");
        assert_eq!(tail.as_text(), "cdefghij");
    }

    #[test]
    fn tail_survives_a_chunk_larger_than_capacity() {
        let mut tail = StderrTail::with_capacity(4);
        tail.push(b"0123456789");
        assert_eq!(tail.as_text(), "6789");
    }

    #[test]
    fn digest_is_truncated_to_the_last_500_chars() {
        let mut tail = StderrTail::new();
        tail.push("x".repeat(2000).as_bytes());
        assert_eq!(tail.digest().chars().count(), DIGEST_CHARS);
    }

    #[test]
    fn digest_of_short_output_is_everything() {
        let mut tail = StderrTail::new();
        tail.push(b"widget.cpp(42): error C2065: undeclared identifier\n");
        assert!(tail.digest().contains("C2065"));
    }

    #[test]
    fn compiler_predicate_matches_msvc_diagnostics() {
        assert!(compiler_diagnostics(
            "widget.cpp(42): error C2065: 'frob': undeclared identifier"
        ));
        assert!(compiler_diagnostics("fatal error C1083: cannot open include file"));
        assert!(compiler_diagnostics("widget.cpp(7): warning C4244: conversion"));
        // A bare code with no severity word still counts.
        assert!(compiler_diagnostics("see C2440 for details"));
    }

    #[test]
    fn compiler_predicate_ignores_ordinary_output() {
        assert!(!compiler_diagnostics("widget.cpp"));
        assert!(!compiler_diagnostics("Generating code..."));
        // An embedded token is not a diagnostic code.
        assert!(!compiler_diagnostics("misc2065 artifacts written"));
        assert!(!compiler_diagnostics(""));
    }

    #[test]
    fn linker_predicate_matches_lnk_codes() {
        assert!(linker_diagnostics(
            "main.obj : error LNK2019: unresolved external symbol"
        ));
        assert!(linker_diagnostics("LNK1104: cannot open file 'app.exe'"));
        assert!(!linker_diagnostics("   Creating library app.lib"));
    }

    #[test]
    fn predicate_spans_chunk_boundaries_via_the_tail() {
        // "error" split across two writes is still visible in the
        // accumulated tail, which is what the shim tests.
        let mut tail = StderrTail::new();
        tail.push(b"er");
        tail.push(b"ror C2065");
        assert!(compiler_diagnostics(&tail.as_text()));
    }
}
