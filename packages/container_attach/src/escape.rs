//! Escape-sequence detection on the client → container byte stream.
//!
//! The detector is a pure state machine: it never performs I/O and never
//! drops or reorders bytes that are not part of a completed detach sequence.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AttachError;

/// Ctrl-P
pub const DEFAULT_DETACH_FIRST: u8 = 0x10;
/// Ctrl-Q
pub const DEFAULT_DETACH_SECOND: u8 = 0x11;

const MAX_DETACH_KEYS: usize = 8;

/// The byte sequence that ends an attach session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DetachKeys(Vec<u8>);

impl Default for DetachKeys {
    fn default() -> Self {
        Self(vec![DEFAULT_DETACH_FIRST, DEFAULT_DETACH_SECOND])
    }
}

impl DetachKeys {
    pub fn new(keys: Vec<u8>) -> Result<Self, AttachError> {
        if keys.is_empty() || keys.len() > MAX_DETACH_KEYS {
            return Err(AttachError::InvalidDetachKeys(format!("{:?}", keys)));
        }
        Ok(Self(keys))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Parses the `ctrl-p,ctrl-q` notation. Each key is either a single
/// character or `ctrl-` followed by a letter or one of `@[\]^_`.
impl FromStr for DetachKeys {
    type Err = AttachError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AttachError::InvalidDetachKeys(s.to_string());
        let keys = s
            .split(',')
            .map(|key| parse_key(key.trim()).ok_or_else(invalid))
            .collect::<Result<Vec<u8>, _>>()?;
        if keys.len() > MAX_DETACH_KEYS {
            return Err(invalid());
        }
        Ok(Self(keys))
    }
}

fn parse_key(key: &str) -> Option<u8> {
    match key.strip_prefix("ctrl-") {
        Some(rest) => {
            let mut chars = rest.chars();
            let c = chars.next()?;
            if chars.next().is_some() {
                return None;
            }
            match c {
                'a'..='z' => Some(c as u8 - b'a' + 1),
                'A'..='Z' => Some(c as u8 - b'A' + 1),
                '@' => Some(0),
                '[' => Some(27),
                '\\' => Some(28),
                ']' => Some(29),
                '^' => Some(30),
                '_' => Some(31),
                _ => None,
            }
        }
        None => {
            let mut chars = key.chars();
            let c = chars.next()?;
            if chars.next().is_some() || !c.is_ascii() {
                return None;
            }
            Some(c as u8)
        }
    }
}

fn format_key(byte: u8) -> String {
    match byte {
        0 => "ctrl-@".to_string(),
        1..=26 => format!("ctrl-{}", (b'a' + byte - 1) as char),
        27 => "ctrl-[".to_string(),
        28 => "ctrl-\\".to_string(),
        29 => "ctrl-]".to_string(),
        30 => "ctrl-^".to_string(),
        31 => "ctrl-_".to_string(),
        _ => (byte as char).to_string(),
    }
}

impl fmt::Display for DetachKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self.0.iter().map(|b| format_key(*b)).collect();
        write!(f, "{}", keys.join(","))
    }
}

impl TryFrom<String> for DetachKeys {
    type Error = AttachError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DetachKeys> for String {
    fn from(keys: DetachKeys) -> Self {
        keys.to_string()
    }
}

/// Emitted once when the full detach sequence has been seen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DetachEvent {
    /// Index, in the chunk passed to `feed`, of the sequence's last byte.
    pub offset: usize,
}

/// Byte-level detach-sequence scanner for one session.
#[derive(Clone, Debug)]
pub struct EscapeDetector {
    keys: DetachKeys,
    matched: usize,
    detached: bool,
}

impl Default for EscapeDetector {
    fn default() -> Self {
        Self::new(DetachKeys::default())
    }
}

impl EscapeDetector {
    pub fn new(keys: DetachKeys) -> Self {
        Self {
            keys,
            matched: 0,
            detached: false,
        }
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Scan a chunk, appending every byte that should reach the container to
    /// `out`.
    ///
    /// A partial match at the end of the chunk is held back until the next
    /// call. Once the sequence completes, the rest of the chunk and any later
    /// input is discarded.
    pub fn feed(&mut self, data: &[u8], out: &mut Vec<u8>) -> Option<DetachEvent> {
        if self.detached {
            return None;
        }
        for (offset, &byte) in data.iter().enumerate() {
            if self.push(byte, out) {
                self.detached = true;
                return Some(DetachEvent { offset });
            }
        }
        None
    }

    /// End of input: release a held-back partial match.
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        if !self.detached {
            out.extend_from_slice(&self.keys.as_bytes()[..self.matched]);
        }
        self.matched = 0;
    }

    fn push(&mut self, byte: u8, out: &mut Vec<u8>) -> bool {
        let keys = self.keys.as_bytes();
        if byte == keys[self.matched] {
            self.matched += 1;
            if self.matched == keys.len() {
                self.matched = 0;
                return true;
            }
            return false;
        }
        if self.matched == 0 {
            out.push(byte);
            return false;
        }

        // Mismatch: the oldest held byte is released and the rest re-scanned,
        // so `ctrl-p ctrl-p ctrl-q` still detaches.
        let held = keys[..self.matched].to_vec();
        self.matched = 0;
        out.push(held[0]);
        held[1..]
            .iter()
            .copied()
            .chain(std::iter::once(byte))
            .any(|b| self.push(b, out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(detector: &mut EscapeDetector, chunks: &[&[u8]]) -> (Vec<u8>, bool) {
        let mut out = Vec::new();
        let mut detached = false;
        for chunk in chunks {
            if detector.feed(chunk, &mut out).is_some() {
                detached = true;
            }
        }
        (out, detached)
    }

    #[test]
    fn plain_bytes_pass_through() {
        let mut d = EscapeDetector::default();
        assert_eq!(scan(&mut d, &[b"hello\n"]), (b"hello\n".to_vec(), false));
    }

    #[test]
    fn sequence_detaches_and_discards_tail() {
        let mut d = EscapeDetector::default();
        let mut out = Vec::new();
        let event = d.feed(b"ab\x10\x11cd", &mut out);
        assert_eq!(event, Some(DetachEvent { offset: 3 }));
        assert_eq!(out, b"ab");
        assert!(d.is_detached());
        assert_eq!(d.feed(b"more", &mut out), None);
        d.finish(&mut out);
        assert_eq!(out, b"ab");
    }

    #[test]
    fn sequence_split_across_chunks() {
        let mut d = EscapeDetector::default();
        let (out, detached) = scan(&mut d, &[b"x\x10", b"\x11y"]);
        assert_eq!(out, b"x");
        assert!(detached);
    }

    #[test]
    fn first_key_then_other_byte_forwards_both() {
        let mut d = EscapeDetector::default();
        assert_eq!(scan(&mut d, &[b"\x10a"]), (b"\x10a".to_vec(), false));
    }

    #[test]
    fn repeated_first_key_stays_armed() {
        let mut d = EscapeDetector::default();
        let (out, detached) = scan(&mut d, &[b"\x10\x10\x11"]);
        assert_eq!(out, b"\x10");
        assert!(detached);
    }

    #[test]
    fn lone_trailing_first_key_flushed_at_end() {
        let mut d = EscapeDetector::default();
        let (mut out, detached) = scan(&mut d, &[b"abc\x10"]);
        assert_eq!(out, b"abc");
        assert!(!detached);
        d.finish(&mut out);
        assert_eq!(out, b"abc\x10");
    }

    #[test]
    fn second_key_alone_is_data() {
        let mut d = EscapeDetector::default();
        assert_eq!(scan(&mut d, &[b"\x11\x11"]), (b"\x11\x11".to_vec(), false));
    }

    #[test]
    fn longer_sequences_replay_partial_matches() {
        let keys: DetachKeys = "ctrl-a,ctrl-b,ctrl-c".parse().unwrap();
        let mut d = EscapeDetector::new(keys);
        let (out, detached) = scan(&mut d, &[b"\x01\x02\x01", b"\x02\x03"]);
        assert_eq!(out, b"\x01\x02");
        assert!(detached);
    }

    #[test]
    fn parse_default_notation() {
        let keys: DetachKeys = "ctrl-p,ctrl-q".parse().unwrap();
        assert_eq!(keys, DetachKeys::default());
        assert_eq!(keys.to_string(), "ctrl-p,ctrl-q");
    }

    #[test]
    fn parse_symbols_and_plain_chars() {
        let keys: DetachKeys = "ctrl-@, ctrl-[,ctrl-\\,ctrl-],ctrl-^,ctrl-_,a,Z".parse().unwrap();
        assert_eq!(keys.as_bytes(), &[0, 27, 28, 29, 30, 31, b'a', b'Z']);
        let again: DetachKeys = keys.to_string().parse().unwrap();
        assert_eq!(again, keys);
    }

    #[test]
    fn parse_rejects_bad_input() {
        for bad in ["", "ctrl-", "ctrl-pq", "ctrl-1", "ab", "a,b,c,d,e,f,g,h,i", "é"] {
            assert!(
                matches!(bad.parse::<DetachKeys>(), Err(AttachError::InvalidDetachKeys(_))),
                "{bad:?} should be rejected"
            );
        }
        assert!(DetachKeys::new(Vec::new()).is_err());
    }
}
