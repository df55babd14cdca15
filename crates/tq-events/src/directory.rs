//! In-memory index of persisted event files and its on-disk projection.
//!
//! The index is authoritative once loaded: the directory file is written
//! through on every change and never read back except at startup.
//! [`FileIndex::rebuild`] and [`FileIndex::persist`] are the only conversions
//! between the two views.
//!
//! Directory file format, one entry per line:
//!
//! ```text
//! <filename>\t<size in bytes>\n
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tq_common::{Error, Result, UserId};
use tracing::warn;

/// Seconds between 1601-01-01 and 1970-01-01.
const EPOCH_1601_OFFSET_SECS: i64 = 11_644_473_600;
const TICKS_PER_SECOND: u64 = 10_000_000;

const EVENT_FILE_SUFFIX: &str = ".json";
const DIRECTORY_FILE_SUFFIX: &str = ".dir";

/// Key of a user's directory file.
pub fn directory_key(prefix: &str, user: UserId) -> String {
    format!("{prefix}{user}{DIRECTORY_FILE_SUFFIX}")
}

/// Key of an event file for the given tick value.
pub fn event_file_key(prefix: &str, ticks: u64) -> String {
    format!("{prefix}{ticks:016X}{EVENT_FILE_SUFFIX}")
}

/// 100-ns intervals since 1601-01-01 UTC. Earlier instants clamp to zero.
pub fn ticks_since_1601(ts: DateTime<Utc>) -> u64 {
    let secs = ts.timestamp().saturating_add(EPOCH_1601_OFFSET_SECS);
    if secs < 0 {
        return 0;
    }
    (secs as u64)
        .saturating_mul(TICKS_PER_SECOND)
        .saturating_add(u64::from(ts.timestamp_subsec_nanos() / 100))
}

/// Tick value encoded in an event file key, if it is one of ours.
pub fn parse_event_file_ticks(prefix: &str, key: &str) -> Option<u64> {
    let hex = key.strip_prefix(prefix)?.strip_suffix(EVENT_FILE_SUFFIX)?;
    if hex.len() != 16 {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}

/// Persisted event files, ordered by name (which is creation order).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileIndex {
    files: BTreeMap<String, u64>,
    total: u64,
}

impl FileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a directory file strictly. Any malformed line is an error.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| Error::CorruptDirectory("directory file is not valid UTF-8".into()))?;
        let mut index = Self::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            let (name, size) = parse_line(line).ok_or_else(|| {
                Error::CorruptDirectory(format!("line {}: {:?}", lineno + 1, line))
            })?;
            index.insert(name, size);
        }
        Ok(index)
    }

    /// Parse a directory file, skipping (and logging) malformed lines.
    pub fn rebuild(bytes: &[u8]) -> Self {
        let text = String::from_utf8_lossy(bytes);
        let mut index = Self::new();
        for line in text.lines().filter(|l| !l.is_empty()) {
            match parse_line(line) {
                Some((name, size)) => index.insert(name, size),
                None => warn!(line = %line, "skipping malformed directory entry"),
            }
        }
        index
    }

    /// Serialize to the directory file format.
    pub fn persist(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.files.len() * 32);
        for (name, size) in &self.files {
            out.extend_from_slice(name.as_bytes());
            out.push(b'\t');
            out.extend_from_slice(size.to_string().as_bytes());
            out.push(b'\n');
        }
        out
    }

    /// Set a file's size, adding the entry if needed.
    pub fn insert(&mut self, name: impl Into<String>, size: u64) {
        let previous = self.files.insert(name.into(), size).unwrap_or(0);
        self.total = self.total.saturating_sub(previous).saturating_add(size);
    }

    pub fn remove(&mut self, name: &str) -> Option<u64> {
        let size = self.files.remove(name)?;
        self.total = self.total.saturating_sub(size);
        Some(size)
    }

    /// Add entries from `other` that this index does not already have.
    pub fn merge_missing(&mut self, other: FileIndex) {
        for (name, size) in other.files {
            if !self.files.contains_key(&name) {
                self.insert(name, size);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.files.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    pub fn total_size(&self) -> u64 {
        self.total
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn oldest(&self) -> Option<(&str, u64)> {
        self.files.iter().next().map(|(n, s)| (n.as_str(), *s))
    }

    pub fn newest(&self) -> Option<(&str, u64)> {
        self.files.iter().next_back().map(|(n, s)| (n.as_str(), *s))
    }

    /// Remove and return the oldest entry.
    pub fn pop_oldest(&mut self) -> Option<(String, u64)> {
        let (name, size) = self.files.pop_first()?;
        self.total = self.total.saturating_sub(size);
        Some((name, size))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.files.iter().map(|(n, s)| (n.as_str(), *s))
    }

    /// Name for a new event file whose earliest event is `earliest`.
    ///
    /// Always sorts after every indexed file, so recovered events with old
    /// timestamps cannot produce a name that collides with or precedes an
    /// existing file.
    pub fn next_file_name(&self, prefix: &str, earliest: DateTime<Utc>) -> String {
        let mut ticks = ticks_since_1601(earliest);
        if let Some((newest, _)) = self.newest() {
            match parse_event_file_ticks(prefix, newest) {
                Some(newest_ticks) if ticks <= newest_ticks => {
                    ticks = newest_ticks.saturating_add(1);
                }
                _ => {}
            }
        }
        event_file_key(prefix, ticks)
    }
}

fn parse_line(line: &str) -> Option<(&str, u64)> {
    let (name, size) = line.split_once('\t')?;
    if name.is_empty() {
        return None;
    }
    Some((name, size.trim().parse().ok()?))
}
