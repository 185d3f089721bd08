//! # page
//!
//! why: name, parse and scan the files that hold the on-disk log
//! relations: used by FileStorage in lib.rs
//! what: PageName (open / closed file names), PageContents (entries + torn-tail detection)

use std::fs;
use std::path::Path;

use maelstrom_core::{LogEntry, LogIndex, StorageError};

const PAGE_SUFFIX: &str = ".log";
pub(crate) const TEMP_SUFFIX: &str = ".tmp";
const OPEN_PREFIX: &str = "open-";

/// What a file name in the data directory says about its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageName {
    /// Page still receiving appends, starting at `start`
    Open { start: LogIndex },
    /// Sealed page holding `start..end`
    Closed { start: LogIndex, end: LogIndex },
}

impl PageName {
    pub(crate) fn file_name(&self) -> String {
        match self {
            PageName::Open { start } => format!("{OPEN_PREFIX}{start:020}{PAGE_SUFFIX}"),
            PageName::Closed { start, end } => format!("{start:020}-{end:020}{PAGE_SUFFIX}"),
        }
    }

    /// Parse a directory entry; anything that is not a page yields None.
    pub(crate) fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(PAGE_SUFFIX)?;
        if let Some(start) = stem.strip_prefix(OPEN_PREFIX) {
            return Some(PageName::Open { start: start.parse().ok()? });
        }
        let (start, end) = stem.split_once('-')?;
        let start: LogIndex = start.parse().ok()?;
        let end: LogIndex = end.parse().ok()?;
        (start < end).then_some(PageName::Closed { start, end })
    }
}

/// Decoded contents of one page file.
#[derive(Debug)]
pub(crate) struct PageContents {
    pub entries: Vec<LogEntry>,
    /// Bytes up to the end of the last complete line
    pub valid_bytes: u64,
    /// True when bytes after `valid_bytes` had to be ignored
    pub torn: bool,
}

/// Read a page, checking that it holds consecutive entries from `start`.
///
/// A final line without its newline, or one that does not decode, is an
/// append that never finished; it is reported through `torn` and left out.
/// Damage anywhere else is corruption.
pub(crate) fn read_page(path: &Path, start: LogIndex) -> Result<PageContents, StorageError> {
    let bytes = fs::read(path)?;
    let mut entries = Vec::new();
    let mut offset = 0usize;

    while offset < bytes.len() {
        let rest = &bytes[offset..];
        let Some(newline) = rest.iter().position(|b| *b == b'\n') else {
            return Ok(torn(entries, offset));
        };
        let line = &rest[..newline];
        let is_last = offset + newline + 1 == bytes.len();
        let entry: LogEntry = match serde_json::from_slice(line) {
            Ok(entry) => entry,
            Err(_) if is_last => return Ok(torn(entries, offset)),
            Err(err) => {
                return Err(StorageError::Corrupt(format!(
                    "{}: bad entry at byte {offset}: {err}",
                    path.display()
                )))
            }
        };
        let expected = start + entries.len() as LogIndex;
        if entry.index != expected {
            return Err(StorageError::Corrupt(format!(
                "{}: expected index {expected}, found {}",
                path.display(),
                entry.index
            )));
        }
        entries.push(entry);
        offset += newline + 1;
    }

    Ok(PageContents { entries, valid_bytes: offset as u64, torn: false })
}

fn torn(entries: Vec<LogEntry>, offset: usize) -> PageContents {
    PageContents { entries, valid_bytes: offset as u64, torn: true }
}

/// One entry as a page line, newline included.
pub(crate) fn encode_line(entry: &LogEntry) -> Result<Vec<u8>, StorageError> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');
    Ok(line)
}
