//! # maelstrom-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: implements maelstrom-core's Storage trait, opened by maelstrom-server per node
//! what: FileStorage (meta.json + paged newline-delimited log), re-exports of the core storage types
//!
//! Directory layout:
//!
//! ```text
//! meta.json                                      term and vote
//! 00000000000000000001-00000000000000000513.log  closed page, entries 1..513
//! open-00000000000000000513.log                  open page, entries 513..
//! ```

mod page;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use maelstrom_core::{LogEntry, LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use page::{encode_line, read_page, PageName, TEMP_SUFFIX};

pub use maelstrom_core::{HardState, InMemoryStorage, Storage, StorageError};

/// Pages are sealed once they would grow past this many bytes.
pub const DEFAULT_MAX_PAGE_BYTES: u64 = 1024 * 1024;

const META_FILE: &str = "meta.json";

/// metadata structure for term and vote
#[derive(Serialize, Deserialize, Default)]
struct MetaData {
    term: Term,
    voted_for: Option<NodeId>,
}

#[derive(Debug, Clone, Copy)]
struct ClosedPage {
    start: LogIndex,
    end: LogIndex,
}

#[derive(Debug)]
struct OpenPage {
    start: LogIndex,
    file: File,
    bytes: u64,
}

/// File-based storage: one metadata file plus a run of log pages.
///
/// Every mutating call fsyncs before returning. Appends go to the open page
/// only; a page that would exceed `max_page_bytes` is sealed by renaming it
/// to its index range, and a fresh open page takes over.
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    max_page_bytes: u64,
    hard_state: HardState,
    closed: Vec<ClosedPage>,
    open: OpenPage,
    /// index the next appended entry must carry
    next_index: LogIndex,
}

impl FileStorage {
    /// Open (or create) storage in `dir` with the default page size.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        Self::with_page_size(dir, DEFAULT_MAX_PAGE_BYTES)
    }

    /// Open (or create) storage in `dir`, recovering from an interrupted
    /// append or truncation.
    pub fn with_page_size(dir: impl Into<PathBuf>, max_page_bytes: u64) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let hard_state = load_meta(&dir)?;

        let mut open_pages = Vec::new();
        let mut closed_pages = Vec::new();
        for dirent in fs::read_dir(&dir)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(TEMP_SUFFIX) {
                // leftover of a write that never got renamed into place
                fs::remove_file(dirent.path())?;
                continue;
            }
            match PageName::parse(name) {
                Some(PageName::Open { start }) => open_pages.push(start),
                Some(PageName::Closed { start, end }) => closed_pages.push(ClosedPage { start, end }),
                None => {}
            }
        }
        closed_pages.sort_by_key(|p| p.start);
        open_pages.sort_unstable();

        if open_pages.len() > 1 {
            return Err(StorageError::Corrupt(format!(
                "{} open pages in {}",
                open_pages.len(),
                dir.display()
            )));
        }

        // A truncation that rewrote a sealed page renames the rewrite to an
        // open page first and deletes the sealed original second. Finding both
        // means the second step never ran.
        if let Some(open_start) = open_pages.first() {
            if let Some(pos) = closed_pages.iter().position(|p| p.start == *open_start) {
                let stale = closed_pages.remove(pos);
                warn!(start = stale.start, end = stale.end, "finishing interrupted truncation");
                fs::remove_file(dir.join(closed_name(stale)))?;
            }
        }

        let mut expected = 1;
        for page in &closed_pages {
            if page.start != expected {
                return Err(StorageError::Corrupt(format!(
                    "page starting at {} found where index {expected} was expected",
                    page.start
                )));
            }
            expected = page.end;
        }

        let open_start = open_pages.first().copied().unwrap_or(expected);
        if open_start != expected {
            return Err(StorageError::Corrupt(format!(
                "open page starts at {open_start}, expected {expected}"
            )));
        }
        let open_path = dir.join(PageName::Open { start: open_start }.file_name());
        let (entries, bytes) = if open_path.exists() {
            let contents = read_page(&open_path, open_start)?;
            if contents.torn {
                warn!(
                    page = %open_path.display(),
                    valid_bytes = contents.valid_bytes,
                    "discarding torn tail of open page"
                );
                let file = OpenOptions::new().write(true).open(&open_path)?;
                file.set_len(contents.valid_bytes)?;
                file.sync_all()?;
            }
            (contents.entries.len() as LogIndex, contents.valid_bytes)
        } else {
            File::create(&open_path)?.sync_all()?;
            sync_dir(&dir)?;
            (0, 0)
        };
        let file = OpenOptions::new().append(true).open(&open_path)?;

        info!(
            dir = %dir.display(),
            term = hard_state.term,
            pages = closed_pages.len() + 1,
            last_index = open_start + entries - 1,
            "file storage opened"
        );

        Ok(Self {
            dir,
            max_page_bytes,
            hard_state,
            closed: closed_pages,
            open: OpenPage { start: open_start, file, bytes },
            next_index: open_start + entries,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of page files, the open one included.
    pub fn page_count(&self) -> usize {
        self.closed.len() + 1
    }

    /// get the path to the metadata file
    fn meta_path(&self) -> PathBuf {
        self.dir.join(META_FILE)
    }

    fn open_path(&self) -> PathBuf {
        self.dir.join(PageName::Open { start: self.open.start }.file_name())
    }

    /// Seal the open page at `next_index` and start a new one there.
    fn roll_page(&mut self) -> Result<(), StorageError> {
        let sealed = ClosedPage { start: self.open.start, end: self.next_index };
        self.open.file.sync_data()?;
        fs::rename(self.open_path(), self.dir.join(closed_name(sealed)))?;
        self.closed.push(sealed);
        self.start_open_page(self.next_index)?;
        debug!(start = sealed.start, end = sealed.end, "sealed log page");
        Ok(())
    }

    fn start_open_page(&mut self, start: LogIndex) -> Result<(), StorageError> {
        let path = self.dir.join(PageName::Open { start }.file_name());
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.sync_all()?;
        sync_dir(&self.dir)?;
        self.open = OpenPage { start, file, bytes: 0 };
        Ok(())
    }

    /// Replace the page starting at `start` with an open page holding only
    /// the entries below `from_index`.
    fn rewrite_as_open(&mut self, start: LogIndex, old: PathBuf, from_index: LogIndex) -> Result<(), StorageError> {
        let kept = read_page(&old, start)?
            .entries
            .into_iter()
            .filter(|e| e.index < from_index);
        let mut buf = Vec::new();
        for entry in kept {
            buf.extend(encode_line(&entry)?);
        }

        let target = self.dir.join(PageName::Open { start }.file_name());
        let temp = self.dir.join(format!("{}{TEMP_SUFFIX}", PageName::Open { start }.file_name()));
        let mut file = File::create(&temp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        fs::rename(&temp, &target)?;
        if old != target {
            fs::remove_file(&old)?;
        }
        sync_dir(&self.dir)?;

        let file = OpenOptions::new().append(true).open(&target)?;
        self.open = OpenPage { start, file, bytes: buf.len() as u64 };
        Ok(())
    }
}

fn closed_name(page: ClosedPage) -> String {
    PageName::Closed { start: page.start, end: page.end }.file_name()
}

fn load_meta(dir: &Path) -> Result<HardState, StorageError> {
    let path = dir.join(META_FILE);
    if !path.exists() {
        return Ok(HardState::default()); // default for new nodes
    }
    let mut contents = String::new();
    File::open(&path)?.read_to_string(&mut contents)?;
    let meta: MetaData = serde_json::from_str(&contents)?;
    Ok(HardState { term: meta.term, voted_for: meta.voted_for })
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

impl Storage for FileStorage {
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<(), StorageError> {
        let meta = MetaData { term, voted_for };
        let json = serde_json::to_string_pretty(&meta)?;

        // atomic write: write to temp file then rename
        let temp_path = self.dir.join(format!("{META_FILE}{TEMP_SUFFIX}"));
        let mut file = File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, self.meta_path())?;
        sync_dir(&self.dir)?;

        self.hard_state = HardState { term, voted_for };
        Ok(())
    }

    fn load_term_and_vote(&self) -> Result<HardState, StorageError> {
        Ok(self.hard_state)
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        if first.index != self.next_index {
            return Err(StorageError::Corrupt(format!(
                "append at index {} but the log ends before {}",
                first.index, self.next_index
            )));
        }

        let mut pending = Vec::new();
        for entry in entries {
            let line = encode_line(entry)?;
            let page_len = self.open.bytes + pending.len() as u64;
            if page_len > 0 && page_len + line.len() as u64 > self.max_page_bytes {
                self.open.file.write_all(&pending)?;
                self.open.bytes += pending.len() as u64;
                pending.clear();
                self.roll_page()?;
            }
            pending.extend(line);
            self.next_index = entry.index + 1;
        }
        self.open.file.write_all(&pending)?;
        self.open.file.sync_data()?;
        self.open.bytes += pending.len() as u64;
        Ok(())
    }

    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError> {
        let mut log = Vec::new();
        for page in &self.closed {
            let contents = read_page(&self.dir.join(closed_name(*page)), page.start)?;
            if contents.torn || contents.entries.len() as LogIndex != page.end - page.start {
                return Err(StorageError::Corrupt(format!(
                    "sealed page {}..{} is incomplete",
                    page.start, page.end
                )));
            }
            log.extend(contents.entries);
        }
        log.extend(read_page(&self.open_path(), self.open.start)?.entries);
        Ok(log)
    }

    fn truncate_log_from(&mut self, from_index: LogIndex) -> Result<(), StorageError> {
        let from_index = from_index.max(1);
        if from_index >= self.next_index {
            return Ok(());
        }

        // drop whole pages from the tail first so a crash leaves a valid prefix
        if self.open.start >= from_index {
            fs::remove_file(self.open_path())?;
        }
        while let Some(page) = self.closed.last().copied() {
            if page.start < from_index {
                break;
            }
            fs::remove_file(self.dir.join(closed_name(page)))?;
            self.closed.pop();
        }
        sync_dir(&self.dir)?;

        if self.open.start < from_index {
            // the cut falls inside the open page
            let path = self.open_path();
            self.rewrite_as_open(self.open.start, path, from_index)?;
        } else {
            match self.closed.last().copied() {
                Some(page) if page.end > from_index => {
                    self.closed.pop();
                    self.rewrite_as_open(page.start, self.dir.join(closed_name(page)), from_index)?;
                }
                _ => self.start_open_page(from_index)?,
            }
        }
        self.next_index = from_index;
        debug!(from_index, pages = self.page_count(), "truncated log");
        Ok(())
    }
}
