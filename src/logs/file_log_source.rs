//! File tailer
//!
//! Polls each configured file, reads only the bytes appended since the last
//! tick, and hands every complete non-blank line to a [`RecordSink`].
//!
//! Rotation is detected when the file shrinks below the stored cursor, or on
//! unix when the path now points at a different inode. In both cases the
//! cursor restarts at 0. A trailing line without a terminator is left unread
//! until it is complete.
//!
//! Cursors are mirrored into [`SharedPositions`] after every line so the
//! checkpoint thread always sees the latest consumed offset.

use super::{LineParser, LogRecord, RecordSink, SharedPositions, SourceIdentity};
use anyhow::{Context, Result};
use std::fs::{self, File, Metadata};
use std::io::{BufRead, BufReader, ErrorKind, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cursor state for one configured path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedFile {
    path: PathBuf,
    /// Last byte successfully consumed
    offset: u64,
    last_known_size: u64,
    /// Identity of the file the cursor refers to (unix only)
    inode: Option<u64>,
}

impl WatchedFile {
    /// Start watching `path`, resuming from `restored` when the checkpoint
    /// knows it, else from the current end of file.
    pub fn new(path: PathBuf, restored: Option<u64>) -> Self {
        let metadata = fs::metadata(&path).ok();
        let size = metadata.as_ref().map(Metadata::len).unwrap_or(0);
        let inode = metadata.as_ref().and_then(inode_of);

        let offset = match (restored, &metadata) {
            (Some(offset), _) => {
                info!(path = %path.display(), offset, "Resuming log file");
                offset
            }
            (None, Some(_)) => {
                info!(path = %path.display(), offset = size, "Monitoring log file");
                size
            }
            (None, None) => {
                warn!(path = %path.display(), "Log file not accessible, will read from start once it appears");
                0
            }
        };

        Self {
            path,
            offset,
            last_known_size: size,
            inode,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read whatever is new since the last call
    pub fn poll(
        &mut self,
        parser: &LineParser,
        source: &SourceIdentity,
        positions: &SharedPositions,
        sink: &dyn RecordSink,
    ) -> Result<PollOutcome> {
        let metadata = match fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(PollOutcome::Missing),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to stat {}", self.path.display()))
            }
        };

        let current_size = metadata.len();
        let current_inode = inode_of(&metadata);

        let replaced = matches!((self.inode, current_inode), (Some(old), Some(new)) if old != new);
        let rotated = current_size < self.offset || replaced;
        if rotated {
            info!(
                path = %self.path.display(),
                previous_offset = self.offset,
                current_size,
                replaced,
                "Log rotation detected"
            );
            self.offset = 0;
            positions.set(&self.path, 0);
        }
        self.inode = current_inode;
        self.last_known_size = current_size;

        if current_size <= self.offset {
            return Ok(if rotated {
                PollOutcome::Read {
                    lines: 0,
                    bytes: 0,
                    rotated,
                }
            } else {
                PollOutcome::Unchanged
            });
        }

        let file = File::open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(self.offset))
            .with_context(|| format!("Failed to seek {}", self.path.display()))?;

        let start = self.offset;
        let mut lines = 0;
        let mut chunk = Vec::new();

        loop {
            chunk.clear();
            let read = reader
                .read_until(b'\n', &mut chunk)
                .with_context(|| format!("Failed to read {}", self.path.display()))?;
            if read == 0 || chunk.last() != Some(&b'\n') {
                // EOF, possibly in the middle of a line still being written
                break;
            }

            let line_start = self.offset;
            self.offset += read as u64;

            let text = String::from_utf8_lossy(&chunk);
            let text = text.trim();
            if !text.is_empty() {
                let record =
                    LogRecord::from_parsed(parser.parse(text), &self.path, line_start, source.clone());
                sink.accept(&self.path, line_start, record);
                lines += 1;
            }
            positions.set(&self.path, self.offset);
        }

        let bytes = self.offset - start;
        if lines > 0 {
            debug!(path = %self.path.display(), lines, bytes, "Processed new log lines");
        }

        Ok(PollOutcome::Read {
            lines,
            bytes,
            rotated,
        })
    }
}

#[cfg(unix)]
fn inode_of(metadata: &Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.ino())
}

#[cfg(not(unix))]
fn inode_of(_metadata: &Metadata) -> Option<u64> {
    None
}

/// What one poll of one file did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Path does not exist right now
    Missing,
    /// Nothing new since the last poll
    Unchanged,
    Read {
        /// Non-blank lines forwarded to the sink
        lines: usize,
        /// Bytes the cursor advanced
        bytes: u64,
        rotated: bool,
    },
}

/// Totals for one pass over every watched file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub lines: usize,
    pub bytes: u64,
    pub rotations: usize,
    pub missing: usize,
    pub errors: usize,
}

/// Tails every configured file in configuration order
pub struct FileTailer {
    files: Vec<WatchedFile>,
    parser: LineParser,
    source: SourceIdentity,
    positions: Arc<SharedPositions>,
}

impl FileTailer {
    /// Create watchers for `paths`, restoring cursors from `positions`
    pub fn new(paths: &[PathBuf], positions: Arc<SharedPositions>, source: SourceIdentity) -> Self {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            if files.iter().any(|f: &WatchedFile| f.path() == path.as_path()) {
                continue;
            }
            let file = WatchedFile::new(path.clone(), positions.get(path));
            positions.set(file.path(), file.offset());
            files.push(file);
        }

        Self {
            files,
            parser: LineParser::new(),
            source,
            positions,
        }
    }

    pub fn files(&self) -> &[WatchedFile] {
        &self.files
    }

    /// Poll every file once. A failing file is logged and skipped; the
    /// others are still read.
    pub fn poll(&mut self, sink: &dyn RecordSink) -> PollSummary {
        let mut summary = PollSummary::default();

        for file in &mut self.files {
            match file.poll(&self.parser, &self.source, &self.positions, sink) {
                Ok(PollOutcome::Missing) => summary.missing += 1,
                Ok(PollOutcome::Unchanged) => {}
                Ok(PollOutcome::Read {
                    lines,
                    bytes,
                    rotated,
                }) => {
                    summary.lines += lines;
                    summary.bytes += bytes;
                    if rotated {
                        summary.rotations += 1;
                    }
                }
                Err(e) => {
                    summary.errors += 1;
                    warn!(path = %file.path().display(), "Error checking log file: {:#}", e);
                }
            }
        }

        summary
    }
}
