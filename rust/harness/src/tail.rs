//! Incremental reading of append-only log files.

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::Path,
};

/// Lines read by one [`TailReader::poll`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TailChunk {
    /// Complete, non-empty lines in file order.
    pub lines: Vec<String>,
    /// The file shrank since the last poll and was re-read from the start.
    pub reset: bool,
}

/// Remembers how far into a file complete lines have been consumed.
#[derive(Debug, Default, Clone)]
pub struct TailReader {
    offset: u64,
    /// Inside an oversized line; drop bytes up to its newline.
    discarding: bool,
}

impl TailReader {
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read complete lines appended since the last poll, at most `max_bytes`.
    ///
    /// A trailing line without a newline is left for the next poll. A single
    /// line longer than `max_bytes` is skipped whole, across as many polls as
    /// it takes, so the reader cannot stall.
    pub fn poll(&mut self, path: &Path, max_bytes: u64) -> io::Result<TailChunk> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();

        let mut chunk = TailChunk::default();
        if len < self.offset {
            tracing::debug!(path = %path.display(), "file shrank, re-reading from the start");
            self.offset = 0;
            self.discarding = false;
            chunk.reset = true;
        }
        if len == self.offset {
            return Ok(chunk);
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let want = (len - self.offset).min(max_bytes);
        let mut buf = Vec::new();
        file.take(want).read_to_end(&mut buf)?;

        let mut start = 0;
        if self.discarding {
            let Some(newline) = buf.iter().position(|b| *b == b'\n') else {
                self.offset += buf.len() as u64;
                return Ok(chunk);
            };
            start = newline + 1;
            self.discarding = false;
        }

        let Some(end) = buf.iter().rposition(|b| *b == b'\n').filter(|e| *e >= start) else {
            let pending = buf.len() - start;
            if start == 0 && pending as u64 >= max_bytes {
                tracing::debug!(path = %path.display(), bytes = pending, "skipping oversized line");
                self.offset += pending as u64;
                self.discarding = true;
            } else {
                self.offset += start as u64;
            }
            return Ok(chunk);
        };
        self.offset += end as u64 + 1;

        chunk.lines = String::from_utf8_lossy(&buf[start..end])
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        Ok(chunk)
    }
}
