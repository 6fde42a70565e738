//! Per-file row-offset index.
//!
//! A single streaming pass over the file records the byte offset of every
//! data row, so any row range can later be fetched with one positioned read.

use std::io::Read;

use crate::error::{Error, Result};

/// Offsets per segment. Segmenting bounds the size of a single allocation
/// for very large files.
pub const SEGMENT_CAPACITY: usize = 1_000_000;

/// Bytes read per window while scanning for newlines.
pub(crate) const SCAN_WINDOW: usize = 32 * 1024 * 1024;

/// Byte offsets of every data row of one file.
///
/// Logically an array of `row_count + 1` offsets: `offset(i)` is the first
/// byte of row `i` and the final offset is the exclusive end of the last row.
/// Immutable after construction and safe to share.
#[derive(Debug, Clone)]
pub struct RowIndex {
    segments: Vec<Vec<u64>>,
    len: usize,
}

impl RowIndex {
    fn empty() -> Self {
        Self {
            segments: vec![],
            len: 0,
        }
    }

    fn push(&mut self, offset: u64) {
        if self
            .segments
            .last()
            .map(|s| s.len() == SEGMENT_CAPACITY)
            .unwrap_or(true)
        {
            self.segments.push(Vec::with_capacity(SEGMENT_CAPACITY));
        }
        self.segments.last_mut().unwrap().push(offset);
        self.len += 1;
    }

    fn pop(&mut self) -> Option<u64> {
        let last = self.segments.last_mut()?;
        let offset = last.pop();
        if offset.is_some() {
            self.len -= 1;
            if last.is_empty() {
                self.segments.pop();
            }
        }
        offset
    }

    fn remove_first(&mut self) {
        if let Some(first) = self.segments.first_mut() {
            first.remove(0);
            self.len -= 1;
            if first.is_empty() {
                self.segments.remove(0);
            }
        }
    }

    #[inline]
    fn offset(&self, i: usize) -> u64 {
        self.segments[i / SEGMENT_CAPACITY][i % SEGMENT_CAPACITY]
    }

    fn last(&self) -> Option<u64> {
        self.segments.last().and_then(|s| s.last()).copied()
    }

    /// Number of data rows.
    pub fn row_count(&self) -> usize {
        self.len.saturating_sub(1)
    }

    /// The first byte of row `i`.
    pub fn row_offset(&self, i: usize) -> Result<u64> {
        if i >= self.row_count() {
            return Err(Error::OutOfBounds(format!(
                "row {} of a file with {} rows",
                i,
                self.row_count()
            )));
        }
        Ok(self.offset(i))
    }

    /// The byte range `[start, end)` covering rows `i..j`.
    ///
    /// Well-defined for any `0 <= i <= j <= row_count`; `j == row_count`
    /// yields the end of the file.
    pub fn rows_range(&self, i: usize, j: usize) -> Result<(u64, u64)> {
        if i > j || j > self.row_count() {
            return Err(Error::OutOfBounds(format!(
                "row range {}..{} of a file with {} rows",
                i,
                j,
                self.row_count()
            )));
        }
        Ok((self.offset(i), self.offset(j)))
    }

    /// Builds the index by scanning `reader` once in [`SCAN_WINDOW`] windows.
    ///
    /// Records the position just after every `\n`, then trims the header row
    /// (when `has_header`), trims trailing empty lines, and appends the
    /// end-of-file offset so [`RowIndex::rows_range`] is total.
    pub fn build<R: Read>(mut reader: R, has_header: bool) -> Result<Self> {
        let mut builder = RowIndexBuilder::new();
        let mut window = vec![0u8; SCAN_WINDOW];
        loop {
            let read = reader.read(&mut window)?;
            if read == 0 {
                break;
            }
            builder.feed(&window[..read]);
        }
        Ok(builder.finish(has_header))
    }

    fn finish_scan(mut index: RowIndex, file_end: u64, has_header: bool) -> Self {
        if has_header {
            index.remove_first();
        }
        // Trim the trailing empty region so the final offset is the exclusive
        // end of the last data row (file size, or last newline + 1). An offset
        // equal to EOF starts no row; a 1-byte row ending at a recorded
        // offset is a blank line.
        let mut end = file_end;
        let mut after_newline = index.last() == Some(file_end) && file_end > 0;
        if after_newline {
            index.pop();
        }
        while let Some(last) = index.last() {
            if after_newline && end == last + 1 {
                index.pop();
                end = last;
            } else {
                break;
            }
            after_newline = true;
        }
        // an empty file leaves only the pre-seeded 0, which starts no row
        if index.last() == Some(end) {
            index.pop();
        }
        index.push(end);
        index
    }
}

/// Incremental index construction over byte windows; shared by the
/// synchronous and async builders.
pub(crate) struct RowIndexBuilder {
    index: RowIndex,
    position: u64,
}

impl RowIndexBuilder {
    pub fn new() -> Self {
        let mut index = RowIndex::empty();
        index.push(0);
        Self { index, position: 0 }
    }

    /// Scans one window for newlines.
    pub fn feed(&mut self, window: &[u8]) {
        for (i, byte) in window.iter().enumerate() {
            if *byte == b'\n' {
                self.index.push(self.position + i as u64 + 1);
            }
        }
        self.position += window.len() as u64;
    }

    /// Applies header and trailing-empty trimming and seals the index.
    pub fn finish(self, has_header: bool) -> RowIndex {
        RowIndex::finish_scan(self.index, self.position, has_header)
    }
}
