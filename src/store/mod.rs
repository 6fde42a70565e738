//! On-disk materialization store for full-scan results.
//!
//! Entries are block files keyed by `{source path, source mtime, optional
//! query key}`; the key is hashed into the file name, and the path and
//! mtime are embedded in the header so stale entries can be recognized and
//! deleted regardless of how they are found.
//!
//! File layout, little-endian throughout:
//!
//! ```text
//! magic        [u8; 4] = b"CST1"
//! version      u32
//! block_count  u32
//! total_rows   u64
//! source_mtime u64 (ms since epoch)
//! compression  u8
//! source_path  u16 length + bytes
//! schema       u32 column count, then per column:
//!              u16 name length + name bytes + u8 dtype tag
//! blocks       block_count repetitions, see `write`
//! ```

mod read;
mod retention;
mod write;

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use xxhash_rust::xxh64::xxh64;

use crate::compression::Compression;
use crate::error::{Error, Result};
use crate::frame::DataFrame;

pub(crate) use read::{read_frame, read_header};
pub(crate) use write::BlockWriter;

/// Rows per stored block.
pub(crate) const STORE_BLOCK_ROWS: usize = 65_536;

const ENTRY_EXTENSION: &str = "csb";

/// Configuration of a [`Store`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub dir: PathBuf,
    /// Entries older than this are deleted on open.
    pub max_age_ms: Option<u64>,
    /// Least-recently-modified entries are deleted until total size fits.
    pub max_size_bytes: Option<u64>,
    pub compression: Compression,
}

impl StoreOptions {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        let compression = if cfg!(feature = "snappy") {
            Compression::Snappy
        } else {
            Compression::Uncompressed
        };
        Self {
            dir: dir.into(),
            max_age_ms: None,
            max_size_bytes: None,
            compression,
        }
    }
}

/// A content-addressed directory of materialized scans.
///
/// Safe under concurrent readers: entries are immutable once written and
/// keyed by content identity.
#[derive(Debug)]
pub struct Store {
    options: StoreOptions,
}

impl Store {
    /// Opens (creating if needed) the store directory and applies retention.
    pub fn open(options: StoreOptions) -> Result<Store> {
        std::fs::create_dir_all(&options.dir)?;
        retention::apply_retention(&options.dir, options.max_age_ms, options.max_size_bytes)?;
        Ok(Store { options })
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    fn entry_path(&self, source: &Path, source_mtime: u64, query_key: Option<&str>) -> PathBuf {
        let mut keyed = source.to_string_lossy().into_owned().into_bytes();
        keyed.push(0xff);
        keyed.extend_from_slice(&source_mtime.to_le_bytes());
        keyed.push(0xff);
        if let Some(query_key) = query_key {
            keyed.extend_from_slice(query_key.as_bytes());
        }
        let key = xxh64(&keyed, 0);
        self.options
            .dir
            .join(format!("{:016x}.{}", key, ENTRY_EXTENSION))
    }

    /// Returns the stored frame for `source`, if a fresh entry exists.
    ///
    /// An entry whose embedded mtime no longer matches the file on disk is
    /// deleted and treated as a miss.
    pub fn lookup(&self, source: &Path, query_key: Option<&str>) -> Result<Option<DataFrame>> {
        let source_mtime = source_mtime_ms(source)?;
        let path = self.entry_path(source, source_mtime, query_key);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(_) => return Ok(None),
        };
        let mut reader = BufReader::new(file);
        let (header, frame) = read_frame(&mut reader)?;
        if header.source_mtime != source_mtime {
            tracing::debug!(entry = %path.display(), "stale store entry removed");
            let _ = std::fs::remove_file(&path);
            return Ok(None);
        }
        Ok(Some(frame))
    }

    /// Persists a materialized scan of `source`.
    pub fn put(&self, source: &Path, query_key: Option<&str>, frame: &DataFrame) -> Result<()> {
        let source_mtime = source_mtime_ms(source)?;
        let path = self.entry_path(source, source_mtime, query_key);
        let file = File::create(&path)?;
        let mut writer = BlockWriter::new(
            file,
            frame.schema().clone(),
            self.options.compression,
            source.to_string_lossy().into_owned(),
            source_mtime,
        );
        writer.start()?;
        let mut offset = 0;
        while offset < frame.num_rows() {
            let block = frame.slice(offset, STORE_BLOCK_ROWS)?;
            offset += block.num_rows();
            writer.write(&block)?;
        }
        if frame.num_rows() == 0 {
            // an empty frame still records its (empty) shape
            writer.write(frame)?;
        }
        writer.end()?;
        Ok(())
    }

    /// Deletes every entry.
    pub fn purge(&self) -> Result<()> {
        for entry in std::fs::read_dir(&self.options.dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == ENTRY_EXTENSION).unwrap_or(false) {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

pub(crate) fn source_mtime_ms(path: &Path) -> Result<u64> {
    let modified = std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_err(|e| Error::File(format!("cannot stat {}: {}", path.display(), e)))?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameBuilder, Value};
    use crate::schema::Schema;
    use crate::types::DType;

    fn frame(rows: usize) -> DataFrame {
        let schema = Schema::new(vec![
            ("id".to_string(), DType::Int32),
            ("name".to_string(), DType::Utf8),
            ("score".to_string(), DType::Float64),
        ])
        .unwrap();
        let mut builder = FrameBuilder::new(schema);
        for i in 0..rows {
            let name = if i % 3 == 0 {
                Value::Null
            } else {
                Value::Utf8(format!("row-{}", i % 7))
            };
            builder
                .push_row(&[Value::Int32(i as i32), name, Value::Float64(i as f64 / 2.0)])
                .unwrap();
        }
        builder.finish()
    }

    fn source_file(dir: &Path) -> PathBuf {
        let path = dir.join("source.csv");
        std::fs::write(&path, "id\n1\n").unwrap();
        path
    }

    #[test]
    fn roundtrip() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let source = source_file(dir.path());
        let store = Store::open(StoreOptions::new(dir.path().join("store")))?;

        let original = frame(1000);
        store.put(&source, None, &original)?;
        let loaded = store.lookup(&source, None)?.expect("entry exists");
        assert_eq!(loaded, original);
        Ok(())
    }

    #[test]
    fn query_keys_are_separate_entries() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let source = source_file(dir.path());
        let store = Store::open(StoreOptions::new(dir.path().join("store")))?;

        store.put(&source, Some("a"), &frame(10))?;
        store.put(&source, Some("b"), &frame(20))?;
        assert_eq!(store.lookup(&source, Some("a"))?.unwrap().num_rows(), 10);
        assert_eq!(store.lookup(&source, Some("b"))?.unwrap().num_rows(), 20);
        assert!(store.lookup(&source, None)?.is_none());
        Ok(())
    }

    #[test]
    fn mtime_change_invalidates() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let source = source_file(dir.path());
        let store = Store::open(StoreOptions::new(dir.path().join("store")))?;
        store.put(&source, None, &frame(5))?;

        // rewrite the source with a different mtime
        let past = std::time::SystemTime::now() - std::time::Duration::from_secs(3600);
        let file = File::options().write(true).open(&source).unwrap();
        file.set_modified(past).unwrap();

        assert!(store.lookup(&source, None)?.is_none());
        Ok(())
    }

    #[test]
    fn purge_removes_entries() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let source = source_file(dir.path());
        let store = Store::open(StoreOptions::new(dir.path().join("store")))?;
        store.put(&source, None, &frame(5))?;
        store.purge()?;
        assert!(store.lookup(&source, None)?.is_none());
        Ok(())
    }

    #[test]
    fn empty_frame_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let source = source_file(dir.path());
        let store = Store::open(StoreOptions::new(dir.path().join("store")))?;
        let empty = DataFrame::empty(frame(1).schema().clone());
        store.put(&source, None, &empty)?;
        let loaded = store.lookup(&source, None)?.unwrap();
        assert_eq!(loaded.num_rows(), 0);
        assert_eq!(loaded.schema(), empty.schema());
        Ok(())
    }
}
