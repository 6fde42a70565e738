//! Retention of store entries: stale entries go unconditionally, then age
//! and total-size limits are enforced, least-recently-modified first.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;
use crate::store::{read_header, source_mtime_ms};

struct Entry {
    path: PathBuf,
    size: u64,
    modified_ms: u64,
}

pub(crate) fn apply_retention(
    dir: &Path,
    max_age_ms: Option<u64>,
    max_size_bytes: Option<u64>,
) -> Result<()> {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    let mut entries = vec![];
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map(|e| e == "csb").unwrap_or(false) {
            let meta = std::fs::metadata(&path)?;
            let modified_ms = meta
                .modified()
                .ok()
                .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            entries.push(Entry {
                path,
                size: meta.len(),
                modified_ms,
            });
        }
    }

    // stale or unreadable entries are deleted unconditionally
    entries.retain(|entry| {
        let fresh = entry_is_fresh(&entry.path);
        if !fresh {
            tracing::debug!(entry = %entry.path.display(), "removing stale store entry");
            let _ = std::fs::remove_file(&entry.path);
        }
        fresh
    });

    if let Some(max_age_ms) = max_age_ms {
        entries.retain(|entry| {
            let expired = now_ms.saturating_sub(entry.modified_ms) > max_age_ms;
            if expired {
                tracing::debug!(entry = %entry.path.display(), "removing expired store entry");
                let _ = std::fs::remove_file(&entry.path);
            }
            !expired
        });
    }

    if let Some(max_size_bytes) = max_size_bytes {
        entries.sort_by_key(|entry| entry.modified_ms);
        let mut total: u64 = entries.iter().map(|entry| entry.size).sum();
        for entry in &entries {
            if total <= max_size_bytes {
                break;
            }
            tracing::debug!(entry = %entry.path.display(), "evicting store entry for size");
            let _ = std::fs::remove_file(&entry.path);
            total -= entry.size;
        }
    }
    Ok(())
}

/// An entry is fresh iff its header parses and the source file still exists
/// with the embedded mtime.
fn entry_is_fresh(path: &Path) -> bool {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(_) => return false,
    };
    let header = match read_header(&mut BufReader::new(file)) {
        Ok(header) => header,
        Err(_) => return false,
    };
    match source_mtime_ms(Path::new(&header.source_path)) {
        Ok(mtime) => mtime == header.source_mtime,
        Err(_) => false,
    }
}
