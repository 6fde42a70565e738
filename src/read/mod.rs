//! Reading delimited files: eager materialization and scan plumbing.

mod cache;
mod parser;
mod reader;
#[cfg(feature = "async")]
#[cfg_attr(docsrs, doc(cfg(feature = "async")))]
pub mod stream;

pub use cache::{estimate_size, CacheOptions, ChunkCache};
pub use parser::{
    parse_bool_bytes, parse_chunk_bytes, parse_f64_bytes, parse_i32_bytes, ParseOptions,
    PredValue, ScanPredicate, DEFAULT_NULL_VALUES,
};
pub use reader::ChunkReader;

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use fallible_streaming_iterator::FallibleStreamingIterator;

use crate::datetime::DatetimeFormat;
use crate::error::{Error, QueryOutput, Result};
use crate::exec::CancelToken;
use crate::frame::DataFrame;
use crate::indexes::RowIndex;
use crate::memory::MemoryTracker;
use crate::schema::Schema;
use crate::types::DType;
use crate::{DEFAULT_CACHE_BYTES, DEFAULT_CHUNK_SIZE};

/// Options of [`read_csv`] and of scans.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    pub delimiter: u8,
    pub has_header: bool,
    /// Stop after this many data rows.
    pub max_rows: Option<usize>,
    /// Rows sampled for schema inference when no schema is given.
    pub sample_rows: usize,
    /// The file's schema; inferred by sampling when absent.
    pub schema: Option<Schema>,
    /// Additional textual values decoded as null.
    pub null_values: Vec<String>,
    /// Record validity bitmaps while parsing.
    pub nullable: bool,
    /// Error on unparsable numerics instead of defaulting to zero.
    pub strict_numeric: bool,
    /// Rows per chunk.
    pub chunk_size: usize,
    /// A per-call budget; when set, the read runs under its own tracker
    /// instead of the process-wide one.
    pub memory_limit_bytes: Option<usize>,
    /// Byte budget of the chunk LRU cache.
    pub cache_memory_bytes: usize,
    /// Format per `DateTime` column; unlisted columns parse as ISO.
    pub datetime_formats: HashMap<String, DatetimeFormat>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            has_header: true,
            max_rows: None,
            sample_rows: 100,
            schema: None,
            null_values: vec![],
            nullable: false,
            strict_numeric: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            memory_limit_bytes: None,
            cache_memory_bytes: DEFAULT_CACHE_BYTES,
            datetime_formats: HashMap::new(),
        }
    }
}

impl ReadOptions {
    pub(crate) fn parse_options(&self) -> ParseOptions {
        let mut null_values: Vec<Vec<u8>> = DEFAULT_NULL_VALUES
            .iter()
            .map(|v| v.as_bytes().to_vec())
            .collect();
        null_values.extend(self.null_values.iter().map(|v| v.as_bytes().to_vec()));
        ParseOptions {
            delimiter: self.delimiter,
            strict_numeric: self.strict_numeric,
            track_nulls: self.nullable,
            null_values,
            datetime_formats: self.datetime_formats.clone(),
        }
    }

    pub(crate) fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            max_memory_bytes: self.cache_memory_bytes,
            chunk_size: self.chunk_size,
        }
    }
}

/// An opened, indexed file with a resolved schema.
pub(crate) struct IndexedCsv {
    pub file: File,
    pub index: Arc<RowIndex>,
    pub schema: Schema,
    pub file_size: u64,
}

/// Opens `path`, builds its row index, and resolves the schema (from the
/// options, or by sampling).
pub(crate) fn open_csv(path: &Path, options: &ReadOptions) -> Result<IndexedCsv> {
    let file = File::open(path)
        .map_err(|e| Error::File(format!("cannot open {}: {}", path.display(), e)))?;
    let file_size = file.metadata()?.len();
    let index = Arc::new(RowIndex::build(BufReader::new(&file), options.has_header)?);
    let schema = match &options.schema {
        Some(schema) => schema.clone(),
        None => infer_schema(path, &file, &index, options)?,
    };
    Ok(IndexedCsv {
        file,
        index,
        schema,
        file_size,
    })
}

/// A conservative estimate of what materializing the file costs: the raw
/// bytes plus one typed buffer per column.
pub(crate) fn estimate_materialized_bytes(
    file_size: u64,
    rows: usize,
    schema: &Schema,
) -> usize {
    let row_width: usize = schema.fields().iter().map(|(_, d)| d.byte_width()).sum();
    file_size as usize + rows * row_width
}

/// Infers the schema by sampling the first [`ReadOptions::sample_rows`] rows.
///
/// Column names come from the header (or are synthesized as `column_{i}`);
/// dtypes start at `Int32` and widen to `Float64`, `Bool` or `Utf8` as
/// samples contradict the narrower candidates. Null tokens are skipped, and
/// a column with no non-null samples is `Utf8`.
pub(crate) fn infer_schema(
    path: &Path,
    file: &File,
    index: &RowIndex,
    options: &ReadOptions,
) -> Result<Schema> {
    use std::io::{Read, Seek, SeekFrom};

    let first_data = index.rows_range(0, 0)?.0;
    let mut reader = file;
    reader.seek(SeekFrom::Start(0))?;

    let names: Vec<String> = if options.has_header {
        let mut header = vec![0u8; first_data as usize];
        reader.read_exact(&mut header)?;
        let fields = parser::split_row(&header, options.delimiter);
        if fields.is_empty() {
            return Err(Error::Parse(format!(
                "{} has no header row",
                path.display()
            )));
        }
        fields
            .iter()
            .map(|f| {
                String::from_utf8(f.clone())
                    .map(|s| s.trim_end_matches(['\r', '\n']).to_string())
                    .map_err(|e| Error::Parse(format!("invalid UTF-8 in header: {}", e)))
            })
            .collect::<Result<Vec<_>>>()?
    } else {
        vec![]
    };

    let sampled_rows = options.sample_rows.min(index.row_count());
    let (start, end) = index.rows_range(0, sampled_rows)?;
    let mut bytes = vec![0u8; (end - start) as usize];
    reader.seek(SeekFrom::Start(start))?;
    reader.read_exact(&mut bytes)?;

    let parse = options.parse_options();
    let mut samples: Vec<Vec<Vec<u8>>> = vec![];
    for line in split_lines(&bytes) {
        samples.push(parser::split_row(line, options.delimiter));
    }
    let num_columns = if options.has_header {
        names.len()
    } else {
        samples.iter().map(Vec::len).max().unwrap_or(0)
    };
    if num_columns == 0 {
        return Err(Error::Parse(format!("{} has no columns", path.display())));
    }

    let mut fields = Vec::with_capacity(num_columns);
    for i in 0..num_columns {
        let name = if options.has_header {
            names[i].clone()
        } else {
            format!("column_{}", i)
        };
        let mut all_int = true;
        let mut all_float = true;
        let mut all_bool = true;
        let mut seen = false;
        for row in &samples {
            let cell = match row.get(i) {
                Some(cell) => cell.as_slice(),
                None => continue,
            };
            if parse.null_values.iter().any(|null| null == cell) {
                continue;
            }
            seen = true;
            let text = std::str::from_utf8(cell).unwrap_or("");
            all_int &= text.parse::<i32>().is_ok();
            all_float &= text.parse::<f64>().is_ok();
            all_bool &= parse_bool_bytes(cell).is_some();
        }
        let dtype = if !seen {
            DType::Utf8
        } else if all_int {
            DType::Int32
        } else if all_float {
            DType::Float64
        } else if all_bool {
            DType::Bool
        } else {
            DType::Utf8
        };
        fields.push((name, dtype));
    }
    Schema::new(fields)
}

fn split_lines(bytes: &[u8]) -> impl Iterator<Item = &[u8]> {
    bytes
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
}

/// Reads a whole file into a frame under the memory budget.
///
/// On memory denial the envelope carries an empty frame plus the denial
/// diagnostic; no error is raised for memory.
pub fn read_csv<P: AsRef<Path>>(path: P, options: ReadOptions) -> Result<QueryOutput> {
    let path = path.as_ref();
    let csv = open_csv(path, &options)?;

    let tracker = match options.memory_limit_bytes {
        Some(limit) => Arc::new(MemoryTracker::new(limit)),
        None => MemoryTracker::global(),
    };
    let task = tracker.new_task();
    let estimate = estimate_materialized_bytes(csv.file_size, csv.index.row_count(), &csv.schema);
    let outcome = tracker.request_allocation(task, estimate);
    if let Some(error) = outcome.error {
        tracker.release_allocation(task);
        return Ok(QueryOutput::denied(DataFrame::empty(csv.schema), error));
    }

    let cache_options = options.cache_options();
    let cache = ChunkCache::new(&cache_options, tracker.clone(), task);
    let mut reader = ChunkReader::new(
        csv.file,
        csv.index,
        csv.schema.clone(),
        options.parse_options(),
        &cache_options,
        cache,
        None,
        vec![],
        CancelToken::new(),
    );

    let mut batches = vec![];
    let mut rows = 0usize;
    while let Some(chunk) = reader.next()? {
        let frame = DataFrame::from_chunk(chunk, &csv.schema)?;
        rows += frame.num_rows();
        batches.push(frame);
        if options.max_rows.map(|max| rows >= max).unwrap_or(false) {
            break;
        }
    }
    reader.destroy();

    let mut data = if batches.is_empty() {
        DataFrame::empty(csv.schema)
    } else {
        DataFrame::concat(&batches)?
    };
    if let Some(max) = options.max_rows {
        if data.num_rows() > max {
            data = data.slice(0, max)?;
        }
    }
    Ok(QueryOutput::complete(data))
}
