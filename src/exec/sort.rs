//! External merge sort: bounded in-memory runs spilled to temp files,
//! recombined by a k-way binary-heap merge.
//!
//! Runs are packed row streams; a run file is owned by its sorter and
//! removed by the OS when the handle drops, on completion or cancellation
//! alike. The merge ties equal keys by run index, which reflects insertion
//! order, so the sort is stable.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::exec::batch::BatchIter;
use crate::frame::{DataFrame, FrameBuilder, Value};
use crate::schema::Schema;
use crate::types::DType;

/// Run-buffer budget when the plan does not set one.
pub(crate) const DEFAULT_RUN_BYTES: usize = 32 * 1024 * 1024;
/// Rows per output batch of a merge.
pub(crate) const MERGE_BATCH_ROWS: usize = 4096;

/// One sort key, resolved to a column position.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SortKey {
    pub column: usize,
    pub descending: bool,
}

/// Direction-aware lexicographic comparison of two key tuples.
fn compare_keys(a: &[Value], b: &[Value], keys: &[SortKey]) -> Ordering {
    for (i, key) in keys.iter().enumerate() {
        let ordering = a[i].cmp_total(&b[i]);
        let ordering = if key.descending {
            ordering.reverse()
        } else {
            ordering
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn extract_key(row: &[Value], keys: &[SortKey]) -> Vec<Value> {
    keys.iter().map(|key| row[key.column].clone()).collect()
}

/// Packs one row as `[marker, payload]*`: marker 0 is null, 1 present;
/// fixed-width payloads little-endian, strings length-prefixed.
fn write_row<W: Write>(writer: &mut W, row: &[Value], dtypes: &[DType]) -> Result<()> {
    for (value, dtype) in row.iter().zip(dtypes) {
        if value.is_null() {
            writer.write_all(&[0])?;
            continue;
        }
        writer.write_all(&[1])?;
        match (value, dtype) {
            (Value::Int32(v), DType::Int32) => writer.write_all(&v.to_le_bytes())?,
            (Value::Float64(v), DType::Float64) => writer.write_all(&v.to_le_bytes())?,
            (Value::Bool(v), DType::Bool) => writer.write_all(&[*v as u8])?,
            (Value::Date(v), DType::Date) => writer.write_all(&v.to_le_bytes())?,
            (Value::DateTime(v), DType::DateTime) => writer.write_all(&v.to_le_bytes())?,
            (Value::Utf8(v), DType::Utf8) => {
                writer.write_all(&(v.len() as u32).to_le_bytes())?;
                writer.write_all(v.as_bytes())?;
            }
            (value, dtype) => {
                return Err(Error::TypeMismatch(format!(
                    "value {:?} in a {} run column",
                    value, dtype
                )))
            }
        }
    }
    Ok(())
}

fn read_row<R: Read>(reader: &mut R, dtypes: &[DType]) -> Result<Vec<Value>> {
    let mut row = Vec::with_capacity(dtypes.len());
    for dtype in dtypes {
        let mut marker = [0u8; 1];
        reader.read_exact(&mut marker)?;
        if marker[0] == 0 {
            row.push(Value::Null);
            continue;
        }
        let value = match dtype {
            DType::Int32 => {
                let mut buf = [0u8; 4];
                reader.read_exact(&mut buf)?;
                Value::Int32(i32::from_le_bytes(buf))
            }
            DType::Float64 => {
                let mut buf = [0u8; 8];
                reader.read_exact(&mut buf)?;
                Value::Float64(f64::from_le_bytes(buf))
            }
            DType::Bool => {
                let mut buf = [0u8; 1];
                reader.read_exact(&mut buf)?;
                Value::Bool(buf[0] != 0)
            }
            DType::Date => {
                let mut buf = [0u8; 8];
                reader.read_exact(&mut buf)?;
                Value::Date(i64::from_le_bytes(buf))
            }
            DType::DateTime => {
                let mut buf = [0u8; 8];
                reader.read_exact(&mut buf)?;
                Value::DateTime(i64::from_le_bytes(buf))
            }
            DType::Utf8 => {
                let mut len = [0u8; 4];
                reader.read_exact(&mut len)?;
                let mut bytes = vec![0u8; u32::from_le_bytes(len) as usize];
                reader.read_exact(&mut bytes)?;
                Value::Utf8(String::from_utf8(bytes).map_err(|e| {
                    Error::OutOfSpec(format!("invalid UTF-8 in sort run: {}", e))
                })?)
            }
        };
        row.push(value);
    }
    Ok(row)
}

struct Run {
    file: File,
    rows: usize,
}

/// Accumulates batches into bounded in-memory runs and spills each sorted
/// run to a temp file.
pub(crate) struct ExternalSorter {
    schema: Schema,
    dtypes: Vec<DType>,
    keys: Vec<SortKey>,
    run_bytes: usize,
    buffer: Vec<DataFrame>,
    buffered_bytes: usize,
    runs: Vec<Run>,
}

impl ExternalSorter {
    pub fn new(schema: Schema, keys: Vec<SortKey>, run_bytes: Option<usize>) -> Self {
        let dtypes = schema.fields().iter().map(|(_, d)| *d).collect();
        Self {
            schema,
            dtypes,
            keys,
            run_bytes: run_bytes.unwrap_or(DEFAULT_RUN_BYTES).max(1),
            buffer: vec![],
            buffered_bytes: 0,
            runs: vec![],
        }
    }

    pub fn push(&mut self, batch: DataFrame) -> Result<()> {
        self.buffered_bytes += batch.size_bytes();
        self.buffer.push(batch);
        if self.buffered_bytes >= self.run_bytes {
            self.spill()?;
        }
        Ok(())
    }

    fn sorted_buffer(&mut self) -> Result<Vec<Vec<Value>>> {
        let mut rows = Vec::new();
        for batch in self.buffer.drain(..) {
            for row in 0..batch.num_rows() {
                rows.push(batch.row(row)?);
            }
        }
        self.buffered_bytes = 0;
        let keys = &self.keys;
        let mut keyed: Vec<(Vec<Value>, Vec<Value>)> = rows
            .into_iter()
            .map(|row| (extract_key(&row, keys), row))
            .collect();
        keyed.sort_by(|a, b| compare_keys(&a.0, &b.0, keys));
        Ok(keyed.into_iter().map(|(_, row)| row).collect())
    }

    fn spill(&mut self) -> Result<()> {
        let rows = self.sorted_buffer()?;
        if rows.is_empty() {
            return Ok(());
        }
        let file = tempfile::tempfile()?;
        let mut writer = BufWriter::new(file);
        for row in &rows {
            write_row(&mut writer, row, &self.dtypes)?;
        }
        let file = writer
            .into_inner()
            .map_err(|e| Error::File(format!("flushing sort run: {}", e)))?;
        tracing::debug!(rows = rows.len(), run = self.runs.len(), "spilled sort run");
        self.runs.push(Run {
            file,
            rows: rows.len(),
        });
        Ok(())
    }

    /// Finishes ingestion and returns the sorted output stream.
    pub fn finish(mut self) -> Result<SortedStream> {
        if self.runs.is_empty() {
            // everything fit in one buffer: no disk round-trip
            let rows = self.sorted_buffer()?;
            return Ok(SortedStream::from_memory(self.schema, rows));
        }
        self.spill()?;
        let mut readers = Vec::with_capacity(self.runs.len());
        for run in self.runs {
            let mut file = run.file;
            file.seek(SeekFrom::Start(0))?;
            readers.push(RunReader {
                reader: BufReader::new(file),
                remaining: run.rows,
            });
        }
        SortedStream::from_runs(self.schema, self.dtypes, self.keys, readers)
    }
}

struct RunReader {
    reader: BufReader<File>,
    remaining: usize,
}

impl RunReader {
    fn next_row(&mut self, dtypes: &[DType]) -> Result<Option<Vec<Value>>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        read_row(&mut self.reader, dtypes).map(Some)
    }
}

struct HeapEntry {
    key: Vec<Value>,
    row: Vec<Value>,
    run: usize,
    keys: Arc<Vec<SortKey>>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_keys(&self.key, &other.key, &self.keys).then(self.run.cmp(&other.run))
    }
}

enum SortedInner {
    Memory(std::vec::IntoIter<Vec<Value>>),
    Merge {
        dtypes: Vec<DType>,
        keys: Arc<Vec<SortKey>>,
        readers: Vec<RunReader>,
        heap: BinaryHeap<Reverse<HeapEntry>>,
    },
}

/// The sorted output, as a stream of batches.
pub(crate) struct SortedStream {
    schema: Schema,
    inner: SortedInner,
}

impl SortedStream {
    fn from_memory(schema: Schema, rows: Vec<Vec<Value>>) -> Self {
        Self {
            schema,
            inner: SortedInner::Memory(rows.into_iter()),
        }
    }

    fn from_runs(
        schema: Schema,
        dtypes: Vec<DType>,
        keys: Vec<SortKey>,
        mut readers: Vec<RunReader>,
    ) -> Result<Self> {
        let keys = Arc::new(keys);
        let mut heap = BinaryHeap::with_capacity(readers.len());
        for (run, reader) in readers.iter_mut().enumerate() {
            if let Some(row) = reader.next_row(&dtypes)? {
                heap.push(Reverse(HeapEntry {
                    key: extract_key(&row, &keys),
                    row,
                    run,
                    keys: keys.clone(),
                }));
            }
        }
        Ok(Self {
            schema,
            inner: SortedInner::Merge {
                dtypes,
                keys,
                readers,
                heap,
            },
        })
    }

    fn next_row(&mut self) -> Result<Option<Vec<Value>>> {
        match &mut self.inner {
            SortedInner::Memory(rows) => Ok(rows.next()),
            SortedInner::Merge {
                dtypes,
                keys,
                readers,
                heap,
            } => {
                let Reverse(entry) = match heap.pop() {
                    Some(entry) => entry,
                    None => return Ok(None),
                };
                if let Some(row) = readers[entry.run].next_row(dtypes)? {
                    heap.push(Reverse(HeapEntry {
                        key: extract_key(&row, keys),
                        row,
                        run: entry.run,
                        keys: keys.clone(),
                    }));
                }
                Ok(Some(entry.row))
            }
        }
    }
}

impl BatchIter for SortedStream {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn next_batch(&mut self) -> Result<Option<DataFrame>> {
        let mut builder = FrameBuilder::new(self.schema.clone());
        while builder.num_rows() < MERGE_BATCH_ROWS {
            match self.next_row()? {
                Some(row) => builder.push_row(&row)?,
                None => break,
            }
        }
        if builder.num_rows() == 0 {
            Ok(None)
        } else {
            Ok(Some(builder.finish()))
        }
    }
}

/// Drains `input` through an external sort.
pub(crate) fn sort_batches(
    input: &mut dyn BatchIter,
    keys: Vec<SortKey>,
    run_bytes: Option<usize>,
) -> Result<SortedStream> {
    let mut sorter = ExternalSorter::new(input.schema().clone(), keys, run_bytes);
    while let Some(batch) = input.next_batch()? {
        sorter.push(batch)?;
    }
    sorter.finish()
}
