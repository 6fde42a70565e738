//! Streaming group-by over packed key bytes.
//!
//! Keys are packed row-wise into a flat byte arena and addressed by an
//! open-addressing, linear-probing table. Aggregate state is
//! struct-of-arrays: one `f64` buffer per aggregate plus a shared per-entry
//! row counter used by `count` and as the `mean` denominator. The table
//! grows by rehashing into a doubled table at 0.7 load; rows are never
//! dropped.

use std::sync::Arc;

use crate::dictionary::Dictionary;
use crate::error::{Error, Result};
use crate::frame::{Column, DataFrame};
use crate::plan::{AggExpr, AggFunc};
use crate::schema::Schema;
use crate::types::DType;

const INITIAL_CAPACITY: usize = 1 << 10;
const LOAD_FACTOR: f64 = 0.7;
const EMPTY_SLOT: i64 = -1;
/// Separates key fields in the hash image, preventing field aliasing.
const HASH_FIELD_SEP: u8 = 0xff;
/// Terminates string fields in the key store.
const KEY_STR_TERMINATOR: u8 = 0;

/// FNV-1a 32-bit mix over the packed key bytes.
fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in bytes {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

/// Packs one value into `store`, in the key-store encoding: strings as raw
/// bytes plus a terminator, everything else as the 8-byte LE `f64` image.
fn pack_field(
    batch: &DataFrame,
    row: usize,
    column: usize,
    store: &mut Vec<u8>,
) -> Result<()> {
    match batch.column_at(column)? {
        Column::Utf8(ids) => {
            let value = batch.dictionary().value(ids[row])?;
            store.extend_from_slice(value.as_bytes());
            store.push(KEY_STR_TERMINATOR);
        }
        Column::Int32(values) => store.extend_from_slice(&(values[row] as f64).to_le_bytes()),
        Column::Float64(values) => store.extend_from_slice(&values[row].to_le_bytes()),
        Column::Bool(values) => {
            store.extend_from_slice(&((values[row] as u8) as f64).to_le_bytes())
        }
        Column::Date(values) => store.extend_from_slice(&(values[row] as f64).to_le_bytes()),
        Column::DateTime(values) => store.extend_from_slice(&(values[row] as f64).to_le_bytes()),
    }
    Ok(())
}

/// Packs the row's key for both hashing and storage. Used by the group-by
/// table and by distinct fingerprints.
pub(crate) fn pack_row_key(
    batch: &DataFrame,
    row: usize,
    columns: &[usize],
    store: &mut Vec<u8>,
) -> Result<()> {
    for column in columns {
        pack_field(batch, row, *column, store)?;
    }
    Ok(())
}

/// Aggregation state of one group-by execution.
///
/// Lifecycle: created when the operator starts, fed by [`ingest`], torn
/// down by [`finalize`] which returns the result frame.
///
/// [`ingest`]: GroupByState::ingest
/// [`finalize`]: GroupByState::finalize
pub(crate) struct GroupByState {
    key_indices: Vec<usize>,
    key_dtypes: Vec<DType>,
    aggs: Vec<AggExpr>,
    agg_indices: Vec<usize>,
    output_schema: Schema,

    capacity: usize,
    count: usize,
    hashes: Vec<i64>,
    slot_to_entry: Vec<u32>,
    key_store: Vec<u8>,
    entry_offset: Vec<u32>,
    entry_length: Vec<u32>,
    entry_hash: Vec<i64>,
    entry_rows: Vec<i64>,
    acc: Vec<Vec<f64>>,

    hash_buf: Vec<u8>,
    store_buf: Vec<u8>,
}

impl GroupByState {
    pub fn new(
        input_schema: &Schema,
        keys: &[String],
        aggs: &[AggExpr],
        output_schema: Schema,
    ) -> Result<Self> {
        let key_indices = keys
            .iter()
            .map(|key| input_schema.index_of(key))
            .collect::<Result<Vec<_>>>()?;
        let key_dtypes = key_indices
            .iter()
            .map(|i| input_schema.fields()[*i].1)
            .collect();
        let agg_indices = aggs
            .iter()
            .map(|agg| {
                let i = input_schema.index_of(&agg.column)?;
                let dtype = input_schema.fields()[i].1;
                if agg.func != AggFunc::Count && !dtype.is_numeric() {
                    return Err(Error::TypeMismatch(format!(
                        "aggregate {:?} on non-numeric column \"{}\" ({})",
                        agg.func, agg.column, dtype
                    )));
                }
                Ok(i)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            key_indices,
            key_dtypes,
            aggs: aggs.to_vec(),
            agg_indices,
            output_schema,
            capacity: INITIAL_CAPACITY,
            count: 0,
            hashes: vec![EMPTY_SLOT; INITIAL_CAPACITY],
            slot_to_entry: vec![0; INITIAL_CAPACITY],
            key_store: vec![],
            entry_offset: vec![],
            entry_length: vec![],
            entry_hash: vec![],
            entry_rows: vec![],
            acc: vec![vec![]; aggs.len()],
            hash_buf: vec![],
            store_buf: vec![],
        })
    }

    /// Folds every row of `batch` into the table.
    pub fn ingest(&mut self, batch: &DataFrame) -> Result<()> {
        let mut hash_buf = std::mem::take(&mut self.hash_buf);
        let mut store_buf = std::mem::take(&mut self.store_buf);
        for row in 0..batch.num_rows() {
            hash_buf.clear();
            store_buf.clear();
            for column in &self.key_indices {
                pack_field(batch, row, *column, &mut store_buf)?;
                pack_field(batch, row, *column, &mut hash_buf)?;
                hash_buf.push(HASH_FIELD_SEP);
            }
            let hash = fnv1a(&hash_buf) as i64;
            let entry = self.probe_or_insert(hash, &store_buf);
            self.update_aggregates(batch, row, entry)?;
            self.entry_rows[entry] += 1;
        }
        self.hash_buf = hash_buf;
        self.store_buf = store_buf;
        Ok(())
    }

    fn probe_or_insert(&mut self, hash: i64, key: &[u8]) -> usize {
        if (self.count + 1) as f64 > self.capacity as f64 * LOAD_FACTOR {
            self.grow();
        }
        let mask = self.capacity - 1;
        let mut slot = (hash as u32 as usize) & mask;
        loop {
            if self.hashes[slot] == EMPTY_SLOT {
                return self.insert_at(slot, hash, key);
            }
            if self.hashes[slot] == hash {
                let entry = self.slot_to_entry[slot] as usize;
                let offset = self.entry_offset[entry] as usize;
                let length = self.entry_length[entry] as usize;
                if self.key_store[offset..offset + length] == *key {
                    return entry;
                }
            }
            slot = (slot + 1) & mask;
        }
    }

    fn insert_at(&mut self, slot: usize, hash: i64, key: &[u8]) -> usize {
        let entry = self.count;
        self.hashes[slot] = hash;
        self.slot_to_entry[slot] = entry as u32;
        self.entry_offset.push(self.key_store.len() as u32);
        self.entry_length.push(key.len() as u32);
        self.key_store.extend_from_slice(key);
        self.entry_hash.push(hash);
        self.entry_rows.push(0);
        for (i, agg) in self.aggs.iter().enumerate() {
            let init = match agg.func {
                AggFunc::Min => f64::INFINITY,
                AggFunc::Max => f64::NEG_INFINITY,
                _ => 0.0,
            };
            self.acc[i].push(init);
        }
        self.count += 1;
        entry
    }

    fn grow(&mut self) {
        let capacity = self.capacity * 2;
        tracing::debug!(from = self.capacity, to = capacity, "group table rehash");
        let mut hashes = vec![EMPTY_SLOT; capacity];
        let mut slot_to_entry = vec![0u32; capacity];
        let mask = capacity - 1;
        for entry in 0..self.count {
            let hash = self.entry_hash[entry];
            let mut slot = (hash as u32 as usize) & mask;
            while hashes[slot] != EMPTY_SLOT {
                slot = (slot + 1) & mask;
            }
            hashes[slot] = hash;
            slot_to_entry[slot] = entry as u32;
        }
        self.capacity = capacity;
        self.hashes = hashes;
        self.slot_to_entry = slot_to_entry;
    }

    fn update_aggregates(&mut self, batch: &DataFrame, row: usize, entry: usize) -> Result<()> {
        for (i, agg) in self.aggs.iter().enumerate() {
            if agg.func == AggFunc::Count {
                continue;
            }
            let value = match batch.column_at(self.agg_indices[i])? {
                Column::Int32(values) => values[row] as f64,
                Column::Float64(values) => values[row],
                other => {
                    return Err(Error::TypeMismatch(format!(
                        "aggregate {:?} on a {} column",
                        agg.func,
                        other.dtype()
                    )))
                }
            };
            let cell = &mut self.acc[i][entry];
            match agg.func {
                AggFunc::Sum | AggFunc::Mean => *cell += value,
                AggFunc::Min => {
                    if !value.is_nan() && value < *cell {
                        *cell = value;
                    }
                }
                AggFunc::Max => {
                    if !value.is_nan() && value > *cell {
                        *cell = value;
                    }
                }
                AggFunc::First => {
                    if self.entry_rows[entry] == 0 {
                        *cell = value;
                    }
                }
                AggFunc::Last => *cell = value,
                AggFunc::Count => unreachable!(),
            }
        }
        Ok(())
    }

    pub fn num_groups(&self) -> usize {
        self.count
    }

    /// Decodes the packed keys and aggregate buffers into the result frame.
    /// Groups come out in first-seen order.
    pub fn finalize(self) -> Result<DataFrame> {
        let mut dict = Dictionary::new();

        // decode key columns from the packed arena
        let mut key_columns: Vec<Column> = self
            .key_dtypes
            .iter()
            .map(|dtype| match dtype {
                DType::Int32 => Column::Int32(Vec::with_capacity(self.count)),
                DType::Float64 => Column::Float64(Vec::with_capacity(self.count)),
                DType::Bool => Column::Bool(Vec::with_capacity(self.count)),
                DType::Utf8 => Column::Utf8(Vec::with_capacity(self.count)),
                DType::Date => Column::Date(Vec::with_capacity(self.count)),
                DType::DateTime => Column::DateTime(Vec::with_capacity(self.count)),
            })
            .collect();
        for entry in 0..self.count {
            let offset = self.entry_offset[entry] as usize;
            let length = self.entry_length[entry] as usize;
            let mut cursor = &self.key_store[offset..offset + length];
            for (k, dtype) in self.key_dtypes.iter().enumerate() {
                match (*dtype, &mut key_columns[k]) {
                    (DType::Utf8, Column::Utf8(ids)) => {
                        let end = cursor
                            .iter()
                            .position(|b| *b == KEY_STR_TERMINATOR)
                            .ok_or_else(|| {
                                Error::OutOfSpec("unterminated string in key store".to_string())
                            })?;
                        let text = std::str::from_utf8(&cursor[..end]).map_err(|e| {
                            Error::Parse(format!("invalid UTF-8 in group key: {}", e))
                        })?;
                        ids.push(dict.intern(text));
                        cursor = &cursor[end + 1..];
                    }
                    (_, column) => {
                        let image: [u8; 8] = cursor[..8].try_into().map_err(|_| {
                            Error::OutOfSpec("truncated numeric in key store".to_string())
                        })?;
                        let value = f64::from_le_bytes(image);
                        match column {
                            Column::Int32(values) => values.push(value as i32),
                            Column::Float64(values) => values.push(value),
                            Column::Bool(values) => values.push(value != 0.0),
                            Column::Date(values) => values.push(value as i64),
                            Column::DateTime(values) => values.push(value as i64),
                            Column::Utf8(_) => unreachable!(),
                        }
                        cursor = &cursor[8..];
                    }
                }
            }
        }

        let mut columns = key_columns;
        for (i, agg) in self.aggs.iter().enumerate() {
            let out_dtype = self
                .output_schema
                .dtype_of(&agg.out_name)
                .unwrap_or(DType::Float64);
            let column = match agg.func {
                AggFunc::Count => {
                    Column::Int32(self.entry_rows.iter().map(|n| *n as i32).collect())
                }
                AggFunc::Mean => Column::Float64(
                    self.acc[i]
                        .iter()
                        .zip(self.entry_rows.iter())
                        .map(|(sum, n)| sum / *n as f64)
                        .collect(),
                ),
                AggFunc::Sum | AggFunc::Min | AggFunc::Max | AggFunc::First | AggFunc::Last => {
                    // an untouched min/max cell means every value was NaN
                    let cells = self.acc[i].iter().map(|v| {
                        if v.is_infinite()
                            && matches!(agg.func, AggFunc::Min | AggFunc::Max)
                        {
                            f64::NAN
                        } else {
                            *v
                        }
                    });
                    match out_dtype {
                        DType::Int32 => Column::Int32(cells.map(|v| v as i32).collect()),
                        _ => Column::Float64(cells.collect()),
                    }
                }
            };
            columns.push(column);
        }

        let validity = vec![None; columns.len()];
        DataFrame::from_parts(self.output_schema, columns, validity, Arc::new(dict))
    }
}
