//! Columnar chunks: the unit of parsing, caching and streaming.

use std::borrow::Cow;

use crate::error::{Error, Result};
use crate::types::DType;

/// A validity bitmap: little-endian bit order, bit set means value present.
///
/// This is the same layout the materialization block format stores, so
/// frames round-trip through the store without repacking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    bytes: Vec<u8>,
    len: usize,
}

impl Bitmap {
    /// A bitmap of `len` bits, all set.
    pub fn new_all_set(len: usize) -> Self {
        Self {
            bytes: vec![0xff; (len + 7) / 8],
            len,
        }
    }

    /// A bitmap from its raw parts. Trailing bits of the last byte are ignored.
    pub fn from_bytes(bytes: Vec<u8>, len: usize) -> Result<Self> {
        if bytes.len() < (len + 7) / 8 {
            return Err(Error::OutOfSpec(format!(
                "null bitmap of {} bytes cannot hold {} bits",
                bytes.len(),
                len
            )));
        }
        Ok(Self { bytes, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn get(&self, i: usize) -> bool {
        self.bytes[i / 8] & (1 << (i % 8)) != 0
    }

    #[inline]
    pub fn set(&mut self, i: usize, value: bool) {
        if value {
            self.bytes[i / 8] |= 1 << (i % 8);
        } else {
            self.bytes[i / 8] &= !(1 << (i % 8));
        }
    }

    /// Appends one bit.
    pub fn push(&mut self, value: bool) {
        if self.len % 8 == 0 {
            self.bytes.push(0);
        }
        self.len += 1;
        self.set(self.len - 1, value);
    }

    /// Number of set (present) bits.
    pub fn set_count(&self) -> usize {
        (0..self.len).filter(|i| self.get(*i)).count()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// An empty bitmap to push into.
    pub fn empty() -> Self {
        Self {
            bytes: vec![],
            len: 0,
        }
    }
}

/// A typed column of one chunk, stored struct-of-arrays.
///
/// The string variant does not own its bytes: `offsets[i] .. offsets[i] +
/// lengths[i]` index into the byte buffer of the [`Chunk`] that owns this
/// vector. `needs_unescape[i] != 0` marks cells whose `""` pairs must be
/// collapsed to `"` on decode.
#[derive(Debug, Clone)]
pub enum Vector {
    Int32(Vec<i32>),
    Float64(Vec<f64>),
    Bool(Vec<u8>),
    Utf8 {
        offsets: Vec<u32>,
        lengths: Vec<u32>,
        needs_unescape: Vec<u8>,
    },
    Date(Vec<i64>),
    DateTime(Vec<i64>),
}

impl Vector {
    /// An empty vector of `dtype` with room for `capacity` elements.
    pub fn with_capacity(dtype: DType, capacity: usize) -> Self {
        match dtype {
            DType::Int32 => Vector::Int32(Vec::with_capacity(capacity)),
            DType::Float64 => Vector::Float64(Vec::with_capacity(capacity)),
            DType::Bool => Vector::Bool(Vec::with_capacity(capacity)),
            DType::Utf8 => Vector::Utf8 {
                offsets: Vec::with_capacity(capacity),
                lengths: Vec::with_capacity(capacity),
                needs_unescape: Vec::with_capacity(capacity),
            },
            DType::Date => Vector::Date(Vec::with_capacity(capacity)),
            DType::DateTime => Vector::DateTime(Vec::with_capacity(capacity)),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Vector::Int32(_) => DType::Int32,
            Vector::Float64(_) => DType::Float64,
            Vector::Bool(_) => DType::Bool,
            Vector::Utf8 { .. } => DType::Utf8,
            Vector::Date(_) => DType::Date,
            Vector::DateTime(_) => DType::DateTime,
        }
    }

    pub fn row_count(&self) -> usize {
        match self {
            Vector::Int32(values) => values.len(),
            Vector::Float64(values) => values.len(),
            Vector::Bool(values) => values.len(),
            Vector::Utf8 { offsets, .. } => offsets.len(),
            Vector::Date(values) => values.len(),
            Vector::DateTime(values) => values.len(),
        }
    }

    /// Bytes held by this vector's own buffers, excluding the chunk's shared
    /// byte backing store.
    pub fn size_bytes(&self) -> usize {
        match self {
            Vector::Int32(values) => values.len() * 4,
            Vector::Float64(values) => values.len() * 8,
            Vector::Bool(values) => values.len(),
            Vector::Utf8 {
                offsets,
                lengths,
                needs_unescape,
            } => offsets.len() * 4 + lengths.len() * 4 + needs_unescape.len(),
            Vector::Date(values) => values.len() * 8,
            Vector::DateTime(values) => values.len() * 8,
        }
    }
}

/// Collapses `""` pairs to `"` in a decoded quoted cell.
pub fn unescape_quotes(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        out.push(bytes[i]);
        if bytes[i] == b'"' && i + 1 < bytes.len() && bytes[i + 1] == b'"' {
            i += 1;
        }
        i += 1;
    }
    out
}

/// The cache accounting of a chunk: typed buffers plus string index arrays,
/// plus the shared byte backing store counted once.
pub fn estimate_size(columns: &[Vector], buffer_len: usize) -> usize {
    columns.iter().map(Vector::size_bytes).sum::<usize>() + buffer_len
}

/// A contiguous row range parsed into columnar form.
///
/// Owns the raw bytes its string vectors slice into; the chunk must outlive
/// any string slice borrowed from it. It holds actual data and thus cloning
/// it is expensive.
#[derive(Debug, Clone)]
pub struct Chunk {
    start_row: usize,
    row_count: usize,
    columns: Vec<Vector>,
    validity: Vec<Option<Bitmap>>,
    buffer: Vec<u8>,
    size_bytes: usize,
}

impl Chunk {
    /// Assembles a chunk, checking that every vector has the same row count
    /// and that string slices stay inside the buffer.
    pub fn new(
        start_row: usize,
        columns: Vec<Vector>,
        validity: Vec<Option<Bitmap>>,
        buffer: Vec<u8>,
    ) -> Result<Self> {
        let row_count = columns.first().map(Vector::row_count).unwrap_or(0);
        for column in &columns {
            if column.row_count() != row_count {
                return Err(Error::Schema(format!(
                    "chunk vectors disagree on row count: {} vs {}",
                    column.row_count(),
                    row_count
                )));
            }
            if let Vector::Utf8 {
                offsets, lengths, ..
            } = column
            {
                for (offset, length) in offsets.iter().zip(lengths.iter()) {
                    if (*offset as usize) + (*length as usize) > buffer.len() {
                        return Err(Error::OutOfBounds(format!(
                            "string slice {}+{} outside a buffer of {} bytes",
                            offset,
                            length,
                            buffer.len()
                        )));
                    }
                }
            }
        }
        let size_bytes = estimate_size(&columns, buffer.len());
        Ok(Self {
            start_row,
            row_count,
            columns,
            validity,
            buffer,
            size_bytes,
        })
    }

    /// First file row covered by this chunk.
    pub fn start_row(&self) -> usize {
        self.start_row
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn columns(&self) -> &[Vector] {
        &self.columns
    }

    pub fn column(&self, i: usize) -> Result<&Vector> {
        self.columns.get(i).ok_or_else(|| {
            Error::OutOfBounds(format!(
                "column {} of a chunk with {} columns",
                i,
                self.columns.len()
            ))
        })
    }

    /// Validity of column `i`; `None` means all rows present.
    pub fn validity(&self, i: usize) -> Option<&Bitmap> {
        self.validity.get(i).and_then(|v| v.as_ref())
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// The raw (still escaped) bytes of a string cell.
    pub fn str_bytes(&self, column: usize, row: usize) -> Result<&[u8]> {
        match self.column(column)? {
            Vector::Utf8 {
                offsets, lengths, ..
            } => {
                let offset = *offsets.get(row).ok_or_else(|| {
                    Error::OutOfBounds(format!("row {} of a chunk with {} rows", row, self.row_count))
                })? as usize;
                let length = lengths[row] as usize;
                Ok(&self.buffer[offset..offset + length])
            }
            other => Err(Error::TypeMismatch(format!(
                "string access on a {} column",
                other.dtype()
            ))),
        }
    }

    /// The decoded value of a string cell. Borrows when no unescaping is needed.
    pub fn str_value(&self, column: usize, row: usize) -> Result<Cow<str>> {
        let bytes = self.str_bytes(column, row)?;
        let needs_unescape = match self.column(column)? {
            Vector::Utf8 { needs_unescape, .. } => needs_unescape[row] != 0,
            _ => unreachable!(),
        };
        if needs_unescape {
            let unescaped = unescape_quotes(bytes);
            String::from_utf8(unescaped)
                .map(Cow::Owned)
                .map_err(|e| Error::Parse(format!("invalid UTF-8 in string cell: {}", e)))
        } else {
            std::str::from_utf8(bytes)
                .map(Cow::Borrowed)
                .map_err(|e| Error::Parse(format!("invalid UTF-8 in string cell: {}", e)))
        }
    }
}
