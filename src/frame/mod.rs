//! Materialized frames: owned columnar data with a shared dictionary.

mod builder;
mod lazy;

pub use builder::FrameBuilder;
pub use lazy::{scan_csv, LazyFrame};

use std::cmp::Ordering;
use std::sync::Arc;

use crate::chunk::{Bitmap, Chunk};
use crate::dictionary::Dictionary;
use crate::error::{Error, Result};
use crate::schema::Schema;
use crate::types::DType;

/// An owned column of a materialized frame.
///
/// `Utf8` holds 32-bit ids into the frame's dictionary, not bytes.
#[derive(Debug, Clone)]
pub enum Column {
    Int32(Vec<i32>),
    Float64(Vec<f64>),
    Bool(Vec<bool>),
    Utf8(Vec<u32>),
    Date(Vec<i64>),
    DateTime(Vec<i64>),
}

impl Column {
    pub fn dtype(&self) -> DType {
        match self {
            Column::Int32(_) => DType::Int32,
            Column::Float64(_) => DType::Float64,
            Column::Bool(_) => DType::Bool,
            Column::Utf8(_) => DType::Utf8,
            Column::Date(_) => DType::Date,
            Column::DateTime(_) => DType::DateTime,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Column::Int32(values) => values.len(),
            Column::Float64(values) => values.len(),
            Column::Bool(values) => values.len(),
            Column::Utf8(values) => values.len(),
            Column::Date(values) => values.len(),
            Column::DateTime(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn new_empty(dtype: DType) -> Self {
        match dtype {
            DType::Int32 => Column::Int32(vec![]),
            DType::Float64 => Column::Float64(vec![]),
            DType::Bool => Column::Bool(vec![]),
            DType::Utf8 => Column::Utf8(vec![]),
            DType::Date => Column::Date(vec![]),
            DType::DateTime => Column::DateTime(vec![]),
        }
    }

    fn size_bytes(&self) -> usize {
        self.len() * self.dtype().byte_width()
    }
}

/// One cell of a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int32(i32),
    Float64(f64),
    Bool(bool),
    Utf8(String),
    Date(i64),
    DateTime(i64),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The dtype this value inhabits; `None` for null.
    pub fn dtype(&self) -> Option<DType> {
        match self {
            Value::Null => None,
            Value::Int32(_) => Some(DType::Int32),
            Value::Float64(_) => Some(DType::Float64),
            Value::Bool(_) => Some(DType::Bool),
            Value::Utf8(_) => Some(DType::Utf8),
            Value::Date(_) => Some(DType::Date),
            Value::DateTime(_) => Some(DType::DateTime),
        }
    }

    /// A total order over values: null sorts first, floats by `total_cmp`,
    /// and values of different dtypes by dtype tag.
    pub fn cmp_total(&self, other: &Value) -> Ordering {
        use Value::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,
            (Int32(a), Int32(b)) => a.cmp(b),
            (Float64(a), Float64(b)) => a.total_cmp(b),
            (Bool(a), Bool(b)) => a.cmp(b),
            (Utf8(a), Utf8(b)) => a.cmp(b),
            (Date(a), Date(b)) => a.cmp(b),
            (DateTime(a), DateTime(b)) => a.cmp(b),
            (a, b) => {
                let tag = |v: &Value| v.dtype().map(|d| d.to_tag()).unwrap_or(u8::MAX);
                tag(a).cmp(&tag(b))
            }
        }
    }

    /// The value as `f64`, when its dtype is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int32(v) => Some(*v as f64),
            Value::Float64(v) => Some(*v),
            _ => None,
        }
    }
}

/// A materialized, immutable frame.
///
/// Columns are stored in schema order; `validity[i]`, when present, marks
/// which rows of column `i` carry a value (`None` means all present).
#[derive(Debug, Clone)]
pub struct DataFrame {
    schema: Schema,
    columns: Vec<Column>,
    validity: Vec<Option<Bitmap>>,
    dict: Arc<Dictionary>,
}

impl DataFrame {
    /// A frame with zero rows and the given schema.
    pub fn empty(schema: Schema) -> Self {
        let columns = schema
            .fields()
            .iter()
            .map(|(_, dtype)| Column::new_empty(*dtype))
            .collect::<Vec<_>>();
        let validity = vec![None; columns.len()];
        Self {
            schema,
            columns,
            validity,
            dict: Arc::new(Dictionary::new()),
        }
    }

    /// Assembles a frame from parts, checking column count, dtypes and lengths.
    pub fn from_parts(
        schema: Schema,
        columns: Vec<Column>,
        validity: Vec<Option<Bitmap>>,
        dict: Arc<Dictionary>,
    ) -> Result<Self> {
        if columns.len() != schema.len() || validity.len() != schema.len() {
            return Err(Error::Schema(format!(
                "frame with {} columns does not match a schema of {}",
                columns.len(),
                schema.len()
            )));
        }
        let rows = columns.first().map(Column::len).unwrap_or(0);
        for (column, (name, dtype)) in columns.iter().zip(schema.fields()) {
            if column.dtype() != *dtype {
                return Err(Error::TypeMismatch(format!(
                    "column \"{}\" holds {} but the schema says {}",
                    name,
                    column.dtype(),
                    dtype
                )));
            }
            if column.len() != rows {
                return Err(Error::Schema(format!(
                    "column \"{}\" has {} rows, expected {}",
                    name,
                    column.len(),
                    rows
                )));
            }
        }
        Ok(Self {
            schema,
            columns,
            validity,
            dict,
        })
    }

    /// Decodes a parsed chunk into an owned frame, interning strings.
    pub fn from_chunk(chunk: &Chunk, schema: &Schema) -> Result<Self> {
        use crate::chunk::Vector;
        let mut dict = Dictionary::new();
        let mut columns = Vec::with_capacity(schema.len());
        for (i, vector) in chunk.columns().iter().enumerate() {
            let column = match vector {
                Vector::Int32(values) => Column::Int32(values.clone()),
                Vector::Float64(values) => Column::Float64(values.clone()),
                Vector::Bool(values) => Column::Bool(values.iter().map(|v| *v != 0).collect()),
                Vector::Date(values) => Column::Date(values.clone()),
                Vector::DateTime(values) => Column::DateTime(values.clone()),
                Vector::Utf8 { .. } => {
                    let mut ids = Vec::with_capacity(chunk.row_count());
                    for row in 0..chunk.row_count() {
                        let value = chunk.str_value(i, row)?;
                        ids.push(dict.intern(&value));
                    }
                    Column::Utf8(ids)
                }
            };
            columns.push(column);
        }
        let validity = (0..schema.len())
            .map(|i| chunk.validity(i).cloned())
            .collect();
        DataFrame::from_parts(schema.clone(), columns, validity, Arc::new(dict))
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map(Column::len).unwrap_or(0)
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    pub fn dictionary(&self) -> &Arc<Dictionary> {
        &self.dict
    }

    pub fn column_at(&self, i: usize) -> Result<&Column> {
        self.columns.get(i).ok_or_else(|| {
            Error::OutOfBounds(format!(
                "column {} of a frame with {} columns",
                i,
                self.columns.len()
            ))
        })
    }

    pub fn column(&self, name: &str) -> Result<&Column> {
        self.column_at(self.schema.index_of(name)?)
    }

    /// Validity of column `i`; `None` means all rows present.
    pub fn validity_at(&self, i: usize) -> Option<&Bitmap> {
        self.validity.get(i).and_then(|v| v.as_ref())
    }

    /// The cell at (`row`, `column`).
    pub fn value(&self, row: usize, column: usize) -> Result<Value> {
        if row >= self.num_rows() {
            return Err(Error::OutOfBounds(format!(
                "row {} of a frame with {} rows",
                row,
                self.num_rows()
            )));
        }
        if let Some(bitmap) = self.validity_at(column) {
            if !bitmap.get(row) {
                return Ok(Value::Null);
            }
        }
        Ok(match self.column_at(column)? {
            Column::Int32(values) => Value::Int32(values[row]),
            Column::Float64(values) => Value::Float64(values[row]),
            Column::Bool(values) => Value::Bool(values[row]),
            Column::Utf8(values) => Value::Utf8(self.dict.value(values[row])?.to_string()),
            Column::Date(values) => Value::Date(values[row]),
            Column::DateTime(values) => Value::DateTime(values[row]),
        })
    }

    /// One row as values, in schema order.
    pub fn row(&self, row: usize) -> Result<Vec<Value>> {
        (0..self.num_columns())
            .map(|column| self.value(row, column))
            .collect()
    }

    /// All rows; intended for tests and small results.
    pub fn rows(&self) -> Result<Vec<Vec<Value>>> {
        (0..self.num_rows()).map(|row| self.row(row)).collect()
    }

    /// A frame holding the given rows of this one, in the given order.
    pub fn gather(&self, indices: &[usize]) -> Result<DataFrame> {
        for i in indices {
            if *i >= self.num_rows() {
                return Err(Error::OutOfBounds(format!(
                    "row {} of a frame with {} rows",
                    i,
                    self.num_rows()
                )));
            }
        }
        let columns = self
            .columns
            .iter()
            .map(|column| match column {
                Column::Int32(values) => Column::Int32(indices.iter().map(|i| values[*i]).collect()),
                Column::Float64(values) => {
                    Column::Float64(indices.iter().map(|i| values[*i]).collect())
                }
                Column::Bool(values) => Column::Bool(indices.iter().map(|i| values[*i]).collect()),
                Column::Utf8(values) => Column::Utf8(indices.iter().map(|i| values[*i]).collect()),
                Column::Date(values) => Column::Date(indices.iter().map(|i| values[*i]).collect()),
                Column::DateTime(values) => {
                    Column::DateTime(indices.iter().map(|i| values[*i]).collect())
                }
            })
            .collect();
        let validity = self
            .validity
            .iter()
            .map(|bitmap| {
                bitmap.as_ref().map(|bitmap| {
                    let mut out = Bitmap::empty();
                    for i in indices {
                        out.push(bitmap.get(*i));
                    }
                    out
                })
            })
            .collect();
        DataFrame::from_parts(self.schema.clone(), columns, validity, self.dict.clone())
    }

    /// The rows `offset .. offset + len`, clamped to the frame.
    pub fn slice(&self, offset: usize, len: usize) -> Result<DataFrame> {
        let end = (offset + len).min(self.num_rows());
        let indices: Vec<usize> = (offset.min(end)..end).collect();
        self.gather(&indices)
    }

    /// Projects and reorders columns by name.
    pub fn select(&self, columns: &[String]) -> Result<DataFrame> {
        let schema = self.schema.project(columns)?;
        let indices = columns
            .iter()
            .map(|name| self.schema.index_of(name))
            .collect::<Result<Vec<_>>>()?;
        let selected = indices
            .iter()
            .map(|i| self.columns[*i].clone())
            .collect::<Vec<_>>();
        let validity = indices.iter().map(|i| self.validity[*i].clone()).collect();
        DataFrame::from_parts(schema, selected, validity, self.dict.clone())
    }

    /// Vertically concatenates frames of identical schema.
    pub fn concat(frames: &[DataFrame]) -> Result<DataFrame> {
        let first = match frames.first() {
            Some(first) => first,
            None => return Err(Error::Schema("concat of zero frames".to_string())),
        };
        for frame in frames.iter().skip(1) {
            if frame.schema != first.schema {
                return Err(Error::Schema(
                    "concat of frames with different schemas".to_string(),
                ));
            }
        }
        if frames.len() == 1 {
            return Ok(first.clone());
        }
        // dictionaries differ between frames, so rebuild row-wise
        let mut builder = FrameBuilder::new(first.schema.clone());
        for frame in frames {
            for row in 0..frame.num_rows() {
                builder.push_row(&frame.row(row)?)?;
            }
        }
        Ok(builder.finish())
    }

    /// An estimate of the frame's resident bytes, counting the dictionary once.
    pub fn size_bytes(&self) -> usize {
        let dict_bytes: usize = (0..self.dict.len() as u32)
            .map(|id| self.dict.value(id).map(str::len).unwrap_or(0))
            .sum();
        self.columns.iter().map(Column::size_bytes).sum::<usize>() + dict_bytes
    }
}

impl PartialEq for DataFrame {
    /// Logical equality: same schema and same cell values, regardless of
    /// dictionary layout.
    fn eq(&self, other: &Self) -> bool {
        if self.schema != other.schema || self.num_rows() != other.num_rows() {
            return false;
        }
        for row in 0..self.num_rows() {
            for column in 0..self.num_columns() {
                match (self.value(row, column), other.value(row, column)) {
                    (Ok(a), Ok(b)) if a == b => {}
                    _ => return false,
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> DataFrame {
        let schema = Schema::new(vec![
            ("a".to_string(), DType::Int32),
            ("b".to_string(), DType::Utf8),
        ])
        .unwrap();
        let mut builder = FrameBuilder::new(schema);
        builder
            .push_row(&[Value::Int32(1), Value::Utf8("x".to_string())])
            .unwrap();
        builder
            .push_row(&[Value::Int32(2), Value::Null])
            .unwrap();
        builder
            .push_row(&[Value::Int32(3), Value::Utf8("x".to_string())])
            .unwrap();
        builder.finish()
    }

    #[test]
    fn values_and_nulls() -> Result<()> {
        let frame = frame();
        assert_eq!(frame.num_rows(), 3);
        assert_eq!(frame.value(0, 1)?, Value::Utf8("x".to_string()));
        assert_eq!(frame.value(1, 1)?, Value::Null);
        assert_eq!(frame.value(2, 0)?, Value::Int32(3));
        // "x" interned once
        assert_eq!(frame.dictionary().len(), 1);
        Ok(())
    }

    #[test]
    fn gather_and_slice() -> Result<()> {
        let frame = frame();
        let picked = frame.gather(&[2, 0])?;
        assert_eq!(picked.value(0, 0)?, Value::Int32(3));
        assert_eq!(picked.value(1, 0)?, Value::Int32(1));
        let sliced = frame.slice(1, 5)?;
        assert_eq!(sliced.num_rows(), 2);
        assert_eq!(sliced.value(0, 1)?, Value::Null);
        Ok(())
    }

    #[test]
    fn select_reorders() -> Result<()> {
        let frame = frame();
        let selected = frame.select(&["b".to_string(), "a".to_string()])?;
        assert_eq!(selected.schema().names().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(selected.value(0, 1)?, Value::Int32(1));
        Ok(())
    }

    #[test]
    fn concat_reinterns() -> Result<()> {
        let a = frame();
        let b = frame();
        let joined = DataFrame::concat(&[a, b])?;
        assert_eq!(joined.num_rows(), 6);
        assert_eq!(joined.value(5, 1)?, Value::Utf8("x".to_string()));
        assert_eq!(joined.dictionary().len(), 1);
        Ok(())
    }

    #[test]
    fn logical_equality() {
        assert_eq!(frame(), frame());
        let other = frame().gather(&[0, 1]).unwrap();
        assert_ne!(frame(), other);
    }

    #[test]
    fn value_ordering() {
        assert_eq!(
            Value::Null.cmp_total(&Value::Int32(0)),
            Ordering::Less
        );
        assert_eq!(
            Value::Float64(f64::NAN).cmp_total(&Value::Float64(f64::NAN)),
            Ordering::Equal
        );
        assert_eq!(
            Value::Utf8("a".to_string()).cmp_total(&Value::Utf8("b".to_string())),
            Ordering::Less
        );
    }
}
