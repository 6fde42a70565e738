use std::sync::Arc;

use crate::chunk::Bitmap;
use crate::dictionary::Dictionary;
use crate::error::{Error, Result};
use crate::frame::{Column, DataFrame, Value};
use crate::schema::Schema;
use crate::types::DType;

/// A row-wise frame builder.
///
/// Nulls push the dtype's zero value and clear the row's validity bit; the
/// bitmap for a column is only materialized once its first null arrives.
#[derive(Debug)]
pub struct FrameBuilder {
    schema: Schema,
    columns: Vec<Column>,
    validity: Vec<Option<Bitmap>>,
    dict: Dictionary,
    rows: usize,
}

impl FrameBuilder {
    pub fn new(schema: Schema) -> Self {
        let columns = schema
            .fields()
            .iter()
            .map(|(_, dtype)| match dtype {
                DType::Int32 => Column::Int32(vec![]),
                DType::Float64 => Column::Float64(vec![]),
                DType::Bool => Column::Bool(vec![]),
                DType::Utf8 => Column::Utf8(vec![]),
                DType::Date => Column::Date(vec![]),
                DType::DateTime => Column::DateTime(vec![]),
            })
            .collect::<Vec<_>>();
        let validity = vec![None; columns.len()];
        Self {
            schema,
            columns,
            validity,
            dict: Dictionary::new(),
            rows: 0,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.rows
    }

    /// Appends one row, in schema order.
    pub fn push_row(&mut self, row: &[Value]) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(Error::Schema(format!(
                "row of {} values pushed into a frame of {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        for (i, value) in row.iter().enumerate() {
            self.push_value(i, value)?;
        }
        self.rows += 1;
        Ok(())
    }

    fn push_value(&mut self, i: usize, value: &Value) -> Result<()> {
        let is_null = value.is_null();
        if is_null {
            let bitmap = self.validity[i].get_or_insert_with(|| Bitmap::new_all_set(self.rows));
            bitmap.push(false);
        } else if let Some(bitmap) = self.validity[i].as_mut() {
            bitmap.push(true);
        }

        let (name, dtype) = &self.schema.fields()[i];
        match (&mut self.columns[i], value) {
            (Column::Int32(values), Value::Int32(v)) => values.push(*v),
            (Column::Int32(values), Value::Null) => values.push(0),
            (Column::Float64(values), Value::Float64(v)) => values.push(*v),
            (Column::Float64(values), Value::Int32(v)) => values.push(*v as f64),
            (Column::Float64(values), Value::Null) => values.push(0.0),
            (Column::Bool(values), Value::Bool(v)) => values.push(*v),
            (Column::Bool(values), Value::Null) => values.push(false),
            (Column::Utf8(values), Value::Utf8(v)) => values.push(self.dict.intern(v)),
            (Column::Utf8(values), Value::Null) => {
                values.push(self.dict.intern(""));
            }
            (Column::Date(values), Value::Date(v)) => values.push(*v),
            (Column::Date(values), Value::Null) => values.push(0),
            (Column::DateTime(values), Value::DateTime(v)) => values.push(*v),
            (Column::DateTime(values), Value::Null) => values.push(0),
            (_, value) => {
                return Err(Error::TypeMismatch(format!(
                    "value {:?} pushed into column \"{}\" of dtype {}",
                    value, name, dtype
                )))
            }
        }
        Ok(())
    }

    pub fn finish(self) -> DataFrame {
        DataFrame::from_parts(self.schema, self.columns, self.validity, Arc::new(self.dict))
            .expect("builder maintains frame invariants")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_mismatch_is_rejected() {
        let schema = Schema::new(vec![("a".to_string(), DType::Int32)]).unwrap();
        let mut builder = FrameBuilder::new(schema);
        let result = builder.push_row(&[Value::Utf8("nope".to_string())]);
        assert!(matches!(result, Err(Error::TypeMismatch(_))));
    }

    #[test]
    fn int_widens_into_float_column() -> Result<()> {
        let schema = Schema::new(vec![("a".to_string(), DType::Float64)]).unwrap();
        let mut builder = FrameBuilder::new(schema);
        builder.push_row(&[Value::Int32(2)])?;
        let frame = builder.finish();
        assert_eq!(frame.value(0, 0)?, Value::Float64(2.0));
        Ok(())
    }

    #[test]
    fn late_null_backfills_validity() -> Result<()> {
        let schema = Schema::new(vec![("a".to_string(), DType::Int32)]).unwrap();
        let mut builder = FrameBuilder::new(schema);
        builder.push_row(&[Value::Int32(1)])?;
        builder.push_row(&[Value::Null])?;
        builder.push_row(&[Value::Int32(3)])?;
        let frame = builder.finish();
        assert_eq!(frame.value(0, 0)?, Value::Int32(1));
        assert_eq!(frame.value(1, 0)?, Value::Null);
        assert_eq!(frame.value(2, 0)?, Value::Int32(3));
        Ok(())
    }
}
