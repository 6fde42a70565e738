//! Predicate evaluation: typed, over materialized batches, and lowering of
//! scalar predicates for raw-byte evaluation inside the scan.

use crate::datetime::{parse_date, parse_datetime, DatetimeFormat};
use crate::error::{Error, Result};
use crate::frame::{DataFrame, Value};
use crate::plan::{CmpOp, FilterNode, FilterValue};
use crate::read::{PredValue, ScanPredicate};
use crate::schema::Schema;
use crate::types::DType;

/// Evaluates `lhs op rhs` for one cell. Null never satisfies a predicate.
pub(crate) fn compare(lhs: &Value, op: CmpOp, rhs: &FilterValue) -> Result<bool> {
    if lhs.is_null() {
        return Ok(false);
    }
    match (op, rhs) {
        (CmpOp::In, FilterValue::List(list)) => Ok(list.iter().any(|v| values_equal(lhs, v))),
        (CmpOp::NotIn, FilterValue::List(list)) => Ok(!list.iter().any(|v| values_equal(lhs, v))),
        (CmpOp::In | CmpOp::NotIn, FilterValue::Scalar(_)) => Err(Error::TypeMismatch(
            "in/not-in require a list value".to_string(),
        )),
        (CmpOp::Contains, FilterValue::Scalar(Value::Utf8(needle))) => match lhs {
            Value::Utf8(hay) => Ok(hay.contains(needle.as_str())),
            other => Err(Error::TypeMismatch(format!(
                "contains on a non-string value {:?}",
                other
            ))),
        },
        (CmpOp::Contains, _) => Err(Error::TypeMismatch(
            "contains requires a string value".to_string(),
        )),
        (op, FilterValue::Scalar(rhs)) => {
            let ordering = match (lhs.as_f64(), rhs.as_f64()) {
                // numerics compare as f64 so i32 and f64 literals mix
                (Some(a), Some(b)) => a.total_cmp(&b),
                _ => lhs.cmp_total(rhs),
            };
            Ok(match op {
                CmpOp::Eq => ordering.is_eq(),
                CmpOp::Neq => !ordering.is_eq(),
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::LtEq => !ordering.is_gt(),
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::GtEq => !ordering.is_lt(),
                CmpOp::In | CmpOp::NotIn | CmpOp::Contains => unreachable!(),
            })
        }
        (op, FilterValue::List(_)) => Err(Error::TypeMismatch(format!(
            "{:?} does not take a list value",
            op
        ))),
    }
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => lhs == rhs,
    }
}

/// Applies one filter to a batch, keeping the rows that satisfy it.
pub(crate) fn apply_filter(
    batch: &DataFrame,
    column: &str,
    op: CmpOp,
    value: &FilterValue,
) -> Result<DataFrame> {
    let column_idx = batch.schema().index_of(column)?;
    let mut keep = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let lhs = batch.value(row, column_idx)?;
        if compare(&lhs, op, value)? {
            keep.push(row);
        }
    }
    batch.gather(&keep)
}

/// Lowers a pushdown-eligible filter into a [`ScanPredicate`] evaluated
/// against raw field bytes, pre-converting the constant to the column's
/// physical type.
pub(crate) fn lower_scan_predicate(
    filter: &FilterNode,
    file_schema: &Schema,
    datetime_format: DatetimeFormat,
) -> Result<ScanPredicate> {
    let column = file_schema.index_of(&filter.column)?;
    let dtype = file_schema.fields()[column].1;
    let scalar = match &filter.value {
        FilterValue::Scalar(value) => value,
        FilterValue::List(_) => {
            return Err(Error::TypeMismatch(
                "list predicates cannot be pushed into a scan".to_string(),
            ))
        }
    };
    let value = match (dtype, scalar) {
        (DType::Int32, Value::Int32(v)) => PredValue::I32(*v),
        (DType::Int32, Value::Float64(v)) => PredValue::F64(*v),
        (DType::Float64, value) => PredValue::F64(value.as_f64().ok_or_else(|| {
            Error::TypeMismatch(format!("{:?} against a f64 column", value))
        })?),
        (DType::Bool, Value::Bool(v)) => PredValue::Bool(*v),
        (DType::Utf8, Value::Utf8(v)) => PredValue::Bytes(v.as_bytes().to_vec()),
        (DType::Date, Value::Date(v)) => PredValue::I64(*v),
        (DType::Date, Value::Utf8(v)) => PredValue::I64(parse_date(v)?),
        (DType::DateTime, Value::DateTime(v)) => PredValue::I64(*v),
        (DType::DateTime, Value::Utf8(v)) => PredValue::I64(parse_datetime(v, datetime_format)?),
        (dtype, value) => {
            return Err(Error::TypeMismatch(format!(
                "{:?} against a {} column",
                value, dtype
            )))
        }
    };
    Ok(ScanPredicate {
        column,
        dtype,
        op: filter.op,
        value,
        format: datetime_format,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBuilder;
    use crate::schema::Schema;

    fn batch() -> DataFrame {
        let schema = Schema::new(vec![
            ("id".to_string(), DType::Int32),
            ("name".to_string(), DType::Utf8),
        ])
        .unwrap();
        let mut builder = FrameBuilder::new(schema);
        for (id, name) in [(1, "alpha"), (2, "beta"), (3, "alphabet")] {
            builder
                .push_row(&[Value::Int32(id), Value::Utf8(name.to_string())])
                .unwrap();
        }
        builder.finish()
    }

    #[test]
    fn scalar_comparisons() -> Result<()> {
        let out = apply_filter(
            &batch(),
            "id",
            CmpOp::GtEq,
            &FilterValue::Scalar(Value::Int32(2)),
        )?;
        assert_eq!(out.num_rows(), 2);
        // i32 column against a float literal
        let out = apply_filter(
            &batch(),
            "id",
            CmpOp::Lt,
            &FilterValue::Scalar(Value::Float64(2.5)),
        )?;
        assert_eq!(out.num_rows(), 2);
        Ok(())
    }

    #[test]
    fn list_and_substring() -> Result<()> {
        let out = apply_filter(
            &batch(),
            "name",
            CmpOp::In,
            &FilterValue::List(vec![
                Value::Utf8("beta".to_string()),
                Value::Utf8("gamma".to_string()),
            ]),
        )?;
        assert_eq!(out.num_rows(), 1);
        let out = apply_filter(
            &batch(),
            "name",
            CmpOp::Contains,
            &FilterValue::Scalar(Value::Utf8("alpha".to_string())),
        )?;
        assert_eq!(out.num_rows(), 2);
        let out = apply_filter(
            &batch(),
            "id",
            CmpOp::NotIn,
            &FilterValue::List(vec![Value::Int32(1)]),
        )?;
        assert_eq!(out.num_rows(), 2);
        Ok(())
    }

    #[test]
    fn null_fails_all_predicates() -> Result<()> {
        assert!(!compare(
            &Value::Null,
            CmpOp::Neq,
            &FilterValue::Scalar(Value::Int32(1))
        )?);
        Ok(())
    }

    #[test]
    fn contains_on_numbers_is_a_type_error() {
        let result = apply_filter(
            &batch(),
            "id",
            CmpOp::Contains,
            &FilterValue::Scalar(Value::Utf8("1".to_string())),
        );
        assert!(matches!(result, Err(Error::TypeMismatch(_))));
    }
}
