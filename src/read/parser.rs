//! Byte-level CSV decoding into columnar chunks.
//!
//! The parser walks the input once, byte by byte. String cells become
//! `(offset, length)` slices into the block's own buffer, so a chunk's
//! memory is dominated by that single backing allocation; nothing is copied
//! per cell. Scalar predicates are evaluated against the raw field bytes
//! before any typed storage is written for the row.
//!
//! Newlines inside quoted fields are not supported: the row index treats
//! every `\n` as a row terminator, and the parser follows the same rule.

use std::collections::HashMap;

use crate::chunk::{unescape_quotes, Bitmap, Chunk, Vector};
use crate::datetime::{parse_date, parse_datetime, DatetimeFormat};
use crate::error::{Error, Result};
use crate::plan::CmpOp;
use crate::schema::Schema;
use crate::types::DType;

/// Default textual values decoded as null, in addition to user-supplied ones.
pub const DEFAULT_NULL_VALUES: [&str; 4] = ["NA", "null", "-", ""];

/// Parsing knobs shared by the eager reader and the scanning executor.
#[derive(Debug, Clone)]
pub struct ParseOptions {
    pub delimiter: u8,
    /// Error on unparsable numerics instead of defaulting to zero.
    pub strict_numeric: bool,
    /// Record a validity bitmap per column while parsing.
    pub track_nulls: bool,
    /// The complete null set (defaults plus user additions), as raw bytes.
    pub null_values: Vec<Vec<u8>>,
    /// Format per `DateTime` column name; unlisted columns use ISO.
    pub datetime_formats: HashMap<String, DatetimeFormat>,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            strict_numeric: false,
            track_nulls: false,
            null_values: DEFAULT_NULL_VALUES
                .iter()
                .map(|v| v.as_bytes().to_vec())
                .collect(),
            datetime_formats: HashMap::new(),
        }
    }
}

/// A scalar comparison lowered for evaluation against raw field bytes.
#[derive(Debug, Clone)]
pub struct ScanPredicate {
    /// Position of the column in the file schema.
    pub column: usize,
    pub dtype: DType,
    pub op: CmpOp,
    pub value: PredValue,
    pub format: DatetimeFormat,
}

/// A predicate constant, pre-lowered to the column's physical type.
#[derive(Debug, Clone)]
pub enum PredValue {
    I32(i32),
    F64(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    I64(i64),
}

/// One field located within a row.
#[derive(Debug, Clone, Copy, Default)]
struct FieldSpan {
    start: u32,
    len: u32,
    escaped: bool,
    present: bool,
}

/// Parses `value`, stopping at the first invalid byte.
///
/// Returns `None` when no digit was consumed at all.
pub fn parse_i32_bytes(bytes: &[u8]) -> Option<i32> {
    let mut i = 0;
    let mut negative = false;
    if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
        negative = bytes[i] == b'-';
        i += 1;
    }
    let mut value: i64 = 0;
    let mut any = false;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        value = value * 10 + (bytes[i] - b'0') as i64;
        if value > i32::MAX as i64 + 1 {
            value = i32::MAX as i64 + 1;
        }
        any = true;
        i += 1;
    }
    if !any {
        return None;
    }
    let value = if negative { -value } else { value };
    Some(value.clamp(i32::MIN as i64, i32::MAX as i64) as i32)
}

/// Parses `value` with sign, decimal point and scientific exponent,
/// stopping at the first invalid byte. `None` when no digit was consumed.
pub fn parse_f64_bytes(bytes: &[u8]) -> Option<f64> {
    let mut i = 0;
    let n = bytes.len();
    let mut negative = false;
    if i < n && (bytes[i] == b'+' || bytes[i] == b'-') {
        negative = bytes[i] == b'-';
        i += 1;
    }
    let mut mantissa: f64 = 0.0;
    let mut exponent: i32 = 0;
    let mut any = false;
    while i < n && bytes[i].is_ascii_digit() {
        mantissa = mantissa * 10.0 + (bytes[i] - b'0') as f64;
        any = true;
        i += 1;
    }
    if i < n && bytes[i] == b'.' {
        i += 1;
        while i < n && bytes[i].is_ascii_digit() {
            mantissa = mantissa * 10.0 + (bytes[i] - b'0') as f64;
            exponent -= 1;
            any = true;
            i += 1;
        }
    }
    if !any {
        return None;
    }
    if i < n && (bytes[i] == b'e' || bytes[i] == b'E') {
        i += 1;
        let mut exp_negative = false;
        if i < n && (bytes[i] == b'+' || bytes[i] == b'-') {
            exp_negative = bytes[i] == b'-';
            i += 1;
        }
        let mut exp: i32 = 0;
        let mut exp_any = false;
        while i < n && bytes[i].is_ascii_digit() {
            exp = exp.saturating_mul(10).saturating_add((bytes[i] - b'0') as i32);
            exp_any = true;
            i += 1;
        }
        if exp_any {
            exponent += if exp_negative { -exp } else { exp };
        }
    }
    let value = mantissa * 10f64.powi(exponent);
    Some(if negative { -value } else { value })
}

/// Parses a boolean literal. `None` when the bytes are not a boolean.
pub fn parse_bool_bytes(bytes: &[u8]) -> Option<bool> {
    match bytes {
        b"true" | b"True" | b"TRUE" | b"t" | b"T" | b"1" => Some(true),
        b"false" | b"False" | b"FALSE" | b"f" | b"F" | b"0" => Some(false),
        _ => None,
    }
}

/// Decodes one byte range into a columnar chunk.
///
/// `projection`, when present, lists the (ascending) schema positions to
/// materialize; every other column is located but never stored. Rows failing
/// any of `predicates` are dropped before typed storage is written.
/// Missing trailing fields default to the dtype's zero value.
pub fn parse_chunk_bytes(
    bytes: Vec<u8>,
    start_row: usize,
    expected_rows: usize,
    schema: &Schema,
    projection: Option<&[usize]>,
    predicates: &[ScanPredicate],
    options: &ParseOptions,
) -> Result<Chunk> {
    let num_fields = schema.len();
    let out_columns: Vec<usize> = match projection {
        Some(indices) => indices.to_vec(),
        None => (0..num_fields).collect(),
    };

    let mut columns: Vec<Vector> = out_columns
        .iter()
        .map(|i| Vector::with_capacity(schema.fields()[*i].1, expected_rows))
        .collect();
    let mut validity: Vec<Option<Bitmap>> = out_columns
        .iter()
        .map(|_| options.track_nulls.then(Bitmap::empty))
        .collect();
    let formats: Vec<DatetimeFormat> = out_columns
        .iter()
        .map(|i| {
            options
                .datetime_formats
                .get(schema.fields()[*i].0.as_str())
                .copied()
                .unwrap_or(DatetimeFormat::Iso)
        })
        .collect();

    let mut spans: Vec<FieldSpan> = vec![FieldSpan::default(); num_fields];
    let mut position = 0usize;
    let mut row = 0usize;

    while position < bytes.len() {
        for span in spans.iter_mut() {
            span.present = false;
        }
        position = locate_row_fields(&bytes, position, options.delimiter, &mut spans);

        let keep = predicates
            .iter()
            .all(|pred| eval_predicate(&bytes, &spans, pred));
        if !keep {
            continue;
        }

        for (out, file_col) in out_columns.iter().enumerate() {
            let span = spans[*file_col];
            let cell = cell_bytes(&bytes, span);
            let is_null = !span.present || is_null_value(cell, span, options);
            if let Some(bitmap) = validity[out].as_mut() {
                bitmap.push(!is_null);
            }
            append_cell(
                &mut columns[out],
                &bytes,
                span,
                is_null,
                formats[out],
                options.strict_numeric,
                start_row + row,
            )?;
        }
        row += 1;
    }

    Chunk::new(start_row, columns, validity, bytes)
}

/// Locates the fields of the row starting at `position`; returns the
/// position just past the row's terminator.
fn locate_row_fields(
    bytes: &[u8],
    mut position: usize,
    delimiter: u8,
    spans: &mut [FieldSpan],
) -> usize {
    let n = bytes.len();
    let mut field = 0usize;
    loop {
        // one field
        let (span, next) = if bytes.get(position) == Some(&b'"') {
            locate_quoted(bytes, position)
        } else {
            let start = position;
            let mut i = position;
            while i < n && bytes[i] != delimiter && bytes[i] != b'\n' {
                i += 1;
            }
            let mut end = i;
            if end > start && bytes[end - 1] == b'\r' && (i >= n || bytes[i] == b'\n') {
                end -= 1;
            }
            (
                FieldSpan {
                    start: start as u32,
                    len: (end - start) as u32,
                    escaped: false,
                    present: true,
                },
                i,
            )
        };
        if field < spans.len() {
            spans[field] = span;
        }
        field += 1;
        position = next;

        // stray bytes after a closing quote run to the next separator
        while position < n && bytes[position] != delimiter && bytes[position] != b'\n' {
            position += 1;
        }
        match bytes.get(position) {
            Some(&b'\n') => {
                position += 1;
                break;
            }
            None => break,
            Some(_) => position += 1,
        }
    }
    position
}

/// Locates a quoted field starting at the opening quote. A `\n` still
/// terminates the row, even inside quotes.
fn locate_quoted(bytes: &[u8], position: usize) -> (FieldSpan, usize) {
    let n = bytes.len();
    let start = position + 1;
    let mut i = start;
    let mut escaped = false;
    while i < n && bytes[i] != b'\n' {
        if bytes[i] == b'"' {
            if bytes.get(i + 1) == Some(&b'"') {
                escaped = true;
                i += 2;
                continue;
            }
            // closing quote
            return (
                FieldSpan {
                    start: start as u32,
                    len: (i - start) as u32,
                    escaped,
                    present: true,
                },
                i + 1,
            );
        }
        i += 1;
    }
    // unterminated quote: the field runs to the end of the row
    (
        FieldSpan {
            start: start as u32,
            len: (i - start) as u32,
            escaped,
            present: true,
        },
        i,
    )
}

#[inline]
fn cell_bytes(bytes: &[u8], span: FieldSpan) -> &[u8] {
    if span.present {
        &bytes[span.start as usize..(span.start + span.len) as usize]
    } else {
        &[]
    }
}

fn is_null_value(cell: &[u8], span: FieldSpan, options: &ParseOptions) -> bool {
    if span.escaped {
        let decoded = unescape_quotes(cell);
        return options.null_values.iter().any(|null| *null == decoded);
    }
    options.null_values.iter().any(|null| null == cell)
}

fn append_cell(
    column: &mut Vector,
    bytes: &[u8],
    span: FieldSpan,
    is_null: bool,
    format: DatetimeFormat,
    strict_numeric: bool,
    row: usize,
) -> Result<()> {
    let cell = cell_bytes(bytes, span);
    match column {
        Vector::Int32(values) => {
            let parsed = if is_null { Some(0) } else { parse_i32_bytes(cell) };
            match parsed {
                Some(value) => values.push(value),
                None if strict_numeric => {
                    return Err(Error::Parse(format!(
                        "row {}: \"{}\" is not a valid i32",
                        row,
                        String::from_utf8_lossy(cell)
                    )))
                }
                None => values.push(0),
            }
        }
        Vector::Float64(values) => {
            let parsed = if is_null { Some(0.0) } else { parse_f64_bytes(cell) };
            match parsed {
                Some(value) => values.push(value),
                None if strict_numeric => {
                    return Err(Error::Parse(format!(
                        "row {}: \"{}\" is not a valid f64",
                        row,
                        String::from_utf8_lossy(cell)
                    )))
                }
                None => values.push(0.0),
            }
        }
        Vector::Bool(values) => {
            let parsed = if is_null {
                false
            } else {
                parse_bool_bytes(cell).unwrap_or(false)
            };
            values.push(parsed as u8);
        }
        Vector::Utf8 {
            offsets,
            lengths,
            needs_unescape,
        } => {
            offsets.push(span.start);
            lengths.push(if span.present { span.len } else { 0 });
            needs_unescape.push(span.escaped as u8);
        }
        Vector::Date(values) => {
            if is_null {
                values.push(0);
            } else {
                let text = std::str::from_utf8(cell)
                    .map_err(|e| Error::Parse(format!("row {}: invalid UTF-8: {}", row, e)))?;
                values.push(parse_date(text)?);
            }
        }
        Vector::DateTime(values) => {
            if is_null {
                values.push(0);
            } else {
                let text = std::str::from_utf8(cell)
                    .map_err(|e| Error::Parse(format!("row {}: invalid UTF-8: {}", row, e)))?;
                values.push(parse_datetime(text, format)?);
            }
        }
    }
    Ok(())
}

/// Splits one row into decoded cells. Used for header parsing and schema
/// sampling; the chunk parser proper never allocates per cell.
pub(crate) fn split_row(bytes: &[u8], delimiter: u8) -> Vec<Vec<u8>> {
    if bytes.is_empty() {
        return vec![];
    }
    let n = bytes.len();
    let mut out = vec![];
    let mut position = 0usize;
    loop {
        let (span, next) = if bytes.get(position) == Some(&b'"') {
            locate_quoted(bytes, position)
        } else {
            let start = position;
            let mut i = position;
            while i < n && bytes[i] != delimiter && bytes[i] != b'\n' {
                i += 1;
            }
            let mut end = i;
            if end > start && bytes[end - 1] == b'\r' && (i >= n || bytes[i] == b'\n') {
                end -= 1;
            }
            (
                FieldSpan {
                    start: start as u32,
                    len: (end - start) as u32,
                    escaped: false,
                    present: true,
                },
                i,
            )
        };
        let cell = cell_bytes(bytes, span);
        out.push(if span.escaped {
            unescape_quotes(cell)
        } else {
            cell.to_vec()
        });
        position = next;
        while position < n && bytes[position] != delimiter && bytes[position] != b'\n' {
            position += 1;
        }
        match bytes.get(position) {
            Some(&b'\n') | None => break,
            Some(_) => position += 1,
        }
    }
    out
}

/// Evaluates a lowered predicate against one row's raw field bytes.
fn eval_predicate(bytes: &[u8], spans: &[FieldSpan], pred: &ScanPredicate) -> bool {
    let span = spans[pred.column];
    let cell = cell_bytes(bytes, span);
    match (&pred.value, pred.dtype) {
        (PredValue::I32(rhs), DType::Int32) => {
            let lhs = parse_i32_bytes(cell).unwrap_or(0);
            compare_ordered(lhs.cmp(rhs), pred.op)
        }
        (PredValue::F64(rhs), _) => {
            let lhs = parse_f64_bytes(cell).unwrap_or(0.0);
            compare_ordered(lhs.total_cmp(rhs), pred.op)
        }
        (PredValue::Bool(rhs), _) => {
            let lhs = parse_bool_bytes(cell).unwrap_or(false);
            compare_ordered(lhs.cmp(rhs), pred.op)
        }
        (PredValue::Bytes(rhs), _) => {
            if span.escaped {
                let decoded = unescape_quotes(cell);
                compare_ordered(decoded.as_slice().cmp(rhs.as_slice()), pred.op)
            } else {
                compare_ordered(cell.cmp(rhs.as_slice()), pred.op)
            }
        }
        (PredValue::I64(rhs), dtype) => {
            let text = match std::str::from_utf8(cell) {
                Ok(text) => text,
                Err(_) => return false,
            };
            let lhs = match dtype {
                DType::Date => parse_date(text).unwrap_or(0),
                _ => parse_datetime(text, pred.format).unwrap_or(0),
            };
            compare_ordered(lhs.cmp(rhs), pred.op)
        }
        (PredValue::I32(_), _) => false,
    }
}

fn compare_ordered(ordering: std::cmp::Ordering, op: CmpOp) -> bool {
    use std::cmp::Ordering::*;
    match op {
        CmpOp::Eq => ordering == Equal,
        CmpOp::Neq => ordering != Equal,
        CmpOp::Lt => ordering == Less,
        CmpOp::LtEq => ordering != Greater,
        CmpOp::Gt => ordering == Greater,
        CmpOp::GtEq => ordering != Less,
        // list and substring ops are never lowered into the scan
        CmpOp::In | CmpOp::NotIn | CmpOp::Contains => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DType;

    fn schema() -> Schema {
        Schema::new(vec![
            ("a".to_string(), DType::Int32),
            ("b".to_string(), DType::Utf8),
            ("c".to_string(), DType::Float64),
        ])
        .unwrap()
    }

    fn parse(content: &str) -> Chunk {
        parse_chunk_bytes(
            content.as_bytes().to_vec(),
            0,
            4,
            &schema(),
            None,
            &[],
            &ParseOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn numbers() {
        assert_eq!(parse_i32_bytes(b"42"), Some(42));
        assert_eq!(parse_i32_bytes(b"-7"), Some(-7));
        assert_eq!(parse_i32_bytes(b"+13"), Some(13));
        assert_eq!(parse_i32_bytes(b"12abc"), Some(12));
        assert_eq!(parse_i32_bytes(b"abc"), None);
        assert_eq!(parse_i32_bytes(b""), None);
        assert_eq!(parse_i32_bytes(b"99999999999"), Some(i32::MAX));

        assert_eq!(parse_f64_bytes(b"1.5"), Some(1.5));
        assert_eq!(parse_f64_bytes(b"-0.25"), Some(-0.25));
        assert_eq!(parse_f64_bytes(b"2e3"), Some(2000.0));
        assert_eq!(parse_f64_bytes(b"1.5e-2"), Some(0.015));
        assert_eq!(parse_f64_bytes(b"3.14xyz"), Some(3.14));
        assert_eq!(parse_f64_bytes(b"."), None);

        assert_eq!(parse_bool_bytes(b"true"), Some(true));
        assert_eq!(parse_bool_bytes(b"0"), Some(false));
        assert_eq!(parse_bool_bytes(b"yes"), None);
    }

    #[test]
    fn basic_rows() {
        let chunk = parse("1,alpha,1.5\n2,beta,2.5\n");
        assert_eq!(chunk.row_count(), 2);
        match chunk.column(0).unwrap() {
            Vector::Int32(values) => assert_eq!(values, &vec![1, 2]),
            _ => panic!("expected i32"),
        }
        assert_eq!(chunk.str_value(1, 0).unwrap(), "alpha");
        match chunk.column(2).unwrap() {
            Vector::Float64(values) => assert_eq!(values, &vec![1.5, 2.5]),
            _ => panic!("expected f64"),
        }
    }

    #[test]
    fn quoted_fields() {
        let chunk = parse("1,\"a,b\",1.0\n2,\"say \"\"hi\"\"\",2.0\n");
        assert_eq!(chunk.row_count(), 2);
        assert_eq!(chunk.str_value(1, 0).unwrap(), "a,b");
        assert_eq!(chunk.str_value(1, 1).unwrap(), "say \"hi\"");
    }

    #[test]
    fn carriage_returns_stripped() {
        let chunk = parse("1,x,1.0\r\n2,y,2.0\r\n");
        assert_eq!(chunk.row_count(), 2);
        assert_eq!(chunk.str_value(1, 1).unwrap(), "y");
        match chunk.column(2).unwrap() {
            Vector::Float64(values) => assert_eq!(values, &vec![1.0, 2.0]),
            _ => panic!("expected f64"),
        }
    }

    #[test]
    fn missing_trailing_fields_default() {
        let chunk = parse("1,x\n2\n");
        assert_eq!(chunk.row_count(), 2);
        assert_eq!(chunk.str_value(1, 1).unwrap(), "");
        match chunk.column(2).unwrap() {
            Vector::Float64(values) => assert_eq!(values, &vec![0.0, 0.0]),
            _ => panic!("expected f64"),
        }
    }

    #[test]
    fn invalid_numerics_default_to_zero() {
        let chunk = parse("oops,x,nan\n");
        match chunk.column(0).unwrap() {
            Vector::Int32(values) => assert_eq!(values, &vec![0]),
            _ => panic!("expected i32"),
        }
        match chunk.column(2).unwrap() {
            Vector::Float64(values) => assert_eq!(values, &vec![0.0]),
            _ => panic!("expected f64"),
        }
    }

    #[test]
    fn strict_numeric_errors() {
        let options = ParseOptions {
            strict_numeric: true,
            ..Default::default()
        };
        let result = parse_chunk_bytes(
            b"oops,x,1.0\n".to_vec(),
            0,
            1,
            &schema(),
            None,
            &[],
            &options,
        );
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[test]
    fn nulls_tracked() {
        let options = ParseOptions {
            track_nulls: true,
            ..Default::default()
        };
        let chunk = parse_chunk_bytes(
            b"1,NA,2.0\nNA,x,-\n".to_vec(),
            0,
            2,
            &schema(),
            None,
            &[],
            &options,
        )
        .unwrap();
        let validity_a = chunk.validity(0).unwrap();
        assert!(validity_a.get(0));
        assert!(!validity_a.get(1));
        let validity_b = chunk.validity(1).unwrap();
        assert!(!validity_b.get(0));
        let validity_c = chunk.validity(2).unwrap();
        assert!(!validity_c.get(1));
        match chunk.column(0).unwrap() {
            Vector::Int32(values) => assert_eq!(values, &vec![1, 0]),
            _ => panic!("expected i32"),
        }
    }

    #[test]
    fn projection_materializes_only_requested() {
        let chunk = parse_chunk_bytes(
            b"1,x,1.5\n2,y,2.5\n".to_vec(),
            0,
            2,
            &schema(),
            Some(&[0, 2]),
            &[],
            &ParseOptions::default(),
        )
        .unwrap();
        assert_eq!(chunk.columns().len(), 2);
        match chunk.column(1).unwrap() {
            Vector::Float64(values) => assert_eq!(values, &vec![1.5, 2.5]),
            _ => panic!("expected f64"),
        }
    }

    #[test]
    fn predicates_drop_rows_before_materialization() {
        let pred = ScanPredicate {
            column: 0,
            dtype: DType::Int32,
            op: CmpOp::Gt,
            value: PredValue::I32(1),
            format: DatetimeFormat::Iso,
        };
        let chunk = parse_chunk_bytes(
            b"1,x,1.0\n2,y,2.0\n3,z,3.0\n".to_vec(),
            0,
            3,
            &schema(),
            None,
            &[pred],
            &ParseOptions::default(),
        )
        .unwrap();
        assert_eq!(chunk.row_count(), 2);
        assert_eq!(chunk.str_value(1, 0).unwrap(), "y");
    }

    #[test]
    fn string_predicate_on_bytes() {
        let pred = ScanPredicate {
            column: 1,
            dtype: DType::Utf8,
            op: CmpOp::Eq,
            value: PredValue::Bytes(b"beta".to_vec()),
            format: DatetimeFormat::Iso,
        };
        let chunk = parse_chunk_bytes(
            b"1,alpha,1.0\n2,beta,2.0\n".to_vec(),
            0,
            2,
            &schema(),
            None,
            &[pred],
            &ParseOptions::default(),
        )
        .unwrap();
        assert_eq!(chunk.row_count(), 1);
        match chunk.column(0).unwrap() {
            Vector::Int32(values) => assert_eq!(values, &vec![2]),
            _ => panic!("expected i32"),
        }
    }
}
