use colstream::datetime::DatetimeFormat;
use colstream::error::MEMORY_LIMIT_EXCEEDED;
use colstream::indexes::RowIndex;
use colstream::{read_csv, DType, ReadOptions, Result, Schema, Value};

use crate::{i32_column, temp_csv};

fn two_int_schema() -> Schema {
    Schema::new(vec![
        ("a".to_string(), DType::Int32),
        ("b".to_string(), DType::Int32),
    ])
    .unwrap()
}

#[test]
fn eager_read_two_rows() -> Result<()> {
    let file = temp_csv("a,b\n1,2\n3,4\n");
    let options = ReadOptions {
        schema: Some(two_int_schema()),
        ..Default::default()
    };
    let output = read_csv(file.path(), options)?;
    assert!(output.memory_error.is_none());
    assert_eq!(output.data.num_rows(), 2);
    assert_eq!(
        output.data.rows()?,
        vec![
            vec![Value::Int32(1), Value::Int32(2)],
            vec![Value::Int32(3), Value::Int32(4)],
        ]
    );
    Ok(())
}

#[test]
fn row_index_covers_the_file() -> Result<()> {
    let content = "a,b\n1,2\n3,4\n55,66\n";
    let index = RowIndex::build(content.as_bytes(), true)?;
    assert_eq!(index.row_count(), 3);
    // rows_range(0, N) spans first data byte to file end
    assert_eq!(
        index.rows_range(0, 3)?,
        (4, content.len() as u64)
    );
    // each row slice ends at its newline
    for i in 0..3 {
        let (start, end) = index.rows_range(i, i + 1)?;
        let slice = &content.as_bytes()[start as usize..end as usize];
        assert_eq!(slice.iter().filter(|b| **b == b'\n').count(), 1);
    }
    Ok(())
}

#[test]
fn quoted_fields_roundtrip() -> Result<()> {
    let content = "name,comment\nplain,\"a,b\"\nsecond,\"say \"\"hi\"\"\"\n";
    let file = temp_csv(content);
    let schema = Schema::new(vec![
        ("name".to_string(), DType::Utf8),
        ("comment".to_string(), DType::Utf8),
    ])?;
    let output = read_csv(
        file.path(),
        ReadOptions {
            schema: Some(schema),
            ..Default::default()
        },
    )?;
    assert_eq!(
        output.data.rows()?,
        vec![
            vec![
                Value::Utf8("plain".to_string()),
                Value::Utf8("a,b".to_string())
            ],
            vec![
                Value::Utf8("second".to_string()),
                Value::Utf8("say \"hi\"".to_string())
            ],
        ]
    );
    Ok(())
}

#[test]
fn schema_inference_by_sampling() -> Result<()> {
    let file = temp_csv("id,ratio,flag,label\n1,0.5,true,x\n2,1.25,false,y\n3,2.0,true,z\n");
    let output = read_csv(file.path(), ReadOptions::default())?;
    let schema = output.data.schema();
    assert_eq!(
        schema.fields(),
        &[
            ("id".to_string(), DType::Int32),
            ("ratio".to_string(), DType::Float64),
            ("flag".to_string(), DType::Bool),
            ("label".to_string(), DType::Utf8),
        ]
    );
    assert_eq!(output.data.value(2, 1)?, Value::Float64(2.0));
    assert_eq!(output.data.value(1, 2)?, Value::Bool(false));
    Ok(())
}

#[test]
fn null_values_and_bitmaps() -> Result<()> {
    let file = temp_csv("a,b\n1,x\nNA,y\n3,-\n");
    let options = ReadOptions {
        schema: Some(Schema::new(vec![
            ("a".to_string(), DType::Int32),
            ("b".to_string(), DType::Utf8),
        ])?),
        nullable: true,
        ..Default::default()
    };
    let output = read_csv(file.path(), options)?;
    assert_eq!(output.data.value(1, 0)?, Value::Null);
    assert_eq!(output.data.value(2, 1)?, Value::Null);
    assert_eq!(output.data.value(0, 0)?, Value::Int32(1));
    Ok(())
}

#[test]
fn user_null_values_extend_the_default_set() -> Result<()> {
    let file = temp_csv("a\n1\nmissing\n");
    let options = ReadOptions {
        schema: Some(Schema::new(vec![("a".to_string(), DType::Int32)])?),
        nullable: true,
        null_values: vec!["missing".to_string()],
        ..Default::default()
    };
    let output = read_csv(file.path(), options)?;
    assert_eq!(output.data.value(1, 0)?, Value::Null);
    Ok(())
}

#[test]
fn chunked_read_equals_whole_read() -> Result<()> {
    let mut content = String::from("a,b\n");
    for i in 0..100 {
        content.push_str(&format!("{},{}\n", i, i * 2));
    }
    let file = temp_csv(&content);
    let whole = read_csv(
        file.path(),
        ReadOptions {
            schema: Some(two_int_schema()),
            ..Default::default()
        },
    )?;
    let chunked = read_csv(
        file.path(),
        ReadOptions {
            schema: Some(two_int_schema()),
            chunk_size: 7,
            ..Default::default()
        },
    )?;
    assert_eq!(whole.data, chunked.data);
    assert_eq!(chunked.data.num_rows(), 100);
    Ok(())
}

#[test]
fn max_rows_truncates() -> Result<()> {
    let file = temp_csv("a,b\n1,2\n3,4\n5,6\n");
    let output = read_csv(
        file.path(),
        ReadOptions {
            schema: Some(two_int_schema()),
            max_rows: Some(2),
            ..Default::default()
        },
    )?;
    assert_eq!(i32_column(&output.data, "a"), vec![1, 3]);
    Ok(())
}

#[test]
fn memory_limit_denial_is_an_envelope() -> Result<()> {
    let file = temp_csv("a,b\n1,2\n3,4\n5,6\n7,8\n");
    let output = read_csv(
        file.path(),
        ReadOptions {
            schema: Some(two_int_schema()),
            memory_limit_bytes: Some(10),
            ..Default::default()
        },
    )?;
    assert!(output.data.is_empty());
    let error = output.memory_error.expect("denied");
    assert_eq!(error.code, MEMORY_LIMIT_EXCEEDED);
    assert!(error.requested_bytes > 10);
    assert_eq!(error.available_bytes, 10);
    assert_eq!(error.global_limit_bytes, 10);
    assert!(!error.hint().is_empty());
    Ok(())
}

#[test]
fn datetime_columns() -> Result<()> {
    let file = temp_csv(
        "day,at\n2024-01-01,2024-01-01 00:00:01\n2024-01-02,2024-01-01 00:01:00\n",
    );
    let mut options = ReadOptions {
        schema: Some(Schema::new(vec![
            ("day".to_string(), DType::Date),
            ("at".to_string(), DType::DateTime),
        ])?),
        ..Default::default()
    };
    options
        .datetime_formats
        .insert("at".to_string(), DatetimeFormat::Sql);
    let output = read_csv(file.path(), options)?;
    let d0 = match output.data.value(0, 0)? {
        Value::Date(d) => d,
        other => panic!("expected date, got {:?}", other),
    };
    let d1 = match output.data.value(1, 0)? {
        Value::Date(d) => d,
        other => panic!("expected date, got {:?}", other),
    };
    assert_eq!(d1 - d0, 1);
    match (output.data.value(0, 1)?, output.data.value(1, 1)?) {
        (Value::DateTime(a), Value::DateTime(b)) => assert_eq!(b - a, 59_000),
        other => panic!("expected datetimes, got {:?}", other),
    }
    Ok(())
}

#[test]
fn missing_file_is_a_file_error() {
    let result = read_csv("/definitely/not/here.csv", ReadOptions::default());
    match result {
        Err(error) => assert!(!error.hint().is_empty()),
        Ok(_) => panic!("expected an error"),
    }
}

#[test]
fn crlf_and_missing_trailing_newline() -> Result<()> {
    let file = temp_csv("a,b\r\n1,2\r\n3,4");
    let output = read_csv(
        file.path(),
        ReadOptions {
            schema: Some(two_int_schema()),
            ..Default::default()
        },
    )?;
    assert_eq!(i32_column(&output.data, "b"), vec![2, 4]);
    Ok(())
}
