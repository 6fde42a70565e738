use colstream::exec::{execute, CancelToken, ExecContext};
use colstream::frame::scan_csv;
use colstream::plan::{AggExpr, AggFunc, CmpOp, JoinHow, SortField};
use colstream::{Error, ReadOptions, Result, Value};

use crate::{i32_column, temp_csv};

fn options() -> ReadOptions {
    ReadOptions::default()
}

#[test]
fn sort_with_tiny_runs() -> Result<()> {
    let file = temp_csv("id,value\n1,30\n2,10\n3,20\n4,40\n5,15\n");
    let out = scan_csv(file.path(), options())?
        .sort_by(
            vec![SortField {
                column: "value".to_string(),
                descending: false,
            }],
            Some(64),
        )
        .collect()?;
    assert_eq!(i32_column(&out.data, "value"), vec![10, 15, 20, 30, 40]);
    Ok(())
}

#[test]
fn groupby_sum_and_count() -> Result<()> {
    let file = temp_csv("group,value\nA,1\nB,2\nA,3\nB,4\nA,5\n");
    let out = scan_csv(file.path(), options())?
        .groupby(
            &["group"],
            vec![
                AggExpr::new("value", AggFunc::Sum, "sum"),
                AggExpr::new("value", AggFunc::Count, "count"),
            ],
        )
        .collect()?;
    let frame = &out.data;
    assert_eq!(frame.num_rows(), 2);
    let mut seen = std::collections::HashMap::new();
    for row in 0..2 {
        let key = match frame.value(row, 0)? {
            Value::Utf8(k) => k,
            other => panic!("expected string key, got {:?}", other),
        };
        seen.insert(key, (frame.value(row, 1)?, frame.value(row, 2)?));
    }
    assert_eq!(seen["A"], (Value::Int32(9), Value::Int32(3)));
    assert_eq!(seen["B"], (Value::Int32(6), Value::Int32(2)));
    Ok(())
}

#[test]
fn left_join_fills_nulls() -> Result<()> {
    let left = temp_csv("id,value\n1,10\n2,20\n3,30\n");
    let right = temp_csv("id,score\n2,200\n");
    let out = scan_csv(left.path(), options())?
        .join(scan_csv(right.path(), options())?, &["id"], JoinHow::Left)
        .collect()?;
    assert_eq!(
        out.data.rows()?,
        vec![
            vec![Value::Int32(1), Value::Int32(10), Value::Null],
            vec![Value::Int32(2), Value::Int32(20), Value::Int32(200)],
            vec![Value::Int32(3), Value::Int32(30), Value::Null],
        ]
    );
    Ok(())
}

#[test]
fn distinct_keeps_first_occurrences() -> Result<()> {
    let file = temp_csv("a,b\n1,10\n1,10\n2,20\n1,10\n3,30\n");
    let out = scan_csv(file.path(), options())?.distinct(None).collect()?;
    assert_eq!(
        out.data.rows()?,
        vec![
            vec![Value::Int32(1), Value::Int32(10)],
            vec![Value::Int32(2), Value::Int32(20)],
            vec![Value::Int32(3), Value::Int32(30)],
        ]
    );
    Ok(())
}

#[test]
fn pushdown_matches_post_filter() -> Result<()> {
    let mut content = String::from("id,name,value\n");
    for i in 0..200 {
        content.push_str(&format!(
            "{},{},{}\n",
            i,
            if i % 3 == 0 { "keep" } else { "drop" },
            i * 2
        ));
    }
    let file = temp_csv(&content);

    // pushdown-eligible predicates land in the scan; the result must equal
    // filtering the eagerly-read frame
    let filtered = scan_csv(file.path(), options())?
        .filter("id", CmpOp::Lt, Value::Int32(100))
        .filter("name", CmpOp::Eq, Value::Utf8("keep".to_string()))
        .collect()?;

    let eager = colstream::read_csv(file.path(), options())?;
    let mut expected = vec![];
    for row in 0..eager.data.num_rows() {
        let id = eager.data.value(row, 0)?;
        let name = eager.data.value(row, 1)?;
        if matches!(id, Value::Int32(v) if v < 100)
            && name == Value::Utf8("keep".to_string())
        {
            expected.push(eager.data.row(row)?);
        }
    }
    assert_eq!(filtered.data.rows()?, expected);
    assert_eq!(filtered.data.num_rows(), 34);
    Ok(())
}

#[test]
fn select_narrows_and_reorders() -> Result<()> {
    let file = temp_csv("a,b,c\n1,x,2.5\n2,y,3.5\n");
    let out = scan_csv(file.path(), options())?
        .select(&["c", "a"])
        .collect()?;
    assert_eq!(
        out.data.schema().names().collect::<Vec<_>>(),
        vec!["c", "a"]
    );
    assert_eq!(out.data.value(0, 0)?, Value::Float64(2.5));
    assert_eq!(out.data.value(1, 1)?, Value::Int32(2));
    Ok(())
}

#[test]
fn filter_above_select_survives_reordering() -> Result<()> {
    // the filter references a column the select keeps; the optimizer moves
    // the filter below the select
    let file = temp_csv("a,b\n1,10\n2,20\n3,30\n");
    let out = scan_csv(file.path(), options())?
        .select(&["b", "a"])
        .filter("a", CmpOp::GtEq, Value::Int32(2))
        .collect()?;
    assert_eq!(i32_column(&out.data, "b"), vec![20, 30]);
    Ok(())
}

#[test]
fn in_and_contains_filters() -> Result<()> {
    let file = temp_csv("id,name\n1,alpha\n2,beta\n3,alphabet\n4,gamma\n");
    let frame = scan_csv(file.path(), options())?;
    let out = frame
        .clone()
        .filter_in("id", vec![Value::Int32(1), Value::Int32(4)])
        .collect()?;
    assert_eq!(i32_column(&out.data, "id"), vec![1, 4]);

    let out = frame
        .clone()
        .filter_contains("name", "alpha")
        .collect()?;
    assert_eq!(i32_column(&out.data, "id"), vec![1, 3]);

    let out = frame
        .filter_not_in("id", vec![Value::Int32(2)])
        .collect()?;
    assert_eq!(i32_column(&out.data, "id"), vec![1, 3, 4]);
    Ok(())
}

#[test]
fn groupby_count_equals_distinct_count() -> Result<()> {
    let file = temp_csv("k,v\na,1\nb,2\na,3\nc,4\nb,5\na,6\n");
    let grouped = scan_csv(file.path(), options())?
        .groupby(&["k"], vec![AggExpr::new("v", AggFunc::Count, "n")])
        .collect()?;
    let distinct = scan_csv(file.path(), options())?
        .select(&["k"])
        .distinct(None)
        .collect()?;
    assert_eq!(grouped.data.num_rows(), distinct.data.num_rows());
    Ok(())
}

#[test]
fn sort_roundtrip_is_identity_on_unique_keys() -> Result<()> {
    let file = temp_csv("id,v\n3,c\n1,a\n2,b\n");
    let asc = scan_csv(file.path(), options())?
        .sort("id", false)
        .collect()?;
    let desc_of_asc = scan_csv(file.path(), options())?
        .sort("id", false)
        .sort_by(
            vec![SortField {
                column: "id".to_string(),
                descending: true,
            }],
            None,
        )
        .collect()?;
    assert_eq!(i32_column(&asc.data, "id"), vec![1, 2, 3]);
    assert_eq!(i32_column(&desc_of_asc.data, "id"), vec![3, 2, 1]);
    Ok(())
}

#[test]
fn multi_key_sort_is_direction_aware() -> Result<()> {
    let file = temp_csv("g,v\nb,1\na,2\nb,3\na,4\n");
    let out = scan_csv(file.path(), options())?
        .sort_by(
            vec![
                SortField {
                    column: "g".to_string(),
                    descending: false,
                },
                SortField {
                    column: "v".to_string(),
                    descending: true,
                },
            ],
            None,
        )
        .collect()?;
    assert_eq!(
        out.data.rows()?,
        vec![
            vec![Value::Utf8("a".to_string()), Value::Int32(4)],
            vec![Value::Utf8("a".to_string()), Value::Int32(2)],
            vec![Value::Utf8("b".to_string()), Value::Int32(3)],
            vec![Value::Utf8("b".to_string()), Value::Int32(1)],
        ]
    );
    Ok(())
}

#[test]
fn join_cardinalities() -> Result<()> {
    let left_file = temp_csv("k,l\n1,10\n2,20\n2,21\n3,30\n");
    let right_file = temp_csv("k,r\n2,200\n3,300\n4,400\n");
    let run = |how: JoinHow| -> Result<usize> {
        let out = scan_csv(left_file.path(), options())?
            .join(scan_csv(right_file.path(), options())?, &["k"], how)
            .collect()?;
        Ok(out.data.num_rows())
    };
    let inner = run(JoinHow::Inner)?;
    let left = run(JoinHow::Left)?;
    let right = run(JoinHow::Right)?;
    let outer = run(JoinHow::Outer)?;
    // matches: k=2 (2×1) + k=3 (1×1) = 3
    assert_eq!(inner, 3);
    // |inner| + |left-only| == |left| rows out of a left join
    assert_eq!(left, inner + 1);
    assert_eq!(right, inner + 1);
    assert_eq!(outer, inner + 1 + 1);
    Ok(())
}

#[test]
fn join_suffixes_clashing_columns() -> Result<()> {
    let left_file = temp_csv("id,value\n1,10\n");
    let right_file = temp_csv("id,value\n1,99\n");
    let out = scan_csv(left_file.path(), options())?
        .join(
            scan_csv(right_file.path(), options())?,
            &["id"],
            JoinHow::Inner,
        )
        .collect()?;
    assert_eq!(
        out.data.schema().names().collect::<Vec<_>>(),
        vec!["id", "value_x", "value_y"]
    );
    assert_eq!(out.data.value(0, 1)?, Value::Int32(10));
    assert_eq!(out.data.value(0, 2)?, Value::Int32(99));
    Ok(())
}

#[test]
fn blocking_operators_compose() -> Result<()> {
    let file = temp_csv("g,v\nb,1\na,2\nb,3\na,4\nc,5\n");
    let out = scan_csv(file.path(), options())?
        .groupby(&["g"], vec![AggExpr::new("v", AggFunc::Sum, "total")])
        .sort("total", true)
        .collect()?;
    assert_eq!(i32_column(&out.data, "total"), vec![6, 5, 4]);
    Ok(())
}

#[test]
fn cancellation_surfaces_as_cancelled() -> Result<()> {
    let file = temp_csv("a\n1\n2\n");
    let frame = scan_csv(file.path(), options())?;
    let cancel = CancelToken::new();
    cancel.cancel();
    let ctx = ExecContext {
        cancel,
        ..Default::default()
    };
    match frame.collect_with(&ctx) {
        Err(Error::Cancelled) => Ok(()),
        other => panic!("expected Cancelled, got {:?}", other.map(|o| o.data)),
    }
}

#[test]
fn execute_accepts_a_raw_plan() -> Result<()> {
    let file = temp_csv("a,b\n1,2\n3,4\n");
    let frame = scan_csv(file.path(), options())?;
    let output = execute(frame.plan(), &ExecContext::default())?;
    assert_eq!(output.data.num_rows(), 2);
    Ok(())
}

#[test]
fn explain_renders_the_optimized_tree() -> Result<()> {
    let file = temp_csv("a,b\n1,2\n");
    let rendered = scan_csv(file.path(), options())?
        .filter("a", CmpOp::Gt, Value::Int32(0))
        .select(&["a"])
        .explain()?;
    assert!(rendered.contains("SCAN"));
    assert!(rendered.contains("FILTER"));
    assert!(rendered.contains("SELECT"));
    Ok(())
}

#[test]
fn limit_truncates_collect() -> Result<()> {
    let file = temp_csv("a\n1\n2\n3\n4\n");
    let out = scan_csv(file.path(), options())?.limit(2).collect()?;
    assert_eq!(out.data.num_rows(), 2);
    Ok(())
}

#[test]
fn aggregate_on_string_column_is_a_type_error() {
    let file = temp_csv("g,v\na,1\n");
    let result = scan_csv(file.path(), options())
        .unwrap()
        .groupby(&["g"], vec![AggExpr::new("g", AggFunc::Sum, "s")])
        .collect();
    assert!(matches!(result, Err(Error::TypeMismatch(_))));
}

#[test]
fn missing_column_fails_lookup() {
    let file = temp_csv("a\n1\n");
    let result = scan_csv(file.path(), options())
        .unwrap()
        .filter("nope", CmpOp::Eq, Value::Int32(1))
        .collect();
    assert!(matches!(result, Err(Error::ColumnNotFound(name)) if name == "nope"));
}
