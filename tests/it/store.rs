use colstream::exec::ExecContext;
use colstream::frame::scan_csv;
use colstream::store::{Store, StoreOptions};
use colstream::{ReadOptions, Result};

use crate::temp_csv;

fn store_entries(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter(|e| {
                    e.as_ref()
                        .map(|e| e.path().extension().map(|x| x == "csb").unwrap_or(false))
                        .unwrap_or(false)
                })
                .count()
        })
        .unwrap_or(0)
}

#[test]
fn full_scan_is_materialized_and_reused() -> Result<()> {
    let file = temp_csv("a,b\n1,2\n3,4\n");
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");

    let ctx = ExecContext {
        store: Some(Store::open(StoreOptions::new(&store_dir))?),
        ..Default::default()
    };
    let first = scan_csv(file.path(), ReadOptions::default())?.collect_with(&ctx)?;
    assert_eq!(store_entries(&store_dir), 1);

    let second = scan_csv(file.path(), ReadOptions::default())?.collect_with(&ctx)?;
    assert_eq!(first.data, second.data);
    assert_eq!(store_entries(&store_dir), 1);
    Ok(())
}

#[test]
fn query_key_separates_entries() -> Result<()> {
    let file = temp_csv("a\n1\n");
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");

    for key in ["q1", "q2"] {
        let ctx = ExecContext {
            store: Some(Store::open(StoreOptions::new(&store_dir))?),
            query_key: Some(key.to_string()),
            ..Default::default()
        };
        scan_csv(file.path(), ReadOptions::default())?.collect_with(&ctx)?;
    }
    assert_eq!(store_entries(&store_dir), 2);
    Ok(())
}

#[test]
fn filtered_scans_bypass_the_store() -> Result<()> {
    use colstream::plan::CmpOp;
    use colstream::Value;

    let file = temp_csv("a\n1\n2\n");
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let ctx = ExecContext {
        store: Some(Store::open(StoreOptions::new(&store_dir))?),
        ..Default::default()
    };
    let out = scan_csv(file.path(), ReadOptions::default())?
        .filter("a", CmpOp::Gt, Value::Int32(1))
        .collect_with(&ctx)?;
    assert_eq!(out.data.num_rows(), 1);
    assert_eq!(store_entries(&store_dir), 0);
    Ok(())
}
