use std::sync::Arc;

use colstream::exec::ExecContext;
use colstream::frame::scan_csv;
use colstream::memory::MemoryTracker;
use colstream::{ReadOptions, Result};

use crate::temp_csv;

#[test]
fn scan_denial_returns_the_envelope() -> Result<()> {
    let file = temp_csv("a,b\n1,2\n3,4\n");
    let ctx = ExecContext {
        tracker: Arc::new(MemoryTracker::new(4)),
        ..Default::default()
    };
    let out = scan_csv(file.path(), ReadOptions::default())?.collect_with(&ctx)?;
    assert!(out.data.is_empty());
    let error = out.memory_error.expect("denied");
    assert_eq!(error.global_limit_bytes, 4);
    // the denial carries the query's output schema
    assert_eq!(out.data.schema().names().collect::<Vec<_>>(), vec!["a", "b"]);
    Ok(())
}

#[test]
fn queries_share_one_tracker() -> Result<()> {
    let file = temp_csv("a\n1\n2\n3\n");
    let tracker = Arc::new(MemoryTracker::new(1 << 20));
    let ctx = ExecContext {
        tracker: tracker.clone(),
        ..Default::default()
    };
    let out = scan_csv(file.path(), ReadOptions::default())?.collect_with(&ctx)?;
    assert!(out.memory_error.is_none());
    // the scan released its reservation on completion
    assert_eq!(tracker.allocated_bytes(), 0);
    assert_eq!(tracker.active_task_count(), 0);
    Ok(())
}

#[test]
fn per_scan_limit_overrides_the_context() -> Result<()> {
    let file = temp_csv("a\n1\n2\n3\n");
    let options = ReadOptions {
        memory_limit_bytes: Some(2),
        ..Default::default()
    };
    let out = scan_csv(file.path(), options)?.collect()?;
    assert!(out.memory_error.is_some());
    Ok(())
}
