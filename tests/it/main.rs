mod memory;
mod query;
mod read;
mod store;

use std::io::Write;

/// Writes `content` to a temp file kept alive by the returned handle.
pub fn temp_csv(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

/// Collects one i32 column into a vector.
pub fn i32_column(frame: &colstream::DataFrame, name: &str) -> Vec<i32> {
    let at = frame.schema().index_of(name).unwrap();
    (0..frame.num_rows())
        .map(|row| match frame.value(row, at).unwrap() {
            colstream::Value::Int32(v) => v,
            other => panic!("expected i32, got {:?}", other),
        })
        .collect()
}
