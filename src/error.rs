//! Errors of this crate, and the result envelope for memory-bounded queries.

/// Errors generated by this crate.
///
/// Memory denial is deliberately absent from this enum: running out of the
/// configured budget is an expected condition and is returned as a
/// [`MemoryError`] inside [`QueryOutput`], never as an `Err`.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Error {
    /// A column name was requested that the schema does not contain.
    ColumnNotFound(String),
    /// An operation was requested on a column whose dtype does not support it.
    TypeMismatch(String),
    /// A row or element index outside `[0, len)`.
    OutOfBounds(String),
    /// Invalid schema (e.g. duplicate column names).
    Schema(String),
    /// Malformed input at the ingestion boundary (header, datetime, strict numerics).
    Parse(String),
    /// Underlying IO error (file not found, truncated read).
    File(String),
    /// A materialization file is known to be out of spec (bad magic or version).
    OutOfSpec(String),
    /// The query was cancelled between chunks.
    Cancelled,
    /// A feature is required but was not enabled at compile time.
    FeatureNotActive(String),
}

impl Error {
    /// A next-step remediation for the error, suitable for end users.
    pub fn hint(&self) -> &'static str {
        match self {
            Error::ColumnNotFound(_) => {
                "check the schema for the exact column name; names are case-sensitive"
            }
            Error::TypeMismatch(_) => {
                "aggregate and compare only on columns of a compatible dtype; cast or re-read with an explicit schema"
            }
            Error::OutOfBounds(_) => "indices must be within [0, row_count)",
            Error::Schema(_) => {
                "column names must be unique and dtypes must be one of the supported set"
            }
            Error::Parse(_) => {
                "verify the delimiter, header and datetime format options against the file"
            }
            Error::File(_) => "verify the path exists and is readable",
            Error::OutOfSpec(_) => {
                "delete the materialization directory; it will be rebuilt on the next scan"
            }
            Error::Cancelled => "the query was cancelled; re-run it to completion",
            Error::FeatureNotActive(_) => "recompile with the required cargo feature enabled",
        }
    }
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::ColumnNotFound(name) => write!(fmt, "column not found: {}", name),
            Error::TypeMismatch(message) => write!(fmt, "type mismatch: {}", message),
            Error::OutOfBounds(message) => write!(fmt, "index out of bounds: {}", message),
            Error::Schema(message) => write!(fmt, "invalid schema: {}", message),
            Error::Parse(message) => write!(fmt, "parse error: {}", message),
            Error::File(message) => write!(fmt, "file error: {}", message),
            Error::OutOfSpec(message) => write!(fmt, "out of spec: {}", message),
            Error::Cancelled => write!(fmt, "query cancelled"),
            Error::FeatureNotActive(feature) => {
                write!(fmt, "the feature \"{}\" is not active", feature)
            }
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::File(format!("underlying IO error: {}", e))
    }
}

#[cfg(feature = "snappy")]
impl From<snap::Error> for Error {
    fn from(e: snap::Error) -> Error {
        Error::OutOfSpec(format!("underlying snap error: {}", e))
    }
}

/// A specialized `Result` for this crate's errors.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable machine-readable code carried by every [`MemoryError`].
pub const MEMORY_LIMIT_EXCEEDED: &str = "MEMORY_LIMIT_EXCEEDED";

/// A denied memory allocation, returned as a value.
///
/// Produced by the memory tracker when a task's request does not fit in the
/// global budget. It is carried inside [`QueryOutput`] rather than raised.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MemoryError {
    /// Always [`MEMORY_LIMIT_EXCEEDED`].
    pub code: &'static str,
    /// Bytes the task asked for.
    pub requested_bytes: usize,
    /// Bytes that were still unreserved at the time of the request.
    pub available_bytes: usize,
    /// The process-wide budget.
    pub global_limit_bytes: usize,
    /// Number of tasks holding reservations when the request was denied.
    pub active_task_count: usize,
}

impl MemoryError {
    /// A next-step remediation for the denial.
    pub fn hint(&self) -> &'static str {
        "use the streaming scan for large files; or raise the global memory limit"
    }
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            fmt,
            "{}: requested {} bytes but only {} of {} are available across {} active tasks",
            self.code,
            self.requested_bytes,
            self.available_bytes,
            self.global_limit_bytes,
            self.active_task_count
        )
    }
}

/// The result envelope of a fallible, memory-bounded query.
///
/// `data` is always present; on memory denial it is an empty frame with the
/// query's output schema and `memory_error` explains the denial.
#[derive(Debug, Clone)]
pub struct QueryOutput {
    pub data: crate::frame::DataFrame,
    pub memory_error: Option<MemoryError>,
}

impl QueryOutput {
    /// An output that completed within budget.
    pub fn complete(data: crate::frame::DataFrame) -> Self {
        Self {
            data,
            memory_error: None,
        }
    }

    /// An empty output accompanied by a memory diagnostic.
    pub fn denied(data: crate::frame::DataFrame, error: MemoryError) -> Self {
        Self {
            data,
            memory_error: Some(error),
        }
    }
}
