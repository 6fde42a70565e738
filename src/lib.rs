#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! An embeddable, out-of-core columnar query engine over delimited files.
//!
//! Files larger than memory are scanned through a row-offset index, parsed
//! chunk by chunk into columnar form, cached under an LRU byte budget, and
//! queried through an optimizing plan executor with predicate and
//! projection pushdown, streaming group-by, external merge sort, and
//! sort-merge joins. Memory denial is a value in the result envelope, not
//! an error.

pub mod chunk;
pub mod compression;
pub mod datetime;
pub mod dictionary;
pub mod error;
pub mod exec;
pub mod frame;
pub mod indexes;
pub mod memory;
pub mod plan;
pub mod read;
pub mod schema;
pub mod store;
pub mod types;

pub use fallible_streaming_iterator;
pub use fallible_streaming_iterator::FallibleStreamingIterator;

pub use error::{Error, MemoryError, QueryOutput, Result};
pub use frame::{scan_csv, DataFrame, LazyFrame, Value};
pub use read::{read_csv, ReadOptions};
pub use schema::Schema;
pub use types::DType;

pub(crate) const STORE_MAGIC: [u8; 4] = [b'C', b'S', b'T', b'1'];
pub(crate) const STORE_VERSION: u32 = 1;

/// Rows per parsed chunk unless configured otherwise.
pub const DEFAULT_CHUNK_SIZE: usize = 65_536;

/// Default byte budget of a scan's chunk cache.
pub const DEFAULT_CACHE_BYTES: usize = 256 * 1024 * 1024;
