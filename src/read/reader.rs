//! Pull-based chunk iteration over an indexed file, through the LRU cache.

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use fallible_streaming_iterator::FallibleStreamingIterator;

use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::exec::CancelToken;
use crate::indexes::RowIndex;
use crate::read::cache::{CacheOptions, ChunkCache};
use crate::read::parser::{parse_chunk_bytes, ParseOptions, ScanPredicate};
use crate::schema::Schema;

/// A [`FallibleStreamingIterator`] of parsed chunks.
///
/// Each `advance` resolves the next chunk index against the cache; on a miss
/// it reads the chunk's byte range (the only suspension point of a scan) and
/// parses it with the configured projection and pushdown predicates.
pub struct ChunkReader<R: Read + Seek> {
    reader: R,
    index: Arc<RowIndex>,
    schema: Schema,
    parse: ParseOptions,
    chunk_size: usize,
    projection: Option<Vec<usize>>,
    predicates: Vec<ScanPredicate>,
    cache: ChunkCache,
    cancel: CancelToken,
    chunk_count: usize,
    next_chunk: usize,
    current: Option<usize>,
}

impl<R: Read + Seek> ChunkReader<R> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reader: R,
        index: Arc<RowIndex>,
        schema: Schema,
        parse: ParseOptions,
        cache_options: &CacheOptions,
        cache: ChunkCache,
        projection: Option<Vec<usize>>,
        predicates: Vec<ScanPredicate>,
        cancel: CancelToken,
    ) -> Self {
        let chunk_size = cache_options.chunk_size.max(1);
        let chunk_count = index.row_count().div_ceil(chunk_size);
        Self {
            reader,
            index,
            schema,
            parse,
            chunk_size,
            projection,
            predicates,
            cache,
            cancel,
            chunk_count,
            next_chunk: 0,
            current: None,
        }
    }

    /// Number of chunks this reader will yield.
    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// The schema of produced chunks: the file schema narrowed by the
    /// projection, in projection order.
    pub fn parsed_schema(&self) -> Result<Schema> {
        match &self.projection {
            None => Ok(self.schema.clone()),
            Some(indices) => {
                let fields = indices
                    .iter()
                    .map(|i| self.schema.fields()[*i].clone())
                    .collect();
                Schema::new(fields)
            }
        }
    }

    /// Drops cached chunks between pipeline stages on request.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Tears the reader down, releasing the cache's reservation.
    pub fn destroy(self) {
        self.cache.destroy();
    }

    fn load_chunk(&mut self, chunk: usize) -> Result<()> {
        if self.cache.get(chunk).is_some() {
            return Ok(());
        }
        let start_row = chunk * self.chunk_size;
        let end_row = ((chunk + 1) * self.chunk_size).min(self.index.row_count());
        let (byte_start, byte_end) = self.index.rows_range(start_row, end_row)?;

        let mut bytes = vec![0u8; (byte_end - byte_start) as usize];
        self.reader.seek(SeekFrom::Start(byte_start))?;
        self.reader.read_exact(&mut bytes)?;

        let parsed = parse_chunk_bytes(
            bytes,
            start_row,
            end_row - start_row,
            &self.schema,
            self.projection.as_deref(),
            &self.predicates,
            &self.parse,
        )?;
        self.cache.set(chunk, parsed);
        Ok(())
    }
}

impl<R: Read + Seek> FallibleStreamingIterator for ChunkReader<R> {
    type Item = Chunk;
    type Error = Error;

    fn advance(&mut self) -> Result<()> {
        self.current = None;
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.next_chunk >= self.chunk_count {
            return Ok(());
        }
        let chunk = self.next_chunk;
        self.next_chunk += 1;
        self.load_chunk(chunk)?;
        self.current = Some(chunk);
        Ok(())
    }

    fn get(&self) -> Option<&Chunk> {
        self.current.and_then(|chunk| self.cache.peek(chunk))
    }
}
