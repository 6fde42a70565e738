//! Async variants of the scan's I/O suspension points: row-index
//! construction and chunk streaming over `AsyncRead + AsyncSeek`.

use std::io::SeekFrom;
use std::sync::Arc;

use async_stream::try_stream;
use futures::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, Stream};

use crate::chunk::Chunk;
use crate::error::Result;
use crate::indexes::{RowIndex, RowIndexBuilder};
use crate::read::parser::{parse_chunk_bytes, ParseOptions};
use crate::schema::Schema;

const SCAN_WINDOW: usize = 32 * 1024 * 1024;

/// Builds the row index by scanning `reader` once, asynchronously.
pub async fn read_row_index<R: AsyncRead + Send + std::marker::Unpin>(
    reader: &mut R,
    has_header: bool,
) -> Result<RowIndex> {
    let mut builder = RowIndexBuilder::new();
    let mut window = vec![0u8; SCAN_WINDOW];
    loop {
        let read = reader.read(&mut window).await?;
        if read == 0 {
            break;
        }
        builder.feed(&window[..read]);
    }
    Ok(builder.finish(has_header))
}

/// Streams parsed chunks out of an async reader.
///
/// Only the byte reads suspend; parsing stays synchronous, matching the
/// engine's cooperative model.
pub fn get_chunk_stream<R: AsyncRead + AsyncSeek + Send + std::marker::Unpin>(
    mut reader: R,
    index: Arc<RowIndex>,
    schema: Schema,
    options: ParseOptions,
    chunk_size: usize,
) -> impl Stream<Item = Result<Chunk>> {
    try_stream! {
        let chunk_size = chunk_size.max(1);
        let chunk_count = index.row_count().div_ceil(chunk_size);
        for chunk in 0..chunk_count {
            let start_row = chunk * chunk_size;
            let end_row = ((chunk + 1) * chunk_size).min(index.row_count());
            let (byte_start, byte_end) = index.rows_range(start_row, end_row)?;

            let mut bytes = vec![0u8; (byte_end - byte_start) as usize];
            reader.seek(SeekFrom::Start(byte_start)).await?;
            reader.read_exact(&mut bytes).await?;

            let parsed = parse_chunk_bytes(
                bytes,
                start_row,
                end_row - start_row,
                &schema,
                None,
                &[],
                &options,
            )?;
            yield parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Vector;
    use crate::types::DType;
    use futures::{io::Cursor, StreamExt};

    #[tokio::test]
    async fn index_and_chunks() -> Result<()> {
        let content = b"a,b\n1,2\n3,4\n5,6\n";
        let index = read_row_index(&mut Cursor::new(content.to_vec()), true).await?;
        assert_eq!(index.row_count(), 3);

        let schema = Schema::new(vec![
            ("a".to_string(), DType::Int32),
            ("b".to_string(), DType::Int32),
        ])?;
        let stream = get_chunk_stream(
            Cursor::new(content.to_vec()),
            Arc::new(index),
            schema,
            ParseOptions::default(),
            2,
        );
        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks.len(), 2);
        let mut seen = vec![];
        for chunk in chunks {
            let chunk = chunk?;
            match chunk.column(0)? {
                Vector::Int32(values) => seen.extend_from_slice(values),
                _ => panic!("expected i32"),
            }
        }
        assert_eq!(seen, vec![1, 3, 5]);
        Ok(())
    }
}
