//! Writing store entries.
//!
//! Use `start` to write the header, `write` per block, and `end` to patch
//! the block count and row total back into the header.

use std::io::{Seek, SeekFrom, Write};

use crate::compression::{create_codec, Compression};
use crate::error::{Error, Result};
use crate::frame::{Column, DataFrame};
use crate::schema::Schema;
use crate::{STORE_MAGIC, STORE_VERSION};

/// Block layout, after the file header:
///
/// ```text
/// block_id   u32
/// row_count  u32
/// per column, in schema order:
///   dtype            u8
///   has_nulls        u8
///   uncompressed_len u64
///   payload_len      u64
///   payload          (fixed-width values LE; strings as u32 lengths then bytes)
///   bitmap_len u32 + bitmap     only when has_nulls
/// ```
pub(crate) struct BlockWriter<W: Write + Seek> {
    writer: W,
    schema: Schema,
    compression: Compression,
    source_path: String,
    source_mtime: u64,
    blocks: u32,
    rows: u64,
    started: bool,
}

impl<W: Write + Seek> BlockWriter<W> {
    pub fn new(
        writer: W,
        schema: Schema,
        compression: Compression,
        source_path: String,
        source_mtime: u64,
    ) -> Self {
        Self {
            writer,
            schema,
            compression,
            source_path,
            source_mtime,
            blocks: 0,
            rows: 0,
            started: false,
        }
    }

    /// Writes the header, with zeroed counts to be patched by [`end`].
    ///
    /// [`end`]: BlockWriter::end
    pub fn start(&mut self) -> Result<()> {
        self.writer.write_all(&STORE_MAGIC)?;
        self.writer.write_all(&STORE_VERSION.to_le_bytes())?;
        self.writer.write_all(&0u32.to_le_bytes())?; // block_count
        self.writer.write_all(&0u64.to_le_bytes())?; // total_rows
        self.writer.write_all(&self.source_mtime.to_le_bytes())?;
        self.writer.write_all(&[self.compression.to_tag()])?;
        write_str16(&mut self.writer, &self.source_path)?;
        self.writer
            .write_all(&(self.schema.len() as u32).to_le_bytes())?;
        for (name, dtype) in self.schema.fields() {
            write_str16(&mut self.writer, name)?;
            self.writer.write_all(&[dtype.to_tag()])?;
        }
        self.started = true;
        Ok(())
    }

    /// Writes one block.
    pub fn write(&mut self, block: &DataFrame) -> Result<()> {
        if !self.started {
            return Err(Error::File(
                "start must be called before writing blocks".to_string(),
            ));
        }
        if block.schema() != &self.schema {
            return Err(Error::Schema(
                "block schema differs from the store entry's".to_string(),
            ));
        }
        self.writer.write_all(&self.blocks.to_le_bytes())?;
        self.writer
            .write_all(&(block.num_rows() as u32).to_le_bytes())?;

        let mut codec = create_codec(&self.compression)?;
        let mut scratch = vec![];
        let mut compressed = vec![];
        for i in 0..block.num_columns() {
            let column = block.column_at(i)?;
            scratch.clear();
            encode_column(column, block, &mut scratch)?;

            self.writer.write_all(&[column.dtype().to_tag()])?;
            let bitmap = block.validity_at(i);
            self.writer.write_all(&[bitmap.is_some() as u8])?;
            self.writer
                .write_all(&(scratch.len() as u64).to_le_bytes())?;
            let payload: &[u8] = match codec.as_mut() {
                Some(codec) => {
                    compressed.clear();
                    codec.compress(&scratch, &mut compressed)?;
                    &compressed
                }
                None => &scratch,
            };
            self.writer
                .write_all(&(payload.len() as u64).to_le_bytes())?;
            self.writer.write_all(payload)?;
            if let Some(bitmap) = bitmap {
                self.writer
                    .write_all(&(bitmap.as_bytes().len() as u32).to_le_bytes())?;
                self.writer.write_all(bitmap.as_bytes())?;
            }
        }
        self.blocks += 1;
        self.rows += block.num_rows() as u64;
        Ok(())
    }

    /// Patches the header counts and returns the writer.
    pub fn end(mut self) -> Result<(u64, W)> {
        // block_count sits right after magic + version
        self.writer.seek(SeekFrom::Start(8))?;
        self.writer.write_all(&self.blocks.to_le_bytes())?;
        self.writer.write_all(&self.rows.to_le_bytes())?;
        self.writer.flush()?;
        Ok((self.rows, self.writer))
    }
}

fn write_str16<W: Write>(writer: &mut W, value: &str) -> Result<()> {
    writer.write_all(&(value.len() as u16).to_le_bytes())?;
    writer.write_all(value.as_bytes())?;
    Ok(())
}

fn encode_column(column: &Column, block: &DataFrame, out: &mut Vec<u8>) -> Result<()> {
    match column {
        Column::Int32(values) => {
            for value in values {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
        Column::Float64(values) => {
            for value in values {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
        Column::Bool(values) => out.extend(values.iter().map(|v| *v as u8)),
        Column::Date(values) | Column::DateTime(values) => {
            for value in values {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
        Column::Utf8(ids) => {
            let dict = block.dictionary();
            for id in ids {
                out.extend_from_slice(&(dict.value(*id)?.len() as u32).to_le_bytes());
            }
            for id in ids {
                out.extend_from_slice(dict.value(*id)?.as_bytes());
            }
        }
    }
    Ok(())
}
