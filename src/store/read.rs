//! Reading store entries. The magic must match exactly; anything else is
//! an out-of-spec file.

use std::io::Read;
use std::sync::Arc;

use crate::chunk::Bitmap;
use crate::compression::{create_codec, Compression};
use crate::dictionary::Dictionary;
use crate::error::{Error, Result};
use crate::frame::{Column, DataFrame};
use crate::schema::Schema;
use crate::types::DType;
use crate::{STORE_MAGIC, STORE_VERSION};

#[derive(Debug)]
pub(crate) struct StoreHeader {
    pub block_count: u32,
    pub total_rows: u64,
    pub source_mtime: u64,
    pub compression: Compression,
    pub source_path: String,
    pub schema: Schema,
}

pub(crate) fn read_header<R: Read>(reader: &mut R) -> Result<StoreHeader> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != STORE_MAGIC {
        return Err(Error::OutOfSpec(format!(
            "bad magic {:?} in materialization file",
            magic
        )));
    }
    let version = read_u32(reader)?;
    if version != STORE_VERSION {
        return Err(Error::OutOfSpec(format!(
            "unsupported materialization version {}",
            version
        )));
    }
    let block_count = read_u32(reader)?;
    let total_rows = read_u64(reader)?;
    let source_mtime = read_u64(reader)?;
    let compression = Compression::from_tag(read_u8(reader)?)?;
    let source_path = read_str16(reader)?;
    let num_columns = read_u32(reader)? as usize;
    let mut fields = Vec::with_capacity(num_columns);
    for _ in 0..num_columns {
        let name = read_str16(reader)?;
        let dtype = DType::from_tag(read_u8(reader)?)?;
        fields.push((name, dtype));
    }
    Ok(StoreHeader {
        block_count,
        total_rows,
        source_mtime,
        compression,
        source_path,
        schema: Schema::new(fields)?,
    })
}

pub(crate) fn read_block<R: Read>(reader: &mut R, header: &StoreHeader) -> Result<DataFrame> {
    let _block_id = read_u32(reader)?;
    let rows = read_u32(reader)? as usize;

    let mut codec = create_codec(&header.compression)?;
    let mut dict = Dictionary::new();
    let mut columns = Vec::with_capacity(header.schema.len());
    let mut validity = Vec::with_capacity(header.schema.len());
    for (name, dtype) in header.schema.fields() {
        let stored = DType::from_tag(read_u8(reader)?)?;
        if stored != *dtype {
            return Err(Error::OutOfSpec(format!(
                "column \"{}\" stored as {} but the schema says {}",
                name, stored, dtype
            )));
        }
        let has_nulls = read_u8(reader)? != 0;
        let uncompressed_len = read_u64(reader)? as usize;
        let payload_len = read_u64(reader)? as usize;
        let mut payload = vec![0u8; payload_len];
        reader.read_exact(&mut payload)?;
        let payload = match codec.as_mut() {
            Some(codec) => {
                let mut out = vec![0u8; uncompressed_len];
                codec.decompress(&payload, &mut out)?;
                out
            }
            None => payload,
        };
        columns.push(decode_column(*dtype, &payload, rows, &mut dict)?);
        validity.push(if has_nulls {
            let bitmap_len = read_u32(reader)? as usize;
            let mut bytes = vec![0u8; bitmap_len];
            reader.read_exact(&mut bytes)?;
            Some(Bitmap::from_bytes(bytes, rows)?)
        } else {
            None
        });
    }
    DataFrame::from_parts(header.schema.clone(), columns, validity, Arc::new(dict))
}

/// Reads the header and every block, concatenated.
pub(crate) fn read_frame<R: Read>(reader: &mut R) -> Result<(StoreHeader, DataFrame)> {
    let header = read_header(reader)?;
    let mut blocks = Vec::with_capacity(header.block_count as usize);
    for _ in 0..header.block_count {
        blocks.push(read_block(reader, &header)?);
    }
    let frame = if blocks.is_empty() {
        DataFrame::empty(header.schema.clone())
    } else {
        DataFrame::concat(&blocks)?
    };
    if frame.num_rows() as u64 != header.total_rows {
        return Err(Error::OutOfSpec(format!(
            "materialization file declares {} rows but holds {}",
            header.total_rows,
            frame.num_rows()
        )));
    }
    Ok((header, frame))
}

fn decode_column(
    dtype: DType,
    payload: &[u8],
    rows: usize,
    dict: &mut Dictionary,
) -> Result<Column> {
    let fixed = |width: usize| -> Result<()> {
        if payload.len() != rows * width {
            return Err(Error::OutOfSpec(format!(
                "column payload of {} bytes, expected {}",
                payload.len(),
                rows * width
            )));
        }
        Ok(())
    };
    Ok(match dtype {
        DType::Int32 => {
            fixed(4)?;
            Column::Int32(
                payload
                    .chunks_exact(4)
                    .map(|b| i32::from_le_bytes(b.try_into().unwrap()))
                    .collect(),
            )
        }
        DType::Float64 => {
            fixed(8)?;
            Column::Float64(
                payload
                    .chunks_exact(8)
                    .map(|b| f64::from_le_bytes(b.try_into().unwrap()))
                    .collect(),
            )
        }
        DType::Bool => {
            fixed(1)?;
            Column::Bool(payload.iter().map(|b| *b != 0).collect())
        }
        DType::Date | DType::DateTime => {
            fixed(8)?;
            let values = payload
                .chunks_exact(8)
                .map(|b| i64::from_le_bytes(b.try_into().unwrap()))
                .collect();
            if dtype == DType::Date {
                Column::Date(values)
            } else {
                Column::DateTime(values)
            }
        }
        DType::Utf8 => {
            if payload.len() < rows * 4 {
                return Err(Error::OutOfSpec(
                    "string column payload too short for its length array".to_string(),
                ));
            }
            let (lengths, mut bytes) = payload.split_at(rows * 4);
            let mut ids = Vec::with_capacity(rows);
            for length in lengths.chunks_exact(4) {
                let length = u32::from_le_bytes(length.try_into().unwrap()) as usize;
                if bytes.len() < length {
                    return Err(Error::OutOfSpec(
                        "string column payload truncated".to_string(),
                    ));
                }
                let (value, rest) = bytes.split_at(length);
                bytes = rest;
                let value = std::str::from_utf8(value).map_err(|e| {
                    Error::OutOfSpec(format!("invalid UTF-8 in string column: {}", e))
                })?;
                ids.push(dict.intern(value));
            }
            Column::Utf8(ids)
        }
    })
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_str16<R: Read>(reader: &mut R) -> Result<String> {
    let mut len = [0u8; 2];
    reader.read_exact(&mut len)?;
    let mut bytes = vec![0u8; u16::from_le_bytes(len) as usize];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|e| Error::OutOfSpec(format!("invalid UTF-8 in store header: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn bad_magic_is_out_of_spec() {
        let mut reader = Cursor::new(b"NOPE00000000".to_vec());
        assert!(matches!(
            read_header(&mut reader),
            Err(Error::OutOfSpec(_))
        ));
    }

    #[test]
    fn truncated_header_is_an_error() {
        let mut reader = Cursor::new(STORE_MAGIC.to_vec());
        assert!(read_header(&mut reader).is_err());
    }
}
