//! Compression of materialization-store block payloads.

use crate::error::{Error, Result};

/// Supported codecs for stored block payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Uncompressed,
    Snappy,
}

impl Compression {
    pub(crate) fn to_tag(self) -> u8 {
        match self {
            Compression::Uncompressed => 0,
            Compression::Snappy => 1,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Compression::Uncompressed),
            1 => Ok(Compression::Snappy),
            other => Err(Error::OutOfSpec(format!(
                "unknown compression tag {}",
                other
            ))),
        }
    }
}

/// Block compression codec interface.
pub trait Codec: std::fmt::Debug {
    /// Compresses `input_buf`, appending the result to `output_buf`.
    fn compress(&mut self, input_buf: &[u8], output_buf: &mut Vec<u8>) -> Result<()>;

    /// Decompresses `input_buf` into `output_buf`, which must already have
    /// the uncompressed length.
    fn decompress(&mut self, input_buf: &[u8], output_buf: &mut [u8]) -> Result<()>;
}

/// Returns the codec for `compression`, or `None` for `Uncompressed`.
pub fn create_codec(compression: &Compression) -> Result<Option<Box<dyn Codec>>> {
    match compression {
        #[cfg(feature = "snappy")]
        Compression::Snappy => Ok(Some(Box::new(SnappyCodec::new()))),
        #[cfg(not(feature = "snappy"))]
        Compression::Snappy => Err(Error::FeatureNotActive("snappy".to_string())),
        Compression::Uncompressed => Ok(None),
    }
}

#[cfg(feature = "snappy")]
mod snappy_codec {
    use snap::raw::{decompress_len, max_compress_len, Decoder, Encoder};

    use crate::compression::Codec;
    use crate::error::Result;

    /// Codec for the Snappy raw format.
    #[derive(Debug)]
    pub struct SnappyCodec {
        decoder: Decoder,
        encoder: Encoder,
    }

    impl SnappyCodec {
        pub(crate) fn new() -> Self {
            Self {
                decoder: Decoder::new(),
                encoder: Encoder::new(),
            }
        }
    }

    impl Codec for SnappyCodec {
        fn decompress(&mut self, input_buf: &[u8], output_buf: &mut [u8]) -> Result<()> {
            let len = decompress_len(input_buf)?;
            assert!(len <= output_buf.len());
            self.decoder
                .decompress(input_buf, output_buf)
                .map_err(|e| e.into())
                .map(|_| ())
        }

        fn compress(&mut self, input_buf: &[u8], output_buf: &mut Vec<u8>) -> Result<()> {
            let output_buf_len = output_buf.len();
            let required_len = max_compress_len(input_buf.len());
            output_buf.resize(output_buf_len + required_len, 0);
            let n = self
                .encoder
                .compress(input_buf, &mut output_buf[output_buf_len..])?;
            output_buf.truncate(output_buf_len + n);
            Ok(())
        }
    }
}
#[cfg(feature = "snappy")]
pub use snappy_codec::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "snappy")]
    #[test]
    fn snappy_roundtrip() {
        let data: Vec<u8> = (0..10_000).map(|x| (x % 251) as u8).collect();
        let mut codec = create_codec(&Compression::Snappy).unwrap().unwrap();

        let mut compressed = Vec::new();
        codec.compress(&data, &mut compressed).unwrap();
        assert!(compressed.len() < data.len());

        let mut decompressed = vec![0; data.len()];
        codec.decompress(&compressed, &mut decompressed).unwrap();
        assert_eq!(data, decompressed);
    }

    #[test]
    fn uncompressed_has_no_codec() {
        assert!(create_codec(&Compression::Uncompressed).unwrap().is_none());
    }

    #[test]
    fn tag_roundtrip() {
        for compression in [Compression::Uncompressed, Compression::Snappy] {
            assert_eq!(
                Compression::from_tag(compression.to_tag()).unwrap(),
                compression
            );
        }
        assert!(Compression::from_tag(9).is_err());
    }
}
