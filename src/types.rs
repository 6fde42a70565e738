use crate::error::{Error, Result};

/// A physical native representation of a fixed-width column element.
pub trait NativeType: Sized + Copy + std::fmt::Debug {
    type Bytes: AsRef<[u8]>;

    fn to_le_bytes(&self) -> Self::Bytes;

    fn from_le_bytes(bytes: Self::Bytes) -> Self;
}

macro_rules! native {
    ($type:ty) => {
        impl NativeType for $type {
            type Bytes = [u8; std::mem::size_of::<Self>()];
            #[inline]
            fn to_le_bytes(&self) -> Self::Bytes {
                Self::to_le_bytes(*self)
            }

            #[inline]
            fn from_le_bytes(bytes: Self::Bytes) -> Self {
                Self::from_le_bytes(bytes)
            }
        }
    };
}

native!(i32);
native!(i64);
native!(u32);
native!(f64);

/// The closed set of column dtypes understood by the engine.
///
/// `Date` is epoch-days and `DateTime` epoch-milliseconds, both in 64 bits.
/// `Utf8` column data holds 32-bit ids into a dictionary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde_types", derive(serde_derive::Deserialize, serde_derive::Serialize))]
pub enum DType {
    Int32,
    Float64,
    Bool,
    Utf8,
    Date,
    DateTime,
}

impl DType {
    /// The fixed byte width of one element of this dtype.
    pub fn byte_width(&self) -> usize {
        match self {
            DType::Int32 => 4,
            DType::Float64 => 8,
            DType::Bool => 1,
            DType::Utf8 => 4,
            DType::Date => 8,
            DType::DateTime => 8,
        }
    }

    /// Whether the dtype participates in arithmetic aggregates.
    pub fn is_numeric(&self) -> bool {
        matches!(self, DType::Int32 | DType::Float64)
    }

    /// Parses a dtype from its stored tag. See [`DType::to_tag`].
    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => DType::Int32,
            1 => DType::Float64,
            2 => DType::Bool,
            3 => DType::Utf8,
            4 => DType::Date,
            5 => DType::DateTime,
            other => {
                return Err(Error::OutOfSpec(format!(
                    "unknown dtype tag {} in materialization file",
                    other
                )))
            }
        })
    }

    /// The single-byte tag used in the materialization block format.
    pub fn to_tag(&self) -> u8 {
        match self {
            DType::Int32 => 0,
            DType::Float64 => 1,
            DType::Bool => 2,
            DType::Utf8 => 3,
            DType::Date => 4,
            DType::DateTime => 5,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            DType::Int32 => "i32",
            DType::Float64 => "f64",
            DType::Bool => "bool",
            DType::Utf8 => "str",
            DType::Date => "date",
            DType::DateTime => "datetime",
        };
        write!(fmt, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_roundtrip() -> Result<()> {
        for dtype in [
            DType::Int32,
            DType::Float64,
            DType::Bool,
            DType::Utf8,
            DType::Date,
            DType::DateTime,
        ] {
            assert_eq!(DType::from_tag(dtype.to_tag())?, dtype);
        }
        assert!(DType::from_tag(42).is_err());
        Ok(())
    }

    #[test]
    fn widths() {
        assert_eq!(DType::Int32.byte_width(), 4);
        assert_eq!(DType::Bool.byte_width(), 1);
        assert_eq!(DType::Utf8.byte_width(), 4);
        assert!(DType::Float64.is_numeric());
        assert!(!DType::Utf8.is_numeric());
    }
}
