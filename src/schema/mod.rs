use crate::error::{Error, Result};
use crate::types::DType;

/// An ordered mapping from column name to dtype.
///
/// Column order is part of the schema's identity: two schemas with the same
/// fields in a different order are different schemas.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde_types", derive(serde_derive::Deserialize, serde_derive::Serialize))]
pub struct Schema {
    fields: Vec<(String, DType)>,
}

impl Schema {
    /// Creates a new schema, rejecting duplicate column names.
    pub fn new(fields: Vec<(String, DType)>) -> Result<Self> {
        for (i, (name, _)) in fields.iter().enumerate() {
            if fields[..i].iter().any(|(other, _)| other == name) {
                return Err(Error::Schema(format!("duplicate column name \"{}\"", name)));
            }
        }
        Ok(Self { fields })
    }

    /// The empty schema.
    pub fn empty() -> Self {
        Self { fields: vec![] }
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Column names in schema order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    /// `(name, dtype)` pairs in schema order.
    pub fn fields(&self) -> &[(String, DType)] {
        &self.fields
    }

    /// The field at position `i`.
    pub fn field(&self, i: usize) -> Result<(&str, DType)> {
        self.fields
            .get(i)
            .map(|(name, dtype)| (name.as_str(), *dtype))
            .ok_or_else(|| {
                Error::OutOfBounds(format!("field {} of a schema with {} columns", i, self.len()))
            })
    }

    /// The position of `name` in the schema.
    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.fields
            .iter()
            .position(|(other, _)| other == name)
            .ok_or_else(|| Error::ColumnNotFound(name.to_string()))
    }

    /// The dtype of `name`.
    pub fn dtype_of(&self, name: &str) -> Result<DType> {
        self.index_of(name).map(|i| self.fields[i].1)
    }

    /// Whether `name` is a column of this schema.
    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(other, _)| other == name)
    }

    /// A new schema holding `columns` in the given order.
    pub fn project(&self, columns: &[String]) -> Result<Schema> {
        let fields = columns
            .iter()
            .map(|name| self.index_of(name).map(|i| self.fields[i].clone()))
            .collect::<Result<Vec<_>>>()?;
        Schema::new(fields)
    }
}
