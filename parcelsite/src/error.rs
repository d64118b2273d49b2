use thiserror::Error;

/// Domain errors raised by the parcel processing steps.
/// I/O and parsing failures are reported through `anyhow` with context instead.
#[derive(Debug, Error)]
pub enum Error {
    /// Attribute expression could not be parsed
    #[error("invalid expression at offset {offset}: {message}")]
    Expr { offset: usize, message: String },

    /// A key expected to be unique on the right side of a join appears twice
    #[error("join key '{key}' is duplicated in column '{column}' (many-to-one join expected)")]
    DuplicateKey { column: String, key: String },

    /// Requested column is absent from a table or layer
    #[error("column '{0}' not found")]
    MissingColumn(String),

    /// No transformation is available between the two EPSG codes
    #[error("unsupported CRS transformation EPSG:{from} -> EPSG:{to} (enable the `proj` feature)")]
    UnsupportedCrs { from: i32, to: i32 },

    /// Input file format cannot be read
    #[error("unsupported vector format: {0}")]
    UnsupportedFormat(String),

    /// Layer must be in geographic coordinates (EPSG:4326)
    #[error("layer must be in EPSG:4326, found EPSG:{0}")]
    NotGeographic(i32),
}

pub type Result<T> = std::result::Result<T, Error>;
