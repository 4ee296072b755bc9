//! Error types for image parsing

use atlas_core::Address;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported image format (magic {0:#010x})")]
    UnsupportedFormat(u32),

    #[error("Truncated image: {structure} at offset {offset:#x} needs {needed} bytes, image has {len}")]
    TruncatedImage {
        structure: &'static str,
        offset: u64,
        needed: u64,
        len: u64,
    },

    #[error("Malformed layout: {0}")]
    MalformedLayout(String),

    #[error("Address not mapped: {0}")]
    Unmapped(Address),
}

pub type ParseResult<T> = std::result::Result<T, ParseError>;

impl ParseError {
    pub fn truncated(structure: &'static str, offset: u64, needed: u64, len: usize) -> Self {
        Self::TruncatedImage {
            structure,
            offset,
            needed,
            len: len as u64,
        }
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedLayout(msg.into())
    }
}

impl From<ParseError> for atlas_core::Error {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::Io(e) => Self::Io(e),
            ParseError::UnsupportedFormat(magic) => Self::UnsupportedFormat { magic },
            ParseError::TruncatedImage {
                structure,
                offset,
                needed,
                len,
            } => Self::TruncatedImage {
                structure,
                offset,
                needed,
                len,
            },
            ParseError::MalformedLayout(msg) => Self::MalformedLayout(msg),
            ParseError::Unmapped(address) => Self::AddressOutOfBounds {
                address,
                what: "image read".to_string(),
            },
        }
    }
}
