//! Error types for the Atlas resolver

use crate::types::{Address, MetadataVersion};
use thiserror::Error;

/// Main error type shared by every crate in the workspace
///
/// Structural and semantic variants are fatal to a session. The two
/// address variants are also collected as non-fatal issues by the
/// address resolver.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported image format (magic {magic:#010x})")]
    UnsupportedFormat { magic: u32 },

    #[error("Truncated image: {structure} at offset {offset:#x} needs {needed} bytes, image has {len}")]
    TruncatedImage {
        structure: &'static str,
        offset: u64,
        needed: u64,
        len: u64,
    },

    #[error("Malformed segment layout: {0}")]
    MalformedLayout(String),

    #[error("Invalid metadata signature: expected {expected:#x}, got {actual:#x}")]
    InvalidSignature { expected: u32, actual: u32 },

    #[error("Unsupported metadata version: {0}")]
    UnsupportedMetadataVersion(MetadataVersion),

    #[error("Truncated metadata: table {table} at {offset:#x} (+{size}) exceeds blob length {len}")]
    TruncatedMetadata {
        table: &'static str,
        offset: u64,
        size: u64,
        len: u64,
    },

    #[error("Malformed table {table}, record {record} at {offset:#x}: {reason}")]
    MalformedTable {
        table: &'static str,
        record: usize,
        offset: u64,
        reason: String,
    },

    #[error("Dangling reference in {table}[{record}].{field}: {target}")]
    DanglingTypeReference {
        table: &'static str,
        record: usize,
        field: &'static str,
        target: i64,
    },

    #[error("Cyclic nesting in {table}[{record}] via {chain:?}")]
    CyclicTypeNesting {
        table: &'static str,
        record: usize,
        chain: Vec<usize>,
    },

    #[error("Address {address} for {what} is outside every executable segment")]
    AddressOutOfBounds { address: Address, what: String },

    #[error("Ambiguous address resolution for module {module}: {methods} methods, {slots} slots")]
    AddressResolutionAmbiguous {
        module: String,
        methods: usize,
        slots: usize,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn malformed_layout(msg: impl Into<String>) -> Self {
        Self::MalformedLayout(msg.into())
    }

    pub fn malformed_table(
        table: &'static str,
        record: usize,
        offset: u64,
        reason: impl Into<String>,
    ) -> Self {
        Self::MalformedTable {
            table,
            record,
            offset,
            reason: reason.into(),
        }
    }

    pub fn dangling(table: &'static str, record: usize, field: &'static str, target: i64) -> Self {
        Self::DanglingTypeReference {
            table,
            record,
            field,
            target,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True for the kinds the resolver degrades on instead of aborting
    pub fn is_address_issue(&self) -> bool {
        matches!(
            self,
            Self::AddressOutOfBounds { .. } | Self::AddressResolutionAmbiguous { .. }
        )
    }
}
