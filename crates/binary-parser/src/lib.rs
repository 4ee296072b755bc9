//! Executable image parsing for IL2CPP analysis
//!
//! Supports PE (Windows), ELF (Linux/Android), and Mach-O (macOS/iOS) formats,
//! and exposes a unified segment view with address translation.

pub mod buffer;
pub mod common;
pub mod elf;
pub mod error;
pub mod image;
pub mod macho;
pub mod pe;
pub mod translator;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use buffer::ByteBuffer;
pub use common::{BinaryFile, BinaryReader, Permissions, Segment, Symbol, SymbolType};
pub use error::{ParseError, ParseResult};
pub use image::BinaryImage;
pub use translator::AddressTranslator;

use atlas_core::BinaryFormat;
use std::path::Path;

/// Detect binary format from magic bytes
pub fn detect_format(data: &[u8]) -> Option<BinaryFormat> {
    if data.len() < 4 {
        return None;
    }

    // PE: MZ header
    if &data[0..2] == b"MZ" {
        return Some(BinaryFormat::PE);
    }

    // ELF: 0x7F ELF
    if &data[0..4] == b"\x7FELF" {
        return Some(BinaryFormat::ELF);
    }

    // Mach-O thin images in either byte order
    let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if matches!(magic, 0xFEEDFACE | 0xFEEDFACF | 0xCEFAEDFE | 0xCFFAEDFE) {
        return Some(BinaryFormat::MachO);
    }

    // Universal headers are always big-endian
    if u32::from_be_bytes([data[0], data[1], data[2], data[3]]) == macho::FAT_MAGIC {
        return Some(BinaryFormat::MachO);
    }

    None
}

/// Load and parse an image from disk
pub fn load_image(path: &Path) -> ParseResult<BinaryImage> {
    BinaryImage::load(path)
}
