//! Common traits and types for image parsing

use crate::{ParseError, ParseResult};
use atlas_core::{Address, Architecture, BinaryFormat};
use scroll::ctx::TryFromCtx;
use scroll::{Endian, Pread};

/// Trait for a parsed executable container
pub trait BinaryFile: Send + Sync {
    /// Get the container format
    fn format(&self) -> BinaryFormat;

    /// Get the architecture
    fn architecture(&self) -> Architecture;

    /// Check if pointers are 64-bit
    fn is_64bit(&self) -> bool {
        self.architecture().is_64bit()
    }

    /// Byte order of multi-byte fields in the image
    fn little_endian(&self) -> bool;

    /// Get the preferred load address
    fn image_base(&self) -> Address;

    /// Get the entry point address
    fn entry_point(&self) -> Address;

    /// Loadable segments in declaration order
    fn segments(&self) -> &[Segment];

    /// Get all symbols (if available)
    fn symbols(&self) -> &[Symbol];

    /// Find a symbol by name
    fn find_symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols().iter().find(|s| s.name == name)
    }
}

/// A loadable region of the image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Segment or section name (may be empty)
    pub name: String,
    /// Virtual address
    pub virtual_address: Address,
    /// Size in memory
    pub virtual_size: u64,
    /// Raw file offset
    pub file_offset: u64,
    /// Bytes backed by the file; the rest of `virtual_size` is zero-fill
    pub file_size: u64,
    /// Access permissions
    pub permissions: Permissions,
}

impl Segment {
    /// One past the last virtual address
    pub fn end(&self) -> u64 {
        self.virtual_address.as_u64().saturating_add(self.virtual_size)
    }

    pub fn contains(&self, address: Address) -> bool {
        address.as_u64() >= self.virtual_address.as_u64() && address.as_u64() < self.end()
    }

    pub fn is_executable(&self) -> bool {
        self.permissions.contains(Permissions::EXECUTE)
    }
}

bitflags::bitflags! {
    /// Segment permissions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u32 {
        const READ = 0x0001;
        const WRITE = 0x0002;
        const EXECUTE = 0x0004;
    }
}

/// Symbol information
#[derive(Debug, Clone)]
pub struct Symbol {
    /// Symbol name
    pub name: String,
    /// Symbol address
    pub address: Address,
    /// Symbol size (if known)
    pub size: Option<u64>,
    /// Symbol type
    pub symbol_type: SymbolType,
}

/// Symbol type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolType {
    Function,
    Object,
    Unknown,
}

/// Bounds-checked cursor over image bytes
///
/// Every read reports the structure being parsed so truncation errors say
/// what was cut off.
pub struct BinaryReader<'a> {
    data: &'a [u8],
    offset: usize,
    endian: Endian,
    structure: &'static str,
}

impl<'a> BinaryReader<'a> {
    pub fn new(data: &'a [u8], little_endian: bool, structure: &'static str) -> Self {
        Self {
            data,
            offset: 0,
            endian: if little_endian { Endian::Little } else { Endian::Big },
            structure,
        }
    }

    pub fn new_at(data: &'a [u8], offset: usize, little_endian: bool, structure: &'static str) -> Self {
        let mut reader = Self::new(data, little_endian, structure);
        reader.offset = offset;
        reader
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn set_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    /// Rename the structure reported in errors
    pub fn structure(&mut self, structure: &'static str) {
        self.structure = structure;
    }

    fn truncated(&self, at: usize, needed: usize) -> ParseError {
        ParseError::truncated(self.structure, at as u64, needed as u64, self.data.len())
    }

    fn read<T>(&mut self) -> ParseResult<T>
    where
        T: TryFromCtx<'a, Endian, Error = scroll::Error>,
    {
        let start = self.offset;
        self.data
            .gread_with::<T>(&mut self.offset, self.endian)
            .map_err(|_| self.truncated(start, std::mem::size_of::<T>()))
    }

    pub fn read_u8(&mut self) -> ParseResult<u8> {
        self.read()
    }

    pub fn read_u16(&mut self) -> ParseResult<u16> {
        self.read()
    }

    pub fn read_u32(&mut self) -> ParseResult<u32> {
        self.read()
    }

    pub fn read_u64(&mut self) -> ParseResult<u64> {
        self.read()
    }

    pub fn read_i32(&mut self) -> ParseResult<i32> {
        self.read()
    }

    /// Read a pointer-sized word
    pub fn read_word(&mut self, is_64bit: bool) -> ParseResult<u64> {
        if is_64bit {
            self.read_u64()
        } else {
            Ok(self.read_u32()? as u64)
        }
    }

    pub fn read_bytes(&mut self, count: usize) -> ParseResult<&'a [u8]> {
        let start = self.offset;
        let end = start
            .checked_add(count)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| self.truncated(start, count))?;
        self.offset = end;
        Ok(&self.data[start..end])
    }

    /// Read a fixed-size, NUL-padded name field
    pub fn read_fixed_name(&mut self, count: usize) -> ParseResult<String> {
        let bytes = self.read_bytes(count)?;
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..len]).into_owned())
    }

    pub fn skip(&mut self, count: usize) -> ParseResult<()> {
        self.read_bytes(count).map(|_| ())
    }
}

/// Read a NUL-terminated string starting at `offset`, scanning at most `max_len` bytes
///
/// Returns `None` when the offset is out of range or no terminator is found.
pub fn read_cstring(data: &[u8], offset: usize, max_len: usize) -> Option<&str> {
    let tail = data.get(offset..)?;
    let window = &tail[..tail.len().min(max_len)];
    let len = window.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&window[..len]).ok()
}

/// Convert a `(start, len)` pair read from a header into a checked byte range
pub fn checked_range(
    structure: &'static str,
    start: u64,
    len: u64,
    data_len: usize,
) -> ParseResult<std::ops::Range<usize>> {
    let end = start
        .checked_add(len)
        .ok_or_else(|| ParseError::malformed(format!("{structure} range overflows")))?;
    if end > data_len as u64 {
        return Err(ParseError::truncated(structure, start, len, data_len));
    }
    Ok(start as usize..end as usize)
}
