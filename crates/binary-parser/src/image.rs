//! Unified addressable view over a parsed executable

use crate::buffer::ByteBuffer;
use crate::common::{read_cstring, BinaryFile, BinaryReader, Segment, Symbol};
use crate::error::{ParseError, ParseResult};
use crate::translator::AddressTranslator;
use crate::{detect_format, elf, macho, pe};
use atlas_core::{Address, Architecture, BinaryFormat};
use std::path::Path;
use tracing::{debug, info};

/// A loaded executable image
///
/// Owns the shared input bytes, the format-specific container and the
/// translator built from its validated segment table.
pub struct BinaryImage {
    data: ByteBuffer,
    file: Box<dyn BinaryFile>,
    translator: AddressTranslator,
}

impl BinaryImage {
    /// Map a file and parse it
    pub fn load(path: &Path) -> ParseResult<Self> {
        info!("Loading image from {:?}", path);
        Self::parse(ByteBuffer::map_file(path)?)
    }

    /// Detect the container format and parse the image
    pub fn parse(data: ByteBuffer) -> ParseResult<Self> {
        let format = detect_format(&data).ok_or_else(|| ParseError::UnsupportedFormat(leading_magic(&data)))?;

        let file: Box<dyn BinaryFile> = match format {
            BinaryFormat::ELF => Box::new(elf::ElfFile::parse(&data)?),
            BinaryFormat::PE => Box::new(pe::PeFile::parse(&data)?),
            BinaryFormat::MachO => Box::new(macho::MachOFile::parse(&data)?),
        };

        validate_segments(file.segments(), data.len())?;
        let translator = AddressTranslator::new(file.segments());

        info!(
            "Parsed {:?} image: {:?}, {} segments, {} symbols",
            format,
            file.architecture(),
            file.segments().len(),
            file.symbols().len()
        );

        Ok(Self {
            data,
            file,
            translator,
        })
    }

    pub fn format(&self) -> BinaryFormat {
        self.file.format()
    }

    pub fn architecture(&self) -> Architecture {
        self.file.architecture()
    }

    pub fn is_64bit(&self) -> bool {
        self.file.is_64bit()
    }

    pub fn pointer_size(&self) -> usize {
        if self.is_64bit() {
            8
        } else {
            4
        }
    }

    pub fn little_endian(&self) -> bool {
        self.file.little_endian()
    }

    pub fn image_base(&self) -> Address {
        self.file.image_base()
    }

    pub fn entry_point(&self) -> Address {
        self.file.entry_point()
    }

    /// Segments sorted by virtual address
    pub fn segments(&self) -> &[Segment] {
        self.translator.segments()
    }

    pub fn symbols(&self) -> &[Symbol] {
        self.file.symbols()
    }

    pub fn find_symbol(&self, name: &str) -> Option<&Symbol> {
        self.file.find_symbol(name)
    }

    pub fn translator(&self) -> &AddressTranslator {
        &self.translator
    }

    /// Get the raw image bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn segment_containing(&self, address: Address) -> Option<&Segment> {
        self.translator.segment_containing(address)
    }

    pub fn is_executable(&self, address: Address) -> bool {
        self.translator.is_executable(address)
    }

    pub fn virtual_to_file_offset(&self, address: Address) -> Option<u64> {
        self.translator.virtual_to_file_offset(address)
    }

    pub fn file_offset_to_virtual(&self, offset: u64) -> Option<Address> {
        self.translator.file_offset_to_virtual(offset)
    }

    /// File-backed bytes of the segment containing `address`, starting at `address`
    pub fn bytes_from(&self, address: Address) -> ParseResult<&[u8]> {
        let segment = self
            .segment_containing(address)
            .ok_or(ParseError::Unmapped(address))?;
        let delta = address
            .checked_sub(segment.virtual_address)
            .ok_or(ParseError::Unmapped(address))?;
        if delta >= segment.file_size {
            return Err(ParseError::Unmapped(address));
        }
        let start = (segment.file_offset + delta) as usize;
        let end = (segment.file_offset + segment.file_size) as usize;
        // Segment file ranges were checked against the buffer at load time.
        Ok(&self.data[start..end])
    }

    /// Read `size` bytes at a virtual address without crossing a segment end
    pub fn read_va(&self, address: Address, size: usize) -> ParseResult<&[u8]> {
        let bytes = self.bytes_from(address)?;
        bytes.get(..size).ok_or(ParseError::Unmapped(address))
    }

    /// Read a pointer-sized word at a virtual address
    pub fn read_pointer(&self, address: Address) -> ParseResult<u64> {
        let bytes = self.read_va(address, self.pointer_size())?;
        BinaryReader::new(bytes, self.little_endian(), "pointer").read_word(self.is_64bit())
    }

    /// Read `count` consecutive pointer-sized words
    pub fn read_pointers(&self, address: Address, count: usize) -> ParseResult<Vec<u64>> {
        let size = count
            .checked_mul(self.pointer_size())
            .ok_or(ParseError::Unmapped(address))?;
        let bytes = self.read_va(address, size)?;
        let mut reader = BinaryReader::new(bytes, self.little_endian(), "pointer array");
        (0..count).map(|_| reader.read_word(self.is_64bit())).collect()
    }

    /// Read a NUL-terminated string at a virtual address
    pub fn read_cstring_va(&self, address: Address, max_len: usize) -> ParseResult<&str> {
        let bytes = self.bytes_from(address)?;
        read_cstring(bytes, 0, max_len).ok_or(ParseError::Unmapped(address))
    }
}

fn leading_magic(data: &[u8]) -> u32 {
    data.get(..4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .unwrap_or(0)
}

/// Check the segment table against the buffer and itself
///
/// Segments must be declared in non-decreasing address order, must not
/// overlap, and their file ranges must lie inside the buffer.
fn validate_segments(segments: &[Segment], data_len: usize) -> ParseResult<()> {
    if segments.is_empty() {
        return Err(ParseError::malformed("image has no loadable segments"));
    }

    let mut previous: Option<&Segment> = None;
    for segment in segments {
        let start = segment.virtual_address.as_u64();
        start.checked_add(segment.virtual_size).ok_or_else(|| {
            ParseError::malformed(format!("segment {:?} at {} wraps the address space", segment.name, segment.virtual_address))
        })?;

        if segment.file_size > 0 {
            let end = segment.file_offset.checked_add(segment.file_size).ok_or_else(|| {
                ParseError::malformed(format!("segment {:?} file range overflows", segment.name))
            })?;
            if end > data_len as u64 {
                return Err(ParseError::truncated("segment", segment.file_offset, segment.file_size, data_len));
            }
        }

        if let Some(prev) = previous {
            if start < prev.virtual_address.as_u64() {
                return Err(ParseError::malformed(format!(
                    "segment {:?} at {} is declared after {:?} at {}",
                    segment.name, segment.virtual_address, prev.name, prev.virtual_address
                )));
            }
            if start < prev.end() {
                return Err(ParseError::malformed(format!(
                    "segment {:?} at {} overlaps {:?} ending at {:#x}",
                    segment.name,
                    segment.virtual_address,
                    prev.name,
                    prev.end()
                )));
            }
        }

        debug!(
            "segment {:?}: va {} size {:#x}, file {:#x}+{:#x}, {:?}",
            segment.name,
            segment.virtual_address,
            segment.virtual_size,
            segment.file_offset,
            segment.file_size,
            segment.permissions
        );
        previous = Some(segment);
    }

    Ok(())
}
