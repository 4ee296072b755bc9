//! PE (Portable Executable) format parser for Windows binaries

use crate::common::{read_cstring, BinaryFile, BinaryReader, Permissions, Segment, Symbol, SymbolType};
use crate::error::{ParseError, ParseResult};
use atlas_core::{Address, Architecture, BinaryFormat};
use tracing::{debug, warn};

/// DOS header magic
const DOS_MAGIC: u16 = 0x5A4D; // "MZ"

/// PE signature
const PE_SIGNATURE: u32 = 0x00004550; // "PE\0\0"

/// PE machine types
const IMAGE_FILE_MACHINE_I386: u16 = 0x014c;
const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
const IMAGE_FILE_MACHINE_ARM: u16 = 0x01c0;
const IMAGE_FILE_MACHINE_ARMNT: u16 = 0x01c4;
const IMAGE_FILE_MACHINE_ARM64: u16 = 0xaa64;

/// PE optional header magic
const PE32_MAGIC: u16 = 0x10b;
const PE32PLUS_MAGIC: u16 = 0x20b;

/// Section characteristics
const IMAGE_SCN_MEM_EXECUTE: u32 = 0x20000000;
const IMAGE_SCN_MEM_READ: u32 = 0x40000000;
const IMAGE_SCN_MEM_WRITE: u32 = 0x80000000;

/// Export directory index in the data directory table
const IMAGE_DIRECTORY_ENTRY_EXPORT: usize = 0;

/// Upper bound on exported names we will walk
const MAX_EXPORTS: u32 = 1 << 20;

/// Parsed PE file
pub struct PeFile {
    architecture: Architecture,
    image_base: Address,
    entry_point: Address,
    segments: Vec<Segment>,
    symbols: Vec<Symbol>,
    is_64bit: bool,
}

impl PeFile {
    /// Parse a PE file from raw bytes
    pub fn parse(data: &[u8]) -> ParseResult<Self> {
        let mut reader = BinaryReader::new(data, true, "DOS header");

        let dos_magic = reader.read_u16()?;
        if dos_magic != DOS_MAGIC {
            return Err(ParseError::UnsupportedFormat(dos_magic as u32));
        }

        // e_lfanew (offset to PE header) lives at 0x3C
        reader.set_offset(0x3C);
        let pe_offset = reader.read_u32()? as usize;

        reader.structure("PE header");
        reader.set_offset(pe_offset);
        let pe_sig = reader.read_u32()?;
        if pe_sig != PE_SIGNATURE {
            return Err(ParseError::malformed(format!("Invalid PE signature: {pe_sig:#x}")));
        }

        // COFF header
        let machine = reader.read_u16()?;
        let number_of_sections = reader.read_u16()?;
        let _time_date_stamp = reader.read_u32()?;
        let _pointer_to_symbol_table = reader.read_u32()?;
        let _number_of_symbols = reader.read_u32()?;
        let size_of_optional_header = reader.read_u16()?;
        let _characteristics = reader.read_u16()?;

        let architecture = match machine {
            IMAGE_FILE_MACHINE_I386 => Architecture::X86,
            IMAGE_FILE_MACHINE_AMD64 => Architecture::X64,
            IMAGE_FILE_MACHINE_ARM | IMAGE_FILE_MACHINE_ARMNT => Architecture::Arm32,
            IMAGE_FILE_MACHINE_ARM64 => Architecture::Arm64,
            _ => Architecture::Unknown,
        };

        // Optional header
        reader.structure("optional header");
        let optional_header_offset = reader.offset();
        let optional_magic = reader.read_u16()?;
        let is_64bit = match optional_magic {
            PE32_MAGIC => false,
            PE32PLUS_MAGIC => true,
            _ => {
                return Err(ParseError::malformed(format!(
                    "Invalid optional header magic: {optional_magic:#x}"
                )))
            }
        };

        reader.skip(2)?; // MajorLinkerVersion, MinorLinkerVersion
        reader.skip(4)?; // SizeOfCode
        reader.skip(4)?; // SizeOfInitializedData
        reader.skip(4)?; // SizeOfUninitializedData

        let address_of_entry_point = reader.read_u32()?;

        reader.skip(4)?; // BaseOfCode
        if !is_64bit {
            reader.skip(4)?; // BaseOfData (PE32 only)
        }

        let image_base = reader.read_word(is_64bit)?;

        // SectionAlignment .. LoaderFlags
        reader.skip(40)?;
        reader.skip(if is_64bit { 32 } else { 16 })?; // stack/heap reserve and commit
        reader.skip(4)?; // LoaderFlags
        let number_of_rva_and_sizes = reader.read_u32()?;

        let mut directories = Vec::new();
        for _ in 0..number_of_rva_and_sizes.min(16) {
            let rva = reader.read_u32()?;
            let size = reader.read_u32()?;
            directories.push((rva, size));
        }

        // Section headers
        reader.structure("section header");
        reader.set_offset(optional_header_offset + size_of_optional_header as usize);

        let mut segments = Vec::with_capacity(number_of_sections as usize);
        for _ in 0..number_of_sections {
            let name = reader.read_fixed_name(8)?;
            let virtual_size = reader.read_u32()? as u64;
            let virtual_address = reader.read_u32()? as u64;
            let size_of_raw_data = reader.read_u32()? as u64;
            let pointer_to_raw_data = reader.read_u32()? as u64;
            reader.skip(12)?; // relocation and line number pointers/counts
            let characteristics = reader.read_u32()?;

            let mut permissions = Permissions::empty();
            if characteristics & IMAGE_SCN_MEM_READ != 0 {
                permissions |= Permissions::READ;
            }
            if characteristics & IMAGE_SCN_MEM_WRITE != 0 {
                permissions |= Permissions::WRITE;
            }
            if characteristics & IMAGE_SCN_MEM_EXECUTE != 0 {
                permissions |= Permissions::EXECUTE;
            }

            // Some linkers leave VirtualSize zero and rely on the raw size
            let memory_size = if virtual_size == 0 { size_of_raw_data } else { virtual_size };
            if memory_size == 0 {
                continue;
            }

            let address = image_base.checked_add(virtual_address).ok_or_else(|| {
                ParseError::malformed(format!("section {name:?} address overflows"))
            })?;

            segments.push(Segment {
                name,
                virtual_address: Address::new(address),
                virtual_size: memory_size,
                file_offset: pointer_to_raw_data,
                file_size: if pointer_to_raw_data == 0 { 0 } else { size_of_raw_data.min(memory_size) },
                permissions,
            });
        }

        let symbols = match directories.get(IMAGE_DIRECTORY_ENTRY_EXPORT) {
            Some(&(rva, size)) if rva != 0 && size != 0 => {
                Self::parse_exports(data, image_base, &segments, rva).unwrap_or_else(|e| {
                    warn!("Ignoring unreadable export table: {}", e);
                    Vec::new()
                })
            }
            _ => Vec::new(),
        };

        debug!(
            "PE{}: {} sections, {} exports",
            if is_64bit { "32+" } else { "32" },
            segments.len(),
            symbols.len()
        );

        Ok(Self {
            architecture,
            image_base: Address::new(image_base),
            entry_point: Address::new(image_base.wrapping_add(address_of_entry_point as u64)),
            segments,
            symbols,
            is_64bit,
        })
    }

    /// Map a relative virtual address to a file offset through the section table
    fn rva_to_offset(segments: &[Segment], image_base: u64, rva: u32) -> Option<usize> {
        let va = image_base.checked_add(rva as u64)?;
        segments.iter().find_map(|s| {
            let delta = va.checked_sub(s.virtual_address.as_u64())?;
            (delta < s.file_size).then(|| (s.file_offset + delta) as usize)
        })
    }

    fn parse_exports(data: &[u8], image_base: u64, segments: &[Segment], export_rva: u32) -> ParseResult<Vec<Symbol>> {
        let unmapped = |rva: u32| ParseError::Unmapped(Address::new(image_base.wrapping_add(rva as u64)));

        let offset = Self::rva_to_offset(segments, image_base, export_rva).ok_or_else(|| unmapped(export_rva))?;
        let mut reader = BinaryReader::new_at(data, offset, true, "export directory");
        reader.skip(24)?; // characteristics, timestamp, version, name, base, NumberOfFunctions
        let number_of_names = reader.read_u32()?.min(MAX_EXPORTS);
        let address_of_functions = reader.read_u32()?;
        let address_of_names = reader.read_u32()?;
        let address_of_ordinals = reader.read_u32()?;

        let functions = Self::rva_to_offset(segments, image_base, address_of_functions)
            .ok_or_else(|| unmapped(address_of_functions))?;
        let names = Self::rva_to_offset(segments, image_base, address_of_names)
            .ok_or_else(|| unmapped(address_of_names))?;
        let ordinals = Self::rva_to_offset(segments, image_base, address_of_ordinals)
            .ok_or_else(|| unmapped(address_of_ordinals))?;

        let mut symbols = Vec::with_capacity(number_of_names as usize);
        for i in 0..number_of_names as usize {
            let name_rva = BinaryReader::new_at(data, names + i * 4, true, "export name table").read_u32()?;
            let ordinal = BinaryReader::new_at(data, ordinals + i * 2, true, "export ordinal table").read_u16()?;
            let function_rva =
                BinaryReader::new_at(data, functions + ordinal as usize * 4, true, "export address table").read_u32()?;

            let Some(name) = Self::rva_to_offset(segments, image_base, name_rva)
                .and_then(|name_offset| read_cstring(data, name_offset, 1024))
            else {
                continue;
            };

            symbols.push(Symbol {
                name: name.to_string(),
                address: Address::new(image_base.wrapping_add(function_rva as u64)),
                size: None,
                symbol_type: SymbolType::Unknown,
            });
        }

        Ok(symbols)
    }
}

impl BinaryFile for PeFile {
    fn format(&self) -> BinaryFormat {
        BinaryFormat::PE
    }

    fn architecture(&self) -> Architecture {
        self.architecture
    }

    fn is_64bit(&self) -> bool {
        self.is_64bit
    }

    fn little_endian(&self) -> bool {
        true
    }

    fn image_base(&self) -> Address {
        self.image_base
    }

    fn entry_point(&self) -> Address {
        self.entry_point
    }

    fn segments(&self) -> &[Segment] {
        &self.segments
    }

    fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// PE32+ image with `.text` at RVA 0x1000 and `.data` at RVA 0x2000
    fn minimal_pe() -> Vec<u8> {
        pe_image(false)
    }

    /// Same section layout; PE32 images carry BaseOfData and a 4-byte ImageBase
    fn pe_image(pe32: bool) -> Vec<u8> {
        let mut data = vec![0u8; 0x600];
        data[0..2].copy_from_slice(b"MZ");
        data[0x3C..0x40].copy_from_slice(&0x40u32.to_le_bytes());

        let (machine, optional_size) = if pe32 {
            (IMAGE_FILE_MACHINE_I386, 224u16)
        } else {
            (IMAGE_FILE_MACHINE_AMD64, 240u16)
        };

        let mut pe = Vec::new();
        pe.extend_from_slice(&PE_SIGNATURE.to_le_bytes());
        pe.extend_from_slice(&machine.to_le_bytes());
        pe.extend_from_slice(&2u16.to_le_bytes());
        pe.extend_from_slice(&[0u8; 12]);
        pe.extend_from_slice(&optional_size.to_le_bytes()); // SizeOfOptionalHeader
        pe.extend_from_slice(&0x22u16.to_le_bytes());

        let mut optional = vec![0u8; optional_size as usize];
        optional[16..20].copy_from_slice(&0x1010u32.to_le_bytes());
        optional[20..24].copy_from_slice(&0x1000u32.to_le_bytes()); // BaseOfCode
        if pe32 {
            optional[0..2].copy_from_slice(&PE32_MAGIC.to_le_bytes());
            optional[24..28].copy_from_slice(&0x2000u32.to_le_bytes()); // BaseOfData
            optional[28..32].copy_from_slice(&0x0040_0000u32.to_le_bytes());
            optional[92..96].copy_from_slice(&16u32.to_le_bytes());
        } else {
            optional[0..2].copy_from_slice(&PE32PLUS_MAGIC.to_le_bytes());
            optional[24..32].copy_from_slice(&0x1_4000_0000u64.to_le_bytes());
            optional[108..112].copy_from_slice(&16u32.to_le_bytes());
        }
        pe.extend_from_slice(&optional);

        for (name, rva, raw, characteristics) in [
            (b".text\0\0\0", 0x1000u32, 0x200u32, IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_EXECUTE),
            (b".data\0\0\0", 0x2000, 0x400, IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE),
        ] {
            pe.extend_from_slice(name);
            pe.extend_from_slice(&0x200u32.to_le_bytes());
            pe.extend_from_slice(&rva.to_le_bytes());
            pe.extend_from_slice(&0x200u32.to_le_bytes());
            pe.extend_from_slice(&raw.to_le_bytes());
            pe.extend_from_slice(&[0u8; 12]);
            pe.extend_from_slice(&characteristics.to_le_bytes());
        }

        data[0x40..0x40 + pe.len()].copy_from_slice(&pe);
        data
    }

    #[test]
    fn test_parse_sections() {
        let pe = PeFile::parse(&minimal_pe()).unwrap();
        assert_eq!(pe.architecture(), Architecture::X64);
        assert!(pe.is_64bit());
        assert_eq!(pe.image_base(), Address(0x1_4000_0000));
        assert_eq!(pe.entry_point(), Address(0x1_4000_1010));
        assert_eq!(pe.segments().len(), 2);
        assert_eq!(pe.segments()[0].name, ".text");
        assert!(pe.segments()[0].is_executable());
        assert_eq!(pe.segments()[1].virtual_address, Address(0x1_4000_2000));
        assert_eq!(pe.segments()[1].file_offset, 0x400);
    }

    #[test]
    fn test_parse_pe32_sections() {
        let pe = PeFile::parse(&pe_image(true)).unwrap();
        assert_eq!(pe.architecture(), Architecture::X86);
        assert!(!pe.is_64bit());
        assert_eq!(pe.image_base(), Address(0x0040_0000));
        assert_eq!(pe.entry_point(), Address(0x0040_1010));

        let segments = pe.segments();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].name, ".text");
        assert_eq!(segments[0].virtual_address, Address(0x0040_1000));
        assert_eq!(segments[0].permissions, Permissions::READ | Permissions::EXECUTE);
        assert_eq!(segments[1].virtual_address, Address(0x0040_2000));
        assert_eq!(segments[1].permissions, Permissions::READ | Permissions::WRITE);
        assert_eq!(segments[1].file_offset, 0x400);
        assert_eq!(segments[1].file_size, 0x200);
    }

    #[test]
    fn test_truncated_headers() {
        let data = minimal_pe();
        assert!(matches!(
            PeFile::parse(&data[..0x80]),
            Err(ParseError::TruncatedImage { .. })
        ));
    }

    #[test]
    fn test_bad_signature() {
        let mut data = minimal_pe();
        data[0x40] = b'X';
        assert!(matches!(PeFile::parse(&data), Err(ParseError::MalformedLayout(_))));
    }
}
