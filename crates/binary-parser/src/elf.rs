//! ELF (Executable and Linkable Format) parser for Linux/Android binaries

use crate::common::{checked_range, read_cstring, BinaryFile, BinaryReader, Permissions, Segment, Symbol, SymbolType};
use crate::error::{ParseError, ParseResult};
use atlas_core::{Address, Architecture, BinaryFormat};
use tracing::debug;

/// ELF magic
pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// ELF classes
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;

/// ELF endianness
const ELFDATA2LSB: u8 = 1;
const ELFDATA2MSB: u8 = 2;

/// ELF machine types
const EM_386: u16 = 3;
const EM_ARM: u16 = 40;
const EM_X86_64: u16 = 62;
const EM_AARCH64: u16 = 183;

/// Program header types and flags
const PT_LOAD: u32 = 1;
const PF_X: u32 = 0x1;
const PF_W: u32 = 0x2;
const PF_R: u32 = 0x4;

/// Section types
const SHT_SYMTAB: u32 = 2;
const SHT_DYNSYM: u32 = 11;

/// Symbol types
const STT_OBJECT: u8 = 1;
const STT_FUNC: u8 = 2;

/// Longest symbol name we are willing to scan for
const MAX_SYMBOL_NAME: usize = 4096;

/// Raw section header fields we care about
struct SectionHeader {
    sh_type: u32,
    offset: u64,
    size: u64,
    link: u32,
    entsize: u64,
}

/// Parsed ELF file
pub struct ElfFile {
    architecture: Architecture,
    is_64bit: bool,
    little_endian: bool,
    entry_point: Address,
    segments: Vec<Segment>,
    symbols: Vec<Symbol>,
}

impl ElfFile {
    /// Parse an ELF file from raw bytes
    pub fn parse(data: &[u8]) -> ParseResult<Self> {
        if data.len() < 16 {
            return Err(ParseError::truncated("ELF identification", 0, 16, data.len()));
        }

        if data[0..4] != ELF_MAGIC {
            return Err(ParseError::UnsupportedFormat(u32::from_le_bytes([
                data[0], data[1], data[2], data[3],
            ])));
        }

        let is_64bit = match data[4] {
            ELFCLASS32 => false,
            ELFCLASS64 => true,
            class => return Err(ParseError::malformed(format!("Invalid ELF class: {class}"))),
        };

        let little_endian = match data[5] {
            ELFDATA2LSB => true,
            ELFDATA2MSB => false,
            encoding => {
                return Err(ParseError::malformed(format!("Invalid ELF data encoding: {encoding}")))
            }
        };

        let mut reader = BinaryReader::new_at(data, 16, little_endian, "ELF header");

        let _e_type = reader.read_u16()?;
        let e_machine = reader.read_u16()?;
        let _e_version = reader.read_u32()?;

        let architecture = match e_machine {
            EM_386 => Architecture::X86,
            EM_X86_64 => Architecture::X64,
            EM_ARM => Architecture::Arm32,
            EM_AARCH64 => Architecture::Arm64,
            _ => Architecture::Unknown,
        };

        let entry_point = reader.read_word(is_64bit)?;
        let ph_offset = reader.read_word(is_64bit)?;
        let sh_offset = reader.read_word(is_64bit)?;
        let _e_flags = reader.read_u32()?;
        let _e_ehsize = reader.read_u16()?;
        let ph_entsize = reader.read_u16()? as u64;
        let ph_num = reader.read_u16()? as u64;
        let sh_entsize = reader.read_u16()? as u64;
        let sh_num = reader.read_u16()? as u64;
        let _sh_strndx = reader.read_u16()?;

        let segments = Self::parse_segments(data, ph_offset, ph_entsize, ph_num, is_64bit, little_endian)?;
        let sections = Self::parse_section_headers(data, sh_offset, sh_entsize, sh_num, is_64bit, little_endian)?;
        let symbols = Self::parse_symbols(data, &sections, is_64bit, little_endian)?;

        debug!(
            "ELF{}: {} load segments, {} sections, {} symbols",
            if is_64bit { 64 } else { 32 },
            segments.len(),
            sections.len(),
            symbols.len()
        );

        Ok(Self {
            architecture,
            is_64bit,
            little_endian,
            entry_point: Address::new(entry_point),
            segments,
            symbols,
        })
    }

    fn parse_segments(
        data: &[u8],
        ph_offset: u64,
        ph_entsize: u64,
        ph_num: u64,
        is_64bit: bool,
        little_endian: bool,
    ) -> ParseResult<Vec<Segment>> {
        let min_entsize = if is_64bit { 56 } else { 32 };
        if ph_num > 0 && ph_entsize < min_entsize {
            return Err(ParseError::malformed(format!("program header entry size {ph_entsize} too small")));
        }

        let table = checked_range("program header table", ph_offset, ph_entsize * ph_num, data.len())?;
        let mut segments = Vec::new();

        for i in 0..ph_num as usize {
            let mut reader = BinaryReader::new_at(data, table.start + i * ph_entsize as usize, little_endian, "program header");

            let (p_type, p_flags, p_offset, p_vaddr, p_filesz, p_memsz) = if is_64bit {
                let p_type = reader.read_u32()?;
                let p_flags = reader.read_u32()?;
                let p_offset = reader.read_u64()?;
                let p_vaddr = reader.read_u64()?;
                let _p_paddr = reader.read_u64()?;
                let p_filesz = reader.read_u64()?;
                let p_memsz = reader.read_u64()?;
                (p_type, p_flags, p_offset, p_vaddr, p_filesz, p_memsz)
            } else {
                let p_type = reader.read_u32()?;
                let p_offset = reader.read_u32()? as u64;
                let p_vaddr = reader.read_u32()? as u64;
                let _p_paddr = reader.read_u32()?;
                let p_filesz = reader.read_u32()? as u64;
                let p_memsz = reader.read_u32()? as u64;
                let p_flags = reader.read_u32()?;
                (p_type, p_flags, p_offset, p_vaddr, p_filesz, p_memsz)
            };

            if p_type != PT_LOAD || p_memsz == 0 {
                continue;
            }

            let mut permissions = Permissions::empty();
            if p_flags & PF_R != 0 {
                permissions |= Permissions::READ;
            }
            if p_flags & PF_W != 0 {
                permissions |= Permissions::WRITE;
            }
            if p_flags & PF_X != 0 {
                permissions |= Permissions::EXECUTE;
            }

            segments.push(Segment {
                name: format!("LOAD{}", segments.len()),
                virtual_address: Address::new(p_vaddr),
                virtual_size: p_memsz,
                file_offset: p_offset,
                file_size: p_filesz.min(p_memsz),
                permissions,
            });
        }

        Ok(segments)
    }

    fn parse_section_headers(
        data: &[u8],
        sh_offset: u64,
        sh_entsize: u64,
        sh_num: u64,
        is_64bit: bool,
        little_endian: bool,
    ) -> ParseResult<Vec<SectionHeader>> {
        if sh_offset == 0 || sh_num == 0 {
            return Ok(Vec::new());
        }

        let min_entsize = if is_64bit { 64 } else { 40 };
        if sh_entsize < min_entsize {
            return Err(ParseError::malformed(format!("section header entry size {sh_entsize} too small")));
        }

        let table = checked_range("section header table", sh_offset, sh_entsize * sh_num, data.len())?;
        let mut sections = Vec::with_capacity(sh_num as usize);

        for i in 0..sh_num as usize {
            let mut reader = BinaryReader::new_at(data, table.start + i * sh_entsize as usize, little_endian, "section header");

            let _sh_name = reader.read_u32()?;
            let sh_type = reader.read_u32()?;
            let _sh_flags = reader.read_word(is_64bit)?;
            let _sh_addr = reader.read_word(is_64bit)?;
            let offset = reader.read_word(is_64bit)?;
            let size = reader.read_word(is_64bit)?;
            let link = reader.read_u32()?;
            let _sh_info = reader.read_u32()?;
            let _sh_addralign = reader.read_word(is_64bit)?;
            let entsize = reader.read_word(is_64bit)?;

            sections.push(SectionHeader {
                sh_type,
                offset,
                size,
                link,
                entsize,
            });
        }

        Ok(sections)
    }

    fn parse_symbols(
        data: &[u8],
        sections: &[SectionHeader],
        is_64bit: bool,
        little_endian: bool,
    ) -> ParseResult<Vec<Symbol>> {
        let mut symbols = Vec::new();
        let sym_size: u64 = if is_64bit { 24 } else { 16 };

        for section in sections {
            if section.sh_type != SHT_SYMTAB && section.sh_type != SHT_DYNSYM {
                continue;
            }
            if section.entsize != 0 && section.entsize != sym_size {
                return Err(ParseError::malformed(format!("symbol entry size {} unsupported", section.entsize)));
            }

            let strtab = sections
                .get(section.link as usize)
                .ok_or_else(|| ParseError::malformed(format!("symbol table links to missing section {}", section.link)))?;
            let strtab_range = checked_range("string table", strtab.offset, strtab.size, data.len())?;
            let strtab_data = &data[strtab_range];

            let symtab = checked_range("symbol table", section.offset, section.size, data.len())?;
            let count = section.size / sym_size;

            for i in 0..count as usize {
                let mut reader = BinaryReader::new_at(data, symtab.start + i * sym_size as usize, little_endian, "symbol");

                let (st_name, st_value, st_size, st_info, st_shndx) = if is_64bit {
                    let st_name = reader.read_u32()?;
                    let st_info = reader.read_u8()?;
                    let _st_other = reader.read_u8()?;
                    let st_shndx = reader.read_u16()?;
                    let st_value = reader.read_u64()?;
                    let st_size = reader.read_u64()?;
                    (st_name, st_value, st_size, st_info, st_shndx)
                } else {
                    let st_name = reader.read_u32()?;
                    let st_value = reader.read_u32()? as u64;
                    let st_size = reader.read_u32()? as u64;
                    let st_info = reader.read_u8()?;
                    let _st_other = reader.read_u8()?;
                    let st_shndx = reader.read_u16()?;
                    (st_name, st_value, st_size, st_info, st_shndx)
                };

                // undefined symbols carry no address
                if st_shndx == 0 {
                    continue;
                }

                let name = match read_cstring(strtab_data, st_name as usize, MAX_SYMBOL_NAME) {
                    Some(name) if !name.is_empty() => name.to_string(),
                    _ => continue,
                };

                let symbol_type = match st_info & 0xf {
                    STT_FUNC => SymbolType::Function,
                    STT_OBJECT => SymbolType::Object,
                    _ => SymbolType::Unknown,
                };

                symbols.push(Symbol {
                    name,
                    address: Address::new(st_value),
                    size: (st_size > 0).then_some(st_size),
                    symbol_type,
                });
            }
        }

        Ok(symbols)
    }
}

impl BinaryFile for ElfFile {
    fn format(&self) -> BinaryFormat {
        BinaryFormat::ELF
    }

    fn architecture(&self) -> Architecture {
        self.architecture
    }

    fn is_64bit(&self) -> bool {
        self.is_64bit
    }

    fn little_endian(&self) -> bool {
        self.little_endian
    }

    fn image_base(&self) -> Address {
        // ELF has no fixed image base; use the lowest load address
        self.segments
            .iter()
            .map(|s| s.virtual_address)
            .min()
            .unwrap_or(Address::ZERO)
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
