//! Mach-O format parser for macOS/iOS binaries

use crate::common::{checked_range, read_cstring, BinaryFile, BinaryReader, Permissions, Segment, Symbol, SymbolType};
use crate::error::{ParseError, ParseResult};
use atlas_core::{Address, Architecture, BinaryFormat};
use scroll::{Pread, BE};
use std::ops::Range;
use tracing::debug;

/// Mach-O magic numbers
const MH_MAGIC: u32 = 0xFEEDFACE; // 32-bit
const MH_MAGIC_64: u32 = 0xFEEDFACF; // 64-bit
const MH_CIGAM: u32 = 0xCEFAEDFE; // 32-bit big endian
const MH_CIGAM_64: u32 = 0xCFFAEDFE; // 64-bit big endian

/// Universal binary magic, stored big-endian
pub const FAT_MAGIC: u32 = 0xCAFEBABE;

/// CPU types
const CPU_TYPE_I386: u32 = 7;
const CPU_TYPE_X86_64: u32 = 0x01000007;
const CPU_TYPE_ARM: u32 = 12;
const CPU_TYPE_ARM64: u32 = 0x0100000C;

/// Load commands
const LC_SEGMENT: u32 = 0x01;
const LC_SYMTAB: u32 = 0x02;
const LC_SEGMENT_64: u32 = 0x19;
const LC_MAIN: u32 = 0x80000028;

/// Segment protections
const VM_PROT_READ: u32 = 0x01;
const VM_PROT_WRITE: u32 = 0x02;
const VM_PROT_EXECUTE: u32 = 0x04;

/// nlist type bits
const N_STAB: u8 = 0xe0;
const N_TYPE: u8 = 0x0e;
const N_SECT: u8 = 0x0e;

/// Entry of the universal header's architecture table
#[derive(Debug, Clone, Copy, Pread)]
struct FatArch {
    cputype: u32,
    _cpusubtype: u32,
    offset: u32,
    size: u32,
    _align: u32,
}

/// Parsed Mach-O file
pub struct MachOFile {
    architecture: Architecture,
    is_64bit: bool,
    little_endian: bool,
    entry_point: Address,
    segments: Vec<Segment>,
    symbols: Vec<Symbol>,
    text_base: Address,
}

impl MachOFile {
    /// Parse a Mach-O file from raw bytes
    pub fn parse(data: &[u8]) -> ParseResult<Self> {
        let magic_bytes = data
            .get(..4)
            .ok_or_else(|| ParseError::truncated("Mach-O header", 0, 4, data.len()))?;

        if u32::from_be_bytes([magic_bytes[0], magic_bytes[1], magic_bytes[2], magic_bytes[3]]) == FAT_MAGIC {
            return Self::parse_fat_binary(data);
        }

        Self::parse_slice(data, 0..data.len())
    }

    fn parse_fat_binary(data: &[u8]) -> ParseResult<Self> {
        let mut reader = BinaryReader::new(data, false, "universal header");
        let _magic = reader.read_u32()?;
        let nfat_arch = reader.read_u32()? as usize;

        let table = checked_range("universal header", 8, (nfat_arch * 20) as u64, data.len())?;

        // Prefer a 64-bit slice, fall back to the first 32-bit one
        let mut best: Option<FatArch> = None;
        for i in 0..nfat_arch {
            let arch: FatArch = data
                .pread_with(table.start + i * 20, BE)
                .map_err(|_| ParseError::truncated("universal header", (table.start + i * 20) as u64, 20, data.len()))?;

            match arch.cputype {
                CPU_TYPE_X86_64 | CPU_TYPE_ARM64 => {
                    best = Some(arch);
                    break;
                }
                CPU_TYPE_I386 | CPU_TYPE_ARM if best.is_none() => best = Some(arch),
                _ => {}
            }
        }

        let arch = best.ok_or_else(|| ParseError::malformed("No supported architecture in universal binary"))?;
        let slice = checked_range("universal slice", arch.offset as u64, arch.size as u64, data.len())?;
        debug!("Universal binary: using slice at {:#x} (cputype {:#x})", slice.start, arch.cputype);

        Self::parse_slice(data, slice)
    }

    /// Parse the image in `data[slice]`; every file range must stay inside the slice
    fn parse_slice(data: &[u8], slice: Range<usize>) -> ParseResult<Self> {
        let base_offset = slice.start;
        let data = &data[slice];
        let magic = BinaryReader::new_at(data, 0, true, "Mach-O header").read_u32()?;

        let (is_64bit, little_endian) = match magic {
            MH_MAGIC => (false, true),
            MH_MAGIC_64 => (true, true),
            MH_CIGAM => (false, false),
            MH_CIGAM_64 => (true, false),
            _ => return Err(ParseError::UnsupportedFormat(magic)),
        };

        let mut reader = BinaryReader::new_at(data, 4, little_endian, "Mach-O header");
        let cputype = reader.read_u32()?;
        let _cpusubtype = reader.read_u32()?;
        let _filetype = reader.read_u32()?;
        let ncmds = reader.read_u32()?;
        let sizeofcmds = reader.read_u32()? as u64;
        let _flags = reader.read_u32()?;
        if is_64bit {
            let _reserved = reader.read_u32()?;
        }

        let architecture = match cputype {
            CPU_TYPE_I386 => Architecture::X86,
            CPU_TYPE_X86_64 => Architecture::X64,
            CPU_TYPE_ARM => Architecture::Arm32,
            CPU_TYPE_ARM64 => Architecture::Arm64,
            _ => Architecture::Unknown,
        };

        let commands = checked_range("load commands", reader.offset() as u64, sizeofcmds, data.len())?;

        let mut segments = Vec::new();
        let mut entry_offset = None;
        let mut text_base = Address::ZERO;
        let mut symtab = None;

        let mut cmd_start = commands.start;
        for _ in 0..ncmds {
            let mut cmd_reader = BinaryReader::new_at(data, cmd_start, little_endian, "load command");
            let cmd = cmd_reader.read_u32()?;
            let cmdsize = cmd_reader.read_u32()? as usize;

            if cmdsize < 8 || cmd_start + cmdsize > commands.end {
                return Err(ParseError::malformed(format!(
                    "load command {cmd:#x} at {cmd_start:#x} has size {cmdsize}"
                )));
            }
            cmd_start += cmdsize;

            match cmd {
                LC_SEGMENT | LC_SEGMENT_64 => {
                    let wide = cmd == LC_SEGMENT_64;
                    let segname = cmd_reader.read_fixed_name(16)?;
                    let vmaddr = cmd_reader.read_word(wide)?;
                    let vmsize = cmd_reader.read_word(wide)?;
                    let fileoff = cmd_reader.read_word(wide)?;
                    let filesize = cmd_reader.read_word(wide)?;
                    let _maxprot = cmd_reader.read_u32()?;
                    let initprot = cmd_reader.read_u32()?;

                    if segname == "__TEXT" {
                        text_base = Address::new(vmaddr);
                    }

                    // __PAGEZERO and friends reserve address space only
                    if vmsize == 0 || (initprot == 0 && filesize == 0) {
                        continue;
                    }

                    let file_size = filesize.min(vmsize);
                    if file_size > 0 {
                        checked_range("segment", fileoff, file_size, data.len())?;
                    }

                    let mut permissions = Permissions::empty();
                    if initprot & VM_PROT_READ != 0 {
                        permissions |= Permissions::READ;
                    }
                    if initprot & VM_PROT_WRITE != 0 {
                        permissions |= Permissions::WRITE;
                    }
                    if initprot & VM_PROT_EXECUTE != 0 {
                        permissions |= Permissions::EXECUTE;
                    }

                    segments.push(Segment {
                        name: segname,
                        virtual_address: Address::new(vmaddr),
                        virtual_size: vmsize,
                        file_offset: base_offset as u64 + fileoff,
                        file_size,
                        permissions,
                    });
                }
                LC_MAIN => {
                    entry_offset = Some(cmd_reader.read_u64()?);
                }
                LC_SYMTAB => {
                    let symoff = cmd_reader.read_u32()?;
                    let nsyms = cmd_reader.read_u32()?;
                    let stroff = cmd_reader.read_u32()?;
                    let strsize = cmd_reader.read_u32()?;
                    symtab = Some((symoff, nsyms, stroff, strsize));
                }
                _ => {}
            }
        }

        let entry_point = entry_offset
            .map(|off| Address::new(text_base.as_u64().wrapping_add(off)))
            .unwrap_or(Address::ZERO);

        let symbols = match symtab {
            Some((symoff, nsyms, stroff, strsize)) if nsyms > 0 => Self::parse_symbols(
                data,
                symoff as u64,
                nsyms as u64,
                stroff as u64,
                strsize as u64,
                is_64bit,
                little_endian,
            )?,
            _ => Vec::new(),
        };

        debug!(
            "Mach-O{}: {} segments, {} symbols",
            if is_64bit { 64 } else { 32 },
            segments.len(),
            symbols.len()
        );

        Ok(Self {
            architecture,
            is_64bit,
            little_endian,
            entry_point,
            segments,
            symbols,
            text_base,
        })
    }

    fn parse_symbols(
        data: &[u8],
        symoff: u64,
        nsyms: u64,
        stroff: u64,
        strsize: u64,
        is_64bit: bool,
        little_endian: bool,
    ) -> ParseResult<Vec<Symbol>> {
        let sym_size: u64 = if is_64bit { 16 } else { 12 };
        let table = checked_range("symbol table", symoff, nsyms * sym_size, data.len())?;
        let strings = checked_range("string table", stroff, strsize, data.len())?;
        let strtab = &data[strings];

        let mut symbols = Vec::new();
        for i in 0..nsyms as usize {
            let mut reader = BinaryReader::new_at(data, table.start + i * sym_size as usize, little_endian, "symbol");

            let n_strx = reader.read_u32()? as usize;
            let n_type = reader.read_u8()?;
            let _n_sect = reader.read_u8()?;
            let _n_desc = reader.read_u16()?;
            let n_value = reader.read_word(is_64bit)?;

            // debugger entries and undefined references carry no usable address
            if n_type & N_STAB != 0 || n_type & N_TYPE != N_SECT {
                continue;
            }

            let Some(name) = read_cstring(strtab, n_strx, strtab.len()) else {
                continue;
            };
            if name.is_empty() {
                continue;
            }

            symbols.push(Symbol {
                name: name.to_string(),
                address: Address::new(n_value),
                size: None,
                symbol_type: SymbolType::Unknown,
            });
        }

        Ok(symbols)
    }
}

impl BinaryFile for MachOFile {
    fn format(&self) -> BinaryFormat {
        BinaryFormat::MachO
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
        self.text_base
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

    fn segment_command(name: &str, vmaddr: u64, vmsize: u64, fileoff: u64, filesize: u64, prot: u32) -> Vec<u8> {
        let mut cmd = Vec::new();
        cmd.extend_from_slice(&LC_SEGMENT_64.to_le_bytes());
        cmd.extend_from_slice(&72u32.to_le_bytes());
        let mut segname = [0u8; 16];
        segname[..name.len()].copy_from_slice(name.as_bytes());
        cmd.extend_from_slice(&segname);
        cmd.extend_from_slice(&vmaddr.to_le_bytes());
        cmd.extend_from_slice(&vmsize.to_le_bytes());
        cmd.extend_from_slice(&fileoff.to_le_bytes());
        cmd.extend_from_slice(&filesize.to_le_bytes());
        cmd.extend_from_slice(&prot.to_le_bytes());
        cmd.extend_from_slice(&prot.to_le_bytes());
        cmd.extend_from_slice(&0u32.to_le_bytes()); // nsects
        cmd.extend_from_slice(&0u32.to_le_bytes()); // flags
        cmd
    }

    fn thin_macho() -> Vec<u8> {
        let mut commands = Vec::new();
        commands.extend(segment_command("__PAGEZERO", 0, 0x1_0000_0000, 0, 0, 0));
        commands.extend(segment_command("__TEXT", 0x1_0000_0000, 0x1000, 0, 0x1000, VM_PROT_READ | VM_PROT_EXECUTE));
        commands.extend(segment_command("__DATA", 0x1_0000_1000, 0x1000, 0x1000, 0x800, VM_PROT_READ | VM_PROT_WRITE));
        commands.extend_from_slice(&LC_MAIN.to_le_bytes());
        commands.extend_from_slice(&24u32.to_le_bytes());
        commands.extend_from_slice(&0x400u64.to_le_bytes());
        commands.extend_from_slice(&0u64.to_le_bytes());

        let mut data = Vec::new();
        data.extend_from_slice(&MH_MAGIC_64.to_le_bytes());
        data.extend_from_slice(&CPU_TYPE_ARM64.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&6u32.to_le_bytes()); // MH_DYLIB
        data.extend_from_slice(&4u32.to_le_bytes());
        data.extend_from_slice(&(commands.len() as u32).to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend(commands);
        data.resize(0x1800, 0);
        data
    }

    /// Two-segment 32-bit ARM image in either byte order
    fn thin_macho32(little_endian: bool) -> Vec<u8> {
        let word = |value: u32| {
            if little_endian {
                value.to_le_bytes()
            } else {
                value.to_be_bytes()
            }
        };

        let mut commands = Vec::new();
        for (name, vmaddr, fileoff, filesize, prot) in [
            ("__TEXT", 0x4000u32, 0u32, 0x1000u32, VM_PROT_READ | VM_PROT_EXECUTE),
            ("__DATA", 0x5000, 0x1000, 0x400, VM_PROT_READ | VM_PROT_WRITE),
        ] {
            commands.extend(word(LC_SEGMENT));
            commands.extend(word(56));
            let mut segname = [0u8; 16];
            segname[..name.len()].copy_from_slice(name.as_bytes());
            commands.extend(segname);
            for value in [vmaddr, 0x1000, fileoff, filesize, prot, prot, 0, 0] {
                commands.extend(word(value));
            }
        }
        commands.extend(word(LC_MAIN));
        commands.extend(word(24));
        let entry = 0x200u64;
        commands.extend(if little_endian { entry.to_le_bytes() } else { entry.to_be_bytes() });
        commands.extend([0u8; 8]);

        let mut data = Vec::new();
        // Written in the image's byte order, MH_MAGIC reads back as MH_CIGAM on big-endian files
        for value in [MH_MAGIC, CPU_TYPE_ARM, 0, 6, 3, commands.len() as u32, 0] {
            data.extend(word(value));
        }
        data.extend(commands);
        data.resize(0x1400, 0);
        data
    }

    #[test]
    fn test_parse_thin() {
        let macho = MachOFile::parse(&thin_macho()).unwrap();
        assert_eq!(macho.architecture(), Architecture::Arm64);
        assert_eq!(macho.segments().len(), 2);
        assert_eq!(macho.segments()[0].name, "__TEXT");
        assert!(macho.segments()[0].is_executable());
        assert_eq!(macho.segments()[1].file_size, 0x800);
        assert_eq!(macho.image_base(), Address(0x1_0000_0000));
        assert_eq!(macho.entry_point(), Address(0x1_0000_0400));
    }

    #[test]
    fn test_parse_fat() {
        let thin = thin_macho();
        let slice_offset = 0x4000u32;

        let mut data = Vec::new();
        data.extend_from_slice(&FAT_MAGIC.to_be_bytes());
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(&CPU_TYPE_ARM64.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&slice_offset.to_be_bytes());
        data.extend_from_slice(&(thin.len() as u32).to_be_bytes());
        data.extend_from_slice(&14u32.to_be_bytes());
        data.resize(slice_offset as usize, 0);
        data.extend(thin);

        let macho = MachOFile::parse(&data).unwrap();
        assert_eq!(macho.segments().len(), 2);
        assert_eq!(macho.segments()[0].file_offset, slice_offset as u64);
        assert_eq!(macho.segments()[1].file_offset, slice_offset as u64 + 0x1000);
    }

    #[test]
    fn test_zero_cmdsize_rejected() {
        let mut data = thin_macho();
        // cmdsize of the first load command
        data[36..40].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(MachOFile::parse(&data), Err(ParseError::MalformedLayout(_))));
    }

    #[test]
    fn test_fat_slice_past_end() {
        let mut data = Vec::new();
        data.extend_from_slice(&FAT_MAGIC.to_be_bytes());
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(&CPU_TYPE_ARM64.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&0x1000u32.to_be_bytes());
        data.extend_from_slice(&0x1000u32.to_be_bytes());
        data.extend_from_slice(&14u32.to_be_bytes());
        assert!(matches!(
            MachOFile::parse(&data),
            Err(ParseError::TruncatedImage { structure: "universal slice", .. })
        ));
    }

    #[test]
    fn test_parse_thin_32bit_both_byte_orders() {
        for little_endian in [true, false] {
            let macho = MachOFile::parse(&thin_macho32(little_endian)).unwrap();
            assert_eq!(macho.architecture(), Architecture::Arm32);
            assert!(!macho.is_64bit());
            assert_eq!(macho.little_endian(), little_endian);
            assert_eq!(macho.segments().len(), 2);
            assert_eq!(macho.segments()[0].virtual_address, Address(0x4000));
            assert!(macho.segments()[0].is_executable());
            assert_eq!(macho.segments()[1].file_offset, 0x1000);
            assert_eq!(macho.segments()[1].file_size, 0x400);
            assert_eq!(macho.image_base(), Address(0x4000));
            assert_eq!(macho.entry_point(), Address(0x4200));
        }
    }

    #[test]
    fn test_fat_slice_segment_cannot_reach_past_slice() {
        let thin = thin_macho();
        let slice_offset = 0x4000u32;
        // The slice ends before __DATA does; the bytes after it belong to another slice
        let slice_size = 0x1400u32;

        let mut data = Vec::new();
        data.extend_from_slice(&FAT_MAGIC.to_be_bytes());
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(&CPU_TYPE_ARM64.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&slice_offset.to_be_bytes());
        data.extend_from_slice(&slice_size.to_be_bytes());
        data.extend_from_slice(&14u32.to_be_bytes());
        data.resize(slice_offset as usize, 0);
        data.extend(thin);
        data.resize(data.len() + 0x1000, 0xAA);

        assert!(matches!(
            MachOFile::parse(&data),
            Err(ParseError::TruncatedImage { structure: "segment", .. })
        ));
    }
}
