//! Synthetic image builders for tests

use crate::common::Permissions;

const EM_AARCH64: u16 = 183;

struct PendingSegment {
    address: u64,
    permissions: Permissions,
    bytes: Vec<u8>,
    virtual_size: u64,
}

/// Field encoder for one ELF class and byte order
#[derive(Clone, Copy)]
struct Encoding {
    is_64bit: bool,
    little_endian: bool,
}

impl Encoding {
    fn u16(self, out: &mut Vec<u8>, value: u16) {
        if self.little_endian {
            out.extend_from_slice(&value.to_le_bytes());
        } else {
            out.extend_from_slice(&value.to_be_bytes());
        }
    }

    fn u32(self, out: &mut Vec<u8>, value: u32) {
        if self.little_endian {
            out.extend_from_slice(&value.to_le_bytes());
        } else {
            out.extend_from_slice(&value.to_be_bytes());
        }
    }

    fn u64(self, out: &mut Vec<u8>, value: u64) {
        if self.little_endian {
            out.extend_from_slice(&value.to_le_bytes());
        } else {
            out.extend_from_slice(&value.to_be_bytes());
        }
    }

    /// Address-sized field; truncated to 32 bits for ELF32
    fn word(self, out: &mut Vec<u8>, value: u64) {
        if self.is_64bit {
            self.u64(out, value);
        } else {
            self.u32(out, value as u32);
        }
    }

    fn header_size(self) -> usize {
        if self.is_64bit { 64 } else { 52 }
    }

    fn program_header_size(self) -> usize {
        if self.is_64bit { 56 } else { 32 }
    }

    fn section_header_size(self) -> usize {
        if self.is_64bit { 64 } else { 40 }
    }

    fn symbol_size(self) -> usize {
        if self.is_64bit { 24 } else { 16 }
    }
}

/// Builds a minimal ELF image, ELF64 little-endian unless told otherwise
///
/// Segments are laid out in the file in the order they are added.
pub struct ElfBuilder {
    machine: u16,
    encoding: Encoding,
    entry: u64,
    segments: Vec<PendingSegment>,
    symbols: Vec<(String, u64)>,
}

impl Default for ElfBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ElfBuilder {
    pub fn new() -> Self {
        Self {
            machine: EM_AARCH64,
            encoding: Encoding {
                is_64bit: true,
                little_endian: true,
            },
            entry: 0,
            segments: Vec::new(),
            symbols: Vec::new(),
        }
    }

    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    /// Emit ELFCLASS32 headers, symbols and addresses
    pub fn elf32(mut self) -> Self {
        self.encoding.is_64bit = false;
        self
    }

    /// Emit ELFDATA2MSB fields
    pub fn big_endian(mut self) -> Self {
        self.encoding.little_endian = false;
        self
    }

    pub fn entry(mut self, address: u64) -> Self {
        self.entry = address;
        self
    }

    /// Add a PT_LOAD segment whose memory size equals its file size
    pub fn segment(self, address: u64, permissions: Permissions, bytes: Vec<u8>) -> Self {
        let size = bytes.len() as u64;
        self.segment_with_size(address, permissions, bytes, size)
    }

    /// Add a PT_LOAD segment with a zero-filled tail
    pub fn segment_with_size(mut self, address: u64, permissions: Permissions, bytes: Vec<u8>, virtual_size: u64) -> Self {
        self.segments.push(PendingSegment {
            address,
            permissions,
            bytes,
            virtual_size,
        });
        self
    }

    /// Add a defined object symbol
    pub fn symbol(mut self, name: &str, address: u64) -> Self {
        self.symbols.push((name.to_string(), address));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let enc = self.encoding;
        let ph_offset = enc.header_size();
        let ph_size = enc.program_header_size();
        let mut out = vec![0u8; ph_offset + self.segments.len() * ph_size];

        let mut placements = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            align(&mut out, 16);
            placements.push(out.len());
            out.extend_from_slice(&segment.bytes);
        }

        let mut sh_offset = 0usize;
        let mut sh_num = 0u16;
        if !self.symbols.is_empty() {
            let mut strtab = vec![0u8];
            let mut symtab = vec![0u8; enc.symbol_size()];
            for (name, address) in &self.symbols {
                let name_offset = strtab.len() as u32;
                strtab.extend_from_slice(name.as_bytes());
                strtab.push(0);

                enc.u32(&mut symtab, name_offset);
                if enc.is_64bit {
                    symtab.push(1); // STT_OBJECT
                    symtab.push(0);
                    enc.u16(&mut symtab, 1);
                    enc.u64(&mut symtab, *address);
                    enc.u64(&mut symtab, 8);
                } else {
                    enc.u32(&mut symtab, *address as u32);
                    enc.u32(&mut symtab, 4);
                    symtab.push(1); // STT_OBJECT
                    symtab.push(0);
                    enc.u16(&mut symtab, 1);
                }
            }

            align(&mut out, 8);
            let symtab_offset = out.len();
            out.extend_from_slice(&symtab);
            let strtab_offset = out.len();
            out.extend_from_slice(&strtab);

            align(&mut out, 8);
            sh_offset = out.len();
            sh_num = 3;
            out.resize(out.len() + enc.section_header_size(), 0);
            section_header(&mut out, enc, 2, symtab_offset, symtab.len(), 2, enc.symbol_size() as u64);
            section_header(&mut out, enc, 3, strtab_offset, strtab.len(), 0, 0);
        }

        let mut header = Vec::with_capacity(ph_offset);
        header.extend_from_slice(b"\x7FELF");
        header.push(if enc.is_64bit { 2 } else { 1 }); // EI_CLASS
        header.push(if enc.little_endian { 1 } else { 2 }); // EI_DATA
        header.push(1);
        header.resize(16, 0);
        enc.u16(&mut header, 3); // ET_DYN
        enc.u16(&mut header, self.machine);
        enc.u32(&mut header, 1);
        enc.word(&mut header, self.entry);
        enc.word(&mut header, ph_offset as u64);
        enc.word(&mut header, sh_offset as u64);
        enc.u32(&mut header, 0);
        enc.u16(&mut header, ph_offset as u16);
        enc.u16(&mut header, ph_size as u16);
        enc.u16(&mut header, self.segments.len() as u16);
        enc.u16(&mut header, enc.section_header_size() as u16);
        enc.u16(&mut header, sh_num);
        enc.u16(&mut header, 0);
        out[..ph_offset].copy_from_slice(&header);

        for (i, (segment, &file_offset)) in self.segments.iter().zip(&placements).enumerate() {
            let mut flags = 0u32;
            if segment.permissions.contains(Permissions::EXECUTE) {
                flags |= 0x1;
            }
            if segment.permissions.contains(Permissions::WRITE) {
                flags |= 0x2;
            }
            if segment.permissions.contains(Permissions::READ) {
                flags |= 0x4;
            }

            let mut entry = Vec::with_capacity(ph_size);
            enc.u32(&mut entry, 1); // PT_LOAD
            // p_flags follows p_type in ELF64 and p_memsz in ELF32
            if enc.is_64bit {
                enc.u32(&mut entry, flags);
            }
            enc.word(&mut entry, file_offset as u64);
            enc.word(&mut entry, segment.address);
            enc.word(&mut entry, segment.address);
            enc.word(&mut entry, segment.bytes.len() as u64);
            enc.word(&mut entry, segment.virtual_size);
            if !enc.is_64bit {
                enc.u32(&mut entry, flags);
            }
            enc.word(&mut entry, 0x1000);

            let at = ph_offset + i * ph_size;
            out[at..at + ph_size].copy_from_slice(&entry);
        }

        out
    }
}

fn align(out: &mut Vec<u8>, to: usize) {
    while out.len() % to != 0 {
        out.push(0);
    }
}

fn section_header(out: &mut Vec<u8>, enc: Encoding, sh_type: u32, offset: usize, size: usize, link: u32, entsize: u64) {
    enc.u32(out, 0);
    enc.u32(out, sh_type);
    enc.word(out, 0);
    enc.word(out, 0);
    enc.word(out, offset as u64);
    enc.word(out, size as u64);
    enc.u32(out, link);
    enc.u32(out, 0);
    enc.word(out, 0);
    enc.word(out, entsize);
}
