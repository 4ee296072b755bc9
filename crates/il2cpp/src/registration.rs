//! Locating and reading the code registration structure in an image

use crate::metadata::Metadata;
use atlas_binary_parser::{BinaryImage, BinaryReader};
use atlas_core::{Address, Error, MetadataVersion};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Symbol exported by unstripped builds
pub const CODE_REGISTRATION_SYMBOL: &str = "g_CodeRegistration";

/// Longest module name accepted while validating a candidate
const MAX_MODULE_NAME: usize = 1024;
/// Upper bounds that reject garbage counts before anything is allocated
const MAX_MODULES: u64 = 0x10000;
const MAX_METHOD_POINTERS: u64 = 0x100_0000;

/// One pointer-sized word of the code registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationField {
    MethodPointersCount,
    MethodPointers,
    ReversePInvokeWrapperCount,
    ReversePInvokeWrappers,
    GenericMethodPointersCount,
    GenericMethodPointers,
    GenericAdjustorThunks,
    InvokerPointersCount,
    InvokerPointers,
    CustomAttributeCount,
    CustomAttributeGenerators,
    UnresolvedVirtualCallCount,
    UnresolvedVirtualCallPointers,
    UnresolvedInstanceCallPointers,
    UnresolvedStaticCallPointers,
    InteropDataCount,
    InteropData,
    WindowsRuntimeFactoryCount,
    WindowsRuntimeFactoryTable,
    CodeGenModulesCount,
    CodeGenModules,
}

/// Word layout of the code registration for one metadata version
#[derive(Debug, Clone)]
pub struct RegistrationLayout {
    fields: Vec<RegistrationField>,
}

const V24_2: MetadataVersion = MetadataVersion::new(24, 2);
const V27_1: MetadataVersion = MetadataVersion::new(27, 1);
const V29: MetadataVersion = MetadataVersion::new(29, 0);
const V29_1: MetadataVersion = MetadataVersion::new(29, 1);

impl RegistrationLayout {
    pub fn for_version(version: MetadataVersion) -> Self {
        use RegistrationField::*;

        let mut fields = Vec::with_capacity(22);
        if version < V24_2 {
            fields.extend([MethodPointersCount, MethodPointers]);
        }
        fields.extend([
            ReversePInvokeWrapperCount,
            ReversePInvokeWrappers,
            GenericMethodPointersCount,
            GenericMethodPointers,
        ]);
        if version >= V27_1 {
            fields.push(GenericAdjustorThunks);
        }
        fields.extend([InvokerPointersCount, InvokerPointers]);
        if version < V29 {
            fields.extend([CustomAttributeCount, CustomAttributeGenerators]);
        }
        fields.extend([UnresolvedVirtualCallCount, UnresolvedVirtualCallPointers]);
        if version >= V29_1 {
            fields.extend([UnresolvedInstanceCallPointers, UnresolvedStaticCallPointers]);
        }
        fields.extend([InteropDataCount, InteropData]);
        if version >= V24_2 {
            fields.extend([
                WindowsRuntimeFactoryCount,
                WindowsRuntimeFactoryTable,
                CodeGenModulesCount,
                CodeGenModules,
            ]);
        }

        Self { fields }
    }

    /// Word index of a field, if this version has it
    pub fn word_index(&self, field: RegistrationField) -> Option<usize> {
        self.fields.iter().position(|&f| f == field)
    }

    pub fn word_count(&self) -> usize {
        self.fields.len()
    }

    /// Per-module pointer tables replace the global table from 24.2 on
    pub fn has_code_gen_modules(&self) -> bool {
        self.word_index(RegistrationField::CodeGenModules).is_some()
    }
}

/// How the registration was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStrategy {
    /// Address supplied by configuration
    Manual,
    /// `g_CodeRegistration` in the symbol table
    Symbol,
    /// Data-segment scan for the module count
    PlusSearch,
}

/// Per-assembly method pointer table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeGenModule {
    pub name: String,
    /// Raw slots in token order
    pub method_pointers: Vec<u64>,
}

/// The parts of the code registration the resolver uses
#[derive(Debug, Clone)]
pub struct CodeRegistration {
    pub address: Address,
    pub strategy: SearchStrategy,
    /// Global table indexed by `methodIndex` (before 24.2)
    pub method_pointers: Vec<u64>,
    pub modules: Vec<CodeGenModule>,
}

/// Locate the code registration: manual address, then symbol, then plus search
///
/// Never fatal. A manual address that does not validate is recorded as an
/// issue and the automatic strategies run anyway.
pub fn find_code_registration(
    image: &BinaryImage,
    metadata: &Metadata,
    manual: Option<Address>,
    issues: &mut Vec<Error>,
) -> Option<CodeRegistration> {
    let searcher = RegistrationSearch::new(image, metadata);

    if let Some(address) = manual {
        match searcher.read(address, SearchStrategy::Manual) {
            Ok(registration) => {
                info!("Using code registration at {} from configuration", address);
                return Some(registration);
            }
            Err(reason) => {
                warn!("Configured code registration at {} is invalid: {}", address, reason);
                issues.push(Error::AddressOutOfBounds {
                    address,
                    what: format!("configured code registration ({reason})"),
                });
            }
        }
    }

    if let Some(registration) = searcher.symbol_search() {
        info!("Found code registration via symbol at {}", registration.address);
        return Some(registration);
    }

    if let Some(registration) = searcher.plus_search() {
        info!("Found code registration via plus search at {}", registration.address);
        return Some(registration);
    }

    warn!("Could not locate the code registration; heuristic resolution disabled");
    None
}

struct RegistrationSearch<'a> {
    image: &'a BinaryImage,
    layout: RegistrationLayout,
    image_names: HashSet<&'a str>,
}

impl<'a> RegistrationSearch<'a> {
    fn new(image: &'a BinaryImage, metadata: &'a Metadata) -> Self {
        let image_names = metadata
            .image_definitions
            .iter()
            .filter_map(|def| metadata.get_string(def.name))
            .collect();

        Self {
            image,
            layout: RegistrationLayout::for_version(metadata.version),
            image_names,
        }
    }

    fn symbol_search(&self) -> Option<CodeRegistration> {
        let symbol = self
            .image
            .symbols()
            .iter()
            .find(|s| s.name.strip_prefix('_').unwrap_or(&s.name) == CODE_REGISTRATION_SYMBOL)?;
        debug!("Found {} at {}", symbol.name, symbol.address);

        match self.read(symbol.address, SearchStrategy::Symbol) {
            Ok(registration) => Some(registration),
            Err(reason) => {
                warn!("Symbol {} does not point at a valid registration: {}", symbol.name, reason);
                None
            }
        }
    }

    /// Scan non-executable segments for the module count and validate each hit
    fn plus_search(&self) -> Option<CodeRegistration> {
        let count_word = self.layout.word_index(RegistrationField::CodeGenModulesCount)?;
        let expected = self.image_names.len() as u64;
        if expected == 0 {
            return None;
        }

        let ptr_size = self.image.pointer_size();
        let back = (count_word * ptr_size) as u64;

        for segment in self.image.segments().iter().filter(|s| !s.is_executable() && s.file_size > 0) {
            let Ok(bytes) = self.image.bytes_from(segment.virtual_address) else {
                continue;
            };
            debug!("Plus search in {} ({} bytes)", segment.name, bytes.len());

            let mut pos = 0usize;
            while pos + ptr_size <= bytes.len() {
                let word = BinaryReader::new_at(bytes, pos, self.image.little_endian(), "registration scan")
                    .read_word(self.image.is_64bit())
                    .ok();
                if word == Some(expected) {
                    let candidate = segment
                        .virtual_address
                        .checked_add(pos as u64)
                        .and_then(|at| at.as_u64().checked_sub(back))
                        .map(Address::new);
                    if let Some(candidate) = candidate {
                        match self.read(candidate, SearchStrategy::PlusSearch) {
                            Ok(registration) => return Some(registration),
                            Err(reason) => debug!("Rejected candidate {}: {}", candidate, reason),
                        }
                    }
                }
                pos += ptr_size;
            }
        }

        None
    }

    /// Read and validate a registration at `address`
    fn read(&self, address: Address, strategy: SearchStrategy) -> std::result::Result<CodeRegistration, String> {
        let words = self
            .image
            .read_pointers(address, self.layout.word_count())
            .map_err(|e| e.to_string())?;
        let word = |field| self.layout.word_index(field).map(|i| words[i]).unwrap_or(0);

        let mut registration = CodeRegistration {
            address,
            strategy,
            method_pointers: Vec::new(),
            modules: Vec::new(),
        };

        if self.layout.has_code_gen_modules() {
            let count = word(RegistrationField::CodeGenModulesCount);
            if count == 0 || count > MAX_MODULES {
                return Err(format!("implausible module count {count}"));
            }
            let module_ptrs = self
                .image
                .read_pointers(Address::new(word(RegistrationField::CodeGenModules)), count as usize)
                .map_err(|e| e.to_string())?;

            for module_ptr in module_ptrs {
                registration.modules.push(self.read_module(Address::new(module_ptr))?);
            }
        } else {
            let count = word(RegistrationField::MethodPointersCount);
            registration.method_pointers =
                self.read_pointer_table(word(RegistrationField::MethodPointers), count)?;
        }

        Ok(registration)
    }

    fn read_module(&self, address: Address) -> std::result::Result<CodeGenModule, String> {
        let header = self.image.read_pointers(address, 3).map_err(|e| e.to_string())?;
        let name = self
            .image
            .read_cstring_va(Address::new(header[0]), MAX_MODULE_NAME)
            .map_err(|e| e.to_string())?;
        if !self.image_names.contains(name) {
            return Err(format!("module name {name:?} is not a metadata image"));
        }

        Ok(CodeGenModule {
            name: name.to_string(),
            method_pointers: self.read_pointer_table(header[2], header[1])?,
        })
    }

    fn read_pointer_table(&self, address: u64, count: u64) -> std::result::Result<Vec<u64>, String> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if count > MAX_METHOD_POINTERS {
            return Err(format!("implausible pointer count {count}"));
        }
        self.image
            .read_pointers(Address::new(address), count as usize)
            .map_err(|e| e.to_string())
    }
}
