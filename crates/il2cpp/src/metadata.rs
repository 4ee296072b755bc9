//! IL2CPP global-metadata.dat parser

use crate::layout::{HeaderSlot, MetadataLayout};
use crate::types::*;
use atlas_binary_parser::ByteBuffer;
use atlas_core::{Error, MetadataVersion, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use rayon::prelude::*;
use std::io::{self, Cursor};
use std::path::Path;
use tracing::{debug, info, warn, Span};

/// Declared location of one table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableRange {
    pub offset: u32,
    pub size: u32,
}

impl TableRange {
    pub fn start(&self) -> usize {
        self.offset as usize
    }

    pub fn end(&self) -> usize {
        self.offset as usize + self.size as usize
    }
}

/// Global metadata header
#[derive(Debug, Clone)]
pub struct MetadataHeader {
    pub sanity: u32,
    /// Integer version as declared by the file
    pub declared_version: u32,
    tables: Vec<(HeaderSlot, TableRange)>,
}

impl MetadataHeader {
    /// Range of a table, empty when the layout has no such slot
    pub fn range(&self, slot: HeaderSlot) -> TableRange {
        self.tables
            .iter()
            .find(|(s, _)| *s == slot)
            .map(|(_, range)| *range)
            .unwrap_or_default()
    }
}

/// Zero-copy view over the identifier heap
#[derive(Debug, Clone)]
pub struct StringTable {
    data: ByteBuffer,
    start: usize,
    end: usize,
}

impl StringTable {
    fn new(data: ByteBuffer, range: TableRange) -> Self {
        Self {
            data,
            start: range.start(),
            end: range.end(),
        }
    }

    fn heap(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Resolve a reference, `None` when it is not a valid heap string
    pub fn get(&self, string: StringRef) -> Option<&str> {
        self.check(string).ok()
    }

    fn check(&self, string: StringRef) -> std::result::Result<&str, String> {
        let heap = self.heap();
        let tail = heap
            .get(string.0 as usize..)
            .filter(|tail| !tail.is_empty())
            .ok_or_else(|| format!("name offset {:#x} outside string heap of {} bytes", string.0, heap.len()))?;
        let len = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| format!("name at {:#x} is not NUL-terminated", string.0))?;
        std::str::from_utf8(&tail[..len]).map_err(|_| format!("name at {:#x} is not valid UTF-8", string.0))
    }
}

/// Parsed IL2CPP metadata
pub struct Metadata {
    /// Raw metadata bytes
    data: ByteBuffer,
    /// Metadata header
    pub header: MetadataHeader,
    /// Selected version tag
    pub version: MetadataVersion,
    /// Layout strategy for `version`
    pub layout: MetadataLayout,
    /// Identifier heap
    pub strings: StringTable,
    pub type_definitions: Vec<Il2CppTypeDefinition>,
    pub method_definitions: Vec<Il2CppMethodDefinition>,
    pub parameter_definitions: Vec<Il2CppParameterDefinition>,
    pub field_definitions: Vec<Il2CppFieldDefinition>,
    pub field_default_values: Vec<Il2CppFieldDefaultValue>,
    pub generic_containers: Vec<Il2CppGenericContainer>,
    pub generic_parameters: Vec<Il2CppGenericParameter>,
    pub generic_parameter_constraints: Vec<i32>,
    pub nested_types: Vec<i32>,
    pub interfaces: Vec<i32>,
    pub image_definitions: Vec<Il2CppImageDefinition>,
    /// Type usages
    pub types: Vec<Il2CppType>,
    pub generic_classes: Vec<Il2CppGenericClass>,
    pub generic_insts: Vec<Il2CppGenericInst>,
    pub generic_inst_args: Vec<i32>,
    pub method_specs: Vec<Il2CppMethodSpec>,
    pub method_addresses: Vec<u64>,
    pub generic_method_table: Vec<Il2CppGenericMethodTableEntry>,
    pub generic_method_pointers: Vec<u64>,
    pub field_offsets: Vec<i32>,
}

/// One parsed table, produced by an independent worker task
enum ParsedTable {
    TypeDefinitions(Vec<Il2CppTypeDefinition>),
    Methods(Vec<Il2CppMethodDefinition>),
    Parameters(Vec<Il2CppParameterDefinition>),
    Fields(Vec<Il2CppFieldDefinition>),
    FieldDefaultValues(Vec<Il2CppFieldDefaultValue>),
    GenericContainers(Vec<Il2CppGenericContainer>),
    GenericParameters(Vec<Il2CppGenericParameter>),
    GenericParameterConstraints(Vec<i32>),
    NestedTypes(Vec<i32>),
    Interfaces(Vec<i32>),
    Images(Vec<Il2CppImageDefinition>),
    Types(Vec<Il2CppType>),
    GenericClasses(Vec<Il2CppGenericClass>),
    GenericInsts(Vec<Il2CppGenericInst>),
    GenericInstArgs(Vec<i32>),
    MethodSpecs(Vec<Il2CppMethodSpec>),
    MethodAddresses(Vec<u64>),
    GenericMethodTable(Vec<Il2CppGenericMethodTableEntry>),
    GenericMethodPointers(Vec<u64>),
    FieldOffsets(Vec<i32>),
    /// Byte heaps need no record parsing
    Heap,
}

/// Shared read-only state for the table tasks
struct TableReader<'a> {
    data: &'a [u8],
    header: &'a MetadataHeader,
    layout: &'a MetadataLayout,
    strings: &'a StringTable,
}

impl Metadata {
    /// Read and parse a metadata file
    pub fn load(path: &Path, version_override: Option<MetadataVersion>) -> Result<Self> {
        info!("Loading metadata from {:?}", path);
        let data = ByteBuffer::map_file(path)?;
        Self::parse(data, version_override)
    }

    /// Parse IL2CPP metadata
    ///
    /// Tables are parsed concurrently on the current rayon pool; cross-table
    /// references are left for the graph builder.
    pub fn parse(data: ByteBuffer, version_override: Option<MetadataVersion>) -> Result<Self> {
        if let Some(version) = version_override {
            if !is_supported_version(version) {
                return Err(Error::UnsupportedMetadataVersion(version));
            }
        }

        let (header, layout) = Self::read_header(&data, version_override)?;
        let version = layout.version;
        info!("Parsing IL2CPP metadata version {}", version);

        let strings = StringTable::new(data.clone(), header.range(HeaderSlot::Strings));
        let reader = TableReader {
            data: &data,
            header: &header,
            layout: &layout,
            strings: &strings,
        };

        let span = Span::current();
        let results: Vec<Result<ParsedTable>> = layout
            .header_slots()
            .par_iter()
            .map(|&slot| span.in_scope(|| reader.parse_table(slot)))
            .collect();

        let mut metadata = Self {
            data: data.clone(),
            header: header.clone(),
            version,
            layout: layout.clone(),
            strings: strings.clone(),
            type_definitions: Vec::new(),
            method_definitions: Vec::new(),
            parameter_definitions: Vec::new(),
            field_definitions: Vec::new(),
            field_default_values: Vec::new(),
            generic_containers: Vec::new(),
            generic_parameters: Vec::new(),
            generic_parameter_constraints: Vec::new(),
            nested_types: Vec::new(),
            interfaces: Vec::new(),
            image_definitions: Vec::new(),
            types: Vec::new(),
            generic_classes: Vec::new(),
            generic_insts: Vec::new(),
            generic_inst_args: Vec::new(),
            method_specs: Vec::new(),
            method_addresses: Vec::new(),
            generic_method_table: Vec::new(),
            generic_method_pointers: Vec::new(),
            field_offsets: Vec::new(),
        };

        // Report the first failure in header order, whichever task finished first
        for result in results {
            match result? {
                ParsedTable::TypeDefinitions(t) => metadata.type_definitions = t,
                ParsedTable::Methods(t) => metadata.method_definitions = t,
                ParsedTable::Parameters(t) => metadata.parameter_definitions = t,
                ParsedTable::Fields(t) => metadata.field_definitions = t,
                ParsedTable::FieldDefaultValues(t) => metadata.field_default_values = t,
                ParsedTable::GenericContainers(t) => metadata.generic_containers = t,
                ParsedTable::GenericParameters(t) => metadata.generic_parameters = t,
                ParsedTable::GenericParameterConstraints(t) => metadata.generic_parameter_constraints = t,
                ParsedTable::NestedTypes(t) => metadata.nested_types = t,
                ParsedTable::Interfaces(t) => metadata.interfaces = t,
                ParsedTable::Images(t) => metadata.image_definitions = t,
                ParsedTable::Types(t) => metadata.types = t,
                ParsedTable::GenericClasses(t) => metadata.generic_classes = t,
                ParsedTable::GenericInsts(t) => metadata.generic_insts = t,
                ParsedTable::GenericInstArgs(t) => metadata.generic_inst_args = t,
                ParsedTable::MethodSpecs(t) => metadata.method_specs = t,
                ParsedTable::MethodAddresses(t) => metadata.method_addresses = t,
                ParsedTable::GenericMethodTable(t) => metadata.generic_method_table = t,
                ParsedTable::GenericMethodPointers(t) => metadata.generic_method_pointers = t,
                ParsedTable::FieldOffsets(t) => metadata.field_offsets = t,
                ParsedTable::Heap => {}
            }
        }

        info!(
            "Parsed {} types, {} methods, {} fields, {} images",
            metadata.type_definitions.len(),
            metadata.method_definitions.len(),
            metadata.field_definitions.len(),
            metadata.image_definitions.len()
        );

        Ok(metadata)
    }

    fn read_header(data: &[u8], version_override: Option<MetadataVersion>) -> Result<(MetadataHeader, MetadataLayout)> {
        let len = data.len() as u64;
        if data.len() < 8 {
            return Err(Error::TruncatedMetadata {
                table: "header",
                offset: 0,
                size: 8,
                len,
            });
        }

        let mut cursor = Cursor::new(data);

        let sanity = cursor.read_u32::<LittleEndian>()?;
        if sanity != METADATA_MAGIC {
            return Err(Error::InvalidSignature {
                expected: METADATA_MAGIC,
                actual: sanity,
            });
        }

        let declared_version = cursor.read_u32::<LittleEndian>()?;
        let version = select_version(declared_version, version_override)?;
        let layout = MetadataLayout::for_version(version)?;

        if data.len() < layout.header_size() {
            return Err(Error::TruncatedMetadata {
                table: "header",
                offset: 0,
                size: layout.header_size() as u64,
                len,
            });
        }

        let mut tables = Vec::with_capacity(layout.header_slots().len());
        for &slot in layout.header_slots() {
            let offset = cursor.read_u32::<LittleEndian>()?;
            let size = cursor.read_u32::<LittleEndian>()?;

            if offset as u64 + size as u64 > len {
                return Err(Error::TruncatedMetadata {
                    table: slot.table_name(),
                    offset: offset as u64,
                    size: size as u64,
                    len,
                });
            }

            debug!("{}: {:#x} (+{:#x})", slot.table_name(), offset, size);
            tables.push((slot, TableRange { offset, size }));
        }

        Ok((
            MetadataHeader {
                sanity,
                declared_version,
                tables,
            },
            layout,
        ))
    }

    /// Raw bytes of the whole blob
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Bytes of the default-value heap starting at `data_index`
    pub fn default_value_bytes(&self, data_index: i32) -> Option<&[u8]> {
        let range = self.header.range(HeaderSlot::DefaultValueData);
        let heap = &self.data[range.start()..range.end()];
        heap.get(usize::try_from(data_index).ok()?..)
    }

    /// Resolve a heap string
    pub fn get_string(&self, string: StringRef) -> Option<&str> {
        self.strings.get(string)
    }
}

/// Map the header's integer version and an optional override onto a supported tag
pub fn select_version(declared: u32, version_override: Option<MetadataVersion>) -> Result<MetadataVersion> {
    if let Some(version) = version_override {
        if !is_supported_version(version) {
            return Err(Error::UnsupportedMetadataVersion(version));
        }
        if version.major != declared {
            warn!("Version override {} does not match declared version {}", version, declared);
        }
        return Ok(version);
    }

    let version = MetadataVersion::new(declared, 0);
    if !is_supported_version(version) {
        return Err(Error::UnsupportedMetadataVersion(version));
    }
    Ok(version)
}

impl TableReader<'_> {
    fn parse_table(&self, slot: HeaderSlot) -> Result<ParsedTable> {
        let layout = self.layout;
        let table = match slot {
            HeaderSlot::TypeDefinitions => {
                let defs = self.read_records(slot, |c| read_type_definition(c, layout))?;
                for (i, def) in defs.iter().enumerate() {
                    self.check_name(slot, i, def.name)?;
                    self.check_name(slot, i, def.namespace)?;
                }
                ParsedTable::TypeDefinitions(defs)
            }
            HeaderSlot::Methods => {
                let defs = self.read_records(slot, |c| read_method_definition(c, layout))?;
                for (i, def) in defs.iter().enumerate() {
                    self.check_name(slot, i, def.name)?;
                }
                ParsedTable::Methods(defs)
            }
            HeaderSlot::Parameters => {
                let defs = self.read_records(slot, |c| read_parameter_definition(c, layout))?;
                for (i, def) in defs.iter().enumerate() {
                    self.check_name(slot, i, def.name)?;
                }
                ParsedTable::Parameters(defs)
            }
            HeaderSlot::Fields => {
                let defs = self.read_records(slot, |c| read_field_definition(c, layout))?;
                for (i, def) in defs.iter().enumerate() {
                    self.check_name(slot, i, def.name)?;
                }
                ParsedTable::Fields(defs)
            }
            HeaderSlot::GenericParameters => {
                let defs = self.read_records(slot, read_generic_parameter)?;
                for (i, def) in defs.iter().enumerate() {
                    self.check_name(slot, i, def.name)?;
                }
                ParsedTable::GenericParameters(defs)
            }
            HeaderSlot::Images => {
                let defs = self.read_records(slot, |c| read_image_definition(c, layout))?;
                for (i, def) in defs.iter().enumerate() {
                    self.check_name(slot, i, def.name)?;
                }
                ParsedTable::Images(defs)
            }
            HeaderSlot::FieldDefaultValues => ParsedTable::FieldDefaultValues(self.read_records(slot, |c| {
                Ok(Il2CppFieldDefaultValue {
                    field_index: c.read_i32::<LittleEndian>()?,
                    type_index: c.read_i32::<LittleEndian>()?,
                    data_index: c.read_i32::<LittleEndian>()?,
                })
            })?),
            HeaderSlot::GenericContainers => ParsedTable::GenericContainers(self.read_records(slot, |c| {
                Ok(Il2CppGenericContainer {
                    owner_index: c.read_i32::<LittleEndian>()?,
                    type_argc: c.read_i32::<LittleEndian>()?,
                    is_method: c.read_i32::<LittleEndian>()?,
                    generic_parameter_start: c.read_i32::<LittleEndian>()?,
                })
            })?),
            HeaderSlot::Types => ParsedTable::Types(self.read_records(slot, |c| {
                Ok(Il2CppType {
                    data: c.read_i32::<LittleEndian>()?,
                    attrs: c.read_u16::<LittleEndian>()?,
                    kind: c.read_u8()?,
                    bits: c.read_u8()?,
                })
            })?),
            HeaderSlot::GenericClasses => ParsedTable::GenericClasses(self.read_records(slot, |c| {
                Ok(Il2CppGenericClass {
                    type_definition_index: c.read_i32::<LittleEndian>()?,
                    class_inst_index: c.read_i32::<LittleEndian>()?,
                })
            })?),
            HeaderSlot::GenericInsts => ParsedTable::GenericInsts(self.read_records(slot, |c| {
                Ok(Il2CppGenericInst {
                    arg_start: c.read_i32::<LittleEndian>()?,
                    arg_count: c.read_i32::<LittleEndian>()?,
                })
            })?),
            HeaderSlot::MethodSpecs => ParsedTable::MethodSpecs(self.read_records(slot, |c| {
                Ok(Il2CppMethodSpec {
                    method_definition_index: c.read_i32::<LittleEndian>()?,
                    class_inst_index: c.read_i32::<LittleEndian>()?,
                    method_inst_index: c.read_i32::<LittleEndian>()?,
                })
            })?),
            HeaderSlot::GenericMethodTable => ParsedTable::GenericMethodTable(self.read_records(slot, |c| {
                Ok(Il2CppGenericMethodTableEntry {
                    method_spec_index: c.read_i32::<LittleEndian>()?,
                    pointer_index: c.read_i32::<LittleEndian>()?,
                })
            })?),
            HeaderSlot::GenericParameterConstraints => {
                ParsedTable::GenericParameterConstraints(self.read_records(slot, read_index)?)
            }
            HeaderSlot::NestedTypes => ParsedTable::NestedTypes(self.read_records(slot, read_index)?),
            HeaderSlot::Interfaces => ParsedTable::Interfaces(self.read_records(slot, read_index)?),
            HeaderSlot::GenericInstArgs => ParsedTable::GenericInstArgs(self.read_records(slot, read_index)?),
            HeaderSlot::FieldOffsets => ParsedTable::FieldOffsets(self.read_records(slot, read_index)?),
            HeaderSlot::MethodAddresses => ParsedTable::MethodAddresses(self.read_records(slot, read_pointer)?),
            HeaderSlot::GenericMethodPointers => {
                ParsedTable::GenericMethodPointers(self.read_records(slot, read_pointer)?)
            }
            HeaderSlot::Strings
            | HeaderSlot::DefaultValueData
            | HeaderSlot::RgctxEntries
            | HeaderSlot::AttributeData
            | HeaderSlot::AttributeDataRanges => ParsedTable::Heap,
        };

        Ok(table)
    }

    /// Split a table into fixed-size records and decode each one
    fn read_records<T>(
        &self,
        slot: HeaderSlot,
        read: impl Fn(&mut Cursor<&[u8]>) -> io::Result<T>,
    ) -> Result<Vec<T>> {
        let table = slot.table_name();
        let range = self.header.range(slot);
        let record_size = self
            .layout
            .record_size(slot)
            .ok_or_else(|| Error::malformed_table(table, 0, range.offset as u64, "table has no fixed record size"))?;

        let count = range.size as usize / record_size;
        if range.size as usize % record_size != 0 {
            return Err(Error::malformed_table(
                table,
                count,
                range.offset as u64 + (count * record_size) as u64,
                format!("table size {} is not a multiple of record size {}", range.size, record_size),
            ));
        }

        let bytes = &self.data[range.start()..range.end()];
        let records = bytes
            .chunks_exact(record_size)
            .enumerate()
            .map(|(i, chunk)| {
                read(&mut Cursor::new(chunk)).map_err(|e| {
                    Error::malformed_table(table, i, range.offset as u64 + (i * record_size) as u64, e.to_string())
                })
            })
            .collect::<Result<Vec<T>>>()?;

        debug!("{}: {} records", table, records.len());
        Ok(records)
    }

    fn check_name(&self, slot: HeaderSlot, record: usize, name: StringRef) -> Result<()> {
        self.strings.check(name).map(|_| ()).map_err(|reason| {
            let range = self.header.range(slot);
            let record_size = self.layout.record_size(slot).unwrap_or(0);
            Error::malformed_table(
                slot.table_name(),
                record,
                range.offset as u64 + (record * record_size) as u64,
                reason,
            )
        })
    }
}

fn read_index(c: &mut Cursor<&[u8]>) -> io::Result<i32> {
    c.read_i32::<LittleEndian>()
}

fn read_pointer(c: &mut Cursor<&[u8]>) -> io::Result<u64> {
    c.read_u64::<LittleEndian>()
}

fn read_string_ref(c: &mut Cursor<&[u8]>) -> io::Result<StringRef> {
    Ok(StringRef(c.read_u32::<LittleEndian>()?))
}

fn read_type_definition(c: &mut Cursor<&[u8]>, layout: &MetadataLayout) -> io::Result<Il2CppTypeDefinition> {
    let mut def = Il2CppTypeDefinition {
        name: read_string_ref(c)?,
        namespace: read_string_ref(c)?,
        custom_attribute_index: -1,
        byref_type_index: -1,
        rgctx_start_index: -1,
        ..Default::default()
    };

    if layout.has_custom_attribute_index {
        def.custom_attribute_index = c.read_i32::<LittleEndian>()?;
    }
    def.byval_type_index = c.read_i32::<LittleEndian>()?;
    if layout.has_byref_type_index {
        def.byref_type_index = c.read_i32::<LittleEndian>()?;
    }
    def.declaring_type_index = c.read_i32::<LittleEndian>()?;
    def.parent_index = c.read_i32::<LittleEndian>()?;
    def.element_type_index = c.read_i32::<LittleEndian>()?;
    if layout.has_rgctx {
        def.rgctx_start_index = c.read_i32::<LittleEndian>()?;
        def.rgctx_count = c.read_i32::<LittleEndian>()?;
    }
    def.generic_container_index = c.read_i32::<LittleEndian>()?;
    def.flags = c.read_u32::<LittleEndian>()?;
    def.field_start = c.read_i32::<LittleEndian>()?;
    def.method_start = c.read_i32::<LittleEndian>()?;
    def.event_start = c.read_i32::<LittleEndian>()?;
    def.property_start = c.read_i32::<LittleEndian>()?;
    def.nested_types_start = c.read_i32::<LittleEndian>()?;
    def.interfaces_start = c.read_i32::<LittleEndian>()?;
    def.vtable_start = c.read_i32::<LittleEndian>()?;
    def.interface_offsets_start = c.read_i32::<LittleEndian>()?;
    def.method_count = c.read_u16::<LittleEndian>()?;
    def.property_count = c.read_u16::<LittleEndian>()?;
    def.field_count = c.read_u16::<LittleEndian>()?;
    def.event_count = c.read_u16::<LittleEndian>()?;
    def.nested_types_count = c.read_u16::<LittleEndian>()?;
    def.vtable_count = c.read_u16::<LittleEndian>()?;
    def.interfaces_count = c.read_u16::<LittleEndian>()?;
    def.interface_offsets_count = c.read_u16::<LittleEndian>()?;
    def.bitfield = c.read_u32::<LittleEndian>()?;
    def.token = c.read_u32::<LittleEndian>()?;

    Ok(def)
}

fn read_method_definition(c: &mut Cursor<&[u8]>, layout: &MetadataLayout) -> io::Result<Il2CppMethodDefinition> {
    let mut def = Il2CppMethodDefinition {
        name: read_string_ref(c)?,
        custom_attribute_index: -1,
        method_index: -1,
        invoker_index: -1,
        delegate_wrapper_index: -1,
        rgctx_start_index: -1,
        ..Default::default()
    };

    def.declaring_type = c.read_i32::<LittleEndian>()?;
    def.return_type = c.read_i32::<LittleEndian>()?;
    if layout.has_return_parameter_token {
        def.return_parameter_token = c.read_u32::<LittleEndian>()?;
    }
    def.parameter_start = c.read_i32::<LittleEndian>()?;
    if layout.has_custom_attribute_index {
        def.custom_attribute_index = c.read_i32::<LittleEndian>()?;
    }
    def.generic_container_index = c.read_i32::<LittleEndian>()?;
    if layout.has_rgctx {
        def.method_index = c.read_i32::<LittleEndian>()?;
        def.invoker_index = c.read_i32::<LittleEndian>()?;
        def.delegate_wrapper_index = c.read_i32::<LittleEndian>()?;
        def.rgctx_start_index = c.read_i32::<LittleEndian>()?;
        def.rgctx_count = c.read_i32::<LittleEndian>()?;
    }
    def.token = c.read_u32::<LittleEndian>()?;
    def.flags = c.read_u16::<LittleEndian>()?;
    def.iflags = c.read_u16::<LittleEndian>()?;
    def.slot = c.read_u16::<LittleEndian>()?;
    def.parameter_count = c.read_u16::<LittleEndian>()?;

    Ok(def)
}

fn read_field_definition(c: &mut Cursor<&[u8]>, layout: &MetadataLayout) -> io::Result<Il2CppFieldDefinition> {
    let name = read_string_ref(c)?;
    let type_index = c.read_i32::<LittleEndian>()?;
    let custom_attribute_index = if layout.has_custom_attribute_index {
        c.read_i32::<LittleEndian>()?
    } else {
        -1
    };
    let token = c.read_u32::<LittleEndian>()?;

    Ok(Il2CppFieldDefinition {
        name,
        type_index,
        custom_attribute_index,
        token,
    })
}

fn read_parameter_definition(c: &mut Cursor<&[u8]>, layout: &MetadataLayout) -> io::Result<Il2CppParameterDefinition> {
    let name = read_string_ref(c)?;
    let token = c.read_u32::<LittleEndian>()?;
    let custom_attribute_index = if layout.has_custom_attribute_index {
        c.read_i32::<LittleEndian>()?
    } else {
        -1
    };
    let type_index = c.read_i32::<LittleEndian>()?;

    Ok(Il2CppParameterDefinition {
        name,
        token,
        custom_attribute_index,
        type_index,
    })
}

fn read_generic_parameter(c: &mut Cursor<&[u8]>) -> io::Result<Il2CppGenericParameter> {
    Ok(Il2CppGenericParameter {
        owner_index: c.read_i32::<LittleEndian>()?,
        name: read_string_ref(c)?,
        constraints_start: c.read_i16::<LittleEndian>()?,
        constraints_count: c.read_i16::<LittleEndian>()?,
        num: c.read_u16::<LittleEndian>()?,
        flags: c.read_u16::<LittleEndian>()?,
    })
}

fn read_image_definition(c: &mut Cursor<&[u8]>, layout: &MetadataLayout) -> io::Result<Il2CppImageDefinition> {
    let mut def = Il2CppImageDefinition {
        name: read_string_ref(c)?,
        assembly_index: c.read_i32::<LittleEndian>()?,
        type_start: c.read_i32::<LittleEndian>()?,
        type_count: c.read_u32::<LittleEndian>()?,
        exported_type_start: c.read_i32::<LittleEndian>()?,
        exported_type_count: c.read_u32::<LittleEndian>()?,
        entry_point_index: c.read_i32::<LittleEndian>()?,
        token: c.read_u32::<LittleEndian>()?,
        custom_attribute_start: -1,
        custom_attribute_count: 0,
    };

    if layout.has_image_custom_attributes {
        def.custom_attribute_start = c.read_i32::<LittleEndian>()?;
        def.custom_attribute_count = c.read_u32::<LittleEndian>()?;
    }

    Ok(def)
}

/// Read a compressed unsigned integer from the default-value heap
pub fn read_compressed_u32(c: &mut Cursor<&[u8]>) -> io::Result<u32> {
    let first = c.read_u8()? as u32;
    let value = if first & 0x80 == 0 {
        first
    } else if first & 0xC0 == 0x80 {
        ((first & !0xC0) << 8) | c.read_u8()? as u32
    } else if first & 0xE0 == 0xC0 {
        let rest = c.read_u24::<byteorder::BigEndian>()?;
        ((first & !0xE0) << 24) | rest
    } else {
        match first {
            0xF0 => c.read_u32::<LittleEndian>()?,
            0xFE => u32::MAX - 1,
            0xFF => u32::MAX,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid compressed integer prefix {first:#x}"),
                ))
            }
        }
    };
    Ok(value)
}

/// Read a compressed signed integer (sign in the low bit)
pub fn read_compressed_i32(c: &mut Cursor<&[u8]>) -> io::Result<i32> {
    let encoded = read_compressed_u32(c)?;
    if encoded == u32::MAX {
        return Ok(i32::MIN);
    }

    let negative = encoded & 1 != 0;
    let magnitude = (encoded >> 1) as i32;
    Ok(if negative { -(magnitude + 1) } else { magnitude })
}
