//! Version-dependent metadata layouts
//!
//! Everything that differs between metadata versions is decided here, once,
//! when the header is read. Table readers only consult the flags.

use crate::types::is_supported_version;
use atlas_core::{Error, MetadataVersion, Result};

/// A `(offset, size)` pair in the metadata header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderSlot {
    Strings,
    TypeDefinitions,
    Methods,
    Parameters,
    Fields,
    FieldDefaultValues,
    DefaultValueData,
    GenericContainers,
    GenericParameters,
    GenericParameterConstraints,
    NestedTypes,
    Interfaces,
    Images,
    RgctxEntries,
    Types,
    GenericClasses,
    GenericInsts,
    GenericInstArgs,
    MethodSpecs,
    MethodAddresses,
    GenericMethodTable,
    GenericMethodPointers,
    FieldOffsets,
    AttributeData,
    AttributeDataRanges,
}

impl HeaderSlot {
    /// Table name used in diagnostics
    pub fn table_name(self) -> &'static str {
        match self {
            Self::Strings => "strings",
            Self::TypeDefinitions => "type_definitions",
            Self::Methods => "methods",
            Self::Parameters => "parameters",
            Self::Fields => "fields",
            Self::FieldDefaultValues => "field_default_values",
            Self::DefaultValueData => "default_value_data",
            Self::GenericContainers => "generic_containers",
            Self::GenericParameters => "generic_parameters",
            Self::GenericParameterConstraints => "generic_parameter_constraints",
            Self::NestedTypes => "nested_types",
            Self::Interfaces => "interfaces",
            Self::Images => "images",
            Self::RgctxEntries => "rgctx_entries",
            Self::Types => "types",
            Self::GenericClasses => "generic_classes",
            Self::GenericInsts => "generic_insts",
            Self::GenericInstArgs => "generic_inst_args",
            Self::MethodSpecs => "method_specs",
            Self::MethodAddresses => "method_addresses",
            Self::GenericMethodTable => "generic_method_table",
            Self::GenericMethodPointers => "generic_method_pointers",
            Self::FieldOffsets => "field_offsets",
            Self::AttributeData => "attribute_data",
            Self::AttributeDataRanges => "attribute_data_ranges",
        }
    }
}

/// Field layout strategy for one metadata version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataLayout {
    pub version: MetadataVersion,
    /// `customAttributeIndex` on types, methods, fields and parameters
    pub has_custom_attribute_index: bool,
    /// `byrefTypeIndex` on type definitions
    pub has_byref_type_index: bool,
    /// rgctx ranges on types, method/invoker/delegate indices on methods,
    /// and the `rgctx_entries` header slot
    pub has_rgctx: bool,
    /// `returnParameterToken` on methods
    pub has_return_parameter_token: bool,
    /// custom attribute range on images
    pub has_image_custom_attributes: bool,
    /// `attribute_data` header slots
    pub has_attribute_data: bool,
    /// lengths and 32-bit constants use the compressed encoding
    pub compressed_constants: bool,
    header_slots: Vec<HeaderSlot>,
}

const V24_1: MetadataVersion = MetadataVersion::new(24, 1);
const V24_5: MetadataVersion = MetadataVersion::new(24, 5);
const V27: MetadataVersion = MetadataVersion::new(27, 0);
const V29: MetadataVersion = MetadataVersion::new(29, 0);
const V31: MetadataVersion = MetadataVersion::new(31, 0);

impl MetadataLayout {
    /// Select the layout for `version`, failing on anything outside the supported set
    pub fn for_version(version: MetadataVersion) -> Result<Self> {
        if !is_supported_version(version) {
            return Err(Error::UnsupportedMetadataVersion(version));
        }

        let has_rgctx = version <= V24_1;
        let has_attribute_data = version >= V29;

        let mut header_slots = vec![
            HeaderSlot::Strings,
            HeaderSlot::TypeDefinitions,
            HeaderSlot::Methods,
            HeaderSlot::Parameters,
            HeaderSlot::Fields,
            HeaderSlot::FieldDefaultValues,
            HeaderSlot::DefaultValueData,
            HeaderSlot::GenericContainers,
            HeaderSlot::GenericParameters,
            HeaderSlot::GenericParameterConstraints,
            HeaderSlot::NestedTypes,
            HeaderSlot::Interfaces,
            HeaderSlot::Images,
        ];
        if has_rgctx {
            header_slots.push(HeaderSlot::RgctxEntries);
        }
        header_slots.extend([
            HeaderSlot::Types,
            HeaderSlot::GenericClasses,
            HeaderSlot::GenericInsts,
            HeaderSlot::GenericInstArgs,
            HeaderSlot::MethodSpecs,
            HeaderSlot::MethodAddresses,
            HeaderSlot::GenericMethodTable,
            HeaderSlot::GenericMethodPointers,
            HeaderSlot::FieldOffsets,
        ]);
        if has_attribute_data {
            header_slots.extend([HeaderSlot::AttributeData, HeaderSlot::AttributeDataRanges]);
        }

        Ok(Self {
            version,
            has_custom_attribute_index: version < V27,
            has_byref_type_index: version <= V24_5,
            has_rgctx,
            has_return_parameter_token: version >= V31,
            has_image_custom_attributes: version >= V24_1,
            has_attribute_data,
            compressed_constants: version >= V29,
            header_slots,
        })
    }

    /// Header slots in on-disk order
    pub fn header_slots(&self) -> &[HeaderSlot] {
        &self.header_slots
    }

    /// Header length: magic, version, then one pair per slot
    pub fn header_size(&self) -> usize {
        8 + self.header_slots.len() * 8
    }

    pub fn type_definition_size(&self) -> usize {
        let mut size = 88;
        if self.has_custom_attribute_index {
            size += 4;
        }
        if self.has_byref_type_index {
            size += 4;
        }
        if self.has_rgctx {
            size += 8;
        }
        size
    }

    pub fn method_definition_size(&self) -> usize {
        let mut size = 32;
        if self.has_return_parameter_token {
            size += 4;
        }
        if self.has_custom_attribute_index {
            size += 4;
        }
        if self.has_rgctx {
            size += 20;
        }
        size
    }

    pub fn field_definition_size(&self) -> usize {
        if self.has_custom_attribute_index {
            16
        } else {
            12
        }
    }

    pub fn parameter_definition_size(&self) -> usize {
        if self.has_custom_attribute_index {
            16
        } else {
            12
        }
    }

    pub fn image_definition_size(&self) -> usize {
        if self.has_image_custom_attributes {
            40
        } else {
            32
        }
    }

    /// Fixed record size of a table, or `None` for raw byte heaps
    pub fn record_size(&self, slot: HeaderSlot) -> Option<usize> {
        match slot {
            HeaderSlot::Strings
            | HeaderSlot::DefaultValueData
            | HeaderSlot::RgctxEntries
            | HeaderSlot::AttributeData
            | HeaderSlot::AttributeDataRanges => None,
            HeaderSlot::TypeDefinitions => Some(self.type_definition_size()),
            HeaderSlot::Methods => Some(self.method_definition_size()),
            HeaderSlot::Parameters => Some(self.parameter_definition_size()),
            HeaderSlot::Fields => Some(self.field_definition_size()),
            HeaderSlot::Images => Some(self.image_definition_size()),
            HeaderSlot::FieldDefaultValues | HeaderSlot::MethodSpecs => Some(12),
            HeaderSlot::GenericContainers | HeaderSlot::GenericParameters => Some(16),
            HeaderSlot::Types
            | HeaderSlot::GenericClasses
            | HeaderSlot::GenericInsts
            | HeaderSlot::GenericMethodTable
            | HeaderSlot::MethodAddresses
            | HeaderSlot::GenericMethodPointers => Some(8),
            HeaderSlot::GenericParameterConstraints
            | HeaderSlot::NestedTypes
            | HeaderSlot::Interfaces
            | HeaderSlot::GenericInstArgs
            | HeaderSlot::FieldOffsets => Some(4),
        }
    }
}
