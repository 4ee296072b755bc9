//! IL2CPP structure definitions
//!
//! These structures mirror the on-disk metadata records. Fields that only
//! exist in some versions are kept here with a neutral value (`-1` or `0`)
//! when the active layout does not carry them.

use atlas_core::MetadataVersion;
use serde::{Deserialize, Serialize};

/// IL2CPP metadata magic number
pub const METADATA_MAGIC: u32 = 0xFAB11BAF;

/// Every metadata version tag the reader understands
pub const SUPPORTED_VERSIONS: [MetadataVersion; 12] = [
    MetadataVersion::new(24, 0),
    MetadataVersion::new(24, 1),
    MetadataVersion::new(24, 2),
    MetadataVersion::new(24, 3),
    MetadataVersion::new(24, 4),
    MetadataVersion::new(24, 5),
    MetadataVersion::new(27, 0),
    MetadataVersion::new(27, 1),
    MetadataVersion::new(27, 2),
    MetadataVersion::new(29, 0),
    MetadataVersion::new(29, 1),
    MetadataVersion::new(31, 0),
];

pub fn is_supported_version(version: MetadataVersion) -> bool {
    SUPPORTED_VERSIONS.contains(&version)
}

/// Byte offset into the identifier heap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StringRef(pub u32);

/// Type definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Il2CppTypeDefinition {
    pub name: StringRef,
    pub namespace: StringRef,
    pub custom_attribute_index: i32,
    pub byval_type_index: i32,
    pub byref_type_index: i32,
    pub declaring_type_index: i32,
    pub parent_index: i32,
    pub element_type_index: i32,
    pub rgctx_start_index: i32,
    pub rgctx_count: i32,
    pub generic_container_index: i32,
    pub flags: u32,
    pub field_start: i32,
    pub method_start: i32,
    pub event_start: i32,
    pub property_start: i32,
    pub nested_types_start: i32,
    pub interfaces_start: i32,
    pub vtable_start: i32,
    pub interface_offsets_start: i32,
    pub method_count: u16,
    pub property_count: u16,
    pub field_count: u16,
    pub event_count: u16,
    pub nested_types_count: u16,
    pub vtable_count: u16,
    pub interfaces_count: u16,
    pub interface_offsets_count: u16,
    pub bitfield: u32,
    pub token: u32,
}

impl Il2CppTypeDefinition {
    pub fn is_value_type(&self) -> bool {
        self.bitfield & 0x1 != 0
    }

    pub fn is_enum(&self) -> bool {
        self.bitfield & 0x2 != 0
    }
}

/// Method definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Il2CppMethodDefinition {
    pub name: StringRef,
    pub declaring_type: i32,
    pub return_type: i32,
    pub return_parameter_token: u32,
    pub parameter_start: i32,
    pub custom_attribute_index: i32,
    pub generic_container_index: i32,
    pub method_index: i32,
    pub invoker_index: i32,
    pub delegate_wrapper_index: i32,
    pub rgctx_start_index: i32,
    pub rgctx_count: i32,
    pub token: u32,
    pub flags: u16,
    pub iflags: u16,
    pub slot: u16,
    pub parameter_count: u16,
}

/// Field definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Il2CppFieldDefinition {
    pub name: StringRef,
    pub type_index: i32,
    pub custom_attribute_index: i32,
    pub token: u32,
}

/// Parameter definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Il2CppParameterDefinition {
    pub name: StringRef,
    pub token: u32,
    pub custom_attribute_index: i32,
    pub type_index: i32,
}

/// Constant attached to a field
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Il2CppFieldDefaultValue {
    pub field_index: i32,
    pub type_index: i32,
    pub data_index: i32,
}

/// Image definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Il2CppImageDefinition {
    pub name: StringRef,
    pub assembly_index: i32,
    pub type_start: i32,
    pub type_count: u32,
    pub exported_type_start: i32,
    pub exported_type_count: u32,
    pub entry_point_index: i32,
    pub token: u32,
    pub custom_attribute_start: i32,
    pub custom_attribute_count: u32,
}

/// Generic container
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Il2CppGenericContainer {
    pub owner_index: i32,
    pub type_argc: i32,
    pub is_method: i32,
    pub generic_parameter_start: i32,
}

/// Generic parameter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Il2CppGenericParameter {
    pub owner_index: i32,
    pub name: StringRef,
    pub constraints_start: i16,
    pub constraints_count: i16,
    pub num: u16,
    pub flags: u16,
}

/// One use of a type: the `types` table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Il2CppType {
    /// Meaning depends on `kind`: definition, generic class, generic
    /// parameter or element usage index
    pub data: i32,
    pub attrs: u16,
    pub kind: u8,
    /// Low six bits: array rank. Bit 6: byref. Bit 7: pinned.
    pub bits: u8,
}

impl Il2CppType {
    pub fn rank(&self) -> u8 {
        self.bits & 0x3f
    }

    pub fn is_byref(&self) -> bool {
        self.bits & 0x40 != 0
    }

    pub fn is_pinned(&self) -> bool {
        self.bits & 0x80 != 0
    }
}

/// Generic type instance: definition plus class argument list
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Il2CppGenericClass {
    pub type_definition_index: i32,
    pub class_inst_index: i32,
}

/// Argument list, a range of `generic_inst_args`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Il2CppGenericInst {
    pub arg_start: i32,
    pub arg_count: i32,
}

/// Generic method instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Il2CppMethodSpec {
    pub method_definition_index: i32,
    pub class_inst_index: i32,
    pub method_inst_index: i32,
}

/// Maps a method spec to its slot in `generic_method_pointers`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Il2CppGenericMethodTableEntry {
    pub method_spec_index: i32,
    pub pointer_index: i32,
}

/// Type usage kinds
pub mod type_kind {
    pub const END: u8 = 0x00;
    pub const VOID: u8 = 0x01;
    pub const BOOLEAN: u8 = 0x02;
    pub const CHAR: u8 = 0x03;
    pub const I1: u8 = 0x04;
    pub const U1: u8 = 0x05;
    pub const I2: u8 = 0x06;
    pub const U2: u8 = 0x07;
    pub const I4: u8 = 0x08;
    pub const U4: u8 = 0x09;
    pub const I8: u8 = 0x0a;
    pub const U8: u8 = 0x0b;
    pub const R4: u8 = 0x0c;
    pub const R8: u8 = 0x0d;
    pub const STRING: u8 = 0x0e;
    pub const PTR: u8 = 0x0f;
    pub const VALUETYPE: u8 = 0x11;
    pub const CLASS: u8 = 0x12;
    pub const VAR: u8 = 0x13;
    pub const ARRAY: u8 = 0x14;
    pub const GENERICINST: u8 = 0x15;
    pub const TYPEDBYREF: u8 = 0x16;
    pub const I: u8 = 0x18;
    pub const U: u8 = 0x19;
    pub const OBJECT: u8 = 0x1c;
    pub const SZARRAY: u8 = 0x1d;
    pub const MVAR: u8 = 0x1e;
}

/// Type attribute flags
pub mod type_attributes {
    pub const VISIBILITY_MASK: u32 = 0x00000007;
    pub const NOT_PUBLIC: u32 = 0x00000000;
    pub const PUBLIC: u32 = 0x00000001;
    pub const NESTED_PUBLIC: u32 = 0x00000002;
    pub const NESTED_PRIVATE: u32 = 0x00000003;
    pub const NESTED_FAMILY: u32 = 0x00000004;
    pub const NESTED_ASSEMBLY: u32 = 0x00000005;
    pub const NESTED_FAM_AND_ASSEM: u32 = 0x00000006;
    pub const NESTED_FAM_OR_ASSEM: u32 = 0x00000007;

    pub const INTERFACE: u32 = 0x00000020;
    pub const ABSTRACT: u32 = 0x00000080;
    pub const SEALED: u32 = 0x00000100;
}

/// Method attribute flags
pub mod method_attributes {
    pub const MEMBER_ACCESS_MASK: u16 = 0x0007;
    pub const PRIVATE: u16 = 0x0001;
    pub const FAM_AND_ASSEM: u16 = 0x0002;
    pub const ASSEMBLY: u16 = 0x0003;
    pub const FAMILY: u16 = 0x0004;
    pub const FAM_OR_ASSEM: u16 = 0x0005;
    pub const PUBLIC: u16 = 0x0006;

    pub const STATIC: u16 = 0x0010;
    pub const FINAL: u16 = 0x0020;
    pub const VIRTUAL: u16 = 0x0040;
    pub const ABSTRACT: u16 = 0x0400;
}

/// Field attribute flags, carried on the field's type usage
pub mod field_attributes {
    pub const FIELD_ACCESS_MASK: u16 = 0x0007;
    pub const PUBLIC: u16 = 0x0006;
    pub const STATIC: u16 = 0x0010;
    pub const INIT_ONLY: u16 = 0x0020;
    pub const LITERAL: u16 = 0x0040;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_versions() {
        assert!(is_supported_version(MetadataVersion::new(24, 2)));
        assert!(is_supported_version(MetadataVersion::new(31, 0)));
        assert!(!is_supported_version(MetadataVersion::new(25, 0)));
        assert!(!is_supported_version(MetadataVersion::new(24, 6)));
    }

    #[test]
    fn test_type_usage_bits() {
        let usage = Il2CppType {
            data: 0,
            attrs: 0,
            kind: type_kind::ARRAY,
            bits: 0x40 | 2,
        };
        assert_eq!(usage.rank(), 2);
        assert!(usage.is_byref());
        assert!(!usage.is_pinned());
    }
}
