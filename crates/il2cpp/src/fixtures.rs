//! Synthetic metadata blobs for tests
//!
//! The writers here mirror the record readers in `metadata.rs` field for
//! field, so any layout flag the reader honours is honoured here too.

use crate::layout::{HeaderSlot, MetadataLayout};
use crate::types::*;
use atlas_core::MetadataVersion;
use byteorder::{LittleEndian, WriteBytesExt};

/// Byte position of a slot's `(offset, size)` pair in the header
pub fn slot_position(layout: &MetadataLayout, slot: HeaderSlot) -> usize {
    let index = layout
        .header_slots()
        .iter()
        .position(|&s| s == slot)
        .expect("slot not present in layout");
    8 + index * 8
}

/// In-memory metadata tables, serialized by [`MetadataBuilder::build`]
pub struct MetadataBuilder {
    pub version: MetadataVersion,
    pub strings: Vec<u8>,
    pub type_definitions: Vec<Il2CppTypeDefinition>,
    pub method_definitions: Vec<Il2CppMethodDefinition>,
    pub parameter_definitions: Vec<Il2CppParameterDefinition>,
    pub field_definitions: Vec<Il2CppFieldDefinition>,
    pub field_default_values: Vec<Il2CppFieldDefaultValue>,
    pub default_value_data: Vec<u8>,
    pub generic_containers: Vec<Il2CppGenericContainer>,
    pub generic_parameters: Vec<Il2CppGenericParameter>,
    pub generic_parameter_constraints: Vec<i32>,
    pub nested_types: Vec<i32>,
    pub interfaces: Vec<i32>,
    pub image_definitions: Vec<Il2CppImageDefinition>,
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

impl MetadataBuilder {
    pub fn new(version: MetadataVersion) -> Self {
        Self {
            version,
            // Offset 0 is the empty string
            strings: vec![0],
            type_definitions: Vec::new(),
            method_definitions: Vec::new(),
            parameter_definitions: Vec::new(),
            field_definitions: Vec::new(),
            field_default_values: Vec::new(),
            default_value_data: Vec::new(),
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
        }
    }

    pub fn string(&mut self, value: &str) -> StringRef {
        if value.is_empty() {
            return StringRef(0);
        }
        let offset = self.strings.len() as u32;
        self.strings.extend_from_slice(value.as_bytes());
        self.strings.push(0);
        StringRef(offset)
    }

    pub fn add_image(&mut self, name: &str) -> usize {
        let name = self.string(name);
        let index = self.image_definitions.len();
        self.image_definitions.push(Il2CppImageDefinition {
            name,
            assembly_index: index as i32,
            type_start: self.type_definitions.len() as i32,
            type_count: 0,
            exported_type_start: -1,
            exported_type_count: 0,
            entry_point_index: -1,
            token: 1,
            custom_attribute_start: -1,
            custom_attribute_count: 0,
        });
        index
    }

    /// Append a type to `image`; an image's types must be added back to back
    pub fn add_type(&mut self, image: usize, namespace: &str, name: &str) -> usize {
        let index = self.type_definitions.len();
        let img = &mut self.image_definitions[image];
        if img.type_count == 0 {
            img.type_start = index as i32;
        }
        assert_eq!(img.type_start as usize + img.type_count as usize, index, "image types must be contiguous");
        img.type_count += 1;
        let rid = img.type_count;

        let name = self.string(name);
        let namespace = self.string(namespace);
        let byval = self.class_usage(index);
        self.type_definitions.push(Il2CppTypeDefinition {
            name,
            namespace,
            custom_attribute_index: -1,
            byval_type_index: byval,
            byref_type_index: -1,
            declaring_type_index: -1,
            parent_index: -1,
            element_type_index: -1,
            rgctx_start_index: -1,
            rgctx_count: 0,
            generic_container_index: -1,
            flags: type_attributes::PUBLIC,
            field_start: self.field_definitions.len() as i32,
            method_start: self.method_definitions.len() as i32,
            event_start: -1,
            property_start: -1,
            nested_types_start: -1,
            interfaces_start: -1,
            vtable_start: -1,
            interface_offsets_start: -1,
            method_count: 0,
            property_count: 0,
            field_count: 0,
            event_count: 0,
            nested_types_count: 0,
            vtable_count: 0,
            interfaces_count: 0,
            interface_offsets_count: 0,
            bitfield: 0,
            token: 0x0200_0000 | rid,
        });
        index
    }

    /// Append a method to `owner`; a type's methods must be added back to back
    pub fn add_method(&mut self, owner: usize, name: &str, token: u32) -> usize {
        let index = self.method_definitions.len();
        let def = &mut self.type_definitions[owner];
        if def.method_count == 0 {
            def.method_start = index as i32;
        }
        assert_eq!(def.method_start as usize + def.method_count as usize, index, "type methods must be contiguous");
        def.method_count += 1;

        let name = self.string(name);
        let return_type = self.usage(type_kind::VOID, 0);
        self.method_definitions.push(Il2CppMethodDefinition {
            name,
            declaring_type: owner as i32,
            return_type,
            return_parameter_token: 0,
            parameter_start: self.parameter_definitions.len() as i32,
            custom_attribute_index: -1,
            generic_container_index: -1,
            method_index: index as i32,
            invoker_index: -1,
            delegate_wrapper_index: -1,
            rgctx_start_index: -1,
            rgctx_count: 0,
            token,
            flags: method_attributes::PUBLIC,
            iflags: 0,
            slot: 0xFFFF,
            parameter_count: 0,
        });
        index
    }

    /// Append a parameter to the most recently added method
    pub fn add_parameter(&mut self, method: usize, name: &str, type_index: i32) -> usize {
        let index = self.parameter_definitions.len();
        let def = &mut self.method_definitions[method];
        if def.parameter_count == 0 {
            def.parameter_start = index as i32;
        }
        def.parameter_count += 1;

        let name = self.string(name);
        self.parameter_definitions.push(Il2CppParameterDefinition {
            name,
            token: 0x0800_0000 | (index as u32 + 1),
            custom_attribute_index: -1,
            type_index,
        });
        index
    }

    /// Append an `int` field to `owner` with an entry in `field_offsets`
    pub fn add_field(&mut self, owner: usize, name: &str, token: u32, offset: i32) -> usize {
        let type_index = self.usage(type_kind::I4, 0);
        self.add_field_of(owner, name, token, offset, type_index)
    }

    pub fn add_field_of(&mut self, owner: usize, name: &str, token: u32, offset: i32, type_index: i32) -> usize {
        let index = self.field_definitions.len();
        let def = &mut self.type_definitions[owner];
        if def.field_count == 0 {
            def.field_start = index as i32;
        }
        assert_eq!(def.field_start as usize + def.field_count as usize, index, "type fields must be contiguous");
        def.field_count += 1;

        let name = self.string(name);
        self.field_definitions.push(Il2CppFieldDefinition {
            name,
            type_index,
            custom_attribute_index: -1,
            token,
        });
        self.field_offsets.push(offset);
        index
    }

    /// Attach a constant to a field; `data` goes to the default-value heap
    pub fn add_default(&mut self, field: usize, type_index: i32, data: &[u8]) {
        let data_index = self.default_value_data.len() as i32;
        self.default_value_data.extend_from_slice(data);
        self.field_default_values.push(Il2CppFieldDefaultValue {
            field_index: field as i32,
            type_index,
            data_index,
        });
    }

    pub fn usage(&mut self, kind: u8, data: i32) -> i32 {
        self.types.push(Il2CppType {
            data,
            attrs: 0,
            kind,
            bits: 0,
        });
        self.types.len() as i32 - 1
    }

    pub fn class_usage(&mut self, type_index: usize) -> i32 {
        self.usage(type_kind::CLASS, type_index as i32)
    }

    pub fn generic_inst(&mut self, args: &[i32]) -> i32 {
        let arg_start = self.generic_inst_args.len() as i32;
        self.generic_inst_args.extend_from_slice(args);
        self.generic_insts.push(Il2CppGenericInst {
            arg_start,
            arg_count: args.len() as i32,
        });
        self.generic_insts.len() as i32 - 1
    }

    /// `GENERICINST` usage of `definition` over argument usages
    pub fn generic_class_usage(&mut self, definition: usize, args: &[i32]) -> i32 {
        let class_inst_index = self.generic_inst(args);
        self.generic_classes.push(Il2CppGenericClass {
            type_definition_index: definition as i32,
            class_inst_index,
        });
        let generic_class = self.generic_classes.len() as i32 - 1;
        self.usage(type_kind::GENERICINST, generic_class)
    }

    /// Give a type or method a generic container with one parameter per name
    pub fn add_generic_container(&mut self, owner: usize, is_method: bool, names: &[&str]) -> i32 {
        let container = self.generic_containers.len() as i32;
        let generic_parameter_start = self.generic_parameters.len() as i32;
        for (num, name) in names.iter().enumerate() {
            let name = self.string(name);
            self.generic_parameters.push(Il2CppGenericParameter {
                owner_index: container,
                name,
                constraints_start: 0,
                constraints_count: 0,
                num: num as u16,
                flags: 0,
            });
        }
        self.generic_containers.push(Il2CppGenericContainer {
            owner_index: owner as i32,
            type_argc: names.len() as i32,
            is_method: is_method as i32,
            generic_parameter_start,
        });
        if is_method {
            self.method_definitions[owner].generic_container_index = container;
        } else {
            self.type_definitions[owner].generic_container_index = container;
        }
        container
    }

    pub fn build(&self) -> Vec<u8> {
        let layout = MetadataLayout::for_version(self.version).expect("fixture version must be supported");
        let mut out = vec![0u8; layout.header_size()];
        out[0..4].copy_from_slice(&METADATA_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&self.version.major.to_le_bytes());

        let mut pairs = Vec::with_capacity(layout.header_slots().len());
        for &slot in layout.header_slots() {
            let bytes = self.table_bytes(&layout, slot);
            if !bytes.is_empty() {
                while out.len() % 4 != 0 {
                    out.push(0);
                }
            }
            pairs.push((out.len() as u32, bytes.len() as u32));
            out.extend_from_slice(&bytes);
        }

        for (i, (offset, size)) in pairs.into_iter().enumerate() {
            let pos = 8 + i * 8;
            out[pos..pos + 4].copy_from_slice(&offset.to_le_bytes());
            out[pos + 4..pos + 8].copy_from_slice(&size.to_le_bytes());
        }
        out
    }

    fn table_bytes(&self, layout: &MetadataLayout, slot: HeaderSlot) -> Vec<u8> {
        let mut w = Vec::new();
        match slot {
            HeaderSlot::Strings => w.extend_from_slice(&self.strings),
            HeaderSlot::DefaultValueData => w.extend_from_slice(&self.default_value_data),
            HeaderSlot::RgctxEntries | HeaderSlot::AttributeData | HeaderSlot::AttributeDataRanges => {}
            HeaderSlot::TypeDefinitions => {
                for def in &self.type_definitions {
                    write_type_definition(&mut w, layout, def);
                }
            }
            HeaderSlot::Methods => {
                for def in &self.method_definitions {
                    write_method_definition(&mut w, layout, def);
                }
            }
            HeaderSlot::Parameters => {
                for def in &self.parameter_definitions {
                    w.write_u32::<LittleEndian>(def.name.0).unwrap();
                    w.write_u32::<LittleEndian>(def.token).unwrap();
                    if layout.has_custom_attribute_index {
                        w.write_i32::<LittleEndian>(def.custom_attribute_index).unwrap();
                    }
                    w.write_i32::<LittleEndian>(def.type_index).unwrap();
                }
            }
            HeaderSlot::Fields => {
                for def in &self.field_definitions {
                    w.write_u32::<LittleEndian>(def.name.0).unwrap();
                    w.write_i32::<LittleEndian>(def.type_index).unwrap();
                    if layout.has_custom_attribute_index {
                        w.write_i32::<LittleEndian>(def.custom_attribute_index).unwrap();
                    }
                    w.write_u32::<LittleEndian>(def.token).unwrap();
                }
            }
            HeaderSlot::FieldDefaultValues => {
                for def in &self.field_default_values {
                    write_i32s(&mut w, &[def.field_index, def.type_index, def.data_index]);
                }
            }
            HeaderSlot::GenericContainers => {
                for def in &self.generic_containers {
                    write_i32s(
                        &mut w,
                        &[def.owner_index, def.type_argc, def.is_method, def.generic_parameter_start],
                    );
                }
            }
            HeaderSlot::GenericParameters => {
                for def in &self.generic_parameters {
                    w.write_i32::<LittleEndian>(def.owner_index).unwrap();
                    w.write_u32::<LittleEndian>(def.name.0).unwrap();
                    w.write_i16::<LittleEndian>(def.constraints_start).unwrap();
                    w.write_i16::<LittleEndian>(def.constraints_count).unwrap();
                    w.write_u16::<LittleEndian>(def.num).unwrap();
                    w.write_u16::<LittleEndian>(def.flags).unwrap();
                }
            }
            HeaderSlot::GenericParameterConstraints => write_i32s(&mut w, &self.generic_parameter_constraints),
            HeaderSlot::NestedTypes => write_i32s(&mut w, &self.nested_types),
            HeaderSlot::Interfaces => write_i32s(&mut w, &self.interfaces),
            HeaderSlot::Images => {
                for def in &self.image_definitions {
                    w.write_u32::<LittleEndian>(def.name.0).unwrap();
                    w.write_i32::<LittleEndian>(def.assembly_index).unwrap();
                    w.write_i32::<LittleEndian>(def.type_start).unwrap();
                    w.write_u32::<LittleEndian>(def.type_count).unwrap();
                    w.write_i32::<LittleEndian>(def.exported_type_start).unwrap();
                    w.write_u32::<LittleEndian>(def.exported_type_count).unwrap();
                    w.write_i32::<LittleEndian>(def.entry_point_index).unwrap();
                    w.write_u32::<LittleEndian>(def.token).unwrap();
                    if layout.has_image_custom_attributes {
                        w.write_i32::<LittleEndian>(def.custom_attribute_start).unwrap();
                        w.write_u32::<LittleEndian>(def.custom_attribute_count).unwrap();
                    }
                }
            }
            HeaderSlot::Types => {
                for usage in &self.types {
                    w.write_i32::<LittleEndian>(usage.data).unwrap();
                    w.write_u16::<LittleEndian>(usage.attrs).unwrap();
                    w.write_u8(usage.kind).unwrap();
                    w.write_u8(usage.bits).unwrap();
                }
            }
            HeaderSlot::GenericClasses => {
                for def in &self.generic_classes {
                    write_i32s(&mut w, &[def.type_definition_index, def.class_inst_index]);
                }
            }
            HeaderSlot::GenericInsts => {
                for def in &self.generic_insts {
                    write_i32s(&mut w, &[def.arg_start, def.arg_count]);
                }
            }
            HeaderSlot::GenericInstArgs => write_i32s(&mut w, &self.generic_inst_args),
            HeaderSlot::MethodSpecs => {
                for def in &self.method_specs {
                    write_i32s(
                        &mut w,
                        &[def.method_definition_index, def.class_inst_index, def.method_inst_index],
                    );
                }
            }
            HeaderSlot::MethodAddresses => write_u64s(&mut w, &self.method_addresses),
            HeaderSlot::GenericMethodTable => {
                for def in &self.generic_method_table {
                    write_i32s(&mut w, &[def.method_spec_index, def.pointer_index]);
                }
            }
            HeaderSlot::GenericMethodPointers => write_u64s(&mut w, &self.generic_method_pointers),
            HeaderSlot::FieldOffsets => write_i32s(&mut w, &self.field_offsets),
        }
        w
    }
}

fn write_i32s(w: &mut Vec<u8>, values: &[i32]) {
    for &value in values {
        w.write_i32::<LittleEndian>(value).unwrap();
    }
}

fn write_u64s(w: &mut Vec<u8>, values: &[u64]) {
    for &value in values {
        w.write_u64::<LittleEndian>(value).unwrap();
    }
}

fn write_type_definition(w: &mut Vec<u8>, layout: &MetadataLayout, def: &Il2CppTypeDefinition) {
    w.write_u32::<LittleEndian>(def.name.0).unwrap();
    w.write_u32::<LittleEndian>(def.namespace.0).unwrap();
    if layout.has_custom_attribute_index {
        w.write_i32::<LittleEndian>(def.custom_attribute_index).unwrap();
    }
    w.write_i32::<LittleEndian>(def.byval_type_index).unwrap();
    if layout.has_byref_type_index {
        w.write_i32::<LittleEndian>(def.byref_type_index).unwrap();
    }
    write_i32s(w, &[def.declaring_type_index, def.parent_index, def.element_type_index]);
    if layout.has_rgctx {
        write_i32s(w, &[def.rgctx_start_index, def.rgctx_count]);
    }
    w.write_i32::<LittleEndian>(def.generic_container_index).unwrap();
    w.write_u32::<LittleEndian>(def.flags).unwrap();
    write_i32s(
        w,
        &[
            def.field_start,
            def.method_start,
            def.event_start,
            def.property_start,
            def.nested_types_start,
            def.interfaces_start,
            def.vtable_start,
            def.interface_offsets_start,
        ],
    );
    for count in [
        def.method_count,
        def.property_count,
        def.field_count,
        def.event_count,
        def.nested_types_count,
        def.vtable_count,
        def.interfaces_count,
        def.interface_offsets_count,
    ] {
        w.write_u16::<LittleEndian>(count).unwrap();
    }
    w.write_u32::<LittleEndian>(def.bitfield).unwrap();
    w.write_u32::<LittleEndian>(def.token).unwrap();
}

fn write_method_definition(w: &mut Vec<u8>, layout: &MetadataLayout, def: &Il2CppMethodDefinition) {
    w.write_u32::<LittleEndian>(def.name.0).unwrap();
    write_i32s(w, &[def.declaring_type, def.return_type]);
    if layout.has_return_parameter_token {
        w.write_u32::<LittleEndian>(def.return_parameter_token).unwrap();
    }
    w.write_i32::<LittleEndian>(def.parameter_start).unwrap();
    if layout.has_custom_attribute_index {
        w.write_i32::<LittleEndian>(def.custom_attribute_index).unwrap();
    }
    w.write_i32::<LittleEndian>(def.generic_container_index).unwrap();
    if layout.has_rgctx {
        write_i32s(
            w,
            &[
                def.method_index,
                def.invoker_index,
                def.delegate_wrapper_index,
                def.rgctx_start_index,
                def.rgctx_count,
            ],
        );
    }
    w.write_u32::<LittleEndian>(def.token).unwrap();
    for value in [def.flags, def.iflags, def.slot, def.parameter_count] {
        w.write_u16::<LittleEndian>(value).unwrap();
    }
}
