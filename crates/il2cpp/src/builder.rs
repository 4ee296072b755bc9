//! Type graph construction
//!
//! One forward pass over the parsed tables. Type usages are interned on
//! demand and memoized; every cross-table index is checked as it is
//! followed, so a finished graph holds no dangling links.

use crate::graph::*;
use crate::layout::HeaderSlot;
use crate::metadata::{read_compressed_i32, read_compressed_u32, Metadata};
use crate::types::*;
use atlas_core::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{self, Cursor};
use std::ops::Range;
use tracing::{debug, info};

/// Builds a [`TypeGraph`] from parsed metadata
pub struct GraphBuilder<'a> {
    metadata: &'a Metadata,
    graph: TypeGraph,
    /// Memoized `TypeRefId` per `types` record
    usage_ids: Vec<Option<TypeRefId>>,
    /// Usages currently being resolved, innermost last
    usage_stack: Vec<usize>,
    /// Membership flags for `usage_stack`
    in_progress: Vec<bool>,
    type_modules: Vec<Option<ModuleIndex>>,
    field_owners: Vec<Option<TypeIndex>>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(metadata: &'a Metadata) -> Self {
        Self {
            metadata,
            graph: TypeGraph::default(),
            usage_ids: vec![None; metadata.types.len()],
            usage_stack: Vec::new(),
            in_progress: vec![false; metadata.types.len()],
            type_modules: vec![None; metadata.type_definitions.len()],
            field_owners: vec![None; metadata.field_definitions.len()],
        }
    }

    /// Build the graph
    ///
    /// Passes run in a fixed order, so identical input yields identical
    /// interning order.
    pub fn build(mut self) -> Result<TypeGraph> {
        self.build_modules()?;
        self.build_types()?;
        self.build_generic_parameters()?;
        self.build_methods()?;
        self.build_fields()?;
        self.build_field_defaults()?;
        self.build_method_specs()?;
        self.check_enclosing_cycles()?;
        self.check_base_cycles()?;
        self.build_name_index();

        info!(
            "Built type graph: {} types, {} methods, {} fields, {} type refs, {} instantiations",
            self.graph.types.len(),
            self.graph.methods.len(),
            self.graph.fields.len(),
            self.graph.type_refs.len(),
            self.graph.instantiations.len()
        );

        Ok(self.graph)
    }

    fn build_modules(&mut self) -> Result<()> {
        let metadata = self.metadata;
        for (i, image) in metadata.image_definitions.iter().enumerate() {
            let index = ModuleIndex::from(i);
            let range = checked_range(
                image.type_start,
                image.type_count as usize,
                metadata.type_definitions.len(),
                "images",
                i,
                "type_start",
            )?;

            let mut types = Vec::with_capacity(range.len());
            for t in range {
                // An image claiming a type twice keeps the first owner
                self.type_modules[t].get_or_insert(index);
                types.push(TypeIndex::from(t));
            }

            self.graph.modules.push(ModuleNode {
                index,
                name: self.string(image.name),
                types,
                token: image.token,
            });
        }
        debug!("{} modules", self.graph.modules.len());
        Ok(())
    }

    fn build_types(&mut self) -> Result<()> {
        let metadata = self.metadata;
        for (i, def) in metadata.type_definitions.iter().enumerate() {
            let table = "type_definitions";

            let byval = self.optional_usage(def.byval_type_index, table, i, "byval_type")?;
            let base = self.optional_usage(def.parent_index, table, i, "parent")?;

            let enclosing = match self.optional_usage(def.declaring_type_index, table, i, "declaring_type")? {
                Some(id) => Some(self.definition_of(id).ok_or_else(|| {
                    Error::dangling(table, i, "declaring_type", def.declaring_type_index as i64)
                })?),
                None => None,
            };

            let element_type = if def.is_enum() {
                self.optional_usage(def.element_type_index, table, i, "element_type")?
            } else {
                None
            };

            let fields = checked_range(
                def.field_start,
                def.field_count as usize,
                metadata.field_definitions.len(),
                table,
                i,
                "field_start",
            )?
            .map(|f| {
                self.field_owners[f].get_or_insert(TypeIndex::from(i));
                FieldIndex::from(f)
            })
            .collect();

            let methods = checked_range(
                def.method_start,
                def.method_count as usize,
                metadata.method_definitions.len(),
                table,
                i,
                "method_start",
            )?
            .map(MethodIndex::from)
            .collect();

            let nested_range = checked_range(
                def.nested_types_start,
                def.nested_types_count as usize,
                metadata.nested_types.len(),
                table,
                i,
                "nested_types_start",
            )?;
            let mut nested_types = Vec::with_capacity(nested_range.len());
            for n in nested_range {
                nested_types.push(self.type_index(metadata.nested_types[n], "nested_types", n, "type")?);
            }

            let interface_range = checked_range(
                def.interfaces_start,
                def.interfaces_count as usize,
                metadata.interfaces.len(),
                table,
                i,
                "interfaces_start",
            )?;
            let mut interfaces = Vec::with_capacity(interface_range.len());
            for n in interface_range {
                interfaces.push(self.usage(metadata.interfaces[n], "interfaces", n, "type")?);
            }

            let generic_parameters = self.container_parameters(def.generic_container_index, table, i)?;

            self.graph.types.push(TypeNode {
                index: TypeIndex::from(i),
                name: self.string(def.name),
                namespace: self.string(def.namespace),
                module: self.type_modules[i],
                byval,
                base,
                enclosing,
                element_type,
                fields,
                methods,
                nested_types,
                interfaces,
                generic_parameters,
                flags: def.flags,
                token: def.token,
                is_value_type: def.is_value_type(),
                is_enum: def.is_enum(),
            });
        }
        Ok(())
    }

    fn build_generic_parameters(&mut self) -> Result<()> {
        let metadata = self.metadata;
        for (i, param) in metadata.generic_parameters.iter().enumerate() {
            let table = "generic_parameters";
            let container = usize::try_from(param.owner_index)
                .ok()
                .and_then(|c| metadata.generic_containers.get(c))
                .ok_or_else(|| Error::dangling(table, i, "owner", param.owner_index as i64))?;

            let owner = if container.is_method != 0 {
                GenericDefinition::Method(self.method_index(container.owner_index, "generic_containers", param.owner_index as usize, "owner")?)
            } else {
                GenericDefinition::Type(self.type_index(container.owner_index, "generic_containers", param.owner_index as usize, "owner")?)
            };

            let count = usize::try_from(param.constraints_count)
                .map_err(|_| Error::dangling(table, i, "constraints_count", param.constraints_count as i64))?;
            let range = checked_range(
                param.constraints_start as i32,
                count,
                metadata.generic_parameter_constraints.len(),
                table,
                i,
                "constraints_start",
            )?;
            let mut constraints = Vec::with_capacity(range.len());
            for c in range {
                constraints.push(self.usage(metadata.generic_parameter_constraints[c], "generic_parameter_constraints", c, "type")?);
            }

            self.graph.generic_parameters.push(GenericParameterNode {
                index: GenericParameterIndex::from(i),
                name: self.string(param.name),
                owner,
                position: param.num,
                flags: param.flags,
                constraints,
            });
        }
        Ok(())
    }

    fn build_methods(&mut self) -> Result<()> {
        let metadata = self.metadata;
        for (i, def) in metadata.method_definitions.iter().enumerate() {
            let table = "methods";
            let declaring_type = self.type_index(def.declaring_type, table, i, "declaring_type")?;
            let return_type = self.usage(def.return_type, table, i, "return_type")?;

            let range = checked_range(
                def.parameter_start,
                def.parameter_count as usize,
                metadata.parameter_definitions.len(),
                table,
                i,
                "parameter_start",
            )?;
            let mut parameters = Vec::with_capacity(range.len());
            for p in range {
                let param = &metadata.parameter_definitions[p];
                parameters.push(ParameterNode {
                    name: self.string(param.name),
                    type_ref: self.usage(param.type_index, "parameters", p, "type")?,
                    token: param.token,
                });
            }

            let generic_parameters = self.container_parameters(def.generic_container_index, table, i)?;

            self.graph.methods.push(MethodNode {
                index: MethodIndex::from(i),
                name: self.string(def.name),
                declaring_type,
                return_type,
                parameters,
                generic_parameters,
                flags: def.flags,
                iflags: def.iflags,
                slot: def.slot,
                token: def.token,
                address: None,
            });
        }
        Ok(())
    }

    fn build_fields(&mut self) -> Result<()> {
        let metadata = self.metadata;
        for (i, def) in metadata.field_definitions.iter().enumerate() {
            let type_ref = self.usage(def.type_index, "fields", i, "type")?;
            // `usage` has bounds-checked the index
            let attrs = metadata.types[def.type_index as usize].attrs;

            self.graph.fields.push(FieldNode {
                index: FieldIndex::from(i),
                name: self.string(def.name),
                declaring_type: self.field_owners[i],
                type_ref,
                attrs,
                token: def.token,
                constant: None,
                offset: None,
            });
        }
        Ok(())
    }

    fn build_field_defaults(&mut self) -> Result<()> {
        let metadata = self.metadata;
        let table = "field_default_values";
        let table_offset = metadata.header.range(HeaderSlot::FieldDefaultValues).offset as u64;

        for (i, default) in metadata.field_default_values.iter().enumerate() {
            let field = usize::try_from(default.field_index)
                .ok()
                .filter(|&f| f < self.graph.fields.len())
                .ok_or_else(|| Error::dangling(table, i, "field", default.field_index as i64))?;
            self.usage(default.type_index, table, i, "type")?;
            let kind = metadata.types[default.type_index as usize].kind;

            let record_offset = table_offset + (i * 12) as u64;
            let value = if default.data_index == -1 {
                ConstantValue::Null
            } else {
                let bytes = metadata.default_value_bytes(default.data_index).ok_or_else(|| {
                    Error::malformed_table(
                        table,
                        i,
                        record_offset,
                        format!("data index {} outside default value heap", default.data_index),
                    )
                })?;
                let mut cursor = Cursor::new(bytes);
                read_constant(&mut cursor, kind, metadata.layout.compressed_constants)
                    .map_err(|e| Error::malformed_table(table, i, record_offset, e.to_string()))?
            };

            self.graph.fields[field].constant = Some(value);
        }
        Ok(())
    }

    fn build_method_specs(&mut self) -> Result<()> {
        let metadata = self.metadata;
        for (i, spec) in metadata.method_specs.iter().enumerate() {
            let table = "method_specs";
            let method = self.method_index(spec.method_definition_index, table, i, "method")?;
            let class_arguments = if spec.class_inst_index >= 0 {
                self.inst_arguments(spec.class_inst_index, table, i, "class_inst")?
            } else {
                Vec::new()
            };
            let method_arguments = if spec.method_inst_index >= 0 {
                self.inst_arguments(spec.method_inst_index, table, i, "method_inst")?
            } else {
                Vec::new()
            };

            let instantiation = self.intern_instantiation(GenericInstantiation {
                definition: GenericDefinition::Method(method),
                class_arguments,
                method_arguments,
            });
            self.graph.method_specs.push(instantiation);
        }
        Ok(())
    }

    fn check_enclosing_cycles(&self) -> Result<()> {
        find_cycle(self.graph.types.len(), |t| self.graph.types[t].enclosing.map(TypeIndex::index)).map_or(
            Ok(()),
            |(record, chain)| {
                Err(Error::CyclicTypeNesting {
                    table: "type_definitions",
                    record,
                    chain,
                })
            },
        )
    }

    fn check_base_cycles(&self) -> Result<()> {
        let base_of = |t: usize| {
            self.graph.types[t]
                .base
                .and_then(|id| self.definition_of(id))
                .map(TypeIndex::index)
        };
        match find_cycle(self.graph.types.len(), base_of) {
            Some((record, _)) => Err(Error::dangling(
                "type_definitions",
                record,
                "parent",
                self.metadata.type_definitions[record].parent_index as i64,
            )),
            None => Ok(()),
        }
    }

    fn build_name_index(&mut self) {
        for node in &self.graph.types {
            self.graph
                .name_index
                .entry((node.namespace.clone(), node.name.clone()))
                .or_insert(node.index);
        }
    }

    fn string(&self, string: StringRef) -> String {
        // Names were validated by the reader
        self.metadata.get_string(string).unwrap_or_default().to_string()
    }

    fn type_index(&self, index: i32, table: &'static str, record: usize, field: &'static str) -> Result<TypeIndex> {
        usize::try_from(index)
            .ok()
            .filter(|&i| i < self.metadata.type_definitions.len())
            .map(TypeIndex::from)
            .ok_or_else(|| Error::dangling(table, record, field, index as i64))
    }

    fn method_index(&self, index: i32, table: &'static str, record: usize, field: &'static str) -> Result<MethodIndex> {
        usize::try_from(index)
            .ok()
            .filter(|&i| i < self.metadata.method_definitions.len())
            .map(MethodIndex::from)
            .ok_or_else(|| Error::dangling(table, record, field, index as i64))
    }

    /// Type definition a usage names, directly or through a generic instance
    fn definition_of(&self, id: TypeRefId) -> Option<TypeIndex> {
        match self.graph.type_ref(id)? {
            TypeRef::Definition(t) => Some(*t),
            TypeRef::GenericInstance(inst) => match self.graph.instantiation(*inst)?.definition {
                GenericDefinition::Type(t) => Some(t),
                GenericDefinition::Method(_) => None,
            },
            _ => None,
        }
    }

    fn container_parameters(
        &self,
        container_index: i32,
        table: &'static str,
        record: usize,
    ) -> Result<Vec<GenericParameterIndex>> {
        if container_index < 0 {
            return Ok(Vec::new());
        }
        let container = self
            .metadata
            .generic_containers
            .get(container_index as usize)
            .ok_or_else(|| Error::dangling(table, record, "generic_container", container_index as i64))?;
        let count = usize::try_from(container.type_argc).map_err(|_| {
            Error::dangling("generic_containers", container_index as usize, "type_argc", container.type_argc as i64)
        })?;

        Ok(checked_range(
            container.generic_parameter_start,
            count,
            self.metadata.generic_parameters.len(),
            "generic_containers",
            container_index as usize,
            "generic_parameter_start",
        )?
        .map(GenericParameterIndex::from)
        .collect())
    }

    fn optional_usage(
        &mut self,
        index: i32,
        table: &'static str,
        record: usize,
        field: &'static str,
    ) -> Result<Option<TypeRefId>> {
        if index < 0 {
            return Ok(None);
        }
        self.usage(index, table, record, field).map(Some)
    }

    /// Resolve a `types` index found in `table[record].field`
    fn usage(&mut self, index: i32, table: &'static str, record: usize, field: &'static str) -> Result<TypeRefId> {
        let usage = self.usage_slot(index, table, record, field)?;
        self.intern_usage(usage)
    }

    fn usage_slot(&self, index: i32, table: &'static str, record: usize, field: &'static str) -> Result<usize> {
        usize::try_from(index)
            .ok()
            .filter(|&u| u < self.metadata.types.len())
            .ok_or_else(|| Error::dangling(table, record, field, index as i64))
    }

    fn intern_usage(&mut self, usage: usize) -> Result<TypeRefId> {
        if let Some(id) = self.usage_ids[usage] {
            return Ok(id);
        }

        let result = self.resolve_pending(usage);
        for pending in self.usage_stack.drain(..) {
            self.in_progress[pending] = false;
        }
        result
    }

    /// Resolve `root` and every usage it depends on, deepest first
    ///
    /// Element and argument chains can be arbitrarily long, so they are
    /// walked with an explicit stack instead of recursion.
    fn resolve_pending(&mut self, root: usize) -> Result<TypeRefId> {
        self.usage_stack.push(root);
        self.in_progress[root] = true;

        while let Some(&usage) = self.usage_stack.last() {
            let pending = self
                .usage_dependencies(usage)?
                .into_iter()
                .find(|&dependency| self.usage_ids[dependency].is_none());

            match pending {
                Some(dependency) if self.in_progress[dependency] => {
                    let pos = self
                        .usage_stack
                        .iter()
                        .position(|&u| u == dependency)
                        .unwrap_or(0);
                    let mut chain = self.usage_stack[pos..].to_vec();
                    chain.push(dependency);
                    return Err(Error::CyclicTypeNesting {
                        table: "types",
                        record: dependency,
                        chain,
                    });
                }
                Some(dependency) => {
                    self.in_progress[dependency] = true;
                    self.usage_stack.push(dependency);
                }
                None => {
                    let id = self.decode_usage(usage)?;
                    self.usage_ids[usage] = Some(id);
                    self.in_progress[usage] = false;
                    self.usage_stack.pop();
                }
            }
        }

        self.usage_ids[root].ok_or_else(|| {
            Error::malformed_table("types", root, self.usage_offset(root), "usage left unresolved")
        })
    }

    /// Usages that must be interned before `usage` can be decoded
    fn usage_dependencies(&self, usage: usize) -> Result<Vec<usize>> {
        let ty = &self.metadata.types[usage];
        match ty.kind {
            type_kind::PTR | type_kind::SZARRAY | type_kind::ARRAY => {
                Ok(vec![self.usage_slot(ty.data, "types", usage, "data")?])
            }
            type_kind::GENERICINST => {
                let class = usize::try_from(ty.data)
                    .ok()
                    .filter(|&c| c < self.metadata.generic_classes.len())
                    .ok_or_else(|| Error::dangling("types", usage, "data", ty.data as i64))?;
                let inst_index = self.metadata.generic_classes[class].class_inst_index;
                self.inst_range(inst_index, "generic_classes", class, "class_inst")?
                    .map(|a| self.usage_slot(self.metadata.generic_inst_args[a], "generic_inst_args", a, "type"))
                    .collect()
            }
            _ => Ok(Vec::new()),
        }
    }

    fn usage_offset(&self, usage: usize) -> u64 {
        self.metadata.header.range(HeaderSlot::Types).offset as u64 + (usage * 8) as u64
    }

    fn decode_usage(&mut self, usage: usize) -> Result<TypeRefId> {
        let ty = self.metadata.types[usage].clone();
        let table = "types";

        let type_ref = match ty.kind {
            type_kind::CLASS | type_kind::VALUETYPE => TypeRef::Definition(self.type_index(ty.data, table, usage, "data")?),
            type_kind::GENERICINST => TypeRef::GenericInstance(self.generic_class(ty.data, usage)?),
            type_kind::VAR | type_kind::MVAR => {
                let param = usize::try_from(ty.data)
                    .ok()
                    .filter(|&p| p < self.metadata.generic_parameters.len())
                    .ok_or_else(|| Error::dangling(table, usage, "data", ty.data as i64))?;
                TypeRef::GenericParameter(GenericParameterIndex::from(param))
            }
            type_kind::PTR => TypeRef::Pointer(self.usage(ty.data, table, usage, "data")?),
            type_kind::SZARRAY => TypeRef::SzArray(self.usage(ty.data, table, usage, "data")?),
            type_kind::ARRAY => TypeRef::Array {
                element: self.usage(ty.data, table, usage, "data")?,
                rank: ty.rank(),
            },
            kind => match PrimitiveType::from_kind(kind) {
                Some(primitive) => TypeRef::Primitive(primitive),
                None => {
                    return Err(Error::malformed_table(
                        table,
                        usage,
                        self.usage_offset(usage),
                        format!("unknown type kind {kind:#04x}"),
                    ));
                }
            },
        };

        let id = self.intern(type_ref);
        if ty.is_byref() {
            Ok(self.intern(TypeRef::ByRef(id)))
        } else {
            Ok(id)
        }
    }

    fn generic_class(&mut self, index: i32, usage: usize) -> Result<GenericInstantiationIndex> {
        let table = "generic_classes";
        let class = usize::try_from(index)
            .ok()
            .filter(|&c| c < self.metadata.generic_classes.len())
            .ok_or_else(|| Error::dangling("types", usage, "data", index as i64))?;
        let generic_class = self.metadata.generic_classes[class].clone();

        let definition = self.type_index(generic_class.type_definition_index, table, class, "type_definition")?;
        let class_arguments = self.inst_arguments(generic_class.class_inst_index, table, class, "class_inst")?;

        Ok(self.intern_instantiation(GenericInstantiation {
            definition: GenericDefinition::Type(definition),
            class_arguments,
            method_arguments: Vec::new(),
        }))
    }

    /// Resolve a `generic_insts` argument list
    fn inst_arguments(
        &mut self,
        index: i32,
        table: &'static str,
        record: usize,
        field: &'static str,
    ) -> Result<Vec<TypeRefId>> {
        let range = self.inst_range(index, table, record, field)?;
        let mut arguments = Vec::with_capacity(range.len());
        for a in range {
            arguments.push(self.usage(self.metadata.generic_inst_args[a], "generic_inst_args", a, "type")?);
        }
        Ok(arguments)
    }

    /// Bounds-checked `generic_inst_args` range of a `generic_insts` record
    fn inst_range(&self, index: i32, table: &'static str, record: usize, field: &'static str) -> Result<Range<usize>> {
        let inst_index = usize::try_from(index)
            .ok()
            .filter(|&g| g < self.metadata.generic_insts.len())
            .ok_or_else(|| Error::dangling(table, record, field, index as i64))?;
        let inst = &self.metadata.generic_insts[inst_index];

        let count = usize::try_from(inst.arg_count)
            .map_err(|_| Error::dangling("generic_insts", inst_index, "arg_count", inst.arg_count as i64))?;
        checked_range(
            inst.arg_start,
            count,
            self.metadata.generic_inst_args.len(),
            "generic_insts",
            inst_index,
            "arg_start",
        )
    }

    fn intern(&mut self, type_ref: TypeRef) -> TypeRefId {
        TypeRefId::from(self.graph.type_refs.insert_full(type_ref).0)
    }

    fn intern_instantiation(&mut self, instantiation: GenericInstantiation) -> GenericInstantiationIndex {
        GenericInstantiationIndex::from(self.graph.instantiations.insert_full(instantiation).0)
    }
}

/// Check `start..start + count` against a table of `len` records
///
/// An empty range is always valid, whatever its start.
fn checked_range(
    start: i32,
    count: usize,
    len: usize,
    table: &'static str,
    record: usize,
    field: &'static str,
) -> Result<Range<usize>> {
    if count == 0 {
        return Ok(0..0);
    }
    let begin = usize::try_from(start).map_err(|_| Error::dangling(table, record, field, start as i64))?;
    let end = begin
        .checked_add(count)
        .filter(|&end| end <= len)
        .ok_or_else(|| Error::dangling(table, record, field, start as i64))?;
    Ok(begin..end)
}

/// Walk every `next` chain; returns the first record that closes a loop and the loop itself
fn find_cycle(len: usize, next: impl Fn(usize) -> Option<usize>) -> Option<(usize, Vec<usize>)> {
    let mut settled = vec![false; len];
    for start in 0..len {
        let mut path = Vec::new();
        let mut current = Some(start);
        while let Some(node) = current {
            if settled[node] {
                break;
            }
            if let Some(pos) = path.iter().position(|&p| p == node) {
                let mut chain = path[pos..].to_vec();
                chain.push(node);
                return Some((node, chain));
            }
            path.push(node);
            current = next(node).filter(|&n| n < len);
        }
        for node in path {
            settled[node] = true;
        }
    }
    None
}

/// Decode one constant from the default-value heap
fn read_constant(c: &mut Cursor<&[u8]>, kind: u8, compressed: bool) -> io::Result<ConstantValue> {
    let value = match kind {
        type_kind::BOOLEAN => ConstantValue::Bool(c.read_u8()? != 0),
        type_kind::CHAR => ConstantValue::Char(c.read_u16::<LittleEndian>()?),
        type_kind::I1 => ConstantValue::I1(c.read_i8()?),
        type_kind::U1 => ConstantValue::U1(c.read_u8()?),
        type_kind::I2 => ConstantValue::I2(c.read_i16::<LittleEndian>()?),
        type_kind::U2 => ConstantValue::U2(c.read_u16::<LittleEndian>()?),
        type_kind::I4 if compressed => ConstantValue::I4(read_compressed_i32(c)?),
        type_kind::I4 => ConstantValue::I4(c.read_i32::<LittleEndian>()?),
        type_kind::U4 if compressed => ConstantValue::U4(read_compressed_u32(c)?),
        type_kind::U4 => ConstantValue::U4(c.read_u32::<LittleEndian>()?),
        type_kind::I8 => ConstantValue::I8(c.read_i64::<LittleEndian>()?),
        type_kind::U8 => ConstantValue::U8(c.read_u64::<LittleEndian>()?),
        type_kind::R4 => ConstantValue::R4(c.read_f32::<LittleEndian>()?),
        type_kind::R8 => ConstantValue::R8(c.read_f64::<LittleEndian>()?),
        type_kind::STRING => {
            let len = if compressed {
                read_compressed_i32(c)?
            } else {
                c.read_i32::<LittleEndian>()?
            };
            let remaining = c.get_ref().len() as u64 - c.position();
            if len < 0 {
                ConstantValue::Null
            } else if len as u64 > remaining {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("string constant of {len} bytes runs past the default value heap"),
                ));
            } else {
                let mut bytes = vec![0u8; len as usize];
                io::Read::read_exact(c, &mut bytes)?;
                let text = String::from_utf8(bytes)
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "string constant is not valid UTF-8"))?;
                ConstantValue::String(text)
            }
        }
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("no constant encoding for type kind {other:#04x}"),
            ))
        }
    };
    Ok(value)
}
