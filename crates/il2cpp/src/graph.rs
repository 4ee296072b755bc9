//! Arena-backed type graph
//!
//! Every node lives in a flat vector and every link is an index newtype.
//! Type usages are interned once as [`TypeRef`] values so equal usages share
//! one [`TypeRefId`].

use atlas_core::Address;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::types::{field_attributes, method_attributes, type_attributes};

macro_rules! index_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl From<usize> for $name {
            fn from(index: usize) -> Self {
                Self(index as u32)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

index_type!(
    /// Position in `type_definitions`
    TypeIndex
);
index_type!(
    /// Position in `methods`
    MethodIndex
);
index_type!(
    /// Position in `fields`
    FieldIndex
);
index_type!(
    /// Position in `generic_parameters`
    GenericParameterIndex
);
index_type!(
    /// Interned generic instantiation
    GenericInstantiationIndex
);
index_type!(
    /// Position in `images`
    ModuleIndex
);
index_type!(
    /// Interned type usage
    TypeRefId
);

/// Built-in types that need no definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimitiveType {
    Void,
    Boolean,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4,
    R8,
    String,
    TypedByRef,
    IntPtr,
    UIntPtr,
    Object,
}

impl PrimitiveType {
    /// Map a type usage kind to a primitive, if it is one
    pub fn from_kind(kind: u8) -> Option<Self> {
        use crate::types::type_kind;

        let primitive = match kind {
            type_kind::VOID => Self::Void,
            type_kind::BOOLEAN => Self::Boolean,
            type_kind::CHAR => Self::Char,
            type_kind::I1 => Self::I1,
            type_kind::U1 => Self::U1,
            type_kind::I2 => Self::I2,
            type_kind::U2 => Self::U2,
            type_kind::I4 => Self::I4,
            type_kind::U4 => Self::U4,
            type_kind::I8 => Self::I8,
            type_kind::U8 => Self::U8,
            type_kind::R4 => Self::R4,
            type_kind::R8 => Self::R8,
            type_kind::STRING => Self::String,
            type_kind::TYPEDBYREF => Self::TypedByRef,
            type_kind::I => Self::IntPtr,
            type_kind::U => Self::UIntPtr,
            type_kind::OBJECT => Self::Object,
            _ => return None,
        };
        Some(primitive)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Boolean => "bool",
            Self::Char => "char",
            Self::I1 => "sbyte",
            Self::U1 => "byte",
            Self::I2 => "short",
            Self::U2 => "ushort",
            Self::I4 => "int",
            Self::U4 => "uint",
            Self::I8 => "long",
            Self::U8 => "ulong",
            Self::R4 => "float",
            Self::R8 => "double",
            Self::String => "string",
            Self::TypedByRef => "TypedReference",
            Self::IntPtr => "IntPtr",
            Self::UIntPtr => "UIntPtr",
            Self::Object => "object",
        }
    }
}

/// Canonical form of a type usage
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeRef {
    Primitive(PrimitiveType),
    Definition(TypeIndex),
    GenericInstance(GenericInstantiationIndex),
    GenericParameter(GenericParameterIndex),
    Pointer(TypeRefId),
    SzArray(TypeRefId),
    Array { element: TypeRefId, rank: u8 },
    ByRef(TypeRefId),
}

/// What a generic argument list is applied to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GenericDefinition {
    Type(TypeIndex),
    Method(MethodIndex),
}

/// A definition closed over concrete argument lists
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenericInstantiation {
    pub definition: GenericDefinition,
    pub class_arguments: Vec<TypeRefId>,
    pub method_arguments: Vec<TypeRefId>,
}

/// Decoded field constant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstantValue {
    Bool(bool),
    Char(u16),
    I1(i8),
    U1(u8),
    I2(i16),
    U2(u16),
    I4(i32),
    U4(u32),
    I8(i64),
    U8(u64),
    R4(f32),
    R8(f64),
    String(String),
    /// Null reference
    Null,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeNode {
    pub index: TypeIndex,
    pub name: String,
    pub namespace: String,
    pub module: Option<ModuleIndex>,
    /// The type's own by-value usage
    pub byval: Option<TypeRefId>,
    pub base: Option<TypeRefId>,
    pub enclosing: Option<TypeIndex>,
    /// Underlying type of an enum
    pub element_type: Option<TypeRefId>,
    pub fields: Vec<FieldIndex>,
    pub methods: Vec<MethodIndex>,
    pub nested_types: Vec<TypeIndex>,
    pub interfaces: Vec<TypeRefId>,
    pub generic_parameters: Vec<GenericParameterIndex>,
    pub flags: u32,
    pub token: u32,
    pub is_value_type: bool,
    pub is_enum: bool,
}

impl TypeNode {
    pub fn is_interface(&self) -> bool {
        self.flags & type_attributes::INTERFACE != 0
    }

    pub fn is_abstract(&self) -> bool {
        self.flags & type_attributes::ABSTRACT != 0
    }

    pub fn is_sealed(&self) -> bool {
        self.flags & type_attributes::SEALED != 0
    }

    pub fn is_generic(&self) -> bool {
        !self.generic_parameters.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterNode {
    pub name: String,
    pub type_ref: TypeRefId,
    pub token: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodNode {
    pub index: MethodIndex,
    pub name: String,
    pub declaring_type: TypeIndex,
    pub return_type: TypeRefId,
    pub parameters: Vec<ParameterNode>,
    pub generic_parameters: Vec<GenericParameterIndex>,
    pub flags: u16,
    pub iflags: u16,
    pub slot: u16,
    pub token: u32,
    /// Native entry point, attached by the resolver
    pub address: Option<Address>,
}

impl MethodNode {
    /// Row number within the method table of its image
    pub fn rid(&self) -> u32 {
        self.token & 0x00FF_FFFF
    }

    pub fn is_static(&self) -> bool {
        self.flags & method_attributes::STATIC != 0
    }

    pub fn is_virtual(&self) -> bool {
        self.flags & method_attributes::VIRTUAL != 0
    }

    pub fn is_abstract(&self) -> bool {
        self.flags & method_attributes::ABSTRACT != 0
    }

    pub fn is_generic(&self) -> bool {
        !self.generic_parameters.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldNode {
    pub index: FieldIndex,
    pub name: String,
    /// `None` for a field no type's range covers
    pub declaring_type: Option<TypeIndex>,
    pub type_ref: TypeRefId,
    /// Field attributes, carried on the field's type usage
    pub attrs: u16,
    pub token: u32,
    pub constant: Option<ConstantValue>,
    /// Instance or static-storage offset, attached by the resolver
    pub offset: Option<u32>,
}

impl FieldNode {
    pub fn is_static(&self) -> bool {
        self.attrs & field_attributes::STATIC != 0
    }

    pub fn is_literal(&self) -> bool {
        self.attrs & field_attributes::LITERAL != 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenericParameterNode {
    pub index: GenericParameterIndex,
    pub name: String,
    pub owner: GenericDefinition,
    /// Position in the owner's parameter list
    pub position: u16,
    pub flags: u16,
    pub constraints: Vec<TypeRefId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleNode {
    pub index: ModuleIndex,
    pub name: String,
    pub types: Vec<TypeIndex>,
    pub token: u32,
}

/// The resolved program model
///
/// Built once per session. The resolver attaches addresses and offsets
/// before the graph is handed out; after that it is read-only.
#[derive(Debug, Default)]
pub struct TypeGraph {
    pub(crate) types: Vec<TypeNode>,
    pub(crate) methods: Vec<MethodNode>,
    pub(crate) fields: Vec<FieldNode>,
    pub(crate) generic_parameters: Vec<GenericParameterNode>,
    pub(crate) modules: Vec<ModuleNode>,
    pub(crate) type_refs: IndexSet<TypeRef>,
    pub(crate) instantiations: IndexSet<GenericInstantiation>,
    /// Interned instantiation of each `method_specs` record
    pub(crate) method_specs: Vec<GenericInstantiationIndex>,
    pub(crate) name_index: HashMap<(String, String), TypeIndex>,
    pub(crate) generic_method_addresses: HashMap<GenericInstantiationIndex, Address>,
}

impl TypeGraph {
    pub fn types(&self) -> &[TypeNode] {
        &self.types
    }

    pub fn type_node(&self, index: TypeIndex) -> Option<&TypeNode> {
        self.types.get(index.index())
    }

    pub fn methods(&self) -> &[MethodNode] {
        &self.methods
    }

    pub fn method(&self, index: MethodIndex) -> Option<&MethodNode> {
        self.methods.get(index.index())
    }

    pub fn fields(&self) -> &[FieldNode] {
        &self.fields
    }

    pub fn field(&self, index: FieldIndex) -> Option<&FieldNode> {
        self.fields.get(index.index())
    }

    pub fn generic_parameters(&self) -> &[GenericParameterNode] {
        &self.generic_parameters
    }

    pub fn generic_parameter(&self, index: GenericParameterIndex) -> Option<&GenericParameterNode> {
        self.generic_parameters.get(index.index())
    }

    pub fn modules(&self) -> &[ModuleNode] {
        &self.modules
    }

    pub fn module(&self, index: ModuleIndex) -> Option<&ModuleNode> {
        self.modules.get(index.index())
    }

    pub fn type_ref(&self, id: TypeRefId) -> Option<&TypeRef> {
        self.type_refs.get_index(id.index())
    }

    pub fn type_ref_count(&self) -> usize {
        self.type_refs.len()
    }

    /// Id of an already interned usage
    pub fn find_type_ref(&self, type_ref: &TypeRef) -> Option<TypeRefId> {
        self.type_refs.get_index_of(type_ref).map(TypeRefId::from)
    }

    pub fn instantiation(&self, index: GenericInstantiationIndex) -> Option<&GenericInstantiation> {
        self.instantiations.get_index(index.index())
    }

    /// Instantiations in interning order
    pub fn instantiations(&self) -> impl Iterator<Item = (GenericInstantiationIndex, &GenericInstantiation)> {
        self.instantiations
            .iter()
            .enumerate()
            .map(|(i, inst)| (GenericInstantiationIndex::from(i), inst))
    }

    pub fn find_instantiation(&self, instantiation: &GenericInstantiation) -> Option<GenericInstantiationIndex> {
        self.instantiations
            .get_index_of(instantiation)
            .map(GenericInstantiationIndex::from)
    }

    /// Instantiation interned for a `method_specs` record
    pub fn method_spec(&self, spec: usize) -> Option<GenericInstantiationIndex> {
        self.method_specs.get(spec).copied()
    }

    pub fn lookup_type_by_name(&self, namespace: &str, name: &str) -> Option<&TypeNode> {
        self.name_index
            .get(&(namespace.to_string(), name.to_string()))
            .and_then(|&index| self.type_node(index))
    }

    pub fn generic_method_address(&self, instantiation: GenericInstantiationIndex) -> Option<Address> {
        self.generic_method_addresses.get(&instantiation).copied()
    }

    /// Generic method instantiations that received an address
    pub fn generic_method_address_count(&self) -> usize {
        self.generic_method_addresses.len()
    }

    /// Namespace-qualified name, with enclosing types joined by `.`
    /// Enclosing types of `index`, innermost first
    ///
    /// Bounded by the type count, so a malformed chain cannot loop.
    pub fn enclosing_types(&self, index: TypeIndex) -> impl Iterator<Item = &TypeNode> + '_ {
        let first = self.type_node(index).and_then(|node| node.enclosing);
        std::iter::successors(first.and_then(|i| self.type_node(i)), move |node| {
            node.enclosing.and_then(|i| self.type_node(i))
        })
        .take(self.types.len())
    }

    /// True when the type or any type enclosing it has generic parameters
    pub fn is_open_generic(&self, index: TypeIndex) -> bool {
        self.type_node(index).is_some_and(|node| node.is_generic())
            || self.enclosing_types(index).any(|outer| outer.is_generic())
    }

    pub fn full_name(&self, index: TypeIndex) -> String {
        let Some(node) = self.type_node(index) else {
            return format!("<type {index}>");
        };

        let mut parts = vec![node.name.as_str()];
        let mut namespace = node.namespace.as_str();
        for outer in self.enclosing_types(index) {
            parts.push(outer.name.as_str());
            namespace = outer.namespace.as_str();
        }
        parts.reverse();

        let name = parts.join(".");
        if namespace.is_empty() {
            name
        } else {
            format!("{namespace}.{name}")
        }
    }

    /// Human-readable rendering of an interned usage
    pub fn type_ref_name(&self, id: TypeRefId) -> String {
        self.render(vec![NamePart::TypeRef(id)])
    }

    pub fn instantiation_name(&self, index: GenericInstantiationIndex) -> String {
        let mut pending = Vec::new();
        self.expand_instantiation(index, &mut pending);
        self.render(pending)
    }

    /// Render name parts, popped from the end, without recursing into elements
    fn render(&self, mut pending: Vec<NamePart>) -> String {
        let mut out = String::new();
        while let Some(part) = pending.pop() {
            match part {
                NamePart::Text(text) => out.push_str(&text),
                NamePart::TypeRef(id) => self.expand_type_ref(id, &mut pending),
            }
        }
        out
    }

    fn expand_type_ref(&self, id: TypeRefId, pending: &mut Vec<NamePart>) {
        let Some(type_ref) = self.type_ref(id) else {
            pending.push(NamePart::Text(format!("<typeref {id}>")));
            return;
        };

        let (suffix, element) = match type_ref {
            TypeRef::Primitive(p) => {
                pending.push(NamePart::Text(p.name().to_string()));
                return;
            }
            TypeRef::Definition(index) => {
                pending.push(NamePart::Text(self.full_name(*index)));
                return;
            }
            TypeRef::GenericInstance(index) => {
                self.expand_instantiation(*index, pending);
                return;
            }
            TypeRef::GenericParameter(index) => {
                let name = self
                    .generic_parameter(*index)
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|| format!("<param {index}>"));
                pending.push(NamePart::Text(name));
                return;
            }
            TypeRef::Pointer(element) => (String::from("*"), *element),
            TypeRef::SzArray(element) => (String::from("[]"), *element),
            TypeRef::Array { element, rank } => (format!("[{}]", ",".repeat((*rank).max(1) as usize - 1)), *element),
            TypeRef::ByRef(element) => (String::from("&"), *element),
        };
        pending.push(NamePart::Text(suffix));
        pending.push(NamePart::TypeRef(element));
    }

    fn expand_instantiation(&self, index: GenericInstantiationIndex, pending: &mut Vec<NamePart>) {
        let Some(inst) = self.instantiation(index) else {
            pending.push(NamePart::Text(format!("<instantiation {index}>")));
            return;
        };

        // Built in output order, then reversed onto the stack
        let mut parts = Vec::new();
        match inst.definition {
            GenericDefinition::Type(t) => {
                parts.push(NamePart::Text(format!("{}<", self.full_name(t))));
                push_arguments(&mut parts, &inst.class_arguments);
                parts.push(NamePart::Text(String::from(">")));
            }
            GenericDefinition::Method(m) => {
                let (owner, name) = self
                    .method(m)
                    .map(|method| (self.full_name(method.declaring_type), method.name.as_str()))
                    .unwrap_or_else(|| (String::from("?"), "?"));
                if inst.class_arguments.is_empty() {
                    parts.push(NamePart::Text(format!("{owner}.{name}<")));
                } else {
                    parts.push(NamePart::Text(format!("{owner}<")));
                    push_arguments(&mut parts, &inst.class_arguments);
                    parts.push(NamePart::Text(format!(">.{name}<")));
                }
                push_arguments(&mut parts, &inst.method_arguments);
                parts.push(NamePart::Text(String::from(">")));
            }
        }
        pending.extend(parts.into_iter().rev());
    }

    pub(crate) fn attach_method_address(&mut self, method: MethodIndex, address: Address) {
        if let Some(node) = self.methods.get_mut(method.index()) {
            node.address = Some(address);
        }
    }

    pub(crate) fn attach_field_offset(&mut self, field: FieldIndex, offset: u32) {
        if let Some(node) = self.fields.get_mut(field.index()) {
            node.offset = Some(offset);
        }
    }

    pub(crate) fn attach_generic_method_address(&mut self, instantiation: GenericInstantiationIndex, address: Address) {
        self.generic_method_addresses.insert(instantiation, address);
    }
}

/// One piece of a rendered type name
enum NamePart {
    Text(String),
    TypeRef(TypeRefId),
}

fn push_arguments(parts: &mut Vec<NamePart>, arguments: &[TypeRefId]) {
    for (i, &argument) in arguments.iter().enumerate() {
        if i > 0 {
            parts.push(NamePart::Text(String::from(", ")));
        }
        parts.push(NamePart::TypeRef(argument));
    }
}
