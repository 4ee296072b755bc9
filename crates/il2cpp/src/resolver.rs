//! Native address and field offset resolution
//!
//! Resolution is a partial-failure domain: anything that cannot be placed
//! is left unresolved and reported as an issue, never as an error.

use crate::graph::*;
use crate::metadata::Metadata;
use crate::registration::{CodeGenModule, CodeRegistration};
use atlas_binary_parser::BinaryImage;
use atlas_core::{Address, Architecture, Error};
use rayon::prelude::*;
use std::collections::HashSet;
use tracing::{debug, info, warn, Span};

/// Clear the Thumb bit on 32-bit ARM; other targets pass through
pub fn normalize_code_pointer(architecture: Architecture, raw: u64) -> u64 {
    match architecture {
        Architecture::Arm32 => raw & !1,
        _ => raw,
    }
}

fn is_sentinel(raw: u64) -> bool {
    raw == 0 || raw == u64::MAX
}

/// Everything the resolver found, ready to attach to the graph
#[derive(Debug, Default)]
pub struct Resolution {
    pub method_addresses: Vec<(MethodIndex, Address)>,
    pub generic_method_addresses: Vec<(GenericInstantiationIndex, Address)>,
    pub field_offsets: Vec<(FieldIndex, u32)>,
    pub direct_count: usize,
    pub heuristic_count: usize,
    pub issues: Vec<Error>,
}

impl Resolution {
    /// Attach results to the graph, returning the issues
    pub fn attach(self, graph: &mut TypeGraph) -> Vec<Error> {
        for (method, address) in self.method_addresses {
            graph.attach_method_address(method, address);
        }
        for (instantiation, address) in self.generic_method_addresses {
            graph.attach_generic_method_address(instantiation, address);
        }
        for (field, offset) in self.field_offsets {
            graph.attach_field_offset(field, offset);
        }
        self.issues
    }
}

pub struct AddressResolver<'a> {
    image: &'a BinaryImage,
    metadata: &'a Metadata,
    registration: Option<&'a CodeRegistration>,
}

impl<'a> AddressResolver<'a> {
    pub fn new(image: &'a BinaryImage, metadata: &'a Metadata, registration: Option<&'a CodeRegistration>) -> Self {
        Self {
            image,
            metadata,
            registration,
        }
    }

    /// Resolve methods, generic method instances and field offsets
    pub fn resolve(&self, graph: &TypeGraph) -> Resolution {
        let mut resolution = Resolution::default();

        let mut resolved = vec![false; graph.methods().len()];
        self.resolve_direct(graph, &mut resolution, &mut resolved);
        if let Some(registration) = self.registration {
            self.resolve_heuristic(graph, registration, &mut resolution, &resolved);
        }
        self.resolve_generic_methods(graph, &mut resolution);
        self.resolve_field_offsets(graph, &mut resolution);

        info!(
            "Resolved {} methods directly, {} heuristically, {} generic instances, {} field offsets ({} issues)",
            resolution.direct_count,
            resolution.heuristic_count,
            resolution.generic_method_addresses.len(),
            resolution.field_offsets.len(),
            resolution.issues.len()
        );

        resolution
    }

    /// Validate a raw code pointer; `Ok(None)` for a sentinel
    fn code_address(&self, raw: u64, what: impl FnOnce() -> String) -> Result<Option<Address>, Error> {
        if is_sentinel(raw) {
            return Ok(None);
        }
        let address = Address::new(normalize_code_pointer(self.image.architecture(), raw));
        if self.image.is_executable(address) {
            Ok(Some(address))
        } else {
            Err(Error::AddressOutOfBounds { address, what: what() })
        }
    }

    fn resolve_direct(&self, graph: &TypeGraph, resolution: &mut Resolution, resolved: &mut [bool]) {
        let has_method_index = self.metadata.layout.has_rgctx;

        for (i, method) in graph.methods().iter().enumerate() {
            let def = &self.metadata.method_definitions[i];
            let key = if has_method_index && def.method_index >= 0 {
                def.method_index as usize
            } else {
                i
            };

            let Some(&raw) = self.metadata.method_addresses.get(key) else {
                continue;
            };
            match self.code_address(raw, || describe_method(graph, method)) {
                Ok(Some(address)) => {
                    resolution.method_addresses.push((method.index, address));
                    resolution.direct_count += 1;
                    resolved[i] = true;
                }
                Ok(None) => {}
                Err(issue) => {
                    warn!("{}", issue);
                    resolution.issues.push(issue);
                    // A bad direct entry still counts as the method's answer
                    resolved[i] = true;
                }
            }
        }
    }

    fn resolve_heuristic(
        &self,
        graph: &TypeGraph,
        registration: &CodeRegistration,
        resolution: &mut Resolution,
        resolved: &[bool],
    ) {
        if registration.modules.is_empty() {
            self.resolve_global_table(graph, registration, resolution, resolved);
            return;
        }

        let span = Span::current();
        let outcomes: Vec<(Vec<(MethodIndex, Address)>, Vec<Error>)> = registration
            .modules
            .par_iter()
            .map(|module| span.in_scope(|| self.correlate_module(graph, module, resolved)))
            .collect();

        // Merged in module order whatever order the workers finished in
        for (addresses, issues) in outcomes {
            resolution.heuristic_count += addresses.len();
            resolution.method_addresses.extend(addresses);
            resolution.issues.extend(issues);
        }
    }

    /// Pre-24.2 builds: one pointer table indexed by `methodIndex`
    fn resolve_global_table(
        &self,
        graph: &TypeGraph,
        registration: &CodeRegistration,
        resolution: &mut Resolution,
        resolved: &[bool],
    ) {
        for (i, method) in graph.methods().iter().enumerate() {
            if resolved[i] {
                continue;
            }
            let def = &self.metadata.method_definitions[i];
            let Some(&raw) = usize::try_from(def.method_index)
                .ok()
                .and_then(|slot| registration.method_pointers.get(slot))
            else {
                continue;
            };

            match self.code_address(raw, || describe_method(graph, method)) {
                Ok(Some(address)) => {
                    resolution.method_addresses.push((method.index, address));
                    resolution.heuristic_count += 1;
                }
                Ok(None) => {}
                Err(issue) => resolution.issues.push(issue),
            }
        }
    }

    /// Align one module's pointer slots with its image's methods in token order
    fn correlate_module(
        &self,
        graph: &TypeGraph,
        module: &CodeGenModule,
        resolved: &[bool],
    ) -> (Vec<(MethodIndex, Address)>, Vec<Error>) {
        let mut addresses = Vec::new();
        let mut issues = Vec::new();

        let Some(node) = graph.modules().iter().find(|m| m.name == module.name) else {
            debug!("No metadata image for module {}", module.name);
            return (addresses, issues);
        };

        let mut methods: Vec<&MethodNode> = node
            .types
            .iter()
            .filter_map(|&t| graph.type_node(t))
            .flat_map(|t| t.methods.iter())
            .filter_map(|&m| graph.method(m))
            .collect();
        methods.sort_by_key(|m| (m.rid(), m.index));

        if methods.len() != module.method_pointers.len() {
            let issue = Error::AddressResolutionAmbiguous {
                module: module.name.clone(),
                methods: methods.len(),
                slots: module.method_pointers.len(),
            };
            warn!("{}", issue);
            issues.push(issue);
            return (addresses, issues);
        }

        for (method, &raw) in methods.iter().zip(&module.method_pointers) {
            if resolved[method.index.index()] {
                continue;
            }
            match self.code_address(raw, || describe_method(graph, method)) {
                Ok(Some(address)) => addresses.push((method.index, address)),
                Ok(None) => {}
                Err(issue) => issues.push(issue),
            }
        }

        debug!("Module {}: {} of {} methods placed", module.name, addresses.len(), methods.len());
        (addresses, issues)
    }

    fn resolve_generic_methods(&self, graph: &TypeGraph, resolution: &mut Resolution) {
        let mut seen = HashSet::new();

        for entry in &self.metadata.generic_method_table {
            let Some(instantiation) = usize::try_from(entry.method_spec_index)
                .ok()
                .and_then(|spec| graph.method_spec(spec))
            else {
                debug!("Generic method entry names unknown spec {}", entry.method_spec_index);
                continue;
            };
            if seen.contains(&instantiation) {
                continue;
            }
            let Some(&raw) = usize::try_from(entry.pointer_index)
                .ok()
                .and_then(|p| self.metadata.generic_method_pointers.get(p))
            else {
                continue;
            };

            match self.code_address(raw, || format!("generic method {}", graph.instantiation_name(instantiation))) {
                Ok(Some(address)) => {
                    seen.insert(instantiation);
                    resolution.generic_method_addresses.push((instantiation, address));
                }
                Ok(None) => {}
                Err(issue) => resolution.issues.push(issue),
            }
        }
    }

    fn resolve_field_offsets(&self, graph: &TypeGraph, resolution: &mut Resolution) {
        // Offsets of open generic types depend on their arguments, including
        // the arguments of any generic type they are nested in
        let open: Vec<bool> = graph.types().iter().map(|t| graph.is_open_generic(t.index)).collect();

        for field in graph.fields() {
            let Some(owner) = field.declaring_type else {
                continue;
            };
            if open.get(owner.index()).copied().unwrap_or(true) {
                continue;
            }
            let Some(&offset) = self.metadata.field_offsets.get(field.index.index()) else {
                continue;
            };
            if let Ok(offset) = u32::try_from(offset) {
                resolution.field_offsets.push((field.index, offset));
            }
        }
    }
}

fn describe_method(graph: &TypeGraph, method: &MethodNode) -> String {
    format!(
        "method {} ({}.{})",
        method.index,
        graph.full_name(method.declaring_type),
        method.name
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::GraphBuilder;
    use crate::fixtures::MetadataBuilder;
    use atlas_binary_parser::testing::ElfBuilder;
    use atlas_binary_parser::Permissions;
    use atlas_core::MetadataVersion;

    const V27: MetadataVersion = MetadataVersion::new(27, 0);

    fn two_segment_image() -> BinaryImage {
        let bytes = ElfBuilder::new()
            .segment(0x1000, Permissions::READ | Permissions::EXECUTE, vec![0xC3; 0x1000])
            .segment(0x2000, Permissions::READ | Permissions::WRITE, vec![0; 0x1000])
            .build();
        BinaryImage::parse(bytes.into()).unwrap()
    }

    fn resolve(builder: &MetadataBuilder, registration: Option<&CodeRegistration>) -> (TypeGraph, Vec<Error>) {
        let metadata = Metadata::parse(builder.build().into(), None).unwrap();
        let mut graph = GraphBuilder::new(&metadata).build().unwrap();
        let image = two_segment_image();
        let issues = AddressResolver::new(&image, &metadata, registration)
            .resolve(&graph)
            .attach(&mut graph);
        (graph, issues)
    }

    #[test]
    fn test_normalize_code_pointer() {
        assert_eq!(normalize_code_pointer(Architecture::Arm32, 0x1501), 0x1500);
        assert_eq!(normalize_code_pointer(Architecture::Arm32, 0x1500), 0x1500);
        assert_eq!(normalize_code_pointer(Architecture::Arm64, 0x1501), 0x1501);
        assert_eq!(normalize_code_pointer(Architecture::X64, 0x1501), 0x1501);
    }

    #[test]
    fn test_direct_addresses() {
        let mut builder = MetadataBuilder::new(V27);
        let image = builder.add_image("Assembly-CSharp.dll");
        let player = builder.add_type(image, "Game", "Player");
        builder.add_method(player, "Update", 0x0600_0001);
        builder.add_method(player, "Absent", 0x0600_0002);
        builder.add_method(player, "Sentinel", 0x0600_0003);
        builder.add_method(player, "Wild", 0x0600_0004);
        builder.method_addresses = vec![0x1500, 0, u64::MAX, 0x2500];

        let (graph, issues) = resolve(&builder, None);
        assert_eq!(graph.method(MethodIndex(0)).unwrap().address, Some(Address(0x1500)));
        assert_eq!(graph.method(MethodIndex(1)).unwrap().address, None);
        assert_eq!(graph.method(MethodIndex(2)).unwrap().address, None);
        assert_eq!(graph.method(MethodIndex(3)).unwrap().address, None);

        assert_eq!(issues.len(), 1);
        match &issues[0] {
            Error::AddressOutOfBounds { address, what } => {
                assert_eq!(*address, Address(0x2500));
                assert!(what.contains("Wild"));
            }
            other => panic!("unexpected issue: {other:?}"),
        }
    }

    #[test]
    fn test_heuristic_modules() {
        let mut builder = MetadataBuilder::new(V27);
        let a = builder.add_image("A.dll");
        let a_type = builder.add_type(a, "A", "Thing");
        builder.add_method(a_type, "One", 0x0600_0001);
        builder.add_method(a_type, "Two", 0x0600_0002);
        let b = builder.add_image("B.dll");
        let b_type = builder.add_type(b, "B", "Thing");
        // Declared out of token order; slots follow tokens
        builder.add_method(b_type, "Second", 0x0600_0002);
        builder.add_method(b_type, "First", 0x0600_0001);

        let registration = CodeRegistration {
            address: Address(0x2000),
            strategy: crate::registration::SearchStrategy::Manual,
            method_pointers: Vec::new(),
            modules: vec![
                CodeGenModule {
                    name: "A.dll".to_string(),
                    method_pointers: vec![0x1100],
                },
                CodeGenModule {
                    name: "B.dll".to_string(),
                    method_pointers: vec![0x1200, 0],
                },
            ],
        };

        let (graph, issues) = resolve(&builder, Some(&registration));
        assert_eq!(graph.method(MethodIndex(0)).unwrap().address, None);
        assert_eq!(graph.method(MethodIndex(1)).unwrap().address, None);
        assert_eq!(graph.method(MethodIndex(3)).unwrap().address, Some(Address(0x1200)));
        assert_eq!(graph.method(MethodIndex(2)).unwrap().address, None);

        assert_eq!(issues.len(), 1);
        assert!(matches!(
            &issues[0],
            Error::AddressResolutionAmbiguous { module, methods: 2, slots: 1 } if module == "A.dll"
        ));
    }

    #[test]
    fn test_direct_entry_wins_over_module_slot() {
        let mut builder = MetadataBuilder::new(V27);
        let image = builder.add_image("A.dll");
        let thing = builder.add_type(image, "A", "Thing");
        builder.add_method(thing, "Run", 0x0600_0001);
        builder.method_addresses = vec![0x1500];

        let registration = CodeRegistration {
            address: Address(0x2000),
            strategy: crate::registration::SearchStrategy::Manual,
            method_pointers: Vec::new(),
            modules: vec![CodeGenModule {
                name: "A.dll".to_string(),
                method_pointers: vec![0x1700],
            }],
        };

        let metadata = Metadata::parse(builder.build().into(), None).unwrap();
        let graph = GraphBuilder::new(&metadata).build().unwrap();
        let image = two_segment_image();
        let resolution = AddressResolver::new(&image, &metadata, Some(&registration)).resolve(&graph);
        assert_eq!(resolution.direct_count, 1);
        assert_eq!(resolution.heuristic_count, 0);
        assert_eq!(resolution.method_addresses, vec![(MethodIndex(0), Address(0x1500))]);
    }

    #[test]
    fn test_generic_method_addresses() {
        let mut builder = MetadataBuilder::new(V27);
        let image = builder.add_image("A.dll");
        let thing = builder.add_type(image, "A", "Thing");
        let get = builder.add_method(thing, "Get", 0x0600_0001);
        builder.add_generic_container(get, true, &["T"]);
        let int = builder.usage(crate::types::type_kind::I4, 0);
        let string = builder.usage(crate::types::type_kind::STRING, 0);
        let int_inst = builder.generic_inst(&[int]);
        let string_inst = builder.generic_inst(&[string]);
        for inst in [int_inst, string_inst] {
            builder.method_specs.push(crate::types::Il2CppMethodSpec {
                method_definition_index: get as i32,
                class_inst_index: -1,
                method_inst_index: inst,
            });
        }
        builder.generic_method_pointers = vec![0x1800];
        builder.generic_method_table.push(crate::types::Il2CppGenericMethodTableEntry {
            method_spec_index: 0,
            pointer_index: 0,
        });
        // Method spec 1 points past the pointer table and stays absent
        builder.generic_method_table.push(crate::types::Il2CppGenericMethodTableEntry {
            method_spec_index: 1,
            pointer_index: 9,
        });

        let (graph, issues) = resolve(&builder, None);
        assert!(issues.is_empty());
        let int_instance = graph.method_spec(0).unwrap();
        let string_instance = graph.method_spec(1).unwrap();
        assert_eq!(graph.generic_method_address(int_instance), Some(Address(0x1800)));
        assert_eq!(graph.generic_method_address(string_instance), None);
    }

    #[test]
    fn test_field_offsets() {
        let mut builder = MetadataBuilder::new(V27);
        let image = builder.add_image("A.dll");
        let boxed = builder.add_type(image, "A", "Box`1");
        builder.add_generic_container(boxed, false, &["T"]);
        builder.add_field(boxed, "value", 0x0400_0001, 0x10);
        let thing = builder.add_type(image, "A", "Thing");
        builder.add_field(thing, "health", 0x0400_0002, 0x10);
        builder.add_field(thing, "mana", 0x0400_0003, -1);
        builder.add_field(thing, "lost", 0x0400_0004, 0x18);
        // The last field has no offset entry at all
        builder.field_offsets.truncate(3);

        let (graph, _) = resolve(&builder, None);
        assert_eq!(graph.field(FieldIndex(0)).unwrap().offset, None);
        assert_eq!(graph.field(FieldIndex(1)).unwrap().offset, Some(0x10));
        assert_eq!(graph.field(FieldIndex(2)).unwrap().offset, None);
        assert_eq!(graph.field(FieldIndex(3)).unwrap().offset, None);
    }

    #[test]
    fn test_nested_type_of_generic_outer_has_no_offsets() {
        let mut builder = MetadataBuilder::new(V27);
        let image = builder.add_image("A.dll");
        let outer = builder.add_type(image, "A", "Outer`1");
        builder.add_generic_container(outer, false, &["T"]);
        let inner = builder.add_type(image, "", "Inner");
        builder.type_definitions[inner].declaring_type_index = builder.type_definitions[outer].byval_type_index;
        builder.add_field(inner, "value", 0x0400_0001, 0x10);
        let plain = builder.add_type(image, "A", "Plain");
        builder.add_field(plain, "value", 0x0400_0002, 0x18);

        let (graph, issues) = resolve(&builder, None);
        assert!(issues.is_empty());
        assert_eq!(graph.type_node(TypeIndex(inner as u32)).unwrap().enclosing, Some(TypeIndex(outer as u32)));
        assert_eq!(graph.field(FieldIndex(0)).unwrap().offset, None);
        assert_eq!(graph.field(FieldIndex(1)).unwrap().offset, Some(0x18));
    }
}
