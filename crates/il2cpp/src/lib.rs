//! IL2CPP metadata parsing, type graph construction and address resolution
//!
//! This crate reads a `global-metadata.dat` blob, builds an indexed graph of
//! the types, methods and fields it declares, and correlates them with native
//! code addresses found in the accompanying game binary.

pub mod builder;
pub mod engine;
pub mod graph;
pub mod layout;
pub mod metadata;
pub mod registration;
pub mod resolver;
pub mod types;

#[cfg(test)]
mod fixtures;

pub use builder::GraphBuilder;
pub use engine::ResolutionEngine;
pub use graph::{
    ConstantValue, FieldIndex, FieldNode, GenericDefinition, GenericInstantiation, GenericInstantiationIndex,
    GenericParameterIndex, GenericParameterNode, MethodIndex, MethodNode, ModuleIndex, ModuleNode, ParameterNode,
    PrimitiveType, TypeGraph, TypeIndex, TypeNode, TypeRef, TypeRefId,
};
pub use layout::{HeaderSlot, MetadataLayout};
pub use metadata::Metadata;
pub use registration::{CodeRegistration, SearchStrategy};
pub use resolver::{normalize_code_pointer, AddressResolver, Resolution};

use atlas_core::{EngineConfig, Result};
use std::path::Path;

/// Parse IL2CPP metadata from a file, using the declared version
pub fn parse_metadata(path: &Path) -> Result<Metadata> {
    Metadata::load(path, None)
}

/// Run a full resolution session over a binary and its metadata
pub fn resolve(binary_path: &Path, metadata_path: &Path, config: &EngineConfig) -> Result<ResolutionEngine> {
    ResolutionEngine::open(binary_path, metadata_path, config)
}
