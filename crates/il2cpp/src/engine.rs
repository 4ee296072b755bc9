//! Resolution engine: one session from input bytes to a resolved graph

use crate::builder::GraphBuilder;
use crate::graph::*;
use crate::metadata::Metadata;
use crate::registration::{find_code_registration, CodeRegistration, SearchStrategy};
use crate::resolver::AddressResolver;
use crate::types::is_supported_version;
use atlas_binary_parser::{BinaryImage, ByteBuffer, Segment};
use atlas_core::{Address, EngineConfig, Error, ResolutionStatistics, Result, SessionSummary};
use chrono::Utc;
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::Path;
use std::thread;
use tracing::{dispatcher, info, info_span, Span};
use uuid::Uuid;

/// A completed analysis session
///
/// Holds the loaded image, the parsed metadata and the resolved graph.
/// Everything is read-only once construction returns.
pub struct ResolutionEngine {
    image: BinaryImage,
    metadata: Metadata,
    graph: TypeGraph,
    registration: Option<CodeRegistration>,
    issues: Vec<Error>,
    summary: SessionSummary,
}

impl ResolutionEngine {
    /// Map both files and run a session
    pub fn open(image_path: &Path, metadata_path: &Path, config: &EngineConfig) -> Result<Self> {
        check_config(config)?;
        info!("Opening image {:?} with metadata {:?}", image_path, metadata_path);
        let image = ByteBuffer::map_file(image_path)?;
        let metadata = ByteBuffer::map_file(metadata_path)?;
        Self::run(image, metadata, config)
    }

    /// Run a session over in-memory inputs
    pub fn from_bytes(
        image: impl Into<ByteBuffer>,
        metadata: impl Into<ByteBuffer>,
        config: &EngineConfig,
    ) -> Result<Self> {
        check_config(config)?;
        Self::run(image.into(), metadata.into(), config)
    }

    fn run(image: ByteBuffer, metadata: ByteBuffer, config: &EngineConfig) -> Result<Self> {
        let session_id = Uuid::new_v4();
        let span = info_span!("session", id = %session_id);

        // Workers log to whatever subscriber the caller has installed
        let dispatch = dispatcher::get_default(|current| current.clone());
        let mut builder = rayon::ThreadPoolBuilder::new();
        if let Some(threads) = config.worker_threads {
            builder = builder.num_threads(threads);
        }
        let pool = builder
            .spawn_handler(move |worker| {
                let dispatch = dispatch.clone();
                let mut spawner = thread::Builder::new();
                if let Some(name) = worker.name() {
                    spawner = spawner.name(name.to_owned());
                }
                if let Some(size) = worker.stack_size() {
                    spawner = spawner.stack_size(size);
                }
                spawner.spawn(move || dispatcher::with_default(&dispatch, || worker.run()))?;
                Ok(())
            })
            .build()
            .map_err(|e| Error::config(format!("cannot start worker pool: {e}")))?;

        pool.install(|| span.in_scope(|| Self::analyze(session_id, image, metadata, config)))
    }

    fn analyze(session_id: Uuid, image: ByteBuffer, metadata: ByteBuffer, config: &EngineConfig) -> Result<Self> {
        info!("Starting resolution session");

        // The two inputs are independent until the graph is built
        let span = Span::current();
        let (image, metadata) = rayon::join(
            || span.in_scope(|| BinaryImage::parse(image)),
            || span.in_scope(|| Metadata::parse(metadata, config.metadata_version)),
        );
        let image = image?;
        let metadata = metadata?;

        let mut graph = GraphBuilder::new(&metadata).build()?;

        let mut issues = Vec::new();
        let registration = find_code_registration(&image, &metadata, config.code_registration, &mut issues);
        let resolution = AddressResolver::new(&image, &metadata, registration.as_ref()).resolve(&graph);
        let direct_addresses = resolution.direct_count;
        let heuristic_addresses = resolution.heuristic_count;
        issues.extend(resolution.attach(&mut graph));

        let statistics = ResolutionStatistics {
            total_types: graph.types().len(),
            total_methods: graph.methods().len(),
            total_fields: graph.fields().len(),
            generic_instantiations: graph.instantiations().count(),
            direct_addresses,
            heuristic_addresses,
            unresolved_methods: graph.methods().iter().filter(|m| m.address.is_none()).count(),
            generic_method_addresses: graph.generic_method_address_count(),
            issues: issues.len(),
        };

        info!(
            "Session complete: {} types, {} methods, {} direct + {} heuristic addresses, {} issues",
            statistics.total_types,
            statistics.total_methods,
            statistics.direct_addresses,
            statistics.heuristic_addresses,
            statistics.issues
        );

        let summary = SessionSummary {
            session_id,
            completed_at: Utc::now(),
            format: image.format(),
            architecture: image.architecture(),
            metadata_version: metadata.version,
            statistics,
        };

        Ok(Self {
            image,
            metadata,
            graph,
            registration,
            issues,
            summary,
        })
    }

    pub fn graph(&self) -> &TypeGraph {
        &self.graph
    }

    pub fn image(&self) -> &BinaryImage {
        &self.image
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn session_id(&self) -> Uuid {
        self.summary.session_id
    }

    pub fn resolve_method_address(&self, method: MethodIndex) -> Option<Address> {
        self.graph.method(method)?.address
    }

    /// Address of a generic method closed over the given argument lists
    pub fn resolve_generic_method_address(
        &self,
        method: MethodIndex,
        class_arguments: &[TypeRefId],
        method_arguments: &[TypeRefId],
    ) -> Option<Address> {
        let instantiation = self.graph.find_instantiation(&GenericInstantiation {
            definition: GenericDefinition::Method(method),
            class_arguments: class_arguments.to_vec(),
            method_arguments: method_arguments.to_vec(),
        })?;
        self.graph.generic_method_address(instantiation)
    }

    pub fn resolve_field_offset(&self, field: FieldIndex) -> Option<u32> {
        self.graph.field(field)?.offset
    }

    pub fn lookup_type_by_name(&self, namespace: &str, name: &str) -> Option<&TypeNode> {
        self.graph.lookup_type_by_name(namespace, name)
    }

    /// Segment containing an address, if any
    pub fn classify_address(&self, address: Address) -> Option<&Segment> {
        self.image.segment_containing(address)
    }

    /// Non-fatal address resolution diagnostics
    pub fn issues(&self) -> &[Error] {
        &self.issues
    }

    /// How the code registration was located, if it was
    pub fn registration_strategy(&self) -> Option<SearchStrategy> {
        self.registration.as_ref().map(|r| r.strategy)
    }

    pub fn summary(&self) -> &SessionSummary {
        &self.summary
    }

    /// Write the session summary as JSON
    pub fn write_summary(&self, path: &Path) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, &self.summary).map_err(io::Error::from)?;
        info!("Wrote session summary to {:?}", path);
        Ok(())
    }
}

/// Reject configurations before any input is touched
fn check_config(config: &EngineConfig) -> Result<()> {
    config.validate()?;
    if let Some(version) = config.metadata_version {
        if !is_supported_version(version) {
            return Err(Error::UnsupportedMetadataVersion(version));
        }
    }
    Ok(())
}
