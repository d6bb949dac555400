//! Kind Atlas
//!
//! Metadata introspection and relationship mapping for self-describing record
//! stores, where entity kinds are themselves data and customizations (added
//! fields, property overrides, scripts) are layered over a base schema.
//!
//! ## Features
//!
//! - **Relationship Graph**: forward/reverse links, embedded tables, dynamic links and workflow hand-offs
//! - **Field Lineage**: derivation chains and restricted visibility expressions
//! - **Universal Search**: typed fan-out across kinds with isolated per-kind failures
//! - **Safe Rollback**: dependency-checked customization transitions with an audit trail
//! - **Error Patterns**: signature grouping and window-over-window trends
//! - **Test Harness**: create/verify/delete runs that always clean up
//!
//! ## Architecture
//!
//! ```text
//! SchemaRegistry ──► SchemaSnapshot (Arc, immutable)
//!      ▲                 │
//!      │ refresh         ├──► RelationGraph ──► map_relationships / introspect
//! CustomizationRegistry  ├──► LineageResolver
//!      ▲                 ├──► SearchEngine ──► RecordStore
//!      │                 └──► EphemeralTestHarness ──► RecordStore
//! RollbackCoordinator
//!
//! ErrorPatternMonitor ──► ErrorFeed
//! ```

pub mod atlas;
pub mod capability;
pub mod checksum;
pub mod config;
pub mod customization;
pub mod error;
pub mod graph;
pub mod harness;
pub mod introspect;
pub mod lineage;
pub mod loader;
pub mod monitor;
pub mod registry;
pub mod rollback;
pub mod schema;
pub mod search;
pub mod store;

pub use atlas::{Atlas, Collaborators, RollbackRequest, RollbackResponse};
pub use capability::{Capability, CapabilityContext, CapabilityRegistry};
pub use checksum::Fingerprint;
pub use config::AtlasConfig;
pub use customization::{Customization, CustomizationDef, CustomizationRegistry, CustomizationStatus};
pub use error::{AtlasError, Result};
pub use graph::{EdgeKind, GraphCache, MapOptions, RelationGraph, RelationshipMap};
pub use registry::{SchemaRegistry, SchemaSnapshot};
pub use schema::{EntityKind, FieldDef, FieldType};
pub use store::Caller;
