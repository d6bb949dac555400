//! Named capabilities
//!
//! Every operation the atlas exposes is registered by name against one
//! contract: JSON arguments in, JSON result out. Front ends look capabilities
//! up here instead of knowing the atlas API.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::atlas::{Atlas, RollbackRequest};
use crate::error::{AtlasError, Result};
use crate::introspect::IntrospectRequest;
use crate::monitor::MonitorRequest;
use crate::search::SearchRequest;
use crate::store::Caller;

/// Per-invocation context
#[derive(Debug, Clone)]
pub struct CapabilityContext {
    pub caller: Caller,
    /// Overall deadline for fan-out operations
    pub deadline: Option<Duration>,
}

impl CapabilityContext {
    pub fn new(caller: Caller) -> Self {
        Self {
            caller,
            deadline: None,
        }
    }
}

#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    async fn invoke(&self, ctx: &CapabilityContext, args: Value) -> Result<Value>;
}

/// Name and description of a registered capability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityInfo {
    pub name: String,
    pub description: String,
}

/// Capabilities keyed by name
#[derive(Default)]
pub struct CapabilityRegistry {
    capabilities: BTreeMap<&'static str, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The seven atlas operations
    pub fn standard(atlas: Arc<Atlas>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(UniversalSearch(Arc::clone(&atlas))));
        registry.register(Arc::new(ExploreFields(Arc::clone(&atlas))));
        registry.register(Arc::new(MapRelationships(Arc::clone(&atlas))));
        registry.register(Arc::new(TestCreatedItem(Arc::clone(&atlas))));
        registry.register(Arc::new(MonitorErrors(Arc::clone(&atlas))));
        registry.register(Arc::new(RollbackChanges(Arc::clone(&atlas))));
        registry.register(Arc::new(IntrospectSystem(atlas)));
        debug!(count = registry.capabilities.len(), "Registered capabilities");
        registry
    }

    /// Register a capability, replacing any with the same name
    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        if let Some(previous) = self.capabilities.insert(capability.name(), capability) {
            warn!(name = previous.name(), "Capability registration replaced an existing one");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    /// Registered capabilities in name order
    pub fn list(&self) -> Vec<CapabilityInfo> {
        self.capabilities
            .values()
            .map(|c| CapabilityInfo {
                name: c.name().to_string(),
                description: c.description().to_string(),
            })
            .collect()
    }

    pub async fn invoke(&self, name: &str, ctx: &CapabilityContext, args: Value) -> Result<Value> {
        let capability = self.get(name).ok_or_else(|| AtlasError::NotFound {
            what: "Capability",
            name: name.to_string(),
            suggestions: self
                .capabilities
                .keys()
                .filter(|k| k.contains(name) || name.contains(*k))
                .map(|k| k.to_string())
                .collect(),
        })?;
        debug!(capability = name, caller = %ctx.caller.user, "Invoking capability");
        capability.invoke(ctx, args).await
    }
}

fn parse_args<T: DeserializeOwned>(capability: &str, args: Value) -> Result<T> {
    let args = if args.is_null() {
        Value::Object(Map::new())
    } else {
        args
    };
    serde_json::from_value(args)
        .map_err(|e| AtlasError::ValidationFailure(format!("invalid arguments for {}: {}", capability, e)))
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

struct UniversalSearch(Arc<Atlas>);

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SearchArgs {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    kind: Option<String>,
}

#[async_trait]
impl Capability for UniversalSearch {
    fn name(&self) -> &'static str {
        "universal_search"
    }

    fn description(&self) -> &'static str {
        "Search every readable kind for a text, number or date and rank the hits"
    }

    async fn invoke(&self, ctx: &CapabilityContext, args: Value) -> Result<Value> {
        let args: SearchArgs = parse_args(self.name(), args)?;
        let request = SearchRequest {
            query: args.query,
            limit: args.limit,
            kind: args.kind,
            deadline: ctx.deadline,
        };
        to_json(&self.0.universal_search(&ctx.caller, &request).await?)
    }
}

struct ExploreFields(Arc<Atlas>);

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ExploreArgs {
    kind: String,
    #[serde(default)]
    field: Option<String>,
    #[serde(default)]
    section: Option<String>,
}

#[async_trait]
impl Capability for ExploreFields {
    fn name(&self) -> &'static str {
        "explore_fields"
    }

    fn description(&self) -> &'static str {
        "Trace a field's derivation chain and visibility rules, or list a kind's fields by section"
    }

    async fn invoke(&self, _ctx: &CapabilityContext, args: Value) -> Result<Value> {
        let args: ExploreArgs = parse_args(self.name(), args)?;
        match args.field {
            Some(field) => to_json(&self.0.explore_fields(&args.kind, &field)?),
            None => to_json(&self.0.field_overview(&args.kind, args.section.as_deref())?),
        }
    }
}

struct MapRelationships(Arc<Atlas>);

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct MapArgs {
    kind: String,
    #[serde(default)]
    depth: Option<usize>,
    #[serde(default)]
    include_standard: Option<bool>,
}

#[async_trait]
impl Capability for MapRelationships {
    fn name(&self) -> &'static str {
        "map_relationships"
    }

    fn description(&self) -> &'static str {
        "Map the kinds a kind links to, is linked from, embeds and hands off to"
    }

    async fn invoke(&self, _ctx: &CapabilityContext, args: Value) -> Result<Value> {
        let args: MapArgs = parse_args(self.name(), args)?;
        to_json(&self.0.map_relationships(&args.kind, args.depth, args.include_standard)?)
    }
}

struct TestCreatedItem(Arc<Atlas>);

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TestArgs {
    kind: String,
    #[serde(default)]
    payload: Map<String, Value>,
}

#[async_trait]
impl Capability for TestCreatedItem {
    fn name(&self) -> &'static str {
        "test_created_item"
    }

    fn description(&self) -> &'static str {
        "Create, re-read and delete a throwaway record to prove a kind works end to end"
    }

    async fn invoke(&self, ctx: &CapabilityContext, args: Value) -> Result<Value> {
        let args: TestArgs = parse_args(self.name(), args)?;
        to_json(&self.0.test_created_item(&ctx.caller, &args.kind, args.payload).await?)
    }
}

struct MonitorErrors(Arc<Atlas>);

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct MonitorArgs {
    #[serde(default)]
    window_hours: Option<u32>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    kind_filter: Option<String>,
}

#[async_trait]
impl Capability for MonitorErrors {
    fn name(&self) -> &'static str {
        "monitor_errors"
    }

    fn description(&self) -> &'static str {
        "Group recent errors by signature and flag the ones trending against the previous window"
    }

    async fn invoke(&self, ctx: &CapabilityContext, args: Value) -> Result<Value> {
        let args: MonitorArgs = parse_args(self.name(), args)?;
        let request = MonitorRequest {
            window_hours: args.window_hours,
            limit: args.limit,
            kind_filter: args.kind_filter,
            deadline: ctx.deadline,
        };
        to_json(&self.0.monitor_errors(&request).await?)
    }
}

struct RollbackChanges(Arc<Atlas>);

#[async_trait]
impl Capability for RollbackChanges {
    fn name(&self) -> &'static str {
        "rollback_changes"
    }

    fn description(&self) -> &'static str {
        "List, disable, enable or delete customizations without breaking their dependents"
    }

    async fn invoke(&self, ctx: &CapabilityContext, args: Value) -> Result<Value> {
        let request: RollbackRequest = parse_args(self.name(), args)?;
        to_json(&self.0.rollback_changes(&ctx.caller, &request).await?)
    }
}

struct IntrospectSystem(Arc<Atlas>);

#[async_trait]
impl Capability for IntrospectSystem {
    fn name(&self) -> &'static str {
        "introspect_system"
    }

    fn description(&self) -> &'static str {
        "Summarize installed apps, modules, kinds, customizations and link neighbourhoods"
    }

    async fn invoke(&self, _ctx: &CapabilityContext, args: Value) -> Result<Value> {
        let request: IntrospectRequest = parse_args(self.name(), args)?;
        to_json(&self.0.introspect_system(&request)?)
    }
}
