//! The atlas: one handle over the registry and every component
//!
//! Each operation grabs the current snapshot (or the graph built from it)
//! once and works against that for the whole call.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::config::AtlasConfig;
use crate::customization::{Customization, CustomizationKind, CustomizationRegistry};
use crate::error::{AtlasError, Result};
use crate::graph::{GraphCache, MapOptions, RelationGraph, RelationshipMap};
use crate::harness::{EphemeralTestHarness, TestRun};
use crate::introspect::{introspect, IntrospectRequest, SystemReport};
use crate::lineage::{FieldLineage, KindOverview, LineageResolver};
use crate::monitor::{ErrorPatternMonitor, MonitorReport, MonitorRequest};
use crate::registry::{SchemaRegistry, SchemaSnapshot};
use crate::rollback::{RollbackAction, RollbackCoordinator, RollbackResult};
use crate::search::{SearchEngine, SearchOutcome, SearchRequest};
use crate::store::{AccessPolicy, Caller, ChangeNotifier, ErrorFeed, RecordStore};

/// External systems the atlas talks to
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn RecordStore>,
    pub policy: Arc<dyn AccessPolicy>,
    pub errors: Arc<dyn ErrorFeed>,
    pub notifier: Arc<dyn ChangeNotifier>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub action: RollbackAction,
    /// Customization type filter for `list`
    #[serde(default)]
    pub target_type: Option<CustomizationKind>,
    /// Customization id, required for every action but `list`
    #[serde(default)]
    pub target_id: Option<String>,
    /// Target kind filter for `list`
    #[serde(default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RollbackResponse {
    Listed {
        count: usize,
        customizations: Vec<Customization>,
    },
    Transition(RollbackResult),
}

pub struct Atlas {
    config: AtlasConfig,
    schema: Arc<SchemaRegistry>,
    customizations: Arc<CustomizationRegistry>,
    graphs: Arc<GraphCache>,
    search: SearchEngine,
    rollback: RollbackCoordinator,
    monitor: ErrorPatternMonitor,
    harness: EphemeralTestHarness,
}

impl Atlas {
    pub fn new(
        config: AtlasConfig,
        customizations: Arc<CustomizationRegistry>,
        collaborators: Collaborators,
    ) -> Self {
        let schema = Arc::clone(customizations.schema());
        let graphs = Arc::new(GraphCache::new(Arc::clone(&schema)));
        let Collaborators {
            store,
            policy,
            errors,
            notifier,
        } = collaborators;

        Self {
            search: SearchEngine::new(Arc::clone(&store), Arc::clone(&policy), config.search.clone()),
            rollback: RollbackCoordinator::new(
                Arc::clone(&customizations),
                Arc::clone(&graphs),
                Arc::clone(&policy),
                notifier,
                config.rollback.clone(),
            ),
            monitor: ErrorPatternMonitor::new(errors, config.monitor.clone()),
            harness: EphemeralTestHarness::new(store, policy, config.harness.clone()),
            config,
            schema,
            customizations,
            graphs,
        }
    }

    pub fn config(&self) -> &AtlasConfig {
        &self.config
    }

    pub fn snapshot(&self) -> Arc<SchemaSnapshot> {
        self.schema.snapshot()
    }

    pub fn graph(&self) -> Arc<RelationGraph> {
        self.graphs.current()
    }

    pub fn customizations(&self) -> &Arc<CustomizationRegistry> {
        &self.customizations
    }

    pub fn rollback(&self) -> &RollbackCoordinator {
        &self.rollback
    }

    pub async fn universal_search(&self, caller: &Caller, request: &SearchRequest) -> Result<SearchOutcome> {
        self.search.search(&self.snapshot(), caller, request).await
    }

    pub fn explore_fields(&self, kind: &str, field: &str) -> Result<FieldLineage> {
        LineageResolver::new(self.snapshot()).explore(kind, field)
    }

    /// Section-grouped field listing of a kind
    pub fn field_overview(&self, kind: &str, section: Option<&str>) -> Result<KindOverview> {
        LineageResolver::new(self.snapshot()).overview(kind, section)
    }

    pub fn map_relationships(
        &self,
        kind: &str,
        depth: Option<usize>,
        include_standard: Option<bool>,
    ) -> Result<RelationshipMap> {
        let options = MapOptions::from_config(&self.config.graph, depth, include_standard);
        self.graph().map_relationships(kind, &options)
    }

    pub async fn test_created_item(
        &self,
        caller: &Caller,
        kind: &str,
        payload: Map<String, Value>,
    ) -> Result<TestRun> {
        self.harness.test(&self.snapshot(), caller, kind, payload).await
    }

    pub async fn monitor_errors(&self, request: &MonitorRequest) -> Result<MonitorReport> {
        self.monitor.monitor(request).await
    }

    pub async fn rollback_changes(&self, caller: &Caller, request: &RollbackRequest) -> Result<RollbackResponse> {
        if request.action == RollbackAction::List {
            let kind = match request.kind.as_deref() {
                Some(query) => Some(self.snapshot().require_kind(query)?.name.clone()),
                None => None,
            };
            let customizations = self.rollback.list(request.target_type, kind.as_deref());
            return Ok(RollbackResponse::Listed {
                count: customizations.len(),
                customizations,
            });
        }

        let id = request.target_id.as_deref().ok_or_else(|| {
            AtlasError::ValidationFailure(format!("{} needs a target id", request.action))
        })?;
        if let Some(expected) = request.target_type {
            let actual = self.customizations.get(id)?.kind();
            if actual != expected {
                return Err(AtlasError::ValidationFailure(format!(
                    "customization {} is a {}, not a {}",
                    id, actual, expected
                )));
            }
        }
        let result = self.rollback.transition(caller, request.action, id).await?;
        Ok(RollbackResponse::Transition(result))
    }

    pub fn introspect_system(&self, request: &IntrospectRequest) -> Result<SystemReport> {
        introspect(&self.graph(), request)
    }
}
