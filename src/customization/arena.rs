//! Customization dependency arena
//!
//! Customizations are nodes in an arena; "A references B" is an explicit edge
//! `A -> B` stored once and indexed from both ends, so a delete-safety check
//! walks only B's incoming edges and a cycle check only what B reaches.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use regex::Regex;
use tracing::{debug, info};

use super::{Customization, CustomizationDef, CustomizationKind, CustomizationStatus, Overlay};
use crate::error::{AtlasError, Result};
use crate::registry::SchemaRegistry;
use crate::schema::KindName;

/// Why one customization depends on another
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeReason {
    Declared,
    ScriptReference,
    PropertyOverride,
    Derivation,
}

#[derive(Debug, Clone)]
struct DependencyEdge {
    dependent: usize,
    dependency: usize,
    reason: EdgeReason,
}

#[derive(Debug, Clone)]
struct Node {
    id: String,
    target_kind: KindName,
    target_field: Option<String>,
    status: CustomizationStatus,
    overlay: Overlay,
    /// Whole-word pattern for an added field's name, compiled once
    mention: Option<Regex>,
}

impl Node {
    fn new(def: CustomizationDef) -> Self {
        let target_field = match &def.overlay {
            Overlay::AddedField { field } => Some(field.name.clone()),
            _ => def.target_field,
        };
        let mention = match &def.overlay {
            Overlay::AddedField { field } => {
                Regex::new(&format!(r"\b{}\b", regex::escape(&field.name))).ok()
            }
            _ => None,
        };
        Self {
            id: def.id,
            target_kind: def.target_kind,
            target_field,
            status: def.status,
            overlay: def.overlay,
            mention,
        }
    }

    fn is_live(&self) -> bool {
        self.status != CustomizationStatus::Deleted
    }

    fn added_field(&self) -> Option<&str> {
        match &self.overlay {
            Overlay::AddedField { field } => Some(field.name.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct Arena {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    edges: Vec<DependencyEdge>,
    /// node -> edges where it is the dependency
    incoming: Vec<Vec<usize>>,
    /// node -> edges where it is the dependent
    outgoing: Vec<Vec<usize>>,
    kind_versions: HashMap<KindName, u64>,
}

impl Arena {
    fn lookup(&self, id: &str) -> Result<usize> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| AtlasError::not_found("Customization", id))
    }

    fn version(&self, kind: &str) -> u64 {
        self.kind_versions.get(kind).copied().unwrap_or(0)
    }

    fn bump(&mut self, kind: &str) -> u64 {
        let version = self.kind_versions.entry(kind.to_string()).or_insert(0);
        *version += 1;
        *version
    }

    /// Live customizations that depend on `idx`
    fn live_dependents(&self, idx: usize) -> BTreeSet<String> {
        self.incoming[idx]
            .iter()
            .map(|&e| self.edges[e].dependent)
            .filter(|&d| self.nodes[d].is_live())
            .map(|d| self.nodes[d].id.clone())
            .collect()
    }

    fn view(&self, idx: usize) -> Customization {
        let node = &self.nodes[idx];
        Customization {
            id: node.id.clone(),
            target_kind: node.target_kind.clone(),
            target_field: node.target_field.clone(),
            status: node.status,
            overlay: node.overlay.clone(),
            dependents: self.live_dependents(idx),
        }
    }

    fn views(&self) -> Vec<Customization> {
        (0..self.nodes.len()).map(|i| self.view(i)).collect()
    }

    fn has_edge(&self, dependent: usize, dependency: usize) -> bool {
        self.outgoing[dependent]
            .iter()
            .any(|&e| self.edges[e].dependency == dependency)
    }

    /// Path `dependency -> ... -> dependent` if adding `dependent -> dependency` closes a cycle
    fn cycle_path(&self, dependent: usize, dependency: usize) -> Option<Vec<usize>> {
        if dependent == dependency {
            return Some(vec![dependent]);
        }
        let mut stack = vec![vec![dependency]];
        let mut visited = vec![false; self.nodes.len()];
        while let Some(path) = stack.pop() {
            let Some(&current) = path.last() else { continue };
            if current == dependent {
                return Some(path);
            }
            if std::mem::replace(&mut visited[current], true) {
                continue;
            }
            for &e in &self.outgoing[current] {
                let mut next = path.clone();
                next.push(self.edges[e].dependency);
                stack.push(next);
            }
        }
        None
    }

    fn add_edge(&mut self, dependent: usize, dependency: usize, reason: EdgeReason) -> Result<()> {
        if self.has_edge(dependent, dependency) {
            return Ok(());
        }
        if let Some(path) = self.cycle_path(dependent, dependency) {
            let mut names: Vec<String> = vec![self.nodes[dependent].id.clone()];
            names.extend(path.into_iter().map(|i| self.nodes[i].id.clone()));
            return Err(AtlasError::DependencyCycle { path: names });
        }
        debug!(
            dependent = %self.nodes[dependent].id,
            dependency = %self.nodes[dependency].id,
            ?reason,
            "Recorded customization dependency"
        );
        let edge = self.edges.len();
        self.edges.push(DependencyEdge {
            dependent,
            dependency,
            reason,
        });
        self.outgoing[dependent].push(edge);
        self.incoming[dependency].push(edge);
        Ok(())
    }

    /// Target kind of a link field on `kind`, looking at base fields then added fields
    fn link_target(&self, schema: &SchemaRegistry, kind: &str, link_field: &str) -> Option<String> {
        if let Some(field) = schema.base_kind(kind).and_then(|k| k.field(link_field)) {
            return field.target_kind().map(String::from);
        }
        self.nodes
            .iter()
            .filter(|n| n.is_live() && n.target_kind == kind)
            .find_map(|n| match &n.overlay {
                Overlay::AddedField { field } if field.name == link_field => {
                    field.target_kind().map(String::from)
                }
                _ => None,
            })
    }

    /// Does node `a` structurally reference node `b`?
    fn references(&self, schema: &SchemaRegistry, a: usize, b: usize) -> Option<EdgeReason> {
        let (na, nb) = (&self.nodes[a], &self.nodes[b]);
        let field = nb.added_field()?;
        match &na.overlay {
            Overlay::Script { body, .. } if na.target_kind == nb.target_kind => {
                let pattern = nb.mention.as_ref()?;
                pattern.is_match(body).then_some(EdgeReason::ScriptReference)
            }
            Overlay::PropertyOverride { .. }
                if na.target_kind == nb.target_kind && na.target_field.as_deref() == Some(field) =>
            {
                Some(EdgeReason::PropertyOverride)
            }
            Overlay::AddedField { field: own } => {
                let (link, remote) = own.derivation()?;
                let through = na.target_kind == nb.target_kind && link == field;
                let lands = remote == field
                    && self.link_target(schema, &na.target_kind, link).as_deref()
                        == Some(nb.target_kind.as_str());
                (through || lands).then_some(EdgeReason::Derivation)
            }
            _ => None,
        }
    }
}

/// Committed state change of a customization
#[derive(Debug, Clone)]
pub struct Transition {
    pub before: Customization,
    pub after: Customization,
    /// Version of the target kind after the commit
    pub kind_version: u64,
    /// Generation of the schema snapshot published by the commit
    pub snapshot_generation: u64,
}

/// Tracks customization overlays and their dependency edges
pub struct CustomizationRegistry {
    schema: Arc<SchemaRegistry>,
    inner: Mutex<Arena>,
}

impl CustomizationRegistry {
    pub fn new(schema: Arc<SchemaRegistry>) -> Self {
        Self {
            schema,
            inner: Mutex::new(Arena::default()),
        }
    }

    pub fn schema(&self) -> &Arc<SchemaRegistry> {
        &self.schema
    }

    fn lock(&self) -> MutexGuard<'_, Arena> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a batch; added fields go first so references resolve regardless of input order
    pub fn register_all(&self, mut defs: Vec<CustomizationDef>) -> Result<Vec<Customization>> {
        defs.sort_by_key(|d| match d.overlay.kind() {
            CustomizationKind::AddedField => 0,
            CustomizationKind::PropertyOverride => 1,
            CustomizationKind::Script => 2,
        });
        defs.into_iter().map(|d| self.register(d)).collect()
    }

    /// Register a customization, derive its dependency edges and publish a new snapshot
    pub fn register(&self, def: CustomizationDef) -> Result<Customization> {
        if self.schema.base_kind(&def.target_kind).is_none() {
            return Err(AtlasError::not_found("Kind", def.target_kind.clone()));
        }

        let mut arena = self.lock();
        if arena.index.contains_key(&def.id) {
            return Err(AtlasError::ValidationFailure(format!(
                "customization '{}' already registered",
                def.id
            )));
        }
        let explicit = def
            .depends_on
            .iter()
            .map(|id| arena.lookup(id))
            .collect::<Result<Vec<_>>>()?;

        let id = def.id.clone();
        let idx = arena.nodes.len();
        arena.nodes.push(Node::new(def));
        arena.index.insert(id.clone(), idx);
        arena.incoming.push(Vec::new());
        arena.outgoing.push(Vec::new());

        if let Err(err) = self.link_new_node(&mut arena, idx, &explicit) {
            // Roll the half-registered node back out
            for e in arena.outgoing[idx].clone() {
                let dependency = arena.edges[e].dependency;
                arena.incoming[dependency].retain(|&x| x != e);
            }
            for e in arena.incoming[idx].clone() {
                let dependent = arena.edges[e].dependent;
                arena.outgoing[dependent].retain(|&x| x != e);
            }
            arena.nodes.pop();
            arena.incoming.pop();
            arena.outgoing.pop();
            arena.index.remove(&id);
            return Err(err);
        }

        let kind = arena.nodes[idx].target_kind.clone();
        arena.bump(&kind);
        self.schema.refresh(&arena.views());
        debug!(id = %id, kind = %kind, "Registered customization");
        Ok(arena.view(idx))
    }

    fn link_new_node(&self, arena: &mut Arena, idx: usize, explicit: &[usize]) -> Result<()> {
        for &dependency in explicit {
            arena.add_edge(idx, dependency, EdgeReason::Declared)?;
        }
        for other in 0..idx {
            if !arena.nodes[other].is_live() {
                continue;
            }
            if let Some(reason) = arena.references(&self.schema, idx, other) {
                arena.add_edge(idx, other, reason)?;
            }
            if let Some(reason) = arena.references(&self.schema, other, idx) {
                arena.add_edge(other, idx, reason)?;
            }
        }
        Ok(())
    }

    /// Current view of a customization
    pub fn get(&self, id: &str) -> Result<Customization> {
        let arena = self.lock();
        let idx = arena.lookup(id)?;
        Ok(arena.view(idx))
    }

    /// Current view plus the version of its target kind
    pub fn read_versioned(&self, id: &str) -> Result<(Customization, u64)> {
        let arena = self.lock();
        let idx = arena.lookup(id)?;
        let view = arena.view(idx);
        let version = arena.version(&view.target_kind);
        Ok((view, version))
    }

    /// Version of a kind's customization set
    pub fn version_of(&self, kind: &str) -> u64 {
        self.lock().version(kind)
    }

    /// Ids this customization depends on (live ones only)
    pub fn dependencies_of(&self, id: &str) -> Result<BTreeSet<String>> {
        let arena = self.lock();
        let idx = arena.lookup(id)?;
        Ok(arena.outgoing[idx]
            .iter()
            .map(|&e| arena.edges[e].dependency)
            .filter(|&d| arena.nodes[d].is_live())
            .map(|d| arena.nodes[d].id.clone())
            .collect())
    }

    /// Customizations filtered by type and target kind, in registration order
    pub fn list(&self, kind: Option<CustomizationKind>, target_kind: Option<&str>) -> Vec<Customization> {
        let arena = self.lock();
        (0..arena.nodes.len())
            .filter(|&i| kind.map_or(true, |k| arena.nodes[i].overlay.kind() == k))
            .filter(|&i| target_kind.map_or(true, |t| arena.nodes[i].target_kind == t))
            .map(|i| arena.view(i))
            .collect()
    }

    pub fn all(&self) -> Vec<Customization> {
        self.lock().views()
    }

    /// Set a customization's status if its kind is still at `expected_version`.
    ///
    /// Deleting re-checks live dependents under the lock.
    pub fn commit(
        &self,
        id: &str,
        expected_version: u64,
        status: CustomizationStatus,
    ) -> Result<Transition> {
        let mut arena = self.lock();
        let idx = arena.lookup(id)?;
        let kind = arena.nodes[idx].target_kind.clone();

        let actual = arena.version(&kind);
        if actual != expected_version {
            return Err(AtlasError::StaleVersion {
                kind,
                expected: expected_version,
                actual,
            });
        }

        let before = arena.view(idx);
        if before.status == CustomizationStatus::Deleted {
            return Err(AtlasError::InvalidTransition {
                id: id.to_string(),
                from: before.status.to_string(),
                action: status.to_string(),
            });
        }
        if status == CustomizationStatus::Deleted && !before.dependents.is_empty() {
            return Err(AtlasError::DependencyConflict {
                id: id.to_string(),
                blockers: before.dependents.iter().cloned().collect(),
            });
        }

        arena.nodes[idx].status = status;
        let kind_version = arena.bump(&kind);
        let snapshot = self.schema.refresh(&arena.views());
        let after = arena.view(idx);
        info!(id, from = %before.status, to = %after.status, kind_version, "Customization status changed");

        Ok(Transition {
            before,
            after,
            kind_version,
            snapshot_generation: snapshot.generation(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntityKind, FieldDef, FieldType};

    fn customizations() -> CustomizationRegistry {
        let schema = Arc::new(SchemaRegistry::new(
            vec![
                EntityKind::new("Customer")
                    .with_field(FieldDef::new("full_name", FieldType::ShortText)),
                EntityKind::new("Order")
                    .with_field(FieldDef::link("customer", "Customer"))
                    .with_field(FieldDef::new("total", FieldType::Number)),
            ],
            Vec::new(),
        ));
        CustomizationRegistry::new(schema)
    }

    #[test]
    fn test_script_reference_creates_edge() {
        let reg = customizations();
        reg.register(CustomizationDef::added_field(
            "cf-region",
            "Customer",
            FieldDef::new("region", FieldType::ShortText),
        ))
        .unwrap();
        reg.register(CustomizationDef::script(
            "ss-validate",
            "Customer",
            "before_save",
            "if not doc.region: raise ValueError",
        ))
        .unwrap();
        reg.register(CustomizationDef::script(
            "ss-other",
            "Customer",
            "after_save",
            "doc.regional_code = 1",
        ))
        .unwrap();

        let field = reg.get("cf-region").unwrap();
        assert_eq!(field.dependents, BTreeSet::from(["ss-validate".to_string()]));
        assert_eq!(
            reg.dependencies_of("ss-validate").unwrap(),
            BTreeSet::from(["cf-region".to_string()])
        );
    }

    #[test]
    fn test_field_pattern_matches_scripts_registered_earlier() {
        let reg = customizations();
        for (id, body) in [
            ("ss-tier", "doc.tier = 'gold' if doc.credit > 10 else 'basic'"),
            ("ss-credit", "frappe.throw(str(doc.credit))"),
            ("ss-unrelated", "doc.tiered_pricing = 1"),
        ] {
            reg.register(CustomizationDef::script(id, "Customer", "validate", body))
                .unwrap();
        }
        for name in ["tier", "credit"] {
            reg.register(CustomizationDef::added_field(
                format!("cf-{}", name),
                "Customer",
                FieldDef::new(name, FieldType::ShortText),
            ))
            .unwrap();
        }

        assert_eq!(
            reg.get("cf-tier").unwrap().dependents,
            BTreeSet::from(["ss-tier".to_string()])
        );
        assert_eq!(
            reg.get("cf-credit").unwrap().dependents,
            BTreeSet::from(["ss-credit".to_string(), "ss-tier".to_string()])
        );
    }

    #[test]
    fn test_edges_are_order_independent_in_batches() {
        let reg = customizations();
        reg.register_all(vec![
            CustomizationDef::property_override("ps-region", "Customer", Some("region"), "hidden", serde_json::json!(true)),
            CustomizationDef::added_field("cf-region", "Customer", FieldDef::new("region", FieldType::ShortText)),
        ])
        .unwrap();
        assert!(reg.get("cf-region").unwrap().dependents.contains("ps-region"));
    }

    #[test]
    fn test_derivation_landing_on_added_field() {
        let reg = customizations();
        reg.register(CustomizationDef::added_field(
            "cf-region",
            "Customer",
            FieldDef::new("region", FieldType::ShortText),
        ))
        .unwrap();
        reg.register(CustomizationDef::added_field(
            "cf-order-region",
            "Order",
            FieldDef::new("customer_region", FieldType::ShortText).derived("customer.region"),
        ))
        .unwrap();

        assert!(reg.get("cf-region").unwrap().dependents.contains("cf-order-region"));
    }

    #[test]
    fn test_declared_cycle_rejected() {
        let reg = customizations();
        reg.register(CustomizationDef::script("ss-region", "Customer", "validate", "doc.region"))
            .unwrap();
        reg.register(CustomizationDef::script("ss-audit", "Customer", "on_update", "pass").depends_on("ss-region"))
            .unwrap();

        // ss-region picks up a derived edge onto cf-region, so cf-region -> ss-audit closes a loop
        let err = reg
            .register(
                CustomizationDef::added_field("cf-region", "Customer", FieldDef::new("region", FieldType::ShortText))
                    .depends_on("ss-audit"),
            )
            .unwrap_err();
        match err {
            AtlasError::DependencyCycle { path } => {
                assert_eq!(path.first(), path.last());
                assert!(path.contains(&"cf-region".to_string()));
                assert!(path.contains(&"ss-audit".to_string()));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
        assert!(reg.get("cf-region").is_err());
        assert!(reg.get("ss-region").unwrap().dependents.contains("ss-audit"));
        assert!(reg.dependencies_of("ss-region").unwrap().is_empty());

        assert!(matches!(
            reg.register(CustomizationDef::script("ss-region", "Order", "validate", "pass")),
            Err(AtlasError::ValidationFailure(_))
        ));
    }

    #[test]
    fn test_commit_checks_version_and_dependents() {
        let reg = customizations();
        reg.register(CustomizationDef::added_field(
            "cf-region",
            "Customer",
            FieldDef::new("region", FieldType::ShortText),
        ))
        .unwrap();
        reg.register(CustomizationDef::script("ss", "Customer", "validate", "doc.region"))
            .unwrap();

        let (_, version) = reg.read_versioned("cf-region").unwrap();
        assert!(matches!(
            reg.commit("cf-region", version, CustomizationStatus::Deleted),
            Err(AtlasError::DependencyConflict { .. })
        ));
        assert!(matches!(
            reg.commit("cf-region", version + 7, CustomizationStatus::Disabled),
            Err(AtlasError::StaleVersion { .. })
        ));

        let t = reg.commit("ss", version, CustomizationStatus::Deleted).unwrap();
        assert_eq!(t.after.status, CustomizationStatus::Deleted);
        assert!(reg.get("cf-region").unwrap().dependents.is_empty());

        let version = reg.version_of("Customer");
        reg.commit("cf-region", version, CustomizationStatus::Deleted).unwrap();
        let snapshot = reg.schema().snapshot();
        assert!(snapshot.kind("Customer").unwrap().field("region").is_none());
        assert_eq!(snapshot.generation(), t.snapshot_generation + 1);
    }
}
