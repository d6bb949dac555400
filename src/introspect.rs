//! System introspection
//!
//! Aggregated metadata about the current snapshot: installed apps, modules,
//! kinds, customizations and the link neighbourhood of one kind.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::customization::{Customization, CustomizationKind};
use crate::error::{AtlasError, Result};
use crate::graph::{EdgeKind, EdgeView, RelationGraph};
use crate::registry::AppInfo;
use crate::schema::{EntityKind, KindName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Apps,
    Modules,
    Kinds,
    Customizations,
    Links,
    All,
}

impl Scope {
    fn covers(self, other: Scope) -> bool {
        self == Scope::All || self == other
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Scope::Apps => "apps",
            Scope::Modules => "modules",
            Scope::Kinds => "kinds",
            Scope::Customizations => "customizations",
            Scope::Links => "links",
            Scope::All => "all",
        };
        f.write_str(s)
    }
}

impl FromStr for Scope {
    type Err = AtlasError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "apps" => Ok(Scope::Apps),
            "modules" => Ok(Scope::Modules),
            "kinds" => Ok(Scope::Kinds),
            "customizations" => Ok(Scope::Customizations),
            "links" => Ok(Scope::Links),
            "all" => Ok(Scope::All),
            other => Err(AtlasError::ValidationFailure(format!(
                "unknown scope '{}' (expected apps, modules, kinds, customizations, links or all)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntrospectRequest {
    pub scope: Scope,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub module: Option<String>,
}

impl IntrospectRequest {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            kind: None,
            module: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSummary {
    pub module: String,
    pub kind_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindSummary {
    pub name: KindName,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    pub is_child: bool,
    pub is_singleton: bool,
    pub is_submittable: bool,
    /// Only filled when a single kind was requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<KindDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindDetail {
    pub field_count: usize,
    pub custom_field_count: usize,
    pub has_workflow: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub naming: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title_field: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomizationGroup {
    pub count: usize,
    pub items: Vec<Customization>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomizationIndex {
    pub added_fields: CustomizationGroup,
    pub scripts: CustomizationGroup,
    pub property_overrides: CustomizationGroup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkReport {
    pub kind: KindName,
    /// Edges leaving the kind (reverse links left out)
    pub outgoing: Vec<EdgeView>,
    /// Edges from other kinds into this one
    pub incoming: Vec<EdgeView>,
    pub outgoing_count: usize,
    pub incoming_count: usize,
    /// Forward-link cycles the kind takes part in
    pub cyclic_groups: Vec<Vec<KindName>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemReport {
    pub generation: u64,
    pub fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apps: Option<Vec<AppInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modules: Option<Vec<ModuleSummary>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<KindSummary>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customizations: Option<CustomizationIndex>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub links: Option<LinkReport>,
}

/// Build the report for `request` from a graph and its snapshot
pub fn introspect(graph: &RelationGraph, request: &IntrospectRequest) -> Result<SystemReport> {
    let snapshot = graph.snapshot();
    let kind = match request.kind.as_deref() {
        Some(query) => Some(snapshot.require_kind(query)?),
        None => None,
    };
    let module = request.module.as_deref().map(str::to_lowercase);
    let in_module = |k: &EntityKind| match &module {
        Some(m) => k.module.as_deref().map_or(false, |km| km.to_lowercase() == *m),
        None => true,
    };

    let mut report = SystemReport {
        generation: snapshot.generation(),
        fingerprint: snapshot.fingerprint().short().to_string(),
        apps: None,
        modules: None,
        kinds: None,
        customizations: None,
        links: None,
    };

    if request.scope.covers(Scope::Apps) {
        report.apps = Some(snapshot.apps().to_vec());
    }

    if request.scope.covers(Scope::Modules) {
        let mut modules: Vec<ModuleSummary> = snapshot
            .modules()
            .into_iter()
            .filter(|(name, _)| module.as_ref().map_or(true, |m| name.to_lowercase() == *m))
            .map(|(module, kinds)| ModuleSummary {
                module,
                kind_count: kinds.len(),
            })
            .collect();
        modules.sort_by(|a, b| b.kind_count.cmp(&a.kind_count).then_with(|| a.module.cmp(&b.module)));
        report.modules = Some(modules);
    }

    if request.scope.covers(Scope::Kinds) {
        let kinds = match kind {
            Some(k) => vec![summarize(k, true)],
            None => snapshot
                .kinds()
                .filter(|k| in_module(k))
                .map(|k| summarize(k, false))
                .collect(),
        };
        report.kinds = Some(kinds);
    }

    if request.scope.covers(Scope::Customizations) {
        let mut index = CustomizationIndex::default();
        for c in snapshot
            .customizations()
            .iter()
            .filter(|c| kind.map_or(true, |k| c.target_kind == k.name))
        {
            let group = match c.kind() {
                CustomizationKind::AddedField => &mut index.added_fields,
                CustomizationKind::Script => &mut index.scripts,
                CustomizationKind::PropertyOverride => &mut index.property_overrides,
            };
            group.count += 1;
            group.items.push(c.clone());
        }
        report.customizations = Some(index);
    }

    match (request.scope, kind) {
        (Scope::Links, None) => {
            return Err(AtlasError::ValidationFailure(
                "a kind is required for the links scope".to_string(),
            ))
        }
        (scope, Some(k)) if scope.covers(Scope::Links) => report.links = Some(links(graph, &k.name)),
        _ => {}
    }

    Ok(report)
}

fn summarize(kind: &EntityKind, detailed: bool) -> KindSummary {
    KindSummary {
        name: kind.name.clone(),
        module: kind.module.clone(),
        is_child: kind.flags.is_child_collection,
        is_singleton: kind.flags.is_singleton,
        is_submittable: kind.flags.is_submittable,
        detail: detailed.then(|| KindDetail {
            field_count: kind.data_fields().count(),
            custom_field_count: kind.data_fields().filter(|f| f.custom).count(),
            has_workflow: kind.workflow.is_some(),
            naming: kind.naming.clone(),
            title_field: kind.title_field.clone(),
        }),
    }
}

fn links(graph: &RelationGraph, kind: &str) -> LinkReport {
    let outgoing: Vec<EdgeView> = graph
        .edges_out(kind)
        .into_iter()
        .filter(|e| e.edge.edge_kind != EdgeKind::ReverseLink)
        .collect();
    let incoming: Vec<EdgeView> = graph
        .edges_in(kind)
        .into_iter()
        .filter(|e| e.edge.edge_kind != EdgeKind::ReverseLink && e.source != kind)
        .collect();
    let cyclic_groups = graph
        .cyclic_groups()
        .into_iter()
        .filter(|g| g.iter().any(|k| k == kind))
        .collect();
    LinkReport {
        kind: kind.to_string(),
        outgoing_count: outgoing.len(),
        incoming_count: incoming.len(),
        outgoing,
        incoming,
        cyclic_groups,
    }
}
