//! Breadth-first relationship mapping from one kind

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

use super::{EdgeKind, GraphWarning, RelationGraph};
use crate::config::GraphConfig;
use crate::error::Result;
use crate::schema::{KindFlags, KindName};

/// Traversal options
#[derive(Debug, Clone, PartialEq)]
pub struct MapOptions {
    pub depth: usize,
    pub include_standard: bool,
    /// Link fields skipped unless `include_standard` is set
    pub standard_fields: Vec<String>,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self::from_config(&GraphConfig::default(), None, None)
    }
}

impl MapOptions {
    /// Options from configuration; the requested depth is clamped to `1..=max_depth`
    pub fn from_config(config: &GraphConfig, depth: Option<usize>, include_standard: Option<bool>) -> Self {
        let max = config.max_depth.max(1);
        Self {
            depth: depth.unwrap_or(1).clamp(1, max),
            include_standard: include_standard.unwrap_or(config.include_standard),
            standard_fields: config.standard_fields.clone(),
        }
    }

    fn skips(&self, via_field: &str) -> bool {
        !self.include_standard && self.standard_fields.iter().any(|f| f == via_field)
    }
}

/// One kind reached during the traversal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapEntry {
    pub kind: KindName,
    pub edge_kind: EdgeKind,
    pub hop: usize,
    /// Kind this entry was first reached from
    pub from_kind: KindName,
    pub via_fields: Vec<String>,
    pub potential: bool,
    pub mandatory: bool,
    pub custom: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub name: String,
    pub state_field: String,
    pub states: Vec<String>,
    pub transitions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedField {
    pub field: String,
    pub derived_from: String,
    pub read_only: bool,
}

/// Result of [`RelationGraph::map_relationships`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipMap {
    pub kind: KindName,
    pub depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    pub flags: KindFlags,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub naming: Option<String>,
    pub links_to: Vec<MapEntry>,
    pub links_from: Vec<MapEntry>,
    pub embedded_children: Vec<MapEntry>,
    pub workflow_edges: Vec<MapEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowSummary>,
    pub auto_derived_fields: Vec<DerivedField>,
    /// Dangling references on the kinds visited
    pub warnings: Vec<GraphWarning>,
    pub summary: String,
}

impl RelationshipMap {
    /// Every entry regardless of category
    pub fn entries(&self) -> impl Iterator<Item = &MapEntry> {
        self.links_to
            .iter()
            .chain(&self.links_from)
            .chain(&self.embedded_children)
            .chain(&self.workflow_edges)
    }

    fn summarize(&mut self) {
        let direct = |entries: &[MapEntry]| entries.iter().filter(|e| e.hop == 1).count();
        let mut parts = Vec::new();
        let links_to = direct(&self.links_to);
        if links_to > 0 {
            parts.push(format!("links to {} kinds", links_to));
        }
        let links_from = direct(&self.links_from);
        if links_from > 0 {
            parts.push(format!("{} kinds link to it", links_from));
        }
        let children = direct(&self.embedded_children);
        if children > 0 {
            parts.push(format!("{} child tables", children));
        }
        if self.workflow.is_some() {
            parts.push("has workflow".to_string());
        }
        self.summary = if parts.is_empty() {
            format!("{}: standalone kind", self.kind)
        } else {
            format!("{}: {}", self.kind, parts.join(", "))
        };
    }
}

impl RelationGraph {
    /// Map the relations of `kind` out to `options.depth` hops.
    ///
    /// Each kind is expanded at most once; an entry lists a kind at the hop
    /// where it was first reached, with every field that reached it there.
    /// Dynamic-link targets are listed as potential but not expanded.
    pub fn map_relationships(&self, kind: &str, options: &MapOptions) -> Result<RelationshipMap> {
        let root = self.snapshot.require_kind(kind)?;
        let root_idx = self
            .index_of(&root.name)
            .ok_or_else(|| crate::error::AtlasError::not_found("Kind", root.name.clone()))?;

        let mut entries: BTreeMap<(EdgeKind, KindName), MapEntry> = BTreeMap::new();
        let mut visited = HashSet::from([root_idx]);
        let mut frontier = vec![root_idx];

        for hop in 1..=options.depth {
            let mut reached: BTreeMap<(EdgeKind, KindName), MapEntry> = BTreeMap::new();
            let mut next = BTreeSet::new();

            for &node in &frontier {
                let from = self.graph[node].as_str();
                for edge in self.edges_out(from) {
                    if options.skips(&edge.edge.via_field) {
                        continue;
                    }
                    let Some(target) = self.index_of(&edge.target) else { continue };
                    if visited.contains(&target) {
                        continue;
                    }
                    let category = category(edge.edge.edge_kind);
                    let entry = reached
                        .entry((category, edge.target.clone()))
                        .or_insert_with(|| MapEntry {
                            kind: edge.target.clone(),
                            edge_kind: edge.edge.edge_kind,
                            hop,
                            from_kind: from.to_string(),
                            via_fields: Vec::new(),
                            potential: true,
                            mandatory: false,
                            custom: false,
                        });
                    if !entry.via_fields.contains(&edge.edge.via_field) {
                        entry.via_fields.push(edge.edge.via_field.clone());
                    }
                    entry.potential &= edge.edge.potential;
                    entry.mandatory |= edge.edge.mandatory;
                    entry.custom |= edge.edge.custom;
                    if !edge.edge.potential {
                        next.insert(target);
                    }
                }
            }

            for (key, entry) in reached {
                entries.entry(key).or_insert(entry);
            }
            visited.extend(next.iter().copied());
            frontier = next.into_iter().collect();
            if frontier.is_empty() {
                break;
            }
        }

        let visited_names: HashSet<&str> = visited.iter().map(|&i| self.graph[i].as_str()).collect();
        let mut map = RelationshipMap {
            kind: root.name.clone(),
            depth: options.depth,
            module: root.module.clone(),
            flags: root.flags,
            naming: root.naming.clone(),
            links_to: Vec::new(),
            links_from: Vec::new(),
            embedded_children: Vec::new(),
            workflow_edges: Vec::new(),
            workflow: root.workflow.as_ref().map(|w| WorkflowSummary {
                name: w.name.clone(),
                state_field: w.state_field.clone(),
                states: w.states.clone(),
                transitions: w.transitions.iter().map(|t| t.to_string()).collect(),
            }),
            auto_derived_fields: root
                .fields
                .iter()
                .filter_map(|f| {
                    f.derived_from.as_ref().map(|d| DerivedField {
                        field: f.name.clone(),
                        derived_from: d.clone(),
                        read_only: f.read_only,
                    })
                })
                .collect(),
            warnings: self
                .warnings
                .iter()
                .filter(|w| visited_names.contains(w.kind.as_str()))
                .cloned()
                .collect(),
            summary: String::new(),
        };

        let mut ordered: Vec<MapEntry> = entries.into_values().collect();
        ordered.sort_by(|a, b| (a.hop, &a.kind).cmp(&(b.hop, &b.kind)));
        for entry in ordered {
            match category(entry.edge_kind) {
                EdgeKind::ForwardLink => map.links_to.push(entry),
                EdgeKind::ReverseLink => map.links_from.push(entry),
                EdgeKind::EmbeddedChild => map.embedded_children.push(entry),
                _ => map.workflow_edges.push(entry),
            }
        }
        map.summarize();
        Ok(map)
    }
}

/// Output list an edge kind belongs to; dynamic links sit with forward links
fn category(edge_kind: EdgeKind) -> EdgeKind {
    match edge_kind {
        EdgeKind::DynamicLink => EdgeKind::ForwardLink,
        other => other,
    }
}
