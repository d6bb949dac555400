//! Kind Relationship Graph
//!
//! Directed graph of structural relations between entity kinds, built with
//! petgraph from one schema snapshot. Every link field yields a forward edge
//! and the matching reverse edge; embedded tables, dynamic links and workflow
//! hand-offs get their own edge kinds. References to missing kinds are left
//! out of the graph and reported as warnings so a partial graph stays usable.

mod map;

pub use map::{DerivedField, MapEntry, MapOptions, RelationshipMap, WorkflowSummary};

use petgraph::algo::kosaraju_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::error::AtlasError;
use crate::registry::{SchemaRegistry, SchemaSnapshot};
use crate::schema::{EntityKind, FieldDef, FieldType, KindName};

/// Kind of structural relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    ForwardLink,
    ReverseLink,
    EmbeddedChild,
    DynamicLink,
    WorkflowLink,
}

/// Edge weight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationEdge {
    pub edge_kind: EdgeKind,
    /// Field on the source kind (for reverse links, the field on the linking kind)
    pub via_field: String,
    /// Target is only reachable for some records (dynamic links)
    pub potential: bool,
    pub mandatory: bool,
    pub custom: bool,
}

impl RelationEdge {
    fn new(edge_kind: EdgeKind, field: &FieldDef) -> Self {
        Self {
            edge_kind,
            via_field: field.name.clone(),
            potential: edge_kind == EdgeKind::DynamicLink,
            mandatory: field.required,
            custom: field.custom,
        }
    }
}

/// An edge with its endpoints resolved to kind names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeView {
    pub source: KindName,
    pub target: KindName,
    #[serde(flatten)]
    pub edge: RelationEdge,
}

/// A reference that could not be turned into an edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphWarning {
    pub kind: KindName,
    pub field: String,
    pub target: String,
    pub message: String,
}

impl GraphWarning {
    fn dangling(kind: &str, field: &str, target: &str) -> Self {
        let err = AtlasError::SchemaInconsistency {
            kind: kind.to_string(),
            field: field.to_string(),
            target: target.to_string(),
        };
        Self {
            kind: kind.to_string(),
            field: field.to_string(),
            target: target.to_string(),
            message: err.to_string(),
        }
    }
}

/// The kind relationship graph
pub struct RelationGraph {
    graph: DiGraph<KindName, RelationEdge>,
    node_indices: HashMap<KindName, NodeIndex>,
    warnings: Vec<GraphWarning>,
    snapshot: Arc<SchemaSnapshot>,
}

impl RelationGraph {
    /// Build the graph for a snapshot
    pub fn build(snapshot: Arc<SchemaSnapshot>) -> Self {
        let mut graph = DiGraph::new();
        let mut node_indices = HashMap::new();
        for kind in snapshot.kinds() {
            let idx = graph.add_node(kind.name.clone());
            node_indices.insert(kind.name.clone(), idx);
        }

        let mut builder = Builder {
            graph,
            node_indices,
            warnings: Vec::new(),
        };
        for kind in snapshot.kinds() {
            builder.add_kind(&snapshot, kind);
        }

        for w in &builder.warnings {
            warn!(kind = %w.kind, field = %w.field, target = %w.target, "Omitting dangling reference");
        }
        debug!(
            kinds = builder.graph.node_count(),
            edges = builder.graph.edge_count(),
            warnings = builder.warnings.len(),
            generation = snapshot.generation(),
            "Built relationship graph"
        );

        Self {
            graph: builder.graph,
            node_indices: builder.node_indices,
            warnings: builder.warnings,
            snapshot,
        }
    }

    pub fn snapshot(&self) -> &Arc<SchemaSnapshot> {
        &self.snapshot
    }

    /// Generation of the snapshot this graph was built from
    pub fn generation(&self) -> u64 {
        self.snapshot.generation()
    }

    pub fn kind_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Every dangling reference found while building
    pub fn warnings(&self) -> &[GraphWarning] {
        &self.warnings
    }

    /// Outgoing edges of a kind
    pub fn edges_out(&self, kind: &str) -> Vec<EdgeView> {
        self.edges(kind, Direction::Outgoing)
    }

    /// Incoming edges of a kind
    pub fn edges_in(&self, kind: &str) -> Vec<EdgeView> {
        self.edges(kind, Direction::Incoming)
    }

    fn edges(&self, kind: &str, direction: Direction) -> Vec<EdgeView> {
        let Some(&idx) = self.node_indices.get(kind) else {
            return Vec::new();
        };
        let mut edges: Vec<EdgeView> = self
            .graph
            .edges_directed(idx, direction)
            .map(|e| EdgeView {
                source: self.graph[e.source()].clone(),
                target: self.graph[e.target()].clone(),
                edge: e.weight().clone(),
            })
            .collect();
        edges.sort_by(|a, b| {
            (a.edge.edge_kind, &a.source, &a.target, &a.edge.via_field)
                .cmp(&(b.edge.edge_kind, &b.source, &b.target, &b.edge.via_field))
        });
        edges
    }

    /// Fields on other kinds whose derivation lands on `kind.field`, as `Kind.field`.
    ///
    /// Customization-added fields are left out; they are tracked as customization
    /// dependents instead.
    pub fn derivations_landing_on(&self, kind: &str, field: &str) -> Vec<String> {
        let mut found: Vec<String> = self
            .edges_in(kind)
            .into_iter()
            .filter(|e| e.edge.edge_kind == EdgeKind::ForwardLink)
            .filter_map(|e| self.snapshot.kind(&e.source).map(|k| (k, e.edge.via_field)))
            .flat_map(|(source, link)| {
                source
                    .fields
                    .iter()
                    .filter(move |f| !f.custom && f.derivation() == Some((link.as_str(), field)))
                    .map(move |f| format!("{}.{}", source.name, f.name))
            })
            .collect();
        found.sort();
        found.dedup();
        found
    }

    /// Groups of kinds that reach each other through forward links
    pub fn cyclic_groups(&self) -> Vec<Vec<KindName>> {
        let forward = self.graph.filter_map(
            |_, name| Some(name.clone()),
            |_, edge| (edge.edge_kind == EdgeKind::ForwardLink).then_some(()),
        );
        let mut groups: Vec<Vec<KindName>> = kosaraju_scc(&forward)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1 || scc.iter().any(|&n| forward.find_edge(n, n).is_some())
            })
            .map(|scc| {
                let mut names: Vec<KindName> = scc.iter().map(|&n| forward[n].clone()).collect();
                names.sort();
                names
            })
            .collect();
        groups.sort();
        groups
    }

    /// Export the kind graph to GraphViz DOT format (reverse links left implicit)
    pub fn to_dot(&self) -> String {
        let mut output = String::new();

        output.push_str("digraph KindGraph {\n");
        output.push_str("  rankdir=LR;\n");
        output.push_str("  bgcolor=\"#1e1e1e\";\n");
        output.push_str("  node [shape=box, style=\"filled,rounded\", fontname=\"Helvetica\", fontsize=10, fontcolor=\"white\", color=\"#404040\"];\n");
        output.push_str("  edge [fontname=\"Helvetica\", fontsize=8, fontcolor=\"#808080\"];\n");
        output.push('\n');

        for kind in self.snapshot.kinds() {
            let color = if kind.flags.is_child_collection {
                "#607D8B"
            } else if kind.flags.is_singleton {
                "#795548"
            } else if kind.flags.is_submittable {
                "#FF9800"
            } else {
                "#00BCD4"
            };
            output.push_str(&format!(
                "  \"{}\" [label=\"{}\", fillcolor=\"{}\"];\n",
                dot_id(&kind.name),
                kind.name.replace('"', "'"),
                color
            ));
        }

        output.push('\n');

        for edge in self.graph.edge_references() {
            let weight = edge.weight();
            let style = match weight.edge_kind {
                EdgeKind::ReverseLink => continue,
                EdgeKind::ForwardLink => "solid",
                EdgeKind::EmbeddedChild => "bold",
                EdgeKind::DynamicLink => "dashed",
                EdgeKind::WorkflowLink => "dotted",
            };
            output.push_str(&format!(
                "  \"{}\" -> \"{}\" [label=\"{}\", style={}];\n",
                dot_id(&self.graph[edge.source()]),
                dot_id(&self.graph[edge.target()]),
                weight.via_field,
                style
            ));
        }

        output.push_str("}\n");
        output
    }

    fn index_of(&self, kind: &str) -> Option<NodeIndex> {
        self.node_indices.get(kind).copied()
    }
}

/// Graph of the registry's current snapshot, rebuilt when a new snapshot is published
pub struct GraphCache {
    schema: Arc<SchemaRegistry>,
    current: Mutex<Option<Arc<RelationGraph>>>,
}

impl GraphCache {
    pub fn new(schema: Arc<SchemaRegistry>) -> Self {
        Self {
            schema,
            current: Mutex::new(None),
        }
    }

    pub fn current(&self) -> Arc<RelationGraph> {
        let snapshot = self.schema.snapshot();
        let mut guard = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(graph) = guard.as_ref() {
            if graph.generation() == snapshot.generation() {
                return Arc::clone(graph);
            }
        }
        let graph = Arc::new(RelationGraph::build(snapshot));
        *guard = Some(Arc::clone(&graph));
        graph
    }
}

fn dot_id(name: &str) -> String {
    name.replace([' ', '-', '.', '/'], "_")
}

struct Builder {
    graph: DiGraph<KindName, RelationEdge>,
    node_indices: HashMap<KindName, NodeIndex>,
    warnings: Vec<GraphWarning>,
}

impl Builder {
    fn add_kind(&mut self, snapshot: &SchemaSnapshot, kind: &EntityKind) {
        let source = self.node_indices[&kind.name];

        for field in &kind.fields {
            match field.field_type {
                FieldType::Link => {
                    let Some(target) = self.target(kind, field) else { continue };
                    self.graph
                        .add_edge(source, target, RelationEdge::new(EdgeKind::ForwardLink, field));
                    self.graph
                        .add_edge(target, source, RelationEdge::new(EdgeKind::ReverseLink, field));
                }
                FieldType::Table => {
                    let Some(child) = self.target(kind, field) else { continue };
                    self.graph
                        .add_edge(source, child, RelationEdge::new(EdgeKind::EmbeddedChild, field));
                }
                FieldType::DynamicLink => {
                    for target in self.dynamic_domain(snapshot, kind, field) {
                        self.graph
                            .add_edge(source, target, RelationEdge::new(EdgeKind::DynamicLink, field));
                    }
                }
                _ => {}
            }
        }

        if let Some(workflow) = &kind.workflow {
            for next in &workflow.next_kinds {
                match self.node_indices.get(next) {
                    Some(&target) => {
                        self.graph.add_edge(
                            source,
                            target,
                            RelationEdge {
                                edge_kind: EdgeKind::WorkflowLink,
                                via_field: workflow.state_field.clone(),
                                potential: false,
                                mandatory: false,
                                custom: false,
                            },
                        );
                    }
                    None => self
                        .warnings
                        .push(GraphWarning::dangling(&kind.name, &workflow.state_field, next)),
                }
            }
        }
    }

    fn target(&mut self, kind: &EntityKind, field: &FieldDef) -> Option<NodeIndex> {
        let name = field.target_kind().unwrap_or_default();
        let idx = self.node_indices.get(name).copied();
        if idx.is_none() {
            self.warnings
                .push(GraphWarning::dangling(&kind.name, &field.name, name));
        }
        idx
    }

    /// Kinds a dynamic link may resolve to, from its companion field's domain
    fn dynamic_domain(
        &mut self,
        snapshot: &SchemaSnapshot,
        kind: &EntityKind,
        field: &FieldDef,
    ) -> Vec<NodeIndex> {
        let companion_name = field.options.as_deref().map(str::trim).unwrap_or_default();
        let Some(companion) = kind.field(companion_name) else {
            self.warnings
                .push(GraphWarning::dangling(&kind.name, &field.name, companion_name));
            return Vec::new();
        };

        match companion.field_type {
            FieldType::Choice => {
                let mut targets = Vec::new();
                for choice in companion.choices() {
                    match self.node_indices.get(&choice) {
                        Some(&idx) => targets.push(idx),
                        None => self
                            .warnings
                            .push(GraphWarning::dangling(&kind.name, &field.name, &choice)),
                    }
                }
                targets
            }
            FieldType::Link => snapshot
                .kinds()
                .filter(|k| !k.flags.is_child_collection)
                .filter_map(|k| self.node_indices.get(&k.name).copied())
                .collect(),
            _ => {
                self.warnings
                    .push(GraphWarning::dangling(&kind.name, &field.name, companion_name));
                Vec::new()
            }
        }
    }
}
