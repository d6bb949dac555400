//! Field lineage
//!
//! Follows `derived_from` hops from a field back to the field that owns the
//! data, classifies where each field's value comes from, and resolves the
//! field's visibility and mandatory conditions into expression trees.

pub mod expr;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

pub use expr::{CmpOp, Expr, Literal};

use crate::error::{AtlasError, Result};
use crate::registry::SchemaSnapshot;
use crate::schema::{EntityKind, FieldDef, FieldType, LayoutMarker, RECORD_ID_FIELD};

/// Where a field's value comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum FieldSource {
    UserInput,
    Derived { derived_from: String },
    Link { target: String },
    /// Read-only numeric field filled by server logic
    Computed,
    Choice { options: Vec<String> },
    ChildTable { child_kind: String },
    DynamicLink { companion: String },
    AutoGenerated,
}

impl FieldSource {
    pub fn of(field: &FieldDef) -> Self {
        if let Some(from) = &field.derived_from {
            return FieldSource::Derived {
                derived_from: from.clone(),
            };
        }
        let options = field.options.clone().unwrap_or_default();
        match field.field_type {
            FieldType::Link => FieldSource::Link { target: options },
            FieldType::Number if field.read_only => FieldSource::Computed,
            FieldType::Choice => FieldSource::Choice {
                options: field.choices(),
            },
            FieldType::Table => FieldSource::ChildTable { child_kind: options },
            FieldType::DynamicLink => FieldSource::DynamicLink { companion: options },
            _ => FieldSource::UserInput,
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            FieldSource::UserInput => "user_input",
            FieldSource::Derived { .. } => "derived",
            FieldSource::Link { .. } => "link",
            FieldSource::Computed => "computed",
            FieldSource::Choice { .. } => "choice",
            FieldSource::ChildTable { .. } => "child_table",
            FieldSource::DynamicLink { .. } => "dynamic_link",
            FieldSource::AutoGenerated => "auto_generated",
        }
    }
}

/// One hop of a lineage chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageStep {
    pub kind: String,
    pub field: String,
    pub field_type: FieldType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub derived_from: Option<String>,
}

impl LineageStep {
    fn of(kind: &EntityKind, field: &FieldDef) -> Self {
        Self {
            kind: kind.name.clone(),
            field: field.name.clone(),
            field_type: field.field_type,
            derived_from: field.derived_from.clone(),
        }
    }
}

/// A condition expression with its parse result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedExpression {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tree: Option<Expr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rendered: Option<String>,
    pub bindings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResolvedExpression {
    /// Parse `source` and check every binding names a field of `kind` (or the record id)
    pub fn resolve(source: &str, kind: &EntityKind) -> Self {
        match expr::parse(source) {
            Ok(tree) => {
                let bindings: Vec<String> = tree.bindings().into_iter().collect();
                let unknown: Vec<&str> = bindings
                    .iter()
                    .map(String::as_str)
                    .filter(|b| *b != RECORD_ID_FIELD && kind.field(b).is_none())
                    .collect();
                let error = (!unknown.is_empty()).then(|| {
                    AtlasError::Expression(format!(
                        "unknown field(s) {} on {}",
                        unknown.join(", "),
                        kind.name
                    ))
                    .to_string()
                });
                Self {
                    source: source.to_string(),
                    rendered: Some(tree.to_string()),
                    tree: Some(tree),
                    bindings,
                    error,
                }
            }
            Err(err) => Self {
                source: source.to_string(),
                tree: None,
                rendered: None,
                bindings: Vec::new(),
                error: Some(err.to_string()),
            },
        }
    }

    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }
}

/// Sibling field that reads the explored field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDependent {
    pub field: String,
    /// `derived_from`, `visibility` or `mandatory_when`
    pub relation: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildFieldSummary {
    pub field: String,
    pub label: String,
    pub field_type: FieldType,
    pub required: bool,
}

/// Result of [`LineageResolver::explore`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldLineage {
    pub kind: String,
    pub field: String,
    pub label: String,
    pub field_type: FieldType,
    pub source: FieldSource,
    pub required: bool,
    pub read_only: bool,
    pub hidden: bool,
    pub custom: bool,
    /// The field itself first, its ultimate origin last
    pub chain: Vec<LineageStep>,
    /// Why the chain stopped before reaching a plain field
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<ResolvedExpression>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mandatory_when: Option<ResolvedExpression>,
    pub dependents: Vec<FieldDependent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub child_fields: Vec<ChildFieldSummary>,
}

impl FieldLineage {
    /// Last step of the chain
    pub fn origin(&self) -> Option<&LineageStep> {
        self.chain.last()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSummary {
    pub field: String,
    pub label: String,
    pub field_type: FieldType,
    pub required: bool,
    pub source_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub source_detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub label: String,
    pub fields: Vec<FieldSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldCounts {
    pub total: usize,
    pub required: usize,
    pub derived: usize,
    pub links: usize,
    pub child_tables: usize,
    pub computed: usize,
    pub sections: usize,
}

/// Result of [`LineageResolver::overview`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindOverview {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title_field: Option<String>,
    pub is_submittable: bool,
    pub counts: FieldCounts,
    pub sections: Vec<Section>,
}

/// Resolves lineage against one snapshot
pub struct LineageResolver {
    snapshot: Arc<SchemaSnapshot>,
}

impl LineageResolver {
    pub fn new(snapshot: Arc<SchemaSnapshot>) -> Self {
        Self { snapshot }
    }

    /// Lineage of one field.
    ///
    /// Fails with `DerivationCycle` if following `derived_from` comes back to a
    /// (kind, field) pair already on the path.
    pub fn explore(&self, kind: &str, field: &str) -> Result<FieldLineage> {
        let kind = self.snapshot.require_kind(kind)?;

        let Some(def) = kind.field(field) else {
            if field == RECORD_ID_FIELD {
                return Ok(self.record_id_lineage(kind));
            }
            return Err(AtlasError::NotFound {
                what: "Field",
                name: format!("{}.{}", kind.name, field),
                suggestions: Vec::new(),
            });
        };

        let (chain, broken) = self.chain(kind, def)?;
        let child_fields = def
            .target_kind()
            .filter(|_| def.field_type == FieldType::Table)
            .and_then(|child| self.snapshot.kind(child))
            .map(|child| {
                child
                    .data_fields()
                    .map(|f| ChildFieldSummary {
                        field: f.name.clone(),
                        label: f.display_label().to_string(),
                        field_type: f.field_type,
                        required: f.required,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(FieldLineage {
            kind: kind.name.clone(),
            field: def.name.clone(),
            label: def.display_label().to_string(),
            field_type: def.field_type,
            source: FieldSource::of(def),
            required: def.required,
            read_only: def.read_only,
            hidden: def.hidden,
            custom: def.custom,
            chain,
            broken,
            visibility: def
                .visibility
                .as_deref()
                .map(|v| ResolvedExpression::resolve(v, kind)),
            mandatory_when: def
                .mandatory_when
                .as_deref()
                .map(|v| ResolvedExpression::resolve(v, kind)),
            dependents: dependents(kind, &def.name),
            child_fields,
        })
    }

    fn record_id_lineage(&self, kind: &EntityKind) -> FieldLineage {
        FieldLineage {
            kind: kind.name.clone(),
            field: RECORD_ID_FIELD.to_string(),
            label: "ID".to_string(),
            field_type: FieldType::ShortText,
            source: FieldSource::AutoGenerated,
            required: true,
            read_only: true,
            hidden: false,
            custom: false,
            chain: vec![LineageStep {
                kind: kind.name.clone(),
                field: RECORD_ID_FIELD.to_string(),
                field_type: FieldType::ShortText,
                derived_from: None,
            }],
            broken: None,
            visibility: None,
            mandatory_when: None,
            dependents: dependents(kind, RECORD_ID_FIELD),
            child_fields: Vec::new(),
        }
    }

    /// Follow `derived_from` hops until a field without one
    fn chain(&self, kind: &EntityKind, field: &FieldDef) -> Result<(Vec<LineageStep>, Option<String>)> {
        let mut chain = vec![LineageStep::of(kind, field)];
        let mut on_path: HashSet<(String, String)> = HashSet::new();
        on_path.insert((kind.name.clone(), field.name.clone()));

        let (mut kind, mut field) = (kind, field);
        while let Some(raw) = field.derived_from.as_deref() {
            let Some((link, remote)) = field.derivation() else {
                return Ok((chain, Some(format!("malformed derivation '{}'", raw))));
            };
            let Some(link_def) = kind.field(link) else {
                return Ok((chain, Some(format!("link field {}.{} not found", kind.name, link))));
            };
            let Some(target) = link_def
                .target_kind()
                .filter(|_| link_def.field_type == FieldType::Link)
            else {
                return Ok((chain, Some(format!("{}.{} is not a link field", kind.name, link))));
            };
            let Some(next_kind) = self.snapshot.kind(target) else {
                return Ok((chain, Some(format!("kind '{}' not found", target))));
            };
            let Some(next_field) = next_kind.field(remote) else {
                return Ok((chain, Some(format!("field {}.{} not found", next_kind.name, remote))));
            };

            if !on_path.insert((next_kind.name.clone(), next_field.name.clone())) {
                let mut path: Vec<String> = chain
                    .iter()
                    .map(|s| format!("{}.{}", s.kind, s.field))
                    .collect();
                path.push(format!("{}.{}", next_kind.name, next_field.name));
                return Err(AtlasError::DerivationCycle { path });
            }
            chain.push(LineageStep::of(next_kind, next_field));
            kind = next_kind;
            field = next_field;
        }
        Ok((chain, None))
    }

    /// All fields of a kind grouped into sections
    pub fn overview(&self, kind: &str, section: Option<&str>) -> Result<KindOverview> {
        let kind = self.snapshot.require_kind(kind)?;

        let mut sections = Vec::new();
        let mut current = Section {
            label: "Default".to_string(),
            fields: Vec::new(),
        };
        for field in &kind.fields {
            match field.layout_marker() {
                Some(LayoutMarker::Section) | Some(LayoutMarker::Tab) => {
                    if !current.fields.is_empty() {
                        sections.push(current);
                    }
                    current = Section {
                        label: field.display_label().to_string(),
                        fields: Vec::new(),
                    };
                    continue;
                }
                Some(LayoutMarker::Column) => continue,
                None if field.hidden => continue,
                None => {}
            }
            let source = FieldSource::of(field);
            let source_detail = match &source {
                FieldSource::Derived { derived_from } => derived_from.clone(),
                FieldSource::Link { target } => target.clone(),
                FieldSource::ChildTable { child_kind } => child_kind.clone(),
                _ => String::new(),
            };
            current.fields.push(FieldSummary {
                field: field.name.clone(),
                label: field.display_label().to_string(),
                field_type: field.field_type,
                required: field.required,
                source_type: source.tag().to_string(),
                source_detail,
            });
        }
        if !current.fields.is_empty() {
            sections.push(current);
        }

        if let Some(filter) = section.map(str::to_lowercase) {
            sections.retain(|s| s.label.to_lowercase().contains(&filter));
        }

        let all = || sections.iter().flat_map(|s| s.fields.iter());
        let counts = FieldCounts {
            total: all().count(),
            required: all().filter(|f| f.required).count(),
            derived: all().filter(|f| f.source_type == "derived").count(),
            links: all().filter(|f| f.source_type == "link").count(),
            child_tables: all().filter(|f| f.source_type == "child_table").count(),
            computed: all().filter(|f| f.source_type == "computed").count(),
            sections: sections.len(),
        };

        Ok(KindOverview {
            kind: kind.name.clone(),
            title_field: kind.title_field.clone(),
            is_submittable: kind.flags.is_submittable,
            counts,
            sections,
        })
    }
}

/// Sibling fields whose derivation or conditions read `field`
fn dependents(kind: &EntityKind, field: &str) -> Vec<FieldDependent> {
    let mut out = Vec::new();
    for sibling in &kind.fields {
        if let Some((link, _)) = sibling.derivation() {
            if link == field {
                out.push(FieldDependent {
                    field: sibling.name.clone(),
                    relation: "derived_from".to_string(),
                    detail: sibling.derived_from.clone().unwrap_or_default(),
                });
            }
        }
        for (relation, source) in [
            ("visibility", sibling.visibility.as_deref()),
            ("mandatory_when", sibling.mandatory_when.as_deref()),
        ] {
            let Some(source) = source else { continue };
            let reads_field = expr::parse(source)
                .map(|e| e.bindings().contains(field))
                .unwrap_or(false);
            if reads_field {
                out.push(FieldDependent {
                    field: sibling.name.clone(),
                    relation: relation.to_string(),
                    detail: source.to_string(),
                });
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SchemaRegistry;

    fn resolver() -> LineageResolver {
        let registry = SchemaRegistry::new(
            vec![
                EntityKind::new("Territory")
                    .with_field(FieldDef::new("region", FieldType::ShortText)),
                EntityKind::new("Customer")
                    .with_field(FieldDef::new("full_name", FieldType::ShortText))
                    .with_field(FieldDef::link("territory", "Territory"))
                    .with_field(FieldDef::new("region", FieldType::ShortText).derived("territory.region")),
                EntityKind::new("Order")
                    .with_field(FieldDef::link("customer", "Customer").required())
                    .with_field(
                        FieldDef::new("customer_region", FieldType::ShortText)
                            .derived("customer.region"),
                    )
                    .with_field(
                        FieldDef::new("status", FieldType::Choice).with_options("Draft\nActive"),
                    )
                    .with_field(
                        FieldDef::new("notes_marker", FieldType::LayoutMarker)
                            .with_options("section"),
                    )
                    .with_field(
                        FieldDef::new("discount", FieldType::Number)
                            .visible_when("eval:doc.status=='Active'"),
                    )
                    .with_field(FieldDef::new("bogus", FieldType::Number).visible_when("doc.missing > 1"))
                    .with_field({
                        let mut total = FieldDef::new("total", FieldType::Number);
                        total.read_only = true;
                        total
                    }),
                EntityKind::new("Loop")
                    .with_field(FieldDef::link("self_link", "Loop"))
                    .with_field(FieldDef::new("a", FieldType::ShortText).derived("self_link.b"))
                    .with_field(FieldDef::new("b", FieldType::ShortText).derived("self_link.a")),
            ],
            Vec::new(),
        );
        LineageResolver::new(registry.snapshot())
    }

    #[test]
    fn test_chain_reaches_origin() {
        let lineage = resolver().explore("Order", "customer_region").unwrap();
        let hops: Vec<String> = lineage
            .chain
            .iter()
            .map(|s| format!("{}.{}", s.kind, s.field))
            .collect();
        assert_eq!(hops, vec!["Order.customer_region", "Customer.region", "Territory.region"]);
        assert_eq!(lineage.origin().unwrap().kind, "Territory");
        assert!(lineage.broken.is_none());
    }

    #[test]
    fn test_derivation_cycle_detected() {
        match resolver().explore("Loop", "a") {
            Err(AtlasError::DerivationCycle { path }) => {
                assert_eq!(path, vec!["Loop.a", "Loop.b", "Loop.a"]);
            }
            other => panic!("expected cycle, got {:?}", other.map(|l| l.chain)),
        }
    }

    #[test]
    fn test_visibility_resolution_and_dependents() {
        let resolver = resolver();
        let discount = resolver.explore("Order", "discount").unwrap();
        let visibility = discount.visibility.unwrap();
        assert!(visibility.is_valid());
        assert_eq!(visibility.bindings, vec!["status"]);

        let bogus = resolver.explore("Order", "bogus").unwrap();
        assert!(bogus.visibility.unwrap().error.unwrap().contains("missing"));

        let status = resolver.explore("Order", "status").unwrap();
        assert_eq!(status.dependents.len(), 1);
        assert_eq!(status.dependents[0].relation, "visibility");

        let customer = resolver.explore("Order", "customer").unwrap();
        assert_eq!(customer.dependents[0].field, "customer_region");
        assert_eq!(customer.source, FieldSource::Link { target: "Customer".to_string() });
    }

    #[test]
    fn test_record_id_and_unknown_field() {
        let resolver = resolver();
        let id = resolver.explore("Order", "name").unwrap();
        assert_eq!(id.source, FieldSource::AutoGenerated);
        assert!(matches!(
            resolver.explore("Order", "nope"),
            Err(AtlasError::NotFound { what: "Field", .. })
        ));
    }

    #[test]
    fn test_overview_sections() {
        let overview = resolver().overview("Order", None).unwrap();
        let labels: Vec<_> = overview.sections.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["Default", "notes_marker"]);
        assert_eq!(overview.counts.total, 6);
        assert_eq!(overview.counts.required, 1);
        assert_eq!(overview.counts.derived, 1);
        assert_eq!(overview.counts.computed, 1);

        let filtered = resolver().overview("Order", Some("NOTES")).unwrap();
        assert_eq!(filtered.counts.total, 3);
    }
}
