//! Schema Registry
//!
//! Holds the base entity kinds and publishes immutable snapshots of the
//! effective schema (base kinds with customization overlays applied).
//! Readers grab an `Arc<SchemaSnapshot>` and keep it for the whole request;
//! a refresh swaps in a new snapshot and never touches the old one.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::checksum::Fingerprint;
use crate::customization::{Customization, CustomizationStatus, Overlay};
use crate::error::{AtlasError, Result};
use crate::schema::{EntityKind, KindName};

/// An installed application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<semver::Version>,
}

/// Immutable view of the effective schema
#[derive(Debug, Clone, Serialize)]
pub struct SchemaSnapshot {
    generation: u64,
    kinds: BTreeMap<KindName, EntityKind>,
    apps: Vec<AppInfo>,
    customizations: Vec<Customization>,
    fingerprint: Fingerprint,
    published_at: DateTime<Utc>,
}

impl SchemaSnapshot {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    pub fn kind(&self, name: &str) -> Option<&EntityKind> {
        self.kinds.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.kinds.contains_key(name)
    }

    /// Resolve a kind by exact, then case-insensitive name
    pub fn resolve(&self, query: &str) -> Option<&EntityKind> {
        if let Some(kind) = self.kinds.get(query) {
            return Some(kind);
        }
        let query_lower = query.to_lowercase();
        self.kinds
            .values()
            .find(|k| k.name.to_lowercase() == query_lower)
    }

    /// Resolve a kind or fail with "did you mean" suggestions
    pub fn require_kind(&self, query: &str) -> Result<&EntityKind> {
        self.resolve(query).ok_or_else(|| AtlasError::NotFound {
            what: "Kind",
            name: query.to_string(),
            suggestions: self.suggest(query, 5),
        })
    }

    /// Fuzzy-match kind names against a query, best first
    pub fn suggest(&self, query: &str, limit: usize) -> Vec<String> {
        let matcher = SkimMatcherV2::default();
        let mut scored: Vec<(i64, &str)> = self
            .kinds
            .keys()
            .filter_map(|name| matcher.fuzzy_match(name, query).map(|s| (s, name.as_str())))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        scored
            .into_iter()
            .take(limit)
            .map(|(_, name)| name.to_string())
            .collect()
    }

    /// All kinds in name order
    pub fn kinds(&self) -> impl Iterator<Item = &EntityKind> {
        self.kinds.values()
    }

    pub fn kind_count(&self) -> usize {
        self.kinds.len()
    }

    pub fn apps(&self) -> &[AppInfo] {
        &self.apps
    }

    /// Customizations at publication time, including disabled and deleted ones
    pub fn customizations(&self) -> &[Customization] {
        &self.customizations
    }

    /// Kind names grouped by module (kinds without a module go under "")
    pub fn modules(&self) -> BTreeMap<String, Vec<KindName>> {
        let mut modules: BTreeMap<String, Vec<KindName>> = BTreeMap::new();
        for kind in self.kinds.values() {
            modules
                .entry(kind.module.clone().unwrap_or_default())
                .or_default()
                .push(kind.name.clone());
        }
        modules
    }
}

/// The schema registry
pub struct SchemaRegistry {
    base: BTreeMap<KindName, EntityKind>,
    apps: Vec<AppInfo>,
    current: RwLock<Arc<SchemaSnapshot>>,
    generation: AtomicU64,
}

impl SchemaRegistry {
    /// Create a registry from base kinds; the first snapshot has no overlays
    pub fn new(kinds: Vec<EntityKind>, apps: Vec<AppInfo>) -> Self {
        let base: BTreeMap<KindName, EntityKind> =
            kinds.into_iter().map(|k| (k.name.clone(), k)).collect();
        let first = Arc::new(build_snapshot(0, &base, &apps, &[]));
        Self {
            base,
            apps,
            current: RwLock::new(first),
            generation: AtomicU64::new(0),
        }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<SchemaSnapshot> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Base kind definition, without overlays
    pub fn base_kind(&self, name: &str) -> Option<&EntityKind> {
        self.base.get(name)
    }

    /// Rebuild the effective schema from the base kinds plus `overlays` and publish it
    pub fn refresh(&self, overlays: &[Customization]) -> Arc<SchemaSnapshot> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Arc::new(build_snapshot(generation, &self.base, &self.apps, overlays));

        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        // A slower refresh must not replace a newer snapshot
        if guard.generation < snapshot.generation {
            *guard = Arc::clone(&snapshot);
        }
        debug!(
            generation,
            fingerprint = snapshot.fingerprint.short(),
            overlays = overlays.len(),
            "Published schema snapshot"
        );
        snapshot
    }
}

fn build_snapshot(
    generation: u64,
    base: &BTreeMap<KindName, EntityKind>,
    apps: &[AppInfo],
    overlays: &[Customization],
) -> SchemaSnapshot {
    let mut kinds = base.clone();
    for overlay in overlays {
        apply_overlay(&mut kinds, overlay);
    }
    let fingerprint = Fingerprint::of(&(&kinds, apps));
    SchemaSnapshot {
        generation,
        kinds,
        apps: apps.to_vec(),
        customizations: overlays.to_vec(),
        fingerprint,
        published_at: Utc::now(),
    }
}

fn apply_overlay(kinds: &mut BTreeMap<KindName, EntityKind>, c: &Customization) {
    if c.status == CustomizationStatus::Deleted {
        return;
    }
    let Some(kind) = kinds.get_mut(&c.target_kind) else {
        warn!(customization = %c.id, kind = %c.target_kind, "Overlay targets unknown kind");
        return;
    };

    match &c.overlay {
        Overlay::AddedField { field } => {
            if kind.field(&field.name).is_some() {
                warn!(customization = %c.id, field = %field.name, "Added field shadows existing field");
                return;
            }
            let mut field = field.clone();
            field.custom = true;
            // Disabled added fields keep their data but leave the form
            if c.status == CustomizationStatus::Disabled {
                field.hidden = true;
            }
            kind.fields.push(field);
        }
        Overlay::PropertyOverride { property, value } => {
            if c.status != CustomizationStatus::Active {
                return;
            }
            if let Err(reason) = apply_property(kind, c.target_field.as_deref(), property, value) {
                warn!(customization = %c.id, property = %property, "{}", reason);
            }
        }
        Overlay::Script { .. } => {}
    }
}

fn apply_property(
    kind: &mut EntityKind,
    field_name: Option<&str>,
    property: &str,
    value: &serde_json::Value,
) -> std::result::Result<(), String> {
    let Some(field_name) = field_name else {
        return match property {
            "title_field" => {
                kind.title_field = as_text(value);
                Ok(())
            }
            other => Err(format!("Unsupported kind property '{}'", other)),
        };
    };

    let field = kind
        .field_mut(field_name)
        .ok_or_else(|| format!("Field '{}' not found", field_name))?;

    match property {
        "label" => field.label = as_text(value),
        "options" => field.options = as_text(value),
        "derived_from" => field.derived_from = as_text(value),
        "visibility" => field.visibility = as_text(value),
        "mandatory_when" => field.mandatory_when = as_text(value),
        "hidden" => field.hidden = as_flag(value)?,
        "required" => field.required = as_flag(value)?,
        "read_only" => field.read_only = as_flag(value)?,
        other => return Err(format!("Unsupported field property '{}'", other)),
    }
    Ok(())
}

fn as_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) if s.is_empty() => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn as_flag(value: &serde_json::Value) -> std::result::Result<bool, String> {
    match value {
        serde_json::Value::Bool(b) => Ok(*b),
        serde_json::Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0) != 0.0),
        serde_json::Value::String(s) => match s.as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" | "" => Ok(false),
            _ => Err(format!("'{}' is not a flag value", s)),
        },
        other => Err(format!("'{}' is not a flag value", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::customization::Overlay;
    use crate::schema::{FieldDef, FieldType};
    use std::collections::BTreeSet;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new(
            vec![
                EntityKind::new("Customer")
                    .with_field(FieldDef::new("full_name", FieldType::ShortText)),
                EntityKind::new("Sales Order")
                    .with_field(FieldDef::link("customer", "Customer"))
                    .with_field(FieldDef::new("total", FieldType::Number)),
            ],
            Vec::new(),
        )
    }

    fn overlay(id: &str, kind: &str, field: Option<&str>, status: CustomizationStatus, overlay: Overlay) -> Customization {
        Customization {
            id: id.to_string(),
            target_kind: kind.to_string(),
            target_field: field.map(String::from),
            status,
            overlay,
            dependents: BTreeSet::new(),
        }
    }

    #[test]
    fn test_resolve_and_suggest() {
        let snapshot = registry().snapshot();
        assert!(snapshot.resolve("sales order").is_some());

        match snapshot.require_kind("Custmer") {
            Err(AtlasError::NotFound { suggestions, .. }) => {
                assert_eq!(suggestions.first().map(String::as_str), Some("Customer"));
            }
            other => panic!("expected NotFound, got {:?}", other.map(|k| k.name.clone())),
        }
    }

    #[test]
    fn test_refresh_applies_overlays_without_touching_old_snapshot() {
        let registry = registry();
        let before = registry.snapshot();

        let overlays = vec![
            overlay(
                "cf-region",
                "Customer",
                Some("region"),
                CustomizationStatus::Active,
                Overlay::AddedField { field: FieldDef::new("region", FieldType::ShortText) },
            ),
            overlay(
                "ps-hide-total",
                "Sales Order",
                Some("total"),
                CustomizationStatus::Active,
                Overlay::PropertyOverride { property: "hidden".to_string(), value: serde_json::json!(1) },
            ),
        ];
        let after = registry.refresh(&overlays);

        assert_eq!(after.generation(), before.generation() + 1);
        assert_ne!(after.fingerprint(), before.fingerprint());
        assert!(before.kind("Customer").unwrap().field("region").is_none());
        let region = after.kind("Customer").unwrap().field("region").unwrap();
        assert!(region.custom);
        assert!(after.kind("Sales Order").unwrap().field("total").unwrap().hidden);
        assert_eq!(registry.snapshot().generation(), after.generation());
    }

    #[test]
    fn test_disabled_overlays() {
        let registry = registry();
        let overlays = vec![
            overlay(
                "cf-region",
                "Customer",
                Some("region"),
                CustomizationStatus::Disabled,
                Overlay::AddedField { field: FieldDef::new("region", FieldType::ShortText) },
            ),
            overlay(
                "ps-label",
                "Customer",
                Some("full_name"),
                CustomizationStatus::Disabled,
                Overlay::PropertyOverride { property: "label".to_string(), value: serde_json::json!("Name") },
            ),
            overlay(
                "cf-gone",
                "Customer",
                Some("gone"),
                CustomizationStatus::Deleted,
                Overlay::AddedField { field: FieldDef::new("gone", FieldType::ShortText) },
            ),
        ];
        let snapshot = registry.refresh(&overlays);
        let customer = snapshot.kind("Customer").unwrap();

        assert!(customer.field("region").unwrap().hidden);
        assert_eq!(customer.field("full_name").unwrap().label, None);
        assert!(customer.field("gone").is_none());
        assert_eq!(snapshot.customizations().len(), 3);
    }

    #[test]
    fn test_modules_group_kinds() {
        let registry = SchemaRegistry::new(
            vec![
                EntityKind::new("Customer").in_module("Selling"),
                EntityKind::new("Quotation").in_module("Selling"),
                EntityKind::new("Note"),
            ],
            Vec::new(),
        );
        let modules = registry.snapshot().modules();
        assert_eq!(modules["Selling"], vec!["Customer".to_string(), "Quotation".to_string()]);
        assert_eq!(modules[""], vec!["Note".to_string()]);
    }
}
