//! Customization overlays
//!
//! Overlays layered on top of the base schema: added fields, scripts and
//! property overrides. Their lifecycle (Active, Disabled, Deleted) and the
//! dependency edges between them live in [`CustomizationRegistry`].

mod arena;

pub use arena::{CustomizationRegistry, Transition};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::schema::{FieldDef, KindName};

/// Lifecycle state of a customization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomizationStatus {
    #[default]
    Active,
    Disabled,
    /// Terminal
    Deleted,
}

impl fmt::Display for CustomizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CustomizationStatus::Active => "active",
            CustomizationStatus::Disabled => "disabled",
            CustomizationStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Type of customization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomizationKind {
    AddedField,
    Script,
    PropertyOverride,
}

impl fmt::Display for CustomizationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CustomizationKind::AddedField => "added_field",
            CustomizationKind::Script => "script",
            CustomizationKind::PropertyOverride => "property_override",
        };
        f.write_str(s)
    }
}

/// What a customization changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Overlay {
    AddedField {
        field: FieldDef,
    },
    Script {
        event: String,
        body: String,
    },
    PropertyOverride {
        property: String,
        value: serde_json::Value,
    },
}

impl Overlay {
    pub fn kind(&self) -> CustomizationKind {
        match self {
            Overlay::AddedField { .. } => CustomizationKind::AddedField,
            Overlay::Script { .. } => CustomizationKind::Script,
            Overlay::PropertyOverride { .. } => CustomizationKind::PropertyOverride,
        }
    }
}

/// A customization as seen by readers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customization {
    pub id: String,
    pub target_kind: KindName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_field: Option<String>,
    pub status: CustomizationStatus,
    #[serde(flatten)]
    pub overlay: Overlay,
    /// Ids of live customizations that reference this one
    #[serde(default)]
    pub dependents: BTreeSet<String>,
}

impl Customization {
    pub fn kind(&self) -> CustomizationKind {
        self.overlay.kind()
    }

    /// Field name introduced by an added-field customization
    pub fn added_field_name(&self) -> Option<&str> {
        match &self.overlay {
            Overlay::AddedField { field } => Some(field.name.as_str()),
            _ => None,
        }
    }
}

/// Registration input for a customization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomizationDef {
    pub id: String,
    pub target_kind: KindName,
    #[serde(default)]
    pub target_field: Option<String>,
    #[serde(default)]
    pub status: CustomizationStatus,
    #[serde(flatten)]
    pub overlay: Overlay,
    /// Explicit dependencies in addition to the derived ones
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl CustomizationDef {
    pub fn added_field(id: impl Into<String>, kind: impl Into<String>, field: FieldDef) -> Self {
        Self {
            id: id.into(),
            target_kind: kind.into(),
            target_field: Some(field.name.clone()),
            status: CustomizationStatus::Active,
            overlay: Overlay::AddedField { field },
            depends_on: Vec::new(),
        }
    }

    pub fn script(
        id: impl Into<String>,
        kind: impl Into<String>,
        event: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            target_kind: kind.into(),
            target_field: None,
            status: CustomizationStatus::Active,
            overlay: Overlay::Script {
                event: event.into(),
                body: body.into(),
            },
            depends_on: Vec::new(),
        }
    }

    pub fn property_override(
        id: impl Into<String>,
        kind: impl Into<String>,
        field: Option<&str>,
        property: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            target_kind: kind.into(),
            target_field: field.map(String::from),
            status: CustomizationStatus::Active,
            overlay: Overlay::PropertyOverride {
                property: property.into(),
                value,
            },
            depends_on: Vec::new(),
        }
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }
}
