//! Entity kind and field definitions

use serde::{Deserialize, Serialize};

/// Name of an entity kind (unique within a snapshot)
pub type KindName = String;

/// Pseudo-field holding a record's identifier
pub const RECORD_ID_FIELD: &str = "name";

/// Semantic type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    ShortText,
    LongText,
    Number,
    Boolean,
    DateTime,
    Choice,
    Link,
    DynamicLink,
    Table,
    Attachment,
    LayoutMarker,
}

impl FieldType {
    /// Free-text field that a text query can probe
    pub fn is_text(&self) -> bool {
        matches!(self, FieldType::ShortText | FieldType::LongText)
    }

    /// Field whose `options` name another kind
    pub fn is_reference(&self) -> bool {
        matches!(self, FieldType::Link | FieldType::Table)
    }
}

/// Layout marker flavour, taken from the marker field's options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutMarker {
    Section,
    Column,
    Tab,
}

/// Entity kind flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindFlags {
    #[serde(default)]
    pub is_child_collection: bool,
    #[serde(default)]
    pub is_submittable: bool,
    #[serde(default)]
    pub is_singleton: bool,
    #[serde(default)]
    pub is_hierarchical: bool,
}

/// A single field definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Target kind (link/table), choice list (newline separated) or companion field (dynamic link)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,
    /// `<link_field>.<remote_field>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mandatory_when: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub unique: bool,
    /// Field was introduced by an added-field customization
    #[serde(default)]
    pub custom: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            label: None,
            options: None,
            derived_from: None,
            visibility: None,
            mandatory_when: None,
            required: false,
            read_only: false,
            hidden: false,
            unique: false,
            custom: false,
        }
    }

    pub fn link(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, FieldType::Link).with_options(target)
    }

    pub fn table(name: impl Into<String>, child: impl Into<String>) -> Self {
        Self::new(name, FieldType::Table).with_options(child)
    }

    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = Some(options.into());
        self
    }

    pub fn derived(mut self, from: impl Into<String>) -> Self {
        self.derived_from = Some(from.into());
        self
    }

    pub fn visible_when(mut self, expr: impl Into<String>) -> Self {
        self.visibility = Some(expr.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }

    /// Target kind for link and table fields
    pub fn target_kind(&self) -> Option<&str> {
        if self.field_type.is_reference() {
            self.options.as_deref().map(str::trim).filter(|s| !s.is_empty())
        } else {
            None
        }
    }

    /// Choice list for enumerated fields
    pub fn choices(&self) -> Vec<String> {
        self.options
            .as_deref()
            .unwrap_or_default()
            .lines()
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(String::from)
            .collect()
    }

    /// Split `derived_from` into (link field, remote field)
    pub fn derivation(&self) -> Option<(&str, &str)> {
        let raw = self.derived_from.as_deref()?.trim();
        let (link, remote) = raw.split_once('.')?;
        if link.is_empty() || remote.is_empty() {
            return None;
        }
        Some((link, remote))
    }

    pub fn layout_marker(&self) -> Option<LayoutMarker> {
        if self.field_type != FieldType::LayoutMarker {
            return None;
        }
        match self.options.as_deref().map(str::trim) {
            Some("column") => Some(LayoutMarker::Column),
            Some("tab") => Some(LayoutMarker::Tab),
            _ => Some(LayoutMarker::Section),
        }
    }
}

/// Transition of a workflow, `from --[action]--> to (by allowed)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTransition {
    pub from: String,
    pub action: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<String>,
}

impl std::fmt::Display for WorkflowTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} --[{}]--> {}", self.from, self.action, self.to)?;
        if let Some(allowed) = &self.allowed {
            write!(f, " (by {})", allowed)?;
        }
        Ok(())
    }
}

/// Document workflow attached to a kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDef {
    pub name: String,
    #[serde(default = "default_state_field")]
    pub state_field: String,
    #[serde(default)]
    pub states: Vec<String>,
    #[serde(default)]
    pub transitions: Vec<WorkflowTransition>,
    /// Kinds that documents of this kind flow into
    #[serde(default)]
    pub next_kinds: Vec<KindName>,
}

fn default_state_field() -> String {
    "workflow_state".to_string()
}

/// A named schema definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityKind {
    pub name: KindName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub flags: KindFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub naming: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowDef>,
}

impl EntityKind {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module: None,
            fields: Vec::new(),
            flags: KindFlags::default(),
            title_field: None,
            naming: None,
            workflow: None,
        }
    }

    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn in_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut FieldDef> {
        self.fields.iter_mut().find(|f| f.name == name)
    }

    /// Fields carrying data (layout markers excluded)
    pub fn data_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields
            .iter()
            .filter(|f| f.field_type != FieldType::LayoutMarker)
    }

    /// Kind can hold standalone records
    pub fn is_standalone(&self) -> bool {
        !self.flags.is_child_collection && !self.flags.is_singleton
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_helpers() {
        let link = FieldDef::link("customer", "Customer");
        assert_eq!(link.target_kind(), Some("Customer"));

        let choice = FieldDef::new("status", FieldType::Choice).with_options("Draft\n\nPaid \n");
        assert_eq!(choice.choices(), vec!["Draft", "Paid"]);
        assert_eq!(choice.target_kind(), None);

        let derived = FieldDef::new("customer_name", FieldType::ShortText).derived("customer.full_name");
        assert_eq!(derived.derivation(), Some(("customer", "full_name")));
        assert_eq!(
            FieldDef::new("x", FieldType::ShortText).derived("broken").derivation(),
            None
        );
    }

    #[test]
    fn test_kind_from_json() {
        let kind: EntityKind = serde_json::from_value(serde_json::json!({
            "name": "Order",
            "module": "Selling",
            "flags": { "is_submittable": true },
            "fields": [
                { "name": "customer", "type": "link", "options": "Customer", "required": true },
                { "name": "details", "type": "layout_marker", "options": "section" },
                { "name": "total", "type": "number" }
            ]
        }))
        .unwrap();

        assert!(kind.flags.is_submittable);
        assert!(kind.is_standalone());
        assert_eq!(kind.data_fields().count(), 2);
        assert!(kind.field("customer").unwrap().required);
    }
}
