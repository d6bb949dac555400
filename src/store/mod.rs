//! External collaborators
//!
//! The atlas never owns records, permissions, error logs or notification
//! delivery. It talks to them through these traits; `memory` has the
//! in-process implementations used by the CLI and the tests.

pub mod memory;

pub use memory::{MemoryErrorFeed, MemoryNotifier, MemoryPolicy, MemoryStore, TracingNotifier};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::schema::RECORD_ID_FIELD;

/// A stored record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(default)]
    pub values: Map<String, Value>,
}

impl Record {
    /// Field value; `name` is the record id
    pub fn value(&self, field: &str) -> Option<Value> {
        if field == RECORD_ID_FIELD {
            return Some(Value::String(self.id.clone()));
        }
        self.values.get(field).cloned()
    }
}

/// How a probe compares a field's stored value
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeMatch {
    NumberEquals(f64),
    DateEquals(NaiveDate),
    /// Case-insensitive substring
    TextContains(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldProbe {
    pub field: String,
    pub matcher: ProbeMatch,
}

/// Records of one kind matching any of the probes
#[derive(Debug, Clone, PartialEq)]
pub struct LookupRequest {
    pub probes: Vec<FieldProbe>,
    pub limit: usize,
}

/// Persistence/CRUD engine
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create(&self, kind: &str, values: Map<String, Value>) -> Result<Record>;
    async fn read(&self, kind: &str, id: &str) -> Result<Option<Record>>;
    async fn update(&self, kind: &str, id: &str, values: Map<String, Value>) -> Result<Record>;
    async fn delete(&self, kind: &str, id: &str) -> Result<()>;

    async fn find(&self, kind: &str, request: &LookupRequest) -> Result<Vec<Record>>;

    /// Any existing record id of a kind (used to fill link fields)
    async fn first_id(&self, kind: &str) -> Result<Option<String>>;
}

/// Who is asking
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Caller {
    pub user: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Caller {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            roles: Vec::new(),
        }
    }

    pub fn system() -> Self {
        Self::new("Administrator")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Read,
    Create,
    Write,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Read => "read",
            Action::Create => "create",
            Action::Write => "write",
            Action::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Permission predicate
pub trait AccessPolicy: Send + Sync {
    fn can_access(&self, caller: &Caller, kind: &str, action: Action) -> bool;
}

/// A raw error log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Method or endpoint that raised
    #[serde(default)]
    pub method: Option<String>,
    pub message: String,
}

/// Error log feed
#[async_trait]
pub trait ErrorFeed: Send + Sync {
    /// Records with `since <= timestamp < until`, newest first, at most `limit`
    async fn fetch(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ErrorRecord>>;
}

/// A committed customization transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub audit_id: uuid::Uuid,
    pub customization_id: String,
    pub target_kind: String,
    pub action: String,
    pub from: String,
    pub to: String,
    pub caller: String,
}

/// Notification subsystem, told about every committed transition
#[async_trait]
pub trait ChangeNotifier: Send + Sync {
    async fn notify(&self, event: &ChangeEvent) -> Result<()>;
}
