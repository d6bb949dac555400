//! Ephemeral create/verify/delete test harness
//!
//! Proves a kind is usable end to end: create a record through the record
//! store, read it back, compare the payload, then delete it. The delete runs
//! whatever happened during verification, and its own failure is reported as
//! an `Error` outcome rather than folded into pass/fail.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::error::{AtlasError, Result};
use crate::registry::SchemaSnapshot;
use crate::schema::{EntityKind, FieldDef, FieldType, RECORD_ID_FIELD};
use crate::store::{AccessPolicy, Action, Caller, Record, RecordStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Pass,
    Fail,
    /// Cleanup failed; the record may still exist
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMismatch {
    pub field: String,
    pub expected: Value,
    /// `None` when the stored record lacks the field
    pub actual: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CleanupStatus {
    /// Deleted and confirmed absent on re-read
    Deleted,
    /// Nothing was created
    NotNeeded,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRun {
    pub kind: String,
    /// Payload as submitted, including filled required fields
    pub payload: Map<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub filled_fields: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    pub outcome: TestOutcome,
    pub diff: Vec<FieldMismatch>,
    pub cleanup: CleanupStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What the verification step concluded
enum Verification {
    Matched,
    Mismatched(Vec<FieldMismatch>),
    Failed(String),
}

pub struct EphemeralTestHarness {
    store: Arc<dyn RecordStore>,
    policy: Arc<dyn AccessPolicy>,
    config: HarnessConfig,
}

impl EphemeralTestHarness {
    pub fn new(store: Arc<dyn RecordStore>, policy: Arc<dyn AccessPolicy>, config: HarnessConfig) -> Self {
        Self {
            store,
            policy,
            config,
        }
    }

    pub async fn test(
        &self,
        snapshot: &SchemaSnapshot,
        caller: &Caller,
        kind: &str,
        payload: Map<String, Value>,
    ) -> Result<TestRun> {
        let entity = snapshot.require_kind(kind)?;
        let kind = entity.name.as_str();

        if entity.flags.is_child_collection || entity.flags.is_singleton {
            return Err(AtlasError::ValidationFailure(format!(
                "{} cannot hold standalone records",
                kind
            )));
        }
        for action in [Action::Create, Action::Delete] {
            if !self.policy.can_access(caller, kind, action) {
                return Err(AtlasError::PermissionDenied {
                    caller: caller.user.clone(),
                    kind: kind.to_string(),
                    action: action.to_string(),
                });
            }
        }
        let unknown: Vec<&str> = payload
            .keys()
            .map(String::as_str)
            .filter(|k| *k != RECORD_ID_FIELD && entity.data_fields().all(|f| f.name != *k))
            .collect();
        if !unknown.is_empty() {
            return Err(AtlasError::ValidationFailure(format!(
                "{} has no field(s) {}",
                kind,
                unknown.join(", ")
            )));
        }

        let mut submitted = payload.clone();
        let filled_fields = if self.config.fill_required {
            self.fill_required(entity, &mut submitted).await
        } else {
            Vec::new()
        };

        let mut run = TestRun {
            kind: kind.to_string(),
            payload: submitted.clone(),
            filled_fields,
            record_id: None,
            outcome: TestOutcome::Fail,
            diff: Vec::new(),
            cleanup: CleanupStatus::NotNeeded,
            error: None,
        };

        let record = match self.store.create(kind, submitted).await {
            Ok(record) => record,
            Err(err) => {
                info!(kind, error = %err, "Test record creation failed");
                run.error = Some(format!("create failed: {}", err));
                return Ok(run);
            }
        };
        debug!(kind, id = %record.id, "Created test record");
        run.record_id = Some(record.id.clone());

        let verification = AssertUnwindSafe(self.verify(kind, &record.id, &payload))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Verification::Failed("verification panicked".to_string()));

        run.cleanup = self.cleanup(kind, &record.id).await;

        match verification {
            Verification::Matched => run.outcome = TestOutcome::Pass,
            Verification::Mismatched(diff) => {
                run.outcome = TestOutcome::Fail;
                run.error = Some(
                    AtlasError::ValidationFailure(format!("{} field(s) differ after re-read", diff.len()))
                        .to_string(),
                );
                run.diff = diff;
            }
            Verification::Failed(reason) => {
                run.outcome = TestOutcome::Fail;
                run.error = Some(reason);
            }
        }
        if let CleanupStatus::Failed { reason } = &run.cleanup {
            let err = AtlasError::CleanupFailure {
                kind: kind.to_string(),
                record_id: record.id.clone(),
                reason: reason.clone(),
            };
            warn!(kind, id = %record.id, "{}", err);
            run.outcome = TestOutcome::Error;
            run.error = Some(err.to_string());
        }
        Ok(run)
    }

    /// Fill missing required fields with type-appropriate values; returns the filled names
    async fn fill_required(&self, entity: &EntityKind, values: &mut Map<String, Value>) -> Vec<String> {
        let mut filled = Vec::new();
        for field in entity.data_fields().filter(|f| f.required) {
            if values.contains_key(&field.name) {
                continue;
            }
            if let Some(value) = self.dummy_value(field).await {
                values.insert(field.name.clone(), value);
                filled.push(field.name.clone());
            }
        }
        filled
    }

    async fn dummy_value(&self, field: &FieldDef) -> Option<Value> {
        match field.field_type {
            FieldType::ShortText | FieldType::LongText => Some(Value::from("__test__")),
            FieldType::Number => Some(Value::from(1)),
            FieldType::Boolean => Some(Value::Bool(false)),
            FieldType::DateTime => Some(Value::from("2025-01-01")),
            FieldType::Choice => field.choices().into_iter().next().map(Value::from),
            FieldType::Link => {
                let target = field.target_kind()?;
                match self.store.first_id(target).await {
                    Ok(id) => id.map(Value::from),
                    Err(err) => {
                        debug!(field = %field.name, error = %err, "No linked record to fill with");
                        None
                    }
                }
            }
            FieldType::DynamicLink | FieldType::Table | FieldType::Attachment | FieldType::LayoutMarker => None,
        }
    }

    async fn verify(&self, kind: &str, id: &str, expected: &Map<String, Value>) -> Verification {
        let stored: Record = match self.store.read(kind, id).await {
            Ok(Some(record)) => record,
            Ok(None) => return Verification::Failed(format!("{} {} not readable after create", kind, id)),
            Err(err) => return Verification::Failed(format!("re-read failed: {}", err)),
        };
        let diff: Vec<FieldMismatch> = expected
            .iter()
            .filter_map(|(field, want)| {
                let actual = stored.value(field);
                match &actual {
                    Some(got) if same_value(want, got) => None,
                    _ => Some(FieldMismatch {
                        field: field.clone(),
                        expected: want.clone(),
                        actual,
                    }),
                }
            })
            .collect();
        if diff.is_empty() {
            Verification::Matched
        } else {
            Verification::Mismatched(diff)
        }
    }

    async fn cleanup(&self, kind: &str, id: &str) -> CleanupStatus {
        if let Err(err) = self.store.delete(kind, id).await {
            return CleanupStatus::Failed {
                reason: err.to_string(),
            };
        }
        match self.store.read(kind, id).await {
            Ok(None) => {
                debug!(kind, id, "Test record removed");
                CleanupStatus::Deleted
            }
            Ok(Some(_)) => CleanupStatus::Failed {
                reason: "record still present after delete".to_string(),
            },
            Err(err) => CleanupStatus::Failed {
                reason: format!("could not confirm delete: {}", err),
            },
        }
    }
}

/// Equality with integer/float numbers treated alike
fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SchemaRegistry;
    use crate::store::{LookupRequest, MemoryPolicy, MemoryStore};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn snapshot() -> Arc<SchemaSnapshot> {
        let mut line = EntityKind::new("Order Item");
        line.flags.is_child_collection = true;
        let mut settings = EntityKind::new("Selling Settings");
        settings.flags.is_singleton = true;
        SchemaRegistry::new(
            vec![
                EntityKind::new("Customer")
                    .with_field(FieldDef::new("full_name", FieldType::ShortText))
                    .with_field(FieldDef::new("credit_limit", FieldType::Number)),
                EntityKind::new("Order")
                    .with_field(FieldDef::link("customer", "Customer").required())
                    .with_field(FieldDef::new("status", FieldType::Choice).with_options("Draft\nPaid").required())
                    .with_field(FieldDef::new("total", FieldType::Number)),
                line,
                settings,
            ],
            Vec::new(),
        )
        .snapshot()
    }

    fn harness(store: Arc<dyn RecordStore>) -> EphemeralTestHarness {
        EphemeralTestHarness::new(store, Arc::new(MemoryPolicy::allow_all()), HarnessConfig::default())
    }

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_pass_leaves_nothing_behind() {
        let store = Arc::new(MemoryStore::new());
        let run = harness(store.clone())
            .test(&snapshot(), &Caller::system(), "Customer", payload(json!({"name": "Test", "credit_limit": 500})))
            .await
            .unwrap();

        assert_eq!(run.outcome, TestOutcome::Pass);
        assert_eq!(run.record_id.as_deref(), Some("Test"));
        assert_eq!(run.cleanup, CleanupStatus::Deleted);
        assert!(run.diff.is_empty());
        assert_eq!(store.count("Customer"), 0);
    }

    #[tokio::test]
    async fn test_cleanup_failure_is_error() {
        let store = Arc::new(MemoryStore::new().with_delete_failure("Customer"));
        let run = harness(store.clone())
            .test(&snapshot(), &Caller::system(), "Customer", payload(json!({"name": "Test"})))
            .await
            .unwrap();

        assert_eq!(run.outcome, TestOutcome::Error);
        assert!(matches!(run.cleanup, CleanupStatus::Failed { .. }));
        assert!(run.error.unwrap().contains("Cleanup failed"));
        assert_eq!(store.count("Customer"), 1);
    }

    #[tokio::test]
    async fn test_required_fields_filled() {
        let records = BTreeMap::from([(
            "Customer".to_string(),
            vec![Record {
                id: "CUST-1".to_string(),
                values: Map::new(),
            }],
        )]);
        let store = Arc::new(MemoryStore::with_records(records));
        let run = harness(store)
            .test(&snapshot(), &Caller::system(), "order", payload(json!({"total": 12})))
            .await
            .unwrap();

        assert_eq!(run.kind, "Order");
        assert_eq!(run.outcome, TestOutcome::Pass);
        assert_eq!(run.filled_fields, vec!["customer", "status"]);
        assert_eq!(run.payload["customer"], "CUST-1");
        assert_eq!(run.payload["status"], "Draft");
    }

    #[tokio::test]
    async fn test_rejections() {
        let h = harness(Arc::new(MemoryStore::new()));
        let s = snapshot();
        let caller = Caller::system();
        for kind in ["Order Item", "Selling Settings"] {
            assert!(matches!(
                h.test(&s, &caller, kind, Map::new()).await,
                Err(AtlasError::ValidationFailure(_))
            ));
        }
        assert!(matches!(
            h.test(&s, &caller, "Customer", payload(json!({"nickname": "x"}))).await,
            Err(AtlasError::ValidationFailure(_))
        ));
        assert!(matches!(
            h.test(&s, &caller, "Custmer", Map::new()).await,
            Err(AtlasError::NotFound { .. })
        ));

        let denied = EphemeralTestHarness::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryPolicy::allow_all().deny("guest", "Customer", Action::Delete)),
            HarnessConfig::default(),
        );
        assert!(matches!(
            denied.test(&s, &Caller::new("guest"), "Customer", Map::new()).await,
            Err(AtlasError::PermissionDenied { .. })
        ));
    }

    /// Store that silently drops one field on create
    struct LossyStore {
        inner: MemoryStore,
        drop_field: &'static str,
    }

    #[async_trait]
    impl RecordStore for LossyStore {
        async fn create(&self, kind: &str, mut values: Map<String, Value>) -> anyhow::Result<Record> {
            values.remove(self.drop_field);
            self.inner.create(kind, values).await
        }
        async fn read(&self, kind: &str, id: &str) -> anyhow::Result<Option<Record>> {
            self.inner.read(kind, id).await
        }
        async fn update(&self, kind: &str, id: &str, values: Map<String, Value>) -> anyhow::Result<Record> {
            self.inner.update(kind, id, values).await
        }
        async fn delete(&self, kind: &str, id: &str) -> anyhow::Result<()> {
            self.inner.delete(kind, id).await
        }
        async fn find(&self, kind: &str, request: &LookupRequest) -> anyhow::Result<Vec<Record>> {
            self.inner.find(kind, request).await
        }
        async fn first_id(&self, kind: &str) -> anyhow::Result<Option<String>> {
            self.inner.first_id(kind).await
        }
    }

    #[tokio::test]
    async fn test_mismatch_still_cleans_up() {
        let store = Arc::new(LossyStore {
            inner: MemoryStore::new(),
            drop_field: "credit_limit",
        });
        let run = harness(store.clone())
            .test(
                &snapshot(),
                &Caller::system(),
                "Customer",
                payload(json!({"full_name": "Ada", "credit_limit": 10})),
            )
            .await
            .unwrap();

        assert_eq!(run.outcome, TestOutcome::Fail);
        assert_eq!(
            run.diff,
            vec![FieldMismatch {
                field: "credit_limit".to_string(),
                expected: json!(10),
                actual: None,
            }]
        );
        assert_eq!(run.cleanup, CleanupStatus::Deleted);
        assert_eq!(store.inner.count("Customer"), 0);
    }

    #[tokio::test]
    async fn test_create_failure_needs_no_cleanup() {
        let records = BTreeMap::from([(
            "Customer".to_string(),
            vec![Record {
                id: "Test".to_string(),
                values: Map::new(),
            }],
        )]);
        let run = harness(Arc::new(MemoryStore::with_records(records)))
            .test(&snapshot(), &Caller::system(), "Customer", payload(json!({"name": "Test"})))
            .await
            .unwrap();

        assert_eq!(run.outcome, TestOutcome::Fail);
        assert_eq!(run.cleanup, CleanupStatus::NotNeeded);
        assert!(run.record_id.is_none());
    }
}
