//! In-memory collaborators

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tracing::info;

use super::{
    AccessPolicy, Action, Caller, ChangeEvent, ChangeNotifier, ErrorFeed, ErrorRecord,
    LookupRequest, ProbeMatch, Record, RecordStore,
};
use crate::schema::RECORD_ID_FIELD;

/// Record store backed by ordered maps, with fault injection for tests
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, BTreeMap<String, Record>>>,
    counter: AtomicU64,
    lookup_delays: HashMap<String, Duration>,
    lookup_failures: HashSet<String>,
    delete_failures: HashSet<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed records, keyed by kind
    pub fn with_records(records: BTreeMap<String, Vec<Record>>) -> Self {
        let store = Self::default();
        {
            let mut all = store.records.write().unwrap_or_else(|e| e.into_inner());
            for (kind, list) in records {
                let by_id = all.entry(kind).or_default();
                for record in list {
                    by_id.insert(record.id.clone(), record);
                }
            }
        }
        store
    }

    /// Every lookup on `kind` sleeps first
    pub fn with_lookup_delay(mut self, kind: impl Into<String>, delay: Duration) -> Self {
        self.lookup_delays.insert(kind.into(), delay);
        self
    }

    /// Every lookup on `kind` fails
    pub fn with_lookup_failure(mut self, kind: impl Into<String>) -> Self {
        self.lookup_failures.insert(kind.into());
        self
    }

    /// Every delete on `kind` fails
    pub fn with_delete_failure(mut self, kind: impl Into<String>) -> Self {
        self.delete_failures.insert(kind.into());
        self
    }

    pub fn count(&self, kind: &str) -> usize {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(kind)
            .map_or(0, BTreeMap::len)
    }

    fn next_id(&self, kind: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let prefix: String = kind
            .split_whitespace()
            .filter_map(|w| w.chars().next())
            .collect::<String>()
            .to_uppercase();
        format!("{}-{:05}", prefix, n)
    }
}

fn probe_matches(record: &Record, field: &str, matcher: &ProbeMatch) -> bool {
    let Some(value) = record.value(field) else {
        return false;
    };
    match matcher {
        ProbeMatch::NumberEquals(n) => match &value {
            Value::Number(v) => v.as_f64() == Some(*n),
            Value::String(s) => s.trim().parse::<f64>().ok() == Some(*n),
            _ => false,
        },
        ProbeMatch::DateEquals(date) => match &value {
            Value::String(s) => s.starts_with(&date.format("%Y-%m-%d").to_string()),
            _ => false,
        },
        ProbeMatch::TextContains(needle) => {
            let haystack = match &value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return false,
            };
            haystack.to_lowercase().contains(&needle.to_lowercase())
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn create(&self, kind: &str, mut values: Map<String, Value>) -> Result<Record> {
        let id = match values.remove(RECORD_ID_FIELD) {
            Some(Value::String(s)) if !s.trim().is_empty() => s,
            _ => self.next_id(kind),
        };
        let mut all = self.records.write().unwrap_or_else(|e| e.into_inner());
        let by_id = all.entry(kind.to_string()).or_default();
        if by_id.contains_key(&id) {
            bail!("{} {} already exists", kind, id);
        }
        let record = Record { id: id.clone(), values };
        by_id.insert(id, record.clone());
        Ok(record)
    }

    async fn read(&self, kind: &str, id: &str) -> Result<Option<Record>> {
        let all = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(all.get(kind).and_then(|by_id| by_id.get(id)).cloned())
    }

    async fn update(&self, kind: &str, id: &str, values: Map<String, Value>) -> Result<Record> {
        let mut all = self.records.write().unwrap_or_else(|e| e.into_inner());
        let record = all
            .get_mut(kind)
            .and_then(|by_id| by_id.get_mut(id))
            .ok_or_else(|| anyhow!("{} {} not found", kind, id))?;
        record.values.extend(values);
        Ok(record.clone())
    }

    async fn delete(&self, kind: &str, id: &str) -> Result<()> {
        if self.delete_failures.contains(kind) {
            bail!("delete of {} {} rejected", kind, id);
        }
        let mut all = self.records.write().unwrap_or_else(|e| e.into_inner());
        all.get_mut(kind)
            .and_then(|by_id| by_id.remove(id))
            .map(|_| ())
            .ok_or_else(|| anyhow!("{} {} not found", kind, id))
    }

    async fn find(&self, kind: &str, request: &LookupRequest) -> Result<Vec<Record>> {
        if let Some(delay) = self.lookup_delays.get(kind) {
            tokio::time::sleep(*delay).await;
        }
        if self.lookup_failures.contains(kind) {
            bail!("lookup on {} failed", kind);
        }
        let all = self.records.read().unwrap_or_else(|e| e.into_inner());
        let Some(by_id) = all.get(kind) else {
            return Ok(Vec::new());
        };
        Ok(by_id
            .values()
            .filter(|r| {
                request
                    .probes
                    .iter()
                    .any(|p| probe_matches(r, &p.field, &p.matcher))
            })
            .take(request.limit)
            .cloned()
            .collect())
    }

    async fn first_id(&self, kind: &str) -> Result<Option<String>> {
        let all = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(all
            .get(kind)
            .and_then(|by_id| by_id.keys().next().cloned()))
    }
}

/// Permission table: everything is allowed unless denied
#[derive(Debug, Default)]
pub struct MemoryPolicy {
    /// (user, kind or "*", action)
    denied: HashSet<(String, String, Action)>,
}

impl MemoryPolicy {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn deny(mut self, user: impl Into<String>, kind: impl Into<String>, action: Action) -> Self {
        self.denied.insert((user.into(), kind.into(), action));
        self
    }
}

impl AccessPolicy for MemoryPolicy {
    fn can_access(&self, caller: &Caller, kind: &str, action: Action) -> bool {
        let user = caller.user.clone();
        !self.denied.contains(&(user.clone(), kind.to_string(), action))
            && !self.denied.contains(&(user, "*".to_string(), action))
    }
}

/// Error feed over a fixed list of records
#[derive(Debug, Default)]
pub struct MemoryErrorFeed {
    records: RwLock<Vec<ErrorRecord>>,
    /// Windows starting before this instant are unavailable
    available_from: Option<DateTime<Utc>>,
}

impl MemoryErrorFeed {
    pub fn new(records: Vec<ErrorRecord>) -> Self {
        Self {
            records: RwLock::new(records),
            available_from: None,
        }
    }

    pub fn available_from(mut self, instant: DateTime<Utc>) -> Self {
        self.available_from = Some(instant);
        self
    }

    pub fn push(&self, record: ErrorRecord) {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }
}

#[async_trait]
impl ErrorFeed for MemoryErrorFeed {
    async fn fetch(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ErrorRecord>> {
        if let Some(from) = self.available_from {
            if since < from {
                bail!("error log not retained before {}", from.to_rfc3339());
            }
        }
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut window: Vec<ErrorRecord> = records
            .iter()
            .filter(|r| r.timestamp >= since && r.timestamp < until)
            .cloned()
            .collect();
        window.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        window.truncate(limit);
        Ok(window)
    }
}

/// Notifier that only logs
#[derive(Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl ChangeNotifier for TracingNotifier {
    async fn notify(&self, event: &ChangeEvent) -> Result<()> {
        info!(
            audit_id = %event.audit_id,
            customization = %event.customization_id,
            kind = %event.target_kind,
            action = %event.action,
            from = %event.from,
            to = %event.to,
            "Customization changed"
        );
        Ok(())
    }
}

/// Notifier that keeps every event
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    events: Mutex<Vec<ChangeEvent>>,
}

impl MemoryNotifier {
    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ChangeNotifier for MemoryNotifier {
    async fn notify(&self, event: &ChangeEvent) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}
