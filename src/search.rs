//! Universal search
//!
//! A query is classified once, turned into per-kind field probes, and fanned
//! out to the record store with one independently timed lookup per kind.
//! Hits are scored by match specificity and merged into one ranking.

use chrono::NaiveDate;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::SearchConfig;
use crate::error::{AtlasError, Result};
use crate::registry::SchemaSnapshot;
use crate::schema::{EntityKind, FieldType, RECORD_ID_FIELD};
use crate::store::{
    AccessPolicy, Action, Caller, FieldProbe, LookupRequest, ProbeMatch, Record, RecordStore,
};

/// What the query looks like
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", content = "value", rename_all = "snake_case")]
pub enum QueryClass {
    Numeric(f64),
    Date(NaiveDate),
    Text,
}

/// Classify a raw query
pub fn classify(query: &str) -> QueryClass {
    let trimmed = query.trim();
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return QueryClass::Date(date);
    }
    let digits: String = trimmed
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();
    match digits.parse::<f64>() {
        Ok(n) if n.is_finite() => QueryClass::Numeric(n),
        _ => QueryClass::Text,
    }
}

/// Match specificity, best first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Prefix,
    Substring,
}

impl MatchType {
    pub fn score(&self) -> u32 {
        match self {
            MatchType::Exact => 100,
            MatchType::Prefix => 60,
            MatchType::Substring => 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub kind: String,
    pub record_id: String,
    pub matched_field: String,
    pub matched_value: String,
    pub match_type: MatchType,
    pub score: u32,
    /// Declared position of the matched field (the record id is 0)
    pub field_position: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The kind's own lookup exceeded its timeout
    Timeout,
    /// The store reported an error
    Lookup,
    /// The caller's overall deadline passed first
    DeadlineExceeded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialFailure {
    pub kind: String,
    pub reason: FailureReason,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub query: String,
    pub class: QueryClass,
    pub hits: Vec<SearchHit>,
    pub partial_failures: Vec<PartialFailure>,
    pub searched_kinds: Vec<String>,
    /// Hits before truncation to the limit
    pub total_found: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchRequest {
    pub query: String,
    /// Maximum hits; `None` uses the configured default
    pub limit: Option<usize>,
    /// Search only this kind
    pub kind: Option<String>,
    /// Return whatever finished by then
    pub deadline: Option<Duration>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone)]
struct PlannedProbe {
    field: String,
    position: usize,
    matcher: ProbeMatch,
}

#[derive(Debug, Clone)]
struct KindPlan {
    kind: String,
    probes: Vec<PlannedProbe>,
}

impl KindPlan {
    fn request(&self, limit: usize) -> LookupRequest {
        LookupRequest {
            probes: self
                .probes
                .iter()
                .map(|p| FieldProbe {
                    field: p.field.clone(),
                    matcher: p.matcher.clone(),
                })
                .collect(),
            limit,
        }
    }

    /// Best probe match for a record returned by the store
    fn score(&self, record: &Record) -> Option<SearchHit> {
        self.probes
            .iter()
            .filter_map(|p| {
                let value = record.value(&p.field)?;
                let (match_type, rendered) = match_value(&p.matcher, &value)?;
                Some(SearchHit {
                    kind: self.kind.clone(),
                    record_id: record.id.clone(),
                    matched_field: p.field.clone(),
                    matched_value: rendered,
                    match_type,
                    score: match_type.score(),
                    field_position: p.position,
                })
            })
            .min_by(|a, b| {
                b.score
                    .cmp(&a.score)
                    .then(a.field_position.cmp(&b.field_position))
            })
    }
}

fn render(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn match_value(matcher: &ProbeMatch, value: &Value) -> Option<(MatchType, String)> {
    let rendered = render(value)?;
    match matcher {
        ProbeMatch::NumberEquals(n) => {
            let v = match value {
                Value::Number(v) => v.as_f64(),
                _ => rendered.trim().parse::<f64>().ok(),
            };
            (v == Some(*n)).then_some((MatchType::Exact, rendered))
        }
        ProbeMatch::DateEquals(date) => {
            let iso = date.format("%Y-%m-%d").to_string();
            if rendered == iso {
                Some((MatchType::Exact, rendered))
            } else if rendered.starts_with(&iso) {
                Some((MatchType::Prefix, rendered))
            } else {
                None
            }
        }
        ProbeMatch::TextContains(needle) => {
            let hay = rendered.to_lowercase();
            let needle = needle.to_lowercase();
            let match_type = if hay == needle {
                MatchType::Exact
            } else if hay.starts_with(&needle) {
                MatchType::Prefix
            } else if hay.contains(&needle) {
                MatchType::Substring
            } else {
                return None;
            };
            Some((match_type, rendered))
        }
    }
}

/// Cross-kind search over the record store
pub struct SearchEngine {
    store: Arc<dyn RecordStore>,
    policy: Arc<dyn AccessPolicy>,
    config: SearchConfig,
}

impl SearchEngine {
    pub fn new(store: Arc<dyn RecordStore>, policy: Arc<dyn AccessPolicy>, config: SearchConfig) -> Self {
        Self {
            store,
            policy,
            config,
        }
    }

    /// Probes for one kind; the record id is always probed as text
    fn plan(&self, kind: &EntityKind, query: &str, class: QueryClass) -> KindPlan {
        let text = || ProbeMatch::TextContains(query.trim().to_string());
        let mut probes = vec![PlannedProbe {
            field: RECORD_ID_FIELD.to_string(),
            position: 0,
            matcher: text(),
        }];
        let (mut text_probes, mut numeric_probes) = (0, 0);

        for (idx, field) in kind.fields.iter().enumerate() {
            if field.hidden || field.name == RECORD_ID_FIELD {
                continue;
            }
            let matcher = match (class, field.field_type) {
                (QueryClass::Numeric(n), FieldType::Number) => Some((ProbeMatch::NumberEquals(n), true)),
                (QueryClass::Numeric(_), FieldType::DateTime) => Some((text(), true)),
                (QueryClass::Date(d), FieldType::DateTime) => Some((ProbeMatch::DateEquals(d), true)),
                (QueryClass::Numeric(_) | QueryClass::Date(_), t) if t.is_text() => Some((text(), false)),
                (QueryClass::Text, t) if t.is_text() => Some((text(), false)),
                (QueryClass::Text, FieldType::Choice | FieldType::Link) => Some((text(), false)),
                _ => None,
            };
            let Some((matcher, numeric)) = matcher else { continue };
            if numeric {
                if numeric_probes >= self.config.max_numeric_fields {
                    continue;
                }
                numeric_probes += 1;
            } else {
                if text_probes >= self.config.max_text_fields {
                    continue;
                }
                text_probes += 1;
            }
            probes.push(PlannedProbe {
                field: field.name.clone(),
                position: idx + 1,
                matcher,
            });
        }

        KindPlan {
            kind: kind.name.clone(),
            probes,
        }
    }

    /// Kinds to fan out to: readable standalone kinds, priority kinds first
    fn kinds_to_search<'a>(&self, snapshot: &'a SchemaSnapshot, caller: &Caller) -> Vec<&'a EntityKind> {
        let readable: Vec<&EntityKind> = snapshot
            .kinds()
            .filter(|k| k.is_standalone())
            .filter(|k| self.policy.can_access(caller, &k.name, Action::Read))
            .collect();

        let mut ordered: Vec<&EntityKind> = self
            .config
            .priority_kinds
            .iter()
            .filter_map(|p| readable.iter().find(|k| &k.name == p).copied())
            .collect();
        for kind in readable {
            if !ordered.iter().any(|k| k.name == kind.name) {
                ordered.push(kind);
            }
        }
        ordered.truncate(self.config.max_kinds);
        ordered
    }

    pub async fn search(
        &self,
        snapshot: &SchemaSnapshot,
        caller: &Caller,
        request: &SearchRequest,
    ) -> Result<SearchOutcome> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(AtlasError::ValidationFailure("search query is empty".to_string()));
        }
        let limit = match request.limit {
            Some(0) => return Err(AtlasError::ValidationFailure("search limit must be at least 1".to_string())),
            Some(limit) => limit,
            None => self.config.default_limit,
        };
        let class = classify(query);

        let (kinds, per_kind_limit) = match &request.kind {
            Some(name) => {
                let kind = snapshot.require_kind(name)?;
                if !self.policy.can_access(caller, &kind.name, Action::Read) {
                    return Err(AtlasError::PermissionDenied {
                        caller: caller.user.clone(),
                        kind: kind.name.clone(),
                        action: Action::Read.to_string(),
                    });
                }
                (vec![kind], limit)
            }
            None => (
                self.kinds_to_search(snapshot, caller),
                self.config.min_per_kind.max(limit / 6),
            ),
        };

        let plans: Vec<KindPlan> = kinds.iter().map(|k| self.plan(k, query, class)).collect();
        let searched_kinds: Vec<String> = plans.iter().map(|p| p.kind.clone()).collect();
        let timeout = self.config.per_kind_timeout();

        let mut lookups = FuturesUnordered::new();
        for plan in &plans {
            let store = Arc::clone(&self.store);
            let lookup = plan.request(per_kind_limit);
            let kind = plan.kind.clone();
            lookups.push(async move {
                let result = tokio::time::timeout(timeout, store.find(&kind, &lookup)).await;
                (kind, result)
            });
        }

        let deadline = request.deadline.map(|d| tokio::time::Instant::now() + d);
        let mut pending: HashSet<String> = searched_kinds.iter().cloned().collect();
        let mut hits = Vec::new();
        let mut partial_failures = Vec::new();

        loop {
            let next = match deadline {
                Some(at) => match tokio::time::timeout_at(at, lookups.next()).await {
                    Ok(next) => next,
                    Err(_) => break,
                },
                None => lookups.next().await,
            };
            let Some((kind, result)) = next else { break };
            pending.remove(&kind);

            match result {
                Ok(Ok(records)) => {
                    if let Some(plan) = plans.iter().find(|p| p.kind == kind) {
                        hits.extend(records.iter().filter_map(|r| plan.score(r)));
                    }
                }
                Ok(Err(err)) => {
                    warn!(kind = %kind, error = %err, "Search lookup failed");
                    partial_failures.push(PartialFailure {
                        kind,
                        reason: FailureReason::Lookup,
                        detail: format!("{:#}", err),
                    });
                }
                Err(_) => {
                    warn!(kind = %kind, timeout_ms = timeout.as_millis() as u64, "Search lookup timed out");
                    partial_failures.push(PartialFailure {
                        detail: AtlasError::Timeout {
                            operation: format!("lookup on {}", kind),
                            after_ms: timeout.as_millis() as u64,
                        }
                        .to_string(),
                        kind,
                        reason: FailureReason::Timeout,
                    });
                }
            }
        }

        let mut unfinished: Vec<String> = pending.into_iter().collect();
        unfinished.sort();
        for kind in unfinished {
            partial_failures.push(PartialFailure {
                kind,
                reason: FailureReason::DeadlineExceeded,
                detail: "search deadline passed before the lookup finished".to_string(),
            });
        }
        partial_failures.sort_by(|a, b| a.kind.cmp(&b.kind));

        hits.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then(a.field_position.cmp(&b.field_position))
                .then_with(|| a.kind.cmp(&b.kind))
                .then_with(|| a.record_id.cmp(&b.record_id))
        });
        let mut seen = HashSet::new();
        hits.retain(|h| seen.insert((h.kind.clone(), h.record_id.clone())));
        let total_found = hits.len();
        hits.truncate(limit);

        debug!(
            query,
            kinds = searched_kinds.len(),
            hits = hits.len(),
            total_found,
            partial = partial_failures.len(),
            "Search finished"
        );

        Ok(SearchOutcome {
            query: query.to_string(),
            class,
            hits,
            partial_failures,
            searched_kinds,
            total_found,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SchemaRegistry;
    use crate::schema::FieldDef;
    use crate::store::{MemoryPolicy, MemoryStore};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn record(id: &str, values: Value) -> Record {
        Record {
            id: id.to_string(),
            values: values.as_object().cloned().unwrap(),
        }
    }

    fn snapshot() -> Arc<SchemaSnapshot> {
        SchemaRegistry::new(
            vec![
                EntityKind::new("Invoice")
                    .with_field(FieldDef::new("total", FieldType::Number))
                    .with_field(FieldDef::new("remarks", FieldType::LongText)),
                EntityKind::new("Note").with_field(FieldDef::new("content", FieldType::LongText)),
                EntityKind::new("Customer")
                    .with_field(FieldDef::new("full_name", FieldType::ShortText))
                    .with_field({
                        let mut secret = FieldDef::new("secret", FieldType::ShortText);
                        secret.hidden = true;
                        secret
                    }),
            ],
            Vec::new(),
        )
        .snapshot()
    }

    fn store() -> MemoryStore {
        MemoryStore::with_records(BTreeMap::from([
            ("Invoice".to_string(), vec![record("INV-1", json!({"total": 7500}))]),
            ("Note".to_string(), vec![record("N-1", json!({"content": "paid 75000 in cash"}))]),
            (
                "Customer".to_string(),
                vec![
                    record("CUST-1", json!({"full_name": "Acme Corp", "secret": "acme"})),
                    record("CUST-2", json!({"full_name": "Big Acme"})),
                ],
            ),
        ]))
    }

    fn engine(store: MemoryStore, config: SearchConfig) -> SearchEngine {
        SearchEngine::new(Arc::new(store), Arc::new(MemoryPolicy::allow_all()), config)
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("7,500"), QueryClass::Numeric(7500.0));
        assert_eq!(
            classify("2024-03-01"),
            QueryClass::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
        );
        assert_eq!(classify("acme"), QueryClass::Text);
        assert_eq!(classify("inf"), QueryClass::Text);
    }

    #[tokio::test]
    async fn test_exact_number_beats_text_substring() {
        let engine = engine(store(), SearchConfig::default());
        let outcome = engine
            .search(&snapshot(), &Caller::system(), &SearchRequest::new("7500").limit(10))
            .await
            .unwrap();

        assert_eq!(outcome.hits.len(), 2);
        assert_eq!(outcome.hits[0].kind, "Invoice");
        assert_eq!(outcome.hits[0].match_type, MatchType::Exact);
        assert_eq!(outcome.hits[1].kind, "Note");
        assert_eq!(outcome.hits[1].match_type, MatchType::Substring);
        assert!(outcome.partial_failures.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_empty_query_and_zero_limit() {
        let engine = engine(store(), SearchConfig::default());
        let snapshot = snapshot();
        for request in [SearchRequest::new("  "), SearchRequest::new("7500").limit(0)] {
            assert!(matches!(
                engine.search(&snapshot, &Caller::system(), &request).await,
                Err(AtlasError::ValidationFailure(_))
            ));
        }

        let config = SearchConfig {
            default_limit: 1,
            ..SearchConfig::default()
        };
        let outcome = self::engine(store(), config)
            .search(&snapshot, &Caller::system(), &SearchRequest::new("7500"))
            .await
            .unwrap();
        assert_eq!(outcome.hits.len(), 1);
        assert_eq!(outcome.total_found, 2);
    }

    #[tokio::test]
    async fn test_prefix_ranking_and_hidden_fields() {
        let engine = engine(store(), SearchConfig::default());
        let outcome = engine
            .search(&snapshot(), &Caller::system(), &SearchRequest::new("acme"))
            .await
            .unwrap();

        let ids: Vec<_> = outcome.hits.iter().map(|h| h.record_id.as_str()).collect();
        assert_eq!(ids, vec!["CUST-1", "CUST-2"]);
        assert_eq!(outcome.hits[0].match_type, MatchType::Prefix);
        assert_eq!(outcome.hits[0].matched_field, "full_name");
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_kind() {
        let store = store()
            .with_lookup_failure("Note")
            .with_lookup_delay("Customer", Duration::from_millis(500));
        let config = SearchConfig {
            per_kind_timeout_ms: 50,
            ..SearchConfig::default()
        };
        let outcome = engine(store, config)
            .search(&snapshot(), &Caller::system(), &SearchRequest::new("7500"))
            .await
            .unwrap();

        assert_eq!(outcome.hits.len(), 1);
        let reasons: Vec<_> = outcome
            .partial_failures
            .iter()
            .map(|p| (p.kind.as_str(), p.reason))
            .collect();
        assert_eq!(
            reasons,
            vec![("Customer", FailureReason::Timeout), ("Note", FailureReason::Lookup)]
        );
    }

    #[tokio::test]
    async fn test_deadline_returns_partial_results() {
        let store = store().with_lookup_delay("Note", Duration::from_secs(5));
        let engine = engine(store, SearchConfig::default());
        let request = SearchRequest {
            deadline: Some(Duration::from_millis(100)),
            ..SearchRequest::new("7500")
        };
        let outcome = engine
            .search(&snapshot(), &Caller::system(), &request)
            .await
            .unwrap();

        assert_eq!(outcome.hits[0].kind, "Invoice");
        assert_eq!(outcome.partial_failures.len(), 1);
        assert_eq!(outcome.partial_failures[0].reason, FailureReason::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_single_kind_mode() {
        let policy = MemoryPolicy::allow_all().deny("guest", "Invoice", Action::Read);
        let engine = SearchEngine::new(Arc::new(store()), Arc::new(policy), SearchConfig::default());
        let snapshot = snapshot();

        let request = SearchRequest {
            kind: Some("Invoice".to_string()),
            ..SearchRequest::new("7500")
        };
        assert!(matches!(
            engine.search(&snapshot, &Caller::new("guest"), &request).await,
            Err(AtlasError::PermissionDenied { .. })
        ));
        let outcome = engine.search(&snapshot, &Caller::system(), &request).await.unwrap();
        assert_eq!(outcome.searched_kinds, vec!["Invoice"]);

        let unknown = SearchRequest {
            kind: Some("Invoce".to_string()),
            ..SearchRequest::new("7500")
        };
        assert!(matches!(
            engine.search(&snapshot, &Caller::system(), &unknown).await,
            Err(AtlasError::NotFound { .. })
        ));
    }
}
