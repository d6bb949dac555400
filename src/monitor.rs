//! Error pattern monitor
//!
//! Pulls a window of raw error records from the error feed, reduces each
//! message to a signature with its variable parts masked, and compares each
//! signature's count against the preceding window of the same length.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::error::{AtlasError, Result};
use crate::store::{ErrorFeed, ErrorRecord};

/// Masks the variable parts of an error line
pub struct SignatureNormalizer {
    rules: Vec<(Regex, &'static str)>,
    max_len: usize,
}

impl Default for SignatureNormalizer {
    fn default() -> Self {
        Self::new(200)
    }
}

impl SignatureNormalizer {
    pub fn new(max_len: usize) -> Self {
        Self {
            rules: vec![
                (
                    Regex::new(r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b").unwrap(),
                    "<uuid>",
                ),
                (
                    Regex::new(r"\b\d{4}-\d{2}-\d{2}(?:[T ]\d{2}:\d{2}(?::\d{2}(?:\.\d+)?)?(?:Z|[+-]\d{2}:?\d{2})?)?").unwrap(),
                    "<ts>",
                ),
                (Regex::new(r"\b0x[0-9a-fA-F]+\b").unwrap(), "<hex>"),
                (Regex::new(r"\b[0-9a-f]{10,}\b").unwrap(), "<hex>"),
                (Regex::new(r"'[^']*'").unwrap(), "'<str>'"),
                (Regex::new(r#""[^"]*""#).unwrap(), "\"<str>\""),
                (Regex::new(r"\b\d+(?:\.\d+)?\b").unwrap(), "<n>"),
            ],
            max_len,
        }
    }

    /// Last non-empty line, truncated, with ids, timestamps, literals and numbers masked
    pub fn signature(&self, message: &str) -> String {
        let line = message
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("Unknown");
        let truncated: String = line.chars().take(self.max_len).collect();
        self.rules
            .iter()
            .fold(truncated, |acc, (pattern, placeholder)| {
                pattern.replace_all(&acc, *placeholder).into_owned()
            })
    }
}

/// Fix hint for a signature, first keyword rule that matches
pub fn suggest_fix(signature: &str) -> &'static str {
    const RULES: &[(&[&str], &str)] = &[
        (&["does not exist", "not found"], "A referenced record or kind does not exist. Check whether it was deleted or renamed."),
        (&["permission", "not permitted"], "Permission issue. Check the access rules for the kind involved."),
        (&["mandatory", "required"], "A required field is missing. Check the form or script that creates the record."),
        (&["duplicate", "unique"], "Duplicate entry. A record with this value already exists; check naming rules and unique fields."),
        (&["syntaxerror"], "Syntax error in a script. Check attached scripts for typos."),
        (&["importerror", "modulenotfounderror"], "Missing module or import. A required package may not be installed."),
        (&["typeerror"], "Type mismatch. Check call arguments against the field types."),
        (&["attributeerror"], "Access to a missing attribute. Check that the field or method exists on the kind."),
        (&["timeout", "timed out"], "Operation timed out. Look for a slow query, external call or heavy computation."),
        (&["linkvalidation"], "Link validation failed. The linked record does not exist or is not readable."),
        (&["valueerror"], "Invalid value. Check date and number formats and choice options."),
    ];

    let lower = signature.to_lowercase();
    RULES
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(_, hint)| *hint)
        .unwrap_or("Review the full traceback in the error log for details.")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorGroup {
    pub signature: String,
    pub count: usize,
    pub prior_count: usize,
    /// `count / max(prior_count, 1)`
    pub ratio: f64,
    pub trending: bool,
    pub severity: Severity,
    /// Up to five distinct methods that raised it
    pub methods: Vec<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub suggestion: String,
}

/// Recent error line as reported back to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub signature: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorReport {
    pub window_hours: u32,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    /// Records in the current window after filtering
    pub total: usize,
    pub groups: Vec<ErrorGroup>,
    /// Newest first, at most ten
    pub recent: Vec<ErrorSummary>,
    /// False when the prior window could not be fetched; no group is trending then
    pub prior_available: bool,
    /// False when the deadline passed before the current window arrived
    pub complete: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MonitorRequest {
    pub window_hours: Option<u32>,
    /// Max groups returned
    pub limit: Option<usize>,
    /// Substring of the raising method, case-insensitive
    pub kind_filter: Option<String>,
    pub deadline: Option<Duration>,
}

pub struct ErrorPatternMonitor {
    feed: Arc<dyn ErrorFeed>,
    normalizer: SignatureNormalizer,
    config: MonitorConfig,
}

impl ErrorPatternMonitor {
    pub fn new(feed: Arc<dyn ErrorFeed>, config: MonitorConfig) -> Self {
        Self {
            feed,
            normalizer: SignatureNormalizer::new(config.signature_max_len),
            config,
        }
    }

    pub async fn monitor(&self, request: &MonitorRequest) -> Result<MonitorReport> {
        self.monitor_at(Utc::now(), request).await
    }

    /// Same as [`monitor`](Self::monitor) with the window ending at `now`
    pub async fn monitor_at(&self, now: DateTime<Utc>, request: &MonitorRequest) -> Result<MonitorReport> {
        let window_hours = request.window_hours.unwrap_or(self.config.window_hours).max(1);
        let (since, prior_since) = ChronoDuration::try_hours(i64::from(window_hours))
            .and_then(|window| {
                let since = now.checked_sub_signed(window)?;
                Some((since, since.checked_sub_signed(window)?))
            })
            .ok_or_else(|| {
                AtlasError::ValidationFailure(format!("window of {} hours is out of range", window_hours))
            })?;
        let deadline = request.deadline.map(|d| Instant::now() + d);
        let cap = self.config.fetch_cap;

        let (current, prior) = tokio::join!(
            bounded(deadline, self.feed.fetch(since, now, cap)),
            bounded(deadline, self.feed.fetch(prior_since, since, cap)),
        );

        let mut report = MonitorReport {
            window_hours,
            since,
            until: now,
            total: 0,
            groups: Vec::new(),
            recent: Vec::new(),
            prior_available: false,
            complete: true,
        };

        let current = match current {
            Some(result) => result.map_err(AtlasError::collaborator)?,
            None => {
                warn!(window_hours, "Deadline passed before the error window arrived");
                report.complete = false;
                return Ok(report);
            }
        };
        let prior = match prior {
            Some(Ok(records)) => Some(records),
            Some(Err(err)) => {
                warn!(error = %err, "Prior error window unavailable, trends disabled");
                None
            }
            None => {
                warn!("Deadline passed before the prior error window arrived, trends disabled");
                None
            }
        };

        let filter = request.kind_filter.as_deref().map(str::to_lowercase);
        let keep = |r: &ErrorRecord| match &filter {
            Some(f) => r
                .method
                .as_deref()
                .map_or(false, |m| m.to_lowercase().contains(f)),
            None => true,
        };
        let current: Vec<ErrorRecord> = current.into_iter().filter(|r| keep(r)).collect();
        let prior_counts: Option<BTreeMap<String, usize>> = prior.map(|records| {
            let mut counts = BTreeMap::new();
            for r in records.iter().filter(|r| keep(*r)) {
                *counts.entry(self.normalizer.signature(&r.message)).or_insert(0) += 1;
            }
            counts
        });

        report.total = current.len();
        report.prior_available = prior_counts.is_some();
        report.recent = current
            .iter()
            .take(10)
            .map(|r| ErrorSummary {
                id: r.id.clone(),
                method: r.method.clone(),
                signature: self.normalizer.signature(&r.message),
                timestamp: r.timestamp,
            })
            .collect();

        let mut groups = self.group(&current, prior_counts.as_ref());
        groups.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.signature.cmp(&b.signature)));
        if let Some(limit) = request.limit {
            groups.truncate(limit);
        }
        for g in groups.iter().filter(|g| g.trending) {
            info!(signature = %g.signature, count = g.count, prior = g.prior_count, "Trending error pattern");
        }
        debug!(total = report.total, groups = groups.len(), "Error window aggregated");
        report.groups = groups;
        Ok(report)
    }

    fn group(&self, records: &[ErrorRecord], prior: Option<&BTreeMap<String, usize>>) -> Vec<ErrorGroup> {
        struct Acc {
            count: usize,
            methods: BTreeSet<String>,
            first_seen: DateTime<Utc>,
            last_seen: DateTime<Utc>,
        }

        let mut accs: BTreeMap<String, Acc> = BTreeMap::new();
        for r in records {
            let acc = accs
                .entry(self.normalizer.signature(&r.message))
                .or_insert_with(|| Acc {
                    count: 0,
                    methods: BTreeSet::new(),
                    first_seen: r.timestamp,
                    last_seen: r.timestamp,
                });
            acc.count += 1;
            acc.first_seen = acc.first_seen.min(r.timestamp);
            acc.last_seen = acc.last_seen.max(r.timestamp);
            if let Some(method) = r.method.as_deref().filter(|m| !m.is_empty()) {
                acc.methods.insert(method.to_string());
            }
        }

        accs.into_iter()
            .map(|(signature, acc)| {
                let prior_count = prior.and_then(|p| p.get(&signature).copied()).unwrap_or(0);
                let ratio = acc.count as f64 / prior_count.max(1) as f64;
                ErrorGroup {
                    suggestion: suggest_fix(&signature).to_string(),
                    signature,
                    count: acc.count,
                    prior_count,
                    ratio,
                    trending: prior.is_some() && ratio > self.config.trend_threshold,
                    severity: if acc.count >= self.config.high_severity_count {
                        Severity::High
                    } else {
                        Severity::Low
                    },
                    methods: acc.methods.into_iter().take(5).collect(),
                    first_seen: acc.first_seen,
                    last_seen: acc.last_seen,
                }
            })
            .collect()
    }
}

async fn bounded<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, fut).await.ok(),
        None => Some(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryErrorFeed;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn error(id: &str, minutes_ago: i64, method: &str, message: &str) -> ErrorRecord {
        ErrorRecord {
            id: id.to_string(),
            timestamp: now() - ChronoDuration::minutes(minutes_ago),
            method: Some(method.to_string()),
            message: message.to_string(),
        }
    }

    fn monitor(records: Vec<ErrorRecord>) -> ErrorPatternMonitor {
        ErrorPatternMonitor::new(Arc::new(MemoryErrorFeed::new(records)), MonitorConfig::default())
    }

    #[test]
    fn test_signature_masks_variable_parts() {
        let n = SignatureNormalizer::default();
        let trace = "Traceback (most recent call last):\n  File \"x.py\", line 3\nDoesNotExistError: Customer CUST-00042 not found\n\n";
        assert_eq!(n.signature(trace), "DoesNotExistError: Customer CUST-<n> not found");
        assert_eq!(
            n.signature("Lock 3f2b8c1e-9a4d-4e2f-8b7a-1c2d3e4f5a6b held since 2024-03-01T11:59:02Z"),
            "Lock <uuid> held since <ts>"
        );
        assert_eq!(n.signature("Value 'abc' at 0x7ffe12 is 12.5"), "Value '<str>' at <hex> is <n>");
        assert_eq!(n.signature(""), "Unknown");
        assert_eq!(SignatureNormalizer::new(5).signature("abcdefgh"), "abcde");
    }

    #[test]
    fn test_suggest_fix_keywords() {
        assert!(suggest_fix("LinkValidationError: Could not find Customer").contains("Link validation"));
        assert!(suggest_fix("MandatoryError: customer").contains("required field"));
        assert!(suggest_fix("something odd").contains("Review"));
    }

    #[tokio::test]
    async fn test_groups_and_trends() {
        let m = monitor(vec![
            error("e1", 5, "order.submit", "ValidationError: Order SO-1 total 10"),
            error("e2", 10, "order.submit", "ValidationError: Order SO-2 total 20"),
            error("e3", 20, "order.cancel", "ValidationError: Order SO-3 total 30"),
            error("e4", 30, "customer.save", "TimeoutError: query timed out after 30s"),
            // prior window
            error("p1", 70, "order.submit", "ValidationError: Order SO-9 total 90"),
            error("p2", 80, "customer.save", "TimeoutError: query timed out after 30s"),
        ]);

        let report = m.monitor_at(now(), &MonitorRequest::default()).await.unwrap();
        assert!(report.complete);
        assert!(report.prior_available);
        assert_eq!(report.total, 4);
        assert_eq!(report.recent[0].id, "e1");

        let validation = &report.groups[0];
        assert_eq!(validation.signature, "ValidationError: Order SO-<n> total <n>");
        assert_eq!(validation.count, 3);
        assert_eq!(validation.prior_count, 1);
        assert!(validation.trending);
        assert_eq!(validation.severity, Severity::High);
        assert_eq!(validation.methods, vec!["order.cancel", "order.submit"]);
        assert_eq!(validation.first_seen, now() - ChronoDuration::minutes(20));

        let timeout = &report.groups[1];
        assert_eq!(timeout.ratio, 1.0);
        assert!(!timeout.trending);
        assert_eq!(timeout.severity, Severity::Low);
    }

    #[tokio::test]
    async fn test_prior_floor_and_filter() {
        let m = monitor(vec![
            error("e1", 5, "invoice.submit", "KeyError: 'total'"),
            error("e2", 6, "invoice.submit", "KeyError: 'total'"),
            error("e3", 7, "invoice.submit", "KeyError: 'total'"),
            error("e4", 8, "order.submit", "KeyError: 'total'"),
        ]);
        let request = MonitorRequest {
            kind_filter: Some("INVOICE".to_string()),
            limit: Some(1),
            ..Default::default()
        };
        let report = m.monitor_at(now(), &request).await.unwrap();

        assert_eq!(report.total, 3);
        assert_eq!(report.groups.len(), 1);
        assert_eq!(report.groups[0].prior_count, 0);
        assert_eq!(report.groups[0].ratio, 3.0);
        assert!(report.groups[0].trending);
    }

    #[tokio::test]
    async fn test_oversized_window_is_rejected() {
        let m = monitor(vec![error("e1", 5, "x", "A")]);
        for window_hours in [u32::MAX, 1_500_000_000] {
            let request = MonitorRequest {
                window_hours: Some(window_hours),
                ..Default::default()
            };
            assert!(matches!(
                m.monitor_at(now(), &request).await,
                Err(AtlasError::ValidationFailure(_))
            ));
        }

        // a year still fits, prior window included
        let request = MonitorRequest {
            window_hours: Some(24 * 365),
            ..Default::default()
        };
        let report = m.monitor_at(now(), &request).await.unwrap();
        assert_eq!(report.total, 1);
    }

    #[tokio::test]
    async fn test_prior_window_unavailable() {
        let feed = MemoryErrorFeed::new(vec![
            error("e1", 5, "x", "A"),
            error("e2", 6, "x", "A"),
            error("e3", 7, "x", "A"),
        ])
        .available_from(now() - ChronoDuration::minutes(90));
        let m = ErrorPatternMonitor::new(Arc::new(feed), MonitorConfig::default());

        let report = m.monitor_at(now(), &MonitorRequest::default()).await.unwrap();
        assert!(!report.prior_available);
        assert_eq!(report.groups[0].count, 3);
        assert!(!report.groups[0].trending);
    }
}
