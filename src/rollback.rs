//! Customization rollback
//!
//! Applies disable/enable/delete transitions to customizations. Every
//! transition reads the customization together with its kind's version,
//! decides, and commits only if no other writer got in between; a stale
//! commit is retried against fresh state. Blocked deletes come back as
//! results naming their blockers, and every committed change is appended
//! to the audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RollbackConfig;
use crate::customization::{
    Customization, CustomizationKind, CustomizationRegistry, CustomizationStatus, Overlay,
};
use crate::error::{AtlasError, Result};
use crate::graph::GraphCache;
use crate::store::{AccessPolicy, Action, Caller, ChangeEvent, ChangeNotifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackAction {
    List,
    Disable,
    Enable,
    Delete,
}

impl fmt::Display for RollbackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RollbackAction::List => "list",
            RollbackAction::Disable => "disable",
            RollbackAction::Enable => "enable",
            RollbackAction::Delete => "delete",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for RollbackAction {
    type Err = AtlasError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "list" => Ok(RollbackAction::List),
            "disable" => Ok(RollbackAction::Disable),
            "enable" => Ok(RollbackAction::Enable),
            "delete" => Ok(RollbackAction::Delete),
            other => Err(AtlasError::ValidationFailure(format!(
                "unknown rollback action '{}' (expected list, disable, enable or delete)",
                other
            ))),
        }
    }
}

/// One committed transition, with full before/after state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub caller: String,
    pub action: RollbackAction,
    pub before: Customization,
    pub after: Customization,
}

impl AuditEntry {
    /// Unified diff from `before` to `after`
    pub fn diff(&self) -> String {
        let before = serde_json::to_string_pretty(&self.before).unwrap_or_default();
        let after = serde_json::to_string_pretty(&self.after).unwrap_or_default();
        TextDiff::from_lines(&before, &after)
            .unified_diff()
            .header("before", "after")
            .to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    Applied,
    /// Already in the requested state
    NoOp,
    /// Delete refused because something still depends on the customization
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackResult {
    pub id: String,
    pub action: RollbackAction,
    pub status: RollbackStatus,
    /// State after the call
    pub state: Customization,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_id: Option<Uuid>,
    /// Customizations that reference this one
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blocking_dependents: Vec<String>,
    /// Schema fields (`Kind.field`) deriving their value from this one
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub structural_blockers: Vec<String>,
}

impl RollbackResult {
    fn unchanged(id: &str, action: RollbackAction, status: RollbackStatus, state: Customization) -> Self {
        Self {
            id: id.to_string(),
            action,
            status,
            state,
            audit_id: None,
            blocking_dependents: Vec::new(),
            structural_blockers: Vec::new(),
        }
    }
}

enum Decision {
    Commit(CustomizationStatus),
    NoOp,
    Blocked {
        dependents: Vec<String>,
        structural: Vec<String>,
    },
}

/// Executes dependency-safe customization transitions
pub struct RollbackCoordinator {
    customizations: Arc<CustomizationRegistry>,
    graphs: Arc<GraphCache>,
    policy: Arc<dyn AccessPolicy>,
    notifier: Arc<dyn ChangeNotifier>,
    audit: Mutex<Vec<AuditEntry>>,
    config: RollbackConfig,
}

impl RollbackCoordinator {
    pub fn new(
        customizations: Arc<CustomizationRegistry>,
        graphs: Arc<GraphCache>,
        policy: Arc<dyn AccessPolicy>,
        notifier: Arc<dyn ChangeNotifier>,
        config: RollbackConfig,
    ) -> Self {
        Self {
            customizations,
            graphs,
            policy,
            notifier,
            audit: Mutex::new(Vec::new()),
            config,
        }
    }

    /// Customizations filtered by type and target kind
    pub fn list(&self, kind: Option<CustomizationKind>, target_kind: Option<&str>) -> Vec<Customization> {
        self.customizations.list(kind, target_kind)
    }

    /// Audit entries for one customization, oldest first
    pub fn history(&self, id: &str) -> Vec<AuditEntry> {
        self.audit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.before.id == id)
            .cloned()
            .collect()
    }

    pub fn audit_entry(&self, audit_id: Uuid) -> Option<AuditEntry> {
        self.audit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|e| e.id == audit_id)
            .cloned()
    }

    pub async fn disable(&self, caller: &Caller, id: &str) -> Result<RollbackResult> {
        self.transition(caller, RollbackAction::Disable, id).await
    }

    pub async fn enable(&self, caller: &Caller, id: &str) -> Result<RollbackResult> {
        self.transition(caller, RollbackAction::Enable, id).await
    }

    pub async fn delete(&self, caller: &Caller, id: &str) -> Result<RollbackResult> {
        self.transition(caller, RollbackAction::Delete, id).await
    }

    /// Run a mutating action; `List` is rejected here
    pub async fn transition(
        &self,
        caller: &Caller,
        action: RollbackAction,
        id: &str,
    ) -> Result<RollbackResult> {
        let required = match action {
            RollbackAction::Disable | RollbackAction::Enable => Action::Write,
            RollbackAction::Delete => Action::Delete,
            RollbackAction::List => {
                return Err(AtlasError::ValidationFailure(
                    "list is not a state transition".to_string(),
                ))
            }
        };

        let target_kind = self.customizations.get(id)?.target_kind;
        if !self.policy.can_access(caller, &target_kind, required) {
            return Err(AtlasError::PermissionDenied {
                caller: caller.user.clone(),
                kind: target_kind,
                action: required.to_string(),
            });
        }

        let mut attempt = 0;
        loop {
            let (current, version) = self.customizations.read_versioned(id)?;
            let target = match self.decide(action, &current)? {
                Decision::NoOp => {
                    debug!(id, %action, status = %current.status, "Rollback is a no-op");
                    return Ok(RollbackResult::unchanged(id, action, RollbackStatus::NoOp, current));
                }
                Decision::Blocked {
                    dependents,
                    structural,
                } => return Ok(self.blocked(id, action, current, dependents, structural)),
                Decision::Commit(target) => target,
            };

            match self.customizations.commit(id, version, target) {
                Ok(transition) => {
                    let entry = AuditEntry {
                        id: Uuid::new_v4(),
                        timestamp: Utc::now(),
                        caller: caller.user.clone(),
                        action,
                        before: transition.before,
                        after: transition.after,
                    };
                    self.record(&entry).await;
                    return Ok(RollbackResult {
                        id: id.to_string(),
                        action,
                        status: RollbackStatus::Applied,
                        state: entry.after,
                        audit_id: Some(entry.id),
                        blocking_dependents: Vec::new(),
                        structural_blockers: Vec::new(),
                    });
                }
                Err(AtlasError::StaleVersion { .. }) if attempt < self.config.max_retries => {
                    attempt += 1;
                    debug!(id, attempt, "Lost optimistic version check, retrying");
                }
                Err(AtlasError::DependencyConflict { blockers, .. }) => {
                    // A dependent appeared between the read and the commit
                    let current = self.customizations.get(id)?;
                    return Ok(self.blocked(id, action, current, blockers, Vec::new()));
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn decide(&self, action: RollbackAction, current: &Customization) -> Result<Decision> {
        use CustomizationStatus::*;

        let invalid = || AtlasError::InvalidTransition {
            id: current.id.clone(),
            from: current.status.to_string(),
            action: action.to_string(),
        };
        let decision = match (action, current.status) {
            (RollbackAction::Disable, Active) => Decision::Commit(Disabled),
            (RollbackAction::Disable, Disabled) => Decision::NoOp,
            (RollbackAction::Enable, Disabled) => Decision::Commit(Active),
            (RollbackAction::Enable, Active) => Decision::NoOp,
            (RollbackAction::Disable | RollbackAction::Enable, Deleted) => return Err(invalid()),
            (RollbackAction::Delete, Deleted) => Decision::NoOp,
            (RollbackAction::Delete, _) => {
                let dependents: Vec<String> = current.dependents.iter().cloned().collect();
                let structural = self.structural_blockers(current);
                if dependents.is_empty() && structural.is_empty() {
                    Decision::Commit(Deleted)
                } else {
                    Decision::Blocked {
                        dependents,
                        structural,
                    }
                }
            }
            (RollbackAction::List, _) => return Err(invalid()),
        };
        Ok(decision)
    }

    fn structural_blockers(&self, current: &Customization) -> Vec<String> {
        match &current.overlay {
            Overlay::AddedField { field } => self
                .graphs
                .current()
                .derivations_landing_on(&current.target_kind, &field.name),
            _ => Vec::new(),
        }
    }

    fn blocked(
        &self,
        id: &str,
        action: RollbackAction,
        state: Customization,
        dependents: Vec<String>,
        structural: Vec<String>,
    ) -> RollbackResult {
        let conflict = AtlasError::DependencyConflict {
            id: id.to_string(),
            blockers: dependents.iter().chain(&structural).cloned().collect(),
        };
        info!(id, "{}", conflict);
        RollbackResult {
            id: id.to_string(),
            action,
            status: RollbackStatus::Blocked,
            state,
            audit_id: None,
            blocking_dependents: dependents,
            structural_blockers: structural,
        }
    }

    async fn record(&self, entry: &AuditEntry) {
        self.audit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry.clone());
        info!(
            audit_id = %entry.id,
            id = %entry.after.id,
            action = %entry.action,
            from = %entry.before.status,
            to = %entry.after.status,
            caller = %entry.caller,
            "Rollback transition committed"
        );

        let event = ChangeEvent {
            audit_id: entry.id,
            customization_id: entry.after.id.clone(),
            target_kind: entry.after.target_kind.clone(),
            action: entry.action.to_string(),
            from: entry.before.status.to_string(),
            to: entry.after.status.to_string(),
            caller: entry.caller.clone(),
        };
        if let Err(err) = self.notifier.notify(&event).await {
            warn!(audit_id = %entry.id, error = %err, "Change notification failed");
        }
    }
}
