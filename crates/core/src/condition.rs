//! Condition model: named tri-state readiness signals with reason/message.
//!
//! Every layer reports through [`Conditions`] and combines lower-level
//! signals with [`Conditions::aggregate`]. Transition timestamps only move
//! when a condition's status flips, so rewriting an unchanged condition is
//! a no-op and status objects can be compared for equality to skip writes.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Aggregate condition type every resource exposes.
pub const READY: &str = "Ready";

/// Status of a condition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A single named condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., Ready, InstallerSetReady)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition stamped with the current time.
    ///
    /// Timestamps are truncated to whole seconds, matching what an API
    /// server persists, so a round trip through the store compares equal.
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now().trunc_subsecs(0),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }

    fn same_signal(&self, other: &Condition) -> bool {
        self.status == other.status && self.reason == other.reason && self.message == other.message
    }
}

/// Read surface consumed by upward aggregation.
pub trait ConditionSurface {
    fn conditions(&self) -> &[Condition];

    /// True iff the `Ready` condition is present and True.
    fn ready(&self) -> bool {
        self.conditions()
            .iter()
            .any(|c| c.type_ == READY && c.is_true())
    }
}

/// Ordered set of conditions, unique by type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conditions(SmallVec<[Condition; 4]>);

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, type_: &str) -> Option<&Condition> {
        self.0.iter().find(|c| c.type_ == type_)
    }

    pub fn is_true(&self, type_: &str) -> bool {
        self.get(type_).map(Condition::is_true).unwrap_or(false)
    }

    pub fn status_of(&self, type_: &str) -> ConditionStatus {
        self.get(type_).map(|c| c.status).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Insert or replace a condition by type. Returns whether anything changed.
    ///
    /// The previous transition time is kept when the status does not flip.
    pub fn set(&mut self, cond: Condition) -> bool {
        match self.0.iter_mut().find(|c| c.type_ == cond.type_) {
            Some(existing) => {
                if existing.same_signal(&cond) {
                    return false;
                }
                let last_transition_time = if existing.status == cond.status {
                    existing.last_transition_time
                } else {
                    cond.last_transition_time
                };
                *existing = Condition {
                    last_transition_time,
                    ..cond
                };
                true
            }
            None => {
                self.0.push(cond);
                true
            }
        }
    }

    pub fn mark_true(
        &mut self,
        type_: &str,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> bool {
        self.set(Condition::new(type_, ConditionStatus::True, reason, message))
    }

    pub fn mark_false(
        &mut self,
        type_: &str,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> bool {
        self.set(Condition::new(type_, ConditionStatus::False, reason, message))
    }

    pub fn mark_unknown(
        &mut self,
        type_: &str,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> bool {
        self.set(Condition::new(type_, ConditionStatus::Unknown, reason, message))
    }

    pub fn remove(&mut self, type_: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|c| c.type_ != type_);
        before != self.0.len()
    }

    /// Recompute `ready_type` from `dependents`.
    ///
    /// False if any dependent is False (its reason and message are carried
    /// up), Unknown if any dependent is Unknown or missing, True otherwise.
    pub fn aggregate(&mut self, ready_type: &str, dependents: &[&str]) -> bool {
        let mut status = ConditionStatus::True;
        let mut reason = "AllConditionsReady".to_string();
        let mut message = "all conditions are ready".to_string();
        for dep in dependents {
            match self.get(dep) {
                Some(c) if c.status == ConditionStatus::False => {
                    status = ConditionStatus::False;
                    reason = c.reason.clone();
                    message = c.message.clone();
                    break;
                }
                Some(c) if c.status == ConditionStatus::Unknown => {
                    if status == ConditionStatus::True {
                        status = ConditionStatus::Unknown;
                        reason = c.reason.clone();
                        message = c.message.clone();
                    }
                }
                None => {
                    if status == ConditionStatus::True {
                        status = ConditionStatus::Unknown;
                        reason = "Pending".to_string();
                        message = format!("{dep} not yet reported");
                    }
                }
                Some(_) => {}
            }
        }
        self.set(Condition::new(ready_type, status, reason, message))
    }
}

impl ConditionSurface for Conditions {
    fn conditions(&self) -> &[Condition] {
        &self.0
    }
}
