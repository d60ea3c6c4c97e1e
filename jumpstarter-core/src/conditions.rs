//! Status conditions with idempotent set-by-type semantics.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single observed condition on a resource's status.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    /// `"True"`, `"False"` or `"Unknown"`.
    pub status: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(type_: &str, status: bool, reason: &str, now: DateTime<Utc>) -> Self {
        Self {
            type_: type_.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            reason: reason.to_string(),
            message: String::new(),
            last_transition_time: now,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Upsert `condition` into `conditions`, keyed by type.
///
/// `lastTransitionTime` only advances when the status actually flips, so a
/// level-triggered reconciler can re-set the same condition every pass
/// without churning the object.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status
                && existing.reason == condition.reason
                && existing.message == condition.message
            {
                return false;
            }
            if existing.status == condition.status {
                // Same level, new reason: keep the original transition time.
                existing.reason = condition.reason;
                existing.message = condition.message;
            } else {
                *existing = condition;
            }
            true
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

/// Look up a condition by type.
pub fn get_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Whether a condition of the given type is present and `"True"`.
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    get_condition(conditions, type_).is_some_and(Condition::is_true)
}

/// Condition types used on [`crate::Lease`] status.
pub mod lease {
    pub const PENDING: &str = "Pending";
    pub const UNSATISFIABLE: &str = "Unsatisfiable";
    pub const READY: &str = "Ready";
    pub const ENDED: &str = "Ended";
}

/// Condition types used on [`crate::Exporter`] status.
pub mod exporter {
    pub const REGISTERED: &str = "Registered";
    pub const ONLINE: &str = "Online";
}
