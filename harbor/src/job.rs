use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::time::Duration;

/// Row id of a job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl JobId {
    /// Raw row id.
    pub fn get(self) -> i64 {
        self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// A job about to be created.
///
/// `invocation_data` and `arguments` are opaque to the storage; the host runtime
/// owns their encoding.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewJob {
    /// Serialized method to invoke.
    pub invocation_data: serde_json::Value,
    /// Serialized call arguments.
    pub arguments: serde_json::Value,
    /// Job parameters written alongside the job.
    pub parameters: HashMap<String, Option<String>>,
    /// Creation time; the expiry counts from here.
    pub created_at: DateTime<Utc>,
    /// How long the job lives unless it is persisted.
    pub expire_in: Duration,
}

impl NewJob {
    /// A job created now that expires after 24 hours.
    pub fn new(invocation_data: serde_json::Value, arguments: serde_json::Value) -> Self {
        Self {
            invocation_data,
            arguments,
            parameters: HashMap::new(),
            created_at: Utc::now(),
            expire_in: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Add or replace a parameter.
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), Some(value.into()));
        self
    }

    /// Override the expiry.
    pub fn with_expire_in(mut self, expire_in: Duration) -> Self {
        self.expire_in = expire_in;
        self
    }

    /// Override the creation time.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// A stored job as read back from the `job` table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobData {
    /// Serialized method to invoke.
    pub invocation_data: serde_json::Value,
    /// Serialized call arguments.
    pub arguments: serde_json::Value,
    /// Name of the current state, if one was set.
    pub state_name: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry, or `None` once persisted.
    pub expire_at: Option<DateTime<Utc>>,
}

/// A state transition, as written to and read back from the state history.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateData {
    /// State name, e.g. `Succeeded`.
    pub name: String,
    /// Why the job moved to this state.
    pub reason: Option<String>,
    /// State-specific key/value data.
    pub data: HashMap<String, String>,
}

impl StateData {
    /// A state with no reason or data.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Add one data entry.
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_serializes_as_number() {
        assert_eq!(serde_json::to_string(&JobId(42)).unwrap(), "42");
        assert_eq!(JobId::from(7).to_string(), "7");
    }

    #[test]
    fn state_builder() {
        let state = StateData::new("Succeeded")
            .with_reason("done")
            .with_data("Latency", "12");
        assert_eq!(state.name, "Succeeded");
        assert_eq!(state.reason.as_deref(), Some("done"));
        assert_eq!(state.data["Latency"], "12");
    }
}
