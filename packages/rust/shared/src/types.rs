//! Core domain value types for batchscout research jobs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// JobId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for job identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new time-sortable job identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// JobInput
// ---------------------------------------------------------------------------

/// One item to research. Opaque to the engine; only collaborators look inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInput {
    /// Display name (e.g. a company name).
    pub name: String,
    /// Target reference handed to discovery (e.g. a homepage URL).
    pub target: String,
}

impl JobInput {
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Overall status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Completed, failed and cancelled jobs never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    Discovery,
    Selection,
    Extraction,
    Aggregation,
}

impl PhaseName {
    /// Every phase in pipeline order.
    pub const ALL: [PhaseName; 4] = [
        PhaseName::Discovery,
        PhaseName::Selection,
        PhaseName::Extraction,
        PhaseName::Aggregation,
    ];

    /// Zero-based position in [`PhaseName::ALL`].
    pub fn index(&self) -> usize {
        match self {
            Self::Discovery => 0,
            Self::Selection => 1,
            Self::Extraction => 2,
            Self::Aggregation => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovery => "Discovery",
            Self::Selection => "Selection",
            Self::Extraction => "Extraction",
            Self::Aggregation => "Aggregation",
        }
    }
}

impl std::fmt::Display for PhaseName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl PhaseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

// ---------------------------------------------------------------------------
// Details
// ---------------------------------------------------------------------------

/// A primitive value in a collaborator-supplied detail payload.
///
/// Variant order matters for untagged deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DetailValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

/// Free-form key/value observability payload attached to a phase.
pub type Details = BTreeMap<String, DetailValue>;

impl From<bool> for DetailValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for DetailValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for DetailValue {
    fn from(v: i32) -> Self {
        Self::Integer(v.into())
    }
}

impl From<u16> for DetailValue {
    fn from(v: u16) -> Self {
        Self::Integer(v.into())
    }
}

impl From<usize> for DetailValue {
    fn from(v: usize) -> Self {
        Self::Integer(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<u64> for DetailValue {
    fn from(v: u64) -> Self {
        Self::Integer(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for DetailValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for DetailValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for DetailValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl std::fmt::Display for DetailValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

// ---------------------------------------------------------------------------
// Usage
// ---------------------------------------------------------------------------

/// Resource/cost counters supplied by a collaborator, passed through untouched
/// and summed across jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Usage(pub BTreeMap<String, u64>);

impl Usage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `amount` to the counter `key`.
    pub fn add(&mut self, key: impl Into<String>, amount: u64) {
        let slot = self.0.entry(key.into()).or_insert(0);
        *slot = slot.saturating_add(amount);
    }

    /// Sum every counter of `other` into `self`.
    pub fn merge(&mut self, other: &Usage) {
        for (key, amount) in &other.0 {
            self.add(key.clone(), *amount);
        }
    }

    pub fn get(&self, key: &str) -> u64 {
        self.0.get(key).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(key, amount)| (key.as_str(), *amount))
    }
}

// ---------------------------------------------------------------------------
// JobError
// ---------------------------------------------------------------------------

/// The error recorded on a failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    /// Phase that failed, or `None` when the failure happened outside a phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<PhaseName>,
    pub message: String,
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.phase {
            Some(phase) => write!(f, "{phase}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_roundtrip() {
        let id = JobId::new();
        let s = id.to_string();
        let parsed: JobId = s.parse().expect("parse JobId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn job_ids_are_time_sortable() {
        let first = JobId::new();
        let second = JobId::new();
        assert!(first < second);
    }

    #[test]
    fn phase_order_matches_index() {
        for (i, phase) in PhaseName::ALL.iter().enumerate() {
            assert_eq!(phase.index(), i);
        }
        assert_eq!(PhaseName::Extraction.to_string(), "Extraction");
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(PhaseStatus::Failed.is_terminal());
        assert!(!PhaseStatus::Pending.is_terminal());
    }

    #[test]
    fn details_serialize_as_plain_json() {
        let mut details = Details::new();
        details.insert("url".into(), "https://example.com".into());
        details.insert("links_found".into(), 12usize.into());
        details.insert("ok".into(), true.into());

        let json = serde_json::to_value(&details).expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({"links_found": 12, "ok": true, "url": "https://example.com"})
        );

        let parsed: Details = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed.get("links_found"), Some(&DetailValue::Integer(12)));
        assert_eq!(parsed.get("ok"), Some(&DetailValue::Bool(true)));
    }

    #[test]
    fn usage_merge_sums_by_key() {
        let mut total = Usage::new();
        let mut a = Usage::new();
        a.add("pages_fetched", 3);
        a.add("bytes_fetched", 100);
        let mut b = Usage::new();
        b.add("pages_fetched", 2);

        total.merge(&a);
        total.merge(&b);
        assert_eq!(total.get("pages_fetched"), 5);
        assert_eq!(total.get("bytes_fetched"), 100);
        assert_eq!(total.get("tokens"), 0);
    }

    #[test]
    fn job_error_display() {
        let err = JobError {
            phase: Some(PhaseName::Extraction),
            message: "HTTP 500".into(),
        };
        assert_eq!(err.to_string(), "Extraction: HTTP 500");
    }
}
