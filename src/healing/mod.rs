//! Selector healing: propose replacement locators for a failed interaction.

pub mod analyzer;
pub mod dom;
pub mod locator;
pub mod score;
pub mod service;
pub mod store;

pub use self::analyzer::{analyze, Analysis, Candidate};
pub use self::locator::{Locator, LocatorMethod};
pub use self::service::{AnalyzeResult, HealingHealth, HealingService};
pub use self::store::HealingStore;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum HealingError {
    #[error("best candidate confidence {best:.2} is below the floor {floor:.2}")]
    LowConfidence { best: f64, floor: f64 },
    #[error("invalid healing request: {0}")]
    InvalidRequest(String),
    #[error("healing record {0} not found")]
    NotFound(String),
    #[error("healing record {id} is already {outcome}")]
    AlreadyDecided { id: String, outcome: HealingOutcome },
    #[error("healing record {id} was superseded by {by}")]
    Superseded { id: String, by: String },
    #[error("selector {selector} is not a candidate of record {id}")]
    NotACandidate { id: String, selector: String },
    #[error("healing queue is full")]
    QueueFull,
    #[error(transparent)]
    Storage(StorageError),
}

crate::impl_storage_error_from!(HealingError);

/// Where and how the interaction failed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailureContext {
    pub selector: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, alias = "testType")]
    pub test_type: Option<String>,
    #[serde(default, alias = "actionType")]
    pub action_type: Option<String>,
    /// Serialized DOM at the time of failure.
    #[serde(default)]
    pub dom: Option<String>,
    #[serde(default, alias = "domSnapshotRef")]
    pub dom_snapshot_ref: Option<String>,
}

/// A failed interaction as reported by a test run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub error: String,
    pub context: FailureContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealingOutcome {
    Pending,
    Accepted,
    Rejected,
}

impl HealingOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealingOutcome::Pending => "pending",
            HealingOutcome::Accepted => "accepted",
            HealingOutcome::Rejected => "rejected",
        }
    }
}

impl fmt::Display for HealingOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for HealingOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(HealingOutcome::Pending),
            "accepted" => Ok(HealingOutcome::Accepted),
            "rejected" => Ok(HealingOutcome::Rejected),
            other => Err(format!("unknown healing outcome '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordContext {
    pub url: Option<String>,
    pub action_type: Option<String>,
    pub dom_snapshot_ref: Option<String>,
}

/// One distinct failure and its ranked candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingRecord {
    pub id: String,
    pub fingerprint: String,
    pub original_selector: String,
    pub context: RecordContext,
    pub error_message: Option<String>,
    pub candidates: Vec<Candidate>,
    pub applied_selector: Option<String>,
    pub outcome: HealingOutcome,
    pub superseded_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl HealingRecord {
    pub fn top(&self) -> Option<&Candidate> {
        self.candidates.first()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HealingStats {
    pub total: u64,
    /// Records awaiting a decision.
    pub pending: u64,
    pub accepted: u64,
    pub rejected: u64,
    /// accepted / (accepted + rejected); 0 when nothing has been decided.
    pub success_rate: f64,
    pub average_top_confidence: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordFilter {
    pub outcome: Option<HealingOutcome>,
    pub limit: Option<usize>,
}
