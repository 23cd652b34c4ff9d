use crate::error::{AudienceError, AudienceResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user known to the membership store. Created implicitly on the first
/// membership write and never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

/// A named segment users can belong to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Segment {
    pub slug: String,
    pub created_at: DateTime<Utc>,
}

/// What happened to a membership, as written to the audit trail.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Add,
    Delete,
    /// Enrolled by the cohort sampler when the segment was created.
    AutoAdd,
    /// Removed because the segment itself was deleted.
    DeleteSegment,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Delete => "delete",
            Self::AutoAdd => "auto_add",
            Self::DeleteSegment => "delete_segment",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only audit entry. Only ordering by `created_at` is
/// guaranteed; identical entries may repeat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditRecord {
    pub user_id: String,
    pub segment_slug: String,
    pub kind: OperationKind,
    pub created_at: DateTime<Utc>,
}

/// A scheduled removal of one membership.
///
/// Pending while `done` is false, whether or not the deadline has
/// passed. Completed tasks are kept forever.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeferredTask {
    pub task_id: i64,
    pub user_id: String,
    pub segment_slug: String,
    pub deadline: DateTime<Utc>,
    pub done: bool,
}

/// A deferred removal to be persisted; the store assigns the id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewTask {
    pub user_id: String,
    pub segment_slug: String,
}

/// Share of the user base, with two implied decimals: 1 = 0.01%,
/// 10000 = 100.00%.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(try_from = "u32", into = "u32")]
pub struct BasisPoints(u32);

impl BasisPoints {
    pub const MIN: u32 = 1;
    pub const MAX: u32 = 10_000;

    pub fn get(self) -> u32 {
        self.0
    }

    /// Number of items selected out of `total`, rounded down.
    pub fn share_of(self, total: usize) -> usize {
        ((total as u128 * self.0 as u128) / Self::MAX as u128) as usize
    }
}

impl TryFrom<u32> for BasisPoints {
    type Error = AudienceError;

    fn try_from(value: u32) -> AudienceResult<Self> {
        if !(Self::MIN..=Self::MAX).contains(&value) {
            return Err(AudienceError::Validation(format!(
                "percentage must be between {} and {} basis points, got {value}",
                Self::MIN,
                Self::MAX
            )));
        }
        Ok(Self(value))
    }
}

impl From<BasisPoints> for u32 {
    fn from(value: BasisPoints) -> Self {
        value.0
    }
}

pub fn validate_user_id(user_id: &str, max_len: usize) -> AudienceResult<()> {
    if user_id.is_empty() {
        return Err(AudienceError::Validation("user_id must not be empty".into()));
    }
    if user_id.chars().count() > max_len {
        return Err(AudienceError::Validation(format!(
            "user_id exceeds {max_len} characters"
        )));
    }
    Ok(())
}

pub fn validate_slug(slug: &str, max_len: usize) -> AudienceResult<()> {
    if slug.is_empty() {
        return Err(AudienceError::Validation("segment slug must not be empty".into()));
    }
    if slug.chars().count() > max_len {
        return Err(AudienceError::Validation(format!(
            "segment slug '{slug}' exceeds {max_len} characters"
        )));
    }
    Ok(())
}
