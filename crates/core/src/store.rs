//! Storage ports consumed by the membership lifecycle engine.
//!
//! Implementations own persistence and must give read-your-writes
//! consistency within one logical operation. Membership writes for the
//! same user must be serialized by the implementation.

use crate::types::{AuditRecord, DeferredTask, NewTask};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("segment not found: {0}")]
    SegmentNotFound(String),

    #[error("segment already exists: {0}")]
    AlreadyExists(String),

    #[error("segments do not exist: {}", .0.join(", "))]
    SegmentsNotExist(Vec<String>),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Segments the user currently belongs to.
    async fn active_segments(&self, user_id: &str) -> Result<Vec<String>, StoreError>;

    /// Add and remove memberships for one user, creating the user if
    /// needed. Rejects the whole call with `SegmentsNotExist` if any
    /// addition names an unknown segment. Adding an existing membership
    /// or removing an absent one is a no-op.
    async fn apply_membership(
        &self,
        user_id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<(), StoreError>;

    async fn all_user_ids(&self) -> Result<Vec<String>, StoreError>;
}

#[async_trait]
pub trait SegmentStore: Send + Sync {
    async fn create(&self, slug: &str) -> Result<(), StoreError>;

    async fn exists(&self, slug: &str) -> Result<bool, StoreError>;

    /// Delete the segment and every membership in it. Returns the users
    /// whose membership was removed.
    async fn delete(&self, slug: &str) -> Result<Vec<String>, StoreError>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, records: &[AuditRecord]) -> Result<(), StoreError>;

    /// Records for one user within a calendar month, oldest first.
    async fn history(
        &self,
        user_id: &str,
        year: i32,
        month: u32,
    ) -> Result<Vec<AuditRecord>, StoreError>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist one pending task per entry, all sharing `deadline`.
    async fn create(&self, tasks: &[NewTask], deadline: DateTime<Utc>) -> Result<(), StoreError>;

    /// Pending tasks whose deadline is strictly before `now`.
    async fn fetch_due(&self, now: DateTime<Utc>) -> Result<Vec<DeferredTask>, StoreError>;

    async fn mark_complete(&self, task_ids: &[i64]) -> Result<(), StoreError>;
}

/// Authoritative time source, read from the storage tier so that every
/// caller schedules against the same clock.
#[async_trait]
pub trait Clock: Send + Sync {
    async fn now(&self) -> Result<DateTime<Utc>, StoreError>;
}

/// Handles to every store the engine talks to.
#[derive(Clone)]
pub struct Stores {
    pub users: Arc<dyn UserStore>,
    pub segments: Arc<dyn SegmentStore>,
    pub audit: Arc<dyn AuditStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub clock: Arc<dyn Clock>,
}
