//! Deferred expiry scheduler: turns time-limited additions into pending
//! removal tasks.

use crate::call::bounded;
use audience_core::types::NewTask;
use audience_core::{AudienceError, AudienceResult, Clock, TaskStore};
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Longest accepted membership TTL: one hundred years, in minutes.
pub const MAX_TTL_MINUTES: u64 = 100 * 365 * 24 * 60;

#[derive(Clone)]
pub struct ExpiryScheduler {
    tasks: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    call_timeout: Option<Duration>,
}

impl ExpiryScheduler {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            tasks,
            clock,
            call_timeout,
        }
    }

    pub(crate) fn bounded_by(mut self, limit: Option<Duration>) -> Self {
        self.call_timeout = limit;
        self
    }

    pub fn validate_ttl(ttl_minutes: u64) -> AudienceResult<()> {
        if ttl_minutes > MAX_TTL_MINUTES {
            return Err(AudienceError::Validation(format!(
                "ttl of {ttl_minutes} minutes exceeds the maximum of {MAX_TTL_MINUTES}"
            )));
        }
        Ok(())
    }

    pub fn deadline(now: DateTime<Utc>, ttl_minutes: u64) -> AudienceResult<DateTime<Utc>> {
        Self::validate_ttl(ttl_minutes)?;
        TimeDelta::try_minutes(ttl_minutes as i64)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| {
                AudienceError::Validation(format!("ttl of {ttl_minutes} minutes is out of range"))
            })
    }

    /// One task per newly added segment.
    pub fn plan(user_id: &str, added: &[String]) -> Vec<NewTask> {
        added
            .iter()
            .map(|slug| NewTask {
                user_id: user_id.to_string(),
                segment_slug: slug.clone(),
            })
            .collect()
    }

    /// Schedule removal of `added` after `ttl_minutes`, measured from the
    /// store clock. Permanent additions (ttl 0) and empty additions
    /// schedule nothing. Returns the shared deadline when tasks were created.
    pub async fn schedule(
        &self,
        user_id: &str,
        added: &[String],
        ttl_minutes: u64,
    ) -> AudienceResult<Option<DateTime<Utc>>> {
        if ttl_minutes == 0 || added.is_empty() {
            return Ok(None);
        }

        let now = bounded(self.call_timeout, "clock_now", self.clock.now()).await?;
        let deadline = Self::deadline(now, ttl_minutes)?;
        let tasks = Self::plan(user_id, added);

        bounded(
            self.call_timeout,
            "create_tasks",
            self.tasks.create(&tasks, deadline),
        )
        .await?;

        debug!(
            user_id = user_id,
            count = tasks.len(),
            deadline = %deadline,
            "Scheduled membership expiry"
        );
        Ok(Some(deadline))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_deadline_adds_minutes() {
        let now = Utc.with_ymd_and_hms(2024, 1, 31, 23, 30, 0).unwrap();
        let deadline = ExpiryScheduler::deadline(now, 60).unwrap();
        assert_eq!(deadline, Utc.with_ymd_and_hms(2024, 2, 1, 0, 30, 0).unwrap());
    }

    #[test]
    fn test_ttl_above_maximum_is_rejected() {
        assert!(ExpiryScheduler::validate_ttl(MAX_TTL_MINUTES).is_ok());
        let err = ExpiryScheduler::validate_ttl(u64::MAX).unwrap_err();
        assert!(matches!(err, AudienceError::Validation(_)));
    }

    #[test]
    fn test_plan_one_task_per_segment() {
        let tasks = ExpiryScheduler::plan("u1", &["vip".to_string(), "beta".to_string()]);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].segment_slug, "vip");
        assert!(tasks.iter().all(|t| t.user_id == "u1"));
    }
}
