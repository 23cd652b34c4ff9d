//! Audit trail recorder: turns applied membership changes into ordered
//! audit records and appends them to the audit store.

use crate::call::bounded;
use crate::diff::MembershipDiff;
use audience_core::types::{AuditRecord, OperationKind};
use audience_core::{AudienceResult, AuditStore, Clock};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Operation kinds written for the two sides of a diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditKinds {
    pub added: OperationKind,
    pub removed: OperationKind,
}

impl AuditKinds {
    /// Explicit requests and expiry removals.
    pub const MANUAL: Self = Self {
        added: OperationKind::Add,
        removed: OperationKind::Delete,
    };

    /// Enrollment by the cohort sampler.
    pub const COHORT: Self = Self {
        added: OperationKind::AutoAdd,
        removed: OperationKind::Delete,
    };
}

#[derive(Clone)]
pub struct AuditRecorder {
    store: Arc<dyn AuditStore>,
    clock: Arc<dyn Clock>,
    call_timeout: Option<Duration>,
}

impl AuditRecorder {
    pub fn new(
        store: Arc<dyn AuditStore>,
        clock: Arc<dyn Clock>,
        call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            store,
            clock,
            call_timeout,
        }
    }

    pub(crate) fn bounded_by(mut self, limit: Option<Duration>) -> Self {
        self.call_timeout = limit;
        self
    }

    /// Records for one user's diff: additions first, then removals, each
    /// in diff order.
    pub fn records(
        user_id: &str,
        diff: &MembershipDiff,
        kinds: AuditKinds,
        at: DateTime<Utc>,
    ) -> Vec<AuditRecord> {
        let added = diff.add.iter().map(|slug| (slug, kinds.added));
        let removed = diff.remove.iter().map(|slug| (slug, kinds.removed));
        added
            .chain(removed)
            .map(|(slug, kind)| AuditRecord {
                user_id: user_id.to_string(),
                segment_slug: slug.clone(),
                kind,
                created_at: at,
            })
            .collect()
    }

    /// One `delete_segment` record per member removed by a segment deletion.
    pub fn cascade_records(slug: &str, members: &[String], at: DateTime<Utc>) -> Vec<AuditRecord> {
        members
            .iter()
            .map(|user_id| AuditRecord {
                user_id: user_id.clone(),
                segment_slug: slug.to_string(),
                kind: OperationKind::DeleteSegment,
                created_at: at,
            })
            .collect()
    }

    /// Persist the records for an applied diff. Returns how many were written.
    pub async fn record(
        &self,
        user_id: &str,
        diff: &MembershipDiff,
        kinds: AuditKinds,
    ) -> AudienceResult<usize> {
        if diff.is_empty() {
            return Ok(0);
        }
        let at = bounded(self.call_timeout, "clock_now", self.clock.now()).await?;
        self.append(Self::records(user_id, diff, kinds, at)).await
    }

    /// Persist the records for a cascade deletion of `slug`.
    pub async fn record_cascade(&self, slug: &str, members: &[String]) -> AudienceResult<usize> {
        if members.is_empty() {
            return Ok(0);
        }
        let at = bounded(self.call_timeout, "clock_now", self.clock.now()).await?;
        self.append(Self::cascade_records(slug, members, at)).await
    }

    async fn append(&self, records: Vec<AuditRecord>) -> AudienceResult<usize> {
        bounded(self.call_timeout, "append_audit", self.store.append(&records)).await?;
        debug!(count = records.len(), "Audit records appended");
        Ok(records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_records_follow_diff_order() {
        let diff = MembershipDiff {
            add: vec!["vip".into(), "beta".into()],
            remove: vec!["legacy".into()],
        };
        let records = AuditRecorder::records("u1", &diff, AuditKinds::MANUAL, at());

        let summary: Vec<(&str, OperationKind)> = records
            .iter()
            .map(|r| (r.segment_slug.as_str(), r.kind))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("vip", OperationKind::Add),
                ("beta", OperationKind::Add),
                ("legacy", OperationKind::Delete),
            ]
        );
        assert!(records.iter().all(|r| r.user_id == "u1" && r.created_at == at()));
    }

    #[test]
    fn test_cohort_kinds_tag_additions_as_auto_add() {
        let diff = MembershipDiff {
            add: vec!["beta".into()],
            remove: vec![],
        };
        let records = AuditRecorder::records("u9", &diff, AuditKinds::COHORT, at());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, OperationKind::AutoAdd);
    }

    #[test]
    fn test_cascade_records_one_per_member() {
        let members = vec!["u1".to_string(), "u2".to_string()];
        let records = AuditRecorder::cascade_records("beta", &members, at());
        assert_eq!(records.len(), 2);
        assert!(records
            .iter()
            .all(|r| r.kind == OperationKind::DeleteSegment && r.segment_slug == "beta"));
        assert_eq!(records[1].user_id, "u2");
    }
}
