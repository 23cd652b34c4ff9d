//! Membership and segment services: the single "apply membership change"
//! path shared by live requests, cohort enrollment and expiry removals.

use crate::audit::{AuditKinds, AuditRecorder};
use crate::call::bounded;
use crate::diff::{self, MembershipDiff};
use crate::lock::UserLocks;
use crate::sampler::CohortSampler;
use crate::scheduler::ExpiryScheduler;
use audience_core::config::LimitsConfig;
use audience_core::types::{validate_slug, validate_user_id, AuditRecord, BasisPoints};
use audience_core::{AudienceError, AudienceResult, AuditStore, SegmentStore, Stores, UserStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// A caller's requested membership change for one user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetSegments {
    pub user_id: String,
    pub add: Vec<String>,
    pub remove: Vec<String>,
    /// Minutes until the new additions are removed again; 0 keeps them.
    pub ttl_minutes: u64,
}

/// Whether the audit trail caught up with an applied change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum AuditOutcome {
    Recorded(usize),
    /// The change stands but its audit records were not written.
    Failed(String),
}

impl AuditOutcome {
    pub fn is_recorded(&self) -> bool {
        matches!(self, Self::Recorded(_))
    }
}

/// The change actually applied for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MembershipChange {
    pub user_id: String,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub audit: AuditOutcome,
}

impl MembershipChange {
    fn unchanged(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            added: Vec::new(),
            removed: Vec::new(),
            expires_at: None,
            audit: AuditOutcome::Recorded(0),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Clones share one per-user lock table, so every clone serializes
/// changes to the same user against the others.
#[derive(Clone)]
pub struct MembershipService {
    users: Arc<dyn UserStore>,
    segments: Arc<dyn SegmentStore>,
    audit: Arc<dyn AuditStore>,
    recorder: AuditRecorder,
    scheduler: ExpiryScheduler,
    limits: LimitsConfig,
    call_timeout: Option<Duration>,
    locks: UserLocks,
}

impl MembershipService {
    pub fn new(stores: &Stores, limits: LimitsConfig) -> Self {
        Self {
            users: stores.users.clone(),
            segments: stores.segments.clone(),
            audit: stores.audit.clone(),
            recorder: AuditRecorder::new(stores.audit.clone(), stores.clock.clone(), None),
            scheduler: ExpiryScheduler::new(stores.tasks.clone(), stores.clock.clone(), None),
            limits,
            call_timeout: None,
            locks: UserLocks::new(),
        }
    }

    /// A clone whose store calls are each bounded by `timeout`. It keeps
    /// sharing this service's user locks.
    pub fn with_call_timeout(&self, timeout: Duration) -> Self {
        let limit = Some(timeout);
        Self {
            recorder: self.recorder.clone().bounded_by(limit),
            scheduler: self.scheduler.clone().bounded_by(limit),
            call_timeout: limit,
            ..self.clone()
        }
    }

    /// Apply a caller's add/remove request.
    pub async fn set_segments(&self, request: SetSegments) -> AudienceResult<MembershipChange> {
        validate_user_id(&request.user_id, self.limits.max_user_id_len)?;
        for slug in request.add.iter().chain(request.remove.iter()) {
            validate_slug(slug, self.limits.max_slug_len)?;
        }
        ExpiryScheduler::validate_ttl(request.ttl_minutes)?;

        self.apply_change(
            &request.user_id,
            &request.add,
            &request.remove,
            request.ttl_minutes,
            AuditKinds::MANUAL,
        )
        .await
    }

    pub async fn active_segments(&self, user_id: &str) -> AudienceResult<Vec<String>> {
        validate_user_id(user_id, self.limits.max_user_id_len)?;
        bounded(
            self.call_timeout,
            "active_segments",
            self.users.active_segments(user_id),
        )
        .await
    }

    /// Audit records for one user in a calendar month, oldest first.
    pub async fn history(
        &self,
        user_id: &str,
        year: i32,
        month: u32,
    ) -> AudienceResult<Vec<AuditRecord>> {
        validate_user_id(user_id, self.limits.max_user_id_len)?;
        if !(1..=12).contains(&month) {
            return Err(AudienceError::Validation(format!(
                "month must be between 1 and 12, got {month}"
            )));
        }

        let records = bounded(
            self.call_timeout,
            "audit_history",
            self.audit.history(user_id, year, month),
        )
        .await?;
        if records.is_empty() {
            return Err(AudienceError::NoHistory {
                user_id: user_id.to_string(),
                year,
                month,
            });
        }
        Ok(records)
    }

    /// Reconcile, apply, schedule and audit one user's change.
    ///
    /// Runs under the user's lock from the read of the active set until
    /// the audit records are written, so concurrent changes to one user
    /// each see the state the previous one left.
    ///
    /// The membership write is the commit point: once it succeeds the
    /// change stands. A scheduling failure is returned as an error; an
    /// audit failure is only reported in the outcome.
    pub(crate) async fn apply_change(
        &self,
        user_id: &str,
        add: &[String],
        remove: &[String],
        ttl_minutes: u64,
        kinds: AuditKinds,
    ) -> AudienceResult<MembershipChange> {
        let _guard = self.locks.lock(user_id).await;

        let (active, known_user) = match bounded(
            self.call_timeout,
            "active_segments",
            self.users.active_segments(user_id),
        )
        .await
        {
            Ok(active) => (active, true),
            Err(AudienceError::UserNotFound(_)) => (Vec::new(), false),
            Err(e) => return Err(e),
        };

        let diff = diff::diff(add, remove, &active);
        if diff.is_empty() && known_user {
            debug!(user_id = user_id, "Membership already up to date");
            return Ok(MembershipChange::unchanged(user_id));
        }

        self.ensure_segments_exist(&diff).await?;

        // Unknown users are registered even when the diff is empty.
        bounded(
            self.call_timeout,
            "apply_membership",
            self.users.apply_membership(user_id, &diff.add, &diff.remove),
        )
        .await?;

        let expires_at = match self.scheduler.schedule(user_id, &diff.add, ttl_minutes).await {
            Ok(expires_at) => expires_at,
            Err(e) => {
                error!(
                    user_id = user_id,
                    error = %e,
                    "Membership applied but expiry could not be scheduled"
                );
                return Err(e);
            }
        };

        let audit = match self.recorder.record(user_id, &diff, kinds).await {
            Ok(count) => AuditOutcome::Recorded(count),
            Err(e) => {
                warn!(
                    user_id = user_id,
                    error = %e,
                    added = diff.add.len(),
                    removed = diff.remove.len(),
                    "Membership applied but audit write failed"
                );
                metrics::counter!("membership.audit_failures").increment(1);
                AuditOutcome::Failed(e.to_string())
            }
        };

        metrics::counter!("membership.added").increment(diff.add.len() as u64);
        metrics::counter!("membership.removed").increment(diff.remove.len() as u64);

        let MembershipDiff { add, remove } = diff;
        Ok(MembershipChange {
            user_id: user_id.to_string(),
            added: add,
            removed: remove,
            expires_at,
            audit,
        })
    }

    async fn ensure_segments_exist(&self, diff: &MembershipDiff) -> AudienceResult<()> {
        let mut missing = Vec::new();
        for slug in &diff.add {
            let exists =
                bounded(self.call_timeout, "segment_exists", self.segments.exists(slug)).await?;
            if !exists {
                missing.push(slug.clone());
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AudienceError::SegmentsNotExist(missing))
        }
    }
}

/// Input for segment creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateSegment {
    pub slug: String,
    /// Share of existing users to enroll, in basis points.
    pub percentage: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentCreated {
    pub slug: String,
    pub enrolled: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentDeleted {
    pub slug: String,
    pub removed_members: Vec<String>,
    pub audit: AuditOutcome,
}

#[derive(Clone)]
pub struct SegmentService {
    segments: Arc<dyn SegmentStore>,
    membership: MembershipService,
    sampler: CohortSampler,
    recorder: AuditRecorder,
    limits: LimitsConfig,
}

impl SegmentService {
    /// Cohort enrollment goes through `membership`, sharing its user locks.
    pub fn new(stores: &Stores, membership: MembershipService) -> Self {
        Self {
            segments: stores.segments.clone(),
            sampler: CohortSampler::new(stores.users.clone(), None),
            recorder: AuditRecorder::new(stores.audit.clone(), stores.clock.clone(), None),
            limits: membership.limits.clone(),
            membership,
        }
    }

    /// Create a segment and optionally enroll a random share of all users.
    pub async fn create_segment(&self, request: CreateSegment) -> AudienceResult<SegmentCreated> {
        validate_slug(&request.slug, self.limits.max_slug_len)?;
        let share = request.percentage.map(BasisPoints::try_from).transpose()?;

        bounded(None, "create_segment", self.segments.create(&request.slug)).await?;
        info!(slug = %request.slug, "Segment created");

        let Some(share) = share else {
            return Ok(SegmentCreated {
                slug: request.slug,
                enrolled: Vec::new(),
            });
        };

        let cohort = self.sampler.sample(share).await?;
        let slug = [request.slug.clone()];
        let mut enrolled = Vec::with_capacity(cohort.len());
        for user_id in cohort {
            let change = self
                .membership
                .apply_change(&user_id, &slug, &[], 0, AuditKinds::COHORT)
                .await?;
            if !change.added.is_empty() {
                enrolled.push(user_id);
            }
        }

        info!(
            slug = %request.slug,
            basis_points = share.get(),
            enrolled = enrolled.len(),
            "Cohort enrolled into segment"
        );
        Ok(SegmentCreated {
            slug: request.slug,
            enrolled,
        })
    }

    /// Delete a segment, dropping every membership in it immediately.
    pub async fn delete_segment(&self, slug: &str) -> AudienceResult<SegmentDeleted> {
        validate_slug(slug, self.limits.max_slug_len)?;

        let members = bounded(None, "delete_segment", self.segments.delete(slug)).await?;
        info!(slug = slug, members = members.len(), "Segment deleted");

        let audit = match self.recorder.record_cascade(slug, &members).await {
            Ok(count) => AuditOutcome::Recorded(count),
            Err(e) => {
                warn!(
                    slug = slug,
                    error = %e,
                    members = members.len(),
                    "Segment deleted but audit write failed"
                );
                metrics::counter!("membership.audit_failures").increment(1);
                AuditOutcome::Failed(e.to_string())
            }
        };

        Ok(SegmentDeleted {
            slug: slug.to_string(),
            removed_members: members,
            audit,
        })
    }
}
