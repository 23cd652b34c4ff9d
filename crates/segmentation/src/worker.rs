//! Expiry worker: periodically removes memberships whose deferred
//! removal tasks have come due.
//!
//! Each cycle moves through `Fetching -> Grouping -> Applying ->
//! Completing` and back to `Idle`. The current state and the outcome of
//! the last cycle are published on a watch channel.

use crate::audit::AuditKinds;
use crate::call::bounded;
use crate::service::MembershipService;
use crate::ticker::{IntervalTicker, Ticker};
use audience_core::config::WorkerConfig;
use audience_core::types::DeferredTask;
use audience_core::{AudienceResult, Clock, Stores, TaskStore};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    Fetching,
    Grouping,
    Applying,
    Completing,
}

/// Outcome of one completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Due tasks returned by the task store.
    pub fetched: usize,
    /// Distinct users those tasks belonged to.
    pub users: usize,
    /// Memberships actually removed.
    pub removed: usize,
    /// Tasks marked complete.
    pub completed: usize,
    /// Users whose removal failed; their tasks stay pending.
    pub failed_users: Vec<String>,
    /// Users skipped because shutdown was requested mid-cycle.
    pub abandoned_users: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub state: CycleState,
    pub cycles: u64,
    pub last_report: Option<CycleReport>,
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self {
            state: CycleState::Idle,
            cycles: 0,
            last_report: None,
        }
    }
}

/// Due removals for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryGroup {
    pub user_id: String,
    /// Distinct slugs in first-seen order.
    pub segments: Vec<String>,
    pub task_ids: Vec<i64>,
}

/// Group due tasks by user so each user gets a single removal call.
pub fn group_by_user(tasks: &[DeferredTask]) -> Vec<ExpiryGroup> {
    let mut groups: BTreeMap<&str, ExpiryGroup> = BTreeMap::new();
    for task in tasks {
        let group = groups
            .entry(task.user_id.as_str())
            .or_insert_with(|| ExpiryGroup {
                user_id: task.user_id.clone(),
                segments: Vec::new(),
                task_ids: Vec::new(),
            });
        if !group.segments.contains(&task.segment_slug) {
            group.segments.push(task.segment_slug.clone());
        }
        group.task_ids.push(task.task_id);
    }
    groups.into_values().collect()
}

pub struct ExpiryWorker {
    membership: MembershipService,
    tasks: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    call_timeout: Duration,
    status: watch::Sender<WorkerStatus>,
}

impl ExpiryWorker {
    /// Removals go through `membership`, so they are serialized with live
    /// requests for the same user.
    pub fn new(stores: &Stores, config: &WorkerConfig, membership: &MembershipService) -> Self {
        let call_timeout = config.store_call_timeout();
        let (status, _) = watch::channel(WorkerStatus::default());
        Self {
            membership: membership.with_call_timeout(call_timeout),
            tasks: stores.tasks.clone(),
            clock: stores.clock.clone(),
            poll_interval: config.poll_interval(),
            call_timeout,
            status,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerStatus> {
        self.status.subscribe()
    }

    /// Run one full cycle to completion.
    pub async fn run_cycle(&self) -> AudienceResult<CycleReport> {
        self.cycle(None).await
    }

    async fn cycle(&self, shutdown: Option<&watch::Receiver<bool>>) -> AudienceResult<CycleReport> {
        let result = self.process(shutdown).await;
        self.status.send_modify(|status| {
            status.state = CycleState::Idle;
            status.cycles += 1;
            if let Ok(report) = &result {
                status.last_report = Some(report.clone());
            }
        });
        metrics::counter!("expiry.cycles").increment(1);
        if result.is_err() {
            metrics::counter!("expiry.cycle_errors").increment(1);
        }
        result
    }

    async fn process(
        &self,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> AudienceResult<CycleReport> {
        let timeout = Some(self.call_timeout);

        self.set_state(CycleState::Fetching);
        let now = bounded(timeout, "clock_now", self.clock.now()).await?;
        let due = bounded(timeout, "fetch_due", self.tasks.fetch_due(now)).await?;

        let mut report = CycleReport {
            fetched: due.len(),
            ..CycleReport::default()
        };
        if due.is_empty() {
            debug!("No membership expiries due");
            return Ok(report);
        }

        self.set_state(CycleState::Grouping);
        let groups = group_by_user(&due);
        report.users = groups.len();

        let total = groups.len();
        for (index, group) in groups.into_iter().enumerate() {
            if shutdown.is_some_and(|rx| *rx.borrow()) {
                report.abandoned_users = total - index;
                info!(
                    abandoned = report.abandoned_users,
                    "Shutdown requested, leaving remaining expiries for the next run"
                );
                break;
            }

            self.set_state(CycleState::Applying);
            let change = match self
                .membership
                .apply_change(&group.user_id, &[], &group.segments, 0, AuditKinds::MANUAL)
                .await
            {
                Ok(change) => change,
                Err(e) => {
                    warn!(
                        user_id = %group.user_id,
                        error = %e,
                        "Expiry removal failed, tasks left pending"
                    );
                    metrics::counter!("expiry.group_failures").increment(1);
                    report.failed_users.push(group.user_id);
                    continue;
                }
            };
            report.removed += change.removed.len();

            self.set_state(CycleState::Completing);
            if let Err(e) = bounded(
                timeout,
                "mark_complete",
                self.tasks.mark_complete(&group.task_ids),
            )
            .await
            {
                warn!(
                    user_id = %group.user_id,
                    error = %e,
                    "Expired memberships removed but tasks not marked complete"
                );
                metrics::counter!("expiry.group_failures").increment(1);
                report.failed_users.push(group.user_id);
                continue;
            }
            report.completed += group.task_ids.len();
        }

        metrics::counter!("expiry.removed").increment(report.removed as u64);
        metrics::counter!("expiry.completed_tasks").increment(report.completed as u64);
        info!(
            fetched = report.fetched,
            users = report.users,
            removed = report.removed,
            completed = report.completed,
            failed = report.failed_users.len(),
            "Expiry cycle finished"
        );
        Ok(report)
    }

    fn set_state(&self, state: CycleState) {
        self.status.send_modify(|status| status.state = state);
    }

    /// Run cycles on every tick until `shutdown` flips to true or its
    /// sender is dropped.
    pub async fn run<T: Ticker>(self, mut ticker: T, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            "Expiry worker started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.cycle(Some(&shutdown)).await {
                        error!(error = %e, "Expiry cycle aborted, retrying next tick");
                    }
                }
            }
        }
        info!("Expiry worker stopped");
    }

    /// Spawn the worker on the poll interval.
    pub fn start(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let ticker = IntervalTicker::new(self.poll_interval);
        tokio::spawn(self.run(ticker, shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn task(id: i64, user: &str, slug: &str) -> DeferredTask {
        DeferredTask {
            task_id: id,
            user_id: user.to_string(),
            segment_slug: slug.to_string(),
            deadline: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            done: false,
        }
    }

    #[test]
    fn test_group_by_user_merges_tasks() {
        let tasks = vec![
            task(1, "u1", "a"),
            task(2, "u2", "c"),
            task(3, "u1", "b"),
        ];
        let groups = group_by_user(&tasks);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].user_id, "u1");
        assert_eq!(groups[0].segments, vec!["a", "b"]);
        assert_eq!(groups[0].task_ids, vec![1, 3]);
        assert_eq!(groups[1].segments, vec!["c"]);
        assert_eq!(groups[1].task_ids, vec![2]);
    }

    #[test]
    fn test_group_by_user_dedupes_slugs_keeps_ids() {
        let tasks = vec![task(1, "u1", "a"), task(2, "u1", "a")];
        let groups = group_by_user(&tasks);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].segments, vec!["a"]);
        assert_eq!(groups[0].task_ids, vec![1, 2]);
    }

    #[test]
    fn test_group_by_user_empty() {
        assert!(group_by_user(&[]).is_empty());
    }

    #[test]
    fn test_status_serializes_state_names() {
        let status = WorkerStatus::default();
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "idle");
        assert_eq!(json["cycles"], 0);
    }
}
