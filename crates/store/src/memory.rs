//! In-process store backed by DashMap, implementing every storage port.
//!
//! Per-user membership writes are serialized by the DashMap shard lock on
//! the user's entry. Segment deletion takes the catalog lock exclusively,
//! so a membership write can never add a user to a segment that is being
//! deleted.

use async_trait::async_trait;
use audience_core::types::{AuditRecord, DeferredTask, NewTask};
use audience_core::{AuditStore, SegmentStore, StoreError, TaskStore, UserStore};
use chrono::{DateTime, Datelike, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;

/// Storage port a fault can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Port {
    Users,
    Segments,
    Audit,
    Tasks,
}

impl Port {
    fn as_str(self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Segments => "segments",
            Self::Audit => "audit",
            Self::Tasks => "tasks",
        }
    }
}

pub struct MemoryStore {
    /// user id -> slugs in the order they were joined
    users: DashMap<String, Vec<String>>,
    segments: DashSet<String>,
    catalog: RwLock<()>,
    audit: RwLock<Vec<AuditRecord>>,
    tasks: Mutex<Vec<DeferredTask>>,
    next_task_id: AtomicI64,
    faults: Mutex<HashSet<Port>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            segments: DashSet::new(),
            catalog: RwLock::new(()),
            audit: RwLock::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            next_task_id: AtomicI64::new(1),
            faults: Mutex::new(HashSet::new()),
        }
    }

    /// Make every call on `port` fail as unavailable until [`Self::recover`].
    pub fn fail(&self, port: Port) {
        self.faults.lock().insert(port);
    }

    pub fn recover(&self, port: Port) {
        self.faults.lock().remove(&port);
    }

    fn check(&self, port: Port) -> Result<(), StoreError> {
        if self.faults.lock().contains(&port) {
            return Err(StoreError::Unavailable(format!(
                "{} store is unavailable",
                port.as_str()
            )));
        }
        Ok(())
    }

    /// Every audit record in append order.
    pub fn audit_records(&self) -> Vec<AuditRecord> {
        self.audit.read().clone()
    }

    /// Every task, pending or done, in creation order.
    pub fn tasks(&self) -> Vec<DeferredTask> {
        self.tasks.lock().clone()
    }

    pub fn pending_tasks(&self) -> Vec<DeferredTask> {
        self.tasks.lock().iter().filter(|t| !t.done).cloned().collect()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn active_segments(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        self.check(Port::Users)?;
        self.users
            .get(user_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::UserNotFound(user_id.to_string()))
    }

    async fn apply_membership(
        &self,
        user_id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<(), StoreError> {
        self.check(Port::Users)?;
        let _catalog = self.catalog.read();

        let missing: Vec<String> = add
            .iter()
            .filter(|slug| !self.segments.contains(slug.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(StoreError::SegmentsNotExist(missing));
        }

        let mut segments = self.users.entry(user_id.to_string()).or_default();
        segments.retain(|slug| !remove.contains(slug));
        for slug in add {
            if !segments.contains(slug) {
                segments.push(slug.clone());
            }
        }
        Ok(())
    }

    async fn all_user_ids(&self) -> Result<Vec<String>, StoreError> {
        self.check(Port::Users)?;
        let mut ids: Vec<String> = self.users.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl SegmentStore for MemoryStore {
    async fn create(&self, slug: &str) -> Result<(), StoreError> {
        self.check(Port::Segments)?;
        let _catalog = self.catalog.read();
        if !self.segments.insert(slug.to_string()) {
            return Err(StoreError::AlreadyExists(slug.to_string()));
        }
        Ok(())
    }

    async fn exists(&self, slug: &str) -> Result<bool, StoreError> {
        self.check(Port::Segments)?;
        Ok(self.segments.contains(slug))
    }

    async fn delete(&self, slug: &str) -> Result<Vec<String>, StoreError> {
        self.check(Port::Segments)?;
        let _catalog = self.catalog.write();
        if self.segments.remove(slug).is_none() {
            return Err(StoreError::SegmentNotFound(slug.to_string()));
        }

        let mut members = Vec::new();
        for mut entry in self.users.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|s| s != slug);
            if entry.value().len() != before {
                members.push(entry.key().clone());
            }
        }
        members.sort();
        debug!(slug = slug, members = members.len(), "Segment removed from store");
        Ok(members)
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn append(&self, records: &[AuditRecord]) -> Result<(), StoreError> {
        self.check(Port::Audit)?;
        self.audit.write().extend_from_slice(records);
        Ok(())
    }

    async fn history(
        &self,
        user_id: &str,
        year: i32,
        month: u32,
    ) -> Result<Vec<AuditRecord>, StoreError> {
        self.check(Port::Audit)?;
        let mut records: Vec<AuditRecord> = self
            .audit
            .read()
            .iter()
            .filter(|r| {
                r.user_id == user_id && r.created_at.year() == year && r.created_at.month() == month
            })
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create(&self, tasks: &[NewTask], deadline: DateTime<Utc>) -> Result<(), StoreError> {
        self.check(Port::Tasks)?;
        let mut stored = self.tasks.lock();
        for task in tasks {
            stored.push(DeferredTask {
                task_id: self.next_task_id.fetch_add(1, Ordering::Relaxed),
                user_id: task.user_id.clone(),
                segment_slug: task.segment_slug.clone(),
                deadline,
                done: false,
            });
        }
        Ok(())
    }

    async fn fetch_due(&self, now: DateTime<Utc>) -> Result<Vec<DeferredTask>, StoreError> {
        self.check(Port::Tasks)?;
        Ok(self
            .tasks
            .lock()
            .iter()
            .filter(|t| !t.done && t.deadline < now)
            .cloned()
            .collect())
    }

    async fn mark_complete(&self, task_ids: &[i64]) -> Result<(), StoreError> {
        self.check(Port::Tasks)?;
        let mut stored = self.tasks.lock();
        for task in stored.iter_mut() {
            if task_ids.contains(&task.task_id) {
                task.done = true;
            }
        }
        Ok(())
    }
}
