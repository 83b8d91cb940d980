//! Durable dead-letter storage for events that failed pipeline execution.
//!
//! # Table design
//!
//! A single `dead_letter` table keyed by `project_key ++ 0x00 ++ item_id`
//! (big-endian), value = JSON-encoded `DeadLetterEntry`. One live entry per
//! key: a newer event for the same item replaces the queued older one, so a
//! stale event can never be replayed over fresher state. All mutations go
//! through single write transactions, which gives per-key atomicity under
//! concurrent writers.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::context::Phase;
use crate::error::{BridgeError, ErrorClass, Result};
use crate::event::Event;

const ENTRIES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("dead_letter");

fn store_err(e: impl std::fmt::Display) -> BridgeError {
    BridgeError::Store(e.to_string())
}

fn entry_key(project_key: &str, item_id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(project_key.len() + 9);
    key.extend_from_slice(project_key.as_bytes());
    key.push(0);
    key.extend_from_slice(&item_id.to_be_bytes());
    key
}

// ---------------------------------------------------------------------------
// DeadLetterEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub sink_project_key: String,
    pub item_id: u64,
    pub event: Event,
    pub phase: Phase,
    pub first_seen: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: String,
    pub error_class: ErrorClass,
    pub last_attempt: DateTime<Utc>,
    /// Request id of the call that first queued this event, for log
    /// correlation.
    pub rid: String,
}

/// What `enqueue` did with the submitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueDisposition {
    /// First failure for this key.
    Inserted,
    /// Same event failed again; attempt count bumped.
    AttemptRecorded(u32),
    /// Incoming event replaced a queued older one.
    Replaced,
    /// Incoming event was older than the queued one and was dropped.
    Superseded,
}

// ---------------------------------------------------------------------------
// DeadLetterStore
// ---------------------------------------------------------------------------

pub struct DeadLetterStore {
    db: Database,
}

impl DeadLetterStore {
    /// Open or create the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(store_err)?;
        // Ensure the table exists before any reads
        let wt = db.begin_write().map_err(store_err)?;
        wt.open_table(ENTRIES).map_err(store_err)?;
        wt.commit().map_err(store_err)?;
        Ok(Self { db })
    }

    /// Writability check for the health endpoint.
    pub fn ping(&self) -> bool {
        match self.db.begin_write() {
            Ok(wt) => wt.open_table(ENTRIES).is_ok() && wt.commit().is_ok(),
            Err(_) => false,
        }
    }

    /// Insert or update the entry for the event's key.
    ///
    /// Same event (same revision timestamp) failing again bumps the attempt
    /// count; a newer event replaces the queued one; an older event is
    /// dropped in favor of what is already queued.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue(
        &self,
        project_key: &str,
        event: &Event,
        phase: Phase,
        error: &str,
        class: ErrorClass,
        rid: &str,
        now: DateTime<Utc>,
    ) -> Result<EnqueueDisposition> {
        let key = entry_key(project_key, event.item.id);
        let wt = self.db.begin_write().map_err(store_err)?;
        let disposition;
        {
            let mut table = wt.open_table(ENTRIES).map_err(store_err)?;
            let existing = match table.get(key.as_slice()).map_err(store_err)? {
                Some(guard) => {
                    Some(serde_json::from_slice::<DeadLetterEntry>(guard.value())?)
                }
                None => None,
            };

            let entry = match existing {
                Some(old) if old.event.time > event.time => {
                    tracing::debug!(
                        project = project_key,
                        item = event.item.id,
                        queued = %old.event.time,
                        incoming = %event.time,
                        "dropping event superseded by queued newer one"
                    );
                    drop(table);
                    wt.commit().map_err(store_err)?;
                    return Ok(EnqueueDisposition::Superseded);
                }
                Some(old) if old.event.time == event.time => {
                    disposition = EnqueueDisposition::AttemptRecorded(old.attempts + 1);
                    DeadLetterEntry {
                        attempts: old.attempts + 1,
                        last_error: error.to_string(),
                        error_class: class,
                        last_attempt: now,
                        phase,
                        ..old
                    }
                }
                Some(old) => {
                    tracing::debug!(
                        project = project_key,
                        item = event.item.id,
                        superseded = %old.event.time,
                        "newer event supersedes queued one"
                    );
                    disposition = EnqueueDisposition::Replaced;
                    fresh_entry(project_key, event, phase, error, class, rid, now)
                }
                None => {
                    disposition = EnqueueDisposition::Inserted;
                    fresh_entry(project_key, event, phase, error, class, rid, now)
                }
            };

            let value = serde_json::to_vec(&entry)?;
            table
                .insert(key.as_slice(), value.as_slice())
                .map_err(store_err)?;
        }
        wt.commit().map_err(store_err)?;
        Ok(disposition)
    }

    pub fn get(&self, project_key: &str, item_id: u64) -> Result<Option<DeadLetterEntry>> {
        let key = entry_key(project_key, item_id);
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(ENTRIES).map_err(store_err)?;
        match table.get(key.as_slice()).map_err(store_err)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Remove the entry for a key. Returns whether one existed.
    pub fn remove(&self, project_key: &str, item_id: u64) -> Result<bool> {
        let key = entry_key(project_key, item_id);
        let wt = self.db.begin_write().map_err(store_err)?;
        let existed;
        {
            let mut table = wt.open_table(ENTRIES).map_err(store_err)?;
            existed = table.remove(key.as_slice()).map_err(store_err)?.is_some();
        }
        wt.commit().map_err(store_err)?;
        Ok(existed)
    }

    /// Drop the queued entry for a key if it is not newer than `up_to`.
    ///
    /// Called after a live event for the key succeeds: whatever was queued
    /// describes older state and must never be replayed.
    pub fn discard_stale(
        &self,
        project_key: &str,
        item_id: u64,
        up_to: DateTime<Utc>,
    ) -> Result<bool> {
        let key = entry_key(project_key, item_id);
        let wt = self.db.begin_write().map_err(store_err)?;
        let removed;
        {
            let mut table = wt.open_table(ENTRIES).map_err(store_err)?;
            let stale = match table.get(key.as_slice()).map_err(store_err)? {
                Some(guard) => {
                    let entry: DeadLetterEntry = serde_json::from_slice(guard.value())?;
                    entry.event.time <= up_to
                }
                None => false,
            };
            removed = stale && table.remove(key.as_slice()).map_err(store_err)?.is_some();
        }
        wt.commit().map_err(store_err)?;
        Ok(removed)
    }

    /// Entries due for a retry: `last_attempt + retry_interval <= now`,
    /// oldest first by `first_seen`.
    pub fn list_ready(
        &self,
        now: DateTime<Utc>,
        retry_interval: Duration,
    ) -> Result<Vec<DeadLetterEntry>> {
        let mut ready: Vec<DeadLetterEntry> = self
            .scan(None)?
            .into_iter()
            .filter(|e| e.last_attempt + retry_interval <= now)
            .collect();
        ready.sort_by_key(|e| e.first_seen);
        Ok(ready)
    }

    /// Remove entries older than the retention window without further
    /// attempts. Returns what was dropped.
    pub fn sweep_expired(
        &self,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> Result<Vec<DeadLetterEntry>> {
        let expired: Vec<DeadLetterEntry> = self
            .scan(None)?
            .into_iter()
            .filter(|e| e.first_seen + max_age < now)
            .collect();
        for entry in &expired {
            tracing::warn!(
                project = %entry.sink_project_key,
                item = entry.item_id,
                attempts = entry.attempts,
                first_seen = %entry.first_seen,
                "removing expired dead-letter entry"
            );
            self.remove(&entry.sink_project_key, entry.item_id)?;
        }
        Ok(expired)
    }

    /// All entries, optionally filtered by sink project, oldest first.
    pub fn list(&self, project_key: Option<&str>) -> Result<Vec<DeadLetterEntry>> {
        let mut entries = self.scan(project_key)?;
        entries.sort_by_key(|e| e.first_seen);
        Ok(entries)
    }

    pub fn count(&self, project_key: Option<&str>) -> Result<usize> {
        Ok(self.scan(project_key)?.len())
    }

    fn scan(&self, project_key: Option<&str>) -> Result<Vec<DeadLetterEntry>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(ENTRIES).map_err(store_err)?;
        let mut result = Vec::new();
        for entry in table.iter().map_err(store_err)? {
            let (_, v) = entry.map_err(store_err)?;
            let parsed: DeadLetterEntry = serde_json::from_slice(v.value())?;
            if project_key.map_or(true, |p| parsed.sink_project_key == p) {
                result.push(parsed);
            }
        }
        Ok(result)
    }
}

fn fresh_entry(
    project_key: &str,
    event: &Event,
    phase: Phase,
    error: &str,
    class: ErrorClass,
    rid: &str,
    now: DateTime<Utc>,
) -> DeadLetterEntry {
    DeadLetterEntry {
        sink_project_key: project_key.to_string(),
        item_id: event.item.id,
        event: event.clone(),
        phase,
        first_seen: now,
        attempts: 1,
        last_error: error.to_string(),
        error_class: class,
        last_attempt: now,
        rid: rid.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, ItemSnapshot};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, DeadLetterStore) {
        let dir = TempDir::new().unwrap();
        let store = DeadLetterStore::open(&dir.path().join("queue.redb")).unwrap();
        (dir, store)
    }

    fn event_at(item_id: u64, time: DateTime<Utc>) -> Event {
        Event {
            kind: EventKind::Update,
            time,
            item: ItemSnapshot {
                id: item_id,
                kind: None,
                summary: Some("s".into()),
                status: None,
                resolution: None,
                priority: None,
                product: None,
                component: None,
                labels: Some("[proj]".into()),
                keywords: Vec::new(),
                links: Vec::new(),
                assignee: None,
                is_private: false,
            },
            changes: None,
            comment: None,
        }
    }

    fn t(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap() + Duration::hours(h as i64)
    }

    fn enqueue_at(
        store: &DeadLetterStore,
        event: &Event,
        now: DateTime<Utc>,
    ) -> EnqueueDisposition {
        store
            .enqueue(
                "PROJ",
                event,
                Phase::Existing,
                "sink: HTTP 503",
                ErrorClass::Transient,
                "rid-1",
                now,
            )
            .unwrap()
    }

    #[test]
    fn first_failure_inserts_with_one_attempt() {
        let (_dir, store) = open_tmp();
        let disp = enqueue_at(&store, &event_at(42, t(9)), t(10));
        assert_eq!(disp, EnqueueDisposition::Inserted);
        let entry = store.get("PROJ", 42).unwrap().unwrap();
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.first_seen, t(10));
        assert_eq!(entry.error_class, ErrorClass::Transient);
    }

    #[test]
    fn same_event_failing_again_bumps_attempts_keeps_first_seen() {
        let (_dir, store) = open_tmp();
        let event = event_at(42, t(9));
        enqueue_at(&store, &event, t(10));
        let disp = enqueue_at(&store, &event, t(11));
        assert_eq!(disp, EnqueueDisposition::AttemptRecorded(2));
        let entry = store.get("PROJ", 42).unwrap().unwrap();
        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.first_seen, t(10));
        assert_eq!(entry.last_attempt, t(11));
    }

    #[test]
    fn newer_event_replaces_queued_older_one() {
        let (_dir, store) = open_tmp();
        enqueue_at(&store, &event_at(42, t(9)), t(10));
        let disp = enqueue_at(&store, &event_at(42, t(12)), t(13));
        assert_eq!(disp, EnqueueDisposition::Replaced);
        let entry = store.get("PROJ", 42).unwrap().unwrap();
        assert_eq!(entry.event.time, t(12));
        assert_eq!(entry.attempts, 1, "replacement starts a fresh attempt count");
    }

    #[test]
    fn older_event_is_dropped_when_newer_is_queued() {
        let (_dir, store) = open_tmp();
        enqueue_at(&store, &event_at(42, t(12)), t(13));
        let disp = enqueue_at(&store, &event_at(42, t(9)), t(14));
        assert_eq!(disp, EnqueueDisposition::Superseded);
        let entry = store.get("PROJ", 42).unwrap().unwrap();
        assert_eq!(entry.event.time, t(12), "queued newer event untouched");
    }

    #[test]
    fn one_live_entry_per_key_across_projects() {
        let (_dir, store) = open_tmp();
        enqueue_at(&store, &event_at(42, t(9)), t(10));
        store
            .enqueue(
                "OTHER",
                &event_at(42, t(9)),
                Phase::New,
                "e",
                ErrorClass::Permanent,
                "rid-2",
                t(10),
            )
            .unwrap();
        assert_eq!(store.count(None).unwrap(), 2);
        assert_eq!(store.count(Some("PROJ")).unwrap(), 1);
        assert_eq!(store.count(Some("OTHER")).unwrap(), 1);
    }

    #[test]
    fn list_ready_filters_by_interval_and_orders_oldest_first() {
        let (_dir, store) = open_tmp();
        // Two entries: first seen at 10:00 and 11:00, both last tried then.
        enqueue_at(&store, &event_at(2, t(9)), t(11));
        enqueue_at(&store, &event_at(1, t(9)), t(10));

        // At 12:00 with a 3h interval nothing is ready.
        assert!(store.list_ready(t(12), Duration::hours(3)).unwrap().is_empty());

        // At 14:00 both are ready, oldest first_seen first.
        let ready = store.list_ready(t(14), Duration::hours(3)).unwrap();
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].item_id, 1);
        assert_eq!(ready[1].item_id, 2);
    }

    #[test]
    fn remove_deletes_entry() {
        let (_dir, store) = open_tmp();
        enqueue_at(&store, &event_at(42, t(9)), t(10));
        assert!(store.remove("PROJ", 42).unwrap());
        assert!(!store.remove("PROJ", 42).unwrap());
        assert!(store.get("PROJ", 42).unwrap().is_none());
    }

    #[test]
    fn sweep_expired_drops_old_entries_regardless_of_attempts() {
        let (_dir, store) = open_tmp();
        let event = event_at(42, t(0));
        enqueue_at(&store, &event, t(1));
        enqueue_at(&store, &event, t(2));
        enqueue_at(&store, &event_at(7, t(3)), t(20));

        // max_age 10h: entry first seen at 01:00 expires by 20:00.
        let swept = store.sweep_expired(t(20), Duration::hours(10)).unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].item_id, 42);
        assert_eq!(swept[0].attempts, 2);

        let ready = store.list_ready(t(30), Duration::hours(1)).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].item_id, 7, "swept entry absent from list_ready");
    }

    #[test]
    fn expired_entry_swept_before_any_retry() {
        let (_dir, store) = open_tmp();
        // First seen 25 hours ago with a 24h retention window.
        enqueue_at(&store, &event_at(42, t(0)), t(0));
        let now = t(0) + Duration::hours(25);
        let swept = store.sweep_expired(now, Duration::hours(24)).unwrap();
        assert_eq!(swept.len(), 1);
        assert!(store.list_ready(now, Duration::hours(1)).unwrap().is_empty());
    }

    #[test]
    fn discard_stale_respects_recency() {
        let (_dir, store) = open_tmp();
        enqueue_at(&store, &event_at(42, t(12)), t(13));
        // A successfully processed event from 11:00 is older than what is
        // queued; the entry stays.
        assert!(!store.discard_stale("PROJ", 42, t(11)).unwrap());
        assert!(store.get("PROJ", 42).unwrap().is_some());
        // One from 12:00 (or later) covers it; the entry goes.
        assert!(store.discard_stale("PROJ", 42, t(12)).unwrap());
        assert!(store.get("PROJ", 42).unwrap().is_none());
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.redb");
        {
            let store = DeadLetterStore::open(&path).unwrap();
            enqueue_at(&store, &event_at(42, t(9)), t(10));
        }
        let store = DeadLetterStore::open(&path).unwrap();
        let entry = store.get("PROJ", 42).unwrap().unwrap();
        assert_eq!(entry.item_id, 42);
        assert_eq!(entry.last_error, "sink: HTTP 503");
    }

    #[test]
    fn ping_reports_writable() {
        let (_dir, store) = open_tmp();
        assert!(store.ping());
    }
}
