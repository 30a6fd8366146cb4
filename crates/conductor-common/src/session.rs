//! Session index types.
//!
//! The index records one entry per worker session. Entries are upserted by
//! session id and never deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single worker session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIndexEntry {
    pub session_id: String,
    pub task_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Free-form status string; classified by the group status evaluator
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub subagent_type: Option<String>,
}

fn default_status() -> String {
    "pending".to_string()
}

impl SessionIndexEntry {
    pub fn new(
        session_id: impl Into<String>,
        task_id: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            task_id: task_id.into(),
            created_at,
            updated_at: None,
            status: default_status(),
            group_id: None,
            subagent_type: None,
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_subagent_type(mut self, subagent_type: impl Into<String>) -> Self {
        self.subagent_type = Some(subagent_type.into());
        self
    }
}

/// All known sessions, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIndex {
    #[serde(default)]
    pub entries: Vec<SessionIndexEntry>,
}

impl SessionIndex {
    pub fn new(entries: Vec<SessionIndexEntry>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries ordered by `created_at`, oldest first. Ties keep insertion order.
    pub fn sorted_entries(&self) -> Vec<&SessionIndexEntry> {
        let mut sorted: Vec<&SessionIndexEntry> = self.entries.iter().collect();
        sorted.sort_by_key(|e| e.created_at);
        sorted
    }

    /// Insert or replace the entry with the same session id.
    ///
    /// A replaced entry keeps its original `created_at` and position.
    pub fn upsert(&mut self, mut entry: SessionIndexEntry) {
        match self
            .entries
            .iter_mut()
            .find(|e| e.session_id == entry.session_id)
        {
            Some(existing) => {
                entry.created_at = existing.created_at;
                *existing = entry;
            }
            None => self.entries.push(entry),
        }
    }

    pub fn get(&self, session_id: &str) -> Option<&SessionIndexEntry> {
        self.entries.iter().find(|e| e.session_id == session_id)
    }

    /// Entries attributed to `group_id`, ordered by `created_at`.
    pub fn entries_for_group<'a>(&'a self, group_id: &str) -> Vec<&'a SessionIndexEntry> {
        self.sorted_entries()
            .into_iter()
            .filter(|e| e.group_id.as_deref() == Some(group_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_upsert_appends_new_sessions() {
        let mut index = SessionIndex::default();
        index.upsert(SessionIndexEntry::new("s1", "t1", at(0)));
        index.upsert(SessionIndexEntry::new("s2", "t2", at(1)));
        assert_eq!(index.entries.len(), 2);
    }

    #[test]
    fn test_upsert_replaces_in_place_and_keeps_created_at() {
        let mut index = SessionIndex::default();
        index.upsert(SessionIndexEntry::new("s1", "t1", at(0)));
        index.upsert(SessionIndexEntry::new("s2", "t2", at(1)));
        index.upsert(SessionIndexEntry::new("s1", "t1", at(50)).with_status("completed"));

        assert_eq!(index.entries.len(), 2);
        assert_eq!(index.entries[0].session_id, "s1");
        assert_eq!(index.entries[0].status, "completed");
        assert_eq!(index.entries[0].created_at, at(0));
    }

    #[test]
    fn test_sorted_entries_is_stable() {
        let index = SessionIndex::new(vec![
            SessionIndexEntry::new("late", "t", at(10)),
            SessionIndexEntry::new("tie-a", "t", at(5)),
            SessionIndexEntry::new("tie-b", "t", at(5)),
        ]);
        let order: Vec<&str> = index
            .sorted_entries()
            .iter()
            .map(|e| e.session_id.as_str())
            .collect();
        assert_eq!(order, vec!["tie-a", "tie-b", "late"]);
    }

    #[test]
    fn test_entries_for_group() {
        let index = SessionIndex::new(vec![
            SessionIndexEntry::new("s1", "t1", at(0)).with_group("g1"),
            SessionIndexEntry::new("s2", "t2", at(1)).with_group("g2"),
            SessionIndexEntry::new("s3", "t3", at(2)),
        ]);
        let scoped = index.entries_for_group("g1");
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].session_id, "s1");
    }

    #[test]
    fn test_deserialize_defaults() {
        let entry: SessionIndexEntry = serde_json::from_value(serde_json::json!({
            "session_id": "s1",
            "task_id": "t1",
            "created_at": "2025-01-01T00:00:00+00:00"
        }))
        .unwrap();
        assert_eq!(entry.status, "pending");
        assert!(entry.group_id.is_none());
        assert!(entry.updated_at.is_none());
    }
}
