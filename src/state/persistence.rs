//! Atomic persistence of the coordination document.
//!
//! The unified document `sessions-state.json` is shared with the session
//! runtime; conductor owns only `metadata.orchestration.execution_plan` and
//! `metadata.orchestration.session_index` and preserves every other key.
//! `execution_plan.json` and `session_index.json` are kept as best-effort
//! mirrors for older readers.
//!
//! Every file is written to a temp file in the same directory, fsynced and
//! renamed into place. Before a save touches an artifact it is copied to
//! `<stem>.prev<suffix>`; if the unified write fails every touched artifact
//! is restored before the error is returned.

use conductor_common::{ExecutionPlan, SessionIndex};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::lock::StateLockGuard;
use crate::config::Config;
use crate::errors::PersistenceError;

const PLAN_SECTION: &str = "execution_plan";
const INDEX_SECTION: &str = "session_index";

/// Where a loaded section came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateSource {
    Unified,
    Legacy,
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadedState {
    pub plan: ExecutionPlan,
    pub index: SessionIndex,
    pub plan_source: StateSource,
    pub index_source: StateSource,
}

/// Outcome of a successful save.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveReport {
    pub mirrors_written: Vec<PathBuf>,
    pub mirrors_failed: Vec<PathBuf>,
}

/// Reads and writes the coordination artifacts in one state directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    state_path: PathBuf,
    plan_mirror: PathBuf,
    index_mirror: PathBuf,
    legacy_mirrors: bool,
}

impl StateStore {
    pub fn new(config: &Config) -> Self {
        Self {
            state_path: config.state_path(),
            plan_mirror: config.legacy_plan_path(),
            index_mirror: config.legacy_index_path(),
            legacy_mirrors: config.persistence.legacy_mirrors,
        }
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn plan_mirror(&self) -> &Path {
        &self.plan_mirror
    }

    pub fn index_mirror(&self) -> &Path {
        &self.index_mirror
    }

    /// Load plan and index, preferring the unified document.
    ///
    /// Missing files yield empty defaults. Malformed JSON in an existing file
    /// is an error.
    pub fn load(&self) -> Result<LoadedState, PersistenceError> {
        let unified = read_object(&self.state_path)?;
        let orchestration = unified
            .as_ref()
            .and_then(|doc| doc.get("metadata"))
            .and_then(|m| m.get("orchestration"))
            .and_then(Value::as_object);

        let (plan, plan_source) =
            self.load_section::<ExecutionPlan>(orchestration, PLAN_SECTION, &self.plan_mirror)?;
        let (index, index_source) =
            self.load_section::<SessionIndex>(orchestration, INDEX_SECTION, &self.index_mirror)?;

        tracing::debug!(
            plan_groups = plan.len(),
            sessions = index.entries.len(),
            ?plan_source,
            ?index_source,
            "Loaded coordination state"
        );
        Ok(LoadedState {
            plan,
            index,
            plan_source,
            index_source,
        })
    }

    fn load_section<T: DeserializeOwned + Default>(
        &self,
        orchestration: Option<&Map<String, Value>>,
        section: &'static str,
        mirror: &Path,
    ) -> Result<(T, StateSource), PersistenceError> {
        if let Some(value) = orchestration.and_then(|o| o.get(section)).filter(|v| !v.is_null()) {
            let parsed = decode(value.clone(), &self.state_path, section)?;
            return Ok((parsed, StateSource::Unified));
        }
        match read_object(mirror)? {
            Some(doc) => Ok((decode(Value::Object(doc), mirror, section)?, StateSource::Legacy)),
            None => Ok((T::default(), StateSource::Empty)),
        }
    }

    /// Persist plan and index. Requires the state lock.
    pub fn save(
        &self,
        _guard: &StateLockGuard,
        plan: &ExecutionPlan,
        index: &SessionIndex,
    ) -> Result<SaveReport, PersistenceError> {
        let plan_value = serde_json::to_value(plan).map_err(PersistenceError::Serialize)?;
        let index_value = serde_json::to_value(index).map_err(PersistenceError::Serialize)?;

        let mut doc = read_object(&self.state_path)?.unwrap_or_default();
        let mut metadata = take_object(&mut doc, "metadata");
        let mut orchestration = take_object(&mut metadata, "orchestration");
        orchestration.insert(PLAN_SECTION.to_string(), plan_value.clone());
        orchestration.insert(INDEX_SECTION.to_string(), index_value.clone());
        metadata.insert("orchestration".to_string(), Value::Object(orchestration));
        doc.insert("metadata".to_string(), Value::Object(metadata));

        let mut tx = Transaction::default();
        let mut report = SaveReport::default();

        if self.legacy_mirrors {
            for (path, value) in [(&self.plan_mirror, &plan_value), (&self.index_mirror, &index_value)] {
                match tx.stage(path).and_then(|()| atomic_write_json(path, value)) {
                    Ok(()) => report.mirrors_written.push(path.clone()),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to write legacy mirror");
                        report.mirrors_failed.push(path.clone());
                    }
                }
            }
        }

        let unified = tx
            .stage(&self.state_path)
            .and_then(|()| atomic_write_json(&self.state_path, &Value::Object(doc)));
        if let Err(e) = unified {
            tracing::error!(path = %self.state_path.display(), error = %e, "Failed to write state document, rolling back");
            tx.rollback();
            return Err(e);
        }

        tracing::debug!(
            path = %self.state_path.display(),
            digest = %crate::plan::plan_digest(plan),
            "Saved coordination state"
        );
        Ok(report)
    }
}

/// Artifacts touched by a save, with their backups.
#[derive(Default)]
struct Transaction {
    touched: Vec<(PathBuf, Option<PathBuf>)>,
}

impl Transaction {
    /// Back up `path` before it is modified.
    fn stage(&mut self, path: &Path) -> Result<(), PersistenceError> {
        let backup = if path.exists() {
            let backup = backup_path(path);
            std::fs::copy(path, &backup).map_err(|source| PersistenceError::Io {
                path: backup.clone(),
                source,
            })?;
            Some(backup)
        } else {
            None
        };
        self.touched.push((path.to_path_buf(), backup));
        Ok(())
    }

    /// Put every touched artifact back the way it was.
    fn rollback(&self) {
        for (path, backup) in self.touched.iter().rev() {
            let result = match backup {
                Some(backup) => std::fs::copy(backup, path).map(|_| ()),
                None => match std::fs::remove_file(path) {
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    other => other,
                },
            };
            if let Err(e) = result {
                tracing::error!(path = %path.display(), error = %e, "Failed to restore artifact");
            }
        }
    }
}

/// `<stem>.prev<suffix>` next to `path`.
pub fn backup_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let suffix = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    path.with_file_name(format!("{stem}.prev{suffix}"))
}

/// Write `value` as pretty JSON via temp file, fsync and rename.
pub fn atomic_write_json(path: &Path, value: &Value) -> Result<(), PersistenceError> {
    let io_err = |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    };
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(io_err)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp_state_")
        .suffix(".json")
        .tempfile_in(parent)
        .map_err(io_err)?;
    serde_json::to_writer_pretty(&mut tmp, value).map_err(PersistenceError::Serialize)?;
    tmp.write_all(b"\n").map_err(io_err)?;
    tmp.flush().map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

/// Read a JSON object. `Ok(None)` when the file does not exist.
fn read_object(path: &Path) -> Result<Option<Map<String, Value>>, PersistenceError> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(PersistenceError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    match serde_json::from_slice::<Value>(&raw) {
        Ok(Value::Object(map)) => Ok(Some(map)),
        Ok(_) => Err(PersistenceError::NotAnObject {
            path: path.to_path_buf(),
        }),
        Err(source) => Err(PersistenceError::Malformed {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn decode<T: DeserializeOwned>(
    value: Value,
    path: &Path,
    section: &'static str,
) -> Result<T, PersistenceError> {
    serde_json::from_value(value).map_err(|source| PersistenceError::InvalidSection {
        path: path.to_path_buf(),
        section,
        source,
    })
}

/// Remove `map[key]` as an object; a missing or non-object value yields an empty one.
fn take_object(map: &mut Map<String, Value>, key: &str) -> Map<String, Value> {
    match map.remove(key) {
        Some(Value::Object(inner)) => inner,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, LockConfig};
    use crate::state::lock::StateLock;
    use chrono::{TimeZone, Utc};
    use conductor_common::{ExecutionGroup, GroupStatus, SessionIndexEntry};
    use serde_json::json;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    fn make_store() -> (StateStore, Config, TempDir) {
        let dir = tempdir().unwrap();
        let config = Config::for_dirs(dir.path().join("state"), dir.path().join("tasks"));
        (StateStore::new(&config), config, dir)
    }

    fn lock_for(config: &Config) -> StateLock {
        StateLock::new(&config.state_path(), &LockConfig::default()).unwrap()
    }

    fn sample() -> (ExecutionPlan, SessionIndex) {
        let plan = ExecutionPlan::new(vec![
            ExecutionGroup::builder("g1", ["t1", "t2"])
                .status(GroupStatus::Running)
                .build()
                .unwrap(),
        ])
        .unwrap();
        let index = SessionIndex::new(vec![
            SessionIndexEntry::new("s1", "t1", Utc.timestamp_opt(1_700_000_000, 0).unwrap())
                .with_group("g1")
                .with_status("completed"),
        ]);
        (plan, index)
    }

    fn temp_files(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(".tmp_state_"))
            .collect()
    }

    #[test]
    fn test_load_missing_files_yields_defaults() {
        let (store, _config, _dir) = make_store();
        let loaded = store.load().unwrap();
        assert!(loaded.plan.is_empty());
        assert!(loaded.index.is_empty());
        assert_eq!(loaded.plan_source, StateSource::Empty);
    }

    #[test]
    fn test_save_then_load_round_trips() {
        let (store, config, _dir) = make_store();
        let (plan, index) = sample();
        let guard = lock_for(&config).acquire().unwrap();
        let report = store.save(&guard, &plan, &index).unwrap();
        assert_eq!(report.mirrors_written.len(), 2);

        let loaded = store.load().unwrap();
        assert_eq!(loaded.plan, plan);
        assert_eq!(loaded.index, index);
        assert_eq!(loaded.plan_source, StateSource::Unified);
        assert!(store.plan_mirror().exists());
        assert!(temp_files(&config.state_dir).is_empty());
    }

    #[test]
    fn test_save_preserves_foreign_keys() {
        let (store, config, _dir) = make_store();
        fs::create_dir_all(&config.state_dir).unwrap();
        fs::write(
            config.state_path(),
            json!({
                "current_task": {"name": "x"},
                "metadata": {"owner": "runtime", "orchestration": {"extra": 1}}
            })
            .to_string(),
        )
        .unwrap();

        let (plan, index) = sample();
        let guard = lock_for(&config).acquire().unwrap();
        store.save(&guard, &plan, &index).unwrap();

        let doc: Value = serde_json::from_slice(&fs::read(config.state_path()).unwrap()).unwrap();
        assert_eq!(doc["current_task"]["name"], "x");
        assert_eq!(doc["metadata"]["owner"], "runtime");
        assert_eq!(doc["metadata"]["orchestration"]["extra"], 1);
        assert_eq!(
            doc["metadata"]["orchestration"]["execution_plan"]["groups"][0]["group_id"],
            "g1"
        );
    }

    #[test]
    fn test_output_is_pretty_sorted_and_newline_terminated() {
        let (store, config, _dir) = make_store();
        let (plan, index) = sample();
        let guard = lock_for(&config).acquire().unwrap();
        store.save(&guard, &plan, &index).unwrap();

        let text = fs::read_to_string(store.plan_mirror()).unwrap();
        assert!(text.ends_with("}\n"));
        assert!(text.contains("\n  \"groups\""));
        let agent = text.find("\"agent_type\"").unwrap();
        let task_ids = text.find("\"task_ids\"").unwrap();
        assert!(agent < task_ids);
    }

    #[test]
    fn test_load_falls_back_to_legacy_mirror() {
        let (store, config, _dir) = make_store();
        fs::create_dir_all(&config.state_dir).unwrap();
        fs::write(
            store.plan_mirror(),
            json!({"groups": [{"group_id": "legacy", "task_ids": ["t9"]}]}).to_string(),
        )
        .unwrap();
        fs::write(config.state_path(), json!({"metadata": {}}).to_string()).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.plan_source, StateSource::Legacy);
        assert_eq!(loaded.plan.groups()[0].group_id(), "legacy");
        assert_eq!(loaded.index_source, StateSource::Empty);
    }

    #[test]
    fn test_unified_payload_wins_over_mirror() {
        let (store, config, _dir) = make_store();
        fs::create_dir_all(&config.state_dir).unwrap();
        fs::write(
            store.plan_mirror(),
            json!({"groups": [{"group_id": "legacy", "task_ids": []}]}).to_string(),
        )
        .unwrap();
        fs::write(
            config.state_path(),
            json!({"metadata": {"orchestration": {"execution_plan": {"groups": [{"group_id": "unified", "task_ids": []}]}}}})
                .to_string(),
        )
        .unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.plan.groups()[0].group_id(), "unified");
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        let (store, config, _dir) = make_store();
        fs::create_dir_all(&config.state_dir).unwrap();
        fs::write(config.state_path(), "{ not json").unwrap();
        assert!(matches!(
            store.load(),
            Err(PersistenceError::Malformed { .. })
        ));

        fs::write(config.state_path(), "[1, 2]").unwrap();
        assert!(matches!(
            store.load(),
            Err(PersistenceError::NotAnObject { .. })
        ));
    }

    #[test]
    fn test_invalid_plan_section_is_an_error() {
        let (store, config, _dir) = make_store();
        fs::create_dir_all(&config.state_dir).unwrap();
        fs::write(
            store.plan_mirror(),
            json!({"groups": [
                {"group_id": "g1", "task_ids": []},
                {"group_id": "g1", "task_ids": []}
            ]})
            .to_string(),
        )
        .unwrap();
        assert!(matches!(
            store.load(),
            Err(PersistenceError::InvalidSection {
                section: "execution_plan",
                ..
            })
        ));
    }

    #[test]
    fn test_failed_unified_write_restores_every_artifact() {
        let (store, config, _dir) = make_store();
        let (plan, index) = sample();
        let guard = lock_for(&config).acquire().unwrap();
        store.save(&guard, &plan, &index).unwrap();

        let before_plan = fs::read(store.plan_mirror()).unwrap();
        let before_state = fs::read(config.state_path()).unwrap();
        fs::remove_file(store.index_mirror()).unwrap();

        // A directory where the unified backup should go makes staging fail.
        let blocker = backup_path(&config.state_path());
        fs::remove_file(&blocker).ok();
        fs::create_dir(&blocker).unwrap();

        let next = ExecutionPlan::new(vec![ExecutionGroup::builder("g2", ["t3"]).build().unwrap()])
            .unwrap();
        assert!(store.save(&guard, &next, &index).is_err());

        assert_eq!(fs::read(store.plan_mirror()).unwrap(), before_plan);
        assert_eq!(fs::read(config.state_path()).unwrap(), before_state);
        assert!(!store.index_mirror().exists());
        assert!(temp_files(&config.state_dir).is_empty());
    }

    #[test]
    fn test_atomic_write_failure_leaves_target_untouched() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("occupied.json");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("keep"), "x").unwrap();

        assert!(atomic_write_json(&target, &json!({"a": 1})).is_err());
        assert!(target.is_dir());
        assert_eq!(fs::read_to_string(target.join("keep")).unwrap(), "x");
        assert!(temp_files(dir.path()).is_empty());
    }

    #[test]
    fn test_mirrors_can_be_disabled() {
        let (_, mut config, _dir) = make_store();
        config.persistence.legacy_mirrors = false;
        let store = StateStore::new(&config);
        let (plan, index) = sample();
        let guard = lock_for(&config).acquire().unwrap();
        let report = store.save(&guard, &plan, &index).unwrap();
        assert!(report.mirrors_written.is_empty());
        assert!(!store.plan_mirror().exists());
        assert!(config.state_path().exists());
    }

    #[test]
    fn test_backup_path() {
        assert_eq!(
            backup_path(Path::new("/s/execution_plan.json")),
            PathBuf::from("/s/execution_plan.prev.json")
        );
    }
}
