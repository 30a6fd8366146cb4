//! Markdown task files with YAML frontmatter.
//!
//! Every `*.md` file under the tasks directory is a task, except files whose
//! name starts with `TEMPLATE`. The frontmatter must carry an `id`; files
//! without one, or with frontmatter that does not parse, are skipped.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::{TaskRecord, TaskSnapshot, TaskSource, TaskStatus};

/// Reads task snapshots from a backlog directory.
#[derive(Debug, Clone)]
pub struct FrontmatterTaskSource {
    root: PathBuf,
}

impl FrontmatterTaskSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn task_files(&self) -> Vec<PathBuf> {
        WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable task directory entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                let name = entry.file_name().to_string_lossy();
                name.ends_with(".md") && !name.starts_with("TEMPLATE")
            })
            .map(|entry| entry.into_path())
            .collect()
    }
}

impl TaskSource for FrontmatterTaskSource {
    fn load_snapshot(&self) -> Result<TaskSnapshot> {
        if !self.root.exists() {
            tracing::debug!(root = %self.root.display(), "Tasks directory does not exist");
            return Ok(TaskSnapshot::default());
        }

        let mut records = Vec::new();
        for path in self.task_files() {
            match read_task_file(&path) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {
                    tracing::debug!(path = %path.display(), "Skipping file without a task id");
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable task file");
                }
            }
        }
        tracing::debug!(root = %self.root.display(), count = records.len(), "Loaded task snapshot");
        Ok(TaskSnapshot::new(records))
    }
}

/// Read one task file. Returns `Ok(None)` when it has no frontmatter or no id.
pub fn read_task_file(path: &Path) -> Result<Option<TaskRecord>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read task file: {}", path.display()))?;
    let Some(metadata) = parse_frontmatter(&content)
        .with_context(|| format!("Invalid frontmatter in {}", path.display()))?
    else {
        return Ok(None);
    };

    let id = match metadata.get("id") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Ok(None),
    };

    let status = match metadata.get("status").and_then(Value::as_str) {
        Some(raw) => TaskStatus::parse(raw).unwrap_or_else(|| {
            tracing::warn!(task_id = %id, status = raw, "Unrecognized task status, treating as pending");
            TaskStatus::Pending
        }),
        None => TaskStatus::Pending,
    };

    Ok(Some(TaskRecord {
        id,
        status,
        path: Some(path.to_path_buf()),
        metadata,
    }))
}

/// Extract the leading `---` delimited YAML block as a JSON object.
pub fn parse_frontmatter(content: &str) -> Result<Option<Map<String, Value>>> {
    let mut lines = content.lines();
    if lines.next().map(str::trim_end) != Some("---") {
        return Ok(None);
    }

    let mut yaml = String::new();
    let mut closed = false;
    for line in lines {
        if line.trim_end() == "---" {
            closed = true;
            break;
        }
        yaml.push_str(line);
        yaml.push('\n');
    }
    if !closed {
        anyhow::bail!("Frontmatter block is not terminated");
    }
    if yaml.trim().is_empty() {
        return Ok(Some(Map::new()));
    }

    match serde_yaml::from_str::<Value>(&yaml).context("Failed to parse YAML frontmatter")? {
        Value::Object(map) => Ok(Some(map)),
        Value::Null => Ok(Some(Map::new())),
        _ => anyhow::bail!("Frontmatter must be a mapping"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const TASK: &str = "---\nid: task-001\ntitle: Build the thing\nstatus: In Progress\norchestration:\n  bootstrap_stage: 1\n  parallel_group: 1\n---\n\n# Body\n";

    #[test]
    fn test_parse_frontmatter() {
        let map = parse_frontmatter(TASK).unwrap().unwrap();
        assert_eq!(map["id"], "task-001");
        assert_eq!(map["orchestration"]["parallel_group"], 1);
    }

    #[test]
    fn test_no_frontmatter() {
        assert!(parse_frontmatter("# Just a heading\n").unwrap().is_none());
    }

    #[test]
    fn test_unterminated_frontmatter_is_error() {
        assert!(parse_frontmatter("---\nid: x\n").is_err());
    }

    #[test]
    fn test_load_snapshot_skips_templates_and_invalid_files() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("stage-1");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("task-001.md"), TASK).unwrap();
        fs::write(dir.path().join("TEMPLATE-task.md"), TASK.replace("task-001", "tmpl")).unwrap();
        fs::write(dir.path().join("notes.md"), "no frontmatter").unwrap();
        fs::write(dir.path().join("broken.md"), "---\nid: [unclosed\n---\n").unwrap();
        fs::write(dir.path().join("task-002.txt"), TASK.replace("task-001", "task-002")).unwrap();

        let snapshot = FrontmatterTaskSource::new(dir.path()).load_snapshot().unwrap();
        assert_eq!(snapshot.len(), 1);
        let task = snapshot.get("task-001").unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert!(task.path.as_ref().unwrap().ends_with("stage-1/task-001.md"));
    }

    #[test]
    fn test_missing_directory_yields_empty_snapshot() {
        let dir = tempdir().unwrap();
        let source = FrontmatterTaskSource::new(dir.path().join("absent"));
        assert!(source.load_snapshot().unwrap().is_empty());
    }
}
