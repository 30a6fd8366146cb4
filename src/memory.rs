//! Episode sink for an external memory service.
//!
//! Every recorded completion can be forwarded as an "episode" to a command
//! that receives `{"operation": "store", "data": {"episode": ...}}` on stdin.
//! Stores run on background tokio tasks; [`EpisodeSink::drain`] waits for them
//! with a bound before the process exits. Sink failures are logged and never
//! change the coordination result.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value, json};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::MemoryConfig;
use crate::coordinator::CompletionOutcome;

const REDACTED: &str = "[REDACTED]";
const SECRET_KEY_MARKERS: &[&str] = &["key", "token", "secret", "password"];

static INLINE_API_KEY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"sk-[A-Za-z0-9]{8,}").unwrap());

static INLINE_ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(api[_-]?key|token|password)\s*[:=]\s*\S+").unwrap()
});

#[async_trait]
pub trait EpisodeSink: Send + Sync {
    /// Queue an episode. Returns false when nothing was queued.
    async fn store_episode(&self, episode: Value) -> bool;

    /// Wait up to `timeout` for queued stores to finish.
    async fn drain(&self, timeout: Duration);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

#[async_trait]
impl EpisodeSink for NoopSink {
    async fn store_episode(&self, _episode: Value) -> bool {
        false
    }

    async fn drain(&self, _timeout: Duration) {}
}

/// Pipes episodes to an external command.
#[derive(Debug)]
pub struct CommandSink {
    command: Vec<String>,
    store_timeout: Duration,
    sanitize_secrets: bool,
    pending: Mutex<Vec<JoinHandle<()>>>,
    stored: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
}

impl CommandSink {
    pub fn new(command: Vec<String>, store_timeout: Duration, sanitize_secrets: bool) -> Self {
        Self {
            command,
            store_timeout,
            sanitize_secrets,
            pending: Mutex::new(Vec::new()),
            stored: Arc::new(AtomicUsize::new(0)),
            failed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Whether the configured program looks runnable.
    pub fn is_available(&self) -> bool {
        match self.command.first() {
            None => false,
            Some(program) if program.contains('/') => Path::new(program).exists(),
            Some(program) => !program.trim().is_empty(),
        }
    }

    /// Stores that finished successfully so far.
    pub fn stored(&self) -> usize {
        self.stored.load(Ordering::SeqCst)
    }

    /// Stores that failed or timed out so far.
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EpisodeSink for CommandSink {
    async fn store_episode(&self, episode: Value) -> bool {
        if !self.is_available() || episode.as_object().is_none_or(Map::is_empty) {
            return false;
        }
        let mut data = json!({ "episode": episode });
        if self.sanitize_secrets {
            data = sanitize(data);
        }
        let payload = json!({ "operation": "store", "data": data });

        let command = self.command.clone();
        let store_timeout = self.store_timeout;
        let stored = Arc::clone(&self.stored);
        let failed = Arc::clone(&self.failed);
        let handle = tokio::spawn(async move {
            match run_store(&command, &payload, store_timeout).await {
                Ok(()) => {
                    stored.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    failed.fetch_add(1, Ordering::SeqCst);
                    tracing::warn!(error = %e, "Episode store failed");
                }
            }
        });
        self.pending.lock().await.push(handle);
        true
    }

    async fn drain(&self, timeout: Duration) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.pending.lock().await);
        if handles.is_empty() {
            return;
        }
        let count = handles.len();
        if tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_err()
        {
            tracing::warn!(pending = count, "Episode stores still running at shutdown");
        }
    }
}

async fn run_store(command: &[String], payload: &Value, store_timeout: Duration) -> Result<()> {
    let Some((program, args)) = command.split_first() else {
        bail!("No memory command configured");
    };
    let body = serde_json::to_vec(payload).context("Failed to serialize episode payload")?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn memory command: {}", program))?;

    let stdin = child.stdin.take();
    let exchange = async move {
        if let Some(mut stdin) = stdin {
            stdin
                .write_all(&body)
                .await
                .context("Failed to write episode to memory command")?;
        }
        child
            .wait_with_output()
            .await
            .context("Failed to wait for memory command")
    };

    // The bound covers the stdin write; a command that never reads would block it.
    let output = tokio::time::timeout(store_timeout, exchange)
        .await
        .with_context(|| format!("Memory command timed out after {:?}", store_timeout))??;
    if !output.status.success() {
        bail!(
            "Memory command exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Redact secret-looking keys and inline credentials.
pub fn sanitize(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    let lowered = key.to_lowercase();
                    if SECRET_KEY_MARKERS.iter().any(|m| lowered.contains(m)) {
                        (key, Value::String(REDACTED.to_string()))
                    } else {
                        (key, sanitize(value))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize).collect()),
        Value::String(text) => {
            let masked = INLINE_API_KEY.replace_all(&text, REDACTED);
            let masked = INLINE_ASSIGNMENT.replace_all(&masked, "$1: [REDACTED]");
            Value::String(masked.into_owned())
        }
        other => other,
    }
}

/// Episode describing one recorded completion.
pub fn completion_episode(outcome: &CompletionOutcome, memory_group: Option<&str>) -> Value {
    let mut episode = json!({
        "kind": "session_completion",
        "recorded_at": chrono::Utc::now().to_rfc3339(),
        "session_id": outcome.session_id,
        "task_id": outcome.task_id,
        "group_id": outcome.group_id,
        "exit_status": outcome.exit_status,
        "signal": outcome.signal,
        "completed_groups": outcome.completed_groups,
    });
    if let (Some(group), Some(map)) = (memory_group, episode.as_object_mut()) {
        map.insert("memory_group".to_string(), Value::String(group.to_string()));
    }
    episode
}

/// Build the sink described by `config`.
pub fn sink_from_config(config: &MemoryConfig) -> Box<dyn EpisodeSink> {
    if !config.enabled {
        return Box::new(NoopSink);
    }
    let sink = CommandSink::new(
        config.command.clone(),
        config.store_timeout(),
        config.sanitize_secrets,
    );
    if !sink.is_available() {
        tracing::warn!(command = ?config.command, "Memory command unavailable; episodes disabled");
        return Box::new(NoopSink);
    }
    Box::new(sink)
}
