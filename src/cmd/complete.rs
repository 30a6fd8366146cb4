//! Session completion entrypoint for `conductor complete`.

use anyhow::{Context, Result};
use conductor::config::Config;
use conductor::coordinator::{CompletionSignal, handle_completion};
use conductor::memory::{completion_episode, sink_from_config};
use conductor::plan::plan_digest;
use conductor::tasks::FrontmatterTaskSource;

pub async fn cmd_complete(config: Config, signal: CompletionSignal) -> Result<()> {
    let sink = sink_from_config(&config.memory);
    let memory_group = config.memory.group_id.clone();
    let drain_timeout = config.memory.store_timeout();

    let outcome = tokio::task::spawn_blocking(move || {
        let tasks = FrontmatterTaskSource::new(&config.tasks_dir);
        handle_completion(&config, &tasks, &signal)
    })
    .await
    .context("Completion worker panicked")??;

    tracing::debug!(digest = %plan_digest(&outcome.plan), "Persisted plan");
    super::print_json(&outcome)?;

    sink.store_episode(completion_episode(&outcome, memory_group.as_deref()))
        .await;
    sink.drain(drain_timeout).await;
    Ok(())
}
