//! Next-wave preview for `conductor plan`.

use anyhow::Result;
use conductor::config::Config;
use conductor::coordinator::preview_next_plan;
use conductor::plan::plan_digest;
use conductor::tasks::FrontmatterTaskSource;
use serde_json::json;

pub fn cmd_plan(config: &Config, stage: u32) -> Result<()> {
    let tasks = FrontmatterTaskSource::new(&config.tasks_dir);
    let outcome = preview_next_plan(config, &tasks, stage)?;

    print_outcome(stage, &outcome)
}

fn print_outcome(stage: u32, outcome: &conductor::plan::PlanOutcome) -> Result<()> {
    let digest = outcome.plan.as_ref().map(plan_digest);
    super::print_json(&json!({
        "target_stage": stage,
        "exhausted": outcome.is_exhausted(),
        "reused": outcome.reused,
        "digest": digest,
        "plan": outcome.plan,
        "dependencies": outcome.dependencies,
        "blocked": outcome.blocked,
    }))
}
