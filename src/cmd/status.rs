//! Group status evaluation for `conductor status <group>`.

use anyhow::Result;
use conductor::config::Config;
use conductor::coordinator::evaluate_group;

pub fn cmd_status(config: &Config, group_id: &str) -> Result<()> {
    let summary = evaluate_group(config, group_id)?;
    super::print_json(&summary)
}
