//! State directory initialization for `conductor init`.

use anyhow::Result;
use conductor::config::Config;
use conductor::coordinator::initialize_state;
use serde_json::json;

pub fn cmd_init(config: &Config, force: bool) -> Result<()> {
    let written = initialize_state(config, force)?;
    super::print_json(&json!({
        "status": "initialized",
        "state_dir": config.state_dir,
        "written": written,
    }))
}
