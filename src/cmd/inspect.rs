//! Raw state dump for `conductor inspect`.
//!
//! Reads without taking the lock, so the output may be stale while a
//! completion is being recorded.

use anyhow::Result;
use conductor::config::Config;
use conductor::state::{StateLock, StateStore, lock::read_info};
use serde_json::json;

pub fn cmd_inspect(config: &Config) -> Result<()> {
    let store = StateStore::new(config);
    let state = store.load()?;

    let lock = StateLock::new(store.state_path(), &config.lock)?;
    let holder = if lock.lock_dir().exists() {
        read_info(lock.lock_dir()).ok().flatten()
    } else {
        None
    };

    super::print_json(&json!({
        "state_path": store.state_path(),
        "plan_source": state.plan_source,
        "index_source": state.index_source,
        "execution_plan": state.plan,
        "session_index": state.index,
        "lock": {
            "path": lock.lock_dir(),
            "held": lock.lock_dir().exists(),
            "holder": holder,
        },
    }))
}
