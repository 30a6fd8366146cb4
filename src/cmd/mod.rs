//! CLI command implementations.
//!
//! Each submodule owns one `Commands` variant:
//!
//! | Module     | Commands handled |
//! |------------|------------------|
//! | `complete` | `Complete`       |
//! | `plan`     | `Plan`           |
//! | `status`   | `Status`         |
//! | `inspect`  | `Inspect`        |
//! | `init`     | `Init`           |
//! | `config`   | `Config`         |
//!
//! Machine-facing commands print a single JSON document on stdout.

pub mod complete;
pub mod config;
pub mod init;
pub mod inspect;
pub mod plan;
pub mod status;

pub use complete::cmd_complete;
pub use config::cmd_config;
pub use init::cmd_init;
pub use inspect::cmd_inspect;
pub use plan::cmd_plan;
pub use status::cmd_status;

use anyhow::{Context, Result};
use serde::Serialize;

/// Print `value` as pretty JSON on stdout.
pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", rendered);
    Ok(())
}
