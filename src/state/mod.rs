//! Shared coordination state: the cross-process lock and atomic persistence.
//!
//! Every mutation follows the same shape:
//!
//! ```no_run
//! use conductor::config::Config;
//! use conductor::state::{StateLock, StateStore};
//!
//! # fn example(config: &Config) -> anyhow::Result<()> {
//! let lock = StateLock::new(&config.state_path(), &config.lock)?;
//! let mut guard = lock.acquire()?;
//! let store = StateStore::new(config);
//! let mut state = store.load()?;
//! // ... mutate state.plan / state.index ...
//! store.save(&guard, &state.plan, &state.index)?;
//! guard.release()?;
//! # Ok(())
//! # }
//! ```

pub mod lock;
pub mod persistence;

pub use lock::{LockInfo, StateLock, StateLockGuard};
pub use persistence::{LoadedState, SaveReport, StateSource, StateStore, atomic_write_json};
