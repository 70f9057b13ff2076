//! Run-scoped logging
//!
//! Each research run builds its own [`Dispatch`] and installs it on the
//! driving thread, every worker thread and the monitor listener. Nothing is
//! installed globally, so several runs in one process log independently.
//!
//! ```text
//! dump_results = true   ->  <root>/research.log (appended, no ANSI)
//! dump_results = false  ->  stderr
//! ```

use crate::{Error, Result};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing::Dispatch;
use tracing_subscriber::EnvFilter;

/// Build the dispatch for one run.
///
/// `level` is an `EnvFilter` directive such as `"info"` or
/// `"research_engine=debug"`.
///
/// # Errors
/// Returns `InvalidConfig` for an unparsable level, or an IO error if the
/// log file cannot be opened
pub fn create_logger(path: Option<&Path>, level: &str) -> Result<Dispatch> {
    let filter = EnvFilter::try_new(level)
        .map_err(|e| Error::InvalidConfig(format!("invalid log level '{level}': {e}")))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(false);

    let dispatch = match path {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Dispatch::new(builder.with_ansi(false).with_writer(Mutex::new(file)).finish())
        }
        None => Dispatch::new(builder.with_writer(std::io::stderr).finish()),
    };
    Ok(dispatch)
}
