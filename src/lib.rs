//! # Research Engine: parallel orchestration of parameterized experiments
//!
//! A [`research::Research`] draws configurations from an adaptive
//! [`domain::Domain`], groups them into tasks, and runs each task's
//! [`experiment::Experiment`] on a pool of worker threads. Lifecycle signals
//! go to a dedicated monitor thread; results land in a shared, queryable
//! store that exports to Arrow and Parquet.
//!
//! ## Architecture
//!
//! ```text
//! Domain ──> DynamicQueue ──> Distributor ──> Executor (branches)
//!   ^                                           │        │
//!   └──── update(finished, results) ────────────┤        └──> ResearchMonitor ──> monitor.csv
//!                                               └──> ResearchResults ──> RecordBatch / Parquet
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use research_engine::config::{ExecutorTarget, RunOptions};
//! use research_engine::domain::{Domain, Opt};
//! use research_engine::experiment::{Experiment, Schedule};
//! use research_engine::research::Research;
//! use serde_json::json;
//!
//! let experiment = Experiment::new()
//!     .add_callable("square", |ctx| Ok(json!(ctx.param::<i64>("x")?.pow(2))))
//!     .save("square", "square", Schedule::Always);
//!
//! let mut research = Research::new("example", Domain::grid(vec![Opt::new("x", [1, 2, 3])]), experiment);
//! research.run(
//!     RunOptions::new()
//!         .workers(2)
//!         .n_iters(Some(1))
//!         .executor_target(ExecutorTarget::For)
//!         .dump_results(false)
//!         .loglevel("warn"),
//! )?;
//!
//! let df = research.results().unwrap().to_df(false, true)?;
//! assert_eq!(df.num_rows(), 3);
//! # Ok::<(), research_engine::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
pub mod domain;
pub mod error;
pub mod experiment;
pub mod logging;
pub mod research;

pub use error::{Error, Result};
