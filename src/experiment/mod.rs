//! Experiments and their executor
//!
//! An [`Experiment`] is an ordered list of named [`Unit`]s plus a list of
//! saves (which unit output lands in which result series, on which
//! iterations). An [`Executor`] runs one experiment for every branch
//! configuration of a task.
//!
//! ```text
//! Executor (task)
//!   ├── root units (once per iteration, shared)
//!   ├──< ExperimentInstance (branch 0): units → saves → results[name][it]
//!   └──< ExperimentInstance (branch 1): ...
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use research_engine::config::{Config, ExecutorTarget};
//! use research_engine::experiment::{Executor, ExecutorParams, Experiment, Schedule};
//! use research_engine::research::{ResearchMonitor, ResearchResults};
//! use serde_json::json;
//!
//! let experiment = Experiment::new()
//!     .add_callable("sum", |ctx| Ok(json!((0..ctx.param::<u64>("x")?).sum::<u64>())))
//!     .save("sum", "sum", Schedule::Always);
//!
//! let params = ExecutorParams::new()
//!     .configs(vec![Config::new().with("x", 10)])
//!     .n_iters(Some(1))
//!     .target(ExecutorTarget::For);
//!
//! let monitor = ResearchMonitor::new(None);
//! let results = ResearchResults::new("doc", false);
//! let mut executor = Executor::new(experiment.into(), params);
//! executor.run(&monitor, &results);
//!
//! assert_eq!(executor.experiments()[0].results()["sum"][&0], json!(45));
//! ```

mod executor;
mod instance;
mod unit;

pub use executor::{Executor, ExecutorClass, ExecutorParams, TaskExecutor, WorkerInfo};
pub use instance::{ExceptionInfo, ExceptionKind, ExperimentInstance, ExperimentStatus};
pub use unit::{CallableFn, GeneratorFactory, Schedule, Unit, UnitContext, UnitIter};

use serde_json::Value;
use std::collections::BTreeMap;

/// Iteration → value.
pub type Series = BTreeMap<usize, Value>;

/// Result series of one experiment: name → iteration → value.
pub type ExperimentResults = BTreeMap<String, Series>;

/// Which unit output is stored under which name, and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Save {
    /// Unit whose output is saved
    pub unit: String,
    /// Result series name
    pub save_to: String,
    /// Iterations to save on
    pub when: Schedule,
}

/// Description of an experiment: units, saves and checkpoint cadence.
#[derive(Debug, Clone, Default)]
pub struct Experiment {
    units: Vec<Unit>,
    saves: Vec<Save>,
    dump_each: Option<usize>,
}

impl Experiment {
    /// Create an empty experiment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a unit.
    #[must_use]
    pub fn add_unit(mut self, unit: Unit) -> Self {
        self.units.push(unit);
        self
    }

    /// Append a callable unit running every iteration.
    #[must_use]
    pub fn add_callable<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&UnitContext<'_>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.add_unit(Unit::callable(name, f))
    }

    /// Append a generator unit advanced every iteration.
    #[must_use]
    pub fn add_generator<F>(self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&UnitContext<'_>) -> anyhow::Result<UnitIter> + Send + Sync + 'static,
    {
        self.add_unit(Unit::generator(name, factory))
    }

    /// Save the output of `unit` into the series `save_to`.
    #[must_use]
    pub fn save(mut self, unit: impl Into<String>, save_to: impl Into<String>, when: Schedule) -> Self {
        self.saves.push(Save {
            unit: unit.into(),
            save_to: save_to.into(),
            when,
        });
        self
    }

    /// Write a results checkpoint every `n` iterations (when dumping).
    #[must_use]
    pub const fn dump_each(mut self, n: usize) -> Self {
        self.dump_each = Some(n);
        self
    }

    /// Units in execution order.
    #[must_use]
    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    /// Registered saves.
    #[must_use]
    pub fn saves(&self) -> &[Save] {
        &self.saves
    }

    /// Checkpoint cadence.
    #[must_use]
    pub const fn checkpoint_each(&self) -> Option<usize> {
        self.dump_each
    }

    /// Names of all units, root units first.
    #[must_use]
    pub fn unit_names(&self) -> Vec<&str> {
        let (root, rest): (Vec<&Unit>, Vec<&Unit>) = self.units.iter().partition(|u| u.is_root());
        root.into_iter().chain(rest).map(Unit::name).collect()
    }
}
