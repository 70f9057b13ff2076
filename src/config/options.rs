//! Run options - the knobs of `Research::run`

use super::Config;
use crate::experiment::ExecutorClass;
use crate::research::Devices;
use serde::{Deserialize, Serialize};

/// How branches of one task are executed inside a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorTarget {
    /// Branches run in parallel on an in-worker thread pool
    #[default]
    Threads,
    /// Branches run one after another
    For,
}

/// Workers or branches: either a count or one config per slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Slots {
    /// `n` slots with empty configs
    Count(usize),
    /// One supplementary config per slot
    Configs(Vec<Config>),
}

impl Slots {
    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Count(n) => *n,
            Self::Configs(configs) => configs.len(),
        }
    }

    /// Check if there are no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Expand into one config per slot.
    #[must_use]
    pub fn into_configs(self) -> Vec<Config> {
        match self {
            Self::Count(n) => vec![Config::new(); n],
            Self::Configs(configs) => configs,
        }
    }

    /// Keep only the first slot (sequential runs).
    #[must_use]
    pub fn first_only(self) -> Self {
        match self {
            Self::Count(_) => Self::Count(1),
            Self::Configs(configs) => Self::Configs(configs.into_iter().take(1).collect()),
        }
    }
}

impl Default for Slots {
    fn default() -> Self {
        Self::Count(1)
    }
}

impl From<usize> for Slots {
    fn from(n: usize) -> Self {
        Self::Count(n)
    }
}

impl From<Vec<Config>> for Slots {
    fn from(configs: Vec<Config>) -> Self {
        Self::Configs(configs)
    }
}

/// Options for one research run.
///
/// Serialized to `description/run.json` when results are dumped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    /// Override of the research name (and folder)
    pub name: Option<String>,
    /// Parallel workers
    pub workers: Slots,
    /// Branches sharing one task
    pub branches: Slots,
    /// Iterations per experiment; `None` runs until exhaustion
    pub n_iters: Option<usize>,
    /// Devices split across the worker × branch grid
    pub devices: Devices,
    /// Persist results, configs and the monitor log
    pub dump_results: bool,
    /// Use several workers (otherwise collapses to one)
    pub parallel: bool,
    /// Branch execution strategy
    pub executor_target: ExecutorTarget,
    /// Factory of the executor run for every task
    #[serde(skip)]
    pub executor_class: ExecutorClass,
    /// `tracing` filter directive, e.g. `"debug"` or `"research_engine=info"`
    pub loglevel: String,
    /// Extra environment snapshot commands: file name → shell command
    pub env_commands: Vec<(String, String)>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            name: None,
            workers: Slots::Count(1),
            branches: Slots::Count(1),
            n_iters: None,
            devices: Devices::None,
            dump_results: true,
            parallel: true,
            executor_target: ExecutorTarget::Threads,
            executor_class: ExecutorClass::default(),
            loglevel: "debug".to_string(),
            env_commands: Vec::new(),
        }
    }
}

impl RunOptions {
    /// Create options with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set research name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set workers.
    #[must_use]
    pub fn workers(mut self, workers: impl Into<Slots>) -> Self {
        self.workers = workers.into();
        self
    }

    /// Set branches.
    #[must_use]
    pub fn branches(mut self, branches: impl Into<Slots>) -> Self {
        self.branches = branches.into();
        self
    }

    /// Set iterations per experiment.
    #[must_use]
    pub const fn n_iters(mut self, n_iters: Option<usize>) -> Self {
        self.n_iters = n_iters;
        self
    }

    /// Set devices.
    #[must_use]
    pub fn devices(mut self, devices: Devices) -> Self {
        self.devices = devices;
        self
    }

    /// Enable or disable dumping.
    #[must_use]
    pub const fn dump_results(mut self, dump: bool) -> Self {
        self.dump_results = dump;
        self
    }

    /// Enable or disable parallel workers.
    #[must_use]
    pub const fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Set branch execution strategy.
    #[must_use]
    pub const fn executor_target(mut self, target: ExecutorTarget) -> Self {
        self.executor_target = target;
        self
    }

    /// Set the executor factory.
    #[must_use]
    pub fn executor_class(mut self, class: ExecutorClass) -> Self {
        self.executor_class = class;
        self
    }

    /// Set log filter.
    #[must_use]
    pub fn loglevel(mut self, loglevel: impl Into<String>) -> Self {
        self.loglevel = loglevel.into();
        self
    }

    /// Add an environment snapshot command saved as `env/<file>.txt`.
    #[must_use]
    pub fn env_command(mut self, file: impl Into<String>, command: impl Into<String>) -> Self {
        self.env_commands.push((file.into(), command.into()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_expansion() {
        assert_eq!(Slots::Count(3).into_configs().len(), 3);
        let configs = vec![Config::new().with("a", 1), Config::new().with("a", 2)];
        let slots = Slots::from(configs.clone());
        assert_eq!(slots.len(), 2);
        assert_eq!(slots.clone().first_only().into_configs(), configs[..1].to_vec());
        assert_eq!(Slots::Count(4).first_only(), Slots::Count(1));
    }

    #[test]
    fn test_run_options_builder() {
        let options = RunOptions::new()
            .workers(2)
            .branches(3)
            .n_iters(Some(5))
            .dump_results(false)
            .executor_target(ExecutorTarget::For)
            .loglevel("info");

        assert_eq!(options.workers.len(), 2);
        assert_eq!(options.branches.len(), 3);
        assert_eq!(options.n_iters, Some(5));
        assert!(!options.dump_results);
        assert_eq!(options.executor_target, ExecutorTarget::For);
        assert_eq!(options.executor_class.name(), "Executor");

        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["executor_target"], "for");
        assert!(json.get("executor_class").is_none());
    }
}
