//! Experiment instance - one (task, branch) execution of an experiment

use super::unit::{UnitContext, UnitIter, UnitKind};
use super::{Experiment, ExperimentResults};
use crate::config::Config;
use chrono::{DateTime, Utc};
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Status of an experiment instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperimentStatus {
    /// Created, no iteration executed yet.
    Pending,
    /// Executing iterations.
    Running,
    /// Ran all planned iterations.
    Finished,
    /// A generator unit was exhausted.
    Exhausted,
    /// A unit failed; see [`ExperimentInstance::exception`].
    Failed,
}

impl ExperimentStatus {
    /// No further iterations will run.
    #[must_use]
    pub const fn is_done(self) -> bool {
        matches!(self, Self::Finished | Self::Exhausted | Self::Failed)
    }
}

/// Kind of a unit failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionKind {
    /// The unit returned an error
    Error,
    /// The unit panicked
    Panic,
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => f.write_str("Error"),
            Self::Panic => f.write_str("Panic"),
        }
    }
}

/// Portable description of a unit failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    /// Failure kind
    pub kind: ExceptionKind,
    /// Rendered error or panic payload
    pub message: String,
}

impl fmt::Display for ExceptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl ExceptionInfo {
    pub(crate) fn from_error(error: &anyhow::Error) -> Self {
        Self {
            kind: ExceptionKind::Error,
            message: format!("{error:#}"),
        }
    }

    pub(crate) fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        Self {
            kind: ExceptionKind::Panic,
            message,
        }
    }
}

/// Outcome of executing one unit.
pub(crate) enum UnitOutcome {
    Value(Value),
    Exhausted,
    Failed(ExceptionInfo),
}

fn new_experiment_id(config: &Config, task_id: usize, branch: usize) -> String {
    let mut hasher = FxHasher::default();
    config.alias_string().hash(&mut hasher);
    task_id.hash(&mut hasher);
    branch.hash(&mut hasher);
    ID_COUNTER.fetch_add(1, Ordering::Relaxed).hash(&mut hasher);
    Utc::now().timestamp_nanos_opt().unwrap_or_default().hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// One running experiment: config, iteration counter, results, failure.
pub struct ExperimentInstance {
    id: String,
    task_id: usize,
    branch: usize,
    config: Config,
    iteration: usize,
    status: ExperimentStatus,
    results: ExperimentResults,
    exception: Option<ExceptionInfo>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    generators: HashMap<String, UnitIter>,
    last_outputs: BTreeMap<String, Value>,
    pending: ExperimentResults,
}

impl fmt::Debug for ExperimentInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExperimentInstance")
            .field("id", &self.id)
            .field("task_id", &self.task_id)
            .field("branch", &self.branch)
            .field("iteration", &self.iteration)
            .field("status", &self.status)
            .field("exception", &self.exception)
            .finish_non_exhaustive()
    }
}

impl ExperimentInstance {
    /// Create a pending instance with a fresh id.
    #[must_use]
    pub fn new(config: Config, task_id: usize, branch: usize) -> Self {
        Self {
            id: new_experiment_id(&config, task_id, branch),
            task_id,
            branch,
            config,
            iteration: 0,
            status: ExperimentStatus::Pending,
            results: ExperimentResults::new(),
            exception: None,
            started_at: None,
            ended_at: None,
            generators: HashMap::new(),
            last_outputs: BTreeMap::new(),
            pending: ExperimentResults::new(),
        }
    }

    /// Instance running the shared (root) units of a task.
    pub(crate) fn root(config: Config, task_id: usize) -> Self {
        Self {
            id: "root".to_string(),
            ..Self::new(config, task_id, 0)
        }
    }

    /// Experiment id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Task this instance belongs to.
    #[must_use]
    pub const fn task_id(&self) -> usize {
        self.task_id
    }

    /// Branch index inside the task.
    #[must_use]
    pub const fn branch(&self) -> usize {
        self.branch
    }

    /// Merged configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Current (or last executed) iteration.
    #[must_use]
    pub const fn iteration(&self) -> usize {
        self.iteration
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> ExperimentStatus {
        self.status
    }

    /// Saved results: name → iteration → value.
    #[must_use]
    pub const fn results(&self) -> &ExperimentResults {
        &self.results
    }

    /// Failure, if a unit failed.
    #[must_use]
    pub const fn exception(&self) -> Option<&ExceptionInfo> {
        self.exception.as_ref()
    }

    /// Start timestamp.
    #[must_use]
    pub const fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// End timestamp.
    #[must_use]
    pub const fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub(crate) fn start(&mut self) {
        self.status = ExperimentStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn complete(&mut self, status: ExperimentStatus) {
        self.status = status;
        self.ended_at = Some(Utc::now());
    }

    pub(crate) fn fail(&mut self, exception: ExceptionInfo) {
        self.exception = Some(exception);
        self.complete(ExperimentStatus::Failed);
    }

    pub(crate) fn set_iteration(&mut self, iteration: usize) {
        self.iteration = iteration;
    }

    /// Execute one non-root unit, catching errors and panics.
    pub(crate) fn execute(
        &mut self,
        kind: &UnitKind,
        name: &str,
        outputs: &BTreeMap<String, Value>,
    ) -> UnitOutcome {
        let ctx = UnitContext::new(&self.id, &self.config, self.iteration, outputs);
        let generators = &mut self.generators;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match kind {
            UnitKind::Callable(f) => f(&ctx).map(Some),
            UnitKind::Generator(factory) => {
                if !generators.contains_key(name) {
                    generators.insert(name.to_string(), factory(&ctx)?);
                }
                match generators.get_mut(name).and_then(Iterator::next) {
                    Some(value) => value.map(Some),
                    None => Ok(None),
                }
            }
        }));
        match outcome {
            Ok(Ok(Some(value))) => UnitOutcome::Value(value),
            Ok(Ok(None)) => UnitOutcome::Exhausted,
            Ok(Err(error)) => UnitOutcome::Failed(ExceptionInfo::from_error(&error)),
            Err(payload) => UnitOutcome::Failed(ExceptionInfo::from_panic(payload.as_ref())),
        }
    }

    fn record(&mut self, save_to: &str, iteration: usize, value: Value) {
        self.results
            .entry(save_to.to_string())
            .or_default()
            .insert(iteration, value.clone());
        self.pending
            .entry(save_to.to_string())
            .or_default()
            .insert(iteration, value);
    }

    /// Apply the experiment's saves for this iteration; returns the values saved.
    pub(crate) fn save_outputs(
        &mut self,
        experiment: &Experiment,
        outputs: &BTreeMap<String, Value>,
        n_iters: Option<usize>,
    ) -> ExperimentResults {
        let iteration = self.iteration;
        let mut saved = ExperimentResults::new();
        for save in experiment.saves() {
            if !save.when.matches(iteration, n_iters) {
                continue;
            }
            if let Some(value) = outputs.get(&save.unit) {
                self.record(&save.save_to, iteration, value.clone());
                saved
                    .entry(save.save_to.clone())
                    .or_default()
                    .insert(iteration, value.clone());
            }
        }
        for (name, value) in outputs {
            self.last_outputs.insert(name.clone(), value.clone());
        }
        saved
    }

    /// On exhaustion, record `Last` saves from the latest outputs at the stop iteration.
    pub(crate) fn save_last_outputs(&mut self, experiment: &Experiment) -> bool {
        let iteration = self.iteration;
        let mut saved = false;
        for save in experiment.saves() {
            if save.when != super::Schedule::Last {
                continue;
            }
            if let Some(value) = self.last_outputs.get(&save.unit).cloned() {
                self.record(&save.save_to, iteration, value);
                saved = true;
            }
        }
        saved
    }

    /// Take results not yet written to a checkpoint.
    pub(crate) fn take_pending(&mut self) -> ExperimentResults {
        std::mem::take(&mut self.pending)
    }
}
