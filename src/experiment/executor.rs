//! Executor - runs one experiment for every branch of a task

use super::instance::{ExperimentInstance, ExperimentStatus, UnitOutcome};
use super::{Experiment, Unit};
use crate::config::{Config, ExecutorTarget};
use crate::research::{ResearchLayout, ResearchMonitor, ResearchResults};
use rayon::prelude::*;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

/// Identity of the worker driving an executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    /// Worker index
    pub index: usize,
    /// Worker thread id
    pub pid: String,
}

impl WorkerInfo {
    /// Worker info for the calling thread.
    #[must_use]
    pub fn current(index: usize) -> Self {
        Self {
            index,
            pid: format!("{:?}", thread::current().id()),
        }
    }
}

/// Parameters of one executor.
#[derive(Debug, Clone, Default)]
pub struct ExecutorParams {
    target: ExecutorTarget,
    task_id: usize,
    configs: Vec<Config>,
    branches_configs: Vec<Config>,
    executor_config: Config,
    n_iters: Option<usize>,
    worker: Option<WorkerInfo>,
    layout: Option<ResearchLayout>,
}

impl ExecutorParams {
    /// Default parameters: one empty config, unbounded iterations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Branch execution strategy.
    #[must_use]
    pub const fn target(mut self, target: ExecutorTarget) -> Self {
        self.target = target;
        self
    }

    /// Task id (for signals and ids).
    #[must_use]
    pub const fn task_id(mut self, task_id: usize) -> Self {
        self.task_id = task_id;
        self
    }

    /// Per-branch configs drawn from the domain.
    #[must_use]
    pub fn configs(mut self, configs: Vec<Config>) -> Self {
        self.configs = configs;
        self
    }

    /// Per-branch supplementary configs.
    #[must_use]
    pub fn branches_configs(mut self, configs: Vec<Config>) -> Self {
        self.branches_configs = configs;
        self
    }

    /// Config shared by every branch.
    #[must_use]
    pub fn executor_config(mut self, config: Config) -> Self {
        self.executor_config = config;
        self
    }

    /// Iterations to run; `None` runs until every experiment stops.
    #[must_use]
    pub const fn n_iters(mut self, n_iters: Option<usize>) -> Self {
        self.n_iters = n_iters;
        self
    }

    /// Worker identity for signals.
    #[must_use]
    pub fn worker(mut self, worker: WorkerInfo) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Persist configs and checkpoints into this layout.
    #[must_use]
    pub fn layout(mut self, layout: ResearchLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    /// Id of the task being executed.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.task_id
    }

    /// Iteration limit.
    #[must_use]
    pub const fn iterations(&self) -> Option<usize> {
        self.n_iters
    }

    /// Worker identity, if any.
    #[must_use]
    pub const fn worker_info(&self) -> Option<&WorkerInfo> {
        self.worker.as_ref()
    }

    /// Effective config of every branch: executor < branch < task config.
    #[must_use]
    pub fn experiment_configs(&self) -> Vec<Config> {
        let n = self.configs.len().max(self.branches_configs.len()).max(1);
        let empty = Config::new();
        (0..n)
            .map(|branch| {
                Config::layered(
                    &self.executor_config,
                    self.branches_configs.get(branch).unwrap_or(&empty),
                    self.configs.get(branch).unwrap_or(&empty),
                )
            })
            .collect()
    }
}

/// Shared, read-only state of one executor iteration.
struct Step<'a> {
    experiment: &'a Experiment,
    iteration: usize,
    n_iters: Option<usize>,
    root_outputs: &'a BTreeMap<String, Value>,
    monitor: &'a ResearchMonitor,
    results: &'a ResearchResults,
    worker: Option<&'a WorkerInfo>,
    layout: Option<&'a ResearchLayout>,
}

enum RootStep {
    Outputs(BTreeMap<String, Value>),
    Exhausted,
    Failed(super::ExceptionInfo),
}

/// Anything that can run the branches of one task.
///
/// [`Executor`] is the default; custom executors are plugged in through
/// [`ExecutorClass`].
pub trait TaskExecutor: Send {
    /// Run the task, reporting signals to `monitor` and storing into `results`.
    fn run(&mut self, monitor: &ResearchMonitor, results: &ResearchResults);
}

type BuildFn = dyn Fn(Arc<Experiment>, ExecutorParams) -> Box<dyn TaskExecutor> + Send + Sync;

/// Factory building the executor of every task.
#[derive(Clone)]
pub struct ExecutorClass {
    name: String,
    build: Arc<BuildFn>,
}

impl ExecutorClass {
    /// Custom executor factory, registered under `name`.
    pub fn new<F, E>(name: impl Into<String>, build: F) -> Self
    where
        F: Fn(Arc<Experiment>, ExecutorParams) -> E + Send + Sync + 'static,
        E: TaskExecutor + 'static,
    {
        Self {
            name: name.into(),
            build: Arc::new(move |experiment: Arc<Experiment>, params: ExecutorParams| -> Box<dyn TaskExecutor> {
                Box::new(build(experiment, params))
            }),
        }
    }

    /// Name used in logs and run descriptions.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Build the executor for one task.
    #[must_use]
    pub fn build(&self, experiment: Arc<Experiment>, params: ExecutorParams) -> Box<dyn TaskExecutor> {
        (self.build)(experiment, params)
    }
}

impl Default for ExecutorClass {
    fn default() -> Self {
        Self::new("Executor", Executor::new)
    }
}

impl std::fmt::Debug for ExecutorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ExecutorClass").field(&self.name).finish()
    }
}

/// Runs the experiment instances of one task.
pub struct Executor {
    experiment: Arc<Experiment>,
    params: ExecutorParams,
    root: ExperimentInstance,
    experiments: Vec<ExperimentInstance>,
}

impl Executor {
    /// Create one experiment instance per branch.
    ///
    /// Config precedence: executor < branch < task config.
    #[must_use]
    pub fn new(experiment: Arc<Experiment>, params: ExecutorParams) -> Self {
        let experiments = params
            .experiment_configs()
            .into_iter()
            .enumerate()
            .map(|(branch, config)| ExperimentInstance::new(config, params.task_id, branch))
            .collect();
        let root = ExperimentInstance::root(params.executor_config.clone(), params.task_id);
        if params.n_iters.is_none() && !experiment.units().iter().any(Unit::is_generator) {
            warn!(
                task = params.task_id,
                "executor has no iteration limit and no generator unit; it only stops on failure"
            );
        }
        Self {
            experiment,
            params,
            root,
            experiments,
        }
    }

    /// Experiment instances, one per branch.
    #[must_use]
    pub fn experiments(&self) -> &[ExperimentInstance] {
        &self.experiments
    }

    /// Process id of the executor.
    #[must_use]
    pub fn pid(&self) -> u32 {
        std::process::id()
    }

    /// Worker driving this executor.
    #[must_use]
    pub const fn worker(&self) -> Option<&WorkerInfo> {
        self.params.worker.as_ref()
    }

    /// Run every experiment to completion, exhaustion or failure.
    ///
    /// Unit failures are isolated per experiment; they are reported to the
    /// monitor and never abort sibling branches.
    pub fn run(&mut self, monitor: &ResearchMonitor, results: &ResearchResults) {
        let experiment = Arc::clone(&self.experiment);
        let n_iters = self.params.n_iters;

        for instance in &mut self.experiments {
            instance.start();
            if let Some(layout) = &self.params.layout {
                if let Err(e) = layout.write_config(instance.id(), instance.config()) {
                    warn!(id = %instance.id(), error = %e, "failed to persist experiment config");
                }
            }
        }
        self.root.start();

        let mut iteration = 0;
        while n_iters.map_or(true, |n| iteration < n)
            && self.experiments.iter().any(|e| !e.status().is_done())
        {
            let root_outputs = match self.run_root_units(&experiment, iteration, monitor) {
                RootStep::Outputs(outputs) => outputs,
                stopped => {
                    self.stop_all(&experiment, iteration, stopped);
                    break;
                }
            };

            let step = Step {
                experiment: &experiment,
                iteration,
                n_iters,
                root_outputs: &root_outputs,
                monitor,
                results,
                worker: self.params.worker.as_ref(),
                layout: self.params.layout.as_ref(),
            };
            match self.params.target {
                ExecutorTarget::Threads => self
                    .experiments
                    .par_iter_mut()
                    .filter(|e| !e.status().is_done())
                    .for_each(|e| step.advance(e)),
                ExecutorTarget::For => self
                    .experiments
                    .iter_mut()
                    .filter(|e| !e.status().is_done())
                    .for_each(|e| step.advance(e)),
            }
            iteration += 1;
        }

        for instance in &mut self.experiments {
            if !instance.status().is_done() {
                instance.complete(ExperimentStatus::Finished);
            }
            flush(instance, self.params.layout.as_ref());
            results.put(instance.id(), instance.results().clone(), instance.config().clone());
            debug!(
                task = self.params.task_id,
                id = %instance.id(),
                status = ?instance.status(),
                iteration = instance.iteration(),
                "experiment done"
            );
        }
    }

    fn run_root_units(
        &mut self,
        experiment: &Experiment,
        iteration: usize,
        monitor: &ResearchMonitor,
    ) -> RootStep {
        let worker = self.params.worker.as_ref();
        let root = &mut self.root;
        root.set_iteration(iteration);
        let mut outputs = BTreeMap::new();
        let n_iters = self.params.n_iters;
        for unit in experiment.units().iter().filter(|u| u.is_root()) {
            if !unit.schedule().matches(iteration, n_iters) {
                continue;
            }
            monitor.start_execution(unit.name(), root, worker);
            match root.execute(&unit.kind, unit.name(), &outputs) {
                UnitOutcome::Value(value) => {
                    outputs.insert(unit.name().to_string(), value);
                    monitor.finish_execution(unit.name(), root, worker);
                }
                UnitOutcome::Exhausted => {
                    monitor.stop_iteration(unit.name(), root, worker);
                    return RootStep::Exhausted;
                }
                UnitOutcome::Failed(info) => {
                    monitor.fail_execution(unit.name(), root, worker, &info);
                    warn!(task = self.params.task_id, unit = unit.name(), error = %info, "root unit failed");
                    return RootStep::Failed(info);
                }
            }
        }
        RootStep::Outputs(outputs)
    }

    fn stop_all(&mut self, experiment: &Experiment, iteration: usize, stopped: RootStep) {
        for instance in self.experiments.iter_mut().filter(|e| !e.status().is_done()) {
            instance.set_iteration(iteration);
            match &stopped {
                RootStep::Failed(info) => instance.fail(info.clone()),
                _ => {
                    instance.save_last_outputs(experiment);
                    instance.complete(ExperimentStatus::Exhausted);
                }
            }
        }
    }
}

impl TaskExecutor for Executor {
    fn run(&mut self, monitor: &ResearchMonitor, results: &ResearchResults) {
        Self::run(self, monitor, results);
    }
}

impl Step<'_> {
    fn advance(&self, instance: &mut ExperimentInstance) {
        instance.set_iteration(self.iteration);
        let mut outputs = self.root_outputs.clone();
        let units = self.experiment.units().iter().filter(|u| !u.is_root());
        for unit in units {
            if !unit.schedule().matches(self.iteration, self.n_iters) {
                continue;
            }
            if !self.execute(instance, unit, &mut outputs) {
                return;
            }
        }

        let saved = instance.save_outputs(self.experiment, &outputs, self.n_iters);
        if let Some(each) = self.experiment.checkpoint_each() {
            if each > 0 && (self.iteration + 1) % each == 0 {
                flush(instance, self.layout);
            }
        }
        if !saved.is_empty() {
            self.results.extend(instance.id(), saved, instance.config());
        }
    }

    /// Execute one unit; returns `false` once the experiment has stopped.
    fn execute(
        &self,
        instance: &mut ExperimentInstance,
        unit: &Unit,
        outputs: &mut BTreeMap<String, Value>,
    ) -> bool {
        let name = unit.name();
        self.monitor.start_execution(name, instance, self.worker);
        match instance.execute(&unit.kind, name, outputs) {
            UnitOutcome::Value(value) => {
                outputs.insert(name.to_string(), value);
                self.monitor.finish_execution(name, instance, self.worker);
                true
            }
            UnitOutcome::Exhausted => {
                self.monitor.stop_iteration(name, instance, self.worker);
                debug!(id = %instance.id(), unit = name, iteration = self.iteration, "unit exhausted");
                instance.save_last_outputs(self.experiment);
                instance.complete(ExperimentStatus::Exhausted);
                false
            }
            UnitOutcome::Failed(info) => {
                self.monitor.fail_execution(name, instance, self.worker, &info);
                warn!(id = %instance.id(), unit = name, iteration = self.iteration, error = %info, "unit failed");
                instance.fail(info);
                false
            }
        }
    }
}

/// Write pending results as checkpoints named by the current iteration.
fn flush(instance: &mut ExperimentInstance, layout: Option<&ResearchLayout>) {
    let Some(layout) = layout else {
        return;
    };
    let iteration = instance.iteration();
    for (name, series) in instance.take_pending() {
        if series.is_empty() {
            continue;
        }
        if let Err(e) = layout.write_checkpoint(instance.id(), &name, iteration, &series) {
            warn!(id = %instance.id(), series = %name, error = %e, "failed to write checkpoint");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{ExceptionKind, ExperimentResults, Schedule, Series};
    use crate::research::Status;
    use serde_json::json;

    fn counting(n: u64) -> super::super::UnitIter {
        Box::new((0..n).scan(0u64, |s, i| {
            *s += i;
            Some(Ok(json!(*s)))
        }))
    }

    fn run(experiment: Experiment, params: ExecutorParams) -> (Executor, ResearchMonitor) {
        let mut monitor = ResearchMonitor::new(None).record_signals(true);
        monitor.start(false).unwrap();
        let results = ResearchResults::new("executor-test", false);
        let mut executor = Executor::new(Arc::new(experiment), params);
        executor.run(&monitor, &results);
        monitor.stop();
        (executor, monitor)
    }

    #[test]
    fn test_callable_without_configs() {
        let experiment = Experiment::new()
            .add_callable("sum", |_| Ok(json!((0..10).sum::<i32>())))
            .save("sum", "sum", Schedule::Always);
        let (executor, _) = run(experiment, ExecutorParams::new().n_iters(Some(1)));

        assert_eq!(executor.experiments().len(), 1);
        assert_eq!(executor.experiments()[0].results()["sum"][&0], json!(45));
        assert_eq!(executor.experiments()[0].status(), ExperimentStatus::Finished);
    }

    #[test]
    fn test_generator_runs_until_n_iters() {
        let experiment = Experiment::new()
            .add_generator("sum", |_| Ok(counting(10)))
            .save("sum", "sum", Schedule::Always);
        let (executor, _) = run(experiment, ExecutorParams::new().n_iters(Some(10)));

        let results = executor.experiments()[0].results();
        assert_eq!(results["sum"].len(), 10);
        assert_eq!(results["sum"][&9], json!(45));
    }

    #[test]
    fn test_stop_iteration_saves_last() {
        let experiment = Experiment::new()
            .add_generator("sum", |ctx| Ok(counting(ctx.param("n")?)))
            .add_callable("func", |ctx| {
                let s = ctx.output("sum").and_then(Value::as_u64).unwrap_or_default();
                Ok(json!(s + 1))
            })
            .save("sum", "sum", Schedule::Last)
            .save("func", "func", Schedule::Last);
        let params = ExecutorParams::new()
            .configs(vec![Config::new().with("n", 10), Config::new().with("n", 20)])
            .n_iters(Some(30));
        let (executor, _) = run(experiment, params);

        let [a, b] = executor.experiments() else {
            panic!("two experiments expected");
        };
        assert_eq!(a.results()["sum"][&10], json!(45));
        assert_eq!(b.results()["sum"][&20], json!(190));
        assert_eq!(a.results()["func"][&10], json!(46));
        assert_eq!(b.results()["func"][&20], json!(191));
        assert_eq!(a.status(), ExperimentStatus::Exhausted);
    }

    #[test]
    fn test_unbounded_iterations_stop_on_exhaustion() {
        let experiment = Experiment::new()
            .add_generator("sum", |ctx| Ok(counting(ctx.param("n")?)))
            .save("sum", "sum", Schedule::Always);
        let params = ExecutorParams::new()
            .configs(vec![Config::new().with("n", 3), Config::new().with("n", 5)])
            .n_iters(None);
        let (executor, _) = run(experiment, params);

        assert_eq!(executor.experiments()[0].results()["sum"].len(), 3);
        assert_eq!(executor.experiments()[1].results()["sum"].len(), 5);
    }

    #[test]
    fn test_three_level_config_merge() {
        let experiment = Experiment::new()
            .add_callable("triple", |ctx| {
                Ok(json!([ctx.param::<i64>("x")?, ctx.param::<i64>("y")?, ctx.param::<i64>("z")?]))
            })
            .save("triple", "triple", Schedule::Always);
        let params = ExecutorParams::new()
            .configs(vec![Config::new().with("x", 10), Config::new().with("x", 20)])
            .branches_configs(vec![Config::new().with("y", 20), Config::new().with("y", 30)])
            .executor_config(Config::new().with("z", 5))
            .n_iters(Some(1));
        let (executor, _) = run(experiment, params);

        assert_eq!(executor.experiments()[0].results()["triple"][&0], json!([10, 20, 5]));
        assert_eq!(executor.experiments()[1].results()["triple"][&0], json!([20, 30, 5]));
    }

    #[test]
    fn test_root_unit_shared_across_branches() {
        let experiment = Experiment::new()
            .add_unit(Unit::callable("root", |_| Ok(json!(10))).root())
            .add_callable("sum", |ctx| {
                let root = ctx.output("root").and_then(Value::as_i64).unwrap_or_default();
                Ok(json!(ctx.param::<i64>("x")? + root))
            })
            .save("sum", "sum", Schedule::Always);
        let params = ExecutorParams::new()
            .configs(vec![Config::new().with("x", 10), Config::new().with("x", 20)])
            .n_iters(Some(1))
            .target(ExecutorTarget::Threads);
        let (executor, _) = run(experiment, params);

        assert_eq!(executor.experiments()[0].results()["sum"][&0], json!(20));
        assert_eq!(executor.experiments()[1].results()["sum"][&0], json!(30));
    }

    #[test]
    fn test_failure_is_isolated() {
        let experiment = Experiment::new()
            .add_callable("div", |ctx| {
                let x: i64 = ctx.param("x")?;
                anyhow::ensure!(x != 0, "division by zero");
                Ok(json!(100 / x))
            })
            .save("div", "div", Schedule::Always);
        let params = ExecutorParams::new()
            .configs(vec![Config::new().with("x", 0), Config::new().with("x", 4)])
            .n_iters(Some(3));
        let (executor, monitor) = run(experiment, params);

        let failed = &executor.experiments()[0];
        assert_eq!(failed.status(), ExperimentStatus::Failed);
        assert_eq!(failed.exception().unwrap().kind, ExceptionKind::Error);
        assert!(failed.results().is_empty());

        let ok = &executor.experiments()[1];
        assert_eq!(ok.results()["div"].len(), 3);

        let errors: Vec<_> = monitor
            .signals()
            .into_iter()
            .filter(|s| s.status == Some(Status::Error))
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].id.as_deref(), Some(failed.id()));
        assert!(errors[0].exception.as_deref().unwrap().contains("division by zero"));
    }

    #[test]
    fn test_unit_schedule_every() {
        let experiment = Experiment::new()
            .add_unit(Unit::callable("it", |ctx| Ok(json!(ctx.iteration()))).when(Schedule::Every(2)))
            .save("it", "it", Schedule::Always);
        let (executor, _) = run(experiment, ExecutorParams::new().n_iters(Some(6)));

        let series = &executor.experiments()[0].results()["it"];
        assert_eq!(series.keys().copied().collect::<Vec<_>>(), vec![1, 3, 5]);
    }

    #[test]
    fn test_store_holds_every_saved_iteration() {
        let experiment = Experiment::new()
            .add_callable("it", |ctx| {
                anyhow::ensure!(ctx.iteration() < 3 || ctx.param::<i64>("x")? > 0, "stopped");
                Ok(json!(ctx.iteration()))
            })
            .save("it", "it", Schedule::Always);
        let params = ExecutorParams::new()
            .configs(vec![Config::new().with("x", 0), Config::new().with("x", 1)])
            .n_iters(Some(5))
            .target(ExecutorTarget::For);

        let monitor = ResearchMonitor::new(None);
        let results = ResearchResults::new("executor-test", false);
        let mut executor = Executor::new(Arc::new(experiment), params);
        executor.run(&monitor, &results);

        let [failed, ok] = executor.experiments() else {
            panic!("two experiments expected");
        };
        assert_eq!(results.get(failed.id()).unwrap()["it"].len(), 3);
        assert_eq!(results.get(ok.id()).unwrap()["it"].len(), 5);
        assert_eq!(results.config(ok.id()).unwrap().get("x"), Some(&json!(1)));
    }

    #[test]
    fn test_warns_when_nothing_can_stop() {
        let dir = crate::research::test_dir("executor-warn");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("research.log");
        let dispatch = crate::logging::create_logger(Some(&path), "warn").unwrap();

        tracing::dispatcher::with_default(&dispatch, || {
            let callable = Experiment::new().add_callable("one", |_| Ok(json!(1)));
            let _ = Executor::new(Arc::new(callable.clone()), ExecutorParams::new().task_id(1));
            let _ = Executor::new(Arc::new(callable), ExecutorParams::new().task_id(2).n_iters(Some(3)));
            let generator = Experiment::new().add_generator("g", |_| Ok(counting(2)));
            let _ = Executor::new(Arc::new(generator), ExecutorParams::new().task_id(3));
        });

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("no iteration limit").count(), 1);
        assert!(text.contains("task=1"));
        std::fs::remove_dir_all(dir).unwrap();
    }

    struct CountingExecutor {
        params: ExecutorParams,
    }

    impl TaskExecutor for CountingExecutor {
        fn run(&mut self, _monitor: &ResearchMonitor, results: &ResearchResults) {
            for (branch, config) in self.params.experiment_configs().into_iter().enumerate() {
                let series = Series::from([(0, json!(self.params.iterations()))]);
                results.put(
                    format!("counting-{}-{branch}", self.params.id()),
                    ExperimentResults::from([("n_iters".to_string(), series)]),
                    config,
                );
            }
        }
    }

    #[test]
    fn test_executor_class_builds_custom_executor() {
        let class = ExecutorClass::new("CountingExecutor", |_, params| CountingExecutor { params });
        assert_eq!(class.name(), "CountingExecutor");
        assert_eq!(ExecutorClass::default().name(), "Executor");

        let params = ExecutorParams::new()
            .task_id(7)
            .configs(vec![Config::new().with("x", 1), Config::new().with("x", 2)])
            .executor_config(Config::new().with("z", 5))
            .n_iters(Some(4));
        let monitor = ResearchMonitor::new(None);
        let results = ResearchResults::new("executor-test", false);
        class.build(Arc::new(Experiment::new()), params).run(&monitor, &results);

        assert_eq!(results.ids(), vec!["counting-7-0", "counting-7-1"]);
        assert_eq!(results.get("counting-7-1").unwrap()["n_iters"][&0], json!(4));
        let config = results.config("counting-7-1").unwrap();
        assert_eq!(config.get("x"), Some(&json!(2)));
        assert_eq!(config.get("z"), Some(&json!(5)));
    }
}
