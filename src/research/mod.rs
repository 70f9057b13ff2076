//! Research - many parameterized experiments run in parallel
//!
//! ```text
//! Research::run
//!   ├── devices::partition      worker × branch device sets
//!   ├── ResearchLayout::create  configs/ description/ env/ experiments/
//!   ├── create_logger           research.log or stderr
//!   ├── ResearchMonitor::start  listener thread -> monitor.csv
//!   ├── Distributor::run        W workers <- DynamicQueue <- Domain
//!   └── ResearchMonitor::stop
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use research_engine::config::RunOptions;
//! use research_engine::domain::{Domain, Opt};
//! use research_engine::experiment::{Experiment, Schedule};
//! use research_engine::research::Research;
//! use serde_json::json;
//!
//! let experiment = Experiment::new()
//!     .add_callable("sum", |ctx| Ok(json!((0..ctx.param::<u64>("x")?).sum::<u64>())))
//!     .save("sum", "sum", Schedule::Always);
//!
//! let mut research = Research::new("doc-research", Domain::grid(vec![Opt::new("x", [10, 20])]), experiment);
//! research
//!     .run(RunOptions::new().n_iters(Some(1)).dump_results(false).loglevel("warn"))
//!     .unwrap();
//!
//! let results = research.results().unwrap();
//! assert_eq!(results.len(), 2);
//! ```

mod devices;
mod distributor;
mod layout;
mod monitor;
mod queue;
mod results;

pub use devices::{partition, Devices, Partition};
pub use distributor::Distributor;
pub use layout::{ResearchLayout, SUBFOLDERS};
pub use monitor::{ResearchMonitor, Signal, Status, COLUMNS};
pub use queue::{DynamicQueue, JoinableQueue, Task, TaskHandle, TaskItem, TaskQueue};
pub use results::{ConfigColumns, ConfigFilter, LoadFilter, ResearchResults};

use crate::config::{RunOptions, Slots};
use crate::domain::{Domain, UpdateEach, DEFAULT_REPEAT_EACH};
use crate::experiment::{Experiment, UnitContext, UnitIter};
use crate::logging::create_logger;
use crate::{Error, Result};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::{info, warn};

/// Environment snapshot commands run before every research.
pub const ENV_COMMANDS: [(&str, &str); 3] = [
    ("commit", "git log --name-status HEAD^..HEAD"),
    ("diff", "git diff"),
    ("status", "git status"),
];

/// Orchestrates a domain of configurations over an experiment.
pub struct Research {
    name: PathBuf,
    domain: Domain,
    experiment: Experiment,
    n_configs: Option<usize>,
    n_reps: usize,
    repeat_each: usize,
    dump_results: bool,
    env: BTreeMap<String, String>,
    results: Option<Arc<ResearchResults>>,
    monitor: Option<ResearchMonitor>,
}

impl std::fmt::Debug for Research {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Research")
            .field("name", &self.name)
            .field("domain", &self.domain)
            .field("units", &self.experiment.unit_names())
            .field("n_configs", &self.n_configs)
            .field("n_reps", &self.n_reps)
            .field("repeat_each", &self.repeat_each)
            .finish_non_exhaustive()
    }
}

impl Research {
    /// Research stored under `name` (used as folder when dumping).
    pub fn new(name: impl Into<PathBuf>, domain: Domain, experiment: Experiment) -> Self {
        Self {
            name: name.into(),
            domain,
            experiment,
            n_configs: None,
            n_reps: 1,
            repeat_each: DEFAULT_REPEAT_EACH,
            dump_results: true,
            env: BTreeMap::new(),
            results: None,
            monitor: None,
        }
    }

    /// Take at most `n` configurations from the domain.
    #[must_use]
    pub const fn n_configs(mut self, n: usize) -> Self {
        self.n_configs = Some(n);
        self
    }

    /// Repeat every configuration `n` times.
    #[must_use]
    pub const fn n_reps(mut self, n: usize) -> Self {
        self.n_reps = n;
        self
    }

    /// Size of the blocks repetitions are grouped in.
    #[must_use]
    pub const fn repeat_each(mut self, n: usize) -> Self {
        self.repeat_each = n;
        self
    }

    /// Append a callable unit to the experiment.
    #[must_use]
    pub fn add_callable<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&UnitContext<'_>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.experiment = std::mem::take(&mut self.experiment).add_callable(name, f);
        self
    }

    /// Append a generator unit to the experiment.
    #[must_use]
    pub fn add_generator<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&UnitContext<'_>) -> anyhow::Result<UnitIter> + Send + Sync + 'static,
    {
        self.experiment = std::mem::take(&mut self.experiment).add_generator(name, factory);
        self
    }

    /// Set the domain update function and its cadence.
    #[must_use]
    pub fn update_domain<F>(mut self, function: F, when: UpdateEach, n_updates: Option<usize>) -> Self
    where
        F: Fn(usize, &ResearchResults) -> Option<Domain> + Send + Sync + 'static,
    {
        self.domain.set_update(function, when, n_updates);
        self
    }

    /// Research name (folder).
    #[must_use]
    pub fn name(&self) -> &Path {
        &self.name
    }

    /// The experiment.
    #[must_use]
    pub const fn experiment(&self) -> &Experiment {
        &self.experiment
    }

    /// Results of the last run.
    #[must_use]
    pub fn results(&self) -> Option<&ResearchResults> {
        self.results.as_deref()
    }

    /// Monitor of the last run.
    #[must_use]
    pub const fn monitor(&self) -> Option<&ResearchMonitor> {
        self.monitor.as_ref()
    }

    /// Run every task of the domain to completion.
    ///
    /// # Errors
    /// Returns `InvalidConfig` for empty worker/branch sets, devices that do
    /// not split over the grid or a bad log level; `ResearchExists` if the
    /// research folder already exists; IO errors on the research layout
    pub fn run(&mut self, options: RunOptions) -> Result<&mut Self> {
        if let Some(name) = &options.name {
            self.name = PathBuf::from(name);
        }
        self.dump_results = options.dump_results;

        let workers: Slots = if options.parallel {
            options.workers.clone()
        } else {
            options.workers.clone().first_only()
        };
        if workers.is_empty() || options.branches.is_empty() {
            return Err(Error::InvalidConfig("workers and branches must not be empty".to_string()));
        }
        let (n_workers, n_branches) = (workers.len(), options.branches.len());
        let devices = partition(&options.devices, n_workers, n_branches)?;

        let layout = options.dump_results.then(|| ResearchLayout::new(self.name.clone()));
        if let Some(layout) = &layout {
            layout.create()?;
            layout.write_description("run", &options)?;
            layout.write_description("research", &self.description(&options))?;
        }

        let dispatch = create_logger(layout.as_ref().map(ResearchLayout::log_path).as_deref(), &options.loglevel)?;
        tracing::dispatcher::with_default(&dispatch, || -> Result<()> {
            self.attach_env_meta(&options.env_commands)?;

            let mut domain = self.domain.clone();
            domain.set_iter_params(self.n_configs, self.n_reps, self.repeat_each);
            if domain.is_unbounded() {
                warn!("research will be infinite: the domain is infinite and is never updated before exhaustion");
            }
            info!(
                name = %self.name.display(),
                workers = n_workers,
                branches = n_branches,
                size = ?domain.size(),
                "research is starting"
            );

            let results = Arc::new(ResearchResults::new(self.name.clone(), options.dump_results));
            let queue = DynamicQueue::new(domain, Arc::clone(&results), n_branches);
            let mut distributor = Distributor::new(queue, Arc::new(self.experiment.clone()))
                .workers(workers.into_configs())
                .branches(options.branches.clone().into_configs())
                .devices(devices)
                .n_iters(options.n_iters)
                .target(options.executor_target)
                .executor_class(options.executor_class.clone())
                .layout(layout.clone())
                .with_dispatch(dispatch.clone());

            let mut monitor = ResearchMonitor::new(layout.as_ref().map(ResearchLayout::monitor_path))
                .record_signals(!options.dump_results)
                .with_dispatch(dispatch.clone());
            monitor.start(options.dump_results)?;
            let outcome = distributor.run(&monitor, &results);
            monitor.stop();

            self.results = Some(results);
            self.monitor = Some(monitor);
            outcome?;
            info!(
                tasks = distributor.queue().withdrawn_tasks(),
                experiments = self.results().map_or(0, ResearchResults::len),
                "research finished"
            );
            Ok(())
        })?;
        Ok(self)
    }

    fn description(&self, options: &RunOptions) -> Value {
        json!({
            "name": self.name.display().to_string(),
            "executor_class": options.executor_class.name(),
            "units": self.experiment.unit_names(),
            "n_configs": self.n_configs,
            "n_reps": self.n_reps,
            "repeat_each": self.repeat_each,
            "domain_size": self.domain.size(),
        })
    }

    /// Snapshot the environment: git commit, diff and status plus `commands`
    /// (file name, command line).
    ///
    /// Outputs go to `env/<name>.txt` when dumping, otherwise stay in memory.
    /// A failing command is logged and stored as empty output.
    ///
    /// # Errors
    /// Returns error if a snapshot file cannot be written
    pub fn attach_env_meta(&mut self, commands: &[(String, String)]) -> Result<()> {
        let all = ENV_COMMANDS
            .iter()
            .map(|(name, command)| ((*name).to_string(), (*command).to_string()))
            .chain(commands.iter().cloned());

        for (name, command) in all {
            let output = scrub_images(&run_command(&command));
            if self.dump_results {
                let dir = ResearchLayout::new(self.name.clone()).env_dir();
                fs::create_dir_all(&dir)?;
                fs::write(dir.join(format!("{name}.txt")), format!("{output}\n"))?;
            } else {
                self.env.insert(name, output);
            }
        }
        Ok(())
    }

    /// Environment snapshot, file name → trimmed output.
    ///
    /// # Errors
    /// Returns error if the snapshot folder cannot be read
    pub fn env(&self) -> Result<BTreeMap<String, String>> {
        if !self.dump_results {
            return Ok(self.env.clone());
        }
        let dir = ResearchLayout::new(self.name.clone()).env_dir();
        let mut env = BTreeMap::new();
        if !dir.exists() {
            return Ok(env);
        }
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                env.insert(stem.to_string(), fs::read_to_string(&path)?.trim().to_string());
            }
        }
        Ok(env)
    }

    /// Results of a dumped research, loaded from disk.
    ///
    /// # Errors
    /// Returns `NotFound` if the research folder does not exist, or an IO,
    /// deserialization or filter error
    pub fn load_results(name: impl Into<PathBuf>, filter: &LoadFilter) -> Result<ResearchResults> {
        let results = ResearchResults::open(name)?;
        results.load(filter)?;
        Ok(results)
    }
}

fn run_command(command: &str) -> String {
    let mut parts = command.split_whitespace();
    let Some(program) = parts.next() else {
        return String::new();
    };
    match Command::new(program).args(parts).output() {
        Ok(output) => {
            if !output.status.success() {
                warn!(command, status = %output.status, "environment command failed");
            }
            String::from_utf8_lossy(&output.stdout).into_owned()
        }
        Err(e) => {
            warn!(command, error = %e, "environment command could not be started");
            String::new()
        }
    }
}

/// Replace embedded `"image/png": "<payload>"` blobs with `"..."`.
fn scrub_images(text: &str) -> String {
    const KEY: &str = "\"image/png\": \"";
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(KEY) {
        let payload = &rest[start + KEY.len()..];
        let Some(end) = payload.find('"') else {
            break;
        };
        out.push_str(&rest[..start]);
        out.push_str(KEY);
        out.push_str("...\"");
        rest = &payload[end + 1..];
    }
    out.push_str(rest);
    out
}

/// Unique, not yet existing folder under the system temp dir.
#[cfg(test)]
pub(crate) fn test_dir(name: &str) -> PathBuf {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    std::env::temp_dir().join(format!(
        "research-engine-{name}-{}-{nanos}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Opt;
    use crate::experiment::Schedule;

    fn sum_research(name: PathBuf) -> Research {
        let experiment = Experiment::new()
            .add_callable("sum", |ctx| Ok(json!((0..ctx.param::<u64>("x")?).sum::<u64>())))
            .save("sum", "sum", Schedule::Always);
        Research::new(name, Domain::grid(vec![Opt::new("x", [10, 20])]), experiment)
    }

    #[test]
    fn test_scrub_images() {
        let text = r#"{"image/png": "iVBORw0KGgo", "text": "ok"} "image/png": "abc""#;
        assert_eq!(
            scrub_images(text),
            r#"{"image/png": "...", "text": "ok"} "image/png": "...""#
        );
        assert_eq!(scrub_images("plain"), "plain");
    }

    #[test]
    fn test_run_in_memory() {
        let mut research = sum_research(test_dir("research-memory"));
        research
            .run(RunOptions::new().n_iters(Some(1)).dump_results(false).loglevel("warn"))
            .unwrap();

        let results = research.results().unwrap();
        assert_eq!(results.len(), 2);
        assert!(!research.name().exists());
        let env = research.env().unwrap();
        assert!(env.contains_key("commit") && env.contains_key("status"));
        assert!(!research.monitor().unwrap().signals().is_empty());
    }

    #[test]
    fn test_run_refuses_existing_folder() {
        let root = test_dir("research-exists");
        fs::create_dir_all(&root).unwrap();
        let mut research = sum_research(root.clone());
        let err = research.run(RunOptions::new().n_iters(Some(1))).unwrap_err();
        assert!(matches!(err, Error::ResearchExists(_)));
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_run_rejects_uneven_devices() {
        let mut research = sum_research(test_dir("research-devices"));
        let options = RunOptions::new()
            .workers(2)
            .devices(Devices::list(0..3))
            .dump_results(false);
        assert!(matches!(research.run(options), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_run_dumped_layout() {
        let root = test_dir("research-dump");
        let mut research = sum_research(root.clone()).n_reps(2);
        research
            .run(
                RunOptions::new()
                    .n_iters(Some(1))
                    .loglevel("info")
                    .env_command("echo", "echo hello"),
            )
            .unwrap();

        for sub in SUBFOLDERS {
            assert!(root.join(sub).is_dir());
        }
        assert!(root.join("description").join("run.json").exists());
        assert!(root.join("monitor.csv").exists());
        let log = fs::read_to_string(root.join("research.log")).unwrap();
        assert!(log.contains("research is starting"));
        assert_eq!(research.env().unwrap()["echo"], "hello");

        let loaded = Research::load_results(&root, &LoadFilter::new()).unwrap();
        assert_eq!(loaded.len(), 4);
        let df = loaded.to_df(false, true).unwrap();
        assert_eq!(df.num_rows(), 4);
        fs::remove_dir_all(root).unwrap();
    }
}
