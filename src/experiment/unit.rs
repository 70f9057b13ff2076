//! Experiment units - named computations executed once per iteration

use crate::config::Config;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Values produced by a generator unit, one per iteration.
pub type UnitIter = Box<dyn Iterator<Item = anyhow::Result<Value>> + Send>;

/// Body of a callable unit.
pub type CallableFn = Arc<dyn Fn(&UnitContext<'_>) -> anyhow::Result<Value> + Send + Sync>;

/// Factory creating the iterator of a generator unit on its first execution.
pub type GeneratorFactory = Arc<dyn Fn(&UnitContext<'_>) -> anyhow::Result<UnitIter> + Send + Sync>;

/// Iterations on which a unit runs or an output is saved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Schedule {
    /// Every iteration
    #[default]
    Always,
    /// Iterations `n-1, 2n-1, ...`
    Every(usize),
    /// The final iteration (or the one where the experiment stops)
    Last,
    /// Explicit iteration indices
    Iterations(Vec<usize>),
}

impl Schedule {
    /// Whether `iteration` is selected, given the planned iteration count.
    #[must_use]
    pub fn matches(&self, iteration: usize, n_iters: Option<usize>) -> bool {
        match self {
            Self::Always => true,
            Self::Every(n) => *n > 0 && (iteration + 1) % n == 0,
            Self::Last => n_iters.is_some_and(|n| iteration + 1 == n),
            Self::Iterations(its) => its.contains(&iteration),
        }
    }
}

#[derive(Clone)]
pub(crate) enum UnitKind {
    Callable(CallableFn),
    Generator(GeneratorFactory),
}

/// One named computation of an experiment.
#[derive(Clone)]
pub struct Unit {
    name: String,
    pub(crate) kind: UnitKind,
    root: bool,
    when: Schedule,
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            UnitKind::Callable(_) => "callable",
            UnitKind::Generator(_) => "generator",
        };
        f.debug_struct("Unit")
            .field("name", &self.name)
            .field("kind", &kind)
            .field("root", &self.root)
            .field("when", &self.when)
            .finish()
    }
}

impl Unit {
    /// Unit calling `f` on every scheduled iteration.
    pub fn callable<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&UnitContext<'_>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind: UnitKind::Callable(Arc::new(f)),
            root: false,
            when: Schedule::Always,
        }
    }

    /// Unit advancing an iterator built by `factory`; exhaustion stops the experiment.
    pub fn generator<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&UnitContext<'_>) -> anyhow::Result<UnitIter> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind: UnitKind::Generator(Arc::new(factory)),
            root: false,
            when: Schedule::Always,
        }
    }

    /// Share this unit across the branches of a task.
    #[must_use]
    pub const fn root(mut self) -> Self {
        self.root = true;
        self
    }

    /// Restrict the iterations the unit runs on.
    #[must_use]
    pub fn when(mut self, when: Schedule) -> Self {
        self.when = when;
        self
    }

    /// Unit name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the unit is shared across branches.
    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.root
    }

    /// Whether the unit can stop the experiment by running out of values.
    #[must_use]
    pub const fn is_generator(&self) -> bool {
        matches!(self.kind, UnitKind::Generator(_))
    }

    /// Execution schedule.
    #[must_use]
    pub const fn schedule(&self) -> &Schedule {
        &self.when
    }
}

/// What a unit sees while executing.
#[derive(Debug)]
pub struct UnitContext<'a> {
    experiment_id: &'a str,
    config: &'a Config,
    iteration: usize,
    outputs: &'a BTreeMap<String, Value>,
}

impl<'a> UnitContext<'a> {
    pub(crate) const fn new(
        experiment_id: &'a str,
        config: &'a Config,
        iteration: usize,
        outputs: &'a BTreeMap<String, Value>,
    ) -> Self {
        Self {
            experiment_id,
            config,
            iteration,
            outputs,
        }
    }

    /// Id of the running experiment (`"root"` for shared units).
    #[must_use]
    pub const fn experiment_id(&self) -> &str {
        self.experiment_id
    }

    /// Merged configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        self.config
    }

    /// Current iteration.
    #[must_use]
    pub const fn iteration(&self) -> usize {
        self.iteration
    }

    /// Raw config value.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Value> {
        self.config.get(path)
    }

    /// Config value converted to `T`.
    ///
    /// # Errors
    /// Returns error if the path is missing or has the wrong type
    pub fn param<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let value = self
            .config
            .get(path)
            .ok_or_else(|| anyhow::anyhow!("config has no '{path}'"))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Output of a unit executed earlier in this iteration (root units included).
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name)
    }

    /// Devices assigned to this branch.
    #[must_use]
    pub fn devices(&self) -> Vec<String> {
        self.config
            .get("device")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}
