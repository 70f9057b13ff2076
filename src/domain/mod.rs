//! Domain - adaptive source of experiment configurations
//!
//! A domain is a (possibly infinite) iterator over [`Config`]s. It may be
//! *replaced* mid-run by an update function that looks at the results
//! collected so far:
//!
//! ```text
//! Active ──next()──> Active ... ──next() = None──> Exhausted
//!    │                                                 │
//!    └──── update(finished, results) = Some(new) ──────┴──> new Domain (Active)
//! ```
//!
//! ## Iteration parameters
//!
//! [`Domain::set_iter_params`] takes at most `n_items` base configurations,
//! groups them into blocks of `repeat_each` and yields each block `n_reps`
//! times, tagging every config with the auxiliary `repetition` key.
//!
//! ```rust
//! use research_engine::domain::{Domain, Opt};
//!
//! let mut domain = Domain::grid(vec![Opt::new("x", [1, 2, 3])]);
//! domain.set_iter_params(Some(2), 2, 100);
//! assert_eq!(domain.size(), Some(4));
//!
//! let reps: Vec<_> = domain
//!     .map(|c| c.get("repetition").and_then(|r| r.as_u64()).unwrap())
//!     .collect();
//! assert_eq!(reps, vec![0, 0, 1, 1]);
//! ```

mod source;

pub use source::{GeneratorFn, Opt};

use crate::config::Config;
use crate::research::ResearchResults;
use source::Source;
use std::fmt;
use std::sync::Arc;

/// Default block size for repetitions.
pub const DEFAULT_REPEAT_EACH: usize = 100;

/// Update function: `(finished tasks, results so far) -> replacement domain`.
pub type UpdateFn = Arc<dyn Fn(usize, &ResearchResults) -> Option<Domain> + Send + Sync>;

/// When a domain update is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateEach {
    /// Every `n` finished tasks
    Every(usize),
    /// Only once the current domain is exhausted
    Last,
}

/// Iteration state of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    /// Configurations may remain
    Active,
    /// The iterator has returned `None`
    Exhausted,
}

#[derive(Clone)]
struct Updater {
    func: UpdateFn,
    when: UpdateEach,
    n_updates: Option<usize>,
}

#[derive(Debug, Clone, Default)]
struct Cursor {
    next_base: usize,
    block: Vec<Config>,
    rep: usize,
    pos: usize,
}

/// Adaptive source of parameter configurations.
#[derive(Clone)]
pub struct Domain {
    source: Source,
    n_items: Option<usize>,
    n_reps: usize,
    repeat_each: usize,
    cursor: Cursor,
    state: DomainState,
    updater: Option<Updater>,
    updates: usize,
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("source", &self.source)
            .field("n_items", &self.n_items)
            .field("n_reps", &self.n_reps)
            .field("repeat_each", &self.repeat_each)
            .field("state", &self.state)
            .field("update_each", &self.update_each())
            .field("updates", &self.updates)
            .finish_non_exhaustive()
    }
}

impl Default for Domain {
    fn default() -> Self {
        Self::empty()
    }
}

impl Domain {
    fn from_source(source: Source) -> Self {
        Self {
            source,
            n_items: None,
            n_reps: 1,
            repeat_each: DEFAULT_REPEAT_EACH,
            cursor: Cursor::default(),
            state: DomainState::Active,
            updater: None,
            updates: 0,
        }
    }

    /// Cartesian product of options; the last option varies fastest.
    #[must_use]
    pub fn grid(options: Vec<Opt>) -> Self {
        Self::from_source(Source::Grid(options))
    }

    /// Explicit list of configurations.
    #[must_use]
    pub fn from_configs(configs: Vec<Config>) -> Self {
        Self::from_source(Source::Configs(configs))
    }

    /// Infinite domain producing the `i`-th config on demand.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(usize) -> Config + Send + Sync + 'static,
    {
        Self::from_source(Source::Generator(Arc::new(f)))
    }

    /// Domain without any configuration.
    #[must_use]
    pub fn empty() -> Self {
        Self::from_configs(Vec::new())
    }

    /// Every combination of a config from `self` with one from `other`.
    #[must_use]
    pub fn product(self, other: Self) -> Self {
        Self::from_source(Source::Product(Box::new(self.source), Box::new(other.source)))
    }

    /// Configurations of `self` followed by those of `other`.
    #[must_use]
    pub fn chain(self, other: Self) -> Self {
        Self::from_source(Source::Chain(Box::new(self.source), Box::new(other.source)))
    }

    /// Set iteration parameters and restart iteration.
    pub fn set_iter_params(&mut self, n_items: Option<usize>, n_reps: usize, repeat_each: usize) {
        self.n_items = n_items;
        self.n_reps = n_reps.max(1);
        self.repeat_each = repeat_each.max(1);
        self.reset();
    }

    /// Set the update function, its cadence and the maximum number of updates.
    pub fn set_update<F>(&mut self, function: F, when: UpdateEach, n_updates: Option<usize>)
    where
        F: Fn(usize, &ResearchResults) -> Option<Self> + Send + Sync + 'static,
    {
        self.updater = Some(Updater {
            func: Arc::new(function),
            when,
            n_updates,
        });
    }

    /// Restart iteration from the first configuration.
    pub fn reset(&mut self) {
        self.cursor = Cursor::default();
        self.state = DomainState::Active;
    }

    fn n_base(&self) -> Option<usize> {
        match (self.source.len(), self.n_items) {
            (Some(len), Some(n)) => Some(len.min(n)),
            (len, None) => len,
            (None, n) => n,
        }
    }

    /// Number of configurations this domain yields, `None` if unknown.
    #[must_use]
    pub fn size(&self) -> Option<usize> {
        self.n_base().map(|n| n * self.n_reps)
    }

    /// Current iteration state.
    #[must_use]
    pub const fn state(&self) -> DomainState {
        self.state
    }

    /// Whether the iterator has run dry.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.state == DomainState::Exhausted
    }

    /// Update cadence, if an update function is set.
    #[must_use]
    pub fn update_each(&self) -> Option<UpdateEach> {
        self.updater.as_ref().map(|u| u.when)
    }

    /// Number of updates that produced this domain.
    #[must_use]
    pub const fn updates(&self) -> usize {
        self.updates
    }

    /// Unknown size and nothing that would ever replace it mid-run.
    #[must_use]
    pub fn is_unbounded(&self) -> bool {
        self.size().is_none()
            && self
                .updater
                .as_ref()
                .map_or(true, |u| u.when == UpdateEach::Last)
    }

    /// Base configurations (no repetitions), `None` for infinite domains.
    #[must_use]
    pub fn iter_configs(&self) -> Option<Vec<Config>> {
        self.source.len()?;
        let n = self.n_base()?;
        Some((0..n).filter_map(|i| self.source.base(i)).collect())
    }

    /// Produce the replacement domain if an update is due.
    ///
    /// The returned domain inherits the update function, cadence, limit and
    /// iteration parameters, with its update counter incremented.
    #[must_use]
    pub fn update(&self, finished: usize, feedback: &ResearchResults) -> Option<Self> {
        let updater = self.updater.as_ref()?;
        if updater.n_updates.is_some_and(|limit| self.updates >= limit) {
            return None;
        }
        let due = match updater.when {
            UpdateEach::Every(n) => n > 0 && finished > 0 && finished % n == 0,
            UpdateEach::Last => self.is_exhausted(),
        };
        if !due {
            return None;
        }

        let mut domain = (updater.func)(finished, feedback)?;
        domain.set_iter_params(self.n_items, self.n_reps, self.repeat_each);
        domain.updater = Some(updater.clone());
        domain.updates = self.updates + 1;
        Some(domain)
    }

    fn next_block(&mut self) -> Vec<Config> {
        let limit = self.n_base();
        let mut block = Vec::with_capacity(self.repeat_each.min(64));
        while block.len() < self.repeat_each {
            let i = self.cursor.next_base;
            if limit.is_some_and(|n| i >= n) {
                break;
            }
            match self.source.base(i) {
                Some(config) => block.push(config),
                None => break,
            }
            self.cursor.next_base += 1;
        }
        block
    }
}

impl Iterator for Domain {
    type Item = Config;

    fn next(&mut self) -> Option<Config> {
        if self.is_exhausted() {
            return None;
        }
        loop {
            let cursor = &mut self.cursor;
            if cursor.pos < cursor.block.len() {
                let config = cursor.block[cursor.pos].clone().with("repetition", cursor.rep);
                cursor.pos += 1;
                return Some(config);
            }
            if !cursor.block.is_empty() && cursor.rep + 1 < self.n_reps {
                cursor.rep += 1;
                cursor.pos = 0;
                continue;
            }
            let block = self.next_block();
            if block.is_empty() {
                self.state = DomainState::Exhausted;
                return None;
            }
            self.cursor.block = block;
            self.cursor.rep = 0;
            self.cursor.pos = 0;
        }
    }
}
