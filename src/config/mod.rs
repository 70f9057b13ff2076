//! Experiment configurations and run options
//!
//! A [`Config`] maps dotted option paths (`"model.lr"`) to JSON values. Each
//! entry also carries an alias: the short human-readable form used for
//! result tables and folder-friendly names.
//!
//! ## Merge precedence
//!
//! ```text
//! executor config  <  branch config  <  task config
//! ```
//!
//! ```rust
//! use research_engine::config::Config;
//!
//! let executor = Config::new().with("z", 5);
//! let branch = Config::new().with("y", 20).with("z", 1);
//! let task = Config::new().with("x", 10);
//!
//! let merged = Config::layered(&executor, &branch, &task);
//! assert_eq!(merged.get("z"), Some(&serde_json::json!(1)));
//! assert_eq!(merged.len(), 3);
//! ```

mod options;

pub use options::{ExecutorTarget, RunOptions, Slots};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Plain path → value mapping used by filters and queries.
pub type Params = BTreeMap<String, Value>;

/// Auxiliary keys added by the engine itself (not by the domain author).
pub const AUXILIARY_KEYS: [&str; 2] = ["repetition", "device"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Entry {
    value: Value,
    alias: String,
}

/// A named-parameter assignment for one experiment run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    entries: BTreeMap<String, Entry>,
}

/// Short textual form of a value: strings verbatim, everything else as JSON.
#[must_use]
pub fn value_alias(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Config {
    /// Create an empty config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a config from `(path, value)` pairs.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut config = Self::new();
        for (key, value) in pairs {
            config.set(key, value);
        }
        config
    }

    /// Builder-style [`set`](Self::set).
    #[must_use]
    pub fn with(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(path, value);
        self
    }

    /// Set a value; the alias is derived from the value.
    pub fn set(&mut self, path: impl Into<String>, value: impl Into<Value>) {
        let value = value.into();
        let alias = value_alias(&value);
        self.entries.insert(path.into(), Entry { value, alias });
    }

    /// Set a value with an explicit alias.
    pub fn set_with_alias(
        &mut self,
        path: impl Into<String>,
        value: impl Into<Value>,
        alias: impl Into<String>,
    ) {
        self.entries.insert(
            path.into(),
            Entry {
                value: value.into(),
                alias: alias.into(),
            },
        );
    }

    /// Get the value stored under a dotted path.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Value> {
        self.entries.get(path).map(|e| &e.value)
    }

    /// Remove a path, returning its value.
    pub fn pop(&mut self, path: &str) -> Option<Value> {
        self.entries.remove(path).map(|e| e.value)
    }

    /// Check whether a path is set.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the config has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over the paths in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Full form: path → value.
    #[must_use]
    pub fn config(&self) -> Params {
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Short form: path → alias.
    #[must_use]
    pub fn alias(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), e.alias.clone()))
            .collect()
    }

    /// Alias collapsed into one string, e.g. `lr_0.1-model_unet`.
    #[must_use]
    pub fn alias_string(&self) -> String {
        self.entries
            .iter()
            .map(|(k, e)| format!("{k}_{}", e.alias))
            .collect::<Vec<_>>()
            .join("-")
    }

    /// Copy without the engine's auxiliary keys (`repetition`, `device`).
    #[must_use]
    pub fn without_auxiliary(&self) -> Self {
        let mut config = self.clone();
        for key in AUXILIARY_KEYS {
            config.pop(key);
        }
        config
    }

    /// Return `self` updated with every entry of `other` (`other` wins).
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let mut merged = self.clone();
        for (k, e) in &other.entries {
            merged.entries.insert(k.clone(), e.clone());
        }
        merged
    }

    /// Merge the three configuration layers of one experiment.
    ///
    /// Precedence: executor < branch < task.
    #[must_use]
    pub fn layered(executor: &Self, branch: &Self, task: &Self) -> Self {
        executor.merge(branch).merge(task)
    }

    /// Every `(path, value)` of `params` is present in this config.
    #[must_use]
    pub fn contains_params(&self, params: &Params) -> bool {
        params.iter().all(|(k, v)| self.get(k) == Some(v))
    }

    /// Every entry of `other` is present here with the same value.
    #[must_use]
    pub fn is_superset_of(&self, other: &Self) -> bool {
        self.contains_params(&other.config())
    }

    /// Every `(path, alias)` of `aliases` matches this config's aliases.
    #[must_use]
    pub fn contains_aliases(&self, aliases: &BTreeMap<String, String>) -> bool {
        aliases
            .iter()
            .all(|(k, a)| self.entries.get(k).is_some_and(|e| &e.alias == a))
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Config {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from_pairs(iter)
    }
}
