//! On-disk layout of a research
//!
//! ```text
//! <root>/
//!   configs/<id>.json
//!   description/run.json
//!   env/<name>.txt
//!   experiments/<id>/config.json
//!   experiments/<id>/results/<series>/<checkpoint iteration>
//!   monitor.csv
//!   research.log
//! ```
//!
//! A checkpoint file holds the `iteration → value` entries flushed at that
//! iteration, serialized as JSON.

use crate::config::Config;
use crate::experiment::Series;
use crate::{Error, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Subfolders created for every research.
pub const SUBFOLDERS: [&str; 4] = ["configs", "description", "env", "experiments"];

/// Paths of a research folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResearchLayout {
    root: PathBuf,
}

impl ResearchLayout {
    /// Layout rooted at `root` (nothing is created).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root folder.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the root folder exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.root.exists()
    }

    /// Create the root and its subfolders.
    ///
    /// # Errors
    /// Returns `ResearchExists` if the root already exists, or an IO error
    pub fn create(&self) -> Result<()> {
        if self.root.exists() {
            return Err(Error::ResearchExists(self.root.clone()));
        }
        for sub in SUBFOLDERS {
            fs::create_dir_all(self.root.join(sub))?;
        }
        Ok(())
    }

    /// `configs/`
    #[must_use]
    pub fn configs_dir(&self) -> PathBuf {
        self.root.join("configs")
    }

    /// `description/`
    #[must_use]
    pub fn description_dir(&self) -> PathBuf {
        self.root.join("description")
    }

    /// `env/`
    #[must_use]
    pub fn env_dir(&self) -> PathBuf {
        self.root.join("env")
    }

    /// `experiments/`
    #[must_use]
    pub fn experiments_dir(&self) -> PathBuf {
        self.root.join("experiments")
    }

    /// `monitor.csv`
    #[must_use]
    pub fn monitor_path(&self) -> PathBuf {
        self.root.join("monitor.csv")
    }

    /// `research.log`
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.root.join("research.log")
    }

    /// `experiments/<id>/results/<name>/`
    #[must_use]
    pub fn results_dir(&self, id: &str, name: &str) -> PathBuf {
        self.experiments_dir().join(id).join("results").join(name)
    }

    /// Write `description/<name>.json`.
    ///
    /// # Errors
    /// Returns error on IO or serialization failure
    pub fn write_description<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let dir = self.description_dir();
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(format!("{name}.json")), serde_json::to_vec_pretty(value)?)?;
        Ok(())
    }

    /// Persist an experiment config to `configs/<id>.json` and `experiments/<id>/config.json`.
    ///
    /// # Errors
    /// Returns error on IO or serialization failure
    pub fn write_config(&self, id: &str, config: &Config) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(config)?;
        fs::create_dir_all(self.configs_dir())?;
        fs::write(self.configs_dir().join(format!("{id}.json")), &bytes)?;
        let experiment_dir = self.experiments_dir().join(id);
        fs::create_dir_all(&experiment_dir)?;
        fs::write(experiment_dir.join("config.json"), &bytes)?;
        Ok(())
    }

    /// Write one checkpoint of a result series.
    ///
    /// # Errors
    /// Returns error on IO or serialization failure
    pub fn write_checkpoint(&self, id: &str, name: &str, iteration: usize, series: &Series) -> Result<()> {
        let dir = self.results_dir(id, name);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(iteration.to_string()), serde_json::to_vec(series)?)?;
        Ok(())
    }

    /// Read every persisted experiment config.
    ///
    /// # Errors
    /// Returns error on IO or deserialization failure
    pub fn read_configs(&self) -> Result<Vec<(String, Config)>> {
        let dir = self.configs_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut configs = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let config: Config = serde_json::from_slice(&fs::read(&path)?)?;
            configs.push((id.to_string(), config));
        }
        configs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(configs)
    }

    /// Every `(experiment id, series name, folder)` with persisted results.
    ///
    /// # Errors
    /// Returns error on IO failure
    pub fn result_series(&self) -> Result<Vec<(String, String, PathBuf)>> {
        let mut found = Vec::new();
        let experiments = self.experiments_dir();
        if !experiments.exists() {
            return Ok(found);
        }
        for experiment in fs::read_dir(experiments)? {
            let experiment = experiment?;
            let results = experiment.path().join("results");
            if !results.is_dir() {
                continue;
            }
            let id = experiment.file_name().to_string_lossy().into_owned();
            for series in fs::read_dir(results)? {
                let series = series?;
                if series.path().is_dir() {
                    let name = series.file_name().to_string_lossy().into_owned();
                    found.push((id.clone(), name, series.path()));
                }
            }
        }
        found.sort();
        Ok(found)
    }

    /// Load checkpoints of one series.
    ///
    /// With `iterations`, each requested iteration is served from the
    /// smallest checkpoint at or after it, and only requested iterations are
    /// kept.
    ///
    /// # Errors
    /// Returns error on IO or deserialization failure
    pub fn read_checkpoints(dir: &Path, iterations: Option<&[usize]>) -> Result<Series> {
        let mut dumped: Vec<usize> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
            .collect();
        dumped.sort_unstable();

        let to_load: Vec<usize> = match iterations {
            None => dumped,
            Some(wanted) => {
                let mut picked: Vec<usize> = wanted
                    .iter()
                    .filter_map(|it| dumped.iter().copied().find(|d| d >= it))
                    .collect();
                picked.sort_unstable();
                picked.dedup();
                picked
            }
        };

        let mut series = Series::new();
        for checkpoint in to_load {
            let values: Series = serde_json::from_slice(&fs::read(dir.join(checkpoint.to_string()))?)?;
            for (it, value) in values {
                if iterations.map_or(true, |wanted| wanted.contains(&it)) {
                    series.insert(it, value);
                }
            }
        }
        Ok(series)
    }
}
