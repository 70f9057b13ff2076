//! Research results - shared store of experiment results and configs
//!
//! Two concurrent maps keyed by experiment id:
//!
//! ```text
//! results[id]: name -> (iteration -> value)
//! configs[id]: Config
//! ```
//!
//! Writers are the executors (one writer per id); readers are reports, the
//! domain update function and exports. The two maps are written
//! independently, so a live reader may see one without the other.
//!
//! Tables are Arrow [`RecordBatch`]es:
//! - long form: `id, iteration, name, value` + config columns
//! - pivot form: `id, iteration, <unit>...` + config columns
//!
//! Numeric values become `Float64`, booleans `Boolean`, anything else text.

use super::layout::ResearchLayout;
use crate::config::{value_alias, Config, Params};
use crate::domain::Domain;
use crate::experiment::{ExperimentResults, Series};
use crate::{Error, Result};
use arrow::array::{ArrayRef, BooleanArray, Float64Array, StringArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// How configs are turned into table columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigColumns {
    use_alias: bool,
    concat_config: bool,
    remove_auxiliary: bool,
}

impl Default for ConfigColumns {
    fn default() -> Self {
        Self {
            use_alias: true,
            concat_config: false,
            remove_auxiliary: true,
        }
    }
}

impl ConfigColumns {
    /// Aliases, one column per key, auxiliary keys removed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Aliases (text) instead of raw values.
    #[must_use]
    pub const fn use_alias(mut self, use_alias: bool) -> Self {
        self.use_alias = use_alias;
        self
    }

    /// A single `config` column holding the alias string.
    #[must_use]
    pub const fn concat_config(mut self, concat: bool) -> Self {
        self.concat_config = concat;
        self
    }

    /// Drop `repetition` and `device`.
    #[must_use]
    pub const fn remove_auxiliary(mut self, remove: bool) -> Self {
        self.remove_auxiliary = remove;
        self
    }
}

/// Selection of experiments by configuration.
///
/// At most one of `config`, `alias` and `domain` may be set; `extra`
/// entries are ANDed with `config` (or `alias`).
#[derive(Debug, Clone, Default)]
pub struct ConfigFilter {
    config: Option<Params>,
    alias: Option<BTreeMap<String, String>>,
    domain: Option<Domain>,
    extra: Params,
}

impl ConfigFilter {
    /// Filter matching every experiment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Experiments whose config contains every given value.
    #[must_use]
    pub fn config(mut self, config: impl Into<Params>) -> Self {
        self.config = Some(config.into());
        self
    }

    /// Experiments whose config contains every given alias.
    #[must_use]
    pub fn alias<K: Into<String>, V: Into<String>>(mut self, alias: impl IntoIterator<Item = (K, V)>) -> Self {
        self.alias = Some(alias.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    /// Experiments matching any configuration of a finite domain.
    #[must_use]
    pub fn domain(mut self, domain: Domain) -> Self {
        self.domain = Some(domain);
        self
    }

    /// One more required `key = value`.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// What to (re)load from a dumped research.
#[derive(Debug, Clone, Default)]
pub struct LoadFilter {
    ids: Option<Vec<String>>,
    names: Option<Vec<String>>,
    iterations: Option<Vec<usize>>,
    configs: ConfigFilter,
}

impl LoadFilter {
    /// Load everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Only these experiment ids.
    #[must_use]
    pub fn ids<S: Into<String>>(mut self, ids: impl IntoIterator<Item = S>) -> Self {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Only these result series.
    #[must_use]
    pub fn names<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Only these iterations, each read from the nearest later checkpoint.
    #[must_use]
    pub fn iterations(mut self, iterations: impl IntoIterator<Item = usize>) -> Self {
        self.iterations = Some(iterations.into_iter().collect());
        self
    }

    /// Only experiments selected by `filter`.
    #[must_use]
    pub fn configs(mut self, filter: ConfigFilter) -> Self {
        self.configs = filter;
        self
    }
}

/// Shared store of experiment results and configurations.
#[derive(Debug)]
pub struct ResearchResults {
    name: PathBuf,
    dump_results: bool,
    results: DashMap<String, ExperimentResults>,
    configs: DashMap<String, Config>,
}

impl ResearchResults {
    /// Empty store for the research rooted at `name`.
    pub fn new(name: impl Into<PathBuf>, dump_results: bool) -> Self {
        Self {
            name: name.into(),
            dump_results,
            results: DashMap::new(),
            configs: DashMap::new(),
        }
    }

    /// Store over a dumped research, with its configs restored.
    ///
    /// # Errors
    /// Returns `NotFound` if the folder does not exist, or an IO or
    /// deserialization error
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::new(root, true);
        let layout = store.layout();
        if !layout.exists() {
            return Err(Error::NotFound(format!("research folder {}", layout.root().display())));
        }
        for (id, config) in layout.read_configs()? {
            store.configs.insert(id, config);
        }
        debug!(root = %store.name.display(), configs = store.configs.len(), "results opened");
        Ok(store)
    }

    fn layout(&self) -> ResearchLayout {
        ResearchLayout::new(self.name.clone())
    }

    /// Research root.
    #[must_use]
    pub fn name(&self) -> &Path {
        &self.name
    }

    /// Whether results are persisted on disk.
    #[must_use]
    pub const fn dump_results(&self) -> bool {
        self.dump_results
    }

    /// Store (overwrite) the results and config of one experiment.
    pub fn put(&self, id: impl Into<String>, results: ExperimentResults, config: Config) {
        let id = id.into();
        self.results.insert(id.clone(), results);
        self.configs.insert(id, config);
    }

    /// Merge newly saved values into the results of one experiment.
    ///
    /// The config is stored only if the experiment is not known yet.
    pub fn extend(&self, id: &str, saved: ExperimentResults, config: &Config) {
        {
            let mut entry = self.results.entry(id.to_string()).or_default();
            for (name, series) in saved {
                entry.value_mut().entry(name).or_default().extend(series);
            }
        }
        self.configs
            .entry(id.to_string())
            .or_insert_with(|| config.clone());
    }

    /// Results of one experiment.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<ExperimentResults> {
        self.results.get(id).map(|r| r.value().clone())
    }

    /// Config of one experiment.
    #[must_use]
    pub fn config(&self, id: &str) -> Option<Config> {
        self.configs.get(id).map(|c| c.value().clone())
    }

    /// Every experiment id with results, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.results.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Number of experiments with results.
    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// No experiment results stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    fn sorted_configs(&self) -> Vec<(String, Config)> {
        let mut configs: Vec<(String, Config)> = self
            .configs
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        configs.sort_by(|a, b| a.0.cmp(&b.0));
        configs
    }

    /// Ids of experiments whose config matches `filter`.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if more than one of config/alias/domain is
    /// set, or the domain is infinite
    pub fn filter_ids_by_configs(&self, filter: &ConfigFilter) -> Result<Vec<String>> {
        let given = [filter.config.is_some(), filter.alias.is_some(), filter.domain.is_some()];
        if given.iter().filter(|g| **g).count() > 1 {
            return Err(Error::InvalidConfig(
                "only one of `config`, `alias` and `domain` can be given".to_string(),
            ));
        }

        if let Some(domain) = &filter.domain {
            let configs = domain.iter_configs().ok_or_else(|| {
                Error::InvalidConfig("cannot filter by an infinite domain".to_string())
            })?;
            let mut ids = Vec::new();
            for config in configs {
                for id in self.filter_ids_by_configs(&ConfigFilter::new().config(config.config()))? {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
            }
            return Ok(ids);
        }

        let configs = self.sorted_configs();
        if let Some(alias) = &filter.alias {
            let mut alias = alias.clone();
            alias.extend(filter.extra.iter().map(|(k, v)| (k.clone(), value_alias(v))));
            return Ok(configs
                .into_iter()
                .filter(|(_, c)| c.contains_aliases(&alias))
                .map(|(id, _)| id)
                .collect());
        }

        let mut params = filter.config.clone().unwrap_or_default();
        params.extend(filter.extra.clone());
        Ok(configs
            .into_iter()
            .filter(|(_, c)| c.contains_params(&params))
            .map(|(id, _)| id)
            .collect())
    }

    /// Rebuild results from the persisted layout.
    ///
    /// Does nothing when results are not dumped.
    ///
    /// # Errors
    /// Returns error on an invalid filter or IO/deserialization failure
    pub fn load(&self, filter: &LoadFilter) -> Result<()> {
        if !self.dump_results {
            debug!("results are not dumped, nothing to load");
            return Ok(());
        }
        let layout = self.layout();
        if self.configs.is_empty() {
            for (id, config) in layout.read_configs()? {
                self.configs.insert(id, config);
            }
        }

        let filtered = self.filter_ids_by_configs(&filter.configs)?;
        let ids: Vec<String> = match &filter.ids {
            Some(ids) => ids.iter().filter(|id| filtered.contains(id)).cloned().collect(),
            None => filtered,
        };

        self.results.clear();
        for (id, name, dir) in layout.result_series()? {
            if !ids.contains(&id) {
                continue;
            }
            if filter.names.as_ref().is_some_and(|names| !names.contains(&name)) {
                continue;
            }
            let loaded = ResearchLayout::read_checkpoints(&dir, filter.iterations.as_deref())?;
            let mut entry = self.results.entry(id).or_default();
            entry.entry(name).or_default().extend(loaded);
        }
        info!(root = %self.name.display(), experiments = self.results.len(), "results loaded");
        Ok(())
    }

    /// Config table: `id` plus config columns.
    ///
    /// # Errors
    /// Returns error if the table cannot be assembled
    pub fn configs_to_df(&self, columns: &ConfigColumns) -> Result<RecordBatch> {
        let rows: Vec<(String, BTreeMap<String, Value>)> = self
            .sorted_configs()
            .into_iter()
            .map(|(id, config)| (id, config_cells(&config, columns)))
            .collect();
        let keys = column_names(rows.iter().map(|(_, cells)| cells));

        let mut fields = vec![Field::new("id", DataType::Utf8, false)];
        let mut arrays: Vec<ArrayRef> = vec![Arc::new(StringArray::from_iter_values(
            rows.iter().map(|(id, _)| id.as_str()),
        ))];
        for key in keys {
            let column: Vec<Option<Value>> = rows.iter().map(|(_, cells)| cells.get(&key).cloned()).collect();
            push_column(&mut fields, &mut arrays, key, &column);
        }
        Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
    }

    /// Results table with default config columns.
    ///
    /// # Errors
    /// Returns error if the table cannot be assembled
    pub fn to_df(&self, pivot: bool, include_config: bool) -> Result<RecordBatch> {
        self.to_df_with(pivot, include_config.then(ConfigColumns::default).as_ref())
    }

    /// Results table; with `config`, rows are inner-joined with config columns.
    ///
    /// # Errors
    /// Returns error if the table cannot be assembled
    pub fn to_df_with(&self, pivot: bool, config: Option<&ConfigColumns>) -> Result<RecordBatch> {
        let mut ids = self.ids();
        let config_cells: BTreeMap<String, BTreeMap<String, Value>> = match config {
            Some(columns) => {
                let cells: BTreeMap<_, _> = self
                    .sorted_configs()
                    .into_iter()
                    .map(|(id, c)| (id, config_cells(&c, columns)))
                    .collect();
                ids.retain(|id| cells.contains_key(id));
                cells
            }
            None => BTreeMap::new(),
        };

        let table = if pivot {
            self.pivot_rows(&ids)
        } else {
            self.long_rows(&ids)
        };

        let mut fields = vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("iteration", DataType::UInt64, false),
        ];
        let mut arrays: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from_iter_values(table.rows.iter().map(|r| r.id.as_str()))),
            Arc::new(UInt64Array::from_iter_values(
                table.rows.iter().map(|r| r.iteration as u64),
            )),
        ];
        for (i, name) in table.columns.iter().enumerate() {
            let column: Vec<Option<Value>> = table.rows.iter().map(|r| r.cells[i].clone()).collect();
            push_column(&mut fields, &mut arrays, name.clone(), &column);
        }

        if config.is_some() {
            let keys = column_names(config_cells.values());
            for key in keys {
                let column: Vec<Option<Value>> = table
                    .rows
                    .iter()
                    .map(|r| config_cells.get(&r.id).and_then(|c| c.get(&key)).cloned())
                    .collect();
                let name = if fields.iter().any(|f| f.name() == &key) {
                    format!("config.{key}")
                } else {
                    key
                };
                push_column(&mut fields, &mut arrays, name, &column);
            }
        }

        Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
    }

    /// One row per (id, name, iteration).
    fn long_rows(&self, ids: &[String]) -> Table {
        let mut rows = Vec::new();
        for id in ids {
            let Some(results) = self.get(id) else { continue };
            for (name, series) in &results {
                for (iteration, value) in series {
                    rows.push(Row {
                        id: id.clone(),
                        iteration: *iteration,
                        cells: vec![Some(Value::String(name.clone())), Some(value.clone())],
                    });
                }
            }
        }
        Table {
            columns: vec!["name".to_string(), "value".to_string()],
            rows,
        }
    }

    /// One row per (id, iteration) present in every series of the experiment.
    fn pivot_rows(&self, ids: &[String]) -> Table {
        let per_id: Vec<(String, ExperimentResults)> =
            ids.iter().filter_map(|id| self.get(id).map(|r| (id.clone(), r))).collect();
        let columns: Vec<String> = column_names(per_id.iter().map(|(_, r)| r));

        let mut rows = Vec::new();
        for (id, results) in &per_id {
            let mut series = results.values();
            let Some(first) = series.next() else { continue };
            let mut iterations: BTreeSet<usize> = first.keys().copied().collect();
            for other in series {
                iterations.retain(|it| other.contains_key(it));
            }
            for iteration in iterations {
                let cells = columns
                    .iter()
                    .map(|name| results.get(name).and_then(|s: &Series| s.get(&iteration)).cloned())
                    .collect();
                rows.push(Row {
                    id: id.clone(),
                    iteration,
                    cells,
                });
            }
        }
        Table { columns, rows }
    }

    /// Write the results table to a Parquet file.
    ///
    /// # Errors
    /// Returns error if the table cannot be built or written
    pub fn to_parquet(&self, path: impl AsRef<Path>, pivot: bool, include_config: bool) -> Result<()> {
        use parquet::arrow::ArrowWriter;

        let batch = self.to_df(pivot, include_config)?;
        let file = File::create(path.as_ref())?;
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
        writer.write(&batch)?;
        writer.close()?;
        info!(path = %path.as_ref().display(), rows = batch.num_rows(), "results exported");
        Ok(())
    }

    /// Read back a table written by [`Self::to_parquet`].
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed
    pub fn read_parquet(path: impl AsRef<Path>) -> Result<Vec<RecordBatch>> {
        use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

        let file = File::open(path.as_ref())?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
        let mut batches = Vec::new();
        for batch in reader {
            batches.push(batch?);
        }
        Ok(batches)
    }
}

struct Row {
    id: String,
    iteration: usize,
    cells: Vec<Option<Value>>,
}

struct Table {
    columns: Vec<String>,
    rows: Vec<Row>,
}

fn config_cells(config: &Config, columns: &ConfigColumns) -> BTreeMap<String, Value> {
    let config = if columns.remove_auxiliary {
        config.without_auxiliary()
    } else {
        config.clone()
    };
    if columns.use_alias {
        if columns.concat_config {
            BTreeMap::from([("config".to_string(), Value::String(config.alias_string()))])
        } else {
            config.alias().into_iter().map(|(k, a)| (k, Value::String(a))).collect()
        }
    } else {
        config.config()
    }
}

/// Union of map keys, in first-seen sorted order.
fn column_names<'a, V: 'a>(maps: impl Iterator<Item = &'a BTreeMap<String, V>>) -> Vec<String> {
    maps.flat_map(BTreeMap::keys)
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn push_column(fields: &mut Vec<Field>, arrays: &mut Vec<ArrayRef>, name: String, values: &[Option<Value>]) {
    let array = value_array(values);
    fields.push(Field::new(name, array.data_type().clone(), true));
    arrays.push(array);
}

/// Typed column: `Float64` if every value is a number, `Boolean` if every
/// value is a bool, text otherwise. Nulls are ignored when typing.
fn value_array(values: &[Option<Value>]) -> ArrayRef {
    let present = || values.iter().flatten().filter(|v| !v.is_null());
    let any = present().next().is_some();

    if any && present().all(Value::is_number) {
        let column: Float64Array = values
            .iter()
            .map(|v| v.as_ref().and_then(Value::as_f64))
            .collect();
        return Arc::new(column);
    }
    if any && present().all(Value::is_boolean) {
        let column: BooleanArray = values
            .iter()
            .map(|v| v.as_ref().and_then(Value::as_bool))
            .collect();
        return Arc::new(column);
    }
    let column: StringArray = values
        .iter()
        .map(|v| v.as_ref().filter(|v| !v.is_null()).map(value_alias))
        .collect();
    Arc::new(column)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Opt;
    use crate::research::test_dir;
    use arrow::array::{Array, AsArray};
    use arrow::datatypes::{Float64Type, UInt64Type};
    use serde_json::json;

    fn series(values: &[(usize, Value)]) -> Series {
        values.iter().cloned().collect()
    }

    fn store() -> ResearchResults {
        let results = ResearchResults::new("results-test", false);
        results.put(
            "a",
            BTreeMap::from([
                ("loss".to_string(), series(&[(0, json!(1.5)), (1, json!(0.5))])),
                ("acc".to_string(), series(&[(1, json!(0.9))])),
            ]),
            Config::new().with("x", 10).with("repetition", 0),
        );
        results.put(
            "b",
            BTreeMap::from([("loss".to_string(), series(&[(0, json!(2))]))]),
            Config::new().with("x", 20).with("repetition", 0),
        );
        results.put("c", BTreeMap::new(), Config::new().with("x", 30).with("repetition", 1));
        results
    }

    #[test]
    fn test_long_form() {
        let df = store().to_df(false, false).unwrap();
        assert_eq!(df.num_rows(), 4);
        let schema = df.schema();
        let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(names, vec!["id", "iteration", "name", "value"]);
        assert_eq!(df.column(3).data_type(), &DataType::Float64);
    }

    #[test]
    fn test_pivot_inner_merge() {
        let df = store().to_df(true, true).unwrap();
        // a: only iteration 1 has both series; b: one row; c: dropped
        assert_eq!(df.num_rows(), 2);
        let iterations = df.column(1).as_primitive::<UInt64Type>();
        assert_eq!(iterations.values().to_vec(), vec![1, 0]);

        let schema = df.schema();
        let acc = df.column(schema.index_of("acc").unwrap()).as_primitive::<Float64Type>();
        assert!((acc.value(0) - 0.9).abs() < f64::EPSILON);
        assert!(acc.is_null(1));

        let x = df.column(schema.index_of("x").unwrap()).as_string::<i32>();
        assert_eq!(x.value(0), "10");
        assert!(schema.index_of("repetition").is_err());
    }

    #[test]
    fn test_put_is_idempotent() {
        let results = store();
        for _ in 0..3 {
            results.put(
                "b",
                BTreeMap::from([("loss".to_string(), series(&[(0, json!(2))]))]),
                Config::new().with("x", 20),
            );
        }
        assert_eq!(results.to_df(false, false).unwrap().num_rows(), 4);
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn test_extend_merges_new_values() {
        let results = store();
        results.extend(
            "a",
            BTreeMap::from([("loss".to_string(), series(&[(2, json!(0.25))]))]),
            &Config::new().with("x", 99),
        );
        results.extend(
            "d",
            BTreeMap::from([("acc".to_string(), series(&[(0, json!(0.1))]))]),
            &Config::new().with("x", 40),
        );

        let a = results.get("a").unwrap();
        assert_eq!(a["loss"].keys().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(a["acc"].len(), 1);
        assert_eq!(results.config("a").unwrap().get("x"), Some(&json!(10)));
        assert_eq!(results.config("d").unwrap().get("x"), Some(&json!(40)));
        assert_eq!(results.len(), 4);
    }

    #[test]
    fn test_configs_to_df_modes() {
        let results = store();
        let df = results.configs_to_df(&ConfigColumns::new()).unwrap();
        assert_eq!(df.num_rows(), 3);
        assert_eq!(df.num_columns(), 2);

        let raw = results
            .configs_to_df(&ConfigColumns::new().use_alias(false).remove_auxiliary(false))
            .unwrap();
        assert_eq!(raw.num_columns(), 3);
        assert_eq!(raw.column(1).data_type(), &DataType::Float64);

        let concat = results.configs_to_df(&ConfigColumns::new().concat_config(true)).unwrap();
        let column = concat.column(1).as_string::<i32>();
        assert_eq!(column.value(0), "x_10");
    }

    #[test]
    fn test_filter_ids() {
        let results = store();
        let all = results.filter_ids_by_configs(&ConfigFilter::new()).unwrap();
        assert_eq!(all, vec!["a", "b", "c"]);

        let by_config = ConfigFilter::new().config(Params::from([("x".to_string(), json!(20))]));
        assert_eq!(results.filter_ids_by_configs(&by_config).unwrap(), vec!["b"]);

        let and_extra = ConfigFilter::new()
            .config(Params::from([("repetition".to_string(), json!(0))]))
            .with("x", 10);
        assert_eq!(results.filter_ids_by_configs(&and_extra).unwrap(), vec!["a"]);

        let by_alias = ConfigFilter::new().alias([("x", "30")]);
        assert_eq!(results.filter_ids_by_configs(&by_alias).unwrap(), vec!["c"]);

        let by_domain = ConfigFilter::new().domain(Domain::grid(vec![Opt::new("x", [10, 30])]));
        assert_eq!(results.filter_ids_by_configs(&by_domain).unwrap(), vec!["a", "c"]);
    }

    #[test]
    fn test_filter_rejects_two_modes() {
        let filter = ConfigFilter::new()
            .config(Params::from([("x".to_string(), json!(10))]))
            .alias([("x", "10")]);
        let err = store().filter_ids_by_configs(&filter).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let infinite = ConfigFilter::new().domain(Domain::from_fn(|i| Config::new().with("i", i)));
        assert!(store().filter_ids_by_configs(&infinite).is_err());
    }

    #[test]
    fn test_load_from_disk() {
        let root = test_dir("results-load");
        let layout = ResearchLayout::new(&root);
        layout.create().unwrap();
        layout.write_config("e1", &Config::new().with("x", 1)).unwrap();
        layout.write_config("e2", &Config::new().with("x", 2)).unwrap();
        layout
            .write_checkpoint("e1", "loss", 1, &series(&[(0, json!(3)), (1, json!(2))]))
            .unwrap();
        layout.write_checkpoint("e1", "loss", 3, &series(&[(2, json!(1)), (3, json!(0))])).unwrap();
        layout.write_checkpoint("e2", "loss", 0, &series(&[(0, json!(9))])).unwrap();

        let results = ResearchResults::open(&root).unwrap();
        assert!(results.is_empty());
        results.load(&LoadFilter::new()).unwrap();
        assert_eq!(results.get("e1").unwrap()["loss"].len(), 4);

        results
            .load(&LoadFilter::new().iterations([2]).configs(ConfigFilter::new().with("x", 1)))
            .unwrap();
        assert_eq!(results.ids(), vec!["e1"]);
        assert_eq!(results.get("e1").unwrap()["loss"], series(&[(2, json!(1))]));

        results.load(&LoadFilter::new().ids(["e2"]).names(["acc"])).unwrap();
        assert!(results.is_empty());

        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_open_missing() {
        let err = ResearchResults::open(test_dir("results-missing")).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_parquet_export() {
        let root = test_dir("results-parquet");
        std::fs::create_dir_all(&root).unwrap();
        let path = root.join("results.parquet");

        store().to_parquet(&path, false, true).unwrap();
        let batches = ResearchResults::read_parquet(&path).unwrap();
        let rows: usize = batches.iter().map(RecordBatch::num_rows).sum();
        assert_eq!(rows, 4);
        assert!(batches[0].schema().index_of("x").is_ok());
        std::fs::remove_dir_all(root).unwrap();
    }
}
