//! Research monitor - lifecycle signals off the hot path
//!
//! Workers send [`Signal`]s over an unbounded channel; a dedicated listener
//! thread appends them to `monitor.csv`. Sending never blocks and a failed
//! write only drops the row.
//!
//! ```text
//! worker 0 ─┐
//! worker 1 ─┼─ send ──> [unbounded channel] ──> listener ──> monitor.csv
//! worker N ─┘                               └─> in-memory copy (optional)
//! ```

use crate::experiment::{ExceptionInfo, ExperimentInstance, WorkerInfo};
use crate::{Error, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn, Dispatch};

/// Fixed header of the monitor log.
pub const COLUMNS: [&str; 10] = [
    "time",
    "task_idx",
    "id",
    "it",
    "name",
    "status",
    "exception",
    "worker",
    "pid",
    "worker_pid",
];

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Unit execution status carried by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Unit started
    Start,
    /// Unit produced a value
    Success,
    /// Unit failed
    Error,
    /// Unit ran out of values
    StopIteration,
}

impl Status {
    /// Name written to the log.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Success => "success",
            Self::Error => "error",
            Self::StopIteration => "stop_iteration",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "start" => Some(Self::Start),
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            "stop_iteration" => Some(Self::StopIteration),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lifecycle event. Missing fields are written as empty cells.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// When the event happened
    pub time: Option<DateTime<Utc>>,
    /// Task id
    pub task_idx: Option<usize>,
    /// Experiment id
    pub id: Option<String>,
    /// Iteration
    pub it: Option<usize>,
    /// Unit name
    pub name: Option<String>,
    /// Execution status
    pub status: Option<Status>,
    /// `Kind: message` of a failure
    pub exception: Option<String>,
    /// Worker index
    pub worker: Option<usize>,
    /// Process id
    pub pid: Option<u32>,
    /// Worker thread id
    pub worker_pid: Option<String>,
}

impl Signal {
    /// Signal for `unit` of `instance`, stamped now.
    #[must_use]
    pub fn for_unit(
        unit: &str,
        instance: &ExperimentInstance,
        worker: Option<&WorkerInfo>,
        status: Status,
    ) -> Self {
        Self {
            time: Some(Utc::now()),
            task_idx: Some(instance.task_id()),
            id: Some(instance.id().to_string()),
            it: Some(instance.iteration()),
            name: Some(unit.to_string()),
            status: Some(status),
            exception: None,
            worker: worker.map(|w| w.index),
            pid: Some(std::process::id()),
            worker_pid: worker.map(|w| w.pid.clone()),
        }
    }

    /// Cells in [`COLUMNS`] order.
    #[must_use]
    pub fn to_row(&self) -> [String; 10] {
        fn cell<T: ToString>(value: Option<&T>) -> String {
            value.map(ToString::to_string).unwrap_or_default()
        }
        [
            self.time
                .map(|t| t.format(TIME_FORMAT).to_string())
                .unwrap_or_default(),
            cell(self.task_idx.as_ref()),
            cell(self.id.as_ref()),
            cell(self.it.as_ref()),
            cell(self.name.as_ref()),
            cell(self.status.as_ref()),
            cell(self.exception.as_ref()),
            cell(self.worker.as_ref()),
            cell(self.pid.as_ref()),
            cell(self.worker_pid.as_ref()),
        ]
    }

    fn from_row(row: &[String]) -> Self {
        fn text(cell: Option<&String>) -> Option<String> {
            cell.filter(|c| !c.is_empty()).cloned()
        }
        fn number<T: std::str::FromStr>(cell: Option<&String>) -> Option<T> {
            cell.and_then(|c| c.parse().ok())
        }
        Self {
            time: row
                .first()
                .and_then(|c| NaiveDateTime::parse_from_str(c, TIME_FORMAT).ok())
                .map(|t| t.and_utc()),
            task_idx: number(row.get(1)),
            id: text(row.get(2)),
            it: number(row.get(3)),
            name: text(row.get(4)),
            status: row.get(5).and_then(|c| Status::parse(c)),
            exception: text(row.get(6)),
            worker: number(row.get(7)),
            pid: number(row.get(8)),
            worker_pid: text(row.get(9)),
        }
    }
}

/// Quote a CSV cell when it holds a separator, quote or line break.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn csv_line(cells: &[String]) -> String {
    let mut line = cells.iter().map(|c| csv_field(c)).collect::<Vec<_>>().join(",");
    line.push('\n');
    line
}

/// Split CSV text into records (quoted cells may span lines).
fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut cell = String::new();
    let mut quoted = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match (quoted, c) {
            (true, '"') if chars.peek() == Some(&'"') => {
                chars.next();
                cell.push('"');
            }
            (true, '"') => quoted = false,
            (true, c) => cell.push(c),
            (false, '"') => quoted = true,
            (false, ',') => record.push(std::mem::take(&mut cell)),
            (false, '\r') => {}
            (false, '\n') => {
                record.push(std::mem::take(&mut cell));
                records.push(std::mem::take(&mut record));
            }
            (false, c) => cell.push(c),
        }
    }
    if !cell.is_empty() || !record.is_empty() {
        record.push(cell);
        records.push(record);
    }
    records
}

type Message = Option<Signal>;

/// Listener-side state.
struct Listener {
    receiver: UnboundedReceiver<Message>,
    writer: Option<BufWriter<File>>,
    recorded: Option<Arc<Mutex<Vec<Signal>>>>,
}

impl Listener {
    fn run(mut self) {
        let mut received = 0usize;
        while let Some(Some(signal)) = self.receiver.blocking_recv() {
            received += 1;
            if let Some(writer) = &mut self.writer {
                let line = csv_line(&signal.to_row());
                if let Err(e) = writer.write_all(line.as_bytes()).and_then(|()| writer.flush()) {
                    warn!(error = %e, "dropped monitor row");
                }
            }
            if let Some(recorded) = &self.recorded {
                recorded
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(signal);
            }
        }
        debug!(received, "monitor listener stopped");
    }
}

/// Collects lifecycle signals on a dedicated listener thread.
pub struct ResearchMonitor {
    path: Option<PathBuf>,
    sender: UnboundedSender<Message>,
    receiver: Option<UnboundedReceiver<Message>>,
    listener: Option<JoinHandle<()>>,
    recorded: Option<Arc<Mutex<Vec<Signal>>>>,
    dispatch: Option<Dispatch>,
}

impl fmt::Debug for ResearchMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResearchMonitor")
            .field("path", &self.path)
            .field("running", &self.listener.is_some())
            .field("recording", &self.recorded.is_some())
            .finish_non_exhaustive()
    }
}

impl ResearchMonitor {
    /// Monitor writing to `path` when started with dumping enabled.
    #[must_use]
    pub fn new(path: Option<PathBuf>) -> Self {
        let (sender, receiver) = unbounded_channel();
        Self {
            path,
            sender,
            receiver: Some(receiver),
            listener: None,
            recorded: None,
            dispatch: None,
        }
    }

    /// Keep an in-memory copy of every received signal.
    #[must_use]
    pub fn record_signals(mut self, record: bool) -> Self {
        self.recorded = record.then(|| Arc::new(Mutex::new(Vec::new())));
        self
    }

    /// Log through `dispatch` on the listener thread.
    #[must_use]
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    /// Log file path, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Spawn the listener. With `dump`, the log file gets its header once.
    ///
    /// # Errors
    /// Returns error if the monitor was already started or the log file
    /// cannot be opened
    pub fn start(&mut self, dump: bool) -> Result<()> {
        let receiver = self
            .receiver
            .take()
            .ok_or_else(|| Error::Other("monitor already started".to_string()))?;

        let writer = match (&self.path, dump) {
            (Some(path), true) => Some(Self::open_log(path)?),
            _ => None,
        };

        let listener = Listener {
            receiver,
            writer,
            recorded: self.recorded.clone(),
        };
        let dispatch = self.dispatch.clone();
        let handle = thread::Builder::new()
            .name("research-monitor".to_string())
            .spawn(move || match dispatch {
                Some(dispatch) => tracing::dispatcher::with_default(&dispatch, || listener.run()),
                None => listener.run(),
            })?;
        self.listener = Some(handle);
        Ok(())
    }

    fn open_log(path: &Path) -> Result<BufWriter<File>> {
        let fresh = fs::metadata(path).map_or(true, |m| m.len() == 0);
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);
        if fresh {
            let header: Vec<String> = COLUMNS.iter().map(ToString::to_string).collect();
            writer.write_all(csv_line(&header).as_bytes())?;
            writer.flush()?;
        }
        Ok(writer)
    }

    /// Enqueue a signal; never blocks.
    pub fn send(&self, signal: Signal) {
        if self.sender.send(Some(signal)).is_err() {
            debug!("monitor stopped, signal dropped");
        }
    }

    /// Send the sentinel and wait for the listener to drain.
    pub fn stop(&mut self) {
        let _ = self.sender.send(None);
        if let Some(handle) = self.listener.take() {
            if handle.join().is_err() {
                warn!("monitor listener panicked");
            }
        }
    }

    /// Signals received so far (only when recording).
    #[must_use]
    pub fn signals(&self) -> Vec<Signal> {
        self.recorded
            .as_ref()
            .map(|r| r.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .unwrap_or_default()
    }

    /// Read back a monitor log.
    ///
    /// # Errors
    /// Returns error if the file cannot be read
    pub fn load(path: &Path) -> Result<Vec<Signal>> {
        let text = fs::read_to_string(path)?;
        Ok(parse_csv(&text)
            .into_iter()
            .skip(1)
            .map(|row| Signal::from_row(&row))
            .collect())
    }

    /// `start` signal for a unit.
    pub fn start_execution(&self, unit: &str, instance: &ExperimentInstance, worker: Option<&WorkerInfo>) {
        self.send(Signal::for_unit(unit, instance, worker, Status::Start));
    }

    /// `success` signal for a unit.
    pub fn finish_execution(&self, unit: &str, instance: &ExperimentInstance, worker: Option<&WorkerInfo>) {
        self.send(Signal::for_unit(unit, instance, worker, Status::Success));
    }

    /// `error` signal carrying the failure.
    pub fn fail_execution(
        &self,
        unit: &str,
        instance: &ExperimentInstance,
        worker: Option<&WorkerInfo>,
        exception: &ExceptionInfo,
    ) {
        let mut signal = Signal::for_unit(unit, instance, worker, Status::Error);
        signal.exception = Some(exception.to_string());
        self.send(signal);
    }

    /// `stop_iteration` signal for an exhausted unit.
    pub fn stop_iteration(&self, unit: &str, instance: &ExperimentInstance, worker: Option<&WorkerInfo>) {
        self.send(Signal::for_unit(unit, instance, worker, Status::StopIteration));
    }
}

impl Drop for ResearchMonitor {
    fn drop(&mut self) {
        if self.listener.is_some() {
            self.stop();
        }
    }
}
