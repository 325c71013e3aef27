//! JSON-lines scalar stream for a training run.

use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use burn::train::{
    renderer::{MetricState, MetricsRenderer, TrainingProgress},
    TrainingInterrupter,
};
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::error::TrainError;

#[derive(Debug, Serialize)]
struct ScalarEvent<'a> {
    split: &'a str,
    epoch: usize,
    step: usize,
    scalars: &'a BTreeMap<String, f64>,
}

/// Error slot shared between the renderer and whoever waits on the run.
#[derive(Debug, Clone, Default)]
pub struct LogStatus {
    failure: Arc<Mutex<Option<String>>>,
}

impl LogStatus {
    pub fn failure(&self) -> Option<String> {
        self.failure
            .lock()
            .map(|slot| slot.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn record(&self, message: String) {
        let mut slot = self.failure.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.get_or_insert(message);
    }
}

/// Writes training scalars every `interval` global steps and the weighted
/// validation means once per epoch. Also watches the shutdown flag and stops
/// the learner when it is raised.
pub struct ScalarLogRenderer<W: Write + Send + Sync = BufWriter<File>> {
    writer: W,
    interval: usize,
    interrupter: TrainingInterrupter,
    shutdown: Arc<AtomicBool>,
    status: LogStatus,
    stopped: bool,
    global_step: usize,
    train_latest: BTreeMap<String, f64>,
    valid_latest: BTreeMap<String, f64>,
    valid_sums: BTreeMap<String, f64>,
    valid_items: usize,
}

impl ScalarLogRenderer {
    /// Opens (appending) the stream at `path`, creating parent directories.
    pub fn create(
        path: &Path,
        interval: usize,
        interrupter: TrainingInterrupter,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, TrainError> {
        let open = || -> std::io::Result<File> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            OpenOptions::new().create(true).append(true).open(path)
        };
        let file = open().map_err(|e| TrainError::MetricsLog(format!("{}: {e}", path.display())))?;
        info!("writing scalars to {}", path.display());

        Ok(Self::new(BufWriter::new(file), interval, interrupter, shutdown))
    }
}

impl<W: Write + Send + Sync> ScalarLogRenderer<W> {
    pub fn new(
        writer: W,
        interval: usize,
        interrupter: TrainingInterrupter,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            writer,
            interval: interval.max(1),
            interrupter,
            shutdown,
            status: LogStatus::default(),
            stopped: false,
            global_step: 0,
            train_latest: BTreeMap::new(),
            valid_latest: BTreeMap::new(),
            valid_sums: BTreeMap::new(),
            valid_items: 0,
        }
    }

    pub fn status(&self) -> LogStatus {
        self.status.clone()
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.interrupter.stop();
        }
    }

    fn emit(&mut self, split: &str, epoch: usize, scalars: &BTreeMap<String, f64>) {
        if self.status.failure().is_some() || scalars.is_empty() {
            return;
        }

        let event = ScalarEvent {
            split,
            epoch,
            step: self.global_step,
            scalars,
        };
        let result = serde_json::to_string(&event)
            .map_err(|e| e.to_string())
            .and_then(|line| writeln!(self.writer, "{line}").map_err(|e| e.to_string()))
            .and_then(|_| self.writer.flush().map_err(|e| e.to_string()));

        match result {
            Ok(()) => debug!("{split} scalars at step {}: {scalars:?}", self.global_step),
            Err(e) => {
                error!("metrics log write failed, stopping training: {e}");
                self.status.record(e);
                self.stop();
            }
        }
    }
}

fn numeric(state: MetricState) -> Option<(String, f64)> {
    match state {
        MetricState::Numeric(entry, value) => Some((entry.name, value)),
        MetricState::Generic(_) => None,
    }
}

impl<W: Write + Send + Sync> MetricsRenderer for ScalarLogRenderer<W> {
    fn update_train(&mut self, state: MetricState) {
        if let Some((name, value)) = numeric(state) {
            self.train_latest.insert(name, value);
        }
    }

    fn update_valid(&mut self, state: MetricState) {
        if let Some((name, value)) = numeric(state) {
            self.valid_latest.insert(name, value);
        }
    }

    fn render_train(&mut self, item: TrainingProgress) {
        self.global_step += 1;

        if self.global_step % self.interval == 0 {
            let scalars = std::mem::take(&mut self.train_latest);
            self.emit("train", item.epoch, &scalars);
            self.train_latest = scalars;
        }

        if !self.stopped && self.shutdown.load(Ordering::SeqCst) {
            warn!("interrupt received, stopping after step {}", self.global_step);
            self.stop();
        }
    }

    fn render_valid(&mut self, item: TrainingProgress) {
        let processed = item.progress.items_processed;
        let weight = processed.saturating_sub(self.valid_items).max(1) as f64;
        self.valid_items = processed;
        for (name, value) in &self.valid_latest {
            *self.valid_sums.entry(name.clone()).or_default() += value * weight;
        }

        if processed >= item.progress.items_total {
            let total = processed.max(1) as f64;
            let means: BTreeMap<String, f64> = std::mem::take(&mut self.valid_sums)
                .into_iter()
                .map(|(name, sum)| (name, sum / total))
                .collect();
            info!("epoch {} validation: {means:?}", item.epoch);
            self.emit("valid", item.epoch, &means);

            self.valid_items = 0;
            self.valid_latest.clear();
        }
    }
}
