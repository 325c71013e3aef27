use std::{
    fs,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
};

use burn::{
    record::{FileRecorder, Recorder, RecorderError},
    tensor::backend::Backend,
    train::{
        checkpoint::{CheckpointingAction, CheckpointingStrategy},
        metric::store::{Aggregate, EventStoreClient, Split},
    },
};
use log::{info, warn};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Which way the monitored metric improves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Max,
    Min,
}

impl Direction {
    /// `a` ranks at least as well as `b`.
    fn at_least(self, a: f64, b: f64) -> bool {
        match self {
            Direction::Max => a >= b,
            Direction::Min => a <= b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyState {
    Idle,
    Evaluating,
    Saving,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetainedCheckpoint {
    pub epoch: usize,
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointDecision {
    pub save: bool,
    pub evict: Vec<usize>,
}

/// Keeps the `top_k` best epochs by one validation metric.
#[derive(Debug, Clone)]
pub struct CheckpointPolicy {
    monitor: String,
    direction: Direction,
    top_k: usize,
    /// Best first; among equal values the newest comes first.
    retained: Vec<RetainedCheckpoint>,
    history: Vec<(usize, f64)>,
    state: PolicyState,
}

impl CheckpointPolicy {
    pub fn new(monitor: impl Into<String>, direction: Direction, top_k: usize) -> Self {
        Self {
            monitor: monitor.into(),
            direction,
            top_k,
            retained: Vec::new(),
            history: Vec::new(),
            state: PolicyState::Idle,
        }
    }

    pub fn monitor(&self) -> &str {
        &self.monitor
    }

    pub fn state(&self) -> PolicyState {
        self.state
    }

    pub fn retained(&self) -> &[RetainedCheckpoint] {
        &self.retained
    }

    pub fn history(&self) -> &[(usize, f64)] {
        &self.history
    }

    /// Ranks a finished validation epoch. Ends in `Saving` when `epoch`
    /// must be persisted, otherwise back in `Idle`.
    pub fn observe(&mut self, epoch: usize, value: f64) -> CheckpointDecision {
        self.state = PolicyState::Evaluating;
        self.history.push((epoch, value));

        if self.top_k == 0 || value.is_nan() || !self.qualifies(value) {
            self.state = PolicyState::Idle;
            return CheckpointDecision::default();
        }

        let position = self
            .retained
            .iter()
            .position(|kept| self.direction.at_least(value, kept.value))
            .unwrap_or(self.retained.len());
        self.retained.insert(position, RetainedCheckpoint { epoch, value });

        let evict = if self.retained.len() > self.top_k {
            self.retained.drain(self.top_k..).map(|kept| kept.epoch).collect()
        } else {
            Vec::new()
        };

        self.state = PolicyState::Saving;
        CheckpointDecision { save: true, evict }
    }

    /// Marks the end of a save started by [`observe`](Self::observe).
    pub fn finish(&mut self) {
        self.state = PolicyState::Idle;
    }

    fn qualifies(&self, value: f64) -> bool {
        match self.retained.last() {
            Some(worst) if self.retained.len() >= self.top_k => {
                self.direction.at_least(value, worst.value)
            }
            _ => true,
        }
    }
}

/// Plugs a [`CheckpointPolicy`] into the learner. The policy is shared so the
/// caller can read the ranking back once training returns.
pub struct TopKCheckpointing {
    policy: Arc<Mutex<CheckpointPolicy>>,
    ranking_path: PathBuf,
}

impl TopKCheckpointing {
    pub fn new(policy: Arc<Mutex<CheckpointPolicy>>, ranking_path: PathBuf) -> Self {
        Self {
            policy,
            ranking_path,
        }
    }

    fn write_ranking(&self, retained: &[RetainedCheckpoint]) {
        let result = serde_json::to_vec_pretty(retained)
            .map_err(|e| e.to_string())
            .and_then(|json| {
                if let Some(parent) = self.ranking_path.parent() {
                    fs::create_dir_all(parent).map_err(|e| e.to_string())?;
                }
                fs::write(&self.ranking_path, json).map_err(|e| e.to_string())
            });

        if let Err(e) = result {
            warn!(
                "could not write checkpoint ranking to {}: {e}",
                self.ranking_path.display()
            );
        }
    }
}

impl CheckpointingStrategy for TopKCheckpointing {
    fn checkpointing(&mut self, epoch: usize, store: &EventStoreClient) -> Vec<CheckpointingAction> {
        let mut policy = lock(&self.policy);

        let Some(value) = store.find_metric(policy.monitor(), epoch, Aggregate::Mean, Split::Valid)
        else {
            warn!(
                "no '{}' value recorded for epoch {epoch}; skipping checkpoint",
                policy.monitor()
            );
            return Vec::new();
        };
        info!("epoch {epoch}: {} = {value:.4}", policy.monitor());

        let decision = policy.observe(epoch, value);
        if !decision.save {
            return Vec::new();
        }

        let mut actions = vec![CheckpointingAction::Save];
        actions.extend(decision.evict.iter().map(|epoch| CheckpointingAction::Delete(*epoch)));

        self.write_ranking(policy.retained());
        policy.finish();

        actions
    }
}

pub(crate) fn lock(policy: &Mutex<CheckpointPolicy>) -> MutexGuard<'_, CheckpointPolicy> {
    policy.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// File recorder that logs failed checkpoint writes instead of failing.
///
/// The learner panics on a checkpoint error, so a full disk would otherwise end
/// the run. A write that fails leaves no file behind, which makes a later
/// delete of that epoch a no-op.
#[derive(Debug, Default, Clone)]
pub struct TolerantRecorder<R> {
    inner: R,
}

impl<R> TolerantRecorder<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<B: Backend, R: FileRecorder<B>> Recorder<B> for TolerantRecorder<R> {
    type Settings = R::Settings;
    type RecordArgs = PathBuf;
    type RecordOutput = ();
    type LoadArgs = PathBuf;

    fn save_item<I: Serialize>(&self, item: I, path: PathBuf) -> Result<(), RecorderError> {
        if let Err(e) = self.inner.save_item(item, path.clone()) {
            warn!("failed to save checkpoint {}: {e:?}", path.display());
        }
        Ok(())
    }

    fn load_item<I: DeserializeOwned>(&self, path: PathBuf) -> Result<I, RecorderError> {
        self.inner.load_item(path)
    }
}

impl<B: Backend, R: FileRecorder<B>> FileRecorder<B> for TolerantRecorder<R> {
    fn file_extension() -> &'static str {
        R::file_extension()
    }
}
