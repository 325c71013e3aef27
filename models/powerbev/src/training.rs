use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use bev_dataset::{BevBatch, BevBatcher, BevSplits};
use burn::{
    config::Config,
    data::{
        dataloader::{DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    grad_clipping::GradientClippingConfig,
    module::Module,
    optim::{decay::WeightDecayConfig, AdamConfig},
    record::CompactRecorder,
    tensor::backend::AutodiffBackend,
    train::{metric::LossMetric, LearnerBuilder},
};
use log::{info, warn};

use crate::{
    checkpoint::{self, CheckpointPolicy, RetainedCheckpoint, TolerantRecorder, TopKCheckpointing},
    config::RunConfig,
    error::TrainError,
    logger::ScalarLogRenderer,
    metric::VpqMetric,
    run_dir::RunDirectory,
    state_dict::Snapshot,
    PowerBevConfig,
};

#[derive(Config)]
pub struct TrainingConfig {
    pub model: PowerBevConfig,
    pub optimizer: AdamConfig,
    #[config(default = 20)]
    pub num_epochs: usize,
    #[config(default = 1)]
    pub batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 0)]
    pub seed: u64,
    #[config(default = 3.0e-4)]
    pub learning_rate: f64,
}

impl TrainingConfig {
    pub fn from_run(config: &RunConfig) -> Self {
        TrainingConfig::new(config.model_config(), configure_optimization(config))
            .with_num_epochs(config.epochs)
            .with_batch_size(config.batchsize)
            .with_num_workers(config.n_workers)
            .with_seed(config.seed)
            .with_learning_rate(config.optimizer.lr)
    }
}

/// Adam with L2 weight decay (the penalty is added to the gradient before the
/// moment updates) and gradient-norm clipping. The learning rate stays
/// constant for the whole run.
pub fn configure_optimization(config: &RunConfig) -> AdamConfig {
    AdamConfig::new()
        .with_weight_decay(Some(WeightDecayConfig::new(config.optimizer.weight_decay)))
        .with_grad_clipping(Some(GradientClippingConfig::Norm(config.grad_norm_clip)))
}

pub type TrainLoader<B> = Arc<dyn DataLoader<BevBatch<B>>>;
pub type ValidLoader<B> = Arc<dyn DataLoader<BevBatch<<B as AutodiffBackend>::InnerBackend>>>;

/// Shuffled training loader and an in-order validation loader.
pub fn prepare_dataloaders<B: AutodiffBackend>(
    config: &RunConfig,
    device: &B::Device,
) -> Result<(TrainLoader<B>, ValidLoader<B>), TrainError> {
    let geometry = config.geometry();
    let splits = BevSplits::build(&config.data_source(), &geometry)?;
    info!(
        "{} training and {} validation samples",
        splits.train.len(),
        splits.valid.len()
    );

    let batcher_train = BevBatcher::<B>::new(device.clone(), geometry.clone());
    let batcher_valid = BevBatcher::<B::InnerBackend>::new(device.clone(), geometry);

    let mut builder_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(config.batchsize)
        .shuffle(config.seed);
    let mut builder_valid = DataLoaderBuilder::new(batcher_valid).batch_size(config.batchsize);
    if config.n_workers > 0 {
        builder_train = builder_train.num_workers(config.n_workers);
        builder_valid = builder_valid.num_workers(config.n_workers);
    }

    Ok((builder_train.build(splits.train), builder_valid.build(splits.valid)))
}

#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub run_dir: PathBuf,
    /// `(epoch, value)` of the monitored metric, in epoch order.
    pub validation_history: Vec<(usize, f64)>,
    /// Best first.
    pub retained: Vec<RetainedCheckpoint>,
    pub interrupted: bool,
}

/// Wall time per orchestration phase.
#[derive(Debug, Default)]
struct SimpleProfiler {
    phases: Vec<(&'static str, Duration)>,
}

impl SimpleProfiler {
    fn time<T>(&mut self, phase: &'static str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.phases.push((phase, start.elapsed()));
        out
    }

    fn report(&self) {
        let total: Duration = self.phases.iter().map(|(_, elapsed)| *elapsed).sum();
        info!("profiler: {:.2?} total", total);
        for (phase, elapsed) in &self.phases {
            info!("  {phase:<12} {elapsed:>10.2?}");
        }
    }
}

pub fn train<B: AutodiffBackend>(
    config: &RunConfig,
    devices: Vec<B::Device>,
    shutdown: Arc<AtomicBool>,
) -> Result<TrainingSummary, TrainError> {
    let device = devices.first().cloned().ok_or(TrainError::NoDevice)?;
    let mut profiler = SimpleProfiler::default();

    if devices.len() > 1 {
        info!("data parallel training on {} devices", devices.len());
    }

    let training_config = TrainingConfig::from_run(config);
    let run = profiler.time("setup", || -> Result<RunDirectory, TrainError> {
        let run = RunDirectory::prepare(&config.log_dir, &config.tag)?;
        run.write("config.yaml", &config.to_yaml()?)?;
        let json = run.path().join("config.json");
        training_config
            .save(&json)
            .map_err(|source| TrainError::RunDirectory { path: json, source })?;
        Ok(run)
    })?;

    B::seed(config.seed);

    let (dataloader_train, dataloader_valid) =
        profiler.time("data", || prepare_dataloaders::<B>(config, &device))?;

    let model = profiler.time("model", || -> Result<_, TrainError> {
        let model = training_config.model.init::<B>(&device);
        if !config.pretrained.load_weights {
            return Ok(model);
        }
        let snapshot = Snapshot::load(&config.pretrained.path)?;
        info!("loading pretrained weights from {}", config.pretrained.path.display());
        let (model, _report) = model.load_partial_state(&snapshot);
        Ok(model)
    })?;
    info!("model has {} parameters", model.num_params());

    let policy = Arc::new(Mutex::new(CheckpointPolicy::new(
        config.checkpoint.monitor.clone(),
        config.checkpoint.mode,
        config.checkpoint.save_top_k,
    )));
    // The learner writes model, optim and scheduler records under
    // `<artifact_dir>/checkpoint`, which is the run's checkpoint directory.
    let checkpoint_dir = run.checkpoint_dir();

    let artifact_dir = run.path().to_string_lossy().into_owned();
    let builder = LearnerBuilder::new(&artifact_dir);
    let renderer = ScalarLogRenderer::create(
        &run.metrics_log_path(),
        config.logging_interval,
        builder.interrupter(),
        shutdown.clone(),
    )?;
    let log_status = renderer.status();

    let learner = builder
        .metric_train_numeric(LossMetric::<B>::new())
        .metric_valid_numeric(LossMetric::<B::InnerBackend>::new())
        .metric_valid_numeric(VpqMetric::<B::InnerBackend>::new())
        .with_file_checkpointer(TolerantRecorder::new(CompactRecorder::new()))
        .with_checkpointing_strategy(TopKCheckpointing::new(
            policy.clone(),
            checkpoint_dir.join("top_k.json"),
        ))
        .renderer(renderer)
        .with_application_logger(None)
        .devices(devices)
        .num_epochs(config.epochs)
        .summary()
        .build(model, training_config.optimizer.init(), training_config.learning_rate);

    let model_trained = profiler.time("fit", || learner.fit(dataloader_train, dataloader_valid));
    info!("--- training complete ---");

    if let Some(failure) = log_status.failure() {
        profiler.report();
        return Err(TrainError::MetricsLog(failure));
    }

    profiler.time("export", || {
        let weights = run.path().join("weights.json");
        let snapshot = Snapshot {
            state_dict: model_trained.state_dict(),
        };
        if let Err(e) = snapshot.save(&weights) {
            warn!("could not export final weights: {e}");
        }
        if let Err(e) = model_trained.save_file(run.path().join("model"), &CompactRecorder::new()) {
            warn!("could not save final model record: {e:?}");
        }
    });
    profiler.report();

    let policy = checkpoint::lock(&policy);
    Ok(TrainingSummary {
        run_dir: run.path().to_path_buf(),
        validation_history: policy.history().to_vec(),
        retained: policy.retained().to_vec(),
        interrupted: shutdown.load(Ordering::SeqCst),
    })
}
