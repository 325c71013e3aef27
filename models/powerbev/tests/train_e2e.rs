use std::{
    fs,
    path::Path,
    sync::{atomic::AtomicBool, Arc},
};

use burn::backend::{ndarray::NdArrayDevice, Autodiff, NdArray};
use powerbev::{
    checkpoint::RetainedCheckpoint,
    config::{self, ConfigArgs, RunConfig},
    error::{SnapshotError, TrainError},
    state_dict::Snapshot,
    train, PowerBevConfig,
};

type TestBackend = Autodiff<NdArray<f32>>;

/// Two 2-sample batches of 16x16 single-camera images onto a 4x4 grid.
fn small_config(log_dir: &Path, extra: &[&str]) -> RunConfig {
    let log_dir = log_dir.to_string_lossy().into_owned();
    let mut opts: Vec<String> = [
        "LOG_DIR", log_dir.as_str(),
        "TAG", "e2e",
        "ACCELERATOR", "cpu",
        "EPOCHS", "1",
        "BATCHSIZE", "2",
        "N_WORKERS", "0",
        "LOGGING_INTERVAL", "1",
        "IMAGE.N_CAMERAS", "1",
        "IMAGE.FINAL_DIM", "[16, 16]",
        "LIFT.X_BOUND", "[-2.0, 2.0, 1.0]",
        "LIFT.Y_BOUND", "[-2.0, 2.0, 1.0]",
        "MODEL.ENCODER.OUT_CHANNELS", "8",
        "DATASET.TRAIN_SAMPLES", "4",
        "DATASET.VAL_SAMPLES", "2",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    opts.extend(extra.iter().map(|s| s.to_string()));

    config::load(&ConfigArgs {
        config_file: None,
        opts,
    })
    .unwrap()
}

fn checkpoints(dir: &Path, prefix: &str) -> usize {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|entry| entry.file_name().to_string_lossy().starts_with(prefix))
                .count()
        })
        .unwrap_or(0)
}

#[test]
fn single_epoch_run_records_one_vpq_and_at_most_one_checkpoint() {
    let tmp = tempfile::tempdir().unwrap();
    let config = small_config(tmp.path(), &[]);

    let summary = train::<TestBackend>(
        &config,
        vec![NdArrayDevice::Cpu],
        Arc::new(AtomicBool::new(false)),
    )
    .unwrap();

    assert!(!summary.interrupted);
    assert_eq!(summary.validation_history.len(), 1);
    let (epoch, vpq) = summary.validation_history[0];
    assert_eq!(epoch, 1);
    assert!((0.0..=1.0).contains(&vpq));
    assert!(summary.retained.len() <= 1);

    let run = &summary.run_dir;
    assert!(run.starts_with(tmp.path()));
    assert!(checkpoints(&run.join("checkpoint"), "model-") <= 1);
    assert!(run.join("config.yaml").is_file());
    assert!(run.join("config.json").is_file());

    let scalars = fs::read_to_string(run.join("powerbev_logs").join("scalars.jsonl")).unwrap();
    let splits: Vec<serde_json::Value> = scalars
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap()["split"].clone())
        .collect();
    assert_eq!(splits.iter().filter(|split| *split == "train").count(), 2);
    assert_eq!(splits.iter().filter(|split| *split == "valid").count(), 1);

    // The exported weights load back as a snapshot.
    let weights = Snapshot::load(&run.join("weights.json")).unwrap();
    assert!(weights.state_dict.get("head.segmentation.weight").is_some());
}

#[test]
fn multi_epoch_run_keeps_only_the_top_k_checkpoints() {
    let tmp = tempfile::tempdir().unwrap();
    let config = small_config(tmp.path(), &["EPOCHS", "4", "CHECKPOINT.SAVE_TOP_K", "2"]);

    let summary = train::<TestBackend>(
        &config,
        vec![NdArrayDevice::Cpu],
        Arc::new(AtomicBool::new(false)),
    )
    .unwrap();

    let epochs: Vec<usize> = summary.validation_history.iter().map(|(epoch, _)| *epoch).collect();
    assert_eq!(epochs, vec![1, 2, 3, 4]);
    assert_eq!(summary.retained.len(), 2);

    // Evicted epochs are gone from disk, retained ones are still there.
    let dir = summary.run_dir.join("checkpoint");
    assert_eq!(checkpoints(&dir, "model-"), 2);
    assert_eq!(checkpoints(&dir, "optim-"), 2);
    for kept in &summary.retained {
        assert!(dir.join(format!("model-{}.mpk", kept.epoch)).is_file());
    }

    let ranking: Vec<RetainedCheckpoint> =
        serde_json::from_str(&fs::read_to_string(dir.join("top_k.json")).unwrap()).unwrap();
    assert_eq!(ranking, summary.retained);
    assert!(ranking[0].value >= ranking[1].value);
}

#[test]
fn backbone_only_snapshot_merges_backbone_and_keeps_head() {
    let device = NdArrayDevice::Cpu;
    let model_config = PowerBevConfig::new(3, 6, [4, 4]).with_encoder_channels(8);

    let pretrained = model_config.init::<NdArray<f32>>(&device);
    let backbone = pretrained.state_dict().filter_prefix("backbone.");
    assert_eq!(backbone.len(), 4);

    let model = model_config.init::<NdArray<f32>>(&device);
    let head_before = model.state_dict().filter_prefix("head.");
    let fusion_before = model.state_dict().filter_prefix("fusion.");

    let snapshot = Snapshot {
        state_dict: backbone.clone(),
    };
    let (model, report) = model.load_partial_state(&snapshot);

    let after = model.state_dict();
    assert_eq!(after.filter_prefix("backbone."), backbone);
    assert_eq!(after.filter_prefix("head."), head_before);
    assert_eq!(after.filter_prefix("fusion."), fusion_before);
    assert_eq!(report.loaded.len(), 4);
    assert_eq!(report.missing.len(), 4);
    assert!(report.unexpected.is_empty());

    // Merging the same snapshot again changes nothing.
    let (again, _) = model.load_partial_state(&snapshot);
    assert_eq!(again.state_dict(), after);
}

#[test]
fn run_with_pretrained_backbone_completes() {
    let tmp = tempfile::tempdir().unwrap();
    let weights = tmp.path().join("backbone.json");

    let pretrained = PowerBevConfig::new(3, 6, [4, 4])
        .with_encoder_channels(8)
        .init::<NdArray<f32>>(&NdArrayDevice::Cpu);
    Snapshot {
        state_dict: pretrained.state_dict().filter_prefix("backbone."),
    }
    .save(&weights)
    .unwrap();

    let weights = weights.to_string_lossy().into_owned();
    let config = small_config(
        tmp.path(),
        &["PRETRAINED.LOAD_WEIGHTS", "true", "PRETRAINED.PATH", &weights],
    );
    let summary = train::<TestBackend>(
        &config,
        vec![NdArrayDevice::Cpu],
        Arc::new(AtomicBool::new(false)),
    )
    .unwrap();

    assert_eq!(summary.validation_history.len(), 1);
}

#[test]
fn missing_pretrained_snapshot_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let absent = tmp.path().join("absent.json").to_string_lossy().into_owned();
    let config = small_config(
        tmp.path(),
        &["PRETRAINED.LOAD_WEIGHTS", "true", "PRETRAINED.PATH", &absent],
    );

    let result = train::<TestBackend>(
        &config,
        vec![NdArrayDevice::Cpu],
        Arc::new(AtomicBool::new(false)),
    );
    assert!(matches!(
        result,
        Err(TrainError::Snapshot(SnapshotError::NotFound(_)))
    ));
}

#[test]
fn empty_device_list_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let config = small_config(tmp.path(), &[]);

    let result = train::<TestBackend>(&config, Vec::new(), Arc::new(AtomicBool::new(false)));
    assert!(matches!(result, Err(TrainError::NoDevice)));
}
