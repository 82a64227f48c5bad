use dayson_engine::HostMathEngine;
use dayson_model::LstmConfig;
use dayson_trainer::{CapturingSink, TrainEvent, Trainer, TrainerConfig};
use std::fs;
use tempfile::tempdir;

fn small_trainer_config(root: std::path::PathBuf) -> TrainerConfig {
    let mut config = TrainerConfig::new(root);
    config.epochs = 2;
    config.learning_rate = 0.01;
    config.context = 5;
    config.batch_size = 2;
    config.val_split = 0.2;
    config.sync_interval = 2;
    config.seed = 7;
    config
}

#[test]
fn test_two_epochs_end_to_end() {
    let dir = tempdir().unwrap();
    let engine = HostMathEngine::new();
    let sink = CapturingSink::new();
    let config = small_trainer_config(dir.path().to_path_buf());
    let lstm_config = LstmConfig::new(32, 6, 8, 32);
    let mut trainer = Trainer::new(&engine, &sink, config, lstm_config).unwrap();

    let corpus: Vec<i32> = (0..50).map(|i| i % 32).collect();
    trainer.prepare_dataset(&corpus).unwrap();
    let report = trainer.run().unwrap();

    assert_eq!(report.epoch_train_loss.len(), 2);
    assert_eq!(report.epoch_validation_loss.len(), 2);
    assert!(report.epoch_train_loss.iter().all(|l| l.is_finite() && *l > 0.0));
    assert!(report
        .epoch_validation_loss
        .iter()
        .all(|l| l.is_finite() && *l > 0.0));
    assert_eq!(report.failed_batches, 0);

    // catalog files were written, one per epoch
    assert!(dir.path().join("model_epoch_0.json").exists());
    assert!(dir.path().join("model_epoch_1.json").exists());

    // the swap directory drained on every exit path
    assert_eq!(trainer.swap_store().file_count().unwrap(), 0);

    let events = trainer_events(&sink);
    assert!(events.iter().any(|e| matches!(e, TrainEvent::EpochStarted { epoch: 0 })));
    assert!(events.iter().any(|e| matches!(e, TrainEvent::BatchCompleted { .. })));
    assert!(events.iter().any(|e| matches!(e, TrainEvent::ValidationCompleted { epoch: 1, .. })));
    assert!(events.iter().any(|e| matches!(e, TrainEvent::ModelSaved { epoch: 1, .. })));
    assert!(events.iter().any(|e| matches!(e, TrainEvent::EpochCompleted { .. })));
    assert!(!events.iter().any(|e| matches!(e, TrainEvent::BatchFailed { .. })));
}

fn trainer_events(sink: &CapturingSink) -> Vec<TrainEvent> {
    sink.events()
}

#[test]
fn test_model_reload_preserves_weight_ids() {
    let dir = tempdir().unwrap();
    let engine = HostMathEngine::new();
    let sink = CapturingSink::new();
    let mut config = small_trainer_config(dir.path().to_path_buf());
    config.epochs = 1;
    let lstm_config = LstmConfig::new(32, 6, 8, 32);
    let mut trainer = Trainer::new(&engine, &sink, config, lstm_config).unwrap();

    let corpus: Vec<i32> = (0..50).map(|i| i % 32).collect();
    trainer.prepare_dataset(&corpus).unwrap();
    let embedding_id = trainer.model().id("embedding").unwrap().to_string();
    trainer.run().unwrap();

    // the reloaded model points at the same on-disk records
    assert_eq!(trainer.model().id("embedding").unwrap(), embedding_id);
    assert!(trainer.tensor_store().contains(&embedding_id));
}

#[test]
fn test_corrupt_dataset_aborts_after_failure_budget() {
    let dir = tempdir().unwrap();
    let engine = HostMathEngine::new();
    let sink = CapturingSink::new();
    let mut config = small_trainer_config(dir.path().to_path_buf());
    config.epochs = 1;
    config.max_failed_batches = 2;
    let lstm_config = LstmConfig::new(32, 6, 8, 32);
    let mut trainer = Trainer::new(&engine, &sink, config, lstm_config).unwrap();

    // enough corpus for several batches, so the budget is exceeded mid-epoch
    let corpus: Vec<i32> = (0..200).map(|i| i % 32).collect();
    trainer.prepare_dataset(&corpus).unwrap();

    // stomp the shard file: every block read now fails its checksum
    fs::write(dir.path().join("batches.bts"), vec![0xAB; 4096]).unwrap();

    let err = trainer.run().unwrap_err();
    assert!(matches!(err, dayson_core::CoreError::CorruptData(_)));

    let failures = sink
        .events()
        .iter()
        .filter(|e| matches!(e, TrainEvent::BatchFailed { .. }))
        .count();
    assert_eq!(failures, 3); // budget of 2, the third aborts
    assert_eq!(trainer.swap_store().file_count().unwrap(), 0);
}

#[test]
fn test_run_without_dataset_is_rejected() {
    let dir = tempdir().unwrap();
    let engine = HostMathEngine::new();
    let sink = CapturingSink::new();
    let config = small_trainer_config(dir.path().to_path_buf());
    let lstm_config = LstmConfig::new(32, 6, 8, 32);
    let mut trainer = Trainer::new(&engine, &sink, config, lstm_config).unwrap();
    assert!(trainer.run().is_err());
}
