use crate::{current_rss_bytes, DatasetShardService, EventSink, TrainEvent};
use dayson_core::{CoreError, Result};
use dayson_engine::MathEngine;
use dayson_model::{all_parameter_names, AdamOptimizer, LstmConfig, LstmCore, LstmModel, ModelCatalog};
use dayson_store::{SwapStore, TensorStore};
use log::{error, info};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct TrainerConfig {
    /// Data directory; tensor cache, swap files, batch shards and model
    /// catalogs all live under it.
    pub root: PathBuf,
    pub epochs: usize,
    pub learning_rate: f32,
    pub context: usize,
    pub batch_size: usize,
    pub val_split: f32,
    pub pad_token: i32,
    pub seed: u64,
    /// Batches between periodic device syncs and memory probes.
    pub sync_interval: usize,
    /// RSS above this makes the trainer consider an emergency trim.
    pub trim_threshold_bytes: u64,
    /// Minimum RSS growth since the last baseline before a trim fires.
    pub trim_growth_bytes: u64,
    /// Lifetime budget of failed batches; one more aborts the epoch.
    pub max_failed_batches: usize,
}

impl TrainerConfig {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            epochs: 1,
            learning_rate: 2e-3,
            context: 64,
            batch_size: 16,
            val_split: 0.1,
            pad_token: 0,
            seed: 42,
            sync_interval: 10,
            trim_threshold_bytes: 2000 * 1024 * 1024,
            trim_growth_bytes: 1024 * 1024 * 1024,
            max_failed_batches: 5,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrainReport {
    pub epoch_train_loss: Vec<f64>,
    pub epoch_validation_loss: Vec<f64>,
    pub failed_batches: usize,
}

/// Drives the whole pipeline: sharded batches in, per-sequence training
/// steps through the core, periodic maintenance, validation, and a
/// save/dispose/reload cycle between epochs.
pub struct Trainer<'a> {
    engine: &'a dyn MathEngine,
    sink: &'a dyn EventSink,
    config: TrainerConfig,
    tensors: TensorStore,
    swaps: SwapStore,
    dataset: DatasetShardService,
    model: LstmModel,
    adam: AdamOptimizer,
    failed_batches: usize,
    rss_baseline: Option<u64>,
}

impl<'a> Trainer<'a> {
    pub fn new(
        engine: &'a dyn MathEngine,
        sink: &'a dyn EventSink,
        config: TrainerConfig,
        lstm_config: LstmConfig,
    ) -> Result<Self> {
        let session = format!("sess_{:016x}", rand::random::<u64>());
        let tensors = TensorStore::open(&config.root, &session)?;
        let swaps = SwapStore::open(&config.root, &session)?;
        let dataset = DatasetShardService::create(&config.root.join("batches.bts"))?;
        let model = LstmModel::initialize(engine, &tensors, lstm_config, config.seed)?;
        info!(
            "trainer session {session} on {} backend",
            engine.backend_name()
        );
        Ok(Self {
            engine,
            sink,
            config,
            tensors,
            swaps,
            dataset,
            model,
            adam: AdamOptimizer::new(),
            failed_batches: 0,
            rss_baseline: None,
        })
    }

    pub fn model(&self) -> &LstmModel {
        &self.model
    }

    pub fn tensor_store(&self) -> &TensorStore {
        &self.tensors
    }

    pub fn swap_store(&self) -> &SwapStore {
        &self.swaps
    }

    /// Shards the corpus. The caller can release the corpus buffer as soon
    /// as this returns; only block offsets stay resident.
    pub fn prepare_dataset(&mut self, corpus: &[i32]) -> Result<()> {
        self.dataset.initialize(
            corpus,
            self.config.context,
            self.model.config.vocab_size,
            self.config.pad_token,
            self.config.batch_size,
            self.config.val_split,
        )
    }

    pub fn run(&mut self) -> Result<TrainReport> {
        if self.dataset.train_offsets().is_empty() {
            return Err(CoreError::InvalidArgument(
                "no training batches; call prepare_dataset first".to_string(),
            ));
        }
        self.run_sanity_check()?;
        let mut report = TrainReport::default();
        for epoch in 0..self.config.epochs {
            self.sink.emit(&TrainEvent::EpochStarted { epoch });
            self.model.reset_state(self.engine, &self.tensors)?;
            let train_loss = self.run_epoch(epoch)?;
            let validation_loss = self.validate(epoch)?;
            self.save_and_reload(epoch)?;
            self.sink.emit(&TrainEvent::EpochCompleted {
                epoch,
                train_loss,
                validation_loss,
            });
            report.epoch_train_loss.push(train_loss);
            report.epoch_validation_loss.push(validation_loss);
        }
        report.failed_batches = self.failed_batches;
        Ok(report)
    }

    /// One full cycle on a scratch model before touching the real one.
    /// Failure aborts training; the scratch tensors are removed either way.
    fn run_sanity_check(&mut self) -> Result<()> {
        let scratch_config = LstmConfig::new(16, 8, 8, 16);
        let scratch =
            LstmModel::initialize(self.engine, &self.tensors, scratch_config, self.config.seed)?;
        let mut weights = scratch.load_weights(self.engine, &self.tensors)?;
        let mut adam = AdamOptimizer::new();
        let core = LstmCore::new(self.engine, &self.tensors, &self.swaps);
        let result = core.sanity_check(&scratch, &mut weights, &mut adam);
        adam.reset(&self.tensors);
        for name in all_parameter_names() {
            if let Ok(id) = scratch.id(&name) {
                self.tensors.delete(id);
            }
        }
        if result.is_ok() {
            info!("sanity check passed");
        }
        result
    }

    /// Loads the weight bundle into engine memory once (dropped when this
    /// function exits on any path), then walks every training batch.
    fn run_epoch(&mut self, epoch: usize) -> Result<f64> {
        let engine = self.engine;
        let sink = self.sink;
        let core = LstmCore::new(engine, &self.tensors, &self.swaps);
        let mut weights = self.model.load_weights(engine, &self.tensors)?;
        let offsets = self.dataset.train_offsets().to_vec();
        let mut total = 0.0f64;
        let mut count = 0usize;
        for (batch, &offset) in offsets.iter().enumerate() {
            let outcome: Result<(f64, usize)> = (|| {
                let pairs = self.dataset.load_batch(offset)?;
                let mut sum = 0.0f64;
                let mut n = 0usize;
                for (x, y) in &pairs {
                    sum += core.train_sequence(
                        &self.model,
                        &mut weights,
                        &mut self.adam,
                        x,
                        y,
                        self.config.learning_rate,
                    )?;
                    n += 1;
                }
                Ok((sum, n))
            })();
            match outcome {
                Ok((sum, n)) => {
                    total += sum;
                    count += n;
                    sink.emit(&TrainEvent::BatchCompleted {
                        epoch,
                        batch,
                        mean_loss: if n > 0 { sum / n as f64 } else { 0.0 },
                    });
                }
                Err(e) => {
                    self.failed_batches += 1;
                    sink.emit(&TrainEvent::BatchFailed {
                        epoch,
                        batch,
                        error: e.to_string(),
                    });
                    if self.failed_batches > self.config.max_failed_batches {
                        error!(
                            "aborting epoch {epoch} after {} failed batches",
                            self.failed_batches
                        );
                        return Err(e);
                    }
                }
            }
            if (batch + 1) % self.config.sync_interval == 0 {
                if let Some(guard) = engine.sync_guard() {
                    guard.synchronize_before_read("periodic maintenance")?;
                }
                if let Some(rss) = current_rss_bytes() {
                    let baseline = *self.rss_baseline.get_or_insert(rss);
                    if rss > self.config.trim_threshold_bytes
                        && rss.saturating_sub(baseline) >= self.config.trim_growth_bytes
                    {
                        if let Some(guard) = engine.sync_guard() {
                            guard.synchronize_before_dispose("memory trim", 0);
                        }
                        sink.emit(&TrainEvent::MemoryTrimmed { rss_bytes: rss });
                        self.rss_baseline = Some(rss);
                    }
                }
            }
        }
        Ok(if count > 0 { total / count as f64 } else { 0.0 })
    }

    /// Mean cross-entropy over the validation batches, forward-only.
    fn validate(&self, epoch: usize) -> Result<f64> {
        let core = LstmCore::new(self.engine, &self.tensors, &self.swaps);
        let weights = self.model.load_weights(self.engine, &self.tensors)?;
        let mut total = 0.0f64;
        let mut count = 0usize;
        for &offset in self.dataset.validation_offsets() {
            for (x, y) in &self.dataset.load_batch(offset)? {
                total += core.evaluate_sequence(&self.model, &weights, x, y)?;
                count += 1;
            }
        }
        let mean = if count > 0 { total / count as f64 } else { 0.0 };
        self.sink.emit(&TrainEvent::ValidationCompleted {
            epoch,
            mean_loss: mean,
        });
        Ok(mean)
    }

    /// Writes the weight-id catalog, disposes the in-memory model, and
    /// reloads it from the file it just wrote.
    fn save_and_reload(&mut self, epoch: usize) -> Result<()> {
        let path = self.config.root.join(format!("model_epoch_{epoch}.json"));
        self.model.catalog().save(&path)?;
        self.sink.emit(&TrainEvent::ModelSaved {
            epoch,
            path: path.clone(),
        });
        let catalog = ModelCatalog::load(&path)?;
        self.model = LstmModel::from_catalog(catalog, &self.tensors)?;
        Ok(())
    }
}
