use crate::data::{
    load_image_folder, BatchStream, DataConfig, ImageBatch, ImageBatcher, ImageDataset,
    Normalization, Phase,
};
use crate::metrics::{MetricsSummary, PhaseMetrics};
use crate::model::{
    classification_loss, compute_losses, generator_losses, Autoencoder, Classifier, ModelConfig,
};
use crate::utils::{tensor_values, ImageDumpPolicy, ImageDumper};
use anyhow::{Context, Result};
use burn::config::Config;
use burn::data::dataloader::batcher::Batcher;
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::lr_scheduler::LrScheduler;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::{CompactRecorder, Record};
use burn::tensor::backend::AutodiffBackend;
use chrono::Local;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Training configuration, loadable from a JSON file.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    #[config(default = "ModelConfig::new()")]
    pub model: ModelConfig,
    /// Root holding `train/` and `val/` label-directory trees.
    #[config(default = "String::from(\"phantom\")")]
    pub data_dir: String,
    #[config(default = "String::from(\"out\")")]
    pub output_dir: String,
    #[config(default = "String::from(\"logs\")")]
    pub log_dir: String,
    #[config(default = 30)]
    pub num_epochs: usize,
    #[config(default = 8)]
    pub batch_size: usize,
    #[config(default = 1.0e-4)]
    pub learning_rate: f64,
    #[config(default = 1.0)]
    pub classifier_lr_decay: f64,
    #[config(default = 2.0)]
    pub generator_lr_decay: f64,
    /// Epoch interval (1-indexed) at which both learning rates decay.
    #[config(default = 10)]
    pub decay_every: usize,
    #[config(default = 30.0)]
    pub segmentation_threshold: f32,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = false)]
    pub save_model: bool,
    #[config(default = "AdamConfig::new()")]
    pub optimizer_classifier: AdamConfig,
    #[config(default = "AdamConfig::new()")]
    pub optimizer_generator: AdamConfig,
}

impl TrainingConfig {
    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.num_epochs == 0 {
            return Err(anyhow::anyhow!("batch_size and num_epochs must be positive"));
        }
        if self.model.image_size == 0 || self.model.image_size % 4 != 0 {
            return Err(anyhow::anyhow!(
                "image_size must be a positive multiple of 4, got {}",
                self.model.image_size
            ));
        }
        if self.model.channels != 1 && self.model.channels != 3 {
            return Err(anyhow::anyhow!(
                "channels must be 1 or 3, got {}",
                self.model.channels
            ));
        }
        if self.classifier_lr_decay <= 0.0 || self.generator_lr_decay <= 0.0 {
            return Err(anyhow::anyhow!("learning rate decay factors must be positive"));
        }
        Ok(())
    }

    fn data_config(&self) -> DataConfig {
        DataConfig {
            channels: self.model.channels,
            image_size: self.model.image_size as u32,
        }
    }
}

/// Divides the learning rate by `factor` on every `every`-th epoch.
#[derive(Clone, Debug)]
pub struct StepDecayScheduler {
    lr: f64,
    factor: f64,
    every: usize,
    epoch: usize,
}

#[derive(Record, Clone)]
pub struct StepDecayRecord {
    lr: f64,
    epoch: usize,
}

impl StepDecayScheduler {
    pub fn new(lr: f64, factor: f64, every: usize) -> Self {
        Self {
            lr,
            factor,
            every,
            epoch: 0,
        }
    }

    /// Learning rate for the current epoch without advancing.
    pub fn current(&self) -> f64 {
        self.lr
    }
}

impl LrScheduler for StepDecayScheduler {
    type Record<B: Backend> = StepDecayRecord;

    fn step(&mut self) -> f64 {
        self.epoch += 1;
        if self.every > 0 && self.epoch % self.every == 0 {
            self.lr /= self.factor;
        }
        self.lr
    }

    fn to_record<B: Backend>(&self) -> Self::Record<B> {
        StepDecayRecord {
            lr: self.lr,
            epoch: self.epoch,
        }
    }

    fn load_record<B: Backend>(mut self, record: Self::Record<B>) -> Self {
        self.lr = record.lr;
        self.epoch = record.epoch;
        self
    }
}

/// Two Adam optimizers, each bound to one network with its own schedule and step count.
#[derive(Clone)]
pub struct OptimizerPair<B: AutodiffBackend> {
    classifier: OptimizerAdaptor<Adam, Classifier<B>, B>,
    generator: OptimizerAdaptor<Adam, Autoencoder<B>, B>,
    classifier_lr: StepDecayScheduler,
    generator_lr: StepDecayScheduler,
    classifier_step: usize,
    generator_step: usize,
}

impl<B: AutodiffBackend> OptimizerPair<B> {
    pub fn new(config: &TrainingConfig) -> Self {
        Self {
            classifier: config.optimizer_classifier.init::<B, Classifier<B>>(),
            generator: config.optimizer_generator.init::<B, Autoencoder<B>>(),
            classifier_lr: StepDecayScheduler::new(
                config.learning_rate,
                config.classifier_lr_decay,
                config.decay_every,
            ),
            generator_lr: StepDecayScheduler::new(
                config.learning_rate,
                config.generator_lr_decay,
                config.decay_every,
            ),
            classifier_step: 0,
            generator_step: 0,
        }
    }

    /// Enter the next epoch, applying any scheduled decay. Returns (classifier, generator) rates.
    pub fn advance_epoch(&mut self) -> (f64, f64) {
        (self.classifier_lr.step(), self.generator_lr.step())
    }

    pub fn learning_rates(&self) -> (f64, f64) {
        (self.classifier_lr.current(), self.generator_lr.current())
    }

    /// Applied updates so far as (classifier, generator).
    pub fn global_steps(&self) -> (usize, usize) {
        (self.classifier_step, self.generator_step)
    }

    pub fn step_classifier(&mut self, model: Classifier<B>, grads: GradientsParams) -> Classifier<B> {
        self.classifier_step += 1;
        self.classifier.step(self.classifier_lr.current(), model, grads)
    }

    pub fn step_generator(&mut self, model: Autoencoder<B>, grads: GradientsParams) -> Autoencoder<B> {
        self.generator_step += 1;
        self.generator.step(self.generator_lr.current(), model, grads)
    }
}

/// Scalar log for one phase: one JSON object per epoch in `scalars.jsonl`.
pub struct SummaryWriter {
    dir: PathBuf,
    writer: BufWriter<File>,
}

#[derive(Serialize)]
struct ScalarRecord<'a> {
    epoch: usize,
    #[serde(flatten)]
    summary: &'a MetricsSummary,
}

impl SummaryWriter {
    pub fn create(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join("scalars.jsonl");
        let file = File::create(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        Ok(Self {
            dir,
            writer: BufWriter::new(file),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn add_summary(&mut self, epoch: usize, summary: &MetricsSummary) -> Result<()> {
        serde_json::to_writer(&mut self.writer, &ScalarRecord { epoch, summary })?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Train and test summary writers stamped with the run start time.
pub struct RunLogs {
    pub train: SummaryWriter,
    pub test: SummaryWriter,
}

impl RunLogs {
    pub fn create(log_dir: &Path, stamp: &str) -> Result<Self> {
        Ok(Self {
            train: SummaryWriter::create(log_dir.join(format!("train_{stamp}")))?,
            test: SummaryWriter::create(log_dir.join(format!("test_{stamp}")))?,
        })
    }

    pub fn close(self) -> Result<()> {
        self.train.close()?;
        self.test.close()
    }
}

/// Outcome of one train or test phase.
#[derive(Debug, Clone)]
pub struct PhaseReport {
    pub batches: usize,
    pub summary: MetricsSummary,
    pub images_written: usize,
}

#[derive(Debug, Clone)]
pub struct EpochReport {
    pub epoch: usize,
    pub classifier_lr: f64,
    pub generator_lr: f64,
    pub train: PhaseReport,
    pub test: PhaseReport,
}

#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub epochs: Vec<EpochReport>,
    pub classifier_steps: usize,
    pub generator_steps: usize,
    pub train_log_dir: PathBuf,
    pub test_log_dir: PathBuf,
}

/// Owns both networks, their optimizers, the metric accumulators and the batch stream.
pub struct Trainer<B: AutodiffBackend> {
    autoencoder: Autoencoder<B>,
    classifier: Classifier<B>,
    optimizers: OptimizerPair<B>,
    metrics: PhaseMetrics,
    stream: BatchStream,
    batcher: ImageBatcher,
    batch_size: usize,
    num_epochs: usize,
    device: B::Device,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(config: &TrainingConfig, device: B::Device) -> Self {
        Self {
            autoencoder: config.model.init_autoencoder(&device),
            classifier: config.model.init_classifier(&device),
            optimizers: OptimizerPair::new(config),
            metrics: PhaseMetrics::new(),
            stream: BatchStream::new(config.seed),
            batcher: ImageBatcher::new(config.data_config()),
            batch_size: config.batch_size,
            num_epochs: config.num_epochs,
            device,
        }
    }

    pub fn autoencoder(&self) -> &Autoencoder<B> {
        &self.autoencoder
    }

    pub fn classifier(&self) -> &Classifier<B> {
        &self.classifier
    }

    pub fn optimizers(&self) -> &OptimizerPair<B> {
        &self.optimizers
    }

    /// Decay check, then a train phase and a test phase. `dump` controls image output
    /// of the test phase.
    pub fn run_epoch(
        &mut self,
        epoch: usize,
        train_set: Arc<ImageDataset>,
        test_set: Arc<ImageDataset>,
        dump: ImageDumpPolicy<'_>,
    ) -> Result<EpochReport> {
        info!("EPOCH {}/{}", epoch + 1, self.num_epochs);

        let (lr_prev_cls, lr_prev_gen) = self.optimizers.learning_rates();
        let (classifier_lr, generator_lr) = self.optimizers.advance_epoch();
        if classifier_lr != lr_prev_cls || generator_lr != lr_prev_gen {
            info!(
                "decay learning rate: classifier {:.2e} -> {:.2e}, generator {:.2e} -> {:.2e}",
                lr_prev_cls, classifier_lr, lr_prev_gen, generator_lr
            );
        }

        let train = self.train_phase(train_set)?;
        info!(
            epoch = epoch + 1,
            loss = train.summary.loss,
            accuracy = train.summary.accuracy,
            ae_loss = train.summary.ae_loss,
            "train summary"
        );

        let test = self.eval_phase(test_set, dump)?;
        info!(
            epoch = epoch + 1,
            loss = test.summary.loss,
            accuracy = test.summary.accuracy,
            ae_loss = test.summary.ae_loss,
            images = test.images_written,
            "test summary"
        );

        Ok(EpochReport {
            epoch,
            classifier_lr,
            generator_lr,
            train,
            test,
        })
    }

    /// One optimizer step for each network on every training batch.
    pub fn train_phase(&mut self, dataset: Arc<ImageDataset>) -> Result<PhaseReport> {
        self.stream.bind(Phase::Train, dataset, self.batch_size)?;
        self.metrics.reset();
        let progress = phase_progress(Phase::Train, self.stream.num_batches()?)?;

        let mut batches = 0;
        while let Some(items) = self.stream.next_items()? {
            let batch: ImageBatch<B> = self.batcher.batch(items, &self.device);
            self.train_step(batch)?;
            batches += 1;

            let summary = self.metrics.summary();
            progress.set_message(format!(
                "loss {:.4},  acc: {:.3}",
                summary.ae_loss, summary.accuracy
            ));
            progress.inc(1);
        }
        progress.finish();

        Ok(PhaseReport {
            batches,
            summary: self.metrics.summary(),
            images_written: 0,
        })
    }

    /// Both gradient sets are taken against the weights the batch started with; the
    /// updated networks are installed afterwards.
    fn train_step(&mut self, batch: ImageBatch<B>) -> Result<()> {
        let labels = tensor_values(batch.labels.clone())?;

        let classification = classification_loss(&self.classifier, batch.images.clone(), batch.labels);
        let loss = classification.loss.clone().into_scalar().elem::<f64>();
        let predictions = tensor_values(classification.predictions)?;
        let classifier_grads =
            GradientsParams::from_grads(classification.loss.backward(), &self.classifier);

        let generator = generator_losses(&self.autoencoder, &self.classifier, batch.images);
        let ae_loss = generator.total.clone().into_scalar().elem::<f64>();
        let generator_grads =
            GradientsParams::from_grads(generator.total.backward(), &self.autoencoder);

        self.classifier = self
            .optimizers
            .step_classifier(self.classifier.clone(), classifier_grads);
        self.autoencoder = self
            .optimizers
            .step_generator(self.autoencoder.clone(), generator_grads);

        self.metrics.update(loss, ae_loss, &predictions, &labels);
        debug!(loss, ae_loss, "train step");
        Ok(())
    }

    /// Forward passes only, on the inner backend.
    pub fn eval_phase(
        &mut self,
        dataset: Arc<ImageDataset>,
        dump: ImageDumpPolicy<'_>,
    ) -> Result<PhaseReport> {
        let autoencoder = self.autoencoder.valid();
        let classifier = self.classifier.valid();

        self.stream.bind(Phase::Test, dataset, self.batch_size)?;
        self.metrics.reset();
        let progress = phase_progress(Phase::Test, self.stream.num_batches()?)?;

        let mut batches = 0;
        let mut images_written = 0;
        while let Some(items) = self.stream.next_items()? {
            let batch: ImageBatch<B::InnerBackend> = self.batcher.batch(items, &self.device);
            let labels = tensor_values(batch.labels.clone())?;
            let losses =
                compute_losses(&autoencoder, &classifier, batch.images.clone(), batch.labels);

            let loss = losses.classification.loss.into_scalar().elem::<f64>();
            let ae_loss = losses.generator.total.into_scalar().elem::<f64>();
            let predictions = tensor_values(losses.classification.predictions)?;
            self.metrics.update(loss, ae_loss, &predictions, &labels);

            if let ImageDumpPolicy::Write(dumper) = dump {
                images_written += dumper.write_batch(
                    batch.images,
                    losses.generator.reconstruction,
                    batches * self.batch_size,
                )?;
            }
            batches += 1;

            let summary = self.metrics.summary();
            progress.set_message(format!(
                "loss {:.4},  acc: {:.3}",
                summary.ae_loss, summary.accuracy
            ));
            progress.inc(1);
        }
        progress.finish();

        Ok(PhaseReport {
            batches,
            summary: self.metrics.summary(),
            images_written,
        })
    }

    /// Save both networks with the compact recorder.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let recorder = CompactRecorder::new();
        self.autoencoder
            .clone()
            .save_file(dir.join("autoencoder"), &recorder)
            .map_err(|err| anyhow::anyhow!("failed to save autoencoder: {err:?}"))?;
        self.classifier
            .clone()
            .save_file(dir.join("classifier"), &recorder)
            .map_err(|err| anyhow::anyhow!("failed to save classifier: {err:?}"))?;
        Ok(())
    }
}

fn phase_progress(phase: Phase, len: usize) -> Result<ProgressBar> {
    let progress = ProgressBar::new(len as u64);
    progress.set_style(
        ProgressStyle::with_template("{prefix:>6} [{bar:30}] {pos}/{len}  {msg}")?
            .progress_chars("=> "),
    );
    progress.set_prefix(phase.name());
    Ok(progress)
}

/// Load both splits, train for `num_epochs` and write images on the final epoch.
pub fn train<B: AutodiffBackend>(config: TrainingConfig, device: B::Device) -> Result<TrainingReport> {
    config.validate()?;
    let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();

    let data_dir = PathBuf::from(&config.data_dir);
    let data_config = config.data_config();
    let train_dir = data_dir.join("train");
    let val_dir = data_dir.join("val");
    let mut train_samples = load_image_folder(&train_dir, &data_config)
        .with_context(|| format!("failed to load {}", train_dir.display()))?;
    let mut val_samples = load_image_folder(&val_dir, &data_config)
        .with_context(|| format!("failed to load {}", val_dir.display()))?;
    info!(
        "train examples -> {}, val examples -> {}",
        train_samples.len(),
        val_samples.len()
    );

    // Statistics come from the training split only.
    let normalization = Normalization::fit(&train_samples)?;
    normalization.apply(&mut train_samples)?;
    normalization.apply(&mut val_samples)?;
    let train_set = Arc::new(ImageDataset::new(train_samples));
    let val_set = Arc::new(ImageDataset::new(val_samples));

    let mut logs = RunLogs::create(Path::new(&config.log_dir), &stamp)?;
    config
        .save(logs.train.dir().join("config.json"))
        .context("failed to save config")?;

    B::seed(&device, config.seed);

    let dumper = ImageDumper::new(
        PathBuf::from(&config.output_dir),
        normalization,
        config.model.channels,
        config.model.image_size,
        config.segmentation_threshold,
    );
    let mut trainer = Trainer::<B>::new(&config, device);
    let mut epochs = Vec::with_capacity(config.num_epochs);

    for epoch in 0..config.num_epochs {
        let dump = if epoch + 1 == config.num_epochs {
            ImageDumpPolicy::Write(&dumper)
        } else {
            ImageDumpPolicy::Skip
        };
        let report = trainer.run_epoch(epoch, train_set.clone(), val_set.clone(), dump)?;
        logs.train.add_summary(epoch, &report.train.summary)?;
        logs.test.add_summary(epoch, &report.test.summary)?;
        epochs.push(report);
    }

    let train_log_dir = logs.train.dir().to_path_buf();
    let test_log_dir = logs.test.dir().to_path_buf();
    logs.close()?;

    if config.save_model {
        let model_dir = PathBuf::from(&config.output_dir).join("model");
        trainer.save(&model_dir)?;
        info!("network model is saved in {}", model_dir.display());
    }

    let (classifier_steps, generator_steps) = trainer.optimizers().global_steps();
    info!("training completed, logs are saved in {}", Path::new(&config.log_dir).display());

    Ok(TrainingReport {
        epochs,
        classifier_steps,
        generator_steps,
        train_log_dir,
        test_log_dir,
    })
}
