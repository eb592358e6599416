use std::path::PathBuf;

use candle_core::{
    backprop::GradStore,
    utils::{cuda_is_available, metal_is_available},
    DType, Device, Tensor, D,
};
use model::RevNet;

use crate::{
    checkpoint::{self, CheckpointDescriptor, LoadOutcome, RngSnapshot, TrainingProgressSnapshot},
    config::DataLayout,
    data::{Batch, BlockingDataLoader, DatasetOptions, RecordDataset, RecordLoader},
    logging::{EvaluationReport, Logger, LoggingSettings},
    metrics::{EvaluationMetrics, EvaluationSummary},
    optimizer::MomentumSgd,
    scheduler::PiecewiseConstant,
    TrainingConfig, TrainingError,
};

/// Per-invocation options that come from the command line rather than the
/// hyperparameter bundle.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Directory holding the serialized dataset splits. Must exist.
    pub data_dir: PathBuf,
    /// Enables checkpointing and summary logging when set.
    pub train_dir: Option<PathBuf>,
    /// Restore the latest checkpoint from `train_dir` before training.
    pub restore: bool,
    /// Hold out a validation split and report it alongside train/test.
    pub validate: bool,
    /// Use the activation-reconstruction gradient path instead of autodiff.
    pub manual_grad: bool,
}

/// Drives the whole session: warmup, the training loop, periodic
/// evaluation and checkpointing.
pub struct Trainer {
    config: TrainingConfig,
    session: SessionOptions,
    device: Device,
    model: RevNet,
    optimizer: MomentumSgd,
    schedule: PiecewiseConstant,
    train_loader: BlockingDataLoader<RecordLoader>,
    eval_train: RecordDataset,
    eval_test: RecordDataset,
    eval_validation: Option<RecordDataset>,
    logger: Logger,
    progress: TrainingProgressSnapshot,
    rng: RngSnapshot,
}

impl Trainer {
    pub fn new(config: TrainingConfig, session: SessionOptions) -> Result<Self, TrainingError> {
        config.validate()?;

        // Nothing is built before the data directory check so a bad path
        // fails immediately instead of after model initialization.
        if !session.data_dir.is_dir() {
            return Err(TrainingError::initialization(format!(
                "data directory {} does not exist",
                session.data_dir.display()
            )));
        }

        let device = select_device();
        if let Err(err) = device.set_seed(config.runtime.seed) {
            eprintln!("warning: failed to seed device RNG: {}", err);
        }

        // A held-out run trains on the reduced split; otherwise the full
        // training set is used. Evaluation always covers the full training
        // set (without augmentation) and the test set.
        let train_split = if session.validate { "train" } else { "train_all" };
        let input_shape = config.model.input_shape;
        let train_dataset = RecordDataset::open(&session.data_dir, train_split, input_shape)?;
        let eval_train = RecordDataset::open(&session.data_dir, "train_all", input_shape)?;
        let eval_test = RecordDataset::open(&session.data_dir, "test", input_shape)?;
        let eval_validation = if session.validate {
            Some(RecordDataset::open(
                &session.data_dir,
                "validation",
                input_shape,
            )?)
        } else {
            None
        };

        let train_options = DatasetOptions {
            batch_size: config.data.batch_size,
            epochs: config.data.epochs,
            shuffle: config.data.shuffle,
            augment: config.data.augment,
            layout: config.data.layout,
            dtype: config.runtime.precision.to_dtype(),
            seed: config.runtime.seed,
        };
        let train_loader =
            BlockingDataLoader::new(train_dataset.loader(train_options, &device));

        let model = RevNet::new(config.to_model_config(device.clone()))
            .map_err(|err| TrainingError::initialization(format!("failed to build model: {err}")))?;

        let schedule = PiecewiseConstant::new(
            config.optimizer.decay_boundaries.clone(),
            config.optimizer.learning_rates.clone(),
        )?;
        let optimizer = MomentumSgd::new(
            model.parameters(),
            config.optimizer.momentum,
            config.optimizer.weight_decay,
            schedule.lr_for_step(1),
        )?;

        let logger = Logger::new(LoggingSettings::new(
            true,
            session.train_dir.clone(),
            1,
        ))?;

        let rng = RngSnapshot {
            master_seed: config.runtime.seed,
        };

        Ok(Self {
            config,
            session,
            device,
            model,
            optimizer,
            schedule,
            train_loader,
            eval_train,
            eval_test,
            eval_validation,
            logger,
            progress: TrainingProgressSnapshot::default(),
            rng,
        })
    }

    pub fn global_step(&self) -> usize {
        self.optimizer.global_step()
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Restores the newest checkpoint under `train_dir`, if one exists.
    /// Without a `train_dir` (or without checkpoints) this is a no-op.
    pub fn resume_from_latest(&mut self) -> Result<Option<CheckpointDescriptor>, TrainingError> {
        let Some(train_dir) = self.session.train_dir.clone() else {
            return Ok(None);
        };
        let Some(descriptor) = checkpoint::latest_checkpoint(&train_dir)? else {
            return Ok(None);
        };
        let outcome = checkpoint::load_checkpoint(&descriptor.directory)?;
        self.apply_checkpoint(outcome)?;
        Ok(Some(descriptor))
    }

    fn apply_checkpoint(&mut self, outcome: LoadOutcome) -> Result<(), TrainingError> {
        checkpoint::apply_model_weights(&self.model, &outcome.model_weights_path)?;
        self.optimizer.load_state(outcome.optimizer_state)?;
        self.progress = outcome.manifest.progress;
        self.rng = outcome.manifest.rng;
        self.fast_forward_data_loader(self.progress.global_step)?;
        Ok(())
    }

    /// Replays `steps` batches so a resumed run continues from the same
    /// position in the shuffled sequence as the interrupted one.
    fn fast_forward_data_loader(&mut self, steps: usize) -> Result<(), TrainingError> {
        for _ in 0..steps {
            if self.train_loader.next_batch()?.is_none() {
                break;
            }
        }
        Ok(())
    }

    /// Runs the model on random input before the loop starts so one-time
    /// lazy initialization cost is not attributed to the first step.
    pub fn warmup(&mut self) -> Result<(), TrainingError> {
        let [c, h, w] = self.config.model.input_shape;
        let batch = self.config.data.batch_size;
        let shape = match self.config.data.layout {
            DataLayout::ChannelsFirst => (batch, c, h, w),
            DataLayout::ChannelsLast => (batch, h, w, c),
        };
        for _ in 0..self.config.runtime.warmup_steps {
            let mock = Tensor::randn(0f32, 1f32, shape, &self.device)
                .map_err(to_runtime_error)?
                .to_dtype(self.config.runtime.precision.to_dtype())
                .map_err(to_runtime_error)?;
            self.model.forward(&mock).map_err(to_runtime_error)?;
        }
        Ok(())
    }

    pub fn train(&mut self) -> Result<(), TrainingError> {
        self.train_with_shutdown(|| false)
    }

    pub fn train_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<(), TrainingError>
    where
        F: FnMut() -> bool,
    {
        self.warmup()?;
        println!("starting training on {:?}", self.device);

        loop {
            if should_stop() {
                break;
            }

            let Some(batch) = self.train_loader.next_batch()? else {
                break;
            };

            let loss = self.train_one_iter(&batch)?;
            let step = self.optimizer.global_step();
            self.progress = TrainingProgressSnapshot {
                global_step: step,
                epoch: batch.epoch,
            };

            if step % self.config.runtime.log_every == 0 {
                self.logger.log_training_step(step, loss);
                self.log_metrics(step)?;
            }
            if step % self.config.runtime.save_every == 0 {
                self.maybe_checkpoint(step)?;
            }
        }

        self.logger.flush();
        Ok(())
    }

    fn train_one_iter(&mut self, batch: &Batch) -> Result<f64, TrainingError> {
        // Learning rate for the step about to be performed.
        let lr = self.schedule.lr_for_step(self.optimizer.global_step() + 1);
        self.optimizer.set_learning_rate(lr);

        let (mut grads, loss): (GradStore, Tensor) = if self.session.manual_grad {
            self.model
                .compute_gradients(&batch.images, &batch.labels)
                .map_err(to_runtime_error)?
        } else {
            let logits = self.model.forward(&batch.images).map_err(to_runtime_error)?;
            let loss = self
                .model
                .compute_loss(&logits, &batch.labels)
                .map_err(to_runtime_error)?;
            let grads = loss.backward().map_err(to_runtime_error)?;
            (grads, loss)
        };

        self.optimizer.step(&mut grads)?;

        let loss = loss
            .to_dtype(DType::F32)
            .and_then(|value| value.to_vec0::<f32>())
            .map_err(to_runtime_error)?;
        Ok(loss as f64)
    }

    /// One full pass over a split in inference mode. Never mutates
    /// parameters; a fresh loader is built per call so repeated passes see
    /// the split from the start.
    pub fn evaluate(&self, dataset: &RecordDataset) -> Result<EvaluationSummary, TrainingError> {
        let options = DatasetOptions::evaluation(
            self.config.data.eval_batch_size,
            self.config.data.layout,
            self.config.runtime.precision.to_dtype(),
        );
        let mut loader = BlockingDataLoader::new(dataset.loader(options, &self.device));
        let mut metrics = EvaluationMetrics::default();

        while let Some(batch) = loader.next_batch()? {
            let logits = self.model.forward(&batch.images).map_err(to_runtime_error)?;
            let loss = self
                .model
                .compute_loss(&logits, &batch.labels)
                .map_err(to_runtime_error)?
                .to_vec0::<f32>()
                .map_err(to_runtime_error)?;

            let predictions = logits
                .to_dtype(DType::F32)
                .and_then(|values| values.argmax(D::Minus1))
                .map_err(to_runtime_error)?;
            let correct = predictions
                .eq(&batch.labels)
                .and_then(|matches| matches.to_dtype(DType::F32))
                .and_then(|matches| matches.sum_all())
                .and_then(|total| total.to_vec0::<f32>())
                .map_err(to_runtime_error)? as u64;

            metrics.update(loss as f64, correct, batch.examples as u64);
        }

        metrics.finalize().ok_or_else(|| {
            TrainingError::runtime(format!(
                "evaluation of split '{}' saw no examples",
                dataset.split()
            ))
        })
    }

    /// Convenience accessor for evaluating the test split directly.
    pub fn evaluate_test(&self) -> Result<EvaluationSummary, TrainingError> {
        self.evaluate(&self.eval_test)
    }

    fn log_metrics(&mut self, step: usize) -> Result<(), TrainingError> {
        let train = self.evaluate(&self.eval_train)?;
        let test = self.evaluate(&self.eval_test)?;
        let validation = match &self.eval_validation {
            Some(dataset) => Some(self.evaluate(dataset)?),
            None => None,
        };

        self.logger.log_evaluation(
            step,
            &EvaluationReport {
                train: &train,
                test: &test,
                validation: validation.as_ref(),
            },
        );
        Ok(())
    }

    fn maybe_checkpoint(&mut self, step: usize) -> Result<(), TrainingError> {
        let Some(train_dir) = self.session.train_dir.clone() else {
            return Ok(());
        };
        let descriptor = checkpoint::save_checkpoint(checkpoint::SaveRequest {
            base_dir: &train_dir,
            config: &self.config,
            model: &self.model,
            optimizer: &self.optimizer,
            progress: self.progress,
            rng: self.rng,
            max_keep: self.config.runtime.max_checkpoints,
        })?;
        self.logger.log_checkpoint(step, &descriptor.directory);
        Ok(())
    }
}

fn select_device() -> Device {
    if metal_is_available() {
        match Device::new_metal(0) {
            Ok(device) => device,
            Err(err) => {
                eprintln!("failed to initialize metal device, falling back to CPU: {err}");
                Device::Cpu
            }
        }
    } else if cuda_is_available() {
        match Device::cuda_if_available(0) {
            Ok(device) => device,
            Err(err) => {
                eprintln!("cuda reported available but initialization failed: {err}");
                Device::Cpu
            }
        }
    } else {
        Device::Cpu
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
