/// Training loop for depth estimation models
use std::collections::BTreeMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{ModuleT, VarBuilder, VarMap};

use super::checkpoint::Checkpoint;
use super::ema::{EMAConfig, EMA};
use super::history::{EpochRecord, History};
use super::optimizer::{Adam, AdamConfig};
use super::scheduler::LrScheduler;
use super::telemetry::{NullSink, ScalarSink};
use super::timer::Timer;
use crate::config::TrainConfig;
use crate::data::{Batch, BatchStream};
use crate::losses::{build_criterion, Criterion, L1Loss};
use crate::metrics::{check_pair, MeanMetric, Metric, MetricCollection};
use crate::models::{model_factory, ModelFactory};
use crate::utils::{count_varmap_parameters, ensure_device, named_vars};
use crate::{DepthError, Result};

/// Periodic checkpoint file name for `epoch`
pub fn epoch_checkpoint_name(epoch: usize) -> String {
    format!("{}_epoch.safetensors", epoch)
}

pub const FINAL_CHECKPOINT: &str = "checkpoint.safetensors";
pub const EMA_EXPORT: &str = "ema_model.safetensors";
pub const HISTORY_FILE: &str = "history.csv";

/// Assembles a [`Trainer`]
pub struct TrainerBuilder {
    factory: ModelFactory,
    criterion: Option<Box<dyn Criterion>>,
    metrics: Option<MetricCollection>,
    optimizer: AdamConfig,
    ema_weight: f64,
    sink: Option<Box<dyn ScalarSink>>,
}

impl TrainerBuilder {
    /// Start from a model factory; loss defaults to L1 and metrics to the depth set
    pub fn new(factory: ModelFactory) -> Self {
        Self {
            factory,
            criterion: None,
            metrics: None,
            optimizer: AdamConfig::default(),
            ema_weight: EMAConfig::default().weight,
            sink: None,
        }
    }

    /// Resolve every registry key of a validated configuration
    pub fn from_config(config: &TrainConfig) -> Result<Self> {
        config.validate()?;
        let builder = Self::new(model_factory(&config.model)?)
            .criterion(build_criterion(&config.loss)?)
            .metrics(MetricCollection::from_names(&config.metrics)?)
            .optimizer(AdamConfig {
                lr: config.learning_rate,
                weight_decay: config.weight_decay,
                ..Default::default()
            })
            .ema_weight(config.ema_weight);
        Ok(builder)
    }

    pub fn criterion(mut self, criterion: Box<dyn Criterion>) -> Self {
        self.criterion = Some(criterion);
        self
    }

    pub fn metrics(mut self, metrics: MetricCollection) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn optimizer(mut self, config: AdamConfig) -> Self {
        self.optimizer = config;
        self
    }

    pub fn ema_weight(mut self, weight: f64) -> Self {
        self.ema_weight = weight;
        self
    }

    pub fn sink(mut self, sink: Box<dyn ScalarSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Allocate parameters on `device` and build the trainer
    pub fn build(self, device: &Device) -> Result<Trainer> {
        let ema = EMA::new(EMAConfig {
            weight: self.ema_weight,
        })?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = (self.factory)(vb)?;
        let optimizer = Adam::new(named_vars(&varmap)?, self.optimizer)?;

        log::info!(
            "Model parameters: {} ({} tensors) on {:?}",
            count_varmap_parameters(&varmap),
            optimizer.params().len(),
            device
        );

        Ok(Trainer {
            factory: self.factory,
            varmap,
            model,
            optimizer,
            criterion: self.criterion.unwrap_or_else(|| Box::new(L1Loss)),
            metrics: self.metrics.unwrap_or_else(MetricCollection::depth_default),
            loss_meter: MeanMetric::new(),
            ema,
            timer: Timer::new(),
            sink: self.sink.unwrap_or_else(|| Box::new(NullSink)),
            history: History::new(),
            device: device.clone(),
        })
    }
}

/// Trainer for depth estimation models
///
/// Owns the parameters, optimizer, EMA shadows, accumulators and history.
/// All mutation happens on the calling thread, one batch at a time.
pub struct Trainer {
    factory: ModelFactory,
    varmap: VarMap,
    model: Box<dyn ModuleT>,
    optimizer: Adam,
    criterion: Box<dyn Criterion>,
    metrics: MetricCollection,
    loss_meter: MeanMetric,
    ema: EMA,
    timer: Timer,
    sink: Box<dyn ScalarSink>,
    history: History,
    device: Device,
}

impl Trainer {
    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn optimizer(&self) -> &Adam {
        &self.optimizer
    }

    pub fn ema(&self) -> &EMA {
        &self.ema
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Live parameters sorted by name
    pub fn named_parameters(&self) -> Result<Vec<(String, Var)>> {
        named_vars(&self.varmap)
    }

    fn prepare(&self, image: &Tensor, target: &Tensor) -> Result<(Tensor, Tensor)> {
        ensure_device(image, &self.device, "image batch")?;
        ensure_device(target, &self.device, "target batch")?;
        Ok((image.to_dtype(DType::F32)?, target.to_dtype(DType::F32)?))
    }

    /// Reject NaN or infinite losses before they reach the parameters
    fn finite_loss(loss: &Tensor) -> Result<f64> {
        let value = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        if value.is_finite() {
            Ok(value)
        } else {
            Err(DepthError::Training(format!("non-finite loss {}", value)))
        }
    }

    fn fold(&mut self, loss: f64, batch_size: usize, pred: &Tensor, target: &Tensor) -> Result<()> {
        self.loss_meter.update_value(loss, batch_size)?;
        self.metrics.update(pred, target)
    }

    /// Forward, backward and one optimizer step; returns the batch loss
    ///
    /// A non-finite loss is an error and leaves parameters, optimizer and EMA
    /// untouched.
    pub fn train_one_batch(&mut self, image: &Tensor, target: &Tensor) -> Result<f64> {
        let (image, target) = self.prepare(image, target)?;
        let batch_size = image.dim(0)?;

        let pred = self.model.forward_t(&image, true)?;
        check_pair(&pred, &target)?;

        let loss = self.criterion.loss(&pred, &target)?;
        let loss_value = Self::finite_loss(&loss)?;

        let grads = loss.backward()?;
        self.optimizer.step(&grads)?;
        self.ema.update(self.optimizer.params())?;

        self.fold(loss_value, batch_size, &pred, &target)?;
        Ok(loss_value)
    }

    /// Forward only, in eval mode; returns the batch loss
    pub fn val_one_batch(&mut self, image: &Tensor, target: &Tensor) -> Result<f64> {
        let (image, target) = self.prepare(image, target)?;
        let batch_size = image.dim(0)?;

        let pred = self.model.forward_t(&image, false)?;
        check_pair(&pred, &target)?;

        let loss_value = Self::finite_loss(&self.criterion.loss(&pred, &target)?)?;

        self.fold(loss_value, batch_size, &pred, &target)?;
        Ok(loss_value)
    }

    /// Depth prediction in eval mode with the live weights
    pub fn predict(&self, image: &Tensor) -> Result<Tensor> {
        ensure_device(image, &self.device, "image batch")?;
        Ok(self.model.forward_t(&image.to_dtype(DType::F32)?, false)?)
    }

    /// Report the current phase to the sink and return it; state is kept
    ///
    /// Returns `<prefix>loss`, every metric as `<prefix><name>` and
    /// `<prefix>time` (whole seconds, not sent to the sink).
    pub fn get_metrics_dict(&mut self, prefix: &str, step: usize) -> Result<Vec<(String, f64)>> {
        let elapsed = self.timer.stop();

        let loss_key = format!("{}loss", prefix);
        let loss = self.loss_meter.compute().map_err(|e| match e {
            DepthError::EmptyMetric(_) => DepthError::EmptyMetric(loss_key.clone()),
            other => other,
        })?;

        let mut values = vec![(loss_key, loss)];
        values.extend(self.metrics.compute(prefix)?);
        for (tag, value) in &values {
            self.sink.add_scalar(tag, *value, step)?;
        }

        values.push((format!("{}time", prefix), elapsed.trunc()));
        Ok(values)
    }

    /// Clear the loss meter, every metric and the phase timer
    pub fn reset_metrics(&mut self) {
        self.timer.reset();
        self.loss_meter.reset();
        self.metrics.reset();
    }

    fn run_pass(
        &mut self,
        epoch: usize,
        stream: &mut dyn BatchStream,
        training: bool,
        verbosity: usize,
    ) -> Result<Vec<(String, f64)>> {
        let (phase, prefix) = if training {
            ("Training", "train/")
        } else {
            ("Validating", "val/")
        };

        // Accumulators start empty even after a failed pass
        self.reset_metrics();
        stream.reset();
        let total = stream.num_batches();
        self.timer.start();

        let mut i = 0;
        while let Some(batch) = stream.next_batch(&self.device)? {
            i += 1;
            if training {
                self.train_one_batch(&batch.image, &batch.target)?;
            } else {
                self.val_one_batch(&batch.image, &batch.target)?;
            }

            if verbosity > 0 && i % verbosity == 0 {
                log::info!(
                    "Epoch {} {} [{}/{}] [{}]",
                    epoch,
                    phase,
                    i,
                    total,
                    self.timer.progress(i, total)
                );
            }
        }
        if i == 0 {
            return Err(DepthError::Data(format!(
                "{} stream produced no batches",
                phase
            )));
        }

        let values = self.get_metrics_dict(prefix, epoch)?;
        self.reset_metrics();
        Ok(values)
    }

    /// One training pass and one validation pass; appends the epoch to history
    ///
    /// `epoch` must be the next history index (`history().len() + 1`).
    pub fn train_one_epoch(
        &mut self,
        epoch: usize,
        train: &mut dyn BatchStream,
        val: &mut dyn BatchStream,
        verbosity: usize,
    ) -> Result<EpochRecord> {
        let expected = self.history.len() + 1;
        if epoch != expected {
            return Err(DepthError::Training(format!(
                "epoch {} requested but history holds {} epochs",
                epoch,
                self.history.len()
            )));
        }

        let lr = self.optimizer.learning_rate();
        let mut values = self.run_pass(epoch, train, true, verbosity)?;
        values.extend(self.run_pass(epoch, val, false, verbosity)?);

        let record = EpochRecord { epoch, lr, values };
        self.history.push(record.clone())?;
        Ok(record)
    }

    /// Train until `num_epochs` epochs are in history
    ///
    /// Resumes after the last recorded epoch. A scheduler is first advanced
    /// past the recorded epochs, then sets the rate before each epoch. History
    /// is rewritten after every epoch, a `<epoch>_epoch.safetensors`
    /// checkpoint is written when `checkpoint_interval > 0` divides the epoch,
    /// and the final checkpoint, EMA export and history land in
    /// `checkpoint_dir` at the end.
    #[allow(clippy::too_many_arguments)]
    pub fn train<P: AsRef<Path>>(
        &mut self,
        num_epochs: usize,
        train: &mut dyn BatchStream,
        val: &mut dyn BatchStream,
        mut scheduler: Option<&mut dyn LrScheduler>,
        verbosity: usize,
        checkpoint_interval: usize,
        checkpoint_dir: P,
    ) -> Result<()> {
        let dir = checkpoint_dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let start = self.history.len() + 1;
        if let Some(s) = scheduler.as_deref_mut() {
            for _ in 1..start {
                s.step();
            }
        }

        log::info!(
            "Starting training: epochs {}..={}, {} train / {} val batches per epoch",
            start,
            num_epochs,
            train.num_batches(),
            val.num_batches()
        );

        let run_timer = Timer::new();
        let planned = (num_epochs + 1).saturating_sub(start);
        for epoch in start..=num_epochs {
            log::info!(
                "Training {}/{} [[{}]]",
                epoch,
                num_epochs,
                run_timer.progress(epoch - start, planned)
            );

            if let Some(s) = scheduler.as_deref() {
                self.optimizer.set_learning_rate(s.get_lr());
            }

            let record = self.train_one_epoch(epoch, train, val, verbosity)?;
            log::info!("{}", record.summary());
            self.history.write_csv(dir.join(HISTORY_FILE))?;

            if let Some(s) = scheduler.as_deref_mut() {
                s.step();
            }

            if checkpoint_interval > 0 && epoch % checkpoint_interval == 0 {
                self.save_checkpoint(dir.join(epoch_checkpoint_name(epoch)))?;
            }
        }

        log::info!("Training complete!");
        self.save_checkpoint(dir.join(FINAL_CHECKPOINT))?;
        if self.ema.is_initialized() {
            self.save_ema_weights(dir.join(EMA_EXPORT))?;
        } else {
            log::warn!("No training step taken, skipping EMA export");
        }
        self.history.write_csv(dir.join(HISTORY_FILE))?;
        Ok(())
    }

    /// Eval-mode pass over `stream`, handing each prediction and its batch to `on_batch`
    pub fn test<F>(&mut self, stream: &mut dyn BatchStream, verbosity: usize, mut on_batch: F) -> Result<()>
    where
        F: FnMut(Tensor, Batch) -> Result<()>,
    {
        stream.reset();
        let total = stream.num_batches();
        self.timer.start();

        let mut i = 0;
        while let Some(batch) = stream.next_batch(&self.device)? {
            i += 1;
            let pred = self.predict(&batch.image)?;
            if verbosity > 0 && i % verbosity == 0 {
                log::info!("Testing [{}/{}] [{}]", i, total, self.timer.progress(i, total));
            }
            on_batch(pred, batch)?;
        }

        self.timer.reset();
        Ok(())
    }

    /// Snapshot of parameters, optimizer state and history
    pub fn checkpoint(&self) -> Result<Checkpoint> {
        let model: BTreeMap<String, Tensor> = named_vars(&self.varmap)?
            .into_iter()
            .map(|(name, var)| Ok((name, var.as_detached_tensor().copy()?)))
            .collect::<Result<_>>()?;

        Ok(Checkpoint {
            model,
            optimizer: self.optimizer.state_dict(),
            history: self.history.clone(),
        })
    }

    pub fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        log::info!("Saving checkpoint to {:?}", path.as_ref());
        self.checkpoint()?.save(path)
    }

    pub fn load_checkpoint<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let checkpoint = Checkpoint::load(path, &self.device)?;
        self.restore(checkpoint)
    }

    /// Replace parameters, optimizer state and history with `checkpoint`
    ///
    /// Everything is validated before any state changes. The EMA restarts
    /// from the restored parameters.
    pub fn restore(&mut self, checkpoint: Checkpoint) -> Result<()> {
        let Checkpoint {
            model,
            optimizer,
            history,
        } = checkpoint;

        let params = named_vars(&self.varmap)?;
        if params.len() != model.len() {
            return Err(DepthError::Checkpoint(format!(
                "checkpoint has {} parameters, model has {}",
                model.len(),
                params.len()
            )));
        }
        let mut values = Vec::with_capacity(params.len());
        for (name, var) in &params {
            let tensor = model.get(name).ok_or_else(|| {
                DepthError::Checkpoint(format!("checkpoint is missing parameter '{}'", name))
            })?;
            if tensor.dims() != var.dims() {
                return Err(DepthError::Checkpoint(format!(
                    "parameter '{}' has shape {:?} in checkpoint, {:?} in model",
                    name,
                    tensor.dims(),
                    var.dims()
                )));
            }
            values.push(tensor.to_device(&self.device)?.to_dtype(var.dtype())?);
        }

        self.optimizer.load_state_dict(optimizer)?;
        for ((_, var), value) in params.iter().zip(values.iter()) {
            var.set(value)?;
        }
        self.history = history;
        self.ema.copy_from(&params)?;
        self.reset_metrics();
        Ok(())
    }

    /// Read-only model built from the EMA shadow weights
    pub fn ema_model(&self) -> Result<Box<dyn ModuleT>> {
        if !self.ema.is_initialized() {
            return Err(DepthError::Training(
                "EMA has no weights yet; run at least one training step".to_string(),
            ));
        }
        let vb = VarBuilder::from_tensors(self.ema.to_tensor_map(), DType::F32, &self.device);
        Ok((self.factory)(vb)?)
    }

    pub fn save_ema_weights<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        log::info!("Saving EMA weights to {:?}", path.as_ref());
        self.ema.save(path)
    }

    /// Move parameters, optimizer state and EMA shadows to `device`
    ///
    /// Every copy is made before anything is replaced; on error the trainer
    /// stays on its current device.
    pub fn to(&mut self, device: &Device) -> Result<()> {
        if self.device.same_device(device) {
            return Ok(());
        }

        let varmap = VarMap::new();
        {
            let mut data = varmap
                .data()
                .lock()
                .map_err(|e| DepthError::Training(format!("VarMap lock poisoned: {}", e)))?;
            for (name, var) in named_vars(&self.varmap)? {
                let moved = Var::from_tensor(&var.as_tensor().to_device(device)?)?;
                data.insert(name, moved);
            }
        }

        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = (self.factory)(vb)?;
        let params = named_vars(&varmap)?;
        let shadows = self.ema.moved_to(device)?;

        // Last fallible step; it only commits on success
        self.optimizer.rebind(params, device)?;
        self.ema.replace_shadows(shadows);
        self.varmap = varmap;
        self.model = model;
        self.device = device.clone();
        log::info!("Trainer moved to {:?}", device);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DepthDataLoader, DepthDataset};
    use crate::metrics::ThresholdAccuracy;
    use crate::models::{boxed, PixelLinear};

    fn pixel_linear_factory() -> ModelFactory {
        boxed(|vb| Ok(Box::new(PixelLinear::new(3, vb)?) as Box<dyn ModuleT>))
    }

    fn trainer() -> Result<Trainer> {
        let metrics = MetricCollection::new().with("TA1", Box::new(ThresholdAccuracy::new(1.25)))?;
        TrainerBuilder::new(pixel_linear_factory())
            .metrics(metrics)
            .optimizer(AdamConfig {
                lr: 1e-2,
                ..Default::default()
            })
            .ema_weight(0.5)
            .build(&Device::Cpu)
    }

    fn loader(n: usize, batch_size: usize) -> Result<DepthDataLoader> {
        let device = Device::Cpu;
        let images = Tensor::rand(0f32, 1.0, (n, 3, 4, 4), &device)?;
        let depths = Tensor::rand(1f32, 2.0, (n, 4, 4), &device)?;
        DepthDataLoader::new(DepthDataset::with_default_ids(images, depths)?, batch_size, false, None)
    }

    #[test]
    fn test_train_one_batch_updates_params_and_ema() -> Result<()> {
        let mut trainer = trainer()?;
        let before: Vec<Vec<f32>> = trainer
            .named_parameters()?
            .iter()
            .map(|(_, v)| v.as_tensor().flatten_all()?.to_vec1::<f32>())
            .collect::<candle_core::Result<_>>()?;

        let image = Tensor::rand(0f32, 1.0, (2, 3, 4, 4), &Device::Cpu)?;
        let target = Tensor::ones((2, 1, 4, 4), DType::F32, &Device::Cpu)?;
        let loss = trainer.train_one_batch(&image, &target)?;
        assert!(loss.is_finite());

        let after: Vec<Vec<f32>> = trainer
            .named_parameters()?
            .iter()
            .map(|(_, v)| v.as_tensor().flatten_all()?.to_vec1::<f32>())
            .collect::<candle_core::Result<_>>()?;
        assert_ne!(before, after);
        assert!(trainer.ema().is_initialized());
        Ok(())
    }

    #[test]
    fn test_shape_mismatch_is_data_error() -> Result<()> {
        let mut trainer = trainer()?;
        let image = Tensor::zeros((2, 3, 4, 4), DType::F32, &Device::Cpu)?;
        let target = Tensor::zeros((2, 1, 5, 5), DType::F32, &Device::Cpu)?;
        assert!(matches!(
            trainer.train_one_batch(&image, &target),
            Err(DepthError::Data(_))
        ));
        assert!(matches!(
            trainer.val_one_batch(&image, &target),
            Err(DepthError::Data(_))
        ));
        Ok(())
    }

    #[test]
    fn test_metrics_before_updates_are_empty() -> Result<()> {
        let mut trainer = trainer()?;
        match trainer.get_metrics_dict("val/", 1) {
            Err(DepthError::EmptyMetric(name)) => assert_eq!(name, "val/loss"),
            other => panic!("expected EmptyMetric, got {:?}", other.map(|_| ())),
        }
        Ok(())
    }

    #[test]
    fn test_get_metrics_dict_keys_and_no_reset() -> Result<()> {
        let mut trainer = trainer()?;
        let image = Tensor::zeros((2, 3, 4, 4), DType::F32, &Device::Cpu)?;
        let target = Tensor::ones((2, 1, 4, 4), DType::F32, &Device::Cpu)?;
        trainer.val_one_batch(&image, &target)?;

        let first = trainer.get_metrics_dict("val/", 1)?;
        let keys: Vec<&str> = first.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["val/loss", "val/TA1", "val/time"]);

        let second = trainer.get_metrics_dict("val/", 1)?;
        assert_eq!(first[0], second[0]);

        trainer.reset_metrics();
        assert!(trainer.get_metrics_dict("val/", 1).is_err());
        Ok(())
    }

    #[test]
    fn test_epoch_index_must_follow_history() -> Result<()> {
        let mut trainer = trainer()?;
        let mut train = loader(4, 2)?;
        let mut val = loader(2, 2)?;
        assert!(matches!(
            trainer.train_one_epoch(2, &mut train, &mut val, 0),
            Err(DepthError::Training(_))
        ));

        let record = trainer.train_one_epoch(1, &mut train, &mut val, 1)?;
        assert_eq!(record.epoch, 1);
        assert_eq!(record.lr, 1e-2);
        assert!(record.get("train/loss").is_some());
        assert!(record.get("val/TA1").is_some());
        assert_eq!(trainer.history().len(), 1);
        Ok(())
    }

    #[test]
    fn test_ema_model_requires_training() -> Result<()> {
        let mut trainer = trainer()?;
        assert!(trainer.ema_model().is_err());

        let image = Tensor::rand(0f32, 1.0, (1, 3, 4, 4), &Device::Cpu)?;
        let target = Tensor::ones((1, 1, 4, 4), DType::F32, &Device::Cpu)?;
        trainer.train_one_batch(&image, &target)?;

        let ema = trainer.ema_model()?;
        let pred = ema.forward_t(&image, false)?;
        assert_eq!(pred.dims(), &[1, 1, 4, 4]);
        Ok(())
    }

    #[test]
    fn test_to_same_device_is_noop() -> Result<()> {
        let mut trainer = trainer()?;
        trainer.to(&Device::Cpu)?;
        assert!(trainer.device().is_cpu());
        Ok(())
    }

    #[test]
    fn test_predict_shape() -> Result<()> {
        let trainer = trainer()?;
        let image = Tensor::rand(0f32, 1.0, (3, 3, 4, 4), &Device::Cpu)?;
        assert_eq!(trainer.predict(&image)?.dims(), &[3, 1, 4, 4]);
        Ok(())
    }

    /// Replays a fixed list of batches
    struct Scripted {
        batches: Vec<Batch>,
        pos: usize,
    }

    impl Scripted {
        fn new(batches: Vec<Batch>) -> Self {
            Self { batches, pos: 0 }
        }
    }

    impl BatchStream for Scripted {
        fn next_batch(&mut self, _device: &Device) -> Result<Option<Batch>> {
            let batch = self.batches.get(self.pos).cloned();
            self.pos += 1;
            Ok(batch)
        }

        fn reset(&mut self) {
            self.pos = 0;
        }

        fn num_batches(&self) -> usize {
            self.batches.len()
        }
    }

    fn batch(n: usize, side: usize, depth: f32) -> Result<Batch> {
        let device = Device::Cpu;
        Ok(Batch {
            image: Tensor::rand(0f32, 1.0, (n, 3, 4, 4), &device)?,
            target: Tensor::full(depth, (n, 1, side, side), &device)?.contiguous()?,
            ids: (0..n).map(|i| format!("b{}", i)).collect(),
        })
    }

    fn flat_params(trainer: &Trainer) -> Result<Vec<Vec<f32>>> {
        trainer
            .named_parameters()?
            .iter()
            .map(|(_, v)| Ok(v.as_tensor().flatten_all()?.to_vec1::<f32>()?))
            .collect()
    }

    #[test]
    fn test_epoch_retry_after_failed_pass_starts_clean() -> Result<()> {
        let mut trainer = trainer()?;

        // One far-off batch is folded, then the shape mismatch aborts the pass
        let mut failing = Scripted::new(vec![batch(2, 4, 100.0)?, batch(1, 5, 1.0)?]);
        let mut val = Scripted::new(vec![batch(2, 4, 1.0)?]);
        assert!(matches!(
            trainer.train_one_epoch(1, &mut failing, &mut val, 0),
            Err(DepthError::Data(_))
        ));
        assert!(trainer.history().is_empty());

        // Single-batch epoch: train/loss is the loss before its own step
        let clean = batch(2, 4, 1.5)?;
        let pred = trainer.predict(&clean.image)?;
        let expected = (pred - &clean.target)?
            .abs()?
            .mean_all()?
            .to_dtype(DType::F64)?
            .to_scalar::<f64>()?;

        let mut train = Scripted::new(vec![clean]);
        let record = trainer.train_one_epoch(1, &mut train, &mut val, 0)?;
        let loss = record
            .get("train/loss")
            .ok_or_else(|| DepthError::Training("train/loss".to_string()))?;
        assert!((loss - expected).abs() < 1e-6, "{} vs {}", loss, expected);
        Ok(())
    }

    #[test]
    fn test_failed_validation_does_not_leak_into_next_training_pass() -> Result<()> {
        let mut trainer = trainer()?;
        let mut train = Scripted::new(vec![batch(2, 4, 1.0)?]);
        let mut failing = Scripted::new(vec![batch(2, 4, 50.0)?, batch(2, 5, 1.0)?]);
        assert!(trainer
            .train_one_epoch(1, &mut train, &mut failing, 0)
            .is_err());

        let clean = batch(2, 4, 1.0)?;
        let pred = trainer.predict(&clean.image)?;
        let expected = (pred - &clean.target)?
            .abs()?
            .mean_all()?
            .to_dtype(DType::F64)?
            .to_scalar::<f64>()?;

        let mut train = Scripted::new(vec![clean]);
        let mut val = Scripted::new(vec![batch(2, 4, 1.0)?]);
        let record = trainer.train_one_epoch(1, &mut train, &mut val, 0)?;
        let loss = record
            .get("train/loss")
            .ok_or_else(|| DepthError::Training("train/loss".to_string()))?;
        assert!((loss - expected).abs() < 1e-6, "{} vs {}", loss, expected);
        Ok(())
    }

    #[test]
    fn test_non_finite_loss_leaves_state_untouched() -> Result<()> {
        let nan_loss = |p: &Tensor, t: &Tensor| -> Result<Tensor> {
            Ok(((p - t)?.abs()?.mean_all()? * f64::NAN)?)
        };
        let mut trainer = TrainerBuilder::new(pixel_linear_factory())
            .criterion(Box::new(nan_loss))
            .metrics(MetricCollection::new().with("TA1", Box::new(ThresholdAccuracy::new(1.25)))?)
            .build(&Device::Cpu)?;
        let before = flat_params(&trainer)?;

        let image = Tensor::rand(0f32, 1.0, (2, 3, 4, 4), &Device::Cpu)?;
        let target = Tensor::ones((2, 1, 4, 4), DType::F32, &Device::Cpu)?;
        assert!(matches!(
            trainer.train_one_batch(&image, &target),
            Err(DepthError::Training(_))
        ));
        assert!(matches!(
            trainer.val_one_batch(&image, &target),
            Err(DepthError::Training(_))
        ));

        assert_eq!(flat_params(&trainer)?, before);
        assert!(!trainer.ema().is_initialized());
        assert!(trainer.optimizer().state_dict().scalars.steps.is_empty());
        assert!(matches!(
            trainer.get_metrics_dict("train/", 1),
            Err(DepthError::EmptyMetric(_))
        ));
        Ok(())
    }

    #[test]
    fn test_optimizer_and_ema_follow_trainer_vars() -> Result<()> {
        let mut trainer = trainer()?;
        let image = Tensor::rand(0f32, 1.0, (1, 3, 4, 4), &Device::Cpu)?;
        let target = Tensor::ones((1, 1, 4, 4), DType::F32, &Device::Cpu)?;
        trainer.train_one_batch(&image, &target)?;
        trainer.to(&Device::Cpu)?;

        let live: Vec<_> = trainer
            .named_parameters()?
            .iter()
            .map(|(n, v)| (n.clone(), v.as_tensor().id()))
            .collect();
        let bound: Vec<_> = trainer
            .optimizer()
            .params()
            .iter()
            .map(|(n, v)| (n.clone(), v.as_tensor().id()))
            .collect();
        assert_eq!(live, bound);
        assert_eq!(
            trainer.ema().shadow_params().keys().collect::<Vec<_>>(),
            live.iter().map(|(n, _)| n).collect::<Vec<_>>()
        );
        Ok(())
    }

    #[cfg(any(feature = "cuda", feature = "metal"))]
    fn accelerator() -> Result<Device> {
        #[cfg(feature = "cuda")]
        let device = Device::new_cuda(0)?;
        #[cfg(all(feature = "metal", not(feature = "cuda")))]
        let device = Device::new_metal(0)?;
        Ok(device)
    }

    #[cfg(any(feature = "cuda", feature = "metal"))]
    #[test]
    fn test_host_batch_on_accelerator_trainer_is_device_error() -> Result<()> {
        let device = accelerator()?;
        let mut trainer = TrainerBuilder::new(pixel_linear_factory()).build(&device)?;
        let before = flat_params(&trainer)?;

        let image = Tensor::rand(0f32, 1.0, (1, 3, 4, 4), &Device::Cpu)?;
        let target = Tensor::ones((1, 1, 4, 4), DType::F32, &Device::Cpu)?;
        assert!(matches!(
            trainer.train_one_batch(&image, &target),
            Err(DepthError::Device(_))
        ));
        assert!(matches!(
            trainer.val_one_batch(&image, &target),
            Err(DepthError::Device(_))
        ));
        assert!(matches!(trainer.predict(&image), Err(DepthError::Device(_))));
        assert_eq!(flat_params(&trainer)?, before);
        Ok(())
    }

    #[cfg(any(feature = "cuda", feature = "metal"))]
    #[test]
    fn test_move_to_accelerator_and_back() -> Result<()> {
        let device = accelerator()?;
        let mut trainer = trainer()?;
        let image = Tensor::rand(0f32, 1.0, (1, 3, 4, 4), &Device::Cpu)?;
        let target = Tensor::ones((1, 1, 4, 4), DType::F32, &Device::Cpu)?;
        trainer.train_one_batch(&image, &target)?;
        let before = flat_params(&trainer)?;

        trainer.to(&device)?;
        assert!(trainer.device().same_device(&device));
        let moved_image = image.to_device(&device)?;
        let moved_target = target.to_device(&device)?;
        trainer.train_one_batch(&moved_image, &moved_target)?;
        assert!(matches!(
            trainer.train_one_batch(&image, &target),
            Err(DepthError::Device(_))
        ));

        trainer.to(&Device::Cpu)?;
        assert!(trainer.device().is_cpu());
        assert_ne!(flat_params(&trainer)?, before);
        Ok(())
    }
}
