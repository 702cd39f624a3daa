//! Trainer: drives the binarize → forward → backward → restore → update cycle.
//!
//! The trainer owns the model, its `VarMap`, the binarization controller and
//! the optimiser, and is the only place that sequences them. Whatever happens
//! inside the forward/backward window, every step (and every evaluation)
//! ends with the tracked weights restored to full precision.

use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};
use candle_nn::{loss, AdamW, ModuleT, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use tracing::{debug, info};

use xnor_common::{batch_to_tensors, SyntheticDigits, XnorConfig};
use xnor_core::{compression_stats, BinarizeController, XnorNet};

use crate::scheduler::{LrDecay, LrScheduler};

// ── Config ──────────────────────────────────────────────────────────────────

/// All training hyper-parameters (CLI-level knobs).
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub batch_size: usize,
    /// Stop after this many optimiser steps (0 = no step limit).
    pub max_steps: usize,
    /// Stop after this many passes over the training set (0 = no epoch limit).
    pub max_epochs: usize,
    pub lr: f64,
    pub lr_warmup_steps: usize,
    pub lr_decay: LrDecay,
    pub weight_decay: f64,
    pub grad_clip_max_norm: f64,
    pub save_every: usize,
    pub log_every: usize,
    pub eval_every: usize,
    pub eval_batches: usize,
    pub output_dir: PathBuf,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            max_steps: 1000,
            max_epochs: 0,
            lr: 1e-3,
            lr_warmup_steps: 0,
            lr_decay: LrDecay::None,
            weight_decay: 0.0,
            grad_clip_max_norm: 0.0,
            save_every: 0,
            log_every: 50,
            eval_every: 200,
            eval_batches: 10,
            output_dir: PathBuf::from("checkpoints"),
        }
    }
}

/// Metrics returned after each training step.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    pub step: usize,
    pub loss: f32,
    /// Batch accuracy under binarized weights.
    pub accuracy: f32,
    pub lr: f64,
    pub grad_norm: f64,
}

/// Outcome of [`Trainer::train`].
#[derive(Debug, Clone)]
pub struct TrainSummary {
    pub steps: usize,
    pub epochs: usize,
    pub last_loss: Option<f32>,
}

/// Validation result under binarized weights.
#[derive(Debug, Clone)]
pub struct EvalMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub samples: usize,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// The training engine. Owns the model, controller, optimiser and schedule.
pub struct Trainer {
    pub model: XnorNet,
    pub varmap: VarMap,
    vars: Vec<Var>,
    controller: BinarizeController,
    optimizer: AdamW,
    lr_scheduler: LrScheduler,
    pub config: TrainerConfig,
    model_config: XnorConfig,
    pub global_step: usize,
    device: Device,
}

impl Trainer {
    /// Build the model from config and select its binarization targets.
    pub fn new(
        model_config: XnorConfig,
        trainer_config: TrainerConfig,
        device: Device,
    ) -> anyhow::Result<Self> {
        model_config.validate()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = XnorNet::new(vb, &model_config)?;
        let vars = varmap.all_vars();

        let controller = BinarizeController::new(&model, &model_config.binarize)
            .context("selecting binarization targets")?;

        let stats = compression_stats(&model, &controller);
        info!(
            total_params = stats.total_params,
            binarized_params = stats.binarized_params,
            tracked_layers = controller.num_targets(),
            effective_bits = format!("{:.2}", stats.effective_bits_per_param),
            compression = format!("{:.2}x", stats.compression_ratio_vs_f32),
            "Model compression stats"
        );

        let lr_scheduler = LrScheduler::new(
            trainer_config.lr,
            trainer_config.lr_warmup_steps,
            trainer_config.lr_decay,
        );

        let optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: trainer_config.lr,
                weight_decay: trainer_config.weight_decay,
                ..Default::default()
            },
        )?;

        Ok(Self {
            model,
            varmap,
            vars,
            controller,
            optimizer,
            lr_scheduler,
            config: trainer_config,
            model_config,
            global_step: 0,
            device,
        })
    }

    /// One optimiser step on a flat `(images, labels)` batch.
    pub fn step_batch(&mut self, images: &[f32], labels: &[u32]) -> anyhow::Result<StepMetrics> {
        let (images, labels) = batch_to_tensors(
            images,
            labels,
            self.model_config.in_channels,
            self.model_config.image_size,
            &self.device,
        )?;
        self.step(&images, &labels)
    }

    /// One optimiser step:
    /// binarize → forward → backward → restore → gradient policy → clip → AdamW.
    pub fn step(&mut self, images: &Tensor, labels: &Tensor) -> anyhow::Result<StepMetrics> {
        let lr = self.lr_scheduler.current_lr();
        self.optimizer.set_learning_rate(lr);

        self.controller.binarize()?;
        let pass = self.forward_backward(images, labels);
        let restored = self.controller.restore();
        let (loss_val, accuracy, mut grads) = pass?;
        restored?;

        self.controller.update_weight_gradients(&mut grads)?;

        let grad_norm = if self.config.grad_clip_max_norm > 0.0 {
            clip_grad_norm(&mut grads, &self.vars, self.config.grad_clip_max_norm)?
        } else {
            grad_norm(&grads, &self.vars)?
        };

        // Updates land on the restored real-valued weights.
        self.optimizer.step(&grads)?;

        self.lr_scheduler.advance();
        self.global_step += 1;

        Ok(StepMetrics {
            step: self.global_step - 1,
            loss: loss_val,
            accuracy,
            lr,
            grad_norm,
        })
    }

    fn forward_backward(
        &self,
        images: &Tensor,
        labels: &Tensor,
    ) -> anyhow::Result<(f32, f32, GradStore)> {
        let logits = self.model.forward_t(images, true)?;
        let loss = loss::cross_entropy(&logits, labels)?;
        let accuracy = batch_accuracy(&logits, labels)?;
        let grads = loss.backward()?;
        Ok((loss.to_scalar::<f32>()?, accuracy, grads))
    }

    /// Loss and accuracy over up to `eval_batches` batches, with binarized
    /// weights and batch-norm in inference mode.
    pub fn evaluate(&mut self, dataset: &SyntheticDigits) -> anyhow::Result<EvalMetrics> {
        self.controller.binarize()?;
        let result = self.evaluate_binarized(dataset);
        let restored = self.controller.restore();
        let metrics = result?;
        restored?;
        Ok(metrics)
    }

    fn evaluate_binarized(&self, dataset: &SyntheticDigits) -> anyhow::Result<EvalMetrics> {
        let mut loss_sum = 0.0f64;
        let mut correct = 0.0f64;
        let mut samples = 0usize;
        let mut batches = 0usize;

        let take = match self.config.eval_batches {
            0 => usize::MAX,
            n => n,
        };
        for (images, labels) in dataset.batches(self.config.batch_size).take(take) {
            let n = labels.len();
            let (images, labels) = batch_to_tensors(
                &images,
                &labels,
                self.model_config.in_channels,
                self.model_config.image_size,
                &self.device,
            )?;
            let logits = self.model.forward_t(&images, false)?;
            let l = loss::cross_entropy(&logits, &labels)?;
            loss_sum += l.to_scalar::<f32>()? as f64;
            correct += batch_accuracy(&logits, &labels)? as f64 * n as f64;
            samples += n;
            batches += 1;
        }

        if batches == 0 {
            return Ok(EvalMetrics {
                loss: f64::MAX,
                accuracy: 0.0,
                samples: 0,
            });
        }
        debug!(batches, samples, "evaluation done");
        Ok(EvalMetrics {
            loss: loss_sum / batches as f64,
            accuracy: correct / samples as f64,
            samples,
        })
    }

    /// Run steps over `train_set` until `max_steps` or `max_epochs` is hit,
    /// logging every `log_every` steps, evaluating on `val_set` every
    /// `eval_every` steps (appended to `output_dir/metrics.csv`) and
    /// checkpointing every `save_every` steps.
    pub fn train(
        &mut self,
        train_set: &SyntheticDigits,
        val_set: Option<&SyntheticDigits>,
    ) -> anyhow::Result<TrainSummary> {
        anyhow::ensure!(
            self.config.max_steps > 0 || self.config.max_epochs > 0,
            "max_steps and max_epochs are both 0; training would never stop"
        );
        anyhow::ensure!(
            self.config.batch_size > 0 && train_set.len() >= self.config.batch_size,
            "training set ({}) is smaller than one batch ({})",
            train_set.len(),
            self.config.batch_size
        );

        std::fs::create_dir_all(&self.config.output_dir)?;
        let mut metrics_file = match val_set {
            Some(_) => {
                let mut f = std::fs::File::create(self.config.output_dir.join("metrics.csv"))?;
                writeln!(f, "step,val_loss,val_accuracy")?;
                Some(f)
            }
            None => None,
        };

        let start = self.global_step;
        let mut epoch = 0usize;
        let mut last_loss = None;
        'outer: loop {
            if self.config.max_epochs > 0 && epoch >= self.config.max_epochs {
                break;
            }
            for (images, labels) in train_set.batches(self.config.batch_size) {
                if self.config.max_steps > 0 && self.global_step >= self.config.max_steps {
                    break 'outer;
                }
                let m = self.step_batch(&images, &labels)?;
                last_loss = Some(m.loss);

                if self.config.log_every > 0 && m.step % self.config.log_every == 0 {
                    info!(
                        step = m.step,
                        epoch,
                        loss = format!("{:.4}", m.loss),
                        acc = format!("{:.3}", m.accuracy),
                        lr = format!("{:.2e}", m.lr),
                        grad_norm = format!("{:.4}", m.grad_norm),
                        "train"
                    );
                }
                self.eval_and_checkpoint(val_set, metrics_file.as_mut())?;
            }
            epoch += 1;
            info!(epoch, step = self.global_step, "epoch done");
        }

        Ok(TrainSummary {
            steps: self.global_step - start,
            epochs: epoch,
            last_loss,
        })
    }

    fn eval_and_checkpoint(
        &mut self,
        val_set: Option<&SyntheticDigits>,
        metrics_file: Option<&mut std::fs::File>,
    ) -> anyhow::Result<()> {
        let step = self.global_step;

        if let Some(val_set) = val_set {
            if self.config.eval_every > 0 && step > 0 && step % self.config.eval_every == 0 {
                let m = self.evaluate(val_set)?;
                info!(
                    step,
                    val_loss = format!("{:.4}", m.loss),
                    val_accuracy = format!("{:.3}", m.accuracy),
                    "eval"
                );
                if let Some(f) = metrics_file {
                    writeln!(f, "{step},{},{}", m.loss, m.accuracy)?;
                }
            }
        }

        if self.config.save_every > 0 && step > 0 && step % self.config.save_every == 0 {
            let path = self.save_checkpoint()?;
            info!(path = %path.display(), "saved checkpoint");
        }
        Ok(())
    }

    /// Save checkpoint.
    pub fn save_checkpoint(&self) -> anyhow::Result<PathBuf> {
        self.save_as(&format!("checkpoint-{}.safetensors", self.global_step))
    }

    /// Save final model.
    pub fn save_final(&self) -> anyhow::Result<PathBuf> {
        self.save_as("model.safetensors")
    }

    /// Weights are written in their real-valued state only.
    fn save_as(&self, file_name: &str) -> anyhow::Result<PathBuf> {
        anyhow::ensure!(
            !self.controller.is_binarized(),
            "refusing to checkpoint while weights are binarized"
        );
        std::fs::create_dir_all(&self.config.output_dir)?;
        let path = self.config.output_dir.join(file_name);
        self.varmap
            .save(&path)
            .with_context(|| format!("writing {}", path.display()))?;
        self.model_config
            .save(&self.config.output_dir.join("config.json"))?;
        Ok(path)
    }

    pub fn controller(&self) -> &BinarizeController {
        &self.controller
    }

    pub fn model_config(&self) -> &XnorConfig {
        &self.model_config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

// ── Metrics ─────────────────────────────────────────────────────────────────

/// Fraction of rows whose argmax matches the label.
fn batch_accuracy(logits: &Tensor, labels: &Tensor) -> candle_core::Result<f32> {
    logits
        .argmax(1)?
        .eq(labels)?
        .to_dtype(DType::F32)?
        .mean_all()?
        .to_scalar::<f32>()
}

// ── Gradient utilities ──────────────────────────────────────────────────────

/// Total L2 norm of gradients.
fn grad_norm(grads: &GradStore, vars: &[Var]) -> anyhow::Result<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(total.sqrt())
}

/// Clip gradients so their global L2 norm ≤ `max_norm`; returns the norm
/// before clipping.
fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> anyhow::Result<f64> {
    let norm = grad_norm(grads, vars)?;
    if norm <= max_norm {
        return Ok(norm);
    }
    let scale = max_norm / norm.max(1e-12);
    for var in vars {
        if let Some(g) = grads.remove(var.as_tensor()) {
            grads.insert(var.as_tensor(), g.affine(scale, 0.0)?);
        }
    }
    Ok(norm)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use xnor_core::ParamState;

    fn digits(len: usize, seed: u64) -> SyntheticDigits {
        SyntheticDigits::new(10, 1, 28, len, 0.2, 11, seed)
    }

    fn trainer(config: TrainerConfig) -> Trainer {
        Trainer::new(XnorConfig::default(), config, Device::Cpu).unwrap()
    }

    fn small_config() -> TrainerConfig {
        TrainerConfig {
            batch_size: 8,
            lr: 1e-3,
            eval_batches: 2,
            ..Default::default()
        }
    }

    fn flat(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn step_ends_with_real_weights() {
        let mut t = trainer(small_config());
        let ds = digits(8, 1);
        let (images, labels) = ds.batches(8).next().unwrap();
        let m = t.step_batch(&images, &labels).unwrap();
        assert_eq!(m.step, 0);
        assert!(m.loss.is_finite());
        assert!((0.0..=1.0).contains(&m.accuracy));
        assert!(m.grad_norm > 0.0);
        assert_eq!(t.global_step, 1);
        assert!(!t.controller().is_binarized());
        assert!(t
            .controller()
            .states()
            .iter()
            .all(|s| *s == ParamState::RealClamped));
    }

    #[test]
    fn forward_error_still_restores_weights() {
        let mut t = trainer(small_config());
        let dev = Device::Cpu;
        // conv1 expects one input channel.
        let images = Tensor::zeros((2, 3, 28, 28), DType::F32, &dev).unwrap();
        let labels = Tensor::new(&[0u32, 1], &dev).unwrap();

        assert!(t.step(&images, &labels).is_err());
        assert_eq!(t.global_step, 0);
        assert!(!t.controller().is_binarized());
        let ctl = t.controller();
        for (i, target) in ctl.targets().iter().enumerate() {
            assert_eq!(flat(target.var()), flat(ctl.shadow(i).unwrap()));
        }
    }

    #[test]
    fn optimizer_updates_restored_weights() {
        let lr = 1e-3;
        let mut t = trainer(TrainerConfig {
            lr,
            ..small_config()
        });
        let ds = digits(8, 2);
        let (images, labels) = ds.batches(8).next().unwrap();
        t.step_batch(&images, &labels).unwrap();

        // AdamW's first step moves each weight by at most lr, starting from
        // the real weights saved in the shadow (not from sign(w)·α).
        let ctl = t.controller();
        let mut moved = false;
        for (i, target) in ctl.targets().iter().enumerate() {
            let saved = flat(ctl.shadow(i).unwrap());
            let now = flat(target.var());
            for (a, b) in now.iter().zip(&saved) {
                let d = (a - b).abs();
                assert!(d <= lr as f32 * 1.01 + 1e-6, "{}: moved {d}", target.name());
                moved |= d > 0.0;
            }
        }
        assert!(moved);
    }

    #[test]
    fn untracked_first_layer_keeps_full_precision() {
        let mut t = trainer(small_config());
        let ds = digits(16, 3);
        for (images, labels) in ds.batches(8) {
            t.step_batch(&images, &labels).unwrap();
        }
        let data = t.varmap.data().lock().unwrap();
        let conv1 = flat(data.get("conv1.weight").unwrap().as_tensor());
        // Never centered/clamped: default init reaches beyond a binarized
        // row's handful of distinct magnitudes.
        let mut mags: Vec<f32> = conv1.iter().map(|v| v.abs()).collect();
        mags.sort_by(|a, b| a.partial_cmp(b).unwrap());
        mags.dedup();
        assert!(mags.len() > 20);
    }

    #[test]
    fn evaluate_restores_and_reports() {
        let mut t = trainer(small_config());
        let val = digits(32, 4);
        let m = t.evaluate(&val).unwrap();
        assert_eq!(m.samples, 16);
        assert!(m.loss.is_finite());
        assert!((0.0..=1.0).contains(&m.accuracy));
        assert!(!t.controller().is_binarized());
        let ctl = t.controller();
        for (i, target) in ctl.targets().iter().enumerate() {
            assert_eq!(flat(target.var()), flat(ctl.shadow(i).unwrap()));
        }
    }

    #[test]
    fn evaluate_on_empty_set() {
        let mut t = trainer(small_config());
        let m = t.evaluate(&digits(0, 5)).unwrap();
        assert_eq!(m.samples, 0);
        assert!(!t.controller().is_binarized());
    }

    #[test]
    fn checkpoint_writes_weights_and_config() {
        let dir = std::env::temp_dir().join(format!("xnor-ckpt-{}", std::process::id()));
        let mut t = trainer(TrainerConfig {
            output_dir: dir.clone(),
            ..small_config()
        });
        let ds = digits(8, 6);
        let (images, labels) = ds.batches(8).next().unwrap();
        t.step_batch(&images, &labels).unwrap();

        let path = t.save_checkpoint().unwrap();
        assert!(path.ends_with("checkpoint-1.safetensors"));
        assert!(path.exists());
        assert!(dir.join("config.json").exists());
        let loaded = XnorConfig::load(&dir.join("config.json")).unwrap();
        assert_eq!(loaded.flat_features(), 320);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    fn scratch_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("xnor-{tag}-{}", std::process::id()))
    }

    #[test]
    fn train_follows_configured_cadence() {
        let dir = scratch_dir("train");
        let mut t = trainer(TrainerConfig {
            max_steps: 4,
            eval_every: 2,
            eval_batches: 1,
            save_every: 4,
            log_every: 1,
            output_dir: dir.clone(),
            ..small_config()
        });
        // 3 batches per epoch, so the step limit lands mid-epoch 2.
        let summary = t.train(&digits(24, 7), Some(&digits(16, 8))).unwrap();
        assert_eq!(summary.steps, 4);
        assert_eq!(summary.epochs, 1);
        assert!(summary.last_loss.unwrap().is_finite());
        assert_eq!(t.global_step, 4);
        assert!(!t.controller().is_binarized());

        let csv = std::fs::read_to_string(dir.join("metrics.csv")).unwrap();
        let steps: Vec<&str> = csv
            .lines()
            .skip(1)
            .map(|l| l.split(',').next().unwrap())
            .collect();
        assert_eq!(steps, vec!["2", "4"]);
        assert!(dir.join("checkpoint-4.safetensors").exists());
        assert!(!dir.join("checkpoint-2.safetensors").exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn train_stops_at_epoch_limit() {
        let dir = scratch_dir("epochs");
        let mut t = trainer(TrainerConfig {
            max_steps: 0,
            max_epochs: 2,
            eval_every: 0,
            output_dir: dir.clone(),
            ..small_config()
        });
        let summary = t.train(&digits(16, 9), None).unwrap();
        assert_eq!(summary.epochs, 2);
        assert_eq!(summary.steps, 4);
        assert!(!dir.join("metrics.csv").exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn train_without_any_limit_is_rejected() {
        let mut t = trainer(TrainerConfig {
            max_steps: 0,
            max_epochs: 0,
            output_dir: scratch_dir("unbounded"),
            ..small_config()
        });
        assert!(t.train(&digits(16, 10), None).is_err());
        assert_eq!(t.global_step, 0);
    }

    #[test]
    fn train_rejects_set_smaller_than_a_batch() {
        let mut t = trainer(TrainerConfig {
            output_dir: scratch_dir("tiny"),
            ..small_config()
        });
        assert!(t.train(&digits(4, 11), None).is_err());
    }

    #[test]
    fn clip_grad_norm_bounds_global_norm() {
        let dev = Device::Cpu;
        let a = Var::new(&[1.0f32, 1.0], &dev).unwrap();
        let b = Var::new(&[1.0f32, 1.0], &dev).unwrap();
        let c = Tensor::new(&[3.0f32, 4.0], &dev).unwrap();
        let loss = ((a.as_tensor() * &c).unwrap() + (b.as_tensor() * &c).unwrap())
            .unwrap()
            .sum_all()
            .unwrap();
        let mut grads = loss.backward().unwrap();
        let vars = vec![a, b];
        let before = clip_grad_norm(&mut grads, &vars, 1.0).unwrap();
        assert!((before - 50f64.sqrt()).abs() < 1e-5);
        assert!((grad_norm(&grads, &vars).unwrap() - 1.0).abs() < 1e-5);
    }
}
