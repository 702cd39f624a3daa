//! XNOR weight binarization controller.
//!
//! Wraps a model's forward/backward pass with a binarize → restore cycle:
//!
//! ```text
//! binarize()  center + clamp real weights, save to shadow, write sign(w)·α
//! forward / backward with binarized weights
//! restore()   copy shadow back (real, clamped weights)
//! update_weight_gradients()  optional sign-preserving gradient policy
//! optimiser step on the restored real weights
//! ```
//!
//! # Target selection
//!
//! Every weight-bearing conv/dense layer is eligible. With
//! `exclude_first_last` the first and last eligible layers stay in full
//! precision, which only applies when at least 3 eligible layers exist.
//!
//! # State machine
//!
//! Each target is either [`ParamState::RealClamped`] or
//! [`ParamState::ShadowedAndBinarized`]. `binarize` requires every target to
//! be real; `restore` only touches binarized targets, so a second `restore`
//! is a no-op and never reverts an optimiser update.

use candle_core::{backprop::GradStore, Tensor, Var};
use tracing::{debug, trace, warn};

use xnor_common::{BinarizeConfig, GradPolicy};

use crate::error::{BinarizeError, Result};
use crate::layer::LayeredModel;
use crate::quantize::{binarize_weight, center_and_clamp, channel_scale};
use crate::shadow::ShadowStore;

/// Minimum eligible layers for the first/last exclusion to apply.
const MIN_LAYERS_FOR_EXCLUSION: usize = 3;

// ── Targets ─────────────────────────────────────────────────────────────────

/// Where a tracked parameter is in the binarize/restore cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamState {
    /// Holds real-valued (clamped, centered) weights.
    RealClamped,
    /// Real weights live in the shadow; the parameter holds `sign(w)·α`.
    ShadowedAndBinarized,
}

/// One tracked weight tensor.
#[derive(Debug)]
pub struct TargetParam {
    name: String,
    layer_index: usize,
    var: Var,
    state: ParamState,
}

impl TargetParam {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Position of the owning layer in [`LayeredModel::layers`].
    pub fn layer_index(&self) -> usize {
        self.layer_index
    }

    pub fn shape(&self) -> &[usize] {
        self.var.dims()
    }

    pub fn state(&self) -> ParamState {
        self.state
    }

    pub fn var(&self) -> &Var {
        &self.var
    }
}

// ── Controller ──────────────────────────────────────────────────────────────

/// Owns the tracked weights' shadow copies and the binarize/restore protocol.
///
/// One controller per model replica; it is deliberately not `Clone`.
#[derive(Debug)]
pub struct BinarizeController {
    targets: Vec<TargetParam>,
    shadow: ShadowStore,
    config: BinarizeConfig,
}

impl BinarizeController {
    /// Select targets from `model` and allocate their shadow buffers.
    ///
    /// Fails with [`BinarizeError::Configuration`] when the model has no
    /// conv/dense weights.
    pub fn new<M: LayeredModel + ?Sized>(model: &M, config: &BinarizeConfig) -> Result<Self> {
        let eligible: Vec<_> = model
            .layers()
            .into_iter()
            .enumerate()
            .filter(|(_, layer)| layer.is_binarizable())
            .collect();

        if eligible.is_empty() {
            return Err(BinarizeError::Configuration(
                "model exposes no convolution or dense weights to binarize".to_string(),
            ));
        }

        let n = eligible.len();
        let keep = if !config.exclude_first_last {
            0..n
        } else if n >= MIN_LAYERS_FOR_EXCLUSION {
            1..n - 1
        } else {
            warn!(
                eligible = n,
                "fewer than {MIN_LAYERS_FOR_EXCLUSION} eligible layers; first/last exclusion disabled"
            );
            0..n
        };

        let targets: Vec<TargetParam> = eligible
            .into_iter()
            .skip(keep.start)
            .take(keep.len())
            .filter_map(|(layer_index, layer)| {
                layer.weight.map(|var| TargetParam {
                    name: layer.name,
                    layer_index,
                    var,
                    state: ParamState::RealClamped,
                })
            })
            .collect();

        let shadow = ShadowStore::allocate(targets.iter().map(|t| &t.var))?;

        for t in &targets {
            debug!(name = %t.name, layer = t.layer_index, shape = ?t.shape(), "binarizing layer");
        }
        debug!(
            eligible = n,
            tracked = targets.len(),
            exclude_first_last = config.exclude_first_last,
            "binarize controller ready"
        );

        Ok(Self {
            targets,
            shadow,
            config: config.clone(),
        })
    }

    // ── Protocol ────────────────────────────────────────────────────────────

    /// Center + clamp, save to shadow, then overwrite with `sign(w)·α`.
    ///
    /// Every target is validated before the first one is touched.
    pub fn binarize(&mut self) -> Result<()> {
        self.validate(ParamState::RealClamped)?;

        for (i, t) in self.targets.iter_mut().enumerate() {
            let real = center_and_clamp(t.var.as_tensor())?;
            t.var.set(&real)?;
            self.shadow.save(i, &t.name, &real)?;
            t.var.set(&binarize_weight(&real)?)?;
            t.state = ParamState::ShadowedAndBinarized;
        }
        trace!(targets = self.targets.len(), "binarized");
        Ok(())
    }

    /// Copy the shadow buffers back into every binarized target.
    ///
    /// Targets already holding real weights are left alone, which makes a
    /// repeated call a no-op.
    pub fn restore(&mut self) -> Result<()> {
        let mut pending = Vec::new();
        for (i, t) in self.targets.iter().enumerate() {
            if t.state == ParamState::ShadowedAndBinarized {
                self.shadow.check(i, &t.name, t.var.as_tensor())?;
                pending.push(i);
            }
        }
        if pending.is_empty() {
            trace!("restore: weights already real-valued");
            return Ok(());
        }

        for i in pending {
            let t = &mut self.targets[i];
            self.shadow.load_into(i, &t.name, &t.var)?;
            t.state = ParamState::RealClamped;
        }
        trace!(targets = self.targets.len(), "restored");
        Ok(())
    }

    /// Apply the configured [`GradPolicy`] to the tracked weights' gradients.
    ///
    /// Call after `restore()` and before the optimiser step. Targets without
    /// a gradient in `grads` are skipped.
    pub fn update_weight_gradients(&self, grads: &mut GradStore) -> Result<()> {
        let policy = self.config.grad_policy;
        match policy {
            GradPolicy::Identity => return Ok(()),
            GradPolicy::ClipValue { threshold } if !(threshold > 0.0) => {
                return Err(BinarizeError::Configuration(format!(
                    "gradient clip threshold must be > 0, got {threshold}"
                )));
            }
            _ => {}
        }
        self.validate(ParamState::RealClamped)?;

        for t in &self.targets {
            let key = t.var.as_tensor();
            let Some(g) = grads.remove(key) else {
                continue;
            };
            let g = match policy {
                GradPolicy::Identity => g,
                GradPolicy::ClipValue { threshold } => g.clamp(-threshold, threshold)?,
                GradPolicy::ScaleByAlpha => g.broadcast_mul(&channel_scale(key)?)?,
            };
            grads.insert(key, g);
        }
        Ok(())
    }

    fn validate(&self, expected: ParamState) -> Result<()> {
        for (i, t) in self.targets.iter().enumerate() {
            if t.state != expected {
                return Err(BinarizeError::InvalidState {
                    index: i,
                    name: t.name.clone(),
                    expected,
                    actual: t.state,
                });
            }
            let rank = t.var.rank();
            if rank != 2 && rank != 4 {
                return Err(BinarizeError::Configuration(format!(
                    "{} has rank-{rank} weight {:?}; only 2-D dense and 4-D conv weights can be binarized",
                    t.name,
                    t.shape()
                )));
            }
            self.shadow.check(i, &t.name, t.var.as_tensor())?;
        }
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn targets(&self) -> &[TargetParam] {
        &self.targets
    }

    pub fn num_targets(&self) -> usize {
        self.targets.len()
    }

    /// Real weights saved by the most recent `binarize()` for target `index`.
    pub fn shadow(&self, index: usize) -> Option<&Tensor> {
        self.shadow.get(index)
    }

    pub fn states(&self) -> Vec<ParamState> {
        self.targets.iter().map(|t| t.state).collect()
    }

    /// True while any target holds binarized weights.
    pub fn is_binarized(&self) -> bool {
        self.targets
            .iter()
            .any(|t| t.state == ParamState::ShadowedAndBinarized)
    }

    /// Total elements across tracked weights.
    pub fn tracked_params(&self) -> usize {
        self.targets.iter().map(|t| t.var.elem_count()).sum()
    }

    pub fn config(&self) -> &BinarizeConfig {
        &self.config
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
