//! Network and binarization configuration.
//!
//! Serialised as JSON alongside checkpoints. Every field has a default, so a
//! minimal `{}` JSON produces the reference MNIST-sized network with the
//! standard XNOR policy (first and last weight layers kept full precision).

use serde::{Deserialize, Serialize};

// ── Gradient policies ───────────────────────────────────────────────────────

/// Backward rule for the activation sign (straight-through estimator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SteMode {
    /// Pass the upstream gradient through unchanged everywhere.
    Identity,
    /// Pass the gradient where `|x| <= 1`, zero it elsewhere (hard-tanh derivative).
    #[default]
    Clipped,
}

/// Rule applied to tracked weight gradients between `restore()` and the
/// optimiser step. No variant may flip the sign of a gradient component.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GradPolicy {
    /// Leave gradients untouched.
    #[default]
    Identity,
    /// Clamp every element to `[-threshold, threshold]`.
    ClipValue { threshold: f64 },
    /// Multiply each output channel's gradient by that channel's scale factor.
    ScaleByAlpha,
}

// ── Binarization ────────────────────────────────────────────────────────────

/// Which layers get binarized and how their gradients are treated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinarizeConfig {
    /// Keep the first and last eligible layer in full precision.
    /// Ignored (with a warning) when fewer than 3 eligible layers exist.
    #[serde(default = "default_true")]
    pub exclude_first_last: bool,
    /// Weight-gradient policy applied by `update_weight_gradients`.
    #[serde(default)]
    pub grad_policy: GradPolicy,
}

impl Default for BinarizeConfig {
    fn default() -> Self {
        Self {
            exclude_first_last: true,
            grad_policy: GradPolicy::Identity,
        }
    }
}

// ── Network ─────────────────────────────────────────────────────────────────

/// Configuration of the two-conv / two-dense XNOR network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XnorConfig {
    // ── Input / output ──────────────────────────────────────────────────────
    /// Input image channels.
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    /// Input image side length (images are square).
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    /// Number of output classes.
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,

    // ── Layer widths ────────────────────────────────────────────────────────
    #[serde(default = "default_conv1_channels")]
    pub conv1_channels: usize,
    #[serde(default = "default_conv2_channels")]
    pub conv2_channels: usize,
    /// Square kernel size shared by both convolutions.
    #[serde(default = "default_kernel_size")]
    pub kernel_size: usize,
    /// Width of the hidden dense layer.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    /// Batch-norm epsilon.
    #[serde(default = "default_bn_eps")]
    pub bn_eps: f64,

    // ── Quantisation ────────────────────────────────────────────────────────
    /// STE used by the sign activations in front of binarized layers.
    #[serde(default)]
    pub activation_ste: SteMode,
    #[serde(default)]
    pub binarize: BinarizeConfig,
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_true() -> bool {
    true
}
fn default_in_channels() -> usize {
    1
}
fn default_image_size() -> usize {
    28
}
fn default_num_classes() -> usize {
    10
}
fn default_conv1_channels() -> usize {
    10
}
fn default_conv2_channels() -> usize {
    20
}
fn default_kernel_size() -> usize {
    5
}
fn default_hidden_size() -> usize {
    50
}
fn default_bn_eps() -> f64 {
    1e-4
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl Default for XnorConfig {
    fn default() -> Self {
        Self {
            in_channels: 1,
            image_size: 28, // MNIST
            num_classes: 10,
            conv1_channels: 10,
            conv2_channels: 20,
            kernel_size: 5,
            hidden_size: 50,
            bn_eps: 1e-4,
            activation_ste: SteMode::Clipped,
            binarize: BinarizeConfig::default(),
        }
    }
}

impl XnorConfig {
    /// Spatial side after conv1 → pool → conv2 → pool, if positive.
    fn feature_side(&self) -> Option<usize> {
        let shrink = self.kernel_size.checked_sub(1)?;
        let s1 = self.image_size.checked_sub(shrink)? / 2;
        let s2 = s1.checked_sub(shrink)? / 2;
        (s2 > 0).then_some(s2)
    }

    /// Width of the flattened conv features fed into the first dense layer
    /// (320 for the default 28×28 input).
    pub fn flat_features(&self) -> usize {
        self.feature_side()
            .map_or(0, |s| self.conv2_channels * s * s)
    }

    /// Reject configurations that cannot produce a working network.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.kernel_size == 0 {
            anyhow::bail!("kernel_size must be positive");
        }
        for (name, v) in [
            ("in_channels", self.in_channels),
            ("conv1_channels", self.conv1_channels),
            ("conv2_channels", self.conv2_channels),
            ("hidden_size", self.hidden_size),
            ("num_classes", self.num_classes),
        ] {
            if v == 0 {
                anyhow::bail!("{name} must be positive");
            }
        }
        if self.feature_side().is_none() {
            anyhow::bail!(
                "image_size {} too small for two {}x{} conv + pool stages",
                self.image_size,
                self.kernel_size,
                self.kernel_size
            );
        }
        if let GradPolicy::ClipValue { threshold } = self.binarize.grad_policy {
            if !(threshold > 0.0) {
                anyhow::bail!("grad_policy clip threshold must be > 0, got {threshold}");
            }
        }
        Ok(())
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
