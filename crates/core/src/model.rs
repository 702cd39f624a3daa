//! LeNet-style XNOR network for 28×28 digit classification.
//!
//! ```text
//! conv1 → max-pool → relu                       full precision
//! bn2 → sign_ste → conv2 → max-pool → relu      binarized block
//! flatten → bn3 → sign_ste → fc1 → relu         binarized block
//! fc2                                           full precision
//! ```
//!
//! The network only *reads* its weights; binarizing them is the job of
//! [`crate::BinarizeController`], which reaches them through [`LayeredModel`].

use candle_core::{Result, Tensor, Var};
use candle_nn::{conv2d, linear, BatchNorm, Conv2d, Init, Linear, Module, ModuleT, VarBuilder};

use xnor_common::XnorConfig;

use crate::binarize::BinarizeController;
use crate::layer::{LayerParam, LayeredModel};
use crate::quantize::sign_ste;

// ── XnorNet ─────────────────────────────────────────────────────────────────

pub struct XnorNet {
    conv1: Conv2d,
    bn2: BatchNorm,
    conv2: Conv2d,
    bn3: BatchNorm,
    fc1: Linear,
    fc2: Linear,
    /// Parameter handles in forward order.
    layers: Vec<LayerParam>,
    config: XnorConfig,
}

impl XnorNet {
    pub fn new(vb: VarBuilder, config: &XnorConfig) -> Result<Self> {
        let k = config.kernel_size;
        let flat = config.flat_features();
        if flat == 0 {
            candle_core::bail!(
                "image_size {} leaves no features after two {k}x{k} conv + pool stages",
                config.image_size
            );
        }

        let conv1 = conv2d(
            config.in_channels,
            config.conv1_channels,
            k,
            Default::default(),
            vb.pp("conv1"),
        )?;
        let (bn2, bn2_w) = batch_norm(config.conv1_channels, config.bn_eps, vb.pp("bn2"))?;
        let conv2 = conv2d(
            config.conv1_channels,
            config.conv2_channels,
            k,
            Default::default(),
            vb.pp("conv2"),
        )?;
        let (bn3, bn3_w) = batch_norm(flat, config.bn_eps, vb.pp("bn3"))?;
        let fc1 = linear(flat, config.hidden_size, vb.pp("fc1"))?;
        let fc2 = linear(config.hidden_size, config.num_classes, vb.pp("fc2"))?;

        let layers = vec![
            LayerParam::conv("conv1", Var::from_tensor(conv1.weight())?)
                .with_bias(var_opt(conv1.bias())?),
            bn2_w.into_layer("bn2"),
            LayerParam::conv("conv2", Var::from_tensor(conv2.weight())?)
                .with_bias(var_opt(conv2.bias())?),
            bn3_w.into_layer("bn3"),
            LayerParam::dense("fc1", Var::from_tensor(fc1.weight())?)
                .with_bias(var_opt(fc1.bias())?),
            LayerParam::dense("fc2", Var::from_tensor(fc2.weight())?)
                .with_bias(var_opt(fc2.bias())?),
        ];

        Ok(Self {
            conv1,
            bn2,
            conv2,
            bn3,
            fc1,
            fc2,
            layers,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &XnorConfig {
        &self.config
    }
}

impl ModuleT for XnorNet {
    /// `xs`: `(B, C, S, S)` images → `(B, num_classes)` logits.
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let ste = self.config.activation_ste;

        let x = self.conv1.forward(xs)?.max_pool2d(2)?.relu()?;

        let x = self.bn2.forward_t(&x, train)?;
        let x = sign_ste(&x, ste)?;
        let x = self.conv2.forward(&x)?.max_pool2d(2)?.relu()?;

        let x = x.flatten_from(1)?;
        let x = self.bn3.forward_t(&x, train)?;
        let x = sign_ste(&x, ste)?;
        let x = self.fc1.forward(&x)?.relu()?;

        self.fc2.forward(&x)
    }
}

impl LayeredModel for XnorNet {
    fn layers(&self) -> Vec<LayerParam> {
        self.layers.clone()
    }
}

// ── Batch norm ──────────────────────────────────────────────────────────────

/// Affine batch-norm parameters as controller-visible handles.
struct NormParams {
    weight: Var,
    bias: Var,
}

impl NormParams {
    fn into_layer(self, name: &str) -> LayerParam {
        LayerParam::batch_norm(name, self.weight).with_bias(Some(self.bias))
    }
}

fn batch_norm(num_features: usize, eps: f64, vb: VarBuilder) -> Result<(BatchNorm, NormParams)> {
    let running_mean = vb.get_with_hints(num_features, "running_mean", Init::Const(0.))?;
    let running_var = vb.get_with_hints(num_features, "running_var", Init::Const(1.))?;
    let weight = vb.get_with_hints(num_features, "weight", Init::Const(1.))?;
    let bias = vb.get_with_hints(num_features, "bias", Init::Const(0.))?;
    let params = NormParams {
        weight: Var::from_tensor(&weight)?,
        bias: Var::from_tensor(&bias)?,
    };
    let bn = BatchNorm::new(num_features, running_mean, running_var, weight, bias, eps)?;
    Ok((bn, params))
}

fn var_opt(t: Option<&Tensor>) -> Result<Option<Var>> {
    t.map(Var::from_tensor).transpose()
}

// ── Compression Stats ───────────────────────────────────────────────────────

/// Parameter counts and storage cost once tracked weights are packed to 1 bit.
#[derive(Debug, Clone)]
pub struct CompressionStats {
    pub total_params: usize,
    pub binarized_params: usize,
    /// Effective bits per weight: (binary×1 + full×32) / total.
    pub effective_bits_per_param: f64,
    /// Compression ratio vs FP32.
    pub compression_ratio_vs_f32: f64,
}

/// Count trainable parameters of `model` and the share `controller` binarizes.
///
/// Per-channel scales are stored in full precision and counted as such.
pub fn compression_stats<M: LayeredModel + ?Sized>(
    model: &M,
    controller: &BinarizeController,
) -> CompressionStats {
    let total: usize = model.layers().iter().map(LayerParam::num_params).sum();
    let binarized = controller.tracked_params();
    let scales: usize = controller.targets().iter().map(|t| t.shape()[0]).sum();

    let bits_full = 32.0;
    let full = total.saturating_sub(binarized) + scales;
    let effective_bits = (binarized as f64 + full as f64 * bits_full) / total.max(1) as f64;

    CompressionStats {
        total_params: total,
        binarized_params: binarized,
        effective_bits_per_param: effective_bits,
        compression_ratio_vs_f32: bits_full / effective_bits,
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use xnor_common::BinarizeConfig;

    use crate::layer::LayerKind;

    fn build() -> (XnorNet, VarMap) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = XnorNet::new(vb, &XnorConfig::default()).unwrap();
        (net, varmap)
    }

    #[test]
    fn forward_produces_class_logits() {
        let (net, _vm) = build();
        let x = Tensor::randn(0f32, 1.0, (3, 1, 28, 28), &Device::Cpu).unwrap();
        assert_eq!(net.forward_t(&x, true).unwrap().dims(), &[3, 10]);
        assert_eq!(net.forward_t(&x, false).unwrap().dims(), &[3, 10]);
    }

    #[test]
    fn layers_follow_forward_order() {
        let (net, _vm) = build();
        let layers = net.layers();
        let summary: Vec<_> = layers
            .iter()
            .map(|l| (l.name.as_str(), l.kind, l.weight.as_ref().unwrap().dims().to_vec()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("conv1", LayerKind::Conv, vec![10, 1, 5, 5]),
                ("bn2", LayerKind::BatchNorm, vec![10]),
                ("conv2", LayerKind::Conv, vec![20, 10, 5, 5]),
                ("bn3", LayerKind::BatchNorm, vec![320]),
                ("fc1", LayerKind::Dense, vec![50, 320]),
                ("fc2", LayerKind::Dense, vec![10, 50]),
            ]
        );
    }

    #[test]
    fn controller_tracks_conv2_and_fc1() {
        let (net, _vm) = build();
        let ctl = BinarizeController::new(&net, &BinarizeConfig::default()).unwrap();
        let names: Vec<_> = ctl.targets().iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["conv2", "fc1"]);
    }

    #[test]
    fn layer_handles_share_storage_with_varmap() {
        let (net, varmap) = build();
        let mut ctl = BinarizeController::new(&net, &BinarizeConfig::default()).unwrap();
        ctl.binarize().unwrap();
        let data = varmap.data().lock().unwrap();
        let fc1 = data.get("fc1.weight").unwrap();
        let vals: Vec<f32> = fc1.as_tensor().flatten_all().unwrap().to_vec1().unwrap();
        // A binarized row holds at most {-α, 0, +α}.
        let row = &vals[..320];
        let alpha = row.iter().map(|v| v.abs()).fold(0.0f32, f32::max);
        assert!(row
            .iter()
            .all(|v| *v == 0.0 || (v.abs() - alpha).abs() < 1e-6));
    }

    #[test]
    fn compression_stats_count_tracked_weights() {
        let (net, _vm) = build();
        let ctl = BinarizeController::new(&net, &BinarizeConfig::default()).unwrap();
        let stats = compression_stats(&net, &ctl);
        assert_eq!(stats.binarized_params, 20 * 10 * 25 + 50 * 320);
        // conv1 260, bn2 20, conv2 5020, bn3 640, fc1 16050, fc2 510
        assert_eq!(stats.total_params, 22_500);
        assert!(stats.effective_bits_per_param < 32.0);
        assert!(stats.compression_ratio_vs_f32 > 1.0);
    }

    #[test]
    fn rejects_images_too_small_for_the_stack() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = XnorConfig {
            image_size: 10,
            ..Default::default()
        };
        assert!(XnorNet::new(vb, &config).is_err());
    }
}
