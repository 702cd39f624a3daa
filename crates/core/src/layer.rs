//! Model-side view consumed by the binarization controller.
//!
//! A model exposes its layers in forward-composition order; each layer
//! carries a kind tag and handles to its trainable tensors. Handles are
//! Candle [`Var`]s, so writing through them updates the tensor the model's
//! forward pass reads.

use candle_core::Var;

/// Coarse layer classification. Only `Conv` and `Dense` are binarizable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Conv,
    Dense,
    BatchNorm,
    Other,
}

impl LayerKind {
    pub fn is_binarizable(self) -> bool {
        matches!(self, Self::Conv | Self::Dense)
    }
}

/// One layer as seen by the controller.
#[derive(Debug, Clone)]
pub struct LayerParam {
    pub name: String,
    pub kind: LayerKind,
    pub weight: Option<Var>,
    pub bias: Option<Var>,
}

impl LayerParam {
    pub fn conv(name: impl Into<String>, weight: Var) -> Self {
        Self::new(name, LayerKind::Conv, Some(weight))
    }

    pub fn dense(name: impl Into<String>, weight: Var) -> Self {
        Self::new(name, LayerKind::Dense, Some(weight))
    }

    pub fn batch_norm(name: impl Into<String>, weight: Var) -> Self {
        Self::new(name, LayerKind::BatchNorm, Some(weight))
    }

    /// A layer with no weight of its own, e.g. a standalone bias.
    pub fn other(name: impl Into<String>) -> Self {
        Self::new(name, LayerKind::Other, None)
    }

    pub fn with_bias(mut self, bias: Option<Var>) -> Self {
        self.bias = bias;
        self
    }

    fn new(name: impl Into<String>, kind: LayerKind, weight: Option<Var>) -> Self {
        Self {
            name: name.into(),
            kind,
            weight,
            bias: None,
        }
    }

    /// Weight-bearing convolution or dense layer.
    pub fn is_binarizable(&self) -> bool {
        self.kind.is_binarizable() && self.weight.is_some()
    }

    /// Trainable element count (weight + bias).
    pub fn num_params(&self) -> usize {
        [&self.weight, &self.bias]
            .into_iter()
            .flatten()
            .map(|v| v.elem_count())
            .sum()
    }
}

/// Ordered traversal over a model's layers.
pub trait LayeredModel {
    /// Layers in forward-composition order.
    fn layers(&self) -> Vec<LayerParam>;
}

impl LayeredModel for [LayerParam] {
    fn layers(&self) -> Vec<LayerParam> {
        self.to_vec()
    }
}

impl LayeredModel for Vec<LayerParam> {
    fn layers(&self) -> Vec<LayerParam> {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn only_weighted_conv_and_dense_are_binarizable() {
        let dev = Device::Cpu;
        let w = Var::zeros((4, 3), DType::F32, &dev).unwrap();
        assert!(LayerParam::conv("c", w.clone()).is_binarizable());
        assert!(LayerParam::dense("d", w.clone()).is_binarizable());
        assert!(!LayerParam::batch_norm("bn", w).is_binarizable());
        assert!(!LayerParam::other("bias").is_binarizable());
    }

    #[test]
    fn num_params_counts_weight_and_bias() {
        let dev = Device::Cpu;
        let w = Var::zeros((4, 3), DType::F32, &dev).unwrap();
        let b = Var::zeros(4, DType::F32, &dev).unwrap();
        let layer = LayerParam::dense("fc", w).with_bias(Some(b));
        assert_eq!(layer.num_params(), 16);
        assert_eq!(LayerParam::other("x").num_params(), 0);
    }
}
