//! # xnor-core — The Binarization Engine
//!
//! Everything needed to train a network with XNOR-style binary weights:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`quantize`] | `sign_zero`, `sign_ste`, centering, per-channel scale |
//! | [`layer`] | `LayerKind`, `LayerParam`, the `LayeredModel` trait |
//! | [`shadow`] | `ShadowStore` of full-precision weight copies |
//! | [`binarize`] | `BinarizeController` (binarize / restore / gradient policy) |
//! | [`model`] | `XnorNet` reference network, `CompressionStats` |
//! | [`error`] | `BinarizeError` |
//!
//! ## Per-step protocol
//!
//! `binarize()` → forward → backward → `restore()` →
//! `update_weight_gradients()` → optimiser step. Outside the
//! binarize → backward window every tracked weight is full precision.
//!
//! ## Design principles
//!
//! 1. **Candle all the way down.** Tensors, autodiff and optimisers come from
//!    `candle-core`/`candle-nn`; weights are mutated in place through `Var`.
//! 2. **No ambient state.** The host owns model and controller and passes
//!    them explicitly.
//! 3. **Validate, then mutate.** A failing step never leaves a model
//!    half-binarized.

pub mod binarize;
pub mod error;
pub mod layer;
pub mod model;
pub mod quantize;
pub mod shadow;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use binarize::{BinarizeController, ParamState, TargetParam};
pub use error::{BinarizeError, Result};
pub use layer::{LayerKind, LayerParam, LayeredModel};
pub use model::{compression_stats, CompressionStats, XnorNet};
pub use quantize::{binarize_weight, center_and_clamp, channel_scale, sign_ste, sign_zero};
pub use shadow::ShadowStore;
