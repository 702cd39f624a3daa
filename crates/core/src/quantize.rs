//! Binarization primitives: sign, STE, centering, per-channel scale.
//!
//! These are pure tensor functions. The controller composes them for weights;
//! [`sign_ste`] is used directly on activations inside the forward graph.

use candle_core::{Result, Tensor};

use xnor_common::SteMode;

// ── Sign ────────────────────────────────────────────────────────────────────

/// Element-wise sign with `sign(0) = 0`, built outside the autodiff graph.
///
/// Computed as `[x > 0] - [x < 0]` so exact zeros (and NaNs) map to `0`.
pub fn sign_zero(x: &Tensor) -> Result<Tensor> {
    let x = x.detach();
    let pos = x.gt(0.0)?.to_dtype(x.dtype())?;
    let neg = x.lt(0.0)?.to_dtype(x.dtype())?;
    pos - neg
}

/// Sign activation with a straight-through backward rule.
///
/// The trick: `sign(x) + (x - x.detach()) * mask`. In the forward pass the
/// residual is zero so the output is `sign(x)`. In the backward pass
/// `∂(residual)/∂x = mask`, so the upstream gradient is multiplied by `mask`:
///
/// * [`SteMode::Identity`]: `mask = 1`.
/// * [`SteMode::Clipped`]: `mask = [|x| <= 1]` (hard-tanh derivative).
///
/// `x` itself is never mutated.
pub fn sign_ste(x: &Tensor, mode: SteMode) -> Result<Tensor> {
    let sign_x = sign_zero(x)?;
    let residual = (x - &x.detach())?;
    let residual = match mode {
        SteMode::Identity => residual,
        SteMode::Clipped => {
            let pass = x.detach().abs()?.le(1.0)?.to_dtype(x.dtype())?;
            (residual * pass)?
        }
    };
    &sign_x + &residual
}

// ── Weight transforms ───────────────────────────────────────────────────────

/// Subtract the mean along dim 1 (input axis), then clamp to `[-1, 1]`.
pub fn center_and_clamp(w: &Tensor) -> Result<Tensor> {
    let w = w.detach();
    let mean = w.mean_keepdim(1)?;
    w.broadcast_sub(&mean)?.clamp(-1f64, 1f64)
}

/// Per-output-channel scale `α = ‖w_o‖₁ / n`, shaped to broadcast over `w`.
///
/// For a `(O, I, KH, KW)` conv weight `n = I·KH·KW` and the result is
/// `(O, 1, 1, 1)`; for an `(O, I)` dense weight `n = I` and the result is
/// `(O, 1)`. An all-zero slice yields exactly `0`.
pub fn channel_scale(w: &Tensor) -> Result<Tensor> {
    let dims = w.dims();
    if dims.len() < 2 {
        candle_core::bail!("channel_scale needs a rank >= 2 weight, got {dims:?}");
    }
    let out = dims[0];
    let n: usize = dims[1..].iter().product();
    let mut keep = vec![1usize; dims.len()];
    keep[0] = out;
    let l1 = w.detach().abs()?.flatten_from(1)?.sum_keepdim(1)?;
    l1.affine(1.0 / n as f64, 0.0)?.reshape(keep)
}

/// `sign(w) · α` with α from [`channel_scale`].
pub fn binarize_weight(w: &Tensor) -> Result<Tensor> {
    let alpha = channel_scale(w)?;
    sign_zero(w)?.broadcast_mul(&alpha)
}

// ── Tests ───────────────────────────────────────────────────────────────────
