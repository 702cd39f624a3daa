//! Full-precision shadow buffers, index-aligned with the tracked parameters.
//!
//! Buffers are allocated once, with the shape and dtype of the parameter they
//! mirror, and afterwards only overwritten in place through [`Var::set`].
//! Every access checks the counterpart's shape first.

use candle_core::{Tensor, Var};

use crate::error::{BinarizeError, Result};

/// Ordered shadow buffers; `buffers[i]` mirrors tracked parameter `i`.
#[derive(Debug)]
pub struct ShadowStore {
    buffers: Vec<Var>,
}

impl ShadowStore {
    /// Allocate one buffer per parameter, initialised as a copy of it.
    pub fn allocate<'a>(params: impl IntoIterator<Item = &'a Var>) -> Result<Self> {
        let buffers = params
            .into_iter()
            .map(|p| -> Result<Var> {
                let buf = Var::zeros(p.dims(), p.dtype(), p.device())?;
                buf.set(p.as_tensor())?;
                Ok(buf)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { buffers })
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Saved value of buffer `index`.
    pub fn get(&self, index: usize) -> Option<&Tensor> {
        self.buffers.get(index).map(Var::as_tensor)
    }

    /// Fail with [`BinarizeError::ShapeMismatch`] unless `value` has the
    /// shape of buffer `index`.
    pub fn check(&self, index: usize, name: &str, value: &Tensor) -> Result<()> {
        let buf = self.buffer(index, name)?;
        if buf.dims() != value.dims() {
            return Err(BinarizeError::ShapeMismatch {
                index,
                name: name.to_string(),
                expected: buf.dims().to_vec(),
                actual: value.dims().to_vec(),
            });
        }
        Ok(())
    }

    /// Overwrite buffer `index` with `value`.
    pub fn save(&self, index: usize, name: &str, value: &Tensor) -> Result<()> {
        self.check(index, name, value)?;
        self.buffers[index].set(value)?;
        Ok(())
    }

    /// Copy buffer `index` back into `target`.
    pub fn load_into(&self, index: usize, name: &str, target: &Var) -> Result<()> {
        self.check(index, name, target.as_tensor())?;
        target.set(self.buffers[index].as_tensor())?;
        Ok(())
    }

    fn buffer(&self, index: usize, name: &str) -> Result<&Var> {
        self.buffers.get(index).ok_or_else(|| {
            BinarizeError::Configuration(format!(
                "no shadow buffer {index} for {name} (store holds {})",
                self.buffers.len()
            ))
        })
    }
}
