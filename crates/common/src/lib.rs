//! # xnor-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`XnorConfig`]** — network hyper-parameters (serialised as JSON).
//! * **[`BinarizeConfig`]**, **[`SteMode`]**, **[`GradPolicy`]** — binarization policy knobs.
//! * **[`SyntheticDigits`]** / **[`batch_to_tensors`]** — batch source → Candle tensors.

pub mod config;
pub mod data;

pub use config::{BinarizeConfig, GradPolicy, SteMode, XnorConfig};
pub use data::{batch_to_tensors, SyntheticDigits};
