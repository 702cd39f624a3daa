//! # xnor-train — The Training Loop
//!
//! * **[`Trainer`]** — owns model, varmap, binarization controller and
//!   optimiser. One call to [`Trainer::step`] runs binarize, forward,
//!   backward, restore, the gradient policy, clipping, AdamW and schedule
//!   advancement, in that order. [`Trainer::train`] loops steps over a batch
//!   source with the configured log / eval / checkpoint cadence.
//! * **[`LrScheduler`]** — warmup → step decay.

pub mod scheduler;
pub mod trainer;

pub use scheduler::{LrDecay, LrScheduler};
pub use trainer::{EvalMetrics, StepMetrics, TrainSummary, Trainer, TrainerConfig};
