//! Learning rate schedule: linear warmup, then step decay.

// ── LR Scheduler ────────────────────────────────────────────────────────────

/// Decay mode after warmup.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LrDecay {
    /// Multiply the rate by `gamma` every `step_size` optimiser steps.
    Step { step_size: usize, gamma: f64 },
    None,
}

impl LrDecay {
    /// `"step"` uses the given cadence; anything else disables decay.
    pub fn from_str(s: &str, step_size: usize, gamma: f64) -> Self {
        match s {
            "step" if step_size > 0 => Self::Step { step_size, gamma },
            _ => Self::None,
        }
    }
}

/// Warmup → step-decay learning rate.
#[derive(Clone, Debug)]
pub struct LrScheduler {
    step: usize,
    lr: f64,
    warmup_steps: usize,
    decay: LrDecay,
}

impl LrScheduler {
    pub fn new(lr: f64, warmup_steps: usize, decay: LrDecay) -> Self {
        Self {
            step: 0,
            lr,
            warmup_steps,
            decay,
        }
    }

    /// Learning rate at the current step.
    pub fn current_lr(&self) -> f64 {
        let step = self.step;

        // Warmup phase: linear ramp from lr/warmup to lr.
        if self.warmup_steps > 0 && step < self.warmup_steps {
            return self.lr * (step as f64 + 1.0) / self.warmup_steps as f64;
        }

        match self.decay {
            LrDecay::Step { step_size, gamma } if step_size > 0 => {
                let k = (step - self.warmup_steps) / step_size;
                self.lr * gamma.powi(k as i32)
            }
            _ => self.lr,
        }
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }

    pub fn step(&self) -> usize {
        self.step
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lr_warmup() {
        let sched = LrScheduler::new(1e-2, 10, LrDecay::None);
        // Step 0: (0+1)/10 * 1e-2 = 1e-3
        assert!((sched.current_lr() - 1e-3).abs() < 1e-12);
    }

    #[test]
    fn lr_step_decay_after_warmup() {
        let decay = LrDecay::Step {
            step_size: 100,
            gamma: 0.1,
        };
        let mut sched = LrScheduler::new(1e-2, 10, decay);
        for _ in 0..10 {
            sched.advance();
        }
        assert!((sched.current_lr() - 1e-2).abs() < 1e-12);
        for _ in 0..100 {
            sched.advance();
        }
        assert!((sched.current_lr() - 1e-3).abs() < 1e-12);
        for _ in 0..100 {
            sched.advance();
        }
        assert!((sched.current_lr() - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn lr_no_decay() {
        let mut sched = LrScheduler::new(1e-3, 0, LrDecay::None);
        for _ in 0..500 {
            sched.advance();
        }
        assert!((sched.current_lr() - 1e-3).abs() < 1e-12);
    }

    #[test]
    fn from_str_falls_back_to_none() {
        assert_eq!(LrDecay::from_str("none", 10, 0.1), LrDecay::None);
        assert_eq!(LrDecay::from_str("step", 0, 0.1), LrDecay::None);
        assert_eq!(
            LrDecay::from_str("step", 5, 0.5),
            LrDecay::Step {
                step_size: 5,
                gamma: 0.5
            }
        );
    }
}
