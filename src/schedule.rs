//! EMA decay schedules.
//!
//! A training loop using an exponential moving average of model weights
//! looks up a schedule by name once at startup and calls
//! [`DecaySchedule::compute`] with the configured base decay before each
//! averaging step. All schedules are pure functions of
//! `(decay, step, total_steps)`.

/// A decay schedule for exponential-moving-average weight updates.
///
/// The closed set of strategies is selected by name through
/// [`DecaySchedule::from_name`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DecaySchedule {
    /// The base decay, unchanged. No warm-up.
    Constant,

    /// Clamps the decay to a slowly-rising ceiling early in training, which
    /// prevents over-aggressive averaging while few updates have been
    /// observed.
    Threshold,

    /// Smooth exponential warm-up of the decay factor, reaching full
    /// strength as `step` approaches `total_steps`.
    Exp {
        /// Warm-up sharpness.
        beta: f64,
    },
}

/// Constructors for the named schedules. `beta` is ignored by schedules
/// that take no parameter.
type ScheduleCtor = fn(beta: f64) -> DecaySchedule;

/// Lookup table mapping schedule names to constructors. Fixed at compile
/// time and read-only thereafter.
pub const EMA_DECAY_SCHEDULES: &[(&str, ScheduleCtor)] = &[
    ("constant", |_| DecaySchedule::Constant),
    ("threshold", |_| DecaySchedule::Threshold),
    ("exp", |beta| DecaySchedule::Exp { beta }),
];

impl DecaySchedule {
    /// Look up a schedule by name.
    ///
    /// `beta` parametrizes the `exp` schedule and is ignored by the others.
    pub fn from_name(name: &str, beta: f64) -> Option<DecaySchedule> {
        EMA_DECAY_SCHEDULES
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, ctor)| ctor(beta))
    }

    /// Compute the effective decay for one step.
    ///
    /// `decay` is the configured base decay, `step` the current optimization
    /// step and `total_steps` the length of the training run.
    ///
    /// For [`DecaySchedule::Exp`], `total_steps` must be non-zero; the
    /// training loop owns that guarantee, and a zero value produces a
    /// non-finite result rather than a panic.
    pub fn compute(&self, decay: f64, step: usize, total_steps: usize) -> f64 {
        match self {
            DecaySchedule::Constant => decay,
            DecaySchedule::Threshold => decay.min((1 + step) as f64 / (10 + step) as f64),
            DecaySchedule::Exp { beta } => {
                let x = step as f64 / total_steps as f64;
                decay * (1.0 - (-x * beta).exp())
            }
        }
    }
}
