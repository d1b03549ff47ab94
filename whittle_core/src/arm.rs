use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ArmError {
    #[error("arm update produced probability {probability} outside [0, 1]")]
    InvalidProbability { probability: f64 },
}

/// How an arm turns its success/trial counts into a probability estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EstimatorRule {
    /// Always 1.0; an "always explore" arm.
    Constant,
    /// Laplace's law of succession: `(successes + 1) / (trials + 2)`, with
    /// `trials` clamped up to `successes` so a success recorded ahead of its
    /// trial cannot push the estimate past 1.
    #[default]
    BayesLaplace,
}

/// One alternative in a multi-armed-bandit problem: success/trial counters
/// and a probability estimate kept current by every mutation.
#[derive(Debug, Clone)]
pub struct Arm {
    rule: EstimatorRule,
    successes: u64,
    trials: u64,
    probability: f64,
}

impl Arm {
    pub fn new(rule: EstimatorRule) -> Self {
        let mut arm = Self {
            rule,
            successes: 0,
            trials: 0,
            probability: 0.0,
        };
        // Both rules estimate in range for zero counts.
        arm.probability = arm.estimate();
        arm
    }

    fn estimate(&self) -> f64 {
        match self.rule {
            EstimatorRule::Constant => 1.0,
            EstimatorRule::BayesLaplace => {
                (self.successes + 1) as f64 / (self.trials.max(self.successes) + 2) as f64
            }
        }
    }

    fn refresh(&mut self) -> Result<(), ArmError> {
        let p = self.estimate();
        if !(0.0..=1.0).contains(&p) {
            return Err(ArmError::InvalidProbability { probability: p });
        }
        self.probability = p;
        Ok(())
    }

    /// Accumulates counts and recomputes the probability estimate.
    pub fn update(&mut self, successes: u64, trials: u64) -> Result<(), ArmError> {
        self.successes += successes;
        self.trials += trials;
        self.refresh()
    }

    /// Keeps the estimate roughly where it is but collapses the evidence
    /// behind it, so inherited experience stays easy to overturn.
    pub fn doubt(&mut self) -> Result<(), ArmError> {
        if self.successes == 0 {
            return Ok(());
        }
        self.trials = (self.trials / self.successes).max(1);
        self.successes = 1;
        self.refresh()
    }

    /// Drops all recorded evidence.
    pub fn forget(&mut self) -> Result<(), ArmError> {
        self.successes = 0;
        self.trials = 0;
        self.refresh()
    }

    pub fn rule(&self) -> EstimatorRule {
        self.rule
    }

    pub fn successes(&self) -> u64 {
        self.successes
    }

    pub fn trials(&self) -> u64 {
        self.trials
    }

    pub fn failures(&self) -> u64 {
        self.trials.saturating_sub(self.successes)
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }
}
