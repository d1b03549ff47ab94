use rand::Rng;
use rand_core::RngCore;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbabilityError {
    #[error("parameter {name} out of range: {value}")]
    InvalidParameter { name: &'static str, value: f64 },
}

fn check_confidence(confidence: f64) -> Result<(), ProbabilityError> {
    if !(confidence > 0.0 && confidence < 1.0) {
        return Err(ProbabilityError::InvalidParameter {
            name: "confidence",
            value: confidence,
        });
    }
    Ok(())
}

/// Sum-of-logs is exact to rounding below this; Stirling's series takes over
/// above it, where its truncation error is already far below f64 precision.
const STIRLING_CUTOVER: u64 = 256;

/// ln(n!), stable for large n.
pub fn ln_factorial(n: u64) -> f64 {
    if n < 2 {
        return 0.0;
    }
    if n < STIRLING_CUTOVER {
        return (2..=n).map(|k| (k as f64).ln()).sum();
    }
    let x = n as f64;
    let ln_2pi = (2.0 * std::f64::consts::PI).ln();
    x * x.ln() - x + 0.5 * (ln_2pi + x.ln()) + 1.0 / (12.0 * x) - 1.0 / (360.0 * x.powi(3))
        + 1.0 / (1260.0 * x.powi(5))
}

/// Average number of elements changed when each of `population` elements is
/// changed independently with probability `p` (truncated toward zero).
pub fn shot_size(population: u64, p: f64) -> u64 {
    (p * population as f64).floor() as u64
}

/// Smallest number of consecutive misses after which you can conclude, with
/// the given confidence, that the true per-try hit probability is below
/// `p_hit`. Degenerate inputs follow the batch model: `p_hit <= 0` means
/// quit now (0), `p_hit >= 1` means one try settles it (1).
pub fn misses_until_quit(confidence: f64, p_hit: f64) -> Result<u64, ProbabilityError> {
    check_confidence(confidence)?;
    if p_hit <= 0.0 {
        return Ok(0);
    }
    if p_hit >= 1.0 {
        return Ok(1);
    }
    let x = (1.0 - confidence).ln() / (1.0 - p_hit).ln();
    Ok(x.ceil() as u64)
}

/// Maximum per-try hit probability consistent, at the given confidence, with
/// having observed `tries` misses in a row.
pub fn p_max_hit(tries: u64, confidence: f64) -> Result<f64, ProbabilityError> {
    check_confidence(confidence)?;
    if tries == 0 {
        return Err(ProbabilityError::InvalidParameter {
            name: "tries",
            value: 0.0,
        });
    }
    Ok(1.0 - (1.0 - confidence).powf(1.0 / tries as f64))
}

/// Cumulative-weight draw: returns the index of the chosen weight, or `None`
/// when `weights` is empty or sums to a non-positive value. Floating-point
/// drift at the top of the cumulative range falls back to the last positive
/// weight instead of dropping the draw.
pub fn weighted_choice(rng: &mut dyn RngCore, weights: &[f64]) -> Option<usize> {
    let total: f64 = weights.iter().sum();
    if weights.is_empty() || total <= 0.0 {
        return None;
    }
    let x: f64 = rng.random::<f64>() * total;
    let mut cumulative = 0.0;
    for (idx, w) in weights.iter().enumerate() {
        cumulative += w;
        if x < cumulative {
            return Some(idx);
        }
    }
    weights.iter().rposition(|w| *w > 0.0)
}

/// Hit/miss odds for one batch of random keeps: `population` positions, of
/// which `targets` must all survive, when each position is kept with
/// probability `keep_chance`. Works in bits or bytes as long as the caller
/// is consistent.
#[derive(Debug, Clone)]
pub struct TrialModel {
    population: u64,
    targets: u64,
    keep_chance: f64,
    shot: u64,
    p_hit: f64,
}

impl TrialModel {
    pub fn new(population: u64, targets: u64, keep_chance: f64) -> Result<Self, ProbabilityError> {
        if population == 0 {
            return Err(ProbabilityError::InvalidParameter {
                name: "population",
                value: 0.0,
            });
        }
        if !(keep_chance > 0.0 && keep_chance < 1.0) {
            return Err(ProbabilityError::InvalidParameter {
                name: "keep_chance",
                value: keep_chance,
            });
        }
        let shot = shot_size(population, keep_chance);
        // A batch cannot cover a target larger than itself.
        if targets > population || targets > shot {
            return Err(ProbabilityError::InvalidParameter {
                name: "targets",
                value: targets as f64,
            });
        }
        let ln_p = ln_factorial(shot) + ln_factorial(population - targets)
            - ln_factorial(population)
            - ln_factorial(shot - targets);
        Ok(Self {
            population,
            targets,
            keep_chance,
            shot,
            p_hit: ln_p.exp(),
        })
    }

    pub fn population(&self) -> u64 {
        self.population
    }

    pub fn targets(&self) -> u64 {
        self.targets
    }

    pub fn keep_chance(&self) -> f64 {
        self.keep_chance
    }

    pub fn shot_size(&self) -> u64 {
        self.shot
    }

    pub fn ln_p_hit(&self) -> f64 {
        self.p_hit.ln()
    }

    pub fn p_hit(&self) -> f64 {
        self.p_hit
    }

    pub fn p_miss(&self) -> f64 {
        1.0 - self.p_hit
    }

    pub fn misses_until_quit(&self, confidence: f64) -> Result<u64, ProbabilityError> {
        misses_until_quit(confidence, self.p_hit)
    }

    pub fn should_stop(&self, miss_count: u64, confidence: f64) -> Result<bool, ProbabilityError> {
        Ok(miss_count >= self.misses_until_quit(confidence)?)
    }
}
