use std::fmt::Debug;
use std::hash::Hash;

use indexmap::IndexMap;
use rand::Rng;
use rand_core::RngCore;
use thiserror::Error;

use crate::arm::{Arm, ArmError, EstimatorRule};
use crate::probability::weighted_choice;

/// Errors that can occur during bandit operations.
#[derive(Error, Debug)]
pub enum BanditError {
    /// A record operation named a key the engine never held (or no longer
    /// holds).
    #[error("no arm registered for key {key}")]
    UnknownArm { key: String },
    /// A construction parameter was outside its allowed range.
    #[error("parameter {name} out of range: {value}")]
    InvalidParameter { name: &'static str, value: f64 },
    /// The Bayesian draw requires a positive probability mass while arms
    /// remain.
    #[error("total probability {total} is not positive while arms remain")]
    InvalidProbability { total: f64 },
    /// An arm update failed its range check.
    #[error(transparent)]
    Arm(#[from] ArmError),
}

/// The `next` rule layered over the shared arm bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SelectionPolicy {
    /// Draw keys with probability proportional to their arm's estimate.
    Bayesian,
    /// Exploit the current best key(s) with probability `1 - epsilon`,
    /// otherwise explore the rest uniformly.
    EpsilonGreedy { epsilon: f64 },
    /// Cycle the live key set in insertion order, ignoring estimates.
    RoundRobin,
    /// Uniform over the live key set on every call, ignoring estimates.
    UniformRandom,
}

#[derive(Debug, Clone)]
struct Slot<V> {
    payload: V,
    arm: Arm,
}

/// Keyed payloads scored by success/trial history, with a pluggable
/// selection policy deciding which payload `next` yields.
///
/// All operations take `&mut self`; callers sharing an engine across
/// workers wrap it in a mutex and hold the lock for one operation at a
/// time.
#[derive(Debug)]
pub struct MultiArmedBandit<K, V> {
    rule: EstimatorRule,
    policy: SelectionPolicy,
    slots: IndexMap<K, Slot<V>>,
    cursor: usize,
}

impl<K, V> MultiArmedBandit<K, V>
where
    K: Eq + Hash + Clone + Debug,
{
    fn build(policy: SelectionPolicy, rule: EstimatorRule) -> Self {
        Self {
            rule,
            policy,
            slots: IndexMap::new(),
            cursor: 0,
        }
    }

    /// Engine with the given policy and Bayes-Laplace arms. Fails with
    /// `InvalidParameter` for an epsilon outside (0, 1).
    pub fn new(policy: SelectionPolicy) -> Result<Self, BanditError> {
        Self::with_rule(policy, EstimatorRule::default())
    }

    pub fn with_rule(policy: SelectionPolicy, rule: EstimatorRule) -> Result<Self, BanditError> {
        if let SelectionPolicy::EpsilonGreedy { epsilon } = policy {
            if !(epsilon > 0.0 && epsilon < 1.0) {
                return Err(BanditError::InvalidParameter {
                    name: "epsilon",
                    value: epsilon,
                });
            }
        }
        Ok(Self::build(policy, rule))
    }

    pub fn bayesian() -> Self {
        Self::build(SelectionPolicy::Bayesian, EstimatorRule::default())
    }

    pub fn round_robin() -> Self {
        Self::build(SelectionPolicy::RoundRobin, EstimatorRule::default())
    }

    pub fn uniform_random() -> Self {
        Self::build(SelectionPolicy::UniformRandom, EstimatorRule::default())
    }

    /// Stores `payload` under `key` with a fresh arm seeded from the
    /// engine's aggregate experience, then doubted so the inherited
    /// history stays easy to overturn. Replaces any existing entry.
    pub fn add_item(&mut self, key: K, payload: V) -> Result<(), BanditError> {
        let successes = self.total_successes();
        let trials = self.total_trials();
        let mut arm = Arm::new(self.rule);
        arm.update(successes, trials)?;
        arm.doubt()?;
        self.slots.insert(key, Slot { payload, arm });
        Ok(())
    }

    /// Removes `key` from the engine, preserving the order of the
    /// remaining entries. Absent keys are a no-op.
    pub fn del_item(&mut self, key: &K) -> Option<V> {
        self.slots.shift_remove(key).map(|slot| slot.payload)
    }

    pub fn record_result(
        &mut self,
        key: &K,
        successes: u64,
        trials: u64,
    ) -> Result<(), BanditError> {
        let slot = self.slots.get_mut(key).ok_or_else(|| BanditError::UnknownArm {
            key: format!("{key:?}"),
        })?;
        slot.arm.update(successes, trials)?;
        Ok(())
    }

    /// `successes` further successes for `key` (no trials; pair with
    /// `record_tries`).
    pub fn record_success(&mut self, key: &K, successes: u64) -> Result<(), BanditError> {
        self.record_result(key, successes, 0)
    }

    /// `tries` further trials for `key` without a success.
    pub fn record_tries(&mut self, key: &K, tries: u64) -> Result<(), BanditError> {
        self.record_result(key, 0, tries)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.slots.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.slots.get(key).map(|slot| &slot.payload)
    }

    pub fn arm(&self, key: &K) -> Option<&Arm> {
        self.slots.get(key).map(|slot| &slot.arm)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.slots.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V, &Arm)> {
        self.slots.iter().map(|(k, slot)| (k, &slot.payload, &slot.arm))
    }

    pub fn total_successes(&self) -> u64 {
        self.slots.values().map(|slot| slot.arm.successes()).sum()
    }

    pub fn total_trials(&self) -> u64 {
        self.slots.values().map(|slot| slot.arm.trials()).sum()
    }

    pub fn total_probability(&self) -> f64 {
        self.slots.values().map(|slot| slot.arm.probability()).sum()
    }

    pub fn mean_probability(&self) -> f64 {
        if self.slots.is_empty() {
            return 0.0;
        }
        self.total_probability() / self.slots.len() as f64
    }

    /// Mean over arms that have recorded at least one trial; 0.0 when none
    /// have.
    pub fn mean_probability_among_tried(&self) -> f64 {
        let tried: Vec<f64> = self
            .slots
            .values()
            .filter(|slot| slot.arm.trials() > 0)
            .map(|slot| slot.arm.probability())
            .collect();
        if tried.is_empty() {
            return 0.0;
        }
        tried.iter().sum::<f64>() / tried.len() as f64
    }

    /// Each key's share of the total probability mass.
    pub fn scaled_scores(&self) -> impl Iterator<Item = (&K, f64)> {
        let total = self.total_probability();
        self.slots.iter().map(move |(k, slot)| {
            let share = if total > 0.0 {
                slot.arm.probability() / total
            } else {
                0.0
            };
            (k, share)
        })
    }

    /// Yields the next payload under the engine's policy, or `Ok(None)`
    /// once no arms remain. The candidate set and the probabilities are
    /// re-read from the live map on every call, so items added or removed
    /// between calls take effect immediately.
    pub fn next(&mut self, rng: &mut dyn RngCore) -> Result<Option<&V>, BanditError> {
        if self.slots.is_empty() {
            return Ok(None);
        }
        let idx = match self.policy {
            SelectionPolicy::Bayesian => self.pick_bayesian(rng)?,
            SelectionPolicy::EpsilonGreedy { epsilon } => self.pick_epsilon_greedy(rng, epsilon),
            SelectionPolicy::RoundRobin => self.pick_round_robin(),
            SelectionPolicy::UniformRandom => (rng.next_u64() as usize) % self.slots.len(),
        };
        Ok(self.slots.get_index(idx).map(|(_, slot)| &slot.payload))
    }

    fn pick_bayesian(&self, rng: &mut dyn RngCore) -> Result<usize, BanditError> {
        let weights: Vec<f64> = self.slots.values().map(|slot| slot.arm.probability()).collect();
        let total: f64 = weights.iter().sum();
        weighted_choice(rng, &weights).ok_or(BanditError::InvalidProbability { total })
    }

    fn pick_epsilon_greedy(&self, rng: &mut dyn RngCore, epsilon: f64) -> usize {
        let max_p = self
            .slots
            .values()
            .map(|slot| slot.arm.probability())
            .fold(f64::NEG_INFINITY, f64::max);
        let mut max_set = Vec::new();
        let mut rest = Vec::new();
        for (idx, slot) in self.slots.values().enumerate() {
            if slot.arm.probability() == max_p {
                max_set.push(idx);
            } else {
                rest.push(idx);
            }
        }
        let pool = if rest.is_empty() || rng.random::<f64>() < 1.0 - epsilon {
            &max_set
        } else {
            &rest
        };
        pool[(rng.next_u64() as usize) % pool.len()]
    }

    fn pick_round_robin(&mut self) -> usize {
        let idx = self.cursor % self.slots.len();
        self.cursor = self.cursor.wrapping_add(1);
        idx
    }
}
