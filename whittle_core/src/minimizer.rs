//! Crash-preserving input minimization.
//!
//! Given a seed file and a fuzzed mutation of it that crashes a target,
//! [`Minimizer`] walks the fuzzed input back toward the seed one random
//! swap at a time, keeping only candidates that still reproduce the
//! crash. The walk stops when it is statistically confident no closer
//! reproducing input remains, or when a budget runs out.

use std::collections::HashSet;
use std::time::Duration;

use indexmap::IndexMap;
use rand::Rng;
use rand_core::RngCore;
use thiserror::Error;
use tracing::{debug, info};

use crate::clock::{CancelToken, Clock, SystemClock};
use crate::hamming::{DistanceError, DistanceMetric};
use crate::input::Input;
use crate::oracle::{CrashOracle, CrashReport, CrashSignature, OracleError};
use crate::probability::{ProbabilityError, misses_until_quit};

/// Resample attempts per proposal before scoring the try a miss.
const PROPOSAL_RETRY_CAP: u32 = 4096;

#[derive(Error, Debug)]
pub enum MinimizerError {
    /// The input handed to the run, or the run's own result, does not
    /// reproduce the target crash.
    #[error("input does not reproduce the target crash: {reason}")]
    NotReproducible { reason: String },
    /// The oracle itself failed during the initial or final check.
    /// Failures between those are scored as misses instead.
    #[error("oracle failed while {stage}")]
    Oracle {
        stage: &'static str,
        #[source]
        source: OracleError,
    },
    #[error(transparent)]
    Distance(#[from] DistanceError),
    #[error(transparent)]
    Probability(#[from] ProbabilityError),
}

/// Why a minimization run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Confident that no closer reproducing input remains.
    Confidence,
    /// Every strict intermediate at the final distance has been tried.
    Exhausted,
    /// Distance reached the floor; no strictly closer candidate exists.
    DistanceFloor,
    /// The wall-clock budget ran out.
    TimeBudget,
    /// The caller's cancel token fired.
    Cancelled,
    /// Too many crashes with other signatures turned up.
    OtherCrashLimit,
}

/// Counters for one minimization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    /// Candidate proposals, including deduplicated ones.
    pub tries: u64,
    /// Tries that did not improve on the best input.
    pub misses: u64,
    /// Oracle invocations, including the initial and final checks.
    pub oracle_calls: u64,
    /// Tries accepted as a closer reproduction.
    pub accepts: u64,
    /// Tries skipped because the candidate had been seen before.
    pub dedup_skips: u64,
    pub elapsed: Duration,
    pub stop: StopReason,
}

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct MinimizationResult<I> {
    /// The closest input to the seed that still reproduces the crash.
    pub minimized: I,
    /// Distance from the seed to `minimized`.
    pub min_distance: u64,
    /// Distance from the seed to the fuzzed input the run started from.
    pub start_distance: u64,
    /// First crashing input seen per foreign signature.
    pub other_crashes: IndexMap<CrashSignature, I>,
    pub stats: RunStats,
}

#[derive(Debug, Clone)]
pub struct MinimizerConfig {
    pub metric: DistanceMetric,
    /// Confidence that no closer reproducing input remains when the run
    /// stops on the miss budget. Strictly between 0 and 1.
    pub confidence: f64,
    /// Wall-clock budget for the whole run. `None` leaves the run to
    /// the other stop rules.
    pub max_time: Option<Duration>,
    /// Stop once more than this many foreign signatures are recorded.
    pub max_other_crashes: usize,
    /// Accept a crash flagged as ambiguous corruption in place of the
    /// target signature when the candidate got no farther from the seed.
    pub ambiguous_tiebreak: bool,
}

impl Default for MinimizerConfig {
    fn default() -> Self {
        Self {
            metric: DistanceMetric::default(),
            confidence: 0.999,
            max_time: None,
            max_other_crashes: 20,
            ambiguous_tiebreak: true,
        }
    }
}

/// One minimization problem: a seed, a crashing fuzzed variant of it,
/// and the crash signature the result must keep reproducing.
///
/// [`Minimizer::run`] holds all per-run state on its own stack, so one
/// problem can be run several times with independent oracles and rngs.
#[derive(Debug, Clone)]
pub struct Minimizer<I> {
    seed: I,
    fuzzed: I,
    target: CrashSignature,
    config: MinimizerConfig,
}

impl<I> Minimizer<I>
where
    I: Input + From<Vec<u8>>,
{
    pub fn new(
        seed: I,
        fuzzed: I,
        target: CrashSignature,
        config: MinimizerConfig,
    ) -> Result<Self, MinimizerError> {
        if seed.len() != fuzzed.len() {
            return Err(DistanceError::LengthMismatch {
                left: seed.len(),
                right: fuzzed.len(),
            }
            .into());
        }
        if !(config.confidence > 0.0 && config.confidence < 1.0) {
            return Err(ProbabilityError::InvalidParameter {
                name: "confidence",
                value: config.confidence,
            }
            .into());
        }
        Ok(Self {
            seed,
            fuzzed,
            target,
            config,
        })
    }

    pub fn config(&self) -> &MinimizerConfig {
        &self.config
    }

    /// Whether `report` counts as the target crash for a candidate at
    /// `candidate_distance` from the seed, given the best distance so
    /// far. Signature equality always matches; with the tie-break
    /// enabled, an ambiguous-corruption crash also matches when the
    /// candidate is no farther from the seed than the current best.
    pub fn accepts_report(
        &self,
        report: &CrashReport,
        candidate_distance: u64,
        best_distance: u64,
    ) -> bool {
        if report.signature == self.target {
            return true;
        }
        self.config.ambiguous_tiebreak
            && report.ambiguous_corruption
            && candidate_distance <= best_distance
    }

    /// Runs the minimization loop to one of its stop conditions.
    ///
    /// # Returns
    /// The closest reproducing input found, with run counters and any
    /// foreign-signature crashes met along the way. `NotReproducible`
    /// if the fuzzed input fails the initial check or the result fails
    /// the final one; `Oracle` if the oracle errors on either check.
    pub fn run(
        &self,
        oracle: &mut dyn CrashOracle<I>,
        rng: &mut dyn RngCore,
        clock: &dyn Clock,
        cancel: &CancelToken,
    ) -> Result<MinimizationResult<I>, MinimizerError> {
        let started = clock.now();
        let seed = self.seed.as_bytes();
        let start_distance = self.config.metric.distance(seed, self.fuzzed.as_bytes())?;

        let mut stats = RunStats {
            tries: 0,
            misses: 0,
            oracle_calls: 0,
            accepts: 0,
            dedup_skips: 0,
            elapsed: Duration::ZERO,
            stop: StopReason::Confidence,
        };

        stats.oracle_calls += 1;
        match oracle.examine(&self.fuzzed) {
            Ok(Some(report)) => {
                if !self.accepts_report(&report, start_distance, start_distance) {
                    return Err(MinimizerError::NotReproducible {
                        reason: format!(
                            "starting input crashed as {} rather than {}",
                            report.signature, self.target
                        ),
                    });
                }
            }
            Ok(None) => {
                return Err(MinimizerError::NotReproducible {
                    reason: "target did not crash on the starting input".to_string(),
                });
            }
            Err(source) => {
                return Err(MinimizerError::Oracle {
                    stage: "checking the starting input",
                    source,
                });
            }
        }

        let mut current = self.fuzzed.as_bytes().to_vec();
        let mut min_distance = start_distance;
        let mut target_size_guess = min_distance;
        let mut misses_since_accept = 0u64;
        let mut seen_digests: HashSet<[u8; 16]> = HashSet::new();
        let mut level_digests: HashSet<[u8; 16]> = HashSet::new();
        let mut other_crashes: IndexMap<CrashSignature, I> = IndexMap::new();

        info!(
            start_distance,
            confidence = self.config.confidence,
            signature = %self.target,
            "minimization started"
        );

        let stop = loop {
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if let Some(budget) = self.config.max_time {
                if clock.now().duration_since(started) >= budget {
                    break StopReason::TimeBudget;
                }
            }
            if min_distance <= 1 {
                break StopReason::DistanceFloor;
            }

            let discard_chance = 1.0 / (target_size_guess as f64 + 1.0);
            stats.tries += 1;

            let Some((candidate_bytes, candidate_distance)) =
                self.propose(seed, &current, discard_chance, min_distance, rng)?
            else {
                debug!(min_distance, "no candidate inside the open interval");
                if self.note_miss(&mut stats, &mut misses_since_accept, &mut target_size_guess)? {
                    break StopReason::Confidence;
                }
                continue;
            };
            debug!(
                tries = stats.tries,
                candidate_distance, min_distance, discard_chance, "proposed candidate"
            );

            let candidate = I::from(candidate_bytes);
            let digest = candidate.digest();
            level_digests.insert(digest);
            if !seen_digests.insert(digest) {
                stats.dedup_skips += 1;
                // Only a repeat can witness that the level is spent: the
                // 2^d - 2 strict intermediates have all been proposed.
                if min_distance < 64
                    && level_digests.len() as u64 >= (1u64 << min_distance) - 2
                {
                    break StopReason::Exhausted;
                }
                if self.note_miss(&mut stats, &mut misses_since_accept, &mut target_size_guess)? {
                    break StopReason::Confidence;
                }
                continue;
            }

            stats.oracle_calls += 1;
            match oracle.examine(&candidate) {
                Ok(Some(report))
                    if self.accepts_report(&report, candidate_distance, min_distance) =>
                {
                    current = candidate.as_bytes().to_vec();
                    min_distance = candidate_distance;
                    target_size_guess = target_size_guess.min(candidate_distance);
                    misses_since_accept = 0;
                    level_digests.clear();
                    stats.accepts += 1;
                    info!(min_distance, signature = %report.signature, "accepted closer input");
                }
                Ok(Some(report)) => {
                    if !other_crashes.contains_key(&report.signature) {
                        info!(signature = %report.signature, "crash with a different signature");
                        other_crashes.insert(report.signature.clone(), candidate);
                    }
                    if other_crashes.len() > self.config.max_other_crashes {
                        break StopReason::OtherCrashLimit;
                    }
                    if self.note_miss(&mut stats, &mut misses_since_accept, &mut target_size_guess)?
                    {
                        break StopReason::Confidence;
                    }
                }
                Ok(None) => {
                    if self.note_miss(&mut stats, &mut misses_since_accept, &mut target_size_guess)?
                    {
                        break StopReason::Confidence;
                    }
                }
                Err(error) => {
                    debug!(%error, "oracle failure scored as a miss");
                    if self.note_miss(&mut stats, &mut misses_since_accept, &mut target_size_guess)?
                    {
                        break StopReason::Confidence;
                    }
                }
            }
        };

        // The result must still reproduce, whatever stopped the run.
        let minimized = I::from(current);
        stats.oracle_calls += 1;
        match oracle.examine(&minimized) {
            Ok(Some(report)) if self.accepts_report(&report, min_distance, min_distance) => {}
            Ok(Some(report)) => {
                return Err(MinimizerError::NotReproducible {
                    reason: format!(
                        "result crashed as {} rather than {}",
                        report.signature, self.target
                    ),
                });
            }
            Ok(None) => {
                return Err(MinimizerError::NotReproducible {
                    reason: "result stopped crashing the target".to_string(),
                });
            }
            Err(source) => {
                return Err(MinimizerError::Oracle {
                    stage: "re-checking the result",
                    source,
                });
            }
        }

        stats.stop = stop;
        stats.elapsed = clock.now().duration_since(started);
        info!(
            start_distance,
            min_distance,
            tries = stats.tries,
            accepts = stats.accepts,
            stop = ?stop,
            "minimization finished"
        );

        Ok(MinimizationResult {
            minimized,
            min_distance,
            start_distance,
            other_crashes,
            stats,
        })
    }

    /// Draws candidates until one lands strictly between the seed and
    /// the current best, or the retry cap runs out.
    fn propose(
        &self,
        seed: &[u8],
        current: &[u8],
        discard_chance: f64,
        min_distance: u64,
        rng: &mut dyn RngCore,
    ) -> Result<Option<(Vec<u8>, u64)>, DistanceError> {
        for _ in 0..PROPOSAL_RETRY_CAP {
            let candidate = match self.config.metric {
                DistanceMetric::Bytewise => swap_bytes(seed, current, discard_chance, rng),
                DistanceMetric::Bitwise => swap_bits(seed, current, discard_chance, rng),
            };
            let distance = self.config.metric.distance(seed, &candidate)?;
            if distance > 0 && distance < min_distance {
                return Ok(Some((candidate, distance)));
            }
        }
        Ok(None)
    }

    /// Books one miss. When the consecutive-miss budget for the current
    /// guess is spent, halves the guess and keeps going; at a guess of
    /// one the budget instead ends the run, which `true` signals.
    fn note_miss(
        &self,
        stats: &mut RunStats,
        misses_since_accept: &mut u64,
        target_size_guess: &mut u64,
    ) -> Result<bool, MinimizerError> {
        stats.misses += 1;
        *misses_since_accept += 1;
        let p_hit = 1.0 / (*target_size_guess as f64 + 1.0);
        let budget = misses_until_quit(self.config.confidence, p_hit)?;
        if *misses_since_accept < budget {
            return Ok(false);
        }
        if *target_size_guess <= 1 {
            return Ok(true);
        }
        *target_size_guess = (*target_size_guess / 2).max(1);
        *misses_since_accept = 0;
        debug!(
            target_size_guess = *target_size_guess,
            "miss budget spent, shrinking the guess"
        );
        Ok(false)
    }
}

/// Minimizes with the system clock, a fresh cancel token, and default
/// settings apart from `confidence` and `max_time`.
pub fn minimize<I>(
    seed: I,
    fuzzed: I,
    oracle: &mut dyn CrashOracle<I>,
    target: CrashSignature,
    confidence: f64,
    max_time: Option<Duration>,
    rng: &mut dyn RngCore,
) -> Result<MinimizationResult<I>, MinimizerError>
where
    I: Input + From<Vec<u8>>,
{
    let config = MinimizerConfig {
        confidence,
        max_time,
        ..MinimizerConfig::default()
    };
    let minimizer = Minimizer::new(seed, fuzzed, target, config)?;
    minimizer.run(oracle, rng, &SystemClock, &CancelToken::default())
}

/// Reverts each differing byte toward the seed with `discard_chance`.
fn swap_bytes(seed: &[u8], current: &[u8], discard_chance: f64, rng: &mut dyn RngCore) -> Vec<u8> {
    seed.iter()
        .zip(current.iter())
        .map(|(&s, &c)| {
            if s != c && rng.random::<f64>() >= discard_chance {
                c
            } else {
                s
            }
        })
        .collect()
}

/// Reverts each differing bit toward the seed with `discard_chance`.
fn swap_bits(seed: &[u8], current: &[u8], discard_chance: f64, rng: &mut dyn RngCore) -> Vec<u8> {
    seed.iter()
        .zip(current.iter())
        .map(|(&s, &c)| {
            if s == c {
                return s;
            }
            let mut take = 0u8;
            for bit in 0..8 {
                let mask = 1u8 << bit;
                if (s ^ c) & mask != 0 && rng.random::<f64>() < discard_chance {
                    take |= mask;
                }
            }
            (s & take) | (c & !take)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    use crate::clock::ManualClock;
    use crate::hamming::{bitwise_hamming, bytewise_hamming};

    const TARGET: &str = "sig:11";

    fn hit(input: &Vec<u8>) -> Result<Option<CrashReport>, OracleError> {
        Ok(Some(CrashReport::new(
            CrashSignature::new(TARGET),
            "scripted crash",
            input.as_bytes(),
        )))
    }

    fn quiet() -> Result<Option<CrashReport>, OracleError> {
        Ok(None)
    }

    fn build(seed: &[u8], fuzzed: &[u8], config: MinimizerConfig) -> Minimizer<Vec<u8>> {
        Minimizer::new(
            seed.to_vec(),
            fuzzed.to_vec(),
            CrashSignature::new(TARGET),
            config,
        )
        .unwrap()
    }

    #[test]
    fn threshold_oracle_crosses_the_gap() {
        let seed = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ".to_vec();
        let fuzzed = b"abcdefghijklmnopqrstuvwxyz".to_vec();
        let mut oracle = {
            let seed = seed.clone();
            let fuzzed = fuzzed.clone();
            move |input: &Vec<u8>| -> Result<Option<CrashReport>, OracleError> {
                // The fuzzed input itself crashes; beyond that, only
                // inputs within 20 positions of the seed do.
                if input == &fuzzed || bytewise_hamming(&seed, input).unwrap() <= 20 {
                    hit(input)
                } else {
                    quiet()
                }
            }
        };
        let minimizer = build(&seed, &fuzzed, MinimizerConfig::default());
        let mut rng = ChaCha8Rng::from_seed([11u8; 32]);
        let result = minimizer
            .run(
                &mut oracle,
                &mut rng,
                &SystemClock,
                &CancelToken::default(),
            )
            .unwrap();

        assert_eq!(result.start_distance, 26);
        assert!(
            result.min_distance <= 20,
            "the guess anneals until a shot crosses the non-crashing band, got {}",
            result.min_distance
        );
        assert!(result.stats.accepts >= 1);
        assert_eq!(result.stats.stop, StopReason::DistanceFloor);
        assert_eq!(
            bytewise_hamming(&seed, &result.minimized),
            Ok(result.min_distance)
        );
    }

    #[test]
    fn always_crash_oracle_minimizes_to_the_floor() {
        let seed = b"00000000".to_vec();
        let fuzzed = b"11111111".to_vec();
        let mut examined: Vec<u64> = Vec::new();
        let mut oracle = |input: &Vec<u8>| -> Result<Option<CrashReport>, OracleError> {
            examined.push(bytewise_hamming(&seed, input).unwrap());
            hit(input)
        };
        let minimizer = build(&seed, &fuzzed, MinimizerConfig::default());
        let mut rng = ChaCha8Rng::from_seed([2u8; 32]);
        let result = minimizer
            .run(
                &mut oracle,
                &mut rng,
                &SystemClock,
                &CancelToken::default(),
            )
            .unwrap();
        drop(oracle);

        assert_eq!(result.stats.stop, StopReason::DistanceFloor);
        assert_eq!(result.min_distance, 1);
        assert_eq!(bytewise_hamming(&seed, &result.minimized), Ok(1));
        // Every proposal improves, so every loop call is an accept.
        assert_eq!(result.stats.tries, result.stats.accepts);
        assert_eq!(result.stats.oracle_calls, result.stats.accepts + 2);
        assert_eq!(examined[0], 8, "initial check sees the fuzzed input");
        assert_eq!(*examined.last().unwrap(), 1, "final check sees the result");
        let accepted = &examined[1..examined.len() - 1];
        assert!(
            accepted.windows(2).all(|pair| pair[1] < pair[0]),
            "accepted distances must strictly decrease: {accepted:?}"
        );
    }

    #[test]
    fn unshrinkable_input_returns_unchanged() {
        let seed = b"00000000".to_vec();
        let fuzzed = b"11111111".to_vec();
        let mut oracle = {
            let fuzzed = fuzzed.clone();
            move |input: &Vec<u8>| -> Result<Option<CrashReport>, OracleError> {
                if input == &fuzzed { hit(input) } else { quiet() }
            }
        };
        let minimizer = build(
            &seed,
            &fuzzed,
            MinimizerConfig {
                confidence: 0.9,
                ..MinimizerConfig::default()
            },
        );
        let mut rng = ChaCha8Rng::from_seed([3u8; 32]);
        let result = minimizer
            .run(
                &mut oracle,
                &mut rng,
                &SystemClock,
                &CancelToken::default(),
            )
            .unwrap();

        assert_eq!(result.stats.stop, StopReason::Confidence);
        assert_eq!(result.minimized, fuzzed);
        assert_eq!(result.min_distance, 8);
        assert_eq!(result.stats.accepts, 0);
        // Guess schedule 8 -> 4 -> 2 -> 1 at 0.9 spends budgets of
        // 20, 11, 6 and 4 consecutive misses.
        assert_eq!(result.stats.misses, 41);
        assert_eq!(result.stats.tries, 41);
    }

    #[test]
    fn already_minimal_input_stops_at_the_floor() {
        let mut calls = 0u64;
        let mut oracle = |input: &Vec<u8>| -> Result<Option<CrashReport>, OracleError> {
            calls += 1;
            hit(input)
        };
        let minimizer = build(b"aa", b"ab", MinimizerConfig::default());
        let mut rng = ChaCha8Rng::from_seed([4u8; 32]);
        let result = minimizer
            .run(
                &mut oracle,
                &mut rng,
                &SystemClock,
                &CancelToken::default(),
            )
            .unwrap();

        assert_eq!(result.stats.stop, StopReason::DistanceFloor);
        assert_eq!(result.min_distance, 1);
        assert_eq!(result.minimized, b"ab".to_vec());
        assert_eq!(result.stats.tries, 0);
        assert_eq!(calls, 2, "initial and final checks only");
    }

    #[test]
    fn initial_non_crash_fails_fast() {
        let mut calls = 0u64;
        let mut oracle = |_input: &Vec<u8>| -> Result<Option<CrashReport>, OracleError> {
            calls += 1;
            quiet()
        };
        let minimizer = build(b"00000000", b"11111111", MinimizerConfig::default());
        let mut rng = ChaCha8Rng::from_seed([5u8; 32]);
        let result = minimizer.run(
            &mut oracle,
            &mut rng,
            &SystemClock,
            &CancelToken::default(),
        );

        assert!(matches!(result, Err(MinimizerError::NotReproducible { .. })));
        assert_eq!(calls, 1);
    }

    #[test]
    fn initial_oracle_error_is_fatal() {
        let mut oracle = |_input: &Vec<u8>| -> Result<Option<CrashReport>, OracleError> {
            Err(OracleError::Io(std::io::Error::other("no debugger")))
        };
        let minimizer = build(b"aa", b"ab", MinimizerConfig::default());
        let mut rng = ChaCha8Rng::from_seed([6u8; 32]);
        let error = minimizer
            .run(
                &mut oracle,
                &mut rng,
                &SystemClock,
                &CancelToken::default(),
            )
            .unwrap_err();

        match error {
            MinimizerError::Oracle { stage, .. } => {
                assert!(stage.contains("starting input"), "got: {stage}");
            }
            other => panic!("expected an oracle failure, got {other:?}"),
        }
    }

    #[test]
    fn initial_wrong_signature_fails_fast() {
        let mut oracle = |input: &Vec<u8>| -> Result<Option<CrashReport>, OracleError> {
            Ok(Some(CrashReport::new(
                CrashSignature::new("sig:4"),
                "different bug",
                input.as_bytes(),
            )))
        };
        let minimizer = build(b"aa", b"ab", MinimizerConfig::default());
        let mut rng = ChaCha8Rng::from_seed([7u8; 32]);
        let error = minimizer
            .run(
                &mut oracle,
                &mut rng,
                &SystemClock,
                &CancelToken::default(),
            )
            .unwrap_err();

        match error {
            MinimizerError::NotReproducible { reason } => {
                assert!(reason.contains("sig:4"), "got: {reason}");
            }
            other => panic!("expected NotReproducible, got {other:?}"),
        }
    }

    #[test]
    fn result_that_stops_reproducing_is_an_error() {
        let mut calls = 0u64;
        let mut oracle = |input: &Vec<u8>| -> Result<Option<CrashReport>, OracleError> {
            calls += 1;
            if calls == 1 { hit(input) } else { quiet() }
        };
        let minimizer = build(b"aa", b"ab", MinimizerConfig::default());
        let mut rng = ChaCha8Rng::from_seed([8u8; 32]);
        let result = minimizer.run(
            &mut oracle,
            &mut rng,
            &SystemClock,
            &CancelToken::default(),
        );

        assert!(matches!(result, Err(MinimizerError::NotReproducible { .. })));
        assert_eq!(calls, 2, "the final check must re-run the oracle");
    }

    #[test]
    fn manual_clock_enforces_the_budget() {
        let seed = b"00000000".to_vec();
        let fuzzed = b"11111111".to_vec();
        let clock = ManualClock::new();
        let mut oracle = {
            let fuzzed = fuzzed.clone();
            let clock = &clock;
            move |input: &Vec<u8>| -> Result<Option<CrashReport>, OracleError> {
                // Each target run burns ten minutes of wall clock.
                clock.advance(Duration::from_secs(600));
                if input == &fuzzed { hit(input) } else { quiet() }
            }
        };
        let minimizer = build(
            &seed,
            &fuzzed,
            MinimizerConfig {
                max_time: Some(Duration::from_secs(1800)),
                ..MinimizerConfig::default()
            },
        );
        let mut rng = ChaCha8Rng::from_seed([9u8; 32]);
        let result = minimizer
            .run(&mut oracle, &mut rng, &clock, &CancelToken::default())
            .unwrap();

        assert_eq!(result.stats.stop, StopReason::TimeBudget);
        assert_eq!(result.minimized, fuzzed);
        assert_eq!(
            result.stats.oracle_calls, 4,
            "initial check, two timed misses, final check"
        );
        assert_eq!(result.stats.elapsed, Duration::from_secs(2400));
    }

    #[test]
    fn pre_cancelled_token_returns_verified_input() {
        let seed = b"00000000".to_vec();
        let fuzzed = b"11111111".to_vec();
        let mut oracle = |input: &Vec<u8>| -> Result<Option<CrashReport>, OracleError> {
            hit(input)
        };
        let minimizer = build(&seed, &fuzzed, MinimizerConfig::default());
        let cancel = CancelToken::default();
        cancel.cancel();
        let mut rng = ChaCha8Rng::from_seed([10u8; 32]);
        let result = minimizer
            .run(&mut oracle, &mut rng, &SystemClock, &cancel)
            .unwrap();

        assert_eq!(result.stats.stop, StopReason::Cancelled);
        assert_eq!(result.stats.tries, 0);
        assert_eq!(result.stats.oracle_calls, 2);
        assert_eq!(result.minimized, fuzzed);
        assert_eq!(result.min_distance, result.start_distance);
    }

    #[test]
    fn tie_break_rule_is_explicit() {
        let minimizer = build(b"00000000", b"11111111", MinimizerConfig::default());
        let same = CrashReport::new(CrashSignature::new(TARGET), "t", b"x");
        let other = CrashReport::new(CrashSignature::new("sig:6"), "t", b"x");
        let fuzzy = other.clone().with_ambiguous_corruption();

        assert!(minimizer.accepts_report(&same, 12, 10));
        assert!(!minimizer.accepts_report(&other, 5, 10));
        assert!(minimizer.accepts_report(&fuzzy, 9, 10));
        assert!(minimizer.accepts_report(&fuzzy, 10, 10));
        assert!(
            !minimizer.accepts_report(&fuzzy, 11, 10),
            "ambiguous corruption never excuses moving away from the seed"
        );

        let strict = build(
            b"00000000",
            b"11111111",
            MinimizerConfig {
                ambiguous_tiebreak: false,
                ..MinimizerConfig::default()
            },
        );
        assert!(!strict.accepts_report(&fuzzy, 9, 10));
        assert!(strict.accepts_report(&same, 9, 10));
    }

    #[test]
    fn ambiguous_crashes_accepted_when_tiebreak_on() {
        let seed = b"00000000".to_vec();
        let fuzzed = b"11111111".to_vec();
        let mut oracle = {
            let fuzzed = fuzzed.clone();
            move |input: &Vec<u8>| -> Result<Option<CrashReport>, OracleError> {
                if input == &fuzzed {
                    hit(input)
                } else {
                    Ok(Some(
                        CrashReport::new(
                            CrashSignature::new("sig:heisen"),
                            "stack smash",
                            input.as_bytes(),
                        )
                        .with_ambiguous_corruption(),
                    ))
                }
            }
        };
        let minimizer = build(&seed, &fuzzed, MinimizerConfig::default());
        let mut rng = ChaCha8Rng::from_seed([12u8; 32]);
        let result = minimizer
            .run(
                &mut oracle,
                &mut rng,
                &SystemClock,
                &CancelToken::default(),
            )
            .unwrap();

        assert_eq!(result.stats.stop, StopReason::DistanceFloor);
        assert_eq!(result.min_distance, 1);
        assert!(
            result.other_crashes.is_empty(),
            "tie-break accepts are not foreign crashes"
        );
    }

    #[test]
    fn ambiguous_crashes_recorded_when_tiebreak_off() {
        let seed = b"00000000".to_vec();
        let fuzzed = b"11111111".to_vec();
        let mut oracle = {
            let fuzzed = fuzzed.clone();
            move |input: &Vec<u8>| -> Result<Option<CrashReport>, OracleError> {
                if input == &fuzzed {
                    hit(input)
                } else {
                    Ok(Some(
                        CrashReport::new(
                            CrashSignature::new("sig:heisen"),
                            "stack smash",
                            input.as_bytes(),
                        )
                        .with_ambiguous_corruption(),
                    ))
                }
            }
        };
        let minimizer = build(
            &seed,
            &fuzzed,
            MinimizerConfig {
                confidence: 0.9,
                ambiguous_tiebreak: false,
                ..MinimizerConfig::default()
            },
        );
        let mut rng = ChaCha8Rng::from_seed([13u8; 32]);
        let result = minimizer
            .run(
                &mut oracle,
                &mut rng,
                &SystemClock,
                &CancelToken::default(),
            )
            .unwrap();

        assert_eq!(result.stats.stop, StopReason::Confidence);
        assert_eq!(result.minimized, fuzzed);
        assert_eq!(result.stats.accepts, 0);
        assert_eq!(result.other_crashes.len(), 1);
        assert!(
            result
                .other_crashes
                .contains_key(&CrashSignature::new("sig:heisen"))
        );
    }

    #[test]
    fn distinct_other_signatures_stop_the_run() {
        let seed = b"00000000".to_vec();
        let fuzzed = b"11111111".to_vec();
        let mut foreign = 0u64;
        let mut oracle = {
            let fuzzed = fuzzed.clone();
            move |input: &Vec<u8>| -> Result<Option<CrashReport>, OracleError> {
                if input == &fuzzed {
                    hit(input)
                } else {
                    foreign += 1;
                    Ok(Some(CrashReport::new(
                        CrashSignature::new(format!("sig:u{foreign}")),
                        "unstable target",
                        input.as_bytes(),
                    )))
                }
            }
        };
        let minimizer = build(
            &seed,
            &fuzzed,
            MinimizerConfig {
                max_other_crashes: 3,
                ..MinimizerConfig::default()
            },
        );
        let mut rng = ChaCha8Rng::from_seed([14u8; 32]);
        let result = minimizer
            .run(
                &mut oracle,
                &mut rng,
                &SystemClock,
                &CancelToken::default(),
            )
            .unwrap();

        assert_eq!(result.stats.stop, StopReason::OtherCrashLimit);
        assert_eq!(result.other_crashes.len(), 4, "the cap breaks on overflow");
        assert_eq!(result.minimized, fuzzed);
        assert_eq!(result.stats.oracle_calls, 6);
        let keys: Vec<&str> = result
            .other_crashes
            .keys()
            .map(|signature| signature.as_str())
            .collect();
        assert_eq!(keys, vec!["sig:u1", "sig:u2", "sig:u3", "sig:u4"]);
    }

    #[test]
    fn tiny_space_exhausts_without_repeat_oracle_calls() {
        let seed = b"AB".to_vec();
        let fuzzed = b"ab".to_vec();
        let mut oracle = {
            let fuzzed = fuzzed.clone();
            move |input: &Vec<u8>| -> Result<Option<CrashReport>, OracleError> {
                if input == &fuzzed { hit(input) } else { quiet() }
            }
        };
        let minimizer = build(&seed, &fuzzed, MinimizerConfig::default());
        let mut rng = ChaCha8Rng::from_seed([15u8; 32]);
        let result = minimizer
            .run(
                &mut oracle,
                &mut rng,
                &SystemClock,
                &CancelToken::default(),
            )
            .unwrap();

        assert_eq!(result.stats.stop, StopReason::Exhausted);
        assert_eq!(result.min_distance, 2);
        assert_eq!(result.minimized, fuzzed);
        // Both strict intermediates get exactly one oracle call each,
        // plus the initial and final checks.
        assert_eq!(result.stats.oracle_calls, 4);
        assert!(result.stats.dedup_skips >= 1);
    }

    #[test]
    fn bitwise_metric_minimizes_bits() {
        let seed = vec![0u8; 4];
        let fuzzed = vec![0xFFu8; 4];
        let mut oracle = |input: &Vec<u8>| -> Result<Option<CrashReport>, OracleError> {
            hit(input)
        };
        let minimizer = build(
            &seed,
            &fuzzed,
            MinimizerConfig {
                metric: DistanceMetric::Bitwise,
                ..MinimizerConfig::default()
            },
        );
        let mut rng = ChaCha8Rng::from_seed([16u8; 32]);
        let result = minimizer
            .run(
                &mut oracle,
                &mut rng,
                &SystemClock,
                &CancelToken::default(),
            )
            .unwrap();

        assert_eq!(result.start_distance, 32);
        assert_eq!(result.stats.stop, StopReason::DistanceFloor);
        assert_eq!(result.min_distance, 1);
        assert_eq!(bitwise_hamming(&seed, &result.minimized), Ok(1));
    }

    #[test]
    fn free_minimize_wrapper_runs() {
        let seed = b"0000".to_vec();
        let fuzzed = b"1111".to_vec();
        let mut oracle = |input: &Vec<u8>| -> Result<Option<CrashReport>, OracleError> {
            hit(input)
        };
        let mut rng = ChaCha8Rng::from_seed([17u8; 32]);
        let result = minimize(
            seed,
            fuzzed,
            &mut oracle,
            CrashSignature::new(TARGET),
            0.99,
            None,
            &mut rng,
        )
        .unwrap();

        assert_eq!(result.start_distance, 4);
        assert_eq!(result.min_distance, 1);
        assert_eq!(result.stats.stop, StopReason::DistanceFloor);
    }

    #[test]
    fn mismatched_lengths_rejected_at_construction() {
        let result = Minimizer::<Vec<u8>>::new(
            b"abc".to_vec(),
            b"ab".to_vec(),
            CrashSignature::new(TARGET),
            MinimizerConfig::default(),
        );
        assert!(matches!(
            result,
            Err(MinimizerError::Distance(DistanceError::LengthMismatch {
                left: 3,
                right: 2
            }))
        ));
    }

    #[test]
    fn out_of_range_confidence_rejected_at_construction() {
        for bad in [0.0, 1.0, -0.1, 1.5] {
            let result = Minimizer::<Vec<u8>>::new(
                b"aa".to_vec(),
                b"ab".to_vec(),
                CrashSignature::new(TARGET),
                MinimizerConfig {
                    confidence: bad,
                    ..MinimizerConfig::default()
                },
            );
            assert!(
                matches!(result, Err(MinimizerError::Probability(_))),
                "confidence {bad} must be rejected"
            );
        }
    }
}
