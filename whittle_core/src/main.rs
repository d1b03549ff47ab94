use std::time::Instant;

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;

use whittle_core::bandit::{MultiArmedBandit, SelectionPolicy};
use whittle_core::clock::{CancelToken, SystemClock};
use whittle_core::hamming::bytewise_hamming;
use whittle_core::minimizer::{Minimizer, MinimizerConfig};
use whittle_core::oracle::{CrashReport, CrashSignature, OracleError};

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("WHITTLE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    minimization_demo()?;
    bandit_demo()?;
    Ok(())
}

fn minimization_demo() -> Result<(), anyhow::Error> {
    println!("Minimizing a crashing mutation back toward its seed...");
    let seed = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ".to_vec();
    let fuzzed = b"abcdefghijklmnopqrstuvwxyz".to_vec();

    // Stand-in for a real target: crashes while at most 20 of the
    // fuzzed positions remain, and on the starting input itself.
    let mut oracle = {
        let seed = seed.clone();
        let fuzzed = fuzzed.clone();
        move |input: &Vec<u8>| -> Result<Option<CrashReport>, OracleError> {
            let crashes = input == &fuzzed || bytewise_hamming(&seed, input).unwrap() <= 20;
            Ok(crashes
                .then(|| CrashReport::new(CrashSignature::new("sig:11"), "demo crash", input)))
        }
    };

    let minimizer = Minimizer::new(
        seed,
        fuzzed,
        CrashSignature::new("sig:11"),
        MinimizerConfig::default(),
    )?;
    let mut rng = ChaCha8Rng::from_seed([1u8; 32]);
    let started = Instant::now();
    let result = minimizer.run(
        &mut oracle,
        &mut rng,
        &SystemClock,
        &CancelToken::default(),
    )?;

    println!(
        "  distance {} -> {} after {} tries ({} accepts, {:?}, {:.2?})",
        result.start_distance,
        result.min_distance,
        result.stats.tries,
        result.stats.accepts,
        result.stats.stop,
        started.elapsed()
    );
    println!(
        "  minimized bytes: {}",
        String::from_utf8_lossy(&result.minimized)
    );
    Ok(())
}

fn bandit_demo() -> Result<(), anyhow::Error> {
    println!("Scoring three seeds by how often fuzzing them pays off...");
    let mut engine: MultiArmedBandit<&str, &str> =
        MultiArmedBandit::new(SelectionPolicy::Bayesian)?;
    engine.add_item("calm.png", "rarely crashes")?;
    engine.add_item("edgy.png", "sometimes crashes")?;
    engine.add_item("wild.png", "often crashes")?;

    let mut rng = ChaCha8Rng::from_seed([2u8; 32]);
    let rates = [("calm.png", 0.02), ("edgy.png", 0.10), ("wild.png", 0.30)];
    for _ in 0..400 {
        for (key, rate) in rates {
            if rng.random::<f64>() < rate {
                engine.record_success(&key, 1)?;
            }
            engine.record_tries(&key, 1)?;
        }
    }

    for (key, share) in engine.scaled_scores() {
        println!("  {key}: {:.1}% of the draw mass", share * 100.0);
    }
    let mut draws: Vec<&str> = Vec::new();
    for _ in 0..8 {
        if let Some(payload) = engine.next(&mut rng)? {
            draws.push(*payload);
        }
    }
    println!("  next eight selections: {draws:?}");
    Ok(())
}
