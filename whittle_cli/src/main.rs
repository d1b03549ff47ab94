use whittle_core::clock::{CancelToken, SystemClock};
use whittle_core::config::{ConfigInputDelivery, MinimizerSettings, OracleSettings, WhittleConfig};
use whittle_core::minimizer::Minimizer;
use whittle_core::oracle::{CommandOracle, CrashSignature, survey_signatures};

use clap::Parser;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::path::PathBuf;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

const SURVEY_CONFIDENCE: f64 = 0.95;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file; defaults to whittle.toml when present.
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// The seed file the crashing input was fuzzed from.
    #[clap(long, value_parser)]
    seed_file: PathBuf,
    /// The fuzzed file that crashes the target.
    #[clap(long, value_parser)]
    crash_file: PathBuf,
    /// Directory for the minimized input, incidental crashes and report.
    #[clap(short, long, value_parser, default_value = "whittle-out")]
    output_dir: PathBuf,
    /// Target command with arguments; overrides the config file.
    #[clap(long)]
    target_command: Option<String>,
    /// Minimize toward this signature instead of surveying for one.
    #[clap(long)]
    signature: Option<String>,
    /// Overrides the configured stopping confidence.
    #[clap(long)]
    confidence: Option<f64>,
    /// Overrides the configured wall-clock budget. Zero disables it.
    #[clap(long)]
    max_time_ms: Option<u64>,
    /// Seeds the random source for a reproducible run.
    #[clap(long)]
    rng_seed: Option<u64>,
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("WHITTLE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = match &cli.config_file {
        Some(config_path) => {
            println!("Loading configuration from specified path: {config_path:?}");
            WhittleConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("whittle.toml");
            if default_config_path.exists() {
                println!(
                    "No config file specified via CLI, loading default: {default_config_path:?}",
                );
                WhittleConfig::load_from_file(&default_config_path)?
            } else {
                WhittleConfig {
                    oracle: OracleSettings {
                        command: Vec::new(),
                        input_delivery: ConfigInputDelivery::default(),
                        timeout_ms: 2000,
                        retries: 3,
                        crash_exit_codes: Vec::new(),
                        working_dir: None,
                    },
                    minimizer: MinimizerSettings::default(),
                }
            }
        }
    };

    if let Some(target_cmd_str) = &cli.target_command {
        config.oracle.command = target_cmd_str
            .split_whitespace()
            .map(str::to_owned)
            .collect();
    }
    if let Some(confidence) = cli.confidence {
        config.minimizer.confidence = confidence;
    }
    if let Some(max_time_ms) = cli.max_time_ms {
        config.minimizer.max_time_ms = max_time_ms;
    }
    if let Some(rng_seed) = cli.rng_seed {
        config.minimizer.rng_seed = Some(rng_seed);
    }
    if config.oracle.command.is_empty() {
        anyhow::bail!(
            "no target command; set oracle.command in the config file or pass --target-command"
        );
    }

    println!("Effective configuration: {config:#?}");

    let seed = std::fs::read(&cli.seed_file)
        .map_err(|e| anyhow::anyhow!("Failed to read seed file {:?}: {}", cli.seed_file, e))?;
    let fuzzed = std::fs::read(&cli.crash_file)
        .map_err(|e| anyhow::anyhow!("Failed to read crash file {:?}: {}", cli.crash_file, e))?;
    if seed.len() != fuzzed.len() {
        anyhow::bail!(
            "seed file ({} bytes) and crash file ({} bytes) must be the same length",
            seed.len(),
            fuzzed.len()
        );
    }

    let mut oracle = CommandOracle::new(config.oracle.to_oracle_config())?;

    let cancel = CancelToken::default();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        println!("\nCtrl-C received, stopping after the current check...");
        handler_token.cancel();
    })?;

    let rng_seed = config.minimizer.rng_seed.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or(0)
    });
    println!("Random seed for this run: {rng_seed}");
    let mut rng = ChaCha8Rng::seed_from_u64(rng_seed);

    let target = match &cli.signature {
        Some(signature) => CrashSignature::new(signature.clone()),
        None => {
            println!("Surveying crash signatures of {:?}...", cli.crash_file);
            let survey = survey_signatures(&mut oracle, &fuzzed, SURVEY_CONFIDENCE, &cancel)?;
            for (signature, count) in survey.counts() {
                println!("  {signature}: {count}/{} runs", survey.runs());
            }
            let Some((modal, hits)) = survey.modal() else {
                anyhow::bail!(
                    "the crash file never crashed the target in {} runs",
                    survey.runs()
                );
            };
            println!(
                "Minimizing toward {modal} ({hits} hits, reproduction rate {:.0}%)",
                survey.reproduction_rate() * 100.0
            );
            modal.clone()
        }
    };

    let minimizer = Minimizer::new(
        seed,
        fuzzed,
        target.clone(),
        config.minimizer.to_minimizer_config(),
    )?;
    println!("Minimizing {:?} toward {:?}...", cli.crash_file, cli.seed_file);
    let started = Instant::now();
    let result = minimizer.run(&mut oracle, &mut rng, &SystemClock, &cancel)?;

    std::fs::create_dir_all(&cli.output_dir)?;
    let minimized_path = cli.output_dir.join("minimized.bin");
    std::fs::write(&minimized_path, &result.minimized)?;

    let mut other_files: Vec<(String, PathBuf)> = Vec::new();
    for (signature, input) in &result.other_crashes {
        let path = cli
            .output_dir
            .join(format!("crash-{}.bin", slug(signature.as_str())));
        std::fs::write(&path, input)?;
        other_files.push((signature.as_str().to_owned(), path));
    }

    let report_other: Vec<serde_json::Value> = other_files
        .iter()
        .map(|(signature, path)| serde_json::json!({ "signature": signature, "file": path }))
        .collect();
    let report = serde_json::json!({
        "target_signature": target.as_str(),
        "seed_file": &cli.seed_file,
        "crash_file": &cli.crash_file,
        "minimized_file": &minimized_path,
        "minimized_md5": format!("{:x}", md5::compute(&result.minimized)),
        "start_distance": result.start_distance,
        "min_distance": result.min_distance,
        "stop": format!("{:?}", result.stats.stop),
        "tries": result.stats.tries,
        "misses": result.stats.misses,
        "accepts": result.stats.accepts,
        "oracle_calls": result.stats.oracle_calls,
        "dedup_skips": result.stats.dedup_skips,
        "elapsed_ms": result.stats.elapsed.as_millis() as u64,
        "rng_seed": rng_seed,
        "other_crashes": report_other,
    });
    let report_path = cli.output_dir.join("report.json");
    std::fs::write(&report_path, serde_json::to_string_pretty(&report)?)?;

    println!(
        "Minimization finished in {:.2?} ({:?}).",
        started.elapsed(),
        result.stats.stop
    );
    println!(
        "Distance to seed: {} -> {} after {} tries, {} accepts, {} oracle calls.",
        result.start_distance,
        result.min_distance,
        result.stats.tries,
        result.stats.accepts,
        result.stats.oracle_calls
    );
    println!("Minimized input written to {minimized_path:?}.");
    if !other_files.is_empty() {
        println!(
            "Recorded {} other crash signature(s) in {:?}.",
            other_files.len(),
            cli.output_dir
        );
    }
    println!("Run report written to {report_path:?}.");

    Ok(())
}

/// Keeps signature-derived file names to portable characters.
fn slug(signature: &str) -> String {
    signature
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}
