//! Crash detection.
//!
//! The minimizer only ever asks one question about an input: does it
//! still produce the same crash? [`CrashOracle`] is that question as a
//! trait, [`CommandOracle`] answers it by running a target subprocess,
//! and [`survey_signatures`] measures how reliably a given input
//! reproduces before a long run commits to a target signature.

use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use thiserror::Error;
use tracing::warn;

use crate::clock::CancelToken;
use crate::input::Input;
use crate::probability::{ProbabilityError, misses_until_quit};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Errors that can occur while driving a target process.
///
/// These are infrastructure failures, distinct from the target not
/// crashing. Callers treat them as "no useful observation".
#[derive(Error, Debug)]
pub enum OracleError {
    #[error("failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        source: std::io::Error,
    },
    #[error("i/o error while driving the target: {0}")]
    Io(#[from] std::io::Error),
    #[error("oracle has no command configured")]
    EmptyCommand,
}

/// Opaque identity of a crash. Two runs crashed "the same way" exactly
/// when their signatures compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CrashSignature(String);

impl CrashSignature {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_signal(signal: i32) -> Self {
        Self(format!("sig:{signal}"))
    }

    fn from_exit_code(code: i32) -> Self {
        Self(format!("exit:{code}"))
    }
}

impl fmt::Display for CrashSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CrashSignature {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CrashSignature {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// One observed crash.
#[derive(Debug, Clone)]
pub struct CrashReport {
    pub signature: CrashSignature,
    pub description: String,
    /// MD5 of the input that produced the crash, as a hex string.
    pub input_digest: String,
    /// True when the crash identity itself depends on input content,
    /// e.g. a clobbered return address, so signature equality is too
    /// strict a match for "the same bug".
    pub ambiguous_corruption: bool,
}

impl CrashReport {
    pub fn new(
        signature: CrashSignature,
        description: impl Into<String>,
        input_bytes: &[u8],
    ) -> Self {
        Self {
            signature,
            description: description.into(),
            input_digest: format!("{:x}", md5::compute(input_bytes)),
            ambiguous_corruption: false,
        }
    }

    pub fn with_ambiguous_corruption(mut self) -> Self {
        self.ambiguous_corruption = true;
        self
    }
}

/// Decides whether an input crashes the target.
///
/// # Returns
/// `Ok(Some(report))` for a crash, `Ok(None)` for a clean run (including
/// a hang that was killed at the deadline), and `Err` for a transient
/// infrastructure failure that says nothing about the input.
pub trait CrashOracle<I: Input> {
    fn examine(&mut self, input: &I) -> Result<Option<CrashReport>, OracleError>;
}

impl<I, F> CrashOracle<I> for F
where
    I: Input,
    F: FnMut(&I) -> Result<Option<CrashReport>, OracleError>,
{
    fn examine(&mut self, input: &I) -> Result<Option<CrashReport>, OracleError> {
        self(input)
    }
}

/// How a [`CommandOracle`] hands the input to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputDelivery {
    /// Write the input to the child's stdin.
    #[default]
    Stdin,
    /// Write the input to a temp file and substitute its path for every
    /// `{}` in the command arguments.
    TempFile,
}

/// Configuration for running a target command against inputs.
#[derive(Debug, Clone)]
pub struct CommandOracleConfig {
    /// Program and arguments. With [`InputDelivery::TempFile`], `{}` in
    /// any argument is replaced by the input file path.
    pub command: Vec<String>,
    pub input_delivery: InputDelivery,
    /// Kill the target and score the run as a non-crash after this long.
    pub timeout: Duration,
    /// Relaunch attempts after a transient launch failure.
    pub retries: u32,
    /// Exit codes to classify as crashes in addition to signal deaths.
    pub crash_exit_codes: Vec<i32>,
    pub working_dir: Option<PathBuf>,
}

impl Default for CommandOracleConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            input_delivery: InputDelivery::default(),
            timeout: Duration::from_secs(2),
            retries: 0,
            crash_exit_codes: Vec::new(),
            working_dir: None,
        }
    }
}

/// How one target run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ProcessOutcome {
    Exited(i32),
    Signaled(i32),
    TimedOut,
}

/// Oracle that runs an external command per input and classifies signal
/// deaths (and optionally configured exit codes) as crashes.
#[derive(Debug, Clone)]
pub struct CommandOracle {
    config: CommandOracleConfig,
}

impl CommandOracle {
    pub fn new(config: CommandOracleConfig) -> Result<Self, OracleError> {
        if config.command.is_empty() {
            return Err(OracleError::EmptyCommand);
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &CommandOracleConfig {
        &self.config
    }

    fn run_once(&self, input_bytes: &[u8]) -> Result<ProcessOutcome, OracleError> {
        // The temp file must outlive the child.
        let mut input_file = None;
        let mut args: Vec<String> = self.config.command.clone();
        if self.config.input_delivery == InputDelivery::TempFile {
            let mut file = tempfile::NamedTempFile::new()?;
            file.write_all(input_bytes)?;
            file.flush()?;
            let path = file.path().to_string_lossy().into_owned();
            for arg in &mut args {
                *arg = arg.replace("{}", &path);
            }
            input_file = Some(file);
        }

        let mut command = Command::new(&args[0]);
        command
            .args(&args[1..])
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command.stdin(match self.config.input_delivery {
            InputDelivery::Stdin => Stdio::piped(),
            InputDelivery::TempFile => Stdio::null(),
        });
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| OracleError::Launch {
            command: args.join(" "),
            source,
        })?;

        // Fed from its own thread: a target that never drains stdin
        // would otherwise park write_all once the input outgrows the
        // pipe buffer, with the deadline never reached.
        let mut writer = None;
        if let Some(mut stdin) = child.stdin.take() {
            let bytes = input_bytes.to_vec();
            writer = Some(std::thread::spawn(move || stdin.write_all(&bytes)));
        }

        let outcome = self.wait_with_timeout(&mut child)?;
        drop(input_file);
        if let Some(writer) = writer {
            // The child exiting or being killed closes the pipe under a
            // blocked write. A target that exits without reading is its
            // business, not a failure of ours; and a process tree that
            // keeps the read end open must not hold up the verdict, so
            // an unfinished writer is left to die with the pipe.
            if writer.is_finished() {
                if let Err(error) = writer.join().unwrap_or(Ok(())) {
                    if outcome != ProcessOutcome::TimedOut
                        && error.kind() != std::io::ErrorKind::BrokenPipe
                    {
                        return Err(error.into());
                    }
                }
            }
        }
        Ok(outcome)
    }

    fn wait_with_timeout(&self, child: &mut Child) -> Result<ProcessOutcome, OracleError> {
        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    #[cfg(unix)]
                    {
                        use std::os::unix::process::ExitStatusExt;
                        if let Some(signal) = status.signal() {
                            return Ok(ProcessOutcome::Signaled(signal));
                        }
                    }
                    return Ok(ProcessOutcome::Exited(status.code().unwrap_or(-1)));
                }
                Ok(None) => {}
                Err(error) => {
                    // A failed wait leaves the child state unknown; take
                    // it down so the stdin writer cannot stay parked.
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(error.into());
                }
            }
            if started.elapsed() >= self.config.timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(ProcessOutcome::TimedOut);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn classify(&self, outcome: ProcessOutcome, input_bytes: &[u8]) -> Option<CrashReport> {
        match outcome {
            ProcessOutcome::Signaled(signal) => Some(CrashReport::new(
                CrashSignature::from_signal(signal),
                format!("target terminated by signal {signal}"),
                input_bytes,
            )),
            ProcessOutcome::Exited(code) if self.config.crash_exit_codes.contains(&code) => {
                Some(CrashReport::new(
                    CrashSignature::from_exit_code(code),
                    format!("target exited with crash code {code}"),
                    input_bytes,
                ))
            }
            ProcessOutcome::Exited(_) | ProcessOutcome::TimedOut => None,
        }
    }
}

/// Runs `attempt` until it succeeds, allowing up to `retries` further
/// goes with a pause between them. The last error surfaces once the
/// bound is spent.
fn with_retries<T>(
    retries: u32,
    backoff: Duration,
    mut attempt: impl FnMut() -> Result<T, OracleError>,
) -> Result<T, OracleError> {
    let mut failures = 0;
    loop {
        match attempt() {
            Ok(value) => return Ok(value),
            Err(error) if failures < retries => {
                failures += 1;
                warn!(failures, retries, %error, "target run failed, retrying");
                std::thread::sleep(backoff);
            }
            Err(error) => return Err(error),
        }
    }
}

impl<I: Input> CrashOracle<I> for CommandOracle {
    fn examine(&mut self, input: &I) -> Result<Option<CrashReport>, OracleError> {
        let bytes = input.as_bytes();
        let outcome = with_retries(self.config.retries, RETRY_BACKOFF, || self.run_once(bytes))?;
        Ok(self.classify(outcome, bytes))
    }
}

/// Crash behavior of one input over repeated runs.
#[derive(Debug, Clone)]
pub struct SignatureSurvey {
    counts: IndexMap<CrashSignature, u64>,
    runs: u32,
    crashes: u64,
}

impl SignatureSurvey {
    pub fn runs(&self) -> u32 {
        self.runs
    }

    pub fn crashes(&self) -> u64 {
        self.crashes
    }

    /// Fraction of runs that crashed at all.
    pub fn reproduction_rate(&self) -> f64 {
        if self.runs == 0 {
            return 0.0;
        }
        self.crashes as f64 / self.runs as f64
    }

    pub fn counts(&self) -> impl Iterator<Item = (&CrashSignature, u64)> {
        self.counts.iter().map(|(signature, n)| (signature, *n))
    }

    /// The most frequent signature, first-seen winning ties.
    pub fn modal(&self) -> Option<(&CrashSignature, u64)> {
        let mut best: Option<(&CrashSignature, u64)> = None;
        for (signature, n) in self.counts.iter() {
            if best.map(|(_, m)| *n > m).unwrap_or(true) {
                best = Some((signature, *n));
            }
        }
        best
    }
}

/// Hard ceiling on survey runs, whatever the confidence asks for.
const MAX_SURVEY_RUNS: u32 = 1024;

/// Runs `input` through the oracle until no new signature has appeared
/// for long enough to conclude, at `confidence`, that no signature with
/// per-run odds of 1/2 or better remains unseen. Every observation of
/// an already-known signature, clean run, or transient oracle error
/// counts toward that quiet streak; a new signature resets it. `cancel`
/// is checked between runs; a cancelled survey returns the tally so far.
pub fn survey_signatures<I: Input>(
    oracle: &mut dyn CrashOracle<I>,
    input: &I,
    confidence: f64,
    cancel: &CancelToken,
) -> Result<SignatureSurvey, ProbabilityError> {
    let quota = misses_until_quit(confidence, 0.5)?.max(1);
    let mut counts: IndexMap<CrashSignature, u64> = IndexMap::new();
    let mut crashes = 0u64;
    let mut runs = 0u32;
    let mut since_new = 0u64;
    while !cancel.is_cancelled() && since_new < quota && runs < MAX_SURVEY_RUNS {
        runs += 1;
        match oracle.examine(input) {
            Ok(Some(report)) => {
                crashes += 1;
                let count = counts.entry(report.signature).or_insert(0);
                *count += 1;
                if *count == 1 {
                    since_new = 0;
                } else {
                    since_new += 1;
                }
            }
            Ok(None) | Err(_) => since_new += 1,
        }
    }
    Ok(SignatureSurvey {
        counts,
        runs,
        crashes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_oracle(
        script: &str,
        config_tweak: impl FnOnce(&mut CommandOracleConfig),
    ) -> CommandOracle {
        let mut config = CommandOracleConfig {
            command: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            ..CommandOracleConfig::default()
        };
        config_tweak(&mut config);
        CommandOracle::new(config).unwrap()
    }

    #[test]
    fn empty_command_is_rejected() {
        let result = CommandOracle::new(CommandOracleConfig::default());
        assert!(matches!(result, Err(OracleError::EmptyCommand)));
    }

    #[cfg(unix)]
    #[test]
    fn clean_exit_is_not_a_crash() {
        let mut oracle = shell_oracle("exit 0", |_| {});
        let verdict = oracle.examine(&b"anything".to_vec()).unwrap();
        assert!(verdict.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn signal_death_reports_a_signature() {
        let mut oracle = shell_oracle("kill -SEGV $$", |_| {});
        let report = oracle
            .examine(&b"boom".to_vec())
            .unwrap()
            .unwrap_or_else(|| panic!("signal death must be classified as a crash"));
        assert!(report.signature.as_str().starts_with("sig:"));
        assert!(report.description.contains("signal"));
        assert_eq!(report.input_digest, format!("{:x}", md5::compute(b"boom")));
    }

    #[cfg(unix)]
    #[test]
    fn hang_is_killed_and_scored_as_no_crash() {
        let mut oracle = shell_oracle("sleep 5", |config| {
            config.timeout = Duration::from_millis(100);
        });
        let started = Instant::now();
        let verdict = oracle.examine(&b"hang".to_vec()).unwrap();
        assert!(verdict.is_none());
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "hung target must be killed at the deadline"
        );
    }

    // Examined from a watcher thread so a regression shows up as a
    // failure instead of a wedged test run.
    #[cfg(unix)]
    #[test]
    fn stdin_bigger_than_the_pipe_buffer_still_times_out() {
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let mut oracle = shell_oracle("sleep 30", |config| {
                config.timeout = Duration::from_millis(200);
            });
            let verdict = oracle.examine(&vec![0x41u8; 4 << 20]);
            let _ = done_tx.send(verdict);
        });
        let verdict = done_rx
            .recv_timeout(Duration::from_secs(3))
            .expect("a target that never drains stdin must still be killed at the deadline");
        assert!(verdict.unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn configured_exit_code_counts_as_crash() {
        let mut oracle = shell_oracle("exit 42", |config| {
            config.crash_exit_codes = vec![42];
        });
        let report = oracle.examine(&b"x".to_vec()).unwrap().unwrap();
        assert_eq!(report.signature.as_str(), "exit:42");
    }

    #[cfg(unix)]
    #[test]
    fn stdin_delivery_feeds_the_child() {
        let mut oracle = shell_oracle("read line; [ \"$line\" = magic ]", |config| {
            config.crash_exit_codes = vec![1];
        });
        assert!(oracle.examine(&b"magic\n".to_vec()).unwrap().is_none());
        let report = oracle.examine(&b"other\n".to_vec()).unwrap();
        assert!(report.is_some(), "mismatched stdin content must exit 1");
    }

    #[cfg(unix)]
    #[test]
    fn temp_file_delivery_substitutes_the_placeholder() {
        let mut oracle = shell_oracle("grep -q magic {}", |config| {
            config.input_delivery = InputDelivery::TempFile;
            config.crash_exit_codes = vec![1];
        });
        assert!(oracle.examine(&b"magic here".to_vec()).unwrap().is_none());
        let report = oracle.examine(&b"nothing".to_vec()).unwrap().unwrap();
        assert_eq!(report.signature.as_str(), "exit:1");
    }

    #[test]
    fn missing_command_is_a_transient_error() {
        let mut oracle = CommandOracle::new(CommandOracleConfig {
            command: vec!["/nonexistent/definitely-not-a-binary".to_string()],
            ..CommandOracleConfig::default()
        })
        .unwrap();
        let result = CrashOracle::<Vec<u8>>::examine(&mut oracle, &b"x".to_vec());
        assert!(matches!(result, Err(OracleError::Launch { .. })));
    }

    #[test]
    fn missing_command_retries_before_surfacing() {
        let mut oracle = CommandOracle::new(CommandOracleConfig {
            command: vec!["/nonexistent/definitely-not-a-binary".to_string()],
            retries: 2,
            ..CommandOracleConfig::default()
        })
        .unwrap();
        let started = Instant::now();
        let result = CrashOracle::<Vec<u8>>::examine(&mut oracle, &b"x".to_vec());
        assert!(matches!(result, Err(OracleError::Launch { .. })));
        assert!(
            started.elapsed() >= RETRY_BACKOFF * 2,
            "two backoff pauses must pass before the error surfaces"
        );
    }

    #[test]
    fn retries_stop_at_the_configured_bound() {
        let mut attempts = 0u32;
        let result: Result<(), OracleError> = with_retries(2, Duration::ZERO, || {
            attempts += 1;
            Err(OracleError::EmptyCommand)
        });
        assert!(result.is_err());
        assert_eq!(attempts, 3, "one initial try plus two retries");
    }

    #[test]
    fn retry_stops_once_an_attempt_succeeds() {
        let mut attempts = 0u32;
        let result = with_retries(3, Duration::ZERO, || {
            attempts += 1;
            if attempts < 3 {
                Err(OracleError::Io(std::io::Error::other("flaky launch")))
            } else {
                Ok(attempts)
            }
        });
        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts, 3, "no further attempts after a success");
    }

    #[test]
    fn zero_retries_takes_a_single_attempt() {
        let mut attempts = 0u32;
        let result: Result<(), OracleError> = with_retries(0, Duration::ZERO, || {
            attempts += 1;
            Err(OracleError::EmptyCommand)
        });
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[test]
    fn survey_reports_the_modal_signature() {
        let script = [Some("sig:a"), Some("sig:a"), None, Some("sig:b")];
        let mut step = 0usize;
        let mut oracle = |input: &Vec<u8>| -> Result<Option<CrashReport>, OracleError> {
            let verdict = script[step % script.len()]
                .map(|s| CrashReport::new(CrashSignature::new(s), "scripted", input.as_bytes()));
            step += 1;
            Ok(verdict)
        };
        // Quiet quota at 0.95 is 5: sig:b on run 4 resets the streak, so
        // the survey ends after run 9 with five sig:a and two sig:b.
        let survey =
            survey_signatures(&mut oracle, &b"x".to_vec(), 0.95, &CancelToken::default()).unwrap();
        assert_eq!(survey.runs(), 9);
        assert_eq!(survey.crashes(), 7);
        assert!((survey.reproduction_rate() - 7.0 / 9.0).abs() < 1e-12);
        let (modal, count) = survey.modal().unwrap();
        assert_eq!(modal.as_str(), "sig:a");
        assert_eq!(count, 5);
        let tallies: Vec<(&str, u64)> = survey
            .counts()
            .map(|(signature, n)| (signature.as_str(), n))
            .collect();
        assert_eq!(tallies, vec![("sig:a", 5), ("sig:b", 2)]);
    }

    #[test]
    fn survey_counts_errors_as_non_crashes() {
        let mut calls = 0u32;
        let mut oracle = |_input: &Vec<u8>| -> Result<Option<CrashReport>, OracleError> {
            calls += 1;
            Err(OracleError::Io(std::io::Error::other("flaky")))
        };
        let survey =
            survey_signatures(&mut oracle, &b"x".to_vec(), 0.95, &CancelToken::default()).unwrap();
        assert_eq!(calls, 5, "an all-quiet survey stops at the quota");
        assert_eq!(survey.runs(), 5);
        assert_eq!(survey.crashes(), 0);
        assert!(survey.modal().is_none());
        assert_eq!(survey.reproduction_rate(), 0.0);
    }

    #[test]
    fn survey_rejects_bad_confidence() {
        let mut oracle = |_input: &Vec<u8>| -> Result<Option<CrashReport>, OracleError> {
            panic!("oracle must not run when the confidence is invalid")
        };
        let result = survey_signatures(&mut oracle, &b"x".to_vec(), 1.0, &CancelToken::default());
        assert!(result.is_err());
    }

    #[test]
    fn cancelled_token_stops_the_survey() {
        let cancel = CancelToken::default();
        cancel.cancel();
        let mut oracle = |_input: &Vec<u8>| -> Result<Option<CrashReport>, OracleError> {
            panic!("a cancelled survey must not run the oracle")
        };
        let survey = survey_signatures(&mut oracle, &b"x".to_vec(), 0.95, &cancel).unwrap();
        assert_eq!(survey.runs(), 0);
        assert!(survey.modal().is_none());
    }

    #[test]
    fn ambiguous_corruption_is_off_by_default() {
        let report = CrashReport::new(CrashSignature::new("sig:11"), "scripted", b"x");
        assert!(!report.ambiguous_corruption);
        assert!(report.with_ambiguous_corruption().ambiguous_corruption);
    }
}
