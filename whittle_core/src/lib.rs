pub mod arm;
pub mod bandit;
pub mod clock;
pub mod config;
pub mod hamming;
pub mod input;
pub mod minimizer;
pub mod oracle;
pub mod probability;
pub mod seedpool;

pub use arm::{Arm, ArmError, EstimatorRule};
pub use bandit::{BanditError, MultiArmedBandit, SelectionPolicy};
pub use clock::{CancelToken, Clock, ManualClock, SystemClock};
pub use config::WhittleConfig;
pub use hamming::{DistanceError, DistanceMetric, bitwise_hamming, bytewise_hamming};
pub use input::Input;
pub use minimizer::{
    MinimizationResult, Minimizer, MinimizerConfig, MinimizerError, RunStats, StopReason, minimize,
};
pub use oracle::{
    CommandOracle, CommandOracleConfig, CrashOracle, CrashReport, CrashSignature, InputDelivery,
    OracleError, SignatureSurvey, survey_signatures,
};
pub use probability::{ProbabilityError, TrialModel, misses_until_quit, p_max_hit, weighted_choice};
pub use seedpool::{SeedEntry, SeedPool, SeedPoolError};
