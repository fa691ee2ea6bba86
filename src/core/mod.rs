mod aggregate;
mod engine;
mod error;
mod params;
mod paths;
mod rng;
mod types;

pub use aggregate::{
    MEAN_OUTSTANDING, PERCENTILES, PathOutcome, aggregate, calculate, calculate_paths,
    percentile_position, simulate_paths,
};
pub use engine::{LoanTerms, PathState, QuarterInputs, advance, simulate, simulate_with_terms};
pub use error::{EngineError, EngineResult};
pub use params::{RawParameters, resolve};
pub use paths::{GeneratedPaths, PRICE_FLOOR, generate, replay_path, synthetic_path};
pub use rng::{PathRng, derive_path_seed};
pub use types::{
    Adjustment, AggregateResult, CashRate, ChartSeries, GbmParams, HedgingParams,
    HistogramBin, HistoricalSeries, MainOutputsTable, OutputRow, PathSource, PercentileOutcome,
    PricePath, QuarterRecord, RepaymentMode, SimulationParameters,
};
