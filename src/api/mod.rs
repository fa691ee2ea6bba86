use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{info, warn};

use crate::core::{
    AggregateResult, CashRate, EngineError, EngineResult, HedgingParams, HistoricalSeries,
    RawParameters, SimulationParameters, calculate, resolve,
};

pub const DEFAULT_TIMEOUT_SECS: f64 = 120.0;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Summary,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("could not read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not serialise result: {0}")]
    Output(#[from] serde_json::Error),

    #[error("{0}")]
    Usage(String),
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "equity_release",
    about = "Monte Carlo model of an equity-release mortgage funding a lifetime annuity"
)]
pub struct Cli {
    #[arg(
        long,
        help = "JSON file of loan parameters (camelCase keys); flags override its values"
    )]
    params: Option<PathBuf>,
    #[arg(
        long,
        help = "JSON file of monthly index levels and rates; switches to historical replay"
    )]
    history: Option<PathBuf>,
    #[arg(long, help = "Replay start year, overriding the history file")]
    start_year: Option<i32>,

    #[arg(long)]
    house_value: Option<f64>,
    #[arg(long, help = "Loan term in years")]
    loan_duration: Option<u32>,
    #[arg(long, help = "Annuity term in years")]
    annuity_duration: Option<u32>,
    #[arg(long, help = "Loan-to-value in percent, e.g. 80")]
    loan_to_value: Option<f64>,
    #[arg(long)]
    annual_income: Option<f64>,

    #[arg(long, help = "Expected annual index return in percent")]
    equity_return: Option<f64>,
    #[arg(long, help = "Annual index volatility in percent")]
    volatility: Option<f64>,
    #[arg(long)]
    initial_index_level: Option<f64>,
    #[arg(long, help = "Simulation steps per year; a multiple of 4")]
    steps_per_year: Option<u32>,
    #[arg(long, help = "Flat annual cash rate in percent")]
    cash_rate: Option<f64>,
    #[arg(long, help = "Wholesale lending margin in percent")]
    wholesale_lending_margin: Option<f64>,
    #[arg(long, help = "Additional loan margins in percent")]
    additional_loan_margins: Option<f64>,

    #[arg(
        long,
        help = "Enter an interest holiday below this percent of the initial reinvestment"
    )]
    holiday_enter: Option<f64>,
    #[arg(
        long,
        help = "Leave an interest holiday above this percent of the initial reinvestment"
    )]
    holiday_exit: Option<f64>,
    #[arg(
        long,
        help = "Catch-up payments start above this percent of the holiday exit level"
    )]
    superpay_start: Option<f64>,
    #[arg(
        long,
        help = "Largest catch-up payment as a percent of the quarter's interest"
    )]
    max_superpay: Option<f64>,
    #[arg(long, help = "Holiday quarters before a path counts as subperforming")]
    subperform_quarters: Option<u32>,

    #[arg(long, help = "Annual insurance premium in percent of the loan")]
    insurance_cost: Option<f64>,
    #[arg(long, help = "Insurer profit margin in percent")]
    insurer_profit_margin: Option<f64>,
    #[arg(long, help = "Share of initial units covered by pooling, in percent")]
    insured_fraction: Option<f64>,
    #[arg(long, help = "Reinvested share of the loan in percent; derived when omitted")]
    reinvest_fraction: Option<f64>,

    #[arg(long, help = "Hedging: largest yearly index loss in percent")]
    hedge_max_loss: Option<f64>,
    #[arg(long, help = "Hedging: five-yearly gain cap in percent")]
    hedge_cap: Option<f64>,
    #[arg(long, help = "Hedging: annual cost in percent of holdings")]
    hedge_cost: Option<f64>,
    #[arg(long, help = "Draw interest from a shared pool once holdings fall to the insured units")]
    pooling: bool,
    #[arg(long, help = "Apply annuity income to principal instead of adding it to the loan")]
    principal_repayment: bool,

    #[arg(long)]
    total_paths: Option<u32>,
    #[arg(long, help = "Random seed; generated from the clock when omitted")]
    seed: Option<u64>,
    #[arg(long, help = "Include the full quarterly series of the percentile paths")]
    percentile_paths: bool,

    #[arg(long, value_enum, default_value_t = OutputFormat::Summary)]
    output: OutputFormat,
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout_secs: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CalculationResponse<'a> {
    parameters: &'a SimulationParameters,
    result: &'a AggregateResult,
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ApiError> {
    let text = fs::read_to_string(path).map_err(|source| ApiError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ApiError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn percent(value: Option<f64>) -> Option<f64> {
    value.map(|p| p / 100.0)
}

fn hedging_from_flags(cli: &Cli) -> Result<Option<HedgingParams>, ApiError> {
    match (cli.hedge_max_loss, cli.hedge_cap, cli.hedge_cost) {
        (None, None, None) => Ok(None),
        (Some(max_loss), Some(cap), Some(cost)) => Ok(Some(HedgingParams {
            max_loss: max_loss / 100.0,
            cap: cap / 100.0,
            cost: cost / 100.0,
        })),
        _ => Err(ApiError::Usage(
            "--hedge-max-loss, --hedge-cap and --hedge-cost must be given together".to_string(),
        )),
    }
}

fn build_raw(cli: &Cli) -> Result<RawParameters, ApiError> {
    let mut raw: RawParameters = match &cli.params {
        Some(path) => read_json(path)?,
        None => RawParameters::default(),
    };

    if let Some(path) = &cli.history {
        raw.historical = Some(read_json::<HistoricalSeries>(path)?);
    }
    if let Some(start_year) = cli.start_year {
        let Some(series) = raw.historical.as_mut() else {
            return Err(ApiError::Usage(
                "--start-year requires historical data (--history or a params file)".to_string(),
            ));
        };
        series.start_year = start_year;
    }

    raw.house_value = cli.house_value.or(raw.house_value);
    raw.loan_duration = cli.loan_duration.or(raw.loan_duration);
    raw.annuity_duration = cli.annuity_duration.or(raw.annuity_duration);
    raw.loan_to_value = percent(cli.loan_to_value).or(raw.loan_to_value);
    raw.annual_income = cli.annual_income.or(raw.annual_income);

    raw.equity_return = percent(cli.equity_return).or(raw.equity_return);
    raw.volatility = percent(cli.volatility).or(raw.volatility);
    raw.initial_index_level = cli.initial_index_level.or(raw.initial_index_level);
    raw.steps_per_year = cli.steps_per_year.or(raw.steps_per_year);
    if let Some(rate) = percent(cli.cash_rate) {
        raw.cash_rate = Some(CashRate::Flat(rate));
    }
    raw.wholesale_lending_margin =
        percent(cli.wholesale_lending_margin).or(raw.wholesale_lending_margin);
    raw.additional_loan_margins =
        percent(cli.additional_loan_margins).or(raw.additional_loan_margins);

    raw.holiday_enter_fraction = percent(cli.holiday_enter).or(raw.holiday_enter_fraction);
    raw.holiday_exit_fraction = percent(cli.holiday_exit).or(raw.holiday_exit_fraction);
    raw.superpay_start_factor = percent(cli.superpay_start).or(raw.superpay_start_factor);
    raw.max_superpay_factor = percent(cli.max_superpay).or(raw.max_superpay_factor);
    raw.subperform_threshold_quarters = cli
        .subperform_quarters
        .or(raw.subperform_threshold_quarters);

    raw.insurance_cost_pa = percent(cli.insurance_cost).or(raw.insurance_cost_pa);
    raw.insurer_profit_margin = percent(cli.insurer_profit_margin).or(raw.insurer_profit_margin);
    raw.insured_fraction = percent(cli.insured_fraction).or(raw.insured_fraction);
    raw.reinvest_fraction = percent(cli.reinvest_fraction).or(raw.reinvest_fraction);

    if let Some(hedging) = hedging_from_flags(cli)? {
        raw.hedging = Some(hedging);
    }
    if cli.pooling {
        raw.pooling = Some(true);
    }
    if cli.principal_repayment {
        raw.principal_repayment = Some(true);
    }

    raw.total_paths = cli.total_paths.or(raw.total_paths);
    raw.random_seed = cli.seed.or(raw.random_seed);
    if cli.percentile_paths {
        raw.include_percentile_paths = Some(true);
    }

    Ok(raw)
}

pub fn build_parameters(cli: &Cli) -> Result<SimulationParameters, ApiError> {
    let raw = build_raw(cli)?;
    Ok(resolve(raw)?)
}

// A timed-out calculation is not cancelled: the blocking task runs to
// completion and its result is dropped.
pub async fn calculate_with_timeout(
    params: SimulationParameters,
    limit: Duration,
) -> EngineResult<AggregateResult> {
    let task = tokio::task::spawn_blocking(move || calculate(&params));
    match tokio::time::timeout(limit, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(EngineError::Worker(join.to_string())),
        Err(_) => {
            warn!(seconds = limit.as_secs_f64(), "calculation timed out");
            Err(EngineError::Timeout {
                seconds: limit.as_secs_f64(),
            })
        }
    }
}

pub async fn run(cli: Cli) -> Result<String, ApiError> {
    let limit = Duration::try_from_secs_f64(cli.timeout_secs)
        .ok()
        .filter(|d| !d.is_zero())
        .ok_or_else(|| ApiError::Usage("--timeout-secs must be > 0".to_string()))?;
    let params = build_parameters(&cli)?;
    info!(
        paths = params.total_paths,
        loan_duration = params.loan_duration,
        seed = params.random_seed,
        "starting calculation"
    );
    let result = calculate_with_timeout(params.clone(), limit).await?;

    match cli.output {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(&CalculationResponse {
            parameters: &params,
            result: &result,
        })?),
        OutputFormat::Summary => Ok(render_summary(&result)),
    }
}

pub fn render_summary(result: &AggregateResult) -> String {
    let mut out = format!(
        "Equity release model: {} paths, seed {}\n\n",
        result.total_paths, result.random_seed
    );
    for row in &result.main_outputs.rows {
        out.push_str(&format!("  {:<36} {:>16.2}\n", row.label, row.value));
    }

    out.push_str("\nPercentiles by terminal index level\n");
    out.push_str(&format!(
        "  {:>4} {:>6} {:>12} {:>16} {:>16} {:>16}\n",
        "pct", "path", "index", "outstanding", "holdings", "surplus"
    ));
    for p in &result.main_outputs.percentiles {
        out.push_str(&format!(
            "  {:>4} {:>6} {:>12.2} {:>16.2} {:>16.2} {:>16.2}\n",
            format!("P{}", p.percentile),
            p.path_id,
            p.index_level,
            p.outstanding,
            p.holdings_value,
            p.surplus
        ));
    }

    if !result.accounts.is_empty() {
        out.push_str("\nMean final account\n");
        for row in &result.accounts {
            out.push_str(&format!("  {:<36} {:>16.2}\n", row.label, row.value));
        }
    }

    if !result.adjustments.is_empty() {
        out.push_str("\nAdjustments\n");
        for adjustment in &result.adjustments {
            out.push_str(&format!("  - {adjustment:?}\n"));
        }
    }
    out
}
