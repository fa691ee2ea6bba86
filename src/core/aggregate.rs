use std::collections::BTreeMap;

use rayon::prelude::*;
use tracing::{debug, info};

use super::engine::{LoanTerms, simulate_with_terms};
use super::error::{EngineError, EngineResult};
use super::paths::generate;
use super::types::{
    Adjustment, AggregateResult, ChartSeries, HistogramBin, MainOutputsTable, OutputRow,
    PercentileOutcome, PricePath, QuarterRecord, SimulationParameters,
};

pub const PERCENTILES: [u32; 4] = [2, 25, 50, 75];
const RETURN_BUCKET_EDGES: [f64; 6] = [-0.05, 0.0, 0.025, 0.05, 0.075, 0.10];

#[derive(Debug, Clone)]
pub struct PathOutcome {
    pub path_id: u32,
    pub terms: LoanTerms,
    pub records: Vec<QuarterRecord>,
}

/// Any failing path fails the whole batch.
pub fn calculate(params: &SimulationParameters) -> EngineResult<AggregateResult> {
    let pool = worker_pool(params.total_paths as usize)?;
    pool.install(|| {
        let generated = generate(params);
        let mut result = run_paths(params, &generated.paths)?;
        result.adjustments.extend(generated.adjustments);
        Ok(result)
    })
}

pub fn calculate_paths(
    params: &SimulationParameters,
    paths: &[PricePath],
) -> EngineResult<AggregateResult> {
    let pool = worker_pool(paths.len())?;
    pool.install(|| run_paths(params, paths))
}

pub fn simulate_paths(
    params: &SimulationParameters,
    paths: &[PricePath],
) -> EngineResult<Vec<PathOutcome>> {
    paths
        .par_iter()
        .map(|path| {
            let terms = LoanTerms::new(params, path)?;
            let records = simulate_with_terms(path, params, &terms)?;
            Ok(PathOutcome {
                path_id: path.path_id,
                terms,
                records,
            })
        })
        .collect()
}

fn run_paths(params: &SimulationParameters, paths: &[PricePath]) -> EngineResult<AggregateResult> {
    if paths.is_empty() {
        return Err(EngineError::invalid("paths", "at least one path is required"));
    }
    info!(
        paths = paths.len(),
        seed = params.random_seed,
        quarters = params.quarters(),
        "simulating loan paths"
    );
    let outcomes = simulate_paths(params, paths)?;
    let result = aggregate(params, &outcomes);
    info!(
        paths = result.total_paths,
        mean_outstanding = result.main_outputs.value(MEAN_OUTSTANDING),
        "calculation complete"
    );
    Ok(result)
}

fn worker_pool(path_count: usize) -> EngineResult<rayon::ThreadPool> {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let threads = cores.min(path_count).max(1);
    debug!(threads, "building worker pool");
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| EngineError::WorkerPool(e.to_string()))
}

pub const MEAN_OUTSTANDING: &str = "Mean outstanding loan";

pub fn aggregate(params: &SimulationParameters, outcomes: &[PathOutcome]) -> AggregateResult {
    let mut adjustments = params.adjustments.clone();
    if let Some(floored) = outcomes
        .iter()
        .find(|o| o.terms.computed_reinvestment < 0.0)
    {
        adjustments.push(Adjustment::InitialReinvestmentFloored {
            computed: floored.terms.computed_reinvestment,
        });
    }

    let mean_series = mean_records(outcomes);
    let ranked = ranked_by_terminal_index(outcomes);
    let main_outputs = main_outputs(params, outcomes, &ranked);

    let mut path_data = BTreeMap::new();
    if params.include_percentile_paths {
        for p in PERCENTILES {
            if let Some((outcome, _)) = ranked.get(percentile_position(p, ranked.len())) {
                path_data.insert(format!("percentile_{p}"), outcome.records.clone());
            }
        }
    }
    let charts = chart_series(params, outcomes, &mean_series);
    let accounts = accounts_table(mean_series.last());
    path_data.insert("mean".to_string(), mean_series);

    AggregateResult {
        total_paths: outcomes.len() as u32,
        random_seed: params.random_seed,
        main_outputs,
        path_data,
        charts,
        accounts,
        adjustments,
    }
}

pub fn percentile_position(percentile: u32, n: usize) -> usize {
    let raw = (percentile as f64 / 100.0 * n as f64) as usize;
    raw.min(n.saturating_sub(1))
}

fn ranked_by_terminal_index(outcomes: &[PathOutcome]) -> Vec<(&PathOutcome, &QuarterRecord)> {
    let mut ranked: Vec<_> = outcomes
        .iter()
        .filter_map(|o| o.records.last().map(|r| (o, r)))
        .collect();
    ranked.sort_by(|(a, ra), (b, rb)| {
        ra.price
            .total_cmp(&rb.price)
            .then(a.path_id.cmp(&b.path_id))
    });
    ranked
}

fn main_outputs(
    params: &SimulationParameters,
    outcomes: &[PathOutcome],
    ranked: &[(&PathOutcome, &QuarterRecord)],
) -> MainOutputsTable {
    let n = ranked.len().max(1) as f64;
    let mean_of = |f: fn(&QuarterRecord) -> f64| ranked.iter().map(|(_, r)| f(r)).sum::<f64>() / n;

    let mean_initial_reinvestment = outcomes
        .iter()
        .map(|o| o.terms.initial_reinvestment)
        .sum::<f64>()
        / outcomes.len().max(1) as f64;
    let mean_holiday_quarters = outcomes
        .iter()
        .map(|o| o.records.iter().filter(|r| r.in_holiday).count() as f64)
        .sum::<f64>()
        / outcomes.len().max(1) as f64;

    let mut rows = vec![
        OutputRow::new("Reinvestment fraction", params.reinvest_fraction),
        OutputRow::new("Total annuity income", params.total_annuity_income()),
        OutputRow::new("Total loan", params.total_loan),
        OutputRow::new("Insurance cost", params.insurance_cost),
        OutputRow::new("Initial reinvestment", mean_initial_reinvestment),
        OutputRow::new("Loan duration (years)", params.loan_duration as f64),
        OutputRow::new("Paths", outcomes.len() as f64),
        OutputRow::new(MEAN_OUTSTANDING, mean_of(|r| r.outstanding)),
        OutputRow::new("Mean holdings value", mean_of(|r| r.holdings_value)),
        OutputRow::new("Mean surplus", mean_of(|r| r.surplus)),
        OutputRow::new("Mean capital deficit", mean_of(|r| r.capital_deficit)),
        OutputRow::new("Mean funder earned interest", mean_of(|r| r.funder_earned)),
        OutputRow::new(
            "Probability of capital deficit",
            ranked.iter().filter(|(_, r)| r.capital_deficit > 0.0).count() as f64 / n,
        ),
        OutputRow::new("Mean holiday quarters", mean_holiday_quarters),
        OutputRow::new(
            "Subperforming paths",
            outcomes
                .iter()
                .filter(|o| o.records.iter().any(|r| r.subperforming))
                .count() as f64
                / outcomes.len().max(1) as f64,
        ),
    ];

    let mut percentiles = Vec::with_capacity(PERCENTILES.len());
    for p in PERCENTILES {
        let Some((outcome, terminal)) = ranked.get(percentile_position(p, ranked.len())) else {
            continue;
        };
        rows.push(OutputRow::new(format!("Outstanding loan (P{p})"), terminal.outstanding));
        rows.push(OutputRow::new(format!("Holdings value (P{p})"), terminal.holdings_value));
        rows.push(OutputRow::new(format!("Surplus (P{p})"), terminal.surplus));
        rows.push(OutputRow::new(format!("Capital deficit (P{p})"), terminal.capital_deficit));
        percentiles.push(PercentileOutcome {
            percentile: p,
            path_id: outcome.path_id,
            index_level: terminal.price,
            outstanding: terminal.outstanding,
            holdings_value: terminal.holdings_value,
            surplus: terminal.surplus,
            capital_deficit: terminal.capital_deficit,
            deferred_interest: terminal.deferred_interest,
        });
    }

    MainOutputsTable { rows, percentiles }
}

fn mean_records(outcomes: &[PathOutcome]) -> Vec<QuarterRecord> {
    let len = outcomes.iter().map(|o| o.records.len()).min().unwrap_or(0);
    (0..len)
        .map(|idx| mean_record(outcomes.iter().map(|o| &o.records[idx]), outcomes.len()))
        .collect()
}

// flags are set when a majority of paths had them set
fn mean_record<'a>(records: impl Iterator<Item = &'a QuarterRecord>, n: usize) -> QuarterRecord {
    let w = 1.0 / n.max(1) as f64;
    let mut mean = QuarterRecord::default();
    let mut holiday_paths = 0_usize;
    let mut subperforming_paths = 0_usize;
    let mut holiday_quarters = 0.0;

    for r in records {
        mean.period = r.period;
        mean.year = r.year;
        mean.quarter = r.quarter;
        mean.price += r.price * w;
        mean.interest_rate += r.interest_rate * w;
        mean.interest_due += r.interest_due * w;
        mean.interest_paid += r.interest_paid * w;
        mean.loan_size += r.loan_size * w;
        mean.holdings += r.holdings * w;
        mean.holdings_value += r.holdings_value * w;
        mean.deferred_interest += r.deferred_interest * w;
        mean.outstanding += r.outstanding * w;
        mean.capital_deficit += r.capital_deficit * w;
        mean.surplus += r.surplus * w;
        mean.funder_earned += r.funder_earned * w;
        mean.annuity_income += r.annuity_income * w;
        mean.cumulative_annuity += r.cumulative_annuity * w;
        mean.units_sold += r.units_sold * w;
        mean.cumulative_units_sold += r.cumulative_units_sold * w;
        mean.deferred_delta += r.deferred_delta * w;
        mean.pooled_unit_delta += r.pooled_unit_delta * w;
        mean.pooled_units += r.pooled_units * w;
        mean.pooled_value += r.pooled_value * w;
        mean.cumulative_interest_paid += r.cumulative_interest_paid * w;
        mean.units_to_principal += r.units_to_principal * w;
        mean.hedge_unit_delta += r.hedge_unit_delta * w;
        holiday_quarters += r.holiday_quarters as f64 * w;
        holiday_paths += r.in_holiday as usize;
        subperforming_paths += r.subperforming as usize;
    }

    mean.holiday_quarters = holiday_quarters.round() as u32;
    mean.in_holiday = holiday_paths * 2 > n;
    mean.subperforming = subperforming_paths * 2 > n;
    mean
}

fn chart_series(
    params: &SimulationParameters,
    outcomes: &[PathOutcome],
    mean_series: &[QuarterRecord],
) -> ChartSeries {
    ChartSeries {
        labels: mean_series.iter().map(QuarterRecord::label).collect(),
        reinvestment_values: outcomes
            .iter()
            .map(|o| o.records.iter().map(|r| r.holdings_value).collect())
            .collect(),
        return_histogram: return_histogram(params, outcomes),
        loan_balance: mean_series.iter().map(|r| r.loan_size).collect(),
        interest_deficit: mean_series.iter().map(|r| r.deferred_interest).collect(),
        units_outstanding: mean_series.iter().map(|r| r.holdings).collect(),
        cumulative_annuity: mean_series.iter().map(|r| r.cumulative_annuity).collect(),
        cumulative_interest_paid: mean_series
            .iter()
            .map(|r| r.cumulative_interest_paid)
            .collect(),
    }
}

fn return_histogram(params: &SimulationParameters, outcomes: &[PathOutcome]) -> Vec<HistogramBin> {
    let years = params.loan_duration.max(1) as f64;
    let mut counts = [0_u32; RETURN_BUCKET_EDGES.len() + 1];
    for outcome in outcomes {
        let Some(terminal) = outcome.records.last() else {
            continue;
        };
        let growth = terminal.price / outcome.terms.initial_price;
        let annualised = growth.max(0.0).powf(1.0 / years) - 1.0;
        let bucket = RETURN_BUCKET_EDGES
            .iter()
            .take_while(|edge| annualised >= **edge)
            .count();
        counts[bucket] += 1;
    }

    let total = outcomes.len().max(1) as f64;
    counts
        .iter()
        .enumerate()
        .map(|(idx, &count)| HistogramBin {
            lower: if idx == 0 {
                -1.0
            } else {
                RETURN_BUCKET_EDGES[idx - 1]
            },
            upper: RETURN_BUCKET_EDGES
                .get(idx)
                .copied()
                .unwrap_or(f64::INFINITY),
            count,
            frequency: count as f64 / total,
        })
        .collect()
}

fn accounts_table(last: Option<&QuarterRecord>) -> Vec<OutputRow> {
    let Some(r) = last else {
        return Vec::new();
    };
    vec![
        OutputRow::new("Outstanding loan", r.loan_size),
        OutputRow::new("Deferred interest", r.deferred_interest),
        OutputRow::new("Total owed", r.outstanding),
        OutputRow::new("Units held", r.holdings),
        OutputRow::new("Holdings value", r.holdings_value),
        OutputRow::new("Capital deficit", r.capital_deficit),
        OutputRow::new("Surplus", r.surplus),
        OutputRow::new("Funder earned interest", r.funder_earned),
        OutputRow::new("Cumulative interest paid", r.cumulative_interest_paid),
        OutputRow::new("Cumulative annuity income", r.cumulative_annuity),
        OutputRow::new("Pooled units", r.pooled_units),
    ]
}
