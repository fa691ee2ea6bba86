use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CashRate {
    Flat(f64),
    Series(Vec<f64>),
}

impl CashRate {
    pub fn at_quarter(&self, quarter: u32) -> f64 {
        match self {
            CashRate::Flat(rate) => *rate,
            CashRate::Series(rates) => rate_at(rates, quarter),
        }
    }

    pub fn average_over(&self, quarters: u32) -> f64 {
        match self {
            CashRate::Flat(rate) => *rate,
            CashRate::Series(rates) => geometric_mean_rate(rates, quarters),
        }
    }
}

pub(crate) fn rate_at(rates: &[f64], quarter: u32) -> f64 {
    match rates.len() {
        0 => 0.0,
        len => rates[(quarter.max(1) as usize - 1).min(len - 1)],
    }
}

// averaged in the log domain
pub(crate) fn geometric_mean_rate(rates: &[f64], quarters: u32) -> f64 {
    if rates.is_empty() || quarters == 0 {
        return rates.first().copied().unwrap_or(0.0);
    }
    let log_sum: f64 = (1..=quarters)
        .map(|q| (1.0 + rate_at(rates, q)).max(1e-12).ln())
        .sum();
    (log_sum / quarters as f64).exp() - 1.0
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HedgingParams {
    pub max_loss: f64,
    pub cap: f64,
    pub cost: f64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepaymentMode {
    #[default]
    Standard,
    PrincipalRepayment,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GbmParams {
    pub drift: f64,
    pub volatility: f64,
    pub initial_level: f64,
    pub steps_per_year: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalSeries {
    pub index_levels: Vec<f64>,
    pub rates: Vec<f64>,
    pub series_start_year: i32,
    pub start_year: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PathSource {
    Synthetic(GbmParams),
    HistoricalReplay(HistoricalSeries),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Adjustment {
    LoanDurationRaised { requested: u32, resolved: u32 },
    SinglePathReplay { requested_paths: u32 },
    SeedGenerated { seed: u64 },
    HistoricalOffsetClamped { requested: i64, clamped: usize },
    HistoricalDefaultSeries { reason: String },
    InitialReinvestmentFloored { computed: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationParameters {
    pub house_value: f64,
    pub loan_duration: u32,
    pub annuity_duration: u32,
    pub loan_to_value: f64,
    pub annual_income: f64,
    pub cash_rate: CashRate,
    pub wholesale_lending_margin: f64,
    pub additional_loan_margins: f64,
    pub holiday_enter_fraction: f64,
    pub holiday_exit_fraction: f64,
    pub superpay_start_factor: f64,
    pub max_superpay_factor: f64,
    pub subperform_threshold_quarters: u32,
    pub insurance_cost_pa: f64,
    pub insurer_profit_margin: f64,
    pub insured_fraction: f64,
    pub hedging: Option<HedgingParams>,
    pub pooling: bool,
    pub repayment_mode: RepaymentMode,
    pub path_source: PathSource,
    pub total_paths: u32,
    pub random_seed: u64,
    pub include_percentile_paths: bool,
    pub total_loan: f64,
    pub reinvest_fraction: f64,
    pub insurance_cost: f64,
    pub adjustments: Vec<Adjustment>,
}

impl SimulationParameters {
    pub fn quarters(&self) -> u32 {
        self.loan_duration * 4
    }

    pub fn annuity_quarters(&self) -> u32 {
        self.annuity_duration * 4
    }

    pub fn quarterly_income(&self) -> f64 {
        self.annual_income / 4.0
    }

    pub fn total_annuity_income(&self) -> f64 {
        self.annual_income * self.annuity_duration as f64
    }

    pub fn insurance_margin(&self) -> f64 {
        1.0 + self.insurer_profit_margin
    }

    pub fn loan_margin(&self) -> f64 {
        self.wholesale_lending_margin + self.additional_loan_margins
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PricePath {
    pub path_id: u32,
    pub levels: Vec<f64>,
    pub steps_per_quarter: usize,
    // overrides the parameter cash rate when present
    pub cash_rates: Option<Vec<f64>>,
}

impl PricePath {
    pub fn initial_level(&self) -> f64 {
        self.levels.first().copied().unwrap_or(f64::NAN)
    }

    /// Index level at a quarter boundary. Lookups past the end reuse the final level.
    pub fn level_at_quarter(&self, quarter: u32) -> f64 {
        let Some(last) = self.levels.len().checked_sub(1) else {
            return f64::NAN;
        };
        let idx = (quarter as usize).saturating_mul(self.steps_per_quarter);
        self.levels[idx.min(last)]
    }

    pub fn cash_rate_at_quarter(&self, quarter: u32, fallback: &CashRate) -> f64 {
        match &self.cash_rates {
            Some(rates) if !rates.is_empty() => rate_at(rates, quarter),
            _ => fallback.at_quarter(quarter),
        }
    }

    pub fn average_cash_rate(&self, quarters: u32, fallback: &CashRate) -> f64 {
        match &self.cash_rates {
            Some(rates) if !rates.is_empty() => geometric_mean_rate(rates, quarters),
            _ => fallback.average_over(quarters),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarterRecord {
    pub period: u32,
    pub year: u32,
    pub quarter: u32,
    pub price: f64,
    pub interest_rate: f64,
    pub interest_due: f64,
    pub interest_paid: f64,
    pub loan_size: f64,
    pub holdings: f64,
    pub holdings_value: f64,
    pub deferred_interest: f64,
    pub outstanding: f64,
    pub capital_deficit: f64,
    pub surplus: f64,
    pub in_holiday: bool,
    pub funder_earned: f64,
    pub annuity_income: f64,
    pub cumulative_annuity: f64,
    pub holiday_quarters: u32,
    pub subperforming: bool,
    pub units_sold: f64,
    pub cumulative_units_sold: f64,
    pub deferred_delta: f64,
    pub pooled_unit_delta: f64,
    pub pooled_units: f64,
    pub pooled_value: f64,
    pub cumulative_interest_paid: f64,
    pub units_to_principal: f64,
    pub hedge_unit_delta: f64,
}

impl QuarterRecord {
    pub fn label(&self) -> String {
        format!("Y{}Q{}", self.year, self.quarter)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputRow {
    pub label: String,
    pub value: f64,
}

impl OutputRow {
    pub fn new(label: impl Into<String>, value: f64) -> Self {
        Self {
            label: label.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileOutcome {
    pub percentile: u32,
    pub path_id: u32,
    pub index_level: f64,
    pub outstanding: f64,
    pub holdings_value: f64,
    pub surplus: f64,
    pub capital_deficit: f64,
    pub deferred_interest: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MainOutputsTable {
    pub rows: Vec<OutputRow>,
    pub percentiles: Vec<PercentileOutcome>,
}

impl MainOutputsTable {
    pub fn value(&self, label: &str) -> Option<f64> {
        self.rows.iter().find(|r| r.label == label).map(|r| r.value)
    }

    pub fn percentile(&self, percentile: u32) -> Option<&PercentileOutcome> {
        self.percentiles.iter().find(|p| p.percentile == percentile)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramBin {
    pub lower: f64,
    pub upper: f64,
    pub count: u32,
    pub frequency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartSeries {
    pub labels: Vec<String>,
    pub reinvestment_values: Vec<Vec<f64>>,
    pub return_histogram: Vec<HistogramBin>,
    pub loan_balance: Vec<f64>,
    pub interest_deficit: Vec<f64>,
    pub units_outstanding: Vec<f64>,
    pub cumulative_annuity: Vec<f64>,
    pub cumulative_interest_paid: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    pub total_paths: u32,
    pub random_seed: u64,
    pub main_outputs: MainOutputsTable,
    pub path_data: BTreeMap<String, Vec<QuarterRecord>>,
    pub charts: ChartSeries,
    pub accounts: Vec<OutputRow>,
    pub adjustments: Vec<Adjustment>,
}
