use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use tracing::warn;

use super::error::{EngineError, EngineResult};
use super::rng::splitmix64;
use super::types::{
    Adjustment, CashRate, GbmParams, HedgingParams, HistoricalSeries, PathSource, RepaymentMode,
    SimulationParameters,
};

pub const DEFAULT_EQUITY_RETURN: f64 = 0.07;
pub const DEFAULT_VOLATILITY: f64 = 0.15;
pub const DEFAULT_INITIAL_INDEX_LEVEL: f64 = 100.0;
pub const DEFAULT_STEPS_PER_YEAR: u32 = 120;
pub const DEFAULT_CASH_RATE: f64 = 0.03;
pub const DEFAULT_WHOLESALE_MARGIN: f64 = 0.015;
pub const DEFAULT_ADDITIONAL_MARGINS: f64 = 0.01;
pub const DEFAULT_HOLIDAY_ENTER: f64 = 0.5;
pub const DEFAULT_HOLIDAY_EXIT: f64 = 0.7;
pub const DEFAULT_SUPERPAY_START: f64 = 1.2;
pub const DEFAULT_MAX_SUPERPAY: f64 = 1.0;
pub const DEFAULT_SUBPERFORM_QUARTERS: u32 = 8;
pub const DEFAULT_INSURANCE_COST_PA: f64 = 0.005;
pub const DEFAULT_INSURER_PROFIT_MARGIN: f64 = 0.2;
pub const DEFAULT_INSURED_FRACTION: f64 = 0.1;
pub const DEFAULT_TOTAL_PATHS: u32 = 1_000;
pub const MAX_DURATION_YEARS: u32 = 100;
pub const MAX_HEDGING_COST: f64 = 1.0;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawParameters {
    pub house_value: Option<f64>,
    pub loan_duration: Option<u32>,
    pub annuity_duration: Option<u32>,
    pub loan_to_value: Option<f64>,
    pub annual_income: Option<f64>,
    pub equity_return: Option<f64>,
    pub volatility: Option<f64>,
    pub initial_index_level: Option<f64>,
    pub steps_per_year: Option<u32>,
    pub cash_rate: Option<CashRate>,
    pub wholesale_lending_margin: Option<f64>,
    pub additional_loan_margins: Option<f64>,
    pub holiday_enter_fraction: Option<f64>,
    pub holiday_exit_fraction: Option<f64>,
    pub superpay_start_factor: Option<f64>,
    pub max_superpay_factor: Option<f64>,
    pub subperform_threshold_quarters: Option<u32>,
    pub insurance_cost_pa: Option<f64>,
    pub insurer_profit_margin: Option<f64>,
    pub insured_fraction: Option<f64>,
    pub reinvest_fraction: Option<f64>,
    pub hedging: Option<HedgingParams>,
    pub pooling: Option<bool>,
    pub principal_repayment: Option<bool>,
    pub total_paths: Option<u32>,
    pub random_seed: Option<u64>,
    pub include_percentile_paths: Option<bool>,
    pub historical: Option<HistoricalSeries>,
}

pub fn resolve(raw: RawParameters) -> EngineResult<SimulationParameters> {
    let house_value = raw
        .house_value
        .ok_or(EngineError::MissingField("house_value"))?;
    let requested_loan_duration = raw
        .loan_duration
        .ok_or(EngineError::MissingField("loan_duration"))?;
    let loan_to_value = raw
        .loan_to_value
        .ok_or(EngineError::MissingField("loan_to_value"))?;
    let annual_income = raw
        .annual_income
        .ok_or(EngineError::MissingField("annual_income"))?;
    let annuity_duration = raw.annuity_duration.unwrap_or(0);

    if !house_value.is_finite() || house_value <= 0.0 {
        return Err(EngineError::invalid("house_value", "must be > 0"));
    }
    if requested_loan_duration == 0 || requested_loan_duration > MAX_DURATION_YEARS {
        return Err(EngineError::invalid(
            "loan_duration",
            format!("must be between 1 and {MAX_DURATION_YEARS} years"),
        ));
    }
    if annuity_duration > MAX_DURATION_YEARS {
        return Err(EngineError::invalid(
            "annuity_duration",
            format!("must be at most {MAX_DURATION_YEARS} years"),
        ));
    }
    if !(0.0..=1.0).contains(&loan_to_value) {
        return Err(EngineError::invalid("loan_to_value", "must be between 0 and 1"));
    }
    if !annual_income.is_finite() || annual_income < 0.0 {
        return Err(EngineError::invalid("annual_income", "must be >= 0"));
    }

    let mut adjustments = Vec::new();
    let loan_duration = if annuity_duration > requested_loan_duration {
        warn!(
            requested = requested_loan_duration,
            resolved = annuity_duration,
            "annuity outlasts loan; raising loan duration"
        );
        adjustments.push(Adjustment::LoanDurationRaised {
            requested: requested_loan_duration,
            resolved: annuity_duration,
        });
        annuity_duration
    } else {
        requested_loan_duration
    };

    let cash_rate = raw.cash_rate.unwrap_or(CashRate::Flat(DEFAULT_CASH_RATE));
    validate_cash_rate(&cash_rate)?;

    let wholesale_lending_margin = finite(
        "wholesale_lending_margin",
        raw.wholesale_lending_margin.unwrap_or(DEFAULT_WHOLESALE_MARGIN),
    )?;
    let additional_loan_margins = finite(
        "additional_loan_margins",
        raw.additional_loan_margins
            .unwrap_or(DEFAULT_ADDITIONAL_MARGINS),
    )?;

    let holiday_enter_fraction = non_negative(
        "holiday_enter_fraction",
        raw.holiday_enter_fraction.unwrap_or(DEFAULT_HOLIDAY_ENTER),
    )?;
    let holiday_exit_fraction = non_negative(
        "holiday_exit_fraction",
        raw.holiday_exit_fraction.unwrap_or(DEFAULT_HOLIDAY_EXIT),
    )?;
    if holiday_exit_fraction < holiday_enter_fraction {
        return Err(EngineError::invalid(
            "holiday_exit_fraction",
            "must be >= holiday_enter_fraction",
        ));
    }

    let superpay_start_factor = non_negative(
        "superpay_start_factor",
        raw.superpay_start_factor.unwrap_or(DEFAULT_SUPERPAY_START),
    )?;
    let max_superpay_factor = non_negative(
        "max_superpay_factor",
        raw.max_superpay_factor.unwrap_or(DEFAULT_MAX_SUPERPAY),
    )?;

    let subperform_threshold_quarters = raw
        .subperform_threshold_quarters
        .unwrap_or(DEFAULT_SUBPERFORM_QUARTERS);
    if subperform_threshold_quarters == 0 {
        return Err(EngineError::invalid(
            "subperform_threshold_quarters",
            "must be >= 1",
        ));
    }

    let insurance_cost_pa = non_negative(
        "insurance_cost_pa",
        raw.insurance_cost_pa.unwrap_or(DEFAULT_INSURANCE_COST_PA),
    )?;
    let insurer_profit_margin = non_negative(
        "insurer_profit_margin",
        raw.insurer_profit_margin
            .unwrap_or(DEFAULT_INSURER_PROFIT_MARGIN),
    )?;
    let insured_fraction = raw.insured_fraction.unwrap_or(DEFAULT_INSURED_FRACTION);
    if !(0.0..=1.0).contains(&insured_fraction) {
        return Err(EngineError::invalid(
            "insured_fraction",
            "must be between 0 and 1",
        ));
    }

    if let Some(hedging) = &raw.hedging {
        validate_hedging(hedging)?;
    }

    let total_loan = house_value * loan_to_value;
    let total_annuity_income = annual_income * annuity_duration as f64;
    if total_annuity_income > total_loan {
        return Err(EngineError::invalid(
            "annual_income",
            format!(
                "annuity total {total_annuity_income:.2} exceeds total loan {total_loan:.2}"
            ),
        ));
    }
    let reinvest_fraction = match raw.reinvest_fraction {
        Some(fraction) if !(0.0..=1.0).contains(&fraction) => {
            return Err(EngineError::invalid(
                "reinvest_fraction",
                "must be between 0 and 1",
            ));
        }
        Some(fraction) => fraction,
        None if total_loan > 0.0 => {
            ((total_loan - total_annuity_income) / total_loan).clamp(0.0, 1.0)
        }
        None => 0.0,
    };
    let insurance_cost = insurance_cost_pa * total_loan * loan_duration as f64;

    let requested_paths = raw.total_paths.unwrap_or(DEFAULT_TOTAL_PATHS);
    if requested_paths == 0 {
        return Err(EngineError::invalid("total_paths", "must be > 0"));
    }

    let (path_source, total_paths) = match raw.historical {
        Some(series) => {
            validate_history(&series)?;
            if requested_paths != 1 {
                adjustments.push(Adjustment::SinglePathReplay { requested_paths });
            }
            (PathSource::HistoricalReplay(series), 1)
        }
        None => {
            let volatility = raw.volatility.unwrap_or(DEFAULT_VOLATILITY);
            if !volatility.is_finite() || volatility < 0.0 {
                return Err(EngineError::invalid("volatility", "must be >= 0"));
            }
            let drift = finite(
                "equity_return",
                raw.equity_return.unwrap_or(DEFAULT_EQUITY_RETURN),
            )?;
            let initial_level = raw
                .initial_index_level
                .unwrap_or(DEFAULT_INITIAL_INDEX_LEVEL);
            if !initial_level.is_finite() || initial_level <= 0.0 {
                return Err(EngineError::invalid("initial_index_level", "must be > 0"));
            }
            let steps_per_year = raw.steps_per_year.unwrap_or(DEFAULT_STEPS_PER_YEAR);
            if steps_per_year == 0 || steps_per_year % 4 != 0 {
                return Err(EngineError::invalid(
                    "steps_per_year",
                    "must be a positive multiple of 4",
                ));
            }
            (
                PathSource::Synthetic(GbmParams {
                    drift,
                    volatility,
                    initial_level,
                    steps_per_year,
                }),
                requested_paths,
            )
        }
    };

    let random_seed = match raw.random_seed {
        Some(seed) => seed,
        None => {
            let seed = time_seed();
            adjustments.push(Adjustment::SeedGenerated { seed });
            seed
        }
    };

    Ok(SimulationParameters {
        house_value,
        loan_duration,
        annuity_duration,
        loan_to_value,
        annual_income,
        cash_rate,
        wholesale_lending_margin,
        additional_loan_margins,
        holiday_enter_fraction,
        holiday_exit_fraction,
        superpay_start_factor,
        max_superpay_factor,
        subperform_threshold_quarters,
        insurance_cost_pa,
        insurer_profit_margin,
        insured_fraction,
        hedging: raw.hedging,
        pooling: raw.pooling.unwrap_or(false),
        repayment_mode: if raw.principal_repayment.unwrap_or(false) {
            RepaymentMode::PrincipalRepayment
        } else {
            RepaymentMode::Standard
        },
        path_source,
        total_paths,
        random_seed,
        include_percentile_paths: raw.include_percentile_paths.unwrap_or(false),
        total_loan,
        reinvest_fraction,
        insurance_cost,
        adjustments,
    })
}

fn validate_cash_rate(cash_rate: &CashRate) -> EngineResult<()> {
    let valid = |r: &f64| r.is_finite() && *r > -1.0;
    match cash_rate {
        CashRate::Flat(rate) if !valid(rate) => {
            Err(EngineError::invalid("cash_rate", "must be finite and > -1"))
        }
        CashRate::Series(rates) if rates.is_empty() => {
            Err(EngineError::invalid("cash_rate", "series must not be empty"))
        }
        CashRate::Series(rates) if !rates.iter().all(valid) => Err(EngineError::invalid(
            "cash_rate",
            "every series value must be finite and > -1",
        )),
        _ => Ok(()),
    }
}

fn validate_hedging(hedging: &HedgingParams) -> EngineResult<()> {
    if !(0.0..1.0).contains(&hedging.max_loss) {
        return Err(EngineError::invalid(
            "hedging.max_loss",
            "must be in [0, 1)",
        ));
    }
    non_negative("hedging.cap", hedging.cap)?;
    if !(0.0..=MAX_HEDGING_COST).contains(&hedging.cost) {
        return Err(EngineError::invalid(
            "hedging.cost",
            format!("must be between 0 and {MAX_HEDGING_COST} of holdings per year"),
        ));
    }
    Ok(())
}

// Empty series are allowed; replay falls back to a flat default.
fn validate_history(series: &HistoricalSeries) -> EngineResult<()> {
    if let Some(month) = series
        .index_levels
        .iter()
        .position(|l| !l.is_finite() || *l <= 0.0)
    {
        return Err(EngineError::invalid(
            "historical.index_levels",
            format!("month {month} is not a positive finite level"),
        ));
    }
    if let Some(month) = series
        .rates
        .iter()
        .position(|r| !r.is_finite() || *r <= -1.0)
    {
        return Err(EngineError::invalid(
            "historical.rates",
            format!("month {month} must be finite and > -1"),
        ));
    }
    Ok(())
}

fn finite(field: &'static str, value: f64) -> EngineResult<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(EngineError::invalid(field, "must be finite"))
    }
}

fn non_negative(field: &'static str, value: f64) -> EngineResult<f64> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(EngineError::invalid(field, "must be >= 0"))
    }
}

fn time_seed() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    splitmix64(nanos)
}

#[cfg(test)]
pub(crate) fn sample_raw() -> RawParameters {
    RawParameters {
        house_value: Some(1_500_000.0),
        loan_duration: Some(30),
        annuity_duration: Some(15),
        loan_to_value: Some(0.8),
        annual_income: Some(30_000.0),
        total_paths: Some(50),
        random_seed: Some(42),
        ..RawParameters::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS * expected.abs().max(1.0),
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn derives_total_loan_reinvest_fraction_and_insurance_cost() {
        let params = resolve(sample_raw()).expect("valid parameters");
        assert_approx(params.total_loan, 1_200_000.0);
        assert_approx(params.reinvest_fraction, 0.625);
        assert_approx(params.insurance_cost, 0.005 * 1_200_000.0 * 30.0);
        assert_approx(params.total_annuity_income(), 450_000.0);
        assert!(params.adjustments.is_empty());
    }

    #[test]
    fn annuity_longer_than_loan_raises_loan_duration() {
        let mut raw = sample_raw();
        raw.annuity_duration = Some(20);
        raw.loan_duration = Some(15);
        raw.annual_income = Some(10_000.0);

        let params = resolve(raw).expect("valid parameters");
        assert_eq!(params.loan_duration, 20);
        assert_eq!(params.quarters(), 80);
        assert_eq!(
            params.adjustments,
            vec![Adjustment::LoanDurationRaised {
                requested: 15,
                resolved: 20
            }]
        );
    }

    #[test]
    fn missing_required_fields_are_rejected() {
        let mut raw = sample_raw();
        raw.house_value = None;
        let err = resolve(raw).expect_err("must reject");
        assert!(matches!(err, EngineError::MissingField("house_value")));

        let mut raw = sample_raw();
        raw.loan_to_value = None;
        assert!(matches!(
            resolve(raw),
            Err(EngineError::MissingField("loan_to_value"))
        ));
    }

    #[test]
    fn rejects_invalid_configuration() {
        let cases: Vec<(&str, Box<dyn Fn(&mut RawParameters)>)> = vec![
            ("house_value", Box::new(|r: &mut RawParameters| r.house_value = Some(0.0))),
            ("house_value", Box::new(|r: &mut RawParameters| r.house_value = Some(-5.0))),
            ("loan_duration", Box::new(|r: &mut RawParameters| r.loan_duration = Some(0))),
            ("loan_to_value", Box::new(|r: &mut RawParameters| r.loan_to_value = Some(1.2))),
            ("loan_to_value", Box::new(|r: &mut RawParameters| r.loan_to_value = Some(-0.1))),
            ("volatility", Box::new(|r: &mut RawParameters| r.volatility = Some(-0.1))),
            ("steps_per_year", Box::new(|r: &mut RawParameters| r.steps_per_year = Some(30))),
            ("total_paths", Box::new(|r: &mut RawParameters| r.total_paths = Some(0))),
            (
                "holiday_exit_fraction",
                Box::new(|r: &mut RawParameters| {
                    r.holiday_enter_fraction = Some(0.8);
                    r.holiday_exit_fraction = Some(0.6);
                }),
            ),
            (
                "cash_rate",
                Box::new(|r: &mut RawParameters| r.cash_rate = Some(CashRate::Series(Vec::new()))),
            ),
            (
                "hedging.max_loss",
                Box::new(|r: &mut RawParameters| {
                    r.hedging = Some(HedgingParams {
                        max_loss: 1.0,
                        cap: 0.5,
                        cost: 0.01,
                    })
                }),
            ),
            ("annual_income", Box::new(|r: &mut RawParameters| r.annual_income = Some(100_000.0))),
            (
                "hedging.cost",
                Box::new(|r: &mut RawParameters| {
                    r.hedging = Some(HedgingParams {
                        max_loss: 0.2,
                        cap: 0.5,
                        cost: 5.0,
                    })
                }),
            ),
            (
                "loan_duration",
                Box::new(|r: &mut RawParameters| r.loan_duration = Some(40_000_000)),
            ),
            (
                "annuity_duration",
                Box::new(|r: &mut RawParameters| r.annuity_duration = Some(101)),
            ),
            (
                "historical.index_levels",
                Box::new(|r: &mut RawParameters| {
                    let mut index_levels = vec![100.0; 240];
                    index_levels[6] = 0.0;
                    r.historical = Some(HistoricalSeries {
                        index_levels,
                        rates: vec![0.03; 240],
                        series_start_year: 2000,
                        start_year: 2000,
                    })
                }),
            ),
            (
                "historical.index_levels",
                Box::new(|r: &mut RawParameters| {
                    let mut index_levels = vec![100.0; 240];
                    index_levels[100] = f64::NAN;
                    r.historical = Some(HistoricalSeries {
                        index_levels,
                        rates: vec![0.03; 240],
                        series_start_year: 2000,
                        start_year: 2000,
                    })
                }),
            ),
            (
                "historical.rates",
                Box::new(|r: &mut RawParameters| {
                    let mut rates = vec![0.03; 240];
                    rates[3] = -1.5;
                    r.historical = Some(HistoricalSeries {
                        index_levels: vec![100.0; 240],
                        rates,
                        series_start_year: 2000,
                        start_year: 2000,
                    })
                }),
            ),
        ];

        for (expected_field, mutate) in cases {
            let mut raw = sample_raw();
            mutate(&mut raw);
            match resolve(raw) {
                Err(EngineError::InvalidParameter { field, .. }) => {
                    assert_eq!(field, expected_field)
                }
                other => panic!("expected {expected_field} rejection, got {other:?}"),
            }
        }
    }

    #[test]
    fn historical_replay_forces_a_single_path() {
        let mut raw = sample_raw();
        raw.historical = Some(HistoricalSeries {
            index_levels: vec![100.0; 400],
            rates: vec![0.04; 400],
            series_start_year: 1990,
            start_year: 1995,
        });
        let params = resolve(raw).expect("valid parameters");
        assert_eq!(params.total_paths, 1);
        assert!(matches!(params.path_source, PathSource::HistoricalReplay(_)));
        assert!(
            params
                .adjustments
                .contains(&Adjustment::SinglePathReplay { requested_paths: 50 })
        );
    }

    #[test]
    fn missing_seed_is_generated_and_reported() {
        let mut raw = sample_raw();
        raw.random_seed = None;
        let params = resolve(raw).expect("valid parameters");
        assert!(params.adjustments.contains(&Adjustment::SeedGenerated {
            seed: params.random_seed
        }));
    }

    #[test]
    fn reinvest_fraction_override_is_respected() {
        let mut raw = sample_raw();
        raw.reinvest_fraction = Some(0.4);
        let params = resolve(raw).expect("valid parameters");
        assert_approx(params.reinvest_fraction, 0.4);
    }

    #[test]
    fn raw_parameters_parse_from_camel_case_json() {
        let json = r#"{
            "houseValue": 900000,
            "loanDuration": 25,
            "loanToValue": 0.5,
            "annualIncome": 12000,
            "annuityDuration": 10,
            "cashRate": [0.02, 0.025, 0.03],
            "hedging": {"maxLoss": 0.2, "cap": 0.5, "cost": 0.01},
            "pooling": true,
            "principalRepayment": true
        }"#;
        let raw: RawParameters = serde_json::from_str(json).expect("valid json");
        let params = resolve(raw).expect("valid parameters");
        assert_eq!(params.loan_duration, 25);
        assert_eq!(params.cash_rate, CashRate::Series(vec![0.02, 0.025, 0.03]));
        assert!(params.pooling);
        assert_eq!(params.repayment_mode, RepaymentMode::PrincipalRepayment);
        assert_eq!(
            params.hedging,
            Some(HedgingParams {
                max_loss: 0.2,
                cap: 0.5,
                cost: 0.01
            })
        );
    }
}
