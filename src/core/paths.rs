use rayon::prelude::*;
use tracing::{debug, warn};

use super::rng::PathRng;
use super::types::{
    Adjustment, CashRate, GbmParams, HistoricalSeries, PathSource, PricePath, SimulationParameters,
};

pub const PRICE_FLOOR: f64 = 1e-6;
pub const DEFAULT_REPLAY_LEVEL: f64 = 100.0;
const MONTHS_PER_QUARTER: usize = 3;

#[derive(Debug, Clone)]
pub struct GeneratedPaths {
    pub paths: Vec<PricePath>,
    pub adjustments: Vec<Adjustment>,
}

pub fn generate(params: &SimulationParameters) -> GeneratedPaths {
    match &params.path_source {
        PathSource::Synthetic(gbm) => {
            debug!(
                paths = params.total_paths,
                steps_per_year = gbm.steps_per_year,
                "generating synthetic paths"
            );
            let paths = (0..params.total_paths)
                .into_par_iter()
                .map(|path_id| {
                    synthetic_path(gbm, params.loan_duration, params.random_seed, path_id)
                })
                .collect();
            GeneratedPaths {
                paths,
                adjustments: Vec::new(),
            }
        }
        PathSource::HistoricalReplay(series) => {
            let mut adjustments = Vec::new();
            let path = replay_path(
                series,
                params.loan_duration,
                &params.cash_rate,
                &mut adjustments,
            );
            GeneratedPaths {
                paths: vec![path],
                adjustments,
            }
        }
    }
}

pub fn synthetic_path(gbm: &GbmParams, loan_duration: u32, base_seed: u64, path_id: u32) -> PricePath {
    let steps = (loan_duration * gbm.steps_per_year) as usize;
    let dt = 1.0 / gbm.steps_per_year as f64;
    let drift = (gbm.drift - 0.5 * gbm.volatility * gbm.volatility) * dt;
    let diffusion = gbm.volatility * dt.sqrt();

    let mut rng = PathRng::for_path(base_seed, path_id);
    let mut levels = Vec::with_capacity(steps + 1);
    let mut level = gbm.initial_level.max(PRICE_FLOOR);
    levels.push(level);
    for _ in 0..steps {
        let z = rng.standard_normal();
        level = (level * (drift + diffusion * z).exp()).max(PRICE_FLOOR);
        levels.push(level);
    }

    PricePath {
        path_id,
        levels,
        steps_per_quarter: (gbm.steps_per_year / 4) as usize,
        cash_rates: None,
    }
}

/// Never fails: the start offset is clamped into the data and an empty
/// history is replaced by a flat default series.
pub fn replay_path(
    series: &HistoricalSeries,
    loan_duration: u32,
    fallback_rate: &CashRate,
    adjustments: &mut Vec<Adjustment>,
) -> PricePath {
    let window = loan_duration as usize * 12;
    let quarters = loan_duration * 4;

    if series.index_levels.is_empty() || series.rates.is_empty() {
        let reason = format!(
            "history has {} index levels and {} rates",
            series.index_levels.len(),
            series.rates.len()
        );
        warn!(%reason, "falling back to constant replay series");
        adjustments.push(Adjustment::HistoricalDefaultSeries { reason });
        return PricePath {
            path_id: 0,
            levels: vec![DEFAULT_REPLAY_LEVEL; window + 1],
            steps_per_quarter: MONTHS_PER_QUARTER,
            cash_rates: Some((1..=quarters).map(|q| fallback_rate.at_quarter(q)).collect()),
        };
    }

    let available = series.index_levels.len().min(series.rates.len());
    let requested = (series.start_year as i64 - series.series_start_year as i64) * 12;
    let max_offset = available.saturating_sub(window + 1);
    let offset = requested.clamp(0, max_offset as i64) as usize;
    if offset as i64 != requested {
        warn!(
            requested,
            clamped = offset,
            "replay start offset outside available history"
        );
        adjustments.push(Adjustment::HistoricalOffsetClamped {
            requested,
            clamped: offset,
        });
    }
    if available < window + 1 {
        warn!(
            available,
            required = window + 1,
            "history shorter than loan window; final level reused"
        );
    }

    let end = available.min(offset + window + 1);
    let levels = series.index_levels[offset..end].to_vec();
    let cash_rates = (0..quarters as usize)
        .map(|q| series.rates[(offset + q * MONTHS_PER_QUARTER).min(available - 1)])
        .collect();

    PricePath {
        path_id: 0,
        levels,
        steps_per_quarter: MONTHS_PER_QUARTER,
        cash_rates: Some(cash_rates),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::{RawParameters, resolve, sample_raw};
    use proptest::prelude::{prop_assert, prop_assert_eq, proptest};

    fn history(len: usize, series_start_year: i32, start_year: i32) -> HistoricalSeries {
        HistoricalSeries {
            index_levels: (0..len).map(|m| 100.0 + m as f64).collect(),
            rates: (0..len).map(|m| 0.01 + m as f64 * 1e-4).collect(),
            series_start_year,
            start_year,
        }
    }

    #[test]
    fn synthetic_generation_is_reproducible() {
        let params = resolve(sample_raw()).expect("valid parameters");
        let a = generate(&params);
        let b = generate(&params);
        assert_eq!(a.paths.len(), 50);
        for (left, right) in a.paths.iter().zip(b.paths.iter()) {
            assert_eq!(left.path_id, right.path_id);
            assert_eq!(left.levels.len(), right.levels.len());
            for (x, y) in left.levels.iter().zip(right.levels.iter()) {
                assert_eq!(x.to_bits(), y.to_bits());
            }
        }
    }

    #[test]
    fn synthetic_path_has_one_level_per_grid_step() {
        let params = resolve(sample_raw()).expect("valid parameters");
        let generated = generate(&params);
        let path = &generated.paths[0];
        assert_eq!(path.levels.len(), 30 * 120 + 1);
        assert_eq!(path.steps_per_quarter, 30);
        assert_eq!(path.initial_level(), 100.0);
    }

    #[test]
    fn zero_volatility_path_grows_at_the_drift() {
        let gbm = GbmParams {
            drift: 0.05,
            volatility: 0.0,
            initial_level: 100.0,
            steps_per_year: 120,
        };
        let path = synthetic_path(&gbm, 2, 1, 0);
        let expected = 100.0 * (0.05_f64 * 2.0).exp();
        assert!((path.level_at_quarter(8) - expected).abs() < 1e-9);
        assert!((path.level_at_quarter(4) - 100.0 * 0.05_f64.exp()).abs() < 1e-9);
    }

    #[test]
    fn collapsing_drift_is_floored_above_zero() {
        let gbm = GbmParams {
            drift: -500.0,
            volatility: 0.0,
            initial_level: 100.0,
            steps_per_year: 4,
        };
        let path = synthetic_path(&gbm, 5, 1, 0);
        assert!(path.levels.iter().all(|l| *l >= PRICE_FLOOR));
        assert_eq!(*path.levels.last().expect("non-empty"), PRICE_FLOOR);
    }

    #[test]
    fn replay_starts_at_configured_year() {
        let mut adjustments = Vec::new();
        let series = history(600, 1980, 1990);
        let path = replay_path(&series, 10, &CashRate::Flat(0.03), &mut adjustments);
        assert!(adjustments.is_empty());
        assert_eq!(path.levels.len(), 121);
        assert_eq!(path.level_at_quarter(0), 100.0 + 120.0);
        assert_eq!(path.level_at_quarter(1), 100.0 + 123.0);
        let rates = path.cash_rates.as_ref().expect("replayed rates");
        assert_eq!(rates.len(), 40);
        assert!((rates[0] - (0.01 + 120.0 * 1e-4)).abs() < 1e-12);
    }

    #[test]
    fn replay_offset_is_clamped_to_stay_inside_history() {
        let mut adjustments = Vec::new();
        let series = history(200, 1980, 2020);
        let path = replay_path(&series, 10, &CashRate::Flat(0.03), &mut adjustments);
        assert_eq!(
            adjustments,
            vec![Adjustment::HistoricalOffsetClamped {
                requested: 480,
                clamped: 79
            }]
        );
        assert_eq!(path.levels.len(), 121);
        assert_eq!(*path.levels.last().expect("non-empty"), 100.0 + 199.0);

        let mut adjustments = Vec::new();
        let early = history(200, 1980, 1970);
        let path = replay_path(&early, 10, &CashRate::Flat(0.03), &mut adjustments);
        assert_eq!(path.level_at_quarter(0), 100.0);
        assert_eq!(adjustments.len(), 1);
    }

    #[test]
    fn short_history_reuses_final_level() {
        let mut adjustments = Vec::new();
        let series = history(30, 2000, 2000);
        let path = replay_path(&series, 10, &CashRate::Flat(0.03), &mut adjustments);
        assert_eq!(path.levels.len(), 30);
        assert_eq!(path.level_at_quarter(40), 129.0);
    }

    #[test]
    fn empty_history_falls_back_to_constant_series() {
        let mut raw: RawParameters = sample_raw();
        raw.cash_rate = Some(CashRate::Flat(0.025));
        raw.historical = Some(HistoricalSeries {
            index_levels: Vec::new(),
            rates: Vec::new(),
            series_start_year: 2000,
            start_year: 2000,
        });
        let params = resolve(raw).expect("valid parameters");
        let generated = generate(&params);
        assert_eq!(generated.paths.len(), 1);
        let path = &generated.paths[0];
        assert!(path.levels.iter().all(|l| *l == DEFAULT_REPLAY_LEVEL));
        assert_eq!(path.levels.len(), 30 * 12 + 1);
        assert!(matches!(
            generated.adjustments.as_slice(),
            [Adjustment::HistoricalDefaultSeries { .. }]
        ));
        assert_eq!(path.cash_rate_at_quarter(7, &params.cash_rate), 0.025);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(24))]

        #[test]
        fn prop_generate_returns_one_positive_path_per_request(
            total_paths in 1u32..40,
            loan_duration in 1u32..8,
            vol_bp in 0u32..8000,
            drift_bp in -2000i32..2000,
            seed in 0u64..1_000_000,
        ) {
            let mut raw = sample_raw();
            raw.total_paths = Some(total_paths);
            raw.loan_duration = Some(loan_duration);
            raw.annuity_duration = Some(0);
            raw.volatility = Some(vol_bp as f64 / 10_000.0);
            raw.equity_return = Some(drift_bp as f64 / 10_000.0);
            raw.steps_per_year = Some(12);
            raw.random_seed = Some(seed);
            let params = resolve(raw).expect("valid parameters");

            let generated = generate(&params);
            prop_assert_eq!(generated.paths.len(), total_paths as usize);
            for (idx, path) in generated.paths.iter().enumerate() {
                prop_assert_eq!(path.path_id as usize, idx);
                prop_assert_eq!(path.levels.len(), (loan_duration * 12 + 1) as usize);
                prop_assert!(path.levels.iter().all(|l| l.is_finite() && *l > 0.0));
            }
        }
    }
}
