use tracing::warn;

use super::error::{EngineError, EngineResult};
use super::types::{HedgingParams, PricePath, QuarterRecord, RepaymentMode, SimulationParameters};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoanTerms {
    pub initial_price: f64,
    // before flooring at zero
    pub computed_reinvestment: f64,
    pub initial_reinvestment: f64,
    pub initial_units: f64,
    pub initial_loan: f64,
    pub prepaid_income: f64,
    pub holiday_enter: f64,
    pub holiday_exit: f64,
    pub superpay_threshold: f64,
    pub insured_units: f64,
    pub quarterly_income: f64,
    pub annuity_quarters: u32,
}

impl LoanTerms {
    pub fn new(params: &SimulationParameters, path: &PricePath) -> EngineResult<Self> {
        let initial_price = path.initial_level();
        if !initial_price.is_finite() || initial_price <= 0.0 {
            return Err(EngineError::Simulation {
                path_id: path.path_id,
                period: 0,
                reason: format!("initial index level {initial_price} is not positive"),
            });
        }

        let avg_cash_rate = path.average_cash_rate(params.quarters(), &params.cash_rate);
        let discount = (params.loan_duration as f64 * (1.0 + avg_cash_rate).ln()).exp();
        let invested = params.total_loan * params.reinvest_fraction;
        let computed_reinvestment =
            invested - params.insurance_margin() * params.insurance_cost / discount;
        if computed_reinvestment < 0.0 {
            warn!(
                path_id = path.path_id,
                computed_reinvestment, "insurance premium exceeds reinvested loan"
            );
        }
        let initial_reinvestment = computed_reinvestment.max(0.0);
        let initial_units = initial_reinvestment / initial_price;

        let quarterly_income = params.quarterly_income();
        let prepaid_income = if params.annuity_duration > 0 {
            quarterly_income
        } else {
            0.0
        };
        let holiday_exit = initial_reinvestment * params.holiday_exit_fraction;

        Ok(Self {
            initial_price,
            computed_reinvestment,
            initial_reinvestment,
            initial_units,
            initial_loan: invested + prepaid_income,
            prepaid_income,
            holiday_enter: initial_reinvestment * params.holiday_enter_fraction,
            holiday_exit,
            superpay_threshold: holiday_exit * params.superpay_start_factor,
            insured_units: initial_units * params.insured_fraction,
            quarterly_income,
            annuity_quarters: params.annuity_quarters(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathState {
    pub holdings: f64,
    pub loan_size: f64,
    pub deferred_interest: f64,
    pub in_holiday: bool,
    pub holiday_quarters: u32,
    pub cumulative_units_sold: f64,
    pub cumulative_interest_paid: f64,
    pub cumulative_annuity: f64,
    pub funder_earned: f64,
    // negative when drawn from the shared pool
    pub pooled_units: f64,
    pub yearly_anchor: f64,
    pub five_year_anchor: f64,
}

impl PathState {
    pub fn initial(terms: &LoanTerms) -> Self {
        Self {
            holdings: terms.initial_units,
            loan_size: terms.initial_loan,
            deferred_interest: 0.0,
            in_holiday: false,
            holiday_quarters: 0,
            cumulative_units_sold: 0.0,
            cumulative_interest_paid: 0.0,
            cumulative_annuity: terms.prepaid_income,
            funder_earned: 0.0,
            pooled_units: 0.0,
            yearly_anchor: terms.initial_price,
            five_year_anchor: terms.initial_price,
        }
    }

    fn is_finite(&self) -> bool {
        self.holdings.is_finite()
            && self.loan_size.is_finite()
            && self.deferred_interest.is_finite()
            && self.pooled_units.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuarterInputs {
    pub period: u32,
    pub price: f64,
    pub cash_rate: f64,
}

#[derive(Debug, Default, Clone, Copy)]
struct QuarterFlow {
    interest_paid: f64,
    units_sold: f64,
    deferred_delta: f64,
    pooled_unit_delta: f64,
    units_to_principal: f64,
    hedge_unit_delta: f64,
    annuity_income: f64,
}

pub fn simulate(path: &PricePath, params: &SimulationParameters) -> EngineResult<Vec<QuarterRecord>> {
    let terms = LoanTerms::new(params, path)?;
    simulate_with_terms(path, params, &terms)
}

pub fn simulate_with_terms(
    path: &PricePath,
    params: &SimulationParameters,
    terms: &LoanTerms,
) -> EngineResult<Vec<QuarterRecord>> {
    let quarters = params.quarters();
    let mut records = Vec::with_capacity(quarters as usize + 1);
    let mut state = PathState::initial(terms);

    let opening_rate = path.cash_rate_at_quarter(1, &params.cash_rate) + params.loan_margin();
    let opening_flow = QuarterFlow {
        annuity_income: terms.prepaid_income,
        ..QuarterFlow::default()
    };
    records.push(build_record(
        &state,
        &opening_flow,
        params,
        0,
        terms.initial_price,
        opening_rate,
        0.0,
    ));

    for period in 1..=quarters {
        let price = path.level_at_quarter(period);
        if !price.is_finite() || price <= 0.0 {
            return Err(EngineError::Simulation {
                path_id: path.path_id,
                period,
                reason: format!("index level {price} is not positive"),
            });
        }
        let inputs = QuarterInputs {
            period,
            price,
            cash_rate: path.cash_rate_at_quarter(period, &params.cash_rate),
        };
        let (next, record) = advance(&state, terms, params, inputs);
        if !next.is_finite() {
            return Err(EngineError::Simulation {
                path_id: path.path_id,
                period,
                reason: "loan state became non-finite".to_string(),
            });
        }
        records.push(record);
        state = next;
    }

    Ok(records)
}

pub fn advance(
    state: &PathState,
    terms: &LoanTerms,
    params: &SimulationParameters,
    inputs: QuarterInputs,
) -> (PathState, QuarterRecord) {
    let mut next = state.clone();
    let mut flow = QuarterFlow::default();
    let price = inputs.price;
    let interest_rate = inputs.cash_rate + params.loan_margin();
    let interest_due = (state.loan_size * interest_rate * 0.25).max(0.0);
    let holdings_value = state.holdings * price;

    if params.pooling && state.holdings <= terms.insured_units {
        draw_from_pool(&mut next, &mut flow, interest_due, price);
        next.in_holiday = false;
        next.holiday_quarters = 0;
    } else if state.in_holiday {
        if holdings_value > terms.holiday_exit {
            pay_interest(&mut next, &mut flow, interest_due, price);
            next.in_holiday = false;
            next.holiday_quarters = 0;
        } else {
            defer(&mut next, &mut flow, interest_due);
            next.holiday_quarters += 1;
        }
    } else if holdings_value < terms.holiday_enter {
        defer(&mut next, &mut flow, interest_due);
        next.in_holiday = true;
        next.holiday_quarters += 1;
    } else {
        pay_interest(&mut next, &mut flow, interest_due, price);
        next.holiday_quarters = 0;
        if holdings_value > terms.superpay_threshold
            && next.deferred_interest > 0.0
            && next.holdings > terms.insured_units
        {
            let target = (params.max_superpay_factor * interest_due).min(next.deferred_interest);
            let shortfall = sell_units_for(&mut next, &mut flow, target, price);
            let repaid = target - shortfall;
            next.deferred_interest -= repaid;
            flow.deferred_delta -= repaid;
        }
    }

    if let Some(hedging) = &params.hedging {
        apply_hedging(&mut next, &mut flow, hedging, inputs.period, price);
    }

    if inputs.period <= terms.annuity_quarters {
        draw_annuity(
            &mut next,
            &mut flow,
            params.repayment_mode,
            terms.quarterly_income,
            price,
        );
    }

    let record = build_record(
        &next,
        &flow,
        params,
        inputs.period,
        price,
        interest_rate,
        interest_due,
    );
    (next, record)
}

// Returns the part of `amount` that holdings could not cover.
fn sell_units_for(state: &mut PathState, flow: &mut QuarterFlow, amount: f64, price: f64) -> f64 {
    let available = state.holdings.max(0.0) * price;
    let paid = amount.min(available).max(0.0);
    let units = paid / price;

    state.holdings = (state.holdings - units).max(0.0);
    state.cumulative_units_sold += units;
    state.cumulative_interest_paid += paid;
    state.funder_earned += paid;
    flow.units_sold += units;
    flow.interest_paid += paid;
    amount - paid
}

fn pay_interest(state: &mut PathState, flow: &mut QuarterFlow, interest_due: f64, price: f64) {
    let shortfall = sell_units_for(state, flow, interest_due, price);
    if shortfall > 0.0 {
        defer(state, flow, shortfall);
    }
}

fn defer(state: &mut PathState, flow: &mut QuarterFlow, amount: f64) {
    state.deferred_interest += amount;
    flow.deferred_delta += amount;
}

fn draw_from_pool(state: &mut PathState, flow: &mut QuarterFlow, interest_due: f64, price: f64) {
    let units = interest_due / price;
    state.pooled_units -= units;
    state.cumulative_interest_paid += interest_due;
    state.funder_earned += interest_due;
    flow.pooled_unit_delta -= units;
    flow.interest_paid += interest_due;
}

fn apply_hedging(
    state: &mut PathState,
    flow: &mut QuarterFlow,
    hedging: &HedgingParams,
    period: u32,
    price: f64,
) {
    let cost_units = state.holdings * hedging.cost * 0.25;
    state.holdings -= cost_units;
    flow.hedge_unit_delta -= cost_units;

    if period % 4 == 0 {
        let floor = state.yearly_anchor * (1.0 - hedging.max_loss);
        if price < floor {
            let protected = state.holdings * floor / price;
            flow.hedge_unit_delta += protected - state.holdings;
            state.holdings = protected;
        }
        state.yearly_anchor = price;
    }

    if period % 20 == 0 {
        let ceiling = state.five_year_anchor * (1.0 + hedging.cap);
        if price > ceiling {
            let capped = state.holdings * ceiling / price;
            flow.hedge_unit_delta += capped - state.holdings;
            state.holdings = capped;
        }
        state.five_year_anchor = price;
    }
}

fn draw_annuity(
    state: &mut PathState,
    flow: &mut QuarterFlow,
    mode: RepaymentMode,
    income: f64,
    price: f64,
) {
    flow.annuity_income = income;
    state.cumulative_annuity += income;
    match mode {
        RepaymentMode::Standard => state.loan_size += income,
        RepaymentMode::PrincipalRepayment => {
            let available = state.holdings.max(0.0) * price;
            let applied = income.min(state.loan_size.max(0.0)).min(available);
            let units = applied / price;
            state.loan_size -= applied;
            state.holdings = (state.holdings - units).max(0.0);
            state.cumulative_units_sold += units;
            flow.units_sold += units;
            flow.units_to_principal = units;
        }
    }
}

fn build_record(
    state: &PathState,
    flow: &QuarterFlow,
    params: &SimulationParameters,
    period: u32,
    price: f64,
    interest_rate: f64,
    interest_due: f64,
) -> QuarterRecord {
    let holdings_value = state.holdings * price;
    let pooled_value = state.pooled_units * price;

    QuarterRecord {
        period,
        year: period.div_ceil(4),
        quarter: if period == 0 { 0 } else { (period - 1) % 4 + 1 },
        price,
        interest_rate,
        interest_due,
        interest_paid: flow.interest_paid,
        loan_size: state.loan_size,
        holdings: state.holdings,
        holdings_value,
        deferred_interest: state.deferred_interest,
        outstanding: state.loan_size + state.deferred_interest,
        capital_deficit: (state.loan_size - holdings_value).max(0.0),
        surplus: holdings_value - state.loan_size - state.deferred_interest + pooled_value,
        in_holiday: state.in_holiday,
        funder_earned: state.funder_earned,
        annuity_income: flow.annuity_income,
        cumulative_annuity: state.cumulative_annuity,
        holiday_quarters: state.holiday_quarters,
        subperforming: state.holiday_quarters >= params.subperform_threshold_quarters,
        units_sold: flow.units_sold,
        cumulative_units_sold: state.cumulative_units_sold,
        deferred_delta: flow.deferred_delta,
        pooled_unit_delta: flow.pooled_unit_delta,
        pooled_units: state.pooled_units,
        pooled_value,
        cumulative_interest_paid: state.cumulative_interest_paid,
        units_to_principal: flow.units_to_principal,
        hedge_unit_delta: flow.hedge_unit_delta,
    }
}
