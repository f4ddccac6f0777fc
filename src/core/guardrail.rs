#[cfg(feature = "parallel")]
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, instrument};

use super::cashflow::{CashFlowPlan, build_cf_schedule};
use super::engine::{SimulationRun, advance, simulate_path, simulate_paths};
use super::error::{SimError, SimResult};
use super::scenarios::ScenarioMatrix;
use super::solver::{PortfolioSolve, SolverConfig, solve_initial_portfolio};
use super::table::SuccessRateTable;
use super::types::{
    AdjustmentMode, CashFlowItem, GuardrailConfig, Matrix, WithdrawalStrategy,
};

#[derive(Debug, Clone, PartialEq)]
pub struct GuardrailRun {
    pub initial_portfolio: f64,
    pub trajectories: Matrix,
    pub withdrawals: Matrix,
    pub sizing: Option<PortfolioSolve>,
}

impl GuardrailRun {
    pub fn initial_withdrawal_rate(&self, annual_withdrawal: f64) -> f64 {
        if self.initial_portfolio > 0.0 {
            annual_withdrawal / self.initial_portfolio
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustmentEvent {
    pub year: usize,
    pub old_withdrawal: f64,
    pub new_withdrawal: f64,
    pub success_before: f64,
    pub success_after: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestSeries {
    pub portfolio: Vec<f64>,
    pub withdrawals: Vec<f64>,
    pub total_consumption: f64,
}

impl BacktestSeries {
    fn new(portfolio: Vec<f64>, withdrawals: Vec<f64>) -> Self {
        let total_consumption = withdrawals.iter().sum();
        Self {
            portfolio,
            withdrawals,
            total_consumption,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestResult {
    pub years_simulated: usize,
    pub guardrail: BacktestSeries,
    pub guardrail_success_rates: Vec<f64>,
    pub baseline: BacktestSeries,
    pub adjustment_events: Vec<AdjustmentEvent>,
}

#[instrument(skip_all, fields(paths = scenarios.num_paths(), years = config.retirement_years))]
pub fn run_guardrail_simulation(
    scenarios: &ScenarioMatrix,
    config: &GuardrailConfig,
    table: &SuccessRateTable,
    cash_flows: &[CashFlowItem],
) -> SimResult<GuardrailRun> {
    config.validate()?;
    if config.annual_withdrawal <= 0.0 {
        return Err(SimError::config(
            "annual_withdrawal must be > 0 to size a guardrail portfolio",
        ));
    }
    require_horizon(scenarios, config.retirement_years)?;

    let plan = CashFlowPlan::new(cash_flows, config.retirement_years);
    let cf_matrix = plan.schedule_matrix(scenarios.num_paths(), Some(scenarios.inflation()))?;
    let (initial_portfolio, sizing) =
        size_initial_portfolio(scenarios, config, table, &plan, cf_matrix.as_ref())?;

    let policy = GuardrailPolicy { config, table };
    let run_one = |(i, returns): (usize, &Vec<f64>)| {
        let cf = cf_matrix.as_ref().map(|m| m[i].as_slice());
        policy.run_path(returns, cf, initial_portfolio)
    };

    #[cfg(feature = "parallel")]
    let outcomes: Vec<PathOutcome> = scenarios.returns().par_iter().enumerate().map(run_one).collect();
    #[cfg(not(feature = "parallel"))]
    let outcomes: Vec<PathOutcome> = scenarios.returns().iter().enumerate().map(run_one).collect();

    let (trajectories, withdrawals) = outcomes
        .into_iter()
        .map(|outcome| (outcome.values, outcome.withdrawals))
        .unzip();
    debug!(initial_portfolio, "guardrail simulation finished");

    Ok(GuardrailRun {
        initial_portfolio,
        trajectories,
        withdrawals,
        sizing,
    })
}

pub fn run_fixed_baseline(
    scenarios: &ScenarioMatrix,
    initial_portfolio: f64,
    baseline_rate: f64,
    cash_flows: &[CashFlowItem],
) -> SimResult<SimulationRun> {
    let plan = CashFlowPlan::new(cash_flows, scenarios.years());
    simulate_paths(
        scenarios,
        initial_portfolio,
        initial_portfolio * baseline_rate,
        WithdrawalStrategy::Fixed,
        &plan,
    )
}

#[instrument(skip_all, fields(available = real_returns.len(), years = config.retirement_years))]
pub fn run_historical_backtest(
    real_returns: &[f64],
    inflation: Option<&[f64]>,
    initial_portfolio: f64,
    config: &GuardrailConfig,
    table: &SuccessRateTable,
    cash_flows: &[CashFlowItem],
) -> SimResult<BacktestResult> {
    config.validate()?;
    if !initial_portfolio.is_finite() || initial_portfolio <= 0.0 {
        return Err(SimError::config("initial_portfolio must be > 0"));
    }
    let years = config.retirement_years.min(real_returns.len());
    if years == 0 {
        return Err(SimError::config("no historical years available for the backtest"));
    }
    let returns = &real_returns[..years];
    let cf_schedule = if cash_flows.is_empty() {
        None
    } else {
        Some(build_cf_schedule(cash_flows, years, inflation)?)
    };

    let policy = GuardrailPolicy { config, table };
    let guardrail = policy.run_path(returns, cf_schedule.as_deref(), initial_portfolio);

    let mut baseline_values = vec![0.0; years + 1];
    let mut baseline_withdrawals = vec![0.0; years];
    simulate_path(
        returns,
        cf_schedule.as_deref(),
        initial_portfolio,
        initial_portfolio * config.baseline_rate,
        WithdrawalStrategy::Fixed,
        Some((baseline_values.as_mut_slice(), baseline_withdrawals.as_mut_slice())),
    );
    debug!(
        adjustments = guardrail.events.len(),
        "historical backtest finished"
    );

    Ok(BacktestResult {
        years_simulated: years,
        guardrail: BacktestSeries::new(guardrail.values, guardrail.withdrawals),
        guardrail_success_rates: guardrail.success_rates,
        baseline: BacktestSeries::new(baseline_values, baseline_withdrawals),
        adjustment_events: guardrail.events,
    })
}

fn require_horizon(scenarios: &ScenarioMatrix, retirement_years: usize) -> SimResult<()> {
    if scenarios.years() != retirement_years {
        return Err(SimError::config(format!(
            "scenario matrix covers {} years but the guardrail horizon is {retirement_years}",
            scenarios.years()
        )));
    }
    Ok(())
}

fn size_initial_portfolio(
    scenarios: &ScenarioMatrix,
    config: &GuardrailConfig,
    table: &SuccessRateTable,
    plan: &CashFlowPlan,
    cf_matrix: Option<&Matrix>,
) -> SimResult<(f64, Option<PortfolioSolve>)> {
    let mut initial_rate = table.rate_for_target(config.target_success, config.retirement_years);
    if initial_rate <= 0.0 {
        initial_rate = table.smallest_positive_rate();
    }

    let Some(cf_matrix) = cf_matrix else {
        return Ok((config.annual_withdrawal / initial_rate, None));
    };

    let fixed = plan.fixed_schedule();
    let fixed_avg = if fixed.is_empty() {
        0.0
    } else {
        fixed.iter().sum::<f64>() / fixed.len() as f64
    };
    let wd = config.annual_withdrawal;
    let guess = (wd - fixed_avg).max(wd * 0.1) / initial_rate;
    let solve = solve_initial_portfolio(
        scenarios,
        wd,
        config.target_success,
        Some(cf_matrix),
        guess,
        SolverConfig::default(),
    )?;
    Ok((solve.portfolio, Some(solve)))
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Review {
    success_before: f64,
    withdrawal: f64,
    success_after: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
struct PathOutcome {
    values: Vec<f64>,
    withdrawals: Vec<f64>,
    success_rates: Vec<f64>,
    events: Vec<AdjustmentEvent>,
}

#[derive(Clone, Copy)]
struct GuardrailPolicy<'a> {
    config: &'a GuardrailConfig,
    table: &'a SuccessRateTable,
}

impl GuardrailPolicy<'_> {
    fn remaining_years(&self, year: usize) -> usize {
        self.config
            .min_remaining_years
            .max(self.config.retirement_years.saturating_sub(year))
    }

    // Reviews see cash flows only as the mean of the remaining schedule; sizing
    // simulates them year by year.
    fn future_cash_flow_average(&self, cash_flows: Option<&[f64]>, year: usize) -> f64 {
        let Some(schedule) = cash_flows else {
            return 0.0;
        };
        let end = self.config.retirement_years.min(schedule.len());
        let window = &schedule[year.min(end)..end];
        if window.is_empty() {
            0.0
        } else {
            window.iter().sum::<f64>() / window.len() as f64
        }
    }

    fn success_at(&self, withdrawal: f64, value: f64, cf_average: f64, remaining: usize) -> f64 {
        let effective_rate = ((withdrawal - cf_average) / value).max(0.0);
        self.table.lookup(effective_rate, remaining)
    }

    fn review(&self, year: usize, value: f64, withdrawal: f64, cash_flows: Option<&[f64]>) -> Review {
        let remaining = self.remaining_years(year);
        let cf_average = self.future_cash_flow_average(cash_flows, year);
        let success = self.success_at(withdrawal, value, cf_average, remaining);

        let config = self.config;
        if (config.lower_guardrail..=config.upper_guardrail).contains(&success) {
            return Review {
                success_before: success,
                withdrawal,
                success_after: None,
            };
        }

        let adjusted = match config.adjustment_mode {
            AdjustmentMode::Amount => {
                let target_rate = self.table.rate_for_target(config.target_success, remaining);
                let target_withdrawal = value * target_rate + cf_average;
                withdrawal + config.adjustment_pct * (target_withdrawal - withdrawal)
            }
            AdjustmentMode::SuccessRate => {
                let blended = success + config.adjustment_pct * (config.target_success - success);
                value * self.table.rate_for_target(blended, remaining) + cf_average
            }
        }
        .max(0.0);

        Review {
            success_before: success,
            withdrawal: adjusted,
            success_after: Some(self.success_at(adjusted, value, cf_average, remaining)),
        }
    }

    fn run_path(&self, returns: &[f64], cash_flows: Option<&[f64]>, initial_portfolio: f64) -> PathOutcome {
        let years = returns.len();
        let mut outcome = PathOutcome {
            values: vec![0.0; years + 1],
            withdrawals: vec![0.0; years],
            success_rates: vec![0.0; years],
            events: Vec::new(),
        };
        outcome.values[0] = initial_portfolio;

        let mut value = initial_portfolio;
        let mut withdrawal = self.config.annual_withdrawal;
        for (year, real_return) in returns.iter().enumerate() {
            let review = self.review(year, value, withdrawal, cash_flows);
            outcome.success_rates[year] = review.success_before;
            if let Some(success_after) = review.success_after {
                outcome.events.push(AdjustmentEvent {
                    year,
                    old_withdrawal: withdrawal,
                    new_withdrawal: review.withdrawal,
                    success_before: review.success_before,
                    success_after,
                });
            }
            withdrawal = review.withdrawal;

            let cf = cash_flows.map_or(0.0, |s| s[year]);
            let Some(next) = advance(value, *real_return, withdrawal, cf) else {
                break;
            };
            value = next;
            outcome.values[year + 1] = value;
            outcome.withdrawals[year] = withdrawal - cf;
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::fixed_success_rate;
    use crate::core::fixtures::{assert_approx_tol, sample_history, scenario_config};
    use crate::core::scenarios::pregenerate_scenarios;
    use crate::core::types::RateGrid;

    // Success falls linearly from 1.0 at rate 0 to 0.4 at rate 0.06 for every horizon.
    fn linear_table() -> SuccessRateTable {
        let row = |p: f64| {
            let mut row = vec![p; 11];
            row[0] = 1.0;
            row
        };
        SuccessRateTable::from_rows(
            vec![0.0, 0.02, 0.04, 0.06],
            vec![row(1.0), row(0.8), row(0.6), row(0.4)],
        )
        .expect("table")
    }

    fn guardrail_config(retirement_years: usize) -> GuardrailConfig {
        GuardrailConfig {
            annual_withdrawal: 40_000.0,
            target_success: 0.8,
            upper_guardrail: 0.99,
            lower_guardrail: 0.6,
            adjustment_pct: 0.5,
            adjustment_mode: AdjustmentMode::Amount,
            retirement_years,
            min_remaining_years: 1,
            baseline_rate: 0.033,
        }
    }

    fn flat(returns: Vec<Vec<f64>>) -> ScenarioMatrix {
        let inflation = returns.iter().map(|r| vec![0.0; r.len()]).collect();
        ScenarioMatrix::new(returns, inflation).expect("matrix")
    }

    #[test]
    fn amount_mode_moves_part_way_to_target_withdrawal() {
        let table = linear_table();
        let config = guardrail_config(10);
        let policy = GuardrailPolicy {
            config: &config,
            table: &table,
        };
        let review = policy.review(0, 1_000_000.0, 50_000.0, None);
        assert_approx_tol(review.success_before, 0.5, 1e-9);
        assert_approx_tol(review.withdrawal, 35_000.0, 1e-6);
        assert_approx_tol(review.success_after.expect("adjusted"), 0.65, 1e-9);
    }

    #[test]
    fn success_rate_mode_inverts_blended_probability() {
        let table = linear_table();
        let mut config = guardrail_config(10);
        config.adjustment_mode = AdjustmentMode::SuccessRate;
        let policy = GuardrailPolicy {
            config: &config,
            table: &table,
        };
        let review = policy.review(0, 1_000_000.0, 50_000.0, None);
        assert_approx_tol(review.withdrawal, 35_000.0, 1e-6);
    }

    #[test]
    fn inside_band_leaves_withdrawal_alone() {
        let table = linear_table();
        let config = guardrail_config(10);
        let policy = GuardrailPolicy {
            config: &config,
            table: &table,
        };
        let review = policy.review(0, 1_000_000.0, 20_000.0, None);
        assert_eq!(review.withdrawal, 20_000.0);
        assert_eq!(review.success_after, None);
    }

    #[test]
    fn upper_guardrail_raises_spending() {
        let table = linear_table();
        let config = guardrail_config(10);
        let policy = GuardrailPolicy {
            config: &config,
            table: &table,
        };
        let review = policy.review(0, 1_000_000.0, 0.0, None);
        assert_approx_tol(review.withdrawal, 10_000.0, 1e-6);
    }

    #[test]
    fn future_cash_flows_offset_the_effective_rate() {
        let table = linear_table();
        let config = guardrail_config(10);
        let policy = GuardrailPolicy {
            config: &config,
            table: &table,
        };
        let income = vec![10_000.0; 10];
        let review = policy.review(0, 1_000_000.0, 60_000.0, Some(&income));
        assert_approx_tol(review.success_before, 0.5, 1e-9);
        assert_approx_tol(review.withdrawal, 45_000.0, 1e-6);

        let tail = [vec![0.0; 5], vec![20_000.0; 5]].concat();
        assert_approx_tol(policy.future_cash_flow_average(Some(&tail), 0), 10_000.0, 1e-9);
        assert_approx_tol(policy.future_cash_flow_average(Some(&tail), 5), 20_000.0, 1e-9);
        assert_eq!(policy.future_cash_flow_average(None, 3), 0.0);
    }

    #[test]
    fn remaining_years_respect_the_floor() {
        let table = linear_table();
        let mut config = guardrail_config(30);
        config.min_remaining_years = 10;
        let policy = GuardrailPolicy {
            config: &config,
            table: &table,
        };
        assert_eq!(policy.remaining_years(0), 30);
        assert_eq!(policy.remaining_years(25), 10);
    }

    #[test]
    fn sizing_without_cash_flows_uses_inverse_lookup() {
        let scenarios =
            pregenerate_scenarios(&sample_history(), &scenario_config(30, 200)).expect("scenarios");
        let table = SuccessRateTable::build(&scenarios, RateGrid::default()).expect("table");
        let config = guardrail_config(30);

        let run = run_guardrail_simulation(&scenarios, &config, &table, &[]).expect("run");
        let rate = table.rate_for_target(0.8, 30);
        assert!(rate > 0.0);
        assert_approx_tol(run.initial_portfolio, 40_000.0 / rate, 1e-6);
        assert!(run.sizing.is_none());
        assert_eq!(run.trajectories.len(), 200);
        assert!(run.trajectories.iter().all(|row| row.len() == 31 && row[0] == run.initial_portfolio));
        assert!(run.withdrawals.iter().all(|row| row.len() == 30));
        assert_approx_tol(run.initial_withdrawal_rate(40_000.0), rate, 1e-9);
    }

    #[test]
    fn guardrails_change_spending_on_some_paths() {
        let scenarios =
            pregenerate_scenarios(&sample_history(), &scenario_config(30, 200)).expect("scenarios");
        let table = SuccessRateTable::build(&scenarios, RateGrid::default()).expect("table");
        let run = run_guardrail_simulation(&scenarios, &guardrail_config(30), &table, &[])
            .expect("run");
        let adapted = run
            .withdrawals
            .iter()
            .any(|row| row.iter().any(|w| *w > 0.0 && (w - 40_000.0).abs() > 1e-6));
        assert!(adapted);
    }

    #[test]
    fn full_band_matches_fixed_withdrawal() {
        let scenarios =
            pregenerate_scenarios(&sample_history(), &scenario_config(20, 50)).expect("scenarios");
        let table = SuccessRateTable::build(&scenarios, RateGrid::default()).expect("table");
        let mut config = guardrail_config(20);
        config.lower_guardrail = 0.0;
        config.upper_guardrail = 1.0;

        let run = run_guardrail_simulation(&scenarios, &config, &table, &[]).expect("run");
        let fixed = simulate_paths(
            &scenarios,
            run.initial_portfolio,
            40_000.0,
            WithdrawalStrategy::Fixed,
            &CashFlowPlan::new(&[], 20),
        )
        .expect("fixed");
        assert_eq!(run.trajectories, fixed.trajectories);
        assert_eq!(run.withdrawals, fixed.withdrawals);
    }

    #[test]
    fn cash_flows_size_by_bisection() {
        let scenarios =
            pregenerate_scenarios(&sample_history(), &scenario_config(30, 500)).expect("scenarios");
        let table = SuccessRateTable::build(&scenarios, RateGrid::default()).expect("table");
        let cash_flows = [CashFlowItem::real("pension", 15_000.0, 10, 21)];

        let run = run_guardrail_simulation(&scenarios, &guardrail_config(30), &table, &cash_flows)
            .expect("run");
        let sizing = run.sizing.as_ref().expect("bisection sizing");
        assert!(sizing.converged);
        assert_eq!(sizing.portfolio, run.initial_portfolio);

        let cf_matrix = vec![CashFlowPlan::new(&cash_flows, 30).fixed_schedule().to_vec(); 500];
        let achieved = fixed_success_rate(&scenarios, run.initial_portfolio, 40_000.0, Some(&cf_matrix));
        assert!((achieved - 0.8).abs() < SolverConfig::default().tolerance);
    }

    #[test]
    fn nominal_cash_flows_size_against_path_inflation() {
        let scenarios =
            pregenerate_scenarios(&sample_history(), &scenario_config(30, 500)).expect("scenarios");
        let table = SuccessRateTable::build(&scenarios, RateGrid::default()).expect("table");
        let cash_flows = [
            CashFlowItem::nominal("annuity", 12_000.0, 5, 26),
            CashFlowItem::real("pension", 15_000.0, 10, 21),
        ];

        let run = run_guardrail_simulation(&scenarios, &guardrail_config(30), &table, &cash_flows)
            .expect("run");
        let sizing = run.sizing.as_ref().expect("bisection sizing");
        assert!(sizing.converged, "{}", sizing.message);
        assert!((sizing.achieved_success_rate - 0.8).abs() < SolverConfig::default().tolerance);

        let cf_matrix = CashFlowPlan::new(&cash_flows, 30)
            .schedule_matrix(500, Some(scenarios.inflation()))
            .expect("schedule")
            .expect("non-empty");
        let achieved = fixed_success_rate(&scenarios, run.initial_portfolio, 40_000.0, Some(&cf_matrix));
        assert_eq!(achieved, sizing.achieved_success_rate);
    }

    #[test]
    fn horizon_must_match_scenarios() {
        let scenarios = flat(vec![vec![0.0; 5]]);
        let err = run_guardrail_simulation(&scenarios, &guardrail_config(10), &linear_table(), &[]);
        assert!(matches!(err, Err(SimError::Config(_))));
    }

    #[test]
    fn baseline_withdraws_a_fixed_share_of_the_start() {
        let scenarios = flat(vec![vec![0.0; 3]]);
        let run = run_fixed_baseline(&scenarios, 100_000.0, 0.04, &[]).expect("baseline");
        assert_eq!(run.withdrawals[0], vec![4_000.0; 3]);
        assert_eq!(run.trajectories[0], vec![100_000.0, 96_000.0, 92_000.0, 88_000.0]);
    }

    #[test]
    fn backtest_records_adjustments() {
        let returns = vec![0.0; 10];
        let mut config = guardrail_config(10);
        config.annual_withdrawal = 50_000.0;
        let result = run_historical_backtest(&returns, None, 1_000_000.0, &config, &linear_table(), &[])
            .expect("backtest");

        assert_eq!(result.years_simulated, 10);
        assert_eq!(result.guardrail.portfolio.len(), 11);
        assert_eq!(result.guardrail_success_rates.len(), 10);
        let first = result.adjustment_events[0];
        assert_eq!(first.year, 0);
        assert_eq!(first.old_withdrawal, 50_000.0);
        assert_approx_tol(first.new_withdrawal, 35_000.0, 1e-6);
        assert_approx_tol(first.success_before, 0.5, 1e-9);
        assert_approx_tol(first.success_after, 0.65, 1e-9);
        assert_approx_tol(result.guardrail.portfolio[1], 965_000.0, 1e-6);
        for event in &result.adjustment_events {
            assert!(event.success_before < 0.6 || event.success_before > 0.99);
        }

        assert!(result.baseline.withdrawals.iter().all(|w| (w - 33_000.0).abs() < 1e-6));
        assert_approx_tol(result.baseline.total_consumption, 330_000.0, 1e-6);
        assert_approx_tol(
            result.guardrail.total_consumption,
            result.guardrail.withdrawals.iter().sum(),
            1e-9,
        );
    }

    #[test]
    fn backtest_truncates_to_available_history() {
        let result = run_historical_backtest(
            &[0.05; 4],
            None,
            1_000_000.0,
            &guardrail_config(10),
            &linear_table(),
            &[],
        )
        .expect("backtest");
        assert_eq!(result.years_simulated, 4);
        assert_eq!(result.baseline.portfolio.len(), 5);
    }

    #[test]
    fn backtest_nominal_cash_flow_needs_inflation() {
        let cash_flows = [CashFlowItem::nominal("annuity", 5_000.0, 1, 5)];
        let err = run_historical_backtest(
            &[0.05; 10],
            None,
            1_000_000.0,
            &guardrail_config(10),
            &linear_table(),
            &cash_flows,
        );
        assert!(matches!(err, Err(SimError::MissingInflation { .. })));

        let ok = run_historical_backtest(
            &[0.05; 10],
            Some([0.02; 10].as_slice()),
            1_000_000.0,
            &guardrail_config(10),
            &linear_table(),
            &cash_flows,
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn backtest_ruin_stops_spending() {
        let mut config = guardrail_config(5);
        config.lower_guardrail = 0.0;
        config.upper_guardrail = 1.0;
        let result = run_historical_backtest(
            &[-0.9, 0.1, 0.1, 0.1, 0.1],
            None,
            100_000.0,
            &config,
            &linear_table(),
            &[],
        )
        .expect("backtest");
        assert_eq!(result.guardrail.portfolio, vec![100_000.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(result.guardrail.total_consumption, 0.0);
    }
}
