use rand::Rng;
use tracing::{debug, instrument};

use super::cashflow::CashFlowPlan;
use super::error::SimResult;
use super::scenarios::{ScenarioMatrix, pregenerate_scenarios_with_rng, seeded_rng};
use super::types::{HistoricalDataset, Matrix, SimulationConfig, WithdrawalStrategy};

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationRun {
    pub trajectories: Matrix,
    pub withdrawals: Matrix,
}

impl SimulationRun {
    pub fn num_paths(&self) -> usize {
        self.trajectories.len()
    }

    pub fn success_rate(&self) -> f64 {
        if self.trajectories.is_empty() {
            return 0.0;
        }
        let survived = self
            .trajectories
            .iter()
            .filter(|row| row.last().is_some_and(|v| *v > 0.0))
            .count();
        survived as f64 / self.trajectories.len() as f64
    }
}

#[derive(Debug, Clone, Copy)]
struct SpendingState {
    current_withdrawal: f64,
    initial_withdrawal_rate: f64,
}

pub fn run_simulation(
    history: &HistoricalDataset,
    config: &SimulationConfig,
) -> SimResult<SimulationRun> {
    let mut rng = seeded_rng(config.scenario.seed);
    run_simulation_with_rng(history, config, &mut rng)
}

#[instrument(skip_all, fields(paths = config.scenario.num_paths, years = config.scenario.retirement_years))]
pub fn run_simulation_with_rng<R: Rng + ?Sized>(
    history: &HistoricalDataset,
    config: &SimulationConfig,
    rng: &mut R,
) -> SimResult<SimulationRun> {
    config.validate()?;
    let scenarios = pregenerate_scenarios_with_rng(history, &config.scenario, rng)?;
    let plan = CashFlowPlan::new(&config.cash_flows, scenarios.years());
    let run = simulate_paths(
        &scenarios,
        config.initial_portfolio,
        config.annual_withdrawal,
        config.strategy,
        &plan,
    )?;
    debug!(success_rate = run.success_rate(), "simulation finished");
    Ok(run)
}

pub fn simulate_paths(
    scenarios: &ScenarioMatrix,
    initial_portfolio: f64,
    annual_withdrawal: f64,
    strategy: WithdrawalStrategy,
    cash_flows: &CashFlowPlan,
) -> SimResult<SimulationRun> {
    let years = scenarios.years();
    let num_paths = scenarios.num_paths();
    let cf_matrix = cash_flows.schedule_matrix(num_paths, Some(scenarios.inflation()))?;

    let mut trajectories = vec![vec![0.0; years + 1]; num_paths];
    let mut withdrawals = vec![vec![0.0; years]; num_paths];
    for (i, returns) in scenarios.returns().iter().enumerate() {
        simulate_path(
            returns,
            cf_matrix.as_ref().map(|m| m[i].as_slice()),
            initial_portfolio,
            annual_withdrawal,
            strategy,
            Some((trajectories[i].as_mut_slice(), withdrawals[i].as_mut_slice())),
        );
    }

    Ok(SimulationRun {
        trajectories,
        withdrawals,
    })
}

pub fn success_rate(
    scenarios: &ScenarioMatrix,
    initial_portfolio: f64,
    annual_withdrawal: f64,
    strategy: WithdrawalStrategy,
    cf_matrix: Option<&Matrix>,
) -> f64 {
    let finals = final_values(scenarios, initial_portfolio, annual_withdrawal, strategy, cf_matrix);
    if finals.is_empty() {
        return 0.0;
    }
    finals.iter().filter(|v| **v > 0.0).count() as f64 / finals.len() as f64
}

pub fn final_values(
    scenarios: &ScenarioMatrix,
    initial_portfolio: f64,
    annual_withdrawal: f64,
    strategy: WithdrawalStrategy,
    cf_matrix: Option<&Matrix>,
) -> Vec<f64> {
    scenarios
        .returns()
        .iter()
        .enumerate()
        .map(|(i, returns)| {
            simulate_path(
                returns,
                cf_matrix.map(|m| m[i].as_slice()),
                initial_portfolio,
                annual_withdrawal,
                strategy,
                None,
            )
            .unwrap_or(0.0)
        })
        .collect()
}

/// Fixed withdrawal over all paths at once, one year-step at a time.
/// Ruin is absorbing, same as [`simulate_path`].
pub fn fixed_success_rate(
    scenarios: &ScenarioMatrix,
    initial_portfolio: f64,
    annual_withdrawal: f64,
    cf_matrix: Option<&Matrix>,
) -> f64 {
    let num_paths = scenarios.num_paths();
    if num_paths == 0 {
        return 0.0;
    }
    let returns = scenarios.returns();
    let mut values = vec![initial_portfolio; num_paths];
    for year in 0..scenarios.years() {
        for (i, value) in values.iter_mut().enumerate() {
            if *value <= 0.0 {
                continue;
            }
            let cf = cf_matrix.map_or(0.0, |m| m[i][year]);
            *value = advance(*value, returns[i][year], annual_withdrawal, cf).unwrap_or(0.0);
        }
    }
    values.iter().filter(|v| **v > 0.0).count() as f64 / num_paths as f64
}

/// One path under the fixed or dynamic policy. Returns the ending value, or
/// `None` if the path ruined.
/// With `trace`, fills the trajectory row (column 0 included) and the net
/// withdrawal row; both must be zero-initialised.
pub(crate) fn simulate_path(
    returns: &[f64],
    cash_flows: Option<&[f64]>,
    initial_portfolio: f64,
    annual_withdrawal: f64,
    strategy: WithdrawalStrategy,
    mut trace: Option<(&mut [f64], &mut [f64])>,
) -> Option<f64> {
    if let Some((trajectory, _)) = trace.as_mut() {
        trajectory[0] = initial_portfolio;
    }
    let mut state = SpendingState {
        current_withdrawal: annual_withdrawal,
        initial_withdrawal_rate: if initial_portfolio > 0.0 {
            annual_withdrawal / initial_portfolio
        } else {
            0.0
        },
    };
    let mut value = initial_portfolio;

    for (year, real_return) in returns.iter().enumerate() {
        let withdrawal = plan_withdrawal(strategy, year, value, annual_withdrawal, &mut state);
        let cf = cash_flows.map_or(0.0, |s| s[year]);
        value = advance(value, *real_return, withdrawal, cf)?;
        if let Some((trajectory, withdrawals)) = trace.as_mut() {
            trajectory[year + 1] = value;
            withdrawals[year] = withdrawal - cf;
        }
    }
    Some(value)
}

fn plan_withdrawal(
    strategy: WithdrawalStrategy,
    year: usize,
    value: f64,
    annual_withdrawal: f64,
    state: &mut SpendingState,
) -> f64 {
    let withdrawal = match strategy {
        WithdrawalStrategy::Dynamic { ceiling, floor } if year > 0 => {
            let target = value * state.initial_withdrawal_rate;
            let upper = state.current_withdrawal * (1.0 + ceiling);
            let lower = state.current_withdrawal * (1.0 - floor);
            target.min(upper).max(lower)
        }
        WithdrawalStrategy::Dynamic { .. } | WithdrawalStrategy::Fixed => annual_withdrawal,
    };
    state.current_withdrawal = withdrawal;
    withdrawal
}

pub(crate) fn advance(value: f64, real_return: f64, withdrawal: f64, cash_flow: f64) -> Option<f64> {
    let next = value * (1.0 + real_return) - withdrawal + cash_flow;
    (next > 0.0).then_some(next)
}
