#[cfg(feature = "parallel")]
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, instrument};

use super::cashflow::CashFlowPlan;
use super::engine::{final_values, success_rate};
use super::error::{SimError, SimResult};
use super::scenarios::{RawScenarioSet, ScenarioMatrix};
use super::stats::percentile;
use super::table::rate_at_success;
use super::types::{
    Allocation, CashFlowItem, ExpenseRatios, Leverage, RateGrid, WithdrawalStrategy,
    validate_cash_flows, validate_withdrawal,
};

pub const TARGET_SUCCESS_RATES: [f64; 11] =
    [1.0, 0.95, 0.90, 0.85, 0.80, 0.75, 0.70, 0.65, 0.60, 0.55, 0.50];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateSweep {
    pub rates: Vec<f64>,
    pub success_rates: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRate {
    pub target_success: f64,
    pub rate: Option<f64>,
    pub annual_withdrawal: Option<f64>,
    pub needed_portfolio: Option<f64>,
}

impl RateSweep {
    pub fn targets(&self, targets: &[f64]) -> Vec<Option<f64>> {
        interpolate_targets(&self.rates, &self.success_rates, targets)
    }

    pub fn target_table(&self, initial_portfolio: f64, annual_withdrawal: f64) -> Vec<TargetRate> {
        TARGET_SUCCESS_RATES
            .iter()
            .zip(self.targets(&TARGET_SUCCESS_RATES))
            .map(|(target, rate)| match rate.filter(|r| *r > 0.0) {
                Some(rate) => TargetRate {
                    target_success: *target,
                    rate: Some(rate),
                    annual_withdrawal: Some(initial_portfolio * rate),
                    needed_portfolio: Some(annual_withdrawal / rate),
                },
                None => TargetRate {
                    target_success: *target,
                    rate: None,
                    annual_withdrawal: None,
                    needed_portfolio: None,
                },
            })
            .collect()
    }
}

#[instrument(skip_all, fields(paths = scenarios.num_paths(), max_rate = grid.max))]
pub fn sweep_withdrawal_rates(
    scenarios: &ScenarioMatrix,
    initial_portfolio: f64,
    grid: RateGrid,
    strategy: WithdrawalStrategy,
    cash_flows: &[CashFlowItem],
) -> SimResult<RateSweep> {
    grid.validate()?;
    strategy.validate()?;
    validate_cash_flows(cash_flows)?;
    if !initial_portfolio.is_finite() || initial_portfolio <= 0.0 {
        return Err(SimError::config("initial_portfolio must be > 0"));
    }

    let plan = CashFlowPlan::new(cash_flows, scenarios.years());
    let cf_matrix = plan.schedule_matrix(scenarios.num_paths(), Some(scenarios.inflation()))?;
    let rates = grid.rates();
    let evaluate = |rate: &f64| {
        success_rate(
            scenarios,
            initial_portfolio,
            initial_portfolio * rate,
            strategy,
            cf_matrix.as_ref(),
        )
    };

    #[cfg(feature = "parallel")]
    let success_rates: Vec<f64> = rates.par_iter().map(evaluate).collect();
    #[cfg(not(feature = "parallel"))]
    let success_rates: Vec<f64> = rates.iter().map(evaluate).collect();

    debug!(points = rates.len(), "rate sweep finished");
    Ok(RateSweep {
        rates,
        success_rates,
    })
}

pub fn interpolate_targets(rates: &[f64], success_rates: &[f64], targets: &[f64]) -> Vec<Option<f64>> {
    targets
        .iter()
        .map(|target| rate_at_success(rates, success_rates, *target))
        .collect()
}

pub fn allocation_grid(step: f64) -> SimResult<Vec<Allocation>> {
    if !step.is_finite() || step <= 0.0 || step > 1.0 {
        return Err(SimError::config("allocation step must be in (0, 1]"));
    }
    let k = (1.0 / step).round() as usize;
    if (k as f64 * step - 1.0).abs() > 1e-9 {
        return Err(SimError::config(format!(
            "allocation step {step} does not divide 100%"
        )));
    }

    let mut grid = Vec::with_capacity((k + 1) * (k + 2) / 2);
    for d in 0..=k {
        for i in 0..=(k - d) {
            let b = k - d - i;
            grid.push(Allocation::new(
                d as f64 / k as f64,
                i as f64 / k as f64,
                b as f64 / k as f64,
            ));
        }
    }
    Ok(grid)
}

#[derive(Debug, Clone, PartialEq)]
pub struct AllocationSweepConfig {
    pub expense_ratios: ExpenseRatios,
    pub leverage: Leverage,
    pub initial_portfolio: f64,
    pub annual_withdrawal: f64,
    pub strategy: WithdrawalStrategy,
    pub cash_flows: Vec<CashFlowItem>,
    pub step: f64,
}

impl AllocationSweepConfig {
    fn validate(&self) -> SimResult<()> {
        self.expense_ratios.validate_expenses()?;
        self.leverage.validate()?;
        self.strategy.validate()?;
        validate_withdrawal(self.annual_withdrawal)?;
        validate_cash_flows(&self.cash_flows)?;
        if !self.initial_portfolio.is_finite() || self.initial_portfolio <= 0.0 {
            return Err(SimError::config("initial_portfolio must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationPoint {
    pub allocation: Allocation,
    pub success_rate: f64,
    pub median_final: f64,
    pub mean_final: f64,
}

pub fn best_by_success(points: &[AllocationPoint]) -> Option<&AllocationPoint> {
    points.iter().max_by(|a, b| {
        a.success_rate
            .total_cmp(&b.success_rate)
            .then(a.median_final.total_cmp(&b.median_final))
    })
}

#[instrument(skip_all, fields(paths = raw.num_paths(), step = config.step))]
pub fn sweep_allocations(
    raw: &RawScenarioSet,
    config: &AllocationSweepConfig,
) -> SimResult<Vec<AllocationPoint>> {
    config.validate()?;
    let grid = allocation_grid(config.step)?;

    let inflation = raw.inflation();
    let plan = CashFlowPlan::new(&config.cash_flows, raw.retirement_years());
    let cf_matrix = plan.schedule_matrix(raw.num_paths(), Some(&inflation))?;
    let evaluate = |allocation: &Allocation| {
        let scenarios = raw.weighted(allocation, &config.expense_ratios, config.leverage);
        let mut finals = final_values(
            &scenarios,
            config.initial_portfolio,
            config.annual_withdrawal,
            config.strategy,
            cf_matrix.as_ref(),
        );
        let n = finals.len().max(1) as f64;
        let survived = finals.iter().filter(|v| **v > 0.0).count();
        let mean_final = finals.iter().sum::<f64>() / n;
        AllocationPoint {
            allocation: *allocation,
            success_rate: survived as f64 / n,
            median_final: percentile(&mut finals, 50.0),
            mean_final,
        }
    };

    #[cfg(feature = "parallel")]
    let points: Vec<AllocationPoint> = grid.par_iter().map(evaluate).collect();
    #[cfg(not(feature = "parallel"))]
    let points: Vec<AllocationPoint> = grid.iter().map(evaluate).collect();

    debug!(points = points.len(), "allocation sweep finished");
    Ok(points)
}
