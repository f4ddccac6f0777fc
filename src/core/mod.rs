mod bootstrap;
mod cashflow;
mod engine;
mod error;
#[cfg(test)]
mod fixtures;
mod guardrail;
mod portfolio;
mod scenarios;
mod solver;
mod stats;
mod sweep;
mod table;
mod types;

pub use bootstrap::block_bootstrap;
pub use cashflow::{CashFlowPlan, build_cf_schedule};
pub use engine::{
    SimulationRun, final_values, fixed_success_rate, run_simulation, run_simulation_with_rng,
    simulate_paths, success_rate,
};
pub use error::{SimError, SimResult};
pub use guardrail::{
    AdjustmentEvent, BacktestResult, BacktestSeries, GuardrailRun, run_fixed_baseline,
    run_guardrail_simulation, run_historical_backtest,
};
pub use portfolio::real_portfolio_returns;
pub use scenarios::{
    RawScenarioSet, ScenarioMatrix, pregenerate_scenarios, pregenerate_scenarios_with_rng,
    seeded_rng,
};
pub use solver::{MIN_INITIAL_GUESS, PortfolioSolve, SolveIteration, SolverConfig, solve_initial_portfolio};
pub use stats::{
    BAND_PERCENTILES, FinalValueSummary, GuardrailComparison, PERCENTILES, PolicyMetrics,
    SimulationSummary, column_means, column_percentiles, compute_statistics, min_positive_per_row,
    percentile,
};
pub use sweep::{
    AllocationPoint, AllocationSweepConfig, RateSweep, TARGET_SUCCESS_RATES, TargetRate,
    allocation_grid, best_by_success, interpolate_targets, sweep_allocations,
    sweep_withdrawal_rates,
};
pub use table::{FALLBACK_RATE, SuccessRateTable};
pub use types::{
    ALLOCATION_TOLERANCE, AdjustmentMode, Allocation, AssetMix, BlockRange, CashFlowItem,
    ExpenseRatios, GuardrailConfig, HistoricalDataset, HistoricalReturnRecord, Leverage,
    MIN_HISTORY_YEARS, Matrix, RateGrid, ScenarioConfig, SimulationConfig, WithdrawalStrategy,
};
