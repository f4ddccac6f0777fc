use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::core::{
    AdjustmentMode, AllocationPoint, AllocationSweepConfig, AssetMix, BAND_PERCENTILES,
    BacktestResult, BlockRange, CashFlowItem, GuardrailComparison, GuardrailConfig,
    HistoricalDataset, HistoricalReturnRecord, Leverage, Matrix, PolicyMetrics, PortfolioSolve,
    RateGrid, RateSweep, RawScenarioSet, ScenarioConfig, SimError, SimulationConfig,
    SimulationSummary, SuccessRateTable, TargetRate, WithdrawalStrategy, best_by_success,
    column_percentiles, compute_statistics, pregenerate_scenarios, real_portfolio_returns,
    run_fixed_baseline, run_guardrail_simulation, run_historical_backtest, run_simulation,
    seeded_rng, sweep_allocations, sweep_withdrawal_rates,
};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Sim(#[from] SimError),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Request(String),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliWithdrawalStrategy {
    Fixed,
    Dynamic,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiWithdrawalStrategy {
    #[serde(alias = "constant")]
    Fixed,
    #[serde(alias = "vanguard", alias = "vanguard-dynamic", alias = "vanguardDynamic")]
    Dynamic,
}

impl From<CliWithdrawalStrategy> for ApiWithdrawalStrategy {
    fn from(value: CliWithdrawalStrategy) -> Self {
        match value {
            CliWithdrawalStrategy::Fixed => ApiWithdrawalStrategy::Fixed,
            CliWithdrawalStrategy::Dynamic => ApiWithdrawalStrategy::Dynamic,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "firesim",
    about = "Historical block-bootstrap Monte Carlo for retirement withdrawals (fixed, dynamic and risk-based guardrails)"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Success rate, percentile trajectories and withdrawals for one plan
    Simulate(RunArgs),
    /// Success rate across a grid of withdrawal rates
    Sweep(RunArgs),
    /// Success rate across every allocation on a grid
    AllocationSweep(RunArgs),
    /// Risk-based guardrails against a fixed-rate baseline
    Guardrail(RunArgs),
    /// Guardrails and the baseline replayed over actual history
    Backtest(RunArgs),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Analysis {
    Simulate,
    Sweep,
    AllocationSweep,
    Guardrail,
    Backtest,
}

impl Command {
    fn into_parts(self) -> (Analysis, RunArgs) {
        match self {
            Command::Simulate(args) => (Analysis::Simulate, args),
            Command::Sweep(args) => (Analysis::Sweep, args),
            Command::AllocationSweep(args) => (Analysis::AllocationSweep, args),
            Command::Guardrail(args) => (Analysis::Guardrail, args),
            Command::Backtest(args) => (Analysis::Backtest, args),
        }
    }
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    #[arg(long, help = "JSON array of yearly return records")]
    dataset: PathBuf,
    #[arg(long, help = "JSON request; omitted fields take their defaults")]
    request: Option<PathBuf>,
    #[arg(long, help = "Overrides the request seed")]
    seed: Option<u64>,
    #[arg(long, help = "Overrides the number of simulated paths")]
    simulations: Option<usize>,
    #[arg(long, value_enum, help = "Overrides the withdrawal strategy")]
    strategy: Option<CliWithdrawalStrategy>,
    #[arg(long, default_value_t = false, help = "Pretty-print the JSON response")]
    pretty: bool,
}

impl RunArgs {
    fn apply(&self, request: &mut Request) {
        if let Some(v) = self.seed {
            request.seed = Some(v);
        }
        if let Some(v) = self.simulations {
            request.num_simulations = v;
        }
        if let Some(v) = self.strategy {
            request.withdrawal_strategy = v.into();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Request {
    initial_portfolio: f64,
    annual_withdrawal: f64,
    allocation: AssetMix,
    expense_ratios: AssetMix,
    retirement_years: usize,
    min_block: usize,
    max_block: usize,
    num_simulations: usize,
    data_start_year: i32,
    seed: Option<u64>,

    withdrawal_strategy: ApiWithdrawalStrategy,
    dynamic_ceiling: f64,
    dynamic_floor: f64,

    leverage: f64,
    borrowing_spread: f64,
    cash_flows: Vec<CashFlowItem>,

    rate_max: f64,
    rate_step: f64,
    allocation_step: f64,

    target_success: f64,
    upper_guardrail: f64,
    lower_guardrail: f64,
    adjustment_pct: f64,
    adjustment_mode: AdjustmentMode,
    min_remaining_years: usize,
    baseline_rate: f64,

    backtest_start_year: i32,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            initial_portfolio: 1_000_000.0,
            annual_withdrawal: 40_000.0,
            allocation: AssetMix::new(0.4, 0.4, 0.2),
            expense_ratios: AssetMix::new(0.005, 0.005, 0.005),
            retirement_years: 65,
            min_block: 5,
            max_block: 15,
            num_simulations: 2_000,
            data_start_year: 1926,
            seed: None,
            withdrawal_strategy: ApiWithdrawalStrategy::Fixed,
            dynamic_ceiling: 0.05,
            dynamic_floor: 0.025,
            leverage: 1.0,
            borrowing_spread: 0.02,
            cash_flows: Vec::new(),
            rate_max: 0.12,
            rate_step: 0.001,
            allocation_step: 0.1,
            target_success: 0.80,
            upper_guardrail: 0.99,
            lower_guardrail: 0.50,
            adjustment_pct: 0.50,
            adjustment_mode: AdjustmentMode::Amount,
            min_remaining_years: 10,
            baseline_rate: 0.033,
            backtest_start_year: 1990,
        }
    }
}

impl Request {
    fn strategy(&self) -> WithdrawalStrategy {
        match self.withdrawal_strategy {
            ApiWithdrawalStrategy::Fixed => WithdrawalStrategy::Fixed,
            ApiWithdrawalStrategy::Dynamic => WithdrawalStrategy::Dynamic {
                ceiling: self.dynamic_ceiling,
                floor: self.dynamic_floor,
            },
        }
    }

    fn leverage(&self) -> Leverage {
        Leverage {
            ratio: self.leverage,
            borrowing_spread: self.borrowing_spread,
        }
    }

    fn scenario_config(&self) -> ScenarioConfig {
        ScenarioConfig {
            allocation: self.allocation,
            expense_ratios: self.expense_ratios,
            retirement_years: self.retirement_years,
            blocks: BlockRange::new(self.min_block, self.max_block),
            num_paths: self.num_simulations,
            leverage: self.leverage(),
            seed: self.seed,
        }
    }

    fn simulation_config(&self) -> SimulationConfig {
        SimulationConfig {
            scenario: self.scenario_config(),
            initial_portfolio: self.initial_portfolio,
            annual_withdrawal: self.annual_withdrawal,
            strategy: self.strategy(),
            cash_flows: self.cash_flows.clone(),
        }
    }

    fn guardrail_config(&self) -> GuardrailConfig {
        GuardrailConfig {
            annual_withdrawal: self.annual_withdrawal,
            target_success: self.target_success,
            upper_guardrail: self.upper_guardrail,
            lower_guardrail: self.lower_guardrail,
            adjustment_pct: self.adjustment_pct,
            adjustment_mode: self.adjustment_mode,
            retirement_years: self.retirement_years,
            min_remaining_years: self.min_remaining_years,
            baseline_rate: self.baseline_rate,
        }
    }

    fn sweep_grid(&self) -> RateGrid {
        RateGrid::new(0.0, self.rate_max, self.rate_step)
    }

    fn history(&self, dataset: &HistoricalDataset) -> Result<HistoricalDataset, ApiError> {
        Ok(dataset.since(self.data_start_year)?)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SimulateResponse {
    initial_withdrawal_rate: f64,
    #[serde(flatten)]
    summary: SimulationSummary,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SweepResponse {
    #[serde(flatten)]
    sweep: RateSweep,
    targets: Vec<TargetRate>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AllocationSweepResponse {
    results: Vec<AllocationPoint>,
    best_by_success: Option<AllocationPoint>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PolicyBands {
    trajectories: BTreeMap<u8, Vec<f64>>,
    withdrawals: BTreeMap<u8, Vec<f64>>,
}

impl PolicyBands {
    fn new(trajectories: &Matrix, withdrawals: &Matrix) -> Self {
        Self {
            trajectories: column_percentiles(trajectories, &BAND_PERCENTILES),
            withdrawals: column_percentiles(withdrawals, &BAND_PERCENTILES),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GuardrailResponse {
    initial_portfolio: f64,
    initial_withdrawal_rate: f64,
    baseline_annual_withdrawal: f64,
    guardrail: PolicyBands,
    baseline: PolicyBands,
    comparison: GuardrailComparison,
    #[serde(skip_serializing_if = "Option::is_none")]
    sizing: Option<PortfolioSolve>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BacktestResponse {
    years: Vec<i32>,
    initial_portfolio: f64,
    #[serde(flatten)]
    result: BacktestResult,
}

pub fn run(cli: Cli) -> Result<String, ApiError> {
    let (analysis, args) = cli.command.into_parts();
    let dataset = load_dataset(&args.dataset)?;
    let mut request = load_request(args.request.as_deref())?;
    args.apply(&mut request);

    let response = execute(analysis, &dataset, &request)?;
    let body = if args.pretty {
        serde_json::to_string_pretty(&response)?
    } else {
        serde_json::to_string(&response)?
    };
    Ok(body)
}

fn load_dataset(path: &Path) -> Result<HistoricalDataset, ApiError> {
    let raw = read_file(path)?;
    let records: Vec<HistoricalReturnRecord> = serde_json::from_str(&raw)?;
    Ok(HistoricalDataset::new(records)?)
}

fn load_request(path: Option<&Path>) -> Result<Request, ApiError> {
    match path {
        Some(path) => request_from_json(&read_file(path)?),
        None => Ok(Request::default()),
    }
}

fn read_file(path: &Path) -> Result<String, ApiError> {
    fs::read_to_string(path).map_err(|source| ApiError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn request_from_json(json: &str) -> Result<Request, ApiError> {
    let request: Request = serde_json::from_str(json)?;
    if request.backtest_start_year < request.data_start_year {
        return Err(ApiError::Request(
            "backtestStartYear must be >= dataStartYear".to_string(),
        ));
    }
    Ok(request)
}

fn execute(
    analysis: Analysis,
    dataset: &HistoricalDataset,
    request: &Request,
) -> Result<serde_json::Value, ApiError> {
    info!(
        ?analysis,
        paths = request.num_simulations,
        years = request.retirement_years,
        "running analysis"
    );
    let value = match analysis {
        Analysis::Simulate => serde_json::to_value(simulate(dataset, request)?)?,
        Analysis::Sweep => serde_json::to_value(sweep(dataset, request)?)?,
        Analysis::AllocationSweep => serde_json::to_value(allocation_sweep(dataset, request)?)?,
        Analysis::Guardrail => serde_json::to_value(guardrail(dataset, request)?)?,
        Analysis::Backtest => serde_json::to_value(backtest(dataset, request)?)?,
    };
    Ok(value)
}

fn simulate(dataset: &HistoricalDataset, request: &Request) -> Result<SimulateResponse, ApiError> {
    let history = request.history(dataset)?;
    let config = request.simulation_config();
    let run = run_simulation(&history, &config)?;
    let summary = compute_statistics(&run.trajectories, Some(&run.withdrawals));
    info!(success_rate = summary.success_rate, "simulation complete");
    Ok(SimulateResponse {
        initial_withdrawal_rate: config.initial_withdrawal_rate(),
        summary,
    })
}

fn sweep(dataset: &HistoricalDataset, request: &Request) -> Result<SweepResponse, ApiError> {
    let history = request.history(dataset)?;
    let scenarios = pregenerate_scenarios(&history, &request.scenario_config())?;
    let sweep = sweep_withdrawal_rates(
        &scenarios,
        request.initial_portfolio,
        request.sweep_grid(),
        request.strategy(),
        &request.cash_flows,
    )?;
    let targets = sweep.target_table(request.initial_portfolio, request.annual_withdrawal);
    info!(points = sweep.rates.len(), "rate sweep complete");
    Ok(SweepResponse { sweep, targets })
}

fn allocation_sweep(
    dataset: &HistoricalDataset,
    request: &Request,
) -> Result<AllocationSweepResponse, ApiError> {
    let history = request.history(dataset)?;
    let scenario = request.scenario_config();
    let raw = RawScenarioSet::generate(&history, &scenario, &mut seeded_rng(scenario.seed))?;
    let config = AllocationSweepConfig {
        expense_ratios: request.expense_ratios,
        leverage: request.leverage(),
        initial_portfolio: request.initial_portfolio,
        annual_withdrawal: request.annual_withdrawal,
        strategy: request.strategy(),
        cash_flows: request.cash_flows.clone(),
        step: request.allocation_step,
    };
    let results = sweep_allocations(&raw, &config)?;
    let best_by_success = best_by_success(&results).copied();
    info!(points = results.len(), "allocation sweep complete");
    Ok(AllocationSweepResponse {
        results,
        best_by_success,
    })
}

fn guardrail(dataset: &HistoricalDataset, request: &Request) -> Result<GuardrailResponse, ApiError> {
    let history = request.history(dataset)?;
    let config = request.guardrail_config();
    let scenarios = pregenerate_scenarios(&history, &request.scenario_config())?;
    let table = SuccessRateTable::build(&scenarios, RateGrid::default())?;
    let run = run_guardrail_simulation(&scenarios, &config, &table, &request.cash_flows)?;
    let baseline = run_fixed_baseline(
        &scenarios,
        run.initial_portfolio,
        config.baseline_rate,
        &request.cash_flows,
    )?;

    let comparison = GuardrailComparison {
        guardrail: PolicyMetrics::from_run(&run.trajectories, &run.withdrawals),
        baseline: PolicyMetrics::from_run(&baseline.trajectories, &baseline.withdrawals),
    };
    info!(
        initial_portfolio = run.initial_portfolio,
        guardrail_success = comparison.guardrail.success_rate,
        baseline_success = comparison.baseline.success_rate,
        "guardrail simulation complete"
    );
    Ok(GuardrailResponse {
        initial_portfolio: run.initial_portfolio,
        initial_withdrawal_rate: run.initial_withdrawal_rate(config.annual_withdrawal),
        baseline_annual_withdrawal: run.initial_portfolio * config.baseline_rate,
        guardrail: PolicyBands::new(&run.trajectories, &run.withdrawals),
        baseline: PolicyBands::new(&baseline.trajectories, &baseline.withdrawals),
        comparison,
        sizing: run.sizing,
    })
}

fn backtest(dataset: &HistoricalDataset, request: &Request) -> Result<BacktestResponse, ApiError> {
    let history = request.history(dataset)?;
    let scenarios = pregenerate_scenarios(&history, &request.scenario_config())?;
    let table = SuccessRateTable::build(&scenarios, RateGrid::default())?;

    let replay = dataset.replay_since(request.backtest_start_year)?;
    let real_returns = real_portfolio_returns(
        replay.records(),
        &request.allocation,
        &request.expense_ratios,
        request.leverage(),
    );
    let inflation = replay.inflation();
    let result = run_historical_backtest(
        &real_returns,
        Some(&inflation),
        request.initial_portfolio,
        &request.guardrail_config(),
        &table,
        &request.cash_flows,
    )?;
    let years = replay
        .records()
        .iter()
        .take(result.years_simulated)
        .map(|r| r.year)
        .collect();
    info!(
        years = result.years_simulated,
        adjustments = result.adjustment_events.len(),
        "historical backtest complete"
    );
    Ok(BacktestResponse {
        years,
        initial_portfolio: request.initial_portfolio,
        result,
    })
}
