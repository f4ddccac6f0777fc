use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use super::types::{
    AssetMix, BlockRange, HistoricalDataset, HistoricalReturnRecord, Leverage, ScenarioConfig,
    SimulationConfig, WithdrawalStrategy,
};

pub(crate) fn sample_history() -> HistoricalDataset {
    let mut rng = StdRng::seed_from_u64(42);
    let normal = |mean: f64, sd: f64| Normal::new(mean, sd).expect("valid normal");
    let (us, intl, bond, infl) = (
        normal(0.10, 0.15),
        normal(0.08, 0.18),
        normal(0.04, 0.05),
        normal(0.03, 0.01),
    );
    let records = (0..20)
        .map(|i| HistoricalReturnRecord {
            year: 2000 + i,
            domestic_equity: us.sample(&mut rng),
            international_equity: intl.sample(&mut rng),
            bond: bond.sample(&mut rng),
            inflation: infl.sample(&mut rng),
        })
        .collect();
    HistoricalDataset::new(records).expect("synthetic history is valid")
}

pub(crate) fn default_allocation() -> AssetMix {
    AssetMix::new(0.4, 0.4, 0.2)
}

pub(crate) fn default_expenses() -> AssetMix {
    AssetMix::new(0.005, 0.005, 0.005)
}

pub(crate) fn scenario_config(retirement_years: usize, num_paths: usize) -> ScenarioConfig {
    ScenarioConfig {
        allocation: default_allocation(),
        expense_ratios: default_expenses(),
        retirement_years,
        blocks: BlockRange::new(2, 4),
        num_paths,
        leverage: Leverage::none(),
        seed: Some(42),
    }
}

pub(crate) fn simulation_config() -> SimulationConfig {
    SimulationConfig {
        scenario: scenario_config(10, 50),
        initial_portfolio: 1_000_000.0,
        annual_withdrawal: 40_000.0,
        strategy: WithdrawalStrategy::Fixed,
        cash_flows: Vec::new(),
    }
}

pub(crate) fn assert_approx_tol(actual: f64, expected: f64, tol: f64) {
    assert!(
        (actual - expected).abs() <= tol,
        "expected {expected}, got {actual}, tolerance {tol}"
    );
}
