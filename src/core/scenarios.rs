use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, instrument};

use super::bootstrap::block_bootstrap;
use super::error::{SimError, SimResult};
use super::portfolio::real_portfolio_returns;
use super::types::{
    Allocation, ExpenseRatios, HistoricalDataset, HistoricalReturnRecord, Leverage, MIN_HISTORY_YEARS,
    Matrix, ScenarioConfig,
};

pub fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawScenarioSet {
    retirement_years: usize,
    paths: Vec<Vec<HistoricalReturnRecord>>,
}

impl RawScenarioSet {
    pub fn generate<R: Rng + ?Sized>(
        history: &HistoricalDataset,
        config: &ScenarioConfig,
        rng: &mut R,
    ) -> SimResult<Self> {
        config.validate()?;
        history.require_rows(MIN_HISTORY_YEARS)?;
        let paths = (0..config.num_paths)
            .map(|_| {
                block_bootstrap(
                    history.records(),
                    config.retirement_years,
                    config.blocks,
                    rng,
                )
            })
            .collect::<SimResult<Vec<_>>>()?;
        Ok(Self {
            retirement_years: config.retirement_years,
            paths,
        })
    }

    pub fn num_paths(&self) -> usize {
        self.paths.len()
    }

    pub fn retirement_years(&self) -> usize {
        self.retirement_years
    }

    pub fn weighted(
        &self,
        allocation: &Allocation,
        expenses: &ExpenseRatios,
        leverage: Leverage,
    ) -> ScenarioMatrix {
        let returns = self
            .paths
            .iter()
            .map(|path| real_portfolio_returns(path, allocation, expenses, leverage))
            .collect();
        ScenarioMatrix {
            returns,
            inflation: self.inflation(),
        }
    }

    pub fn inflation(&self) -> Matrix {
        self.paths
            .iter()
            .map(|path| path.iter().map(|r| r.inflation).collect())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioMatrix {
    returns: Matrix,
    inflation: Matrix,
}

impl ScenarioMatrix {
    pub fn new(returns: Matrix, inflation: Matrix) -> SimResult<Self> {
        let years = returns.first().map_or(0, Vec::len);
        if returns.iter().any(|row| row.len() != years) {
            return Err(SimError::config("scenario rows must all have the same length"));
        }
        if inflation.len() != returns.len() || inflation.iter().any(|row| row.len() != years) {
            return Err(SimError::config(
                "inflation matrix must have the same shape as the return matrix",
            ));
        }
        Ok(Self { returns, inflation })
    }

    pub fn num_paths(&self) -> usize {
        self.returns.len()
    }

    pub fn years(&self) -> usize {
        self.returns.first().map_or(0, Vec::len)
    }

    pub fn returns(&self) -> &Matrix {
        &self.returns
    }

    pub fn inflation(&self) -> &Matrix {
        &self.inflation
    }
}

#[instrument(skip_all, fields(paths = config.num_paths, years = config.retirement_years))]
pub fn pregenerate_scenarios(
    history: &HistoricalDataset,
    config: &ScenarioConfig,
) -> SimResult<ScenarioMatrix> {
    let mut rng = seeded_rng(config.seed);
    pregenerate_scenarios_with_rng(history, config, &mut rng)
}

pub fn pregenerate_scenarios_with_rng<R: Rng + ?Sized>(
    history: &HistoricalDataset,
    config: &ScenarioConfig,
    rng: &mut R,
) -> SimResult<ScenarioMatrix> {
    let raw = RawScenarioSet::generate(history, config, rng)?;
    let matrix = raw.weighted(&config.allocation, &config.expense_ratios, config.leverage);
    debug!(
        paths = matrix.num_paths(),
        years = matrix.years(),
        "pre-generated return scenarios"
    );
    Ok(matrix)
}
