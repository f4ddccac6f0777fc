use serde::{Deserialize, Serialize};

use super::error::{SimError, SimResult};

pub const ALLOCATION_TOLERANCE: f64 = 0.01;
pub const MIN_HISTORY_YEARS: usize = 2;

pub type Matrix = Vec<Vec<f64>>;

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalReturnRecord {
    pub year: i32,
    pub domestic_equity: f64,
    pub international_equity: f64,
    pub bond: f64,
    pub inflation: f64,
}

impl HistoricalReturnRecord {
    fn is_finite(&self) -> bool {
        self.domestic_equity.is_finite()
            && self.international_equity.is_finite()
            && self.bond.is_finite()
            && self.inflation.is_finite()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalDataset {
    records: Vec<HistoricalReturnRecord>,
}

impl HistoricalDataset {
    pub fn new(records: Vec<HistoricalReturnRecord>) -> SimResult<Self> {
        if records.is_empty() {
            return Err(SimError::Dataset("no records".to_string()));
        }
        if let Some(bad) = records.iter().find(|r| !r.is_finite()) {
            return Err(SimError::Dataset(format!(
                "year {} contains a non-finite value",
                bad.year
            )));
        }
        for pair in records.windows(2) {
            if pair[1].year == pair[0].year {
                return Err(SimError::Dataset(format!("duplicate year {}", pair[1].year)));
            }
            if pair[1].year < pair[0].year {
                return Err(SimError::Dataset(format!(
                    "records are not sorted by year ({} follows {})",
                    pair[1].year, pair[0].year
                )));
            }
        }
        Ok(Self { records })
    }

    pub fn since(&self, start_year: i32) -> SimResult<Self> {
        let window = self.from_year(start_year);
        window.require_rows(MIN_HISTORY_YEARS)?;
        Ok(window)
    }

    pub fn replay_since(&self, start_year: i32) -> SimResult<Self> {
        let window = self.from_year(start_year);
        window.require_rows(1)?;
        Ok(window)
    }

    fn from_year(&self, start_year: i32) -> Self {
        let records = self
            .records
            .iter()
            .copied()
            .filter(|r| r.year >= start_year)
            .collect();
        Self { records }
    }

    pub fn require_rows(&self, min_rows: usize) -> SimResult<()> {
        if self.records.len() < min_rows {
            return Err(SimError::config(format!(
                "insufficient historical data: {} rows available, at least {min_rows} required",
                self.records.len()
            )));
        }
        Ok(())
    }

    pub fn records(&self) -> &[HistoricalReturnRecord] {
        &self.records
    }

    pub fn inflation(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.inflation).collect()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetMix {
    pub domestic_equity: f64,
    pub international_equity: f64,
    pub bond: f64,
}

pub type Allocation = AssetMix;
pub type ExpenseRatios = AssetMix;

impl AssetMix {
    pub const fn new(domestic_equity: f64, international_equity: f64, bond: f64) -> Self {
        Self {
            domestic_equity,
            international_equity,
            bond,
        }
    }

    pub const fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn total(&self) -> f64 {
        self.domestic_equity + self.international_equity + self.bond
    }

    fn values(&self) -> [f64; 3] {
        [self.domestic_equity, self.international_equity, self.bond]
    }

    pub fn validate_allocation(&self) -> SimResult<()> {
        if self.values().iter().any(|w| !w.is_finite() || !(0.0..=1.0).contains(w)) {
            return Err(SimError::config("allocation weights must be between 0 and 1"));
        }
        if (self.total() - 1.0).abs() > ALLOCATION_TOLERANCE {
            return Err(SimError::config(format!(
                "allocation weights must sum to 100%, got {:.2}%",
                self.total() * 100.0
            )));
        }
        Ok(())
    }

    pub fn validate_expenses(&self) -> SimResult<()> {
        if self.values().iter().any(|e| !e.is_finite() || *e < 0.0) {
            return Err(SimError::config("expense ratios must be finite and >= 0"));
        }
        Ok(())
    }

    pub(crate) fn weighted_nominal_return(
        &self,
        record: &HistoricalReturnRecord,
        expenses: &ExpenseRatios,
    ) -> f64 {
        self.domestic_equity * (record.domestic_equity - expenses.domestic_equity)
            + self.international_equity
                * (record.international_equity - expenses.international_equity)
            + self.bond * (record.bond - expenses.bond)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Leverage {
    pub ratio: f64,
    pub borrowing_spread: f64,
}

impl Default for Leverage {
    fn default() -> Self {
        Self::none()
    }
}

impl Leverage {
    pub const fn none() -> Self {
        Self {
            ratio: 1.0,
            borrowing_spread: 0.0,
        }
    }

    pub fn is_levered(&self) -> bool {
        self.ratio != 1.0
    }

    pub fn validate(&self) -> SimResult<()> {
        if !self.ratio.is_finite() || self.ratio <= 0.0 {
            return Err(SimError::config("leverage must be finite and > 0"));
        }
        if !self.borrowing_spread.is_finite() {
            return Err(SimError::config("borrowing spread must be finite"));
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub min: usize,
    pub max: usize,
}

impl BlockRange {
    pub const fn new(min: usize, max: usize) -> Self {
        Self { min, max }
    }

    pub fn validate(&self) -> SimResult<()> {
        if self.min == 0 {
            return Err(SimError::config("min_block must be >= 1"));
        }
        if self.min > self.max {
            return Err(SimError::config(format!(
                "min_block ({}) cannot exceed max_block ({})",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

fn default_cash_flow_name() -> String {
    "cash flow".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashFlowItem {
    #[serde(default = "default_cash_flow_name")]
    pub name: String,
    pub amount: f64,
    /// 1-indexed year of the retirement horizon.
    pub start_year: u32,
    pub duration: u32,
    /// `true`: amount is in year-0 purchasing power. `false`: fixed nominal dollars.
    #[serde(default = "default_true")]
    pub inflation_adjusted: bool,
}

impl CashFlowItem {
    pub fn real(name: &str, amount: f64, start_year: u32, duration: u32) -> Self {
        Self {
            name: name.to_string(),
            amount,
            start_year,
            duration,
            inflation_adjusted: true,
        }
    }

    pub fn nominal(name: &str, amount: f64, start_year: u32, duration: u32) -> Self {
        Self {
            inflation_adjusted: false,
            ..Self::real(name, amount, start_year, duration)
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum WithdrawalStrategy {
    Fixed,
    Dynamic { ceiling: f64, floor: f64 },
}

impl WithdrawalStrategy {
    pub fn validate(&self) -> SimResult<()> {
        if let WithdrawalStrategy::Dynamic { ceiling, floor } = *self {
            if !(0.0..=1.0).contains(&ceiling) || !(0.0..=1.0).contains(&floor) {
                return Err(SimError::config(
                    "dynamic ceiling and floor must be between 0 and 1",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentMode {
    Amount,
    SuccessRate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioConfig {
    pub allocation: Allocation,
    pub expense_ratios: ExpenseRatios,
    pub retirement_years: usize,
    pub blocks: BlockRange,
    pub num_paths: usize,
    pub leverage: Leverage,
    pub seed: Option<u64>,
}

impl ScenarioConfig {
    pub fn validate(&self) -> SimResult<()> {
        self.allocation.validate_allocation()?;
        self.expense_ratios.validate_expenses()?;
        self.blocks.validate()?;
        self.leverage.validate()?;
        if self.retirement_years == 0 {
            return Err(SimError::config("retirement_years must be >= 1"));
        }
        if self.num_paths == 0 {
            return Err(SimError::config("num_paths must be >= 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    pub scenario: ScenarioConfig,
    pub initial_portfolio: f64,
    pub annual_withdrawal: f64,
    pub strategy: WithdrawalStrategy,
    pub cash_flows: Vec<CashFlowItem>,
}

impl SimulationConfig {
    pub fn validate(&self) -> SimResult<()> {
        self.scenario.validate()?;
        self.strategy.validate()?;
        if !self.initial_portfolio.is_finite() || self.initial_portfolio <= 0.0 {
            return Err(SimError::config("initial_portfolio must be > 0"));
        }
        validate_withdrawal(self.annual_withdrawal)?;
        validate_cash_flows(&self.cash_flows)
    }

    pub fn initial_withdrawal_rate(&self) -> f64 {
        if self.initial_portfolio > 0.0 {
            self.annual_withdrawal / self.initial_portfolio
        } else {
            0.0
        }
    }
}

pub(crate) fn validate_withdrawal(annual_withdrawal: f64) -> SimResult<()> {
    if !annual_withdrawal.is_finite() || annual_withdrawal < 0.0 {
        return Err(SimError::config("annual_withdrawal must be >= 0"));
    }
    Ok(())
}

pub(crate) fn validate_cash_flows(cash_flows: &[CashFlowItem]) -> SimResult<()> {
    for cf in cash_flows {
        if !cf.amount.is_finite() {
            return Err(SimError::config(format!(
                "cash flow `{}` has a non-finite amount",
                cf.name
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct GuardrailConfig {
    pub annual_withdrawal: f64,
    pub target_success: f64,
    pub upper_guardrail: f64,
    pub lower_guardrail: f64,
    pub adjustment_pct: f64,
    pub adjustment_mode: AdjustmentMode,
    pub retirement_years: usize,
    pub min_remaining_years: usize,
    pub baseline_rate: f64,
}

impl GuardrailConfig {
    pub fn validate(&self) -> SimResult<()> {
        validate_withdrawal(self.annual_withdrawal)?;
        if !(self.target_success > 0.0 && self.target_success < 1.0) {
            return Err(SimError::config("target_success must be strictly between 0 and 1"));
        }
        if !(0.0..=1.0).contains(&self.lower_guardrail)
            || !(0.0..=1.0).contains(&self.upper_guardrail)
        {
            return Err(SimError::config("guardrails must be between 0 and 1"));
        }
        if self.lower_guardrail >= self.upper_guardrail {
            return Err(SimError::config(
                "lower_guardrail must be below upper_guardrail",
            ));
        }
        if !(self.adjustment_pct > 0.0 && self.adjustment_pct <= 1.0) {
            return Err(SimError::config("adjustment_pct must be in (0, 1]"));
        }
        if self.retirement_years == 0 {
            return Err(SimError::config("retirement_years must be >= 1"));
        }
        if self.min_remaining_years == 0 {
            return Err(SimError::config("min_remaining_years must be >= 1"));
        }
        if !self.baseline_rate.is_finite() || self.baseline_rate < 0.0 {
            return Err(SimError::config("baseline_rate must be >= 0"));
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateGrid {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl Default for RateGrid {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 0.15,
            step: 0.001,
        }
    }
}

impl RateGrid {
    pub const fn new(min: f64, max: f64, step: f64) -> Self {
        Self { min, max, step }
    }

    pub fn validate(&self) -> SimResult<()> {
        if !self.min.is_finite() || !self.max.is_finite() || !self.step.is_finite() {
            return Err(SimError::config("rate grid bounds must be finite"));
        }
        if self.min < 0.0 {
            return Err(SimError::config("rate grid minimum must be >= 0"));
        }
        if self.max < self.min {
            return Err(SimError::config("rate grid maximum must be >= minimum"));
        }
        if self.step <= 0.0 {
            return Err(SimError::config("rate grid step must be > 0"));
        }
        Ok(())
    }

    pub fn rates(&self) -> Vec<f64> {
        let count = ((self.max - self.min + self.step / 2.0) / self.step).ceil() as usize;
        (0..count.max(1))
            .map(|i| self.min + i as f64 * self.step)
            .collect()
    }
}
