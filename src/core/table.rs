#[cfg(feature = "parallel")]
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, instrument};

use super::error::{SimError, SimResult};
use super::scenarios::ScenarioMatrix;
use super::types::{Matrix, RateGrid};

pub const FALLBACK_RATE: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessRateTable {
    rates: Vec<f64>,
    table: Matrix,
}

impl SuccessRateTable {
    #[instrument(skip_all, fields(paths = scenarios.num_paths(), years = scenarios.years()))]
    pub fn build(scenarios: &ScenarioMatrix, grid: RateGrid) -> SimResult<Self> {
        grid.validate()?;
        let rates = grid.rates();
        let returns = scenarios.returns();

        #[cfg(feature = "parallel")]
        let table: Matrix = rates
            .par_iter()
            .map(|rate| survival_curve(returns, *rate))
            .collect();
        #[cfg(not(feature = "parallel"))]
        let table: Matrix = rates
            .iter()
            .map(|rate| survival_curve(returns, *rate))
            .collect();

        debug!(rows = rates.len(), "built success-rate table");
        Ok(Self { rates, table })
    }

    pub fn from_rows(rates: Vec<f64>, table: Matrix) -> SimResult<Self> {
        if rates.is_empty() || rates.len() != table.len() {
            return Err(SimError::config("table needs one non-empty row per grid rate"));
        }
        let width = table[0].len();
        if width == 0 || table.iter().any(|row| row.len() != width) {
            return Err(SimError::config("table rows must share a non-zero width"));
        }
        if rates.windows(2).any(|w| w[1] <= w[0]) {
            return Err(SimError::config("grid rates must be strictly increasing"));
        }
        Ok(Self { rates, table })
    }

    pub fn rates(&self) -> &[f64] {
        &self.rates
    }

    pub fn rows(&self) -> &Matrix {
        &self.table
    }

    pub fn max_years(&self) -> usize {
        self.table.first().map_or(0, |row| row.len().saturating_sub(1))
    }

    pub fn smallest_positive_rate(&self) -> f64 {
        self.rates
            .iter()
            .copied()
            .find(|r| *r > 0.0)
            .unwrap_or(FALLBACK_RATE)
    }

    pub fn lookup(&self, rate: f64, remaining_years: usize) -> f64 {
        let col = remaining_years.min(self.max_years());
        let last = self.rates.len() - 1;
        if last == 0 {
            return self.table[0][col];
        }

        let rate = rate.clamp(self.rates[0], self.rates[last]);
        let i = self
            .rates
            .partition_point(|g| *g < rate)
            .saturating_sub(1)
            .min(last - 1);
        let (r0, r1) = (self.rates[i], self.rates[i + 1]);
        let (p0, p1) = (self.table[i][col], self.table[i + 1][col]);
        let frac = if r1 > r0 { (rate - r0) / (r1 - r0) } else { 0.0 };
        p0 + frac * (p1 - p0)
    }

    /// Withdrawal rate whose success probability equals `target`.
    ///
    /// Returns 0.0 when even the lowest grid rate misses the target, and the
    /// highest grid rate when every rate meets it.
    pub fn rate_for_target(&self, target: f64, remaining_years: usize) -> f64 {
        let col = remaining_years.max(1).min(self.max_years());
        let column: Vec<f64> = self.table.iter().map(|row| row[col]).collect();
        rate_at_success(&self.rates, &column, target).unwrap_or(0.0)
    }
}

fn survival_curve(returns: &Matrix, rate: f64) -> Vec<f64> {
    let num_paths = returns.len();
    let years = returns.first().map_or(0, Vec::len);
    let mut values = vec![1.0; num_paths];
    let mut curve = Vec::with_capacity(years + 1);
    curve.push(1.0);

    for year in 0..years {
        let mut alive = 0_usize;
        for (value, path) in values.iter_mut().zip(returns) {
            if *value <= 0.0 {
                continue;
            }
            *value = *value * (1.0 + path[year]) - rate;
            if *value > 0.0 {
                alive += 1;
            } else {
                *value = 0.0;
            }
        }
        curve.push(if num_paths == 0 {
            0.0
        } else {
            alive as f64 / num_paths as f64
        });
    }
    curve
}

/// Rate where a non-increasing `success` curve crosses `target`.
///
/// `None` when the target is above the whole curve; the last rate when the
/// target is at or below its minimum.
pub(crate) fn rate_at_success(rates: &[f64], success: &[f64], target: f64) -> Option<f64> {
    let (first, last) = (*success.first()?, *success.last()?);
    if target > first {
        return None;
    }
    if target <= last {
        return rates.last().copied();
    }
    let crossing = success
        .windows(2)
        .position(|w| w[0] >= target && target > w[1]);
    Some(match crossing {
        Some(i) => {
            let (hi, lo) = (success[i], success[i + 1]);
            let frac = (target - lo) / (hi - lo);
            rates[i + 1] + frac * (rates[i] - rates[i + 1])
        }
        None => rates[0],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixtures::{assert_approx_tol, sample_history, scenario_config};
    use crate::core::scenarios::pregenerate_scenarios;
    use proptest::collection::vec;
    use proptest::prelude::{prop_assert, proptest};

    fn sample_table() -> SuccessRateTable {
        let scenarios =
            pregenerate_scenarios(&sample_history(), &scenario_config(30, 300)).expect("scenarios");
        SuccessRateTable::build(&scenarios, RateGrid::default()).expect("table")
    }

    fn flat(returns: Vec<Vec<f64>>) -> ScenarioMatrix {
        let inflation = returns.iter().map(|r| vec![0.0; r.len()]).collect();
        ScenarioMatrix::new(returns, inflation).expect("matrix")
    }

    #[test]
    fn shape_and_first_column() {
        let table = sample_table();
        assert_eq!(table.rates().len(), 151);
        assert_eq!(table.max_years(), 30);
        assert!(table.rows().iter().all(|row| row.len() == 31));
        assert!(table.rows().iter().all(|row| row[0] == 1.0));
    }

    #[test]
    fn rate_zero_row_never_fails_for_positive_growth_factors() {
        let table = sample_table();
        assert!(table.rows()[0].iter().all(|p| *p == 1.0));
    }

    #[test]
    fn columns_fall_as_rate_rises() {
        let table = sample_table();
        for year in 0..=table.max_years() {
            for pair in table.rows().windows(2) {
                assert!(pair[1][year] <= pair[0][year]);
            }
        }
    }

    #[test]
    fn lookup_hits_grid_points_and_clamps() {
        let table = sample_table();
        assert_approx_tol(table.lookup(0.05, 20), table.rows()[50][20], 1e-9);
        assert_eq!(table.lookup(-1.0, 20), table.rows()[0][20]);
        assert_approx_tol(table.lookup(0.5, 20), table.rows()[150][20], 1e-12);
        assert_approx_tol(table.lookup(0.05, 99), table.rows()[50][30], 1e-9);

        let mid = table.lookup(0.0505, 20);
        let (a, b) = (table.rows()[50][20], table.rows()[51][20]);
        assert_approx_tol(mid, (a + b) / 2.0, 1e-9);
    }

    #[test]
    fn inverse_lookup_round_trips_inside_the_table() {
        let table = sample_table();
        for years in [5, 15, 30] {
            let column: Vec<f64> = table.rows().iter().map(|row| row[years]).collect();
            let (top, bottom) = (column[0], column[column.len() - 1]);
            for target in [0.99, 0.95, 0.9, 0.8, 0.6, 0.5, 0.3] {
                if target >= top || target <= bottom {
                    continue;
                }
                let rate = table.rate_for_target(target, years);
                assert_approx_tol(table.lookup(rate, years), target, 1e-6);
            }
        }
    }

    #[test]
    fn inverse_lookup_boundaries() {
        let booming = SuccessRateTable::build(
            &flat(vec![vec![1.0; 10]; 3]),
            RateGrid::default(),
        )
        .expect("table");
        assert_approx_tol(booming.rate_for_target(0.8, 10), 0.15, 1e-12);

        let wiped = SuccessRateTable::build(
            &flat(vec![vec![-1.0; 10], vec![0.05; 10]]),
            RateGrid::default(),
        )
        .expect("table");
        assert_eq!(wiped.rows()[0][1], 0.5);
        assert_eq!(wiped.rate_for_target(0.8, 10), 0.0);
    }

    #[test]
    fn inverse_lookup_clamps_years_to_at_least_one() {
        let table = sample_table();
        assert_eq!(table.rate_for_target(0.8, 0), table.rate_for_target(0.8, 1));
    }

    #[test]
    fn smallest_positive_rate_skips_zero() {
        let table = SuccessRateTable::build(&flat(vec![vec![0.0; 3]]), RateGrid::new(0.0, 0.02, 0.01))
            .expect("table");
        assert_approx_tol(table.smallest_positive_rate(), 0.01, 1e-12);

        let zero_only = SuccessRateTable::from_rows(vec![0.0], vec![vec![1.0, 1.0]]).expect("table");
        assert_eq!(zero_only.smallest_positive_rate(), FALLBACK_RATE);
        assert_eq!(zero_only.lookup(0.3, 1), 1.0);
    }

    #[test]
    fn crossing_interpolation_rules() {
        let rates = [0.01, 0.02, 0.03, 0.04];
        let success = [1.0, 0.9, 0.7, 0.5];
        assert_eq!(rate_at_success(&rates, &success, 1.01), None);
        assert_eq!(rate_at_success(&rates, &success, 0.5), Some(0.04));
        assert_eq!(rate_at_success(&rates, &success, 0.2), Some(0.04));
        assert_approx_tol(rate_at_success(&rates, &success, 0.8).expect("rate"), 0.025, 1e-12);
        assert_approx_tol(rate_at_success(&rates, &success, 0.9).expect("rate"), 0.02, 1e-12);
        assert_eq!(rate_at_success(&rates, &[], 0.5), None);
    }

    #[test]
    fn from_rows_rejects_mismatched_shapes() {
        assert!(SuccessRateTable::from_rows(vec![0.0, 0.01], vec![vec![1.0]]).is_err());
        assert!(SuccessRateTable::from_rows(vec![0.01, 0.0], vec![vec![1.0], vec![1.0]]).is_err());
    }

    proptest! {
        #[test]
        fn prop_table_columns_are_monotone(
            returns in vec(vec(-0.4_f64..0.4, 8), 1..12),
        ) {
            let table = SuccessRateTable::build(&flat(returns), RateGrid::new(0.0, 0.2, 0.01))
                .expect("table");
            for row in table.rows() {
                prop_assert!(row[0] == 1.0);
                prop_assert!(row.windows(2).all(|w| w[1] <= w[0]));
            }
            for pair in table.rows().windows(2) {
                prop_assert!(pair[0].iter().zip(&pair[1]).all(|(a, b)| b <= a));
            }
        }
    }
}
