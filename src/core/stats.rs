use std::collections::BTreeMap;

use serde::Serialize;

use super::types::Matrix;

pub const PERCENTILES: [u8; 7] = [5, 10, 25, 50, 75, 90, 95];
pub const BAND_PERCENTILES: [u8; 5] = [10, 25, 50, 75, 90];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalValueSummary {
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub percentiles: BTreeMap<u8, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationSummary {
    pub success_rate: f64,
    pub percentile_trajectories: BTreeMap<u8, Vec<f64>>,
    pub final_values: FinalValueSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub withdrawal_percentiles: Option<BTreeMap<u8, Vec<f64>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub withdrawal_mean: Option<Vec<f64>>,
}

pub fn compute_statistics(trajectories: &Matrix, withdrawals: Option<&Matrix>) -> SimulationSummary {
    SimulationSummary {
        success_rate: success_rate(trajectories),
        percentile_trajectories: column_percentiles(trajectories, &PERCENTILES),
        final_values: final_value_summary(&final_column(trajectories)),
        withdrawal_percentiles: withdrawals.map(|w| column_percentiles(w, &PERCENTILES)),
        withdrawal_mean: withdrawals.map(column_means),
    }
}

pub fn success_rate(trajectories: &Matrix) -> f64 {
    if trajectories.is_empty() {
        return 0.0;
    }
    let survived = final_column(trajectories).iter().filter(|v| **v > 0.0).count();
    survived as f64 / trajectories.len() as f64
}

pub fn column_percentiles(matrix: &Matrix, percentiles: &[u8]) -> BTreeMap<u8, Vec<f64>> {
    let mut columns: Vec<Vec<f64>> = (0..width(matrix)).map(|j| column(matrix, j)).collect();
    percentiles
        .iter()
        .map(|p| {
            let series = columns
                .iter_mut()
                .map(|col| percentile(col, f64::from(*p)))
                .collect();
            (*p, series)
        })
        .collect()
}

pub fn column_means(matrix: &Matrix) -> Vec<f64> {
    (0..width(matrix)).map(|j| mean(&column(matrix, j))).collect()
}

fn final_value_summary(finals: &[f64]) -> FinalValueSummary {
    let mut sorted = finals.to_vec();
    let percentiles = PERCENTILES
        .iter()
        .map(|p| (*p, percentile(&mut sorted, f64::from(*p))))
        .collect();
    FinalValueSummary {
        mean: mean(finals),
        median: percentile(&mut sorted, 50.0),
        min: sorted.first().copied().unwrap_or(0.0),
        max: sorted.last().copied().unwrap_or(0.0),
        percentiles,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyMetrics {
    pub success_rate: f64,
    pub median_total_consumption: f64,
    pub median_final_value: f64,
    pub p10_min_withdrawal: f64,
    pub median_final_withdrawal: f64,
}

impl PolicyMetrics {
    pub fn from_run(trajectories: &Matrix, withdrawals: &Matrix) -> Self {
        let mut totals: Vec<f64> = withdrawals.iter().map(|row| row.iter().sum()).collect();
        let mut mins = min_positive_per_row(withdrawals);
        let mut finals = final_column(trajectories);
        let mut last_withdrawals = final_column(withdrawals);
        Self {
            success_rate: success_rate(trajectories),
            median_total_consumption: percentile(&mut totals, 50.0),
            median_final_value: percentile(&mut finals, 50.0),
            p10_min_withdrawal: percentile(&mut mins, 10.0),
            median_final_withdrawal: percentile(&mut last_withdrawals, 50.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardrailComparison {
    pub guardrail: PolicyMetrics,
    pub baseline: PolicyMetrics,
}

pub fn min_positive_per_row(matrix: &Matrix) -> Vec<f64> {
    matrix
        .iter()
        .map(|row| {
            row.iter()
                .copied()
                .filter(|v| *v > 0.0)
                .min_by(f64::total_cmp)
                .unwrap_or(0.0)
        })
        .collect()
}

pub fn percentile(values: &mut [f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    values.sort_by(|a, b| a.total_cmp(b));

    let n = values.len();
    if n == 1 {
        return values[0];
    }

    let rank = (p / 100.0) * (n as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    if lower == upper {
        values[lower]
    } else {
        let w = rank - lower as f64;
        values[lower] * (1.0 - w) + values[upper] * w
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn width(matrix: &Matrix) -> usize {
    matrix.first().map_or(0, Vec::len)
}

fn column(matrix: &Matrix, j: usize) -> Vec<f64> {
    matrix.iter().map(|row| row[j]).collect()
}

fn final_column(matrix: &Matrix) -> Vec<f64> {
    matrix.iter().filter_map(|row| row.last().copied()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixtures::assert_approx_tol;

    #[test]
    fn percentile_interpolates_between_points() {
        let mut values = vec![1.0, 2.0, 3.0, 4.0];
        assert_approx_tol(percentile(&mut values, 25.0), 1.75, 1e-12);
        assert_approx_tol(percentile(&mut values, 50.0), 2.5, 1e-12);
        assert_eq!(percentile(&mut [], 50.0), 0.0);
    }

    #[test]
    fn summary_of_small_run() {
        let trajectories = vec![
            vec![100.0, 110.0, 120.0],
            vec![100.0, 50.0, 0.0],
            vec![100.0, 90.0, 80.0],
            vec![100.0, 100.0, 100.0],
        ];
        let withdrawals = vec![
            vec![10.0, 10.0],
            vec![10.0, 0.0],
            vec![10.0, 10.0],
            vec![10.0, 10.0],
        ];
        let summary = compute_statistics(&trajectories, Some(&withdrawals));

        assert_approx_tol(summary.success_rate, 0.75, 1e-12);
        assert_eq!(summary.percentile_trajectories.len(), PERCENTILES.len());
        assert!(summary.percentile_trajectories.values().all(|s| s.len() == 3));
        assert_eq!(summary.percentile_trajectories[&50][0], 100.0);
        assert_approx_tol(summary.final_values.mean, 75.0, 1e-12);
        assert_approx_tol(summary.final_values.median, 90.0, 1e-12);
        assert_eq!(summary.final_values.min, 0.0);
        assert_eq!(summary.final_values.max, 120.0);
        assert_eq!(summary.withdrawal_mean, Some(vec![10.0, 7.5]));
        let withdrawal_bands = summary.withdrawal_percentiles.expect("withdrawals");
        assert_eq!(withdrawal_bands[&50], vec![10.0, 10.0]);
    }

    #[test]
    fn percentile_series_are_ordered() {
        let trajectories: Matrix = (0..30)
            .map(|i| vec![1.0, i as f64, (i * i) as f64])
            .collect();
        let bands = column_percentiles(&trajectories, &PERCENTILES);
        for pair in PERCENTILES.windows(2) {
            for (lo, hi) in bands[&pair[0]].iter().zip(&bands[&pair[1]]) {
                assert!(lo <= hi);
            }
        }
    }

    #[test]
    fn policy_metrics_skip_ruined_years_in_minimum() {
        let trajectories = vec![vec![100.0, 50.0, 0.0], vec![100.0, 95.0, 90.0]];
        let withdrawals = vec![vec![40.0, 0.0], vec![5.0, 6.0]];
        assert_eq!(min_positive_per_row(&withdrawals), vec![40.0, 5.0]);
        assert_eq!(min_positive_per_row(&[vec![0.0, -1.0]].to_vec()), vec![0.0]);

        let metrics = PolicyMetrics::from_run(&trajectories, &withdrawals);
        assert_approx_tol(metrics.success_rate, 0.5, 1e-12);
        assert_approx_tol(metrics.median_total_consumption, 25.5, 1e-12);
        assert_approx_tol(metrics.median_final_value, 45.0, 1e-12);
        assert_approx_tol(metrics.median_final_withdrawal, 3.0, 1e-12);
    }

    #[test]
    fn empty_run_does_not_panic() {
        let summary = compute_statistics(&Vec::new(), None);
        assert_eq!(summary.success_rate, 0.0);
        assert_eq!(summary.final_values.max, 0.0);
        assert!(summary.withdrawal_mean.is_none());
    }
}
