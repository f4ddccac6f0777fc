use super::types::{Allocation, ExpenseRatios, HistoricalReturnRecord, Leverage};

/// Real (inflation-adjusted) portfolio return for every year of `records`.
///
/// `nominal = Σ weight * (return - expense)`; with leverage `L`,
/// `nominal = L * nominal - (L - 1) * (inflation + spread)`;
/// `real = (1 + nominal) / (1 + inflation) - 1`.
pub fn real_portfolio_returns(
    records: &[HistoricalReturnRecord],
    allocation: &Allocation,
    expenses: &ExpenseRatios,
    leverage: Leverage,
) -> Vec<f64> {
    records
        .iter()
        .map(|record| real_return(record, allocation, expenses, leverage))
        .collect()
}

pub(crate) fn real_return(
    record: &HistoricalReturnRecord,
    allocation: &Allocation,
    expenses: &ExpenseRatios,
    leverage: Leverage,
) -> f64 {
    let mut nominal = allocation.weighted_nominal_return(record, expenses);
    if leverage.is_levered() {
        let borrow_cost = record.inflation + leverage.borrowing_spread;
        nominal = leverage.ratio * nominal - (leverage.ratio - 1.0) * borrow_cost;
    }
    (1.0 + nominal) / (1.0 + record.inflation) - 1.0
}
