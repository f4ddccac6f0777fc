use super::error::{SimError, SimResult};
use super::types::{CashFlowItem, Matrix};

/// Net real cash flow for each year of the horizon.
///
/// Inflation-adjusted items add their amount unchanged. Nominal items are divided
/// by the cumulative inflation factor `Π(1 + inflation[0..=t])`, so they need an
/// inflation series covering the horizon. Items starting outside `1..=retirement_years`
/// are skipped; overlapping items add up.
pub fn build_cf_schedule(
    cash_flows: &[CashFlowItem],
    retirement_years: usize,
    inflation: Option<&[f64]>,
) -> SimResult<Vec<f64>> {
    let mut schedule = vec![0.0; retirement_years];
    if cash_flows.is_empty() {
        return Ok(schedule);
    }

    let price_index = match cash_flows.iter().find(|cf| !cf.inflation_adjusted) {
        None => None,
        Some(nominal) => {
            let series = inflation.ok_or_else(|| SimError::MissingInflation {
                name: nominal.name.clone(),
            })?;
            if series.len() < retirement_years {
                return Err(SimError::InflationTooShort {
                    required: retirement_years,
                    actual: series.len(),
                });
            }
            Some(cumulative_inflation(&series[..retirement_years]))
        }
    };

    for cf in cash_flows {
        let Some((start, end)) = active_years(cf, retirement_years) else {
            continue;
        };
        if cf.inflation_adjusted {
            schedule[start..end]
                .iter_mut()
                .for_each(|slot| *slot += cf.amount);
        } else if let Some(index) = price_index.as_deref() {
            for t in start..end {
                schedule[t] += cf.amount / index[t];
            }
        }
    }

    Ok(schedule)
}

fn active_years(cf: &CashFlowItem, retirement_years: usize) -> Option<(usize, usize)> {
    let start = (cf.start_year as usize).checked_sub(1)?;
    if start >= retirement_years {
        return None;
    }
    let end = start.saturating_add(cf.duration as usize).min(retirement_years);
    Some((start, end))
}

fn cumulative_inflation(series: &[f64]) -> Vec<f64> {
    series
        .iter()
        .scan(1.0, |index, rate| {
            *index *= 1.0 + rate;
            Some(*index)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct CashFlowPlan {
    retirement_years: usize,
    fixed: Vec<f64>,
    nominal: Vec<CashFlowItem>,
}

impl CashFlowPlan {
    pub fn new(cash_flows: &[CashFlowItem], retirement_years: usize) -> Self {
        let (real, nominal): (Vec<_>, Vec<_>) = cash_flows
            .iter()
            .cloned()
            .partition(|cf| cf.inflation_adjusted);
        let fixed = build_cf_schedule(&real, retirement_years, None)
            .unwrap_or_else(|_| vec![0.0; retirement_years]);
        Self {
            retirement_years,
            fixed,
            nominal,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nominal.is_empty() && self.fixed.iter().all(|v| *v == 0.0)
    }

    pub fn has_nominal(&self) -> bool {
        !self.nominal.is_empty()
    }

    pub fn retirement_years(&self) -> usize {
        self.retirement_years
    }

    pub fn fixed_schedule(&self) -> &[f64] {
        &self.fixed
    }

    pub fn schedule_for(&self, inflation: Option<&[f64]>) -> SimResult<Vec<f64>> {
        if !self.has_nominal() {
            return Ok(self.fixed.clone());
        }
        let nominal = build_cf_schedule(&self.nominal, self.retirement_years, inflation)?;
        Ok(self.fixed.iter().zip(&nominal).map(|(a, b)| a + b).collect())
    }

    pub fn schedule_matrix(
        &self,
        num_paths: usize,
        inflation: Option<&Matrix>,
    ) -> SimResult<Option<Matrix>> {
        if self.is_empty() {
            return Ok(None);
        }
        if !self.has_nominal() {
            return Ok(Some(vec![self.fixed.clone(); num_paths]));
        }
        let Some(inflation) = inflation else {
            return Err(SimError::MissingInflation {
                name: self.nominal[0].name.clone(),
            });
        };
        (0..num_paths)
            .map(|i| {
                let row = inflation.get(i).map(Vec::as_slice);
                self.schedule_for(row)
            })
            .collect::<SimResult<Vec<_>>>()
            .map(Some)
    }
}
