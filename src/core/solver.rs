use serde::Serialize;
use tracing::{debug, instrument, warn};

use super::engine::fixed_success_rate;
use super::error::{SimError, SimResult};
use super::scenarios::ScenarioMatrix;
use super::types::Matrix;

pub const MIN_INITIAL_GUESS: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverConfig {
    pub max_iterations: u32,
    pub tolerance: f64,
    pub max_expansions: u32,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            tolerance: 0.005,
            max_expansions: 10,
        }
    }
}

impl SolverConfig {
    fn validate(&self) -> SimResult<()> {
        if self.max_iterations == 0 {
            return Err(SimError::config("max_iterations must be > 0"));
        }
        if !self.tolerance.is_finite() || self.tolerance <= 0.0 {
            return Err(SimError::config("tolerance must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SolveIteration {
    pub iteration: u32,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub candidate_value: f64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioSolve {
    pub portfolio: f64,
    pub achieved_success_rate: f64,
    pub iterations: Vec<SolveIteration>,
    pub converged: bool,
    pub message: String,
}

/// Bisect on the starting portfolio until a fixed `annual_withdrawal` (plus the
/// per-path cash flows) succeeds on `target_success` of the scenarios.
///
/// The bracket starts at `[0.3, 3] × initial_guess` and widens by ×3 / ×0.3
/// until it contains the target. Without convergence the last midpoint is
/// returned with `converged = false`.
#[instrument(skip_all, fields(target = target_success, guess = initial_guess))]
pub fn solve_initial_portfolio(
    scenarios: &ScenarioMatrix,
    annual_withdrawal: f64,
    target_success: f64,
    cf_matrix: Option<&Matrix>,
    initial_guess: f64,
    config: SolverConfig,
) -> SimResult<PortfolioSolve> {
    config.validate()?;
    if !(0.0..=1.0).contains(&target_success) {
        return Err(SimError::config("target_success must be between 0 and 1"));
    }

    let success_at = |portfolio: f64| {
        fixed_success_rate(scenarios, portfolio, annual_withdrawal, cf_matrix)
    };

    let guess = if initial_guess.is_finite() {
        initial_guess.max(MIN_INITIAL_GUESS)
    } else {
        MIN_INITIAL_GUESS
    };
    let mut lo = guess * 0.3;
    let mut hi = guess * 3.0;
    for _ in 0..config.max_expansions {
        if success_at(hi) >= target_success {
            break;
        }
        hi *= 3.0;
    }
    for _ in 0..config.max_expansions {
        if success_at(lo) <= target_success {
            break;
        }
        lo *= 0.3;
    }

    let mut iterations = Vec::with_capacity(config.max_iterations as usize);
    let mut solved = None;
    for iteration in 1..=config.max_iterations {
        let mid = (lo + hi) * 0.5;
        let success_rate = success_at(mid);
        iterations.push(SolveIteration {
            iteration,
            lower_bound: lo,
            upper_bound: hi,
            candidate_value: mid,
            success_rate,
        });

        if (success_rate - target_success).abs() < config.tolerance {
            solved = Some((mid, success_rate));
            break;
        }
        if success_rate < target_success {
            lo = mid;
        } else {
            hi = mid;
        }
    }

    let converged = solved.is_some();
    let (portfolio, achieved_success_rate) = solved.unwrap_or_else(|| {
        let mid = (lo + hi) * 0.5;
        (mid, success_at(mid))
    });
    let message = if converged {
        "Solved initial portfolio.".to_string()
    } else {
        warn!(portfolio, achieved_success_rate, "bisection hit its iteration limit");
        "Reached max iterations before tolerance was met; returning bracket midpoint.".to_string()
    };
    debug!(portfolio, iterations = iterations.len(), converged, "portfolio solve finished");

    Ok(PortfolioSolve {
        portfolio,
        achieved_success_rate,
        iterations,
        converged,
        message,
    })
}
