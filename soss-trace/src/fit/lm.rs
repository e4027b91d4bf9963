//! Levenberg-Marquardt optimizer with box constraints.
//!
//! Each step is solved over the free parameters only. A parameter sitting on a
//! bound is held fixed while its gradient, or its solved step, points out of
//! the box; the remaining parameters are re-solved without it. Trial points are
//! then projected into the bounds. Damping uses Marquardt's diagonal scaling so
//! that parameters spanning many orders of magnitude (pixel positions next to
//! amplitudes of 1e5) take comparable steps.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::{FitError, ParamBounds};

/// Smallest diagonal entry used when scaling the damping term
const DIAG_FLOOR: f64 = 1e-12;

/// Lower limit on the damping parameter after successful steps
const MIN_LAMBDA: f64 = 1e-12;

/// A model that can be fit to (x, y) samples.
pub trait ProfileModel {
    /// Number of free parameters
    fn n_params(&self) -> usize;

    /// Evaluate the model at `x`
    fn evaluate(&self, x: f64, params: &[f64]) -> f64;

    /// Partial derivatives with respect to each parameter at `x`, written to `out`
    fn gradient(&self, x: f64, params: &[f64], out: &mut [f64]);
}

/// Configuration for Levenberg-Marquardt optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LmConfig {
    /// Maximum number of outer iterations; `None` allows 100 per parameter
    pub max_iterations: Option<usize>,
    /// Relative parameter step below which the fit is considered converged
    pub xtol: f64,
    /// Relative chi-square decrease below which the fit is considered converged
    pub ftol: f64,
    /// Largest cosine between a free Jacobian column and the residuals at convergence
    pub gtol: f64,
    /// Initial damping parameter
    pub initial_lambda: f64,
    /// Factor to increase lambda on a rejected step
    pub lambda_up: f64,
    /// Factor to decrease lambda on an accepted step
    pub lambda_down: f64,
    /// Damping above which no improving step exists inside the bounds
    pub max_lambda: f64,
    /// Wall-clock budget for a single fit
    pub max_duration: Option<Duration>,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            max_iterations: None,
            xtol: 1e-8,
            ftol: 1e-8,
            gtol: 1e-8,
            initial_lambda: 1e-3,
            lambda_up: 10.0,
            lambda_down: 0.1,
            max_lambda: 1e12,
            max_duration: Some(Duration::from_secs(10)),
        }
    }
}

impl LmConfig {
    /// Iteration budget for a model with `n_params` parameters
    pub fn iteration_limit(&self, n_params: usize) -> usize {
        self.max_iterations.unwrap_or(100 * n_params.max(1))
    }
}

/// Why a successful fit stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// Parameter steps fell below `xtol`
    StepTolerance,
    /// Chi-square decrease fell below `ftol`
    ChiSquareTolerance,
    /// Residuals are orthogonal to every free direction, within `gtol`
    GradientTolerance,
    /// Model reproduces the data exactly
    ExactFit,
    /// No step inside the bounds reduces chi-square
    Stagnated,
}

/// Result of a converged L-M optimization.
#[derive(Debug, Clone, PartialEq)]
pub struct LmResult {
    pub params: Vec<f64>,
    pub chi2: f64,
    pub iterations: usize,
    pub termination: Termination,
}

/// Fit `model` to samples `(x, y)` inside `bounds`.
///
/// `weights` are multiplicative residual weights, typically `1 / sigma` per
/// sample. The starting point is projected into the bounds before fitting.
///
/// # Errors
/// * `FitError::NotConverged` - no convergence criterion met within [`LmConfig::iteration_limit`]
/// * `FitError::Timeout` - the fit ran longer than `max_duration`
/// * `FitError::NonFiniteResidual` - chi-square is not finite at the starting point
/// * `FitError::ParameterCount` / `FitError::LengthMismatch` - inconsistent inputs
pub fn optimize<M: ProfileModel>(
    model: &M,
    x: &[f64],
    y: &[f64],
    weights: Option<&[f64]>,
    initial_params: &[f64],
    bounds: &ParamBounds,
    config: &LmConfig,
) -> Result<LmResult, FitError> {
    let n = model.n_params();
    if initial_params.len() != n {
        return Err(FitError::ParameterCount {
            expected: n,
            got: initial_params.len(),
        });
    }
    if bounds.len() != n {
        return Err(FitError::ParameterCount {
            expected: n,
            got: bounds.len(),
        });
    }
    if x.len() != y.len() {
        return Err(FitError::LengthMismatch {
            x_len: x.len(),
            y_len: y.len(),
        });
    }
    if let Some(w) = weights {
        if w.len() != y.len() {
            return Err(FitError::LengthMismatch {
                x_len: w.len(),
                y_len: y.len(),
            });
        }
    }

    let start = Instant::now();
    let mut params = initial_params.to_vec();
    bounds.clamp(&mut params);

    let mut chi2 = compute_chi2(model, x, y, weights, &params);
    if !chi2.is_finite() {
        return Err(FitError::NonFiniteResidual);
    }
    if chi2 == 0.0 {
        return Ok(LmResult {
            params,
            chi2,
            iterations: 0,
            termination: Termination::ExactFit,
        });
    }

    let mut lambda = config.initial_lambda;
    let mut trial = vec![0.0; n];
    let max_iterations = config.iteration_limit(n);

    for iter in 0..max_iterations {
        let iterations = iter + 1;
        if let Some(limit) = config.max_duration {
            if start.elapsed() > limit {
                return Err(FitError::Timeout { limit, iterations });
            }
        }

        let (hessian, gradient) = normal_equations(model, x, y, weights, &params);
        let blocked: Vec<bool> = (0..n)
            .map(|i| bounds.blocks(i, params[i], gradient[i]))
            .collect();

        if gradient_converged(&hessian, &gradient, &blocked, chi2, config.gtol) {
            return Ok(finish(params, chi2, iterations, Termination::GradientTolerance));
        }

        // Raise the damping until a step reduces chi-square or none can
        loop {
            let mut held = blocked.clone();
            let step = constrained_step(&hessian, &gradient, lambda, &params, bounds, &mut held);
            let Some(delta) = step else {
                lambda *= config.lambda_up;
                if lambda > config.max_lambda {
                    return Ok(finish(params, chi2, iterations, Termination::Stagnated));
                }
                continue;
            };

            for ((t, &p), d) in trial.iter_mut().zip(&params).zip(delta.iter()) {
                *t = p + d;
            }
            bounds.clamp(&mut trial);

            let small_step = trial
                .iter()
                .zip(&params)
                .all(|(&t, &p)| (t - p).abs() <= config.xtol * (p.abs() + config.xtol));

            let trial_chi2 = compute_chi2(model, x, y, weights, &trial);
            if trial_chi2.is_finite() && trial_chi2 < chi2 {
                let reduction = (chi2 - trial_chi2) / chi2;
                let predicted = predicted_reduction(&hessian, &gradient, &trial, &params) / chi2;
                params.copy_from_slice(&trial);
                chi2 = trial_chi2;
                lambda = (lambda * config.lambda_down).max(MIN_LAMBDA);

                if chi2 == 0.0 {
                    return Ok(finish(params, chi2, iterations, Termination::ExactFit));
                }
                if small_step {
                    return Ok(finish(params, chi2, iterations, Termination::StepTolerance));
                }
                // Actual and predicted reductions must both be small
                if reduction <= config.ftol && predicted <= config.ftol {
                    return Ok(finish(
                        params,
                        chi2,
                        iterations,
                        Termination::ChiSquareTolerance,
                    ));
                }
                break;
            }

            if small_step {
                return Ok(finish(params, chi2, iterations, Termination::StepTolerance));
            }
            lambda *= config.lambda_up;
            if lambda > config.max_lambda {
                return Ok(finish(params, chi2, iterations, Termination::Stagnated));
            }
        }
    }

    Err(FitError::NotConverged {
        iterations: max_iterations,
        chi2,
    })
}

/// Solve the damped normal equations with the parameters in `held` fixed.
///
/// A free parameter on a bound whose solved step leaves the box is added to
/// `held` and the system is solved again, so at most `n` solves are made.
fn constrained_step(
    hessian: &DMatrix<f64>,
    gradient: &DVector<f64>,
    lambda: f64,
    params: &[f64],
    bounds: &ParamBounds,
    held: &mut [bool],
) -> Option<DVector<f64>> {
    let n = params.len();
    loop {
        let mut damped = hessian.clone();
        let mut rhs = gradient.clone();
        for i in 0..n {
            if held[i] {
                damped.row_mut(i).fill(0.0);
                damped.column_mut(i).fill(0.0);
                damped[(i, i)] = 1.0;
                rhs[i] = 0.0;
            } else {
                damped[(i, i)] += lambda * hessian[(i, i)].max(DIAG_FLOOR);
            }
        }

        let delta = damped.lu().solve(&rhs)?;

        let mut newly_held = false;
        for i in 0..n {
            if !held[i] && bounds.blocks(i, params[i], delta[i]) {
                held[i] = true;
                newly_held = true;
            }
        }
        if !newly_held {
            return Some(delta);
        }
    }
}

/// Chi-square decrease predicted by the linearized model for `trial - params`
fn predicted_reduction(
    hessian: &DMatrix<f64>,
    gradient: &DVector<f64>,
    trial: &[f64],
    params: &[f64],
) -> f64 {
    let step = DVector::from_iterator(params.len(), trial.iter().zip(params).map(|(t, p)| t - p));
    2.0 * gradient.dot(&step) - (hessian * &step).dot(&step)
}

/// MINPACK-style gradient test: |J_i . r| <= gtol * |J_i| |r| for every free parameter
fn gradient_converged(
    hessian: &DMatrix<f64>,
    gradient: &DVector<f64>,
    blocked: &[bool],
    chi2: f64,
    gtol: f64,
) -> bool {
    blocked.iter().enumerate().all(|(i, &held)| {
        let scale = (hessian[(i, i)] * chi2).sqrt();
        held || scale == 0.0 || gradient[i].abs() <= gtol * scale
    })
}

fn finish(params: Vec<f64>, chi2: f64, iterations: usize, termination: Termination) -> LmResult {
    LmResult {
        params,
        chi2,
        iterations,
        termination,
    }
}

fn compute_chi2<M: ProfileModel>(
    model: &M,
    x: &[f64],
    y: &[f64],
    weights: Option<&[f64]>,
    params: &[f64],
) -> f64 {
    x.iter()
        .zip(y)
        .enumerate()
        .map(|(i, (&xi, &yi))| {
            let w = weights.map_or(1.0, |w| w[i]);
            let r = (yi - model.evaluate(xi, params)) * w;
            r * r
        })
        .sum()
}

/// Accumulate J^T J and J^T r for the weighted residuals.
/// Only the upper triangle is summed, then mirrored.
fn normal_equations<M: ProfileModel>(
    model: &M,
    x: &[f64],
    y: &[f64],
    weights: Option<&[f64]>,
    params: &[f64],
) -> (DMatrix<f64>, DVector<f64>) {
    let n = params.len();
    let mut hessian = DMatrix::<f64>::zeros(n, n);
    let mut gradient = DVector::<f64>::zeros(n);
    let mut row = vec![0.0; n];

    for (i, (&xi, &yi)) in x.iter().zip(y).enumerate() {
        let w = weights.map_or(1.0, |w| w[i]);
        model.gradient(xi, params, &mut row);
        let r = (yi - model.evaluate(xi, params)) * w;
        for a in 0..n {
            let ja = row[a] * w;
            gradient[a] += ja * r;
            for b in a..n {
                hessian[(a, b)] += ja * row[b] * w;
            }
        }
    }

    for a in 1..n {
        for b in 0..a {
            hessian[(a, b)] = hessian[(b, a)];
        }
    }

    (hessian, gradient)
}
