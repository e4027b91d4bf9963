//! Bounded nonlinear least-squares fitting of 1D profile models.
//!
//! Provides a Levenberg-Marquardt optimizer with box constraints on every
//! parameter, optional per-sample uncertainty weighting and a wall-clock
//! budget per fit.

mod lm;

pub use lm::{optimize, LmConfig, LmResult, ProfileModel, Termination};

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while fitting a profile
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FitError {
    #[error("fit did not converge after {iterations} iterations (chi2 = {chi2:.6e})")]
    NotConverged { iterations: usize, chi2: f64 },

    #[error("fit exceeded its time budget of {limit:?} after {iterations} iterations")]
    Timeout { limit: Duration, iterations: usize },

    #[error("residuals are not finite at the starting parameters")]
    NonFiniteResidual,

    #[error("expected {expected} parameters, got {got}")]
    ParameterCount { expected: usize, got: usize },

    #[error("sample arrays have mismatched lengths: {x_len} positions, {y_len} values")]
    LengthMismatch { x_len: usize, y_len: usize },

    #[error("lower bound {lower} exceeds upper bound {upper} for parameter {index}")]
    InvertedBounds {
        index: usize,
        lower: f64,
        upper: f64,
    },
}

/// Box constraints on a parameter vector
#[derive(Debug, Clone, PartialEq)]
pub struct ParamBounds {
    lower: Vec<f64>,
    upper: Vec<f64>,
}

impl ParamBounds {
    /// Create bounds from paired lower and upper vectors
    ///
    /// # Errors
    /// * `FitError::ParameterCount` - if the vectors differ in length
    /// * `FitError::InvertedBounds` - if any lower bound exceeds its upper bound
    pub fn new(lower: Vec<f64>, upper: Vec<f64>) -> Result<Self, FitError> {
        if lower.len() != upper.len() {
            return Err(FitError::ParameterCount {
                expected: lower.len(),
                got: upper.len(),
            });
        }
        for (index, (&lo, &hi)) in lower.iter().zip(upper.iter()).enumerate() {
            if lo > hi {
                return Err(FitError::InvertedBounds {
                    index,
                    lower: lo,
                    upper: hi,
                });
            }
        }
        Ok(Self { lower, upper })
    }

    pub fn len(&self) -> usize {
        self.lower.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lower.is_empty()
    }

    pub fn lower(&self) -> &[f64] {
        &self.lower
    }

    pub fn upper(&self) -> &[f64] {
        &self.upper
    }

    /// Project parameters into the feasible box
    pub fn clamp(&self, params: &mut [f64]) {
        for ((p, &lo), &hi) in params.iter_mut().zip(&self.lower).zip(&self.upper) {
            *p = p.clamp(lo, hi);
        }
    }

    /// Midpoint of the feasible box
    pub fn midpoint(&self) -> Vec<f64> {
        self.lower
            .iter()
            .zip(&self.upper)
            .map(|(lo, hi)| 0.5 * (lo + hi))
            .collect()
    }

    /// Indices of parameters sitting on a bound
    pub fn pinned(&self, params: &[f64]) -> Vec<usize> {
        params
            .iter()
            .zip(self.lower.iter().zip(&self.upper))
            .enumerate()
            .filter(|(_, (&p, (&lo, &hi)))| {
                let tol = bound_tolerance(p);
                (p - lo).abs() <= tol || (hi - p).abs() <= tol
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Whether parameter `index` at `value` sits on the bound that `direction` points past
    pub fn blocks(&self, index: usize, value: f64, direction: f64) -> bool {
        let tol = bound_tolerance(value);
        (direction < 0.0 && value - self.lower[index] <= tol)
            || (direction > 0.0 && self.upper[index] - value <= tol)
    }
}

fn bound_tolerance(value: f64) -> f64 {
    1e-9 * value.abs().max(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_validation() {
        assert!(ParamBounds::new(vec![0.0, 1.0], vec![1.0, 2.0]).is_ok());
        assert!(matches!(
            ParamBounds::new(vec![0.0], vec![1.0, 2.0]),
            Err(FitError::ParameterCount { .. })
        ));
        assert!(matches!(
            ParamBounds::new(vec![0.0, 3.0], vec![1.0, 2.0]),
            Err(FitError::InvertedBounds { index: 1, .. })
        ));
    }

    #[test]
    fn test_clamp_and_midpoint() {
        let bounds = ParamBounds::new(vec![0.0, -1.0], vec![2.0, 1.0]).unwrap();
        let mut p = [5.0, -3.0];
        bounds.clamp(&mut p);
        assert_eq!(p, [2.0, -1.0]);
        assert_eq!(bounds.midpoint(), vec![1.0, 0.0]);
    }

    #[test]
    fn test_pinned() {
        let bounds = ParamBounds::new(vec![0.0, 0.0, 0.0], vec![1.0, 1.0, 1.0]).unwrap();
        assert_eq!(bounds.pinned(&[0.0, 0.5, 1.0]), vec![0, 2]);
    }

    #[test]
    fn test_blocks_only_outward_directions() {
        let bounds = ParamBounds::new(vec![0.0, 0.0], vec![1.0, 1.0]).unwrap();
        assert!(bounds.blocks(0, 0.0, -1.0));
        assert!(!bounds.blocks(0, 0.0, 1.0));
        assert!(bounds.blocks(0, 1.0, 0.5));
        assert!(!bounds.blocks(0, 1.0, -0.5));
        assert!(!bounds.blocks(1, 0.5, -1.0));
        assert!(!bounds.blocks(1, 0.0, 0.0));
    }
}
