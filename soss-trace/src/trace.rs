//! Trace-center model for the SOSS spectral orders.
//!
//! The expected cross-dispersion position of each order's trace is described by
//! a fixed quartic polynomial of the column index. The curves are evaluated once
//! over all detector columns and cached for the lifetime of the process.

use once_cell::sync::Lazy;

use crate::instrument::{TraceOrder, DETECTOR_COLUMNS};

/// Polynomial coefficients for the order 1 trace, highest power first
pub const ORDER1_COEFFS: [f64; 5] = [
    1.71164994e-11,
    -4.72119272e-08,
    5.10276801e-05,
    -5.91535309e-02,
    8.30680347e+01,
];

/// Polynomial coefficients for the order 2 trace, highest power first
pub const ORDER2_COEFFS: [f64; 5] = [
    2.35792131e-13,
    2.42999478e-08,
    1.03641247e-05,
    -3.63088657e-02,
    9.96766537e+01,
];

static ORDER1_CENTERS: Lazy<Vec<f64>> = Lazy::new(|| evaluate_curve(&ORDER1_COEFFS));
static ORDER2_CENTERS: Lazy<Vec<f64>> = Lazy::new(|| evaluate_curve(&ORDER2_COEFFS));

/// Evaluate a polynomial with coefficients ordered highest power first (Horner's rule)
pub fn polyval(coeffs: &[f64], x: f64) -> f64 {
    coeffs.iter().fold(0.0, |acc, &c| acc * x + c)
}

fn evaluate_curve(coeffs: &[f64]) -> Vec<f64> {
    (0..DETECTOR_COLUMNS)
        .map(|col| polyval(coeffs, col as f64))
        .collect()
}

/// Polynomial coefficients for the given order
pub fn trace_coefficients(order: TraceOrder) -> &'static [f64; 5] {
    match order {
        TraceOrder::First => &ORDER1_COEFFS,
        TraceOrder::Second => &ORDER2_COEFFS,
    }
}

/// Expected row of the trace center for every detector column.
///
/// Returns a slice of length [`DETECTOR_COLUMNS`].
pub fn trace_center(order: TraceOrder) -> &'static [f64] {
    match order {
        TraceOrder::First => ORDER1_CENTERS.as_slice(),
        TraceOrder::Second => ORDER2_CENTERS.as_slice(),
    }
}

/// Expected trace center at a single column, `None` past the detector edge
pub fn trace_center_at(order: TraceOrder, column: usize) -> Option<f64> {
    trace_center(order).get(column).copied()
}
