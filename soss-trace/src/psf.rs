//! Cross-dispersion PSF profile model.
//!
//! A single order's profile in one column is modelled as a dominant central
//! Gaussian flanked by two fainter, symmetric outer Gaussians (the "batman"
//! profile). Two overlapping orders are the sum of two such profiles ("batmen").

use serde::{Deserialize, Serialize};

/// Number of free parameters in one order's profile
pub const PSF_PARAM_COUNT: usize = 6;

/// Evaluate a Gaussian with peak `amplitude` at position `x`
#[inline]
pub fn gaussian(x: f64, mu: f64, sigma: f64, amplitude: f64) -> f64 {
    let d = x - mu;
    amplitude * (-(d * d) / (2.0 * sigma * sigma)).exp()
}

/// One Gaussian lobe of a profile, reduced to (mu, sigma, amplitude)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaussianComponent {
    pub mu: f64,
    pub sigma: f64,
    pub amplitude: f64,
}

impl GaussianComponent {
    pub fn evaluate(&self, x: f64) -> f64 {
        gaussian(x, self.mu, self.sigma, self.amplitude)
    }
}

/// Parameters of one order's profile in one column
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PsfParams {
    /// Row position of the central peak
    pub center: f64,
    /// Standard deviation of the central peak
    pub center_sigma: f64,
    /// Amplitude of the central peak
    pub center_amplitude: f64,
    /// Standard deviation of each outer peak
    pub outer_sigma: f64,
    /// Amplitude of each outer peak
    pub outer_amplitude: f64,
    /// Distance of the outer peaks from the central peak
    pub separation: f64,
}

impl PsfParams {
    pub fn to_array(&self) -> [f64; PSF_PARAM_COUNT] {
        [
            self.center,
            self.center_sigma,
            self.center_amplitude,
            self.outer_sigma,
            self.outer_amplitude,
            self.separation,
        ]
    }

    /// Build from a flat parameter block; `block` must hold at least six values
    pub fn from_slice(block: &[f64]) -> Self {
        Self {
            center: block[0],
            center_sigma: block[1],
            center_amplitude: block[2],
            outer_sigma: block[3],
            outer_amplitude: block[4],
            separation: block[5],
        }
    }

    /// The three Gaussian lobes, sorted by position
    pub fn components(&self) -> [GaussianComponent; 3] {
        let mut components = [
            GaussianComponent {
                mu: self.center,
                sigma: self.center_sigma,
                amplitude: self.center_amplitude,
            },
            GaussianComponent {
                mu: self.center - self.separation,
                sigma: self.outer_sigma,
                amplitude: self.outer_amplitude,
            },
            GaussianComponent {
                mu: self.center + self.separation,
                sigma: self.outer_sigma,
                amplitude: self.outer_amplitude,
            },
        ];
        components.sort_by(|a, b| a.mu.total_cmp(&b.mu));
        components
    }
}

/// Single-order profile: central peak plus two outer peaks at `center ± separation`
pub fn batman(x: f64, p: &PsfParams) -> f64 {
    gaussian(x, p.center, p.center_sigma, p.center_amplitude)
        + gaussian(x, p.center - p.separation, p.outer_sigma, p.outer_amplitude)
        + gaussian(x, p.center + p.separation, p.outer_sigma, p.outer_amplitude)
}

/// Two-order profile, the sum of two [`batman`] profiles
pub fn batmen(x: f64, order2: &PsfParams, order1: &PsfParams) -> f64 {
    batman(x, order2) + batman(x, order1)
}

/// Partial derivatives of [`batman`] with respect to the flattened parameters.
///
/// `block` is laid out as [`PsfParams::to_array`]; `out` receives six values.
pub fn batman_gradient(x: f64, block: &[f64], out: &mut [f64]) {
    let (mu, s0, a0, s1, a1, sep) = (block[0], block[1], block[2], block[3], block[4], block[5]);

    let d0 = x - mu;
    let dl = x - (mu - sep);
    let dr = x - (mu + sep);

    let e0 = (-(d0 * d0) / (2.0 * s0 * s0)).exp();
    let el = (-(dl * dl) / (2.0 * s1 * s1)).exp();
    let er = (-(dr * dr) / (2.0 * s1 * s1)).exp();

    let g0 = a0 * e0;
    let gl = a1 * el;
    let gr = a1 * er;

    let s0_2 = s0 * s0;
    let s1_2 = s1 * s1;

    out[0] = g0 * d0 / s0_2 + (gl * dl + gr * dr) / s1_2;
    out[1] = g0 * d0 * d0 / (s0_2 * s0);
    out[2] = e0;
    out[3] = (gl * dl * dl + gr * dr * dr) / (s1_2 * s1);
    out[4] = el + er;
    out[5] = (gr * dr - gl * dl) / s1_2;
}
