//! Per-column signal isolation.
//!
//! Each detector column is fit with one or two PSF profiles centred near the
//! expected trace positions. The fitted lobes define, for each order, the range
//! of rows treated as signal; every other row of the column is excluded.
//!
//! # Order disambiguation
//!
//! Order 2 is only fit where it is physically present: the F277W filter blocks
//! it entirely, and it leaves the readout at the cutoff column returned by
//! [`order2_cutoff`]. Elsewhere both orders are fit simultaneously, with
//! amplitude bounds that keep the bright order 1 and faint order 2 profiles
//! from swapping.

use ndarray::{Array1, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::fit::{optimize, FitError, LmConfig, ParamBounds, ProfileModel, Termination};
use crate::instrument::{order2_cutoff, Filter, TraceOrder, DETECTOR_COLUMNS};
use crate::psf::{batman, batman_gradient, PsfParams, PSF_PARAM_COUNT};
use crate::trace::trace_center;

/// Mask value for rows that hold no signal of the order
pub const EXCLUDED: u8 = 1;

/// Mask value for rows inside the order's signal region
pub const INCLUDED: u8 = 0;

/// Errors that can occur while isolating the signal in one column
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IsolateError {
    #[error("column {column} is outside the frame (width {width})")]
    ColumnOutOfRange { column: usize, width: usize },

    #[error("uncertainty array has shape {got:?}, expected {expected:?}")]
    UncertaintyShape {
        expected: (usize, usize),
        got: (usize, usize),
    },

    #[error("column {column} has a non-finite value at row {row}")]
    NonFiniteData { column: usize, row: usize },

    #[error("column {column} has invalid uncertainty {value} at row {row}")]
    InvalidUncertainty { column: usize, row: usize, value: f64 },

    #[error("column {column} contains no signal (all values are zero)")]
    EmptyColumn { column: usize },

    #[error("column {column}: invalid bounds for {model}: {source}")]
    InvalidBounds {
        column: usize,
        model: String,
        source: FitError,
    },

    #[error("column {column}: {model} fit failed: {source}")]
    Fit {
        column: usize,
        model: String,
        source: FitError,
    },
}

impl IsolateError {
    /// Column the error refers to, when there is one
    pub fn column(&self) -> Option<usize> {
        match self {
            IsolateError::ColumnOutOfRange { column, .. }
            | IsolateError::NonFiniteData { column, .. }
            | IsolateError::InvalidUncertainty { column, .. }
            | IsolateError::EmptyColumn { column }
            | IsolateError::InvalidBounds { column, .. }
            | IsolateError::Fit { column, .. } => Some(*column),
            IsolateError::UncertaintyShape { .. } => None,
        }
    }
}

/// Bounds on one order's profile parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PsfBounds {
    pub lower: PsfParams,
    pub upper: PsfParams,
}

impl PsfBounds {
    fn midpoint(&self) -> PsfParams {
        let lo = self.lower.to_array();
        let hi = self.upper.to_array();
        let mut mid = [0.0; PSF_PARAM_COUNT];
        for i in 0..PSF_PARAM_COUNT {
            mid[i] = 0.5 * (lo[i] + hi[i]);
        }
        PsfParams::from_slice(&mid)
    }
}

impl fmt::Display for PsfBounds {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "lower {:?}, upper {:?}",
            self.lower.to_array(),
            self.upper.to_array()
        )
    }
}

/// Bounds relative to the expected trace center, evaluated per column.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PsfBoundsTemplate {
    /// Allowed distance of the central peak from the trace center, in pixels
    pub center_offset: f64,
    pub center_sigma: (f64, f64),
    pub center_amplitude: (f64, f64),
    pub outer_sigma: (f64, f64),
    pub outer_amplitude: (f64, f64),
    pub separation: (f64, f64),
}

impl PsfBoundsTemplate {
    /// Bright order 1 profile
    pub fn order1() -> Self {
        Self {
            center_offset: 3.0,
            center_sigma: (2.0, 4.0),
            center_amplitude: (100.0, 1e6),
            outer_sigma: (2.0, 8.0),
            outer_amplitude: (300.0, 1e6),
            separation: (5.0, 10.0),
        }
    }

    /// Faint order 2 profile
    pub fn order2() -> Self {
        Self {
            center_offset: 3.0,
            center_sigma: (2.0, 4.0),
            center_amplitude: (3.0, 1e3),
            outer_sigma: (2.0, 8.0),
            outer_amplitude: (3.0, 1e3),
            separation: (5.0, 10.0),
        }
    }

    /// Concrete bounds for a trace centred at row `center`
    pub fn at(&self, center: f64) -> PsfBounds {
        PsfBounds {
            lower: PsfParams {
                center: center - self.center_offset,
                center_sigma: self.center_sigma.0,
                center_amplitude: self.center_amplitude.0,
                outer_sigma: self.outer_sigma.0,
                outer_amplitude: self.outer_amplitude.0,
                separation: self.separation.0,
            },
            upper: PsfParams {
                center: center + self.center_offset,
                center_sigma: self.center_sigma.1,
                center_amplitude: self.center_amplitude.1,
                outer_sigma: self.outer_sigma.1,
                outer_amplitude: self.outer_amplitude.1,
                separation: self.separation.1,
            },
        }
    }
}

/// Bounds templates for both orders
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundsTemplates {
    pub order1: PsfBoundsTemplate,
    pub order2: PsfBoundsTemplate,
}

impl Default for BoundsTemplates {
    fn default() -> Self {
        Self {
            order1: PsfBoundsTemplate::order1(),
            order2: PsfBoundsTemplate::order2(),
        }
    }
}

/// Settings for isolating the signal in a column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolateConfig {
    /// Number of standard deviations of the outermost lobes treated as signal
    pub sigma: f64,
    /// Fixed half-width of the signal region around the central peak, overriding `sigma`
    pub radius: Option<usize>,
    /// Parameter bounds, relative to the trace centers
    pub bounds: BoundsTemplates,
    /// Optimizer settings
    pub lm: LmConfig,
}

impl Default for IsolateConfig {
    fn default() -> Self {
        Self {
            sigma: 3.0,
            radius: None,
            bounds: BoundsTemplates::default(),
            lm: LmConfig::default(),
        }
    }
}

/// Profile model fit to a column.
///
/// The dual-order fit vector holds the order 2 block first followed by the
/// order 1 block; [`FitModel::unpack`] maps it back to named orders.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FitModel {
    SingleOrder { order1: PsfBounds },
    DualOrder { order1: PsfBounds, order2: PsfBounds },
}

impl FitModel {
    /// Choose the model for a column from the trace positions, frame height and filter
    pub fn for_column(
        column: usize,
        frame_rows: usize,
        filter: Filter,
        templates: &BoundsTemplates,
    ) -> Self {
        let x1 = trace_center(TraceOrder::First)[column];
        let order1 = templates.order1.at(x1);

        if column >= order2_cutoff(frame_rows) || !filter.passes_order2() {
            FitModel::SingleOrder { order1 }
        } else {
            let x2 = trace_center(TraceOrder::Second)[column];
            FitModel::DualOrder {
                order1,
                order2: templates.order2.at(x2),
            }
        }
    }

    pub fn is_dual(&self) -> bool {
        matches!(self, FitModel::DualOrder { .. })
    }

    fn blocks(&self) -> Vec<&PsfBounds> {
        match self {
            FitModel::SingleOrder { order1 } => vec![order1],
            FitModel::DualOrder { order1, order2 } => vec![order2, order1],
        }
    }

    /// Flattened bounds in fit-vector layout
    pub fn param_bounds(&self) -> Result<ParamBounds, FitError> {
        let mut lower = Vec::with_capacity(self.n_params());
        let mut upper = Vec::with_capacity(self.n_params());
        for block in self.blocks() {
            lower.extend(block.lower.to_array());
            upper.extend(block.upper.to_array());
        }
        ParamBounds::new(lower, upper)
    }

    /// Starting point in fit-vector layout, seeded from the column data.
    ///
    /// Shape parameters start mid-range; amplitudes start from the brightest
    /// pixel within the allowed center range.
    pub fn initial_guess(&self, data: &[f64]) -> Vec<f64> {
        let mut guess = Vec::with_capacity(self.n_params());
        for block in self.blocks() {
            let mut p = block.midpoint();
            let peak = local_peak(data, block.lower.center, block.upper.center);
            p.center_amplitude = peak.clamp(block.lower.center_amplitude, block.upper.center_amplitude);
            p.outer_amplitude =
                (0.3 * peak).clamp(block.lower.outer_amplitude, block.upper.outer_amplitude);
            guess.extend(p.to_array());
        }
        guess
    }

    /// Map a fit vector back to named orders
    pub fn unpack(&self, params: &[f64]) -> ColumnParams {
        match self {
            FitModel::SingleOrder { .. } => ColumnParams::SingleOrder {
                order1: PsfParams::from_slice(&params[..PSF_PARAM_COUNT]),
            },
            FitModel::DualOrder { .. } => ColumnParams::DualOrder {
                order2: PsfParams::from_slice(&params[..PSF_PARAM_COUNT]),
                order1: PsfParams::from_slice(&params[PSF_PARAM_COUNT..]),
            },
        }
    }
}

impl ProfileModel for FitModel {
    fn n_params(&self) -> usize {
        match self {
            FitModel::SingleOrder { .. } => PSF_PARAM_COUNT,
            FitModel::DualOrder { .. } => 2 * PSF_PARAM_COUNT,
        }
    }

    fn evaluate(&self, x: f64, params: &[f64]) -> f64 {
        params
            .chunks_exact(PSF_PARAM_COUNT)
            .map(|block| batman(x, &PsfParams::from_slice(block)))
            .sum()
    }

    fn gradient(&self, x: f64, params: &[f64], out: &mut [f64]) {
        for (block, grad) in params
            .chunks_exact(PSF_PARAM_COUNT)
            .zip(out.chunks_exact_mut(PSF_PARAM_COUNT))
        {
            batman_gradient(x, block, grad);
        }
    }
}

impl fmt::Display for FitModel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FitModel::SingleOrder { order1 } => write!(f, "single-order model (order 1 {order1})"),
            FitModel::DualOrder { order1, order2 } => write!(
                f,
                "dual-order model (order 1 {order1}; order 2 {order2})"
            ),
        }
    }
}

fn local_peak(data: &[f64], lower: f64, upper: f64) -> f64 {
    let lo = lower.floor().max(0.0) as usize;
    let hi = (upper.ceil().max(0.0) as usize).min(data.len().saturating_sub(1));
    data.get(lo..=hi)
        .and_then(|window| window.iter().copied().reduce(f64::max))
        .unwrap_or(0.0)
}

/// Fitted profile parameters for a column
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ColumnParams {
    SingleOrder { order1: PsfParams },
    DualOrder { order1: PsfParams, order2: PsfParams },
}

impl ColumnParams {
    pub fn order1(&self) -> &PsfParams {
        match self {
            ColumnParams::SingleOrder { order1 } | ColumnParams::DualOrder { order1, .. } => order1,
        }
    }

    pub fn order2(&self) -> Option<&PsfParams> {
        match self {
            ColumnParams::SingleOrder { .. } => None,
            ColumnParams::DualOrder { order2, .. } => Some(order2),
        }
    }
}

/// Open interval of rows treated as signal for one order
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalBounds {
    pub lower: f64,
    pub upper: f64,
}

impl SignalBounds {
    /// Derive the signal region from a fitted profile.
    ///
    /// With a fixed `radius` the region is centred on the middle lobe. Otherwise
    /// it spans from the lowest lobe minus `sigma` of its widths to the highest
    /// lobe plus `sigma` of its widths.
    pub fn from_profile(params: &PsfParams, sigma: f64, radius: Option<usize>) -> Self {
        let [low, mid, high] = params.components();
        match radius {
            Some(r) => Self {
                lower: mid.mu - r as f64,
                upper: mid.mu + r as f64,
            },
            None => Self {
                lower: low.mu - low.sigma * sigma,
                upper: high.mu + high.sigma * sigma,
            },
        }
    }

    pub fn contains(&self, row: f64) -> bool {
        row > self.lower && row < self.upper
    }

    /// Column mask of height `rows`; rows strictly inside the bounds are included
    pub fn mask(&self, rows: usize) -> Array1<u8> {
        Array1::from_shape_fn(rows, |row| {
            if self.contains(row as f64) {
                INCLUDED
            } else {
                EXCLUDED
            }
        })
    }
}

/// Exclusion masks for one column, one per order
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMasks {
    pub order1: Array1<u8>,
    pub order2: Array1<u8>,
}

impl ColumnMasks {
    /// Both orders fully excluded
    pub fn excluded(rows: usize) -> Self {
        Self {
            order1: Array1::from_elem(rows, EXCLUDED),
            order2: Array1::from_elem(rows, EXCLUDED),
        }
    }
}

/// Result of a successful column fit
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnFit {
    pub column: usize,
    pub model: FitModel,
    pub params: ColumnParams,
    pub order1_bounds: SignalBounds,
    /// `None` when order 2 was not fit in this column
    pub order2_bounds: Option<SignalBounds>,
    pub masks: ColumnMasks,
    pub chi2: f64,
    pub iterations: usize,
    pub termination: Termination,
    /// Fit-vector indices of parameters that finished on a bound
    pub pinned: Vec<usize>,
}

/// Fit the PSF model to one column and build its order masks.
///
/// The model (single or dual order) is chosen with [`FitModel::for_column`]
/// from the bounds templates in `config`. `err` holds per-pixel uncertainties
/// with the same shape as `frame`.
///
/// # Errors
/// Returns an [`IsolateError`] for invalid input or when the fit fails; no
/// fallback mask is produced.
pub fn isolate_signal(
    column: usize,
    frame: ArrayView2<f64>,
    filter: Filter,
    config: &IsolateConfig,
    err: Option<ArrayView2<f64>>,
) -> Result<ColumnFit, IsolateError> {
    check_column(column, frame.ncols())?;
    let model = FitModel::for_column(column, frame.nrows(), filter, &config.bounds);
    isolate_signal_with_model(column, frame, &model, config, err)
}

/// Fit an explicit model to one column and build its order masks.
pub fn isolate_signal_with_model(
    column: usize,
    frame: ArrayView2<f64>,
    model: &FitModel,
    config: &IsolateConfig,
    err: Option<ArrayView2<f64>>,
) -> Result<ColumnFit, IsolateError> {
    check_column(column, frame.ncols())?;
    if let Some(e) = &err {
        if e.dim() != frame.dim() {
            return Err(IsolateError::UncertaintyShape {
                expected: frame.dim(),
                got: e.dim(),
            });
        }
    }

    let data = column_values(column, frame.column(column))?;
    let weights = match &err {
        Some(e) => Some(column_weights(column, e.column(column))?),
        None => None,
    };

    let rows = data.len();
    let x: Vec<f64> = (0..rows).map(|r| r as f64).collect();

    let bounds = model
        .param_bounds()
        .map_err(|source| IsolateError::InvalidBounds {
            column,
            model: model.to_string(),
            source,
        })?;
    let initial = model.initial_guess(&data);

    let result = optimize(
        model,
        &x,
        &data,
        weights.as_deref(),
        &initial,
        &bounds,
        &config.lm,
    )
    .map_err(|source| IsolateError::Fit {
        column,
        model: model.to_string(),
        source,
    })?;

    let pinned = bounds.pinned(&result.params);
    let params = model.unpack(&result.params);

    let order1_bounds = SignalBounds::from_profile(params.order1(), config.sigma, config.radius);
    let order2_bounds = params
        .order2()
        .map(|p| SignalBounds::from_profile(p, config.sigma, config.radius));

    let masks = ColumnMasks {
        order1: order1_bounds.mask(rows),
        order2: match &order2_bounds {
            Some(b) => b.mask(rows),
            None => Array1::from_elem(rows, EXCLUDED),
        },
    };

    if !pinned.is_empty() {
        log::debug!(
            "column {column}: parameters {pinned:?} finished on their bounds (chi2 = {:.3e})",
            result.chi2
        );
    }

    Ok(ColumnFit {
        column,
        model: *model,
        params,
        order1_bounds,
        order2_bounds,
        masks,
        chi2: result.chi2,
        iterations: result.iterations,
        termination: result.termination,
        pinned,
    })
}

fn check_column(column: usize, width: usize) -> Result<(), IsolateError> {
    if column >= width || column >= DETECTOR_COLUMNS {
        return Err(IsolateError::ColumnOutOfRange {
            column,
            width: width.min(DETECTOR_COLUMNS),
        });
    }
    Ok(())
}

fn column_values(column: usize, values: ArrayView1<f64>) -> Result<Vec<f64>, IsolateError> {
    if let Some(row) = values.iter().position(|v| !v.is_finite()) {
        return Err(IsolateError::NonFiniteData { column, row });
    }
    if values.iter().all(|&v| v == 0.0) {
        return Err(IsolateError::EmptyColumn { column });
    }
    Ok(values.to_vec())
}

fn column_weights(column: usize, err: ArrayView1<f64>) -> Result<Vec<f64>, IsolateError> {
    err.iter()
        .enumerate()
        .map(|(row, &value)| {
            if value.is_finite() && value > 0.0 {
                Ok(1.0 / value)
            } else {
                Err(IsolateError::InvalidUncertainty { column, row, value })
            }
        })
        .collect()
}
