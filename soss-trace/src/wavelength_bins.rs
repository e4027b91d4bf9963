//! Wavelength-bin pixel index.
//!
//! Each sampled throughput wavelength defines a bin reaching halfway to its
//! neighbours, so consecutive bins share an edge and together partition the
//! sampled range. A pixel belongs to the bin whose half-open interval
//! `[lower, upper)` contains its calibrated wavelength.

use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::cache::{ArtifactCache, ArtifactOrigin};
use crate::calibration::{CalibrationError, CalibrationSource, ThroughputTable, CALIBRATION_ORDERS};
use crate::error::TraceError;
use crate::instrument::{Subarray, FULL_FRAME_ROWS};

/// Neighbour assumed before the first throughput sample, in microns
pub const LOWER_SENTINEL: f64 = 0.1;

/// Neighbour assumed after the last throughput sample, in microns
pub const UPPER_SENTINEL: f64 = 10.0;

/// Pixels whose wavelength falls within one bin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WavelengthBin {
    /// Throughput sample the bin is centred on
    pub wavelength: f64,
    pub lower: f64,
    pub upper: f64,
    /// `(row, column)` coordinates in row-major order
    pub pixels: Vec<(usize, usize)>,
}

impl WavelengthBin {
    pub fn contains(&self, wavelength: f64) -> bool {
        wavelength >= self.lower && wavelength < self.upper
    }
}

/// Bins for one spectral order, in increasing wavelength
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBins {
    pub order: u8,
    pub bins: Vec<WavelengthBin>,
}

impl OrderBins {
    pub fn pixel_count(&self) -> usize {
        self.bins.iter().map(|b| b.pixels.len()).sum()
    }
}

/// Wavelength bins for orders 1, 2 and 3
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WavelengthBins {
    pub subarray: Subarray,
    pub orders: Vec<OrderBins>,
    #[serde(skip)]
    pub origin: ArtifactOrigin,
}

impl WavelengthBins {
    pub fn order(&self, order: u8) -> Option<&OrderBins> {
        self.orders.iter().find(|o| o.order == order)
    }
}

/// Bin edges for a throughput wavelength grid.
///
/// Returns `len + 1` edges; bin `i` spans `edges[i]..edges[i + 1]`.
pub fn bin_edges(wavelengths: &[f64]) -> Vec<f64> {
    let (Some(&first), Some(&last)) = (wavelengths.first(), wavelengths.last()) else {
        return Vec::new();
    };

    let mut edges = Vec::with_capacity(wavelengths.len() + 1);
    edges.push(0.5 * (LOWER_SENTINEL + first));
    edges.extend(wavelengths.windows(2).map(|pair| 0.5 * (pair[0] + pair[1])));
    edges.push(0.5 * (last + UPPER_SENTINEL));
    edges
}

/// Assign every pixel of a wavelength map to the bin containing its wavelength
pub fn bin_order(map: ArrayView2<f64>, table: &ThroughputTable) -> Vec<WavelengthBin> {
    let edges = bin_edges(table.wavelengths());
    let mut bins: Vec<WavelengthBin> = table
        .wavelengths()
        .iter()
        .zip(edges.windows(2))
        .map(|(&wavelength, edge)| WavelengthBin {
            wavelength,
            lower: edge[0],
            upper: edge[1],
            pixels: Vec::new(),
        })
        .collect();

    for ((row, col), &wavelength) in map.indexed_iter() {
        // Index of the first edge above the wavelength; 0 means below every
        // bin, and NaN also lands there
        let above = edges.partition_point(|&edge| edge <= wavelength);
        if above == 0 || above > bins.len() {
            continue;
        }
        bins[above - 1].pixels.push((row, col));
    }

    bins
}

/// Rows of a wavelength map covering `subarray`.
///
/// Maps already of subarray height are used as they are; full-frame maps are
/// windowed to the subarray's detector rows.
pub fn subarray_window(
    map: Array2<f64>,
    subarray: Subarray,
    order: u8,
) -> Result<Array2<f64>, CalibrationError> {
    let rows = subarray.rows();
    if map.nrows() == rows {
        return Ok(map);
    }
    if map.nrows() != FULL_FRAME_ROWS {
        return Err(CalibrationError::MapShape {
            order,
            rows: map.nrows(),
            expected: rows,
        });
    }

    let start = subarray.first_detector_row();
    Ok(map.slice(s![start..start + rows, ..]).to_owned())
}

/// Bins for one order, empty when the order has no throughput table
fn order_bins<C: CalibrationSource + ?Sized>(
    order: u8,
    subarray: Subarray,
    source: &C,
) -> Result<OrderBins, CalibrationError> {
    let Some(table) = source.throughput(order)? else {
        log::warn!("no throughput table for order {order}; its wavelength bins are empty");
        return Ok(OrderBins {
            order,
            bins: Vec::new(),
        });
    };

    let map = subarray_window(source.wavelength_map(order)?, subarray, order)?;
    let bins = bin_order(map.view(), &table);
    log::debug!(
        "order {order}: {} bins covering {} pixels",
        bins.len(),
        bins.iter().map(|b| b.pixels.len()).sum::<usize>()
    );
    Ok(OrderBins { order, bins })
}

/// Build (or load) the wavelength-bin index for orders 1, 2 and 3.
///
/// A cached index built for the same subarray is returned unless `recompute`
/// is set. Otherwise, or when the artifact is missing or unreadable, the index
/// is computed exactly once and written to the cache.
pub fn build_wavelength_bins<C: CalibrationSource + ?Sized>(
    subarray: Subarray,
    source: &C,
    cache: &ArtifactCache,
    recompute: bool,
) -> Result<WavelengthBins, TraceError> {
    let path = cache.wavelength_bins_path();

    if !recompute {
        match cache.load::<WavelengthBins>(&path) {
            Ok(Some(mut cached)) if cached.subarray == subarray => {
                log::info!("loaded {subarray} wavelength bins from {}", path.display());
                cached.origin = ArtifactOrigin::Cache;
                return Ok(cached);
            }
            Ok(Some(cached)) => log::info!(
                "cached wavelength bins at {} are for {}, not {subarray}; recomputing",
                path.display(),
                cached.subarray
            ),
            Ok(None) => log::info!("no cached wavelength bins at {}; computing", path.display()),
            Err(e) => log::warn!("{e}; recomputing wavelength bins"),
        }
    }

    let orders = CALIBRATION_ORDERS
        .iter()
        .map(|&order| order_bins(order, subarray, source))
        .collect::<Result<Vec<_>, _>>()?;

    let bins = WavelengthBins {
        subarray,
        orders,
        origin: ArtifactOrigin::Computed,
    };
    cache.save(&path, &bins)?;
    Ok(bins)
}
