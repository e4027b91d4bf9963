//! Detector geometry and observing-mode identifiers for NIRISS/SOSS.
//!
//! The SOSS detector is read out as a 2048-column strip whose height depends on
//! the subarray. Columns run along the dispersion (wavelength) axis and rows run
//! along the cross-dispersion (spatial) axis.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of columns in every SOSS readout.
pub const DETECTOR_COLUMNS: usize = 2048;

/// Number of rows in a full-frame readout.
pub const FULL_FRAME_ROWS: usize = 2048;

/// Errors raised when parsing observing-mode identifiers
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IdentifierError {
    #[error("Unknown subarray '{0}', expected one of SUBSTRIP96, SUBSTRIP256, FULL")]
    InvalidSubarray(String),

    #[error("Unknown filter '{0}', expected CLEAR or F277W")]
    InvalidFilter(String),

    #[error("Invalid trace order {0}, only orders 1 and 2 have trace models")]
    InvalidOrder(u8),
}

/// Detector readout region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Subarray {
    #[serde(rename = "SUBSTRIP96")]
    Substrip96,
    #[serde(rename = "SUBSTRIP256")]
    Substrip256,
    #[serde(rename = "FULL")]
    Full,
}

impl Subarray {
    pub const ALL: [Subarray; 3] = [Subarray::Substrip96, Subarray::Substrip256, Subarray::Full];

    /// Frame height in rows
    pub fn rows(&self) -> usize {
        match self {
            Subarray::Substrip96 => 96,
            Subarray::Substrip256 => 256,
            Subarray::Full => FULL_FRAME_ROWS,
        }
    }

    /// First full-frame detector row covered by this subarray.
    ///
    /// Used to window full-frame calibration maps down to the readout region.
    pub fn first_detector_row(&self) -> usize {
        match self {
            Subarray::Substrip96 => 1802,
            Subarray::Substrip256 => 1792,
            Subarray::Full => 0,
        }
    }

    /// Canonical name as it appears in data product headers
    pub fn name(&self) -> &'static str {
        match self {
            Subarray::Substrip96 => "SUBSTRIP96",
            Subarray::Substrip256 => "SUBSTRIP256",
            Subarray::Full => "FULL",
        }
    }
}

impl fmt::Display for Subarray {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Subarray {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SUBSTRIP96" => Ok(Subarray::Substrip96),
            "SUBSTRIP256" => Ok(Subarray::Substrip256),
            "FULL" => Ok(Subarray::Full),
            _ => Err(IdentifierError::InvalidSubarray(s.to_string())),
        }
    }
}

/// Filter wheel position during the observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Filter {
    #[serde(rename = "CLEAR")]
    Clear,
    /// Long-pass filter that blocks order 2
    #[serde(rename = "F277W")]
    F277W,
}

impl Filter {
    /// Whether order 2 light reaches the detector through this filter
    pub fn passes_order2(&self) -> bool {
        matches!(self, Filter::Clear)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Filter::Clear => "CLEAR",
            Filter::F277W => "F277W",
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Filter {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CLEAR" => Ok(Filter::Clear),
            "F277W" => Ok(Filter::F277W),
            _ => Err(IdentifierError::InvalidFilter(s.to_string())),
        }
    }
}

/// Diffraction order with a trace-center model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TraceOrder {
    First,
    Second,
}

impl TraceOrder {
    pub const ALL: [TraceOrder; 2] = [TraceOrder::First, TraceOrder::Second];

    pub fn number(&self) -> u8 {
        match self {
            TraceOrder::First => 1,
            TraceOrder::Second => 2,
        }
    }
}

impl TryFrom<u8> for TraceOrder {
    type Error = IdentifierError;

    fn try_from(order: u8) -> Result<Self, Self::Error> {
        match order {
            1 => Ok(TraceOrder::First),
            2 => Ok(TraceOrder::Second),
            other => Err(IdentifierError::InvalidOrder(other)),
        }
    }
}

impl fmt::Display for TraceOrder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "order {}", self.number())
    }
}

/// First column at which order 2 is no longer fit.
///
/// In SUBSTRIP256 the order 2 trace runs off the red end of the readout at
/// column 1900; for every other geometry the usable trace ends at column 1050.
pub fn order2_cutoff(frame_rows: usize) -> usize {
    if frame_rows == 256 {
        1900
    } else {
        1050
    }
}
