//! Top-level error type for mask and wavelength-bin construction.

use thiserror::Error;

use crate::cache::CacheError;
use crate::calibration::CalibrationError;
use crate::config::ConfigError;
use crate::instrument::{Filter, IdentifierError, Subarray};
use crate::isolate::IsolateError;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error(transparent)]
    Identifier(#[from] IdentifierError),

    #[error("frame has {rows} rows but {subarray} frames have {expected} rows")]
    FrameShape {
        subarray: Subarray,
        expected: usize,
        rows: usize,
    },

    #[error("frame has {cols} columns, the detector has at most {max}")]
    FrameTooWide { cols: usize, max: usize },

    #[error("uncertainty array has shape {got:?}, frame has shape {expected:?}")]
    UncertaintyShape {
        expected: (usize, usize),
        got: (usize, usize),
    },

    #[error("frame has shape {got:?} but the masks have shape {expected:?}")]
    MaskShape {
        expected: (usize, usize),
        got: (usize, usize),
    },

    #[error(transparent)]
    Isolate(#[from] IsolateError),

    #[error("order mask build aborted at column {column} (filter {filter}): {source}")]
    BatchFailed {
        column: usize,
        filter: Filter,
        source: IsolateError,
    },

    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
