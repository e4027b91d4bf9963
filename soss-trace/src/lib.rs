//! Trace location and order masking for NIRISS SOSS frames
//!
//! The GR700XD grism disperses each spectral order into a curved trace across
//! the 2048 detector columns. This crate locates the order 1 and order 2
//! traces by fitting a multi-lobe PSF profile to every column, turns the fits
//! into per-order exclusion masks, and indexes the pixels belonging to each
//! wavelength bin of orders 1 to 3. Both products are cached on disk.

pub mod cache;
pub mod calibration;
pub mod config;
pub mod error;
pub mod fit;
pub mod instrument;
pub mod isolate;
pub mod masks;
pub mod psf;
pub mod trace;
pub mod wavelength_bins;

pub use cache::{ArtifactCache, ArtifactOrigin, CacheError};
pub use calibration::{
    CalibrationError, CalibrationSource, FileCalibration, InMemoryCalibration, ThroughputTable,
};
pub use config::{ConfigError, FitFailurePolicy, MaskBuildConfig};
pub use error::TraceError;
pub use instrument::{Filter, IdentifierError, Subarray, TraceOrder};
pub use isolate::{
    isolate_signal, isolate_signal_with_model, ColumnFit, FitModel, IsolateConfig, IsolateError,
    SignalBounds, EXCLUDED, INCLUDED,
};
pub use masks::{build_order_masks, fit_columns, ColumnOutcome, FailedColumn, OrderMasks};
pub use psf::{batman, batmen, gaussian, PsfParams};
pub use trace::{trace_center, trace_center_at};
pub use wavelength_bins::{build_wavelength_bins, OrderBins, WavelengthBin, WavelengthBins};
