//! Wavelength calibration and filter throughput inputs.
//!
//! The wavelength-bin indexer needs, for each of the three spectral orders, a
//! map giving the wavelength (microns) at every detector pixel and a throughput
//! table giving the sampled wavelengths of the GR700XD grism response.

use ndarray::Array2;
use once_cell::sync::OnceCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Spectral orders with wavelength calibration
pub const CALIBRATION_ORDERS: [u8; 3] = [1, 2, 3];

/// Errors that can occur while reading calibration inputs
#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed wavelength calibration {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("{path}:{line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("no calibration for order {0} (orders are 1, 2 and 3)")]
    InvalidOrder(u8),

    #[error("no wavelength map for order {0}")]
    MissingWavelengthMap(u8),

    #[error("wavelength map for order {order} is ragged (row {row} has {got} values, expected {expected})")]
    RaggedMap {
        order: u8,
        row: usize,
        expected: usize,
        got: usize,
    },

    #[error("wavelength map for order {order} has {rows} rows, expected {expected} or 2048")]
    MapShape {
        order: u8,
        rows: usize,
        expected: usize,
    },

    #[error("throughput table has {wavelengths} wavelengths but {throughput} throughput values")]
    LengthMismatch {
        wavelengths: usize,
        throughput: usize,
    },

    #[error("throughput wavelengths must increase strictly (index {index}: {previous} then {value})")]
    NonIncreasing {
        index: usize,
        previous: f64,
        value: f64,
    },
}

fn check_order(order: u8) -> Result<usize, CalibrationError> {
    if CALIBRATION_ORDERS.contains(&order) {
        Ok(usize::from(order - 1))
    } else {
        Err(CalibrationError::InvalidOrder(order))
    }
}

/// Sampled filter throughput for one order
#[derive(Debug, Clone, PartialEq)]
pub struct ThroughputTable {
    wavelengths: Vec<f64>,
    throughput: Vec<f64>,
}

impl ThroughputTable {
    /// Create a table, requiring strictly increasing wavelengths
    pub fn new(wavelengths: Vec<f64>, throughput: Vec<f64>) -> Result<Self, CalibrationError> {
        if wavelengths.len() != throughput.len() {
            return Err(CalibrationError::LengthMismatch {
                wavelengths: wavelengths.len(),
                throughput: throughput.len(),
            });
        }
        for (index, pair) in wavelengths.windows(2).enumerate() {
            if pair[1].partial_cmp(&pair[0]) != Some(Ordering::Greater) {
                return Err(CalibrationError::NonIncreasing {
                    index: index + 1,
                    previous: pair[0],
                    value: pair[1],
                });
            }
        }
        Ok(Self {
            wavelengths,
            throughput,
        })
    }

    /// Parse a whitespace-separated `wavelength throughput` table.
    ///
    /// Blank lines and lines starting with `#` are skipped; extra columns are
    /// ignored.
    pub fn parse(text: &str, path: &Path) -> Result<Self, CalibrationError> {
        let mut wavelengths = Vec::new();
        let mut throughput = Vec::new();

        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parse_error = |message: String| CalibrationError::Parse {
                path: path.to_path_buf(),
                line: idx + 1,
                message,
            };

            let mut fields = line.split_whitespace();
            let (Some(w), Some(t)) = (fields.next(), fields.next()) else {
                return Err(parse_error(format!("expected two columns, got {line:?}")));
            };
            let w: f64 = w
                .parse()
                .map_err(|e| parse_error(format!("invalid wavelength {w:?}: {e}")))?;
            let t: f64 = t
                .parse()
                .map_err(|e| parse_error(format!("invalid throughput {t:?}: {e}")))?;
            wavelengths.push(w);
            throughput.push(t);
        }

        Self::new(wavelengths, throughput)
    }

    /// Read a table from disk, or `Ok(None)` if the file does not exist
    pub fn load(path: &Path) -> Result<Option<Self>, CalibrationError> {
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path).map_err(|source| CalibrationError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path).map(Some)
    }

    pub fn wavelengths(&self) -> &[f64] {
        &self.wavelengths
    }

    pub fn throughput(&self) -> &[f64] {
        &self.throughput
    }

    pub fn len(&self) -> usize {
        self.wavelengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wavelengths.is_empty()
    }
}

/// Provider of per-order calibration data
pub trait CalibrationSource {
    /// Wavelength at every pixel for `order`, either subarray-sized or full frame
    fn wavelength_map(&self, order: u8) -> Result<Array2<f64>, CalibrationError>;

    /// Throughput table for `order`, or `None` when the order has none
    fn throughput(&self, order: u8) -> Result<Option<ThroughputTable>, CalibrationError>;
}

/// Calibration data held in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryCalibration {
    maps: HashMap<u8, Array2<f64>>,
    tables: HashMap<u8, ThroughputTable>,
}

impl InMemoryCalibration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_wavelength_map(mut self, order: u8, map: Array2<f64>) -> Self {
        self.maps.insert(order, map);
        self
    }

    pub fn with_throughput(mut self, order: u8, table: ThroughputTable) -> Self {
        self.tables.insert(order, table);
        self
    }
}

impl CalibrationSource for InMemoryCalibration {
    fn wavelength_map(&self, order: u8) -> Result<Array2<f64>, CalibrationError> {
        check_order(order)?;
        self.maps
            .get(&order)
            .cloned()
            .ok_or(CalibrationError::MissingWavelengthMap(order))
    }

    fn throughput(&self, order: u8) -> Result<Option<ThroughputTable>, CalibrationError> {
        check_order(order)?;
        Ok(self.tables.get(&order).cloned())
    }
}

/// Calibration files on disk.
///
/// `wavecal_path` is a JSON array holding one 2D array (list of rows) per
/// order. Throughput tables are read from `GR700XD_{order}.txt` under
/// `throughput_dir`.
#[derive(Debug)]
pub struct FileCalibration {
    wavecal_path: PathBuf,
    throughput_dir: PathBuf,
    maps: OnceCell<Vec<Array2<f64>>>,
}

impl FileCalibration {
    pub fn new(wavecal_path: impl Into<PathBuf>, throughput_dir: impl Into<PathBuf>) -> Self {
        Self {
            wavecal_path: wavecal_path.into(),
            throughput_dir: throughput_dir.into(),
            maps: OnceCell::new(),
        }
    }

    pub fn throughput_path(&self, order: u8) -> PathBuf {
        self.throughput_dir.join(format!("GR700XD_{order}.txt"))
    }

    fn maps(&self) -> Result<&[Array2<f64>], CalibrationError> {
        self.maps
            .get_or_try_init(|| read_wavecal(&self.wavecal_path))
            .map(Vec::as_slice)
    }
}

impl CalibrationSource for FileCalibration {
    fn wavelength_map(&self, order: u8) -> Result<Array2<f64>, CalibrationError> {
        let idx = check_order(order)?;
        self.maps()?
            .get(idx)
            .cloned()
            .ok_or(CalibrationError::MissingWavelengthMap(order))
    }

    fn throughput(&self, order: u8) -> Result<Option<ThroughputTable>, CalibrationError> {
        check_order(order)?;
        ThroughputTable::load(&self.throughput_path(order))
    }
}

fn read_wavecal(path: &Path) -> Result<Vec<Array2<f64>>, CalibrationError> {
    let text = std::fs::read_to_string(path).map_err(|source| CalibrationError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let nested: Vec<Vec<Vec<f64>>> =
        serde_json::from_str(&text).map_err(|source| CalibrationError::Json {
            path: path.to_path_buf(),
            source,
        })?;

    nested
        .into_iter()
        .zip(CALIBRATION_ORDERS)
        .map(|(rows, order)| rows_to_array(order, rows))
        .collect()
}

fn rows_to_array(order: u8, rows: Vec<Vec<f64>>) -> Result<Array2<f64>, CalibrationError> {
    let height = rows.len();
    let width = rows.first().map_or(0, Vec::len);
    let mut data = Vec::with_capacity(height * width);
    for (row, values) in rows.into_iter().enumerate() {
        if values.len() != width {
            return Err(CalibrationError::RaggedMap {
                order,
                row,
                expected: width,
                got: values.len(),
            });
        }
        data.extend(values);
    }
    Array2::from_shape_vec((height, width), data).map_err(|_| CalibrationError::RaggedMap {
        order,
        row: 0,
        expected: width,
        got: 0,
    })
}
