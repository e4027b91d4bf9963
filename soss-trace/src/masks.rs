//! Full-frame order masks.
//!
//! Every column of a frame is fit independently with [`isolate_signal`] on a
//! bounded rayon pool, and the per-column masks are gathered by column index
//! into one 2D mask per order. The assembled masks are cached on disk and
//! reused by later calls for the same subarray and filter.

use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{s, Array2, ArrayView2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::cache::{ArtifactCache, ArtifactOrigin};
use crate::config::{FitFailurePolicy, MaskBuildConfig};
use crate::error::TraceError;
use crate::instrument::{Filter, Subarray, TraceOrder, DETECTOR_COLUMNS};
use crate::isolate::{isolate_signal, ColumnFit, ColumnMasks, IsolateError, EXCLUDED};

/// Result of fitting a single column within a batch
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnOutcome {
    Fitted(ColumnFit),
    Failed(IsolateError),
}

impl ColumnOutcome {
    pub fn is_fitted(&self) -> bool {
        matches!(self, ColumnOutcome::Fitted(_))
    }
}

/// A column excluded from both masks because its fit failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedColumn {
    pub column: usize,
    pub reason: String,
}

/// Assembled exclusion masks for both orders.
///
/// Both masks have the shape of the frame they were built from, with
/// [`EXCLUDED`] marking pixels outside the order's signal region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderMasks {
    pub subarray: Subarray,
    pub filter: Filter,
    pub order1: Array2<u8>,
    pub order2: Array2<u8>,
    /// Columns excluded under [`FitFailurePolicy::ExcludeColumn`]
    pub failed_columns: Vec<FailedColumn>,
    #[serde(skip)]
    pub origin: ArtifactOrigin,
}

impl OrderMasks {
    pub fn order(&self, order: TraceOrder) -> &Array2<u8> {
        match order {
            TraceOrder::First => &self.order1,
            TraceOrder::Second => &self.order2,
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.order1.dim()
    }

    /// Masks for another subarray, when they can be derived from these.
    ///
    /// The same subarray returns a copy; SUBSTRIP96 masks are the first 96
    /// rows of SUBSTRIP256 masks. Any other combination returns `None`.
    pub fn trimmed(&self, subarray: Subarray) -> Option<OrderMasks> {
        if subarray == self.subarray {
            return Some(self.clone());
        }
        if subarray != Subarray::Substrip96 || self.subarray != Subarray::Substrip256 {
            return None;
        }

        let rows = subarray.rows();
        Some(OrderMasks {
            subarray,
            filter: self.filter,
            order1: self.order1.slice(s![..rows, ..]).to_owned(),
            order2: self.order2.slice(s![..rows, ..]).to_owned(),
            failed_columns: self.failed_columns.clone(),
            origin: self.origin,
        })
    }

    /// Copy of `frame` with every pixel outside the order's signal region set to zero
    pub fn apply(&self, frame: ArrayView2<f64>, order: TraceOrder) -> Result<Array2<f64>, TraceError> {
        let mask = self.order(order);
        if frame.dim() != mask.dim() {
            return Err(TraceError::MaskShape {
                expected: mask.dim(),
                got: frame.dim(),
            });
        }

        let mut out = frame.to_owned();
        out.zip_mut_with(mask, |value, &m| {
            if m == EXCLUDED {
                *value = 0.0;
            }
        });
        Ok(out)
    }

    /// Assemble masks from per-column outcomes indexed by column.
    ///
    /// # Errors
    /// Under [`FitFailurePolicy::Abort`] the lowest failing column is returned
    /// as [`TraceError::BatchFailed`].
    pub fn from_outcomes(
        subarray: Subarray,
        filter: Filter,
        rows: usize,
        outcomes: Vec<ColumnOutcome>,
        policy: FitFailurePolicy,
    ) -> Result<Self, TraceError> {
        let cols = outcomes.len();
        let mut order1 = Array2::from_elem((rows, cols), EXCLUDED);
        let mut order2 = Array2::from_elem((rows, cols), EXCLUDED);
        let mut failed_columns = Vec::new();

        for (column, outcome) in outcomes.into_iter().enumerate() {
            let masks = match outcome {
                ColumnOutcome::Fitted(fit) => fit.masks,
                ColumnOutcome::Failed(source) => match policy {
                    FitFailurePolicy::Abort => {
                        return Err(TraceError::BatchFailed {
                            column,
                            filter,
                            source,
                        });
                    }
                    FitFailurePolicy::ExcludeColumn => {
                        log::warn!("excluding column {column} from both orders: {source}");
                        failed_columns.push(FailedColumn {
                            column,
                            reason: source.to_string(),
                        });
                        ColumnMasks::excluded(rows)
                    }
                },
            };
            order1.column_mut(column).assign(&masks.order1);
            order2.column_mut(column).assign(&masks.order2);
        }

        Ok(OrderMasks {
            subarray,
            filter,
            order1,
            order2,
            failed_columns,
            origin: ArtifactOrigin::Computed,
        })
    }

    /// Number of included pixels per order
    pub fn included_counts(&self) -> (usize, usize) {
        let count = |mask: &Array2<u8>| mask.iter().filter(|&&m| m != EXCLUDED).count();
        (count(&self.order1), count(&self.order2))
    }

    fn is_reusable_for(&self, subarray: Subarray, filter: Filter, cols: usize, policy: FitFailurePolicy) -> bool {
        self.filter == filter
            && self.order1.ncols() == cols
            && self.order1.dim() == self.order2.dim()
            && self.order1.nrows() == self.subarray.rows()
            && (policy == FitFailurePolicy::ExcludeColumn || self.failed_columns.is_empty())
            && self.trimmed(subarray).is_some()
    }
}

/// Fit every column of `frame` on a pool of `config.worker_threads()` threads.
///
/// Outcomes are returned in column order regardless of scheduling.
pub fn fit_columns(
    frame: ArrayView2<f64>,
    err: Option<ArrayView2<f64>>,
    filter: Filter,
    config: &MaskBuildConfig,
) -> Result<Vec<ColumnOutcome>, TraceError> {
    let cols = frame.ncols();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.worker_threads())
        .build()?;

    let progress = if config.show_progress {
        ProgressBar::new(cols as u64)
    } else {
        ProgressBar::hidden()
    };
    if let Ok(style) = ProgressStyle::default_bar().template("{msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})") {
        progress.set_style(style);
    }
    progress.set_message("Fitting columns");

    let outcomes = pool.install(|| {
        (0..cols)
            .into_par_iter()
            .map(|column| {
                let outcome = match isolate_signal(column, frame, filter, &config.isolate, err) {
                    Ok(fit) => ColumnOutcome::Fitted(fit),
                    Err(e) => {
                        log::debug!("column {column} failed: {e}");
                        ColumnOutcome::Failed(e)
                    }
                };
                progress.inc(1);
                outcome
            })
            .collect()
    });
    progress.finish_and_clear();

    Ok(outcomes)
}

/// Build (or load) the order 1 and order 2 exclusion masks for a frame.
///
/// Unless `recompute` is set, a cached artifact for the same filter and a
/// compatible subarray is returned directly. Otherwise, or when the artifact
/// is missing or unusable, the masks are computed exactly once and written to
/// the cache before returning.
///
/// `err` holds optional per-pixel uncertainties with the frame's shape.
pub fn build_order_masks(
    frame: ArrayView2<f64>,
    err: Option<ArrayView2<f64>>,
    subarray: Subarray,
    filter: Filter,
    config: &MaskBuildConfig,
    cache: &ArtifactCache,
    recompute: bool,
) -> Result<OrderMasks, TraceError> {
    validate_frame(frame, err, subarray)?;
    let path = cache.order_masks_path();

    if !recompute {
        match cache.load::<OrderMasks>(&path) {
            Ok(Some(cached)) => {
                if cached.is_reusable_for(subarray, filter, frame.ncols(), config.failure_policy) {
                    if let Some(mut masks) = cached.trimmed(subarray) {
                        log::info!("loaded {subarray} {filter} order masks from {}", path.display());
                        masks.origin = ArtifactOrigin::Cache;
                        return Ok(masks);
                    }
                }
                log::info!(
                    "cached order masks at {} ({} {}, {}x{}) do not match {subarray} {filter}; recomputing",
                    path.display(),
                    cached.subarray,
                    cached.filter,
                    cached.order1.nrows(),
                    cached.order1.ncols()
                );
            }
            Ok(None) => log::info!("no cached order masks at {}; computing", path.display()),
            Err(e) => log::warn!("{e}; recomputing order masks"),
        }
    }

    log::info!(
        "fitting {} columns of a {subarray} {filter} frame with {} threads",
        frame.ncols(),
        config.worker_threads()
    );
    let outcomes = fit_columns(frame, err, filter, config)?;
    let fitted = outcomes.iter().filter(|o| o.is_fitted()).count();
    let masks = OrderMasks::from_outcomes(
        subarray,
        filter,
        frame.nrows(),
        outcomes,
        config.failure_policy,
    )?;
    log::info!(
        "fitted {fitted}/{} columns, {} excluded after failed fits",
        frame.ncols(),
        masks.failed_columns.len()
    );

    cache.save(&path, &masks)?;
    Ok(masks)
}

fn validate_frame(
    frame: ArrayView2<f64>,
    err: Option<ArrayView2<f64>>,
    subarray: Subarray,
) -> Result<(), TraceError> {
    if frame.nrows() != subarray.rows() {
        return Err(TraceError::FrameShape {
            subarray,
            expected: subarray.rows(),
            rows: frame.nrows(),
        });
    }
    if frame.ncols() > DETECTOR_COLUMNS {
        return Err(TraceError::FrameTooWide {
            cols: frame.ncols(),
            max: DETECTOR_COLUMNS,
        });
    }
    if let Some(e) = err {
        if e.dim() != frame.dim() {
            return Err(TraceError::UncertaintyShape {
                expected: frame.dim(),
                got: e.dim(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::LmConfig;
    use crate::isolate::INCLUDED;
    use crate::psf::{batman, PsfParams};
    use crate::trace::trace_center;
    use tempfile::TempDir;

    /// Noise-free frame covering the first `cols` detector columns
    fn synthetic_frame(rows: usize, cols: usize, with_order2: bool) -> Array2<f64> {
        Array2::from_shape_fn((rows, cols), |(row, column)| {
            let order1 = PsfParams {
                center: trace_center(TraceOrder::First)[column] + 0.2,
                center_sigma: 3.0,
                center_amplitude: 6000.0,
                outer_sigma: 4.0,
                outer_amplitude: 1500.0,
                separation: 7.0,
            };
            let mut value = batman(row as f64, &order1);
            if with_order2 {
                let order2 = PsfParams {
                    center: trace_center(TraceOrder::Second)[column] - 0.2,
                    center_sigma: 2.5,
                    center_amplitude: 500.0,
                    outer_sigma: 3.5,
                    outer_amplitude: 150.0,
                    separation: 6.0,
                };
                value += batman(row as f64, &order2);
            }
            value
        })
    }

    fn test_config(n_jobs: usize) -> MaskBuildConfig {
        MaskBuildConfig {
            n_jobs,
            ..Default::default()
        }
    }

    fn temp_cache() -> (TempDir, ArtifactCache) {
        let dir = TempDir::new().unwrap();
        let cache = ArtifactCache::with_path(dir.path().to_path_buf());
        (dir, cache)
    }

    #[test]
    fn test_rejects_wrong_height() {
        let (_dir, cache) = temp_cache();
        let frame = Array2::<f64>::ones((100, 8));
        let result = build_order_masks(
            frame.view(),
            None,
            Subarray::Substrip256,
            Filter::Clear,
            &test_config(1),
            &cache,
            true,
        );
        assert!(matches!(
            result,
            Err(TraceError::FrameShape {
                expected: 256,
                rows: 100,
                ..
            })
        ));
    }

    #[test]
    fn test_rejects_too_wide() {
        let (_dir, cache) = temp_cache();
        let frame = Array2::<f64>::ones((96, DETECTOR_COLUMNS + 1));
        let result = build_order_masks(
            frame.view(),
            None,
            Subarray::Substrip96,
            Filter::Clear,
            &test_config(1),
            &cache,
            true,
        );
        assert!(matches!(result, Err(TraceError::FrameTooWide { .. })));
        assert!(!cache.order_masks_path().exists());
    }

    #[test]
    fn test_f277w_order2_fully_excluded() {
        let (_dir, cache) = temp_cache();
        let frame = synthetic_frame(256, 12, false);
        let masks = build_order_masks(
            frame.view(),
            None,
            Subarray::Substrip256,
            Filter::F277W,
            &test_config(2),
            &cache,
            true,
        )
        .unwrap();

        assert_eq!(masks.shape(), (256, 12));
        assert!(masks.order2.iter().all(|&m| m == EXCLUDED));
        for column in 0..12 {
            assert!(masks.order1.column(column).iter().any(|&m| m == INCLUDED));
        }
    }

    #[test]
    fn test_worker_count_does_not_change_result() {
        let frame = synthetic_frame(256, 16, true);
        let (_d1, cache1) = temp_cache();
        let (_d8, cache8) = temp_cache();

        let serial = build_order_masks(
            frame.view(),
            None,
            Subarray::Substrip256,
            Filter::Clear,
            &test_config(1),
            &cache1,
            true,
        )
        .unwrap();
        let parallel = build_order_masks(
            frame.view(),
            None,
            Subarray::Substrip256,
            Filter::Clear,
            &test_config(8),
            &cache8,
            true,
        )
        .unwrap();

        assert_eq!(serial.order1, parallel.order1);
        assert_eq!(serial.order2, parallel.order2);
        assert!(serial.order2.iter().any(|&m| m == INCLUDED));
    }

    #[test]
    fn test_cache_roundtrip_is_bit_identical() {
        let (_dir, cache) = temp_cache();
        let frame = synthetic_frame(256, 8, true);
        let config = test_config(4);

        let computed = build_order_masks(
            frame.view(),
            None,
            Subarray::Substrip256,
            Filter::Clear,
            &config,
            &cache,
            true,
        )
        .unwrap();
        assert_eq!(computed.origin, ArtifactOrigin::Computed);

        let loaded = build_order_masks(
            frame.view(),
            None,
            Subarray::Substrip256,
            Filter::Clear,
            &config,
            &cache,
            false,
        )
        .unwrap();
        assert_eq!(loaded.origin, ArtifactOrigin::Cache);
        assert_eq!(loaded.order1, computed.order1);
        assert_eq!(loaded.order2, computed.order2);
    }

    #[test]
    fn test_substrip96_trims_substrip256_artifact() {
        let (_dir, cache) = temp_cache();
        let frame256 = synthetic_frame(256, 8, true);
        let config = test_config(2);

        let full = build_order_masks(
            frame256.view(),
            None,
            Subarray::Substrip256,
            Filter::Clear,
            &config,
            &cache,
            true,
        )
        .unwrap();

        let frame96 = frame256.slice(s![..96, ..]).to_owned();
        let trimmed = build_order_masks(
            frame96.view(),
            None,
            Subarray::Substrip96,
            Filter::Clear,
            &config,
            &cache,
            false,
        )
        .unwrap();

        assert_eq!(trimmed.origin, ArtifactOrigin::Cache);
        assert_eq!(trimmed.subarray, Subarray::Substrip96);
        assert_eq!(trimmed.order1, full.order1.slice(s![..96, ..]));
        assert_eq!(trimmed.order2, full.order2.slice(s![..96, ..]));
    }

    #[test]
    fn test_filter_mismatch_recomputes() {
        let (_dir, cache) = temp_cache();
        let frame = synthetic_frame(256, 6, true);
        let config = test_config(2);

        build_order_masks(
            frame.view(),
            None,
            Subarray::Substrip256,
            Filter::Clear,
            &config,
            &cache,
            true,
        )
        .unwrap();

        let f277w = build_order_masks(
            frame.view(),
            None,
            Subarray::Substrip256,
            Filter::F277W,
            &config,
            &cache,
            false,
        )
        .unwrap();
        assert_eq!(f277w.origin, ArtifactOrigin::Computed);
        assert!(f277w.order2.iter().all(|&m| m == EXCLUDED));

        let reloaded: OrderMasks = cache.load(&cache.order_masks_path()).unwrap().unwrap();
        assert_eq!(reloaded.filter, Filter::F277W);
    }

    #[test]
    fn test_model_mismatch_columns_build_under_abort() {
        // Constant background plus order 2 light under both filters
        let (_dir, cache) = temp_cache();
        let frame = synthetic_frame(256, 6, true) + 20.0;
        let config = test_config(2);
        assert_eq!(config.failure_policy, FitFailurePolicy::Abort);

        for filter in [Filter::Clear, Filter::F277W] {
            let masks = build_order_masks(
                frame.view(),
                None,
                Subarray::Substrip256,
                filter,
                &config,
                &cache,
                true,
            )
            .unwrap();
            assert!(masks.failed_columns.is_empty());
            for column in 0..6 {
                let center = trace_center(TraceOrder::First)[column] + 0.2;
                assert_eq!(masks.order1[[center.round() as usize, column]], INCLUDED);
            }
        }
    }

    #[test]
    fn test_corrupt_cache_recomputes_once() {
        let (_dir, cache) = temp_cache();
        std::fs::write(cache.order_masks_path(), b"\x00\x01 not an artifact").unwrap();
        let frame = synthetic_frame(256, 4, false);

        let masks = build_order_masks(
            frame.view(),
            None,
            Subarray::Substrip256,
            Filter::F277W,
            &test_config(1),
            &cache,
            false,
        )
        .unwrap();
        assert_eq!(masks.origin, ArtifactOrigin::Computed);

        let reloaded: OrderMasks = cache.load(&cache.order_masks_path()).unwrap().unwrap();
        assert_eq!(reloaded.order1, masks.order1);
    }

    #[test]
    fn test_abort_policy_reports_lowest_failing_column() {
        let (_dir, cache) = temp_cache();
        let mut frame = synthetic_frame(256, 6, false);
        frame.column_mut(2).fill(0.0);
        frame.column_mut(4).fill(0.0);

        let err = build_order_masks(
            frame.view(),
            None,
            Subarray::Substrip256,
            Filter::F277W,
            &test_config(3),
            &cache,
            true,
        )
        .unwrap_err();

        match err {
            TraceError::BatchFailed { column, filter, .. } => {
                assert_eq!(column, 2);
                assert_eq!(filter, Filter::F277W);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!cache.order_masks_path().exists());
    }

    #[test]
    fn test_exclude_policy_marks_failed_columns() {
        let (_dir, cache) = temp_cache();
        let mut frame = synthetic_frame(256, 5, false);
        frame.column_mut(3).fill(0.0);
        let config = MaskBuildConfig {
            n_jobs: 2,
            failure_policy: FitFailurePolicy::ExcludeColumn,
            ..Default::default()
        };

        let masks = build_order_masks(
            frame.view(),
            None,
            Subarray::Substrip256,
            Filter::F277W,
            &config,
            &cache,
            true,
        )
        .unwrap();

        assert_eq!(masks.failed_columns.len(), 1);
        assert_eq!(masks.failed_columns[0].column, 3);
        assert!(masks.order1.column(3).iter().all(|&m| m == EXCLUDED));
        assert!(masks.order1.column(2).iter().any(|&m| m == INCLUDED));

        // An artifact with failed columns is not reused when failures must abort
        let strict = test_config(2);
        let result = build_order_masks(
            frame.view(),
            None,
            Subarray::Substrip256,
            Filter::F277W,
            &strict,
            &cache,
            false,
        );
        assert!(matches!(result, Err(TraceError::BatchFailed { column: 3, .. })));
    }

    #[test]
    fn test_timeout_failure_is_reported_per_column() {
        let frame = synthetic_frame(256, 3, false);
        let mut config = test_config(1);
        config.isolate.lm = LmConfig {
            max_duration: Some(std::time::Duration::ZERO),
            ..Default::default()
        };

        let outcomes = fit_columns(frame.view(), None, Filter::F277W, &config).unwrap();
        assert_eq!(outcomes.len(), 3);
        for (column, outcome) in outcomes.iter().enumerate() {
            match outcome {
                ColumnOutcome::Failed(e) => assert_eq!(e.column(), Some(column)),
                ColumnOutcome::Fitted(_) => panic!("column {column} should have timed out"),
            }
        }
    }

    #[test]
    fn test_apply_zeroes_excluded_pixels() {
        let (_dir, cache) = temp_cache();
        let frame = synthetic_frame(256, 4, false);
        let masks = build_order_masks(
            frame.view(),
            None,
            Subarray::Substrip256,
            Filter::F277W,
            &test_config(1),
            &cache,
            true,
        )
        .unwrap();

        let signal = masks.apply(frame.view(), TraceOrder::First).unwrap();
        for ((idx, &value), &m) in signal.indexed_iter().zip(masks.order1.iter()) {
            if m == EXCLUDED {
                assert_eq!(value, 0.0);
            } else {
                assert_eq!(value, frame[idx]);
            }
        }
        assert!(masks
            .apply(frame.view(), TraceOrder::Second)
            .unwrap()
            .iter()
            .all(|&v| v == 0.0));

        let wrong = Array2::<f64>::zeros((96, 4));
        assert!(masks.apply(wrong.view(), TraceOrder::First).is_err());
    }

    #[test]
    fn test_trimmed_rejects_growing() {
        let masks = OrderMasks {
            subarray: Subarray::Substrip96,
            filter: Filter::Clear,
            order1: Array2::from_elem((96, 2), EXCLUDED),
            order2: Array2::from_elem((96, 2), EXCLUDED),
            failed_columns: Vec::new(),
            origin: ArtifactOrigin::Computed,
        };
        assert!(masks.trimmed(Subarray::Substrip256).is_none());
        assert!(masks.trimmed(Subarray::Full).is_none());
        assert_eq!(masks.trimmed(Subarray::Substrip96).unwrap(), masks);
    }
}
