//! End-to-end mask construction on synthetic SOSS frames with read noise.

use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use soss_trace::{
    batman, batmen, build_order_masks, trace_center, ArtifactCache, ArtifactOrigin, Filter,
    FitFailurePolicy, MaskBuildConfig, PsfParams, Subarray, TraceError, TraceOrder, EXCLUDED,
    INCLUDED,
};
use tempfile::TempDir;

const READ_NOISE: f64 = 5.0;

fn order1_profile(column: usize) -> PsfParams {
    PsfParams {
        center: trace_center(TraceOrder::First)[column] - 0.35,
        center_sigma: 2.8,
        center_amplitude: 9000.0,
        outer_sigma: 3.8,
        outer_amplitude: 2500.0,
        separation: 7.5,
    }
}

fn order2_profile(column: usize) -> PsfParams {
    PsfParams {
        center: trace_center(TraceOrder::Second)[column] + 0.25,
        center_sigma: 2.6,
        center_amplitude: 700.0,
        outer_sigma: 3.4,
        outer_amplitude: 220.0,
        separation: 6.5,
    }
}

/// Frame of the first `cols` detector columns with Gaussian read noise
fn noisy_frame(rows: usize, cols: usize, with_order2: bool, seed: u64) -> Array2<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let noise = Normal::new(0.0, READ_NOISE).unwrap();
    let mut frame = Array2::zeros((rows, cols));
    for ((row, column), value) in frame.indexed_iter_mut() {
        let x = row as f64;
        let signal = if with_order2 {
            batmen(x, &order2_profile(column), &order1_profile(column))
        } else {
            batman(x, &order1_profile(column))
        };
        *value = signal + noise.sample(&mut rng);
    }
    frame
}

fn temp_cache() -> (TempDir, ArtifactCache) {
    let dir = TempDir::new().unwrap();
    let cache = ArtifactCache::with_path(dir.path().to_path_buf());
    (dir, cache)
}

fn assert_center_included(mask: &Array2<u8>, column: usize, center: f64) {
    let row = center.round() as usize;
    assert_eq!(mask[[row, column]], INCLUDED, "column {column}, row {row}");
}

#[test]
fn test_noisy_substrip256_masks_follow_traces() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (_dir, cache) = temp_cache();
    let frame = noisy_frame(256, 24, true, 7);
    let err = Array2::from_elem(frame.dim(), READ_NOISE);

    let config = MaskBuildConfig {
        n_jobs: 4,
        ..Default::default()
    };
    let masks = build_order_masks(
        frame.view(),
        Some(err.view()),
        Subarray::Substrip256,
        Filter::Clear,
        &config,
        &cache,
        true,
    )
    .unwrap();

    assert_eq!(masks.shape(), (256, 24));
    assert!(masks.failed_columns.is_empty());
    for column in 0..24 {
        let c1 = order1_profile(column).center;
        let c2 = order2_profile(column).center;
        assert_center_included(&masks.order1, column, c1);
        assert_center_included(&masks.order2, column, c2);

        // Far from either trace nothing is signal
        assert_eq!(masks.order1[[(c1 - 40.0) as usize, column]], EXCLUDED);
        assert_eq!(masks.order1[[0, column]], EXCLUDED);
        assert_eq!(masks.order2[[(c2 + 40.0) as usize, column]], EXCLUDED);
        assert_eq!(masks.order2[[255, column]], EXCLUDED);
    }
}

#[test]
fn test_full_frame_masks() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (_dir, cache) = temp_cache();
    let frame = noisy_frame(2048, 3, true, 11);

    let masks = build_order_masks(
        frame.view(),
        None,
        Subarray::Full,
        Filter::Clear,
        &MaskBuildConfig::default(),
        &cache,
        true,
    )
    .unwrap();

    assert_eq!(masks.shape(), (2048, 3));
    for column in 0..3 {
        assert_center_included(&masks.order2, column, order2_profile(column).center);
        // Only a few dozen rows around each trace are included
        let included = masks.order1.column(column).iter().filter(|&&m| m == INCLUDED).count();
        assert!(included > 10 && included < 60, "column {column}: {included}");
    }
}

#[test]
fn test_failed_column_is_excluded_and_cached() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (_dir, cache) = temp_cache();
    let mut frame = noisy_frame(256, 6, false, 3);
    frame[[120, 4]] = f64::NAN;

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
    assert_eq!(masks.failed_columns[0].column, 4);
    assert!(masks.failed_columns[0].reason.contains("row 120"));
    assert!(masks.order1.column(4).iter().all(|&m| m == EXCLUDED));
    assert!(masks.order2.iter().all(|&m| m == EXCLUDED));

    let reloaded = build_order_masks(
        frame.view(),
        None,
        Subarray::Substrip256,
        Filter::F277W,
        &config,
        &cache,
        false,
    )
    .unwrap();
    assert_eq!(reloaded.origin, ArtifactOrigin::Cache);
    assert_eq!(reloaded.failed_columns, masks.failed_columns);
    assert_eq!(reloaded.order1, masks.order1);
}

#[test]
fn test_abort_reports_column_and_filter() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (_dir, cache) = temp_cache();
    let mut frame = noisy_frame(256, 4, true, 5);
    frame[[10, 1]] = f64::INFINITY;

    let err = build_order_masks(
        frame.view(),
        None,
        Subarray::Substrip256,
        Filter::Clear,
        &MaskBuildConfig::default(),
        &cache,
        true,
    )
    .unwrap_err();

    assert!(matches!(err, TraceError::BatchFailed { column: 1, .. }));
    let message = err.to_string();
    assert!(message.contains("column 1"), "{message}");
    assert!(message.contains("CLEAR"), "{message}");
}

#[test]
fn test_config_file_drives_build() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (dir, cache) = temp_cache();
    let config_path = dir.path().join("build.json");
    std::fs::write(
        &config_path,
        r#"{ "n_jobs": 1, "isolate": { "radius": 6 } }"#,
    )
    .unwrap();
    let config = MaskBuildConfig::load_from_file(&config_path).unwrap();
    let frame = noisy_frame(96, 4, false, 9);

    let masks = build_order_masks(
        frame.view(),
        None,
        Subarray::Substrip96,
        Filter::F277W,
        &config,
        &cache,
        true,
    )
    .unwrap();

    // Rows strictly within 6 px of the fitted center: 11 or 12 per column
    for column in 0..4 {
        let included = masks.order1.column(column).iter().filter(|&&m| m == INCLUDED).count();
        assert!((11..=12).contains(&included), "column {column}: {included}");
    }
}
