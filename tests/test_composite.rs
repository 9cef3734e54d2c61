use chrono::NaiveDate;
use ndarray::array;
use verdure::core::composite::{composite_bands, temporal_composite, CompositeParams};
use verdure::core::feature_matrix::{build_feature_matrix, FeatureMatrixParams};
use verdure::core::pipeline::{composite_reflectance, RunReport};
use verdure::types::{Crs, GeoTransform, Raster, SampleImage, Tile, VerdureError};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn raster(data: SampleImage, x: f64) -> Raster {
    Raster::new(data, GeoTransform::north_up(x, 90.0, 30.0, 30.0), Crs::Epsg(32615))
}

fn tile(band: &str, day: u32, x: f64, data: SampleImage) -> Tile {
    Tile {
        band: band.to_string(),
        acquired: NaiveDate::from_ymd_opt(2023, 6, day).expect("valid date"),
        tile_id: format!("T15RY{}", if x == 0.0 { "P" } else { "Q" }),
        raster: raster(data, x),
    }
}

#[test]
fn test_median_skips_invalid_date() {
    init();
    let dates = vec![
        raster(array![[0.2]], 0.0),
        raster(array![[-0.1]], 0.0),
        raster(array![[0.4]], 0.0),
    ];
    let composite = temporal_composite(&dates, &CompositeParams::default()).expect("composite");
    approx::assert_abs_diff_eq!(composite.data[[0, 0]], 0.3, epsilon = 1e-6);
}

#[test]
fn test_single_valid_date_is_exact() {
    init();
    let dates = vec![
        raster(array![[0.1234567, 0.0]], 0.0),
        raster(array![[f32::NAN, -0.5]], 0.0),
    ];
    let composite = temporal_composite(&dates, &CompositeParams::default()).expect("composite");
    assert_eq!(composite.data[[0, 0]], 0.1234567);
    // Every date invalid: missing, never zero
    assert!(composite.data[[0, 1]].is_nan());
}

#[test]
fn test_two_tiles_two_dates_to_feature_table() {
    init();
    let tiles = vec![
        tile("B04", 1, 0.0, array![[0.10, 0.20]]),
        tile("B04", 1, 60.0, array![[0.30, f32::NAN]]),
        tile("B04", 9, 0.0, array![[0.12, 0.22]]),
        tile("B04", 9, 60.0, array![[0.32, 0.40]]),
        tile("B05", 1, 0.0, array![[0.50, 0.60]]),
        tile("B05", 1, 60.0, array![[0.70, 0.80]]),
        tile("B10", 1, 0.0, array![[290.0, 291.0]]),
    ];

    let mut report = RunReport::default();
    let bands = vec!["B04".to_string(), "B05".to_string(), "B10".to_string()];
    let composite = composite_reflectance(&tiles, &bands, &CompositeParams::default(), &mut report)
        .expect("composite");
    assert_eq!(composite.band_names, vec!["B04", "B05", "B10"]);
    assert_eq!(composite.shape(), (1, 4));
    assert!(report.is_clean());

    let b04 = composite.band("B04").expect("B04 present");
    approx::assert_abs_diff_eq!(b04.data[[0, 0]], 0.11, epsilon = 1e-6);
    // Only the second date covers this pixel
    approx::assert_abs_diff_eq!(b04.data[[0, 3]], 0.40, epsilon = 1e-6);

    let table = build_feature_matrix(&composite, &FeatureMatrixParams::dropping_band_numbers(&[10, 11]))
        .expect("feature matrix");
    assert_eq!(table.band_names, vec!["B04", "B05"]);
    assert_eq!(table.n_rows(), 4);
    assert_eq!(table.coords[3], (105.0, 75.0));
}

#[test]
fn test_missing_band_only_fails_that_band() {
    init();
    let tiles = vec![tile("B04", 1, 0.0, array![[0.1]])];
    let outcome = composite_bands(
        &tiles,
        &["B04".to_string(), "B05".to_string()],
        &CompositeParams::default(),
    );
    assert_eq!(outcome.composite.expect("B04 composited").band_names, vec!["B04"]);
    assert_eq!(outcome.failures.len(), 1);
    assert!(matches!(outcome.failures[0].1, VerdureError::MissingBand(ref b) if b == "B05"));
}
