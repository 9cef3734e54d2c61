//! Spectral vegetation indices

use crate::types::{Raster, Sample, SampleImage, VerdureError, VerdureResult};
use ndarray::{ArrayView2, Zip};

/// `(a - b) / (a + b)` per pixel.
///
/// Missing where either input is missing or the denominator vanishes.
pub fn normalized_difference_array(a: ArrayView2<Sample>, b: ArrayView2<Sample>) -> VerdureResult<SampleImage> {
    if a.dim() != b.dim() {
        return Err(VerdureError::ShapeMismatch {
            expected: a.dim(),
            found: b.dim(),
        });
    }

    let mut out = SampleImage::from_elem(a.dim(), Sample::NAN);
    Zip::from(&mut out).and(&a).and(&b).par_for_each(|o, &va, &vb| {
        if va.is_nan() || vb.is_nan() {
            return;
        }
        let sum = va + vb;
        if sum.abs() < 1e-10 {
            return;
        }
        *o = (va - vb) / sum;
    });

    Ok(out)
}

/// Normalized difference of two rasters on the same grid
pub fn normalized_difference(a: &Raster, b: &Raster) -> VerdureResult<Raster> {
    a.ensure_same_grid(b)?;
    let data = normalized_difference_array(a.data.view(), b.data.view())?;
    Ok(a.with_data(data))
}

/// Normalized Difference Vegetation Index: (NIR - Red) / (NIR + Red)
pub fn ndvi(red: &Raster, nir: &Raster) -> VerdureResult<Raster> {
    log::debug!("Computing NDVI over {:?} pixels", red.shape());
    normalized_difference(nir, red)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Crs, GeoTransform};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn raster(data: SampleImage) -> Raster {
        Raster::new(data, GeoTransform::north_up(0.0, 0.0, 0.6, 0.6), Crs::Epsg(26916))
    }

    #[test]
    fn test_ndvi_values() {
        let red = raster(array![[50.0, 100.0], [0.0, 80.0]]);
        let nir = raster(array![[150.0, 100.0], [0.0, Sample::NAN]]);
        let index = ndvi(&red, &nir).unwrap();
        assert_abs_diff_eq!(index.data[[0, 0]], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(index.data[[0, 1]], 0.0, epsilon = 1e-6);
        // Zero denominator and missing input stay missing
        assert!(index.data[[1, 0]].is_nan());
        assert!(index.data[[1, 1]].is_nan());
    }

    #[test]
    fn test_shape_mismatch() {
        let a = array![[1.0f32, 2.0]];
        let b = array![[1.0f32], [2.0]];
        assert!(normalized_difference_array(a.view(), b.view()).is_err());
    }
}
