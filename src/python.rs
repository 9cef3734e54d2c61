use crate::core::composite::{composite_layers, CompositeParams, CompositeStatistic};
use crate::core::patch_analysis::{analyze_patches as analyze, Connectivity, PatchParams};
use crate::core::quality_mask::{disqualifying_bitmask, is_usable};
use crate::core::spectral_index::normalized_difference_array;
use crate::types::VerdureError;
use ndarray::Axis;
use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2, PyReadonlyArray3};
use pyo3::prelude::*;

impl From<VerdureError> for PyErr {
    fn from(e: VerdureError) -> Self {
        PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(format!("{}", e))
    }
}

/// Python module definition
#[pymodule]
fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(decode_quality_mask, m)?)?;
    m.add_function(wrap_pyfunction!(analyze_patches, m)?)?;
    m.add_function(wrap_pyfunction!(composite_median, m)?)?;
    m.add_function(wrap_pyfunction!(ndvi, m)?)?;
    Ok(())
}

/// Boolean usable-pixel mask from an 8-bit quality array
#[pyfunction]
#[pyo3(signature = (flags, mask_bits, nodata = None))]
fn decode_quality_mask<'py>(
    py: Python<'py>,
    flags: PyReadonlyArray2<'py, u8>,
    mask_bits: Vec<u8>,
    nodata: Option<u8>,
) -> PyResult<&'py PyArray2<bool>> {
    let bitmask = disqualifying_bitmask(&mask_bits)?;
    let usable = flags.as_array().mapv(|byte| is_usable(byte, bitmask, nodata));
    Ok(usable.into_pyarray(py))
}

/// (total_pixels, vegetation_pixels, patch_count, mean_patch_size, edge_density)
#[pyfunction]
#[pyo3(signature = (index, threshold = 0.3, eight_connected = false))]
fn analyze_patches(
    index: PyReadonlyArray2<'_, f32>,
    threshold: f32,
    eight_connected: bool,
) -> (usize, usize, usize, f64, f64) {
    let params = PatchParams {
        threshold,
        connectivity: if eight_connected {
            Connectivity::Eight
        } else {
            Connectivity::Four
        },
    };
    let stats = analyze(index.as_array(), &params);
    (
        stats.total_pixels,
        stats.vegetation_pixels,
        stats.patch_count,
        stats.mean_patch_size,
        stats.edge_density,
    )
}

/// Median over the first axis of a (date, row, col) stack on one grid
#[pyfunction]
#[pyo3(signature = (stack, validity_threshold = 0.0))]
fn composite_median<'py>(
    py: Python<'py>,
    stack: PyReadonlyArray3<'py, f32>,
    validity_threshold: f32,
) -> PyResult<&'py PyArray2<f32>> {
    let view = stack.as_array();
    let layers: Vec<_> = view.axis_iter(Axis(0)).collect();
    let params = CompositeParams {
        validity_threshold,
        statistic: CompositeStatistic::Median,
    };
    Ok(composite_layers(&layers, &params)?.into_pyarray(py))
}

/// (nir - red) / (nir + red)
#[pyfunction]
fn ndvi<'py>(
    py: Python<'py>,
    red: PyReadonlyArray2<'py, f32>,
    nir: PyReadonlyArray2<'py, f32>,
) -> PyResult<&'py PyArray2<f32>> {
    Ok(normalized_difference_array(nir.as_array(), red.as_array())?.into_pyarray(py))
}
