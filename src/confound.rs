//! Confound removal by ordinary least squares

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

use crate::error::{EncodingError, Result};
use crate::linalg::pinv_symmetric;

/// Sentence durations as a one-column covariate matrix
pub fn duration_covariate(durations: ArrayView1<f64>) -> Array2<f64> {
    durations.to_owned().insert_axis(Axis(1))
}

/// Regress `covariates` out of every column of `x` and return the residuals.
///
/// A covariate whose standard deviation (over all entries) does not exceed
/// `min_std` cannot explain anything, so `x` is returned unchanged.
pub fn remove_confound(
    x: ArrayView2<f64>,
    covariates: ArrayView2<f64>,
    min_std: f64,
) -> Result<Array2<f64>> {
    if x.nrows() != covariates.nrows() {
        return Err(EncodingError::Shape(format!(
            "{} samples but {} covariate rows",
            x.nrows(),
            covariates.nrows()
        )));
    }
    let n_entries = covariates.len();
    if n_entries == 0 {
        return Ok(x.to_owned());
    }
    let grand_mean = covariates.sum() / n_entries as f64;
    let spread = (covariates.iter().map(|c| (c - grand_mean).powi(2)).sum::<f64>()
        / n_entries as f64)
        .sqrt();
    if spread < min_std {
        return Ok(x.to_owned());
    }

    let empty = || EncodingError::Shape("cannot regress an empty matrix".into());
    let c_mean: Array1<f64> = covariates.mean_axis(Axis(0)).ok_or_else(empty)?;
    let x_mean: Array1<f64> = x.mean_axis(Axis(0)).ok_or_else(empty)?;
    let cc = &covariates - &c_mean;
    let xc = &x - &x_mean;

    // β = (CᵀC)⁺ Cᵀ X on centered data; the intercept is absorbed by centering
    let beta = pinv_symmetric(&cc.t().dot(&cc)).dot(&cc.t().dot(&xc));
    Ok(xc - cc.dot(&beta))
}

/// [`remove_confound`] for a single covariate vector
pub fn remove_confound_vector(
    x: ArrayView2<f64>,
    covariate: ArrayView1<f64>,
    min_std: f64,
) -> Result<Array2<f64>> {
    remove_confound(x, duration_covariate(covariate).view(), min_std)
}
