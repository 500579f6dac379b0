//! Region-of-interest voxel selection
//!
//! The ROI is defined once per run by fitting the mid-layer model on *all*
//! sentences and keeping the voxels with the highest in-sample correlation.
//! Because those sentences are later reused as cross-validation test folds,
//! this stage leaks a little information into the fold scores. It is kept that
//! way on purpose: a single fold-independent ROI is stable and interpretable,
//! and the reported correlation magnitudes are defined relative to it.

use ndarray::{Array2, ArrayView2, Axis};
use tracing::debug;

use crate::config::EncodingConfig;
use crate::confound::remove_confound;
use crate::error::{EncodingError, Result};
use crate::linalg::{column_correlations, Pca, Ridge};

/// Training correlation assigned to voxels without a defined correlation
pub const UNDEFINED_SCORE: f64 = -1.0;

/// Voxels retained for cross-validated scoring, worst to best
#[derive(Debug, Clone, PartialEq)]
pub struct VoxelSelection {
    /// Indices into the response's voxel axis, in ascending score order
    pub indices: Vec<usize>,
    /// In-sample correlation of each selected voxel
    pub scores: Vec<f64>,
}

impl VoxelSelection {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Restrict a (sentence, voxel) matrix to the selected voxels
    pub fn restrict(&self, response: ArrayView2<f64>) -> Array2<f64> {
        response.select(Axis(1), &self.indices)
    }
}

/// In-sample correlation of every voxel under the full-data mid-layer fit
pub fn training_correlations(
    response: ArrayView2<f64>,
    features: ArrayView2<f64>,
    covariates: ArrayView2<f64>,
    config: &EncodingConfig,
) -> Result<Vec<f64>> {
    let n = response.nrows();
    if features.nrows() != n || covariates.nrows() != n {
        return Err(EncodingError::Shape(format!(
            "voxel selection got {n} responses, {} feature rows, {} covariate rows",
            features.nrows(),
            covariates.nrows()
        )));
    }

    let n_components = config.roi.pca_components.min(n.saturating_sub(1));
    let (_, reduced) = Pca::fit_transform(features, n_components)?;
    let x = remove_confound(reduced.view(), covariates, config.min_std)?;
    let y = remove_confound(response, covariates, config.min_std)?;

    let ridge = Ridge::fit(x.view(), y.view(), config.roi.alpha)?;
    let predicted = ridge.predict(x.view())?;

    Ok(column_correlations(&predicted, &y, config.min_std)
        .into_iter()
        .map(|r| r.unwrap_or(UNDEFINED_SCORE))
        .collect())
}

/// Keep the `config.roi.size` voxels with the highest training correlation,
/// or every voxel if there are fewer.
pub fn select_voxels(
    response: ArrayView2<f64>,
    features: ArrayView2<f64>,
    covariates: ArrayView2<f64>,
    config: &EncodingConfig,
) -> Result<VoxelSelection> {
    let correlations = training_correlations(response, features, covariates, config)?;

    let mut order: Vec<usize> = (0..correlations.len()).collect();
    order.sort_by(|&a, &b| correlations[a].total_cmp(&correlations[b]));
    let keep = config.roi.size.min(order.len());
    let indices = order.split_off(order.len() - keep);
    let scores = indices.iter().map(|&v| correlations[v]).collect();

    debug!(
        "Selected {} of {} voxels",
        indices.len(),
        correlations.len()
    );
    Ok(VoxelSelection { indices, scores })
}
