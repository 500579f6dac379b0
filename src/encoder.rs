//! Cross-validated per-layer encoding models
//!
//! For every layer, sentences are split into shuffled folds. Within a fold the
//! duration confound is removed from train and test separately, PCA is fitted
//! on the training features only, and the ridge penalty is chosen by
//! leave-one-out on the training split. The layer score is the mean over folds
//! of the mean held-out voxel correlation.

use ndarray::{Array2, ArrayView2, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::EncodingConfig;
use crate::confound::remove_confound;
use crate::embeddings::EmbeddingTensor;
use crate::error::{EncodingError, Result};
use crate::linalg::{column_correlations, Pca, Ridge};

/// One train/test partition
#[derive(Debug, Clone, PartialEq)]
pub struct Fold {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Shuffled K-fold partitioning with a fixed seed
#[derive(Debug, Clone, Copy)]
pub struct KFold {
    n_splits: usize,
    seed: u64,
}

impl KFold {
    pub fn new(n_splits: usize, seed: u64) -> Self {
        Self { n_splits, seed }
    }

    /// Partition `n` samples.
    ///
    /// The first `n % k` folds hold one extra sample. Training indices are in
    /// ascending order.
    pub fn split(&self, n: usize) -> Result<Vec<Fold>> {
        if self.n_splits < 2 {
            return Err(EncodingError::Config(format!(
                "K-fold needs at least 2 splits, got {}",
                self.n_splits
            )));
        }
        if n < self.n_splits {
            return Err(EncodingError::Numerical(format!(
                "cannot split {n} samples into {} folds",
                self.n_splits
            )));
        }

        let mut order: Vec<usize> = (0..n).collect();
        let mut rng = rand::rngs::StdRng::seed_from_u64(self.seed);
        order.shuffle(&mut rng);

        let base = n / self.n_splits;
        let extra = n % self.n_splits;
        let mut folds = Vec::with_capacity(self.n_splits);
        let mut start = 0;
        for k in 0..self.n_splits {
            let size = base + usize::from(k < extra);
            let test = order[start..start + size].to_vec();
            let mut train: Vec<usize> = order[..start]
                .iter()
                .chain(&order[start + size..])
                .copied()
                .collect();
            train.sort_unstable();
            folds.push(Fold { train, test });
            start += size;
        }
        Ok(folds)
    }
}

/// Cross-validated score of one layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerScore {
    pub layer: usize,
    /// Mean of `fold_scores`
    pub mean: f64,
    pub fold_scores: Vec<f64>,
}

/// Mean held-out correlation of one fold; 0 when no voxel is defined
fn fold_score(
    features: ArrayView2<f64>,
    response: ArrayView2<f64>,
    covariates: ArrayView2<f64>,
    fold: &Fold,
    config: &EncodingConfig,
) -> Result<f64> {
    let x_train = features.select(Axis(0), &fold.train);
    let x_test = features.select(Axis(0), &fold.test);
    let c_train = covariates.select(Axis(0), &fold.train);
    let c_test = covariates.select(Axis(0), &fold.test);

    // Each split is deconfounded with its own fit so nothing crosses the boundary
    let y_train = remove_confound(
        response.select(Axis(0), &fold.train).view(),
        c_train.view(),
        config.min_std,
    )?;
    let y_test = remove_confound(
        response.select(Axis(0), &fold.test).view(),
        c_test.view(),
        config.min_std,
    )?;

    let n_components = config.pca_components.min(fold.train.len().saturating_sub(1));
    let pca = Pca::fit(x_train.view(), n_components)?;
    let x_train = remove_confound(pca.transform(x_train.view())?.view(), c_train.view(), config.min_std)?;
    let x_test = remove_confound(pca.transform(x_test.view())?.view(), c_test.view(), config.min_std)?;

    let ridge = Ridge::fit_cv(x_train.view(), y_train.view(), &config.cv.alphas)?;
    let predicted = ridge.predict(x_test.view())?;

    let correlations: Vec<f64> = column_correlations(&predicted, &y_test, config.min_std)
        .into_iter()
        .flatten()
        .collect();
    debug!(
        "fold: {} train, {} test, alpha {}, {} valid voxels",
        fold.train.len(),
        fold.test.len(),
        ridge.alpha(),
        correlations.len()
    );
    if correlations.is_empty() {
        Ok(0.0)
    } else {
        Ok(correlations.iter().sum::<f64>() / correlations.len() as f64)
    }
}

/// Cross-validated score of one layer's (sentence, dim) features against the
/// ROI-restricted responses.
///
/// A fold whose fit is numerically impossible (for instance constant
/// features) scores 0, like a fold without defined correlations.
pub fn encode_layer(
    layer: usize,
    features: ArrayView2<f64>,
    response: ArrayView2<f64>,
    covariates: ArrayView2<f64>,
    folds: &[Fold],
    config: &EncodingConfig,
) -> Result<LayerScore> {
    let n = response.nrows();
    if features.nrows() != n || covariates.nrows() != n {
        return Err(EncodingError::Shape(format!(
            "layer {layer}: {} feature rows, {n} responses, {} covariate rows",
            features.nrows(),
            covariates.nrows()
        )));
    }
    if folds.is_empty() {
        return Err(EncodingError::Config("no cross-validation folds".into()));
    }

    let mut fold_scores = Vec::with_capacity(folds.len());
    for fold in folds {
        let score = match fold_score(features, response, covariates, fold, config) {
            Ok(score) => score,
            Err(EncodingError::Numerical(reason)) => {
                debug!("Layer {}: fold without a usable fit ({})", layer, reason);
                0.0
            }
            Err(e) => return Err(e),
        };
        fold_scores.push(score);
    }

    let mean = fold_scores.iter().sum::<f64>() / fold_scores.len() as f64;
    Ok(LayerScore {
        layer,
        mean,
        fold_scores,
    })
}

/// Score every layer of a run with one shared fold partition
pub fn encode_layers(
    embeddings: &EmbeddingTensor,
    response: &Array2<f64>,
    covariates: &Array2<f64>,
    config: &EncodingConfig,
) -> Result<Vec<LayerScore>> {
    let folds = KFold::new(config.cv.folds, config.cv.seed).split(response.nrows())?;

    let mut scores = Vec::with_capacity(embeddings.n_layers());
    for layer in 0..embeddings.n_layers() {
        let score = encode_layer(
            layer,
            embeddings.layer(layer),
            response.view(),
            covariates.view(),
            &folds,
            config,
        )?;
        info!("  L{:02}: CV-r={:.4}", layer, score.mean);
        scores.push(score);
    }
    Ok(scores)
}
