//! Numerical building blocks: PCA, ridge regression, correlation
//!
//! Matrices are `ndarray` arrays with samples along axis 0. Symmetric
//! eigendecompositions are delegated to nalgebra.

use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{stack, Array1, Array2, ArrayView1, ArrayView2, Axis};

use crate::error::{EncodingError, Result};

/// Relative eigenvalue cutoff below which a direction counts as null
const RANK_TOLERANCE: f64 = 1e-10;

/// Eigendecomposition of a symmetric matrix.
///
/// Returns eigenvalues in descending order and the matching eigenvectors as
/// columns.
pub fn symmetric_eigen(matrix: &Array2<f64>) -> (Array1<f64>, Array2<f64>) {
    let n = matrix.nrows();
    let symmetric = DMatrix::from_fn(n, n, |i, j| 0.5 * (matrix[[i, j]] + matrix[[j, i]]));
    let eigen = SymmetricEigen::new(symmetric);

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

    let values: Array1<f64> = order.iter().map(|&i| eigen.eigenvalues[i]).collect();
    let vectors = Array2::from_shape_fn((n, n), |(row, col)| eigen.eigenvectors[(row, order[col])]);
    (values, vectors)
}

/// Moore-Penrose pseudo-inverse of a symmetric positive semi-definite matrix
pub fn pinv_symmetric(matrix: &Array2<f64>) -> Array2<f64> {
    let (values, vectors) = symmetric_eigen(matrix);
    let largest = values.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    let cutoff = largest * RANK_TOLERANCE;

    let inverted: Array1<f64> = values.mapv(|v| if v > cutoff { 1.0 / v } else { 0.0 });
    let scaled = &vectors * &inverted;
    scaled.dot(&vectors.t())
}

fn column_means(x: ArrayView2<f64>) -> Result<Array1<f64>> {
    x.mean_axis(Axis(0))
        .ok_or_else(|| EncodingError::Shape("cannot center an empty matrix".into()))
}

/// Principal component analysis fitted on a reference set
#[derive(Debug, Clone)]
pub struct Pca {
    mean: Array1<f64>,
    /// Shape (n_features, n_components)
    components: Array2<f64>,
    explained_variance: Array1<f64>,
}

impl Pca {
    /// Fit up to `n_components` directions of maximal variance.
    ///
    /// The count is clamped to the number of samples, the number of features
    /// and the numerical rank of the centered data.
    pub fn fit(x: ArrayView2<f64>, n_components: usize) -> Result<Self> {
        let (n, d) = x.dim();
        if n < 2 {
            return Err(EncodingError::Numerical(format!(
                "PCA needs at least 2 samples, got {n}"
            )));
        }
        if d == 0 {
            return Err(EncodingError::Shape("PCA input has no features".into()));
        }

        let mean = column_means(x)?;
        let centered = &x - &mean;
        let wanted = n_components.min(n).min(d);

        // Decompose whichever of the Gram and scatter matrices is smaller
        let gram_side = n <= d;
        let (values, vectors) = if gram_side {
            symmetric_eigen(&centered.dot(&centered.t()))
        } else {
            symmetric_eigen(&centered.t().dot(&centered))
        };

        let top = values.get(0).copied().unwrap_or(0.0);
        if !(top > 0.0) {
            return Err(EncodingError::Numerical(
                "PCA input has no variance".into(),
            ));
        }

        let mut columns = Vec::with_capacity(wanted);
        let mut variances = Vec::with_capacity(wanted);
        for i in 0..wanted {
            let value = values[i];
            if value <= top * RANK_TOLERANCE {
                break;
            }
            let column = if gram_side {
                centered.t().dot(&vectors.column(i)) / value.sqrt()
            } else {
                vectors.column(i).to_owned()
            };
            columns.push(column);
            variances.push(value / (n - 1) as f64);
        }

        let views: Vec<ArrayView1<f64>> = columns.iter().map(Array1::view).collect();
        let components = stack(Axis(1), &views)
            .map_err(|e| EncodingError::Shape(format!("PCA components: {e}")))?;

        Ok(Self {
            mean,
            components,
            explained_variance: Array1::from(variances),
        })
    }

    /// Project samples onto the fitted components
    pub fn transform(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        if x.ncols() != self.mean.len() {
            return Err(EncodingError::Shape(format!(
                "PCA fitted on {} features, got {}",
                self.mean.len(),
                x.ncols()
            )));
        }
        Ok((&x - &self.mean).dot(&self.components))
    }

    pub fn fit_transform(x: ArrayView2<f64>, n_components: usize) -> Result<(Self, Array2<f64>)> {
        let pca = Self::fit(x, n_components)?;
        let scores = pca.transform(x)?;
        Ok((pca, scores))
    }

    pub fn n_components(&self) -> usize {
        self.components.ncols()
    }

    pub fn explained_variance(&self) -> &Array1<f64> {
        &self.explained_variance
    }
}

/// Multi-target ridge regression with an unpenalized intercept
#[derive(Debug, Clone)]
pub struct Ridge {
    /// Shape (n_features, n_targets)
    coef: Array2<f64>,
    intercept: Array1<f64>,
    alpha: f64,
}

impl Ridge {
    /// Fit with a fixed penalty
    pub fn fit(x: ArrayView2<f64>, y: ArrayView2<f64>, alpha: f64) -> Result<Self> {
        Self::fit_cv(x, y, &[alpha])
    }

    /// Fit with the penalty from `alphas` that minimizes leave-one-out
    /// squared error summed over all targets.
    ///
    /// Ties keep the earliest alpha. A single-element grid skips the search.
    pub fn fit_cv(x: ArrayView2<f64>, y: ArrayView2<f64>, alphas: &[f64]) -> Result<Self> {
        let n = x.nrows();
        if n != y.nrows() {
            return Err(EncodingError::Shape(format!(
                "ridge got {n} feature rows but {} target rows",
                y.nrows()
            )));
        }
        if n < 2 {
            return Err(EncodingError::Numerical(format!(
                "ridge needs at least 2 samples, got {n}"
            )));
        }
        let Some(&first_alpha) = alphas.first() else {
            return Err(EncodingError::Config("empty ridge alpha grid".into()));
        };

        let x_mean = column_means(x)?;
        let y_mean = column_means(y)?;
        let xc = &x - &x_mean;
        let yc = &y - &y_mean;

        let (values, vectors) = symmetric_eigen(&xc.t().dot(&xc));
        let values = values.mapv(|v| v.max(0.0));

        let alpha = if alphas.len() == 1 {
            first_alpha
        } else {
            select_alpha_loo(&xc, &yc, &values, &vectors, alphas)
        };

        // coef = V (Λ + αI)^-1 Vᵀ Xᵀ Y
        let mut rotated = vectors.t().dot(&xc.t().dot(&yc));
        for (mut row, &value) in rotated.rows_mut().into_iter().zip(values.iter()) {
            row.mapv_inplace(|r| r / (value + alpha));
        }
        let coef = vectors.dot(&rotated);
        let intercept = &y_mean - &x_mean.dot(&coef);

        Ok(Self {
            coef,
            intercept,
            alpha,
        })
    }

    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        if x.ncols() != self.coef.nrows() {
            return Err(EncodingError::Shape(format!(
                "ridge fitted on {} features, got {}",
                self.coef.nrows(),
                x.ncols()
            )));
        }
        Ok(x.dot(&self.coef) + &self.intercept)
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn coef(&self) -> &Array2<f64> {
        &self.coef
    }
}

/// Closed-form leave-one-out error for each alpha via the SVD of the centered
/// design. The intercept adds 1/n to every hat-matrix diagonal entry.
fn select_alpha_loo(
    xc: &Array2<f64>,
    yc: &Array2<f64>,
    values: &Array1<f64>,
    vectors: &Array2<f64>,
    alphas: &[f64],
) -> f64 {
    let n = xc.nrows();
    let top = values.get(0).copied().unwrap_or(0.0);
    let rank = values
        .iter()
        .take_while(|&&v| top > 0.0 && v > top * RANK_TOLERANCE)
        .count();

    // Left singular vectors U = X V Σ^-1 of the non-null directions
    let mut u = xc.dot(&vectors.slice(ndarray::s![.., ..rank]));
    for (mut column, &value) in u.columns_mut().into_iter().zip(values.iter()) {
        column.mapv_inplace(|c| c / value.sqrt());
    }
    let projected = u.t().dot(yc);
    let u_squared = u.mapv(|c| c * c);
    let intercept_leverage = 1.0 / n as f64;

    let mut best_alpha = alphas[0];
    let mut best_error = f64::INFINITY;
    for &alpha in alphas {
        let shrink: Array1<f64> = values
            .slice(ndarray::s![..rank])
            .mapv(|v| v / (v + alpha));
        let leverage = u_squared.dot(&shrink) + intercept_leverage;

        let mut shrunk = projected.clone();
        for (mut row, &s) in shrunk.rows_mut().into_iter().zip(shrink.iter()) {
            row.mapv_inplace(|p| p * s);
        }
        let residual = yc - &u.dot(&shrunk);

        let mut error = 0.0;
        for (row, &h) in residual.rows().into_iter().zip(leverage.iter()) {
            let denom = (1.0 - h).max(1e-12);
            error += row.iter().map(|r| (r / denom).powi(2)).sum::<f64>();
        }
        if error < best_error {
            best_error = error;
            best_alpha = alpha;
        }
    }
    best_alpha
}

/// Population standard deviation
pub fn population_std(values: ArrayView1<f64>) -> f64 {
    let n = values.len();
    if n == 0 {
        return 0.0;
    }
    let mean = values.sum() / n as f64;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64).sqrt()
}

/// Pearson correlation, or `None` when either side is numerically constant
/// or the coefficient is not finite
pub fn pearson(a: ArrayView1<f64>, b: ArrayView1<f64>, min_std: f64) -> Option<f64> {
    let n = a.len();
    if n < 2 || n != b.len() {
        return None;
    }
    if population_std(a) <= min_std || population_std(b) <= min_std {
        return None;
    }
    let mean_a = a.sum() / n as f64;
    let mean_b = b.sum() / n as f64;
    let (mut sab, mut saa, mut sbb) = (0.0, 0.0, 0.0);
    for (&x, &y) in a.iter().zip(b.iter()) {
        let dx = x - mean_a;
        let dy = y - mean_b;
        sab += dx * dy;
        saa += dx * dx;
        sbb += dy * dy;
    }
    let r = sab / (saa * sbb).sqrt();
    r.is_finite().then(|| r.clamp(-1.0, 1.0))
}

/// Per-column Pearson correlation between predictions and observations
pub fn column_correlations(
    predicted: &Array2<f64>,
    actual: &Array2<f64>,
    min_std: f64,
) -> Vec<Option<f64>> {
    predicted
        .columns()
        .into_iter()
        .zip(actual.columns())
        .map(|(p, a)| pearson(p, a, min_std))
        .collect()
}

/// Z-score every column with its own mean and population standard deviation.
/// Constant columns are centered only.
pub fn zscore_columns(x: &Array2<f64>) -> Array2<f64> {
    let mut out = x.clone();
    for mut column in out.columns_mut() {
        let std = population_std(column.view());
        let mean = column.mean().unwrap_or(0.0);
        let scale = if std > 0.0 { std } else { 1.0 };
        column.mapv_inplace(|v| (v - mean) / scale);
    }
    out
}

/// Mean of the `k` largest values, or of all of them if there are fewer
pub fn mean_of_top(values: &[f64], k: usize) -> Option<f64> {
    if values.is_empty() || k == 0 {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let top = &sorted[sorted.len().saturating_sub(k)..];
    Some(top.iter().sum::<f64>() / top.len() as f64)
}
