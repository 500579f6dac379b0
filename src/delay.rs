//! Hemodynamic delay selection
//!
//! Each candidate delay is scored with a cheap single-layer probe: an ordered
//! 80/20 split, PCA fitted on the training part, a fixed-penalty ridge fit and
//! the mean test correlation of the best-predicted voxels. Running the full
//! per-layer analysis once per delay would multiply its cost by the number of
//! candidates.

use ndarray::{s, Array2, ArrayView2};
use tracing::{debug, warn};

use crate::bold::ResponseSource;
use crate::config::EncodingConfig;
use crate::error::{Result, StageOutcome};
use crate::linalg::{column_correlations, mean_of_top, Pca, Ridge};
use crate::textgrid::SentenceInterval;

/// Outcome of probing one candidate delay
#[derive(Debug, Clone, PartialEq)]
pub struct DelayProbe {
    pub delay: f64,
    pub outcome: StageOutcome<f64>,
}

/// Result of the delay search for one run
#[derive(Debug, Clone)]
pub struct DelaySearch {
    /// Winning delay, or the configured fallback if nothing was usable
    pub delay: f64,
    /// Probe score of the winning delay
    pub score: Option<f64>,
    /// (sentence, voxel) responses at the winning delay, truncated to the
    /// sentences that also have features
    pub response: Option<Array2<f64>>,
    pub probes: Vec<DelayProbe>,
}

impl DelaySearch {
    /// Whether some candidate produced a usable score
    pub fn found(&self) -> bool {
        self.response.is_some()
    }
}

/// Score a delay from aligned probe features and responses
pub fn probe_score(
    features: ArrayView2<f64>,
    response: ArrayView2<f64>,
    config: &EncodingConfig,
) -> Result<StageOutcome<f64>> {
    let n = features.nrows().min(response.nrows());
    if n < config.probe.min_sentences {
        return Ok(StageOutcome::Degenerate(format!(
            "{n} usable sentences, need {}",
            config.probe.min_sentences
        )));
    }

    let split = ((n as f64) * config.probe.train_fraction) as usize;
    if split < 2 || split >= n {
        return Ok(StageOutcome::Degenerate(format!(
            "split at {split} of {n} leaves an empty side"
        )));
    }

    let x_train = features.slice(s![..split, ..]);
    let x_test = features.slice(s![split..n, ..]);
    let y_train = response.slice(s![..split, ..]);
    let y_test = response.slice(s![split..n, ..]).to_owned();

    let pca = Pca::fit(x_train, config.probe.pca_components)?;
    let train_scores = pca.transform(x_train)?;
    let test_scores = pca.transform(x_test)?;

    let ridge = Ridge::fit(train_scores.view(), y_train, config.probe.alpha)?;
    let predicted = ridge.predict(test_scores.view())?;

    let correlations: Vec<f64> = column_correlations(&predicted, &y_test, config.min_std)
        .into_iter()
        .flatten()
        .collect();
    match mean_of_top(&correlations, config.probe.top_voxels) {
        Some(score) => Ok(StageOutcome::Success(score)),
        None => Ok(StageOutcome::Degenerate(
            "no voxel has a defined test correlation".into(),
        )),
    }
}

/// Pick the candidate delay whose probe score is strictly highest.
///
/// Unavailable responses, short runs and numerical failures only disqualify
/// their own candidate.
pub fn select_delay<S: ResponseSource + ?Sized>(
    source: &S,
    intervals: &[SentenceInterval],
    probe_features: ArrayView2<f64>,
    config: &EncodingConfig,
) -> DelaySearch {
    let mut search = DelaySearch {
        delay: config.fallback_delay,
        score: None,
        response: None,
        probes: Vec::with_capacity(config.candidate_delays.len()),
    };

    for &delay in &config.candidate_delays {
        let outcome = source
            .responses_at(intervals, delay, config.tr)
            .and_then(|response| {
                let n = response.nrows().min(probe_features.nrows());
                let response = response.slice(s![..n, ..]).to_owned();
                let features = probe_features.slice(s![..n, ..]);
                match probe_score(features, response.view(), config) {
                    Ok(StageOutcome::Success(score)) => StageOutcome::Success((score, response)),
                    Ok(StageOutcome::Unavailable(reason)) => StageOutcome::Unavailable(reason),
                    Ok(StageOutcome::Degenerate(reason)) => StageOutcome::Degenerate(reason),
                    // a failed fit only disqualifies this delay
                    Err(e) => StageOutcome::Degenerate(e.to_string()),
                }
            });

        match outcome {
            StageOutcome::Success((score, response)) => {
                debug!("Delay {:.1}s: probe score {:.4}", delay, score);
                if search.score.map_or(true, |best| score > best) {
                    search.delay = delay;
                    search.score = Some(score);
                    search.response = Some(response);
                }
                search.probes.push(DelayProbe {
                    delay,
                    outcome: StageOutcome::Success(score),
                });
            }
            other => {
                debug!(
                    "Delay {:.1}s skipped: {}",
                    delay,
                    other.reason().unwrap_or_default()
                );
                search.probes.push(DelayProbe {
                    delay,
                    outcome: other.map(|_| 0.0),
                });
            }
        }
    }

    match search.score {
        Some(score) => debug!("Best delay: {:.1}s (probe score {:.4})", search.delay, score),
        None => warn!(
            "No usable delay; fallback {:.1}s has no response",
            search.delay
        ),
    }
    search
}
