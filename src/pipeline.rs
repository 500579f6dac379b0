//! Pipeline runner for the encoding analysis
//!
//! Coordinates transcript, embedding and BOLD loading, delay search, voxel
//! selection and the per-layer cross-validation for every run of a
//! condition, persisting the results table after each completed run.

use ndarray::Array1;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::bold::{BoldSource, NiftiBoldSource, ResponseSource};
use crate::config::{Condition, DataLayout, EncodingConfig, PipelineConfig};
use crate::confound::duration_covariate;
use crate::delay::select_delay;
use crate::embeddings::{align, AlignedRun, EmbeddingStore, EmbeddingTensor};
use crate::encoder::{encode_layers, LayerScore};
use crate::error::{EncodingError, Result, StageOutcome};
use crate::results::{run_label, ResultsStore, ResultsTable};
use crate::textgrid::{load_sentence_intervals, SentenceInterval, SentenceRules};
use crate::voxels::select_voxels;

/// Everything learned about one successfully encoded run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run: String,
    pub delay: f64,
    pub probe_score: f64,
    /// Sentences with both an embedding and a response at the chosen delay
    pub n_sentences: usize,
    pub roi_size: usize,
    pub layer_scores: Vec<LayerScore>,
}

impl RunReport {
    /// Mean CV correlation per layer, indexed by layer
    pub fn scores(&self) -> Vec<f64> {
        self.layer_scores.iter().map(|s| s.mean).collect()
    }

    /// Layer with the highest mean CV correlation
    pub fn best_layer(&self) -> Option<&LayerScore> {
        self.layer_scores
            .iter()
            .max_by(|a, b| a.mean.total_cmp(&b.mean))
    }
}

/// Data errors skip the run; fatal ones propagate
fn soften<T>(result: Result<StageOutcome<T>>) -> Result<StageOutcome<T>> {
    match result {
        Err(e) if !e.is_fatal() => Ok(StageOutcome::Degenerate(e.to_string())),
        other => other,
    }
}

/// Encode one run from aligned in-memory inputs.
///
/// `intervals[i]` must be the transcript span of embedding row `i`.
pub fn encode_run<S: ResponseSource + ?Sized>(
    run: &str,
    intervals: &[SentenceInterval],
    embeddings: &EmbeddingTensor,
    source: &S,
    config: &EncodingConfig,
) -> Result<StageOutcome<RunReport>> {
    if intervals.len() != embeddings.n_sentences() {
        return Err(EncodingError::Shape(format!(
            "run {run}: {} intervals for {} embedded sentences",
            intervals.len(),
            embeddings.n_sentences()
        )));
    }
    if embeddings.n_layers() == 0 {
        return Ok(StageOutcome::Degenerate(format!("run {run}: embeddings have no layers")));
    }

    let mid_layer = embeddings.mid_layer();
    let search = select_delay(source, intervals, embeddings.layer(mid_layer), config);
    let (Some(response), Some(probe_score)) = (search.response, search.score) else {
        return Ok(StageOutcome::Degenerate(format!(
            "run {run}: no candidate delay had {} usable sentences and a defined score",
            config.probe.min_sentences
        )));
    };
    info!(
        "[{}] Best delay: {:.1}s (probe score {:.4})",
        run, search.delay, probe_score
    );

    let n_sentences = response.nrows();
    let embeddings = embeddings.truncated(n_sentences);
    let durations: Array1<f64> = intervals[..n_sentences]
        .iter()
        .map(SentenceInterval::duration)
        .collect();
    let covariates = duration_covariate(durations.view());

    let selection = select_voxels(
        response.view(),
        embeddings.layer(mid_layer),
        covariates.view(),
        config,
    )?;
    let roi = selection.restrict(response.view());
    info!(
        "[{}] {} sentences, ROI of {} voxels",
        run,
        n_sentences,
        selection.len()
    );

    let layer_scores = encode_layers(&embeddings, &roi, &covariates, config)?;

    Ok(StageOutcome::Success(RunReport {
        run: run.to_string(),
        delay: search.delay,
        probe_score,
        n_sentences,
        roi_size: selection.len(),
        layer_scores,
    }))
}

/// Outcome of analyzing one condition
#[derive(Debug)]
pub struct ConditionSummary {
    pub condition: String,
    pub results_path: PathBuf,
    pub table: ResultsTable,
    pub reports: Vec<RunReport>,
    /// Runs that produced no column, with the reason
    pub skipped: Vec<(u32, String)>,
}

/// Main pipeline runner
pub struct Pipeline<B: BoldSource> {
    config: PipelineConfig,
    bold: B,
}

impl Pipeline<NiftiBoldSource> {
    /// Pipeline reading volumes from the configured fMRI directory
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let bold = NiftiBoldSource::new(config.data.fmri_path());
        Self::new(config, bold)
    }
}

impl<B: BoldSource> Pipeline<B> {
    pub fn new(config: PipelineConfig, bold: B) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, bold })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn layout(&self) -> &DataLayout {
        &self.config.data
    }

    fn sentence_rules(&self) -> SentenceRules {
        SentenceRules::new(
            self.layout().sentence_boundary.clone(),
            self.layout().silence_labels.clone(),
        )
    }

    /// Analyze every configured run of a condition.
    ///
    /// With `resume`, runs already present in the condition's results file
    /// are left as they are.
    pub fn run_condition(&self, condition: &Condition, resume: bool) -> Result<ConditionSummary> {
        let encoding = &self.config.encoding;
        info!(
            "Analysis: {} ({}-fold CV + PCA{} + voxel selection)",
            condition.name, encoding.cv.folds, encoding.pca_components
        );

        let store = EmbeddingStore::new(self.layout().feature_path(condition));
        if !store.exists() {
            return Err(EncodingError::Config(format!(
                "embedding directory {} for condition {} does not exist",
                store.dir().display(),
                condition.name
            )));
        }

        let results_path = self.layout().results_file(condition);
        let mut results = if resume {
            ResultsStore::resume(&results_path)?
        } else {
            ResultsStore::new(&results_path)
        };

        let mut reports = Vec::new();
        let mut skipped = Vec::new();
        for &run in &self.layout().runs {
            let label = run_label(run);
            if resume && results.table().contains(&label) {
                info!("Run {} already in {}, skipping", run, results_path.display());
                continue;
            }

            info!("Processing run {}...", run);
            match soften(self.process_run(run, &store))? {
                StageOutcome::Success(report) => {
                    results.record(label, report.scores())?;
                    info!("Saved progress after run {}", run);
                    reports.push(report);
                }
                outcome => {
                    let reason = outcome.reason().unwrap_or_default().to_string();
                    warn!("Run {} skipped: {}", run, reason);
                    skipped.push((run, reason));
                }
            }
        }

        info!(
            "{}: {} runs encoded, {} skipped",
            condition.name,
            reports.len(),
            skipped.len()
        );
        Ok(ConditionSummary {
            condition: condition.name.clone(),
            results_path,
            table: results.into_table(),
            reports,
            skipped,
        })
    }

    /// Transcript intervals and embeddings of a run, paired by sentence index
    pub fn load_inputs(&self, run: u32, store: &EmbeddingStore) -> Result<StageOutcome<AlignedRun>> {
        let Some(section) = self.layout().section_for(run) else {
            return Ok(StageOutcome::Unavailable(format!(
                "run {run} precedes section offset {}",
                self.layout().section_offset
            )));
        };

        let textgrid = self.layout().textgrid_file(section);
        let intervals = match load_sentence_intervals(&textgrid, &self.sentence_rules()).into_success() {
            Ok(intervals) => intervals,
            Err(skip) => return Ok(skip),
        };
        let embeddings = match store.load_section(section).into_success() {
            Ok(embeddings) => embeddings,
            Err(skip) => return Ok(skip),
        };

        let aligned = align(&intervals, &embeddings)?;
        if aligned.dropped > 0 {
            warn!(
                "Run {}: {} of {} sentences have no embedding ({:.1}% skipped)",
                run,
                aligned.dropped,
                intervals.len(),
                aligned.skip_rate() * 100.0
            );
        }
        if aligned.intervals.is_empty() {
            return Ok(StageOutcome::Unavailable(format!(
                "run {run}: no embedding matches a transcript sentence"
            )));
        }
        Ok(StageOutcome::Success(aligned))
    }

    fn process_run(&self, run: u32, store: &EmbeddingStore) -> Result<StageOutcome<RunReport>> {
        let aligned = match self.load_inputs(run, store)?.into_success() {
            Ok(aligned) => aligned,
            Err(skip) => return Ok(skip),
        };
        // without a volume every candidate delay is unavailable
        let bold = match self.bold.load_run(run).into_success() {
            Ok(bold) => bold,
            Err(skip) => return Ok(skip),
        };

        encode_run(
            &run_label(run),
            &aligned.intervals,
            &aligned.embeddings,
            &bold,
            &self.config.encoding,
        )
    }
}
