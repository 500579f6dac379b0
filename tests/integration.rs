//! Integration tests for brainlm-rs
//!
//! All data is synthetic: responses are driven by a low-rank latent that one
//! layer's embeddings also carry, sampled at a known hemodynamic delay.

use brainlm_rs::config::{Condition, EncodingConfig, PipelineConfig};
use brainlm_rs::error::StageOutcome;
use brainlm_rs::linalg::pearson;
use brainlm_rs::{
    encode_run, remove_confound, BoldSeries, BoldSource, EmbeddingStore, EmbeddingTensor,
    NiftiBoldSource, Pipeline, ResultsTable, SentenceInterval,
};
use ndarray::{Array, Array1, Array2};
use nifti::writer::WriterOptions;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;
use tempfile::tempdir;

const TR: f64 = 2.0;
const DIM: usize = 12;

/// Sentences, embeddings and a BOLD series in which only `informative`
/// carries signal, visible at a delay of 8 s.
///
/// Sentence `i` starts at `4i` and lasts under a second, so every delayed
/// window covers exactly one TR and the 8 s window lands on TR `2i + 4`.
struct SyntheticRun {
    intervals: Vec<SentenceInterval>,
    /// (sentence, layer, dim) rows per sentence
    sentences: Vec<Array2<f64>>,
    bold: Array2<f64>,
}

fn synthetic_run(n: usize, layers: usize, voxels: usize, informative: usize, seed: u64) -> SyntheticRun {
    let mut rng = StdRng::seed_from_u64(seed);
    let latent = Array::from_shape_fn((n, 3), |_| rng.gen_range(-1.0..1.0));
    let loadings = Array::from_shape_fn((3, DIM), |_| rng.gen_range(-1.0..1.0));
    let carried = latent.dot(&loadings) * 5.0;
    let weights = Array::from_shape_fn((3, voxels), |_| rng.gen_range(-1.0..1.0));
    let signal = latent.dot(&weights);

    let intervals = (0..n)
        .map(|i| {
            let onset = 4.0 * i as f64;
            SentenceInterval::new(onset, onset + rng.gen_range(0.5..0.95))
        })
        .collect();

    let sentences = (0..n)
        .map(|i| {
            let mut m = Array::from_shape_fn((layers, DIM), |_| rng.gen_range(-1.0..1.0));
            let noise = Array::from_shape_fn(DIM, |_| rng.gen_range(-0.05..0.05));
            m.row_mut(informative).assign(&(&carried.row(i) + &noise));
            m
        })
        .collect();

    let n_tr = 2 * n + 8;
    let mut bold = Array::from_shape_fn((n_tr, voxels), |_| rng.gen_range(-1.0..1.0));
    for i in 0..n {
        for v in 0..voxels {
            bold[[2 * i + 4, v]] = signal[[i, v]] * 3.0 + rng.gen_range(-0.1..0.1);
        }
    }

    SyntheticRun {
        intervals,
        sentences,
        bold,
    }
}

impl SyntheticRun {
    fn embeddings(&self) -> EmbeddingTensor {
        let sentences = self.sentences.iter().cloned().enumerate().collect();
        EmbeddingTensor::from_sentences(sentences).unwrap()
    }
}

/// Short-format TextGrid with one word and one boundary per sentence
fn textgrid_text(intervals: &[SentenceInterval]) -> String {
    let xmax = intervals.last().map_or(1.0, |s| s.onset + 4.0);
    let mut text = String::from("File type = \"ooTextFile\"\nObject class = \"TextGrid\"\n\n");
    writeln!(text, "0\n{xmax}\n<exists>\n1\n\"IntervalTier\"\n\"words\"\n0\n{xmax}").unwrap();
    writeln!(text, "{}", intervals.len() * 2).unwrap();
    for s in intervals {
        writeln!(text, "{}\n{}\n\"word\"", s.onset, s.offset).unwrap();
        writeln!(text, "{}\n{}\n\"#\"", s.offset, s.onset + 4.0).unwrap();
    }
    text
}

/// BOLD series kept in memory, keyed by run
struct MemoryBold(HashMap<u32, BoldSeries>);

impl BoldSource for MemoryBold {
    fn load_run(&self, run: u32) -> StageOutcome<BoldSeries> {
        match self.0.get(&run) {
            Some(series) => StageOutcome::Success(series.clone()),
            None => StageOutcome::Unavailable(format!("no series for run {run}")),
        }
    }
}

/// Write a run's transcript and embeddings under the default layout
fn write_run_files(base: &Path, section: u32, run: &SyntheticRun, skip_sentence: Option<usize>) {
    let textgrid_dir = base.join("textgrid");
    std::fs::create_dir_all(&textgrid_dir).unwrap();
    std::fs::write(
        textgrid_dir.join(format!("lppEN_section{section}.TextGrid")),
        textgrid_text(&run.intervals),
    )
    .unwrap();

    let feature_dir = base.join("embeddings_base");
    std::fs::create_dir_all(&feature_dir).unwrap();
    for (i, sentence) in run.sentences.iter().enumerate() {
        if Some(i) == skip_sentence {
            continue;
        }
        let path = feature_dir.join(format!("lpp_section{section}_sent{i}.npy"));
        ndarray_npy::write_npy(&path, &sentence.mapv(|v| v as f32)).unwrap();
    }
}

fn file_backed_config(base: &Path, runs: Vec<u32>) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.data.base_dir = base.to_path_buf();
    config.data.runs = runs;
    config.conditions = vec![Condition::new("Base", "embeddings_base")];
    config
}

/// Write a (time, voxel) series as a 4-D (x, y, z, time) volume
fn write_volume(path: &Path, series: &Array2<f64>, grid: (usize, usize)) {
    let (nx, ny) = grid;
    assert_eq!(nx * ny, series.ncols());
    let volume = Array::from_shape_fn((nx, ny, 1, series.nrows()), |(x, y, _, t)| {
        series[[t, x * ny + y]] as f32
    });
    WriterOptions::new(path).write_nifti(&volume).unwrap();
}

/// Volumes are found by run number, flattened to (time, voxel) and z-scored
#[test]
fn test_nifti_run_loading() {
    let dir = tempdir().unwrap();
    let series = Array::from_shape_fn((4, 6), |(t, v)| (t * t) as f64 + v as f64 * 0.5 + (t * v) as f64);
    write_volume(&dir.path().join("sub-01_task-lpp_run-15_bold.nii.gz"), &series, (2, 3));
    std::fs::write(dir.path().join("sub-01_task-lpp_run-17_bold.nii.gz"), b"not a volume").unwrap();

    let source = NiftiBoldSource::new(dir.path());
    let bold = source.load_run(15).success().expect("run 15 volume");
    assert_eq!(bold.n_timepoints(), 4);
    assert_eq!(bold.n_voxels(), 6);
    for column in bold.data().columns() {
        assert!(column.sum().abs() < 1e-9);
        assert!((column.mapv(|v| v * v).sum() / 4.0 - 1.0).abs() < 1e-6);
    }

    assert!(matches!(source.load_run(16), StageOutcome::Unavailable(_)));
    assert!(matches!(source.load_run(17), StageOutcome::Unavailable(_)));
    assert!(source.locate(1).is_none());
}

/// The default NIfTI-backed pipeline encodes a run from files alone
#[test]
fn test_file_backed_pipeline_from_config() {
    let dir = tempdir().unwrap();
    let run = synthetic_run(25, 5, 20, 2, 15);
    write_run_files(dir.path(), 1, &run, None);
    let fmri = dir.path().join("fmri");
    std::fs::create_dir_all(&fmri).unwrap();
    write_volume(&fmri.join("sub-01_task-lpp_run-15_bold.nii.gz"), &run.bold, (4, 5));

    let config = file_backed_config(dir.path(), vec![15, 16]);
    let condition = config.conditions[0].clone();
    let pipeline = Pipeline::from_config(config).unwrap();
    let summary = pipeline.run_condition(&condition, false).unwrap();

    assert_eq!(summary.reports.len(), 1);
    let report = &summary.reports[0];
    assert!((report.delay - 8.0).abs() <= 2.0, "delay {}", report.delay);
    assert_eq!(report.roi_size, 20);
    // run 16 has neither transcript nor volume
    assert_eq!(summary.skipped.len(), 1);
    assert_eq!(summary.skipped[0].0, 16);
    assert_eq!(
        ResultsTable::read_csv(&summary.results_path).unwrap().run_ids().collect::<Vec<_>>(),
        vec!["Run15"]
    );
}

/// End-to-end on synthetic data: the true delay is found, every voxel is
/// kept, and the informative layer outscores almost all others
#[test]
fn test_end_to_end_synthetic_run() {
    let run = synthetic_run(25, 33, 50, 16, 2024);
    let bold = BoldSeries::from_raw(&run.bold);
    let config = EncodingConfig::default();

    let report = encode_run("Run15", &run.intervals, &run.embeddings(), &bold, &config)
        .unwrap()
        .success()
        .expect("synthetic run should be encoded");

    assert!((report.delay - 8.0).abs() <= 2.0, "delay {}", report.delay);
    assert_eq!(report.roi_size, 50);
    assert_eq!(report.n_sentences, 25);
    assert_eq!(report.layer_scores.len(), 33);

    let scores = report.scores();
    let informative = scores[16];
    let beaten = scores
        .iter()
        .enumerate()
        .filter(|&(layer, &s)| layer != 16 && informative > s)
        .count();
    assert!(
        beaten as f64 >= 0.8 * 32.0,
        "layer 16 ({informative:.3}) beat only {beaten} of 32 layers"
    );
    assert!(scores.iter().all(|s| (-1.0..=1.0).contains(s)));
}

/// Runs with fewer than 20 usable sentences produce no column, while the
/// rest of the batch is still written
#[test]
fn test_short_run_is_skipped() {
    let dir = tempdir().unwrap();
    let full = synthetic_run(25, 5, 20, 2, 11);
    let short = synthetic_run(15, 5, 20, 2, 12);
    write_run_files(dir.path(), 1, &full, None);
    write_run_files(dir.path(), 2, &short, None);

    let bold = MemoryBold(HashMap::from([
        (15, BoldSeries::from_raw(&full.bold)),
        (16, BoldSeries::from_raw(&short.bold)),
    ]));
    let config = file_backed_config(dir.path(), vec![15, 16]);
    let condition = config.conditions[0].clone();
    let pipeline = Pipeline::new(config, bold).unwrap();

    let summary = pipeline.run_condition(&condition, false).unwrap();
    assert_eq!(summary.reports.len(), 1);
    assert_eq!(summary.skipped.len(), 1);
    assert_eq!(summary.skipped[0].0, 16);

    let table = ResultsTable::read_csv(&summary.results_path).unwrap();
    assert!(summary
        .results_path
        .ends_with("results_final_v2/Base_final_results.csv"));
    assert_eq!(table.run_ids().collect::<Vec<_>>(), vec!["Run15"]);
    assert_eq!(table.n_layers(), 5);
}

/// A sentence without an embedding is dropped; the run still encodes
#[test]
fn test_missing_embedding_is_dropped() {
    let dir = tempdir().unwrap();
    let run = synthetic_run(25, 5, 20, 2, 13);
    write_run_files(dir.path(), 1, &run, Some(3));

    let bold = MemoryBold(HashMap::from([(15, BoldSeries::from_raw(&run.bold))]));
    let config = file_backed_config(dir.path(), vec![15]);
    let store = EmbeddingStore::new(config.data.feature_path(&config.conditions[0]));
    let condition = config.conditions[0].clone();
    let pipeline = Pipeline::new(config, bold).unwrap();

    let aligned = pipeline.load_inputs(15, &store).unwrap().success().unwrap();
    assert_eq!(aligned.intervals.len(), 24);
    assert_eq!(aligned.dropped, 1);
    assert!((aligned.skip_rate() - 1.0 / 25.0).abs() < 1e-12);
    assert_eq!(aligned.embeddings.sentence_indices()[3], 4);
    assert_eq!(aligned.intervals[3], run.intervals[4]);

    let summary = pipeline.run_condition(&condition, false).unwrap();
    assert_eq!(summary.reports.len(), 1);
    assert_eq!(summary.reports[0].n_sentences, 24);
}

/// Re-running a batch replaces columns instead of duplicating them, and
/// resuming leaves finished runs alone
#[test]
fn test_rerun_and_resume() {
    let dir = tempdir().unwrap();
    let run = synthetic_run(25, 4, 15, 2, 14);
    write_run_files(dir.path(), 1, &run, None);

    let bold = MemoryBold(HashMap::from([(15, BoldSeries::from_raw(&run.bold))]));
    let config = file_backed_config(dir.path(), vec![15]);
    let condition = config.conditions[0].clone();
    let pipeline = Pipeline::new(config, bold).unwrap();

    let first = pipeline.run_condition(&condition, false).unwrap();
    let second = pipeline.run_condition(&condition, false).unwrap();
    assert_eq!(first.table, second.table);
    let on_disk = ResultsTable::read_csv(&second.results_path).unwrap();
    assert_eq!(on_disk.n_runs(), 1);

    let resumed = pipeline.run_condition(&condition, true).unwrap();
    assert!(resumed.reports.is_empty());
    assert!(resumed.skipped.is_empty());
    assert!(resumed.table.contains("Run15"));
}

/// A condition without an embedding directory aborts the batch
#[test]
fn test_missing_feature_directory_is_fatal() {
    let dir = tempdir().unwrap();
    let config = file_backed_config(dir.path(), vec![15]);
    let condition = Condition::new("Instruct", "embeddings_instruct");
    let pipeline = Pipeline::new(config, MemoryBold(HashMap::new())).unwrap();

    let err = pipeline.run_condition(&condition, false).unwrap_err();
    assert!(err.is_fatal());
    assert!(!dir.path().join("results_final_v2").exists());
}

/// Residuals carry no linear trace of the covariate
#[test]
fn test_confound_removal_decorrelates() {
    let mut rng = StdRng::seed_from_u64(3);
    let durations: Array1<f64> = Array::from_shape_fn(60, |_| rng.gen_range(0.3..4.0));
    let x = Array::from_shape_fn((60, 6), |(i, j)| {
        durations[i] * (j as f64 + 1.0) + rng.gen_range(-0.5..0.5)
    });
    let covariates = durations.clone().insert_axis(ndarray::Axis(1));

    let residuals = remove_confound(x.view(), covariates.view(), 1e-9).unwrap();
    for column in residuals.columns() {
        assert!(column.sum().abs() < 1e-9);
        let r = pearson(column, durations.view(), 1e-9).unwrap_or(0.0);
        assert!(r.abs() < 1e-9);
    }
}

/// Defaults match the published analysis settings
#[test]
fn test_config_defaults() {
    let config = PipelineConfig::default();
    assert_eq!(config.encoding.tr, TR);
    assert_eq!(config.encoding.candidate_delays, vec![4.0, 6.0, 8.0, 10.0]);
    assert_eq!(config.encoding.cv.folds, 5);
    assert_eq!(config.encoding.cv.seed, 42);
    assert_eq!(config.encoding.cv.alphas, vec![100.0, 1000.0, 10000.0]);
    assert_eq!(config.encoding.roi.size, 300);
    assert_eq!(config.data.runs, (15..=23).collect::<Vec<_>>());
    assert_eq!(config.data.section_for(15), Some(1));
    assert!(config.validate().is_ok());
}
