//! BOLD response loading and sentence-level resampling
//!
//! A run's volume is flattened to a (time, voxel) matrix, z-scored per voxel
//! across the whole series, and then averaged over the TRs each sentence
//! covers once shifted by a hemodynamic delay.

use ndarray::{s, Array1, Array2, ArrayD, ArrayView1, Axis};
use nifti::{IntoNdArray, NiftiObject, ReaderOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{EncodingError, Result, StageOutcome};
use crate::linalg::zscore_columns;
use crate::textgrid::SentenceInterval;

/// Anything that can produce sentence-aligned responses under a delay
pub trait ResponseSource {
    /// Response matrix (sentence, voxel) for `intervals` shifted by `delay`
    /// seconds. May cover only a prefix of `intervals` when the shifted
    /// windows run past the end of the recording.
    fn responses_at(
        &self,
        intervals: &[SentenceInterval],
        delay: f64,
        tr: f64,
    ) -> StageOutcome<Array2<f64>>;
}

/// Voxel time series of one run, z-scored per voxel
#[derive(Debug, Clone)]
pub struct BoldSeries {
    /// Shape (time, voxel)
    data: Array2<f64>,
}

impl BoldSeries {
    /// Normalize a raw (time, voxel) matrix
    pub fn from_raw(raw: &Array2<f64>) -> Self {
        Self {
            data: zscore_columns(raw),
        }
    }

    /// Flatten a volume whose last axis is time.
    ///
    /// Spatial axes are flattened in row-major order.
    pub fn from_volume(volume: &ArrayD<f64>) -> Result<Self> {
        if volume.ndim() < 2 {
            return Err(EncodingError::Shape(format!(
                "expected a volume with a time axis, got {} dimension(s)",
                volume.ndim()
            )));
        }
        let time_axis = Axis(volume.ndim() - 1);
        let n_tr = volume.len_of(time_axis);
        let n_voxels = if n_tr == 0 { 0 } else { volume.len() / n_tr };

        let mut flat = Vec::with_capacity(volume.len());
        for t in 0..n_tr {
            flat.extend(volume.index_axis(time_axis, t).iter().copied());
        }
        let raw = Array2::from_shape_vec((n_tr, n_voxels), flat)
            .map_err(|e| EncodingError::Shape(format!("flattening volume: {e}")))?;
        Ok(Self::from_raw(&raw))
    }

    pub fn n_timepoints(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_voxels(&self) -> usize {
        self.data.ncols()
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    /// Average the series over each delayed sentence window.
    ///
    /// The window is `[floor((onset+delay)/TR), floor((offset+delay)/TR) + 1)`,
    /// clipped to the series; a window starting past the end stops the
    /// resampling there.
    pub fn resample(&self, intervals: &[SentenceInterval], delay: f64, tr: f64) -> Array2<f64> {
        let n_tr = self.n_timepoints();
        let mut rows: Vec<Array1<f64>> = Vec::with_capacity(intervals.len());

        for interval in intervals {
            let start = ((interval.onset + delay) / tr) as usize;
            let end = ((interval.offset + delay) / tr) as usize + 1;
            if start >= n_tr {
                break;
            }
            let end = end.min(n_tr);
            let row = if end > start {
                self.data
                    .slice(s![start..end, ..])
                    .mean_axis(Axis(0))
                    .unwrap_or_else(|| self.data.row(start).to_owned())
            } else {
                self.data.row(start).to_owned()
            };
            rows.push(row);
        }

        let views: Vec<ArrayView1<f64>> = rows.iter().map(Array1::view).collect();
        if views.is_empty() {
            return Array2::zeros((0, self.n_voxels()));
        }
        ndarray::stack(Axis(0), &views).unwrap_or_else(|_| Array2::zeros((0, self.n_voxels())))
    }
}

impl ResponseSource for BoldSeries {
    fn responses_at(
        &self,
        intervals: &[SentenceInterval],
        delay: f64,
        tr: f64,
    ) -> StageOutcome<Array2<f64>> {
        let responses = self.resample(intervals, delay, tr);
        if responses.nrows() == 0 {
            StageOutcome::Unavailable(format!(
                "no sentence window starts inside the {}-TR series at delay {delay}s",
                self.n_timepoints()
            ))
        } else {
            StageOutcome::Success(responses)
        }
    }
}

/// Supplies the BOLD series of a run
pub trait BoldSource {
    fn load_run(&self, run: u32) -> StageOutcome<BoldSeries>;
}

/// Whether a file name looks like the volume of `run`: `run`, one arbitrary
/// separator character, the run number (not followed by another digit), and
/// a NIfTI extension.
pub fn matches_run_file(name: &str, run: u32) -> bool {
    if !(name.ends_with(".nii.gz") || name.ends_with(".nii")) {
        return false;
    }
    let id = run.to_string();
    name.match_indices("run").any(|(idx, _)| {
        let mut rest = name[idx + 3..].chars();
        if rest.next().is_none() {
            return false;
        }
        let rest = rest.as_str();
        rest.strip_prefix(id.as_str())
            .is_some_and(|tail| !tail.starts_with(|c: char| c.is_ascii_digit()))
    })
}

/// Reads run volumes from NIfTI files in one directory
#[derive(Debug, Clone)]
pub struct NiftiBoldSource {
    dir: PathBuf,
}

impl NiftiBoldSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// First matching volume file in name order
    pub fn locate(&self, run: u32) -> Option<PathBuf> {
        let entries = std::fs::read_dir(&self.dir).ok()?;
        let mut matches: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| matches_run_file(n, run))
            })
            .collect();
        matches.sort();
        matches.into_iter().next()
    }

    fn read_volume(path: &Path) -> Result<BoldSeries> {
        let volume_error = |reason: String| EncodingError::Volume {
            path: path.to_path_buf(),
            reason,
        };
        let object = ReaderOptions::new()
            .read_file(path)
            .map_err(|e| volume_error(e.to_string()))?;
        let volume = object
            .into_volume()
            .into_ndarray::<f64>()
            .map_err(|e| volume_error(e.to_string()))?;
        BoldSeries::from_volume(&volume)
    }
}

impl BoldSource for NiftiBoldSource {
    fn load_run(&self, run: u32) -> StageOutcome<BoldSeries> {
        let Some(path) = self.locate(run) else {
            return StageOutcome::Unavailable(format!(
                "no volume for run {run} in {}",
                self.dir.display()
            ));
        };
        debug!("Loading volume {}", path.display());
        match Self::read_volume(&path) {
            Ok(series) => StageOutcome::Success(series),
            Err(e) => {
                warn!("Run {}: {}", run, e);
                StageOutcome::Unavailable(e.to_string())
            }
        }
    }
}
