//! Sentence embedding store
//!
//! The extractor writes one `.npy` file per sentence holding a
//! (layer, dim) matrix of mean-pooled hidden states, named
//! `<transcript>_sent<index>.npy`. Sentences whose tokens could not be aligned
//! to words are never written, so indices can have gaps.

use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3, Axis};
use ndarray_npy::read_npy;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{EncodingError, Result, StageOutcome};
use crate::textgrid::SentenceInterval;

/// Per-sentence, per-layer embeddings of one run
#[derive(Debug, Clone)]
pub struct EmbeddingTensor {
    /// Transcript sentence index of each row
    sentence_indices: Vec<usize>,
    /// Shape (sentence, layer, dim)
    data: Array3<f64>,
}

impl EmbeddingTensor {
    pub fn new(sentence_indices: Vec<usize>, data: Array3<f64>) -> Result<Self> {
        if sentence_indices.len() != data.len_of(Axis(0)) {
            return Err(EncodingError::Shape(format!(
                "{} sentence indices for {} embedding rows",
                sentence_indices.len(),
                data.len_of(Axis(0))
            )));
        }
        Ok(Self {
            sentence_indices,
            data,
        })
    }

    /// Stack per-sentence (layer, dim) matrices
    pub fn from_sentences(sentences: Vec<(usize, Array2<f64>)>) -> Result<Self> {
        let Some((_, first)) = sentences.first() else {
            return Err(EncodingError::Shape("no sentence embeddings".into()));
        };
        let shape = first.dim();
        if let Some((index, bad)) = sentences.iter().find(|(_, m)| m.dim() != shape) {
            return Err(EncodingError::Shape(format!(
                "sentence {index} has shape {:?}, expected {shape:?}",
                bad.dim()
            )));
        }
        let views: Vec<ArrayView2<f64>> = sentences.iter().map(|(_, m)| m.view()).collect();
        let data = ndarray::stack(Axis(0), &views)
            .map_err(|e| EncodingError::Shape(format!("stacking embeddings: {e}")))?;
        let indices = sentences.iter().map(|(i, _)| *i).collect();
        Self::new(indices, data)
    }

    pub fn n_sentences(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    pub fn n_layers(&self) -> usize {
        self.data.len_of(Axis(1))
    }

    pub fn dim(&self) -> usize {
        self.data.len_of(Axis(2))
    }

    /// Middle layer, used for delay probing and voxel selection
    pub fn mid_layer(&self) -> usize {
        self.n_layers() / 2
    }

    /// (sentence, dim) features of one layer
    pub fn layer(&self, layer: usize) -> ArrayView2<f64> {
        self.data.index_axis(Axis(1), layer)
    }

    pub fn data(&self) -> ArrayView3<f64> {
        self.data.view()
    }

    pub fn sentence_indices(&self) -> &[usize] {
        &self.sentence_indices
    }

    /// Keep only the first `n` sentences
    pub fn truncated(&self, n: usize) -> Self {
        let n = n.min(self.n_sentences());
        Self {
            sentence_indices: self.sentence_indices[..n].to_vec(),
            data: self.data.slice(s![..n, .., ..]).to_owned(),
        }
    }
}

/// Sentence index encoded in a `..._sent<index>.npy` file name
pub fn sentence_index(file_name: &str) -> Option<usize> {
    let stem = file_name.strip_suffix(".npy")?;
    let (_, index) = stem.rsplit_once("sent")?;
    index.parse().ok()
}

/// Whether a file name mentions `section<N>` exactly (so section 1 does not
/// claim the files of section 10)
pub fn belongs_to_section(file_name: &str, section: u32) -> bool {
    let needle = format!("section{section}");
    file_name.match_indices(&needle).any(|(idx, _)| {
        !file_name[idx + needle.len()..].starts_with(|c: char| c.is_ascii_digit())
    })
}

fn read_layer_matrix(path: &Path) -> Result<Array2<f64>> {
    match read_npy::<_, Array2<f32>>(path) {
        Ok(matrix) => Ok(matrix.mapv(f64::from)),
        Err(_) => read_npy::<_, Array2<f64>>(path).map_err(|e| EncodingError::Embedding {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

/// Directory of one condition's sentence embeddings
#[derive(Debug, Clone)]
pub struct EmbeddingStore {
    dir: PathBuf,
}

impl EmbeddingStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn exists(&self) -> bool {
        self.dir.is_dir()
    }

    /// Embedding files of a section, in numeric sentence order
    pub fn discover(&self, section: u32) -> Result<Vec<(usize, PathBuf)>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| EncodingError::io(&self.dir, e))?;
        let mut files: Vec<(usize, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                let name = path.file_name()?.to_str()?;
                if !belongs_to_section(name, section) {
                    return None;
                }
                let index = sentence_index(name)?;
                Some((index, path))
            })
            .collect();
        files.sort_by_key(|(index, _)| *index);
        Ok(files)
    }

    /// Load and stack all embeddings of a section.
    ///
    /// Missing files, unreadable files and inconsistent shapes make the whole
    /// section unavailable.
    pub fn load_section(&self, section: u32) -> StageOutcome<EmbeddingTensor> {
        let files = match self.discover(section) {
            Ok(files) => files,
            Err(e) => return StageOutcome::Unavailable(e.to_string()),
        };
        if files.is_empty() {
            return StageOutcome::Unavailable(format!(
                "no embeddings for section {section} in {}",
                self.dir.display()
            ));
        }
        debug!("Section {}: {} embedding files", section, files.len());

        let mut sentences = Vec::with_capacity(files.len());
        for (index, path) in files {
            match read_layer_matrix(&path) {
                Ok(matrix) => sentences.push((index, matrix)),
                Err(e) => return StageOutcome::Unavailable(e.to_string()),
            }
        }
        match EmbeddingTensor::from_sentences(sentences) {
            Ok(tensor) => StageOutcome::Success(tensor),
            Err(e) => StageOutcome::Unavailable(e.to_string()),
        }
    }
}

/// Intervals and embeddings paired by transcript sentence index
#[derive(Debug, Clone)]
pub struct AlignedRun {
    pub intervals: Vec<SentenceInterval>,
    pub embeddings: EmbeddingTensor,
    /// Transcript sentences without an embedding
    pub dropped: usize,
}

impl AlignedRun {
    /// Fraction of transcript sentences that had no embedding
    pub fn skip_rate(&self) -> f64 {
        let total = self.intervals.len() + self.dropped;
        if total == 0 {
            0.0
        } else {
            self.dropped as f64 / total as f64
        }
    }
}

/// Pair each embedding with the interval of the same sentence index.
///
/// Embeddings whose index has no interval are discarded.
pub fn align(intervals: &[SentenceInterval], embeddings: &EmbeddingTensor) -> Result<AlignedRun> {
    let mut kept_rows = Vec::with_capacity(embeddings.n_sentences());
    let mut kept_intervals = Vec::with_capacity(embeddings.n_sentences());
    for (row, &index) in embeddings.sentence_indices().iter().enumerate() {
        match intervals.get(index) {
            Some(interval) => {
                kept_rows.push(row);
                kept_intervals.push(*interval);
            }
            None => warn!(
                "Embedding for sentence {} has no transcript interval ({} sentences), ignoring",
                index,
                intervals.len()
            ),
        }
    }

    let indices = kept_rows
        .iter()
        .map(|&row| embeddings.sentence_indices()[row])
        .collect();
    let data = embeddings.data().select(Axis(0), &kept_rows);
    let dropped = intervals.len() - kept_intervals.len();

    Ok(AlignedRun {
        intervals: kept_intervals,
        embeddings: EmbeddingTensor::new(indices, data)?,
        dropped,
    })
}
