//! Pipeline configuration
//!
//! Every stage receives its constants through [`EncodingConfig`] instead of
//! reading process-wide globals, so individual runs and tests can override
//! any of them.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{EncodingError, Result};

/// Quick single-layer probe used to pick the hemodynamic delay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Candidates with fewer aligned sentences are skipped
    pub min_sentences: usize,
    /// Leading fraction of sentences used for training (no shuffling)
    pub train_fraction: f64,
    pub pca_components: usize,
    pub alpha: f64,
    /// Probe score is the mean over this many best voxels
    pub top_voxels: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            min_sentences: 20,
            train_fraction: 0.8,
            pca_components: 10,
            alpha: 1000.0,
            top_voxels: 100,
        }
    }
}

/// Region-of-interest selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoiConfig {
    /// Number of voxels retained
    pub size: usize,
    pub pca_components: usize,
    pub alpha: f64,
}

impl Default for RoiConfig {
    fn default() -> Self {
        Self {
            size: 300,
            pca_components: 10,
            alpha: 1000.0,
        }
    }
}

/// K-fold cross-validation of the per-layer encoder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CvConfig {
    pub folds: usize,
    /// Seed for the shuffled fold assignment
    pub seed: u64,
    /// Ridge penalties searched by leave-one-out on each training split
    pub alphas: Vec<f64>,
}

impl Default for CvConfig {
    fn default() -> Self {
        Self {
            folds: 5,
            seed: 42,
            alphas: vec![100.0, 1000.0, 10000.0],
        }
    }
}

/// Statistical constants for one encoding analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingConfig {
    /// Repetition time in seconds
    pub tr: f64,
    /// PCA dimension of the cross-validated encoder
    pub pca_components: usize,
    /// Hemodynamic delays probed, in seconds
    pub candidate_delays: Vec<f64>,
    /// Reported delay when no candidate is usable
    pub fallback_delay: f64,
    /// Standard deviations at or below this are treated as constant
    pub min_std: f64,
    pub probe: ProbeConfig,
    pub roi: RoiConfig,
    pub cv: CvConfig,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            tr: 2.0,
            pca_components: 15,
            candidate_delays: vec![4.0, 6.0, 8.0, 10.0],
            fallback_delay: 6.0,
            min_std: 1e-9,
            probe: ProbeConfig::default(),
            roi: RoiConfig::default(),
            cv: CvConfig::default(),
        }
    }
}

impl EncodingConfig {
    /// Reject settings no run could succeed with
    pub fn validate(&self) -> Result<()> {
        if !(self.tr > 0.0) {
            return Err(EncodingError::Config(format!(
                "TR must be positive, got {}",
                self.tr
            )));
        }
        if self.candidate_delays.is_empty() {
            return Err(EncodingError::Config(
                "at least one candidate delay is required".into(),
            ));
        }
        if self.candidate_delays.iter().any(|d| !d.is_finite()) {
            return Err(EncodingError::Config(
                "candidate delays must be finite".into(),
            ));
        }
        if self.pca_components == 0
            || self.probe.pca_components == 0
            || self.roi.pca_components == 0
        {
            return Err(EncodingError::Config(
                "PCA dimensions must be at least 1".into(),
            ));
        }
        if !(self.probe.train_fraction > 0.0 && self.probe.train_fraction < 1.0) {
            return Err(EncodingError::Config(format!(
                "probe train fraction must lie in (0, 1), got {}",
                self.probe.train_fraction
            )));
        }
        if self.probe.top_voxels == 0 || self.roi.size == 0 {
            return Err(EncodingError::Config(
                "voxel counts must be at least 1".into(),
            ));
        }
        if self.cv.folds < 2 {
            return Err(EncodingError::Config(format!(
                "cross-validation needs at least 2 folds, got {}",
                self.cv.folds
            )));
        }
        if self.cv.alphas.is_empty() {
            return Err(EncodingError::Config("ridge alpha grid is empty".into()));
        }
        let alphas = self
            .cv
            .alphas
            .iter()
            .copied()
            .chain([self.probe.alpha, self.roi.alpha]);
        for alpha in alphas {
            if !(alpha > 0.0) || !alpha.is_finite() {
                return Err(EncodingError::Config(format!(
                    "ridge alphas must be positive and finite, got {alpha}"
                )));
            }
        }
        Ok(())
    }
}

/// Where a batch finds its inputs and writes its tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataLayout {
    pub base_dir: PathBuf,
    /// Relative paths are resolved against `base_dir`
    pub fmri_dir: PathBuf,
    pub textgrid_dir: PathBuf,
    pub results_dir: PathBuf,
    /// `{section}` is replaced by the run's section number
    pub textgrid_template: String,
    pub runs: Vec<u32>,
    /// section = run - section_offset
    pub section_offset: u32,
    /// Interval labels that are not words
    pub silence_labels: Vec<String>,
    /// Interval label closing a sentence
    pub sentence_boundary: String,
}

impl Default for DataLayout {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("project_data"),
            fmri_dir: PathBuf::from("fmri"),
            textgrid_dir: PathBuf::from("textgrid"),
            results_dir: PathBuf::from("results_final_v2"),
            textgrid_template: "lppEN_section{section}.TextGrid".to_string(),
            runs: (15..=23).collect(),
            section_offset: 14,
            silence_labels: vec!["<sil>".into(), "sp".into(), "SIL".into()],
            sentence_boundary: "#".to_string(),
        }
    }
}

impl DataLayout {
    fn resolve(&self, dir: &Path) -> PathBuf {
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            self.base_dir.join(dir)
        }
    }

    pub fn fmri_path(&self) -> PathBuf {
        self.resolve(&self.fmri_dir)
    }

    pub fn textgrid_path(&self) -> PathBuf {
        self.resolve(&self.textgrid_dir)
    }

    pub fn results_path(&self) -> PathBuf {
        self.resolve(&self.results_dir)
    }

    /// Directory holding one condition's sentence embeddings
    pub fn feature_path(&self, condition: &Condition) -> PathBuf {
        self.resolve(&condition.feature_dir)
    }

    /// Transcript section a run was recorded against
    pub fn section_for(&self, run: u32) -> Option<u32> {
        run.checked_sub(self.section_offset)
    }

    /// TextGrid file for a section
    pub fn textgrid_file(&self, section: u32) -> PathBuf {
        let name = self
            .textgrid_template
            .replace("{section}", &section.to_string());
        self.textgrid_path().join(name)
    }

    /// CSV table written for a condition
    pub fn results_file(&self, condition: &Condition) -> PathBuf {
        self.results_path()
            .join(format!("{}_final_results.csv", condition.name))
    }
}

/// One model variant whose embeddings are analyzed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub name: String,
    pub feature_dir: PathBuf,
}

impl Condition {
    pub fn new(name: impl Into<String>, feature_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            feature_dir: feature_dir.into(),
        }
    }
}

fn default_conditions() -> Vec<Condition> {
    vec![
        Condition::new("Base", "embeddings_base"),
        Condition::new("Instruct", "embeddings_instruct"),
    ]
}

/// Complete configuration of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub data: DataLayout,
    pub encoding: EncodingConfig,
    pub conditions: Vec<Condition>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data: DataLayout::default(),
            encoding: EncodingConfig::default(),
            conditions: default_conditions(),
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file; omitted fields take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| EncodingError::io(path, e))?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            EncodingError::Config(format!("{}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.encoding.validate()?;
        if self.conditions.is_empty() {
            return Err(EncodingError::Config("no conditions configured".into()));
        }
        if !self.data.textgrid_template.contains("{section}") {
            return Err(EncodingError::Config(format!(
                "TextGrid template '{}' lacks a {{section}} placeholder",
                self.data.textgrid_template
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.encoding.tr, 2.0);
        assert_eq!(config.encoding.pca_components, 15);
        assert_eq!(config.encoding.candidate_delays, vec![4.0, 6.0, 8.0, 10.0]);
        assert_eq!(config.encoding.roi.size, 300);
        assert_eq!(config.encoding.cv.folds, 5);
        assert_eq!(config.data.runs.len(), 9);
        assert_eq!(config.conditions[1].name, "Instruct");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{ "encoding": { "cv": { "folds": 3 } }, "data": { "runs": [15] } }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.encoding.cv.folds, 3);
        assert_eq!(config.encoding.cv.alphas, vec![100.0, 1000.0, 10000.0]);
        assert_eq!(config.encoding.tr, 2.0);
        assert_eq!(config.data.runs, vec![15]);
        assert_eq!(config.conditions.len(), 2);
    }

    #[test]
    fn test_validation_rejects_bad_settings() {
        let mut config = EncodingConfig::default();
        config.cv.folds = 1;
        assert!(matches!(config.validate(), Err(EncodingError::Config(_))));

        let mut config = EncodingConfig::default();
        config.candidate_delays.clear();
        assert!(config.validate().is_err());

        let mut config = EncodingConfig::default();
        config.cv.alphas = vec![100.0, -1.0];
        assert!(config.validate().is_err());

        let mut config = EncodingConfig::default();
        config.probe.train_fraction = 1.0;
        assert!(config.validate().is_err());

        let mut config = EncodingConfig::default();
        config.probe.alpha = 0.0;
        assert!(config.validate().is_err());

        let mut config = EncodingConfig::default();
        config.roi.alpha = f64::INFINITY;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_layout_paths() {
        let layout = DataLayout {
            base_dir: PathBuf::from("/data"),
            ..Default::default()
        };
        assert_eq!(layout.section_for(15), Some(1));
        assert_eq!(layout.section_for(3), None);
        assert_eq!(
            layout.textgrid_file(4),
            PathBuf::from("/data/textgrid/lppEN_section4.TextGrid")
        );
        let base = Condition::new("Base", "embeddings_base");
        assert_eq!(
            layout.results_file(&base),
            PathBuf::from("/data/results_final_v2/Base_final_results.csv")
        );
        assert_eq!(
            layout.feature_path(&base),
            PathBuf::from("/data/embeddings_base")
        );
    }
}
