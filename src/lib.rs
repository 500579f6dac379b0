// Pedantic clippy configuration for a numerical codebase
// These are acceptable in numerical code:
#![allow(clippy::cast_precision_loss)] // usize→f64 intentional in statistics
#![allow(clippy::cast_possible_truncation)] // f64→usize for TR indices
#![allow(clippy::cast_possible_wrap)] // usize→i64 in index arithmetic
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `x_train`/`y_train`
#![allow(clippy::module_name_repetitions)] // EncodingConfig in config.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive
#![allow(clippy::neg_cmp_op_on_partial_ord)] // `!(x > 0.0)` also rejects NaN

//! brainlm-rs: layer-wise brain encoding analysis
//!
//! Measures how well the hidden states of each layer of a language model
//! predict fMRI responses of listeners hearing the same narrative, and
//! compares a base model against its instruction-tuned counterpart.
//!
//! ## Architecture
//!
//! - `config`: Analysis constants and on-disk data layout
//! - `error`: Error type and soft stage outcomes
//! - `textgrid`: Praat TextGrid parsing and sentence interval extraction
//! - `embeddings`: Per-sentence layer embeddings and interval alignment
//! - `bold`: Volumetric BOLD loading and per-sentence response windows
//! - `linalg`: PCA, ridge regression with leave-one-out alpha, correlation
//! - `confound`: Linear removal of the sentence-duration confound
//! - `delay`: Hemodynamic delay search on a held-out split
//! - `voxels`: Region-of-interest voxel selection
//! - `encoder`: Cross-validated per-layer encoding scores
//! - `results`: Per-condition results table (CSV) with resumable persistence
//! - `pipeline`: Runner coordinating all stages for every run of a condition
//! - `compare`: Layer-wise statistics between two conditions

pub mod bold;
pub mod compare;
pub mod config;
pub mod confound;
pub mod delay;
pub mod embeddings;
pub mod encoder;
pub mod error;
pub mod linalg;
pub mod pipeline;
pub mod results;
pub mod textgrid;
pub mod voxels;

pub use bold::{BoldSeries, BoldSource, NiftiBoldSource, ResponseSource};
pub use compare::{compare_tables, ConditionComparison, LayerComparison};
pub use config::{
    Condition, CvConfig, DataLayout, EncodingConfig, PipelineConfig, ProbeConfig, RoiConfig,
};
pub use confound::{duration_covariate, remove_confound};
pub use delay::{select_delay, DelaySearch};
pub use embeddings::{align, AlignedRun, EmbeddingStore, EmbeddingTensor};
pub use encoder::{encode_layers, KFold, LayerScore};
pub use error::{EncodingError, StageOutcome};
pub use linalg::{Pca, Ridge};
pub use pipeline::{encode_run, ConditionSummary, Pipeline, RunReport};
pub use results::{run_label, ResultsStore, ResultsTable};
pub use textgrid::{SentenceInterval, SentenceRules, TextGrid};
pub use voxels::{select_voxels, VoxelSelection};
