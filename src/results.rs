//! Results table: one column of layer scores per run
//!
//! Tables are stored as CSV with an unnamed layer-index column followed by one
//! column per run (`,Run15,Run16,...`). The store rewrites the whole file
//! after every recorded run, so an interrupted batch loses at most the run in
//! progress.

use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{EncodingError, Result};

/// Column label of a run
pub fn run_label(run: u32) -> String {
    format!("Run{run}")
}

/// Layer scores keyed by run, in insertion order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultsTable {
    columns: Vec<(String, Vec<f64>)>,
}

impl ResultsTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a run's layer scores; an existing column for the run is
    /// replaced where it stands
    pub fn insert(&mut self, run: impl Into<String>, scores: Vec<f64>) {
        let run = run.into();
        match self.columns.iter_mut().find(|(id, _)| *id == run) {
            Some((_, existing)) => *existing = scores,
            None => self.columns.push((run, scores)),
        }
    }

    pub fn get(&self, run: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .find(|(id, _)| id == run)
            .map(|(_, scores)| scores.as_slice())
    }

    pub fn contains(&self, run: &str) -> bool {
        self.get(run).is_some()
    }

    pub fn run_ids(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(id, _)| id.as_str())
    }

    pub fn n_runs(&self) -> usize {
        self.columns.len()
    }

    /// Number of rows, the longest column
    pub fn n_layers(&self) -> usize {
        self.columns.iter().map(|(_, s)| s.len()).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Finite scores of one layer across runs, paired with their run
    pub fn layer_values(&self, layer: usize) -> Vec<(&str, f64)> {
        self.columns
            .iter()
            .filter_map(|(id, scores)| {
                scores
                    .get(layer)
                    .filter(|v| v.is_finite())
                    .map(|&v| (id.as_str(), v))
            })
            .collect()
    }

    /// Write the table, replacing `path` atomically
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let results_error = |reason: String| EncodingError::Results {
            path: path.to_path_buf(),
            reason,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| results_error(e.to_string()))?;
        }

        let staging = path.with_extension("csv.partial");
        {
            let mut writer =
                csv::Writer::from_path(&staging).map_err(|e| results_error(e.to_string()))?;

            let mut header = vec![String::new()];
            header.extend(self.columns.iter().map(|(id, _)| id.clone()));
            writer
                .write_record(&header)
                .map_err(|e| results_error(e.to_string()))?;

            for layer in 0..self.n_layers() {
                let mut record = vec![layer.to_string()];
                record.extend(self.columns.iter().map(|(_, scores)| {
                    scores
                        .get(layer)
                        .filter(|v| v.is_finite())
                        .map(ToString::to_string)
                        .unwrap_or_default()
                }));
                writer
                    .write_record(&record)
                    .map_err(|e| results_error(e.to_string()))?;
            }
            writer.flush().map_err(|e| results_error(e.to_string()))?;
        }

        std::fs::rename(&staging, path).map_err(|e| results_error(e.to_string()))?;
        debug!("Wrote {} runs to {}", self.n_runs(), path.display());
        Ok(())
    }

    /// Read a table written by [`write_csv`](Self::write_csv) (or by pandas).
    ///
    /// Empty cells become NaN; trailing NaNs of a column are dropped.
    pub fn read_csv(path: &Path) -> Result<Self> {
        let results_error = |reason: String| EncodingError::Results {
            path: path.to_path_buf(),
            reason,
        };
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .map_err(|e| results_error(e.to_string()))?;

        let headers = reader
            .headers()
            .map_err(|e| results_error(e.to_string()))?
            .clone();
        let mut columns: Vec<(String, Vec<f64>)> = headers
            .iter()
            .skip(1)
            .map(|id| (id.to_string(), Vec::new()))
            .collect();

        for (row, record) in reader.records().enumerate() {
            let record = record.map_err(|e| results_error(e.to_string()))?;
            for (cell, (id, scores)) in record.iter().skip(1).zip(columns.iter_mut()) {
                let cell = cell.trim();
                let value = if cell.is_empty() {
                    f64::NAN
                } else {
                    cell.parse::<f64>().map_err(|_| {
                        results_error(format!("row {row}, column {id}: '{cell}' is not a number"))
                    })?
                };
                scores.push(value);
            }
        }

        for (_, scores) in &mut columns {
            while scores.last().is_some_and(|v| v.is_nan()) {
                scores.pop();
            }
        }
        Ok(Self { columns })
    }
}

/// Results table bound to the file it is persisted to
#[derive(Debug)]
pub struct ResultsStore {
    path: PathBuf,
    table: ResultsTable,
}

impl ResultsStore {
    /// Start an empty table; the file is written on the first record
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            table: ResultsTable::new(),
        }
    }

    /// Continue from an existing file, or start empty if there is none
    pub fn resume(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let table = if path.exists() {
            ResultsTable::read_csv(&path)?
        } else {
            ResultsTable::new()
        };
        Ok(Self { path, table })
    }

    /// Add a run's scores and rewrite the file
    pub fn record(&mut self, run: impl Into<String>, scores: Vec<f64>) -> Result<()> {
        self.table.insert(run, scores);
        self.table.write_csv(&self.path)
    }

    pub fn table(&self) -> &ResultsTable {
        &self.table
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn into_table(self) -> ResultsTable {
        self.table
    }
}
