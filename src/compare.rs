//! Layer-wise comparison of two conditions' results tables
//!
//! Summarizes each layer across runs (mean and standard error) for both
//! conditions, their difference, and a paired t-test over the runs both
//! tables share.

use serde::Serialize;
use statrs::distribution::{ContinuousCDF, StudentsT};

use crate::results::ResultsTable;

/// Mean and standard error (sample std / sqrt(n)) of a set of scores.
///
/// The standard error is `None` for fewer than two values.
pub fn mean_and_sem(values: &[f64]) -> Option<(f64, Option<f64>)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return Some((mean, None));
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some((mean, Some(variance.sqrt() / n.sqrt())))
}

/// Two-sided paired t-test on per-run differences.
///
/// Returns `(t, p)`, or `None` with fewer than two pairs or no spread.
pub fn paired_t_test(differences: &[f64]) -> Option<(f64, f64)> {
    let n = differences.len();
    if n < 2 {
        return None;
    }
    let (mean, sem) = mean_and_sem(differences)?;
    let sem = sem?;
    if !(sem > 0.0) {
        return None;
    }
    let t = mean / sem;
    let dist = StudentsT::new(0.0, 1.0, (n - 1) as f64).ok()?;
    let p = 2.0 * (1.0 - dist.cdf(t.abs()));
    Some((t, p))
}

/// One layer of the comparison
#[derive(Debug, Clone, Serialize)]
pub struct LayerComparison {
    pub layer: usize,
    pub base_mean: Option<f64>,
    pub base_sem: Option<f64>,
    pub instruct_mean: Option<f64>,
    pub instruct_sem: Option<f64>,
    /// instruct_mean - base_mean
    pub difference: Option<f64>,
    pub n_paired: usize,
    pub t_statistic: Option<f64>,
    pub p_value: Option<f64>,
}

/// Full comparison of two conditions
#[derive(Debug, Clone, Serialize)]
pub struct ConditionComparison {
    pub base_runs: usize,
    pub instruct_runs: usize,
    /// Layer with the highest mean score per condition
    pub base_peak: Option<usize>,
    pub instruct_peak: Option<usize>,
    pub layers: Vec<LayerComparison>,
}

fn peak(layers: &[LayerComparison], mean: impl Fn(&LayerComparison) -> Option<f64>) -> Option<usize> {
    layers
        .iter()
        .filter_map(|l| mean(l).map(|m| (l.layer, m)))
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(layer, _)| layer)
}

/// Compare the per-layer scores of a base and an instruction-tuned table
pub fn compare_tables(base: &ResultsTable, instruct: &ResultsTable) -> ConditionComparison {
    let n_layers = base.n_layers().max(instruct.n_layers());
    let mut layers = Vec::with_capacity(n_layers);

    for layer in 0..n_layers {
        let base_values = base.layer_values(layer);
        let instruct_values = instruct.layer_values(layer);

        let scores = |values: &[(&str, f64)]| values.iter().map(|(_, v)| *v).collect::<Vec<_>>();
        let base_stats = mean_and_sem(&scores(&base_values));
        let instruct_stats = mean_and_sem(&scores(&instruct_values));

        let differences: Vec<f64> = instruct_values
            .iter()
            .filter_map(|(run, i)| {
                base_values
                    .iter()
                    .find(|(r, _)| r == run)
                    .map(|(_, b)| i - b)
            })
            .collect();
        let test = paired_t_test(&differences);

        let base_mean = base_stats.map(|(m, _)| m);
        let instruct_mean = instruct_stats.map(|(m, _)| m);
        layers.push(LayerComparison {
            layer,
            base_mean,
            base_sem: base_stats.and_then(|(_, s)| s),
            instruct_mean,
            instruct_sem: instruct_stats.and_then(|(_, s)| s),
            difference: base_mean.zip(instruct_mean).map(|(b, i)| i - b),
            n_paired: differences.len(),
            t_statistic: test.map(|(t, _)| t),
            p_value: test.map(|(_, p)| p),
        });
    }

    ConditionComparison {
        base_runs: base.n_runs(),
        instruct_runs: instruct.n_runs(),
        base_peak: peak(&layers, |l| l.base_mean),
        instruct_peak: peak(&layers, |l| l.instruct_mean),
        layers,
    }
}

/// Column widths of the comparison table
const WIDTHS: [usize; 6] = [5, 16, 16, 7, 7, 10];

fn border(left: char, middle: char, right: char) -> String {
    let mut line = String::new();
    line.push(left);
    for (i, width) in WIDTHS.iter().enumerate() {
        if i > 0 {
            line.push(middle);
        }
        line.push_str(&"─".repeat(width + 2));
    }
    line.push(right);
    line
}

impl ConditionComparison {
    /// Render the comparison as a box-drawn table
    pub fn render_table(&self) -> String {
        let fmt = |v: Option<f64>, precision: usize| {
            v.map_or_else(|| "-".to_string(), |v| format!("{v:+.precision$}"))
        };
        let fmt_p = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{v:.4}"));
        let [w_layer, w_cond, _, w_diff, w_t, w_p] = WIDTHS;

        let mut lines = vec![
            format!(
                "Base: {} runs, Instruct: {} runs",
                self.base_runs, self.instruct_runs
            ),
            border('┌', '┬', '┐'),
            format!(
                "│ {:>w_layer$} │ {:^w_cond$} │ {:^w_cond$} │ {:>w_diff$} │ {:>w_t$} │ {:<w_p$} │",
                "Layer", "Base r ± SEM", "Instruct r ± SEM", "Δr", "t", "p"
            ),
            border('├', '┼', '┤'),
        ];
        for l in &self.layers {
            let significance = match l.p_value {
                Some(p) if p < 0.001 => "***",
                Some(p) if p < 0.01 => "**",
                Some(p) if p < 0.05 => "*",
                _ => "",
            };
            lines.push(format!(
                "│ {:>w_layer$} │ {:>7} {:>8} │ {:>7} {:>8} │ {:>w_diff$} │ {:>w_t$} │ {:>6} {:<3} │",
                l.layer,
                fmt(l.base_mean, 4),
                fmt_p(l.base_sem),
                fmt(l.instruct_mean, 4),
                fmt_p(l.instruct_sem),
                fmt(l.difference, 4),
                fmt(l.t_statistic, 2),
                fmt_p(l.p_value),
                significance
            ));
        }
        lines.push(border('└', '┴', '┘'));

        if let Some(layer) = self.base_peak {
            lines.push(format!("Base peak:     layer {layer}"));
        }
        if let Some(layer) = self.instruct_peak {
            lines.push(format!("Instruct peak: layer {layer}"));
        }
        lines.join("\n")
    }

    /// Print the comparison as a table
    pub fn print_table(&self) {
        println!("{}", self.render_table());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_and_sem() {
        let (mean, sem) = mean_and_sem(&[1.0, 2.0, 3.0]).unwrap();
        assert!((mean - 2.0).abs() < 1e-12);
        // sample std 1, sqrt(3)
        assert!((sem.unwrap() - 1.0 / 3f64.sqrt()).abs() < 1e-12);
        assert_eq!(mean_and_sem(&[4.0]), Some((4.0, None)));
        assert_eq!(mean_and_sem(&[]), None);
    }

    #[test]
    fn test_paired_t_test() {
        let (t, p) = paired_t_test(&[0.1, 0.12, 0.09, 0.11, 0.1]).unwrap();
        assert!(t > 10.0);
        assert!(p < 0.001);

        let (_, p) = paired_t_test(&[0.1, -0.1, 0.05, -0.05]).unwrap();
        assert!(p > 0.9);

        assert!(paired_t_test(&[0.1]).is_none());
        assert!(paired_t_test(&[0.1, 0.1]).is_none());
    }

    #[test]
    fn test_compare_tables() {
        let mut base = ResultsTable::new();
        base.insert("Run15", vec![0.10, 0.20, 0.05]);
        base.insert("Run16", vec![0.12, 0.22, 0.07]);
        base.insert("Run17", vec![0.11, 0.25, 0.06]);
        let mut instruct = ResultsTable::new();
        instruct.insert("Run15", vec![0.10, 0.18, 0.09]);
        instruct.insert("Run16", vec![0.13, 0.19, 0.10]);

        let cmp = compare_tables(&base, &instruct);
        assert_eq!(cmp.layers.len(), 3);
        assert_eq!(cmp.base_runs, 3);
        assert_eq!(cmp.instruct_runs, 2);
        assert_eq!(cmp.base_peak, Some(1));
        assert_eq!(cmp.instruct_peak, Some(1));

        let layer1 = &cmp.layers[1];
        assert_eq!(layer1.n_paired, 2);
        assert!((layer1.base_mean.unwrap() - 0.22333333333333333).abs() < 1e-12);
        assert!((layer1.difference.unwrap() - (0.185 - 0.22333333333333333)).abs() < 1e-12);
        assert!(layer1.p_value.is_some());
    }

    #[test]
    fn test_table_columns_line_up() {
        let mut base = ResultsTable::new();
        base.insert("Run15", vec![0.10, -0.20, f64::NAN, 0.3]);
        base.insert("Run16", vec![0.12, -0.22, f64::NAN]);
        let mut instruct = ResultsTable::new();
        instruct.insert("Run15", vec![0.10, 0.18, 0.01]);
        instruct.insert("Run16", vec![0.13, 0.19, 0.02]);

        let table = compare_tables(&base, &instruct).render_table();
        let rows: Vec<&str> = table
            .lines()
            .filter(|line| line.starts_with(['┌', '│', '├', '└']))
            .collect();
        assert_eq!(rows.len(), 4 + 4);
        let width = rows[0].chars().count();
        for row in &rows {
            assert_eq!(row.chars().count(), width, "misaligned row: {row}");
            assert!(row.ends_with(['┐', '│', '┤', '┘']));
        }
    }
}
