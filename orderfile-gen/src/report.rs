use std::{fs, path::Path};

use comfy_table::{Cell, Color, ContentArrangement, Row, Table, presets::UTF8_FULL};
use serde::Serialize;

use crate::{
    benchmark::{BenchmarkData, BenchmarkResults, Outcome},
    error::{IoResultExt, Result},
};

/// Everything a run learned. Fields that a run didn't get to are omitted
/// from the JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Report {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offsets_kib: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orderfile_median_speedup: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orderfile_benchmark_rsd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_orderfile_benchmark_rsd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orderfile_benchmark_results: Option<BenchmarkResults>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_orderfile_benchmark_results: Option<BenchmarkResults>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn median(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}

/// Sample standard deviation over the mean.
pub fn relative_stdev(samples: &[f64]) -> Option<f64> {
    if samples.len() < 2 {
        return None;
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    if mean == 0.0 {
        return None;
    }
    let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some(variance.sqrt() / mean)
}

fn samples<'r>(results: &'r BenchmarkResults, key: &str) -> Option<&'r [f64]> {
    match results.get(key)?.done()? {
        BenchmarkData::Samples(samples) => Some(samples),
        BenchmarkData::Stories(_) => None,
    }
}

impl Report {
    /// Stores both arms and, when `key` produced samples in both, the
    /// median speedup and each arm's relative standard deviation.
    pub fn record_benchmarks(
        &mut self,
        with_orderfile: BenchmarkResults,
        without_orderfile: BenchmarkResults,
        key: &str,
    ) {
        let with = samples(&with_orderfile, key);
        let without = samples(&without_orderfile, key);
        self.orderfile_benchmark_rsd = with.and_then(relative_stdev);
        self.no_orderfile_benchmark_rsd = without.and_then(relative_stdev);
        self.orderfile_median_speedup = match (with.and_then(median), without.and_then(median)) {
            (Some(with), Some(without)) if with != 0.0 => Some(without / with),
            _ => None,
        };
        self.orderfile_benchmark_results = Some(with_orderfile);
        self.no_orderfile_benchmark_results = Some(without_orderfile);
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|err| format!("{{\"error\": {err:?}}}"))
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_json() + "\n")
            .io_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn summary_table(&self) -> Table {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(Row::from(vec![
                Cell::new("Metric").fg(Color::Cyan),
                Cell::new("Value").fg(Color::Cyan),
            ]));
        let mut row = |name: &str, value: String| {
            table.add_row(Row::from(vec![Cell::new(name), Cell::new(value)]));
        };
        if let Some(kib) = self.offsets_kib {
            row("Covered", format!("{kib:.1} KiB"));
        }
        if let Some(speedup) = self.orderfile_median_speedup {
            row("Median speedup", format!("{speedup:.3}x"));
        }
        if let Some(rsd) = self.orderfile_benchmark_rsd {
            row("RSD with orderfile", format!("{:.2}%", rsd * 100.0));
        }
        if let Some(rsd) = self.no_orderfile_benchmark_rsd {
            row("RSD without orderfile", format!("{:.2}%", rsd * 100.0));
        }
        for (arm, results) in [
            ("with orderfile", &self.orderfile_benchmark_results),
            ("without orderfile", &self.no_orderfile_benchmark_results),
        ] {
            for (name, outcome) in results.iter().flatten() {
                if let Outcome::Failed { .. } = outcome {
                    row(&format!("{name} ({arm})"), "failed".to_string());
                }
            }
        }
        if let Some(error) = &self.error {
            row("Error", error.clone());
        }
        table
    }
}
