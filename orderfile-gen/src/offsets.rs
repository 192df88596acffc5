//! Offset Processor: hands profiles and the instrumented library to the
//! symbol-ordering tool.

use std::{
    fs,
    path::{Path, PathBuf},
};

use orderfile_mobile::{Invocation, Runner};
use serde::Deserialize;

use crate::error::{Error, IoResultExt, Result};

/// Ordered symbols and how many bytes of text they cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolOrder {
    pub symbols: Vec<String>,
    pub total_bytes: u64,
}

impl SymbolOrder {
    pub fn covered_kib(&self) -> f64 {
        self.total_bytes as f64 / 1024.0
    }
}

/// Last line the tool prints.
#[derive(Debug, Deserialize)]
struct Summary {
    total_size: u64,
}

/// Runs `tool` over `profiles`, writing the ordered symbols to `output`.
pub fn process(
    runner: &dyn Runner,
    tool: &Path,
    profiles: &[PathBuf],
    library: &Path,
    output: &Path,
) -> Result<SymbolOrder> {
    if let Some(dir) = output.parent() {
        fs::create_dir_all(dir).io_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let cmd = Invocation::new(tool)
        .arg("--library")
        .arg(library)
        .arg("--output")
        .arg(output)
        .args(profiles.iter())
        .capture();
    log::info!("processing {} profiles", profiles.len());
    let printed = runner.run(&cmd)?.text;

    let tool_output = |message: String| Error::ToolOutput {
        tool: tool.display().to_string(),
        message,
    };
    let last = printed
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| tool_output("no summary line".to_string()))?;
    let summary: Summary =
        serde_json::from_str(last).map_err(|err| tool_output(format!("{err} in {last:?}")))?;

    let symbols = fs::read_to_string(output)
        .io_context(|| format!("Failed to read {}", output.display()))?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect::<Vec<_>>();
    log::info!(
        "{} symbols cover {} bytes",
        symbols.len(),
        summary.total_size
    );
    Ok(SymbolOrder {
        symbols,
        total_bytes: summary.total_size,
    })
}
