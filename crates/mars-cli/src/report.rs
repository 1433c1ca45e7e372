use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use coordination::DispatchSummary;

/// Print the per-node summary to stderr and, if asked, write it as JSON.
pub fn emit(summary: &DispatchSummary, report_path: Option<&Path>) -> Result<()> {
    eprint!("{summary}");
    if let Some(path) = report_path {
        write_json(summary, path)?;
        tracing::info!(path = %path.display(), "run report written");
    }
    Ok(())
}

/// Write the summary as JSON with credentials scrubbed from captured output.
pub fn write_json(summary: &DispatchSummary, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&summary.redacted())
        .context("Failed to serialize run report")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write run report to {}", path.display()))
}

/// Zero only when every node succeeded.
pub fn exit_code(summary: &DispatchSummary) -> ExitCode {
    if summary.all_succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
