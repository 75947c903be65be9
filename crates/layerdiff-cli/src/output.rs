//! CLI output styling for layerdiff

use colored::Colorize;
use layerdiff::{LayerError, Result};
use std::path::PathBuf;

/// What one snapshot produced
#[derive(Debug, Clone)]
pub struct StepReport {
    /// Build step that ran before the snapshot, `None` for a plain snapshot
    pub step: Option<String>,
    /// Cache key of the layer stack after this snapshot
    pub key: String,
    pub added: usize,
    pub whiteouts: usize,
    /// Written tarball, `None` when the step changed nothing
    pub layer: Option<PathBuf>,
}

/// Print reports to stdout, as JSON or as a coloured summary.
pub fn print_reports(reports: &[StepReport], json: bool) -> Result<()> {
    if json {
        return print_reports_json(reports);
    }

    for (index, report) in reports.iter().enumerate() {
        let label = match &report.step {
            Some(step) => format!("[{}] {}", index + 1, step),
            None => "snapshot".to_string(),
        };
        println!("{}", label.white().bold());

        match &report.layer {
            Some(path) => println!(
                "  {} {} ({}, {})",
                "layer".green(),
                path.display(),
                format!("+{}", report.added).green(),
                format!("-{}", report.whiteouts).red(),
            ),
            None => println!("  {}", "(no changes)".truecolor(150, 150, 150)),
        }
        println!("  {} {}", "key".cyan(), report.key);
    }
    Ok(())
}

fn print_reports_json(reports: &[StepReport]) -> Result<()> {
    let json = serde_json::to_string_pretty(&reports_json(reports))
        .map_err(|e| LayerError::Io(e.into()))?;
    println!("{json}");
    Ok(())
}

fn reports_json(reports: &[StepReport]) -> Vec<serde_json::Value> {
    reports
        .iter()
        .map(|r| {
            serde_json::json!({
                "step": r.step,
                "key": r.key,
                "added": r.added,
                "whiteouts": r.whiteouts,
                "layer": r.layer.as_ref().map(|p| p.display().to_string()),
            })
        })
        .collect()
}
