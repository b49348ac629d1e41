// src/report/writer.rs

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::fs::FileSystem;
use crate::report::aggregator::SuiteSummary;
use crate::report::model::ExecutionReport;

/// Writes report JSON documents under a report directory:
///
/// - `<dir>/units/<unit>-<execution_id>.json`, one per execution
/// - `<dir>/suite-summary.json`
#[derive(Debug, Clone)]
pub struct ReportWriter {
    dir: PathBuf,
    fs: Arc<dyn FileSystem>,
}

impl ReportWriter {
    pub fn new(dir: impl Into<PathBuf>, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            dir: dir.into(),
            fs,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn unit_report_path(&self, report: &ExecutionReport) -> PathBuf {
        self.dir.join("units").join(format!(
            "{}-{}.json",
            sanitize(&report.unit_id),
            sanitize(&report.execution_id)
        ))
    }

    pub fn summary_path(&self) -> PathBuf {
        self.dir.join("suite-summary.json")
    }

    pub fn write_unit(&self, report: &ExecutionReport) -> Result<PathBuf> {
        let path = self.unit_report_path(report);
        let bytes = serde_json::to_vec_pretty(report)
            .with_context(|| format!("serializing report for unit '{}'", report.unit_id))?;
        self.fs.write(&path, &bytes)?;
        Ok(path)
    }

    pub fn write_summary(&self, summary: &SuiteSummary) -> Result<PathBuf> {
        let path = self.summary_path();
        let bytes = serde_json::to_vec_pretty(summary).context("serializing suite summary")?;
        self.fs.write(&path, &bytes)?;
        Ok(path)
    }
}

/// Keep file names portable: unit ids may contain path separators.
fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
