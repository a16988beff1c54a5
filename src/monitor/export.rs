//! JSON and CSV export of monitor data.

use super::{
    LoadSample, PerformanceMonitor, PerformanceSummary, QueryPatterns, QueryPerformanceRecord,
};
use crate::error::{HarnessError, HarnessResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

const PATTERN_LIMIT: usize = 20;

const CSV_HEADER: &str =
    "id,query,sql,duration_ms,rows_affected,backend,connection_id,started_at,ended_at,error";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// Summary, patterns, records and load history in one document
    #[default]
    Json,
    /// One row per query record
    Csv,
}

impl FromStr for ExportFormat {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            other => Err(HarnessError::invalid_input(format!(
                "Unknown export format '{other}', expected json or csv"
            ))),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PerformanceReport {
    pub summary: PerformanceSummary,
    pub patterns: QueryPatterns,
    pub records: Vec<QueryPerformanceRecord>,
    pub load_history: Vec<LoadSample>,
}

impl PerformanceMonitor {
    /// Everything the monitor knows about the last `window_minutes`.
    pub fn report(&self, window_minutes: u64) -> PerformanceReport {
        let (records, load_history, _) = self.window(window_minutes);
        PerformanceReport {
            summary: self.get_performance_summary(window_minutes),
            patterns: self.get_query_patterns(window_minutes, PATTERN_LIMIT),
            records,
            load_history,
        }
    }

    pub fn export(&self, format: ExportFormat, window_minutes: u64) -> HarnessResult<String> {
        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&self.report(window_minutes))?),
            ExportFormat::Csv => {
                let (records, _, _) = self.window(window_minutes);
                Ok(records_to_csv(&records))
            }
        }
    }

    pub async fn export_to_file(
        &self,
        path: impl AsRef<Path>,
        format: ExportFormat,
        window_minutes: u64,
    ) -> HarnessResult<()> {
        let path = path.as_ref();
        let body = self.export(format, window_minutes)?;
        tokio::fs::write(path, body).await?;
        info!(path = %path.display(), ?format, "Performance data exported");
        Ok(())
    }
}

pub fn records_to_csv(records: &[QueryPerformanceRecord]) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for r in records {
        let fields = [
            r.id.clone(),
            r.query.clone(),
            r.sql.clone(),
            format!("{:.3}", r.duration_ms),
            r.rows_affected.map(|n| n.to_string()).unwrap_or_default(),
            r.backend.to_string(),
            r.connection_id.clone(),
            r.started_at.to_rfc3339(),
            r.ended_at.to_rfc3339(),
            r.error.clone().unwrap_or_default(),
        ];
        let line: Vec<String> = fields.iter().map(|f| escape_csv(f)).collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }
    out
}

fn escape_csv(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
