//! Run reports: markdown summary, JSON report and a parquet snapshot of the record set.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, RecordBatch, StringArray, UInt32Array, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use licitai_adapters::{PageCursor, SyncWindow};
use licitai_core::Tender;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Cancelled,
    AuthFailed,
    SourceUnavailable,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::AuthFailed => "auth_failed",
            RunStatus::SourceUnavailable => "source_unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub tender_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub window: SyncWindow,
    pub pages: usize,
    pub skipped_pages: Vec<PageCursor>,
    /// Summaries rejected by the business-profile pre-filter.
    pub filtered: usize,
    pub created: usize,
    /// Existing records whose listing content changed.
    pub updated: usize,
    pub recovered: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub duplicates: usize,
    pub extracted: usize,
    pub scored: usize,
    pub already_scored: usize,
    pub discarded_scores: usize,
    /// Work abandoned because another writer moved the record on.
    pub superseded: usize,
    pub extraction_failed: usize,
    pub scoring_failed: usize,
    pub store_errors: usize,
    pub extraction_calls: u32,
    pub scoring_calls: u32,
    pub failures: Vec<RecordFailure>,
    pub resume_from: Option<PageCursor>,
    pub reports_dir: Option<String>,
}

impl RunReport {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>, window: SyncWindow) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            status: RunStatus::Completed,
            window,
            pages: 0,
            skipped_pages: Vec::new(),
            filtered: 0,
            created: 0,
            updated: 0,
            recovered: 0,
            unchanged: 0,
            skipped: 0,
            duplicates: 0,
            extracted: 0,
            scored: 0,
            already_scored: 0,
            discarded_scores: 0,
            superseded: 0,
            extraction_failed: 0,
            scoring_failed: 0,
            store_errors: 0,
            extraction_calls: 0,
            scoring_calls: 0,
            failures: Vec::new(),
            resume_from: None,
            reports_dir: None,
        }
    }

    pub fn failed(&self) -> usize {
        self.extraction_failed + self.scoring_failed + self.store_errors
    }

    pub fn to_markdown(&self) -> String {
        let mut lines = vec![
            "# LicitAI Sync Run".to_string(),
            String::new(),
            format!("- Run ID: `{}`", self.run_id),
            format!("- Status: {}", self.status.as_str()),
            format!("- Started: {}", self.started_at),
            format!("- Finished: {}", self.finished_at),
            format!("- Window: {} .. {}", self.window.from, self.window.to),
            format!("- Pages: {} ({} skipped as malformed)", self.pages, self.skipped_pages.len()),
            String::new(),
            "## Records".to_string(),
            format!("- created: {}", self.created),
            format!("- updated: {}", self.updated),
            format!("- recovered: {}", self.recovered),
            format!("- unchanged: {}", self.unchanged),
            format!("- skipped (in flight): {}", self.skipped),
            format!("- filtered by profile: {}", self.filtered),
            format!("- failed: {}", self.failed()),
            String::new(),
            "## Pipeline".to_string(),
            format!("- extracted: {} ({} calls)", self.extracted, self.extraction_calls),
            format!("- scored: {} ({} calls)", self.scored, self.scoring_calls),
            format!("- discarded scores: {}", self.discarded_scores),
            format!("- superseded: {}", self.superseded),
        ];
        if let Some(cursor) = self.resume_from {
            lines.push(String::new());
            lines.push(format!("Resume from {} page {}.", cursor.day, cursor.page));
        }
        if !self.failures.is_empty() {
            lines.push(String::new());
            lines.push("## Failures".to_string());
            for failure in &self.failures {
                lines.push(format!("- `{}`: {}", failure.tender_id, failure.reason));
            }
        }
        lines.push(String::new());
        lines.join("\n")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub fn reports_root(data_dir: &Path) -> PathBuf {
    data_dir.join("reports")
}

/// Writes `run_summary.md`, `run_report.json` and `snapshots/` under `<data_dir>/reports/<run_id>`.
pub async fn write_run_reports(
    data_dir: &Path,
    report: &mut RunReport,
    tenders: &[Tender],
) -> Result<PathBuf> {
    let reports_dir = reports_root(data_dir).join(report.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;
    report.reports_dir = Some(reports_dir.display().to_string());

    fs::write(reports_dir.join("run_summary.md"), report.to_markdown())
        .await
        .context("writing run_summary.md")?;

    let json = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(reports_dir.join("run_report.json"), json)
        .await
        .context("writing run_report.json")?;

    export_parquet_snapshot(&reports_dir, tenders).await?;
    Ok(reports_dir)
}

async fn export_parquet_snapshot(reports_dir: &Path, tenders: &[Tender]) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let tenders_path = snapshot_dir.join("tenders.parquet");
    write_tenders_parquet(&tenders_path, tenders)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![manifest_entry("tenders", reports_dir, &tenders_path)?],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_tenders_parquet(path: &Path, tenders: &[Tender]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("organism", DataType::Utf8, false),
        ArrowField::new("publish_date", DataType::Utf8, true),
        ArrowField::new("close_date", DataType::Utf8, true),
        ArrowField::new("state", DataType::Utf8, false),
        ArrowField::new("favorited", DataType::Boolean, false),
        ArrowField::new("archived", DataType::Boolean, false),
        ArrowField::new("score", DataType::Float64, true),
        ArrowField::new("content_hash", DataType::Utf8, false),
        ArrowField::new("extraction_attempts", DataType::UInt32, false),
        ArrowField::new("scoring_attempts", DataType::UInt32, false),
        ArrowField::new("last_error", DataType::Utf8, true),
        ArrowField::new("version", DataType::UInt64, false),
    ]));

    let ids = StringArray::from(tenders.iter().map(|t| Some(t.id.as_str())).collect::<Vec<_>>());
    let titles = StringArray::from(
        tenders
            .iter()
            .map(|t| Some(t.title.as_str()))
            .collect::<Vec<_>>(),
    );
    let organisms = StringArray::from(
        tenders
            .iter()
            .map(|t| Some(t.organism.as_str()))
            .collect::<Vec<_>>(),
    );
    let publish_dates = StringArray::from(
        tenders
            .iter()
            .map(|t| t.publish_date.map(|d| d.to_string()))
            .collect::<Vec<_>>(),
    );
    let close_dates = StringArray::from(
        tenders
            .iter()
            .map(|t| t.close_date.map(|d| d.to_string()))
            .collect::<Vec<_>>(),
    );
    let states = StringArray::from(
        tenders
            .iter()
            .map(|t| Some(t.state.as_str()))
            .collect::<Vec<_>>(),
    );
    let favorited =
        BooleanArray::from(tenders.iter().map(|t| t.flags.favorited).collect::<Vec<_>>());
    let archived = BooleanArray::from(tenders.iter().map(|t| t.flags.archived).collect::<Vec<_>>());
    // Stale scores are exported as null.
    let scores = Float64Array::from(
        tenders
            .iter()
            .map(|t| t.trusted_score().map(|(value, _)| value))
            .collect::<Vec<_>>(),
    );
    let hashes = StringArray::from(
        tenders
            .iter()
            .map(|t| Some(t.content_hash.as_str()))
            .collect::<Vec<_>>(),
    );
    let extraction_attempts = UInt32Array::from(
        tenders
            .iter()
            .map(|t| t.extraction_attempts)
            .collect::<Vec<_>>(),
    );
    let scoring_attempts =
        UInt32Array::from(tenders.iter().map(|t| t.scoring_attempts).collect::<Vec<_>>());
    let last_errors = StringArray::from(
        tenders
            .iter()
            .map(|t| t.last_error.map(|e| e.to_string()))
            .collect::<Vec<_>>(),
    );
    let versions = UInt64Array::from(tenders.iter().map(|t| t.version).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(titles),
            Arc::new(organisms),
            Arc::new(publish_dates),
            Arc::new(close_dates),
            Arc::new(states),
            Arc::new(favorited),
            Arc::new(archived),
            Arc::new(scores),
            Arc::new(hashes),
            Arc::new(extraction_attempts),
            Arc::new(scoring_attempts),
            Arc::new(last_errors),
            Arc::new(versions),
        ],
    )
    .context("building tenders record batch")?;
    write_parquet(path, batch)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

/// Markdown digest of the `runs` most recent run reports under `<data_dir>/reports`.
pub fn report_recent_markdown(runs: usize, data_dir: &Path) -> Result<String> {
    let reports_root = reports_root(data_dir);
    let mut reports = Vec::new();
    if reports_root.exists() {
        for entry in std::fs::read_dir(&reports_root)
            .with_context(|| format!("reading {}", reports_root.display()))?
        {
            let entry = entry.with_context(|| format!("reading {}", reports_root.display()))?;
            let path = entry.path().join("run_report.json");
            if !path.is_file() {
                continue;
            }
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let report: RunReport =
                serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
            reports.push(report);
        }
    }
    reports.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    let mut lines = vec!["# LicitAI Recent Runs".to_string(), String::new()];
    if reports.is_empty() {
        lines.push("No runs recorded yet.".to_string());
    }
    for report in reports.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}` ({})", report.run_id, report.status.as_str()));
        lines.push(format!("- started: {}", report.started_at));
        lines.push(format!(
            "- created {} / updated {} / unchanged {} / failed {}",
            report.created,
            report.updated,
            report.unchanged,
            report.failed()
        ));
        lines.push(format!(
            "- extraction calls {} / scoring calls {}",
            report.extraction_calls, report.scoring_calls
        ));
        if let Some(dir) = &report.reports_dir {
            lines.push(format!("- summary: `{dir}/run_summary.md`"));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
