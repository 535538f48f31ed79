//! Sync pipeline orchestration: source pages in, change detection, two-stage
//! extract-then-score work per record, CAS commits, run reports.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use licitai_adapters::extract::MERCADO_PUBLICO_DETAIL_URL;
use licitai_adapters::score::DEFAULT_GEMINI_MODEL;
use licitai_adapters::source::MERCADO_PUBLICO_API_URL;
use licitai_adapters::{
    AttemptLedger, AttemptOutcome, BrowserlessBackend, BusinessProfile, CancelToken,
    ConnectorConfig, DeepExtractor, ExtractorConfig, FixtureSource, GeminiScorer,
    MercadoPublicoApi, PageCursor, ScorerConfig, ScoringAdapter, ScoringRequest, SourceApi,
    SourceConnector, SourceError, SyncWindow,
};
use licitai_core::{
    ExtractionError, FailureKind, ScoringError, SummaryRecord, Tender, TenderState, TransitionError,
};
use licitai_storage::{
    FileRecordStore, HttpClientConfig, HttpFetcher, Mutator, RecordStore, StoreError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod detect;
pub mod report;

pub use detect::{Action, ChangeDetector, ReExtractReason};
pub use report::{report_recent_markdown, write_run_reports, RecordFailure, RunReport, RunStatus};

pub const CRATE_NAME: &str = "licitai-sync";

/// CAS conflicts tolerated per commit before the record is reported as failed.
const COMMIT_CONFLICT_RETRIES: usize = 16;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub profile_path: PathBuf,
    pub mp_ticket: Option<String>,
    pub mp_api_url: String,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub browserless_url: Option<String>,
    pub browserless_token: Option<String>,
    pub concurrency: usize,
    pub max_sessions: usize,
    pub max_extraction_attempts: u32,
    pub max_scoring_attempts: u32,
    pub extract_timeout_secs: u64,
    pub score_timeout_secs: u64,
    pub source_timeout_secs: u64,
    pub stale_after_secs: u64,
    pub sync_days: u32,
    pub fixtures_dir: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
    pub web_port: u16,
    pub log_level: String,
    pub user_agent: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Self {
            data_dir: text("LICITAI_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            profile_path: text("LICITAI_PROFILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./profile.yaml")),
            mp_ticket: text("MP_TICKET"),
            mp_api_url: text("MP_API_URL").unwrap_or_else(|| MERCADO_PUBLICO_API_URL.to_string()),
            gemini_api_key: text("GEMINI_API_KEY"),
            gemini_model: text("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            browserless_url: text("BROWSERLESS_URL"),
            browserless_token: text("BROWSERLESS_TOKEN"),
            concurrency: parse_or(text("LICITAI_CONCURRENCY"), 4),
            max_sessions: parse_or(text("LICITAI_MAX_SESSIONS"), 2),
            max_extraction_attempts: parse_or(text("LICITAI_MAX_EXTRACTION_ATTEMPTS"), 3),
            max_scoring_attempts: parse_or(text("LICITAI_MAX_SCORING_ATTEMPTS"), 3),
            extract_timeout_secs: parse_or(text("LICITAI_EXTRACT_TIMEOUT_SECS"), 60),
            score_timeout_secs: parse_or(text("LICITAI_SCORE_TIMEOUT_SECS"), 90),
            source_timeout_secs: parse_or(text("LICITAI_SOURCE_TIMEOUT_SECS"), 30),
            stale_after_secs: parse_or(text("LICITAI_STALE_AFTER_SECS"), 1800),
            sync_days: parse_or(text("LICITAI_SYNC_DAYS"), 1),
            fixtures_dir: text("LICITAI_FIXTURES_DIR").map(PathBuf::from),
            scheduler_enabled: text("LICITAI_SCHEDULER_ENABLED")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            sync_cron_1: text("SYNC_CRON_1").unwrap_or_else(|| "0 7 * * *".to_string()),
            sync_cron_2: text("SYNC_CRON_2").unwrap_or_else(|| "0 19 * * *".to_string()),
            web_port: parse_or(text("LICITAI_WEB_PORT"), 3000),
            log_level: text("LICITAI_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            user_agent: text("LICITAI_USER_AGENT").unwrap_or_else(|| "licitai-bot/0.1".to_string()),
        }
    }

    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    /// Default window: the configured number of days ending today.
    pub fn default_window(&self) -> SyncWindow {
        SyncWindow::last_days(Utc::now().date_naive(), self.sync_days)
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Loads `profile.yaml`; a missing file means no filtering and an empty prompt profile.
pub fn load_profile(path: &Path) -> Result<BusinessProfile> {
    if !path.exists() {
        warn!(path = %path.display(), "business profile not found; accepting every listing");
        return Ok(BusinessProfile::default());
    }
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub concurrency: usize,
    pub max_extraction_attempts: u32,
    pub max_scoring_attempts: u32,
    pub stale_after: chrono::Duration,
    /// Where reports and the resume checkpoint go; `None` keeps a run side-effect free
    /// outside the record store.
    pub data_dir: Option<PathBuf>,
    pub detail_url_template: Option<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_extraction_attempts: 3,
            max_scoring_attempts: 3,
            stale_after: chrono::Duration::minutes(30),
            data_dir: None,
            detail_url_template: None,
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            max_extraction_attempts: config.max_extraction_attempts.max(1),
            max_scoring_attempts: config.max_scoring_attempts.max(1),
            stale_after: chrono::Duration::seconds(config.stale_after_secs as i64),
            data_dir: Some(config.data_dir.clone()),
            detail_url_template: Some(MERCADO_PUBLICO_DETAIL_URL.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("source rejected credentials: {message}")]
    Auth { message: String, report: Box<RunReport> },
    #[error("source unavailable: {message}")]
    SourceUnavailable {
        message: String,
        resume_from: Option<PageCursor>,
        report: Box<RunReport>,
    },
}

impl RunError {
    pub fn report(&self) -> &RunReport {
        match self {
            RunError::Auth { report, .. } | RunError::SourceUnavailable { report, .. } => report,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Disposition {
    Filtered,
    Created,
    Updated,
    Recovered,
    Unchanged,
    #[default]
    Skipped,
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkEnd {
    Scored,
    AlreadyScored,
    Failed(FailureKind),
    ScoreDiscarded,
    Superseded,
    Cancelled,
}

/// What happened to one summary; folded into the run report.
#[derive(Debug, Default)]
struct RecordOutcome {
    tender_id: String,
    disposition: Disposition,
    extracted: bool,
    end: Option<WorkEnd>,
    extraction_calls: u32,
    scoring_calls: u32,
    store_error: Option<String>,
}

impl RecordOutcome {
    fn new(tender_id: &str) -> Self {
        Self {
            tender_id: tender_id.to_string(),
            ..Default::default()
        }
    }
}

impl RunReport {
    fn absorb(&mut self, outcome: RecordOutcome) {
        match outcome.disposition {
            Disposition::Filtered => self.filtered += 1,
            Disposition::Created => self.created += 1,
            Disposition::Updated => self.updated += 1,
            Disposition::Recovered => self.recovered += 1,
            Disposition::Unchanged => self.unchanged += 1,
            Disposition::Skipped => self.skipped += 1,
            Disposition::Duplicate => self.duplicates += 1,
        }
        if outcome.extracted {
            self.extracted += 1;
        }
        self.extraction_calls += outcome.extraction_calls;
        self.scoring_calls += outcome.scoring_calls;
        match outcome.end {
            Some(WorkEnd::Scored) => self.scored += 1,
            Some(WorkEnd::AlreadyScored) => self.already_scored += 1,
            Some(WorkEnd::ScoreDiscarded) => self.discarded_scores += 1,
            Some(WorkEnd::Superseded) => self.superseded += 1,
            Some(WorkEnd::Failed(kind)) => {
                match kind {
                    FailureKind::Extraction(_) => self.extraction_failed += 1,
                    FailureKind::Scoring(_) => self.scoring_failed += 1,
                }
                self.failures.push(RecordFailure {
                    tender_id: outcome.tender_id.clone(),
                    reason: kind.to_string(),
                });
            }
            Some(WorkEnd::Cancelled) | None => {}
        }
        if let Some(reason) = outcome.store_error {
            self.store_errors += 1;
            self.failures.push(RecordFailure {
                tender_id: outcome.tender_id,
                reason,
            });
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    from: NaiveDate,
    to: NaiveDate,
    cursor: PageCursor,
}

/// Charges each adapter attempt to the record before the call starts: a guarded CAS
/// that claims the record for the stage and bumps its attempt counter. An attempt cut
/// short by cancellation or a crash stays counted, so recovery runs share one cap.
struct ClaimLedger<'a> {
    pipeline: &'a SyncPipeline,
    id: &'a str,
    guard: &'a (dyn Fn(&Tender) -> bool + Send + Sync),
    claim: Mutator<'a>,
    failure: std::sync::Mutex<Option<StoreError>>,
}

impl<'a> ClaimLedger<'a> {
    fn new(
        pipeline: &'a SyncPipeline,
        id: &'a str,
        guard: &'a (dyn Fn(&Tender) -> bool + Send + Sync),
        claim: Mutator<'a>,
    ) -> Self {
        Self {
            pipeline,
            id,
            guard,
            claim,
            failure: std::sync::Mutex::new(None),
        }
    }

    fn take_failure(&self) -> Option<StoreError> {
        self.failure.lock().ok().and_then(|mut slot| slot.take())
    }
}

#[async_trait]
impl<'a> AttemptLedger for ClaimLedger<'a> {
    async fn charge(&self, attempt: u32) -> bool {
        match self.pipeline.commit(self.id, self.guard, self.claim).await {
            Ok(Some(_)) => true,
            Ok(None) => {
                debug!(attempt, "record moved on; attempt not started");
                false
            }
            Err(err) => {
                if let Ok(mut slot) = self.failure.lock() {
                    *slot = Some(err);
                }
                false
            }
        }
    }
}

pub struct SyncPipeline {
    store: Arc<dyn RecordStore>,
    connector: SourceConnector,
    extractor: DeepExtractor,
    scorer: ScoringAdapter,
    profile: BusinessProfile,
    detector: ChangeDetector,
    settings: PipelineSettings,
}

impl SyncPipeline {
    pub fn new(
        store: Arc<dyn RecordStore>,
        connector: SourceConnector,
        extractor: DeepExtractor,
        scorer: ScoringAdapter,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            connector,
            extractor,
            scorer,
            profile: BusinessProfile::default(),
            detector: ChangeDetector::new(settings.stale_after),
            settings,
        }
    }

    pub fn with_profile(mut self, profile: BusinessProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Wires the concrete backends named by `config`.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let store = Arc::new(FileRecordStore::open(config.store_dir()).await?);
        Self::from_config_with_store(config, store)
    }

    pub fn from_config_with_store(
        config: &SyncConfig,
        store: Arc<dyn RecordStore>,
    ) -> Result<Self> {
        let profile = load_profile(&config.profile_path)?;

        let api: Arc<dyn SourceApi> = match &config.fixtures_dir {
            Some(dir) => Arc::new(FixtureSource::new(dir)),
            None => {
                let ticket = config
                    .mp_ticket
                    .clone()
                    .context("MP_TICKET is required unless LICITAI_FIXTURES_DIR is set")?;
                let http = HttpFetcher::new(HttpClientConfig {
                    timeout: Duration::from_secs(config.source_timeout_secs),
                    user_agent: Some(config.user_agent.clone()),
                    ..Default::default()
                })?;
                Arc::new(MercadoPublicoApi::new(Arc::new(http), &config.mp_api_url, ticket))
            }
        };
        let connector = SourceConnector::new(
            api,
            ConnectorConfig {
                page_timeout: Duration::from_secs(config.source_timeout_secs),
                ..Default::default()
            },
        );

        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;

        let browserless_url = config
            .browserless_url
            .as_deref()
            .context("BROWSERLESS_URL is required for deep extraction")?;
        let extractor = DeepExtractor::new(
            Arc::new(BrowserlessBackend::new(
                client.clone(),
                browserless_url,
                config.browserless_token.as_deref(),
            )),
            ExtractorConfig {
                call_timeout: Duration::from_secs(config.extract_timeout_secs),
                max_sessions: config.max_sessions.max(1),
                ..Default::default()
            },
        );

        let api_key = config
            .gemini_api_key
            .clone()
            .context("GEMINI_API_KEY is required for scoring")?;
        let scorer = ScoringAdapter::new(
            Arc::new(GeminiScorer::new(
                client,
                api_key,
                config.gemini_model.clone(),
                profile.clone(),
            )),
            ScorerConfig {
                call_timeout: Duration::from_secs(config.score_timeout_secs),
                ..Default::default()
            },
        );

        Ok(Self::new(store, connector, extractor, scorer, PipelineSettings::from_config(config))
            .with_profile(profile))
    }

    pub fn store(&self) -> Arc<dyn RecordStore> {
        self.store.clone()
    }

    /// One synchronization run over `window`. Per-record failures land in the report;
    /// only source authentication and exhausted source retries end the run early.
    pub async fn run_once(
        &self,
        window: SyncWindow,
        cancel: &CancelToken,
    ) -> Result<RunReport, RunError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        self.run_inner(run_id, window, cancel).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        window: SyncWindow,
        cancel: &CancelToken,
    ) -> Result<RunReport, RunError> {
        let window = self.resolve_window(window).await;
        let mut report = RunReport::new(run_id, Utc::now(), window.clone());
        info!(from = %window.from, to = %window.to, resume = ?window.resume, "sync run started");

        let mut pages = self.connector.poll(&window);
        let failure = loop {
            if cancel.is_cancelled() {
                report.status = RunStatus::Cancelled;
                break None;
            }
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.status = RunStatus::Cancelled;
                    break None;
                }
                next = pages.next_page() => next,
            };
            let page = match next {
                Ok(Some(page)) => page,
                Ok(None) => break None,
                Err(err) => break Some(err),
            };

            report.pages += 1;
            let mut seen = HashSet::new();
            let items: Vec<SummaryRecord> = page
                .items
                .iter()
                .rev()
                .filter(|summary| seen.insert(summary.id.clone()))
                .cloned()
                .collect();
            let outcomes: Vec<RecordOutcome> = stream::iter(items)
                .map(|summary| self.process_summary(summary, cancel))
                .buffer_unordered(self.settings.concurrency.max(1))
                .collect()
                .await;
            for outcome in outcomes {
                report.absorb(outcome);
            }

            if cancel.is_cancelled() {
                report.status = RunStatus::Cancelled;
                break None;
            }
            pages.confirm(&page);
            self.save_checkpoint(&window, pages.cursor()).await;
        };

        report.skipped_pages = pages.skipped_pages().to_vec();
        report.resume_from = pages.cursor();

        let error = match failure {
            None => None,
            Some(SourceError::Auth(message)) => {
                report.status = RunStatus::AuthFailed;
                error!(%message, "source authentication failed; run aborted");
                Some(message)
            }
            Some(err) => {
                report.status = RunStatus::SourceUnavailable;
                error!(
                    error = %err,
                    resume = ?report.resume_from,
                    "source unavailable; run aborted"
                );
                Some(err.to_string())
            }
        };

        if report.status == RunStatus::Completed {
            report.resume_from = None;
            self.clear_checkpoint().await;
        }
        report.finished_at = Utc::now();
        self.write_reports(&mut report).await;
        info!(
            status = report.status.as_str(),
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            failed = report.failed(),
            extraction_calls = report.extraction_calls,
            scoring_calls = report.scoring_calls,
            "sync run finished"
        );

        match (report.status, error) {
            (RunStatus::AuthFailed, Some(message)) => Err(RunError::Auth {
                message,
                report: Box::new(report),
            }),
            (RunStatus::SourceUnavailable, Some(message)) => Err(RunError::SourceUnavailable {
                message,
                resume_from: report.resume_from,
                report: Box::new(report),
            }),
            _ => Ok(report),
        }
    }

    async fn process_summary(&self, summary: SummaryRecord, cancel: &CancelToken) -> RecordOutcome {
        let mut outcome = RecordOutcome::new(&summary.id);
        if !self.profile.is_relevant(&summary) {
            outcome.disposition = Disposition::Filtered;
            return outcome;
        }
        let span = info_span!("tender", tender_id = %summary.id);
        let result = async {
            match self.admit(&summary, &mut outcome).await? {
                Some(tender) => self.run_stages(tender, cancel, &mut outcome).await,
                None => Ok(()),
            }
        }
        .instrument(span)
        .await;
        if let Err(err) = result {
            error!(tender_id = %summary.id, error = %err, "record store failure");
            outcome.store_error = Some(err.to_string());
        }
        outcome
    }

    /// Runs the change detector and applies its decision; returns the record when
    /// pipeline work is due.
    async fn admit(
        &self,
        summary: &SummaryRecord,
        outcome: &mut RecordOutcome,
    ) -> Result<Option<Tender>, StoreError> {
        let now = Utc::now();
        let existing = self.store.get(&summary.id).await?;
        let action = self.detector.evaluate(summary, existing.as_ref(), now);
        debug!(?action, "change detector decision");

        match action {
            Action::Create => {
                let mut tender = Tender::discovered(summary, now);
                tender.detail_url = self
                    .settings
                    .detail_url_template
                    .as_ref()
                    .map(|template| template.replace("{id}", &summary.id));
                match self.store.create(tender).await {
                    Ok(created) => {
                        outcome.disposition = Disposition::Created;
                        Ok(Some(created))
                    }
                    Err(StoreError::Duplicate(id)) => {
                        warn!(
                            tender_id = %id,
                            "tender was created concurrently; leaving it untouched"
                        );
                        outcome.disposition = Disposition::Duplicate;
                        Ok(None)
                    }
                    Err(err) => Err(err),
                }
            }
            Action::ReExtract(ReExtractReason::ContentChanged) => {
                outcome.disposition = Disposition::Updated;
                let updated = self
                    .commit(
                        &summary.id,
                        &|t: &Tender| t.raw_summary != summary.raw_summary,
                        &|t: &mut Tender| {
                            t.begin_content_version(summary, now);
                            Ok(())
                        },
                    )
                    .await?;
                if updated.is_none() {
                    outcome.end = Some(WorkEnd::Superseded);
                }
                Ok(updated)
            }
            Action::ReExtract(ReExtractReason::Recovery) => {
                info!(state = ?existing.as_ref().map(|t| t.state), "recovering interrupted record");
                outcome.disposition = Disposition::Recovered;
                Ok(existing)
            }
            Action::NoOp => {
                outcome.disposition = Disposition::Unchanged;
                self.commit(
                    &summary.id,
                    &|t: &Tender| t.raw_summary == summary.raw_summary,
                    &|t: &mut Tender| {
                        t.refresh_listing(summary, now);
                        Ok(())
                    },
                )
                .await?;
                Ok(None)
            }
            Action::Skip => {
                outcome.disposition = Disposition::Skipped;
                Ok(None)
            }
        }
    }

    /// Extract then score; each stage resumes where the record stands.
    async fn run_stages(
        &self,
        tender: Tender,
        cancel: &CancelToken,
        outcome: &mut RecordOutcome,
    ) -> Result<(), StoreError> {
        let mut tender = tender;
        if matches!(tender.state, TenderState::Discovered | TenderState::Extracting) {
            match self.extract_stage(tender, cancel, outcome).await? {
                Some(extracted) => tender = extracted,
                None => return Ok(()),
            }
        }
        if matches!(tender.state, TenderState::Extracted | TenderState::Scoring) {
            self.score_stage(tender, cancel, outcome).await?;
        }
        Ok(())
    }

    async fn extract_stage(
        &self,
        tender: Tender,
        cancel: &CancelToken,
        outcome: &mut RecordOutcome,
    ) -> Result<Option<Tender>, StoreError> {
        let id = tender.id.as_str();
        let hash = tender.content_hash.as_str();
        let in_extraction = |t: &Tender| {
            t.content_hash == hash
                && matches!(t.state, TenderState::Discovered | TenderState::Extracting)
        };
        let still_extracting =
            |t: &Tender| t.content_hash == hash && t.state == TenderState::Extracting;

        let budget = self
            .settings
            .max_extraction_attempts
            .saturating_sub(tender.extraction_attempts);
        if budget == 0 {
            let kind = tender
                .last_error
                .unwrap_or(FailureKind::Extraction(ExtractionError::Timeout));
            let failed = self
                .commit(id, &in_extraction, &|t: &mut Tender| {
                    if t.state == TenderState::Discovered {
                        t.transition(TenderState::Extracting)?;
                    }
                    t.transition(TenderState::ExtractionFailed)?;
                    t.last_error = Some(kind);
                    Ok(())
                })
                .await?;
            outcome.end = Some(if failed.is_some() {
                WorkEnd::Failed(kind)
            } else {
                WorkEnd::Superseded
            });
            return Ok(None);
        }

        let max = self.settings.max_extraction_attempts;
        let claimable = |t: &Tender| in_extraction(t) && t.extraction_attempts < max;
        let claim = |t: &mut Tender| -> Result<(), TransitionError> {
            t.transition(TenderState::Extracting)?;
            t.extraction_attempts += 1;
            Ok(())
        };
        let ledger = ClaimLedger::new(self, id, &claimable, &claim);
        let result = self.extractor.extract(id, budget, cancel, &ledger).await;
        if let Some(err) = ledger.take_failure() {
            return Err(err);
        }
        let attempts = result.attempts();
        outcome.extraction_calls += attempts;
        match result {
            AttemptOutcome::Succeeded { value, .. } => {
                let committed = self
                    .commit(id, &still_extracting, &|t: &mut Tender| {
                        t.record_extraction(value.clone())
                    })
                    .await?;
                match committed {
                    Some(extracted) => {
                        outcome.extracted = true;
                        Ok(Some(extracted))
                    }
                    None => {
                        outcome.end = Some(WorkEnd::Superseded);
                        Ok(None)
                    }
                }
            }
            AttemptOutcome::Failed { error, .. } => {
                let kind = FailureKind::Extraction(error);
                warn!(error = %error, attempts, "extraction failed");
                let failed = self
                    .commit(id, &still_extracting, &|t: &mut Tender| {
                        t.transition(TenderState::ExtractionFailed)?;
                        t.last_error = Some(kind);
                        Ok(())
                    })
                    .await?;
                outcome.end = Some(if failed.is_some() {
                    WorkEnd::Failed(kind)
                } else {
                    WorkEnd::Superseded
                });
                Ok(None)
            }
            AttemptOutcome::Cancelled { .. } => {
                outcome.end = Some(WorkEnd::Cancelled);
                Ok(None)
            }
            AttemptOutcome::Abandoned { .. } => {
                outcome.end = Some(WorkEnd::Superseded);
                Ok(None)
            }
        }
    }

    async fn score_stage(
        &self,
        tender: Tender,
        cancel: &CancelToken,
        outcome: &mut RecordOutcome,
    ) -> Result<(), StoreError> {
        let id = tender.id.as_str();
        let hash = tender.content_hash.as_str();
        let in_scoring = |t: &Tender| {
            t.content_hash == hash
                && matches!(t.state, TenderState::Extracted | TenderState::Scoring)
        };

        if tender.is_score_current() {
            let settled = self
                .commit(
                    id,
                    &|t: &Tender| in_scoring(t) && t.is_score_current(),
                    &|t: &mut Tender| {
                        if t.state == TenderState::Extracted {
                            t.transition(TenderState::Scoring)?;
                        }
                        t.transition(TenderState::Scored)
                    },
                )
                .await?;
            outcome.end = Some(if settled.is_some() {
                WorkEnd::AlreadyScored
            } else {
                WorkEnd::Superseded
            });
            return Ok(());
        }

        let budget = self.settings.max_scoring_attempts.saturating_sub(tender.scoring_attempts);
        if budget == 0 {
            let kind = tender
                .last_error
                .filter(|kind| matches!(kind, FailureKind::Scoring(_)))
                .unwrap_or(FailureKind::Scoring(ScoringError::ServiceUnavailable));
            let failed = self
                .commit(id, &in_scoring, &|t: &mut Tender| {
                    if t.state == TenderState::Extracted {
                        t.transition(TenderState::Scoring)?;
                    }
                    t.transition(TenderState::ScoringFailed)?;
                    t.last_error = Some(kind);
                    Ok(())
                })
                .await?;
            outcome.end = Some(if failed.is_some() {
                WorkEnd::Failed(kind)
            } else {
                WorkEnd::Superseded
            });
            return Ok(());
        }

        let max = self.settings.max_scoring_attempts;
        let claimable =
            |t: &Tender| in_scoring(t) && !t.is_score_current() && t.scoring_attempts < max;
        let claim = |t: &mut Tender| -> Result<(), TransitionError> {
            t.transition(TenderState::Scoring)?;
            t.scoring_attempts += 1;
            Ok(())
        };
        let request = ScoringRequest {
            tender_id: tender.id.clone(),
            title: tender.title.clone(),
            organism: tender.organism.clone(),
            text: tender
                .full_text
                .clone()
                .unwrap_or_else(|| tender.raw_summary.clone()),
        };
        let ledger = ClaimLedger::new(self, id, &claimable, &claim);
        let result = self.scorer.score(&request, budget, cancel, &ledger).await;
        if let Some(err) = ledger.take_failure() {
            return Err(err);
        }
        let attempts = result.attempts();
        outcome.scoring_calls += attempts;
        match result {
            AttemptOutcome::Succeeded { value: score, .. } => {
                let committed = self
                    .commit(
                        id,
                        &|t: &Tender| {
                            t.content_hash == hash
                                && t.state == TenderState::Scoring
                                && !t.is_score_current()
                        },
                        &|t: &mut Tender| t.record_score(&score),
                    )
                    .await?;
                if committed.is_some() {
                    info!(score = score.value, "tender scored");
                    outcome.end = Some(WorkEnd::Scored);
                } else {
                    info!("another writer scored this content first; discarding result");
                    outcome.end = Some(WorkEnd::ScoreDiscarded);
                }
            }
            AttemptOutcome::Failed { error, .. } => {
                let kind = FailureKind::Scoring(error);
                warn!(error = %error, attempts, "scoring failed");
                let failed = self
                    .commit(
                        id,
                        &|t: &Tender| t.content_hash == hash && t.state == TenderState::Scoring,
                        &|t: &mut Tender| {
                            t.transition(TenderState::ScoringFailed)?;
                            t.last_error = Some(kind);
                            Ok(())
                        },
                    )
                    .await?;
                outcome.end = Some(if failed.is_some() {
                    WorkEnd::Failed(kind)
                } else {
                    WorkEnd::Superseded
                });
            }
            AttemptOutcome::Cancelled { .. } => outcome.end = Some(WorkEnd::Cancelled),
            AttemptOutcome::Abandoned { .. } => outcome.end = Some(WorkEnd::Superseded),
        }
        Ok(())
    }

    /// Re-read, check `guard`, CAS `mutate`; conflicts re-read and recompute.
    /// `Ok(None)` means the guard no longer holds and the mutation was abandoned.
    async fn commit(
        &self,
        id: &str,
        guard: &(dyn Fn(&Tender) -> bool + Send + Sync),
        mutate: Mutator<'_>,
    ) -> Result<Option<Tender>, StoreError> {
        let mut conflicts = 0usize;
        loop {
            let current = self
                .store
                .get(id)
                .await?
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            if !guard(&current) {
                debug!(
                    tender_id = id,
                    state = %current.state,
                    "record moved on; abandoning mutation"
                );
                return Ok(None);
            }
            match self.store.upsert_if(id, current.version, mutate).await {
                Ok(updated) => return Ok(Some(updated)),
                Err(err) if err.is_conflict() && conflicts < COMMIT_CONFLICT_RETRIES => {
                    conflicts += 1;
                    debug!(tender_id = id, conflicts, "lost a version race, re-reading");
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn checkpoint_path(&self) -> Option<PathBuf> {
        self.settings
            .data_dir
            .as_ref()
            .map(|dir| dir.join("sync_cursor.json"))
    }

    async fn resolve_window(&self, window: SyncWindow) -> SyncWindow {
        if window.resume.is_some() {
            return window;
        }
        let Some(path) = self.checkpoint_path() else {
            return window;
        };
        let Ok(bytes) = fs::read(&path).await else {
            return window;
        };
        match serde_json::from_slice::<Checkpoint>(&bytes) {
            Ok(checkpoint) if checkpoint.from == window.from && checkpoint.to == window.to => {
                info!(
                    day = %checkpoint.cursor.day,
                    page = checkpoint.cursor.page,
                    "resuming from checkpoint"
                );
                window.resuming(Some(checkpoint.cursor))
            }
            Ok(_) => window,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring unreadable checkpoint");
                window
            }
        }
    }

    async fn save_checkpoint(&self, window: &SyncWindow, cursor: Option<PageCursor>) {
        let Some(path) = self.checkpoint_path() else {
            return;
        };
        let Some(cursor) = cursor else {
            self.clear_checkpoint().await;
            return;
        };
        let checkpoint = Checkpoint {
            from: window.from,
            to: window.to,
            cursor,
        };
        if let Err(err) = write_json_atomically(&path, &checkpoint).await {
            warn!(path = %path.display(), error = %err, "could not persist sync checkpoint");
        }
    }

    async fn clear_checkpoint(&self) {
        if let Some(path) = self.checkpoint_path() {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "could not clear sync checkpoint")
                }
            }
        }
    }

    async fn write_reports(&self, report: &mut RunReport) {
        let Some(data_dir) = self.settings.data_dir.clone() else {
            return;
        };
        let tenders = match self.store.all().await {
            Ok(tenders) => tenders,
            Err(err) => {
                error!(error = %err, "could not snapshot record store for reports");
                Vec::new()
            }
        };
        if let Err(err) = write_run_reports(&data_dir, report, &tenders).await {
            error!(error = %err, "could not write run reports");
        }
    }
}

async fn write_json_atomically<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let bytes = serde_json::to_vec_pretty(value).context("serializing checkpoint")?;
    let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4()));
    fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Registers the two daily sync crons when the scheduler is enabled.
pub async fn maybe_build_scheduler(
    pipeline: Arc<SyncPipeline>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in [&config.sync_cron_1, &config.sync_cron_2] {
        let pipeline = pipeline.clone();
        let sync_days = config.sync_days;
        let job = Job::new_async(cron, move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                let window = SyncWindow::last_days(Utc::now().date_naive(), sync_days);
                match pipeline.run_once(window, &CancelToken::never()).await {
                    Ok(report) => info!(
                        run_id = %report.run_id,
                        status = report.status.as_str(),
                        "scheduled sync finished"
                    ),
                    Err(err) => error!(error = %err, "scheduled sync aborted"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

/// One run wired from `config` over `window` (the configured default when `None`).
/// Run-level failures stay downcastable to [`RunError`].
pub async fn run_sync_once(
    config: &SyncConfig,
    window: Option<SyncWindow>,
    cancel: &CancelToken,
) -> Result<RunReport> {
    let pipeline = SyncPipeline::from_config(config).await?;
    let window = window.unwrap_or_else(|| config.default_window());
    Ok(pipeline.run_once(window, cancel).await?)
}
