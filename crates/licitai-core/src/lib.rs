//! Core domain model for LicitAI: tenders, their pipeline state machine and the
//! typed failure taxonomy shared by adapters, storage and the sync pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "licitai-core";

/// Pipeline state of a tender within its current content version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenderState {
    Discovered,
    Extracting,
    Extracted,
    Scoring,
    Scored,
    ExtractionFailed,
    ScoringFailed,
}

impl TenderState {
    pub const ALL: [TenderState; 7] = [
        TenderState::Discovered,
        TenderState::Extracting,
        TenderState::Extracted,
        TenderState::Scoring,
        TenderState::Scored,
        TenderState::ExtractionFailed,
        TenderState::ScoringFailed,
    ];

    /// Transition table for a single content version. Self-transitions on the two
    /// in-flight states are re-entries after an interrupted run.
    pub fn can_transition_to(self, next: TenderState) -> bool {
        use TenderState::*;
        matches!(
            (self, next),
            (Discovered, Extracting)
                | (Extracting, Extracting)
                | (Extracting, Extracted)
                | (Extracting, ExtractionFailed)
                | (Extracted, Scoring)
                | (Scoring, Scoring)
                | (Scoring, Scored)
                | (Scoring, ScoringFailed)
        )
    }

    /// Terminal for a run: only a new content version moves the record again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TenderState::Scored | TenderState::ExtractionFailed | TenderState::ScoringFailed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TenderState::Discovered => "discovered",
            TenderState::Extracting => "extracting",
            TenderState::Extracted => "extracted",
            TenderState::Scoring => "scoring",
            TenderState::Scored => "scored",
            TenderState::ExtractionFailed => "extraction_failed",
            TenderState::ScoringFailed => "scoring_failed",
        }
    }
}

impl fmt::Display for TenderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} `{value}`")]
pub struct ParseNameError {
    pub kind: &'static str,
    pub value: String,
}

impl FromStr for TenderState {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        TenderState::ALL
            .into_iter()
            .find(|state| state.as_str() == normalized)
            .ok_or_else(|| ParseNameError {
                kind: "tender state",
                value: s.to_string(),
            })
    }
}

/// User-set overlay flags. The pipeline never writes these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Flags {
    pub favorited: bool,
    pub archived: bool,
}

impl Flags {
    pub fn is_set(&self, flag: Flag) -> bool {
        match flag {
            Flag::Favorited => self.favorited,
            Flag::Archived => self.archived,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flag {
    Favorited,
    Archived,
}

impl Flag {
    pub const ALL: [Flag; 2] = [Flag::Favorited, Flag::Archived];

    pub fn as_str(self) -> &'static str {
        match self {
            Flag::Favorited => "favorited",
            Flag::Archived => "archived",
        }
    }
}

impl FromStr for Flag {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "favorited" | "favorite" | "favourite" => Ok(Flag::Favorited),
            "archived" | "archive" => Ok(Flag::Archived),
            _ => Err(ParseNameError {
                kind: "flag",
                value: s.to_string(),
            }),
        }
    }
}

/// Partial flag edit coming from the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FlagUpdate {
    #[serde(default)]
    pub favorited: Option<bool>,
    #[serde(default)]
    pub archived: Option<bool>,
}

impl FlagUpdate {
    pub fn is_empty(&self) -> bool {
        self.favorited.is_none() && self.archived.is_none()
    }

    pub fn apply_to(&self, flags: &mut Flags) {
        if let Some(favorited) = self.favorited {
            flags.favorited = favorited;
        }
        if let Some(archived) = self.archived {
            flags.archived = archived;
        }
    }
}

/// Lightweight listing record produced by the source connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub id: String,
    pub title: String,
    pub organism: String,
    pub publish_date: Option<NaiveDate>,
    pub close_date: Option<NaiveDateTime>,
    pub raw_summary: String,
    /// Source lifecycle code; Mercado Público uses `5` for published tenders.
    #[serde(default)]
    pub status_code: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionError {
    #[error("extraction timed out")]
    Timeout,
    #[error("tender page not found")]
    NotFound,
    #[error("tender page requires authentication")]
    AuthRequired,
    #[error("source is blocking automated access")]
    Blocked,
}

impl ExtractionError {
    pub fn is_retryable(self) -> bool {
        matches!(self, ExtractionError::Timeout | ExtractionError::Blocked)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum ScoringError {
    #[error("scoring service rate limited the request")]
    RateLimited,
    #[error("scoring service returned an invalid response")]
    InvalidResponse,
    #[error("scoring service unavailable")]
    ServiceUnavailable,
}

/// Last failure attached to a record for operator visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    Extraction(ExtractionError),
    Scoring(ScoringError),
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Extraction(err) => write!(f, "extraction: {err}"),
            FailureKind::Scoring(err) => write!(f, "scoring: {err}"),
        }
    }
}

/// Structured relevance assessment returned by the scoring capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub value: f64,
    pub rationale: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default)]
    pub recovered_title: Option<String>,
    #[serde(default)]
    pub recovered_organism: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid state transition for {id}: {from} -> {to}")]
pub struct TransitionError {
    pub id: String,
    pub from: TenderState,
    pub to: TenderState,
}

/// Digest over the fields that feed relevance scoring.
pub fn content_hash(raw_summary: &str, full_text: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_summary.as_bytes());
    hasher.update([0u8]);
    hasher.update(full_text.unwrap_or_default().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tender {
    pub id: String,
    pub title: String,
    pub organism: String,
    pub publish_date: Option<NaiveDate>,
    pub close_date: Option<NaiveDateTime>,
    pub raw_summary: String,
    pub full_text: Option<String>,
    pub detail_url: Option<String>,
    pub content_hash: String,
    pub state: TenderState,
    pub flags: Flags,
    pub score: Option<f64>,
    pub score_rationale: Option<String>,
    #[serde(default)]
    pub score_key_points: Vec<String>,
    #[serde(default)]
    pub score_risks: Vec<String>,
    pub scored_content_hash: Option<String>,
    pub extraction_attempts: u32,
    pub scoring_attempts: u32,
    pub last_error: Option<FailureKind>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_synced_at: DateTime<Utc>,
}

impl Tender {
    /// First sighting of a tender: a `Discovered` record at version 0.
    pub fn discovered(summary: &SummaryRecord, now: DateTime<Utc>) -> Self {
        Self {
            id: summary.id.clone(),
            title: summary.title.clone(),
            organism: summary.organism.clone(),
            publish_date: summary.publish_date,
            close_date: summary.close_date,
            raw_summary: summary.raw_summary.clone(),
            full_text: None,
            detail_url: None,
            content_hash: content_hash(&summary.raw_summary, None),
            state: TenderState::Discovered,
            flags: Flags::default(),
            score: None,
            score_rationale: None,
            score_key_points: Vec::new(),
            score_risks: Vec::new(),
            scored_content_hash: None,
            extraction_attempts: 0,
            scoring_attempts: 0,
            last_error: None,
            version: 0,
            created_at: now,
            updated_at: now,
            last_synced_at: now,
        }
    }

    pub fn transition(&mut self, next: TenderState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn recompute_content_hash(&mut self) {
        self.content_hash = content_hash(&self.raw_summary, self.full_text.as_deref());
    }

    /// Starts a new content version from a changed listing summary: extracted text is
    /// dropped, retry budgets are reset and the record re-enters the pipeline head.
    /// Flags and the previous (now stale) score are left in place.
    pub fn begin_content_version(&mut self, summary: &SummaryRecord, now: DateTime<Utc>) {
        self.refresh_listing(summary, now);
        self.raw_summary = summary.raw_summary.clone();
        self.full_text = None;
        self.recompute_content_hash();
        self.state = TenderState::Discovered;
        self.extraction_attempts = 0;
        self.scoring_attempts = 0;
        self.last_error = None;
    }

    /// Applies listing corrections that do not feed the content hash.
    pub fn refresh_listing(&mut self, summary: &SummaryRecord, now: DateTime<Utc>) {
        if !summary.title.trim().is_empty() {
            self.title = summary.title.clone();
        }
        if !summary.organism.trim().is_empty() {
            self.organism = summary.organism.clone();
        }
        self.publish_date = summary.publish_date.or(self.publish_date);
        self.close_date = summary.close_date.or(self.close_date);
        self.last_synced_at = now;
    }

    pub fn record_extraction(&mut self, full_text: String) -> Result<(), TransitionError> {
        self.transition(TenderState::Extracted)?;
        self.full_text = Some(full_text);
        self.recompute_content_hash();
        self.last_error = None;
        Ok(())
    }

    pub fn record_score(&mut self, score: &Score) -> Result<(), TransitionError> {
        self.transition(TenderState::Scored)?;
        self.score = Some(score.value);
        self.score_rationale = Some(score.rationale.clone());
        self.score_key_points = score.key_points.clone();
        self.score_risks = score.risks.clone();
        self.scored_content_hash = Some(self.content_hash.clone());
        self.last_error = None;
        if let Some(title) = non_blank(score.recovered_title.as_deref()) {
            if self.title.trim().is_empty() {
                self.title = title.to_string();
            }
        }
        if let Some(organism) = non_blank(score.recovered_organism.as_deref()) {
            if self.organism.trim().is_empty() {
                self.organism = organism.to_string();
            }
        }
        Ok(())
    }

    pub fn is_score_current(&self) -> bool {
        self.scored_content_hash.as_deref() == Some(self.content_hash.as_str())
    }

    /// Score and rationale, only when computed against the current content.
    pub fn trusted_score(&self) -> Option<(f64, &str)> {
        if !self.is_score_current() {
            return None;
        }
        Some((self.score?, self.score_rationale.as_deref().unwrap_or_default()))
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
