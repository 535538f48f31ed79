//! Scoring adapter and the hosted-model backend that turns tender text into a relevance score.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use licitai_core::{Score, ScoringError, SummaryRecord};
use licitai_storage::BackoffPolicy;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use crate::{run_attempts, AttemptLedger, AttemptOutcome, CancelToken};

/// Listing status code for tenders open to bids.
pub const PUBLISHED_STATUS: u32 = 5;

/// What the company does and which tenders it wants, as stored in `profile.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusinessProfile {
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub keywords_pos: Vec<String>,
    #[serde(default)]
    pub keywords_neg: Vec<String>,
}

impl BusinessProfile {
    /// Listing pre-filter: published (or unknown status), title hits a positive keyword
    /// and no negative one. An empty positive list accepts every title.
    pub fn is_relevant(&self, summary: &SummaryRecord) -> bool {
        if summary.status_code.is_some_and(|code| code != PUBLISHED_STATUS) {
            return false;
        }
        let title = summary.title.to_lowercase();
        let hits = |keywords: &[String]| {
            keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .any(|k| title.contains(&k))
        };
        let wanted =
            self.keywords_pos.iter().all(|k| k.trim().is_empty()) || hits(&self.keywords_pos);
        wanted && !hits(&self.keywords_neg)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoringRequest {
    pub tender_id: String,
    pub title: String,
    pub organism: String,
    pub text: String,
}

#[async_trait]
pub trait ScoringBackend: Send + Sync {
    async fn score(&self, request: &ScoringRequest) -> Result<Score, ScoringError>;
}

#[derive(Debug, Clone)]
pub struct ScorerConfig {
    pub call_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(90),
            backoff: BackoffPolicy {
                max_retries: 3,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(60),
                jitter: Duration::from_secs(3),
            },
        }
    }
}

pub struct ScoringAdapter {
    backend: Arc<dyn ScoringBackend>,
    config: ScorerConfig,
}

impl ScoringAdapter {
    pub fn new(backend: Arc<dyn ScoringBackend>, config: ScorerConfig) -> Self {
        Self { backend, config }
    }

    /// Scores `request` with at most `budget` attempts, further capped by `backoff.max_retries`.
    pub async fn score(
        &self,
        request: &ScoringRequest,
        budget: u32,
        cancel: &CancelToken,
        ledger: &dyn AttemptLedger,
    ) -> AttemptOutcome<Score, ScoringError> {
        let span = info_span!("score", tender_id = %request.tender_id);
        run_attempts(
            budget.min(self.config.backoff.attempt_limit()),
            cancel,
            ledger,
            |attempt| self.attempt_once(request, attempt),
            |err, attempt| {
                let index = attempt.saturating_sub(1) as usize;
                Some(match err {
                    ScoringError::RateLimited => {
                        self.config.backoff.jittered_delay_for_attempt(index)
                    }
                    ScoringError::InvalidResponse | ScoringError::ServiceUnavailable => {
                        self.config.backoff.delay_for_attempt(index)
                    }
                })
            },
        )
        .instrument(span)
        .await
    }

    async fn attempt_once(
        &self,
        request: &ScoringRequest,
        attempt: u32,
    ) -> Result<Score, ScoringError> {
        match tokio::time::timeout(self.config.call_timeout, self.backend.score(request)).await {
            Ok(Ok(score)) => {
                debug!(attempt, value = score.value, "scored tender");
                Ok(score)
            }
            Ok(Err(err)) => {
                warn!(attempt, error = %err, "scoring attempt failed");
                Err(err)
            }
            Err(_) => {
                warn!(attempt, timeout = ?self.config.call_timeout, "scoring attempt timed out");
                Err(ScoringError::ServiceUnavailable)
            }
        }
    }
}

pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";

/// Google Gemini `generateContent` backend.
pub struct GeminiScorer {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    profile: BusinessProfile,
}

impl GeminiScorer {
    pub fn new(
        client: reqwest::Client,
        api_key: impl Into<String>,
        model: impl Into<String>,
        profile: BusinessProfile,
    ) -> Self {
        Self {
            client,
            base_url: GEMINI_API_BASE.to_string(),
            model: model.into(),
            api_key: api_key.into(),
            profile,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn prompt(&self, request: &ScoringRequest) -> String {
        format!(
            "Actúa como consultor experto en licitaciones públicas en Chile (Mercado Público). \
Evalúa la conveniencia de la licitación para la empresa descrita.\n\n\
--- PERFIL DE LA EMPRESA ---\n\
Propuesta de valor: {bio}\n\
Palabras clave buscadas: {pos}\n\
Palabras clave excluidas: {neg}\n\n\
--- LICITACIÓN ---\n\
ID: {id}\n\
Título referencial: {title}\n\
Organismo referencial: {organism}\n\
Texto extraído:\n{text}\n\n\
Responde solo con un objeto JSON con las claves: \
\"titulo_recuperado\", \"organismo_recuperado\", \"comportamiento_pago\", \
\"score_ia\" (entero de 1 a 10), \"veredicto\" (máximo 2 líneas), \
\"puntos_criticos\" (3 requisitos técnicos clave), \"riesgos\" (2 riesgos), \
\"motivo_archivo\" (solo si score_ia < 6).",
            bio = self.profile.bio,
            pos = self.profile.keywords_pos.join(", "),
            neg = self.profile.keywords_neg.join(", "),
            id = request.tender_id,
            title = request.title,
            organism = request.organism,
            text = request.text,
        )
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

/// The model's JSON verdict.
#[derive(Debug, Deserialize)]
struct Verdict {
    score_ia: f64,
    #[serde(default)]
    veredicto: String,
    #[serde(default)]
    titulo_recuperado: Option<String>,
    #[serde(default)]
    organismo_recuperado: Option<String>,
    #[serde(default)]
    comportamiento_pago: Option<String>,
    #[serde(default)]
    puntos_criticos: Vec<String>,
    #[serde(default)]
    riesgos: Vec<String>,
    #[serde(default)]
    motivo_archivo: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parses the model's answer, tolerating a Markdown code fence around the JSON.
pub fn parse_verdict(answer: &str) -> Result<Score, ScoringError> {
    let cleaned = answer.replace("```json", "").replace("```", "");
    let verdict: Verdict = serde_json::from_str(cleaned.trim()).map_err(|err| {
        debug!(error = %err, "unparseable scoring answer");
        ScoringError::InvalidResponse
    })?;
    if !(1.0..=10.0).contains(&verdict.score_ia) {
        return Err(ScoringError::InvalidResponse);
    }

    let mut rationale = verdict.veredicto.trim().to_string();
    if let Some(reason) = non_blank(verdict.motivo_archivo) {
        rationale = format!("{rationale}\n{reason}").trim().to_string();
    }
    let mut risks = verdict.riesgos;
    if let Some(payment) = non_blank(verdict.comportamiento_pago) {
        risks.push(format!("Comportamiento de pago: {payment}"));
    }

    Ok(Score {
        value: verdict.score_ia,
        rationale,
        key_points: verdict.puntos_criticos,
        risks,
        recovered_title: non_blank(verdict.titulo_recuperado),
        recovered_organism: non_blank(verdict.organismo_recuperado),
    })
}

fn classify_status(status: StatusCode) -> ScoringError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        ScoringError::RateLimited
    } else if status.is_server_error() {
        ScoringError::ServiceUnavailable
    } else {
        ScoringError::InvalidResponse
    }
}

#[async_trait]
impl ScoringBackend for GeminiScorer {
    async fn score(&self, request: &ScoringRequest) -> Result<Score, ScoringError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": self.prompt(request) }] }],
            "generationConfig": { "responseMimeType": "application/json" },
        });
        let response = self
            .client
            .post(&url)
            .query(&[("key", &self.api_key)])
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                debug!(error = %err.without_url(), "scoring request failed");
                ScoringError::ServiceUnavailable
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }
        let payload: GenerateContentResponse = response
            .json()
            .await
            .map_err(|_| ScoringError::InvalidResponse)?;
        let answer = payload
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .filter_map(|p| p.text)
            .collect::<String>();
        parse_verdict(&answer)
    }
}
