//! Deep extraction: scoped automation sessions behind a retrying, timeout-bounded wrapper.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use licitai_core::ExtractionError;
use licitai_storage::BackoffPolicy;
use reqwest::StatusCode;
use scraper::{Html, Selector};
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};

use crate::{run_attempts, AttemptLedger, AttemptOutcome, CancelToken};

/// Provider of heavyweight automation sessions (a remote browser, typically).
#[async_trait]
pub trait ExtractionBackend: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn ExtractionSession>, ExtractionError>;
}

/// One acquired automation session. Implementations release the underlying resource on drop,
/// so an abandoned call (timeout, cancellation) still frees it.
#[async_trait]
pub trait ExtractionSession: Send {
    async fn fetch_text(&mut self, tender_id: &str) -> Result<String, ExtractionError>;
}

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// Hard bound on one attempt: waiting for a free session, opening it and fetching.
    pub call_timeout: Duration,
    /// Sessions open at once across all workers.
    pub max_sessions: usize,
    pub backoff: BackoffPolicy,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(60),
            max_sessions: 2,
            backoff: BackoffPolicy {
                max_retries: 3,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(60),
                jitter: Duration::from_secs(5),
            },
        }
    }
}

pub struct DeepExtractor {
    backend: Arc<dyn ExtractionBackend>,
    sessions: Arc<Semaphore>,
    config: ExtractorConfig,
}

impl DeepExtractor {
    pub fn new(backend: Arc<dyn ExtractionBackend>, config: ExtractorConfig) -> Self {
        Self {
            backend,
            sessions: Arc::new(Semaphore::new(config.max_sessions.max(1))),
            config,
        }
    }

    /// Extracts the full text of `tender_id` using at most `budget` attempts, further capped
    /// by `backoff.max_retries`. Every attempt is charged to `ledger` before it starts.
    pub async fn extract(
        &self,
        tender_id: &str,
        budget: u32,
        cancel: &CancelToken,
        ledger: &dyn AttemptLedger,
    ) -> AttemptOutcome<String, ExtractionError> {
        let span = info_span!("extract", tender_id);
        run_attempts(
            budget.min(self.config.backoff.attempt_limit()),
            cancel,
            ledger,
            |attempt| self.attempt_once(tender_id, attempt),
            |err, attempt| self.retry_delay(*err, attempt),
        )
        .instrument(span)
        .await
    }

    async fn attempt_once(&self, tender_id: &str, attempt: u32) -> Result<String, ExtractionError> {
        let call = async {
            // Never closed; acquisition only waits.
            let _permit = self
                .sessions
                .acquire()
                .await
                .map_err(|_| ExtractionError::Timeout)?;
            let mut session = self.backend.open_session().await?;
            session.fetch_text(tender_id).await
        };
        match tokio::time::timeout(self.config.call_timeout, call).await {
            Ok(Ok(text)) => {
                debug!(attempt, chars = text.len(), "extracted tender text");
                Ok(text)
            }
            Ok(Err(err)) => {
                warn!(attempt, error = %err, "extraction attempt failed");
                Err(err)
            }
            Err(_) => {
                warn!(attempt, timeout = ?self.config.call_timeout, "extraction attempt timed out");
                Err(ExtractionError::Timeout)
            }
        }
    }

    fn retry_delay(&self, err: ExtractionError, attempt: u32) -> Option<Duration> {
        let index = attempt.saturating_sub(1) as usize;
        match err {
            ExtractionError::Timeout => Some(self.config.backoff.delay_for_attempt(index)),
            ExtractionError::Blocked => Some(self.config.backoff.jittered_delay_for_attempt(index)),
            ExtractionError::NotFound | ExtractionError::AuthRequired => None,
        }
    }
}

pub const MERCADO_PUBLICO_DETAIL_URL: &str =
    "https://www.mercadopublico.cl/Procurement/Modules/RFB/DetailsAcquisition.aspx?idlicitacion={id}";

/// Headless-browser extraction through a Browserless `/content` endpoint.
pub struct BrowserlessBackend {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    detail_url_template: String,
}

impl BrowserlessBackend {
    pub fn new(client: reqwest::Client, base_url: &str, token: Option<&str>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            detail_url_template: MERCADO_PUBLICO_DETAIL_URL.to_string(),
        }
    }

    pub fn with_detail_url_template(mut self, template: impl Into<String>) -> Self {
        self.detail_url_template = template.into();
        self
    }

    pub fn detail_url(&self, tender_id: &str) -> String {
        self.detail_url_template.replace("{id}", tender_id)
    }
}

#[async_trait]
impl ExtractionBackend for BrowserlessBackend {
    async fn open_session(&self) -> Result<Box<dyn ExtractionSession>, ExtractionError> {
        Ok(Box::new(BrowserlessSession {
            client: self.client.clone(),
            endpoint: format!("{}/content", self.base_url),
            token: self.token.clone(),
            detail_url: self.detail_url_template.clone(),
        }))
    }
}

/// Each session is one `/content` render; the remote browser is torn down when the request ends.
struct BrowserlessSession {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    detail_url: String,
}

#[async_trait]
impl ExtractionSession for BrowserlessSession {
    async fn fetch_text(&mut self, tender_id: &str) -> Result<String, ExtractionError> {
        let url = self.detail_url.replace("{id}", tender_id);
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "url": url }));
        if let Some(token) = &self.token {
            request = request.query(&[("token", token)]);
        }
        let response = request.send().await.map_err(|err| {
            debug!(error = %err.without_url(), "browserless request failed");
            ExtractionError::Timeout
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }
        let html = response.text().await.map_err(|_| ExtractionError::Timeout)?;
        let text = page_text(&html);
        if text.is_empty() {
            return Err(ExtractionError::NotFound);
        }
        Ok(text)
    }
}

fn classify_status(status: StatusCode) -> ExtractionError {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => ExtractionError::NotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ExtractionError::AuthRequired,
        StatusCode::TOO_MANY_REQUESTS => ExtractionError::Blocked,
        _ => ExtractionError::Timeout,
    }
}

/// Visible text of a rendered page, one non-empty line per text node.
pub fn page_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let Ok(body) = Selector::parse("body") else {
        return String::new();
    };
    let Some(root) = document.select(&body).next() else {
        return String::new();
    };
    root.descendants()
        .filter_map(|node| {
            let text = node.value().as_text()?;
            let parent_is_code = node
                .parent()
                .and_then(|p| p.value().as_element())
                .map(|el| matches!(el.name(), "script" | "style" | "noscript"))
                .unwrap_or(false);
            if parent_is_code {
                return None;
            }
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .collect::<Vec<_>>()
        .join("\n")
}
