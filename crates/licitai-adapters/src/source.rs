//! Source connector: restartable, page-at-a-time polling of the tender listing API.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Days, NaiveDate, NaiveDateTime};
use licitai_core::SummaryRecord;
use licitai_storage::{BackoffPolicy, FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Position in the listing: a publication day and a page within that day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageCursor {
    pub day: NaiveDate,
    pub page: u32,
}

impl PageCursor {
    pub fn start_of(day: NaiveDate) -> Self {
        Self { day, page: 0 }
    }

    pub fn next_page(self) -> Self {
        Self {
            day: self.day,
            page: self.page + 1,
        }
    }
}

/// Publication-date range to poll, optionally resuming from a confirmed cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
    #[serde(default)]
    pub resume: Option<PageCursor>,
}

impl SyncWindow {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        Self {
            from,
            to,
            resume: None,
        }
    }

    /// The `days` most recent publication days ending at `today`.
    pub fn last_days(today: NaiveDate, days: u32) -> Self {
        let span = u64::from(days.max(1) - 1);
        let from = today.checked_sub_days(Days::new(span)).unwrap_or(today);
        Self::new(from, today)
    }

    pub fn resuming(mut self, cursor: Option<PageCursor>) -> Self {
        self.resume = cursor;
        self
    }

    fn contains(&self, day: NaiveDate) -> bool {
        self.from <= day && day <= self.to
    }

    fn start_cursor(&self) -> Option<PageCursor> {
        if self.from > self.to {
            return None;
        }
        match self.resume {
            Some(cursor) if self.contains(cursor.day) => Some(cursor),
            _ => Some(PageCursor::start_of(self.from)),
        }
    }

    fn day_after(&self, cursor: PageCursor) -> Option<PageCursor> {
        cursor
            .day
            .succ_opt()
            .filter(|day| self.contains(*day))
            .map(PageCursor::start_of)
    }
}

/// One raw page as returned by the listing API.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourcePage {
    pub items: Vec<SummaryRecord>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SourceError {
    #[error("source rejected credentials: {0}")]
    Auth(String),
    #[error("transient source failure: {0}")]
    Transient(String),
    #[error("malformed page {}#{}: {reason}", cursor.day, cursor.page)]
    Malformed { cursor: PageCursor, reason: String },
}

/// Raw listing API. Implementations fetch exactly one page and classify failures.
#[async_trait]
pub trait SourceApi: Send + Sync {
    async fn fetch_page(&self, cursor: PageCursor) -> Result<SourcePage, SourceError>;
}

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub page_timeout: Duration,
    /// Run-level retries for transient page failures.
    pub backoff: BackoffPolicy,
    /// Consecutive malformed pages tolerated before moving on to the next day.
    pub max_malformed_streak: u32,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            page_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy {
                max_retries: 3,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                jitter: Duration::from_millis(500),
            },
            max_malformed_streak: 3,
        }
    }
}

#[derive(Clone)]
pub struct SourceConnector {
    api: Arc<dyn SourceApi>,
    config: ConnectorConfig,
}

impl SourceConnector {
    pub fn new(api: Arc<dyn SourceApi>, config: ConnectorConfig) -> Self {
        Self { api, config }
    }

    /// Lazily walks `window` page by page; nothing is fetched until [`SummaryPages::next_page`].
    pub fn poll(&self, window: &SyncWindow) -> SummaryPages {
        SummaryPages {
            api: self.api.clone(),
            config: self.config.clone(),
            cursor: window.start_cursor(),
            window: window.clone(),
            malformed_streak: 0,
            skipped: Vec::new(),
        }
    }
}

/// A fetched page together with the cursor that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct PolledPage {
    pub cursor: PageCursor,
    pub items: Vec<SummaryRecord>,
    next: Option<PageCursor>,
}

impl PolledPage {
    pub fn next_cursor(&self) -> Option<PageCursor> {
        self.next
    }
}

/// Restartable page sequence. The cursor moves only when a page is confirmed, so an
/// abandoned or failed page is fetched again by the next call or the next run.
pub struct SummaryPages {
    api: Arc<dyn SourceApi>,
    config: ConnectorConfig,
    window: SyncWindow,
    cursor: Option<PageCursor>,
    malformed_streak: u32,
    skipped: Vec<PageCursor>,
}

impl SummaryPages {
    /// Next unconfirmed position; `None` once the window is exhausted.
    pub fn cursor(&self) -> Option<PageCursor> {
        self.cursor
    }

    pub fn skipped_pages(&self) -> &[PageCursor] {
        &self.skipped
    }

    pub async fn next_page(&mut self) -> Result<Option<PolledPage>, SourceError> {
        loop {
            let Some(cursor) = self.cursor else {
                return Ok(None);
            };
            match self.fetch_with_retries(cursor).await {
                Ok(page) => {
                    self.malformed_streak = 0;
                    let next = if page.has_more {
                        Some(cursor.next_page())
                    } else {
                        self.window.day_after(cursor)
                    };
                    return Ok(Some(PolledPage {
                        cursor,
                        items: page.items,
                        next,
                    }));
                }
                Err(SourceError::Malformed { cursor, reason }) => {
                    warn!(
                        day = %cursor.day,
                        page = cursor.page,
                        reason = %reason,
                        "skipping malformed source page"
                    );
                    self.skipped.push(cursor);
                    self.malformed_streak += 1;
                    self.cursor = if self.malformed_streak >= self.config.max_malformed_streak {
                        self.malformed_streak = 0;
                        self.window.day_after(cursor)
                    } else {
                        Some(cursor.next_page())
                    };
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Marks `page` as fully consumed and advances the cursor past it.
    pub fn confirm(&mut self, page: &PolledPage) {
        if self.cursor == Some(page.cursor) {
            self.cursor = page.next;
        }
    }

    async fn fetch_with_retries(&self, cursor: PageCursor) -> Result<SourcePage, SourceError> {
        let mut attempt = 0usize;
        loop {
            let result = match tokio::time::timeout(
                self.config.page_timeout,
                self.api.fetch_page(cursor),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(SourceError::Transient(format!(
                    "page fetch exceeded {:?}",
                    self.config.page_timeout
                ))),
            };
            match result {
                Err(SourceError::Transient(reason))
                    if attempt < self.config.backoff.max_retries =>
                {
                    let delay = self.config.backoff.jittered_delay_for_attempt(attempt);
                    warn!(
                        day = %cursor.day,
                        page = cursor.page,
                        attempt,
                        ?delay,
                        reason = %reason,
                        "retrying source page"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Mercado Público public listing API (`licitaciones.json`), queried one publication day
/// at a time.
pub struct MercadoPublicoApi {
    http: Arc<HttpFetcher>,
    base_url: String,
    ticket: String,
}

pub const MERCADO_PUBLICO_API_URL: &str =
    "https://api.mercadopublico.cl/servicios/v1/publico/licitaciones.json";

impl MercadoPublicoApi {
    pub fn new(
        http: Arc<HttpFetcher>,
        base_url: impl Into<String>,
        ticket: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            ticket: ticket.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListingResponse {
    #[serde(rename = "Listado", default)]
    listado: Option<Vec<ListingItem>>,
    #[serde(rename = "Codigo", default)]
    codigo: Option<i64>,
    #[serde(rename = "Mensaje", default)]
    mensaje: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListingItem {
    #[serde(rename = "CodigoExterno")]
    codigo_externo: String,
    #[serde(rename = "Nombre", default)]
    nombre: Option<String>,
    #[serde(rename = "CodigoEstado", default)]
    codigo_estado: Option<u32>,
    #[serde(rename = "FechaCierre", default)]
    fecha_cierre: Option<String>,
    #[serde(rename = "Descripcion", default)]
    descripcion: Option<String>,
    #[serde(rename = "OrganismoCompleto", default)]
    organismo_completo: Option<String>,
    #[serde(rename = "Comprador", default)]
    comprador: Option<Buyer>,
}

#[derive(Debug, Deserialize)]
struct Buyer {
    #[serde(rename = "NombreOrganismo", default)]
    nombre_organismo: Option<String>,
}

fn parse_listing(cursor: PageCursor, body: &[u8]) -> Result<SourcePage, SourceError> {
    let response: ListingResponse =
        serde_json::from_slice(body).map_err(|err| SourceError::Malformed {
            cursor,
            reason: err.to_string(),
        })?;

    let Some(listado) = response.listado else {
        let message = response.mensaje.unwrap_or_default();
        if message.to_ascii_lowercase().contains("ticket") {
            return Err(SourceError::Auth(message));
        }
        return Err(SourceError::Malformed {
            cursor,
            reason: format!(
                "listing missing (code {:?}): {message}",
                response.codigo
            ),
        });
    };

    let items = listado
        .into_iter()
        .filter(|item| !item.codigo_externo.trim().is_empty())
        .map(|item| {
            let title = item.nombre.unwrap_or_default().trim().to_string();
            let organism = item
                .organismo_completo
                .or_else(|| item.comprador.and_then(|b| b.nombre_organismo))
                .unwrap_or_default();
            let raw_summary = item
                .descripcion
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| title.clone());
            SummaryRecord {
                id: item.codigo_externo.trim().to_string(),
                title,
                organism: organism.trim().to_string(),
                publish_date: Some(cursor.day),
                close_date: item.fecha_cierre.as_deref().and_then(parse_api_datetime),
                raw_summary,
                status_code: item.codigo_estado,
            }
        })
        .collect();

    Ok(SourcePage {
        items,
        has_more: false,
    })
}

fn parse_api_datetime(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
}

#[async_trait]
impl SourceApi for MercadoPublicoApi {
    async fn fetch_page(&self, cursor: PageCursor) -> Result<SourcePage, SourceError> {
        // The listing endpoint returns a whole publication day at once.
        if cursor.page > 0 {
            return Ok(SourcePage::default());
        }
        let query = [
            ("fecha", cursor.day.format("%d%m%Y").to_string()),
            ("ticket", self.ticket.clone()),
        ];
        let response = self
            .http
            .get(&self.base_url, &query)
            .await
            .map_err(|err| classify_fetch_error(cursor, err))?;
        let page = parse_listing(cursor, &response.body)?;
        info!(day = %cursor.day, tenders = page.items.len(), "fetched listing page");
        Ok(page)
    }
}

fn classify_fetch_error(cursor: PageCursor, err: FetchError) -> SourceError {
    match err.status() {
        Some(401) | Some(403) => SourceError::Auth(err.to_string()),
        _ if err.is_retryable() => SourceError::Transient(err.to_string()),
        Some(_) => SourceError::Malformed {
            cursor,
            reason: err.to_string(),
        },
        None => SourceError::Transient(err.to_string()),
    }
}

/// Offline source backed by JSON page fixtures at `<root>/<YYYY-MM-DD>/page-<n>.json`,
/// each holding a [`SourcePage`]. A missing file is an empty final page.
pub struct FixtureSource {
    root: PathBuf,
}

impl FixtureSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn page_path(&self, cursor: PageCursor) -> PathBuf {
        self.root
            .join(cursor.day.format("%Y-%m-%d").to_string())
            .join(format!("page-{}.json", cursor.page))
    }
}

#[async_trait]
impl SourceApi for FixtureSource {
    async fn fetch_page(&self, cursor: PageCursor) -> Result<SourcePage, SourceError> {
        let path = self.page_path(cursor);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SourcePage::default());
            }
            Err(err) => {
                return Err(SourceError::Transient(format!(
                    "reading {}: {err}",
                    path.display()
                )))
            }
        };
        serde_json::from_slice(&bytes).map_err(|err| SourceError::Malformed {
            cursor,
            reason: format!("{}: {err}", path.display()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    fn summary(id: &str) -> SummaryRecord {
        SummaryRecord {
            id: id.into(),
            title: format!("Licitación {id}"),
            organism: "MOP".into(),
            publish_date: None,
            close_date: None,
            raw_summary: format!("Resumen {id}"),
            status_code: Some(5),
        }
    }

    /// Scripted listing: each cursor maps to a queue of responses, consumed in order.
    #[derive(Default)]
    struct ScriptedApi {
        responses: Mutex<HashMap<PageCursor, Vec<Result<SourcePage, SourceError>>>>,
        calls: Mutex<Vec<PageCursor>>,
    }

    impl ScriptedApi {
        fn push(&self, cursor: PageCursor, response: Result<SourcePage, SourceError>) {
            self.responses
                .lock()
                .unwrap()
                .entry(cursor)
                .or_default()
                .push(response);
        }
    }

    #[async_trait]
    impl SourceApi for ScriptedApi {
        async fn fetch_page(&self, cursor: PageCursor) -> Result<SourcePage, SourceError> {
            self.calls.lock().unwrap().push(cursor);
            let mut responses = self.responses.lock().unwrap();
            match responses.get_mut(&cursor) {
                Some(queue) if !queue.is_empty() => queue.remove(0),
                _ => Ok(SourcePage::default()),
            }
        }
    }

    fn fast_config() -> ConnectorConfig {
        ConnectorConfig {
            page_timeout: Duration::from_secs(5),
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                jitter: Duration::ZERO,
            },
            max_malformed_streak: 2,
        }
    }

    #[tokio::test]
    async fn cursor_advances_only_on_confirm() {
        let api = Arc::new(ScriptedApi::default());
        let first = PageCursor::start_of(day(2));
        api.push(
            first,
            Ok(SourcePage {
                items: vec![summary("A")],
                has_more: true,
            }),
        );
        api.push(
            first.next_page(),
            Ok(SourcePage {
                items: vec![summary("B")],
                has_more: false,
            }),
        );
        let connector = SourceConnector::new(api.clone(), fast_config());
        let mut pages = connector.poll(&SyncWindow::new(day(2), day(3)));

        let page = pages.next_page().await.unwrap().unwrap();
        assert_eq!(page.items[0].id, "A");
        assert_eq!(pages.cursor(), Some(first));
        pages.confirm(&page);
        assert_eq!(pages.cursor(), Some(first.next_page()));

        let page = pages.next_page().await.unwrap().unwrap();
        assert_eq!(page.next_cursor(), Some(PageCursor::start_of(day(3))));
        pages.confirm(&page);

        let page = pages.next_page().await.unwrap().unwrap();
        assert!(page.items.is_empty());
        pages.confirm(&page);
        assert!(pages.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resume_cursor_skips_confirmed_pages() {
        let api = Arc::new(ScriptedApi::default());
        let connector = SourceConnector::new(api.clone(), fast_config());
        let resume = PageCursor { day: day(3), page: 1 };
        let mut pages = connector.poll(&SyncWindow::new(day(2), day(3)).resuming(Some(resume)));

        let page = pages.next_page().await.unwrap().unwrap();
        assert_eq!(page.cursor, resume);
        assert_eq!(api.calls.lock().unwrap().as_slice(), &[resume]);
    }

    #[tokio::test]
    async fn transient_failures_retry_then_surface_without_moving_cursor() {
        let api = Arc::new(ScriptedApi::default());
        let first = PageCursor::start_of(day(2));
        for _ in 0..3 {
            api.push(first, Err(SourceError::Transient("502".into())));
        }
        let connector = SourceConnector::new(api.clone(), fast_config());
        let mut pages = connector.poll(&SyncWindow::new(day(2), day(2)));

        let err = pages.next_page().await.unwrap_err();
        assert!(matches!(err, SourceError::Transient(_)));
        assert_eq!(api.calls.lock().unwrap().len(), 3);
        assert_eq!(pages.cursor(), Some(first));

        // Next attempt succeeds once the script runs dry.
        let page = pages.next_page().await.unwrap().unwrap();
        assert_eq!(page.cursor, first);
    }

    #[tokio::test]
    async fn malformed_pages_are_skipped() {
        let api = Arc::new(ScriptedApi::default());
        let first = PageCursor::start_of(day(2));
        api.push(
            first,
            Err(SourceError::Malformed {
                cursor: first,
                reason: "bad json".into(),
            }),
        );
        api.push(
            first.next_page(),
            Ok(SourcePage {
                items: vec![summary("B")],
                has_more: false,
            }),
        );
        let connector = SourceConnector::new(api.clone(), fast_config());
        let mut pages = connector.poll(&SyncWindow::new(day(2), day(2)));

        let page = pages.next_page().await.unwrap().unwrap();
        assert_eq!(page.items[0].id, "B");
        assert_eq!(pages.skipped_pages(), &[first]);
    }

    #[tokio::test]
    async fn auth_failures_are_not_retried() {
        let api = Arc::new(ScriptedApi::default());
        let first = PageCursor::start_of(day(2));
        api.push(first, Err(SourceError::Auth("ticket".into())));
        let connector = SourceConnector::new(api.clone(), fast_config());
        let mut pages = connector.poll(&SyncWindow::new(day(2), day(2)));

        assert!(matches!(pages.next_page().await, Err(SourceError::Auth(_))));
        assert_eq!(api.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn listing_json_maps_to_summaries() {
        let body = r#"{
            "Cantidad": 2,
            "Listado": [
                {"CodigoExterno": "1234-56-LP26", "Nombre": "Construcción de puente",
                 "CodigoEstado": 5, "FechaCierre": "2026-03-20T15:00:00"},
                {"CodigoExterno": "999-1-L126", "Nombre": "Aseo", "CodigoEstado": 6,
                 "Descripcion": "Servicio de aseo", "Comprador": {"NombreOrganismo": "Hospital"}}
            ]
        }"#;
        let page = parse_listing(PageCursor::start_of(day(2)), body.as_bytes()).unwrap();
        assert_eq!(page.items.len(), 2);
        let bridge = &page.items[0];
        assert_eq!(bridge.raw_summary, "Construcción de puente");
        assert_eq!(bridge.publish_date, Some(day(2)));
        assert_eq!(bridge.status_code, Some(5));
        assert!(bridge.close_date.is_some());
        assert_eq!(page.items[1].organism, "Hospital");
        assert_eq!(page.items[1].raw_summary, "Servicio de aseo");
    }

    #[test]
    fn bad_ticket_is_an_auth_error() {
        let body = br#"{"Codigo": 203, "Mensaje": "Ticket no valido."}"#;
        let err = parse_listing(PageCursor::start_of(day(2)), body).unwrap_err();
        assert!(matches!(err, SourceError::Auth(_)));

        let err = parse_listing(PageCursor::start_of(day(2)), b"<html>").unwrap_err();
        assert!(matches!(err, SourceError::Malformed { .. }));
    }

    #[tokio::test]
    async fn fixture_source_reads_pages_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = FixtureSource::new(dir.path());
        let cursor = PageCursor::start_of(day(2));
        let path = source.page_path(cursor);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            serde_json::to_vec(&SourcePage {
                items: vec![summary("T-100")],
                has_more: false,
            })
            .unwrap(),
        )
        .unwrap();

        let page = source.fetch_page(cursor).await.unwrap();
        assert_eq!(page.items[0].id, "T-100");
        let missing = source.fetch_page(cursor.next_page()).await.unwrap();
        assert!(missing.items.is_empty() && !missing.has_more);
    }
}
