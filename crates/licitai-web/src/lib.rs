//! Axum JSON API over the tender record store: browse, favorite/archive, manual re-run.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use licitai_adapters::{CancelToken, SyncWindow};
use licitai_core::{FailureKind, Flag, FlagUpdate, Flags, Tender, TenderState};
use licitai_storage::{update_flags, RecordStore, StoreError};
use licitai_sync::{report_recent_markdown, SyncConfig, SyncPipeline};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info};

pub const CRATE_NAME: &str = "licitai-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    /// Absent when the backends are not configured; manual re-runs then answer 503.
    pub pipeline: Option<Arc<SyncPipeline>>,
    pub data_dir: Option<PathBuf>,
    /// Days covered by a manual re-run, ending today.
    pub sync_days: u32,
    sync_guard: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            pipeline: None,
            data_dir: None,
            sync_days: 1,
            sync_guard: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_pipeline(mut self, pipeline: Arc<SyncPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn with_sync_days(mut self, days: u32) -> Self {
        self.sync_days = days;
        self
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(data_dir.into());
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TendersQuery {
    pub state: Option<String>,
    pub flag: Option<String>,
}

/// List row: listing fields, lifecycle and a score only when it matches the current content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenderRow {
    pub id: String,
    pub title: String,
    pub organism: String,
    pub publish_date: Option<NaiveDate>,
    pub close_date: Option<NaiveDateTime>,
    pub state: TenderState,
    pub flags: Flags,
    pub score: Option<f64>,
    pub score_rationale: Option<String>,
    pub last_error: Option<String>,
    pub detail_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Tender> for TenderRow {
    fn from(tender: &Tender) -> Self {
        let trusted = tender.trusted_score();
        Self {
            id: tender.id.clone(),
            title: tender.title.clone(),
            organism: tender.organism.clone(),
            publish_date: tender.publish_date,
            close_date: tender.close_date,
            state: tender.state,
            flags: tender.flags,
            score: trusted.map(|(value, _)| value),
            score_rationale: trusted.map(|(_, rationale)| rationale.to_string()),
            last_error: tender.last_error.map(|kind: FailureKind| kind.to_string()),
            detail_url: tender.detail_url.clone(),
            updated_at: tender.updated_at,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/tenders", get(tenders_handler))
        .route("/api/tenders/{id}", get(tender_detail_handler))
        .route("/api/tenders/{id}/flags", post(tender_flags_handler))
        .route("/api/sync", post(sync_handler))
        .route("/reports", get(reports_handler))
        .with_state(Arc::new(state))
}

/// Wires the durable store, the sync pipeline and the report directory named by `config`.
pub async fn state_from_config(config: &SyncConfig) -> anyhow::Result<AppState> {
    let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
    Ok(AppState::new(pipeline.store())
        .with_pipeline(pipeline)
        .with_data_dir(config.data_dir.clone())
        .with_sync_days(config.sync_days))
}

pub async fn serve_from_config(config: &SyncConfig, port: u16) -> anyhow::Result<()> {
    serve(state_from_config(config).await?, port).await
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok", "crate": CRATE_NAME })).into_response()
}

async fn tenders_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TendersQuery>,
) -> Response {
    let state_filter = match query.state.as_deref().map(str::parse::<TenderState>).transpose() {
        Ok(filter) => filter,
        Err(err) => return bad_request(err.to_string()),
    };
    let flag_filter = match query.flag.as_deref().map(str::parse::<Flag>).transpose() {
        Ok(filter) => filter,
        Err(err) => return bad_request(err.to_string()),
    };

    let loaded = match (state_filter, flag_filter) {
        (Some(tender_state), _) => state.store.query_by_state(tender_state).await,
        (None, Some(flag)) => state.store.query_by_flag(flag).await,
        (None, None) => state.store.all().await,
    };
    match loaded {
        Ok(tenders) => {
            let rows = tenders
                .iter()
                .filter(|t| flag_filter.is_none_or(|flag| t.flags.is_set(flag)))
                .map(TenderRow::from)
                .collect::<Vec<_>>();
            Json(rows).into_response()
        }
        Err(err) => store_error(err),
    }
}

async fn tender_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.store.get(&id).await {
        Ok(Some(tender)) => Json(tender).into_response(),
        Ok(None) => not_found(&id),
        Err(err) => store_error(err),
    }
}

async fn tender_flags_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Json(update): Json<FlagUpdate>,
) -> Response {
    if update.is_empty() {
        return bad_request("flag update names neither `favorited` nor `archived`".to_string());
    }
    match update_flags(state.store.as_ref(), &id, update).await {
        Ok(tender) => {
            info!(
                tender_id = %id,
                favorited = tender.flags.favorited,
                archived = tender.flags.archived,
                "flags updated"
            );
            Json(TenderRow::from(&tender)).into_response()
        }
        Err(StoreError::NotFound(_)) => not_found(&id),
        Err(err) => store_error(err),
    }
}

/// Starts a background run over the configured window; one manual run at a time.
async fn sync_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(pipeline) = state.pipeline.clone() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "sync pipeline is not configured" })),
        )
            .into_response();
    };
    let Ok(guard) = state.sync_guard.clone().try_lock_owned() else {
        return (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": "a sync run is already in progress" })),
        )
            .into_response();
    };

    let window = SyncWindow::last_days(Utc::now().date_naive(), state.sync_days);
    let response = serde_json::json!({ "status": "started", "from": window.from, "to": window.to });
    tokio::spawn(async move {
        let _guard = guard;
        match pipeline.run_once(window, &CancelToken::never()).await {
            Ok(report) => info!(
                run_id = %report.run_id,
                status = report.status.as_str(),
                "manual sync finished"
            ),
            Err(err) => error!(error = %err, "manual sync aborted"),
        }
    });
    (StatusCode::ACCEPTED, Json(response)).into_response()
}

async fn reports_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(data_dir) = state.data_dir.clone() else {
        return not_found("reports");
    };
    match report_recent_markdown(10, &data_dir) {
        Ok(markdown) => {
            ([(header::CONTENT_TYPE, "text/markdown; charset=utf-8")], markdown).into_response()
        }
        Err(err) => server_error(err),
    }
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": message }))).into_response()
}

fn not_found(what: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": format!("{what} not found") })),
    )
        .into_response()
}

fn store_error(err: StoreError) -> Response {
    error!(error = %err, "record store failure");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use licitai_core::SummaryRecord;
    use licitai_storage::MemoryRecordStore;
    use std::collections::HashMap;
    use tower::ServiceExt;

    fn summary(id: &str) -> SummaryRecord {
        SummaryRecord {
            id: id.into(),
            title: format!("Licitación {id}"),
            organism: "Municipalidad de Valdivia".into(),
            publish_date: None,
            close_date: None,
            raw_summary: format!("Resumen {id}"),
            status_code: Some(5),
        }
    }

    async fn seeded_store() -> Arc<dyn RecordStore> {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        store.create(Tender::discovered(&summary("T-1"), Utc::now())).await.unwrap();
        let mut failed = Tender::discovered(&summary("T-2"), Utc::now());
        failed.state = TenderState::ExtractionFailed;
        failed.last_error = Some(FailureKind::Extraction(licitai_core::ExtractionError::NotFound));
        store.create(failed).await.unwrap();
        store
    }

    fn get(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let app = app(AppState::new(Arc::new(MemoryRecordStore::new())));
        let resp = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn tenders_filter_by_state_and_reject_unknown_names() {
        let app = app(AppState::new(seeded_store().await));

        let all = json_body(app.clone().oneshot(get("/api/tenders")).await.unwrap()).await;
        assert_eq!(all.as_array().unwrap().len(), 2);

        let failed = app
            .clone()
            .oneshot(get("/api/tenders?state=extraction_failed"))
            .await
            .unwrap();
        assert_eq!(failed.status(), StatusCode::OK);
        let rows: Vec<TenderRow> = serde_json::from_value(json_body(failed).await).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "T-2");
        assert_eq!(rows[0].last_error.as_deref(), Some("extraction: tender page not found"));

        let bogus = app.oneshot(get("/api/tenders?state=closed")).await.unwrap();
        assert_eq!(bogus.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn flag_update_is_visible_to_flag_queries() {
        let store = seeded_store().await;
        let app = app(AppState::new(store.clone()));

        let resp = app
            .clone()
            .oneshot(post_json("/api/tenders/T-1/flags", serde_json::json!({ "favorited": true })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let favorites = app.oneshot(get("/api/tenders?flag=favorited")).await.unwrap();
        let rows: Vec<TenderRow> = serde_json::from_value(json_body(favorites).await).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "T-1");
        let stored = store.get("T-1").await.unwrap().unwrap();
        assert!(stored.flags.favorited);
        assert_eq!(stored.state, TenderState::Discovered);
    }

    #[tokio::test]
    async fn flag_update_for_unknown_tender_is_404() {
        let app = app(AppState::new(seeded_store().await));
        let resp = app
            .oneshot(post_json("/api/tenders/T-404/flags", serde_json::json!({ "archived": true })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn detail_returns_full_record() {
        let app = app(AppState::new(seeded_store().await));
        let resp = app.oneshot(get("/api/tenders/T-1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let tender: Tender = serde_json::from_value(json_body(resp).await).unwrap();
        assert_eq!(tender.raw_summary, "Resumen T-1");
        assert_eq!(tender.version, 1);
    }

    #[tokio::test]
    async fn reports_digest_is_markdown() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(AppState::new(seeded_store().await).with_data_dir(dir.path()));
        let resp = app.oneshot(get("/reports")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8(body.to_vec()).unwrap().contains("No runs recorded yet."));
    }

    #[tokio::test]
    async fn manual_sync_needs_a_pipeline() {
        let app = app(AppState::new(seeded_store().await));
        let resp = app.oneshot(post_json("/api/sync", serde_json::json!({}))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn manual_sync_rejects_overlapping_runs() {
        let dir = tempfile::tempdir().unwrap();
        let fixtures = dir.path().join("fixtures");
        std::fs::create_dir_all(&fixtures).unwrap();
        let env: HashMap<&str, String> = HashMap::from([
            ("LICITAI_DATA_DIR", dir.path().display().to_string()),
            ("LICITAI_FIXTURES_DIR", fixtures.display().to_string()),
            ("LICITAI_PROFILE", dir.path().join("profile.yaml").display().to_string()),
            ("BROWSERLESS_URL", "http://127.0.0.1:9".to_string()),
            ("GEMINI_API_KEY", "test-key".to_string()),
        ]);
        let config = SyncConfig::from_lookup(|key| env.get(key).cloned());
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let pipeline =
            Arc::new(SyncPipeline::from_config_with_store(&config, store.clone()).unwrap());
        let state = AppState::new(store).with_pipeline(pipeline);
        let held = state.sync_guard.clone().try_lock_owned().unwrap();
        let app = app(state);

        let busy = app
            .clone()
            .oneshot(post_json("/api/sync", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(busy.status(), StatusCode::CONFLICT);

        drop(held);
        let started = app.oneshot(post_json("/api/sync", serde_json::json!({}))).await.unwrap();
        assert_eq!(started.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn state_from_config_serves_the_configured_store() {
        let dir = tempfile::tempdir().unwrap();
        let fixtures = dir.path().join("fixtures");
        std::fs::create_dir_all(&fixtures).unwrap();
        let env: HashMap<&str, String> = HashMap::from([
            ("LICITAI_DATA_DIR", dir.path().display().to_string()),
            ("LICITAI_FIXTURES_DIR", fixtures.display().to_string()),
            ("LICITAI_PROFILE", dir.path().join("profile.yaml").display().to_string()),
            ("LICITAI_SYNC_DAYS", "3".to_string()),
            ("BROWSERLESS_URL", "http://127.0.0.1:9".to_string()),
            ("GEMINI_API_KEY", "test-key".to_string()),
        ]);
        let config = SyncConfig::from_lookup(|key| env.get(key).cloned());

        let state = state_from_config(&config).await.unwrap();
        assert!(state.pipeline.is_some());
        assert_eq!(state.sync_days, 3);
        assert_eq!(state.data_dir.as_deref(), Some(dir.path()));
        state.store.create(Tender::discovered(&summary("T-9"), Utc::now())).await.unwrap();
        assert!(config.store_dir().join("tenders").join("T-9.json").exists());

        let listed = app(state).oneshot(get("/api/tenders")).await.unwrap();
        let rows: Vec<TenderRow> = serde_json::from_value(json_body(listed).await).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "T-9");
    }

    #[tokio::test]
    async fn missing_backends_fail_state_wiring() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            data_dir: dir.path().to_path_buf(),
            profile_path: dir.path().join("profile.yaml"),
            ..SyncConfig::from_lookup(|_| None)
        };
        let err = state_from_config(&config).await.err().expect("no ticket");
        assert!(err.to_string().contains("MP_TICKET"));
    }
}
