//! Axum + Askama surface: webhook receiver, read API and the submissions browser.

use std::sync::Arc;

use askama::Template;
use axum::{
    body::Bytes,
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, FixedOffset, Utc};
use kobo_core::{
    default_display_offset, parse_utc_offset, readable_field, IngestPolicy, ReconcileAction,
    Submission,
};
use kobo_store::{SubmissionOrdering, SubmissionQuery, SubmissionStore};
use kobo_sync::{
    ingest_webhook, BatchFetcher, BatchRequest, FetchScope, ReconcileError, SubmissionSource,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "kobo-web";

const MAX_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub form_uid: Option<String>,
    pub form_url: Option<String>,
    pub debug: bool,
    pub display_offset: FixedOffset,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            form_uid: None,
            form_url: None,
            debug: false,
            display_offset: default_display_offset(),
        }
    }
}

impl WebConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: std::env::var("KOBO_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            form_uid: std::env::var("KOBO_FORM_UID").ok().filter(|v| !v.trim().is_empty()),
            form_url: std::env::var("KOBO_FORM_URL").ok().filter(|v| !v.trim().is_empty()),
            debug: std::env::var("KOBO_DEBUG")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            display_offset: std::env::var("KOBO_DISPLAY_UTC_OFFSET")
                .ok()
                .and_then(|v| parse_utc_offset(&v))
                .unwrap_or(defaults.display_offset),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SubmissionStore>,
    /// Remote client for the browser's sync button; `Err` carries why it is unavailable.
    pub source: Result<Arc<dyn SubmissionSource>, String>,
    pub config: WebConfig,
}

impl AppState {
    pub fn new(
        store: Arc<dyn SubmissionStore>,
        source: Result<Arc<dyn SubmissionSource>, String>,
        config: WebConfig,
    ) -> Self {
        Self {
            store,
            source,
            config,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(home_handler))
        .route("/health/", get(health_handler))
        .route("/meta/", get(meta_handler))
        .route("/kobo/webhook/", post(webhook_handler))
        .route("/api/submissions/", get(api_list_handler))
        .route("/api/submissions/{id}/", get(api_detail_handler))
        .route("/submit/", get(submit_survey_handler))
        .route("/submissions/", get(submissions_page_handler))
        .route("/submissions/{id}/", get(submission_detail_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let port = state.config.port;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    timestamp: DateTime<Utc>,
}

async fn health_handler() -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        timestamp: Utc::now(),
    })
}

async fn meta_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "name": "KoboToolbox API",
        "version": env!("CARGO_PKG_VERSION"),
        "debug": state.config.debug,
    }))
    .into_response()
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// One POST carries one submission; it is always applied with overwrite semantics.
async fn webhook_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let payload: JsonValue = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "webhook body is not JSON");
            return json_error(StatusCode::BAD_REQUEST, format!("Invalid JSON payload: {err}"));
        }
    };
    if !payload.is_object() {
        return json_error(StatusCode::BAD_REQUEST, "Payload must be a JSON object");
    }

    match ingest_webhook(state.store.as_ref(), &payload).await {
        Ok(reconciled) => {
            let status = if reconciled.action == ReconcileAction::Created {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            (
                status,
                Json(json!({
                    "status": "ok",
                    "action": reconciled.action.as_str(),
                    "uuid": reconciled.uuid,
                })),
            )
                .into_response()
        }
        Err(ReconcileError::MissingUuid) => {
            json_error(StatusCode::BAD_REQUEST, ReconcileError::MissingUuid.to_string())
        }
        Err(ReconcileError::Store(err)) => {
            error!(error = %err, "webhook reconciliation failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to store submission")
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ApiListQuery {
    form_uid: Option<String>,
    ordering: Option<String>,
    page: Option<usize>,
    page_size: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ApiListBody {
    count: u64,
    page: usize,
    page_size: usize,
    results: Vec<Submission>,
}

async fn api_list_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ApiListQuery>,
) -> Response {
    let ordering = match query.ordering.as_deref().filter(|o| !o.is_empty()) {
        Some(raw) => match raw.parse::<SubmissionOrdering>() {
            Ok(ordering) => ordering,
            Err(msg) => return json_error(StatusCode::BAD_REQUEST, msg),
        },
        None => SubmissionOrdering::default(),
    };
    let page_size = query.page_size.unwrap_or(100).clamp(1, MAX_PAGE_SIZE);
    let page = query.page.unwrap_or(1).max(1);
    let Some(offset) = page_offset(page, page_size) else {
        return json_error(StatusCode::BAD_REQUEST, "Invalid page.");
    };

    let store_query = SubmissionQuery {
        form_uid: query.form_uid.filter(|f| !f.is_empty()),
        search: None,
        ordering,
        limit: page_size,
        offset,
    };
    match state.store.list(&store_query).await {
        Ok(result) => Json(ApiListBody {
            count: result.total,
            page,
            page_size,
            results: result.items,
        })
        .into_response(),
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn api_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Response {
    match state.store.get(id).await {
        Ok(Some(submission)) => Json(submission).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({"detail": "Not found."}))).into_response(),
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

#[derive(Template)]
#[template(path = "home.html")]
struct HomeTemplate {
    total_submissions: u64,
    form_uid: String,
}

#[derive(Template)]
#[template(path = "submit_survey.html")]
struct SubmitSurveyTemplate {
    form_url: String,
}

#[derive(Debug, Clone)]
struct SubmissionRow {
    id: i64,
    short_uuid: String,
    form_uid: String,
    date_submitted: String,
    date_synced: String,
}

#[derive(Template)]
#[template(path = "view_submissions.html")]
struct ViewSubmissionsTemplate {
    submissions: Vec<SubmissionRow>,
    total: u64,
    search_query: String,
    sync_message: String,
    sync_status: String,
    page: usize,
    total_pages: usize,
}

#[derive(Debug, Clone)]
struct FieldRow {
    label: String,
    value: String,
}

#[derive(Template)]
#[template(path = "submission_detail.html")]
struct SubmissionDetailTemplate {
    uuid: String,
    form_uid: String,
    date_submitted: String,
    date_synced: String,
    date_updated: String,
    answers: Vec<FieldRow>,
    metadata: Vec<FieldRow>,
    raw_json: String,
}

async fn home_handler(State(state): State<Arc<AppState>>) -> Response {
    let total = match state.store.list(&SubmissionQuery { limit: 1, ..Default::default() }).await {
        Ok(page) => page.total,
        Err(err) => return server_error(err.into()),
    };
    render_html(HomeTemplate {
        total_submissions: total,
        form_uid: state.config.form_uid.clone().unwrap_or_default(),
    })
}

async fn submit_survey_handler(State(state): State<Arc<AppState>>) -> Response {
    render_html(SubmitSurveyTemplate {
        form_url: state.config.form_url.clone().unwrap_or_default(),
    })
}

#[derive(Debug, Deserialize, Default)]
struct SubmissionsPageQuery {
    search: Option<String>,
    sync: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

async fn submissions_page_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SubmissionsPageQuery>,
) -> Response {
    let (sync_message, sync_status) = if query.sync.as_deref() == Some("true") {
        run_browser_sync(&state).await
    } else {
        (String::new(), String::new())
    };

    let search_query = query.search.clone().unwrap_or_default();
    let per_page = query.per_page.unwrap_or(50).clamp(1, MAX_PAGE_SIZE);
    let requested_page = query.page.unwrap_or(1).max(1);
    let Some(offset) = page_offset(requested_page, per_page) else {
        return (StatusCode::BAD_REQUEST, Html("Invalid page".to_string())).into_response();
    };
    let store_query = SubmissionQuery {
        search: Some(search_query.clone()).filter(|s| !s.trim().is_empty()),
        limit: per_page,
        offset,
        ..Default::default()
    };
    let result = match state.store.list(&store_query).await {
        Ok(result) => result,
        Err(err) => return server_error(err.into()),
    };
    let total_pages = (result.total as usize).max(1).div_ceil(per_page);

    let offset = state.config.display_offset;
    let submissions = result
        .items
        .iter()
        .map(|s| SubmissionRow {
            id: s.id,
            short_uuid: s.short_uuid(),
            form_uid: s.form_uid.clone(),
            date_submitted: display_time(s.date_submitted, offset),
            date_synced: display_time(s.date_synced, offset),
        })
        .collect();

    render_html(ViewSubmissionsTemplate {
        submissions,
        total: result.total,
        search_query,
        sync_message,
        sync_status,
        page: requested_page,
        total_pages,
    })
}

/// Pulls the default form's first page and overwrites what it finds. Failures become a banner.
async fn run_browser_sync(state: &AppState) -> (String, String) {
    let Some(form_uid) = state.config.form_uid.clone() else {
        return (
            "KOBO_FORM_UID not configured".to_string(),
            "error".to_string(),
        );
    };
    let source = match &state.source {
        Ok(source) => source.clone(),
        Err(reason) => return (format!("Sync failed: {reason}"), "error".to_string()),
    };

    let fetcher = BatchFetcher::new(source, state.store.clone());
    let request = BatchRequest {
        form_uid,
        scope: FetchScope::FirstPage,
        policy: IngestPolicy::Overwrite,
    };
    match fetcher.run(&request).await {
        Ok(summary) => (
            format!(
                "Synced {} submissions from KoboToolbox. Created: {}, Updated: {}",
                summary.fetched, summary.created, summary.updated
            ),
            "success".to_string(),
        ),
        Err(err) => {
            error!(error = %err, "browser sync failed");
            (format!("Sync failed: {err}"), "error".to_string())
        }
    }
}

async fn submission_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Response {
    let submission = match state.store.get(id).await {
        Ok(Some(submission)) => submission,
        Ok(None) => {
            return (StatusCode::NOT_FOUND, Html("Submission not found".to_string())).into_response()
        }
        Err(err) => return server_error(err.into()),
    };

    let (metadata, answers): (Vec<_>, Vec<_>) = submission
        .data
        .as_object()
        .map(|obj| obj.iter().collect::<Vec<_>>())
        .unwrap_or_default()
        .into_iter()
        .partition(|(key, _)| key.starts_with('_'));
    let to_rows = |fields: Vec<(&String, &JsonValue)>| {
        fields
            .into_iter()
            .map(|(key, value)| FieldRow {
                label: readable_field(key),
                value: display_value(value),
            })
            .collect::<Vec<_>>()
    };

    let offset = state.config.display_offset;
    render_html(SubmissionDetailTemplate {
        uuid: submission.uuid.clone(),
        form_uid: submission.form_uid.clone(),
        date_submitted: display_time(submission.date_submitted, offset),
        date_synced: display_time(submission.date_synced, offset),
        date_updated: display_time(submission.date_updated, offset),
        answers: to_rows(answers),
        metadata: to_rows(metadata),
        raw_json: serde_json::to_string_pretty(&submission.data).unwrap_or_default(),
    })
}

/// Row offset of a 1-based page, or `None` when it cannot be addressed.
fn page_offset(page: usize, per_page: usize) -> Option<usize> {
    page.checked_sub(1)?
        .checked_mul(per_page)
        .filter(|offset| i64::try_from(*offset).is_ok())
}

fn display_time(instant: DateTime<Utc>, offset: FixedOffset) -> String {
    instant
        .with_timezone(&offset)
        .format("%Y-%m-%d %H:%M:%S %:z")
        .to_string()
}

fn display_value(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Array(items) => items.iter().map(display_value).collect::<Vec<_>>().join(", "),
        other => other.to_string(),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}
