//! Authenticated HTTP client for the KoboToolbox REST API v2.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "kobo-client";

pub const DEFAULT_BASE_URL: &str = "https://kf.kobotoolbox.org";

/// Records requested per page by [`KoboClient::get_all_submissions`].
pub const PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
pub struct KoboClientConfig {
    pub token: Option<String>,
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for KoboClientConfig {
    fn default() -> Self {
        Self {
            token: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("kobo-sync/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

impl KoboClientConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            token: std::env::var("KOBO_TOKEN").ok(),
            base_url: std::env::var("KOBO_BASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.base_url),
            timeout: std::env::var("KOBO_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            user_agent: defaults.user_agent,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("KOBO_TOKEN must be provided or set as environment variable")]
    MissingToken,
    #[error("token contains characters not allowed in an HTTP header")]
    InvalidToken,
    #[error("building reqwest client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    Status,
    Transport,
    Decode,
}

/// Every failure of a remote call. No retries are attempted by the client.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP {status} from {url}: {body}")]
    Status { status: u16, url: String, body: String },
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("invalid JSON response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ApiError {
    pub fn kind(&self) -> ApiErrorKind {
        match self {
            Self::Status { .. } => ApiErrorKind::Status,
            Self::Transport { .. } => ApiErrorKind::Transport,
            Self::Decode { .. } => ApiErrorKind::Decode,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport { source, .. } => source.status().map(|s| s.as_u16()),
            Self::Decode { .. } => None,
        }
    }
}

/// Form (asset) metadata. Fields the sync path does not use are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormMetadata {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub asset_type: Option<String>,
    #[serde(default)]
    pub has_deployment: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Deserialize)]
struct Listing<T> {
    #[serde(default)]
    count: Option<u64>,
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

#[derive(Debug, Clone)]
pub struct KoboClient {
    client: reqwest::Client,
    base_url: String,
}

impl KoboClient {
    /// Builds the client. Fails before any network activity when no token is configured.
    pub fn new(config: KoboClientConfig) -> Result<Self, ConfigError> {
        let token = config
            .token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::MissingToken)?;

        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Token {token}"))
            .map_err(|_| ConfigError::InvalidToken)?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::new(KoboClientConfig::from_env())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let url = self.url(path);
        let span = info_span!("kobo_request", url = %url);
        async {
            let resp = self
                .client
                .get(&url)
                .query(query)
                .send()
                .await
                .map_err(|source| ApiError::Transport {
                    url: url.clone(),
                    source,
                })?;

            let status = resp.status();
            let body = resp.text().await.map_err(|source| ApiError::Transport {
                url: url.clone(),
                source,
            })?;
            debug!(status = status.as_u16(), bytes = body.len(), "kobo response");

            if !status.is_success() {
                return Err(ApiError::Status {
                    status: status.as_u16(),
                    url: url.clone(),
                    body,
                });
            }

            serde_json::from_str(&body).map_err(|source| ApiError::Decode {
                url: url.clone(),
                source,
            })
        }
        .instrument(span)
        .await
    }

    /// All forms visible to the token, in server order.
    pub async fn list_forms(&self) -> Result<Vec<FormMetadata>, ApiError> {
        let listing: Listing<FormMetadata> = self.get_json("/api/v2/assets/", &[]).await?;
        Ok(listing.results)
    }

    pub async fn get_form_details(&self, form_uid: &str) -> Result<FormMetadata, ApiError> {
        self.get_json(&format!("/api/v2/assets/{form_uid}/"), &[]).await
    }

    /// One page of raw submissions. `limit` is omitted from the request when `None`.
    pub async fn get_submissions(
        &self,
        form_uid: &str,
        limit: Option<usize>,
        start: usize,
    ) -> Result<Vec<JsonValue>, ApiError> {
        let mut query = vec![("start", start.to_string())];
        if let Some(limit) = limit.filter(|l| *l > 0) {
            query.push(("limit", limit.to_string()));
        }
        let listing: Listing<JsonValue> = self
            .get_json(&format!("/api/v2/assets/{form_uid}/data/"), &query)
            .await?;
        Ok(listing.results)
    }

    /// Every submission of a form, fetched sequentially in pages of [`PAGE_SIZE`].
    ///
    /// A failure on any page discards what was already fetched.
    pub async fn get_all_submissions(&self, form_uid: &str) -> Result<Vec<JsonValue>, ApiError> {
        let mut all = Vec::new();
        let mut start = 0usize;
        loop {
            let batch = self.get_submissions(form_uid, Some(PAGE_SIZE), start).await?;
            let fetched = batch.len();
            all.extend(batch);
            debug!(form_uid, start, fetched, "fetched submissions page");
            if fetched < PAGE_SIZE {
                break;
            }
            start += PAGE_SIZE;
        }
        Ok(all)
    }

    /// Total submissions reported by the server, via a one-record page.
    pub async fn get_submission_count(&self, form_uid: &str) -> Result<u64, ApiError> {
        let listing: Listing<JsonValue> = self
            .get_json(
                &format!("/api/v2/assets/{form_uid}/data/"),
                &[("limit", "1".to_string())],
            )
            .await?;
        Ok(listing.count.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use axum::extract::{Path, Query, State};
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;

    #[derive(Default)]
    struct Stub {
        total: usize,
        requests: AtomicUsize,
        seen: Mutex<Vec<(Option<String>, Option<String>)>>,
        auth: Mutex<Vec<String>>,
    }

    async fn data_handler(
        State(stub): State<Arc<Stub>>,
        Path(form_uid): Path<String>,
        headers: AxumHeaders,
        Query(params): Query<HashMap<String, String>>,
    ) -> Result<Json<JsonValue>, StatusCode> {
        if form_uid == "missing" {
            return Err(StatusCode::NOT_FOUND);
        }
        stub.requests.fetch_add(1, Ordering::SeqCst);
        stub.seen
            .lock()
            .unwrap()
            .push((params.get("start").cloned(), params.get("limit").cloned()));
        if let Some(value) = headers.get("authorization") {
            stub.auth.lock().unwrap().push(value.to_str().unwrap().to_string());
        }

        let start: usize = params.get("start").and_then(|v| v.parse().ok()).unwrap_or(0);
        let limit: usize = params.get("limit").and_then(|v| v.parse().ok()).unwrap_or(30_000);
        let end = (start + limit).min(stub.total);
        let results = (start.min(end)..end)
            .map(|i| {
                json!({"_uuid": format!("uuid-{i}"), "_submission_time": "2025-01-01T00:00:00Z"})
            })
            .collect::<Vec<_>>();
        Ok(Json(json!({"count": stub.total, "results": results})))
    }

    async fn assets_handler() -> Json<JsonValue> {
        Json(json!({
            "count": 2,
            "results": [
                {
                    "uid": "aF1",
                    "name": "Household survey",
                    "asset_type": "survey",
                    "has_deployment": true,
                    "url": "https://kf/aF1"
                },
                {"uid": "bQ2", "name": "Draft", "asset_type": "survey", "has_deployment": false}
            ]
        }))
    }

    async fn asset_handler(Path(form_uid): Path<String>) -> Result<Json<JsonValue>, StatusCode> {
        match form_uid.as_str() {
            "aF1" => Ok(Json(json!({
                "uid": "aF1",
                "name": "Household survey",
                "deployment__submission_count": 3
            }))),
            "broken" => Err(StatusCode::INTERNAL_SERVER_ERROR),
            _ => Err(StatusCode::NOT_FOUND),
        }
    }

    async fn garbage_handler() -> &'static str {
        "<html>not json</html>"
    }

    async fn spawn_stub(total: usize) -> (Arc<Stub>, String) {
        let stub = Arc::new(Stub {
            total,
            ..Default::default()
        });
        let app = Router::new()
            .route("/api/v2/assets/", get(assets_handler))
            .route("/api/v2/assets/{form_uid}/", get(asset_handler))
            .route("/api/v2/assets/{form_uid}/data/", get(data_handler))
            .route("/api/v2/assets/garbage/data/", get(garbage_handler))
            .with_state(stub.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (stub, format!("http://{addr}"))
    }

    fn client_for(base_url: &str) -> KoboClient {
        KoboClient::new(
            KoboClientConfig::default()
                .with_token("secret-token")
                .with_base_url(base_url),
        )
        .unwrap()
    }

    #[test]
    fn constructing_without_token_fails() {
        let err = KoboClient::new(KoboClientConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingToken));

        let blank = KoboClient::new(KoboClientConfig::default().with_token("  ")).unwrap_err();
        assert!(matches!(blank, ConfigError::MissingToken));
    }

    #[tokio::test]
    async fn get_all_submissions_pages_until_short_page() {
        let (stub, base) = spawn_stub(2500).await;
        let client = client_for(&base);

        let all = client.get_all_submissions("aF1").await.unwrap();

        assert_eq!(all.len(), 2500);
        assert_eq!(stub.requests.load(Ordering::SeqCst), 3);
        assert_eq!(all[0]["_uuid"], "uuid-0");
        assert_eq!(all[1000]["_uuid"], "uuid-1000");
        assert_eq!(all[2499]["_uuid"], "uuid-2499");
        let seen = stub.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                (Some("0".into()), Some("1000".into())),
                (Some("1000".into()), Some("1000".into())),
                (Some("2000".into()), Some("1000".into())),
            ]
        );
        assert!(stub
            .auth
            .lock()
            .unwrap()
            .iter()
            .all(|h| h == "Token secret-token"));
    }

    #[tokio::test]
    async fn exact_multiple_of_page_size_needs_a_trailing_empty_page() {
        let (stub, base) = spawn_stub(2000).await;
        let all = client_for(&base).get_all_submissions("aF1").await.unwrap();
        assert_eq!(all.len(), 2000);
        assert_eq!(stub.requests.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn single_page_and_count() {
        let (stub, base) = spawn_stub(42).await;
        let client = client_for(&base);

        let page = client.get_submissions("aF1", Some(10), 5).await.unwrap();
        assert_eq!(page.len(), 10);
        assert_eq!(page[0]["_uuid"], "uuid-5");

        let unbounded = client.get_submissions("aF1", None, 0).await.unwrap();
        assert_eq!(unbounded.len(), 42);
        assert_eq!(stub.seen.lock().unwrap()[1], (Some("0".into()), None));

        assert_eq!(client.get_submission_count("aF1").await.unwrap(), 42);
        assert_eq!(stub.seen.lock().unwrap()[2], (None, Some("1".into())));
    }

    #[tokio::test]
    async fn forms_are_listed_and_detailed() {
        let (_stub, base) = spawn_stub(0).await;
        let client = client_for(&base);

        let forms = client.list_forms().await.unwrap();
        assert_eq!(forms.len(), 2);
        assert_eq!(forms[0].uid, "aF1");
        assert!(forms[0].has_deployment);
        assert_eq!(forms[1].url, None);

        let details = client.get_form_details("aF1").await.unwrap();
        assert_eq!(details.name.as_deref(), Some("Household survey"));
        assert_eq!(details.extra["deployment__submission_count"], 3);
    }

    #[tokio::test]
    async fn failures_carry_their_kind() {
        let (_stub, base) = spawn_stub(0).await;
        let client = client_for(&base);

        let not_found = client.get_form_details("nope").await.unwrap_err();
        assert_eq!(not_found.kind(), ApiErrorKind::Status);
        assert_eq!(not_found.status(), Some(404));

        let server = client.get_form_details("broken").await.unwrap_err();
        assert_eq!(server.status(), Some(500));

        let decode = client.get_submissions("garbage", None, 0).await.unwrap_err();
        assert_eq!(decode.kind(), ApiErrorKind::Decode);

        let offline = client_for("http://127.0.0.1:9").list_forms().await.unwrap_err();
        assert_eq!(offline.kind(), ApiErrorKind::Transport);
    }
}
