//! Submission reconciliation and the pull-based batch fetch.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kobo_client::{ApiError, FormMetadata, KoboClient};
use kobo_core::{
    extract_uuid, form_uid_from_payload, submission_time_of, IngestPolicy, NewSubmission,
    ReconcileAction, TimestampSource, SUBMISSION_TIME_FIELD,
};
use kobo_store::{MemorySubmissionStore, PgSubmissionStore, StoreError, SubmissionStore};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "kobo-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub form_uid: Option<String>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            form_uid: std::env::var("KOBO_FORM_UID").ok().filter(|v| !v.trim().is_empty()),
            scheduler_enabled: std::env::var("KOBO_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("KOBO_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 * * * *".to_string()),
        }
    }
}

/// Postgres when `DATABASE_URL` is set (migrations applied), otherwise a process-local store.
pub async fn open_store(config: &SyncConfig) -> Result<Arc<dyn SubmissionStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgSubmissionStore::connect(url)
                .await
                .context("connecting to DATABASE_URL")?;
            store.migrate().await.context("running migrations")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; submissions are kept in memory only");
            Ok(Arc::new(MemorySubmissionStore::new()))
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Missing _uuid in payload")]
    MissingUuid,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reconciled {
    pub id: i64,
    pub uuid: String,
    pub action: ReconcileAction,
    pub timestamp_source: TimestampSource,
}

/// Idempotent upsert of one raw submission, keyed by its `_uuid`.
///
/// The record is stored verbatim as `data`. A record without a uuid is rejected before the
/// store is touched.
pub async fn reconcile<S>(
    store: &S,
    record: &JsonValue,
    form_uid: &str,
    policy: IngestPolicy,
) -> Result<Reconciled, ReconcileError>
where
    S: SubmissionStore + ?Sized,
{
    let uuid = extract_uuid(record).ok_or(ReconcileError::MissingUuid)?;
    let submitted = submission_time_of(record);
    if submitted.source == TimestampSource::Unparseable {
        warn!(
            %uuid,
            raw = ?record.get(SUBMISSION_TIME_FIELD),
            "unparseable submission time; using processing time"
        );
    }

    let outcome = store
        .upsert(
            &NewSubmission {
                uuid: uuid.clone(),
                form_uid: form_uid.to_string(),
                data: record.clone(),
                date_submitted: submitted.instant,
            },
            policy,
        )
        .await?;

    Ok(Reconciled {
        id: outcome.id,
        uuid,
        action: outcome.action,
        timestamp_source: submitted.source,
    })
}

/// Push path: the payload names its own form and always overwrites.
pub async fn ingest_webhook<S>(store: &S, payload: &JsonValue) -> Result<Reconciled, ReconcileError>
where
    S: SubmissionStore + ?Sized,
{
    let form_uid = form_uid_from_payload(payload);
    let reconciled = reconcile(store, payload, &form_uid, IngestPolicy::Overwrite).await?;
    info!(
        uuid = %reconciled.uuid,
        form_uid = %form_uid,
        action = reconciled.action.as_str(),
        "webhook submission reconciled"
    );
    Ok(reconciled)
}

/// Read side of the remote platform used by the batch fetch.
#[async_trait]
pub trait SubmissionSource: Send + Sync {
    async fn form_details(&self, form_uid: &str) -> Result<FormMetadata, ApiError>;

    async fn submissions_page(
        &self,
        form_uid: &str,
        limit: Option<usize>,
        start: usize,
    ) -> Result<Vec<JsonValue>, ApiError>;

    async fn all_submissions(&self, form_uid: &str) -> Result<Vec<JsonValue>, ApiError>;

    async fn submission_count(&self, form_uid: &str) -> Result<u64, ApiError>;
}

#[async_trait]
impl SubmissionSource for KoboClient {
    async fn form_details(&self, form_uid: &str) -> Result<FormMetadata, ApiError> {
        self.get_form_details(form_uid).await
    }

    async fn submissions_page(
        &self,
        form_uid: &str,
        limit: Option<usize>,
        start: usize,
    ) -> Result<Vec<JsonValue>, ApiError> {
        self.get_submissions(form_uid, limit, start).await
    }

    async fn all_submissions(&self, form_uid: &str) -> Result<Vec<JsonValue>, ApiError> {
        self.get_all_submissions(form_uid).await
    }

    async fn submission_count(&self, form_uid: &str) -> Result<u64, ApiError> {
        self.get_submission_count(form_uid).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "limit")]
pub enum FetchScope {
    /// Whatever the server returns for an unbounded first page.
    FirstPage,
    Limited(usize),
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRequest {
    pub form_uid: String,
    pub scope: FetchScope,
    pub policy: IngestPolicy,
}

impl BatchRequest {
    /// Command-line semantics: a limit fetches one page, otherwise everything; existing
    /// records are only rewritten when forced.
    pub fn from_cli(form_uid: impl Into<String>, limit: Option<usize>, force_update: bool) -> Self {
        Self {
            form_uid: form_uid.into(),
            scope: match limit.filter(|l| *l > 0) {
                Some(limit) => FetchScope::Limited(limit),
                None => FetchScope::All,
            },
            policy: IngestPolicy::from_force_flag(force_update),
        }
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("failed to fetch submissions: {0}")]
    Api(#[from] ApiError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub form_uid: String,
    pub form_name: Option<String>,
    pub policy: IngestPolicy,
    pub reported_total: Option<u64>,
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    /// Records without a uuid plus existing records left alone under `Skip`.
    pub skipped: usize,
    pub missing_uuid: usize,
    pub stored_total: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct BatchFetcher {
    source: Arc<dyn SubmissionSource>,
    store: Arc<dyn SubmissionStore>,
}

impl BatchFetcher {
    pub fn new(source: Arc<dyn SubmissionSource>, store: Arc<dyn SubmissionStore>) -> Self {
        Self { source, store }
    }

    /// Fetches, then reconciles record by record. An API error aborts before any write; a
    /// store error aborts with earlier records already committed.
    pub async fn run(&self, request: &BatchRequest) -> Result<BatchSummary, BatchError> {
        let span = info_span!(
            "batch_fetch",
            form_uid = %request.form_uid,
            policy = ?request.policy
        );
        self.run_inner(request).instrument(span).await
    }

    async fn run_inner(&self, request: &BatchRequest) -> Result<BatchSummary, BatchError> {
        let started_at = Utc::now();
        let form_uid = request.form_uid.as_str();

        let form_name = match self.source.form_details(form_uid).await {
            Ok(details) => {
                let name = details.name.unwrap_or_else(|| "Unknown".to_string());
                info!(form_name = %name, "fetching submissions");
                Some(name)
            }
            Err(err) => {
                warn!(error = %err, "could not fetch form details");
                None
            }
        };

        let mut reported_total = None;
        let records = match request.scope {
            FetchScope::FirstPage => self.source.submissions_page(form_uid, None, 0).await?,
            FetchScope::Limited(limit) => {
                self.source.submissions_page(form_uid, Some(limit), 0).await?
            }
            FetchScope::All => {
                let total = self.source.submission_count(form_uid).await?;
                info!(total, "total submissions available");
                reported_total = Some(total);
                self.source.all_submissions(form_uid).await?
            }
        };
        info!(fetched = records.len(), "fetched submissions");

        let mut created = 0usize;
        let mut updated = 0usize;
        let mut skipped = 0usize;
        let mut missing_uuid = 0usize;

        for record in &records {
            match reconcile(self.store.as_ref(), record, form_uid, request.policy).await {
                Ok(reconciled) => match reconciled.action {
                    ReconcileAction::Created => created += 1,
                    ReconcileAction::Updated => updated += 1,
                    ReconcileAction::Skipped => skipped += 1,
                },
                Err(ReconcileError::MissingUuid) => {
                    warn!("skipping submission without uuid");
                    missing_uuid += 1;
                    skipped += 1;
                }
                Err(ReconcileError::Store(err)) => return Err(err.into()),
            }
        }

        let stored_total = self.store.count_for_form(form_uid).await?;
        let summary = BatchSummary {
            form_uid: form_uid.to_string(),
            form_name,
            policy: request.policy,
            reported_total,
            fetched: records.len(),
            created,
            updated,
            skipped,
            missing_uuid,
            stored_total,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            created = summary.created,
            updated = summary.updated,
            skipped = summary.skipped,
            stored_total = summary.stored_total,
            "sync summary"
        );
        Ok(summary)
    }
}

/// Cron-driven full fetch of the default form. `None` when the scheduler is disabled.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    fetcher: Arc<BatchFetcher>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    let form_uid = config
        .form_uid
        .clone()
        .context("KOBO_FORM_UID is required when the scheduler is enabled")?;

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let fetcher = fetcher.clone();
        let request = BatchRequest {
            form_uid: form_uid.clone(),
            scope: FetchScope::All,
            policy: IngestPolicy::Skip,
        };
        Box::pin(async move {
            match fetcher.run(&request).await {
                Ok(summary) => info!(
                    form_uid = %summary.form_uid,
                    created = summary.created,
                    "scheduled fetch complete"
                ),
                Err(err) => error!(error = %err, "scheduled fetch failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
