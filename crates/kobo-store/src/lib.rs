//! Submission persistence: the `SubmissionStore` contract, a Postgres implementation and an
//! in-memory one.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use kobo_core::{IngestPolicy, NewSubmission, ReconcileAction, Submission};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "kobo-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Result of a single find-or-create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub id: i64,
    pub action: ReconcileAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SubmissionOrdering {
    #[default]
    SubmittedDesc,
    SubmittedAsc,
    SyncedDesc,
    SyncedAsc,
}

impl SubmissionOrdering {
    fn order_clause(&self) -> &'static str {
        match self {
            Self::SubmittedDesc => "date_submitted DESC, id DESC",
            Self::SubmittedAsc => "date_submitted ASC, id ASC",
            Self::SyncedDesc => "date_synced DESC, id DESC",
            Self::SyncedAsc => "date_synced ASC, id ASC",
        }
    }
}

impl FromStr for SubmissionOrdering {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "-date_submitted" => Ok(Self::SubmittedDesc),
            "date_submitted" => Ok(Self::SubmittedAsc),
            "-date_synced" => Ok(Self::SyncedDesc),
            "date_synced" => Ok(Self::SyncedAsc),
            other => Err(format!("unsupported ordering `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionQuery {
    pub form_uid: Option<String>,
    /// Case-insensitive match on uuid or the raw payload text.
    pub search: Option<String>,
    pub ordering: SubmissionOrdering,
    pub limit: usize,
    pub offset: usize,
}

impl Default for SubmissionQuery {
    fn default() -> Self {
        Self {
            form_uid: None,
            search: None,
            ordering: SubmissionOrdering::default(),
            limit: 50,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionPage {
    pub total: u64,
    pub items: Vec<Submission>,
}

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Atomic find-or-create on `uuid`. An existing row is rewritten only under
    /// [`IngestPolicy::Overwrite`].
    async fn upsert(
        &self,
        submission: &NewSubmission,
        policy: IngestPolicy,
    ) -> Result<UpsertOutcome, StoreError>;

    async fn get(&self, id: i64) -> Result<Option<Submission>, StoreError>;

    async fn get_by_uuid(&self, uuid: &str) -> Result<Option<Submission>, StoreError>;

    async fn list(&self, query: &SubmissionQuery) -> Result<SubmissionPage, StoreError>;

    async fn count_for_form(&self, form_uid: &str) -> Result<u64, StoreError>;
}

#[async_trait]
impl<T: SubmissionStore + ?Sized> SubmissionStore for std::sync::Arc<T> {
    async fn upsert(
        &self,
        submission: &NewSubmission,
        policy: IngestPolicy,
    ) -> Result<UpsertOutcome, StoreError> {
        (**self).upsert(submission, policy).await
    }

    async fn get(&self, id: i64) -> Result<Option<Submission>, StoreError> {
        (**self).get(id).await
    }

    async fn get_by_uuid(&self, uuid: &str) -> Result<Option<Submission>, StoreError> {
        (**self).get_by_uuid(uuid).await
    }

    async fn list(&self, query: &SubmissionQuery) -> Result<SubmissionPage, StoreError> {
        (**self).list(query).await
    }

    async fn count_for_form(&self, form_uid: &str) -> Result<u64, StoreError> {
        (**self).count_for_form(form_uid).await
    }
}

fn like_pattern(search: &str) -> String {
    let escaped = search
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

#[derive(Debug, Clone)]
pub struct PgSubmissionStore {
    pool: PgPool,
}

impl PgSubmissionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn submission_from_row(row: &PgRow) -> Result<Submission, sqlx::Error> {
    Ok(Submission {
        id: row.try_get("id")?,
        uuid: row.try_get("uuid")?,
        form_uid: row.try_get("form_uid")?,
        data: row.try_get("data")?,
        date_submitted: row.try_get("date_submitted")?,
        date_synced: row.try_get("date_synced")?,
        date_updated: row.try_get("date_updated")?,
    })
}

#[async_trait]
impl SubmissionStore for PgSubmissionStore {
    async fn upsert(
        &self,
        submission: &NewSubmission,
        policy: IngestPolicy,
    ) -> Result<UpsertOutcome, StoreError> {
        let data = sqlx::types::Json(&submission.data);
        let outcome = match policy {
            IngestPolicy::Overwrite => {
                // xmax is 0 only for a freshly inserted tuple.
                let row = sqlx::query(
                    r#"
                    INSERT INTO kobo_submissions (uuid, form_uid, data, date_submitted)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (uuid) DO UPDATE
                       SET form_uid = EXCLUDED.form_uid,
                           data = EXCLUDED.data,
                           date_submitted = EXCLUDED.date_submitted,
                           date_updated = GREATEST(
                               NOW(),
                               kobo_submissions.date_updated + INTERVAL '1 microsecond'
                           )
                    RETURNING id, (xmax = 0) AS inserted
                    "#,
                )
                .bind(&submission.uuid)
                .bind(&submission.form_uid)
                .bind(data)
                .bind(submission.date_submitted)
                .fetch_one(&self.pool)
                .await?;
                let inserted: bool = row.try_get("inserted")?;
                UpsertOutcome {
                    id: row.try_get("id")?,
                    action: if inserted {
                        ReconcileAction::Created
                    } else {
                        ReconcileAction::Updated
                    },
                }
            }
            IngestPolicy::Skip => {
                let inserted = sqlx::query(
                    r#"
                    INSERT INTO kobo_submissions (uuid, form_uid, data, date_submitted)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (uuid) DO NOTHING
                    RETURNING id
                    "#,
                )
                .bind(&submission.uuid)
                .bind(&submission.form_uid)
                .bind(data)
                .bind(submission.date_submitted)
                .fetch_optional(&self.pool)
                .await?;
                match inserted {
                    Some(row) => UpsertOutcome {
                        id: row.try_get("id")?,
                        action: ReconcileAction::Created,
                    },
                    None => {
                        let id: i64 = sqlx::query_scalar(
                            "SELECT id FROM kobo_submissions WHERE uuid = $1",
                        )
                        .bind(&submission.uuid)
                        .fetch_one(&self.pool)
                        .await?;
                        UpsertOutcome {
                            id,
                            action: ReconcileAction::Skipped,
                        }
                    }
                }
            }
        };
        debug!(uuid = %submission.uuid, action = outcome.action.as_str(), "upserted submission");
        Ok(outcome)
    }

    async fn get(&self, id: i64) -> Result<Option<Submission>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, uuid, form_uid, data, date_submitted, date_synced, date_updated
              FROM kobo_submissions
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(submission_from_row).transpose()?)
    }

    async fn get_by_uuid(&self, uuid: &str) -> Result<Option<Submission>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, uuid, form_uid, data, date_submitted, date_synced, date_updated
              FROM kobo_submissions
             WHERE uuid = $1
            "#,
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(submission_from_row).transpose()?)
    }

    async fn list(&self, query: &SubmissionQuery) -> Result<SubmissionPage, StoreError> {
        let pattern = query
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(like_pattern);
        let filter = r#"
             WHERE ($1::text IS NULL OR form_uid = $1)
               AND ($2::text IS NULL OR uuid ILIKE $2 OR data::text ILIKE $2)
        "#;

        let count_sql = format!("SELECT COUNT(*) FROM kobo_submissions {filter}");
        let total: i64 = sqlx::query_scalar(&count_sql)
            .bind(query.form_uid.as_deref())
            .bind(pattern.as_deref())
            .fetch_one(&self.pool)
            .await?;

        let sql = format!(
            r#"
            SELECT id, uuid, form_uid, data, date_submitted, date_synced, date_updated
              FROM kobo_submissions
              {filter}
             ORDER BY {}
             LIMIT $3 OFFSET $4
            "#,
            query.ordering.order_clause()
        );
        let rows = sqlx::query(&sql)
            .bind(query.form_uid.as_deref())
            .bind(pattern.as_deref())
            .bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
            .bind(i64::try_from(query.offset).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        let items = rows
            .iter()
            .map(submission_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SubmissionPage {
            total: total.max(0) as u64,
            items,
        })
    }

    async fn count_for_form(&self, form_uid: &str) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM kobo_submissions WHERE form_uid = $1")
                .bind(form_uid)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    rows: HashMap<String, Submission>,
}

/// Process-local store. The whole find-or-create runs under one lock.
#[derive(Debug, Default)]
pub struct MemorySubmissionStore {
    state: Mutex<MemoryState>,
}

impl MemorySubmissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn matches_search(submission: &Submission, needle: &str) -> bool {
    submission.uuid.to_lowercase().contains(needle)
        || submission.data.to_string().to_lowercase().contains(needle)
}

#[async_trait]
impl SubmissionStore for MemorySubmissionStore {
    async fn upsert(
        &self,
        submission: &NewSubmission,
        policy: IngestPolicy,
    ) -> Result<UpsertOutcome, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        if let Some(existing) = state.rows.get_mut(&submission.uuid) {
            if policy == IngestPolicy::Skip {
                return Ok(UpsertOutcome {
                    id: existing.id,
                    action: ReconcileAction::Skipped,
                });
            }
            existing.form_uid = submission.form_uid.clone();
            existing.data = submission.data.clone();
            existing.date_submitted = submission.date_submitted;
            existing.date_updated = if now > existing.date_updated {
                now
            } else {
                existing.date_updated + Duration::microseconds(1)
            };
            return Ok(UpsertOutcome {
                id: existing.id,
                action: ReconcileAction::Updated,
            });
        }

        state.next_id += 1;
        let id = state.next_id;
        state.rows.insert(
            submission.uuid.clone(),
            Submission {
                id,
                uuid: submission.uuid.clone(),
                form_uid: submission.form_uid.clone(),
                data: submission.data.clone(),
                date_submitted: submission.date_submitted,
                date_synced: now,
                date_updated: now,
            },
        );
        Ok(UpsertOutcome {
            id,
            action: ReconcileAction::Created,
        })
    }

    async fn get(&self, id: i64) -> Result<Option<Submission>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.rows.values().find(|s| s.id == id).cloned())
    }

    async fn get_by_uuid(&self, uuid: &str) -> Result<Option<Submission>, StoreError> {
        Ok(self.state.lock().await.rows.get(uuid).cloned())
    }

    async fn list(&self, query: &SubmissionQuery) -> Result<SubmissionPage, StoreError> {
        let needle = query
            .search
            .as_deref()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());
        let state = self.state.lock().await;
        let mut matching = state
            .rows
            .values()
            .filter(|s| query.form_uid.as_deref().map_or(true, |f| s.form_uid == f))
            .filter(|s| needle.as_deref().map_or(true, |n| matches_search(s, n)))
            .cloned()
            .collect::<Vec<_>>();

        match query.ordering {
            SubmissionOrdering::SubmittedDesc => {
                matching.sort_by(|a, b| (b.date_submitted, b.id).cmp(&(a.date_submitted, a.id)))
            }
            SubmissionOrdering::SubmittedAsc => {
                matching.sort_by(|a, b| (a.date_submitted, a.id).cmp(&(b.date_submitted, b.id)))
            }
            SubmissionOrdering::SyncedDesc => {
                matching.sort_by(|a, b| (b.date_synced, b.id).cmp(&(a.date_synced, a.id)))
            }
            SubmissionOrdering::SyncedAsc => {
                matching.sort_by(|a, b| (a.date_synced, a.id).cmp(&(b.date_synced, b.id)))
            }
        }

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect();
        Ok(SubmissionPage { total, items })
    }

    async fn count_for_form(&self, form_uid: &str) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state.rows.values().filter(|s| s.form_uid == form_uid).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn new_submission(uuid: &str, form_uid: &str, day: u32) -> NewSubmission {
        NewSubmission {
            uuid: uuid.to_string(),
            form_uid: form_uid.to_string(),
            data: json!({"_uuid": uuid, "q": format!("answer-{day}")}),
            date_submitted: Utc.with_ymd_and_hms(2025, 1, day, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn overwrite_keeps_one_row_and_sync_date() {
        let store = MemorySubmissionStore::new();
        let first = store
            .upsert(&new_submission("u1", "f1", 1), IngestPolicy::Overwrite)
            .await
            .unwrap();
        let created = store.get_by_uuid("u1").await.unwrap().unwrap();

        let mut changed = new_submission("u1", "f2", 2);
        changed.data = json!({"_uuid": "u1", "q": "b"});
        let second = store.upsert(&changed, IngestPolicy::Overwrite).await.unwrap();
        let updated = store.get_by_uuid("u1").await.unwrap().unwrap();

        assert_eq!(first.action, ReconcileAction::Created);
        assert_eq!(second.action, ReconcileAction::Updated);
        assert_eq!(first.id, second.id);
        assert_eq!(store.len().await, 1);
        assert_eq!(updated.form_uid, "f2");
        assert_eq!(updated.data["q"], "b");
        assert_eq!(updated.date_synced, created.date_synced);
        assert!(updated.date_updated > created.date_updated);
    }

    #[tokio::test]
    async fn skip_leaves_existing_row_untouched() {
        let store = MemorySubmissionStore::new();
        store
            .upsert(&new_submission("u1", "f1", 1), IngestPolicy::Skip)
            .await
            .unwrap();
        let before = store.get_by_uuid("u1").await.unwrap().unwrap();

        let outcome = store
            .upsert(&new_submission("u1", "other", 9), IngestPolicy::Skip)
            .await
            .unwrap();

        assert_eq!(outcome.action, ReconcileAction::Skipped);
        assert_eq!(outcome.id, before.id);
        assert_eq!(store.get_by_uuid("u1").await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn list_filters_orders_and_pages() {
        let store = MemorySubmissionStore::new();
        for (uuid, form, day) in [("a", "f1", 3), ("b", "f2", 5), ("c", "f1", 1), ("d", "f1", 4)] {
            store
                .upsert(&new_submission(uuid, form, day), IngestPolicy::Overwrite)
                .await
                .unwrap();
        }

        let newest_first = store.list(&SubmissionQuery::default()).await.unwrap();
        let order = newest_first.items.iter().map(|s| s.uuid.as_str()).collect::<Vec<_>>();
        assert_eq!(order, vec!["b", "d", "a", "c"]);

        let f1 = store
            .list(&SubmissionQuery {
                form_uid: Some("f1".into()),
                ordering: SubmissionOrdering::SubmittedAsc,
                limit: 2,
                offset: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(f1.total, 3);
        let order = f1.items.iter().map(|s| s.uuid.as_str()).collect::<Vec<_>>();
        assert_eq!(order, vec!["a", "d"]);

        let searched = store
            .list(&SubmissionQuery {
                search: Some("ANSWER-5".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(searched.total, 1);
        assert_eq!(searched.items[0].uuid, "b");

        assert_eq!(store.count_for_form("f1").await.unwrap(), 3);
        let by_id = store.get(searched.items[0].id).await.unwrap().unwrap();
        assert_eq!(by_id.uuid, "b");
    }

    async fn upsert_concurrently<S>(
        store: Arc<S>,
        uuid: &str,
        policy: IngestPolicy,
        writers: u32,
    ) -> Vec<UpsertOutcome>
    where
        S: SubmissionStore + 'static,
    {
        let handles = (0..writers)
            .map(|i| {
                let store = store.clone();
                let submission = new_submission(uuid, "f1", i + 1);
                tokio::spawn(async move { store.upsert(&submission, policy).await.unwrap() })
            })
            .collect::<Vec<_>>();
        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap());
        }
        outcomes
    }

    fn count(outcomes: &[UpsertOutcome], action: ReconcileAction) -> usize {
        outcomes.iter().filter(|o| o.action == action).count()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_upserts_of_one_uuid_create_once() {
        let store = Arc::new(MemorySubmissionStore::new());

        let outcomes =
            upsert_concurrently(store.clone(), "shared", IngestPolicy::Overwrite, 8).await;
        assert_eq!(count(&outcomes, ReconcileAction::Created), 1);
        assert_eq!(count(&outcomes, ReconcileAction::Updated), 7);
        assert!(outcomes.iter().all(|o| o.id == outcomes[0].id));
        assert_eq!(store.len().await, 1);

        let outcomes = upsert_concurrently(store.clone(), "fresh", IngestPolicy::Skip, 8).await;
        assert_eq!(count(&outcomes, ReconcileAction::Created), 1);
        assert_eq!(count(&outcomes, ReconcileAction::Skipped), 7);
        assert!(outcomes.iter().all(|o| o.id == outcomes[0].id));
        assert_eq!(store.len().await, 2);
    }

    /// Postgres-backed store when `DATABASE_URL` is set; these tests are no-ops otherwise.
    async fn pg_store() -> Option<PgSubmissionStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let store = PgSubmissionStore::connect(&url).await.unwrap();
        store.migrate().await.unwrap();
        Some(store)
    }

    fn unique_uuid(prefix: &str) -> String {
        format!("{prefix}-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default())
    }

    #[tokio::test]
    async fn postgres_upsert_follows_policy() {
        let Some(store) = pg_store().await else {
            return;
        };
        let uuid = unique_uuid("pg-policy");

        let first = store
            .upsert(&new_submission(&uuid, "pg-form", 1), IngestPolicy::Overwrite)
            .await
            .unwrap();
        assert_eq!(first.action, ReconcileAction::Created);
        let created = store.get_by_uuid(&uuid).await.unwrap().unwrap();

        let mut changed = new_submission(&uuid, "pg-form", 2);
        changed.data = json!({"_uuid": uuid, "q": "b"});
        let second = store.upsert(&changed, IngestPolicy::Overwrite).await.unwrap();
        assert_eq!(second.action, ReconcileAction::Updated);
        assert_eq!(second.id, first.id);
        let updated = store.get_by_uuid(&uuid).await.unwrap().unwrap();
        assert_eq!(updated.data["q"], "b");
        assert_eq!(updated.date_synced, created.date_synced);
        assert!(updated.date_updated > created.date_updated);

        let skipped = store
            .upsert(&new_submission(&uuid, "pg-form", 3), IngestPolicy::Skip)
            .await
            .unwrap();
        assert_eq!(skipped.action, ReconcileAction::Skipped);
        assert_eq!(skipped.id, first.id);
        assert_eq!(store.get_by_uuid(&uuid).await.unwrap().unwrap(), updated);

        let other = unique_uuid("pg-policy-skip");
        let inserted = store
            .upsert(&new_submission(&other, "pg-form", 4), IngestPolicy::Skip)
            .await
            .unwrap();
        assert_eq!(inserted.action, ReconcileAction::Created);
        assert_ne!(inserted.id, first.id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn postgres_concurrent_upserts_create_once() {
        let Some(store) = pg_store().await else {
            return;
        };
        let store = Arc::new(store);

        let uuid = unique_uuid("pg-race-overwrite");
        let outcomes = upsert_concurrently(store.clone(), &uuid, IngestPolicy::Overwrite, 8).await;
        assert_eq!(count(&outcomes, ReconcileAction::Created), 1);
        assert_eq!(count(&outcomes, ReconcileAction::Updated), 7);
        assert!(outcomes.iter().all(|o| o.id == outcomes[0].id));

        let uuid = unique_uuid("pg-race-skip");
        let outcomes = upsert_concurrently(store.clone(), &uuid, IngestPolicy::Skip, 8).await;
        assert_eq!(count(&outcomes, ReconcileAction::Created), 1);
        assert_eq!(count(&outcomes, ReconcileAction::Skipped), 7);
        assert!(outcomes.iter().all(|o| o.id == outcomes[0].id));
    }

    #[test]
    fn ordering_parses_query_values() {
        assert_eq!(
            "-date_submitted".parse::<SubmissionOrdering>().unwrap(),
            SubmissionOrdering::SubmittedDesc
        );
        assert_eq!(
            "date_synced".parse::<SubmissionOrdering>().unwrap(),
            SubmissionOrdering::SyncedAsc
        );
        assert!("uuid".parse::<SubmissionOrdering>().is_err());
    }

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
    }
}
