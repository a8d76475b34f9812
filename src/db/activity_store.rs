use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::AppResult,
    models::{ActivityInfo, ActivityType, Device, EncryptedRow, PersonalAverage, PostAverage},
};

/// Document-store capability consumed by the ledger and the authenticator.
///
/// The ledger only needs four primitives from its store: an atomic
/// conditional insert (reporting whether a row was created), grouped
/// aggregation, ranked/limited finds, and a bulk rank increment. Keeping
/// them behind a trait keeps the scoring and dedup logic testable without a
/// running database.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Inserts into the anonymized aggregate collection unless an equal
    /// record by the same anonymous user exists inside the dedup window.
    /// Returns whether a row was actually created; `created` is only ever
    /// written on insert, never refreshed on a duplicate match.
    async fn insert_aggregate(
        &self,
        activity: ActivityType,
        anonymous_user_id: &str,
        metadata: &str,
        now: DateTime<Utc>,
        window_start: DateTime<Utc>,
    ) -> AppResult<bool>;

    /// Appends a per-user encrypted record at rank 0, shifting every
    /// existing record of that user down by one. Both statements run in
    /// one transaction so concurrent writers for the same username cannot
    /// duplicate or skip a rank.
    async fn append_user_record(
        &self,
        activity: ActivityType,
        username: &str,
        metadata_id: &str,
        metadata_ciphertext: &str,
        created_ciphertext: &str,
    ) -> AppResult<()>;

    /// Per-user records grouped by `metadata_id`, collapsing repeated
    /// events for the same post into one row carrying the event count and
    /// the best (minimal) rank, ordered most recent first.
    async fn grouped_user_events(
        &self,
        activity: ActivityType,
        username: &str,
        limit: i64,
    ) -> AppResult<Vec<EncryptedRow>>;

    /// Raw per-user records ordered by rank (most recent first), for
    /// paged early-exit scans.
    async fn user_records_by_rank(
        &self,
        activity: ActivityType,
        username: &str,
        offset: i64,
        limit: i64,
    ) -> AppResult<Vec<EncryptedRow>>;

    /// The user's average event count across their own distinct posts.
    async fn personal_average(
        &self,
        activity: ActivityType,
        username: &str,
    ) -> AppResult<PersonalAverage>;

    /// Average per-user event count for one post across the aggregate
    /// collection, excluding the requesting user's own anonymous id.
    async fn global_average(
        &self,
        activity: ActivityType,
        metadata: &str,
        exclude_anonymous_id: &str,
    ) -> AppResult<PostAverage>;

    async fn find_device(
        &self,
        username: &str,
        device_key_hash: &str,
    ) -> AppResult<Option<Device>>;

    async fn device_registered_since(
        &self,
        username: &str,
        since: DateTime<Utc>,
    ) -> AppResult<bool>;

    async fn device_count(&self, username: &str) -> AppResult<i64>;

    async fn insert_device(&self, device: &Device) -> AppResult<()>;

    async fn find_activity_info(&self, hashed_username: &str) -> AppResult<Option<ActivityInfo>>;

    /// Inserts unless a record for the hashed username already exists.
    /// Returns whether the insert happened, so get-or-create can re-read
    /// after losing a creation race.
    async fn insert_activity_info(&self, info: &ActivityInfo) -> AppResult<bool>;
}

/// PostgreSQL-backed store.
///
/// Table names come from the validated activity registry, never from
/// request input, so interpolating them into SQL is safe. Bind parameters
/// carry all request data.
#[derive(Clone)]
pub struct PgActivityStore {
    pool: PgPool,
}

impl PgActivityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ActivityStore for PgActivityStore {
    async fn insert_aggregate(
        &self,
        activity: ActivityType,
        anonymous_user_id: &str,
        metadata: &str,
        now: DateTime<Utc>,
        window_start: DateTime<Utc>,
    ) -> AppResult<bool> {
        let table = activity.spec().post_collection;
        let sql = format!(
            "INSERT INTO {table} (anonymous_user_id, metadata, created) \
             SELECT $1, $2, $3 \
             WHERE NOT EXISTS ( \
                 SELECT 1 FROM {table} \
                 WHERE anonymous_user_id = $1 AND metadata = $2 AND created > $4 \
             )"
        );

        let result = sqlx::query(&sql)
            .bind(anonymous_user_id)
            .bind(metadata)
            .bind(now)
            .bind(window_start)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn append_user_record(
        &self,
        activity: ActivityType,
        username: &str,
        metadata_id: &str,
        metadata_ciphertext: &str,
        created_ciphertext: &str,
    ) -> AppResult<()> {
        let table = activity.spec().user_collection;
        let shift_sql = format!("UPDATE {table} SET rank = rank + 1 WHERE username = $1");
        let insert_sql = format!(
            "INSERT INTO {table} (username, metadata_id, metadata, created, rank) \
             VALUES ($1, $2, $3, $4, 0)"
        );

        let mut tx = self.pool.begin().await?;
        sqlx::query(&shift_sql)
            .bind(username)
            .execute(&mut *tx)
            .await?;
        sqlx::query(&insert_sql)
            .bind(username)
            .bind(metadata_id)
            .bind(metadata_ciphertext)
            .bind(created_ciphertext)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(())
    }

    async fn grouped_user_events(
        &self,
        activity: ActivityType,
        username: &str,
        limit: i64,
    ) -> AppResult<Vec<EncryptedRow>> {
        let table = activity.spec().user_collection;
        // The ciphertext differs per row even for equal plaintext, so the
        // group carries the most recent ciphertext alongside the count.
        let sql = format!(
            "SELECT metadata_id, \
                    (array_agg(metadata ORDER BY rank ASC))[1] AS metadata, \
                    (array_agg(created ORDER BY rank ASC))[1] AS created, \
                    COUNT(*)::bigint AS event_count, \
                    MIN(rank)::bigint AS rank \
             FROM {table} \
             WHERE username = $1 \
             GROUP BY metadata_id \
             ORDER BY MIN(rank) ASC \
             LIMIT $2"
        );

        let rows = sqlx::query_as::<_, EncryptedRow>(&sql)
            .bind(username)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    async fn user_records_by_rank(
        &self,
        activity: ActivityType,
        username: &str,
        offset: i64,
        limit: i64,
    ) -> AppResult<Vec<EncryptedRow>> {
        let table = activity.spec().user_collection;
        let sql = format!(
            "SELECT metadata_id, metadata, created, 1::bigint AS event_count, rank \
             FROM {table} \
             WHERE username = $1 \
             ORDER BY rank ASC \
             LIMIT $2 OFFSET $3"
        );

        let rows = sqlx::query_as::<_, EncryptedRow>(&sql)
            .bind(username)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    async fn personal_average(
        &self,
        activity: ActivityType,
        username: &str,
    ) -> AppResult<PersonalAverage> {
        let table = activity.spec().user_collection;
        let sql = format!(
            "SELECT COALESCE(AVG(g.cnt), 0)::float8 AS avg, \
                    COUNT(*)::bigint AS posts, \
                    COALESCE(SUM(g.cnt), 0)::bigint AS total \
             FROM ( \
                 SELECT COUNT(*) AS cnt FROM {table} \
                 WHERE username = $1 \
                 GROUP BY metadata_id \
             ) g"
        );

        let average = sqlx::query_as::<_, PersonalAverage>(&sql)
            .bind(username)
            .fetch_one(&self.pool)
            .await?;

        Ok(average)
    }

    async fn global_average(
        &self,
        activity: ActivityType,
        metadata: &str,
        exclude_anonymous_id: &str,
    ) -> AppResult<PostAverage> {
        let table = activity.spec().post_collection;
        let sql = format!(
            "SELECT COALESCE(AVG(g.cnt), 0)::float8 AS avg, \
                    COUNT(*)::bigint AS users, \
                    COALESCE(SUM(g.cnt), 0)::bigint AS total \
             FROM ( \
                 SELECT COUNT(*) AS cnt FROM {table} \
                 WHERE metadata = $1 AND anonymous_user_id <> $2 \
                 GROUP BY anonymous_user_id \
             ) g"
        );

        let average = sqlx::query_as::<_, PostAverage>(&sql)
            .bind(metadata)
            .bind(exclude_anonymous_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(average)
    }

    async fn find_device(
        &self,
        username: &str,
        device_key_hash: &str,
    ) -> AppResult<Option<Device>> {
        let device = sqlx::query_as::<_, Device>(
            "SELECT username, device_name, device_key_hash, memo_key, created_at \
             FROM devices \
             WHERE username = $1 AND device_key_hash = $2",
        )
        .bind(username)
        .bind(device_key_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(device)
    }

    async fn device_registered_since(
        &self,
        username: &str,
        since: DateTime<Utc>,
    ) -> AppResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM devices WHERE username = $1 AND created_at > $2)",
        )
        .bind(username)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn device_count(&self, username: &str) -> AppResult<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM devices WHERE username = $1")
                .bind(username)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    async fn insert_device(&self, device: &Device) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO devices (username, device_name, device_key_hash, memo_key, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&device.username)
        .bind(&device.device_name)
        .bind(&device.device_key_hash)
        .bind(&device.memo_key)
        .bind(device.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_activity_info(&self, hashed_username: &str) -> AppResult<Option<ActivityInfo>> {
        let info = sqlx::query_as::<_, ActivityInfo>(
            "SELECT hashed_username, hashed_user_id, public_activity_key, info_message, memo_key \
             FROM activity_info \
             WHERE hashed_username = $1",
        )
        .bind(hashed_username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(info)
    }

    async fn insert_activity_info(&self, info: &ActivityInfo) -> AppResult<bool> {
        let result = sqlx::query(
            "INSERT INTO activity_info \
             (hashed_username, hashed_user_id, public_activity_key, info_message, memo_key) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (hashed_username) DO NOTHING",
        )
        .bind(&info.hashed_username)
        .bind(&info.hashed_user_id)
        .bind(&info.public_activity_key)
        .bind(&info.info_message)
        .bind(&info.memo_key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
