//! SQLite database operations
//!
//! All database access goes through this module. Every write is a single
//! statement (or one short transaction), and the unique constraints in the
//! schema back the idempotence of inbox processing.

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;

use super::models::*;
use crate::error::AppError;
use crate::validation::is_valid;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Users and repositories
    // =========================================================================

    pub async fn insert_user(&self, user: &NewUser) -> Result<User, AppError> {
        let created = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (
                name, login_name, full_name, is_remote, private_key_pem, public_key_pem, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&user.name)
        .bind(&user.login_name)
        .bind(&user.full_name)
        .bind(user.is_remote)
        .bind(&user.private_key_pem)
        .bind(&user.public_key_pem)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(created)
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user)
    }

    pub async fn get_local_user_by_name(&self, name: &str) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE name = ? AND is_remote = 0")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user)
    }

    pub async fn count_local_users(&self) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE is_remote = 0")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    pub async fn insert_repository(&self, owner_id: i64, name: &str) -> Result<Repository, AppError> {
        let repository = sqlx::query_as::<_, Repository>(
            "INSERT INTO repositories (owner_id, name, created_at) VALUES (?, ?, ?) RETURNING *",
        )
        .bind(owner_id)
        .bind(name)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(repository)
    }

    pub async fn get_repository(&self, id: i64) -> Result<Option<Repository>, AppError> {
        let repository = sqlx::query_as::<_, Repository>("SELECT * FROM repositories WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(repository)
    }

    // =========================================================================
    // Server actor
    // =========================================================================

    pub async fn get_server_actor_keys(&self) -> Result<Option<ServerActorKeys>, AppError> {
        let keys = sqlx::query_as::<_, ServerActorKeys>(
            "SELECT private_key_pem, public_key_pem FROM server_actor WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(keys)
    }

    /// Store server actor keys unless another initializer already did.
    ///
    /// # Returns
    /// `true` if inserted, `false` if keys already existed.
    pub async fn insert_server_actor_keys_if_absent(
        &self,
        private_key_pem: &str,
        public_key_pem: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO server_actor (id, private_key_pem, public_key_pem, created_at)
            VALUES (1, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(private_key_pem)
        .bind(public_key_pem)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Federation hosts
    // =========================================================================

    pub async fn get_federation_host(&self, id: i64) -> Result<Option<FederationHost>, AppError> {
        let host = sqlx::query_as::<_, FederationHost>("SELECT * FROM federation_host WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        host.map(checked).transpose()
    }

    pub async fn find_federation_host_by_fqdn_and_port(
        &self,
        fqdn: &str,
        port: u16,
    ) -> Result<Option<FederationHost>, AppError> {
        let host = sqlx::query_as::<_, FederationHost>(
            "SELECT * FROM federation_host WHERE host_fqdn = ? AND host_port = ?",
        )
        .bind(fqdn)
        .bind(port)
        .fetch_optional(&self.pool)
        .await?;

        host.map(checked).transpose()
    }

    pub async fn find_federation_host_by_key_id(
        &self,
        key_id: &str,
    ) -> Result<Option<FederationHost>, AppError> {
        let host =
            sqlx::query_as::<_, FederationHost>("SELECT * FROM federation_host WHERE key_id = ?")
                .bind(key_id)
                .fetch_optional(&self.pool)
                .await?;

        host.map(checked).transpose()
    }

    /// Insert a host discovered for the first time.
    ///
    /// # Returns
    /// The new row, or `None` when a concurrent discovery already created
    /// the same (fqdn, port); callers re-read in that case.
    pub async fn insert_federation_host(
        &self,
        host: &NewFederationHost,
    ) -> Result<Option<FederationHost>, AppError> {
        is_valid(host)?;
        let now = Utc::now();
        let created = sqlx::query_as::<_, FederationHost>(
            r#"
            INSERT INTO federation_host (
                host_fqdn, host_port, host_schema, software_name, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(host_fqdn, host_port) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(&host.host_fqdn)
        .bind(host.host_port)
        .bind(&host.host_schema)
        .bind(&host.software_name)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(created)
    }

    pub async fn update_federation_host_key(
        &self,
        id: i64,
        key_id: &str,
        public_key: &[u8],
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE federation_host SET key_id = ?, public_key = ?, updated_at = ? WHERE id = ?",
        )
        .bind(key_id)
        .bind(public_key)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Advance `latest_activity` to `activity_ms` if it is strictly newer.
    ///
    /// The comparison and the write happen in one statement, so two deliveries
    /// racing with the same timestamp cannot both succeed.
    ///
    /// # Returns
    /// `true` if the slot was claimed, `false` if the activity is not newer.
    pub async fn claim_federation_host_activity(
        &self,
        id: i64,
        activity_ms: i64,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE federation_host
            SET latest_activity = ?, updated_at = ?
            WHERE id = ? AND (latest_activity IS NULL OR latest_activity < ?)
            "#,
        )
        .bind(activity_ms)
        .bind(Utc::now())
        .bind(id)
        .bind(activity_ms)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Federated users
    // =========================================================================

    pub async fn get_federated_user(&self, id: i64) -> Result<Option<FederatedUser>, AppError> {
        let user = sqlx::query_as::<_, FederatedUser>("SELECT * FROM federated_user WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user)
    }

    pub async fn get_federated_user_by_user_id(
        &self,
        user_id: i64,
    ) -> Result<Option<FederatedUser>, AppError> {
        let user =
            sqlx::query_as::<_, FederatedUser>("SELECT * FROM federated_user WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(user)
    }

    pub async fn find_federated_user(
        &self,
        external_id: &str,
        federation_host_id: i64,
    ) -> Result<Option<FederatedUser>, AppError> {
        let user = sqlx::query_as::<_, FederatedUser>(
            "SELECT * FROM federated_user WHERE external_id = ? AND federation_host_id = ?",
        )
        .bind(external_id)
        .bind(federation_host_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    pub async fn find_federated_user_by_key_id(
        &self,
        key_id: &str,
    ) -> Result<Option<FederatedUser>, AppError> {
        let user =
            sqlx::query_as::<_, FederatedUser>("SELECT * FROM federated_user WHERE key_id = ?")
                .bind(key_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(user)
    }

    pub async fn list_federated_users(&self) -> Result<Vec<FederatedUser>, AppError> {
        let users = sqlx::query_as::<_, FederatedUser>("SELECT * FROM federated_user ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        Ok(users)
    }

    /// Create the shadow user and its federated record together.
    ///
    /// # Returns
    /// The stored record. When another request created the same
    /// (host, external id) first, that record is returned instead.
    pub async fn create_federated_user(
        &self,
        user: &NewUser,
        federated_user: &NewFederatedUser,
    ) -> Result<FederatedUser, AppError> {
        is_valid(federated_user)?;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, FederatedUser>(
            "SELECT * FROM federated_user WHERE external_id = ? AND federation_host_id = ?",
        )
        .bind(&federated_user.external_id)
        .bind(federated_user.federation_host_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(existing) = existing {
            tx.rollback().await?;
            return Ok(existing);
        }

        // A shadow user may outlive its federated record; reuse it by login name.
        let reusable: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM users WHERE login_name = ? AND is_remote = 1",
        )
        .bind(&user.login_name)
        .fetch_optional(&mut *tx)
        .await?;

        let user_id = match reusable {
            Some(id) => id,
            None => {
                sqlx::query_scalar(
                    r#"
                    INSERT INTO users (name, login_name, full_name, is_remote, created_at)
                    VALUES (?, ?, ?, 1, ?)
                    RETURNING id
                    "#,
                )
                .bind(&user.name)
                .bind(&user.login_name)
                .bind(&user.full_name)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?
            }
        };

        let created = sqlx::query_as::<_, FederatedUser>(
            r#"
            INSERT INTO federated_user (
                user_id, external_id, federation_host_id, inbox_path,
                normalized_original_url, key_id, public_key, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(&federated_user.external_id)
        .bind(federated_user.federation_host_id)
        .bind(&federated_user.inbox_path)
        .bind(&federated_user.normalized_original_url)
        .bind(&federated_user.key_id)
        .bind(&federated_user.public_key)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        match created {
            Some(created) => {
                tx.commit().await?;
                Ok(created)
            }
            None => {
                tx.rollback().await?;
                self.find_federated_user(
                    &federated_user.external_id,
                    federated_user.federation_host_id,
                )
                .await?
                .ok_or_else(|| {
                    AppError::Internal(anyhow::anyhow!(
                        "federated user vanished after insert conflict"
                    ))
                })
            }
        }
    }

    pub async fn update_federated_user_key(
        &self,
        id: i64,
        key_id: &str,
        public_key: &[u8],
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE federated_user SET key_id = ?, public_key = ? WHERE id = ?")
            .bind(key_id)
            .bind(public_key)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// # Returns
    /// `true` if the stored path changed.
    pub async fn update_federated_user_inbox(
        &self,
        id: i64,
        inbox_path: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE federated_user SET inbox_path = ? WHERE id = ? AND inbox_path <> ?",
        )
        .bind(inbox_path)
        .bind(id)
        .bind(inbox_path)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Followers (remote -> local)
    // =========================================================================

    /// # Returns
    /// The id of the new edge, or `None` if the edge already existed.
    pub async fn add_follower(
        &self,
        followed_user_id: i64,
        federated_user_id: i64,
    ) -> Result<Option<i64>, AppError> {
        let id: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO federated_user_follower (
                followed_user_id, following_federated_user_id, created_at
            ) VALUES (?, ?, ?)
            ON CONFLICT(followed_user_id, following_federated_user_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(followed_user_id)
        .bind(federated_user_id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        Ok(id)
    }

    /// # Returns
    /// `true` if an edge was removed.
    pub async fn remove_follower(
        &self,
        followed_user_id: i64,
        federated_user_id: i64,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "DELETE FROM federated_user_follower WHERE followed_user_id = ? AND following_federated_user_id = ?",
        )
        .bind(followed_user_id)
        .bind(federated_user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn is_followed_by(
        &self,
        followed_user_id: i64,
        federated_user_id: i64,
    ) -> Result<bool, AppError> {
        let exists: i64 = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM federated_user_follower
                WHERE followed_user_id = ? AND following_federated_user_id = ?
            )
            "#,
        )
        .bind(followed_user_id)
        .bind(federated_user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists != 0)
    }

    pub async fn list_followers(&self, followed_user_id: i64) -> Result<Vec<FederatedUser>, AppError> {
        let followers = sqlx::query_as::<_, FederatedUser>(
            r#"
            SELECT fu.* FROM federated_user fu
            JOIN federated_user_follower f ON f.following_federated_user_id = fu.id
            WHERE f.followed_user_id = ?
            ORDER BY f.id
            "#,
        )
        .bind(followed_user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(followers)
    }

    // =========================================================================
    // Following (local -> remote)
    // =========================================================================

    /// Record an outbound Follow. Re-following replaces the pending activity id.
    pub async fn upsert_following(
        &self,
        local_user_id: i64,
        federated_user_id: i64,
        follow_activity_id: &str,
    ) -> Result<FederatedFollowing, AppError> {
        let following = sqlx::query_as::<_, FederatedFollowing>(
            r#"
            INSERT INTO federated_following (
                local_user_id, federated_user_id, follow_activity_id, accepted, created_at
            ) VALUES (?, ?, ?, 0, ?)
            ON CONFLICT(local_user_id, federated_user_id) DO UPDATE SET
                follow_activity_id = excluded.follow_activity_id,
                accepted = 0,
                accepted_at = NULL
            RETURNING *
            "#,
        )
        .bind(local_user_id)
        .bind(federated_user_id)
        .bind(follow_activity_id)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(following)
    }

    pub async fn find_following(
        &self,
        local_user_id: i64,
        federated_user_id: i64,
    ) -> Result<Option<FederatedFollowing>, AppError> {
        let following = sqlx::query_as::<_, FederatedFollowing>(
            "SELECT * FROM federated_following WHERE local_user_id = ? AND federated_user_id = ?",
        )
        .bind(local_user_id)
        .bind(federated_user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(following)
    }

    /// Mark the outbound Follow `follow_activity_id` sent to `federated_user_id`
    /// as accepted.
    ///
    /// # Returns
    /// `None` if no such Follow exists; otherwise the record, whose `accepted`
    /// flag is set whether or not this call was the one that set it.
    pub async fn mark_following_accepted(
        &self,
        follow_activity_id: &str,
        federated_user_id: i64,
    ) -> Result<Option<FederatedFollowing>, AppError> {
        sqlx::query(
            r#"
            UPDATE federated_following SET accepted = 1, accepted_at = ?
            WHERE follow_activity_id = ? AND federated_user_id = ? AND accepted = 0
            "#,
        )
        .bind(Utc::now())
        .bind(follow_activity_id)
        .bind(federated_user_id)
        .execute(&self.pool)
        .await?;

        let following = sqlx::query_as::<_, FederatedFollowing>(
            "SELECT * FROM federated_following WHERE follow_activity_id = ? AND federated_user_id = ?",
        )
        .bind(follow_activity_id)
        .bind(federated_user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(following)
    }

    pub async fn delete_following(
        &self,
        local_user_id: i64,
        federated_user_id: i64,
    ) -> Result<Option<FederatedFollowing>, AppError> {
        let following = sqlx::query_as::<_, FederatedFollowing>(
            "DELETE FROM federated_following WHERE local_user_id = ? AND federated_user_id = ? RETURNING *",
        )
        .bind(local_user_id)
        .bind(federated_user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(following)
    }

    // =========================================================================
    // Activity log
    // =========================================================================

    /// # Returns
    /// `true` if recorded, `false` if this (actor, activity id) was already logged.
    pub async fn insert_federated_user_activity(
        &self,
        activity: &NewFederatedUserActivity,
    ) -> Result<bool, AppError> {
        Ok(self
            .record_federated_user_activity(activity, None)
            .await?
            == ActivityRecord::Recorded)
    }

    /// Insert a remote activity, claiming the host ordering slot in the same
    /// transaction when `ordering` is `(host id, activity ms)`.
    ///
    /// A failed insert rolls the claim back, so a redelivery is not rejected
    /// as stale.
    pub async fn record_federated_user_activity(
        &self,
        activity: &NewFederatedUserActivity,
        ordering: Option<(i64, i64)>,
    ) -> Result<ActivityRecord, AppError> {
        is_valid(activity)?;
        let mut tx = self.pool.begin().await?;

        if let Some((host_id, activity_ms)) = ordering {
            let claimed = sqlx::query(
                r#"
                UPDATE federation_host
                SET latest_activity = ?, updated_at = ?
                WHERE id = ? AND (latest_activity IS NULL OR latest_activity < ?)
                "#,
            )
            .bind(activity_ms)
            .bind(Utc::now())
            .bind(host_id)
            .bind(activity_ms)
            .execute(&mut *tx)
            .await?;
            if claimed.rows_affected() == 0 {
                tx.rollback().await?;
                return Ok(ActivityRecord::Stale);
            }
        }

        let result = sqlx::query(
            r#"
            INSERT INTO federated_user_activity (
                user_id, actor_id, original_activity_id, note_content, note_url,
                original_note, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(actor_id, original_activity_id) DO NOTHING
            "#,
        )
        .bind(activity.user_id)
        .bind(&activity.actor_id)
        .bind(&activity.original_activity_id)
        .bind(&activity.note_content)
        .bind(&activity.note_url)
        .bind(&activity.original_note)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(if result.rows_affected() > 0 {
            ActivityRecord::Recorded
        } else {
            ActivityRecord::Duplicate
        })
    }

    pub async fn list_federated_user_activities(
        &self,
        user_id: i64,
    ) -> Result<Vec<FederatedUserActivity>, AppError> {
        let activities = sqlx::query_as::<_, FederatedUserActivity>(
            "SELECT * FROM federated_user_activity WHERE user_id = ? ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(activities)
    }

    // =========================================================================
    // Stars
    // =========================================================================

    /// # Returns
    /// `true` if the star was added, `false` if it already existed.
    pub async fn star_repository(&self, user_id: i64, repository_id: i64) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO repository_star (user_id, repository_id, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(user_id, repository_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(repository_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// # Returns
    /// `true` if a star was removed.
    pub async fn unstar_repository(
        &self,
        user_id: i64,
        repository_id: i64,
    ) -> Result<bool, AppError> {
        let result =
            sqlx::query("DELETE FROM repository_star WHERE user_id = ? AND repository_id = ?")
                .bind(user_id)
                .bind(repository_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn count_repository_stars(&self, repository_id: i64) -> Result<i64, AppError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM repository_star WHERE repository_id = ?")
                .bind(repository_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    // =========================================================================
    // Queue jobs
    // =========================================================================

    pub async fn enqueue_job(&self, job: &NewQueueJob) -> Result<i64, AppError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO queue_jobs (queue, payload, attempt, run_at, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&job.queue)
        .bind(&job.payload)
        .bind(job.attempt)
        .bind(job.run_at)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Lease up to `limit` due jobs of `queue` until `now_ms + lease_ms`.
    ///
    /// Selection and lease are one statement, so concurrent workers never
    /// claim the same job. Jobs come back oldest first.
    pub async fn claim_queue_jobs(
        &self,
        queue: &str,
        limit: usize,
        now_ms: i64,
        lease_ms: i64,
    ) -> Result<Vec<QueueJob>, AppError> {
        let mut jobs = sqlx::query_as::<_, QueueJob>(
            r#"
            UPDATE queue_jobs
            SET locked_until = ?
            WHERE id IN (
                SELECT id FROM queue_jobs
                WHERE queue = ? AND run_at <= ?
                  AND (locked_until IS NULL OR locked_until <= ?)
                ORDER BY run_at, id
                LIMIT ?
            )
            RETURNING *
            "#,
        )
        .bind(now_ms.saturating_add(lease_ms))
        .bind(queue)
        .bind(now_ms)
        .bind(now_ms)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        jobs.sort_by_key(|job| (job.run_at, job.id));
        Ok(jobs)
    }

    /// Delete finished jobs and store their retries in one transaction.
    pub async fn settle_queue_jobs(
        &self,
        finished: &[i64],
        retries: &[NewQueueJob],
    ) -> Result<(), AppError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        for id in finished {
            sqlx::query("DELETE FROM queue_jobs WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        for job in retries {
            sqlx::query(
                r#"
                INSERT INTO queue_jobs (queue, payload, attempt, run_at, created_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&job.queue)
            .bind(&job.payload)
            .bind(job.attempt)
            .bind(job.run_at)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Free every lease on `queue`. Used at startup, when no worker of this
    /// process holds a job yet.
    pub async fn release_queue_jobs(&self, queue: &str) -> Result<u64, AppError> {
        let result = sqlx::query(
            "UPDATE queue_jobs SET locked_until = NULL WHERE queue = ? AND locked_until IS NOT NULL",
        )
        .bind(queue)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Earliest time an unleased job of `queue` becomes due.
    pub async fn next_queue_job_at(&self, queue: &str) -> Result<Option<i64>, AppError> {
        let next: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(run_at) FROM queue_jobs WHERE queue = ? AND locked_until IS NULL",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;

        Ok(next)
    }

    pub async fn count_queue_jobs(&self, queue: &str) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_jobs WHERE queue = ?")
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

/// Rows are validated on the way out as well as on the way in.
fn checked(host: FederationHost) -> Result<FederationHost, AppError> {
    is_valid(&host)?;
    Ok(host)
}
