//! User management: creation, plan upgrades, admission checks, settings.

use chrono::{Duration, Utc};
use rusqlite::params;
use std::str::FromStr;

use super::{parse_ts, parse_ts_opt, ts, OptionalExt, SqliteStore};
use crate::types::{Admission, StoreError, User, UserId, UserPlan, UserProfile, UserSettings};

const USER_COLUMNS: &str = "id, external_id, display_name, plan, daily_task_limit, \
     concurrent_task_limit, daily_tasks_created, last_daily_reset, plan_expires_at, \
     is_active, is_banned, ban_reason, created_at, updated_at";

impl SqliteStore {
    /// Fetch a user by external chat-service id, creating a free-plan user on
    /// first contact. Display fields are upserted without touching counters.
    pub async fn get_or_create_user(
        &self,
        external_id: &str,
        profile: &UserProfile,
    ) -> Result<User, StoreError> {
        let now = ts(Utc::now());
        let conn = self.conn.lock().await;

        let existing = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM user WHERE external_id = ?1"),
                params![external_id],
                row_to_user,
            )
            .optional()?;

        match existing {
            Some(user) => {
                let user = user?;
                if let Some(ref name) = profile.display_name {
                    if user.display_name.as_deref() != Some(name.as_str()) {
                        conn.execute(
                            "UPDATE user SET display_name = ?1, updated_at = ?2 WHERE id = ?3",
                            params![name, now, user.id],
                        )?;
                        return Ok(User {
                            display_name: Some(name.clone()),
                            ..user
                        });
                    }
                }
                Ok(user)
            }
            None => {
                let plan = UserPlan::Free;
                conn.execute(
                    "INSERT INTO user (external_id, display_name, plan, daily_task_limit,
                         concurrent_task_limit, daily_tasks_created, last_daily_reset,
                         is_active, is_banned, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, 1, 0, ?6, ?6)",
                    params![
                        external_id,
                        profile.display_name,
                        plan.as_str(),
                        plan.daily_task_limit(),
                        plan.concurrent_task_limit(),
                        now,
                    ],
                )?;
                let id = conn.last_insert_rowid();
                tracing::info!("Created user {} for external id {}", id, external_id);
                conn.query_row(
                    &format!("SELECT {USER_COLUMNS} FROM user WHERE id = ?1"),
                    params![id],
                    row_to_user,
                )?
            }
        }
    }

    pub async fn get_user(&self, user_id: UserId) -> Result<Option<User>, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM user WHERE id = ?1"),
                params![user_id],
                row_to_user,
            )
            .optional()?;
        row.transpose()
    }

    pub async fn get_user_by_external(
        &self,
        external_id: &str,
    ) -> Result<Option<User>, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM user WHERE external_id = ?1"),
                params![external_id],
                row_to_user,
            )
            .optional()?;
        row.transpose()
    }

    /// Change a user's plan and adjust limits. Returns false when the user
    /// does not exist.
    pub async fn upgrade_plan(
        &self,
        external_id: &str,
        plan: UserPlan,
        expires_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "UPDATE user SET plan = ?1, daily_task_limit = ?2, concurrent_task_limit = ?3,
                 plan_expires_at = ?4, updated_at = ?5
             WHERE external_id = ?6",
            params![
                plan.as_str(),
                plan.daily_task_limit(),
                plan.concurrent_task_limit(),
                expires_at.map(ts),
                ts(Utc::now()),
                external_id,
            ],
        )?;
        Ok(rows > 0)
    }

    /// Admission check run before any task is created. Applies, in order:
    /// banned → deactivated → plan-expired → lazy daily-counter reset →
    /// daily quota → concurrent quota. Denials leave no state behind.
    pub async fn check_admission(&self, user_id: UserId) -> Result<Admission, StoreError> {
        let now = Utc::now();
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let user = tx
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM user WHERE id = ?1"),
                params![user_id],
                row_to_user,
            )
            .optional()?
            .ok_or(StoreError::NotFound("user", user_id))??;

        if user.is_banned {
            let reason = user
                .ban_reason
                .unwrap_or_else(|| "Violation of terms".to_string());
            return Ok(Admission::Denied(format!("Account banned: {reason}")));
        }
        if !user.is_active {
            return Ok(Admission::Denied("Account deactivated".to_string()));
        }
        if user.plan == UserPlan::Premium {
            if let Some(expires) = user.plan_expires_at {
                if now > expires {
                    return Ok(Admission::Denied("Premium plan expired".to_string()));
                }
            }
        }

        // Lazy reset: zero the daily counter once a wall-clock day elapsed.
        let mut daily_created = user.daily_tasks_created;
        if now - user.last_daily_reset >= Duration::days(1) {
            tx.execute(
                "UPDATE user SET daily_tasks_created = 0, last_daily_reset = ?1,
                     updated_at = ?1
                 WHERE id = ?2",
                params![ts(now), user_id],
            )?;
            daily_created = 0;
        }

        if daily_created >= user.daily_task_limit {
            tx.commit()?;
            return Ok(Admission::Denied(format!(
                "Daily task limit reached ({})",
                user.daily_task_limit
            )));
        }

        let active_tasks: u32 = tx.query_row(
            "SELECT COUNT(*) FROM user_task
             WHERE user_id = ?1 AND status IN ('queued', 'processing')",
            params![user_id],
            |row| row.get(0),
        )?;
        if active_tasks >= user.concurrent_task_limit {
            tx.commit()?;
            return Ok(Admission::Denied(format!(
                "Concurrent task limit reached ({})",
                user.concurrent_task_limit
            )));
        }

        tx.commit()?;
        Ok(Admission::Granted)
    }

    /// Per-user preferences, with defaults when no row exists.
    pub async fn get_user_settings(&self, external_id: &str) -> Result<UserSettings, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT user_external_id, min_relevance, instant_notification_threshold,
                        group_chat_id, monitoring_enabled
                 FROM user_settings WHERE user_external_id = ?1",
                params![external_id],
                |row| {
                    Ok(UserSettings {
                        user_external_id: row.get(0)?,
                        min_relevance: row.get(1)?,
                        instant_notification_threshold: row.get(2)?,
                        group_chat_id: row.get(3)?,
                        monitoring_enabled: row.get::<_, i32>(4)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(row.unwrap_or_else(|| UserSettings::defaults_for(external_id)))
    }

    pub async fn save_user_settings(&self, settings: &UserSettings) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO user_settings
                 (user_external_id, min_relevance, instant_notification_threshold,
                  group_chat_id, monitoring_enabled)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_external_id) DO UPDATE SET
                 min_relevance = excluded.min_relevance,
                 instant_notification_threshold = excluded.instant_notification_threshold,
                 group_chat_id = excluded.group_chat_id,
                 monitoring_enabled = excluded.monitoring_enabled",
            params![
                settings.user_external_id,
                settings.min_relevance,
                settings.instant_notification_threshold,
                settings.group_chat_id,
                settings.monitoring_enabled as i32,
            ],
        )?;
        Ok(())
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<User, StoreError>> {
    let id: i64 = row.get(0)?;
    let external_id: String = row.get(1)?;
    let display_name: Option<String> = row.get(2)?;
    let plan_str: String = row.get(3)?;
    let daily_task_limit: u32 = row.get(4)?;
    let concurrent_task_limit: u32 = row.get(5)?;
    let daily_tasks_created: u32 = row.get(6)?;
    let last_reset_str: String = row.get(7)?;
    let expires_str: Option<String> = row.get(8)?;
    let is_active: i32 = row.get(9)?;
    let is_banned: i32 = row.get(10)?;
    let ban_reason: Option<String> = row.get(11)?;
    let created_str: String = row.get(12)?;
    let updated_str: String = row.get(13)?;

    Ok((|| -> Result<User, StoreError> {
        Ok(User {
            id,
            external_id,
            display_name,
            plan: UserPlan::from_str(&plan_str).map_err(StoreError::Serialization)?,
            daily_task_limit,
            concurrent_task_limit,
            daily_tasks_created,
            last_daily_reset: parse_ts(&last_reset_str)?,
            plan_expires_at: parse_ts_opt(expires_str)?,
            is_active: is_active != 0,
            is_banned: is_banned != 0,
            ban_reason,
            created_at: parse_ts(&created_str)?,
            updated_at: parse_ts(&updated_str)?,
        })
    })())
}
