//! Sliding-window rate limiting per (user, action kind).

use chrono::Utc;
use rusqlite::params;

use super::{parse_ts, ts, OptionalExt, SqliteStore};
use crate::types::{ActionKind, RateDecision, StoreError, UserId};

const MINUTE_SECS: i64 = 60;
const HOUR_SECS: i64 = 3600;
const DAY_SECS: i64 = 86400;

impl SqliteStore {
    /// Check and (when allowed) record one action against the user's three
    /// sliding windows. A denied check writes nothing, so the counters are
    /// unchanged afterwards.
    pub async fn check_rate_limit(
        &self,
        user_id: UserId,
        action: ActionKind,
    ) -> Result<RateDecision, StoreError> {
        let limits = action.limits();
        let now = Utc::now();
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let record = tx
            .query_row(
                "SELECT count_per_minute, count_per_hour, count_per_day,
                        minute_reset_at, hour_reset_at, day_reset_at
                 FROM rate_limit_record
                 WHERE user_id = ?1 AND action_kind = ?2",
                params![user_id, action.as_str()],
                |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((minute, hour, day, minute_reset, hour_reset, day_reset)) = record else {
            // First action of this kind: create the record already counting it.
            tx.execute(
                "INSERT INTO rate_limit_record
                     (user_id, action_kind, count_per_minute, count_per_hour,
                      count_per_day, minute_reset_at, hour_reset_at, day_reset_at,
                      last_action_at)
                 VALUES (?1, ?2, 1, 1, 1, ?3, ?3, ?3, ?3)",
                params![user_id, action.as_str(), ts(now)],
            )?;
            tx.commit()?;
            return Ok(RateDecision::Allowed);
        };

        // Zero any window whose reset interval has elapsed.
        let (minute, minute_reset) = roll_window(minute, &minute_reset, MINUTE_SECS, now)?;
        let (hour, hour_reset) = roll_window(hour, &hour_reset, HOUR_SECS, now)?;
        let (day, day_reset) = roll_window(day, &day_reset, DAY_SECS, now)?;

        if minute >= limits.per_minute {
            return Ok(RateDecision::Limited(format!(
                "Rate limit exceeded: {} {} per minute",
                limits.per_minute,
                action.as_str()
            )));
        }
        if hour >= limits.per_hour {
            return Ok(RateDecision::Limited(format!(
                "Rate limit exceeded: {} {} per hour",
                limits.per_hour,
                action.as_str()
            )));
        }
        if day >= limits.per_day {
            return Ok(RateDecision::Limited(format!(
                "Rate limit exceeded: {} {} per day",
                limits.per_day,
                action.as_str()
            )));
        }

        // All windows pass: persist the rolls and increment the three
        // counters atomically.
        tx.execute(
            "UPDATE rate_limit_record
             SET count_per_minute = ?1, count_per_hour = ?2, count_per_day = ?3,
                 minute_reset_at = ?4, hour_reset_at = ?5, day_reset_at = ?6,
                 last_action_at = ?7
             WHERE user_id = ?8 AND action_kind = ?9",
            params![
                minute + 1,
                hour + 1,
                day + 1,
                minute_reset,
                hour_reset,
                day_reset,
                ts(now),
                user_id,
                action.as_str(),
            ],
        )?;
        tx.commit()?;
        Ok(RateDecision::Allowed)
    }
}

fn roll_window(
    count: u32,
    reset_at: &str,
    window_secs: i64,
    now: chrono::DateTime<Utc>,
) -> Result<(u32, String), StoreError> {
    let reset = parse_ts(reset_at)?;
    if (now - reset).num_seconds() >= window_secs {
        Ok((0, ts(now)))
    } else {
        Ok((count, reset_at.to_string()))
    }
}
