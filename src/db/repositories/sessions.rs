use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use crate::{
    db::{
        helpers::{parse_datetime, parse_mode, parse_optional_datetime, parse_status, to_i64, to_u64},
        models::{SessionRecord, SessionStatus},
        Database,
    },
    scores::Scores,
};

const SESSION_COLUMNS: &str = "id, mode, user_id, status, started_at, stopped_at, duration_secs,
     attention, stability, smoothness, confidence, submitted, created_at, updated_at";

fn row_to_session(row: &Row) -> Result<SessionRecord> {
    let mode: String = row.get("mode")?;
    let status: String = row.get("status")?;
    let started_at: String = row.get("started_at")?;
    let stopped_at: Option<String> = row.get("stopped_at")?;
    let duration_secs: i64 = row.get("duration_secs")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    let attention: Option<f64> = row.get("attention")?;
    let stability: Option<f64> = row.get("stability")?;
    let smoothness: Option<f64> = row.get("smoothness")?;
    let confidence: Option<f64> = row.get("confidence")?;
    let scores = match (attention, stability, smoothness, confidence) {
        (Some(a), Some(b), Some(c), Some(d)) => Some(Scores::new(a, b, c, d)),
        _ => None,
    };

    Ok(SessionRecord {
        id: row.get("id")?,
        mode: parse_mode(&mode)?,
        user_id: row.get("user_id")?,
        status: parse_status(&status)?,
        started_at: parse_datetime(&started_at, "started_at")?,
        stopped_at: parse_optional_datetime(stopped_at, "stopped_at")?,
        duration_secs: to_u64(duration_secs, "duration_secs")?,
        scores,
        submitted: row.get::<_, i64>("submitted")? != 0,
        created_at: parse_datetime(&created_at, "created_at")?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
    })
}

impl Database {
    pub async fn insert_session(&self, session: &SessionRecord) -> Result<()> {
        let record = session.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO sessions (id, mode, user_id, status, started_at, stopped_at, duration_secs, submitted, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.id,
                    record.mode.as_str(),
                    record.user_id,
                    record.status.as_str(),
                    record.started_at.to_rfc3339(),
                    record.stopped_at.as_ref().map(|dt| dt.to_rfc3339()),
                    to_i64(record.duration_secs)?,
                    record.submitted as i64,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .with_context(|| "failed to insert session")?;
            Ok(())
        })
        .await
    }

    /// Record the final report outcome.
    pub async fn mark_session_completed(
        &self,
        session_id: &str,
        user_id: &str,
        duration_secs: u64,
        scores: Scores,
        submitted: bool,
        stopped_at: DateTime<Utc>,
    ) -> Result<()> {
        let session_id = session_id.to_string();
        let user_id = user_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE sessions
                 SET status = ?1,
                     user_id = ?2,
                     duration_secs = ?3,
                     attention = ?4,
                     stability = ?5,
                     smoothness = ?6,
                     confidence = ?7,
                     submitted = ?8,
                     stopped_at = ?9,
                     updated_at = ?9
                 WHERE id = ?10",
                params![
                    SessionStatus::Completed.as_str(),
                    user_id,
                    to_i64(duration_secs)?,
                    scores.attention,
                    scores.stability,
                    scores.smoothness,
                    scores.confidence,
                    submitted as i64,
                    stopped_at.to_rfc3339(),
                    session_id,
                ],
            )
            .with_context(|| "failed to mark session completed")?;
            Ok(())
        })
        .await
    }

    /// Close a session that never produced a final report. A session already
    /// completed is left untouched.
    pub async fn mark_session_ended(
        &self,
        session_id: &str,
        duration_secs: u64,
        stopped_at: DateTime<Utc>,
    ) -> Result<bool> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE sessions
                     SET status = ?1,
                         duration_secs = ?2,
                         stopped_at = ?3,
                         updated_at = ?3
                     WHERE id = ?4 AND status = ?5",
                    params![
                        SessionStatus::Ended.as_str(),
                        to_i64(duration_secs)?,
                        stopped_at.to_rfc3339(),
                        session_id,
                        SessionStatus::Running.as_str(),
                    ],
                )
                .with_context(|| "failed to mark session ended")?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn mark_session_interrupted(
        &self,
        session_id: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE sessions
                 SET status = ?1,
                     updated_at = ?2
                 WHERE id = ?3",
                params![
                    SessionStatus::Interrupted.as_str(),
                    updated_at.to_rfc3339(),
                    session_id,
                ],
            )
            .with_context(|| "failed to mark session interrupted")?;
            Ok(())
        })
        .await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![session_id])?;
            let record = match rows.next()? {
                Some(row) => Some(row_to_session(row)?),
                None => None,
            };
            Ok(record)
        })
        .await
    }

    /// Most recent sessions first.
    pub async fn list_sessions(&self, limit: u32) -> Result<Vec<SessionRecord>> {
        self.execute(move |conn| {
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY started_at DESC LIMIT ?1"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![limit])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }
            Ok(sessions)
        })
        .await
    }

    pub async fn get_incomplete_sessions(&self) -> Result<Vec<SessionRecord>> {
        self.execute(move |conn| {
            let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE status = ?1");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![SessionStatus::Running.as_str()])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }
            Ok(sessions)
        })
        .await
    }

    /// Mark sessions a previous process left running. Returns how many.
    pub async fn recover_interrupted_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        let incomplete = self.get_incomplete_sessions().await?;
        for session in &incomplete {
            log::warn!(
                "Recovered incomplete session {}; marking as Interrupted",
                session.id
            );
            self.mark_session_interrupted(&session.id, now).await?;
        }
        Ok(incomplete.len())
    }
}
