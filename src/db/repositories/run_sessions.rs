use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::db::{
    connection::Database,
    helpers::{parse_datetime, parse_optional_datetime, to_u32},
    models::RunSessionRecord,
};

fn row_to_run_session(row: &Row) -> Result<RunSessionRecord> {
    let started_at: String = row.get("started_at")?;
    let finalized_at: Option<String> = row.get("finalized_at")?;
    let max_runs: i64 = row.get("max_runs")?;
    let runs_completed: i64 = row.get("runs_completed")?;

    Ok(RunSessionRecord {
        id: row.get("id")?,
        started_at: parse_datetime(&started_at, "started_at")?,
        finalized_at: parse_optional_datetime(finalized_at, "finalized_at")?,
        max_runs: to_u32(max_runs, "max_runs")?,
        runs_completed: to_u32(runs_completed, "runs_completed")?,
    })
}

impl Database {
    pub async fn insert_run_session(&self, session: &RunSessionRecord) -> Result<()> {
        let record = session.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO run_sessions (id, started_at, finalized_at, max_runs, runs_completed)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.id,
                    record.started_at.to_rfc3339(),
                    record.finalized_at.as_ref().map(|dt| dt.to_rfc3339()),
                    record.max_runs,
                    record.runs_completed,
                ],
            )
            .with_context(|| "failed to insert run session")?;
            Ok(())
        })
        .await
    }

    pub async fn finalize_run_session(
        &self,
        session_id: &str,
        finalized_at: DateTime<Utc>,
    ) -> Result<()> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE run_sessions SET finalized_at = ?1 WHERE id = ?2 AND finalized_at IS NULL",
                params![finalized_at.to_rfc3339(), session_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_run_session(&self, session_id: &str) -> Result<Option<RunSessionRecord>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, started_at, finalized_at, max_runs, runs_completed
                 FROM run_sessions WHERE id = ?1",
            )?;
            let session = stmt
                .query_row(params![session_id], |row| Ok(row_to_run_session(row)))
                .optional()?
                .transpose()?;
            Ok(session)
        })
        .await
    }

    pub async fn list_run_sessions(&self) -> Result<Vec<RunSessionRecord>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, started_at, finalized_at, max_runs, runs_completed
                 FROM run_sessions ORDER BY started_at DESC",
            )?;
            let mut rows = stmt.query([])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_run_session(row)?);
            }
            Ok(sessions)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn session(id: &str, started_at: DateTime<Utc>) -> RunSessionRecord {
        RunSessionRecord {
            id: id.into(),
            started_at,
            finalized_at: None,
            max_runs: 12,
            runs_completed: 0,
        }
    }

    #[tokio::test]
    async fn finalize_keeps_the_first_timestamp() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path().join("runs.sqlite3")).unwrap();
        let started = Utc::now();
        db.insert_run_session(&session("a", started)).await.unwrap();

        let first = started + Duration::seconds(30);
        db.finalize_run_session("a", first).await.unwrap();
        db.finalize_run_session("a", first + Duration::seconds(30))
            .await
            .unwrap();

        let stored = db.get_run_session("a").await.unwrap().unwrap();
        assert_eq!(stored.max_runs, 12);
        assert_eq!(
            stored.finalized_at.map(|dt| dt.timestamp()),
            Some(first.timestamp())
        );
        assert!(db.get_run_session("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sessions_list_newest_first() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path().join("runs.sqlite3")).unwrap();
        let now = Utc::now();
        db.insert_run_session(&session("old", now - Duration::minutes(5)))
            .await
            .unwrap();
        db.insert_run_session(&session("new", now)).await.unwrap();

        let ids: Vec<String> = db
            .list_run_sessions()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["new", "old"]);
    }
}
