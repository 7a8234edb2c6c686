use anyhow::{Context, Result};
use rusqlite::{params, Connection, Row};

use crate::db::{
    connection::Database,
    helpers::{parse_datetime, parse_phase, to_i64, to_u32, to_u64},
    models::{RunExport, SeriesRecord},
};
use crate::vision::AxisMeasurement;

fn row_to_series(row: &Row) -> Result<SeriesRecord> {
    let run_number: i64 = row.get("run_number")?;
    let phase: String = row.get("phase")?;
    let exported_at: String = row.get("exported_at")?;
    let measurement_count: i64 = row.get("measurement_count")?;

    Ok(SeriesRecord {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        run_number: to_u32(run_number, "run_number")?,
        label: row.get("label")?,
        phase: parse_phase(&phase)?,
        exported_at: parse_datetime(&exported_at, "exported_at")?,
        measurement_count: to_u64(measurement_count, "measurement_count")?,
    })
}

fn row_to_measurement(row: &Row) -> Result<AxisMeasurement> {
    Ok(AxisMeasurement {
        semi_major: row.get("semi_major")?,
        semi_minor: row.get("semi_minor")?,
        aspect_ratio: row.get("aspect_ratio")?,
        height_above_reference: row.get("height_above_reference")?,
        height_relative_to_frame: row.get("height_relative_to_frame")?,
        height_relative_to_run_start: row.get("height_relative_to_run_start")?,
    })
}

/// Writes every series of one run and bumps the session's run count.
/// Nothing is stored if any insert fails.
pub(crate) fn store_run_export(conn: &mut Connection, export: &RunExport) -> Result<Vec<i64>> {
    let tx = conn.transaction()?;
    let mut series_ids = Vec::with_capacity(export.series.len());

    for series in &export.series {
        tx.execute(
            "INSERT INTO series (session_id, run_number, label, phase, exported_at, measurement_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                export.session_id,
                export.run_number,
                series.label,
                series.phase.as_str(),
                export.exported_at.to_rfc3339(),
                to_i64(series.rows.len() as u64)?,
            ],
        )
        .with_context(|| format!("failed to insert series '{}'", series.label))?;
        let series_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare(
                "INSERT INTO measurements (series_id, seq, semi_major, semi_minor, aspect_ratio,
                     height_above_reference, height_relative_to_frame, height_relative_to_run_start)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for (seq, row) in series.rows.iter().enumerate() {
                stmt.execute(params![
                    series_id,
                    to_i64(seq as u64)?,
                    row.semi_major,
                    row.semi_minor,
                    row.aspect_ratio,
                    row.height_above_reference,
                    row.height_relative_to_frame,
                    row.height_relative_to_run_start,
                ])?;
            }
        }

        series_ids.push(series_id);
    }

    let updated = tx.execute(
        "UPDATE run_sessions SET runs_completed = ?1 WHERE id = ?2",
        params![export.run_number, export.session_id],
    )?;
    if updated == 0 {
        anyhow::bail!("run session {} does not exist", export.session_id);
    }

    tx.commit().context("failed to commit run export")?;
    Ok(series_ids)
}

impl Database {
    pub async fn get_series_for_session(&self, session_id: &str) -> Result<Vec<SeriesRecord>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, run_number, label, phase, exported_at, measurement_count
                 FROM series WHERE session_id = ?1 ORDER BY run_number ASC, id ASC",
            )?;
            let mut rows = stmt.query(params![session_id])?;
            let mut series = Vec::new();
            while let Some(row) = rows.next()? {
                series.push(row_to_series(row)?);
            }
            Ok(series)
        })
        .await
    }

    pub async fn get_measurements(&self, series_id: i64) -> Result<Vec<AxisMeasurement>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT semi_major, semi_minor, aspect_ratio, height_above_reference,
                        height_relative_to_frame, height_relative_to_run_start
                 FROM measurements WHERE series_id = ?1 ORDER BY seq ASC",
            )?;
            let mut rows = stmt.query(params![series_id])?;
            let mut measurements = Vec::new();
            while let Some(row) = rows.next()? {
                measurements.push(row_to_measurement(row)?);
            }
            Ok(measurements)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::Phase;
    use crate::db::models::{RunSessionRecord, SeriesExport};
    use chrono::Utc;
    use tempfile::TempDir;

    fn row(ratio: Option<f64>, height: f64) -> AxisMeasurement {
        AxisMeasurement {
            semi_major: 20.0,
            semi_minor: 15.0,
            aspect_ratio: ratio,
            height_above_reference: height,
            height_relative_to_frame: 60.0,
            height_relative_to_run_start: 0.0,
        }
    }

    async fn database_with_session(dir: &TempDir) -> (Database, RunSessionRecord) {
        let db = Database::open(dir.path().join("runs.sqlite3")).unwrap();
        let session = RunSessionRecord {
            id: "session-1".into(),
            started_at: Utc::now(),
            finalized_at: None,
            max_runs: 1,
            runs_completed: 0,
        };
        db.insert_run_session(&session).await.unwrap();
        (db, session)
    }

    #[tokio::test]
    async fn run_export_round_trips_rows_in_order() {
        let dir = TempDir::new().unwrap();
        let (db, session) = database_with_session(&dir).await;

        let ids = db
            .insert_run_export(RunExport {
                session_id: session.id.clone(),
                run_number: 1,
                exported_at: Utc::now(),
                series: vec![
                    SeriesExport {
                        label: "Compression Data".into(),
                        phase: Phase::Compressing,
                        rows: vec![row(Some(0.75), 10.0), row(None, 11.0)],
                    },
                    SeriesExport {
                        label: "Relaxation Data".into(),
                        phase: Phase::Relaxing,
                        rows: vec![],
                    },
                ],
            })
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);

        let series = db.get_series_for_session(&session.id).await.unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].phase, Phase::Compressing);
        assert_eq!(series[0].measurement_count, 2);
        assert_eq!(series[1].measurement_count, 0);

        let rows = db.get_measurements(series[0].id).await.unwrap();
        assert_eq!(rows[0].height_above_reference, 10.0);
        assert_eq!(rows[1].aspect_ratio, None);

        let stored = db.get_run_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.runs_completed, 1);
    }

    #[tokio::test]
    async fn export_for_unknown_session_stores_nothing() {
        let dir = TempDir::new().unwrap();
        let (db, _) = database_with_session(&dir).await;

        let result = db
            .insert_run_export(RunExport {
                session_id: "missing".into(),
                run_number: 1,
                exported_at: Utc::now(),
                series: vec![SeriesExport {
                    label: "Compression Data".into(),
                    phase: Phase::Compressing,
                    rows: vec![row(Some(1.0), 1.0)],
                }],
            })
            .await;
        assert!(result.is_err());
        assert!(db.get_series_for_session("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finalize_is_recorded_once() {
        let dir = TempDir::new().unwrap();
        let (db, session) = database_with_session(&dir).await;

        let first = Utc::now();
        db.finalize_run_session(&session.id, first).await.unwrap();
        db.finalize_run_session(&session.id, Utc::now()).await.unwrap();

        let sessions = db.list_run_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(
            sessions[0].finalized_at.map(|t| t.timestamp_millis()),
            Some(first.timestamp_millis())
        );
    }
}
