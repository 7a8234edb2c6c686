use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::PendingExport;
use crate::control::Phase;
use crate::db::{Database, RunExport, RunSessionRecord, SeriesExport};
use crate::vision::{lock_analyzer, SharedAnalyzer};

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info};

/// Runs exported under one identifier. Closed once `max_runs` exports are in.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunSession {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub max_runs: u32,
    pub run_counter: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    pub session_id: String,
    pub run_number: u32,
    pub compression_label: String,
    pub relaxation_label: String,
    pub compression_rows: usize,
    pub relaxation_rows: usize,
    /// Set on the export that completes the session.
    pub finalized: bool,
    /// Seconds between the first measurement of the run and its export.
    pub run_duration_secs: Option<f64>,
}

fn series_labels(run_number: u32, max_runs: u32) -> (String, String) {
    if max_runs <= 1 {
        ("Compression Data".to_string(), "Relaxation Data".to_string())
    } else {
        (
            format!("Compression Data Run {run_number}"),
            format!("Relaxation Data {run_number}"),
        )
    }
}

pub struct RunRecorder {
    db: Database,
    session: Mutex<Option<RunSession>>,
}

impl RunRecorder {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            session: Mutex::new(None),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn active_session(&self) -> Option<RunSession> {
        self.session.lock().await.clone()
    }

    /// Persists one run. Opens a session on the first export and finalizes
    /// it when the run counter reaches `max_runs`.
    pub async fn record(&self, pending: &PendingExport, max_runs: u32) -> Result<ExportSummary> {
        let mut guard = self.session.lock().await;
        let mut session = match guard.take() {
            Some(session) => session,
            None => self.open_session(max_runs.max(1)).await?,
        };

        let run_number = session.run_counter + 1;
        let (compression_label, relaxation_label) = series_labels(run_number, session.max_runs);
        let exported_at = Utc::now();

        let export = RunExport {
            session_id: session.id.clone(),
            run_number,
            exported_at,
            series: vec![
                SeriesExport {
                    label: compression_label.clone(),
                    phase: Phase::Compressing,
                    rows: pending.compression.rows().to_vec(),
                },
                SeriesExport {
                    label: relaxation_label.clone(),
                    phase: Phase::Relaxing,
                    rows: pending.relaxation.rows().to_vec(),
                },
            ],
        };

        if let Err(err) = self.db.insert_run_export(export).await {
            *guard = Some(session);
            return Err(err);
        }

        session.run_counter = run_number;
        let finalized = session.run_counter >= session.max_runs;
        if finalized {
            if let Err(err) = self.db.finalize_run_session(&session.id, exported_at).await {
                log_error!("Failed to finalize run session {}: {err}", session.id);
            }
        }

        let run_duration_secs = pending
            .first_measured_at
            .map(|first| (exported_at - first).num_milliseconds() as f64 / 1000.0);

        log_info!(
            "Exported run {}/{} of session {} ({} compressing, {} relaxing rows{})",
            run_number,
            session.max_runs,
            session.id,
            pending.compression.len(),
            pending.relaxation.len(),
            run_duration_secs
                .map(|secs| format!(", {secs:.1}s"))
                .unwrap_or_default()
        );

        let summary = ExportSummary {
            session_id: session.id.clone(),
            run_number,
            compression_label,
            relaxation_label,
            compression_rows: pending.compression.len(),
            relaxation_rows: pending.relaxation.len(),
            finalized,
            run_duration_secs,
        };

        if !finalized {
            *guard = Some(session);
        }
        Ok(summary)
    }

    /// Closes an open session early, e.g. when a study is cancelled.
    pub async fn finish_session(&self) -> Result<Option<RunSession>> {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.take() else {
            return Ok(None);
        };
        self.db.finalize_run_session(&session.id, Utc::now()).await?;
        log_info!(
            "Run session {} closed after {}/{} runs",
            session.id,
            session.run_counter,
            session.max_runs
        );
        Ok(Some(session))
    }

    async fn open_session(&self, max_runs: u32) -> Result<RunSession> {
        let session = RunSession {
            id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            max_runs,
            run_counter: 0,
        };
        self.db
            .insert_run_session(&RunSessionRecord {
                id: session.id.clone(),
                started_at: session.started_at,
                finalized_at: None,
                max_runs,
                runs_completed: 0,
            })
            .await?;
        Ok(session)
    }
}

/// Detaches the analyzer's series and records them. The run baseline is
/// reset only once the rows are stored; on failure the rows go back into
/// the analyzer and the baseline is left as it was.
pub async fn export_measurements(
    analyzer: &SharedAnalyzer,
    recorder: &RunRecorder,
    max_runs: u32,
) -> Result<ExportSummary> {
    let pending = lock_analyzer(analyzer).store_mut().take_pending();

    match recorder.record(&pending, max_runs).await {
        Ok(summary) => {
            lock_analyzer(analyzer).store_mut().complete_export();
            Ok(summary)
        }
        Err(err) => {
            log_error!("Run export failed, keeping measurements: {err}");
            lock_analyzer(analyzer).store_mut().restore(pending);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::VisionSettings;
    use crate::vision::{AxisMeasurement, DropletAnalyzer};
    use tempfile::TempDir;

    fn row() -> AxisMeasurement {
        AxisMeasurement {
            semi_major: 20.0,
            semi_minor: 16.0,
            aspect_ratio: Some(0.8),
            height_above_reference: 100.0,
            height_relative_to_frame: 50.0,
            height_relative_to_run_start: 0.0,
        }
    }

    fn analyzer_with_rows() -> SharedAnalyzer {
        let analyzer = DropletAnalyzer::new(&VisionSettings::default())
            .unwrap()
            .shared();
        {
            let mut guard = lock_analyzer(&analyzer);
            let store = guard.store_mut();
            store.set_baseline(100.0);
            store.append(Phase::Compressing, row());
            store.append(Phase::Relaxing, row());
        }
        analyzer
    }

    #[test]
    fn single_and_multi_run_labels() {
        assert_eq!(
            series_labels(1, 1),
            ("Compression Data".to_string(), "Relaxation Data".to_string())
        );
        assert_eq!(
            series_labels(3, 12),
            (
                "Compression Data Run 3".to_string(),
                "Relaxation Data 3".to_string()
            )
        );
    }

    #[tokio::test]
    async fn export_clears_series_and_baseline() {
        let dir = TempDir::new().unwrap();
        let recorder = RunRecorder::new(Database::open(dir.path().join("runs.sqlite3")).unwrap());
        let analyzer = analyzer_with_rows();

        let summary = export_measurements(&analyzer, &recorder, 1).await.unwrap();

        assert_eq!(summary.run_number, 1);
        assert_eq!(summary.compression_rows, 1);
        assert!(summary.finalized);
        let guard = lock_analyzer(&analyzer);
        assert!(guard.store().is_empty());
        assert_eq!(guard.store().baseline(), None);
        drop(guard);
        assert!(recorder.active_session().await.is_none());

        let stored = recorder
            .database()
            .get_series_for_session(&summary.session_id)
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn multi_run_session_counts_up_and_finalizes() {
        let dir = TempDir::new().unwrap();
        let recorder = RunRecorder::new(Database::open(dir.path().join("runs.sqlite3")).unwrap());
        let analyzer = analyzer_with_rows();

        let first = export_measurements(&analyzer, &recorder, 3).await.unwrap();
        let second = export_measurements(&analyzer, &recorder, 3).await.unwrap();
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(second.run_number, 2);
        assert_eq!(second.compression_label, "Compression Data Run 2");
        assert!(!second.finalized);

        let third = export_measurements(&analyzer, &recorder, 3).await.unwrap();
        assert!(third.finalized);

        let sessions = recorder.database().list_run_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].runs_completed, 3);
        assert!(sessions[0].finalized_at.is_some());
    }

    #[tokio::test]
    async fn failed_export_keeps_rows_and_baseline() {
        let dir = TempDir::new().unwrap();
        let recorder = RunRecorder::new(Database::open(dir.path().join("runs.sqlite3")).unwrap());
        recorder
            .database()
            .execute(|conn| {
                conn.execute_batch("DROP TABLE measurements")?;
                Ok(())
            })
            .await
            .unwrap();
        let analyzer = analyzer_with_rows();
        let started = lock_analyzer(&analyzer).store().first_measured_at();

        assert!(export_measurements(&analyzer, &recorder, 1).await.is_err());

        let guard = lock_analyzer(&analyzer);
        let store = guard.store();
        assert_eq!(store.len(), 2);
        assert_eq!(store.baseline(), Some(100.0));
        assert_eq!(store.first_measured_at(), started);
        assert!(store
            .series(Phase::Compressing)
            .rows()
            .iter()
            .all(|r| r.height_relative_to_run_start == r.height_above_reference - 100.0));
    }

    #[tokio::test]
    async fn finishing_early_closes_the_session() {
        let dir = TempDir::new().unwrap();
        let recorder = RunRecorder::new(Database::open(dir.path().join("runs.sqlite3")).unwrap());
        let analyzer = analyzer_with_rows();

        export_measurements(&analyzer, &recorder, 12).await.unwrap();
        let closed = recorder.finish_session().await.unwrap().unwrap();
        assert_eq!(closed.run_counter, 1);
        assert!(recorder.finish_session().await.unwrap().is_none());
    }
}
