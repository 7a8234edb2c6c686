//! The measurement database lives on one worker thread that owns the SQLite
//! connection. Run exports are a dedicated request so a run is always
//! written by a single transaction; reads travel as closures over the
//! connection.

use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use rusqlite::Connection;
use tokio::sync::oneshot;

use super::migrations::run_migrations;
use super::models::RunExport;
use super::repositories::store_run_export;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

const WORKER_THREAD: &str = "tensiometer-db";

type Query = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum Request {
    Query(Query),
    StoreRun {
        export: RunExport,
        reply: oneshot::Sender<Result<Vec<i64>>>,
    },
    Close,
}

struct Worker {
    requests: mpsc::Sender<Request>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Worker {
    fn drop(&mut self) {
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(handle) = handle else {
            return;
        };
        if self.requests.send(Request::Close).is_err() {
            log_warn!("database worker already gone at close");
        }
        if handle.join().is_err() {
            log_error!("database worker panicked");
        }
    }
}

/// Opens the file in WAL mode with foreign keys on and brings the schema up
/// to date.
fn open_connection(path: &Path) -> Result<Connection> {
    let mut conn = Connection::open(path)
        .with_context(|| format!("failed to open measurement database {}", path.display()))?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal")?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign keys")?;
    run_migrations(&mut conn).context("failed to run database migrations")?;
    Ok(conn)
}

fn serve(mut conn: Connection, requests: mpsc::Receiver<Request>) {
    while let Ok(request) = requests.recv() {
        match request {
            Request::Query(query) => query(&mut conn),
            Request::StoreRun { export, reply } => {
                let rows: usize = export.series.iter().map(|s| s.rows.len()).sum();
                let result = store_run_export(&mut conn, &export);
                if result.is_ok() {
                    log_debug!(
                        "stored run {} of session {} ({rows} rows)",
                        export.run_number,
                        export.session_id
                    );
                }
                if reply.send(result).is_err() {
                    log_warn!("run export finished after its caller went away");
                }
            }
            Request::Close => break,
        }
    }

    // Fold the WAL back so the file is complete for readers outside the bench.
    if let Err(err) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
        log_warn!("WAL checkpoint on close failed: {err}");
    }
    log_info!("measurement database closed");
}

/// Cloneable handle to the measurement database.
#[derive(Clone)]
pub struct Database {
    worker: Arc<Worker>,
    path: Arc<PathBuf>,
}

impl Database {
    /// Opens (creating if needed) the database at `path` and starts its
    /// worker. Returns once migrations have run.
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create data directory {}", dir.display()))?;
        }

        let (requests, inbox) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let thread_path = path.clone();

        let thread = thread::Builder::new()
            .name(WORKER_THREAD.into())
            .spawn(move || match open_connection(&thread_path) {
                Ok(conn) => {
                    if ready_tx.send(Ok(())).is_ok() {
                        serve(conn, inbox);
                    }
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                }
            })
            .context("failed to spawn database worker")?;

        ready_rx
            .recv()
            .context("database worker exited before it was ready")??;
        log_info!("measurement database ready at {}", path.display());

        Ok(Self {
            worker: Arc::new(Worker {
                requests,
                thread: Mutex::new(Some(thread)),
            }),
            path: Arc::new(path),
        })
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    fn submit(&self, request: Request) -> Result<()> {
        self.worker
            .requests
            .send(request)
            .map_err(|_| anyhow!("database worker is not running"))
    }

    /// Writes every series of one run and bumps the session's run count in
    /// one transaction. Nothing is stored if any insert fails.
    pub async fn insert_run_export(&self, export: RunExport) -> Result<Vec<i64>> {
        let (reply, response) = oneshot::channel();
        self.submit(Request::StoreRun { export, reply })?;
        response
            .await
            .map_err(|_| anyhow!("database worker dropped a run export"))?
    }

    /// Runs `query` on the worker's connection.
    pub async fn execute<F, T>(&self, query: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        self.submit(Request::Query(Box::new(move |conn| {
            if reply.send(query(conn)).is_err() {
                log_warn!("database query finished after its caller went away");
            }
        })))?;
        response
            .await
            .map_err(|_| anyhow!("database worker stopped before replying"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::Phase;
    use crate::db::{RunSessionRecord, SeriesExport};
    use chrono::Utc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn queries_and_exports_share_one_connection() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path().join("nested").join("runs.sqlite3")).unwrap();
        assert!(db.path().exists());

        db.insert_run_session(&RunSessionRecord {
            id: "s".into(),
            started_at: Utc::now(),
            finalized_at: None,
            max_runs: 1,
            runs_completed: 0,
        })
        .await
        .unwrap();
        let ids = db
            .insert_run_export(RunExport {
                session_id: "s".into(),
                run_number: 1,
                exported_at: Utc::now(),
                series: vec![SeriesExport {
                    label: "Compression Data".into(),
                    phase: Phase::Compressing,
                    rows: Vec::new(),
                }],
            })
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);

        let journal: String = db
            .execute(|conn| Ok(conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(journal.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn dropping_the_last_handle_leaves_a_readable_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runs.sqlite3");
        drop(Database::open(path.clone()).unwrap());

        let conn = Connection::open(&path).unwrap();
        let sessions: i64 = conn
            .query_row("SELECT COUNT(*) FROM run_sessions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(sessions, 0);
    }
}
