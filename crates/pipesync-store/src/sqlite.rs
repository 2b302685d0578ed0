use std::path::Path;
use std::sync::Mutex;

use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use pipesync_core::error::{PipesyncError, Result};
use pipesync_core::traits::{PipelineStore, ProjectLookup, RunStore};
use pipesync_core::types::{LabelSelector, Pipeline, Project, Run, FINISHED_LABEL};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS runs (
        namespace TEXT NOT NULL,
        name TEXT NOT NULL,
        resource_version INTEGER NOT NULL,
        finished TEXT NOT NULL DEFAULT 'false',
        doc TEXT NOT NULL,
        PRIMARY KEY (namespace, name)
    );

    CREATE INDEX IF NOT EXISTS idx_runs_finished ON runs(finished);

    CREATE TABLE IF NOT EXISTS pipelines (
        namespace TEXT NOT NULL,
        name TEXT NOT NULL,
        resource_version INTEGER NOT NULL,
        doc TEXT NOT NULL,
        PRIMARY KEY (namespace, name)
    );

    CREATE TABLE IF NOT EXISTS projects (
        cluster TEXT NOT NULL,
        name TEXT NOT NULL,
        display_name TEXT NOT NULL,
        PRIMARY KEY (cluster, name)
    );";

/// Records loaded into a store in one go (see [`SqliteStore::apply_seed`]).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub runs: Vec<Run>,
    #[serde(default)]
    pub pipelines: Vec<Pipeline>,
    #[serde(default)]
    pub projects: Vec<Project>,
}

/// SQLite-backed store for runs, pipelines, and projects.
///
/// Records are kept as JSON documents keyed by `(namespace, name)`. Updates
/// are compare-and-swap on `resource_version`: a writer holding an older
/// version gets `Conflict` and must re-read.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn db_err(e: impl std::fmt::Display) -> PipesyncError {
    PipesyncError::Database(e.to_string())
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| db_err(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(db_err)
    }

    /// Insert a new run at resource version 0. Fails if the run exists.
    pub fn create_run(&self, mut run: Run) -> Result<Run> {
        run.metadata.resource_version = 0;
        let doc = serde_json::to_string(&run)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO runs (namespace, name, resource_version, finished, doc)
             VALUES (?1, ?2, 0, ?3, ?4)",
            params![
                run.metadata.namespace,
                run.metadata.name,
                finished_label(&run),
                doc
            ],
        )
        .map_err(db_err)?;
        Ok(run)
    }

    /// Insert a new pipeline at resource version 0. Fails if it exists.
    pub fn create_pipeline(&self, mut pipeline: Pipeline) -> Result<Pipeline> {
        pipeline.metadata.resource_version = 0;
        let doc = serde_json::to_string(&pipeline)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO pipelines (namespace, name, resource_version, doc) VALUES (?1, ?2, 0, ?3)",
            params![pipeline.metadata.namespace, pipeline.metadata.name, doc],
        )
        .map_err(db_err)?;
        Ok(pipeline)
    }

    pub fn upsert_project(&self, project: &Project) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO projects (cluster, name, display_name) VALUES (?1, ?2, ?3)
             ON CONFLICT(cluster, name) DO UPDATE SET display_name = excluded.display_name",
            params![project.cluster, project.name, project.display_name],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Load a seed document. Runs and pipelines that already exist are skipped.
    ///
    /// Returns the number of records inserted.
    pub fn apply_seed(&self, seed: Seed) -> Result<usize> {
        let mut inserted = 0;
        for project in &seed.projects {
            self.upsert_project(project)?;
            inserted += 1;
        }
        for pipeline in seed.pipelines {
            if self.exists("pipelines", &pipeline.metadata.namespace, &pipeline.metadata.name)? {
                debug!(pipeline = %pipeline.metadata.id(), "Pipeline exists, skipping");
                continue;
            }
            self.create_pipeline(pipeline)?;
            inserted += 1;
        }
        for run in seed.runs {
            if self.exists("runs", &run.metadata.namespace, &run.metadata.name)? {
                debug!(run = %run.id(), "Run exists, skipping");
                continue;
            }
            self.create_run(run)?;
            inserted += 1;
        }
        Ok(inserted)
    }

    fn exists(&self, table: &str, namespace: &str, name: &str) -> Result<bool> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE namespace = ?1 AND name = ?2", table),
                params![namespace, name],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(found.is_some())
    }

    fn get_doc(&self, table: &str, namespace: &str, name: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT doc FROM {} WHERE namespace = ?1 AND name = ?2", table),
            params![namespace, name],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }

    fn list_runs(&self, selector: &LabelSelector) -> Result<Vec<Run>> {
        let conn = self.lock()?;
        // The finished label is mirrored into an indexed column; other labels
        // are matched on the decoded record.
        let docs = match selector.get(FINISHED_LABEL) {
            Some(finished) => {
                let mut stmt = conn
                    .prepare("SELECT doc FROM runs WHERE finished = ?1 ORDER BY namespace, name")
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![finished], |row| row.get::<_, String>(0))
                    .map_err(db_err)?;
                rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)?
            }
            None => {
                let mut stmt = conn
                    .prepare("SELECT doc FROM runs ORDER BY namespace, name")
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(db_err)?;
                rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)?
            }
        };
        drop(conn);

        let mut runs = Vec::new();
        for doc in docs {
            let run: Run = serde_json::from_str(&doc)?;
            if selector.matches(&run.metadata.labels) {
                runs.push(run);
            }
        }
        Ok(runs)
    }

    fn update_run(&self, mut run: Run) -> Result<Run> {
        let expected = run.metadata.resource_version;
        run.metadata.resource_version = expected + 1;
        let doc = serde_json::to_string(&run)?;

        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE runs SET doc = ?1, finished = ?2, resource_version = resource_version + 1
                 WHERE namespace = ?3 AND name = ?4 AND resource_version = ?5",
                params![
                    doc,
                    finished_label(&run),
                    run.metadata.namespace,
                    run.metadata.name,
                    expected as i64
                ],
            )
            .map_err(db_err)?;
        drop(conn);

        if changed == 0 {
            return Err(self.update_miss(
                "runs",
                "run",
                &run.metadata.namespace,
                &run.metadata.name,
                expected,
            ));
        }
        Ok(run)
    }

    fn update_pipeline(&self, mut pipeline: Pipeline) -> Result<Pipeline> {
        let expected = pipeline.metadata.resource_version;
        pipeline.metadata.resource_version = expected + 1;
        let doc = serde_json::to_string(&pipeline)?;

        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE pipelines SET doc = ?1, resource_version = resource_version + 1
                 WHERE namespace = ?2 AND name = ?3 AND resource_version = ?4",
                params![
                    doc,
                    pipeline.metadata.namespace,
                    pipeline.metadata.name,
                    expected as i64
                ],
            )
            .map_err(db_err)?;
        drop(conn);

        if changed == 0 {
            return Err(self.update_miss(
                "pipelines",
                "pipeline",
                &pipeline.metadata.namespace,
                &pipeline.metadata.name,
                expected,
            ));
        }
        Ok(pipeline)
    }

    /// Explain an update that matched no row: missing record or stale version.
    fn update_miss(
        &self,
        table: &str,
        kind: &'static str,
        namespace: &str,
        name: &str,
        expected: u64,
    ) -> PipesyncError {
        let id = format!("{}:{}", namespace, name);
        match self.exists(table, namespace, name) {
            Ok(true) => PipesyncError::Conflict { kind, id, expected },
            Ok(false) => PipesyncError::not_found(kind, id),
            Err(e) => e,
        }
    }
}

fn finished_label(run: &Run) -> &str {
    run.metadata
        .labels
        .get(FINISHED_LABEL)
        .map(String::as_str)
        .unwrap_or("false")
}

impl RunStore for SqliteStore {
    fn list<'a>(&'a self, selector: &'a LabelSelector) -> BoxFuture<'a, Result<Vec<Run>>> {
        Box::pin(async move { self.list_runs(selector) })
    }

    fn get<'a>(&'a self, namespace: &'a str, name: &'a str) -> BoxFuture<'a, Result<Run>> {
        Box::pin(async move {
            let doc = self
                .get_doc("runs", namespace, name)?
                .ok_or_else(|| PipesyncError::not_found("run", format!("{}:{}", namespace, name)))?;
            Ok(serde_json::from_str(&doc)?)
        })
    }

    fn update(&self, run: Run) -> BoxFuture<'_, Result<Run>> {
        Box::pin(async move { self.update_run(run) })
    }
}

impl PipelineStore for SqliteStore {
    fn get<'a>(&'a self, namespace: &'a str, name: &'a str) -> BoxFuture<'a, Result<Pipeline>> {
        Box::pin(async move {
            let doc = self.get_doc("pipelines", namespace, name)?.ok_or_else(|| {
                PipesyncError::not_found("pipeline", format!("{}:{}", namespace, name))
            })?;
            Ok(serde_json::from_str(&doc)?)
        })
    }

    fn update(&self, pipeline: Pipeline) -> BoxFuture<'_, Result<Pipeline>> {
        Box::pin(async move { self.update_pipeline(pipeline) })
    }
}

impl ProjectLookup for SqliteStore {
    fn get<'a>(&'a self, cluster: &'a str, name: &'a str) -> BoxFuture<'a, Result<Project>> {
        Box::pin(async move {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT cluster, name, display_name FROM projects WHERE cluster = ?1 AND name = ?2",
                params![cluster, name],
                |row| {
                    Ok(Project {
                        cluster: row.get(0)?,
                        name: row.get(1)?,
                        display_name: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| PipesyncError::not_found("project", format!("{}:{}", cluster, name)))
        })
    }
}
