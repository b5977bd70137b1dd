use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use snafu::{ResultExt, ensure};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Connection, SqliteConnection};

use super::BlobStore;
use super::error::{
    ApplyPragmaSnafu, BlobQuerySnafu, EmptyKeySnafu, MigrateSchemaSnafu, OpenDatabaseSnafu,
    ParseLocationSnafu, PrepareDirectorySnafu, StartWorkerSnafu, StorageResult,
    WorkerPanickedSnafu,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Blob table in a single SQLite file.
///
/// The handle only remembers the URL. Every call opens its own connection on a
/// short-lived worker thread, so the synchronous [`BlobStore`] methods are safe
/// to call from inside a tokio runtime.
#[derive(Debug, Clone)]
pub struct SqliteBlobStore {
    database_url: String,
}

impl SqliteBlobStore {
    /// Creates the file (and its directory) when missing and brings the schema
    /// up to date.
    pub async fn open(location: &str) -> StorageResult<Self> {
        prepare_directory(location)?;
        let database_url = database_url_for(location);

        let options = SqliteConnectOptions::from_str(&database_url)
            .context(ParseLocationSnafu {
                stage: "blob-open-parse",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let bootstrap = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context(OpenDatabaseSnafu {
                stage: "blob-open-bootstrap",
                database_url: database_url.clone(),
            })?;

        sqlx::migrate!("./migrations")
            .run(&bootstrap)
            .await
            .context(MigrateSchemaSnafu {
                stage: "blob-open-migrate",
            })?;

        // The bootstrap pool belongs to the caller's runtime.
        bootstrap.close().await;

        tracing::info!(database_url = %database_url, "blob database ready");
        Ok(Self { database_url })
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    fn on_worker<T, F, Fut>(&self, stage: &'static str, work: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(SqliteConnection) -> Fut + Send + 'static,
        Fut: Future<Output = StorageResult<T>>,
    {
        let database_url = self.database_url.clone();
        let worker = std::thread::Builder::new()
            .name(format!("arbor-{stage}"))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context(StartWorkerSnafu { stage })?;
                runtime.block_on(async move {
                    let connection = connect(&database_url, stage).await?;
                    work(connection).await
                })
            })
            .context(StartWorkerSnafu { stage })?;

        worker
            .join()
            .unwrap_or_else(|_| WorkerPanickedSnafu { stage }.fail())
    }
}

impl BlobStore for SqliteBlobStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let key = key.to_string();
        self.on_worker("blob-get", move |mut connection| async move {
            sqlx::query_scalar::<_, String>("SELECT value FROM blobs WHERE key = ?")
                .bind(key.clone())
                .fetch_optional(&mut connection)
                .await
                .context(BlobQuerySnafu {
                    stage: "blob-get",
                    key,
                    action: "read",
                })
        })
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        ensure!(!key.is_empty(), EmptyKeySnafu { stage: "blob-set" });

        let key = key.to_string();
        let value = value.to_string();
        self.on_worker("blob-set", move |mut connection| async move {
            sqlx::query(
                "INSERT INTO blobs (key, value, updated_at) VALUES (?, ?, ?) \
                 ON CONFLICT(key) DO UPDATE \
                 SET value = excluded.value, updated_at = excluded.updated_at",
            )
            .bind(key.clone())
            .bind(value)
            .bind(now_seconds())
            .execute(&mut connection)
            .await
            .context(BlobQuerySnafu {
                stage: "blob-set",
                key,
                action: "written",
            })
            .map(|_| ())
        })
    }

    fn clear(&self, key: &str) -> StorageResult<()> {
        let key = key.to_string();
        self.on_worker("blob-clear", move |mut connection| async move {
            let removed = sqlx::query("DELETE FROM blobs WHERE key = ?")
                .bind(key.clone())
                .execute(&mut connection)
                .await
                .context(BlobQuerySnafu {
                    stage: "blob-clear",
                    key: key.clone(),
                    action: "deleted",
                })?
                .rows_affected();
            tracing::debug!(key = %key, removed, "cleared blob");
            Ok(())
        })
    }
}

async fn connect(database_url: &str, stage: &'static str) -> StorageResult<SqliteConnection> {
    let mut connection =
        SqliteConnection::connect(database_url)
            .await
            .context(OpenDatabaseSnafu {
                stage,
                database_url: database_url.to_string(),
            })?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(&mut connection)
        .await
        .context(ApplyPragmaSnafu {
            stage,
            pragma: "busy_timeout",
        })?;

    Ok(connection)
}

fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

fn prepare_directory(location: &str) -> StorageResult<()> {
    if location.starts_with("sqlite:") {
        return Ok(());
    }

    match Path::new(location).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent).context(PrepareDirectorySnafu {
                stage: "blob-open-directory",
                path: parent.display().to_string(),
            })
        }
        _ => Ok(()),
    }
}

fn database_url_for(location: &str) -> String {
    if location.starts_with("sqlite:") {
        location.to_string()
    } else {
        format!("sqlite://{location}")
    }
}
