use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("blob key must not be empty"))]
    EmptyKey { stage: &'static str },
    #[snafu(display("blob store lock poisoned during {stage}"))]
    LockPoisoned { stage: &'static str },
    #[snafu(display("blob worker for {stage} panicked"))]
    WorkerPanicked { stage: &'static str },
    #[snafu(display("cannot prepare database directory {path}"))]
    PrepareDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("invalid database location '{database_url}'"))]
    ParseLocation {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("cannot open blob database '{database_url}'"))]
    OpenDatabase {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("cannot apply '{pragma}' to blob database"))]
    ApplyPragma {
        stage: &'static str,
        pragma: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("blob schema migration failed"))]
    MigrateSchema {
        stage: &'static str,
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("blob '{key}' could not be {action}: {source}"))]
    BlobQuery {
        stage: &'static str,
        key: String,
        action: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("cannot start blob worker"))]
    StartWorker {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;
