use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("unknown domain '{0}'")]
    UnknownDomain(String),
    #[error("domain '{0}' is already registered")]
    DuplicateDomain(String),
    #[error("scheduler is already running")]
    AlreadyRunning,
    #[error("scheduler is missing its {0}")]
    Missing(&'static str),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to read config {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
    #[error("store error: {0}")]
    Store(#[from] hso_store::StoreError),
    #[error("journal error: {0}")]
    Journal(#[from] hso_kernel::JournalError),
    #[error("scheduler task failed: {0}")]
    Task(String),
}
