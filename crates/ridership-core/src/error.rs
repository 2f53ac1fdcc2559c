// crates/ridership-core/src/error.rs

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Coarse classification of a [`PipelineError`], used in run reports and
/// event payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Fetch,
    Decompression,
    Load,
    Transform,
    Refresh,
    Usage,
    Database,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to read source file {}: {source}", path.display())]
    SourceFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ridership archive for {year} could not be decompressed: {source}")]
    Decompression {
        year: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("ridership file for {year} line {line} is malformed: {message}")]
    MalformedRow {
        year: i32,
        line: u64,
        message: String,
    },

    #[error("bulk load of staging partition for {year} failed: {source}")]
    Load {
        year: i32,
        #[source]
        source: sqlx::Error,
    },

    #[error("fact transform for {year} failed: {source}")]
    Transform {
        year: i32,
        #[source]
        source: sqlx::Error,
    },

    #[error("refresh of aggregate {view} failed: {source}")]
    Refresh {
        view: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("publishing refreshed aggregates failed: {source}")]
    Publish {
        #[source]
        source: sqlx::Error,
    },

    #[error("invalid aggregate catalog: {0}")]
    InvalidCatalog(String),

    #[error("year {0} is outside the supported range 1900..=9999")]
    InvalidYear(i32),

    #[error("start year {start} is after end year {end}")]
    InvalidYearRange { start: i32, end: i32 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("Database query failed: {0}")]
    Database(#[from] sqlx::Error),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Fetch { .. } | PipelineError::SourceFile { .. } => ErrorKind::Fetch,
            PipelineError::Decompression { .. } => ErrorKind::Decompression,
            PipelineError::MalformedRow { .. } | PipelineError::Load { .. } => ErrorKind::Load,
            PipelineError::Transform { .. } => ErrorKind::Transform,
            PipelineError::Refresh { .. }
            | PipelineError::Publish { .. }
            | PipelineError::InvalidCatalog(_) => ErrorKind::Refresh,
            PipelineError::InvalidYear(_)
            | PipelineError::InvalidYearRange { .. }
            | PipelineError::Config(_) => ErrorKind::Usage,
            PipelineError::Database(_) => ErrorKind::Database,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
