use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::schema::Year;

/// Name of the published origin-destination archive for `year`.
pub fn file_name(year: Year) -> String {
    format!("date-hour-soo-dest-{year}.csv.gz")
}

/// Supplies the gzip-compressed ridership archive for a year.
#[async_trait]
pub trait RidershipSource: Send + Sync {
    async fn fetch(&self, year: Year) -> Result<Bytes>;
}

/// Downloads archives from `<base_url>/date-hour-soo-dest-<year>.csv.gz`.
pub struct HttpSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| PipelineError::Fetch {
                url: base_url.clone(),
                source,
            })?;
        Ok(Self { client, base_url })
    }

    pub fn url_for(&self, year: Year) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), file_name(year))
    }
}

#[async_trait]
impl RidershipSource for HttpSource {
    async fn fetch(&self, year: Year) -> Result<Bytes> {
        let url = self.url_for(year);
        info!(%year, %url, "Fetching ridership archive");

        let fetch_err = |source: reqwest::Error| PipelineError::Fetch {
            url: url.clone(),
            source,
        };

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(fetch_err)?;
        let body = response.bytes().await.map_err(fetch_err)?;

        info!(%year, bytes = body.len(), "Fetched ridership archive");
        Ok(body)
    }
}

/// Reads archives that were downloaded ahead of time into one directory,
/// using the same file names as the upstream server.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, year: Year) -> PathBuf {
        self.root.join(file_name(year))
    }
}

#[async_trait]
impl RidershipSource for DirectorySource {
    async fn fetch(&self, year: Year) -> Result<Bytes> {
        let path = self.path_for(year);
        info!(%year, path = %path.display(), "Reading ridership archive");
        let contents = tokio::fs::read(&path)
            .await
            .map_err(|source| PipelineError::SourceFile { path, source })?;
        Ok(Bytes::from(contents))
    }
}
