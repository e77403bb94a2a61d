//! Image transports.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use visor_core::{defaults, Error, Result};

/// Fetches a remote image to a local file.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Download `url` into `dest`, creating parent directories as needed.
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()>;
}

/// HTTP(S) transport with a per-request timeout and a size cap.
pub struct HttpFetcher {
    client: reqwest::Client,
    max_bytes: u64,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_bytes: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("visor/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, max_bytes })
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
            max_bytes: defaults::DOWNLOAD_MAX_BYTES,
        }
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        let mut response = self.client.get(url).send().await?.error_for_status()?;
        if let Some(len) = response.content_length() {
            if len > self.max_bytes {
                return Err(Error::Request(format!(
                    "{} is {} bytes, over the {} byte limit",
                    url, len, self.max_bytes
                )));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            body.extend_from_slice(&chunk);
            if body.len() as u64 > self.max_bytes {
                return Err(Error::Request(format!(
                    "{} exceeded the {} byte limit",
                    url, self.max_bytes
                )));
            }
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &body).await?;
        debug!(url, bytes = body.len(), dest = %dest.display(), "Image fetched");
        Ok(())
    }
}
