use std::path::PathBuf;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tracing::debug;

use crate::{BridgeError, Result};

const USER_AGENT: &str = concat!("doux-bridge/", env!("CARGO_PKG_VERSION"));

/// Retrieves raw asset bytes by URL.
pub trait AssetFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<Vec<u8>>>;
}

/// Fetches `http://` and `https://` URLs.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| BridgeError::msg(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl AssetFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<Vec<u8>>> {
        let client = self.client.clone();
        let url = url.to_string();
        async move {
            let fetch_err = |reason: String| BridgeError::Fetch {
                url: url.clone(),
                reason,
            };
            let response = client
                .get(&url)
                .send()
                .await
                .map_err(|e| fetch_err(e.to_string()))?;
            if !response.status().is_success() {
                return Err(fetch_err(format!("HTTP {}", response.status())));
            }
            let bytes = response.bytes().await.map_err(|e| fetch_err(e.to_string()))?;
            debug!(%url, bytes = bytes.len(), "fetched asset");
            Ok(bytes.to_vec())
        }
        .boxed()
    }
}

/// Reads `file://` URLs and plain filesystem paths.
#[derive(Debug, Clone, Default)]
pub struct FileFetcher;

impl AssetFetcher for FileFetcher {
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<Vec<u8>>> {
        let url = url.to_string();
        let path = PathBuf::from(url.strip_prefix("file://").unwrap_or(&url));
        async move {
            tokio::fs::read(&path).await.map_err(|e| BridgeError::Fetch {
                url,
                reason: e.to_string(),
            })
        }
        .boxed()
    }
}

/// Dispatches on the URL scheme: HTTP(S) over the network, everything else
/// from the local filesystem.
#[derive(Debug, Clone)]
pub struct DefaultFetcher {
    http: HttpFetcher,
    file: FileFetcher,
}

impl DefaultFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(timeout)?,
            file: FileFetcher,
        })
    }
}

impl AssetFetcher for DefaultFetcher {
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<Vec<u8>>> {
        if url.starts_with("http://") || url.starts_with("https://") {
            self.http.fetch(url)
        } else {
            self.file.fetch(url)
        }
    }
}
