// Where image bytes come from

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{ConsoleError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// An opened image transfer: an optional announced size and the body chunks.
pub struct ImageBody {
    pub total_bytes: Option<u64>,
    pub chunks: BoxStream<'static, Result<Vec<u8>>>,
}

pub trait ImageSource: Send + Sync {
    /// Where `filename` would be fetched from. Fails when the source cannot
    /// serve it at all, before any transfer is started.
    fn locate(&self, filename: &str) -> Result<String>;

    fn fetch<'a>(&'a self, filename: &'a str) -> BoxFuture<'a, Result<ImageBody>>;
}

/// HTTP mirror. The configured image is fetched from its full URL; other
/// filenames are resolved against the URL's directory.
pub struct HttpImageSource {
    client: reqwest::Client,
    image_url: Option<String>,
    image_filename: String,
    mirror_base: Option<String>,
}

impl HttpImageSource {
    pub fn new(
        image_url: Option<String>,
        image_filename: impl Into<String>,
        mirror_base: Option<String>,
    ) -> Self {
        // No overall timeout: image transfers are long, stalls are caught per chunk
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to configure HTTP client, using defaults: {}", e);
                reqwest::Client::new()
            });
        Self {
            client,
            image_url,
            image_filename: image_filename.into(),
            mirror_base,
        }
    }

    pub fn from_settings(settings: &crate::config::Settings) -> Self {
        Self::new(
            settings.image_url.clone(),
            settings.image_filename(),
            settings.mirror_base(),
        )
    }

    async fn open(&self, filename: &str) -> Result<ImageBody> {
        let url = self.locate(filename)?;
        debug!("Fetching {} from {}", filename, url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ConsoleError::Transfer(format!("Failed to fetch file: {}", e)))?;

        if !response.status().is_success() {
            return Err(ConsoleError::Transfer(format!(
                "Failed to download: HTTP {}",
                response.status()
            )));
        }

        let total_bytes = response.content_length();
        let chunks = response
            .bytes_stream()
            .map(|item| {
                item.map(|chunk| chunk.to_vec())
                    .map_err(|e| ConsoleError::Transfer(format!("Failed to download chunk: {}", e)))
            })
            .boxed();

        Ok(ImageBody {
            total_bytes,
            chunks,
        })
    }
}

impl ImageSource for HttpImageSource {
    fn locate(&self, filename: &str) -> Result<String> {
        if let Some(url) = self.image_url.as_ref().filter(|_| filename == self.image_filename) {
            return Ok(url.clone());
        }
        match &self.mirror_base {
            Some(base) => Ok(format!("{}/{}", base.trim_end_matches('/'), filename)),
            None => Err(ConsoleError::Config("Lineage OS URL not configured".to_string())),
        }
    }

    fn fetch<'a>(&'a self, filename: &'a str) -> BoxFuture<'a, Result<ImageBody>> {
        Box::pin(self.open(filename))
    }
}
