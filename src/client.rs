// reqwest client for a running console

use futures_util::future::BoxFuture;
use reqwest::{Client, Method, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::api::{
    DeleteResponse, DevicesResponse, DownloadRequest, DownloadResponse, ErrorBody,
    HistoryResponse, ImagesResponse, OsCheckResponse, ProgressResponse,
};
use crate::error::{ConsoleError, Result};
use crate::models::{Device, DownloadTask, FlashSession, OsImage};
use crate::poller::ConsoleApi;

#[derive(Debug, Clone)]
pub struct HttpConsoleClient {
    client: Client,
    base_url: String,
    base: Url,
}

impl HttpConsoleClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ConsoleError::Api(format!("Failed to build HTTP client: {}", e)))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let base = Url::parse(&base_url)
            .map_err(|e| ConsoleError::Validation(format!("Invalid console URL {base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(ConsoleError::Validation(format!("Invalid console URL {base_url}")));
        }
        Ok(Self {
            client,
            base_url,
            base,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `segments` are percent-encoded, so ids and filenames go through as
    /// single path components.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        self.client.request(method, self.endpoint(segments))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request
            .send()
            .await
            .map_err(|e| ConsoleError::Api(format!("Request failed: {}", e)))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ConsoleError::Api(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            let detail = serde_json::from_slice::<ErrorBody>(&bytes)
                .map(|body| body.detail)
                .unwrap_or_else(|_| format!("HTTP {}", status));
            debug!("Console answered {}: {}", status, detail);
            return Err(ConsoleError::from_status(status.as_u16(), detail));
        }

        serde_json::from_slice(&bytes)
            .map_err(|e| ConsoleError::Api(format!("Unexpected response body: {}", e)))
    }

    pub async fn devices(&self) -> Result<DevicesResponse> {
        self.send(self.request(Method::GET, &["api", "devices"])).await
    }

    /// `None` when the device has no session.
    pub async fn flash_status(&self, device_id: &str) -> Result<Option<FlashSession>> {
        let value: serde_json::Value = self
            .send(self.request(Method::GET, &["api", "devices", device_id, "flash", "status"]))
            .await?;
        if value.get("state").and_then(|s| s.as_str()) == Some("idle") {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| ConsoleError::Api(format!("Unexpected session body: {}", e)))
    }

    pub async fn prepare(&self, device_id: &str) -> Result<FlashSession> {
        self.send(self.request(Method::POST, &["api", "devices", device_id, "flash", "prepare"]))
            .await
    }

    pub async fn confirm(&self, device_id: &str) -> Result<FlashSession> {
        self.send(self.request(Method::POST, &["api", "devices", device_id, "flash", "confirm"]))
            .await
    }

    pub async fn close(&self, device_id: &str) -> Result<FlashSession> {
        self.send(self.request(Method::POST, &["api", "devices", device_id, "flash", "close"]))
            .await
    }

    pub async fn history(&self) -> Result<Vec<FlashSession>> {
        let response: HistoryResponse = self
            .send(self.request(Method::GET, &["api", "flash", "history"]))
            .await?;
        Ok(response.sessions)
    }

    pub async fn os_images(&self) -> Result<Vec<OsImage>> {
        let response: ImagesResponse = self.send(self.request(Method::GET, &["api", "os", "list"])).await?;
        Ok(response.images)
    }

    pub async fn check_os(&self, filename: Option<&str>) -> Result<OsCheckResponse> {
        let mut request = self.request(Method::GET, &["api", "devices", "os", "check"]);
        if let Some(filename) = filename {
            request = request.query(&[("filename", filename)]);
        }
        self.send(request).await
    }

    pub async fn start_download(&self, filename: Option<&str>) -> Result<DownloadResponse> {
        let body = DownloadRequest {
            filename: filename.map(str::to_string),
        };
        self.send(self.request(Method::POST, &["api", "os", "download"]).json(&body))
            .await
    }

    pub async fn download_progress(&self) -> Result<BTreeMap<String, DownloadTask>> {
        let response: ProgressResponse = self
            .send(self.request(Method::GET, &["api", "os", "download", "progress"]))
            .await?;
        Ok(response.downloads)
    }

    pub async fn delete_image(&self, filename: &str) -> Result<DeleteResponse> {
        self.send(self.request(Method::DELETE, &["api", "os", "delete", filename]))
            .await
    }
}

impl ConsoleApi for HttpConsoleClient {
    fn list_devices(&self) -> BoxFuture<'_, Result<Vec<Device>>> {
        Box::pin(async move { Ok(self.devices().await?.devices) })
    }

    fn flash_status<'a>(&'a self, device_id: &'a str) -> BoxFuture<'a, Result<Option<FlashSession>>> {
        Box::pin(HttpConsoleClient::flash_status(self, device_id))
    }
}
