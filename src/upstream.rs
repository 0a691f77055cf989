//! Client for the upstream file store.
//!
//! Two calls exist: fetching a file definition by URI and running a small
//! script against the store's own script endpoint (used for glob queries
//! and the proxy-rule bootstrap).

use std::time::Duration;

use serde::de::DeserializeOwned;
use thiserror::Error;

/// Failures talking to the store.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The request never completed.
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The store answered with a non-200 status.
    #[error("upstream returned {code}: {body}")]
    Status {
        /// HTTP status of the reply.
        code: u16,
        /// Reply body, for the logs.
        body: String,
    },
}

/// The store client.
pub struct UpstreamClient {
    http: reqwest::Client,
    file_addr: String,
}

impl UpstreamClient {
    /// Client against `file_addr` (`host:port`).
    pub fn new(file_addr: &str) -> reqwest::Result<UpstreamClient> {
        Ok(UpstreamClient {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(3))
                .build()?,
            file_addr: file_addr.to_string(),
        })
    }

    /// Fetch one file definition. Returns the response headers and body;
    /// the caller assembles the `File`.
    pub async fn fetch(&self, uri: &str) -> Result<(Vec<(String, String)>, Vec<u8>), UpstreamError> {
        let url = format!(
            "http://{}/api/file?uri={}",
            self.file_addr,
            urlencoding::encode(uri)
        );
        let res = self.http.get(&url).send().await?;
        let status = res.status();

        let mut headers = Vec::new();
        for key in res.headers().keys() {
            if let Some(value) = res.headers().get(key) {
                if let Ok(value) = value.to_str() {
                    headers.push((key.as_str().to_string(), value.to_string()));
                }
            }
        }

        let body = res.bytes().await?.to_vec();

        if status.as_u16() != 200 {
            return Err(UpstreamError::Status {
                code: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        Ok((headers, body))
    }

    /// Run a script on the store and decode its JSON reply.
    pub async fn nisp<T: DeserializeOwned>(&self, code: &str) -> Result<T, UpstreamError> {
        let url = format!("http://{}/api/nisp", self.file_addr);
        let res = self.http.post(&url).body(code.to_string()).send().await?;
        Ok(res.json().await?)
    }
}
