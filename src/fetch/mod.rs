//! HTTP retrieval of feed payloads.
//!
//! Polling cadence, staleness checks and retries are left to the caller;
//! this module only turns a URL into bytes.

mod auth;
mod basic;
mod client;

pub use auth::ApiKey;
pub use basic::BasicClient;
pub use client::HttpClient;

use anyhow::Result;
use bytes::Bytes;
use tracing::debug;

/// GETs `url` and returns the body, failing on any non-success status.
pub async fn fetch_bytes<C: HttpClient + ?Sized>(client: &C, url: &str) -> Result<Bytes> {
    let req = reqwest::Request::new(reqwest::Method::GET, url.parse()?);

    let resp = client.execute(req).await?.error_for_status()?;
    let body = resp.bytes().await?;
    debug!(url, bytes = body.len(), "Feed fetched");
    Ok(body)
}
