use super::client::HttpClient;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};

/// An [`HttpClient`] wrapper that sends an API key in a request header.
///
/// Feed providers differ on the header name (`x-api-key`, `Authorization`,
/// ...), so it is configurable. Both name and value are validated up front.
pub struct ApiKey<C> {
    inner: C,
    header_name: HeaderName,
    key: HeaderValue,
}

impl<C> ApiKey<C> {
    pub fn new(inner: C, header_name: &str, key: &str) -> Result<Self> {
        let mut key = HeaderValue::from_str(key)?;
        key.set_sensitive(true);

        Ok(Self {
            inner,
            header_name: HeaderName::from_bytes(header_name.as_bytes())?,
            key,
        })
    }

    fn authorize(&self, req: &mut reqwest::Request) {
        req.headers_mut()
            .insert(self.header_name.clone(), self.key.clone());
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for ApiKey<C> {
    async fn execute(&self, mut req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        self.authorize(&mut req);
        self.inner.execute(req).await
    }
}
