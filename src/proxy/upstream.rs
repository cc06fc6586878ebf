//! HTTP client for the upstream completions endpoint.

use std::time::Duration;

use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use reqwest::{Client, ClientBuilder, Url};

use crate::config::UpstreamConfig;

/// Default user agent for outbound requests.
pub const USER_AGENT: &str = concat!("aura-gateway/", env!("CARGO_PKG_VERSION"));

/// Default connection timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client bound to one upstream URL.
///
/// Only the connect phase is bounded.
#[derive(Debug, Clone)]
pub struct Upstream {
    client: Client,
    url: Url,
}

impl Upstream {
    pub fn from_config(config: &UpstreamConfig) -> anyhow::Result<Self> {
        Self::builder(&config.url)?
            .connect_timeout(config.connect_timeout())
            .build()
    }

    /// Create a new builder targeting `url`.
    pub fn builder(url: &str) -> anyhow::Result<UpstreamBuilder> {
        let url = Url::parse(url).map_err(|e| anyhow::anyhow!("invalid upstream url {url:?}: {e}"))?;
        Ok(UpstreamBuilder {
            builder: Client::builder()
                .user_agent(USER_AGENT)
                .connect_timeout(CONNECT_TIMEOUT),
            url,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Send a request to the upstream with the caller's method.
    ///
    /// Resolves once the upstream status line and headers have arrived; the
    /// body is left unread.
    pub async fn send(
        &self,
        method: Method,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, reqwest::Error> {
        self.client
            .request(method, self.url.clone())
            .headers(headers)
            .body(body)
            .send()
            .await
    }
}

/// Builder for [`Upstream`].
pub struct UpstreamBuilder {
    builder: ClientBuilder,
    url: Url,
}

impl UpstreamBuilder {
    /// Set a custom user agent.
    pub fn user_agent(mut self, ua: &str) -> Self {
        self.builder = self.builder.user_agent(ua);
        self
    }

    /// Set connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.builder = self.builder.connect_timeout(timeout);
        self
    }

    /// Build the client.
    pub fn build(self) -> anyhow::Result<Upstream> {
        let client = self
            .builder
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build upstream HTTP client: {e}"))?;
        Ok(Upstream {
            client,
            url: self.url,
        })
    }
}
