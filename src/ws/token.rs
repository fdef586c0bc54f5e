//! Connection tokens and the providers that issue them.
//!
//! A push-data connection needs a short-lived *bullet* token. The bootstrap REST call
//! returns one token together with a list of instance servers; every server is a
//! failover endpoint and receives the same token.

#![expect(
    clippy::module_name_repetitions,
    reason = "Provider names read better with the token prefix outside this module"
)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use secrecy::{ExposeSecret as _, SecretString};
use serde::Deserialize;
use serde_with::{DurationMilliSeconds, serde_as};
use url::Url;

use super::error::WsError;
use crate::Result;
use crate::rest::Transport;
use crate::types::{Channel, Domain};

const BULLET_PUBLIC_PATH: &str = "/api/v1/bullet-public";
const BULLET_PRIVATE_PATH: &str = "/api/v1/bullet-private";

/// Endpoint and credential for one connection generation.
#[serde_as]
#[non_exhaustive]
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub endpoint: String,
    #[serde(default)]
    pub token: SecretString,
    #[serde(default)]
    pub encrypt: bool,
    #[serde(default)]
    pub protocol: String,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub ping_interval: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub ping_timeout: Duration,
}

impl Token {
    #[must_use]
    pub fn new(
        endpoint: impl Into<String>,
        token: impl Into<String>,
        ping_interval: Duration,
        ping_timeout: Duration,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: SecretString::from(token.into()),
            encrypt: false,
            protocol: "websocket".to_owned(),
            ping_interval,
            ping_timeout,
        }
    }

    /// Address to dial: the endpoint with `token` and `connectId` query parameters.
    pub fn connect_url(&self, connect_id: &str) -> Result<Url> {
        let mut url = Url::parse(&self.endpoint)?;
        url.query_pairs_mut()
            .append_pair("token", self.token.expose_secret())
            .append_pair("connectId", connect_id);
        Ok(url)
    }
}

/// Source of connection tokens.
///
/// Called before the first connect and again before every reconnect round; tokens are
/// never cached across rounds. The returned list is tried in order.
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    async fn tokens(&self) -> Result<Vec<Token>>;

    /// Release any resources held by the provider.
    async fn close(&self) {}
}

#[async_trait]
impl<P: TokenProvider + ?Sized> TokenProvider for Arc<P> {
    async fn tokens(&self) -> Result<Vec<Token>> {
        (**self).tokens().await
    }

    async fn close(&self) {
        (**self).close().await;
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulletResponse {
    token: SecretString,
    #[serde(default)]
    instance_servers: Vec<Token>,
}

/// [`TokenProvider`] backed by the bullet bootstrap endpoints.
#[derive(Debug, Clone)]
pub struct BulletTokenProvider<T> {
    transport: T,
    domain: Domain,
    channel: Channel,
}

impl<T: Transport> BulletTokenProvider<T> {
    #[must_use]
    pub const fn new(transport: T, domain: Domain, channel: Channel) -> Self {
        Self {
            transport,
            domain,
            channel,
        }
    }

    const fn path(&self) -> &'static str {
        match self.channel {
            Channel::Public => BULLET_PUBLIC_PATH,
            Channel::Private => BULLET_PRIVATE_PATH,
        }
    }
}

#[async_trait]
impl<T: Transport> TokenProvider for BulletTokenProvider<T> {
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(level = "debug", skip(self), fields(domain = %self.domain, channel = %self.channel))
    )]
    async fn tokens(&self) -> Result<Vec<Token>> {
        let data = self
            .transport
            .call(self.domain, Method::POST, self.path(), None)
            .await
            .map_err(|e| WsError::TokenFetch(e.to_string()))?;

        let bullet: BulletResponse = serde_json::from_value(data)
            .map_err(|e| WsError::TokenFetch(format!("malformed bullet response: {e}")))?;

        if bullet.instance_servers.is_empty() {
            return Err(WsError::TokenFetch("no instance servers returned".to_owned()).into());
        }

        let tokens: Vec<Token> = bullet
            .instance_servers
            .into_iter()
            .map(|server| Token {
                token: bullet.token.clone(),
                ..server
            })
            .collect();

        #[cfg(feature = "tracing")]
        tracing::debug!(count = tokens.len(), "Fetched connection tokens");

        Ok(tokens)
    }

    async fn close(&self) {
        self.transport.close().await;
    }
}

/// [`TokenProvider`] that always returns the same tokens.
///
/// Useful for pre-issued credentials and for tests.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    tokens: Vec<Token>,
}

impl StaticTokenProvider {
    #[must_use]
    pub const fn new(tokens: Vec<Token>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn tokens(&self) -> Result<Vec<Token>> {
        if self.tokens.is_empty() {
            return Err(WsError::TokenFetch("no tokens configured".to_owned()).into());
        }
        Ok(self.tokens.clone())
    }
}
