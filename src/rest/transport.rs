#![expect(
    clippy::module_name_repetitions,
    reason = "Transport implementations are named after their protocol"
)]

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::Result;
use crate::error::Error;
use crate::types::Domain;

/// Global REST base URL for the spot domain.
pub const GLOBAL_API_ENDPOINT: &str = "https://api.kucoin.com";
/// Global REST base URL for the futures domain.
pub const GLOBAL_FUTURES_API_ENDPOINT: &str = "https://api-futures.kucoin.com";
/// Global REST base URL for the broker domain.
pub const GLOBAL_BROKER_API_ENDPOINT: &str = "https://api-broker.kucoin.com";

/// API-level success code carried in every REST envelope.
const RESULT_CODE_SUCCESS: &str = "200000";

/// A REST call addressed by domain, method and path, returning the `data` member of the
/// response envelope.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn call(
        &self,
        domain: Domain,
        method: Method,
        path: &str,
        payload: Option<Value>,
    ) -> Result<Value>;

    /// Release any pooled resources.
    async fn close(&self) {}
}

/// Base URLs per [`Domain`].
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub spot: String,
    pub futures: String,
    pub broker: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            spot: GLOBAL_API_ENDPOINT.to_owned(),
            futures: GLOBAL_FUTURES_API_ENDPOINT.to_owned(),
            broker: GLOBAL_BROKER_API_ENDPOINT.to_owned(),
        }
    }
}

impl Endpoints {
    /// Point every domain at the same base URL.
    #[must_use]
    pub fn uniform(base: &str) -> Self {
        Self {
            spot: base.to_owned(),
            futures: base.to_owned(),
            broker: base.to_owned(),
        }
    }

    #[must_use]
    pub fn base(&self, domain: Domain) -> &str {
        match domain {
            Domain::Spot => &self.spot,
            Domain::Futures => &self.futures,
            Domain::Broker => &self.broker,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    code: String,
    #[serde(default)]
    data: Value,
    #[serde(default, rename = "msg")]
    message: Option<String>,
}

/// Unsigned [`Transport`] backed by [`reqwest`].
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoints: Endpoints,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(Endpoints::default())
    }
}

impl HttpTransport {
    #[must_use]
    pub fn new(endpoints: Endpoints) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints,
        }
    }

    fn url(&self, domain: Domain, path: &str) -> Result<Url> {
        Ok(Url::parse(self.endpoints.base(domain))?.join(path)?)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(level = "debug", skip(self, payload), fields(status_code))
    )]
    async fn call(
        &self,
        domain: Domain,
        method: Method,
        path: &str,
        payload: Option<Value>,
    ) -> Result<Value> {
        let url = self.url(domain, path)?;
        let mut request = self.client.request(method.clone(), url);
        if let Some(body) = &payload {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status_code = response.status();

        #[cfg(feature = "tracing")]
        tracing::Span::current().record("status_code", status_code.as_u16());

        if !status_code.is_success() {
            let message = response.text().await.unwrap_or_default();

            #[cfg(feature = "tracing")]
            tracing::warn!(
                status = %status_code,
                method = %method,
                path = %path,
                message = %message,
                "API request failed"
            );

            return Err(Error::status(status_code, method, path.to_owned(), message));
        }

        let envelope = response.json::<Envelope>().await?;
        if envelope.code != RESULT_CODE_SUCCESS {
            let message = format!(
                "code {}: {}",
                envelope.code,
                envelope.message.unwrap_or_default()
            );

            #[cfg(feature = "tracing")]
            tracing::warn!(method = %method, path = %path, %message, "API returned error code");

            return Err(Error::status(status_code, method, path.to_owned(), message));
        }

        Ok(envelope.data)
    }
}
