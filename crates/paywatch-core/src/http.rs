//! reqwest-backed [`HttpClient`] for native hosts.
//!
//! Endpoints in the default config are relative to the checkout page
//! (`../production/payments.php`), so the client resolves them against a
//! base URL, normally the page URL, before sending.

use std::time::Duration;

use reqwest::Client;
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

use crate::config::HttpConfig;
use crate::error::{ConfigError, HttpError};
use crate::host::{HostFuture, HttpClient, HttpRequest, HttpResponse, RequestBody};

/// Outbound client used for verification and tag persistence.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: Client,
    base_url: Option<Url>,
}

impl ReqwestClient {
    /// Build a client from config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the base URL does not parse or the TLS
    /// backend cannot be initialized.
    pub fn new(config: &HttpConfig) -> Result<Self, ConfigError> {
        let base_url = config
            .base_url
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(|err| ConfigError::InvalidValue {
                field: "http.base_url",
                reason: err.to_string(),
            })?;
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|err| ConfigError::InvalidValue {
                field: "http",
                reason: err.to_string(),
            })?;
        Ok(Self { client, base_url })
    }

    /// Resolve `endpoint` to an absolute URL.
    pub fn resolve(&self, endpoint: &str) -> Result<Url, HttpError> {
        let invalid = |reason: String| HttpError::InvalidUrl {
            endpoint: endpoint.to_string(),
            reason,
        };
        match Url::parse(endpoint) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => match &self.base_url {
                Some(base) => base.join(endpoint).map_err(|err| invalid(err.to_string())),
                None => Err(invalid("relative endpoint and no base URL".to_string())),
            },
            Err(err) => Err(invalid(err.to_string())),
        }
    }

    fn headers(request: &HttpRequest) -> Result<HeaderMap, HttpError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| HttpError::Transport(format!("invalid header name: {err}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| HttpError::Transport(format!("invalid header value: {err}")))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let url = self.resolve(&request.url)?;
        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|err| HttpError::Transport(format!("invalid method: {err}")))?;
        let mut builder = self
            .client
            .request(method, url)
            .headers(Self::headers(&request)?);
        builder = match request.body {
            Some(RequestBody::Text(text)) => builder.body(text),
            Some(RequestBody::Json(value)) => builder.json(&value),
            None => builder,
        };
        let response = builder
            .send()
            .await
            .map_err(|err| HttpError::Transport(err.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|err| HttpError::Transport(err.to_string()))?;
        Ok(HttpResponse::new(status, body))
    }
}

impl HttpClient for ReqwestClient {
    fn send<'a>(&'a self, request: HttpRequest) -> HostFuture<'a, Result<HttpResponse, HttpError>> {
        Box::pin(self.execute(request))
    }
}
