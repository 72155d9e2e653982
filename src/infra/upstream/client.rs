use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use tracing::debug;

use crate::application::fetch::{UpstreamResponse, UpstreamTransport};
use crate::domain::identity::{CacheIdentity, strip_whitespace};
use crate::domain::payload::is_empty_payload;
use crate::infra::error::InfraError;

const TARGET: &str = "eventmirror::upstream";

/// Basic credentials for the upstream service.
#[derive(Clone)]
pub struct UpstreamCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for UpstreamCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// reqwest-based [`UpstreamTransport`].
#[derive(Clone, Debug)]
pub struct UpstreamClient {
    client: Client,
    base: String,
    credentials: UpstreamCredentials,
}

impl UpstreamClient {
    pub fn new(
        base_url: &str,
        api_prefix: &str,
        credentials: UpstreamCredentials,
        connect_timeout: Duration,
    ) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .connect_timeout(connect_timeout)
            .build()
            .map_err(InfraError::http_client)?;

        let base = format!(
            "{}/{}",
            base_url.trim().trim_end_matches('/'),
            api_prefix.trim().trim_matches('/')
        );
        Url::parse(&base).map_err(|err| {
            InfraError::configuration(format!("invalid upstream base url `{base}`: {err}"))
        })?;

        Ok(Self {
            client,
            base,
            credentials,
        })
    }

    pub fn user_agent() -> &'static str {
        concat!("eventmirror/", env!("CARGO_PKG_VERSION"))
    }

    /// Deterministic upstream URL for `identity`; whitespace is stripped from the path.
    pub fn url(&self, identity: &CacheIdentity) -> Result<Url, url::ParseError> {
        let path = strip_whitespace(&format!("{}/{}", self.base, identity.upstream_path()));
        let mut url = Url::parse(&path)?;
        if !identity.query_params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in identity.query_params.iter() {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    async fn classify(response: reqwest::Response) -> UpstreamResponse {
        let status = response.status();
        if status.is_success() {
            let bytes = match response.bytes().await {
                Ok(bytes) => bytes,
                Err(err) => {
                    return UpstreamResponse::Unavailable {
                        reason: format!("failed to read body: {err}"),
                    };
                }
            };
            if bytes.iter().all(u8::is_ascii_whitespace) {
                return UpstreamResponse::Empty;
            }
            return match serde_json::from_slice::<Value>(&bytes) {
                Ok(value) if is_empty_payload(&value) => UpstreamResponse::Empty,
                Ok(value) => UpstreamResponse::Payload(value),
                Err(err) => UpstreamResponse::Unavailable {
                    reason: format!("invalid json body: {err}"),
                },
            };
        }

        match status {
            StatusCode::NOT_FOUND => UpstreamResponse::NotFound,
            StatusCode::TOO_MANY_REQUESTS => UpstreamResponse::RateLimited,
            status if status.is_client_error() => UpstreamResponse::Rejected {
                status: status.as_u16(),
            },
            status => UpstreamResponse::Unavailable {
                reason: format!("upstream returned status {status}"),
            },
        }
    }
}

#[async_trait]
impl UpstreamTransport for UpstreamClient {
    async fn attempt(&self, identity: &CacheIdentity) -> UpstreamResponse {
        let url = match self.url(identity) {
            Ok(url) => url,
            Err(err) => {
                return UpstreamResponse::Unavailable {
                    reason: format!("invalid upstream url: {err}"),
                };
            }
        };
        debug!(target = TARGET, url = %url, "dispatching upstream request");

        match self
            .client
            .get(url)
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .send()
            .await
        {
            Ok(response) => Self::classify(response).await,
            Err(err) => UpstreamResponse::Unavailable {
                reason: err.to_string(),
            },
        }
    }

    fn describe(&self, identity: &CacheIdentity) -> String {
        self.url(identity)
            .map(String::from)
            .unwrap_or_else(|_| format!("{}/{}", self.base, identity.upstream_path()))
    }
}
