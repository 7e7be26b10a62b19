//! HTTP client for the GPU marketplace.
//!
//! Every request is authenticated with a bearer key, takes a token from the
//! shared [`RateLimiter`] and is retried with exponential backoff while the
//! failure is transient.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use marketlet_core::{InstanceId, OfferId};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::{MarketError, Result};
use crate::limiter::RateLimiter;
use crate::retry::RetryPolicy;
use crate::types::{
    Instance, LaunchSpec, Offer, RawCreateRequest, RawCreateResponse, RawErrorResponse,
    RawInstanceList, RawInstanceResponse, RawSearchResponse, SearchCriteria,
};

/// Operations marketlet needs from a GPU marketplace.
///
/// This trait abstracts the marketplace so the provider can be exercised
/// against an in-memory implementation in tests.
#[async_trait]
pub trait Marketplace: Send + Sync {
    /// Search offers matching the hard filters. The result is unordered.
    ///
    /// # Errors
    ///
    /// Returns `RateLimited` or `Unavailable` once retries are exhausted.
    async fn search_offers(&self, criteria: &SearchCriteria) -> Result<Vec<Offer>>;

    /// Launch an instance from an offer.
    ///
    /// # Errors
    ///
    /// Returns `OfferUnavailable` when the offer was taken by someone else.
    async fn create_instance(&self, offer: &Offer, spec: &LaunchSpec) -> Result<InstanceId>;

    /// Fetch the current state of an instance.
    ///
    /// # Errors
    ///
    /// Returns `InstanceNotFound` if the instance does not exist.
    async fn get_instance(&self, id: InstanceId) -> Result<Instance>;

    /// List every instance owned by the account.
    ///
    /// # Errors
    ///
    /// Returns an error if the marketplace cannot be queried.
    async fn list_instances(&self) -> Result<Vec<Instance>>;

    /// Destroy an instance. Destroying an unknown instance succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the marketplace refuses or cannot be reached.
    async fn terminate_instance(&self, id: InstanceId) -> Result<()>;
}

/// Connection settings for [`HttpMarketplace`].
#[derive(Debug, Clone)]
pub struct MarketplaceConfig {
    /// Base URL of the marketplace API, without a trailing slash.
    pub base_url: String,
    /// Bearer API key.
    pub api_key: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Request budget per minute.
    pub requests_per_minute: u32,
    /// Bucket size for short bursts.
    pub burst: u32,
    /// How long a caller may wait for a rate limit token.
    pub max_rate_wait: Duration,
    /// Backoff for transient failures.
    pub retry: RetryPolicy,
}

impl MarketplaceConfig {
    /// Create a configuration with default limits.
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            requests_per_minute: 120,
            burst: 10,
            max_rate_wait: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// [`Marketplace`] implementation speaking the marketplace's JSON API.
#[derive(Debug, Clone)]
pub struct HttpMarketplace {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

impl HttpMarketplace {
    /// Create a new client.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the key is empty or the HTTP client cannot be built.
    pub fn new(config: MarketplaceConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(MarketError::Config("marketplace API key is empty".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| MarketError::Config(format!("failed to build HTTP client: {e}")))?;

        let limiter = RateLimiter::new(
            config.requests_per_minute,
            config.burst,
            config.max_rate_wait,
        );

        Ok(Self {
            client,
            base_url: config.base_url,
            api_key: config.api_key,
            limiter: Arc::new(limiter),
            retry: config.retry,
        })
    }

    /// The shared rate limiter.
    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Send one request.
    ///
    /// Rate limiting, credential and server failures are turned into errors
    /// here; every other status is handed back for the caller to interpret.
    async fn send(
        &self,
        op: &str,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<(StatusCode, String)> {
        self.limiter.acquire().await?;

        let url = format!("{}{path}", self.base_url);
        let mut request = self
            .client
            .request(method, &url)
            .bearer_auth(&self.api_key);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| MarketError::transport(op, &e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| MarketError::transport(op, &e))?;

        match status {
            StatusCode::TOO_MANY_REQUESTS => Err(MarketError::RateLimited),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(MarketError::Unauthorized),
            s if s.is_server_error() => {
                Err(MarketError::Unavailable(format!("{op} returned {s}")))
            }
            s => Ok((s, text)),
        }
    }
}

fn parse<T: DeserializeOwned>(op: &str, text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| MarketError::InvalidResponse(format!("{op}: {e}")))
}

fn rejected(status: StatusCode, text: &str) -> MarketError {
    let body: RawErrorResponse = serde_json::from_str(text).unwrap_or_default();
    MarketError::Rejected {
        status: status.as_u16(),
        message: body.message(),
    }
}

#[async_trait]
impl Marketplace for HttpMarketplace {
    async fn search_offers(&self, criteria: &SearchCriteria) -> Result<Vec<Offer>> {
        let body = json!({ "q": criteria.to_query() });

        let body = &body;
        let raw: RawSearchResponse = self
            .retry
            .execute("search", || async move {
                let (status, text) = self
                    .send("search", Method::POST, "/bundles/", Some(body))
                    .await?;
                if !status.is_success() {
                    return Err(rejected(status, &text));
                }
                parse("search", &text)
            })
            .await?;

        let offers: Vec<Offer> = raw.offers.into_iter().map(Offer::from).collect();
        debug!(count = offers.len(), "marketplace search returned offers");
        Ok(offers)
    }

    async fn create_instance(&self, offer: &Offer, spec: &LaunchSpec) -> Result<InstanceId> {
        let body = serde_json::to_value(RawCreateRequest::new(spec))
            .map_err(|e| MarketError::Config(format!("launch spec not serializable: {e}")))?;
        let (body, path) = (&body, format!("/asks/{}/", offer.id));
        let path = path.as_str();
        let offer_id = offer.id;

        // Only an explicit 429 proves nothing was launched; any other failure
        // may have left a contract behind, so it is not replayed.
        let id = self
            .retry
            .execute_if(
                "create",
                |e| matches!(e, MarketError::RateLimited),
                || async move {
                    let (status, text) = self
                        .send("create", Method::PUT, path, Some(body))
                        .await?;
                    create_outcome(offer_id, status, &text)
                },
            )
            .await?;

        info!(offer_id = %offer_id, instance_id = %id, label = %spec.label, "instance created");
        Ok(id)
    }

    async fn get_instance(&self, id: InstanceId) -> Result<Instance> {
        let path = format!("/instances/{id}/");
        let path = path.as_str();

        self.retry
            .execute("get_instance", || async move {
                let (status, text) = self.send("get_instance", Method::GET, path, None).await?;
                if status == StatusCode::NOT_FOUND {
                    return Err(MarketError::InstanceNotFound(id));
                }
                if !status.is_success() {
                    return Err(rejected(status, &text));
                }
                let raw: RawInstanceResponse = parse("get_instance", &text)?;
                raw.instances
                    .map(Instance::from)
                    .ok_or(MarketError::InstanceNotFound(id))
            })
            .await
    }

    async fn list_instances(&self) -> Result<Vec<Instance>> {
        let raw: RawInstanceList = self
            .retry
            .execute("list_instances", || async move {
                let (status, text) = self
                    .send("list_instances", Method::GET, "/instances/", None)
                    .await?;
                if !status.is_success() {
                    return Err(rejected(status, &text));
                }
                parse("list_instances", &text)
            })
            .await?;

        Ok(raw.instances.into_iter().map(Instance::from).collect())
    }

    async fn terminate_instance(&self, id: InstanceId) -> Result<()> {
        let path = format!("/instances/{id}/");
        let path = path.as_str();

        self.retry
            .execute("terminate", || async move {
                let (status, text) = self.send("terminate", Method::DELETE, path, None).await?;
                if status == StatusCode::NOT_FOUND {
                    debug!(instance_id = %id, "instance already gone");
                    return Ok(());
                }
                if !status.is_success() {
                    warn!(instance_id = %id, status = %status, "terminate rejected");
                    return Err(rejected(status, &text));
                }
                Ok(())
            })
            .await?;

        info!(instance_id = %id, "instance terminated");
        Ok(())
    }
}

/// Interpret the answer to a launch request.
fn create_outcome(offer_id: OfferId, status: StatusCode, text: &str) -> Result<InstanceId> {
    if matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE) {
        return Err(MarketError::OfferUnavailable(offer_id));
    }

    if status.is_success() {
        if let Ok(RawCreateResponse {
            success: true,
            new_contract: Some(id),
        }) = serde_json::from_str::<RawCreateResponse>(text)
        {
            return Ok(InstanceId::new(id));
        }
    }

    let body: RawErrorResponse = serde_json::from_str(text).unwrap_or_default();
    if body.is_offer_gone() {
        return Err(MarketError::OfferUnavailable(offer_id));
    }
    if status.is_success() {
        return Err(MarketError::InvalidResponse(format!(
            "create: no contract in response: {}",
            body.message()
        )));
    }
    Err(MarketError::Rejected {
        status: status.as_u16(),
        message: body.message(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_trims_trailing_slash() {
        let config = MarketplaceConfig::new("https://market.example/api/v0/", "k");
        assert_eq!(config.base_url, "https://market.example/api/v0");
    }

    #[test]
    fn empty_key_is_rejected() {
        let result = HttpMarketplace::new(MarketplaceConfig::new("http://localhost", "  "));
        assert!(matches!(result, Err(MarketError::Config(_))));
    }

    #[test]
    fn create_outcomes() {
        let offer = OfferId::new(5);

        let ok = create_outcome(offer, StatusCode::OK, r#"{"success":true,"new_contract":77}"#);
        assert_eq!(ok.unwrap(), InstanceId::new(77));

        let gone = create_outcome(offer, StatusCode::GONE, "");
        assert!(matches!(gone, Err(MarketError::OfferUnavailable(id)) if id == offer));

        let raced = create_outcome(
            offer,
            StatusCode::BAD_REQUEST,
            r#"{"success":false,"error":"no_such_ask","msg":"Instance type is no longer available."}"#,
        );
        assert!(matches!(raced, Err(MarketError::OfferUnavailable(_))));

        let bad = create_outcome(offer, StatusCode::BAD_REQUEST, r#"{"error":"invalid_args","msg":"bad image"}"#);
        assert!(matches!(
            bad,
            Err(MarketError::Rejected { status: 400, ref message }) if message == "bad image"
        ));

        let empty = create_outcome(offer, StatusCode::OK, r#"{"success":false}"#);
        assert!(matches!(empty, Err(MarketError::InvalidResponse(_))));
    }
}
