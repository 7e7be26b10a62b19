//! Client for the GPU marketplace that backs marketlet's virtual node.
//!
//! This crate provides the [`Marketplace`] trait and its HTTP implementation
//! [`HttpMarketplace`]. It handles:
//!
//! - Offer search with hard filters (GPU type, price ceiling, reliability, bandwidth)
//! - Instance launch, status polling, listing and idempotent termination
//! - A shared requests-per-minute [`RateLimiter`] that callers wait on
//! - Bounded exponential-backoff retries for transient failures
//!
//! # Example
//!
//! ```no_run
//! use marketlet_market::{HttpMarketplace, Marketplace, MarketplaceConfig, SearchCriteria};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MarketplaceConfig::new("https://marketplace.example/api/v0", "secret-key");
//! let market = HttpMarketplace::new(config)?;
//!
//! let criteria = SearchCriteria {
//!     gpu_names: vec!["RTX 4090".to_string()],
//!     max_price_per_hour: Some(0.50),
//!     ..SearchCriteria::default()
//! };
//! for offer in market.search_offers(&criteria).await? {
//!     println!("{} {} ${}/h", offer.id, offer.gpu_name, offer.price_per_hour);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Testing
//!
//! Enable the `test-utils` feature for [`MockMarketplace`], an in-memory
//! marketplace with call counters and race injection.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod client;
pub mod error;
pub mod limiter;
pub mod retry;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use client::{HttpMarketplace, Marketplace, MarketplaceConfig};
pub use error::{MarketError, Result};
pub use limiter::RateLimiter;
pub use retry::RetryPolicy;
pub use types::{Instance, InstanceStatus, LaunchSpec, Offer, SearchCriteria};

#[cfg(any(test, feature = "test-utils"))]
pub use mock::MockMarketplace;
