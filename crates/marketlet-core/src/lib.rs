//! Core types and utilities for marketlet.
//!
//! This crate provides the foundational types shared by every marketlet crate:
//!
//! - **Identifiers**: [`PodKey`] for cluster pods, [`OwnerTag`] binding a
//!   marketplace instance to exactly one pod, and the numeric marketplace ids
//!   [`OfferId`] and [`InstanceId`]
//! - **Error types**: Common error definitions shared across crates
//!
//! # Example
//!
//! ```
//! use marketlet_core::{OwnerTag, PodKey};
//!
//! let key: PodKey = "voice/stt-0".parse().unwrap();
//! let tag = OwnerTag::derive(&key, "6f1c2d4e-uid");
//!
//! // The label attached to the marketplace instance resolves back to the tag.
//! assert_eq!(OwnerTag::from_label(&tag.label()), Some(tag));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod ids;

pub use error::{CoreError, Result};
pub use ids::{InstanceId, OfferId, OwnerTag, PodKey, LABEL_PREFIX};
