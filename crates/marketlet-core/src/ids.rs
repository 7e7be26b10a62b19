//! Core identifier types for marketlet.
//!
//! This module provides strongly-typed identifiers for pods and for the
//! marketplace resources that back them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Prefix of every marketplace instance label written by marketlet.
pub const LABEL_PREFIX: &str = "marketlet-";

/// Identity of a pod in the cluster: `namespace/name`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PodKey {
    namespace: String,
    name: String,
}

impl PodKey {
    /// Create a new `PodKey`.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// The pod's namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The pod's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PodKey({}/{})", self.namespace, self.name)
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for PodKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(namespace, name))
            }
            _ => Err(CoreError::InvalidPodKey(s.to_string())),
        }
    }
}

impl TryFrom<String> for PodKey {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PodKey> for String {
    fn from(key: PodKey) -> Self {
        key.to_string()
    }
}

/// A 16-byte ownership tag binding a marketplace instance to one pod.
///
/// The tag is derived with blake3 from the pod's key and UID, so a pod that
/// is deleted and recreated under the same name gets a different tag. It is
/// written to the instance label and to a pod annotation, which is what lets
/// the pod-to-instance mapping be rebuilt after a restart.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OwnerTag([u8; 16]);

impl OwnerTag {
    /// Create a new `OwnerTag` from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Derive the tag for a pod.
    #[must_use]
    pub fn derive(key: &PodKey, uid: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(key.namespace.as_bytes());
        hasher.update(b"/");
        hasher.update(key.name.as_bytes());
        hasher.update(b"#");
        hasher.update(uid.as_bytes());

        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
        Self(bytes)
    }

    /// Parse an `OwnerTag` from a hex-encoded string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid hex or not exactly 32 characters.
    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(s).map_err(|_| CoreError::InvalidHex)?;
        let arr: [u8; 16] = bytes.try_into().map_err(|_| CoreError::InvalidLength {
            expected: 16,
            got: s.len() / 2,
        })?;
        Ok(Self(arr))
    }

    /// Return the hex-encoded string representation.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The marketplace instance label carrying this tag.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{LABEL_PREFIX}{}", self.to_hex())
    }

    /// Recover a tag from an instance label, if it is one of ours.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        label
            .strip_prefix(LABEL_PREFIX)
            .and_then(|hex| Self::from_hex(hex).ok())
    }
}

impl fmt::Debug for OwnerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerTag({})", self.to_hex())
    }
}

impl fmt::Display for OwnerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl TryFrom<String> for OwnerTag {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<OwnerTag> for String {
    fn from(tag: OwnerTag) -> Self {
        tag.to_hex()
    }
}

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Create the id from its numeric value.
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// The numeric value.
            #[must_use]
            pub const fn get(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim()
                    .parse::<u64>()
                    .map(Self)
                    .map_err(|_| CoreError::InvalidNumber(s.to_string()))
            }
        }
    };
}

numeric_id!(
    /// Marketplace identifier of an offer (a rentable machine listing).
    OfferId
);

numeric_id!(
    /// Marketplace identifier of a launched instance (a billable contract).
    InstanceId
);
