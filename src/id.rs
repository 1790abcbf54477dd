//! The `Id` type and the identifier newtypes built on it.

use std::{
    fmt::{self, Display},
    ops::Deref,
    path::Path,
    str::FromStr,
};

use binrw::{BinRead, BinWrite};
use rand::{thread_rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{DuvizError, DuvizResult, ErrorKind};

pub(super) mod constants {
    /// The length of the hash in bytes
    pub(super) const LEN: usize = 32;
    /// The length of the hash in hexadecimal characters
    pub(super) const HEX_LEN: usize = LEN * 2;
}

/// `Id` is the hash id of an object.
///
/// Snapshot blobs are addressed by the `Id` of their encoded bytes.
#[derive(
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    BinWrite,
    BinRead,
)]
pub struct Id(
    #[serde(serialize_with = "hex::serde::serialize")]
    #[serde(deserialize_with = "hex::serde::deserialize")]
    [u8; constants::LEN],
);

impl FromStr for Id {
    type Err = Box<DuvizError>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Display for Id {
    /// Format the `Id` as an abbreviated hexadecimal string
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = &self.to_hex()[0..8];

        write!(f, "{id}")
    }
}

impl Id {
    /// Compute the content address of the given bytes.
    #[must_use]
    pub fn from_content(content: &[u8]) -> Self {
        Self(Sha256::digest(content).into())
    }

    /// Generate a random `Id`.
    #[must_use]
    pub fn random() -> Self {
        let mut id = Self::default();
        thread_rng().fill_bytes(&mut id.0);
        id
    }

    /// Parse an `Id` from a hexadecimal string
    ///
    /// # Errors
    ///
    /// * If the string is not a valid hexadecimal string of the right length.
    pub fn from_hex(s: &str) -> DuvizResult<Self> {
        let mut id = Self::default();

        hex::decode_to_slice(s, &mut id.0).map_err(|err| {
            DuvizError::with_source(ErrorKind::Internal, "Failed to parse hex id.", err)
                .attach_context("id", s.to_string())
        })?;

        Ok(id)
    }

    /// Convert to [`HexId`].
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn to_hex(self) -> HexId {
        let mut hex_id = HexId::EMPTY;

        hex::encode_to_slice(self.0, &mut hex_id.0)
            .expect("HexId's len is LEN * 2, should never panic.");

        hex_id
    }

    /// Checks if the [`Id`] is zero
    #[must_use]
    pub fn is_null(&self) -> bool {
        self == &Self::default()
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = &self.to_hex()[0..32];

        write!(f, "{id}")
    }
}

/// An `Id` in hexadecimal format
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HexId([u8; constants::HEX_LEN]);

impl From<Id> for HexId {
    fn from(id: Id) -> Self {
        id.to_hex()
    }
}

impl HexId {
    /// An empty [`HexId`]
    const EMPTY: Self = Self([b'0'; constants::HEX_LEN]);

    /// Get the string representation of a [`HexId`]
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn as_str(&self) -> &str {
        // This is only ever filled with hex chars, which are ascii
        std::str::from_utf8(&self.0).expect("HexId is not valid utf8, which should never happen")
    }
}

impl Deref for HexId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl AsRef<Path> for HexId {
    fn as_ref(&self) -> &Path {
        self.as_str().as_ref()
    }
}

/// Identifies a snapshot blob in the [`BlobStore`](crate::blob::store::BlobStore).
#[derive(
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Default,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    derive_more::Display,
    derive_more::From,
    derive_more::Deref,
)]
pub struct BlobId(Id);

impl FromStr for BlobId {
    type Err = Box<DuvizError>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Id::from_hex(s)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_id_is_deterministic() {
        let a = Id::from_content(b"hello");
        let b = Id::from_content(b"hello");
        let c = Id::from_content(b"hullo");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(!a.is_null());
    }

    #[test]
    fn test_hex_round_trip() {
        let id = Id::from_content(b"round trip");
        let hex = id.to_hex();

        assert_eq!(Id::from_hex(hex.as_str()).unwrap(), id);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Id::from_hex("nope").is_err());
        assert!(Id::from_hex("").is_err());
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(Id::random(), Id::random());
    }
}
