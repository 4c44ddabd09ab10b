//! The shared cluster secret.
//!
//! Every heartbeat and every node-admin request carries the secret; every
//! redirect token is signed with it. Comparisons run in constant time and
//! the value never shows up in `Debug` output.

use std::fmt;
use std::sync::Arc;

use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the secret on heartbeat and admin requests.
pub const SECRET_HEADER: &str = "X-Cluster-Secret";

#[derive(Clone)]
pub struct ClusterSecret(Arc<str>);

impl ClusterSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(Arc::from(secret.into()))
    }

    /// Constant-time comparison against a candidate presented by a peer.
    pub fn verify(&self, candidate: &str) -> bool {
        let expected = self.0.as_bytes();
        let provided = candidate.as_bytes();
        expected.len() == provided.len() && bool::from(expected.ct_eq(provided))
    }

    /// Raw value, only for placing into outbound requests.
    pub(crate) fn expose(&self) -> &str {
        &self.0
    }

    fn mac(&self) -> Result<HmacSha256, InvalidLength> {
        <HmacSha256 as Mac>::new_from_slice(self.0.as_bytes())
    }

    /// Hex HMAC-SHA256 of `payload`.
    pub fn sign(&self, payload: &[u8]) -> Result<String, InvalidLength> {
        let mut mac = self.mac()?;
        mac.update(payload);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Check a hex signature produced by [`ClusterSecret::sign`].
    pub fn verify_signature(&self, payload: &[u8], signature_hex: &str) -> bool {
        let Ok(signature) = hex::decode(signature_hex) else {
            return false;
        };
        let Ok(mut mac) = self.mac() else {
            return false;
        };
        mac.update(payload);
        mac.verify_slice(&signature).is_ok()
    }
}

impl fmt::Debug for ClusterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClusterSecret(<redacted>)")
    }
}
