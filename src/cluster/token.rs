//! Signed redirect tokens.
//!
//! Token format: `base64url(json) "." hex(hmac_sha256(secret, base64url(json)))`.
//! The payload names the target node, optional SSH overrides, an expiry and
//! a random nonce. Nodes remember consumed nonces until the token would have
//! expired anyway, so a token opens at most one session.

use std::fmt;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ClusterError, TokenError};
use crate::secret::ClusterSecret;

/// Maximum number of tracked nonces before a forced purge of expired ones.
const MAX_USED_TOKENS: usize = 10_000;

/// Optional SSH target fields carried by a token. Empty fields fall back to
/// the node's configured defaults.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl SshOverrides {
    /// Drop blank strings so they count as "not provided".
    pub fn normalized(self) -> Self {
        let keep = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        Self {
            host: keep(self.host),
            port: self.port.filter(|p| *p != 0),
            user: keep(self.user),
            password: keep(self.password),
        }
    }
}

impl fmt::Debug for SshOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshOverrides")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectToken {
    pub node_id: String,
    #[serde(default)]
    pub ssh: SshOverrides,
    /// Unix seconds
    pub issued_at: i64,
    /// Unix seconds
    pub expires_at: i64,
    pub nonce: String,
}

impl RedirectToken {
    pub fn issue(node_id: impl Into<String>, ssh: SshOverrides, ttl: Duration) -> Self {
        let issued_at = Utc::now().timestamp();
        let nonce: u128 = rand::random();
        Self {
            node_id: node_id.into(),
            ssh: ssh.normalized(),
            issued_at,
            expires_at: issued_at.saturating_add(ttl.as_secs() as i64),
            nonce: format!("{:032x}", nonce),
        }
    }

    pub fn sign(&self, secret: &ClusterSecret) -> Result<String, ClusterError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| ClusterError::Redirect(format!("Failed to encode token: {}", e)))?;
        let payload = URL_SAFE_NO_PAD.encode(json);
        let signature = secret
            .sign(payload.as_bytes())
            .map_err(|e| ClusterError::Redirect(format!("Failed to sign token: {}", e)))?;
        Ok(format!("{}.{}", payload, signature))
    }
}

/// Node-side token checks plus the replay guard.
pub struct TokenVerifier {
    secret: ClusterSecret,
    node_id: Option<String>,
    used: DashMap<String, i64>,
}

impl TokenVerifier {
    /// `node_id` restricts accepted tokens to this node; `None` accepts any target.
    pub fn new(secret: ClusterSecret, node_id: Option<String>) -> Self {
        Self {
            secret,
            node_id,
            used: DashMap::new(),
        }
    }

    /// Check signature, target node and expiry without consuming the token.
    pub fn inspect(&self, raw: &str) -> Result<RedirectToken, TokenError> {
        self.inspect_at(raw, Utc::now().timestamp())
    }

    /// Check the token and mark it used. A second call with the same token fails.
    pub fn consume(&self, raw: &str) -> Result<RedirectToken, TokenError> {
        self.consume_at(raw, Utc::now().timestamp())
    }

    pub fn used_count(&self) -> usize {
        self.used.len()
    }

    /// Forget nonces of tokens that have expired anyway.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now().timestamp();
        let before = self.used.len();
        self.used.retain(|_, expires_at| *expires_at >= now);
        before.saturating_sub(self.used.len())
    }

    fn inspect_at(&self, raw: &str, now: i64) -> Result<RedirectToken, TokenError> {
        let (payload, signature) = raw.trim().split_once('.').ok_or(TokenError::Malformed)?;
        if payload.is_empty() || signature.is_empty() {
            return Err(TokenError::Malformed);
        }

        if !self.secret.verify_signature(payload.as_bytes(), signature) {
            warn!("Rejected redirect token: bad signature");
            return Err(TokenError::BadSignature);
        }

        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| TokenError::Malformed)?;
        let token: RedirectToken = serde_json::from_slice(&json).map_err(|_| TokenError::Malformed)?;

        if let Some(expected) = &self.node_id
            && *expected != token.node_id
        {
            warn!(
                "Rejected redirect token for node '{}' (this is '{}')",
                token.node_id, expected
            );
            return Err(TokenError::WrongNode);
        }

        if now > token.expires_at {
            debug!("Rejected expired redirect token for node '{}'", token.node_id);
            return Err(TokenError::Expired);
        }

        Ok(token)
    }

    fn consume_at(&self, raw: &str, now: i64) -> Result<RedirectToken, TokenError> {
        let token = self.inspect_at(raw, now)?;

        if self.used.len() >= MAX_USED_TOKENS {
            self.used.retain(|_, expires_at| *expires_at >= now);
        }

        match self.used.entry(token.nonce.clone()) {
            Entry::Occupied(_) => {
                warn!("Rejected replayed redirect token for node '{}'", token.node_id);
                Err(TokenError::Replayed)
            }
            Entry::Vacant(slot) => {
                slot.insert(token.expires_at);
                Ok(token)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(120);

    fn secret() -> ClusterSecret {
        ClusterSecret::new("s3cret")
    }

    fn overrides() -> SshOverrides {
        SshOverrides {
            host: Some("10.0.0.5".to_string()),
            port: Some(2222),
            user: Some("alice".to_string()),
            password: Some("pw".to_string()),
        }
    }

    mod signing {
        use super::*;

        #[test]
        fn test_signed_token_verifies() {
            let token = RedirectToken::issue("s1", overrides(), TTL);
            let raw = token.sign(&secret()).unwrap();
            let verifier = TokenVerifier::new(secret(), Some("s1".to_string()));

            let decoded = verifier.inspect(&raw).unwrap();
            assert_eq!(decoded, token);
            assert_eq!(decoded.ssh.port, Some(2222));
        }

        #[test]
        fn test_token_is_url_safe() {
            let raw = RedirectToken::issue("s1", overrides(), TTL).sign(&secret()).unwrap();
            assert!(raw.chars().all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c)));
        }

        #[test]
        fn test_nonces_differ() {
            let a = RedirectToken::issue("s1", SshOverrides::default(), TTL);
            let b = RedirectToken::issue("s1", SshOverrides::default(), TTL);
            assert_ne!(a.nonce, b.nonce);
        }

        #[test]
        fn test_blank_overrides_normalized() {
            let token = RedirectToken::issue(
                "s1",
                SshOverrides {
                    host: Some(" ".to_string()),
                    port: Some(0),
                    user: Some("bob".to_string()),
                    password: Some(String::new()),
                },
                TTL,
            );
            assert_eq!(token.ssh.host, None);
            assert_eq!(token.ssh.port, None);
            assert_eq!(token.ssh.user.as_deref(), Some("bob"));
            assert_eq!(token.ssh.password, None);
        }

        #[test]
        fn test_debug_redacts_password() {
            let shown = format!("{:?}", overrides());
            assert!(!shown.contains("\"pw\""));
            assert!(shown.contains("alice"));
        }
    }

    mod rejection {
        use super::*;

        #[test]
        fn test_tampered_payload_rejected() {
            let raw = RedirectToken::issue("s1", overrides(), TTL).sign(&secret()).unwrap();
            let (payload, sig) = raw.split_once('.').unwrap();
            let mut forged = RedirectToken::issue("s1", overrides(), TTL);
            forged.ssh.host = Some("evil".to_string());
            let forged_payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap());
            assert_ne!(payload, forged_payload);

            let verifier = TokenVerifier::new(secret(), None);
            assert_eq!(
                verifier.inspect(&format!("{}.{}", forged_payload, sig)),
                Err(TokenError::BadSignature)
            );
        }

        #[test]
        fn test_other_secret_rejected() {
            let raw = RedirectToken::issue("s1", overrides(), TTL)
                .sign(&ClusterSecret::new("other"))
                .unwrap();
            let verifier = TokenVerifier::new(secret(), None);
            assert_eq!(verifier.inspect(&raw), Err(TokenError::BadSignature));
        }

        #[test]
        fn test_malformed_rejected() {
            let verifier = TokenVerifier::new(secret(), None);
            assert_eq!(verifier.inspect("garbage"), Err(TokenError::Malformed));
            assert_eq!(verifier.inspect("."), Err(TokenError::Malformed));

            let sig = secret().sign(b"bm90LWpzb24").unwrap();
            assert_eq!(
                verifier.inspect(&format!("bm90LWpzb24.{}", sig)),
                Err(TokenError::Malformed)
            );
        }

        #[test]
        fn test_expired_rejected() {
            let token = RedirectToken::issue("s1", overrides(), TTL);
            let raw = token.sign(&secret()).unwrap();
            let verifier = TokenVerifier::new(secret(), None);

            assert!(verifier.inspect_at(&raw, token.expires_at).is_ok());
            assert_eq!(
                verifier.inspect_at(&raw, token.expires_at + 1),
                Err(TokenError::Expired)
            );
        }

        #[test]
        fn test_wrong_node_rejected() {
            let raw = RedirectToken::issue("s1", overrides(), TTL).sign(&secret()).unwrap();
            let verifier = TokenVerifier::new(secret(), Some("s2".to_string()));
            assert_eq!(verifier.inspect(&raw), Err(TokenError::WrongNode));
        }
    }

    mod replay {
        use super::*;

        #[test]
        fn test_second_use_rejected() {
            let raw = RedirectToken::issue("s1", overrides(), TTL).sign(&secret()).unwrap();
            let verifier = TokenVerifier::new(secret(), Some("s1".to_string()));

            assert!(verifier.consume(&raw).is_ok());
            assert_eq!(verifier.consume(&raw), Err(TokenError::Replayed));
            assert_eq!(verifier.used_count(), 1);
        }

        #[test]
        fn test_inspect_does_not_consume() {
            let raw = RedirectToken::issue("s1", overrides(), TTL).sign(&secret()).unwrap();
            let verifier = TokenVerifier::new(secret(), None);

            assert!(verifier.inspect(&raw).is_ok());
            assert!(verifier.inspect(&raw).is_ok());
            assert!(verifier.consume(&raw).is_ok());
            assert_eq!(verifier.inspect(&raw).map(|t| t.node_id), Ok("s1".to_string()));
        }

        #[test]
        fn test_purge_keeps_live_nonces() {
            let verifier = TokenVerifier::new(secret(), None);
            let live = RedirectToken::issue("s1", overrides(), TTL).sign(&secret()).unwrap();
            verifier.consume(&live).unwrap();

            let mut stale = RedirectToken::issue("s1", overrides(), TTL);
            stale.expires_at = Utc::now().timestamp() - 10;
            let stale_raw = stale.sign(&secret()).unwrap();
            verifier.consume_at(&stale_raw, stale.expires_at - 1).unwrap();

            assert_eq!(verifier.purge_expired(), 1);
            assert_eq!(verifier.consume(&live), Err(TokenError::Replayed));
        }
    }
}
