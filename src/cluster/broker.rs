//! Dashboard authentication and redirect building on the Master.
//!
//! Three ways to prove dashboard access, checked in order:
//! the `auth_token` cookie set by login, `Authorization: Bearer <token>`,
//! and HTTP Basic carrying the dashboard password. Without a configured
//! password every caller is treated as authenticated (open mode).

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use dashmap::DashMap;
use poem::http::{HeaderMap, header};
use subtle::ConstantTimeEq;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use super::registry::ClusterRegistry;
use super::token::{RedirectToken, SshOverrides};
use crate::error::ClusterError;
use crate::secret::ClusterSecret;

/// Cookie carrying the dashboard session token.
pub const AUTH_COOKIE: &str = "auth_token";

/// Lifetime of a dashboard session.
pub const DASHBOARD_SESSION_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct DashboardSession {
    pub token: String,
    pub max_age: Duration,
}

/// Dashboard credentials found on a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresentedCredentials {
    pub cookie: Option<String>,
    pub bearer: Option<String>,
    pub basic_password: Option<String>,
}

impl PresentedCredentials {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let cookie = headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .find_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                (name == AUTH_COOKIE && !value.is_empty()).then(|| value.to_string())
            });

        let authorization = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::trim);

        let bearer = authorization
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        // Only the password half of `user:password` matters.
        let basic_password = authorization
            .and_then(|v| v.strip_prefix("Basic "))
            .and_then(|encoded| STANDARD.decode(encoded.trim()).ok())
            .and_then(|decoded| String::from_utf8(decoded).ok())
            .map(|pair| match pair.split_once(':') {
                Some((_, password)) => password.to_string(),
                None => pair,
            });

        Self {
            cookie,
            bearer,
            basic_password,
        }
    }
}

pub struct AccessBroker {
    registry: Arc<ClusterRegistry>,
    secret: ClusterSecret,
    auth_password: Option<String>,
    token_ttl: Duration,
    sessions: DashMap<String, Instant>,
}

impl AccessBroker {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        secret: ClusterSecret,
        auth_password: Option<String>,
        token_ttl: Duration,
    ) -> Self {
        Self {
            registry,
            secret,
            auth_password: auth_password.filter(|p| !p.is_empty()),
            token_ttl,
            sessions: DashMap::new(),
        }
    }

    pub fn open_mode(&self) -> bool {
        self.auth_password.is_none()
    }

    fn password_matches(&self, candidate: &str) -> bool {
        match &self.auth_password {
            None => true,
            Some(expected) => {
                let expected = expected.as_bytes();
                let candidate = candidate.as_bytes();
                expected.len() == candidate.len() && bool::from(expected.ct_eq(candidate))
            }
        }
    }

    /// Exchange the dashboard password for a session token.
    pub fn authenticate_dashboard(&self, password: &str) -> Result<DashboardSession, ClusterError> {
        if !self.password_matches(password) {
            warn!("Dashboard login failed: invalid password");
            return Err(ClusterError::InvalidPassword);
        }

        let bytes: [u8; 32] = rand::random();
        let token = hex::encode(bytes);
        self.sessions
            .insert(token.clone(), Instant::now() + DASHBOARD_SESSION_TTL);
        info!("Dashboard session opened ({} active)", self.sessions.len());

        Ok(DashboardSession {
            token,
            max_age: DASHBOARD_SESSION_TTL,
        })
    }

    fn session_valid(&self, token: &str) -> bool {
        let Some(expires_at) = self.sessions.get(token).map(|e| *e.value()) else {
            return false;
        };
        if Instant::now() >= expires_at {
            self.sessions.remove(token);
            debug!("Dashboard session expired");
            return false;
        }
        true
    }

    pub fn is_authenticated(&self, credentials: &PresentedCredentials) -> bool {
        if self.open_mode() {
            return true;
        }
        if let Some(token) = &credentials.cookie
            && self.session_valid(token)
        {
            return true;
        }
        if let Some(token) = &credentials.bearer
            && self.session_valid(token)
        {
            return true;
        }
        credentials
            .basic_password
            .as_deref()
            .is_some_and(|p| self.password_matches(p))
    }

    pub fn require_dashboard(&self, credentials: &PresentedCredentials) -> Result<(), ClusterError> {
        if self.is_authenticated(credentials) {
            Ok(())
        } else {
            Err(ClusterError::Unauthorized)
        }
    }

    /// Revoke a dashboard session. Returns whether it existed.
    pub fn logout(&self, token: &str) -> bool {
        self.sessions.remove(token).is_some()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Drop expired dashboard sessions.
    pub fn purge_sessions(&self) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, expires_at| *expires_at > now);
        before.saturating_sub(self.sessions.len())
    }

    /// Signed URL that opens a session on `node_id`.
    ///
    /// Callers must have passed [`AccessBroker::require_dashboard`] first.
    pub fn build_redirect(&self, node_id: &str, overrides: SshOverrides) -> Result<Url, ClusterError> {
        let node = self.registry.get_node(node_id)?;
        if !node.online {
            warn!(
                "Refusing redirect to offline node '{}' (last seen {}s ago)",
                node_id, node.seconds_since_seen
            );
            return Err(ClusterError::NodeOffline(node_id.to_string()));
        }

        let mut url = Url::parse(&node.external_url)
            .map_err(|e| ClusterError::Redirect(format!("{}: {}", node.external_url, e)))?;
        let token = RedirectToken::issue(&node.node_id, overrides, self.token_ttl).sign(&self.secret)?;
        url.query_pairs_mut().append_pair("token", &token);

        info!("Issued redirect to node '{}' at {}", node.node_id, node.external_url);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::token::TokenVerifier;
    use crate::cluster::types::{HeartbeatReport, NodeMetrics, NodeRole};
    use poem::http::HeaderValue;

    fn registry() -> Arc<ClusterRegistry> {
        let registry = Arc::new(ClusterRegistry::new(
            ClusterSecret::new("s3cret"),
            Duration::from_secs(30),
        ));
        registry
            .report(
                "s3cret",
                HeartbeatReport {
                    node_id: "s1".to_string(),
                    role: NodeRole::Slave,
                    external_url: "http://s1.example.com:8888".to_string(),
                    name: None,
                    ssh_user: None,
                    season: None,
                    secret: None,
                    metrics: NodeMetrics::default(),
                },
            )
            .unwrap();
        registry
    }

    fn broker(password: Option<&str>) -> AccessBroker {
        AccessBroker::new(
            registry(),
            ClusterSecret::new("s3cret"),
            password.map(str::to_string),
            Duration::from_secs(120),
        )
    }

    fn basic(password: &str) -> PresentedCredentials {
        PresentedCredentials {
            basic_password: Some(password.to_string()),
            ..Default::default()
        }
    }

    mod dashboard {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_login_and_cookie() {
            let broker = broker(Some("admin"));
            assert!(!broker.is_authenticated(&PresentedCredentials::default()));

            let session = broker.authenticate_dashboard("admin").unwrap();
            assert_eq!(session.token.len(), 64);
            assert!(broker.is_authenticated(&PresentedCredentials {
                cookie: Some(session.token.clone()),
                ..Default::default()
            }));
            assert!(broker.is_authenticated(&PresentedCredentials {
                bearer: Some(session.token),
                ..Default::default()
            }));
        }

        #[tokio::test(start_paused = true)]
        async fn test_wrong_password() {
            let broker = broker(Some("admin"));
            assert_eq!(
                broker.authenticate_dashboard("nope").unwrap_err(),
                ClusterError::InvalidPassword
            );
            assert_eq!(broker.active_sessions(), 0);
            assert_eq!(
                broker.require_dashboard(&basic("nope")),
                Err(ClusterError::Unauthorized)
            );
        }

        #[tokio::test(start_paused = true)]
        async fn test_basic_auth_accepted() {
            let broker = broker(Some("admin"));
            assert!(broker.is_authenticated(&basic("admin")));
        }

        #[tokio::test(start_paused = true)]
        async fn test_session_expires() {
            let broker = broker(Some("admin"));
            let session = broker.authenticate_dashboard("admin").unwrap();
            let creds = PresentedCredentials {
                cookie: Some(session.token),
                ..Default::default()
            };

            tokio::time::advance(DASHBOARD_SESSION_TTL - Duration::from_secs(1)).await;
            assert!(broker.is_authenticated(&creds));
            tokio::time::advance(Duration::from_secs(2)).await;
            assert!(!broker.is_authenticated(&creds));
            assert_eq!(broker.active_sessions(), 0);
        }

        #[tokio::test(start_paused = true)]
        async fn test_logout_revokes() {
            let broker = broker(Some("admin"));
            let session = broker.authenticate_dashboard("admin").unwrap();
            assert!(broker.logout(&session.token));
            assert!(!broker.logout(&session.token));
            assert!(!broker.is_authenticated(&PresentedCredentials {
                cookie: Some(session.token),
                ..Default::default()
            }));
        }

        #[tokio::test(start_paused = true)]
        async fn test_open_mode_accepts_everyone() {
            let broker = broker(None);
            assert!(broker.open_mode());
            assert!(broker.is_authenticated(&PresentedCredentials::default()));
            assert!(broker.authenticate_dashboard("anything").is_ok());
        }

        #[tokio::test(start_paused = true)]
        async fn test_purge_sessions() {
            let broker = broker(Some("admin"));
            broker.authenticate_dashboard("admin").unwrap();
            tokio::time::advance(DASHBOARD_SESSION_TTL).await;
            assert_eq!(broker.purge_sessions(), 1);
        }
    }

    mod headers {
        use super::*;

        #[test]
        fn test_cookie_among_others() {
            let mut headers = HeaderMap::new();
            headers.insert(
                header::COOKIE,
                HeaderValue::from_static("theme=dark; auth_token=abc123; lang=en"),
            );
            let creds = PresentedCredentials::from_headers(&headers);
            assert_eq!(creds.cookie.as_deref(), Some("abc123"));
            assert!(creds.bearer.is_none());
        }

        #[test]
        fn test_bearer() {
            let mut headers = HeaderMap::new();
            headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer tok"));
            let creds = PresentedCredentials::from_headers(&headers);
            assert_eq!(creds.bearer.as_deref(), Some("tok"));
            assert!(creds.basic_password.is_none());
        }

        #[test]
        fn test_basic_password_extracted() {
            let mut headers = HeaderMap::new();
            let value = format!("Basic {}", STANDARD.encode("admin:pa:ss"));
            headers.insert(header::AUTHORIZATION, HeaderValue::from_str(&value).unwrap());
            let creds = PresentedCredentials::from_headers(&headers);
            assert_eq!(creds.basic_password.as_deref(), Some("pa:ss"));
        }

        #[test]
        fn test_garbage_basic_ignored() {
            let mut headers = HeaderMap::new();
            headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic !!!"));
            assert_eq!(
                PresentedCredentials::from_headers(&headers),
                PresentedCredentials::default()
            );
        }
    }

    mod redirect {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_redirect_carries_verifiable_token() {
            let broker = broker(Some("admin"));
            let url = broker
                .build_redirect(
                    "s1",
                    SshOverrides {
                        user: Some("alice".to_string()),
                        ..Default::default()
                    },
                )
                .unwrap();

            assert_eq!(url.host_str(), Some("s1.example.com"));
            assert_eq!(url.port(), Some(8888));
            let raw = url
                .query_pairs()
                .find(|(k, _)| k == "token")
                .map(|(_, v)| v.into_owned())
                .unwrap();

            let verifier = TokenVerifier::new(ClusterSecret::new("s3cret"), Some("s1".to_string()));
            let token = verifier.consume(&raw).unwrap();
            assert_eq!(token.ssh.user.as_deref(), Some("alice"));
        }

        #[tokio::test(start_paused = true)]
        async fn test_unknown_node_issues_nothing() {
            let broker = broker(None);
            assert_eq!(
                broker.build_redirect("ghost", SshOverrides::default()),
                Err(ClusterError::NodeNotFound("ghost".to_string()))
            );
        }

        #[tokio::test(start_paused = true)]
        async fn test_offline_node_rejected() {
            let broker = broker(None);
            tokio::time::advance(Duration::from_secs(31)).await;
            assert_eq!(
                broker.build_redirect("s1", SshOverrides::default()),
                Err(ClusterError::NodeOffline("s1".to_string()))
            );
        }
    }
}
