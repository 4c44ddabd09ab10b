//! Terminal-serving node surface: connect form, session WebSocket and the
//! secret-guarded session admin API.

use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt, future, stream};
use poem::http::HeaderMap;
use poem::web::websocket::WebSocket;
use poem::web::{Data, Json, Path, Query};
use poem::{IntoResponse, Response, handler};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cluster::{ReportAck, RedirectToken, TokenVerifier};
use crate::config::SshDefaults;
use crate::error::{ClusterError, TokenError};
use crate::secret::{ClusterSecret, SECRET_HEADER};
use crate::terminal::{
    Credentials, ServerEvent, SessionBridge, SessionListResponse, SessionRequest,
    SshTarget, StatusFrame, TermSize, parse_client_message,
};

pub struct NodeState {
    pub node_id: String,
    pub role: &'static str,
    pub defaults: SshDefaults,
    pub bridge: Arc<SessionBridge>,
    /// Absent on standalone nodes, which only take explicit credentials.
    pub verifier: Option<Arc<TokenVerifier>>,
    /// Guards the session admin API. Absent on standalone nodes.
    pub secret: Option<ClusterSecret>,
}

#[derive(Default, Deserialize)]
pub struct FormQuery {
    #[serde(default)]
    pub token: Option<String>,
}

/// Query string of `GET /ws`.
#[derive(Default, Deserialize)]
pub struct TerminalQuery {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Inline private key, PEM or OpenSSH format
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub rows: Option<u16>,
    #[serde(default)]
    pub cols: Option<u16>,
}

/// Pre-filled connect form. Never carries a password.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectForm {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub has_password: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// A validated `/ws` request whose token, if any, is not spent yet.
pub(crate) struct PendingSession {
    request: SessionRequest,
    token: Option<(Arc<TokenVerifier>, String)>,
}

impl PendingSession {
    /// Spend the token. Called once the socket is upgraded so a failed
    /// handshake leaves the token usable.
    pub(crate) fn claim(self) -> Result<SessionRequest, TokenError> {
        if let Some((verifier, raw)) = self.token {
            verifier.consume(&raw)?;
        }
        Ok(self.request)
    }
}

impl NodeState {
    fn verifier(&self) -> Result<&Arc<TokenVerifier>, ClusterError> {
        self.verifier.as_ref().ok_or_else(|| {
            ClusterError::InvalidRequest("this node does not accept redirect tokens".to_string())
        })
    }

    fn require_secret(&self, headers: &HeaderMap) -> Result<(), ClusterError> {
        let presented = headers
            .get(SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        match &self.secret {
            Some(secret) if secret.verify(presented) => Ok(()),
            _ => Err(ClusterError::InvalidSecret),
        }
    }

    pub(crate) fn connect_form(&self, token: Option<String>) -> Result<ConnectForm, ClusterError> {
        let Some(raw) = present(token) else {
            return Ok(ConnectForm {
                node_id: self.node_id.clone(),
                host: self.defaults.host.clone(),
                port: self.defaults.port,
                user: self.defaults.user.clone(),
                has_password: false,
                token: None,
                expires_at: None,
            });
        };

        let token = self.verifier()?.inspect(&raw)?;
        let ssh = token.ssh;
        Ok(ConnectForm {
            node_id: self.node_id.clone(),
            host: ssh.host.unwrap_or_else(|| self.defaults.host.clone()),
            port: ssh.port.unwrap_or(self.defaults.port),
            user: ssh.user.or_else(|| self.defaults.user.clone()),
            has_password: ssh.password.is_some() || self.defaults.password.is_some(),
            token: Some(raw),
            expires_at: Some(token.expires_at),
        })
    }

    fn default_credentials(&self) -> Credentials {
        Credentials {
            password: self.defaults.password.clone(),
            key_file: self.defaults.key_file.clone(),
            ..Default::default()
        }
    }

    /// Validate a `/ws` query without spending its token.
    ///
    /// With a token, fields fall back from the token to the query to the
    /// node defaults. Without one, host and user must be given together with
    /// a password or a private key.
    pub(crate) fn prepare_request(&self, query: TerminalQuery) -> Result<PendingSession, ClusterError> {
        let default_size = TermSize::default();
        let size = TermSize::new(
            query.rows.unwrap_or(default_size.rows),
            query.cols.unwrap_or(default_size.cols),
        );
        let host = present(query.host);
        let user = present(query.user);
        let explicit = Credentials {
            password: present(query.password),
            private_key: present(query.private_key),
            passphrase: present(query.passphrase),
            key_file: None,
        };

        if let Some(raw) = present(query.token) {
            let verifier = self.verifier()?.clone();
            let RedirectToken { ssh, .. } = verifier.inspect(&raw)?;
            let user = ssh
                .user
                .or(user)
                .or_else(|| self.defaults.user.clone())
                .ok_or_else(|| ClusterError::InvalidRequest("no SSH user given".to_string()))?;
            let credentials = match ssh.password {
                Some(password) => Credentials::password(password),
                None if !explicit.is_empty() => explicit,
                None => self.default_credentials(),
            };
            return Ok(PendingSession {
                request: SessionRequest {
                    target: SshTarget {
                        host: ssh.host.or(host).unwrap_or_else(|| self.defaults.host.clone()),
                        port: ssh.port.or(query.port).unwrap_or(self.defaults.port),
                        user,
                    },
                    credentials,
                    size,
                },
                token: Some((verifier, raw)),
            });
        }

        match (host, user) {
            (Some(host), Some(user)) if !explicit.is_empty() => Ok(PendingSession {
                request: SessionRequest {
                    target: SshTarget {
                        host,
                        port: query.port.filter(|p| *p != 0).unwrap_or(22),
                        user,
                    },
                    credentials: explicit,
                    size,
                },
                token: None,
            }),
            _ => Err(ClusterError::InvalidRequest(
                "host, user and a password or private key are required without a token".to_string(),
            )),
        }
    }
}

#[handler]
pub async fn index(
    state: Data<&Arc<NodeState>>,
    Query(query): Query<FormQuery>,
) -> Result<Json<ConnectForm>, ClusterError> {
    Ok(Json(state.connect_form(query.token)?))
}

#[handler]
pub async fn connect(
    state: Data<&Arc<NodeState>>,
    Query(query): Query<FormQuery>,
) -> Result<Json<ConnectForm>, ClusterError> {
    if present(query.token.clone()).is_none() {
        return Err(ClusterError::InvalidRequest("missing token".to_string()));
    }
    Ok(Json(state.connect_form(query.token)?))
}

/// Upgrade to a terminal session. The request is validated before the
/// upgrade so token and credential errors surface as plain HTTP errors.
/// The token itself is spent only on the upgraded socket.
#[handler]
pub async fn terminal(
    state: Data<&Arc<NodeState>>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocket,
) -> Result<Response, ClusterError> {
    let pending = state.prepare_request(query)?;
    let bridge = state.bridge.clone();
    info!("WebSocket session requested for {}", pending.request.target);

    Ok(ws.on_upgrade(move |socket| async move {
        let (mut sink, source) = socket.split();

        let request = match pending.claim() {
            Ok(request) => request,
            Err(e) => {
                warn!("Token refused after upgrade: {}", e);
                let frame = ServerEvent::Status(StatusFrame::token_rejected(&e));
                let _ = sink.send(frame.into_message()).await;
                let _ = sink.close().await;
                return;
            }
        };

        let client_rx = source
            .take_while(|message| future::ready(message.is_ok()))
            .filter_map(|message| future::ready(message.ok()))
            .flat_map(|message| stream::iter(parse_client_message(message)))
            .boxed();
        let client_tx =
            sink.with(|event: ServerEvent| future::ready(Ok::<_, io::Error>(event.into_message())));

        let outcome = bridge.run(request, client_rx, Box::pin(client_tx)).await;
        debug!(
            "Session {} ended: {} ({} bytes in, {} bytes out)",
            outcome.session_id, outcome.reason, outcome.bytes_in, outcome.bytes_out
        );
    })
    .into_response())
}

#[handler]
pub async fn list_sessions(
    state: Data<&Arc<NodeState>>,
    headers: &HeaderMap,
) -> Result<Json<SessionListResponse>, ClusterError> {
    state.require_secret(headers)?;
    Ok(Json(SessionListResponse::from(state.bridge.registry().list())))
}

#[handler]
pub async fn terminate_session(
    state: Data<&Arc<NodeState>>,
    headers: &HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<ReportAck>, ClusterError> {
    state.require_secret(headers)?;
    state.bridge.registry().terminate(&session_id)?;
    Ok(Json(ReportAck::ok()))
}

#[handler]
pub async fn health(state: Data<&Arc<NodeState>>) -> Json<serde_json::Value> {
    let registry = state.bridge.registry();
    Json(serde_json::json!({
        "status": "ok",
        "role": state.role,
        "node_id": state.node_id,
        "sessions": registry.len(),
        "sessions_closed": registry.released_count(),
    }))
}
