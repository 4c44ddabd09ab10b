//! Master HTTP surface: heartbeat intake, dashboard auth, node reads and redirects.

use std::sync::Arc;

use poem::http::{HeaderMap, header};
use poem::web::{Data, Json, Path, Query, Redirect};
use poem::{IntoResponse, Response, handler};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cluster::{
    AUTH_COOKIE, AccessBroker, ClusterRegistry, HeartbeatReport, NodeListResponse, NodeView,
    PresentedCredentials, ReportAck, SshOverrides,
};
use crate::error::ClusterError;
use crate::secret::SECRET_HEADER;

pub struct MasterState {
    pub registry: Arc<ClusterRegistry>,
    pub broker: Arc<AccessBroker>,
    /// Whether node routes are mounted under `/webssh`
    pub with_slave: bool,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub status: String,
    pub token: String,
    pub expires_in: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DashboardSummary {
    pub service: String,
    pub role: String,
    pub authenticated: bool,
    pub open_mode: bool,
    pub with_slave: bool,
    pub nodes: usize,
    pub online: usize,
}

fn session_cookie(token: &str, max_age: u64) -> String {
    format!(
        "{}={}; Max-Age={}; Path=/; HttpOnly; SameSite=Lax",
        AUTH_COOKIE, token, max_age
    )
}

#[handler]
pub async fn heartbeat(
    state: Data<&Arc<MasterState>>,
    headers: &HeaderMap,
    Json(mut report): Json<HeartbeatReport>,
) -> Result<Json<ReportAck>, ClusterError> {
    let header_secret = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let secret = header_secret.or_else(|| report.secret.take()).unwrap_or_default();

    state.registry.report(&secret, report)?;
    Ok(Json(ReportAck::ok()))
}

#[handler]
pub async fn login(
    state: Data<&Arc<MasterState>>,
    Json(request): Json<LoginRequest>,
) -> Result<Response, ClusterError> {
    let session = state.broker.authenticate_dashboard(&request.password)?;
    let max_age = session.max_age.as_secs();
    let body = LoginResponse {
        status: "ok".to_string(),
        token: session.token.clone(),
        expires_in: max_age,
    };
    Ok(Json(body)
        .with_header(header::SET_COOKIE, session_cookie(&session.token, max_age))
        .into_response())
}

#[handler]
pub async fn logout(state: Data<&Arc<MasterState>>, headers: &HeaderMap) -> Response {
    let credentials = PresentedCredentials::from_headers(headers);
    let revoked = [credentials.cookie, credentials.bearer]
        .into_iter()
        .flatten()
        .filter(|token| state.broker.logout(token))
        .count();
    if revoked > 0 {
        info!("Dashboard session closed");
    }
    Json(ReportAck::ok())
        .with_header(header::SET_COOKIE, session_cookie("", 0))
        .into_response()
}

#[handler]
pub async fn list_nodes(state: Data<&Arc<MasterState>>) -> Json<NodeListResponse> {
    Json(NodeListResponse::from(state.registry.list_nodes()))
}

#[handler]
pub async fn get_node(
    state: Data<&Arc<MasterState>>,
    Path(node_id): Path<String>,
) -> Result<Json<NodeView>, ClusterError> {
    Ok(Json(state.registry.get_node(&node_id)?))
}

/// Redirect an authenticated dashboard user to a node with a signed token.
#[handler]
pub async fn connect(
    state: Data<&Arc<MasterState>>,
    headers: &HeaderMap,
    Path(node_id): Path<String>,
    Query(overrides): Query<SshOverrides>,
) -> Result<Redirect, ClusterError> {
    state
        .broker
        .require_dashboard(&PresentedCredentials::from_headers(headers))?;
    let url = state.broker.build_redirect(&node_id, overrides)?;
    Ok(Redirect::see_other(url.as_str()))
}

#[handler]
pub async fn health(state: Data<&Arc<MasterState>>) -> Json<serde_json::Value> {
    let nodes = state.registry.list_nodes();
    Json(serde_json::json!({
        "status": "ok",
        "role": "master",
        "nodes": nodes.len(),
        "online": nodes.iter().filter(|n| n.online).count(),
    }))
}

#[handler]
pub async fn index(state: Data<&Arc<MasterState>>, headers: &HeaderMap) -> Json<DashboardSummary> {
    let nodes = NodeListResponse::from(state.registry.list_nodes());
    Json(DashboardSummary {
        service: env!("CARGO_PKG_NAME").to_string(),
        role: "master".to_string(),
        authenticated: state
            .broker
            .is_authenticated(&PresentedCredentials::from_headers(headers)),
        open_mode: state.broker.open_mode(),
        with_slave: state.with_slave,
        nodes: nodes.count,
        online: nodes.online,
    })
}
