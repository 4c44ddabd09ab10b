//! Wire and view types for the heartbeat protocol.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Master,
    #[default]
    Slave,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Master => write!(f, "master"),
            NodeRole::Slave => write!(f, "slave"),
        }
    }
}

/// Resource snapshot sampled by a node. Memory and disk are in bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeMetrics {
    pub cpu_pct: f32,
    pub mem_used: u64,
    pub mem_total: u64,
    pub disk_used: u64,
    pub disk_total: u64,
    pub process_count: u64,
}

/// Heartbeat body pushed by a node to `POST /api/heartbeat`.
///
/// The secret may travel in the body or in the `X-Cluster-Secret` header.
#[derive(Clone, Serialize, Deserialize)]
pub struct HeartbeatReport {
    pub node_id: String,
    #[serde(default)]
    pub role: NodeRole,
    pub external_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_user: Option<String>,
    /// Short hosting label derived from the node's SSH host (`s1.serv00.com` is `s1`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default)]
    pub metrics: NodeMetrics,
}

impl fmt::Debug for HeartbeatReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeartbeatReport")
            .field("node_id", &self.node_id)
            .field("role", &self.role)
            .field("external_url", &self.external_url)
            .field("name", &self.name)
            .field("season", &self.season)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

/// Acknowledgement returned for an accepted heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportAck {
    pub status: String,
}

impl ReportAck {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

/// Dashboard view of a node with its derived liveness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeView {
    pub node_id: String,
    pub role: NodeRole,
    pub name: String,
    pub external_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season: Option<String>,
    pub metrics: NodeMetrics,
    /// Wall-clock time of the last accepted heartbeat (RFC3339)
    pub last_seen: DateTime<Utc>,
    pub seconds_since_seen: u64,
    pub report_count: u64,
    pub online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeListResponse {
    pub nodes: Vec<NodeView>,
    pub count: usize,
    pub online: usize,
}

impl From<Vec<NodeView>> for NodeListResponse {
    fn from(nodes: Vec<NodeView>) -> Self {
        let online = nodes.iter().filter(|n| n.online).count();
        Self {
            count: nodes.len(),
            online,
            nodes,
        }
    }
}
