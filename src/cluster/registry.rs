//! Master-side table of known nodes.
//!
//! Presence is purely report-driven: a node is online while its last accepted
//! heartbeat is younger than the staleness threshold. The Master never polls
//! nodes itself.
//!
//! Storage is a `DashMap` keyed by node id; every operation holds a shard
//! lock only for a single lookup or update.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::types::{HeartbeatReport, NodeMetrics, NodeRole, NodeView};
use crate::error::ClusterError;
use crate::secret::ClusterSecret;

/// How often the Master sweeps long-absent records.
pub const PRUNE_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Stored state for one node.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub node_id: String,
    pub role: NodeRole,
    pub name: String,
    pub external_url: Url,
    pub ssh_user: Option<String>,
    pub season: Option<String>,
    pub metrics: NodeMetrics,
    pub last_heartbeat: Instant,
    pub last_seen: DateTime<Utc>,
    pub report_count: u64,
}

impl NodeRecord {
    fn view(&self, now: Instant, staleness_threshold: Duration) -> NodeView {
        let age = now.saturating_duration_since(self.last_heartbeat);
        NodeView {
            node_id: self.node_id.clone(),
            role: self.role,
            name: self.name.clone(),
            external_url: self.external_url.to_string(),
            ssh_user: self.ssh_user.clone(),
            season: self.season.clone(),
            metrics: self.metrics.clone(),
            last_seen: self.last_seen,
            seconds_since_seen: age.as_secs(),
            report_count: self.report_count,
            online: age <= staleness_threshold,
        }
    }
}

pub struct ClusterRegistry {
    nodes: DashMap<String, NodeRecord>,
    secret: ClusterSecret,
    staleness_threshold: Duration,
}

impl ClusterRegistry {
    pub fn new(secret: ClusterSecret, staleness_threshold: Duration) -> Self {
        Self {
            nodes: DashMap::new(),
            secret,
            staleness_threshold,
        }
    }

    pub fn staleness_threshold(&self) -> Duration {
        self.staleness_threshold
    }

    /// Accept or reject a heartbeat.
    ///
    /// The secret is checked before anything else, so a rejected report
    /// never touches stored state.
    pub fn report(&self, secret: &str, report: HeartbeatReport) -> Result<(), ClusterError> {
        if !self.secret.verify(secret) {
            warn!("Rejected heartbeat for node '{}': invalid secret", report.node_id);
            return Err(ClusterError::InvalidSecret);
        }

        let node_id = report.node_id.trim();
        if node_id.is_empty() {
            return Err(ClusterError::MalformedReport("node_id is empty".to_string()));
        }

        let external_url = Url::parse(report.external_url.trim()).map_err(|e| {
            ClusterError::MalformedReport(format!("external_url '{}': {}", report.external_url, e))
        })?;

        let now = Instant::now();
        let name = report
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| node_id.to_string());

        let mut entry = self
            .nodes
            .entry(node_id.to_string())
            .or_insert_with(|| {
                info!("Registered node '{}' ({}) at {}", node_id, report.role, external_url);
                NodeRecord {
                    node_id: node_id.to_string(),
                    role: report.role,
                    name: name.clone(),
                    external_url: external_url.clone(),
                    ssh_user: None,
                    season: None,
                    metrics: NodeMetrics::default(),
                    last_heartbeat: now,
                    last_seen: Utc::now(),
                    report_count: 0,
                }
            });

        let record = entry.value_mut();
        record.role = report.role;
        record.name = name;
        record.external_url = external_url;
        record.ssh_user = report.ssh_user;
        record.season = report.season.filter(|s| !s.trim().is_empty());
        record.metrics = report.metrics;
        record.last_heartbeat = now;
        record.last_seen = Utc::now();
        record.report_count += 1;

        debug!(
            "Heartbeat from '{}' (#{}, cpu {:.1}%)",
            record.node_id, record.report_count, record.metrics.cpu_pct
        );
        Ok(())
    }

    /// All known nodes ordered by node id, with derived liveness.
    pub fn list_nodes(&self) -> Vec<NodeView> {
        let now = Instant::now();
        let mut nodes: Vec<NodeView> = self
            .nodes
            .iter()
            .map(|entry| entry.view(now, self.staleness_threshold))
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    pub fn get_node(&self, node_id: &str) -> Result<NodeView, ClusterError> {
        self.nodes
            .get(node_id)
            .map(|entry| entry.view(Instant::now(), self.staleness_threshold))
            .ok_or_else(|| ClusterError::NodeNotFound(node_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Drop records whose last heartbeat is older than `absent_for`.
    pub fn prune(&self, absent_for: Duration) -> usize {
        let now = Instant::now();
        let before = self.nodes.len();
        self.nodes.retain(|node_id, record| {
            let keep = now.saturating_duration_since(record.last_heartbeat) <= absent_for;
            if !keep {
                info!("Pruned node '{}' after {:?} without a heartbeat", node_id, absent_for);
            }
            keep
        });
        before.saturating_sub(self.nodes.len())
    }

    /// Periodically prune long-absent records until `shutdown` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        every: Duration,
        absent_for: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.prune(absent_for);
                    }
                }
            }
        })
    }
}
