//! Master/Slave coordination: heartbeats, node liveness and access brokering.

pub mod broker;
pub mod metrics;
pub mod registry;
pub mod reporter;
pub mod token;
pub mod types;

pub use broker::{AUTH_COOKIE, AccessBroker, DashboardSession, PresentedCredentials};
pub use metrics::{MetricsSampler, SysinfoSampler};
pub use registry::{ClusterRegistry, PRUNE_SWEEP_INTERVAL};
pub use reporter::{NodeReporter, ReportError};
pub use token::{RedirectToken, SshOverrides, TokenVerifier};
pub use types::{HeartbeatReport, NodeListResponse, NodeMetrics, NodeRole, NodeView, ReportAck};
