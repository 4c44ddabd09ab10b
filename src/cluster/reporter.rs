//! Slave-side heartbeat loop.
//!
//! Every tick samples local metrics and pushes a [`HeartbeatReport`] to the
//! Master. Failures never stop the loop: the next attempt is pushed back by
//! an exponential backoff (starting at the report interval, capped at
//! [`MAX_REPORT_BACKOFF`](crate::config::MAX_REPORT_BACKOFF)) and a success
//! resets the schedule. Meanwhile the Master simply sees the node go stale.

use std::net::IpAddr;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use reqwest::StatusCode;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::metrics::MetricsSampler;
use super::types::{HeartbeatReport, NodeMetrics, NodeRole};
use crate::config::NodeSettings;
use crate::secret::{ClusterSecret, SECRET_HEADER};

/// Upper bound for a single heartbeat request.
const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("master unreachable: {0}")]
    Network(String),
    #[error("master rejected the cluster secret (HTTP {0})")]
    Rejected(u16),
    #[error("master answered HTTP {0}")]
    Unexpected(u16),
}

/// Delay schedule between heartbeat attempts.
pub(crate) struct ReportSchedule {
    interval: Duration,
    builder: ExponentialBuilder,
    failures: Option<ExponentialBackoff>,
    max: Duration,
}

impl ReportSchedule {
    pub(crate) fn new(interval: Duration, max: Duration, jitter: bool) -> Self {
        let max = max.max(interval);
        let mut builder = ExponentialBuilder::default()
            .with_min_delay(interval)
            .with_max_delay(max)
            .with_factor(2.0)
            .without_max_times();
        if jitter {
            builder = builder.with_jitter();
        }
        Self {
            interval,
            builder,
            failures: None,
            max,
        }
    }

    pub(crate) fn next_delay(&mut self, succeeded: bool) -> Duration {
        if succeeded {
            self.failures = None;
            return self.interval;
        }
        let builder = self.builder;
        self.failures
            .get_or_insert_with(|| builder.build())
            .next()
            .unwrap_or(self.max)
    }
}

pub struct NodeReporter<S> {
    client: reqwest::Client,
    endpoint: Url,
    secret: ClusterSecret,
    role: NodeRole,
    node: NodeSettings,
    interval: Duration,
    max_backoff: Duration,
    /// Lent to a blocking thread while a sample runs.
    sampler: Option<S>,
}

impl<S: MetricsSampler + 'static> NodeReporter<S> {
    pub fn new(
        master_url: &Url,
        secret: ClusterSecret,
        role: NodeRole,
        node: NodeSettings,
        interval: Duration,
        max_backoff: Duration,
        sampler: S,
    ) -> Result<Self, ReportError> {
        let endpoint = heartbeat_endpoint(master_url)?;
        let client = reqwest::Client::builder()
            .timeout(PUSH_TIMEOUT.min(interval.max(Duration::from_secs(1))))
            .build()
            .map_err(|e| ReportError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            secret,
            role,
            node,
            interval,
            max_backoff,
            sampler: Some(sampler),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Runs the sampler on the blocking pool so process and disk scans never
    /// hold a runtime worker.
    async fn sample(&mut self) -> NodeMetrics {
        let Some(mut sampler) = self.sampler.take() else {
            return NodeMetrics::default();
        };
        let joined = tokio::task::spawn_blocking(move || {
            let metrics = sampler.sample();
            (sampler, metrics)
        })
        .await;
        match joined {
            Ok((sampler, metrics)) => {
                self.sampler = Some(sampler);
                metrics
            }
            Err(e) => {
                warn!("Metrics sampler lost: {}", e);
                NodeMetrics::default()
            }
        }
    }

    pub async fn build_report(&mut self) -> HeartbeatReport {
        HeartbeatReport {
            node_id: self.node.node_id.clone(),
            role: self.role,
            external_url: self.node.external_url.to_string(),
            name: Some(self.node.name.clone()),
            ssh_user: self.node.ssh.user.clone(),
            season: derive_season(&self.node.ssh.host),
            secret: Some(self.secret.expose().to_string()),
            metrics: self.sample().await,
        }
    }

    /// Sample and push a single heartbeat.
    pub async fn push_once(&mut self) -> Result<(), ReportError> {
        let report = self.build_report().await;
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(SECRET_HEADER, self.secret.expose())
            .json(&report)
            .send()
            .await
            .map_err(|e| ReportError::Network(e.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(ReportError::Rejected(response.status().as_u16()))
            }
            status => Err(ReportError::Unexpected(status.as_u16())),
        }
    }

    /// Push heartbeats until `shutdown` fires. The first push happens immediately.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            "Reporting node '{}' to {} every {:?}",
            self.node.node_id, self.endpoint, self.interval
        );
        let mut schedule = ReportSchedule::new(self.interval, self.max_backoff, true);
        let mut delay = Duration::ZERO;
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.push_once() => result,
            };

            let succeeded = match result {
                Ok(()) => {
                    if failures > 0 {
                        info!("Heartbeat to {} recovered after {} failure(s)", self.endpoint, failures);
                    }
                    debug!("Heartbeat sent to {}", self.endpoint);
                    failures = 0;
                    true
                }
                Err(e) => {
                    failures += 1;
                    warn!("Heartbeat to {} failed ({} in a row): {}", self.endpoint, failures, e);
                    false
                }
            };
            delay = schedule.next_delay(succeeded);
        }

        info!("Reporter for node '{}' stopped", self.node.node_id);
    }
}

/// Hosting label for a node's SSH host: an `s<N>` prefix when present
/// (`s7.serv00.com` is `s7`), else the first DNS label. IP literals have none.
pub fn derive_season(host: &str) -> Option<String> {
    let host = host.trim();
    if host.is_empty() || host.parse::<IpAddr>().is_ok() {
        return None;
    }
    let digits = host
        .strip_prefix('s')
        .map(|rest| rest.bytes().take_while(u8::is_ascii_digit).count())
        .unwrap_or(0);
    if digits > 0 {
        return Some(host[..=digits].to_string());
    }
    host.split('.')
        .next()
        .filter(|label| !label.is_empty())
        .map(str::to_string)
}

fn heartbeat_endpoint(master_url: &Url) -> Result<Url, ReportError> {
    let raw = format!("{}/api/heartbeat", master_url.as_str().trim_end_matches('/'));
    Url::parse(&raw).map_err(|e| ReportError::Network(format!("Invalid master URL {}: {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::types::NodeMetrics;
    use crate::config::SshDefaults;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct FixedSampler(f32);

    impl MetricsSampler for FixedSampler {
        fn sample(&mut self) -> NodeMetrics {
            NodeMetrics {
                cpu_pct: self.0,
                mem_used: 1,
                mem_total: 2,
                ..Default::default()
            }
        }
    }

    fn node() -> NodeSettings {
        NodeSettings {
            node_id: "s1".to_string(),
            name: "Slave One".to_string(),
            external_url: Url::parse("http://s1.example.com:8888").unwrap(),
            ssh: SshDefaults {
                host: "127.0.0.1".to_string(),
                port: 22,
                user: Some("alice".to_string()),
                password: Some("pw".to_string()),
                key_file: None,
            },
        }
    }

    /// Blocks its thread like a full process and disk scan on a busy host.
    struct SlowSampler {
        calls: u32,
    }

    impl MetricsSampler for SlowSampler {
        fn sample(&mut self) -> NodeMetrics {
            std::thread::sleep(Duration::from_millis(400));
            self.calls += 1;
            NodeMetrics {
                cpu_pct: self.calls as f32,
                ..Default::default()
            }
        }
    }

    fn reporter_with<S: MetricsSampler + 'static>(master: &str, sampler: S) -> NodeReporter<S> {
        NodeReporter::new(
            &Url::parse(master).unwrap(),
            ClusterSecret::new("s3cret"),
            NodeRole::Slave,
            node(),
            Duration::from_secs(10),
            Duration::from_secs(60),
            sampler,
        )
        .unwrap()
    }

    fn reporter(master: &str) -> NodeReporter<FixedSampler> {
        reporter_with(master, FixedSampler(12.0))
    }

    /// Answer exactly one HTTP request with `status`, returning the raw request text.
    async fn one_shot_server(status: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }
            let body = "{\"status\":\"ok\"}";
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).into_owned()
        });
        (format!("http://{}", addr), handle)
    }

    mod endpoint {
        use super::*;

        #[test]
        fn test_trailing_slash_trimmed() {
            let url = heartbeat_endpoint(&Url::parse("http://master:8888/").unwrap()).unwrap();
            assert_eq!(url.as_str(), "http://master:8888/api/heartbeat");
        }

        #[test]
        fn test_path_prefix_kept() {
            let url = heartbeat_endpoint(&Url::parse("https://proxy.example.com/cluster").unwrap()).unwrap();
            assert_eq!(url.as_str(), "https://proxy.example.com/cluster/api/heartbeat");
        }
    }

    mod report_body {
        use super::*;

        #[tokio::test]
        async fn test_report_carries_identity_and_metrics() {
            let mut reporter = reporter("http://master:8888");
            let report = reporter.build_report().await;
            assert_eq!(report.node_id, "s1");
            assert_eq!(report.role, NodeRole::Slave);
            assert_eq!(report.external_url, "http://s1.example.com:8888/");
            assert_eq!(report.name.as_deref(), Some("Slave One"));
            assert_eq!(report.ssh_user.as_deref(), Some("alice"));
            assert_eq!(report.secret.as_deref(), Some("s3cret"));
            assert_eq!(report.metrics.cpu_pct, 12.0);
        }

        #[tokio::test]
        async fn test_report_never_carries_ssh_password() {
            let mut reporter = reporter("http://master:8888");
            let json = serde_json::to_string(&reporter.build_report().await).unwrap();
            assert!(!json.contains("\"pw\""));
        }

        #[tokio::test]
        async fn test_ip_host_has_no_season() {
            let mut reporter = reporter("http://master:8888");
            assert_eq!(reporter.build_report().await.season, None);
        }

        #[tokio::test]
        async fn test_slow_sampler_does_not_stall_runtime() {
            let mut reporter = reporter_with("http://master:8888", SlowSampler { calls: 0 });
            let started = tokio::time::Instant::now();
            let building = tokio::spawn(async move {
                let first = reporter.build_report().await;
                let second = reporter.build_report().await;
                (first, second)
            });
            tokio::task::yield_now().await;

            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(started.elapsed() < Duration::from_millis(200));

            let (first, second) = building.await.unwrap();
            assert_eq!(first.metrics.cpu_pct, 1.0);
            // The sampler comes back from the blocking pool and keeps its state.
            assert_eq!(second.metrics.cpu_pct, 2.0);
        }
    }

    mod season {
        use super::*;

        #[test]
        fn test_numbered_prefix() {
            assert_eq!(derive_season("s1.serv00.com").as_deref(), Some("s1"));
            assert_eq!(derive_season("s12-panel.ct8.pl").as_deref(), Some("s12"));
        }

        #[test]
        fn test_first_label_fallback() {
            assert_eq!(derive_season("web.example.com").as_deref(), Some("web"));
            assert_eq!(derive_season("localhost").as_deref(), Some("localhost"));
            assert_eq!(derive_season("sandbox.example.com").as_deref(), Some("sandbox"));
        }

        #[test]
        fn test_ip_and_empty_hosts() {
            assert_eq!(derive_season("127.0.0.1"), None);
            assert_eq!(derive_season("::1"), None);
            assert_eq!(derive_season("  "), None);
        }
    }

    mod push {
        use super::*;

        #[tokio::test]
        async fn test_push_success_sends_secret_header() {
            let (url, server) = one_shot_server("200 OK").await;
            let mut reporter = reporter(&url);
            reporter.push_once().await.unwrap();

            let request = server.await.unwrap();
            assert!(request.starts_with("POST /api/heartbeat"));
            assert!(request.to_lowercase().contains("x-cluster-secret: s3cret"));
            assert!(request.contains("\"node_id\":\"s1\""));
        }

        #[tokio::test]
        async fn test_push_rejected() {
            let (url, _server) = one_shot_server("403 Forbidden").await;
            let mut reporter = reporter(&url);
            let err = reporter.push_once().await.unwrap_err();
            assert!(matches!(err, ReportError::Rejected(403)));
        }

        #[tokio::test]
        async fn test_push_unreachable() {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            drop(listener);

            let mut reporter = reporter(&format!("http://{}", addr));
            let err = reporter.push_once().await.unwrap_err();
            assert!(matches!(err, ReportError::Network(_)));
        }

        #[tokio::test]
        async fn test_run_stops_on_shutdown() {
            let reporter = reporter("http://127.0.0.1:9");
            let shutdown = CancellationToken::new();
            let handle = tokio::spawn(reporter.run(shutdown.clone()));
            shutdown.cancel();
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }

    mod schedule {
        use super::*;

        #[test]
        fn test_success_keeps_interval() {
            let mut schedule = ReportSchedule::new(Duration::from_secs(10), Duration::from_secs(60), false);
            assert_eq!(schedule.next_delay(true), Duration::from_secs(10));
            assert_eq!(schedule.next_delay(true), Duration::from_secs(10));
        }

        #[test]
        fn test_failures_back_off_up_to_cap() {
            let mut schedule = ReportSchedule::new(Duration::from_secs(10), Duration::from_secs(60), false);
            let delays: Vec<_> = (0..8).map(|_| schedule.next_delay(false)).collect();

            assert!(delays[0] >= Duration::from_secs(10));
            assert!(delays[2] > delays[0]);
            assert!(delays.iter().all(|d| *d <= Duration::from_secs(60)));
            assert_eq!(*delays.last().unwrap(), Duration::from_secs(60));
        }

        #[test]
        fn test_success_resets_backoff() {
            let mut schedule = ReportSchedule::new(Duration::from_secs(10), Duration::from_secs(60), false);
            for _ in 0..5 {
                schedule.next_delay(false);
            }
            assert_eq!(schedule.next_delay(true), Duration::from_secs(10));
            assert!(schedule.next_delay(false) < Duration::from_secs(60));
        }

        #[test]
        fn test_cap_below_interval_is_raised() {
            let mut schedule = ReportSchedule::new(Duration::from_secs(30), Duration::from_secs(5), false);
            assert!(schedule.next_delay(false) >= Duration::from_secs(30));
        }
    }
}
