//! Startup configuration.
//!
//! Values resolve with the usual three-tier priority, implemented by clap:
//!
//! 1. **Flag** - explicit command-line argument (highest priority)
//! 2. **Environment Variable** - also read from a `.env` file via `dotenv`
//! 3. **Default** - built-in default value (lowest priority)
//!
//! The flat flag surface is validated once into [`Config`], whose [`Role`]
//! variant carries only the fields that role needs.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `WEBSSH_MODE` | standalone | `master`, `slave` or `standalone` |
//! | `WEBSSH_ADDRESS` / `WEBSSH_PORT` | 0.0.0.0 / 8888 | Listen address |
//! | `CLUSTER_SECRET` | - | Shared secret (master and slave) |
//! | `AUTH_PASSWORD` | - | Dashboard password (master, empty = open mode) |
//! | `MASTER_URL` | - | Master base URL (slave) |
//! | `EXTERNAL_URL` | `http://127.0.0.1:<port>` | URL browsers use to reach this node |
//! | `REPORT_INTERVAL_SECS` | 10 | Heartbeat interval |
//! | `STALENESS_FACTOR` | 3 | Missed intervals before a node is offline |
//! | `SESSION_IDLE_TIMEOUT_SECS` | 1800 | Idle terminal timeout, 0 disables |
//! | `SSH_CONNECT_TIMEOUT` | 30s | SSH connection timeout in seconds |
//! | `SSH_MAX_RETRIES` | 1 | Retries for transient SSH connect failures |
//! | `SSH_RETRY_DELAY_MS` | 1000ms | Initial retry delay in milliseconds |
//! | `SSH_KEY_FILE` | - | Default private key for token sessions |

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use url::Url;

use crate::error::ConfigError;
use crate::secret::ClusterSecret;

/// Default SSH connection timeout in seconds
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default retry attempts for transient SSH connect failures
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 1;

/// Default retry delay in milliseconds
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Maximum retry delay cap for SSH connects
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Default heartbeat interval in seconds
pub(crate) const DEFAULT_REPORT_INTERVAL_SECS: u64 = 10;

/// Missed intervals tolerated before a node flips offline
pub(crate) const DEFAULT_STALENESS_FACTOR: u32 = 3;

/// Upper bound for the reporter's failure backoff
pub const MAX_REPORT_BACKOFF: Duration = Duration::from_secs(60);

/// Records silent for this long are dropped from the cluster registry
pub(crate) const DEFAULT_PRUNE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Default idle timeout for terminal sessions in seconds
pub(crate) const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30 * 60;

/// Default lifetime of a redirect token in seconds
pub(crate) const DEFAULT_TOKEN_TTL_SECS: u64 = 120;

/// Input bytes buffered while a session is still connecting
pub(crate) const DEFAULT_MAX_PENDING_INPUT: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Master,
    Slave,
    Standalone,
}

/// Browser SSH terminals with a master/slave heartbeat dashboard.
#[derive(Debug, Clone, Parser)]
#[command(name = "webssh-cluster", version)]
pub struct Cli {
    /// Node role.
    #[arg(long, env = "WEBSSH_MODE", value_enum, default_value_t = Mode::Standalone)]
    pub mode: Mode,

    /// Listen address.
    #[arg(long, env = "WEBSSH_ADDRESS", default_value = "0.0.0.0")]
    pub address: String,

    /// Listen port.
    #[arg(long, env = "WEBSSH_PORT", default_value_t = 8888)]
    pub port: u16,

    /// Shared cluster secret.
    #[arg(long, env = "CLUSTER_SECRET", hide_env_values = true)]
    pub secret: Option<String>,

    /// Dashboard password (master). Empty means open mode.
    #[arg(long, env = "AUTH_PASSWORD", hide_env_values = true)]
    pub auth_password: Option<String>,

    /// Also serve terminals from the master under /webssh.
    #[arg(long, env = "WITH_SLAVE", default_value_t = false)]
    pub with_slave: bool,

    /// Master base URL (slave).
    #[arg(long, env = "MASTER_URL")]
    pub master_url: Option<String>,

    /// URL browsers use to reach this node.
    #[arg(long, env = "EXTERNAL_URL")]
    pub external_url: Option<String>,

    /// Node id reported to the master. Derived from the external URL when unset.
    #[arg(long, env = "NODE_ID")]
    pub node_id: Option<String>,

    /// Display name reported to the master. Defaults to the hostname.
    #[arg(long, env = "NODE_NAME")]
    pub node_name: Option<String>,

    /// Default SSH host for sessions opened from a redirect token.
    #[arg(long, env = "SSH_HOST", default_value = "127.0.0.1")]
    pub ssh_host: String,

    #[arg(long, env = "SSH_PORT", default_value_t = 22)]
    pub ssh_port: u16,

    #[arg(long, env = "SSH_USER")]
    pub ssh_user: Option<String>,

    #[arg(long, env = "SSH_PASSWORD", hide_env_values = true)]
    pub ssh_password: Option<String>,

    /// Private key file used for token sessions that bring no credentials.
    #[arg(long, env = "SSH_KEY_FILE")]
    pub ssh_key_file: Option<PathBuf>,

    /// Heartbeat interval in seconds.
    #[arg(long, env = "REPORT_INTERVAL_SECS", default_value_t = DEFAULT_REPORT_INTERVAL_SECS)]
    pub report_interval: u64,

    /// Intervals without a heartbeat before a node is shown offline.
    #[arg(long, env = "STALENESS_FACTOR", default_value_t = DEFAULT_STALENESS_FACTOR)]
    pub staleness_factor: u32,

    /// Idle terminal timeout in seconds, 0 disables.
    #[arg(long, env = "SESSION_IDLE_TIMEOUT_SECS", default_value_t = DEFAULT_IDLE_TIMEOUT_SECS)]
    pub idle_timeout: u64,

    /// Redirect token lifetime in seconds.
    #[arg(long, env = "REDIRECT_TOKEN_TTL_SECS", default_value_t = DEFAULT_TOKEN_TTL_SECS)]
    pub token_ttl: u64,

    /// SSH connection timeout in seconds.
    #[arg(long, env = "SSH_CONNECT_TIMEOUT", default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS)]
    pub connect_timeout: u64,

    /// Retries for transient SSH connect failures.
    #[arg(long, env = "SSH_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Initial SSH retry delay in milliseconds.
    #[arg(long, env = "SSH_RETRY_DELAY_MS", default_value_t = DEFAULT_RETRY_DELAY_MS)]
    pub retry_delay_ms: u64,
}

/// SSH target a node falls back to when a token leaves fields empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshDefaults {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub key_file: Option<PathBuf>,
}

/// Settings for the terminal bridge, shared by every role.
#[derive(Debug, Clone)]
pub struct TerminalConfig {
    pub connect_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_pending_input: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            idle_timeout: Some(Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS)),
            max_pending_input: DEFAULT_MAX_PENDING_INPUT,
        }
    }
}

/// Identity and defaults of a terminal-serving node.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub node_id: String,
    pub name: String,
    pub external_url: Url,
    pub ssh: SshDefaults,
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub secret: ClusterSecret,
    pub auth_password: Option<String>,
    pub report_interval: Duration,
    pub staleness_threshold: Duration,
    pub token_ttl: Duration,
    pub prune_after: Duration,
    /// Present when the master also serves terminals (`--with-slave`).
    pub embedded_node: Option<NodeSettings>,
}

#[derive(Debug, Clone)]
pub struct SlaveConfig {
    pub secret: ClusterSecret,
    pub master_url: Url,
    pub report_interval: Duration,
    pub node: NodeSettings,
}

#[derive(Debug, Clone)]
pub struct StandaloneConfig {
    pub ssh: SshDefaults,
}

#[derive(Debug, Clone)]
pub enum Role {
    Master(MasterConfig),
    Slave(SlaveConfig),
    Standalone(StandaloneConfig),
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Master(_) => "master",
            Role::Slave(_) => "slave",
            Role::Standalone(_) => "standalone",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub address: String,
    pub port: u16,
    pub role: Role,
    pub terminal: TerminalConfig,
}

impl Config {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Validate the flat flag surface into a role-specific configuration.
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let terminal = TerminalConfig {
            connect_timeout: Duration::from_secs(cli.connect_timeout.max(1)),
            max_retries: cli.max_retries,
            retry_delay: Duration::from_millis(cli.retry_delay_ms),
            idle_timeout: (cli.idle_timeout > 0).then(|| Duration::from_secs(cli.idle_timeout)),
            max_pending_input: DEFAULT_MAX_PENDING_INPUT,
        };

        let ssh = SshDefaults {
            host: cli.ssh_host.clone(),
            port: cli.ssh_port,
            user: non_empty(cli.ssh_user.clone()),
            password: non_empty(cli.ssh_password.clone()),
            key_file: cli.ssh_key_file.clone().filter(|p| !p.as_os_str().is_empty()),
        };

        let role = match cli.mode {
            Mode::Standalone => Role::Standalone(StandaloneConfig { ssh }),
            Mode::Master => {
                let secret = require_secret("master", cli.secret.clone())?;
                let report_interval = report_interval(cli.report_interval)?;
                if cli.staleness_factor == 0 {
                    return Err(ConfigError::Invalid {
                        field: "staleness_factor",
                        reason: "must be at least 1".to_string(),
                    });
                }
                let embedded_node = if cli.with_slave {
                    let external = match &cli.external_url {
                        Some(url) => parse_url("external_url", url)?,
                        None => parse_url(
                            "external_url",
                            &format!("http://127.0.0.1:{}/webssh", cli.port),
                        )?,
                    };
                    Some(NodeSettings {
                        node_id: cli
                            .node_id
                            .clone()
                            .unwrap_or_else(|| "master-local".to_string()),
                        name: cli
                            .node_name
                            .clone()
                            .unwrap_or_else(|| "Master-Local".to_string()),
                        external_url: external,
                        ssh,
                    })
                } else {
                    None
                };
                Role::Master(MasterConfig {
                    secret,
                    auth_password: non_empty(cli.auth_password.clone()),
                    report_interval,
                    staleness_threshold: report_interval * cli.staleness_factor,
                    token_ttl: Duration::from_secs(cli.token_ttl.max(1)),
                    prune_after: DEFAULT_PRUNE_AFTER,
                    embedded_node,
                })
            }
            Mode::Slave => {
                let secret = require_secret("slave", cli.secret.clone())?;
                let master_url = match non_empty(cli.master_url.clone()) {
                    Some(url) => parse_url("master_url", &url)?,
                    None => {
                        return Err(ConfigError::Missing {
                            mode: "slave",
                            field: "--master-url",
                        });
                    }
                };
                let external_url = match &cli.external_url {
                    Some(url) => parse_url("external_url", url)?,
                    None => parse_url("external_url", &format!("http://127.0.0.1:{}", cli.port))?,
                };
                let hostname = sysinfo::System::host_name();
                let node_id = derive_node_id(
                    cli.node_id.as_deref(),
                    &external_url,
                    hostname.as_deref(),
                );
                let name = non_empty(cli.node_name.clone())
                    .or(hostname)
                    .unwrap_or_else(|| node_id.clone());
                Role::Slave(SlaveConfig {
                    secret,
                    master_url,
                    report_interval: report_interval(cli.report_interval)?,
                    node: NodeSettings {
                        node_id,
                        name,
                        external_url,
                        ssh,
                    },
                })
            }
        };

        Ok(Config {
            address: cli.address,
            port: cli.port,
            role,
            terminal,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn require_secret(mode: &'static str, secret: Option<String>) -> Result<ClusterSecret, ConfigError> {
    non_empty(secret)
        .map(ClusterSecret::new)
        .ok_or(ConfigError::Missing {
            mode,
            field: "--secret",
        })
}

fn report_interval(secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::Invalid {
            field: "report_interval",
            reason: "must be at least 1 second".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

fn parse_url(field: &'static str, raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::Invalid {
        field,
        reason: format!("{}: {}", raw, e),
    })?;
    if url.host_str().is_none() {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("{}: missing host", raw),
        });
    }
    Ok(url)
}

/// Node id priority: explicit flag, then external URL `host[:port]`, then hostname.
pub(crate) fn derive_node_id(explicit: Option<&str>, external_url: &Url, hostname: Option<&str>) -> String {
    if let Some(id) = explicit.map(str::trim)
        && !id.is_empty()
    {
        return id.to_string();
    }

    if let Some(host) = external_url.host_str()
        && host != "127.0.0.1"
        && host != "localhost"
    {
        return match external_url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
    }

    hostname
        .map(str::to_string)
        .unwrap_or_else(|| external_url.as_str().trim_end_matches('/').to_string())
}
