//! russh-backed shell channels.
//!
//! ## Connection Lifecycle
//!
//! 1. **Client Configuration**: keepalive every 30 seconds (max 3 missed), no
//!    inactivity timeout. Idle sessions are the bridge's business.
//! 2. **Connection Establishment**: TCP + SSH handshake bounded by the connect
//!    timeout. Host keys are accepted without verification.
//! 3. **Authentication**: an [`AuthChain`] built from the supplied credentials.
//! 4. **Shell**: `xterm-256color` PTY at the requested size, then a login shell.
//!    The channel is split so reads and writes never contend.
//!
//! ## Retry Strategy
//!
//! Transient connect failures (refused, reset, unreachable) are retried with
//! exponential backoff and jitter via `backon`, starting at the configured
//! retry delay and capped at [`MAX_RETRY_DELAY`]. Authentication failures and
//! timeouts are never retried. The whole attempt, retries included, is
//! bounded by the caller's timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use russh::{ChannelMsg, ChannelReadHalf, ChannelWriteHalf, Disconnect, client, keys};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::auth::{AuthChain, AuthStrategy};
use super::channel::{ChannelReader, ChannelWriter, ShellChannel, ShellConnector};
use super::types::{Credentials, SshTarget, TermSize};
use crate::config::{MAX_RETRY_DELAY, TerminalConfig};
use crate::error::{ChannelError, ConnectError};

const TERM: &str = "xterm-256color";

/// Client handler that accepts all host keys, like `StrictHostKeyChecking=no`.
pub struct ShellClientHandler;

impl client::Handler for ShellClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub(crate) fn build_client_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    })
}

/// Opens shells over SSH with russh.
pub struct RusshConnector {
    max_retries: u32,
    retry_delay: Duration,
}

impl RusshConnector {
    pub fn new(config: &TerminalConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
        }
    }

    async fn connect_with_retry(
        &self,
        target: &SshTarget,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<client::Handle<ShellClientHandler>, ConnectError> {
        let attempt_counter = AtomicU32::new(0);

        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.retry_delay)
            .with_max_delay(MAX_RETRY_DELAY)
            .with_max_times(self.max_retries as usize)
            .with_jitter();

        let result = (|| async {
            let current_attempt = attempt_counter.fetch_add(1, Ordering::SeqCst);
            if current_attempt > 0 {
                warn!("SSH connection retry attempt {} to {}", current_attempt, target);
            }
            connect_once(target, credentials, timeout).await
        })
        .retry(backoff)
        .when(|e: &ConnectError| {
            let retryable = e.is_retryable();
            if !retryable {
                warn!("SSH connection to {} failed with non-retryable error: {}", target, e);
            }
            retryable
        })
        .notify(|err: &ConnectError, dur: Duration| {
            warn!("SSH connection failed: {}. Retrying in {:?}", err, dur);
        })
        .await;

        let total_attempts = attempt_counter.load(Ordering::SeqCst);
        match result {
            Ok(handle) => {
                if total_attempts > 1 {
                    info!(
                        "SSH connection to {} succeeded after {} retry attempt(s)",
                        target,
                        total_attempts - 1
                    );
                }
                Ok(handle)
            }
            Err(e) => {
                error!(
                    "SSH connection to {} failed after {} attempt(s). Last error: {}",
                    target, total_attempts, e
                );
                Err(e)
            }
        }
    }

    async fn open_shell(
        &self,
        target: &SshTarget,
        credentials: &Credentials,
        size: TermSize,
        timeout: Duration,
    ) -> Result<ShellChannel, ConnectError> {
        let handle = self.connect_with_retry(target, credentials, timeout).await?;

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| ConnectError::Unreachable(format!("Failed to open channel: {}", e)))?;
        channel
            .request_pty(true, TERM, size.cols as u32, size.rows as u32, 0, 0, &[])
            .await
            .map_err(|e| ConnectError::Unreachable(format!("Failed to request PTY: {}", e)))?;
        channel
            .request_shell(true)
            .await
            .map_err(|e| ConnectError::Unreachable(format!("Failed to start shell: {}", e)))?;

        let (read_half, write_half) = channel.split();
        debug!("Shell opened to {} ({}x{})", target, size.cols, size.rows);

        Ok(ShellChannel::new(
            Box::new(RusshReader::new(read_half)),
            Arc::new(RusshWriter::new(write_half, handle)),
        ))
    }
}

impl Default for RusshConnector {
    fn default() -> Self {
        Self::new(&TerminalConfig::default())
    }
}

#[async_trait]
impl ShellConnector for RusshConnector {
    async fn open(
        &self,
        target: &SshTarget,
        credentials: &Credentials,
        size: TermSize,
        timeout: Duration,
    ) -> Result<ShellChannel, ConnectError> {
        tokio::time::timeout(timeout, self.open_shell(target, credentials, size, timeout))
            .await
            .map_err(|_| ConnectError::Timeout(format!("Connection timed out after {:?}", timeout)))?
    }
}

async fn connect_once(
    target: &SshTarget,
    credentials: &Credentials,
    timeout: Duration,
) -> Result<client::Handle<ShellClientHandler>, ConnectError> {
    let connect_future = client::connect(
        build_client_config(),
        (target.host.as_str(), target.port),
        ShellClientHandler,
    );

    let mut handle = tokio::time::timeout(timeout, connect_future)
        .await
        .map_err(|_| ConnectError::Timeout(format!("Connection timed out after {:?}", timeout)))?
        .map_err(|e| ConnectError::classify(format!("Failed to connect: {}", e)))?;

    // Anything going wrong past the handshake is an authentication problem.
    let auth_chain = AuthChain::from_credentials(credentials);
    match auth_chain.authenticate(&mut handle, &target.user).await {
        Ok(true) => Ok(handle),
        Ok(false) => Err(ConnectError::AuthFailed(
            "Authentication failed: no authentication methods succeeded".to_string(),
        )),
        Err(e) => Err(ConnectError::AuthFailed(e)),
    }
}

/// Read half. Keeps the unread tail of the last message for the next call.
pub struct RusshReader {
    read_half: ChannelReadHalf,
    pending: Vec<u8>,
}

impl RusshReader {
    fn new(read_half: ChannelReadHalf) -> Self {
        Self {
            read_half,
            pending: Vec::new(),
        }
    }

    fn drain_into(&mut self, buf: &mut [u8]) -> usize {
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        n
    }
}

#[async_trait]
impl ChannelReader for RusshReader {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.pending.is_empty() {
            return Ok(self.drain_into(buf));
        }

        loop {
            match self.read_half.wait().await {
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    if data.is_empty() {
                        continue;
                    }
                    self.pending.extend_from_slice(&data);
                    return Ok(self.drain_into(buf));
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!("Remote shell exited with status {}", exit_status);
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => return Ok(0),
                Some(_) => {}
            }
        }
    }
}

/// Write half plus the connection handle, so closing also disconnects.
pub struct RusshWriter {
    write_half: Mutex<ChannelWriteHalf<client::Msg>>,
    handle: client::Handle<ShellClientHandler>,
    closed: AtomicBool,
}

impl RusshWriter {
    fn new(write_half: ChannelWriteHalf<client::Msg>, handle: client::Handle<ShellClientHandler>) -> Self {
        Self {
            write_half: Mutex::new(write_half),
            handle,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ChannelWriter for RusshWriter {
    async fn write(&self, data: &[u8]) -> Result<usize, ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        self.write_half
            .lock()
            .await
            .data(data)
            .await
            .map_err(|e| ChannelError::Io(format!("Failed to write to shell: {}", e)))?;
        Ok(data.len())
    }

    async fn resize(&self, size: TermSize) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        self.write_half
            .lock()
            .await
            .window_change(size.cols as u32, size.rows as u32, 0, 0)
            .await
            .map_err(|e| ChannelError::Io(format!("Failed to resize shell: {}", e)))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // A write stuck on a full window holds the lock; disconnecting unblocks it.
        if let Ok(write_half) = self.write_half.try_lock() {
            let _ = write_half.eof().await;
            let _ = write_half.close().await;
        }
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "session closed", "en")
            .await
        {
            debug!("SSH disconnect after close: {}", e);
        }
    }
}
