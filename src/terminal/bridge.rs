//! One interactive session between a client stream and a shell channel.
//!
//! # States
//!
//! `Opening -> Active -> Closing -> Closed`, or `Opening -> Closed` when the
//! shell never opens.
//!
//! - **Opening**: the connector runs while client input is buffered (up to
//!   `max_pending_input`, after which the client is no longer read) and the
//!   latest resize is remembered. A client close or a termination aborts the
//!   open by dropping it.
//! - **Active**: two direction futures, an idle watchdog and the termination
//!   token race inside this task. Each direction awaits its write before its
//!   next read, so a slow consumer stalls the opposite producer.
//! - **Closing**: the losing futures are dropped (cancelling their in-flight
//!   reads), the channel is closed, and the client gets a final status frame.
//! - **Closed**: the registry entry is released exactly once.

use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tracing::{debug, info, warn};

use super::channel::{ChannelWriter, ShellChannel, ShellConnector};
use super::protocol::{ClientEvent, ServerEvent, StatusFrame};
use super::registry::{SessionHandle, SessionRegistry};
use super::types::{CloseReason, SessionOutcome, SessionRequest, SessionState, TermSize};
use crate::config::TerminalConfig;

/// Size of a single read from the shell.
const READ_CHUNK: usize = 16 * 1024;

/// Upper bound for delivering the final status frame and closing the channel.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

enum Opened {
    Ready(ShellChannel),
    Failed(crate::error::ConnectError),
    Aborted(CloseReason),
}

pub struct SessionBridge {
    registry: Arc<SessionRegistry>,
    connector: Arc<dyn ShellConnector>,
    config: TerminalConfig,
}

impl SessionBridge {
    pub fn new(
        registry: Arc<SessionRegistry>,
        connector: Arc<dyn ShellConnector>,
        config: TerminalConfig,
    ) -> Self {
        Self {
            registry,
            connector,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Run one session to completion.
    ///
    /// `client_rx` yields decoded client events and ends when the client goes
    /// away; `client_tx` receives shell output and status frames.
    pub async fn run<S, K>(&self, request: SessionRequest, mut client_rx: S, mut client_tx: K) -> SessionOutcome
    where
        S: Stream<Item = ClientEvent> + Unpin + Send,
        K: Sink<ServerEvent> + Unpin + Send,
    {
        let handle = self.registry.create(request.target.clone(), request.size);
        let session_id = handle.session_id.clone();

        send_status(
            &mut client_tx,
            StatusFrame::Opening {
                session_id: session_id.clone(),
                target: request.target.to_string(),
            },
        )
        .await;

        let mut bytes_in: u64 = 0;
        let mut bytes_out: u64 = 0;
        let mut pending: Vec<u8> = Vec::new();
        let mut pending_resize: Option<TermSize> = None;

        let opened = self
            .open(&request, &handle, &mut client_rx, &mut pending, &mut pending_resize)
            .await;

        let channel = match opened {
            Opened::Ready(channel) => channel,
            Opened::Failed(err) => {
                warn!("Session {} to {} unavailable: {}", session_id, request.target, err);
                send_status(&mut client_tx, StatusFrame::channel_unavailable(&err)).await;
                let _ = tokio::time::timeout(CLOSE_GRACE, client_tx.close()).await;
                self.registry.release(&session_id);
                return SessionOutcome {
                    session_id,
                    reason: CloseReason::ChannelUnavailable,
                    was_active: false,
                    bytes_in: 0,
                    bytes_out: 0,
                };
            }
            Opened::Aborted(reason) => {
                info!("Session {} aborted while opening: {}", session_id, reason);
                self.finish(&handle, None, &mut client_tx, reason).await;
                return SessionOutcome {
                    session_id,
                    reason,
                    was_active: false,
                    bytes_in: 0,
                    bytes_out: 0,
                };
            }
        };

        let ShellChannel { mut reader, writer } = channel;

        if let Some(size) = pending_resize
            && let Err(e) = writer.resize(size).await
        {
            debug!("Session {}: initial resize failed: {}", session_id, e);
        }

        let mut early_reason = None;
        if !pending.is_empty() {
            bytes_in += pending.len() as u64;
            if let Err(e) = writer.write(&pending).await {
                debug!("Session {}: buffered input not delivered: {}", session_id, e);
                early_reason = Some(CloseReason::RemoteClosed);
            }
        }
        drop(pending);

        handle.touch();
        handle.set_state(SessionState::Active);
        let size = handle.size();
        info!("Session {} active: {} ({}x{})", session_id, request.target, size.cols, size.rows);
        send_status(
            &mut client_tx,
            StatusFrame::Active {
                session_id: session_id.clone(),
                rows: size.rows,
                cols: size.cols,
            },
        )
        .await;

        let reason = match early_reason {
            Some(reason) => reason,
            None => {
                let cancel = handle.cancel_token();

                let upstream = async {
                    while let Some(event) = client_rx.next().await {
                        match event {
                            ClientEvent::Input(bytes) => {
                                handle.touch();
                                bytes_in += bytes.len() as u64;
                                if let Err(e) = writer.write(&bytes).await {
                                    debug!("Session {}: shell write failed: {}", session_id, e);
                                    return CloseReason::RemoteClosed;
                                }
                            }
                            ClientEvent::Resize(size) => {
                                handle.touch();
                                handle.set_size(size);
                                if let Err(e) = writer.resize(size).await {
                                    debug!("Session {}: resize failed: {}", session_id, e);
                                }
                            }
                            ClientEvent::Close => return CloseReason::ClientClosed,
                        }
                    }
                    CloseReason::ClientClosed
                };

                let downstream = async {
                    let mut buf = vec![0u8; READ_CHUNK];
                    loop {
                        match reader.read(&mut buf).await {
                            Ok(0) => return CloseReason::RemoteClosed,
                            Ok(n) => {
                                handle.touch();
                                bytes_out += n as u64;
                                if client_tx.send(ServerEvent::Output(buf[..n].to_vec())).await.is_err() {
                                    return CloseReason::ClientClosed;
                                }
                            }
                            Err(e) => {
                                debug!("Session {}: shell read failed: {}", session_id, e);
                                return CloseReason::RemoteClosed;
                            }
                        }
                    }
                };

                let idle = idle_watchdog(&handle, self.config.idle_timeout);

                tokio::select! {
                    reason = upstream => reason,
                    reason = downstream => reason,
                    _ = idle => CloseReason::IdleTimeout,
                    _ = cancel.cancelled() => CloseReason::Terminated,
                }
            }
        };

        self.finish(&handle, Some(writer.as_ref()), &mut client_tx, reason)
            .await;

        SessionOutcome {
            session_id,
            reason,
            was_active: true,
            bytes_in,
            bytes_out,
        }
    }

    async fn open<S>(
        &self,
        request: &SessionRequest,
        handle: &SessionHandle,
        client_rx: &mut S,
        pending: &mut Vec<u8>,
        pending_resize: &mut Option<TermSize>,
    ) -> Opened
    where
        S: Stream<Item = ClientEvent> + Unpin + Send,
    {
        let cancel = handle.cancel_token();
        let open = self.connector.open(
            &request.target,
            &request.credentials,
            request.size,
            self.config.connect_timeout,
        );
        tokio::pin!(open);

        let max_pending = self.config.max_pending_input;
        loop {
            // A finished open wins over queued client input.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Opened::Aborted(CloseReason::Terminated),
                result = &mut open => {
                    return match result {
                        Ok(channel) => Opened::Ready(channel),
                        Err(err) => Opened::Failed(err),
                    };
                }
                event = client_rx.next(), if pending.len() < max_pending => match event {
                    Some(ClientEvent::Input(bytes)) => pending.extend_from_slice(&bytes),
                    Some(ClientEvent::Resize(size)) => {
                        handle.set_size(size);
                        *pending_resize = Some(size);
                    }
                    Some(ClientEvent::Close) | None => return Opened::Aborted(CloseReason::ClientClosed),
                },
            }
        }
    }

    async fn finish<K>(
        &self,
        handle: &SessionHandle,
        writer: Option<&dyn ChannelWriter>,
        client_tx: &mut K,
        reason: CloseReason,
    ) where
        K: Sink<ServerEvent> + Unpin + Send,
    {
        handle.set_state(SessionState::Closing);

        if let Some(writer) = writer
            && tokio::time::timeout(CLOSE_GRACE, writer.close()).await.is_err()
        {
            debug!("Session {}: channel close timed out", handle.session_id);
        }

        if reason != CloseReason::ClientClosed {
            send_status(
                client_tx,
                StatusFrame::Closed {
                    session_id: handle.session_id.clone(),
                    reason,
                },
            )
            .await;
        }
        let _ = tokio::time::timeout(CLOSE_GRACE, client_tx.close()).await;

        info!("Session {} closed: {}", handle.session_id, reason);
        self.registry.release(&handle.session_id);
    }
}

/// Resolves once the session has seen no traffic for `limit`. Never resolves when disabled.
async fn idle_watchdog(handle: &SessionHandle, limit: Option<Duration>) {
    let Some(limit) = limit else {
        return std::future::pending().await;
    };
    loop {
        let idle_for = handle.idle_for();
        if idle_for >= limit {
            return;
        }
        tokio::time::sleep(limit - idle_for).await;
    }
}

async fn send_status<K>(client_tx: &mut K, frame: StatusFrame)
where
    K: Sink<ServerEvent> + Unpin + Send,
{
    match tokio::time::timeout(CLOSE_GRACE, client_tx.send(ServerEvent::Status(frame))).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => debug!("Client gone before status frame"),
        Err(_) => debug!("Client too slow for status frame"),
    }
}
