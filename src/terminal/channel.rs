//! Abstract duplex shell channel.
//!
//! The bridge only ever sees these traits. [`RusshConnector`](super::ssh::RusshConnector)
//! is the production implementation; tests plug in in-memory fakes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::types::{Credentials, SshTarget, TermSize};
use crate::error::{ChannelError, ConnectError};

/// Opens authenticated interactive shells.
#[async_trait]
pub trait ShellConnector: Send + Sync {
    /// Connect, authenticate, allocate a PTY of `size` and start a shell.
    ///
    /// `timeout` bounds the whole attempt including retries.
    async fn open(
        &self,
        target: &SshTarget,
        credentials: &Credentials,
        size: TermSize,
        timeout: Duration,
    ) -> Result<ShellChannel, ConnectError>;
}

/// Read half of an open shell.
#[async_trait]
pub trait ChannelReader: Send {
    /// Read into `buf`. `Ok(0)` means the remote side is done.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError>;
}

/// Shareable write half of an open shell.
#[async_trait]
pub trait ChannelWriter: Send + Sync {
    async fn write(&self, data: &[u8]) -> Result<usize, ChannelError>;

    async fn resize(&self, size: TermSize) -> Result<(), ChannelError>;

    /// Close the channel and its connection. Safe to call repeatedly and from any task.
    async fn close(&self);
}

pub struct ShellChannel {
    pub reader: Box<dyn ChannelReader>,
    pub writer: Arc<dyn ChannelWriter>,
}

impl ShellChannel {
    pub fn new(reader: Box<dyn ChannelReader>, writer: Arc<dyn ChannelWriter>) -> Self {
        Self { reader, writer }
    }
}
