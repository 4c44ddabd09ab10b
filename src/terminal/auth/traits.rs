//! Authentication strategy trait.

use async_trait::async_trait;
use russh::client;

use crate::terminal::ssh::ShellClientHandler;

/// One way of proving identity to the SSH server.
///
/// Strategies must be `Send + Sync` so a chain can be shared with the
/// retrying connect loop.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Attempt to authenticate with the SSH server.
    ///
    /// * `Ok(true)` - Authentication succeeded
    /// * `Ok(false)` - Credentials rejected by the server
    /// * `Err(message)` - Error during the attempt (unreadable key, broken connection)
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ShellClientHandler>,
        username: &str,
    ) -> Result<bool, String>;

    /// Used for logging.
    fn name(&self) -> &'static str;
}
