//! Ordered authentication attempts built from caller-supplied credentials.

use async_trait::async_trait;
use russh::client;
use tracing::debug;

use crate::terminal::ssh::ShellClientHandler;
use crate::terminal::types::Credentials;

use super::traits::AuthStrategy;
use super::{KeyAuth, PasswordAuth};

pub struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    /// Password first, then the inline key, then the key file.
    pub fn from_credentials(credentials: &Credentials) -> Self {
        let mut strategies: Vec<Box<dyn AuthStrategy>> = Vec::new();

        if let Some(password) = &credentials.password {
            strategies.push(Box::new(PasswordAuth::new(password.clone())));
        }
        if let Some(key) = &credentials.private_key {
            strategies.push(Box::new(KeyAuth::from_text(
                key.clone(),
                credentials.passphrase.clone(),
            )));
        }
        if let Some(path) = &credentials.key_file {
            strategies.push(Box::new(KeyAuth::from_file(
                path.clone(),
                credentials.passphrase.clone(),
            )));
        }

        Self { strategies }
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }
}

#[async_trait]
impl AuthStrategy for AuthChain {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ShellClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        if self.strategies.is_empty() {
            return Err("No authentication methods: supply a password or private key".to_string());
        }

        let mut failures = Vec::with_capacity(self.strategies.len());
        for strategy in &self.strategies {
            match strategy.authenticate(handle, username).await {
                Ok(true) => {
                    debug!("{} authenticated with {}", username, strategy.name());
                    return Ok(true);
                }
                Ok(false) => failures.push(format!("{} authentication rejected", strategy.name())),
                Err(e) => failures.push(e),
            }
        }

        debug!("{} exhausted {:?}", username, self.names());
        Err(failures.join("; "))
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}
