//! Private key authentication, from a file or from key text sent by the browser.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use tracing::debug;

use crate::terminal::ssh::ShellClientHandler;

use super::traits::AuthStrategy;

pub enum KeySource {
    File(PathBuf),
    /// PEM or OpenSSH key text
    Inline(String),
}

pub struct KeyAuth {
    source: KeySource,
    passphrase: Option<String>,
}

impl KeyAuth {
    pub fn from_file(path: impl Into<PathBuf>, passphrase: Option<String>) -> Self {
        Self {
            source: KeySource::File(path.into()),
            passphrase,
        }
    }

    pub fn from_text(key: impl Into<String>, passphrase: Option<String>) -> Self {
        Self {
            source: KeySource::Inline(key.into()),
            passphrase,
        }
    }

    fn load_key(&self) -> Result<keys::PrivateKey, String> {
        let passphrase = self.passphrase.as_deref().filter(|p| !p.is_empty());
        match &self.source {
            KeySource::File(path) => keys::load_secret_key(path, passphrase)
                .map_err(|e| format!("Failed to load private key from {:?}: {}", path, e)),
            KeySource::Inline(text) => keys::decode_secret_key(text.trim(), passphrase)
                .map_err(|e| format!("Failed to load private key: {}", e)),
        }
    }
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ShellClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let key_pair = self.load_key()?;

        // For RSA keys, use the best supported hash algorithm
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        debug!("Using RSA hash algorithm for key auth: {:?}", hash_alg);

        let key_with_hash = keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);

        let result = handle
            .authenticate_publickey(username, key_with_hash)
            .await
            .map_err(|e| format!("Key authentication failed: {}", e))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "key"
    }
}
