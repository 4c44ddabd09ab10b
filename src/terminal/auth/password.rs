//! Password login.

use async_trait::async_trait;
use russh::client;

use crate::terminal::ssh::ShellClientHandler;

use super::traits::AuthStrategy;

pub struct PasswordAuth {
    password: String,
}

impl PasswordAuth {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ShellClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        handle
            .authenticate_password(username, &self.password)
            .await
            .map(|result| result.success())
            .map_err(|e| format!("Password authentication failed: {}", e))
    }

    fn name(&self) -> &'static str {
        "password"
    }
}
