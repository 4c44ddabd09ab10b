//! SSH authentication strategies.
//!
//! - [`PasswordAuth`]: password authentication
//! - [`KeyAuth`]: private key from a file or from inline key text
//! - [`AuthChain`]: tries each supplied strategy in turn
//!
//! ```ignore
//! let chain = AuthChain::from_credentials(&credentials);
//! let ok = chain.authenticate(&mut handle, "alice").await?;
//! ```

mod chain;
mod key;
mod password;
mod traits;

pub use chain::AuthChain;
pub use key::{KeyAuth, KeySource};
pub use password::PasswordAuth;
pub use traits::AuthStrategy;
