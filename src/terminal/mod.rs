//! Interactive terminal sessions bridged from WebSocket clients to SSH shells.

pub mod auth;
pub mod bridge;
pub mod channel;
pub mod protocol;
pub mod registry;
pub mod ssh;
pub mod types;

pub use bridge::SessionBridge;
pub use channel::{ChannelReader, ChannelWriter, ShellChannel, ShellConnector};
pub use protocol::{ClientEvent, ServerEvent, StatusFrame, parse_client_message};
pub use registry::{SessionHandle, SessionRegistry};
pub use ssh::RusshConnector;
pub use types::{
    CloseReason, Credentials, SessionInfo, SessionListResponse, SessionOutcome, SessionRequest,
    SessionState, SshTarget, TermSize,
};
