//! HTTP surfaces per role.
//!
//! Standalone and slave nodes serve the node routes at `/`. A master serves
//! its dashboard API at `/` and, with an embedded node, the node routes
//! under [`EMBEDDED_NODE_PREFIX`].

pub mod master;
pub mod node;

use std::sync::Arc;

use poem::endpoint::BoxEndpoint;
use poem::middleware::Tracing;
use poem::{EndpointExt, Response, Route, delete, get, post};

pub use master::MasterState;
pub use node::NodeState;

pub const EMBEDDED_NODE_PREFIX: &str = "/webssh";

pub fn master_routes() -> Route {
    Route::new()
        .at("/", get(master::index))
        .at("/api/heartbeat", post(master::heartbeat))
        .at("/api/login", post(master::login))
        .at("/api/logout", post(master::logout))
        .at("/api/nodes", get(master::list_nodes))
        .at("/api/nodes/:node_id", get(master::get_node))
        .at("/api/connect/:node_id", get(master::connect))
        .at("/api/health", get(master::health))
}

pub fn node_routes() -> Route {
    Route::new()
        .at("/", get(node::index))
        .at("/api/connect", get(node::connect))
        .at("/ws", get(node::terminal))
        .at("/api/sessions", get(node::list_sessions))
        .at("/api/sessions/:session_id", delete(node::terminate_session))
        .at("/api/health", get(node::health))
}

/// What one process serves.
pub enum Surface {
    Master {
        master: Arc<MasterState>,
        embedded: Option<Arc<NodeState>>,
    },
    Node(Arc<NodeState>),
}

pub fn build_app(surface: Surface) -> BoxEndpoint<'static, Response> {
    match surface {
        Surface::Master {
            master,
            embedded: Some(node),
        } => master_routes()
            .nest(EMBEDDED_NODE_PREFIX, node_routes())
            .data(master)
            .data(node)
            .with(Tracing)
            .boxed(),
        Surface::Master {
            master,
            embedded: None,
        } => master_routes().data(master).with(Tracing).boxed(),
        Surface::Node(node) => node_routes().data(node).with(Tracing).boxed(),
    }
}
