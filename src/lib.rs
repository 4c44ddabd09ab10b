//! Browser SSH terminals for a fleet of nodes, with a master that tracks node
//! health from heartbeats and hands out signed redirects to them.

#![deny(clippy::unwrap_used)]

pub mod cluster;
pub mod config;
pub mod error;
pub mod secret;
pub mod server;
pub mod terminal;
