//! Core daemon modules.
//!
//! - `proto`: wire format of requests and replies
//! - `datagram`: the UDP transport
//! - `session`: sessions, handle tables and the reply cache
//! - `dispatch`: request routing and the permission gate
//! - `mount`, `directory`, `filesystem`: command handlers
//! - `namespace`: confinement of client paths to the exported tree
//! - `auth`: mount-time credentials
//! - `errors`: protocol status codes
//! - `daemon`: the event loop and host handles

pub mod auth;
pub mod config;
pub mod constants;
/// Event loop, server handles and the embedding entry point.
pub mod daemon;
pub mod datagram;
pub mod directory;
pub mod dispatch;
pub mod errors;
pub mod filesystem;
pub mod logsink;
pub mod mount;
/// Path confinement inside the exported root.
pub mod namespace;
pub mod proto;
pub mod session;
