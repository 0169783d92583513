#![doc(html_root_url = "https://docs.rs/tnfsd/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::missing_crate_level_docs)]

//! tnfsd: a Trivial Network File System server
//!
//! TNFS is a small UDP file protocol used by 8-bit computers and other
//! constrained clients. The daemon exports one directory tree; clients
//! mount it, or a directory beneath it, and then list, read, write and
//! manage files through per-session handles.
//!
//! ## Features
//!
//! - Sessions with idle expiry and per-session file and directory handles
//! - Retransmission safety through a per-session reply cache
//! - Path confinement, including symlinks, to the mounted subtree
//! - Read-only serving and optional account-based authentication
//! - Extended directory listings with filtering, sorting and glob patterns
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tnfsd::{spawn, LogCrateSink, ServerConfig};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = ServerConfig::new("/srv/tnfs").read_only(true);
//! let server = spawn(&config, Arc::new(LogCrateSink))?;
//! println!("serving on {}", server.local_addr());
//!
//! // later, from any thread
//! server.stop();
//! server.join()?;
//! # Ok(())
//! # }
//! ```

pub mod modules;

pub use modules::auth::{Account, Auth, Credentials, Permission};
pub use modules::config::ServerConfig;
pub use modules::daemon::{spawn, RunningServer, Server, ServerHandle, Tnfsd};
pub use modules::errors::{ErrorCode, StartError};
pub use modules::logsink::{ChannelSink, LogCrateSink, LogSink, WriterSink};
