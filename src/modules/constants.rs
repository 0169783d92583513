use std::time::Duration;

// Protocol version announced in MOUNT replies (1.2)
pub const PROTOCOL_VERSION: u16 = 0x0102;
pub const DEFAULT_PORT: u16 = 16384;

// Datagram sizes
pub const REQUEST_HEADER_LEN: usize = 5;
pub const REPLY_HEADER_LEN: usize = 4;
pub const MAX_MESSAGE_SIZE: usize = 532;
pub const MAX_REPLY_PAYLOAD: usize = MAX_MESSAGE_SIZE - REPLY_HEADER_LEN;
pub const MAX_IO_SIZE: usize = 512;

/// Minimum retry interval suggested to clients, in milliseconds.
pub const MIN_RETRY_MS: u16 = 1000;

// Session defaults
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// How often the session count is logged. Zero turns the line off.
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_MAX_SESSIONS: usize = 4096;
pub const MAX_FILE_HANDLES: usize = 16;
pub const MAX_DIR_HANDLES: usize = 8;

/// Permission bits used when OPEN creates a file without a mode.
pub const DEFAULT_CREATE_MODE: u32 = 0o644;
