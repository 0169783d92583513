use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use super::auth::{Account, Auth};
use super::constants::*;
use super::session::SessionLimits;

/// Everything needed to start a server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory exported to clients
    pub root: PathBuf,
    pub bind_addr: IpAddr,
    pub port: u16,
    pub read_only: bool,
    /// Accepted accounts; `None` lets anyone mount
    pub accounts: Option<Vec<Account>>,
    pub session_timeout: Duration,
    pub sweep_interval: Duration,
    /// Period of the `Stats` log line; zero disables it
    pub stats_interval: Duration,
    pub max_sessions: usize,
    pub max_files: usize,
    pub max_dirs: usize,
}

impl ServerConfig {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            read_only: false,
            accounts: None,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            stats_interval: DEFAULT_STATS_INTERVAL,
            max_sessions: DEFAULT_MAX_SESSIONS,
            max_files: MAX_FILE_HANDLES,
            max_dirs: MAX_DIR_HANDLES,
        }
    }

    /// Sets the UDP port. Port 0 lets the system pick one.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the address the socket is bound to.
    ///
    /// # Arguments
    /// * `addr` - Local interface address, `0.0.0.0` for all of them
    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Caps every session at read-only access.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Restricts MOUNT to the given accounts.
    ///
    /// # Arguments
    /// * `accounts` - Accepted user names, passwords and permissions
    ///
    /// # Returns
    /// The config with authentication turned on. An empty list refuses
    /// every mount.
    pub fn with_accounts(mut self, accounts: Vec<Account>) -> Self {
        self.accounts = Some(accounts);
        self
    }

    /// Sets how long a session may stay idle before the sweep drops it.
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Sets how often idle sessions are swept.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Sets how often the session count is logged.
    ///
    /// # Arguments
    /// * `interval` - Period between `Stats` lines, `Duration::ZERO` to disable
    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    /// Limits the number of live sessions. MOUNT answers ENFILE past it.
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    pub fn limits(&self) -> SessionLimits {
        SessionLimits {
            idle_timeout: self.session_timeout,
            max_sessions: self.max_sessions,
            max_files: self.max_files,
            max_dirs: self.max_dirs,
        }
    }

    pub fn auth(&self) -> Auth {
        match &self.accounts {
            Some(accounts) => Auth::with_accounts(accounts.clone(), self.read_only),
            None => Auth::open(self.read_only),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::auth::{Credentials, Permission};

    #[test]
    fn test_defaults() {
        let config = ServerConfig::new("/srv/tnfs");
        assert_eq!(config.port, 16384);
        assert_eq!(config.socket_addr().to_string(), "0.0.0.0:16384");
        assert_eq!(config.session_timeout, Duration::from_secs(21600));
        assert_eq!(config.limits().max_files, 16);
        assert_eq!(config.limits().max_dirs, 8);
        assert_eq!(config.stats_interval, Duration::from_secs(900));
        assert!(config.auth().is_open());
    }

    #[test]
    fn test_builders() {
        let config = ServerConfig::new("/srv/tnfs")
            .with_port(0)
            .with_bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .read_only(true)
            .with_accounts(vec![Account {
                user: "bob".into(),
                password: "pw".into(),
                permission: Permission::ReadWrite,
            }])
            .with_session_timeout(Duration::from_secs(5))
            .with_stats_interval(Duration::ZERO)
            .with_max_sessions(3);
        assert_eq!(config.socket_addr().to_string(), "127.0.0.1:0");
        assert_eq!(config.limits().idle_timeout, Duration::from_secs(5));
        assert_eq!(config.limits().max_sessions, 3);
        assert!(config.stats_interval.is_zero());

        let auth = config.auth();
        assert!(!auth.is_open());
        assert_eq!(auth.authenticate(&Credentials::new("bob", "pw")), Ok(Permission::ReadOnly));
    }
}
