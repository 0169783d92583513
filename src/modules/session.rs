//! Session management for mounted clients.
//!
//! A session is created by a successful MOUNT and owns every handle the
//! client opens afterwards. Destroying a session closes all of them, which
//! is what bounds the lifetime of server resources when clients vanish
//! without unmounting.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use log::debug;
use thiserror::Error;

use super::auth::{Auth, AuthError, Credentials, Permission};
use super::directory::DirEntry;
use super::errors::ErrorCode;
use super::namespace::Namespace;
use super::proto::OpenFlags;

/// Session-level failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("no session with id {0:#06x}")]
    Invalid(u16),
    #[error("session table is full")]
    Exhausted,
}

impl From<SessionError> for ErrorCode {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Auth(_) => ErrorCode::Access,
            SessionError::Invalid(_) => ErrorCode::InvalidSession,
            SessionError::Exhausted => ErrorCode::NFile,
        }
    }
}

/// Per-session table of small integer handles.
///
/// Ids are unique within the table only and the lowest free id, starting
/// at 1, is handed out first.
#[derive(Debug)]
pub struct HandleTable<T> {
    slots: BTreeMap<u8, T>,
    limit: usize,
}

impl<T> HandleTable<T> {
    pub fn new(limit: usize) -> Self {
        Self {
            slots: BTreeMap::new(),
            limit: limit.min(u8::MAX as usize),
        }
    }

    /// Stores a resource, returning its id, or `EMFILE` when full.
    pub fn insert(&mut self, item: T) -> Result<u8, ErrorCode> {
        if self.slots.len() >= self.limit {
            return Err(ErrorCode::MFile);
        }
        let id = (1..=u8::MAX)
            .find(|id| !self.slots.contains_key(id))
            .ok_or(ErrorCode::MFile)?;
        self.slots.insert(id, item);
        Ok(id)
    }

    pub fn get_mut(&mut self, id: u8) -> Result<&mut T, ErrorCode> {
        self.slots.get_mut(&id).ok_or(ErrorCode::BadF)
    }

    pub fn remove(&mut self, id: u8) -> Result<T, ErrorCode> {
        self.slots.remove(&id).ok_or(ErrorCode::BadF)
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.limit
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

/// An open file.
#[derive(Debug)]
pub struct FileHandle {
    pub file: File,
    pub path: PathBuf,
    pub flags: OpenFlags,
}

/// An open directory listing, snapshotted when it was opened.
#[derive(Debug)]
pub struct DirHandle {
    pub path: PathBuf,
    pub entries: Vec<DirEntry>,
    pub position: usize,
}

/// The last reply sent to a session, kept to answer retransmissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedReply {
    pub sequence: u8,
    pub bytes: Vec<u8>,
}

/// Server-side state of one mounted client.
#[derive(Debug)]
pub struct Session {
    pub id: u16,
    pub client: SocketAddr,
    pub created_at: Instant,
    pub last_activity: Instant,
    /// The mounted subtree; all client paths are confined to it
    pub namespace: Namespace,
    /// Current directory, relative to the mount root
    pub cwd: PathBuf,
    pub permission: Permission,
    pub files: HandleTable<FileHandle>,
    pub dirs: HandleTable<DirHandle>,
    pub last_reply: Option<CachedReply>,
    /// Sequence number of the MOUNT, until another request follows it
    pub mount_sequence: Option<u8>,
}

impl Session {
    /// Records a reply as the one to repeat for retransmissions.
    pub fn cache_reply(&mut self, sequence: u8, bytes: Vec<u8>) {
        self.last_reply = Some(CachedReply { sequence, bytes });
    }

    /// The cached reply, if it answers `sequence`.
    pub fn cached_reply(&self, sequence: u8) -> Option<&[u8]> {
        self.last_reply
            .as_ref()
            .filter(|cached| cached.sequence == sequence)
            .map(|cached| cached.bytes.as_slice())
    }

    /// Closes every open file and directory.
    pub fn release_handles(&mut self) {
        self.files.clear();
        self.dirs.clear();
    }
}

#[cfg(test)]
impl Session {
    /// A session outside any manager, for exercising handlers directly.
    pub(crate) fn detached(namespace: Namespace, permission: Permission) -> Self {
        let now = Instant::now();
        Session {
            id: 1,
            client: SocketAddr::from(([127, 0, 0, 1], 9000)),
            created_at: now,
            last_activity: now,
            namespace,
            cwd: PathBuf::new(),
            permission,
            files: HandleTable::new(4),
            dirs: HandleTable::new(2),
            last_reply: None,
            mount_sequence: None,
        }
    }
}

/// Limits that shape the session table.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub idle_timeout: Duration,
    pub max_sessions: usize,
    pub max_files: usize,
    pub max_dirs: usize,
}

/// Owns all live sessions.
#[derive(Debug)]
pub struct SessionManager {
    sessions: HashMap<u16, Session>,
    next_id: u16,
    limits: SessionLimits,
}

impl SessionManager {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            sessions: HashMap::new(),
            next_id: 1,
            limits: SessionLimits {
                max_sessions: limits.max_sessions.min(u16::MAX as usize),
                ..limits
            },
        }
    }

    /// Authenticates a client and opens a session mounted at `namespace`.
    ///
    /// # Errors
    ///
    /// Fails when authentication fails or the table is full.
    pub fn create(
        &mut self,
        auth: &Auth,
        client: SocketAddr,
        credentials: &Credentials,
        namespace: Namespace,
        now: Instant,
    ) -> Result<u16, SessionError> {
        let permission = auth.authenticate(credentials)?;
        if self.sessions.len() >= self.limits.max_sessions {
            return Err(SessionError::Exhausted);
        }
        let id = self.allocate_id().ok_or(SessionError::Exhausted)?;
        let session = Session {
            id,
            client,
            created_at: now,
            last_activity: now,
            namespace,
            cwd: PathBuf::new(),
            permission,
            files: HandleTable::new(self.limits.max_files),
            dirs: HandleTable::new(self.limits.max_dirs),
            last_reply: None,
            mount_sequence: None,
        };
        self.sessions.insert(id, session);
        debug!("Allocated session {:#06x} for {}", id, client);
        Ok(id)
    }

    // Ids rotate so a freshly destroyed id is not handed straight back out.
    fn allocate_id(&mut self) -> Option<u16> {
        for _ in 0..u16::MAX {
            let candidate = self.next_id;
            self.next_id = match self.next_id.wrapping_add(1) {
                0 => 1,
                n => n,
            };
            if !self.sessions.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Finds a live session.
    ///
    /// # Arguments
    /// * `id` - Session id from the request header
    ///
    /// # Returns
    /// * `Ok(&mut Session)` if the session exists
    /// * `Err(SessionError::Invalid)` otherwise, which answers INVALID_SESSION
    pub fn lookup(&mut self, id: u16) -> Result<&mut Session, SessionError> {
        self.sessions.get_mut(&id).ok_or(SessionError::Invalid(id))
    }

    /// Marks a session as active, postponing its expiry.
    ///
    /// # Arguments
    /// * `id` - Session to refresh; unknown ids are ignored
    /// * `now` - Time of the request
    pub fn touch(&mut self, id: u16, now: Instant) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.last_activity = now;
        }
    }

    /// Removes a session and closes its handles.
    pub fn destroy(&mut self, id: u16) -> Option<Session> {
        let mut session = self.sessions.remove(&id)?;
        session.release_handles();
        Some(session)
    }

    /// Destroys every session idle for longer than the timeout.
    ///
    /// Returns the evicted ids in ascending order.
    pub fn sweep(&mut self, now: Instant) -> Vec<u16> {
        let timeout = self.limits.idle_timeout;
        let mut expired: Vec<u16> = self
            .sessions
            .values()
            .filter(|s| now.saturating_duration_since(s.last_activity) > timeout)
            .map(|s| s.id)
            .collect();
        expired.sort_unstable();
        for id in &expired {
            self.destroy(*id);
        }
        expired
    }

    /// Destroys every session, closing all their handles.
    ///
    /// # Returns
    /// How many sessions there were.
    pub fn destroy_all(&mut self) -> usize {
        let ids: Vec<u16> = self.sessions.keys().copied().collect();
        for id in &ids {
            self.destroy(*id);
        }
        ids.len()
    }

    /// A session whose MOUNT with this sequence number is the last request
    /// it saw, i.e. the target of a retransmitted MOUNT.
    pub fn find_mount_retry(&self, client: SocketAddr, sequence: u8) -> Option<&Session> {
        self.sessions
            .values()
            .find(|s| s.client == client && s.mount_sequence == Some(sequence))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Returns the live session ids in ascending order.
    pub fn ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
