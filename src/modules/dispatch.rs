//! Request routing.
//!
//! Every datagram goes through [`Dispatcher::dispatch`], which resolves the
//! session, answers retransmissions from the reply cache, enforces the
//! session's permission and finally runs the command's handler.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Instant;

use log::{debug, warn};

use super::auth::Auth;
use super::constants::MAX_REPLY_PAYLOAD;
use super::directory;
use super::errors::ErrorCode;
use super::filesystem;
use super::logsink::{diag, Diagnostics};
use super::mount;
use super::namespace::Namespace;
use super::proto::{encode_reply, Command, Datagram, OpenFlags, PayloadReader};
use super::session::{Session, SessionLimits, SessionManager};

/// Reply payload of a handler, or the status to answer with.
pub type HandlerResult = Result<Vec<u8>, ErrorCode>;

type Handler = fn(&mut Session, &mut PayloadReader<'_>) -> HandlerResult;

/// State shared by every request, fixed for the daemon's lifetime.
#[derive(Debug)]
pub struct ServerContext {
    /// The exported root; mount paths are resolved inside it
    pub namespace: Namespace,
    pub read_only: bool,
    pub auth: Auth,
    pub diag: Diagnostics,
}

impl ServerContext {
    pub fn new<P: AsRef<Path>>(root: P, auth: Auth) -> io::Result<Self> {
        Ok(Self {
            namespace: Namespace::new(root)?,
            read_only: auth.is_read_only(),
            auth,
            diag: Diagnostics::default(),
        })
    }

    pub fn with_diagnostics(mut self, diag: Diagnostics) -> Self {
        self.diag = diag;
        self
    }
}

fn handler_for(cmd: Command) -> Option<Handler> {
    let handler: Handler = match cmd {
        Command::OpenDir => directory::opendir,
        Command::ReadDir => directory::readdir,
        Command::CloseDir => directory::closedir,
        Command::MkDir => directory::mkdir,
        Command::RmDir => directory::rmdir,
        Command::TellDir => directory::telldir,
        Command::SeekDir => directory::seekdir,
        Command::OpenDirX => directory::opendirx,
        Command::ReadDirX => directory::readdirx,
        Command::Open => filesystem::open,
        Command::Read => filesystem::read,
        Command::Write => filesystem::write,
        Command::Close => filesystem::close,
        Command::Stat => filesystem::stat,
        Command::Seek => filesystem::seek,
        Command::Unlink => filesystem::unlink,
        Command::Chmod => filesystem::chmod,
        Command::Rename => filesystem::rename,
        Command::Size => filesystem::size,
        Command::Free => filesystem::free,
        Command::Mount | Command::Umount | Command::OpenLegacy => return None,
    };
    Some(handler)
}

fn requires_write(cmd: Command, payload: &[u8]) -> bool {
    if cmd == Command::Open {
        return match payload {
            [lo, hi, ..] => OpenFlags::from_bits_truncate(u16::from_le_bytes([*lo, *hi])).mutates(),
            _ => false,
        };
    }
    cmd.is_mutating()
}

fn execute(session: &mut Session, dgram: &Datagram) -> HandlerResult {
    let cmd = dgram.command().ok_or(ErrorCode::NoSys)?;
    if !session.permission.can_write() && requires_write(cmd, &dgram.payload) {
        return Err(ErrorCode::Perm);
    }
    let handler = handler_for(cmd).ok_or(ErrorCode::NoSys)?;
    let payload = handler(session, &mut PayloadReader::new(&dgram.payload))?;
    if payload.len() > MAX_REPLY_PAYLOAD {
        return Err(ErrorCode::NoBufs);
    }
    Ok(payload)
}

/// Owns the session table and turns requests into replies.
#[derive(Debug)]
pub struct Dispatcher {
    ctx: ServerContext,
    sessions: SessionManager,
}

impl Dispatcher {
    pub fn new(ctx: ServerContext, limits: SessionLimits) -> Self {
        Self {
            ctx,
            sessions: SessionManager::new(limits),
        }
    }

    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Handles one datagram and returns the reply to send, if any.
    ///
    /// A request whose sequence number matches the session's last reply is
    /// answered from the cache and not executed again. Requests naming a
    /// session that belongs to another host are dropped.
    pub fn dispatch(&mut self, dgram: &Datagram, from: SocketAddr, now: Instant) -> Option<Vec<u8>> {
        let cmd = dgram.command();
        if cmd == Some(Command::Mount) {
            return Some(mount::mount(&self.ctx, &mut self.sessions, dgram, from, now));
        }

        let session = match self.sessions.lookup(dgram.session_id) {
            Ok(session) => session,
            Err(e) => {
                debug!("Request {:#04x} from {}: {}", dgram.opcode, from, e);
                return Some(encode_reply(dgram.session_id, dgram.sequence, ErrorCode::from(e), &[]));
            }
        };
        if session.client.ip() != from.ip() {
            warn!(
                "Dropping request for session {:#06x} from {}, owned by {}",
                session.id, from, session.client
            );
            return None;
        }
        if let Some(cached) = session.cached_reply(dgram.sequence) {
            debug!("Repeating reply to {} (seq {})", from, dgram.sequence);
            return Some(cached.to_vec());
        }

        if cmd == Some(Command::Umount) {
            return Some(mount::umount(&self.ctx, &mut self.sessions, dgram));
        }

        session.mount_sequence = None;
        let (status, payload) = match execute(session, dgram) {
            Ok(payload) => (ErrorCode::Success, payload),
            Err(code) => {
                if code != ErrorCode::Eof {
                    let name = cmd.map(Command::name).unwrap_or("UNKNOWN");
                    diag!(self.ctx.diag, "{} failed for session {:#06x}: {}", name, session.id, code);
                }
                (code, Vec::new())
            }
        };

        let id = session.id;
        let reply = encode_reply(id, dgram.sequence, status, &payload);
        session.cache_reply(dgram.sequence, reply.clone());
        self.sessions.touch(id, now);
        Some(reply)
    }

    /// Evicts idle sessions.
    pub fn sweep(&mut self, now: Instant) -> Vec<u16> {
        let expired = self.sessions.sweep(now);
        for id in &expired {
            diag!(self.ctx.diag, "Session {:#06x} expired", id);
        }
        expired
    }

    /// Destroys every session, returning how many there were.
    pub fn shutdown(&mut self) -> usize {
        self.sessions.destroy_all()
    }
}
