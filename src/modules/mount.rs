//! MOUNT and UMOUNT, the two commands that create and end sessions.

use std::net::SocketAddr;
use std::time::Instant;

use log::debug;

use super::auth::Credentials;
use super::constants::{MIN_RETRY_MS, PROTOCOL_VERSION};
use super::dispatch::ServerContext;
use super::errors::ErrorCode;
use super::logsink::diag;
use super::proto::{encode_reply, Datagram, PayloadReader};
use super::session::SessionManager;

/// A parsed MOUNT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    pub version: u16,
    pub path: Vec<u8>,
    pub credentials: Credentials,
}

impl MountRequest {
    /// Decodes the payload: version, then optional mount path, user and
    /// password strings.
    pub fn parse(payload: &[u8]) -> Result<Self, ErrorCode> {
        let mut req = PayloadReader::new(payload);
        let version = req.u16()?;
        let path = req.optional_cstr().to_vec();
        let user = String::from_utf8_lossy(req.optional_cstr()).into_owned();
        let password = String::from_utf8_lossy(req.optional_cstr()).into_owned();
        Ok(Self {
            version,
            path,
            credentials: Credentials::new(user, password),
        })
    }
}

fn mount_payload() -> Vec<u8> {
    let mut out = PROTOCOL_VERSION.to_le_bytes().to_vec();
    out.extend_from_slice(&MIN_RETRY_MS.to_le_bytes());
    out
}

/// Handles MOUNT, returning the reply to send.
///
/// A retransmitted MOUNT that matches the last request of an existing
/// session gets that session's original reply instead of a new session.
pub fn mount(
    ctx: &ServerContext,
    sessions: &mut SessionManager,
    dgram: &Datagram,
    from: SocketAddr,
    now: Instant,
) -> Vec<u8> {
    if dgram.retry {
        let cached = sessions
            .find_mount_retry(from, dgram.sequence)
            .and_then(|s| s.cached_reply(dgram.sequence));
        if let Some(bytes) = cached {
            debug!("Repeating MOUNT reply for {} (seq {})", from, dgram.sequence);
            return bytes.to_vec();
        }
    }

    let request = match MountRequest::parse(&dgram.payload) {
        Ok(request) => request,
        Err(code) => return encode_reply(0, dgram.sequence, code, &PROTOCOL_VERSION.to_le_bytes()),
    };

    let outcome = open_session(ctx, sessions, &request, from, now);

    match outcome {
        Ok(id) => {
            let reply = encode_reply(id, dgram.sequence, ErrorCode::Success, &mount_payload());
            if let Ok(session) = sessions.lookup(id) {
                session.cache_reply(dgram.sequence, reply.clone());
                session.mount_sequence = Some(dgram.sequence);
                diag!(
                    ctx.diag,
                    "Session {:#06x} mounted {:?} for {} (client version {}.{}, {:?})",
                    id,
                    String::from_utf8_lossy(&request.path),
                    from,
                    request.version >> 8,
                    request.version & 0xFF,
                    session.permission
                );
            }
            reply
        }
        Err(code) => {
            debug!("MOUNT from {} failed: {:?}", from, code);
            encode_reply(0, dgram.sequence, code, &PROTOCOL_VERSION.to_le_bytes())
        }
    }
}

// Credentials are checked before the mount path is looked at.
fn open_session(
    ctx: &ServerContext,
    sessions: &mut SessionManager,
    request: &MountRequest,
    from: SocketAddr,
    now: Instant,
) -> Result<u16, ErrorCode> {
    if let Err(e) = ctx.auth.authenticate(&request.credentials) {
        diag!(ctx.diag, "Mount refused for {}: {}", from, e);
        return Err(ErrorCode::Access);
    }
    let namespace = ctx.namespace.subtree(&request.path)?;
    sessions
        .create(&ctx.auth, from, &request.credentials, namespace, now)
        .map_err(|e| {
            diag!(ctx.diag, "Mount refused for {}: {}", from, e);
            ErrorCode::from(e)
        })
}

/// Handles UMOUNT. The session is gone afterwards, so the reply is never
/// cached.
pub fn umount(ctx: &ServerContext, sessions: &mut SessionManager, dgram: &Datagram) -> Vec<u8> {
    if let Some(session) = sessions.destroy(dgram.session_id) {
        diag!(ctx.diag, "Session {:#06x} unmounted by {}", session.id, session.client);
    }
    encode_reply(dgram.session_id, dgram.sequence, ErrorCode::Success, &[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::auth::{Account, Auth, Permission};
    use crate::modules::proto::{Command, Reply};
    use crate::modules::session::SessionLimits;
    use anyhow::Result;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup_test_server(auth: Auth) -> Result<(TempDir, ServerContext, SessionManager)> {
        let temp_dir = tempfile::tempdir()?;
        fs::create_dir(temp_dir.path().join("games"))?;
        fs::write(temp_dir.path().join("readme.txt"), "hi")?;
        let ctx = ServerContext::new(temp_dir.path(), auth)?;
        let sessions = SessionManager::new(SessionLimits {
            idle_timeout: Duration::from_secs(60),
            max_sessions: 2,
            max_files: 4,
            max_dirs: 4,
        });
        Ok((temp_dir, ctx, sessions))
    }

    fn mount_dgram(seq: u8, retry: bool, path: &str, user: &str, password: &str) -> Datagram {
        let mut payload = PROTOCOL_VERSION.to_le_bytes().to_vec();
        for s in [path, user, password] {
            payload.extend_from_slice(s.as_bytes());
            payload.push(0);
        }
        Datagram {
            session_id: 0,
            sequence: seq,
            retry,
            opcode: Command::Mount as u8,
            payload,
        }
    }

    fn client() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 7000))
    }

    #[test]
    fn test_parse_mount_request() -> Result<()> {
        let req = MountRequest::parse(&[0x02, 0x01, b'/', b'a', 0, b'u', 0])?;
        assert_eq!(req.version, 0x0102);
        assert_eq!(req.path, b"/a");
        assert_eq!(req.credentials, Credentials::new("u", ""));

        let bare = MountRequest::parse(&[0x00, 0x01])?;
        assert!(bare.path.is_empty());
        assert!(bare.credentials.is_anonymous());
        assert_eq!(MountRequest::parse(&[1]), Err(ErrorCode::Inval));
        Ok(())
    }

    #[test]
    fn test_mount_creates_session() -> Result<()> {
        let (_dir, ctx, mut sessions) = setup_test_server(Auth::open(false))?;
        let reply = Reply::parse(&mount(&ctx, &mut sessions, &mount_dgram(1, false, "/", "", ""), client(), Instant::now()))
            .expect("reply header");
        assert!(reply.is_ok());
        assert_eq!(reply.session_id, 1);
        assert_eq!(reply.sequence, 1);
        assert_eq!(reply.payload, vec![0x02, 0x01, 0xE8, 0x03]);
        assert_eq!(sessions.len(), 1);
        Ok(())
    }

    #[test]
    fn test_mount_subdirectory() -> Result<()> {
        let (dir, ctx, mut sessions) = setup_test_server(Auth::open(false))?;
        mount(&ctx, &mut sessions, &mount_dgram(1, false, "/games", "", ""), client(), Instant::now());
        let session = sessions.lookup(1)?;
        assert_eq!(session.namespace.root(), fs::canonicalize(dir.path().join("games"))?);

        let escaped = mount(&ctx, &mut sessions, &mount_dgram(2, false, "/..", "", ""), client(), Instant::now());
        assert_eq!(escaped[3], ErrorCode::Access.as_u8());
        let missing = mount(&ctx, &mut sessions, &mount_dgram(3, false, "/nope", "", ""), client(), Instant::now());
        assert_eq!(missing[3], ErrorCode::NoEnt.as_u8());
        let file = mount(&ctx, &mut sessions, &mount_dgram(4, false, "/readme.txt", "", ""), client(), Instant::now());
        assert_eq!(file[3], ErrorCode::NotDir.as_u8());
        assert_eq!(sessions.len(), 1);
        Ok(())
    }

    #[test]
    fn test_retransmitted_mount_reuses_session() -> Result<()> {
        let (_dir, ctx, mut sessions) = setup_test_server(Auth::open(false))?;
        let now = Instant::now();
        let first = mount(&ctx, &mut sessions, &mount_dgram(9, false, "/", "", ""), client(), now);
        let again = mount(&ctx, &mut sessions, &mount_dgram(9, true, "/", "", ""), client(), now);
        assert_eq!(first, again);
        assert_eq!(sessions.len(), 1);

        // without the retry flag it is a new mount
        let fresh = mount(&ctx, &mut sessions, &mount_dgram(9, false, "/", "", ""), client(), now);
        assert_ne!(first[..2], fresh[..2]);
        assert_eq!(sessions.len(), 2);
        Ok(())
    }

    #[test]
    fn test_mount_rejections() -> Result<()> {
        let accounts = vec![Account {
            user: "alice".into(),
            password: "pw".into(),
            permission: Permission::ReadWrite,
        }];
        let (_dir, ctx, mut sessions) = setup_test_server(Auth::with_accounts(accounts, false))?;
        let now = Instant::now();

        let denied = mount(&ctx, &mut sessions, &mount_dgram(1, false, "/", "alice", "bad"), client(), now);
        assert_eq!(denied[3], ErrorCode::Access.as_u8());
        assert_eq!(&denied[..2], &[0, 0]);

        for seq in 2..4 {
            let ok = mount(&ctx, &mut sessions, &mount_dgram(seq, false, "/", "alice", "pw"), client(), now);
            assert_eq!(ok[3], 0);
        }
        let full = mount(&ctx, &mut sessions, &mount_dgram(4, false, "/", "alice", "pw"), client(), now);
        assert_eq!(full[3], ErrorCode::NFile.as_u8());
        Ok(())
    }

    #[test]
    fn test_bad_credentials_reveal_nothing_about_paths() -> Result<()> {
        let accounts = vec![Account {
            user: "alice".into(),
            password: "pw".into(),
            permission: Permission::ReadWrite,
        }];
        let (_dir, ctx, mut sessions) = setup_test_server(Auth::with_accounts(accounts, false))?;
        let now = Instant::now();

        let statuses: Vec<u8> = ["/games", "/missing", "/readme.txt", "/.."]
            .iter()
            .enumerate()
            .map(|(seq, path)| mount(&ctx, &mut sessions, &mount_dgram(seq as u8, false, path, "mallory", "x"), client(), now)[3])
            .collect();
        assert_eq!(statuses, vec![ErrorCode::Access.as_u8(); 4]);

        // with valid credentials the path errors show up as usual
        let missing = mount(&ctx, &mut sessions, &mount_dgram(9, false, "/missing", "alice", "pw"), client(), now);
        assert_eq!(missing[3], ErrorCode::NoEnt.as_u8());
        assert!(sessions.is_empty());
        Ok(())
    }

    #[test]
    fn test_umount_destroys_session() -> Result<()> {
        let (_dir, ctx, mut sessions) = setup_test_server(Auth::open(false))?;
        mount(&ctx, &mut sessions, &mount_dgram(1, false, "/", "", ""), client(), Instant::now());
        let dgram = Datagram {
            session_id: 1,
            sequence: 2,
            retry: false,
            opcode: Command::Umount as u8,
            payload: Vec::new(),
        };
        assert_eq!(umount(&ctx, &mut sessions, &dgram), vec![1, 0, 2, 0]);
        assert!(sessions.is_empty());
        Ok(())
    }
}
