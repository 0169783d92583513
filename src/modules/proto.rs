//! TNFS wire format.
//!
//! Requests start with a five byte header (session id, sequence number,
//! retry flag, command), replies with a four byte one (session id, sequence
//! number, status). All integers are little-endian and strings are
//! NUL-terminated.

use bitflags::bitflags;

use super::constants::*;
use super::errors::ErrorCode;

/// Operation codes understood by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Mount = 0x00,
    Umount = 0x01,
    OpenDir = 0x10,
    ReadDir = 0x11,
    CloseDir = 0x12,
    MkDir = 0x13,
    RmDir = 0x14,
    TellDir = 0x15,
    SeekDir = 0x16,
    OpenDirX = 0x17,
    ReadDirX = 0x18,
    OpenLegacy = 0x20,
    Read = 0x21,
    Write = 0x22,
    Close = 0x23,
    Stat = 0x24,
    Seek = 0x25,
    Unlink = 0x26,
    Chmod = 0x27,
    Rename = 0x28,
    Open = 0x29,
    Size = 0x30,
    Free = 0x31,
}

impl Command {
    /// Decodes an operation code, `None` for codes the daemon does not know.
    pub fn from_u8(code: u8) -> Option<Self> {
        let cmd = match code {
            0x00 => Command::Mount,
            0x01 => Command::Umount,
            0x10 => Command::OpenDir,
            0x11 => Command::ReadDir,
            0x12 => Command::CloseDir,
            0x13 => Command::MkDir,
            0x14 => Command::RmDir,
            0x15 => Command::TellDir,
            0x16 => Command::SeekDir,
            0x17 => Command::OpenDirX,
            0x18 => Command::ReadDirX,
            0x20 => Command::OpenLegacy,
            0x21 => Command::Read,
            0x22 => Command::Write,
            0x23 => Command::Close,
            0x24 => Command::Stat,
            0x25 => Command::Seek,
            0x26 => Command::Unlink,
            0x27 => Command::Chmod,
            0x28 => Command::Rename,
            0x29 => Command::Open,
            0x30 => Command::Size,
            0x31 => Command::Free,
            _ => return None,
        };
        Some(cmd)
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::Mount => "MOUNT",
            Command::Umount => "UMOUNT",
            Command::OpenDir => "OPENDIR",
            Command::ReadDir => "READDIR",
            Command::CloseDir => "CLOSEDIR",
            Command::MkDir => "MKDIR",
            Command::RmDir => "RMDIR",
            Command::TellDir => "TELLDIR",
            Command::SeekDir => "SEEKDIR",
            Command::OpenDirX => "OPENDIRX",
            Command::ReadDirX => "READDIRX",
            Command::OpenLegacy => "OPENFILE_OLD",
            Command::Read => "READ",
            Command::Write => "WRITE",
            Command::Close => "CLOSE",
            Command::Stat => "STAT",
            Command::Seek => "SEEK",
            Command::Unlink => "UNLINK",
            Command::Chmod => "CHMOD",
            Command::Rename => "RENAME",
            Command::Open => "OPEN",
            Command::Size => "SIZE",
            Command::Free => "FREE",
        }
    }

    /// Commands that always change the exported tree.
    ///
    /// OPEN is decided per request from its flags.
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            Command::MkDir
                | Command::RmDir
                | Command::Write
                | Command::Unlink
                | Command::Chmod
                | Command::Rename
        )
    }

    /// Smallest payload a well-formed request of this kind can carry.
    pub fn min_payload_len(self) -> usize {
        match self {
            Command::Mount => 2,
            Command::Umount | Command::Size | Command::Free => 0,
            Command::ReadDir
            | Command::CloseDir
            | Command::TellDir
            | Command::Close => 1,
            Command::ReadDirX => 2,
            Command::SeekDir => 5,
            Command::Read => 3,
            Command::Write => 3,
            Command::Seek => 6,
            Command::Chmod => 3,
            Command::Rename => 2,
            Command::Open => 5,
            Command::OpenDirX => 6,
            Command::OpenDir
            | Command::MkDir
            | Command::RmDir
            | Command::Stat
            | Command::Unlink
            | Command::OpenLegacy => 1,
        }
    }
}

/// A decoded request datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub session_id: u16,
    pub sequence: u8,
    pub retry: bool,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

impl Datagram {
    /// Parses a raw packet.
    ///
    /// Returns `None` for packets that are too short or too long, and for
    /// known commands whose payload is shorter than their fixed part.
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < REQUEST_HEADER_LEN || packet.len() > MAX_MESSAGE_SIZE {
            return None;
        }
        let opcode = packet[4];
        let payload = &packet[REQUEST_HEADER_LEN..];
        if let Some(cmd) = Command::from_u8(opcode) {
            if payload.len() < cmd.min_payload_len() {
                return None;
            }
        }
        Some(Self {
            session_id: u16::from_le_bytes([packet[0], packet[1]]),
            sequence: packet[2],
            retry: packet[3] != 0,
            opcode,
            payload: payload.to_vec(),
        })
    }

    pub fn command(&self) -> Option<Command> {
        Command::from_u8(self.opcode)
    }

    /// Serializes the request, the inverse of [`Datagram::parse`].
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(REQUEST_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.session_id.to_le_bytes());
        out.push(self.sequence);
        out.push(u8::from(self.retry));
        out.push(self.opcode);
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Builds a complete reply datagram.
pub fn encode_reply(session_id: u16, sequence: u8, status: ErrorCode, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(REPLY_HEADER_LEN + payload.len());
    out.extend_from_slice(&session_id.to_le_bytes());
    out.push(sequence);
    out.push(status.as_u8());
    out.extend_from_slice(payload);
    out
}

/// A decoded reply, used by tests and tooling on the client side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub session_id: u16,
    pub sequence: u8,
    pub status: u8,
    pub payload: Vec<u8>,
}

impl Reply {
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < REPLY_HEADER_LEN {
            return None;
        }
        Some(Self {
            session_id: u16::from_le_bytes([packet[0], packet[1]]),
            sequence: packet[2],
            status: packet[3],
            payload: packet[REPLY_HEADER_LEN..].to_vec(),
        })
    }

    pub fn is_ok(&self) -> bool {
        self.status == ErrorCode::Success.as_u8()
    }
}

/// Cursor over a request payload. Running off the end is `EINVAL`.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ErrorCode> {
        let end = self.pos.checked_add(n).ok_or(ErrorCode::Inval)?;
        let bytes = self.buf.get(self.pos..end).ok_or(ErrorCode::Inval)?;
        self.pos = end;
        Ok(bytes)
    }

    pub fn u8(&mut self) -> Result<u8, ErrorCode> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, ErrorCode> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, ErrorCode> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i32(&mut self) -> Result<i32, ErrorCode> {
        Ok(self.u32()? as i32)
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], ErrorCode> {
        self.take(n)
    }

    /// Reads a NUL-terminated string, without the terminator.
    pub fn cstr(&mut self) -> Result<&'a [u8], ErrorCode> {
        let rest = &self.buf[self.pos..];
        let len = rest.iter().position(|&b| b == 0).ok_or(ErrorCode::Inval)?;
        self.pos += len + 1;
        Ok(&rest[..len])
    }

    /// Like [`PayloadReader::cstr`] but an exhausted payload yields an
    /// empty string and a missing terminator takes the rest of the buffer.
    pub fn optional_cstr(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        match rest.iter().position(|&b| b == 0) {
            Some(len) => {
                self.pos += len + 1;
                &rest[..len]
            }
            None => {
                self.pos = self.buf.len();
                rest
            }
        }
    }
}

/// Appends a NUL-terminated string to a reply payload.
pub fn put_cstr(out: &mut Vec<u8>, s: &[u8]) {
    out.extend_from_slice(s);
    out.push(0);
}

bitflags! {
    /// OPEN flags as sent by clients.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u16 {
        const READ = 0x0001;
        const WRITE = 0x0002;
        const APPEND = 0x0008;
        const CREATE = 0x0100;
        const TRUNCATE = 0x0200;
        const EXCLUSIVE = 0x0400;
    }
}

impl OpenFlags {
    /// Whether opening with these flags may modify the tree.
    pub fn mutates(self) -> bool {
        self.intersects(
            OpenFlags::WRITE
                | OpenFlags::APPEND
                | OpenFlags::CREATE
                | OpenFlags::TRUNCATE
                | OpenFlags::EXCLUSIVE,
        )
    }
}

bitflags! {
    /// Listing options of OPENDIRX.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DirOptions: u8 {
        const NO_FOLDERS_FIRST = 0x01;
        const NO_SKIP_HIDDEN = 0x02;
        const NO_SKIP_SPECIAL = 0x04;
        const DIR_PATTERN = 0x08;
        const NO_FOLDERS = 0x10;
    }
}

bitflags! {
    /// Sort options of OPENDIRX.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SortOptions: u8 {
        const NONE = 0x01;
        const CASE = 0x02;
        const DESCENDING = 0x04;
        const MODIFIED = 0x08;
        const SIZE = 0x10;
    }
}

bitflags! {
    /// Per-entry flags in READDIRX replies.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntryFlags: u8 {
        const DIRECTORY = 0x01;
        const HIDDEN = 0x02;
        const SPECIAL = 0x04;
    }
}

/// READDIRX status bit set once the listing is exhausted.
pub const DIR_STATUS_EOF: u8 = 0x01;
