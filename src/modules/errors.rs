//! Protocol status codes and the native error translation table.
//!
//! Every handler failure ends up as an [`ErrorCode`], so a reply can always
//! be produced no matter which errno the host returned.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Status byte carried in every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    Success = 0x00,
    Perm = 0x01,
    NoEnt = 0x02,
    Io = 0x03,
    Nxio = 0x04,
    TooBig = 0x05,
    BadF = 0x06,
    Again = 0x07,
    NoMem = 0x08,
    Access = 0x09,
    Busy = 0x0A,
    Exist = 0x0B,
    NotDir = 0x0C,
    IsDir = 0x0D,
    Inval = 0x0E,
    NFile = 0x0F,
    MFile = 0x10,
    FBig = 0x11,
    NoSpc = 0x12,
    SPipe = 0x13,
    RoFs = 0x14,
    NameTooLong = 0x15,
    NoSys = 0x16,
    NotEmpty = 0x17,
    Loop = 0x18,
    NoData = 0x19,
    NoStr = 0x1A,
    Proto = 0x1B,
    BadFd = 0x1C,
    Users = 0x1D,
    NoBufs = 0x1E,
    Already = 0x1F,
    Stale = 0x20,
    Eof = 0x21,
    InvalidSession = 0xFF,
}

impl ErrorCode {
    /// Wire value of the status.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Translates a raw errno value. Unmapped values become [`ErrorCode::Io`].
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            0 => ErrorCode::Success,
            libc::EPERM => ErrorCode::Perm,
            libc::ENOENT => ErrorCode::NoEnt,
            libc::EIO => ErrorCode::Io,
            libc::ENXIO => ErrorCode::Nxio,
            libc::E2BIG => ErrorCode::TooBig,
            libc::EBADF => ErrorCode::BadF,
            libc::EAGAIN => ErrorCode::Again,
            libc::ENOMEM => ErrorCode::NoMem,
            libc::EACCES => ErrorCode::Access,
            libc::EBUSY => ErrorCode::Busy,
            libc::EEXIST => ErrorCode::Exist,
            libc::ENOTDIR => ErrorCode::NotDir,
            libc::EISDIR => ErrorCode::IsDir,
            libc::EINVAL => ErrorCode::Inval,
            libc::ENFILE => ErrorCode::NFile,
            libc::EMFILE => ErrorCode::MFile,
            libc::EFBIG => ErrorCode::FBig,
            libc::ENOSPC => ErrorCode::NoSpc,
            libc::ESPIPE => ErrorCode::SPipe,
            libc::EROFS => ErrorCode::RoFs,
            libc::ENAMETOOLONG => ErrorCode::NameTooLong,
            libc::ENOSYS => ErrorCode::NoSys,
            libc::ENOTEMPTY => ErrorCode::NotEmpty,
            libc::ELOOP => ErrorCode::Loop,
            libc::ENODATA => ErrorCode::NoData,
            libc::ENOSTR => ErrorCode::NoStr,
            libc::EPROTO => ErrorCode::Proto,
            #[cfg(target_os = "linux")]
            libc::EBADFD => ErrorCode::BadFd,
            libc::EUSERS => ErrorCode::Users,
            libc::ENOBUFS => ErrorCode::NoBufs,
            libc::EALREADY => ErrorCode::Already,
            libc::ESTALE => ErrorCode::Stale,
            _ => ErrorCode::Io,
        }
    }
}

/// Maps a native I/O failure onto the protocol's status codes.
///
/// Errors that carry an OS errno go through the errno table; synthetic
/// errors built by std fall back on their [`io::ErrorKind`].
pub fn translate(err: &io::Error) -> ErrorCode {
    if let Some(errno) = err.raw_os_error() {
        return ErrorCode::from_errno(errno);
    }
    match err.kind() {
        io::ErrorKind::NotFound => ErrorCode::NoEnt,
        io::ErrorKind::PermissionDenied => ErrorCode::Access,
        io::ErrorKind::AlreadyExists => ErrorCode::Exist,
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => ErrorCode::Inval,
        io::ErrorKind::WouldBlock => ErrorCode::Again,
        io::ErrorKind::OutOfMemory => ErrorCode::NoMem,
        io::ErrorKind::UnexpectedEof => ErrorCode::Eof,
        io::ErrorKind::Unsupported => ErrorCode::NoSys,
        _ => ErrorCode::Io,
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (status {:#04x})", self, self.as_u8())
    }
}

impl std::error::Error for ErrorCode {}

impl From<io::Error> for ErrorCode {
    fn from(err: io::Error) -> Self {
        translate(&err)
    }
}

impl From<nix::Error> for ErrorCode {
    fn from(errno: nix::Error) -> Self {
        ErrorCode::from_errno(errno as i32)
    }
}

/// Failures that keep the daemon from serving at all.
#[derive(Debug, Error)]
pub enum StartError {
    /// The root directory cannot be used as a server root.
    #[error("invalid root directory {path:?}: {reason}")]
    InvalidDirectory { path: PathBuf, reason: String },
    /// The UDP endpoint could not be established.
    #[error("cannot bind port {port}: {source}")]
    Socket {
        port: u16,
        #[source]
        source: io::Error,
    },
    /// The event loop runtime could not be built.
    #[error("cannot start event loop: {0}")]
    Runtime(#[source] io::Error),
}

impl StartError {
    /// Numeric code for hosts that only speak integers.
    pub fn code(&self) -> i32 {
        match self {
            StartError::InvalidDirectory { .. } => -1,
            StartError::Socket { .. } => -2,
            StartError::Runtime(_) => -3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(ErrorCode::from_errno(libc::ENOENT), ErrorCode::NoEnt);
        assert_eq!(ErrorCode::from_errno(libc::ENOTEMPTY), ErrorCode::NotEmpty);
        assert_eq!(ErrorCode::from_errno(libc::EEXIST).as_u8(), 0x0B);
        assert_eq!(ErrorCode::from_errno(libc::ESTALE).as_u8(), 0x20);
    }

    #[test]
    fn test_unmapped_errno_falls_back_to_eio() {
        assert_eq!(ErrorCode::from_errno(libc::ETIMEDOUT), ErrorCode::Io);
        assert_eq!(ErrorCode::from_errno(-42), ErrorCode::Io);
        assert_eq!(ErrorCode::from_errno(i32::MAX), ErrorCode::Io);
    }

    #[test]
    fn test_translate_io_errors() {
        let os = io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(translate(&os), ErrorCode::Access);

        let synthetic = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(translate(&synthetic), ErrorCode::NoEnt);

        let other = io::Error::new(io::ErrorKind::Other, "odd");
        assert_eq!(ErrorCode::from(other), ErrorCode::Io);

        assert_eq!(ErrorCode::from(nix::Error::ENOSPC), ErrorCode::NoSpc);
    }

    #[test]
    fn test_start_error_codes() {
        let dir = StartError::InvalidDirectory {
            path: PathBuf::from("/nope"),
            reason: "missing".into(),
        };
        let sock = StartError::Socket {
            port: 16384,
            source: io::Error::from_raw_os_error(libc::EADDRINUSE),
        };
        assert_eq!(dir.code(), -1);
        assert_eq!(sock.code(), -2);
        assert!(sock.to_string().contains("16384"));
    }
}
