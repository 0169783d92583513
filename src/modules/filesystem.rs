//! File handlers: open, read, write, seek and the path based operations
//! that act on single files.

use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};

use log::debug;
use nix::sys::statvfs::statvfs;
use nix::unistd::{Gid, Group, Uid, User};

use super::constants::{DEFAULT_CREATE_MODE, MAX_IO_SIZE};
use super::directory::{clamp_time, clamp_u32};
use super::dispatch::HandlerResult;
use super::errors::ErrorCode;
use super::proto::{put_cstr, OpenFlags, PayloadReader};
use super::session::{FileHandle, Session};

/// OPEN: flags u16, mode u16, path -> handle
pub fn open(session: &mut Session, req: &mut PayloadReader<'_>) -> HandlerResult {
    let flags = OpenFlags::from_bits_truncate(req.u16()?);
    let mode = req.u16()?;
    let path = session.namespace.resolve(&session.cwd, req.cstr()?)?;

    if !flags.intersects(OpenFlags::READ | OpenFlags::WRITE) {
        return Err(ErrorCode::Inval);
    }
    if session.files.is_full() {
        return Err(ErrorCode::MFile);
    }
    if fs::metadata(&path).map(|m| m.is_dir()).unwrap_or(false) {
        return Err(ErrorCode::IsDir);
    }

    let create = flags.contains(OpenFlags::CREATE);
    let exclusive = flags.contains(OpenFlags::EXCLUSIVE);
    let mode = match u32::from(mode) & 0o7777 {
        0 => DEFAULT_CREATE_MODE,
        m => m,
    };
    let file = OpenOptions::new()
        .read(flags.contains(OpenFlags::READ))
        .write(flags.contains(OpenFlags::WRITE))
        .append(flags.contains(OpenFlags::APPEND))
        .truncate(flags.contains(OpenFlags::TRUNCATE))
        .create(create && !exclusive)
        .create_new(create && exclusive)
        .mode(mode)
        .open(&path)?;

    let id = session.files.insert(FileHandle { file, path, flags })?;
    debug!("Session {:#06x} opened file handle {} ({:?})", session.id, id, flags);
    Ok(vec![id])
}

/// READ: handle, length -> count u16, data
pub fn read(session: &mut Session, req: &mut PayloadReader<'_>) -> HandlerResult {
    let handle = session.files.get_mut(req.u8()?)?;
    let wanted = (req.u16()? as usize).min(MAX_IO_SIZE);

    let mut buf = vec![0u8; wanted];
    let mut filled = 0;
    while filled < wanted {
        match handle.file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    if filled == 0 && wanted > 0 {
        return Err(ErrorCode::Eof);
    }

    let mut out = Vec::with_capacity(2 + filled);
    out.extend_from_slice(&(filled as u16).to_le_bytes());
    out.extend_from_slice(&buf[..filled]);
    Ok(out)
}

/// WRITE: handle, length, data -> count u16
pub fn write(session: &mut Session, req: &mut PayloadReader<'_>) -> HandlerResult {
    let handle = session.files.get_mut(req.u8()?)?;
    let len = req.u16()? as usize;
    if len > MAX_IO_SIZE {
        return Err(ErrorCode::Inval);
    }
    let data = req.bytes(len)?;
    handle.file.write_all(data)?;
    Ok((len as u16).to_le_bytes().to_vec())
}

/// CLOSE: handle
pub fn close(session: &mut Session, req: &mut PayloadReader<'_>) -> HandlerResult {
    let handle = session.files.remove(req.u8()?)?;
    debug!("Session {:#06x} closed {:?}", session.id, handle.path);
    Ok(Vec::new())
}

/// LSEEK: handle, whence, offset -> new position
pub fn seek(session: &mut Session, req: &mut PayloadReader<'_>) -> HandlerResult {
    let handle = session.files.get_mut(req.u8()?)?;
    let whence = req.u8()?;
    let offset = req.i32()?;
    let target = match whence {
        0 => SeekFrom::Start(u64::try_from(offset).map_err(|_| ErrorCode::Inval)?),
        1 => SeekFrom::Current(i64::from(offset)),
        2 => SeekFrom::End(i64::from(offset)),
        _ => return Err(ErrorCode::Inval),
    };
    let position = handle.file.seek(target)?;
    Ok(clamp_u32(position).to_le_bytes().to_vec())
}

/// STAT: path -> attributes
pub fn stat(session: &mut Session, req: &mut PayloadReader<'_>) -> HandlerResult {
    let path = session.namespace.resolve(&session.cwd, req.cstr()?)?;
    let meta = fs::metadata(path)?;

    let user = match User::from_uid(Uid::from_raw(meta.uid())) {
        Ok(Some(user)) => user.name,
        _ => meta.uid().to_string(),
    };
    let group = match Group::from_gid(Gid::from_raw(meta.gid())) {
        Ok(Some(group)) => group.name,
        _ => meta.gid().to_string(),
    };

    let mut out = Vec::with_capacity(26 + user.len() + group.len() + 2);
    out.extend_from_slice(&(meta.mode() as u16).to_le_bytes());
    out.extend_from_slice(&(meta.uid() as u16).to_le_bytes());
    out.extend_from_slice(&(meta.gid() as u16).to_le_bytes());
    out.extend_from_slice(&clamp_u32(meta.size()).to_le_bytes());
    out.extend_from_slice(&clamp_time(meta.atime()).to_le_bytes());
    out.extend_from_slice(&clamp_time(meta.mtime()).to_le_bytes());
    out.extend_from_slice(&clamp_time(meta.ctime()).to_le_bytes());
    put_cstr(&mut out, user.as_bytes());
    put_cstr(&mut out, group.as_bytes());
    Ok(out)
}

/// UNLINK: path
pub fn unlink(session: &mut Session, req: &mut PayloadReader<'_>) -> HandlerResult {
    let path = session.namespace.resolve(&session.cwd, req.cstr()?)?;
    fs::remove_file(path)?;
    Ok(Vec::new())
}

/// CHMOD: mode u16, path
pub fn chmod(session: &mut Session, req: &mut PayloadReader<'_>) -> HandlerResult {
    let mode = u32::from(req.u16()?) & 0o7777;
    let path = session.namespace.resolve(&session.cwd, req.cstr()?)?;
    fs::set_permissions(path, Permissions::from_mode(mode))?;
    Ok(Vec::new())
}

/// RENAME: from, to
pub fn rename(session: &mut Session, req: &mut PayloadReader<'_>) -> HandlerResult {
    let from = session.namespace.resolve(&session.cwd, req.cstr()?)?;
    let to = session.namespace.resolve(&session.cwd, req.cstr()?)?;
    let root = session.namespace.root();
    if from == root || to == root {
        return Err(ErrorCode::Busy);
    }
    fs::rename(from, to)?;
    Ok(Vec::new())
}

fn kib(blocks: u64, fragment_size: u64) -> u32 {
    clamp_u32(blocks.saturating_mul(fragment_size) / 1024)
}

/// SIZE: -> size of the filesystem holding the mount, in KiB
pub fn size(session: &mut Session, _req: &mut PayloadReader<'_>) -> HandlerResult {
    let vfs = statvfs(session.namespace.root())?;
    let total = kib(vfs.blocks() as u64, vfs.fragment_size() as u64);
    Ok(total.to_le_bytes().to_vec())
}

/// FREE: -> space available to the mount, in KiB
pub fn free(session: &mut Session, _req: &mut PayloadReader<'_>) -> HandlerResult {
    let vfs = statvfs(session.namespace.root())?;
    let available = kib(vfs.blocks_available() as u64, vfs.fragment_size() as u64);
    Ok(available.to_le_bytes().to_vec())
}
