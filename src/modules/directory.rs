//! Directory handlers: listing, creation and removal.

use std::cmp::Ordering;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use glob::{MatchOptions, Pattern};
use log::debug;

use super::constants::MAX_REPLY_PAYLOAD;
use super::dispatch::HandlerResult;
use super::errors::ErrorCode;
use super::proto::{put_cstr, DirOptions, EntryFlags, PayloadReader, SortOptions, DIR_STATUS_EOF};
use super::session::{DirHandle, Session};

/// One entry of a directory snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: Vec<u8>,
    pub flags: EntryFlags,
    pub size: u64,
    pub mtime: i64,
    pub ctime: i64,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.flags.contains(EntryFlags::DIRECTORY)
    }

    // flags, size, mtime, ctime, name and its terminator
    fn encoded_len(&self) -> usize {
        13 + self.name.len() + 1
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.flags.bits());
        out.extend_from_slice(&clamp_u32(self.size).to_le_bytes());
        out.extend_from_slice(&clamp_time(self.mtime).to_le_bytes());
        out.extend_from_slice(&clamp_time(self.ctime).to_le_bytes());
        put_cstr(out, &self.name);
    }
}

pub(crate) fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

pub(crate) fn clamp_time(secs: i64) -> u32 {
    u32::try_from(secs.max(0)).unwrap_or(u32::MAX)
}

/// How OPENDIRX wants a listing filtered and ordered.
#[derive(Debug, Clone)]
pub struct ListingOptions {
    pub options: DirOptions,
    pub sort: SortOptions,
    pub max_results: u16,
    pub pattern: Option<Pattern>,
}

impl Default for ListingOptions {
    fn default() -> Self {
        Self {
            options: DirOptions::NO_SKIP_HIDDEN | DirOptions::NO_SKIP_SPECIAL | DirOptions::NO_FOLDERS_FIRST,
            sort: SortOptions::CASE,
            max_results: 0,
            pattern: None,
        }
    }
}

/// Reads every entry of `dir`, except `.` and `..`.
pub fn read_entries(dir: &Path) -> io::Result<Vec<DirEntry>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        // Dangling symlinks still show up, with their own metadata
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(_) => fs::symlink_metadata(&path)?,
        };
        let name = entry.file_name().as_bytes().to_vec();
        let mut flags = EntryFlags::empty();
        if meta.is_dir() {
            flags |= EntryFlags::DIRECTORY;
        } else if !meta.is_file() {
            flags |= EntryFlags::SPECIAL;
        }
        if name.first() == Some(&b'.') {
            flags |= EntryFlags::HIDDEN;
        }
        entries.push(DirEntry {
            name,
            flags,
            size: meta.len(),
            mtime: meta.mtime(),
            ctime: meta.ctime(),
        });
    }
    Ok(entries)
}

/// Produces a filtered, ordered listing of `dir`.
pub fn list(dir: &Path, opts: &ListingOptions) -> io::Result<Vec<DirEntry>> {
    let match_opts = MatchOptions {
        case_sensitive: false,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };
    let mut entries: Vec<DirEntry> = read_entries(dir)?
        .into_iter()
        .filter(|e| {
            if e.flags.contains(EntryFlags::HIDDEN) && !opts.options.contains(DirOptions::NO_SKIP_HIDDEN) {
                return false;
            }
            if e.flags.contains(EntryFlags::SPECIAL) && !opts.options.contains(DirOptions::NO_SKIP_SPECIAL) {
                return false;
            }
            if e.is_dir() && opts.options.contains(DirOptions::NO_FOLDERS) {
                return false;
            }
            match &opts.pattern {
                Some(pattern) if !e.is_dir() || opts.options.contains(DirOptions::DIR_PATTERN) => {
                    pattern.matches_with(&String::from_utf8_lossy(&e.name), match_opts)
                }
                _ => true,
            }
        })
        .collect();

    if !opts.sort.contains(SortOptions::NONE) {
        entries.sort_by(|a, b| {
            let order = if opts.sort.contains(SortOptions::MODIFIED) {
                a.mtime.cmp(&b.mtime)
            } else if opts.sort.contains(SortOptions::SIZE) {
                a.size.cmp(&b.size)
            } else {
                Ordering::Equal
            };
            order.then_with(|| compare_names(&a.name, &b.name, opts.sort.contains(SortOptions::CASE)))
        });
        if opts.sort.contains(SortOptions::DESCENDING) {
            entries.reverse();
        }
    }

    if !opts.options.contains(DirOptions::NO_FOLDERS_FIRST) {
        // stable, keeps the order within each group
        entries.sort_by_key(|e| !e.is_dir());
    }

    if opts.max_results > 0 {
        entries.truncate(opts.max_results as usize);
    }
    Ok(entries)
}

fn compare_names(a: &[u8], b: &[u8], case_sensitive: bool) -> Ordering {
    if case_sensitive {
        a.cmp(b)
    } else {
        a.iter()
            .map(u8::to_ascii_lowercase)
            .cmp(b.iter().map(u8::to_ascii_lowercase))
    }
}

fn open_listing(session: &mut Session, path: &[u8], opts: &ListingOptions) -> Result<(u8, usize), ErrorCode> {
    let dir = session.namespace.resolve(&session.cwd, path)?;
    let entries = list(&dir, opts)?;
    let count = entries.len();
    let id = session.dirs.insert(DirHandle {
        path: dir,
        entries,
        position: 0,
    })?;
    debug!("Session {:#06x} opened directory handle {} ({} entries)", session.id, id, count);
    Ok((id, count))
}

/// OPENDIR: path -> handle
pub fn opendir(session: &mut Session, req: &mut PayloadReader<'_>) -> HandlerResult {
    let path = req.cstr()?;
    let (id, _) = open_listing(session, path, &ListingOptions::default())?;
    Ok(vec![id])
}

/// OPENDIRX: options, sort, max results, pattern, path -> handle, count
pub fn opendirx(session: &mut Session, req: &mut PayloadReader<'_>) -> HandlerResult {
    let options = DirOptions::from_bits_truncate(req.u8()?);
    let sort = SortOptions::from_bits_truncate(req.u8()?);
    let max_results = req.u16()?;
    let pattern = req.cstr()?;
    let path = req.cstr()?;

    let pattern = if pattern.is_empty() {
        None
    } else {
        let text = std::str::from_utf8(pattern).map_err(|_| ErrorCode::Inval)?;
        Some(Pattern::new(text).map_err(|_| ErrorCode::Inval)?)
    };
    let opts = ListingOptions {
        options,
        sort,
        max_results,
        pattern,
    };
    let (id, count) = open_listing(session, path, &opts)?;

    let mut out = vec![id];
    out.extend_from_slice(&u16::try_from(count).unwrap_or(u16::MAX).to_le_bytes());
    Ok(out)
}

/// READDIR: handle -> next entry name
pub fn readdir(session: &mut Session, req: &mut PayloadReader<'_>) -> HandlerResult {
    let handle = session.dirs.get_mut(req.u8()?)?;
    let entry = handle.entries.get(handle.position).ok_or(ErrorCode::Eof)?;
    let mut out = Vec::with_capacity(entry.name.len() + 1);
    put_cstr(&mut out, &entry.name);
    handle.position += 1;
    Ok(out)
}

/// READDIRX: handle, count -> count, status, position, entries
pub fn readdirx(session: &mut Session, req: &mut PayloadReader<'_>) -> HandlerResult {
    let handle = session.dirs.get_mut(req.u8()?)?;
    let wanted = match req.u8()? {
        0 => usize::MAX,
        n => n as usize,
    };
    if handle.position >= handle.entries.len() {
        return Err(ErrorCode::Eof);
    }

    let start = handle.position;
    let mut body = Vec::new();
    let mut count = 0usize;
    for entry in &handle.entries[start..] {
        if count == wanted || count == u8::MAX as usize {
            break;
        }
        if 4 + body.len() + entry.encoded_len() > MAX_REPLY_PAYLOAD {
            break;
        }
        entry.encode(&mut body);
        count += 1;
    }
    if count == 0 {
        // a single entry that does not fit in a reply
        return Err(ErrorCode::NameTooLong);
    }
    handle.position += count;

    let status = if handle.position >= handle.entries.len() {
        DIR_STATUS_EOF
    } else {
        0
    };
    let mut out = Vec::with_capacity(4 + body.len());
    out.push(count as u8);
    out.push(status);
    out.extend_from_slice(&u16::try_from(start).unwrap_or(u16::MAX).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// CLOSEDIR: handle
pub fn closedir(session: &mut Session, req: &mut PayloadReader<'_>) -> HandlerResult {
    session.dirs.remove(req.u8()?)?;
    Ok(Vec::new())
}

/// TELLDIR: handle -> position
pub fn telldir(session: &mut Session, req: &mut PayloadReader<'_>) -> HandlerResult {
    let handle = session.dirs.get_mut(req.u8()?)?;
    Ok((handle.position as u32).to_le_bytes().to_vec())
}

/// SEEKDIR: handle, position
pub fn seekdir(session: &mut Session, req: &mut PayloadReader<'_>) -> HandlerResult {
    let handle = session.dirs.get_mut(req.u8()?)?;
    let position = req.u32()? as usize;
    handle.position = position.min(handle.entries.len());
    Ok(Vec::new())
}

/// MKDIR: path
pub fn mkdir(session: &mut Session, req: &mut PayloadReader<'_>) -> HandlerResult {
    let dir = session.namespace.resolve(&session.cwd, req.cstr()?)?;
    fs::create_dir(dir)?;
    Ok(Vec::new())
}

/// RMDIR: path
pub fn rmdir(session: &mut Session, req: &mut PayloadReader<'_>) -> HandlerResult {
    let dir = session.namespace.resolve(&session.cwd, req.cstr()?)?;
    if dir == session.namespace.root() {
        return Err(ErrorCode::Busy);
    }
    fs::remove_dir(dir)?;
    Ok(Vec::new())
}
