use std::ffi::OsStr;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

use log::warn;
use thiserror::Error;

use super::errors::ErrorCode;

/// Reasons a client path cannot be resolved inside the exported tree.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The path, or a symlink along it, leads outside the root.
    #[error("path escapes the exported root: {0:?}")]
    Escape(PathBuf),
    /// The filesystem refused to resolve part of the path.
    #[error("cannot resolve path: {0}")]
    Io(#[from] io::Error),
}

impl From<SandboxError> for ErrorCode {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Escape(_) => ErrorCode::Access,
            SandboxError::Io(e) => ErrorCode::from(e),
        }
    }
}

/// A directory subtree that client paths are confined to.
///
/// The root is canonical, so a prefix check on canonical paths is enough to
/// decide containment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    root: PathBuf,
}

impl Namespace {
    /// Creates a namespace rooted at an existing directory.
    ///
    /// # Errors
    ///
    /// Returns an error if `root` does not exist or is not a directory.
    pub fn new<P: AsRef<Path>>(root: P) -> io::Result<Self> {
        let root = fs::canonicalize(root)?;
        if !fs::metadata(&root)?.is_dir() {
            return Err(io::Error::from_raw_os_error(libc::ENOTDIR));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether a canonical path lies within the root.
    pub fn contains(&self, canonical: &Path) -> bool {
        canonical.starts_with(&self.root)
    }

    /// Resolves a client path against this root.
    ///
    /// `cwd` is the client's current directory relative to the root, used
    /// for relative paths; absolute paths start from the root itself.
    /// `..` may not climb above the root, and every symlink on the way,
    /// including the last component, must point back inside it. The
    /// returned path names the last component itself, so operations like
    /// unlink act on a link rather than its target.
    pub fn resolve(&self, cwd: &Path, client_path: &[u8]) -> Result<PathBuf, SandboxError> {
        let requested = Path::new(OsStr::from_bytes(client_path));
        let mut parts: Vec<&OsStr> = Vec::new();
        if !requested.has_root() {
            self.push_components(&mut parts, cwd, requested)?;
        }
        self.push_components(&mut parts, requested, requested)?;

        let Some((name, parents)) = parts.split_last() else {
            return Ok(self.root.clone());
        };

        let parent: PathBuf = parents.iter().fold(self.root.clone(), |acc, p| acc.join(p));
        let parent = fs::canonicalize(&parent)?;
        if !self.contains(&parent) {
            warn!("Rejected {:?}: parent resolves to {:?}", requested, parent);
            return Err(SandboxError::Escape(requested.to_path_buf()));
        }

        let full = parent.join(name);
        match fs::symlink_metadata(&full) {
            Ok(meta) if meta.file_type().is_symlink() => match fs::canonicalize(&full) {
                Ok(target) if self.contains(&target) => {}
                Ok(target) => {
                    warn!("Rejected {:?}: symlink to {:?}", requested, target);
                    return Err(SandboxError::Escape(requested.to_path_buf()));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!("Rejected {:?}: dangling symlink", requested);
                    return Err(SandboxError::Escape(requested.to_path_buf()));
                }
                Err(e) => return Err(e.into()),
            },
            _ => {}
        }
        Ok(full)
    }

    fn push_components<'a>(
        &self,
        parts: &mut Vec<&'a OsStr>,
        path: &'a Path,
        requested: &Path,
    ) -> Result<(), SandboxError> {
        for component in path.components() {
            match component {
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
                Component::ParentDir => {
                    if parts.pop().is_none() {
                        return Err(SandboxError::Escape(requested.to_path_buf()));
                    }
                }
                Component::Normal(part) => parts.push(part),
            }
        }
        Ok(())
    }

    /// Narrows the namespace to a directory beneath it, e.g. a mount point.
    pub fn subtree(&self, client_path: &[u8]) -> Result<Namespace, SandboxError> {
        let dir = self.resolve(Path::new(""), client_path)?;
        let dir = fs::canonicalize(dir)?;
        if !fs::metadata(&dir)?.is_dir() {
            return Err(SandboxError::Io(io::Error::from_raw_os_error(libc::ENOTDIR)));
        }
        Ok(Namespace { root: dir })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn setup_test_dir() -> Result<(TempDir, Namespace)> {
        let temp_dir = tempfile::tempdir()?;
        let root = temp_dir.path().join("export");
        fs::create_dir_all(root.join("docs/nested"))?;
        fs::write(root.join("a.txt"), "hello world")?;
        let ns = Namespace::new(&root)?;
        Ok((temp_dir, ns))
    }

    #[test]
    fn test_namespace_creation() -> Result<()> {
        let (temp_dir, ns) = setup_test_dir()?;
        assert_eq!(ns.root(), fs::canonicalize(temp_dir.path().join("export"))?);
        assert!(Namespace::new(temp_dir.path().join("missing")).is_err());
        assert!(Namespace::new(temp_dir.path().join("export/a.txt")).is_err());
        Ok(())
    }

    #[test]
    fn test_resolve_absolute_and_relative() -> Result<()> {
        let (_temp_dir, ns) = setup_test_dir()?;
        let root = ns.root().to_path_buf();

        assert_eq!(ns.resolve(Path::new(""), b"/a.txt")?, root.join("a.txt"));
        assert_eq!(ns.resolve(Path::new("docs"), b"nested")?, root.join("docs/nested"));
        assert_eq!(ns.resolve(Path::new("docs"), b"/a.txt")?, root.join("a.txt"));
        assert_eq!(ns.resolve(Path::new(""), b"/")?, root);
        assert_eq!(ns.resolve(Path::new(""), b"")?, root);
        assert_eq!(ns.resolve(Path::new(""), b"./docs/./nested/..")?, root.join("docs"));
        // Targets that do not exist yet resolve as long as the parent does
        assert_eq!(ns.resolve(Path::new(""), b"/new.txt")?, root.join("new.txt"));
        Ok(())
    }

    #[test]
    fn test_dotdot_escape_is_rejected() -> Result<()> {
        let (_temp_dir, ns) = setup_test_dir()?;
        for path in [&b"/.."[..], b"..", b"../export/a.txt", b"/docs/../../etc/passwd"] {
            let res = ns.resolve(Path::new(""), path);
            assert!(matches!(res, Err(SandboxError::Escape(_))), "{:?}", path);
        }
        assert!(matches!(
            ns.resolve(Path::new("docs"), b"../../x"),
            Err(SandboxError::Escape(_))
        ));
        Ok(())
    }

    #[test]
    fn test_symlink_escape_is_rejected() -> Result<()> {
        let (temp_dir, ns) = setup_test_dir()?;
        let outside = temp_dir.path().join("outside");
        fs::create_dir_all(&outside)?;
        fs::write(outside.join("secret"), "s3cr3t")?;
        symlink(&outside, ns.root().join("out_dir"))?;
        symlink(outside.join("secret"), ns.root().join("out_file"))?;
        symlink(temp_dir.path().join("nowhere"), ns.root().join("dangling"))?;

        for path in [&b"/out_dir/secret"[..], b"/out_dir", b"/out_file", b"/dangling", b"/out_dir/new"] {
            let res = ns.resolve(Path::new(""), path);
            assert!(matches!(res, Err(SandboxError::Escape(_))), "{:?}", path);
        }
        Ok(())
    }

    #[test]
    fn test_symlink_inside_root_is_allowed() -> Result<()> {
        let (_temp_dir, ns) = setup_test_dir()?;
        symlink(ns.root().join("docs"), ns.root().join("docs_link"))?;
        symlink(ns.root().join("a.txt"), ns.root().join("a_link"))?;

        let resolved = ns.resolve(Path::new(""), b"/docs_link/nested")?;
        assert_eq!(resolved, ns.root().join("docs/nested"));
        // The link itself is returned, not its target
        assert_eq!(ns.resolve(Path::new(""), b"/a_link")?, ns.root().join("a_link"));
        Ok(())
    }

    #[test]
    fn test_escape_maps_to_access_error() -> Result<()> {
        let (_temp_dir, ns) = setup_test_dir()?;
        let err = ns.resolve(Path::new(""), b"/..").unwrap_err();
        assert_eq!(ErrorCode::from(err), ErrorCode::Access);
        let err = ns.resolve(Path::new(""), b"/missing/file").unwrap_err();
        assert_eq!(ErrorCode::from(err), ErrorCode::NoEnt);
        Ok(())
    }

    #[test]
    fn test_subtree() -> Result<()> {
        let (_temp_dir, ns) = setup_test_dir()?;
        let docs = ns.subtree(b"/docs")?;
        assert_eq!(docs.root(), ns.root().join("docs"));
        assert!(matches!(docs.resolve(Path::new(""), b"/../a.txt"), Err(SandboxError::Escape(_))));
        assert!(ns.subtree(b"/a.txt").is_err());
        assert!(ns.subtree(b"/..").is_err());
        Ok(())
    }
}
