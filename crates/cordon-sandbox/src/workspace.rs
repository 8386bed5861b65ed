//! Per-session file storage with guaranteed containment
//!
//! Every operation validates the requested path twice: lexically (no absolute
//! paths, no `..`, no NUL) and again after symlink resolution. Anything that
//! does not land strictly inside the session root fails with
//! `SandboxError::PathTraversal` before the filesystem is modified.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

use crate::error::SandboxError;
use crate::request::validate_session_id;
use crate::Result;

/// Default cap for a single file read or write
pub const DEFAULT_MAX_FILE_BYTES: u64 = 16 * 1024 * 1024;

/// A directory listing entry, relative to the session root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Validate a caller-supplied path without touching the filesystem.
///
/// Returns the normalized relative path (an empty path means the root).
pub fn check_relative(path: &str) -> Result<PathBuf> {
    let escape = || SandboxError::PathTraversal(PathBuf::from(path));

    if path.contains('\0') {
        return Err(escape());
    }
    // Treat both separators as separators regardless of host platform
    if path.starts_with('/') || path.starts_with('\\') {
        return Err(escape());
    }
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Err(escape());
    }
    if path.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(escape());
    }

    let mut normalized = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(escape())
            }
        }
    }
    Ok(normalized)
}

/// File storage rooted at one session's directory
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    max_file_bytes: u64,
}

impl Workspace {
    /// Open (creating if needed) a workspace at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let root = fs::canonicalize(&root)?;
        Ok(Self {
            root,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
        })
    }

    pub fn with_max_file_bytes(mut self, bytes: u64) -> Self {
        self.max_file_bytes = bytes;
        self
    }

    /// Canonical session root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an existing path, following symlinks, and verify containment
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = check_relative(path)?;
        let joined = self.root.join(&relative);
        let canonical = match fs::canonicalize(&joined) {
            Ok(p) => p,
            // A dangling symlink may point anywhere; refuse it
            Err(e) if e.kind() == io::ErrorKind::NotFound && is_symlink(&joined) => {
                return Err(SandboxError::PathTraversal(PathBuf::from(path)))
            }
            Err(e) => return Err(e.into()),
        };
        if !canonical.starts_with(&self.root) {
            warn!(path, resolved = %canonical.display(), "symlink escapes workspace");
            return Err(SandboxError::PathTraversal(PathBuf::from(path)));
        }
        Ok(canonical)
    }

    fn resolve_file(&self, path: &str) -> Result<PathBuf> {
        let resolved = self.resolve(path)?;
        if resolved == self.root {
            return Err(SandboxError::Validation(format!("{path} is the workspace root")));
        }
        Ok(resolved)
    }

    /// Read a file inside the workspace
    pub fn read(&self, path: &str) -> Result<Vec<u8>> {
        let resolved = self.resolve_file(path)?;
        let meta = fs::metadata(&resolved)?;
        if !meta.is_file() {
            return Err(SandboxError::Validation(format!("{path} is not a file")));
        }
        if meta.len() > self.max_file_bytes {
            return Err(SandboxError::ResourceLimit(format!(
                "{path} is {} bytes, limit is {}",
                meta.len(),
                self.max_file_bytes
            )));
        }
        Ok(fs::read(resolved)?)
    }

    /// Write a file atomically. Either the whole content lands inside the
    /// workspace or nothing is written.
    pub fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let relative = check_relative(path)?;
        if relative.as_os_str().is_empty() {
            return Err(SandboxError::Validation("cannot write to the workspace root".into()));
        }
        if data.len() as u64 > self.max_file_bytes {
            return Err(SandboxError::ResourceLimit(format!(
                "write of {} bytes exceeds limit of {}",
                data.len(),
                self.max_file_bytes
            )));
        }

        let target = self.contained_target(path, &relative)?;
        if target.is_dir() {
            return Err(SandboxError::Validation(format!("{path} is a directory")));
        }

        let parent = target
            .parent()
            .ok_or_else(|| SandboxError::PathTraversal(PathBuf::from(path)))?;
        fs::create_dir_all(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| e.error)?;

        debug!(path, bytes = data.len(), "workspace write");
        Ok(())
    }

    /// Map a (possibly not yet existing) relative path onto a canonical target.
    ///
    /// The deepest existing ancestor is canonicalized so symlinked directories
    /// are caught before anything is created.
    fn contained_target(&self, path: &str, relative: &Path) -> Result<PathBuf> {
        let joined = self.root.join(relative);
        for ancestor in joined.ancestors() {
            if fs::symlink_metadata(ancestor).is_err() {
                continue;
            }
            let canonical = fs::canonicalize(ancestor)
                .map_err(|_| SandboxError::PathTraversal(PathBuf::from(path)))?;
            if !canonical.starts_with(&self.root) {
                warn!(path, resolved = %canonical.display(), "write target escapes workspace");
                return Err(SandboxError::PathTraversal(PathBuf::from(path)));
            }
            let remainder = joined
                .strip_prefix(ancestor)
                .map_err(|_| SandboxError::PathTraversal(PathBuf::from(path)))?;
            let target = canonical.join(remainder);
            if target == self.root {
                return Err(SandboxError::Validation("cannot write to the workspace root".into()));
            }
            return Ok(target);
        }
        Err(SandboxError::PathTraversal(PathBuf::from(path)))
    }

    /// List a directory inside the workspace, sorted by name
    pub fn list(&self, path: &str) -> Result<Vec<WorkspaceEntry>> {
        let resolved = self.resolve(path)?;
        if !resolved.is_dir() {
            return Err(SandboxError::Validation(format!("{path} is not a directory")));
        }
        let relative_dir = resolved
            .strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let mut entries = Vec::new();
        for entry in fs::read_dir(&resolved)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let file_type = entry.file_type()?;
            let size = if file_type.is_file() {
                entry.metadata().map(|m| m.len()).unwrap_or(0)
            } else {
                0
            };
            entries.push(WorkspaceEntry {
                path: relative_dir.join(&name).to_string_lossy().replace('\\', "/"),
                name,
                is_dir: file_type.is_dir(),
                size,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

/// Registry of session workspaces under one base directory
#[derive(Debug, Clone)]
pub struct Workspaces {
    base: PathBuf,
    max_file_bytes: u64,
}

impl Workspaces {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
        }
    }

    pub fn with_max_file_bytes(mut self, bytes: u64) -> Self {
        self.max_file_bytes = bytes;
        self
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Open a session's workspace, creating its root on first access
    pub fn session(&self, session_id: &str) -> Result<Workspace> {
        validate_session_id(session_id)?;
        fs::create_dir_all(&self.base)?;
        let base = fs::canonicalize(&self.base)?;
        let workspace = Workspace::open(base.join(session_id))?.with_max_file_bytes(self.max_file_bytes);
        if !workspace.root().starts_with(&base) {
            return Err(SandboxError::PathTraversal(PathBuf::from(session_id)));
        }
        Ok(workspace)
    }

    pub fn read(&self, session_id: &str, path: &str) -> Result<Vec<u8>> {
        self.session(session_id)?.read(path)
    }

    pub fn write(&self, session_id: &str, path: &str, data: &[u8]) -> Result<()> {
        self.session(session_id)?.write(path, data)
    }

    pub fn list(&self, session_id: &str, path: &str) -> Result<Vec<WorkspaceEntry>> {
        self.session(session_id)?.list(path)
    }

    /// Delete a session's workspace. Called by the session owner at teardown.
    pub fn remove_session(&self, session_id: &str) -> Result<()> {
        validate_session_id(session_id)?;
        let root = self.base.join(session_id);
        match fs::remove_dir_all(&root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
