//! Filesystem primitives used while installing assets.
//!
//! All paths are treated as untrusted package content: symlinks are copied
//! as links and ownership changes never follow them.

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::{lchown, symlink};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::config::Ownership;
use crate::error::{Error, Result};

/// How [`Filesystem::copy`] treats the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOptions {
    /// Prefer a copy-on-write clone (APFS `clonefile`) over streaming bytes
    pub clone: bool,
    /// Replace an existing destination
    pub overwrite: bool,
}

impl CopyOptions {
    /// Clone-preferring copy that replaces the destination.
    pub const REPLACE: Self = Self {
        clone: true,
        overwrite: true,
    };
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self::REPLACE
    }
}

/// Copy, removal and ownership operations bound to one ownership policy.
#[derive(Debug, Clone, Copy)]
pub struct Filesystem {
    ownership: Ownership,
}

impl Filesystem {
    /// Creates a filesystem handle applying `ownership` to written files.
    pub fn new(ownership: Ownership) -> Self {
        Self { ownership }
    }

    /// Returns the ownership policy.
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Copies a file or directory tree from `from` to `to`.
    pub fn copy(&self, from: &Path, to: &Path, options: CopyOptions) -> Result<()> {
        self.copy_inner(from, to, options)
            .map_err(|source| Error::CopyFailed {
                from: from.to_path_buf(),
                to: to.to_path_buf(),
                source,
            })
    }

    fn copy_inner(&self, from: &Path, to: &Path, options: CopyOptions) -> io::Result<()> {
        let meta = fs::symlink_metadata(from)?;

        if fs::symlink_metadata(to).is_ok() {
            if !options.overwrite {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "destination exists",
                ));
            }
            remove_any(to)?;
        }

        if !meta.is_dir() {
            return copy_entry(from, to, &meta, options.clone);
        }

        for entry in WalkDir::new(from).follow_links(false) {
            let entry = entry.map_err(io::Error::from)?;
            let relative = entry
                .path()
                .strip_prefix(from)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let dest = to.join(relative);
            let meta = entry.metadata().map_err(io::Error::from)?;

            if meta.is_dir() {
                fs::create_dir_all(&dest)?;
                fs::set_permissions(&dest, meta.permissions())?;
            } else {
                copy_entry(entry.path(), &dest, &meta, options.clone)?;
            }
        }

        debug!("Copied {} -> {}", from.display(), to.display());
        Ok(())
    }

    /// Removes a file, or a directory tree when `recursive` is set.
    ///
    /// A missing path is not an error.
    pub fn remove(&self, path: &Path, recursive: bool) -> Result<()> {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::Io(e)),
        };

        if meta.is_dir() {
            if recursive {
                fs::remove_dir_all(path)?;
            } else {
                fs::remove_dir(path)?;
            }
        } else {
            fs::remove_file(path)?;
        }
        trace!("Removed {}", path.display());
        Ok(())
    }

    /// Hands `path` (and everything below it when `recursive`) to the
    /// installer identity. Does nothing under [`Ownership::Preserve`].
    pub fn chown_to_installer(&self, path: &Path, recursive: bool) -> Result<()> {
        let Ownership::Installer { uid, gid } = self.ownership else {
            trace!("Keeping ownership of {}", path.display());
            return Ok(());
        };

        let chown = |p: &Path| {
            lchown(p, Some(uid), Some(gid)).map_err(|e| Error::FileWrite {
                path: p.to_path_buf(),
                source: e,
            })
        };

        if recursive && fs::symlink_metadata(path)?.is_dir() {
            for entry in WalkDir::new(path).follow_links(false) {
                let entry = entry.map_err(io::Error::from)?;
                chown(entry.path())?;
            }
        } else {
            chown(path)?;
        }

        debug!("Changed owner of {} to {}:{}", path.display(), uid, gid);
        Ok(())
    }

    /// Returns true if `path` is a bundle directory.
    pub fn is_bundle(path: &Path) -> bool {
        crate::bundle::is_bundle(path)
    }

    /// Returns true if `path` is a directory (following symlinks).
    pub fn is_directory(path: &Path) -> bool {
        path.is_dir()
    }

    /// Returns true if `path` can be opened for reading.
    pub fn is_readable(path: &Path) -> bool {
        File::open(path).is_ok()
    }
}

fn copy_entry(from: &Path, to: &Path, meta: &fs::Metadata, clone: bool) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }

    if meta.file_type().is_symlink() {
        return symlink(fs::read_link(from)?, to);
    }

    if clone {
        // std::fs::copy uses fclonefile/copy_file_range where available
        fs::copy(from, to)?;
    } else {
        let mut src = File::open(from)?;
        let mut dst = File::create(to)?;
        io::copy(&mut src, &mut dst)?;
        dst.set_permissions(meta.permissions())?;
    }
    Ok(())
}

fn remove_any(path: &Path) -> io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Returns the destination of `asset` inside `dir`.
pub fn destination_in(dir: &Path, asset: &Path) -> PathBuf {
    dir.join(asset.file_name().unwrap_or(asset.as_os_str()))
}
