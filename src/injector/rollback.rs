//! Target snapshots and copy journaling.
//!
//! Before the first load-command edit the target is copied to a sibling
//! "alternate" file. A failed run copies it back; a successful run deletes
//! it. An alternate that outlives its run means the process died mid-patch,
//! and [`Snapshot::recover`] puts the original bytes back.
//!
//! Copy destinations go through a [`CopyJournal`]. A destination that
//! already existed (an asset injected by an earlier run) is moved aside
//! first and moved back if the run fails, since the restored target still
//! links against it.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::fsops::Filesystem;
use crate::macho::write_atomically;

/// Suffix appended to the target's file name to form the alternate.
pub const ALTERNATE_SUFFIX: &str = ".sideload-alternate";

/// Suffix of a pre-existing copy destination moved aside during a run.
pub const DISPLACED_SUFFIX: &str = ".sideload-displaced";

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(OsString::new);
    name.push(suffix);
    path.with_file_name(name)
}

/// A saved copy of the target executable.
#[derive(Debug)]
pub struct Snapshot {
    target: PathBuf,
    alternate: PathBuf,
}

impl Snapshot {
    /// Returns where the alternate of `target` lives.
    pub fn alternate_path(target: &Path) -> PathBuf {
        with_suffix(target, ALTERNATE_SUFFIX)
    }

    /// Copies `target` (bytes and permissions) to its alternate and syncs it.
    ///
    /// Refuses to overwrite an alternate left by an earlier run, since that
    /// file may hold the only unpatched copy.
    pub fn take(target: &Path) -> Result<Self> {
        let alternate = Self::alternate_path(target);
        let failed = |source| Error::SnapshotFailed {
            path: target.to_path_buf(),
            source,
        };

        if fs::symlink_metadata(&alternate).is_ok() {
            return Err(failed(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("stale snapshot {} must be recovered first", alternate.display()),
            )));
        }

        let copied = fs::copy(target, &alternate).and_then(|_| File::open(&alternate)?.sync_all());
        if let Err(e) = copied {
            let _ = fs::remove_file(&alternate);
            return Err(failed(e));
        }

        debug!("Snapshot of {} at {}", target.display(), alternate.display());
        Ok(Self {
            target: target.to_path_buf(),
            alternate,
        })
    }

    /// Returns the snapshotted target.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Returns the alternate file.
    pub fn alternate(&self) -> &Path {
        &self.alternate
    }

    /// Writes the saved bytes back over the target.
    pub fn restore(&self) -> Result<()> {
        let data = fs::read(&self.alternate).map_err(|e| Error::FileOpen {
            path: self.alternate.clone(),
            source: e,
        })?;
        write_atomically(&self.target, &data)?;

        let perms = fs::metadata(&self.alternate)?.permissions();
        fs::set_permissions(&self.target, perms)?;

        info!("Restored {}", self.target.display());
        Ok(())
    }

    /// Deletes the alternate.
    pub fn discard(self) -> Result<()> {
        fs::remove_file(&self.alternate)?;
        debug!("Discarded snapshot {}", self.alternate.display());
        Ok(())
    }

    /// Restores `target` from an alternate left by an interrupted run.
    ///
    /// Returns `false` if there was nothing to recover.
    pub fn recover(target: &Path) -> Result<bool> {
        let alternate = Self::alternate_path(target);
        if !alternate.is_file() {
            return Ok(false);
        }

        let snapshot = Self {
            target: target.to_path_buf(),
            alternate,
        };
        snapshot.restore()?;
        snapshot.discard()?;
        Ok(true)
    }
}

#[derive(Debug)]
struct Placement {
    destination: PathBuf,
    displaced: Option<PathBuf>,
}

/// Destinations written by a run, with whatever they replaced.
#[derive(Debug, Default)]
pub struct CopyJournal {
    placements: Vec<Placement>,
}

impl CopyJournal {
    /// Creates an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns where a pre-existing `destination` is kept during a run.
    pub fn displaced_path(destination: &Path) -> PathBuf {
        with_suffix(destination, DISPLACED_SUFFIX)
    }

    /// Records `destination` before it is written. An existing file or
    /// directory there is moved aside.
    pub fn reserve(&mut self, filesystem: &Filesystem, destination: &Path) -> Result<()> {
        let displaced = if fs::symlink_metadata(destination).is_ok() {
            let side = Self::displaced_path(destination);
            if fs::symlink_metadata(&side).is_ok() {
                warn!("Discarding leftover {}", side.display());
                filesystem.remove(&side, true)?;
            }
            fs::rename(destination, &side).map_err(|e| Error::CopyFailed {
                from: destination.to_path_buf(),
                to: side.clone(),
                source: e,
            })?;
            debug!("Moved {} aside", destination.display());
            Some(side)
        } else {
            None
        };

        self.placements.push(Placement {
            destination: destination.to_path_buf(),
            displaced,
        });
        Ok(())
    }

    /// Returns the recorded destinations in write order.
    pub fn destinations(&self) -> impl Iterator<Item = &Path> {
        self.placements.iter().map(|p| p.destination.as_path())
    }

    /// Removes every written destination and moves displaced ones back.
    ///
    /// Failures are logged and the affected paths returned, never raised.
    pub fn undo(&self, filesystem: &Filesystem) -> Vec<PathBuf> {
        let mut residue = Vec::new();
        for placement in self.placements.iter().rev() {
            if let Err(e) = filesystem.remove(&placement.destination, true) {
                warn!("Failed to remove {}: {}", placement.destination.display(), e);
                residue.push(placement.destination.clone());
                continue;
            }
            if let Some(side) = &placement.displaced {
                if let Err(e) = fs::rename(side, &placement.destination) {
                    warn!(
                        "Failed to put back {} (kept at {}): {}",
                        placement.destination.display(),
                        side.display(),
                        e
                    );
                    residue.push(side.clone());
                }
            }
        }
        residue
    }

    /// Deletes the displaced copies of a successful run.
    pub fn commit(&self, filesystem: &Filesystem) {
        for side in self.placements.iter().filter_map(|p| p.displaced.as_ref()) {
            if let Err(e) = filesystem.remove(side, true) {
                warn!("Failed to remove {}: {}", side.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    use crate::config::Ownership;

    fn target_in(dir: &Path) -> PathBuf {
        let target = dir.join("UnityFramework");
        fs::write(&target, b"original bytes").unwrap();
        fs::set_permissions(&target, fs::Permissions::from_mode(0o755)).unwrap();
        target
    }

    #[test]
    fn test_alternate_path() {
        assert_eq!(
            Snapshot::alternate_path(Path::new("/a/Kit.framework/Kit")),
            Path::new("/a/Kit.framework/Kit.sideload-alternate")
        );
    }

    #[test]
    fn test_restore_after_modification() {
        let dir = tempfile::tempdir().unwrap();
        let target = target_in(dir.path());

        let snapshot = Snapshot::take(&target).unwrap();
        fs::write(&target, b"patched").unwrap();
        fs::set_permissions(&target, fs::Permissions::from_mode(0o600)).unwrap();

        snapshot.restore().unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"original bytes");
        let mode = fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        let alternate = snapshot.alternate().to_path_buf();
        snapshot.discard().unwrap();
        assert!(!alternate.exists());
    }

    #[test]
    fn test_take_refuses_stale_alternate() {
        let dir = tempfile::tempdir().unwrap();
        let target = target_in(dir.path());
        fs::write(Snapshot::alternate_path(&target), b"older original").unwrap();

        assert!(matches!(
            Snapshot::take(&target),
            Err(Error::SnapshotFailed { .. })
        ));
        // The stale alternate is left alone.
        assert_eq!(
            fs::read(Snapshot::alternate_path(&target)).unwrap(),
            b"older original"
        );
    }

    #[test]
    fn test_take_missing_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("missing");
        assert!(matches!(
            Snapshot::take(&target),
            Err(Error::SnapshotFailed { .. })
        ));
        assert!(!Snapshot::alternate_path(&target).exists());
    }

    #[test]
    fn test_recover() {
        let dir = tempfile::tempdir().unwrap();
        let target = target_in(dir.path());
        assert!(!Snapshot::recover(&target).unwrap());

        let snapshot = Snapshot::take(&target).unwrap();
        fs::write(&target, b"half patched").unwrap();
        drop(snapshot);

        assert!(Snapshot::recover(&target).unwrap());
        assert_eq!(fs::read(&target).unwrap(), b"original bytes");
        assert!(!Snapshot::alternate_path(&target).exists());
    }

    #[test]
    fn test_journal_undo_removes_new_and_restores_displaced() {
        let dir = tempfile::tempdir().unwrap();
        let fs_ops = Filesystem::new(Ownership::Preserve);
        let fresh = dir.path().join("libA.dylib");
        let existing = dir.path().join("Kit.framework");
        fs::create_dir_all(&existing).unwrap();
        fs::write(existing.join("Kit"), b"earlier run").unwrap();

        let mut journal = CopyJournal::new();
        journal.reserve(&fs_ops, &fresh).unwrap();
        journal.reserve(&fs_ops, &existing).unwrap();
        assert!(!existing.exists());
        assert!(CopyJournal::displaced_path(&existing).is_dir());

        fs::write(&fresh, b"new").unwrap();
        fs::create_dir_all(&existing).unwrap();
        fs::write(existing.join("Kit"), b"this run").unwrap();

        assert!(journal.undo(&fs_ops).is_empty());
        assert!(!fresh.exists());
        assert_eq!(fs::read(existing.join("Kit")).unwrap(), b"earlier run");
        assert!(!CopyJournal::displaced_path(&existing).exists());
    }

    #[test]
    fn test_journal_commit_drops_displaced() {
        let dir = tempfile::tempdir().unwrap();
        let fs_ops = Filesystem::new(Ownership::Preserve);
        let existing = dir.path().join("libFoo.dylib");
        fs::write(&existing, b"old").unwrap();

        let mut journal = CopyJournal::new();
        journal.reserve(&fs_ops, &existing).unwrap();
        fs::write(&existing, b"new").unwrap();
        journal.commit(&fs_ops);

        assert_eq!(fs::read(&existing).unwrap(), b"new");
        assert!(!CopyJournal::displaced_path(&existing).exists());
        assert_eq!(journal.destinations().collect::<Vec<_>>(), [existing.as_path()]);
    }

    #[test]
    fn test_journal_replaces_leftover_displaced() {
        let dir = tempfile::tempdir().unwrap();
        let fs_ops = Filesystem::new(Ownership::Preserve);
        let existing = dir.path().join("libFoo.dylib");
        fs::write(&existing, b"current").unwrap();
        fs::write(CopyJournal::displaced_path(&existing), b"leftover").unwrap();

        let mut journal = CopyJournal::new();
        journal.reserve(&fs_ops, &existing).unwrap();
        journal.undo(&fs_ops);
        assert_eq!(fs::read(&existing).unwrap(), b"current");
    }
}
