//! Dependency-table editing.
//!
//! [`DependencyEditor`] is the seam between the injection pipeline and the
//! Mach-O layer. [`NativeEditor`] edits files in place through
//! [`MachOFile`]; tests wrap it to inject failures.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::bundle;
use crate::error::{Error, Result};
use crate::macho::{read_dependencies, Dependency, MachOFile};

/// Reads and rewrites the dependency entries of Mach-O files.
pub trait DependencyEditor {
    /// Lists the dependency entries of `binary` in load order.
    fn list_dependencies(&self, binary: &Path) -> Result<Vec<Dependency>>;

    /// Appends a dependency entry. Returns `false` if `name` was already present.
    fn insert_dependency(&self, binary: &Path, name: &str, weak: bool) -> Result<bool>;

    /// Renames an existing dependency entry in place.
    fn rename_dependency(&self, binary: &Path, from: &str, to: &str) -> Result<()>;

    /// Removes a dependency entry.
    fn remove_dependency(&self, binary: &Path, name: &str) -> Result<()>;

    /// Adds a runtime search path. Returns `false` if it was already present.
    fn insert_runtime_search_path(&self, binary: &Path, path: &str) -> Result<bool>;

    /// Finds the main executable of a bundle.
    fn locate_executable(&self, bundle: &Path) -> Result<PathBuf>;

    /// Lists every Mach-O file at the root of a bundle.
    fn list_candidate_executables(&self, bundle: &Path) -> Result<Vec<PathBuf>>;
}

impl<T: DependencyEditor + ?Sized> DependencyEditor for &T {
    fn list_dependencies(&self, binary: &Path) -> Result<Vec<Dependency>> {
        (**self).list_dependencies(binary)
    }

    fn insert_dependency(&self, binary: &Path, name: &str, weak: bool) -> Result<bool> {
        (**self).insert_dependency(binary, name, weak)
    }

    fn rename_dependency(&self, binary: &Path, from: &str, to: &str) -> Result<()> {
        (**self).rename_dependency(binary, from, to)
    }

    fn remove_dependency(&self, binary: &Path, name: &str) -> Result<()> {
        (**self).remove_dependency(binary, name)
    }

    fn insert_runtime_search_path(&self, binary: &Path, path: &str) -> Result<bool> {
        (**self).insert_runtime_search_path(binary, path)
    }

    fn locate_executable(&self, bundle: &Path) -> Result<PathBuf> {
        (**self).locate_executable(bundle)
    }

    fn list_candidate_executables(&self, bundle: &Path) -> Result<Vec<PathBuf>> {
        (**self).list_candidate_executables(bundle)
    }
}

/// Edits Mach-O files directly. Every slice of a FAT file is updated.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeEditor;

impl NativeEditor {
    fn edit<F>(binary: &Path, edit: F) -> Result<bool>
    where
        F: FnMut(&mut crate::macho::MachOContext) -> Result<bool>,
    {
        let mut file = MachOFile::open(binary)?;
        let changed = file.edit(edit)?;
        file.save()?;
        Ok(changed)
    }
}

impl DependencyEditor for NativeEditor {
    fn list_dependencies(&self, binary: &Path) -> Result<Vec<Dependency>> {
        read_dependencies(binary)
    }

    fn insert_dependency(&self, binary: &Path, name: &str, weak: bool) -> Result<bool> {
        let inserted = Self::edit(binary, |ctx| ctx.add_dylib(name, weak))?;
        if inserted {
            debug!("Inserted {} into {}", name, binary.display());
        } else {
            debug!("{} already loads {}", binary.display(), name);
        }
        Ok(inserted)
    }

    fn rename_dependency(&self, binary: &Path, from: &str, to: &str) -> Result<()> {
        if !Self::edit(binary, |ctx| ctx.rename_dylib(from, to))? {
            return Err(Error::DependencyNotFound {
                path: binary.to_path_buf(),
                name: from.to_string(),
            });
        }
        debug!("Renamed {} -> {} in {}", from, to, binary.display());
        Ok(())
    }

    fn remove_dependency(&self, binary: &Path, name: &str) -> Result<()> {
        if !Self::edit(binary, |ctx| ctx.remove_dylib(name))? {
            return Err(Error::DependencyNotFound {
                path: binary.to_path_buf(),
                name: name.to_string(),
            });
        }
        debug!("Removed {} from {}", name, binary.display());
        Ok(())
    }

    fn insert_runtime_search_path(&self, binary: &Path, path: &str) -> Result<bool> {
        Self::edit(binary, |ctx| ctx.add_rpath(path))
    }

    fn locate_executable(&self, bundle: &Path) -> Result<PathBuf> {
        bundle::locate_executable(bundle)
    }

    fn list_candidate_executables(&self, bundle: &Path) -> Result<Vec<PathBuf>> {
        bundle::list_candidate_executables(bundle)
    }
}
