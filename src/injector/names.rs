//! Install-name resolution.
//!
//! Every injected asset is referenced through the runtime search path, so
//! its dependency entry is `@rpath/<leaf>`. Entries left behind by other
//! tools (absolute jailbreak paths, `@executable_path/...`) that point at
//! the same leaf are folded into that one canonical entry.

use std::path::Path;

use tracing::debug;

use crate::asset::AssetKind;
use crate::editor::DependencyEditor;
use crate::error::{Error, Result};
use crate::util::leaf_name;

/// Prefix of every canonical install name.
pub const RPATH_PREFIX: &str = "@rpath/";

/// Computes the canonical install name of an asset.
///
/// Dylibs map to `@rpath/<file>`, frameworks to
/// `@rpath/<Name.framework>/<executable>`.
pub fn canonical_name(editor: &dyn DependencyEditor, asset: &Path) -> Result<String> {
    let name = leaf_name(asset);
    if name.is_empty() {
        return Err(Error::malformed(asset, "asset has no file name"));
    }

    if AssetKind::from_path(asset) != Some(AssetKind::Framework) {
        return Ok(format!("{RPATH_PREFIX}{name}"));
    }

    let executable = editor.locate_executable(asset).map_err(|e| match e {
        Error::AssetMalformed { .. } => e,
        other => Error::malformed(asset, other.to_string()),
    })?;

    let relative = executable
        .strip_prefix(asset)
        .ok()
        .and_then(|p| p.to_str())
        .filter(|p| !p.is_empty())
        .ok_or_else(|| Error::malformed(asset, "executable lies outside the framework"))?;

    Ok(format!("{RPATH_PREFIX}{name}/{relative}"))
}

/// Returns the part of an install name that identifies the asset, i.e. the
/// name with any `@rpath/` prefix removed.
pub fn install_leaf(install_name: &str) -> &str {
    install_name
        .strip_prefix(RPATH_PREFIX)
        .unwrap_or(install_name)
}

/// Returns true if `entry` names the same asset as `canonical` through a
/// different path.
pub fn is_stale_alias(entry: &str, canonical: &str) -> bool {
    if entry == canonical {
        return false;
    }
    let leaf = install_leaf(canonical);
    entry == leaf
        || entry
            .strip_suffix(leaf)
            .is_some_and(|prefix| prefix.ends_with('/'))
}

/// Folds every stale alias of `canonical` in `target` into one canonical
/// entry. Returns the number of entries renamed or removed.
///
/// The first alias is renamed in place when no canonical entry exists yet;
/// every other alias is removed.
pub fn reconcile(editor: &dyn DependencyEditor, target: &Path, canonical: &str) -> Result<usize> {
    let dependencies = editor.list_dependencies(target)?;
    let mut has_canonical = dependencies.iter().any(|d| d.name == canonical);
    let mut changed = 0;

    for dep in dependencies.iter().filter(|d| is_stale_alias(&d.name, canonical)) {
        if has_canonical {
            editor.remove_dependency(target, &dep.name)?;
            debug!("Dropped duplicate entry {} for {}", dep.name, canonical);
        } else {
            editor.rename_dependency(target, &dep.name, canonical)?;
            has_canonical = true;
            debug!("Rewrote entry {} -> {}", dep.name, canonical);
        }
        changed += 1;
    }

    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use crate::editor::NativeEditor;
    use crate::testutil::{MachOBuilder, Package};

    fn names(editor: &dyn DependencyEditor, target: &Path) -> Vec<String> {
        editor
            .list_dependencies(target)
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect()
    }

    #[test]
    fn test_canonical_dylib() {
        assert_eq!(
            canonical_name(&NativeEditor, Path::new("/tmp/in/libFoo.dylib")).unwrap(),
            "@rpath/libFoo.dylib"
        );
    }

    #[test]
    fn test_canonical_framework_uses_plist_executable() {
        let pkg = Package::new();
        let fw = pkg.framework_with_executable("Kit.framework", "KitCore");
        assert_eq!(
            canonical_name(&NativeEditor, &fw).unwrap(),
            "@rpath/Kit.framework/KitCore"
        );
    }

    #[test]
    fn test_canonical_framework_without_executable() {
        let pkg = Package::new();
        let bad = pkg.empty_framework("Bad.framework");
        assert!(matches!(
            canonical_name(&NativeEditor, &bad),
            Err(Error::AssetMalformed { .. })
        ));
    }

    #[test]
    fn test_stale_alias_matching() {
        let canonical = "@rpath/libFoo.dylib";
        assert!(is_stale_alias("/var/jb/usr/lib/libFoo.dylib", canonical));
        assert!(is_stale_alias("@executable_path/Frameworks/libFoo.dylib", canonical));
        assert!(is_stale_alias("libFoo.dylib", canonical));
        assert!(!is_stale_alias(canonical, canonical));
        assert!(!is_stale_alias("/usr/lib/libNotFoo.dylib", canonical));

        let fw = "@rpath/Kit.framework/Kit";
        assert!(is_stale_alias("/Library/Frameworks/Kit.framework/Kit", fw));
        assert!(!is_stale_alias("/System/Library/Frameworks/OtherKit.framework/Kit", fw));
    }

    #[test]
    fn test_reconcile_renames_when_canonical_absent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("Host");
        fs::write(
            &target,
            MachOBuilder::new()
                .dylib("/var/jb/libFoo.dylib")
                .dylib("/usr/lib/libSystem.B.dylib")
                .build(),
        )
        .unwrap();

        assert_eq!(reconcile(&NativeEditor, &target, "@rpath/libFoo.dylib").unwrap(), 1);
        assert_eq!(
            names(&NativeEditor, &target),
            ["@rpath/libFoo.dylib", "/usr/lib/libSystem.B.dylib"]
        );
    }

    #[test]
    fn test_reconcile_converges_to_single_entry() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("Host");
        fs::write(
            &target,
            MachOBuilder::new()
                .dylib("/var/jb/libFoo.dylib")
                .weak_dylib("@executable_path/libFoo.dylib")
                .dylib("@rpath/libFoo.dylib")
                .build(),
        )
        .unwrap();

        assert_eq!(reconcile(&NativeEditor, &target, "@rpath/libFoo.dylib").unwrap(), 2);
        assert_eq!(names(&NativeEditor, &target), ["@rpath/libFoo.dylib"]);
        // Already converged.
        assert_eq!(reconcile(&NativeEditor, &target, "@rpath/libFoo.dylib").unwrap(), 0);
    }
}
