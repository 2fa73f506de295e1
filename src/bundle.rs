//! Bundle inspection.
//!
//! A bundle's main executable is found the way the loader would: the
//! `CFBundleExecutable` key of its `Info.plist`, then a file named after the
//! bundle, then any Mach-O file at the bundle root.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::macho::is_macho_file;
use crate::util::extension_lowercase;

/// Extensions of directories that carry a main executable.
const BUNDLE_EXTENSIONS: &[&str] = &["app", "appex", "bundle", "framework"];

const EXECUTABLE_KEY: &str = "CFBundleExecutable";

/// Returns true if `path` is a directory with a bundle extension.
pub fn is_bundle(path: &Path) -> bool {
    path.is_dir() && BUNDLE_EXTENSIONS.contains(&extension_lowercase(path).as_str())
}

/// Finds the main executable of a bundle.
pub fn locate_executable(bundle: &Path) -> Result<PathBuf> {
    if let Some(name) = read_executable_name(&bundle.join("Info.plist")) {
        let candidate = bundle.join(&name);
        if candidate.is_file() {
            trace!("{}: executable '{}' from Info.plist", bundle.display(), name);
            return Ok(candidate);
        }
        debug!(
            "{}: Info.plist names missing executable '{}'",
            bundle.display(),
            name
        );
    }

    if let Some(stem) = bundle.file_stem() {
        let candidate = bundle.join(stem);
        if candidate.is_file() && is_macho_file(&candidate) {
            return Ok(candidate);
        }
    }

    list_candidate_executables(bundle)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::malformed(bundle, "no executable found in bundle"))
}

/// Lists the Mach-O files directly inside a bundle, sorted by name.
pub fn list_candidate_executables(bundle: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(bundle).map_err(|e| Error::FileOpen {
        path: bundle.to_path_buf(),
        source: e,
    })?;

    let mut candidates = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && is_macho_file(&path) {
            candidates.push(path);
        }
    }
    candidates.sort();
    Ok(candidates)
}

/// Reads `CFBundleExecutable` from a property list in XML or binary form.
///
/// Returns `None` for missing or malformed plists.
pub fn read_executable_name(plist: &Path) -> Option<String> {
    let value = match plist::Value::from_file(plist) {
        Ok(value) => value,
        Err(e) => {
            trace!("{}: unreadable plist: {}", plist.display(), e);
            return None;
        }
    };
    executable_name(&value)
}

fn executable_name(value: &plist::Value) -> Option<String> {
    value
        .as_dictionary()?
        .get(EXECUTABLE_KEY)?
        .as_string()
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{info_plist, MachOBuilder, Package};

    fn write_binary_plist(path: &Path, executable: &str) {
        let mut dict = plist::Dictionary::new();
        dict.insert("CFBundleIdentifier".into(), "com.example.kit".into());
        dict.insert(EXECUTABLE_KEY.into(), executable.into());
        plist::Value::Dictionary(dict).to_file_binary(path).unwrap();
    }

    #[test]
    fn test_plist_executable_name() {
        let dir = tempfile::tempdir().unwrap();
        let xml = dir.path().join("xml.plist");
        fs::write(&xml, info_plist("Kit")).unwrap();
        assert_eq!(read_executable_name(&xml).as_deref(), Some("Kit"));

        let binary = dir.path().join("binary.plist");
        write_binary_plist(&binary, "KitCore");
        assert!(fs::read(&binary).unwrap().starts_with(b"bplist00"));
        assert_eq!(read_executable_name(&binary).as_deref(), Some("KitCore"));

        let garbage = dir.path().join("garbage.plist");
        fs::write(&garbage, "bplist00\u{1}").unwrap();
        assert_eq!(read_executable_name(&garbage), None);
        assert_eq!(read_executable_name(&dir.path().join("missing.plist")), None);
    }

    #[test]
    fn test_plist_ignores_nested_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Info.plist");
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict>
    <key>Nested</key>
    <dict><key>CFBundleExecutable</key><string>Wrong</string></dict>
    <key>CFBundleExecutable</key><string>Right</string>
</dict></plist>"#;
        fs::write(&path, xml).unwrap();
        assert_eq!(read_executable_name(&path).as_deref(), Some("Right"));
    }

    #[test]
    fn test_locate_from_binary_plist() {
        let pkg = Package::new();
        let fw = pkg.assets.join("Kit.framework");
        fs::create_dir_all(&fw).unwrap();
        write_binary_plist(&fw.join("Info.plist"), "KitCore");
        fs::write(fw.join("Helper"), MachOBuilder::new().build()).unwrap();
        fs::write(fw.join("KitCore"), MachOBuilder::new().build()).unwrap();

        assert_eq!(locate_executable(&fw).unwrap(), fw.join("KitCore"));
    }

    #[test]
    fn test_locate_from_plist() {
        let pkg = Package::new();
        let fw = pkg.framework_with_executable("Kit.framework", "KitCore");
        assert_eq!(locate_executable(&fw).unwrap(), fw.join("KitCore"));
        assert!(is_bundle(&fw));
    }

    #[test]
    fn test_locate_falls_back_to_stem_then_magic() {
        let pkg = Package::new();

        let by_stem = pkg.assets.join("Stem.framework");
        fs::create_dir_all(&by_stem).unwrap();
        fs::write(by_stem.join("Stem"), MachOBuilder::new().build()).unwrap();
        assert_eq!(locate_executable(&by_stem).unwrap(), by_stem.join("Stem"));

        let by_magic = pkg.assets.join("Odd.framework");
        fs::create_dir_all(&by_magic).unwrap();
        fs::write(by_magic.join("Info.plist"), info_plist("Missing")).unwrap();
        fs::write(by_magic.join("notes.txt"), "text").unwrap();
        fs::write(by_magic.join("payload"), MachOBuilder::new().build()).unwrap();
        assert_eq!(locate_executable(&by_magic).unwrap(), by_magic.join("payload"));
        assert_eq!(
            list_candidate_executables(&by_magic).unwrap(),
            [by_magic.join("payload")]
        );
    }

    #[test]
    fn test_locate_fails_without_binary() {
        let pkg = Package::new();
        let bad = pkg.empty_framework("Bad.framework");
        assert!(matches!(
            locate_executable(&bad),
            Err(Error::AssetMalformed { .. })
        ));
    }

    #[test]
    fn test_is_bundle() {
        let pkg = Package::new();
        assert!(is_bundle(&pkg.app));
        assert!(!is_bundle(&pkg.target()));
        assert!(!is_bundle(&pkg.assets));
    }
}
