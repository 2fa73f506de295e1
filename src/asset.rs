//! Asset classification and validation.
//!
//! An asset is anything the user asks to sideload: a resource bundle that is
//! simply copied into the package, or a dylib/framework whose binary gets a
//! dependency entry in the target executable.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bundle;
use crate::error::{Error, Result};
use crate::macho::is_macho_file;
use crate::util::{extension_lowercase, leaf_name};

/// What kind of asset a path refers to, decided by its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    /// `.bundle` directory, copied into the package root
    Bundle,
    /// `.dylib` file
    Dylib,
    /// `.framework` directory with an embedded executable
    Framework,
}

impl AssetKind {
    /// Maps a path's extension to a kind, case-insensitively.
    pub fn from_path(path: &Path) -> Option<Self> {
        match extension_lowercase(path).as_str() {
            "bundle" => Some(Self::Bundle),
            "dylib" => Some(Self::Dylib),
            "framework" => Some(Self::Framework),
            _ => None,
        }
    }

    /// Returns true for kinds that end up as a dependency entry.
    #[inline]
    pub fn is_executable(self) -> bool {
        !matches!(self, Self::Bundle)
    }

    /// Returns the extension this kind is recognised by.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bundle => "bundle",
            Self::Dylib => "dylib",
            Self::Framework => "framework",
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified asset path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    /// Location of the asset. Never written to.
    pub path: PathBuf,
    /// Asset kind
    pub kind: AssetKind,
}

impl Asset {
    /// Classifies `path` by extension.
    pub fn from_path(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        let kind = AssetKind::from_path(&path)?;
        Some(Self { path, kind })
    }

    /// Returns the asset's file name, which is also its name inside the package.
    pub fn name(&self) -> &str {
        leaf_name(&self.path)
    }
}

impl AsRef<Path> for Asset {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

/// Assets split by how they are installed. Input order is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classified {
    /// Resource bundles
    pub bundles: Vec<Asset>,
    /// Dylibs and frameworks
    pub executables: Vec<Asset>,
}

/// Partitions paths into bundles and executables. Paths with any other
/// extension are dropped.
pub fn classify<P: AsRef<Path>>(paths: &[P]) -> Classified {
    let mut classified = Classified::default();
    for path in paths {
        let path = path.as_ref();
        match Asset::from_path(path) {
            Some(asset) if asset.kind.is_executable() => classified.executables.push(asset),
            Some(asset) => classified.bundles.push(asset),
            None => debug!("Skipping unrecognised asset {}", path.display()),
        }
    }
    classified
}

/// Validates user-supplied asset paths before anything is modified.
///
/// Each path is checked independently in parallel; the result keeps the input
/// order and the first failure in input order is reported.
pub fn preprocess<P: AsRef<Path> + Sync>(paths: &[P]) -> Result<Vec<Asset>> {
    if paths.is_empty() {
        return Err(Error::NoAssets);
    }

    let assets = paths
        .par_iter()
        .map(|p| validate(p.as_ref()))
        .collect::<Result<Vec<_>>>()?;

    let mut seen = HashSet::with_capacity(assets.len());
    for asset in &assets {
        if !seen.insert(asset.name().to_string()) {
            return Err(Error::DuplicateAsset {
                name: asset.name().to_string(),
            });
        }
    }

    debug!("Validated {} asset(s)", assets.len());
    Ok(assets)
}

fn validate(path: &Path) -> Result<Asset> {
    let meta = fs::metadata(path).map_err(|_| Error::AssetNotFound {
        path: path.to_path_buf(),
    })?;

    let asset = Asset::from_path(path).ok_or_else(|| Error::UnsupportedAsset {
        path: path.to_path_buf(),
    })?;

    if asset.name().is_empty() {
        return Err(Error::UnsupportedAsset {
            path: path.to_path_buf(),
        });
    }

    match asset.kind {
        AssetKind::Bundle if !meta.is_dir() => {
            return Err(Error::malformed(path, "resource bundle is not a directory"));
        }
        AssetKind::Dylib => {
            if !meta.is_file() {
                return Err(Error::malformed(path, "dylib is not a regular file"));
            }
            if !is_macho_file(path) {
                return Err(Error::malformed(path, "dylib is not a Mach-O image"));
            }
        }
        AssetKind::Framework => {
            if !meta.is_dir() {
                return Err(Error::malformed(path, "framework is not a directory"));
            }
            bundle::locate_executable(path)?;
        }
        AssetKind::Bundle => {}
    }

    Ok(asset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::Package;

    #[test]
    fn test_classify_keeps_order() {
        let classified = classify(&[
            "/a/One.bundle",
            "/a/libA.dylib",
            "/a/notes.txt",
            "/a/Two.BUNDLE",
            "/a/Kit.framework",
        ]);

        let bundles: Vec<_> = classified.bundles.iter().map(|a| a.name()).collect();
        let executables: Vec<_> = classified.executables.iter().map(|a| a.name()).collect();
        assert_eq!(bundles, ["One.bundle", "Two.BUNDLE"]);
        assert_eq!(executables, ["libA.dylib", "Kit.framework"]);
        assert_eq!(classified.executables[1].kind, AssetKind::Framework);
    }

    #[test]
    fn test_classify_empty() {
        let classified = classify::<&str>(&[]);
        assert!(classified.bundles.is_empty());
        assert!(classified.executables.is_empty());
    }

    #[test]
    fn test_preprocess_accepts_valid_assets() {
        let pkg = Package::new();
        let paths = vec![
            pkg.dylib("libFoo.dylib"),
            pkg.framework("Kit.framework"),
            pkg.bundle("Skins.bundle"),
        ];

        let assets = preprocess(&paths).unwrap();
        let kinds: Vec<_> = assets.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, [AssetKind::Dylib, AssetKind::Framework, AssetKind::Bundle]);
    }

    #[test]
    fn test_preprocess_empty() {
        assert!(matches!(preprocess::<PathBuf>(&[]), Err(Error::NoAssets)));
    }

    #[test]
    fn test_preprocess_rejects_missing_and_unknown() {
        let pkg = Package::new();
        let missing = pkg.assets.join("libGone.dylib");
        assert!(matches!(
            preprocess(&[missing]),
            Err(Error::AssetNotFound { .. })
        ));

        let text = pkg.assets.join("notes.txt");
        fs::write(&text, "x").unwrap();
        assert!(matches!(
            preprocess(&[text]),
            Err(Error::UnsupportedAsset { .. })
        ));
    }

    #[test]
    fn test_preprocess_rejects_fake_dylib() {
        let pkg = Package::new();
        let fake = pkg.assets.join("libFake.dylib");
        fs::write(&fake, "#!/bin/sh\n").unwrap();
        assert!(matches!(
            preprocess(&[fake]),
            Err(Error::AssetMalformed { .. })
        ));
    }

    #[test]
    fn test_preprocess_rejects_framework_without_executable() {
        let pkg = Package::new();
        let bad = pkg.empty_framework("Bad.framework");
        assert!(matches!(
            preprocess(&[bad]),
            Err(Error::AssetMalformed { .. })
        ));
    }

    #[test]
    fn test_preprocess_rejects_duplicate_leaf() {
        let pkg = Package::new();
        let first = pkg.dylib("libFoo.dylib");
        let other_dir = pkg.assets.join("other");
        fs::create_dir_all(&other_dir).unwrap();
        let second = other_dir.join("libFoo.dylib");
        fs::copy(&first, &second).unwrap();

        let err = preprocess(&[first, second]).unwrap_err();
        assert!(matches!(err, Error::DuplicateAsset { name } if name == "libFoo.dylib"));
    }
}
