//! Injector configuration.
//!
//! Settings come from three layers: built-in defaults, an optional TOML file
//! and command-line overrides applied by the binary.
//!
//! ```toml
//! target = "UnityFramework.framework/UnityFramework"
//! team-id = "ABCDE12345"
//! weak = true
//! ownership = { installer = { uid = 33, gid = 33 } }
//!
//! [bypass]
//! program = "/usr/local/bin/ct_bypass"
//! args = ["-i", "{path}", "-r", "-t", "{team_id}"]
//!
//! [[assets]]
//! name = "anogs.framework"
//! auxiliary = [{ path = "anogs ", install-name = "@rpath/anogs.framework/anogs " }]
//! ```

use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default target executable, relative to the package's frameworks directory.
pub const DEFAULT_TARGET: &str = "UnityFramework.framework/UnityFramework";

/// Default frameworks directory, relative to the package root.
pub const DEFAULT_FRAMEWORKS_DIR: &str = "Frameworks";

/// Runtime search path inserted into the target before every dependency.
pub const DEFAULT_RUNTIME_SEARCH_PATH: &str = "@executable_path/Frameworks";

/// uid/gid of `_installd`, which owns installed package files on iOS.
pub const INSTALLER_ID: u32 = 33;

/// Placeholder replaced by the executable path in bypass arguments.
pub const PATH_PLACEHOLDER: &str = "{path}";

/// Placeholder replaced by the team identifier in bypass arguments.
pub const TEAM_ID_PLACEHOLDER: &str = "{team_id}";

/// Who should own files written into the package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Ownership {
    /// Leave ownership as the copy produced it.
    Preserve,
    /// Hand files to the installer identity.
    Installer {
        /// Owner uid
        uid: u32,
        /// Owner gid
        gid: u32,
    },
}

impl Default for Ownership {
    fn default() -> Self {
        Ownership::Installer {
            uid: INSTALLER_ID,
            gid: INSTALLER_ID,
        }
    }
}

/// External signature bypass program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BypassConfig {
    /// Program to run. Injection of executables is impossible without it.
    pub program: Option<PathBuf>,
    /// Argument template; see [`PATH_PLACEHOLDER`] and [`TEAM_ID_PLACEHOLDER`].
    pub args: Vec<String>,
}

impl Default for BypassConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: vec![
                "-i".into(),
                PATH_PLACEHOLDER.into(),
                "-r".into(),
                "-t".into(),
                TEAM_ID_PLACEHOLDER.into(),
            ],
        }
    }
}

/// A second loadable binary shipped inside an asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AuxiliaryBinary {
    /// Path of the binary relative to the asset root
    pub path: PathBuf,
    /// Literal install name to insert into the target
    pub install_name: String,
}

/// Per-asset injection overrides, looked up by the asset's file name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AssetDescriptor {
    /// Asset file name, e.g. `anogs.framework`
    pub name: String,
    /// Install name for the asset's own binary; the canonical name if absent
    #[serde(default)]
    pub install_name: Option<String>,
    /// Extra binaries that need their own load command and bypass
    #[serde(default)]
    pub auxiliary: Vec<AuxiliaryBinary>,
}

impl AssetDescriptor {
    /// The descriptor for `anogs.framework`, which ships a second Mach-O named
    /// `anogs ` (trailing space) that the host loads separately.
    pub fn anogs() -> Self {
        Self {
            name: "anogs.framework".into(),
            install_name: Some("@rpath/anogs.framework/anogs".into()),
            auxiliary: vec![AuxiliaryBinary {
                path: PathBuf::from("anogs "),
                install_name: "@rpath/anogs.framework/anogs ".into(),
            }],
        }
    }
}

/// Configuration for one injection run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct InjectorConfig {
    /// Target executable, relative to the frameworks directory
    pub target: PathBuf,
    /// Frameworks directory, relative to the package root
    pub frameworks_dir: PathBuf,
    /// Runtime search path ensured in the target
    pub runtime_search_path: String,
    /// Insert `LC_LOAD_WEAK_DYLIB` instead of `LC_LOAD_DYLIB`
    pub weak: bool,
    /// Team identifier handed to the bypass program
    pub team_id: String,
    /// Ownership applied to written files
    pub ownership: Ownership,
    /// Bypass program settings
    pub bypass: BypassConfig,
    /// Write a receipt of the injected assets into the package
    pub persist: bool,
    /// Per-asset overrides
    pub assets: Vec<AssetDescriptor>,
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self {
            target: PathBuf::from(DEFAULT_TARGET),
            frameworks_dir: PathBuf::from(DEFAULT_FRAMEWORKS_DIR),
            runtime_search_path: DEFAULT_RUNTIME_SEARCH_PATH.into(),
            weak: true,
            team_id: String::new(),
            ownership: Ownership::default(),
            bypass: BypassConfig::default(),
            persist: false,
            assets: vec![AssetDescriptor::anogs()],
        }
    }
}

impl InjectorConfig {
    /// Loads a configuration file. Missing keys keep their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::FileOpen {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&text)
    }

    /// Parses a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the target executable path.
    pub fn with_target(mut self, target: impl Into<PathBuf>) -> Self {
        self.target = target.into();
        self
    }

    /// Sets the team identifier.
    pub fn with_team_id(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = team_id.into();
        self
    }

    /// Sets the linkage flag for inserted dependencies.
    pub fn with_weak(mut self, weak: bool) -> Self {
        self.weak = weak;
        self
    }

    /// Sets the ownership policy.
    pub fn with_ownership(mut self, ownership: Ownership) -> Self {
        self.ownership = ownership;
        self
    }

    /// Sets the bypass program.
    pub fn with_bypass_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.bypass.program = Some(program.into());
        self
    }

    /// Enables or disables the receipt.
    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Checks the invariants the pipeline relies on.
    pub fn validate(&self) -> Result<()> {
        ensure_relative("target", &self.target)?;
        ensure_relative("frameworks-dir", &self.frameworks_dir)?;

        if self.target.file_name().is_none() {
            return Err(Error::Config {
                reason: "target must name a file".into(),
            });
        }

        if self.runtime_search_path.is_empty() {
            return Err(Error::Config {
                reason: "runtime-search-path must not be empty".into(),
            });
        }

        for descriptor in &self.assets {
            if descriptor.name.is_empty() || descriptor.name.contains('/') {
                return Err(Error::Config {
                    reason: format!("invalid asset descriptor name '{}'", descriptor.name),
                });
            }
            for aux in &descriptor.auxiliary {
                ensure_relative("auxiliary path", &aux.path)?;
                if aux.install_name.is_empty() {
                    return Err(Error::Config {
                        reason: format!("auxiliary binary of '{}' has no install name", descriptor.name),
                    });
                }
            }
        }

        Ok(())
    }

    /// Returns the descriptor registered for an asset file name.
    pub fn descriptor_for(&self, asset_name: &str) -> Option<&AssetDescriptor> {
        self.assets.iter().find(|d| d.name == asset_name)
    }

    /// Returns the frameworks directory of `package`.
    pub fn frameworks_dir_in(&self, package: &Path) -> PathBuf {
        package.join(&self.frameworks_dir)
    }

    /// Returns the target executable path inside `package`.
    pub fn target_in(&self, package: &Path) -> PathBuf {
        self.frameworks_dir_in(package).join(&self.target)
    }
}

fn ensure_relative(what: &str, path: &Path) -> Result<()> {
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if path.as_os_str().is_empty() || escapes {
        return Err(Error::Config {
            reason: format!("{what} must be a relative path inside the package: {}", path.display()),
        });
    }
    Ok(())
}
