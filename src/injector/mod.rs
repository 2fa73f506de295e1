//! Injection of assets into an installed app package.
//!
//! # Injection Pipeline
//!
//! 1. **Preprocessing** - Validates every asset path (in parallel)
//! 2. **Classification** - Splits resource bundles from dylibs/frameworks
//! 3. **Target Validation** - Checks the target executable before any write
//! 4. **Bundle Installation** - Copies resource bundles to the package root
//! 5. **Patching** - Bypasses, snapshots, copies and links the executables
//!    into the target, rolling back on failure (see [`Orchestrator`])
//! 6. **Receipt** - Optionally records what was injected

mod bundles;
mod names;
mod pipeline;
mod rollback;

pub use bundles::*;
pub use names::*;
pub use pipeline::*;
pub use rollback::*;

use std::path::{Path, PathBuf};

use tracing::info;

use crate::asset::{classify, preprocess, AssetKind};
use crate::config::InjectorConfig;
use crate::editor::{DependencyEditor, NativeEditor};
use crate::error::{Error, Result};
use crate::fsops::Filesystem;
use crate::receipt::{Receipt, ReceiptEntry, ReceiptStore};
use crate::trust::{ExternalBypass, TrustBypass};

/// Result of a successful injection.
#[derive(Debug, Clone, Default)]
pub struct InjectionReport {
    /// Installed resource bundles
    pub bundles: Vec<PathBuf>,
    /// Patch outcome, if any executable asset was injected
    pub patch: Option<PatchReport>,
}

impl InjectionReport {
    /// Every dependency entry added to the target.
    pub fn install_names(&self) -> Vec<&str> {
        self.patch
            .iter()
            .flat_map(|p| p.assets.iter())
            .flat_map(PlannedAsset::install_names)
            .collect()
    }

    /// Builds a receipt with paths relative to `package`.
    pub fn to_receipt(&self, package: &Path) -> Receipt {
        let relative = |p: &Path| p.strip_prefix(package).unwrap_or(p).to_path_buf();

        let mut entries: Vec<ReceiptEntry> = self
            .bundles
            .iter()
            .map(|dest| ReceiptEntry {
                asset: crate::util::leaf_name(dest).to_string(),
                kind: AssetKind::Bundle,
                destination: relative(dest),
                install_names: Vec::new(),
            })
            .collect();

        if let Some(patch) = &self.patch {
            entries.extend(patch.assets.iter().map(|item| ReceiptEntry {
                asset: item.asset.name().to_string(),
                kind: item.asset.kind,
                destination: relative(&item.destination),
                install_names: item.install_names().map(str::to_string).collect(),
            }));
        }

        Receipt {
            target: self.patch.as_ref().map(|p| relative(&p.target)),
            entries,
            ..Receipt::default()
        }
    }
}

/// Injects assets into one app package.
pub struct Injector<'a> {
    package: PathBuf,
    config: InjectorConfig,
    editor: Box<dyn DependencyEditor + 'a>,
    bypass: Option<Box<dyn TrustBypass + 'a>>,
    fs: Filesystem,
}

impl<'a> Injector<'a> {
    /// Creates an injector for `package` using the native editor and the
    /// configured bypass program.
    pub fn new(package: impl Into<PathBuf>, config: InjectorConfig) -> Result<Self> {
        config.validate()?;

        let bypass: Option<Box<dyn TrustBypass + 'a>> = match config.bypass.program {
            Some(_) => Some(Box::new(ExternalBypass::from_config(&config.bypass)?)),
            None => None,
        };

        Ok(Self {
            package: package.into(),
            fs: Filesystem::new(config.ownership),
            config,
            editor: Box::new(NativeEditor),
            bypass,
        })
    }

    /// Replaces the dependency editor.
    pub fn with_editor(mut self, editor: impl DependencyEditor + 'a) -> Self {
        self.editor = Box::new(editor);
        self
    }

    /// Replaces the trust bypass.
    pub fn with_bypass(mut self, bypass: impl TrustBypass + 'a) -> Self {
        self.bypass = Some(Box::new(bypass));
        self
    }

    /// Returns the package root.
    pub fn package(&self) -> &Path {
        &self.package
    }

    /// Returns the configuration.
    pub fn config(&self) -> &InjectorConfig {
        &self.config
    }

    /// Returns the target executable path.
    pub fn target(&self) -> PathBuf {
        self.config.target_in(&self.package)
    }

    /// Injects `paths` into the package.
    pub fn inject<P: AsRef<Path> + Sync>(&self, paths: &[P]) -> Result<InjectionReport> {
        let assets = preprocess(paths)?;
        let classified = classify(&assets);

        // Everything that can fail without side effects is checked before
        // the first bundle is copied.
        let target = if classified.executables.is_empty() {
            None
        } else {
            let bypass = self.bypass.as_deref().ok_or_else(|| Error::Config {
                reason: "a bypass program is required to inject executables".into(),
            })?;
            Some((TargetHandle::resolve(self.target())?, bypass))
        };

        info!(
            "Injecting {} bundle(s) and {} executable(s) into {}",
            classified.bundles.len(),
            classified.executables.len(),
            self.package.display()
        );

        let bundles = install_bundles(&self.fs, &self.package, &classified.bundles)?;

        let patch = match target {
            Some((handle, bypass)) => {
                let mut orchestrator = Orchestrator::new(
                    self.editor.as_ref(),
                    bypass,
                    &self.fs,
                    &self.config,
                    self.config.frameworks_dir_in(&self.package),
                );
                Some(orchestrator.run(handle, &classified.executables)?)
            }
            None => None,
        };

        let report = InjectionReport { bundles, patch };
        if self.config.persist {
            ReceiptStore::for_package(&self.package).record(report.to_receipt(&self.package))?;
        }
        Ok(report)
    }

    /// Restores the target from a snapshot left by an interrupted run.
    pub fn recover(&self) -> Result<bool> {
        Snapshot::recover(&self.target())
    }
}
