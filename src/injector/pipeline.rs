//! Target patching state machine.
//!
//! A run moves through the stages of [`Stage`] in order. Nothing is written
//! before [`Stage::Snapshotted`]; from there on any failure restores the
//! snapshot and undoes the copies before the error is returned. Copies that
//! replaced files from an earlier run put those files back.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use super::names::{canonical_name, reconcile};
use super::rollback::{CopyJournal, Snapshot};
use crate::asset::{Asset, AssetKind};
use crate::config::{AuxiliaryBinary, InjectorConfig};
use crate::editor::DependencyEditor;
use crate::error::{Error, Result};
use crate::fsops::{destination_in, CopyOptions, Filesystem};
use crate::trust::{TrustBypass, TrustBypassApplicator};

/// Progress of a patch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Nothing happened yet
    Idle,
    /// Target exists and is readable
    TargetValidated,
    /// Every source asset passed the bypass
    BypassedSource,
    /// Target saved to its alternate
    Snapshotted,
    /// Assets being copied into the frameworks directory
    Copying,
    /// Dependency entries being written
    PatchingLoadCommands,
    /// Bypass being re-applied to the patched target
    Rebypassing,
    /// Run finished, snapshot discarded
    Committed,
    /// Undoing a failed run
    RollingBack,
    /// Run aborted
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A target executable that was checked to exist and be readable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetHandle {
    path: PathBuf,
}

impl TargetHandle {
    /// Validates `path` as the target of a run.
    pub fn resolve(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let readable = path.is_file() && File::open(&path).is_ok();
        if !readable {
            return Err(Error::TargetNotFound { path });
        }
        Ok(Self { path })
    }

    /// Returns the target path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// What a run will do with one executable asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedAsset {
    /// Source asset
    pub asset: Asset,
    /// Copy destination inside the frameworks directory
    pub destination: PathBuf,
    /// Dependency entry for the asset's own binary
    pub install_name: String,
    /// Secondary binaries shipped inside the asset
    pub auxiliary: Vec<AuxiliaryBinary>,
}

impl PlannedAsset {
    /// Every dependency entry this asset adds to the target.
    pub fn install_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.install_name.as_str())
            .chain(self.auxiliary.iter().map(|a| a.install_name.as_str()))
    }
}

/// Outcome of a committed run.
#[derive(Debug, Clone)]
pub struct PatchReport {
    /// The patched target
    pub target: PathBuf,
    /// Assets in patch order
    pub assets: Vec<PlannedAsset>,
    /// Stages the run went through
    pub stages: Vec<Stage>,
}

/// Drives one patch run against one target.
pub struct Orchestrator<'a> {
    editor: &'a dyn DependencyEditor,
    bypass: &'a dyn TrustBypass,
    fs: &'a Filesystem,
    config: &'a InjectorConfig,
    frameworks: PathBuf,
    stages: Vec<Stage>,
    journal: CopyJournal,
}

impl<'a> Orchestrator<'a> {
    /// Creates an orchestrator copying assets into `frameworks`.
    pub fn new(
        editor: &'a dyn DependencyEditor,
        bypass: &'a dyn TrustBypass,
        fs: &'a Filesystem,
        config: &'a InjectorConfig,
        frameworks: impl Into<PathBuf>,
    ) -> Self {
        Self {
            editor,
            bypass,
            fs,
            config,
            frameworks: frameworks.into(),
            stages: vec![Stage::Idle],
            journal: CopyJournal::new(),
        }
    }

    /// Returns the current stage.
    pub fn stage(&self) -> Stage {
        self.stages.last().copied().unwrap_or(Stage::Idle)
    }

    /// Returns every stage entered so far.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    fn advance(&mut self, stage: Stage) {
        debug!("{} -> {}", self.stage(), stage);
        self.stages.push(stage);
    }

    fn applicator(&self) -> TrustBypassApplicator<'a> {
        TrustBypassApplicator::new(self.bypass, self.editor, self.fs, &self.config.team_id)
    }

    /// Injects `assets` into `target`.
    ///
    /// On error the target is byte-identical to its state before the call,
    /// unless the error is [`Error::CorruptedTargetState`].
    pub fn run(&mut self, target: TargetHandle, assets: &[Asset]) -> Result<PatchReport> {
        self.advance(Stage::TargetValidated);

        let (plan, snapshot) = match self.prepare(&target, assets) {
            Ok(prepared) => prepared,
            Err(e) => {
                self.advance(Stage::Failed);
                return Err(e);
            }
        };
        self.advance(Stage::Snapshotted);

        if let Err(e) = self.mutate(&target, &plan) {
            return Err(self.roll_back(&target, snapshot, e));
        }

        self.advance(Stage::Committed);
        self.journal.commit(self.fs);
        let alternate = snapshot.alternate().to_path_buf();
        if let Err(e) = snapshot.discard() {
            warn!("Failed to discard snapshot {}: {}", alternate.display(), e);
        }

        info!(
            "Injected {} asset(s) into {}",
            plan.len(),
            target.path().display()
        );
        Ok(PatchReport {
            target: target.path,
            assets: plan,
            stages: self.stages.clone(),
        })
    }

    /// Everything up to and including the snapshot. Failures here leave the
    /// package untouched.
    fn prepare(
        &mut self,
        target: &TargetHandle,
        assets: &[Asset],
    ) -> Result<(Vec<PlannedAsset>, Snapshot)> {
        let plan = self.plan(target, assets)?;
        self.bypass_sources(&plan)?;
        let snapshot = Snapshot::take(target.path())?;
        Ok((plan, snapshot))
    }

    /// Resolves destinations and install names. Touches nothing.
    fn plan(&self, target: &TargetHandle, assets: &[Asset]) -> Result<Vec<PlannedAsset>> {
        assets
            .iter()
            .map(|asset| {
                if !asset.kind.is_executable() {
                    return Err(Error::UnsupportedAsset {
                        path: asset.path.clone(),
                    });
                }

                let destination = destination_in(&self.frameworks, &asset.path);
                if target.path().starts_with(&destination) {
                    return Err(Error::malformed(
                        &asset.path,
                        "would replace the target executable",
                    ));
                }

                let descriptor = self.config.descriptor_for(asset.name());
                let install_name = match descriptor.and_then(|d| d.install_name.clone()) {
                    Some(name) => name,
                    None => canonical_name(self.editor, &asset.path)?,
                };

                Ok(PlannedAsset {
                    asset: asset.clone(),
                    destination,
                    install_name,
                    auxiliary: descriptor.map(|d| d.auxiliary.clone()).unwrap_or_default(),
                })
            })
            .collect()
    }

    fn bypass_sources(&mut self, plan: &[PlannedAsset]) -> Result<()> {
        let applicator = self.applicator();
        for item in plan {
            applicator.apply(&item.asset.path)?;
        }
        self.advance(Stage::BypassedSource);
        Ok(())
    }

    fn mutate(&mut self, target: &TargetHandle, plan: &[PlannedAsset]) -> Result<()> {
        self.advance(Stage::Copying);
        for item in plan {
            self.journal.reserve(self.fs, &item.destination)?;
            self.fs
                .copy(&item.asset.path, &item.destination, CopyOptions::REPLACE)?;
            self.fs.chown_to_installer(
                &item.destination,
                item.asset.kind == AssetKind::Framework,
            )?;
        }

        self.advance(Stage::PatchingLoadCommands);
        for item in plan {
            self.patch(target.path(), item)
                .map_err(|e| Error::patch(item.asset.name(), e))?;
        }

        self.advance(Stage::Rebypassing);
        self.applicator().apply(target.path())
    }

    fn patch(&self, target: &Path, item: &PlannedAsset) -> Result<()> {
        let weak = self.config.weak;

        self.editor
            .insert_runtime_search_path(target, &self.config.runtime_search_path)?;
        self.editor.insert_dependency(target, &item.install_name, weak)?;
        reconcile(self.editor, target, &item.install_name)?;

        for aux in &item.auxiliary {
            self.editor.insert_dependency(target, &aux.install_name, weak)?;

            let binary = item.destination.join(&aux.path);
            if !Filesystem::is_readable(&binary) {
                warn!(
                    "{}: auxiliary binary {} not found, skipping bypass",
                    item.asset.name(),
                    aux.path.display()
                );
                continue;
            }
            self.applicator().apply(&binary)?;
            if let Some(parent) = binary.parent() {
                self.fs.chown_to_installer(parent, true)?;
            }
        }

        info!("Linked {}", item.install_name);
        Ok(())
    }

    fn roll_back(&mut self, target: &TargetHandle, snapshot: Snapshot, cause: Error) -> Error {
        self.advance(Stage::RollingBack);
        warn!("Rolling back {}: {}", target.path().display(), cause);

        let restored = snapshot.restore();
        let residue = self.journal.undo(self.fs);
        if !residue.is_empty() {
            warn!("{} copied asset(s) could not be undone", residue.len());
        }
        self.advance(Stage::Failed);

        match restored {
            Ok(()) => {
                if let Err(e) = self.fs.chown_to_installer(target.path(), false) {
                    warn!("Failed to restore owner of {}: {}", target.path().display(), e);
                }
                let alternate = snapshot.alternate().to_path_buf();
                if let Err(e) = snapshot.discard() {
                    warn!("Failed to discard snapshot {}: {}", alternate.display(), e);
                }
                cause
            }
            Err(restore) => {
                error!(
                    "Could not restore {}; original bytes remain at {}",
                    target.path().display(),
                    snapshot.alternate().display()
                );
                Error::CorruptedTargetState {
                    path: target.path().to_path_buf(),
                    original: Box::new(cause),
                    restore: Box::new(restore),
                }
            }
        }
    }
}
