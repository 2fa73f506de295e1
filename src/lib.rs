//! sideload - Injects dylibs, frameworks and resource bundles into installed
//! app packages.
//!
//! This library rewrites the dependency table (load commands) of one target
//! executable inside an app package so that it loads extra libraries on the
//! next launch. The target is snapshotted before the first edit and restored
//! if any step fails.
//!
//! # Features
//!
//! - Thin and FAT Mach-O editing inside the existing load-command padding
//! - Canonical `@rpath/` install names with cleanup of stale entries
//! - Signature bypass through an external program
//! - Snapshot and rollback of the target executable
//! - Per-asset auxiliary binaries declared in configuration
//!
//! # Example
//!
//! ```no_run
//! use sideload::{InjectorConfig, Injector};
//!
//! fn main() -> sideload::Result<()> {
//!     let config = InjectorConfig::default()
//!         .with_team_id("ABCDE12345")
//!         .with_bypass_program("/usr/local/bin/ct_bypass");
//!
//!     let report = Injector::new("/var/containers/Bundle/Application/X/Game.app", config)?
//!         .inject(&["/tmp/libFoo.dylib", "/tmp/Skins.bundle"])?;
//!
//!     for name in report.install_names() {
//!         println!("linked {name}");
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod asset;
pub mod bundle;
pub mod config;
pub mod editor;
pub mod error;
pub mod fsops;
pub mod injector;
pub mod macho;
pub mod receipt;
pub mod trust;
mod util;

#[cfg(test)]
mod testutil;

// Re-export main types
pub use asset::{classify, preprocess, Asset, AssetKind};
pub use config::InjectorConfig;
pub use editor::{DependencyEditor, NativeEditor};
pub use error::{Error, Result};
pub use injector::{InjectionReport, Injector, Snapshot, Stage};
pub use macho::{Dependency, DependencyKind, MachOFile};
pub use trust::{ExternalBypass, TrustBypass};

use std::path::Path;

/// Injects `assets` into `package` with the native editor and the bypass
/// program named in `config`.
pub fn inject<P: AsRef<Path> + Sync>(
    package: impl AsRef<Path>,
    assets: &[P],
    config: InjectorConfig,
) -> Result<InjectionReport> {
    Injector::new(package.as_ref(), config)?.inject(assets)
}

/// Returns the canonical install name of an asset.
pub fn canonical_name<P: AsRef<Path>>(asset: P) -> Result<String> {
    injector::canonical_name(&NativeEditor, asset.as_ref())
}
