//! Resource bundle installation.
//!
//! Bundles carry no code, so they are copied to the package root without
//! touching the target executable and without a rollback.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::asset::Asset;
use crate::error::{Error, Result};
use crate::fsops::{destination_in, CopyOptions, Filesystem};

/// Copies each bundle into `package` and hands it to the installer.
///
/// Returns the destinations in input order. Bundles installed before a
/// failure stay in place.
pub fn install_bundles(fs: &Filesystem, package: &Path, bundles: &[Asset]) -> Result<Vec<PathBuf>> {
    let mut installed = Vec::with_capacity(bundles.len());

    for (index, bundle) in bundles.iter().enumerate() {
        let dest = destination_in(package, &bundle.path);
        fs.copy(&bundle.path, &dest, CopyOptions::REPLACE)
            .and_then(|()| fs.chown_to_installer(&dest, true))
            .map_err(|e| Error::BundleInstallFailed {
                index,
                path: bundle.path.clone(),
                source: Box::new(e),
            })?;

        info!("Installed {}", bundle.name());
        installed.push(dest);
    }

    Ok(installed)
}
