//! Signature-verification bypass.
//!
//! A patched executable no longer matches its code signature. The bypass
//! itself is an opaque external program; this module runs it and makes sure
//! the bypassed files end up owned by the installer.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use crate::bundle;
use crate::config::{BypassConfig, PATH_PLACEHOLDER, TEAM_ID_PLACEHOLDER};
use crate::editor::DependencyEditor;
use crate::error::{Error, Result};
use crate::fsops::Filesystem;

/// Makes one Mach-O executable loadable despite an invalid signature.
pub trait TrustBypass {
    /// Applies the bypass to `executable` on behalf of `team_id`.
    fn bypass_signature(&self, executable: &Path, team_id: &str) -> Result<()>;
}

impl<T: TrustBypass + ?Sized> TrustBypass for &T {
    fn bypass_signature(&self, executable: &Path, team_id: &str) -> Result<()> {
        (**self).bypass_signature(executable, team_id)
    }
}

impl<T: TrustBypass + ?Sized> TrustBypass for Box<T> {
    fn bypass_signature(&self, executable: &Path, team_id: &str) -> Result<()> {
        (**self).bypass_signature(executable, team_id)
    }
}

/// Runs an external bypass program once per executable.
#[derive(Debug, Clone)]
pub struct ExternalBypass {
    program: PathBuf,
    args: Vec<String>,
}

impl ExternalBypass {
    /// Creates a bypass running `program` with an argument template.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Builds the bypass from configuration. Fails if no program is set.
    pub fn from_config(config: &BypassConfig) -> Result<Self> {
        let program = config.program.clone().ok_or_else(|| Error::Config {
            reason: "no bypass program configured".into(),
        })?;
        Ok(Self::new(program, config.args.clone()))
    }

    /// Expands the argument template for one invocation.
    pub fn arguments(&self, executable: &Path, team_id: &str) -> Vec<OsString> {
        self.args
            .iter()
            .map(|arg| {
                if arg == PATH_PLACEHOLDER {
                    executable.as_os_str().to_owned()
                } else {
                    OsString::from(arg.replace(TEAM_ID_PLACEHOLDER, team_id))
                }
            })
            .collect()
    }
}

impl TrustBypass for ExternalBypass {
    fn bypass_signature(&self, executable: &Path, team_id: &str) -> Result<()> {
        let args = self.arguments(executable, team_id);
        debug!("Running {} {:?}", self.program.display(), args);

        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|e| Error::SignatureBypass {
                path: executable.to_path_buf(),
                message: format!("failed to run {}: {}", self.program.display(), e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::SignatureBypass {
                path: executable.to_path_buf(),
                message: format!("{} ({})", output.status, stderr.trim()),
            });
        }

        Ok(())
    }
}

/// Applies a [`TrustBypass`] to files or bundles and fixes ownership.
pub struct TrustBypassApplicator<'a> {
    bypass: &'a dyn TrustBypass,
    editor: &'a dyn DependencyEditor,
    fs: &'a Filesystem,
    team_id: &'a str,
}

impl<'a> TrustBypassApplicator<'a> {
    /// Creates an applicator.
    pub fn new(
        bypass: &'a dyn TrustBypass,
        editor: &'a dyn DependencyEditor,
        fs: &'a Filesystem,
        team_id: &'a str,
    ) -> Self {
        Self {
            bypass,
            editor,
            fs,
            team_id,
        }
    }

    /// Bypasses `path`, or the main executable of `path` if it is a bundle,
    /// then hands `path` to the installer.
    pub fn apply(&self, path: &Path) -> Result<()> {
        let is_bundle = bundle::is_bundle(path);
        let executable = if is_bundle {
            self.editor
                .locate_executable(path)
                .map_err(|e| Error::BypassFailed {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?
        } else {
            path.to_path_buf()
        };

        self.bypass.bypass_signature(&executable, self.team_id)?;
        self.fs.chown_to_installer(path, is_bundle)?;

        info!("Bypassed signature of {}", executable.display());
        Ok(())
    }
}
