//! Injection receipt.
//!
//! A JSON file at the package root recording which assets were injected,
//! where they were copied to and which dependency entries they added, so a
//! later ejection can undo exactly that.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::asset::AssetKind;
use crate::error::{Error, Result};
use crate::macho::write_atomically;

/// File name of the receipt inside the package.
pub const RECEIPT_FILE: &str = ".sideload-receipt.json";

const RECEIPT_VERSION: u32 = 1;

/// One injected asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptEntry {
    /// Asset file name
    pub asset: String,
    /// Asset kind
    pub kind: AssetKind,
    /// Where the asset was copied to, relative to the package
    pub destination: PathBuf,
    /// Dependency entries added to the target for this asset
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub install_names: Vec<String>,
}

/// Everything injected into one package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Format version
    pub version: u32,
    /// Target executable, relative to the package
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<PathBuf>,
    /// Injected assets, most recent last
    #[serde(default)]
    pub entries: Vec<ReceiptEntry>,
}

impl Default for Receipt {
    fn default() -> Self {
        Self {
            version: RECEIPT_VERSION,
            target: None,
            entries: Vec::new(),
        }
    }
}

impl Receipt {
    /// Merges `other` into this receipt. Entries for the same asset are replaced.
    pub fn merge(&mut self, other: Receipt) {
        if other.target.is_some() {
            self.target = other.target;
        }
        for entry in other.entries {
            self.entries.retain(|e| e.asset != entry.asset);
            self.entries.push(entry);
        }
    }
}

/// Reads and writes the receipt of one package.
#[derive(Debug, Clone)]
pub struct ReceiptStore {
    path: PathBuf,
}

impl ReceiptStore {
    /// Creates a store for the receipt inside `package`.
    pub fn for_package(package: &Path) -> Self {
        Self {
            path: package.join(RECEIPT_FILE),
        }
    }

    /// Returns the receipt path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the receipt, or an empty one if none exists.
    pub fn load(&self) -> Result<Receipt> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Receipt::default()),
            Err(e) => {
                return Err(Error::FileOpen {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };

        let receipt: Receipt = serde_json::from_slice(&data).map_err(|e| Error::Receipt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        if receipt.version > RECEIPT_VERSION {
            return Err(Error::Receipt {
                path: self.path.clone(),
                reason: format!("unsupported version {}", receipt.version),
            });
        }
        Ok(receipt)
    }

    /// Merges `receipt` into the stored one and writes it back.
    pub fn record(&self, receipt: Receipt) -> Result<Receipt> {
        let mut stored = self.load()?;
        stored.merge(receipt);

        let json = serde_json::to_vec_pretty(&stored).map_err(|e| Error::Receipt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        write_atomically(&self.path, &json)?;

        debug!(
            "Recorded {} asset(s) in {}",
            stored.entries.len(),
            self.path.display()
        );
        Ok(stored)
    }
}
