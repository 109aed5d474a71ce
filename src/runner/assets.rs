//! Generated asset extraction
//!
//! After a run, disk images the test asked to keep are pulled out of the
//! backend. Which ones is decided by variables:
//!
//! - `STORE_HDD_<n>`: keep disk `n` in the private asset directory
//! - `PUBLISH_HDD_<n>`: keep disk `n` in the public asset directory
//! - `FORCE_PUBLISH_HDD_<n>`: publish disk `n` even if the test failed
//! - `UEFI` + `PUBLISH_PFLASH_VARS`: publish the UEFI variable store
//!
//! for `n` in `1..=NUMDISKS`.

use std::fmt;

use serde::{Serialize, Serializer};

use crate::backend::Backend;
use crate::common::{Error, Result};
use crate::session::Vars;

/// Where an extracted asset is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetDir {
    Public,
    Private,
}

impl AssetDir {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "assets_public",
            Self::Private => "assets_private",
        }
    }
}

impl Serialize for AssetDir {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One artifact to extract
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetDescriptor {
    /// Disk index, absent for the firmware variable store
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hdd_num: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub pflash_vars: bool,
    pub name: String,
    pub dir: AssetDir,
    pub format: Option<String>,
}

impl AssetDescriptor {
    /// Descriptor for disk `index`, format taken from the file extension
    pub fn disk(index: u32, name: &str, dir: AssetDir) -> Self {
        Self {
            hdd_num: Some(index),
            pflash_vars: false,
            name: name.to_string(),
            dir,
            format: format_of(name),
        }
    }

    /// Descriptor for the UEFI variable store
    pub fn pflash_vars(name: &str) -> Self {
        Self {
            hdd_num: None,
            pflash_vars: true,
            name: name.to_string(),
            dir: AssetDir::Public,
            format: Some("qcow2".to_string()),
        }
    }
}

impl fmt::Display for AssetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dir.as_str(), self.name)
    }
}

/// File extension if it is purely alphanumeric (`disk.qcow2` -> `qcow2`)
pub fn format_of(name: &str) -> Option<String> {
    let (_, ext) = name.rsplit_once('.')?;
    if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_string())
}

fn var<'a>(vars: &'a Vars, key: &str) -> Option<&'a str> {
    vars.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

fn var_truthy(vars: &Vars, key: &str) -> bool {
    var(vars, key).is_some_and(|v| v != "0")
}

fn num_disks(vars: &Vars) -> u32 {
    var(vars, "NUMDISKS")
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(1)
}

/// Build the extraction work list
///
/// Store/publish entries are only considered for completed tests and are
/// refused with [`Error::UnsafeShutdown`] unless the machine was shut down
/// cleanly. Forced publications are always appended.
pub fn plan(vars: &Vars, test_completed: bool, clean_shutdown: bool) -> Result<Vec<AssetDescriptor>> {
    let disks = num_disks(vars);
    let mut assets = Vec::new();

    if test_completed {
        for i in 1..=disks {
            let asset = if let Some(name) = var(vars, &format!("STORE_HDD_{i}")) {
                AssetDescriptor::disk(i, name, AssetDir::Private)
            } else if let Some(name) = var(vars, &format!("PUBLISH_HDD_{i}")) {
                AssetDescriptor::disk(i, name, AssetDir::Public)
            } else {
                continue;
            };
            assets.push(asset);
        }

        if var_truthy(vars, "UEFI") {
            if let Some(name) = var(vars, "PUBLISH_PFLASH_VARS") {
                assets.push(AssetDescriptor::pflash_vars(name));
            }
        }

        if !assets.is_empty() && !clean_shutdown {
            return Err(Error::UnsafeShutdown);
        }
    }

    for i in 1..=disks {
        if let Some(name) = var(vars, &format!("FORCE_PUBLISH_HDD_{i}")) {
            assets.push(AssetDescriptor::disk(i, name, AssetDir::Public));
        }
    }

    Ok(assets)
}

/// Extract every asset, continuing past failures
///
/// Returns whether all extractions succeeded.
pub async fn extract_all(backend: &mut dyn Backend, assets: &[AssetDescriptor]) -> bool {
    let mut ok = true;
    for asset in assets {
        tracing::info!(asset = %asset, "extracting asset");
        if let Err(e) = backend.extract_asset(asset).await {
            tracing::error!("{}", e);
            ok = false;
        }
    }
    ok
}

/// Run the extraction stage, returning the resulting exit code
pub async fn handle_generated_assets(
    backend: &mut dyn Backend,
    vars: &Vars,
    test_completed: bool,
    clean_shutdown: bool,
) -> i32 {
    if !backend.info().supports_asset_extraction {
        tracing::debug!(backend = backend.name(), "backend does not extract assets");
        return 0;
    }

    let assets = match plan(vars, test_completed, clean_shutdown) {
        Ok(assets) => assets,
        Err(e) => {
            tracing::error!("{}", e);
            return 1;
        }
    };

    if extract_all(backend, &assets).await {
        0
    } else {
        1
    }
}
