//! Local persistence of generated key-pair private material.
//!
//! The provider hands out private key material exactly once, in the create
//! response. It is written immediately with owner-read-only permissions and
//! never rewritten afterwards.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::{ReconcileError, Result};
use crate::plan::Attributes;

/// File mode for persisted private keys.
pub const KEY_FILE_MODE: u32 = 0o400;

/// Key-pair settings taken from a spec's attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPairTarget {
    pub key_name: String,
    pub path: PathBuf,
    /// Fail when the provider key exists but the local file does not.
    pub require_local_material: bool,
}

impl KeyPairTarget {
    pub fn from_attributes(node: &str, attrs: &Attributes) -> Result<Self> {
        let field = |attribute: &str| {
            attrs
                .get_str(attribute)
                .map(str::to_string)
                .ok_or_else(|| ReconcileError::InvalidAttribute {
                    node: node.to_string(),
                    attribute: attribute.to_string(),
                    reason: "expected a string".to_string(),
                })
        };
        Ok(Self {
            key_name: field("key_name")?,
            path: PathBuf::from(field("key_path")?),
            require_local_material: attrs.get_bool("require_local_material").unwrap_or(true),
        })
    }

    /// Called when the provider already has the key. Never writes.
    pub async fn check_existing(&self) -> Result<()> {
        if fs::try_exists(&self.path).await.unwrap_or(false) {
            info!(
                "Key pair {} exists, private key present at {}",
                self.key_name,
                self.path.display()
            );
            return Ok(());
        }

        if self.require_local_material {
            return Err(ReconcileError::KeyMaterialUnavailable {
                key_name: self.key_name.clone(),
                path: self.path.clone(),
            });
        }

        warn!(
            "Key pair {} exists at the provider but {} is missing; private key cannot be downloaded again",
            self.key_name,
            self.path.display()
        );
        Ok(())
    }

    /// Called right after the provider created the key.
    pub async fn persist(&self, material: Option<&str>) -> Result<()> {
        let material = match material {
            Some(m) if !m.is_empty() => m,
            _ => {
                return Err(ReconcileError::KeyMaterialUnavailable {
                    key_name: self.key_name.clone(),
                    path: self.path.clone(),
                })
            }
        };

        write_private_key(&self.path, material)
            .await
            .map_err(|e| ReconcileError::KeyPersistence {
                path: self.path.clone(),
                message: e.to_string(),
            })?;

        info!(
            "Key pair {} created, private key saved to {}",
            self.key_name,
            self.path.display()
        );
        Ok(())
    }
}

async fn write_private_key(path: &Path, material: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }

    // A stale file from an earlier key is read-only; replace it.
    if fs::try_exists(path).await.unwrap_or(false) {
        fs::remove_file(path).await?;
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(KEY_FILE_MODE);

    let mut file = options.open(path).await?;
    file.write_all(material.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}
