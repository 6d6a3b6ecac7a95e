// Backup Manifest
// Per-connection JSON index of the backups taken for that connection

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{BackupEntry, BackupError};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupManifest {
    pub version: u32,
    #[serde(default)]
    pub entries: Vec<BackupEntry>,
}

impl Default for BackupManifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            entries: Vec::new(),
        }
    }
}

impl BackupManifest {
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE)
    }

    /// Read the manifest at `path`. A missing or unreadable file yields an
    /// empty manifest.
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "backup manifest unreadable");
                return Self::default();
            }
        };

        match serde_json::from_str(&content) {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "backup manifest corrupt, starting empty");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), BackupError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| BackupError::Manifest(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn find(&self, backup_id: &str) -> Option<&BackupEntry> {
        self.entries.iter().find(|e| e.id == backup_id)
    }

    pub fn remove(&mut self, backup_id: &str) -> Option<BackupEntry> {
        let index = self.entries.iter().position(|e| e.id == backup_id)?;
        Some(self.entries.remove(index))
    }
}
