//! Agent config file
//!
//! `indihub.json` persists the single piece of host state worth keeping:
//! the token issued by the relay on first registration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    pub token: String,
}

impl AgentConfig {
    /// Read the config file.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Write the config file, readable by the owner only.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let data = serde_json::to_vec(self)?;
        std::fs::write(&path, data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("indihub.json");

        let config = AgentConfig {
            token: "secret-token".to_string(),
        };
        config.write(&path).unwrap();

        let loaded = AgentConfig::read(&path).unwrap();
        assert_eq!(loaded.token, "secret-token");
    }

    #[cfg(unix)]
    #[test]
    fn test_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("indihub.json");
        AgentConfig::default().write(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(AgentConfig::read("/nonexistent/indihub.json").is_err());
    }
}
