/// Setup descriptor: `setup.json` in the package root.
///
/// Tells the driver how to spawn the setup child. The JSON key names are an
/// external contract and stay in their original casing.
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SetupError};

/// File name of the descriptor inside an extracted package.
pub const DESCRIPTOR_FILE: &str = "setup.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupDescriptor {
    /// Setup executable, relative to the extracted package root.
    #[serde(rename = "Command")]
    pub command: String,

    /// Extra arguments for the setup child, whitespace-separated.
    #[serde(rename = "Arguments", default)]
    pub arguments: Option<String>,

    /// The calling application must exit so its files can be overwritten.
    #[serde(rename = "ExitRequired", default)]
    pub exit_required: bool,

    #[serde(rename = "RequireAdministratorPrivileges", default)]
    pub require_admin: bool,

    #[serde(rename = "HideWindow", default)]
    pub hide_window: bool,
}

impl SetupDescriptor {
    /// Load `setup.json` from an extracted package directory.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let path = dir.join(DESCRIPTOR_FILE);
        let data = std::fs::read(&path)?;
        serde_json::from_slice(&data).map_err(|e| {
            SetupError::Serialization(format!("{}: {e}", path.display()))
        })
    }

    /// Whitespace-tokenized `Arguments`.
    pub fn argument_list(&self) -> Vec<String> {
        self.arguments
            .as_deref()
            .unwrap_or("")
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_full_descriptor() {
        let json = r#"{
            "Command": "setup",
            "Arguments": "--silent --lang en",
            "ExitRequired": true,
            "RequireAdministratorPrivileges": false,
            "HideWindow": true
        }"#;
        let descriptor: SetupDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(descriptor.command, "setup");
        assert_eq!(descriptor.argument_list(), vec!["--silent", "--lang", "en"]);
        assert!(descriptor.exit_required);
        assert!(!descriptor.require_admin);
        assert!(descriptor.hide_window);
    }

    #[test]
    fn test_defaults() {
        let descriptor: SetupDescriptor = serde_json::from_str(r#"{"Command": "run.sh"}"#).unwrap();
        assert_eq!(descriptor.command, "run.sh");
        assert!(descriptor.arguments.is_none());
        assert!(descriptor.argument_list().is_empty());
        assert!(!descriptor.exit_required);
        assert!(!descriptor.require_admin);
        assert!(!descriptor.hide_window);
    }

    #[test]
    fn test_missing_command_rejected() {
        assert!(serde_json::from_str::<SetupDescriptor>(r#"{"ExitRequired": true}"#).is_err());
    }

    #[test]
    fn test_load_from_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(DESCRIPTOR_FILE),
            r#"{"Command": "setup", "ExitRequired": true}"#,
        )
        .unwrap();
        let descriptor = SetupDescriptor::load_from(dir.path()).unwrap();
        assert_eq!(descriptor.command, "setup");
        assert!(descriptor.exit_required);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            SetupDescriptor::load_from(dir.path()),
            Err(SetupError::Io(_))
        ));
    }
}
