//! Catalog entries and the manifest describing a task binary.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{CoreError, CreatorKind, GridTaskState, TaskRole};

/// How a master is implemented, as declared by its manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Implementation {
    #[default]
    Free,
    Light,
}

/// Sidecar manifest (`*.task.json`) shipped next to a task binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskManifest {
    /// Catalog id used by management calls.
    pub id: String,

    /// Human readable name, also the name jobs carry.
    pub name: String,

    /// Key into the plugin registry.
    pub type_name: String,

    /// Binary file, relative to the manifest directory.
    pub binary: String,

    #[serde(default)]
    pub implementation: Implementation,

    /// The binary links native code that cannot share the manager process.
    #[serde(default)]
    pub native_dependencies: bool,

    /// Target architecture, defaults to the manager's own.
    #[serde(default)]
    pub arch: Option<String>,
}

impl TaskManifest {
    /// Parse a manifest and check its mandatory fields.
    pub fn parse(json: &str) -> Result<Self, CoreError> {
        let manifest: Self = serde_json::from_str(json)?;
        for (field, value) in [
            ("id", &manifest.id),
            ("name", &manifest.name),
            ("type_name", &manifest.type_name),
            ("binary", &manifest.binary),
        ] {
            if value.trim().is_empty() {
                return Err(CoreError::InvalidManifest(format!("empty field '{field}'")));
            }
        }
        Ok(manifest)
    }

    /// Role of the task, given the repository subdirectory it was found in.
    pub fn role(&self, in_slave_dir: bool) -> TaskRole {
        match (in_slave_dir, self.implementation) {
            (true, _) => TaskRole::Slave,
            (false, Implementation::Free) => TaskRole::Master,
            (false, Implementation::Light) => TaskRole::MasterLight,
        }
    }

    /// Platform target string recorded in the catalog.
    pub fn platform_target(&self) -> String {
        let arch = self.arch.as_deref().unwrap_or(std::env::consts::ARCH);
        if self.native_dependencies {
            format!("{arch}+native")
        } else {
            arch.to_string()
        }
    }

    /// Creator needed to host this task.
    ///
    /// Native dependencies or a foreign architecture force a separate
    /// hosting process; everything else uses `default`.
    pub fn creator_kind(&self, default: CreatorKind) -> CreatorKind {
        let foreign = self
            .arch
            .as_deref()
            .is_some_and(|arch| arch != std::env::consts::ARCH);
        if self.native_dependencies || foreign {
            CreatorKind::RemoteProcess
        } else {
            default
        }
    }
}

/// A task type known to the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridTask {
    pub id: String,
    pub name: String,
    pub type_name: String,
    pub repository: String,
    pub role: TaskRole,
    pub binary: PathBuf,
    pub platform_target: String,
    pub creator: CreatorKind,
    pub state: GridTaskState,
    /// SHA-256 of the binary, when the file exists.
    pub checksum: Option<String>,
}

impl GridTask {
    /// Build a catalog entry from a manifest.
    pub fn from_manifest(
        repository: impl Into<String>,
        manifest: &TaskManifest,
        binary: PathBuf,
        in_slave_dir: bool,
        default_creator: CreatorKind,
    ) -> Self {
        Self {
            id: manifest.id.clone(),
            name: manifest.name.clone(),
            type_name: manifest.type_name.clone(),
            repository: repository.into(),
            role: manifest.role(in_slave_dir),
            binary,
            platform_target: manifest.platform_target(),
            creator: manifest.creator_kind(default_creator),
            state: GridTaskState::WaitingForExecution,
            checksum: None,
        }
    }

    /// Builder method to attach the binary checksum.
    pub fn with_checksum(mut self, checksum: Option<String>) -> Self {
        self.checksum = checksum;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(extra: &str) -> TaskManifest {
        let json = format!(
            r#"{{"id":"m1","name":"Primes","type_name":"primes::master","binary":"primes.bin"{extra}}}"#
        );
        TaskManifest::parse(&json).unwrap()
    }

    #[test]
    fn test_role_follows_directory_and_implementation() {
        assert_eq!(manifest("").role(false), TaskRole::Master);
        assert_eq!(
            manifest(r#","implementation":"light""#).role(false),
            TaskRole::MasterLight
        );
        assert_eq!(manifest("").role(true), TaskRole::Slave);
    }

    #[test]
    fn test_native_dependencies_force_remote_process() {
        let native = manifest(r#","native_dependencies":true"#);
        assert_eq!(
            native.creator_kind(CreatorKind::InProcess),
            CreatorKind::RemoteProcess
        );
        assert!(native.platform_target().ends_with("+native"));
        assert_eq!(
            manifest("").creator_kind(CreatorKind::Isolated),
            CreatorKind::Isolated
        );
    }

    #[test]
    fn test_foreign_arch_forces_remote_process() {
        let foreign = manifest(r#","arch":"not-a-real-arch""#);
        assert_eq!(
            foreign.creator_kind(CreatorKind::InProcess),
            CreatorKind::RemoteProcess
        );
    }

    #[test]
    fn test_parse_rejects_empty_fields() {
        let json = r#"{"id":"","name":"n","type_name":"t","binary":"b"}"#;
        assert!(matches!(
            TaskManifest::parse(json),
            Err(CoreError::InvalidManifest(_))
        ));
    }
}
