//! Catalog of known repositories and task types.
//!
//! A repository lives in `<root>/<name>` with two subdirectories, `Master/`
//! and `Slave/`. Every task binary there ships a `*.task.json` manifest;
//! discovery turns each manifest into a [`GridTask`] entry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use gridrun_core::{CreatorKind, GridTask, GridTaskState, TaskManifest};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{CatalogError, GridError};

const MASTER_DIR: &str = "Master";
const SLAVE_DIR: &str = "Slave";
const MANIFEST_SUFFIX: &str = ".task.json";

/// A registered repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryRecord {
    pub name: String,
    pub directory: PathBuf,
    pub marked_for_removal: bool,
}

#[derive(Default)]
struct Inner {
    tasks: BTreeMap<String, GridTask>,
    repositories: BTreeMap<String, RepositoryRecord>,
}

/// Catalog shared by the manager. Leaf lock: nothing else is locked while
/// holding it.
#[derive(Default)]
pub struct Catalog {
    inner: RwLock<Inner>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register (or replace) a repository and its tasks.
    pub fn register_repository(&self, name: &str, directory: &Path, tasks: Vec<GridTask>) {
        let mut inner = self.write();
        inner.tasks.retain(|_, t| t.repository != name);
        for task in tasks {
            if let Some(previous) = inner.tasks.get(&task.id) {
                warn!(
                    id = %task.id,
                    repository = %name,
                    previous = %previous.repository,
                    "Task id already registered, replacing"
                );
            }
            inner.tasks.insert(task.id.clone(), task);
        }
        inner.repositories.insert(
            name.to_string(),
            RepositoryRecord {
                name: name.to_string(),
                directory: directory.to_path_buf(),
                marked_for_removal: false,
            },
        );
    }

    pub fn find(&self, id: &str) -> Option<GridTask> {
        self.read().tasks.get(id).cloned()
    }

    pub fn repository(&self, name: &str) -> Option<RepositoryRecord> {
        self.read().repositories.get(name).cloned()
    }

    pub fn repositories(&self) -> Vec<RepositoryRecord> {
        self.read().repositories.values().cloned().collect()
    }

    /// Every task, or only those of `repository`.
    pub fn list(&self, repository: Option<&str>) -> Vec<GridTask> {
        self.read()
            .tasks
            .values()
            .filter(|t| repository.map_or(true, |r| t.repository == r))
            .cloned()
            .collect()
    }

    /// Validate a (master, slave) pair for launch and mark the master running.
    pub fn prepare_execution(&self, master_id: &str, slave_id: &str) -> Result<(GridTask, GridTask), GridError> {
        let mut inner = self.write();
        let master = inner
            .tasks
            .get(master_id)
            .cloned()
            .ok_or_else(|| GridError::MasterNotFound(master_id.to_string()))?;
        let slave = inner
            .tasks
            .get(slave_id)
            .cloned()
            .ok_or_else(|| GridError::SlaveNotFound(slave_id.to_string()))?;

        if !master.role.is_master() {
            return Err(GridError::WrongRole {
                id: master_id.to_string(),
                expected: "master",
            });
        }
        if slave.role.is_master() {
            return Err(GridError::WrongRole {
                id: slave_id.to_string(),
                expected: "slave",
            });
        }
        let marked = inner
            .repositories
            .get(&master.repository)
            .map(|r| r.marked_for_removal)
            .ok_or_else(|| GridError::RepositoryNotFound(master.repository.clone()))?;
        if marked {
            return Err(GridError::RepositoryMarkedForRemoval(master.repository.clone()));
        }
        if master.state == GridTaskState::CannotBeLoaded {
            return Err(GridError::CannotBeLoaded(master_id.to_string()));
        }

        if let Some(entry) = inner.tasks.get_mut(master_id) {
            entry.state = GridTaskState::Running;
        }
        Ok((master, slave))
    }

    pub fn set_state(&self, id: &str, state: GridTaskState) {
        if let Some(task) = self.write().tasks.get_mut(id) {
            debug!(id, from = ?task.state, to = ?state, "Catalog state change");
            task.state = state;
        }
    }

    /// Return a master to `WaitingForExecution` unless its state is sticky.
    pub fn finish_execution(&self, id: &str) {
        if let Some(task) = self.write().tasks.get_mut(id) {
            if !task.state.is_sticky() {
                task.state = GridTaskState::WaitingForExecution;
            }
        }
    }

    /// Flag a repository for removal. Running masters, including masters of
    /// launches still in flight, become `RunningBeforeRemoval`, the rest
    /// `WaitingForRemoval`.
    pub fn mark_for_removal(&self, name: &str, running_masters: &[String]) -> Result<(), GridError> {
        let mut inner = self.write();
        let record = inner
            .repositories
            .get_mut(name)
            .ok_or_else(|| GridError::RepositoryNotFound(name.to_string()))?;
        record.marked_for_removal = true;

        for task in inner.tasks.values_mut().filter(|t| t.repository == name) {
            task.state = if running_masters.contains(&task.id) || task.state == GridTaskState::Running {
                GridTaskState::RunningBeforeRemoval
            } else {
                GridTaskState::WaitingForRemoval
            };
        }
        Ok(())
    }

    pub fn is_marked(&self, name: &str) -> bool {
        self.read()
            .repositories
            .get(name)
            .is_some_and(|r| r.marked_for_removal)
    }

    /// Drop a repository and its tasks. Returns the removed record.
    pub fn purge(&self, name: &str) -> Option<RepositoryRecord> {
        let mut inner = self.write();
        inner.tasks.retain(|_, t| t.repository != name);
        inner.repositories.remove(name)
    }
}

/// Scan `directory` for task manifests.
pub async fn discover(
    name: &str,
    directory: &Path,
    default_creator: CreatorKind,
) -> Result<Vec<GridTask>, CatalogError> {
    if !tokio::fs::try_exists(directory).await.unwrap_or(false) {
        return Err(CatalogError::DirectoryNotFound(directory.display().to_string()));
    }

    let mut tasks = Vec::new();
    for (subdir, in_slave_dir) in [(MASTER_DIR, false), (SLAVE_DIR, true)] {
        let dir = directory.join(subdir);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            debug!(repository = name, dir = %dir.display(), "No task directory");
            continue;
        }

        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut manifests = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_manifest = path
                .file_name()
                .and_then(|f| f.to_str())
                .is_some_and(|f| f.ends_with(MANIFEST_SUFFIX));
            if is_manifest {
                manifests.push(path);
            }
        }
        manifests.sort();

        for path in manifests {
            let text = tokio::fs::read_to_string(&path).await?;
            let manifest = match TaskManifest::parse(&text) {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping malformed task manifest");
                    continue;
                }
            };
            let binary = dir.join(&manifest.binary);
            let checksum = checksum(&binary).await;
            tasks.push(
                GridTask::from_manifest(name, &manifest, binary, in_slave_dir, default_creator)
                    .with_checksum(checksum),
            );
        }
    }

    if tasks.is_empty() {
        return Err(CatalogError::Empty(name.to_string()));
    }
    info!(repository = name, tasks = tasks.len(), "Repository discovered");
    Ok(tasks)
}

/// Hex SHA-256 of a file, `None` when it cannot be read.
async fn checksum(path: &Path) -> Option<String> {
    let bytes = tokio::fs::read(path).await.ok()?;
    Some(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
pub(crate) mod tests {
    use gridrun_core::TaskRole;

    use super::*;

    /// Lay out a repository with one master and one slave.
    pub(crate) fn write_repository(root: &Path, name: &str, master_extra: &str) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(dir.join(MASTER_DIR)).unwrap();
        std::fs::create_dir_all(dir.join(SLAVE_DIR)).unwrap();
        std::fs::write(
            dir.join(MASTER_DIR).join("primes.task.json"),
            format!(
                r#"{{"id":"{name}.master","name":"PrimeFinder","type_name":"primes::master","binary":"primes.bin"{master_extra}}}"#
            ),
        )
        .unwrap();
        std::fs::write(dir.join(MASTER_DIR).join("primes.bin"), b"master-bytes").unwrap();
        std::fs::write(
            dir.join(SLAVE_DIR).join("primes.task.json"),
            format!(
                r#"{{"id":"{name}.slave","name":"PrimeFinderSlave","type_name":"primes::slave","binary":"primes-slave.bin"}}"#
            ),
        )
        .unwrap();
        dir
    }

    #[tokio::test]
    async fn test_discover_reads_manifests() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_repository(root.path(), "Primes", "");
        std::fs::write(dir.join(MASTER_DIR).join("broken.task.json"), "{not json").unwrap();

        let tasks = discover("Primes", &dir, CreatorKind::Isolated).await.unwrap();
        assert_eq!(tasks.len(), 2);

        let master = tasks.iter().find(|t| t.id == "Primes.master").unwrap();
        assert_eq!(master.role, TaskRole::Master);
        assert_eq!(master.creator, CreatorKind::Isolated);
        assert_eq!(
            master.checksum.as_deref(),
            Some(hex::encode(Sha256::digest(b"master-bytes")).as_str())
        );

        let slave = tasks.iter().find(|t| t.id == "Primes.slave").unwrap();
        assert_eq!(slave.role, TaskRole::Slave);
        assert!(slave.checksum.is_none());
    }

    #[tokio::test]
    async fn test_discover_native_master_is_remote() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_repository(root.path(), "Native", r#","native_dependencies":true"#);
        let tasks = discover("Native", &dir, CreatorKind::InProcess).await.unwrap();
        let master = tasks.iter().find(|t| t.id == "Native.master").unwrap();
        assert_eq!(master.creator, CreatorKind::RemoteProcess);
    }

    #[tokio::test]
    async fn test_discover_errors() {
        let root = tempfile::tempdir().unwrap();
        let missing = discover("Nope", &root.path().join("Nope"), CreatorKind::Isolated).await;
        assert!(matches!(missing, Err(CatalogError::DirectoryNotFound(_))));

        std::fs::create_dir_all(root.path().join("Empty")).unwrap();
        let empty = discover("Empty", &root.path().join("Empty"), CreatorKind::Isolated).await;
        assert!(matches!(empty, Err(CatalogError::Empty(_))));
    }

    async fn catalog_with_primes() -> (Catalog, tempfile::TempDir) {
        let root = tempfile::tempdir().unwrap();
        let dir = write_repository(root.path(), "Primes", "");
        let tasks = discover("Primes", &dir, CreatorKind::Isolated).await.unwrap();
        let catalog = Catalog::new();
        catalog.register_repository("Primes", &dir, tasks);
        (catalog, root)
    }

    #[tokio::test]
    async fn test_prepare_execution_validates_roles() {
        let (catalog, _root) = catalog_with_primes().await;

        assert!(matches!(
            catalog.prepare_execution("Primes.slave", "Primes.slave"),
            Err(GridError::WrongRole { expected: "master", .. })
        ));
        assert!(matches!(
            catalog.prepare_execution("Primes.master", "Primes.master"),
            Err(GridError::WrongRole { expected: "slave", .. })
        ));
        assert!(matches!(
            catalog.prepare_execution("missing", "Primes.slave"),
            Err(GridError::MasterNotFound(_))
        ));

        let (master, slave) = catalog.prepare_execution("Primes.master", "Primes.slave").unwrap();
        assert_eq!(master.type_name, "primes::master");
        assert_eq!(slave.type_name, "primes::slave");
        assert_eq!(
            catalog.find("Primes.master").unwrap().state,
            GridTaskState::Running
        );
    }

    #[tokio::test]
    async fn test_cannot_be_loaded_blocks_launch() {
        let (catalog, _root) = catalog_with_primes().await;
        catalog.set_state("Primes.master", GridTaskState::CannotBeLoaded);
        assert!(matches!(
            catalog.prepare_execution("Primes.master", "Primes.slave"),
            Err(GridError::CannotBeLoaded(_))
        ));

        catalog.finish_execution("Primes.master");
        assert_eq!(
            catalog.find("Primes.master").unwrap().state,
            GridTaskState::CannotBeLoaded
        );
    }

    #[tokio::test]
    async fn test_mark_for_removal_flags_entries() {
        let (catalog, _root) = catalog_with_primes().await;
        catalog
            .mark_for_removal("Primes", &["Primes.master".to_string()])
            .unwrap();

        assert!(catalog.is_marked("Primes"));
        assert_eq!(
            catalog.find("Primes.master").unwrap().state,
            GridTaskState::RunningBeforeRemoval
        );
        assert_eq!(
            catalog.find("Primes.slave").unwrap().state,
            GridTaskState::WaitingForRemoval
        );
        assert!(matches!(
            catalog.prepare_execution("Primes.master", "Primes.slave"),
            Err(GridError::RepositoryMarkedForRemoval(_))
        ));

        assert!(catalog.purge("Primes").is_some());
        assert!(catalog.list(None).is_empty());
    }
}
