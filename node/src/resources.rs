//! Task resource and directory management
//!
//! The directory manager owns the node's on-disk layout: one directory per
//! task holding its input resources and a temporary scratch area. The
//! resources manager builds on it to produce the resource headers sent with
//! resource requests and the per-computation temporary directories workers
//! write into.

use anyhow::Result;
use shared::task::{ResourceFileEntry, ResourceHeader};
use shared::utils::calculate_file_checksum;
use shared::GridError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const RESOURCES_SUBDIR: &str = "resources";
const TEMPORARY_SUBDIR: &str = "tmp";

/// Owns the filesystem layout `<root>/<task_id>/{resources,tmp}`.
#[derive(Debug, Clone)]
pub struct DirManager {
    root: PathBuf,
}

impl DirManager {
    /// Creates the manager and its root directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            GridError::Resources(format!(
                "Failed to create node root directory {}: {}",
                root.display(),
                e
            ))
        })?;
        Ok(Self { root })
    }

    /// Resolves and creates the resource directory of a task.
    pub fn get_task_resource_dir(&self, task_id: &str) -> Result<PathBuf> {
        self.ensure_subdir(task_id, RESOURCES_SUBDIR)
    }

    /// Resolves and creates the temporary directory of a task.
    pub fn get_task_temporary_dir(&self, task_id: &str) -> Result<PathBuf> {
        self.ensure_subdir(task_id, TEMPORARY_SUBDIR)
    }

    /// Removes everything under a task's temporary directory.
    #[allow(dead_code)]
    pub fn clear_temporary(&self, task_id: &str) -> Result<()> {
        let dir = self.task_dir(task_id)?.join(TEMPORARY_SUBDIR);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| {
                GridError::Resources(format!(
                    "Failed to clear temporary dir {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    fn ensure_subdir(&self, task_id: &str, subdir: &str) -> Result<PathBuf> {
        let dir = self.task_dir(task_id)?.join(subdir);
        fs::create_dir_all(&dir).map_err(|e| {
            GridError::Resources(format!(
                "Failed to create task directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(dir)
    }

    fn task_dir(&self, task_id: &str) -> Result<PathBuf> {
        // Task ids come from the network; a separator or parent reference
        // must never escape the root.
        if task_id.is_empty()
            || task_id.contains("..")
            || task_id.contains('/')
            || task_id.contains('\\')
        {
            return Err(GridError::Resources(format!(
                "Invalid task id for directory layout: {:?}",
                task_id
            ))
            .into());
        }
        Ok(self.root.join(task_id))
    }
}

/// Resource bookkeeping for tasks assigned to this node.
#[derive(Debug, Clone)]
pub struct ResourcesManager {
    dir_manager: DirManager,
}

impl ResourcesManager {
    pub fn new(dir_manager: DirManager) -> Self {
        Self { dir_manager }
    }

    /// Resource directory of a task; the payload's read-only mount.
    pub fn get_resource_dir(&self, task_id: &str) -> Result<PathBuf> {
        self.dir_manager.get_task_resource_dir(task_id)
    }

    /// Temporary directory of a task; parent of per-computation scratch.
    pub fn get_temporary_dir(&self, task_id: &str) -> Result<PathBuf> {
        self.dir_manager.get_task_temporary_dir(task_id)
    }

    /// Creates a fresh uniquely named scratch directory for one computation.
    pub fn unique_temporary_dir(&self, task_id: &str) -> Result<PathBuf> {
        let base = self.get_temporary_dir(task_id)?;
        let dir = base.join(format!("{:016x}", rand::random::<u64>()));
        fs::create_dir_all(&dir).map_err(|e| {
            GridError::Resources(format!(
                "Failed to create scratch directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(dir)
    }

    /// Builds the header describing resources already present for a task,
    /// so the transfer layer only ships a delta. A task with no resources on
    /// disk yields an empty listing.
    pub fn get_resource_header(&self, task_id: &str) -> ResourceHeader {
        let mut header = ResourceHeader {
            task_id: task_id.to_string(),
            files: Vec::new(),
        };

        let dir = match self.dir_manager.get_task_resource_dir(task_id) {
            Ok(dir) => dir,
            Err(e) => {
                debug!("No resource dir for task {}: {}", task_id, e);
                return header;
            }
        };

        if let Err(e) = collect_files(&dir, &dir, &mut header.files) {
            debug!("Failed to walk resources of task {}: {}", task_id, e);
        }
        header.files.sort_by(|a, b| a.path.cmp(&b.path));
        header
    }
}

fn collect_files(base: &Path, dir: &Path, out: &mut Vec<ResourceFileEntry>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(base, &path, out)?;
        } else {
            let relative = path
                .strip_prefix(base)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            out.push(ResourceFileEntry {
                path: relative,
                checksum: calculate_file_checksum(&path)?,
            });
        }
    }
    Ok(())
}
