//! Partition identity resolution
//!
//! Answers device and UUID questions for a mountpoint from the partition list
//! handed over by the host installer, with awareness of LUKS containers:
//!
//! | Query | Plain partition | Encrypted partition |
//! |-------|-----------------|---------------------|
//! | `device` | raw device | `/dev/mapper/<name>` |
//! | `uuid(Partition)` | partition UUID | container UUID (`luksUuid`) |
//! | `uuid(Filesystem)` | partition UUID | probed from the mapper device |
//!
//! Nothing here is cached: the mapper device may only appear once the volume
//! is unlocked, so every query looks at the current state of the system.
//! Unknown mountpoints and missing mapper nodes are soft misses that yield
//! empty values, never errors.

use crate::command::{Cmd, CommandRunner};
use crate::types::{Partition, ResolvedIdentity, UuidKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Directory holding the unlocked device nodes on a live system
pub const DEFAULT_MAPPER_DIR: &str = "/dev/mapper";

/// Filesystem assumed when a partition record does not name one
pub const DEFAULT_FILESYSTEM: &str = "btrfs";

/// Resolves partition identity for mountpoints.
pub struct PartitionResolver {
    partitions: Vec<Partition>,
    runner: Arc<dyn CommandRunner>,
    mapper_dir: PathBuf,
}

impl PartitionResolver {
    pub fn new(partitions: Vec<Partition>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            partitions,
            runner,
            mapper_dir: PathBuf::from(DEFAULT_MAPPER_DIR),
        }
    }

    /// Look for mapper nodes somewhere other than `/dev/mapper`
    pub fn with_mapper_dir(mut self, mapper_dir: impl Into<PathBuf>) -> Self {
        self.mapper_dir = mapper_dir.into();
        self
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// First partition whose mountpoint matches exactly
    pub fn find(&self, mount_point: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.mount_point == mount_point)
    }

    fn mapper_path(&self, partition: &Partition) -> Option<PathBuf> {
        partition
            .luks_mapper_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .map(|name| self.mapper_dir.join(name))
    }

    /// Device to operate on for the live filesystem: the mapper device for
    /// encrypted partitions, the raw device otherwise.
    pub fn device(&self, mount_point: &str) -> Option<String> {
        let partition = self.find(mount_point)?;
        match self.mapper_path(partition) {
            Some(mapper) => Some(mapper.display().to_string()),
            None if partition.device.is_empty() => None,
            None => Some(partition.device.clone()),
        }
    }

    pub fn is_encrypted(&self, mount_point: &str) -> bool {
        self.find(mount_point).is_some_and(Partition::is_encrypted)
    }

    /// Filesystem type of the mountpoint, `btrfs` when unspecified
    pub fn filesystem(&self, mount_point: &str) -> String {
        match self.find(mount_point) {
            Some(p) if !p.fs.is_empty() => p.fs.clone(),
            _ => DEFAULT_FILESYSTEM.to_string(),
        }
    }

    /// UUID for the mountpoint. Empty string on any soft miss.
    pub fn uuid(&self, mount_point: &str, kind: UuidKind) -> String {
        let Some(partition) = self.find(mount_point) else {
            return String::new();
        };

        let Some(mapper) = self.mapper_path(partition) else {
            return partition.uuid.clone();
        };

        match kind {
            UuidKind::Partition => partition.luks_uuid.clone().unwrap_or_default(),
            UuidKind::Filesystem => self.probe_filesystem_uuid(&mapper),
        }
    }

    /// Ask `blkid` for the UUID of an unlocked mapper device.
    ///
    /// Probing may run before the volume is unlocked, so a missing node or a
    /// failed probe is logged and reported as an empty UUID.
    fn probe_filesystem_uuid(&self, mapper: &Path) -> String {
        if !mapper.exists() {
            log::debug!("Mapper device {} not present yet", mapper.display());
            return String::new();
        }

        let cmd = Cmd::new("blkid")
            .args(["-s", "UUID", "-o", "value"])
            .arg(mapper.display().to_string());
        match self.runner.output(&cmd) {
            Ok(uuid) => uuid,
            Err(e) => {
                log::warn!("Could not probe UUID of {}: {}", mapper.display(), e);
                String::new()
            }
        }
    }

    /// Full identity of a mountpoint, `None` if no partition is mounted there
    pub fn identity(&self, mount_point: &str) -> Option<ResolvedIdentity> {
        let partition = self.find(mount_point)?;
        Some(ResolvedIdentity {
            device: self.device(mount_point).unwrap_or_default(),
            is_encrypted: partition.is_encrypted(),
            filesystem_uuid: self.uuid(mount_point, UuidKind::Filesystem),
            container_uuid: if partition.is_encrypted() {
                partition.luks_uuid.clone().unwrap_or_default()
            } else {
                String::new()
            },
            filesystem: self.filesystem(mount_point),
        })
    }
}
