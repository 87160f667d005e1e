//! Strongly typed records shared across the deployment modules
//!
//! Partition records arrive from the host installer as loosely typed JSON.
//! Encryption metadata is modeled as explicit `Option`s so that "not
//! encrypted" is a typed `None` rather than a missing key.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One partition record as supplied by the host installer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Partition {
    /// Raw block device (e.g. `/dev/sda2`)
    #[serde(default)]
    pub device: String,
    /// Mountpoint inside the target system (e.g. `/`, `/boot`, `/home`)
    #[serde(default)]
    pub mount_point: String,
    /// Filesystem type as reported by the partitioner
    #[serde(default)]
    pub fs: String,
    /// Partition (or LUKS container) UUID
    #[serde(default)]
    pub uuid: String,
    /// Name of the unlocked device under `/dev/mapper`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub luks_mapper_name: Option<String>,
    /// UUID of the LUKS container itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub luks_uuid: Option<String>,
}

impl Partition {
    /// True when this record carries a usable mapper name
    pub fn is_encrypted(&self) -> bool {
        self.luks_mapper_name
            .as_deref()
            .is_some_and(|name| !name.is_empty())
    }
}

/// Which identifier a UUID query asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UuidKind {
    /// The identity used by boot-time unlock directives: the LUKS container
    /// UUID for encrypted partitions, the plain partition UUID otherwise.
    Partition,
    /// The UUID of the (unlocked) filesystem
    Filesystem,
}

/// Identity of a mountpoint, derived on demand from the partition list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub device: String,
    pub is_encrypted: bool,
    pub filesystem_uuid: String,
    pub container_uuid: String,
    pub filesystem: String,
}

/// A deployment discovered under `<root>/arkdep/deployments`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub id: String,
    /// Subvolume path of the deployment's root filesystem, as passed to `mount -o subvol=`
    pub rootfs_subvolume: PathBuf,
}

impl Deployment {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let rootfs_subvolume = PathBuf::from(format!("/arkdep/deployments/{id}/rootfs"));
        Self {
            id,
            rootfs_subvolume,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_deserializes_camel_case() {
        let json = r#"{
            "device": "/dev/nvme0n1p2",
            "mountPoint": "/",
            "fs": "btrfs",
            "uuid": "1111",
            "luksMapperName": "luks-1111",
            "luksUuid": "2222"
        }"#;
        let partition: Partition = serde_json::from_str(json).unwrap();
        assert_eq!(partition.mount_point, "/");
        assert_eq!(partition.luks_mapper_name.as_deref(), Some("luks-1111"));
        assert_eq!(partition.luks_uuid.as_deref(), Some("2222"));
        assert!(partition.is_encrypted());
    }

    #[test]
    fn test_partition_missing_luks_fields_is_plain() {
        let json = r#"{"device": "/dev/sda1", "mountPoint": "/boot", "fs": "fat32", "uuid": "ABCD"}"#;
        let partition: Partition = serde_json::from_str(json).unwrap();
        assert!(partition.luks_mapper_name.is_none());
        assert!(!partition.is_encrypted());
    }

    #[test]
    fn test_empty_mapper_name_is_not_encrypted() {
        let partition = Partition {
            luks_mapper_name: Some(String::new()),
            ..Default::default()
        };
        assert!(!partition.is_encrypted());
    }

    #[test]
    fn test_deployment_subvolume_path() {
        let deployment = Deployment::new("summit-240101");
        assert_eq!(
            deployment.rootfs_subvolume,
            PathBuf::from("/arkdep/deployments/summit-240101/rootfs")
        );
    }
}
