//! Property-based tests for arkdeploy
//!
//! These tests verify:
//! - Partition lookup invariants (first match, soft misses)
//! - Template rendering purity and variant selection
//! - Home mount branch selection
//! - arkdep config round-trips

use std::collections::BTreeMap;
use std::sync::Arc;

use arkdeploy::arkdep_config::ArkdepConfig;
use arkdeploy::templates::{render, render_boot_entry, render_fstab};
use arkdeploy::{DryRunRunner, Partition, PartitionResolver, TemplateSet, UuidKind};
use proptest::prelude::*;

fn resolver(partitions: Vec<Partition>) -> PartitionResolver {
    PartitionResolver::new(partitions, Arc::new(DryRunRunner::new()))
}

// =============================================================================
// Partition Resolution
// =============================================================================

fn mount_point_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("/".to_string()),
        Just("/boot".to_string()),
        Just("/home".to_string()),
        Just("/var".to_string()),
    ]
}

fn partition_strategy() -> impl Strategy<Value = Partition> {
    (mount_point_strategy(), "/dev/sd[a-c][1-9]", "[A-F0-9]{8}").prop_map(
        |(mount_point, device, uuid)| Partition {
            device,
            mount_point,
            fs: "btrfs".to_string(),
            uuid,
            ..Default::default()
        },
    )
}

proptest! {
    /// `find` returns the first record whose mountpoint matches exactly
    #[test]
    fn find_returns_first_match(
        partitions in prop::collection::vec(partition_strategy(), 0..8),
        wanted in mount_point_strategy(),
    ) {
        let expected = partitions.iter().find(|p| p.mount_point == wanted).cloned();
        let r = resolver(partitions);
        prop_assert_eq!(r.find(&wanted).cloned(), expected.clone());
        if let Some(p) = expected {
            prop_assert_eq!(r.uuid(&wanted, UuidKind::Partition), p.uuid);
            prop_assert_eq!(r.device(&wanted), Some(p.device));
        }
    }

    /// An unknown mountpoint never faults and yields empty results
    #[test]
    fn unknown_mount_point_is_soft_miss(
        partitions in prop::collection::vec(partition_strategy(), 0..8),
    ) {
        let r = resolver(partitions);
        prop_assert!(r.find("/srv").is_none());
        prop_assert!(r.device("/srv").is_none());
        prop_assert!(!r.is_encrypted("/srv"));
        prop_assert_eq!(r.uuid("/srv", UuidKind::Filesystem), "");
        prop_assert_eq!(r.uuid("/srv", UuidKind::Partition), "");
        prop_assert!(r.identity("/srv").is_none());
    }
}

// =============================================================================
// Template Rendering
// =============================================================================

proptest! {
    /// Boot entry rendering is deterministic and picks the LUKS variant
    /// exactly when root is encrypted
    #[test]
    fn boot_entry_is_pure(uuid in "[a-f0-9-]{8,36}", encrypted in any::<bool>()) {
        let mut root = Partition {
            device: "/dev/nvme0n1p2".to_string(),
            mount_point: "/".to_string(),
            fs: "btrfs".to_string(),
            uuid: "RAW".to_string(),
            ..Default::default()
        };
        if encrypted {
            root.luks_mapper_name = Some("luks-root".to_string());
            root.luks_uuid = Some(uuid.clone());
        } else {
            root.uuid = uuid.clone();
        }
        let r = resolver(vec![root]);
        let set = TemplateSet::default();

        let first = render_boot_entry(&r, &set).unwrap();
        let second = render_boot_entry(&r, &set).unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.contains("root=/dev/mapper/manjaro_root"), encrypted);
        let luks_directive = format!("rd.luks.name={}=manjaro_root", uuid);
        let plain_root = format!("root=\"UUID={}\"", uuid);
        prop_assert_eq!(first.contains(&luks_directive), encrypted);
        prop_assert_eq!(first.contains(&plain_root), !encrypted);
    }

    /// The shared-subvolume fallback is used iff there is no /home record
    #[test]
    fn home_branch_follows_partition_list(
        has_home in any::<bool>(),
        home_fs in prop_oneof![Just("btrfs"), Just("ext4"), Just("xfs")],
    ) {
        let mut partitions = vec![
            Partition {
                device: "/dev/sda2".to_string(),
                mount_point: "/".to_string(),
                fs: "btrfs".to_string(),
                uuid: "AAAA".to_string(),
                ..Default::default()
            },
            Partition {
                device: "/dev/sda1".to_string(),
                mount_point: "/boot".to_string(),
                fs: "fat32".to_string(),
                uuid: "BBBB".to_string(),
                ..Default::default()
            },
        ];
        if has_home {
            partitions.push(Partition {
                device: "/dev/sda3".to_string(),
                mount_point: "/home".to_string(),
                fs: home_fs.to_string(),
                uuid: "HHHH".to_string(),
                ..Default::default()
            });
        }

        let fstab = render_fstab(&resolver(partitions), &TemplateSet::default()).unwrap();
        prop_assert_eq!(fstab.contains("subvol=arkdep/shared/home"), !has_home);
        prop_assert_eq!(fstab.contains("UUID=\"HHHH\"\t/home"), has_home);
        if has_home {
            let home_type = format!("\t/home\t\t\t{}\t", home_fs);
            prop_assert!(fstab.contains(&home_type));
        }
    }

    /// Text without placeholders passes through unchanged
    #[test]
    fn render_without_fields_is_identity(text in "[^{}]{0,200}") {
        prop_assert_eq!(render(&text, &BTreeMap::new()), text);
    }
}

// =============================================================================
// arkdep Config
// =============================================================================

proptest! {
    /// Parsing and printing an untouched config reproduces it exactly
    #[test]
    fn arkdep_config_round_trips(content in "[a-z_= '\"#\n]{0,200}") {
        prop_assert_eq!(ArkdepConfig::parse(&content).to_string(), content);
    }

    /// Setting a key changes only what `get` reports for that key
    #[test]
    fn arkdep_config_set_is_local(value in "[a-z0-9:/.]{1,40}") {
        let original = "repo_url='https://a'\nrepo_default_image='b'\nother=1\n";
        let mut config = ArkdepConfig::parse(original);
        prop_assert!(config.set("repo_default_image", &value));
        prop_assert_eq!(config.get("repo_default_image"), Some(value.as_str()));
        prop_assert_eq!(config.get("repo_url"), Some("https://a"));
        prop_assert!(config.to_string().ends_with("\nother=1\n"));
    }
}
