//! Remount of the live target onto the new deployment
//!
//! After `arkdep deploy` the installer still has the top level of the btrfs
//! volume mounted at the root mountpoint. Later installer steps must act on
//! the deployed system instead, so the mounts are swapped:
//!
//! | # | Operation |
//! |---|-----------|
//! | 1 | `umount <root>/boot` |
//! | 2 | `umount <root>/home` (only if mounted) |
//! | 3 | `umount <root>` |
//! | 4 | `mount -o subvol=/arkdep/deployments/<id>/rootfs <root dev> <root>` |
//! | 5 | `mount <home dev> <root>/home` or the shared home subvolume of the root device |
//! | 6 | `mount <boot dev> <root>/boot` |
//!
//! The order is load-bearing: nested mounts go before their parent and come
//! back after it. All preconditions (devices, exactly one deployment) are
//! checked before the first operation. A failing operation stops the
//! sequence; nothing that already ran is undone.

use crate::command::{Cmd, CommandRunner};
use crate::error::{DeployError, Result};
use crate::partitions::PartitionResolver;
use crate::types::Deployment;
use std::fmt;
use std::path::{Path, PathBuf};

/// Subvolume mounted as `/home` when there is no home partition
pub const SHARED_HOME_SUBVOLUME: &str = "/arkdep/shared/home";

/// Answers whether something is mounted at a path
pub trait MountState {
    fn is_mounted(&self, path: &Path) -> bool;
}

/// `MountState` backed by a mountinfo file (`/proc/self/mountinfo`)
#[derive(Debug, Clone)]
pub struct ProcMounts {
    mountinfo: PathBuf,
}

impl Default for ProcMounts {
    fn default() -> Self {
        Self {
            mountinfo: PathBuf::from("/proc/self/mountinfo"),
        }
    }
}

impl ProcMounts {
    pub fn from_file(mountinfo: impl Into<PathBuf>) -> Self {
        Self {
            mountinfo: mountinfo.into(),
        }
    }
}

impl MountState for ProcMounts {
    fn is_mounted(&self, path: &Path) -> bool {
        match std::fs::read_to_string(&self.mountinfo) {
            Ok(content) => {
                let target = normalize(path);
                mount_points(&content).any(|mp| normalize(Path::new(&mp)) == target)
            }
            Err(e) => {
                log::warn!("Cannot read {}: {}", self.mountinfo.display(), e);
                false
            }
        }
    }
}

/// Mountpoints listed in mountinfo content (field 5, octal escapes decoded)
fn mount_points(content: &str) -> impl Iterator<Item = String> + '_ {
    content.lines().filter_map(|line| {
        let (pre, _) = line.split_once(" - ")?;
        pre.split_whitespace().nth(4).map(unescape_mount_path)
    })
}

fn unescape_mount_path(raw: &str) -> String {
    raw.replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

fn normalize(path: &Path) -> String {
    let s = path.to_string_lossy();
    if s.len() > 1 {
        s.trim_end_matches('/').to_string()
    } else {
        s.to_string()
    }
}

/// One step of the remount sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountOp {
    Unmount {
        target: PathBuf,
    },
    Mount {
        device: String,
        target: PathBuf,
        /// Passed as `-o <options>`
        options: Option<String>,
    },
}

impl MountOp {
    pub fn to_cmd(&self) -> Cmd {
        match self {
            Self::Unmount { target } => Cmd::new("umount").arg(target.display().to_string()),
            Self::Mount {
                device,
                target,
                options,
            } => {
                let mut cmd = Cmd::new("mount");
                if let Some(options) = options {
                    cmd = cmd.args(["-o", options.as_str()]);
                }
                cmd.arg(device.as_str()).arg(target.display().to_string())
            }
        }
    }
}

impl fmt::Display for MountOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unmount { target } => write!(f, "Unmount {}", target.display()),
            Self::Mount {
                device,
                target,
                options: Some(options),
            } => write!(f, "Mount {} at {} ({})", device, target.display(), options),
            Self::Mount {
                device,
                target,
                options: None,
            } => write!(f, "Mount {} at {}", device, target.display()),
        }
    }
}

/// The deployment to switch to and the operations that do it
#[derive(Debug, Clone)]
pub struct RemountPlan {
    pub deployment: Deployment,
    pub ops: Vec<MountOp>,
    /// Ambiguities found while planning, logged before execution
    pub warnings: Vec<String>,
}

impl RemountPlan {
    /// Human readable listing for logs and dry runs
    pub fn summary(&self) -> String {
        let mut lines = vec![format!("Remount onto deployment {}", self.deployment.id)];
        for (i, op) in self.ops.iter().enumerate() {
            lines.push(format!("  {}. {}", i + 1, op));
        }
        lines.join("\n")
    }
}

/// Outcome of scanning `<root>/arkdep/deployments`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentScan {
    pub deployment: Deployment,
    /// Other candidates, in order, that were passed over
    pub ignored: Vec<String>,
}

impl DeploymentScan {
    /// Warning to report when the choice was ambiguous
    pub fn warning(&self) -> Option<String> {
        if self.ignored.is_empty() {
            return None;
        }
        Some(format!(
            "Found {} deployments, using {} and ignoring {}",
            self.ignored.len() + 1,
            self.deployment.id,
            self.ignored.join(", ")
        ))
    }
}

/// Find the deployment under `<root>/arkdep/deployments`.
///
/// Directories are taken in lexicographic order; with more than one
/// candidate the first wins and the rest are listed in `ignored`. None at
/// all, or a missing deployments directory, is a hard failure.
pub fn find_deployment(root: &Path) -> Result<DeploymentScan> {
    let dir = root.join("arkdep").join("deployments");
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(DeployError::NoDeployment(dir));
        }
        Err(e) => return Err(DeployError::io(&dir, e)),
    };

    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| DeployError::io(&dir, e))?;
        if entry.path().is_dir() {
            ids.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    ids.sort();

    if ids.is_empty() {
        return Err(DeployError::NoDeployment(dir));
    }
    let first = ids.remove(0);
    Ok(DeploymentScan {
        deployment: Deployment::new(first),
        ignored: ids,
    })
}

/// Swaps the live root onto the deployed subvolume.
pub struct RemountOrchestrator<'a> {
    root: &'a Path,
    resolver: &'a PartitionResolver,
    runner: &'a dyn CommandRunner,
    mounts: &'a dyn MountState,
}

impl<'a> RemountOrchestrator<'a> {
    pub fn new(
        root: &'a Path,
        resolver: &'a PartitionResolver,
        runner: &'a dyn CommandRunner,
        mounts: &'a dyn MountState,
    ) -> Self {
        Self {
            root,
            resolver,
            runner,
            mounts,
        }
    }

    /// Check preconditions and build the operation list. Touches no mounts.
    pub fn plan(&self) -> Result<RemountPlan> {
        let root_device = self
            .resolver
            .device("/")
            .ok_or_else(|| DeployError::MissingDevice("/".to_string()))?;
        let boot_device = self
            .resolver
            .device("/boot")
            .ok_or_else(|| DeployError::MissingDevice("/boot".to_string()))?;
        let home_device = self.resolver.device("/home");

        let scan = find_deployment(self.root)?;
        let warnings = scan.warning().into_iter().collect();
        let deployment = scan.deployment;

        let boot_dir = self.root.join("boot");
        let home_dir = self.root.join("home");

        let mut ops = vec![MountOp::Unmount {
            target: boot_dir.clone(),
        }];
        if self.mounts.is_mounted(&home_dir) {
            ops.push(MountOp::Unmount {
                target: home_dir.clone(),
            });
        }
        ops.push(MountOp::Unmount {
            target: self.root.to_path_buf(),
        });
        ops.push(MountOp::Mount {
            device: root_device.clone(),
            target: self.root.to_path_buf(),
            options: Some(format!("subvol={}", deployment.rootfs_subvolume.display())),
        });
        ops.push(match home_device {
            Some(device) => MountOp::Mount {
                device,
                target: home_dir,
                options: None,
            },
            None => MountOp::Mount {
                device: root_device,
                target: home_dir,
                options: Some(format!("subvol={}", SHARED_HOME_SUBVOLUME)),
            },
        });
        ops.push(MountOp::Mount {
            device: boot_device,
            target: boot_dir,
            options: None,
        });

        Ok(RemountPlan {
            deployment,
            ops,
            warnings,
        })
    }

    /// Plan and run the sequence, stopping at the first failing operation.
    pub fn execute(&self) -> Result<Deployment> {
        let plan = self.plan()?;
        for warning in &plan.warnings {
            log::warn!("{}", warning);
        }
        log::info!("{}", plan.summary());

        for op in &plan.ops {
            self.runner
                .run(&op.to_cmd())
                .map_err(|e| DeployError::mount(op.to_string(), e))?;
        }

        log::info!("Target now runs from deployment {}", plan.deployment.id);
        Ok(plan.deployment)
    }
}
