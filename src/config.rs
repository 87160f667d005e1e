//! Installer inputs and job configuration.
//!
//! The host installer's global storage is modeled as an explicit
//! `InstallContext` read once at startup; the module's own settings live in
//! `JobConfig`. Both are JSON documents with camelCase keys.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::command::CommandRunner;
use crate::partitions::{PartitionResolver, DEFAULT_MAPPER_DIR};
use crate::templates::TemplateSet;
use crate::types::Partition;

/// Values the host installer hands over for this run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallContext {
    /// Where the target root is currently mounted (e.g. `/tmp/calamares-root-xyz`)
    pub root_mount_point: PathBuf,
    #[serde(default)]
    pub partitions: Vec<Partition>,
}

impl InstallContext {
    /// Load the global storage dump from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read global storage from {:?}", path.as_ref()))?;

        let context: Self =
            serde_json::from_str(&content).context("Failed to parse global storage JSON")?;
        context.validate()?;

        Ok(context)
    }

    pub fn validate(&self) -> Result<()> {
        if self.root_mount_point.as_os_str().is_empty() {
            anyhow::bail!("rootMountPoint must be specified");
        }
        if !self.root_mount_point.is_absolute() {
            anyhow::bail!(
                "rootMountPoint must be an absolute path, got {:?}",
                self.root_mount_point
            );
        }
        if !self.partitions.iter().any(|p| p.mount_point == "/") {
            anyhow::bail!("partition list has no entry for /");
        }
        Ok(())
    }
}

fn default_deploy_command() -> String {
    "arkdep".to_string()
}

fn default_bootloader_efi() -> PathBuf {
    PathBuf::from("/usr/lib/systemd/boot/efi/systemd-bootx64.efi")
}

fn default_mapper_dir() -> PathBuf {
    PathBuf::from(DEFAULT_MAPPER_DIR)
}

fn default_progress_interval() -> u64 {
    1
}

/// Settings of the deployment job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    /// Replaces `repo_url` in arkdep's config
    #[serde(default)]
    pub repo_url: Option<String>,
    /// Replaces `repo_default_image` in arkdep's config
    #[serde(default)]
    pub repo_image: Option<String>,
    /// Program invoked for `init` and `deploy`
    #[serde(default = "default_deploy_command")]
    pub deploy_command: String,
    /// systemd-boot EFI binary copied onto the ESP
    #[serde(default = "default_bootloader_efi")]
    pub bootloader_efi: PathBuf,
    #[serde(default = "default_mapper_dir")]
    pub mapper_dir: PathBuf,
    /// Seconds between progress messages while deploying
    #[serde(default = "default_progress_interval")]
    pub progress_interval_secs: u64,
    /// Template replacements keyed by template name (e.g. `loader_conf`)
    #[serde(default)]
    pub templates: BTreeMap<String, String>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            repo_url: None,
            repo_image: None,
            deploy_command: default_deploy_command(),
            bootloader_efi: default_bootloader_efi(),
            mapper_dir: default_mapper_dir(),
            progress_interval_secs: default_progress_interval(),
            templates: BTreeMap::new(),
        }
    }
}

impl JobConfig {
    /// Load the job configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read job configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse job configuration JSON")?;

        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize job configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write job configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.deploy_command.trim().is_empty() {
            anyhow::bail!("deployCommand must not be empty");
        }
        if self.progress_interval_secs == 0 {
            anyhow::bail!("progressIntervalSecs must be at least 1");
        }
        for (key, value) in [("repoUrl", &self.repo_url), ("repoImage", &self.repo_image)] {
            if let Some(value) = value {
                if value.contains(['\'', '"', '\n']) {
                    anyhow::bail!("{} must not contain quotes or newlines", key);
                }
            }
        }
        self.template_set()?;
        Ok(())
    }

    /// Built-in templates with this job's replacements applied
    pub fn template_set(&self) -> Result<TemplateSet> {
        TemplateSet::from_overrides(&self.templates).context("Invalid template configuration")
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs.max(1))
    }

    /// Resolver over `partitions` that looks for mapper nodes in `mapper_dir`
    pub fn resolver(
        &self,
        partitions: Vec<Partition>,
        runner: Arc<dyn CommandRunner>,
    ) -> PartitionResolver {
        PartitionResolver::new(partitions, runner).with_mapper_dir(&self.mapper_dir)
    }
}
