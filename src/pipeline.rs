//! Deployment pipeline
//!
//! Sequences the whole finalization as a fixed list of named steps:
//!
//! 1. Setup systemd-boot
//! 2. Initialize arkdep
//! 3. Update arkdep config
//! 4. Configure fstab
//! 5. Write group file
//! 6. Configure boot template
//! 7. Deploy system
//! 8. Remount system
//!
//! # Failure Policy
//!
//! The first failing step ends the run and its error is handed back as a
//! `StepFailure` naming the step. Later steps do not run and earlier steps
//! are not undone: written files stay written, changed mounts stay changed.

use crate::arkdep_config::apply_repo_overrides;
use crate::command::{Cmd, CommandRunner, LogSink, ProgressSink};
use crate::config::{InstallContext, JobConfig};
use crate::error::{DeployError, Result};
use crate::partitions::PartitionResolver;
use crate::remount::{MountState, ProcMounts, RemountOrchestrator};
use crate::templates::{render_boot_entry, render_fstab, write_file, TemplateName, TemplateSet};
use log::{error, info};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Title the host installer shows for any failed deployment
pub const ERROR_TITLE: &str = "Installation Error";

/// A named unit of work
pub struct PipelineStep<'a> {
    pub name: &'static str,
    action: Box<dyn FnOnce() -> Result<()> + 'a>,
}

impl<'a> PipelineStep<'a> {
    pub fn new(name: &'static str, action: impl FnOnce() -> Result<()> + 'a) -> Self {
        Self {
            name,
            action: Box::new(action),
        }
    }
}

/// The step that stopped the pipeline and why
#[derive(Error, Debug)]
#[error("Failed: {step}: {cause}")]
pub struct StepFailure {
    pub step: String,
    #[source]
    pub cause: DeployError,
}

impl StepFailure {
    pub fn title(&self) -> &'static str {
        ERROR_TITLE
    }

    pub fn message(&self) -> String {
        self.to_string()
    }

    /// `(title, message)` as the host installer expects it
    pub fn into_pair(self) -> (String, String) {
        (self.title().to_string(), self.message())
    }
}

/// Run `steps` in order, stopping at the first failure.
pub fn run_steps(steps: Vec<PipelineStep<'_>>) -> std::result::Result<(), StepFailure> {
    let total = steps.len();
    for (i, step) in steps.into_iter().enumerate() {
        info!("Step {}/{}: {}", i + 1, total, step.name);
        if let Err(cause) = (step.action)() {
            error!("Step '{}' failed: {}", step.name, cause);
            return Err(StepFailure {
                step: step.name.to_string(),
                cause,
            });
        }
    }
    info!("All {} steps completed", total);
    Ok(())
}

/// Finalizes an arkdep deployment on the mounted target.
pub struct DeploymentPipeline {
    root: PathBuf,
    config: JobConfig,
    templates: TemplateSet,
    resolver: PartitionResolver,
    runner: Arc<dyn CommandRunner>,
    mounts: Box<dyn MountState>,
    sink: Box<dyn ProgressSink>,
}

impl DeploymentPipeline {
    pub fn new(
        context: InstallContext,
        config: JobConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| DeployError::config(format!("{:#}", e)))?;
        let templates = TemplateSet::from_overrides(&config.templates)?;
        let resolver = config.resolver(context.partitions, Arc::clone(&runner));

        Ok(Self {
            root: context.root_mount_point,
            config,
            templates,
            resolver,
            runner,
            mounts: Box::new(ProcMounts::default()),
            sink: Box::new(LogSink),
        })
    }

    pub fn with_mount_state(mut self, mounts: Box<dyn MountState>) -> Self {
        self.mounts = mounts;
        self
    }

    pub fn with_progress_sink(mut self, sink: Box<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolver(&self) -> &PartitionResolver {
        &self.resolver
    }

    /// Environment for arkdep: operate on the target root and leave
    /// bootloader registration to us.
    pub fn deploy_env(&self) -> Vec<(String, String)> {
        vec![
            ("ARKDEP_NO_BOOTCTL".to_string(), "1".to_string()),
            ("ARKDEP_ROOT".to_string(), self.root.display().to_string()),
        ]
    }

    fn arkdep(&self, subcommand: &str) -> Cmd {
        Cmd::new(self.config.deploy_command.as_str())
            .arg(subcommand)
            .envs(&self.deploy_env())
    }

    /// The fixed, ordered step list
    pub fn steps(&self) -> Vec<PipelineStep<'_>> {
        vec![
            PipelineStep::new("Setup systemd-boot", || self.setup_systemd_boot()),
            PipelineStep::new("Initialize arkdep", || self.runner.run(&self.arkdep("init"))),
            PipelineStep::new("Update arkdep config", || self.update_arkdep_config()),
            PipelineStep::new("Configure fstab", || self.configure_fstab()),
            PipelineStep::new("Write group file", || self.write_group_file()),
            PipelineStep::new("Configure boot template", || self.configure_boot_template()),
            PipelineStep::new("Deploy system", || self.deploy_system()),
            PipelineStep::new("Remount system", || self.remount_system()),
        ]
    }

    pub fn run(&self) -> std::result::Result<(), StepFailure> {
        info!("Finalizing arkdep deployment on {}", self.root.display());
        run_steps(self.steps())
    }

    fn setup_systemd_boot(&self) -> Result<()> {
        let boot = self.root.join("boot");
        for dir in ["EFI/BOOT", "EFI/systemd", "loader/entries"] {
            let dir = boot.join(dir);
            std::fs::create_dir_all(&dir).map_err(|e| DeployError::io(&dir, e))?;
        }

        let source = &self.config.bootloader_efi;
        if !source.is_file() {
            error!("systemd-boot EFI binary missing: {}", source.display());
            return Err(DeployError::io(
                source,
                std::io::Error::from(std::io::ErrorKind::NotFound),
            ));
        }
        for dest in ["EFI/systemd/systemd-bootx64.efi", "EFI/BOOT/BOOTx64.EFI"] {
            let dest = boot.join(dest);
            std::fs::copy(source, &dest).map_err(|e| {
                error!("Error copying systemd-boot to {}: {}", dest.display(), e);
                DeployError::io(&dest, e)
            })?;
        }

        write_file(
            &boot.join("loader/loader.conf"),
            self.templates.text(TemplateName::LoaderConf),
        )
    }

    fn update_arkdep_config(&self) -> Result<()> {
        apply_repo_overrides(
            &self.root.join("arkdep/config"),
            self.config.repo_url.as_deref(),
            self.config.repo_image.as_deref(),
        )
        .map(|_| ())
    }

    fn configure_fstab(&self) -> Result<()> {
        let fstab = render_fstab(&self.resolver, &self.templates)?;
        write_file(&self.root.join("arkdep/overlay/etc/fstab"), &fstab)
    }

    fn write_group_file(&self) -> Result<()> {
        let group = self
            .templates
            .render(TemplateName::GroupFile, &BTreeMap::new());
        write_file(&self.root.join("arkdep/overlay/etc/group"), &group)
    }

    fn configure_boot_template(&self) -> Result<()> {
        let entry = render_boot_entry(&self.resolver, &self.templates)?;
        write_file(&self.root.join("arkdep/templates/systemd-boot"), &entry)
    }

    fn deploy_system(&self) -> Result<()> {
        self.runner.run_with_progress(
            &self.arkdep("deploy"),
            self.config.progress_interval(),
            self.sink.as_ref(),
        )
    }

    fn remount_system(&self) -> Result<()> {
        RemountOrchestrator::new(
            &self.root,
            &self.resolver,
            self.runner.as_ref(),
            self.mounts.as_ref(),
        )
        .execute()
        .map(|_| ())
    }
}
