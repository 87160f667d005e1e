//! arkdeploy library
//!
//! Finalizes an installation onto an arkdep-managed target: resolves partition
//! identity, writes the boot and mount configuration, runs `arkdep` and moves
//! the live mounts onto the new deployment.

pub mod arkdep_config;
pub mod cli;
pub mod command;
pub mod config;
pub mod error;
pub mod partitions;
pub mod pipeline;
pub mod process_guard;
pub mod remount;
pub mod templates;
pub mod types;

// Re-export main types for convenience
pub use command::{Cmd, CommandRunner, DryRunRunner, LogSink, ProgressSink, SystemRunner};
pub use config::{InstallContext, JobConfig};
pub use error::{DeployError, Result};
pub use partitions::PartitionResolver;
pub use pipeline::{DeploymentPipeline, PipelineStep, StepFailure};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use remount::{
    DeploymentScan, MountOp, MountState, ProcMounts, RemountOrchestrator, RemountPlan,
};
pub use templates::{TemplateName, TemplateSet};
pub use types::{Deployment, Partition, ResolvedIdentity, UuidKind};
