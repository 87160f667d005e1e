use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::templates::TemplateName;

/// arkdeploy - finalize an arkdep-based installation
#[derive(Parser)]
#[command(name = "arkdeploy")]
#[command(about = "Deploy an arkdep image onto a freshly partitioned target")]
#[command(version)]
pub struct Cli {
    /// Dry-run mode: log every external command instead of running it.
    ///
    /// Files below the target root are still written so the generated
    /// configuration can be inspected.
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full deployment pipeline
    Run {
        /// Global storage dump (rootMountPoint and partitions)
        #[arg(short, long)]
        storage: PathBuf,
        /// Job configuration
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Show the resolved identity of a mountpoint
    Resolve {
        #[arg(short, long)]
        storage: PathBuf,
        /// Job configuration (for mapperDir)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Mountpoint inside the target (e.g. / or /home)
        mount_point: String,
    },
    /// Print a rendered template without writing anything
    Render {
        #[arg(short, long)]
        storage: PathBuf,
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Template name (systemd_boot, luks_systemd_boot, fstab, home_fstab, group_file, loader_conf)
        template: TemplateName,
    },
    /// Validate a job configuration file
    Validate {
        /// Path to configuration file to validate
        config: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["arkdeploy"]).is_err());
    }

    #[test]
    fn test_cli_run_with_dry_run() {
        let cli = Cli::try_parse_from([
            "arkdeploy",
            "run",
            "--storage",
            "/tmp/gs.json",
            "--dry-run",
        ])
        .unwrap();
        assert!(cli.dry_run);
        match cli.command {
            Commands::Run { storage, config } => {
                assert_eq!(storage, PathBuf::from("/tmp/gs.json"));
                assert!(config.is_none());
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_cli_render_parses_template_name() {
        let cli =
            Cli::try_parse_from(["arkdeploy", "render", "-s", "/tmp/gs.json", "home_fstab"])
                .unwrap();
        match cli.command {
            Commands::Render { template, .. } => assert_eq!(template, TemplateName::HomeFstab),
            _ => panic!("Expected Render command"),
        }
    }

    #[test]
    fn test_cli_render_rejects_unknown_template() {
        assert!(
            Cli::try_parse_from(["arkdeploy", "render", "-s", "/tmp/gs.json", "grub"]).is_err()
        );
    }

    #[test]
    fn test_cli_resolve_command() {
        let cli = Cli::try_parse_from(["arkdeploy", "resolve", "--storage", "gs.json", "/home"])
            .unwrap();
        match cli.command {
            Commands::Resolve { mount_point, .. } => assert_eq!(mount_point, "/home"),
            _ => panic!("Expected Resolve command"),
        }
    }

    #[test]
    fn test_cli_resolve_with_config() {
        let cli = Cli::try_parse_from([
            "arkdeploy",
            "resolve",
            "-s",
            "gs.json",
            "--config",
            "/etc/arkdeploy.json",
            "/",
        ])
        .unwrap();
        match cli.command {
            Commands::Resolve {
                config,
                mount_point,
                ..
            } => {
                assert_eq!(config, Some(PathBuf::from("/etc/arkdeploy.json")));
                assert_eq!(mount_point, "/");
            }
            _ => panic!("Expected Resolve command"),
        }
    }

    #[test]
    fn test_cli_validate_command() {
        let cli = Cli::try_parse_from(["arkdeploy", "validate", "/etc/arkdeploy.json"]).unwrap();
        match cli.command {
            Commands::Validate { config } => {
                assert_eq!(config, PathBuf::from("/etc/arkdeploy.json"))
            }
            _ => panic!("Expected Validate command"),
        }
    }
}
