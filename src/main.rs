//! arkdeploy - main entry point

use anyhow::Context;
use arkdeploy::cli::{Cli, Commands};
use arkdeploy::templates::render_named;
use arkdeploy::{
    process_guard, CommandRunner, DeploymentPipeline, DryRunRunner, InstallContext, JobConfig,
    PartitionResolver, ProcessGuard, SystemRunner,
};
use log::{debug, error, info};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

/// Initialize the logger with appropriate settings
fn init_logger() {
    use env_logger::Builder;
    use std::io::Write;

    Builder::from_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}:{}] {}",
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(log::LevelFilter::Info)
        .parse_default_env() // Allows RUST_LOG env var to override
        .init();
}

fn load_job_config(path: Option<&Path>) -> anyhow::Result<JobConfig> {
    let config = match path {
        Some(path) => {
            info!("Loading job configuration from {:?}", path);
            JobConfig::load_from_file(path)?
        }
        None => {
            debug!("No job configuration given, using defaults");
            JobConfig::default()
        }
    };
    config.validate().context("Invalid job configuration")?;
    Ok(config)
}

fn load_resolver(storage: &Path, config: &JobConfig) -> anyhow::Result<PartitionResolver> {
    let context = InstallContext::load_from_file(storage)?;
    Ok(config.resolver(context.partitions, Arc::new(SystemRunner)))
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Run { storage, config } => {
            let context = InstallContext::load_from_file(&storage)?;
            let config = load_job_config(config.as_deref())?;

            let runner: Arc<dyn CommandRunner> = if cli.dry_run {
                info!("Dry-run mode enabled, external commands are only logged");
                Arc::new(DryRunRunner::new())
            } else {
                Arc::new(SystemRunner)
            };

            let pipeline = DeploymentPipeline::new(context, config, runner)?;
            match pipeline.run() {
                Ok(()) => {
                    info!("Deployment finished");
                    println!("✓ Deployment finished on {}", pipeline.root().display());
                    Ok(ExitCode::SUCCESS)
                }
                Err(failure) => {
                    eprintln!("{}", failure.title());
                    eprintln!("{}", failure.message());
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Resolve {
            storage,
            config,
            mount_point,
        } => {
            let config = load_job_config(config.as_deref())?;
            let resolver = load_resolver(&storage, &config)?;
            match resolver.identity(&mount_point) {
                Some(identity) => {
                    println!("device:          {}", identity.device);
                    println!("encrypted:       {}", identity.is_encrypted);
                    println!("filesystem:      {}", identity.filesystem);
                    println!("filesystem uuid: {}", identity.filesystem_uuid);
                    println!("container uuid:  {}", identity.container_uuid);
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    eprintln!("✗ No partition is mounted at {}", mount_point);
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Render {
            storage,
            config,
            template,
        } => {
            let config = load_job_config(config.as_deref())?;
            let resolver = load_resolver(&storage, &config)?;
            let text = render_named(&resolver, &config.template_set()?, template)
                .with_context(|| format!("Failed to render {}", template))?;
            print!("{}", text);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate { config } => {
            info!("Validating configuration file: {:?}", config);
            load_job_config(Some(&config))?;
            println!("✓ Configuration file is valid: {:?}", config);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    init_logger();
    info!("arkdeploy starting up");

    // Children are killed if we receive SIGINT/SIGTERM/SIGHUP
    if let Err(e) = process_guard::init_signal_handlers() {
        log::warn!("Failed to initialize signal handlers: {}", e);
    }
    let _guard = ProcessGuard::new();

    let cli = Cli::parse_args();
    debug!("CLI arguments parsed");

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("✗ {:#}", e);
            ExitCode::FAILURE
        }
    }
}
