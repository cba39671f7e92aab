//! flashkit - flash OS images to SD cards and USB drives
//!
//! Command line front end over the flashkit library.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use flashkit::config::{self, AppConfig};
use flashkit::{log_error, log_info, logging};

use commands::cache::CacheAction;
use commands::install::InstallArgs;

const MODULE: &str = "main";

#[derive(Parser)]
#[command(name = "flashkit", version, about = "Download, verify and flash OS images")]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging and echo log lines to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Treat `<id>.img` files in this directory as removable devices
    #[arg(long, global = true)]
    mock_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List candidate target devices
    Devices,
    /// List catalog images
    Images {
        /// Only images supporting this device model
        #[arg(long)]
        model: Option<String>,
        /// Only images of this OS family
        #[arg(long)]
        family: Option<String>,
    },
    /// Write an image to a device and apply first-boot settings
    Install(InstallArgs),
    /// Inspect or clean the image cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Print the previous session log
    Logs,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    logging::init();
    logging::set_stderr_echo(cli.verbose);

    let config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    logging::set_log_level(cli.verbose || config.debug_logging());

    log_info!(MODULE, "=== {} {} starting ===", config::app::NAME, config::app::VERSION);
    log_info!(
        MODULE,
        "OS: {} {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );

    match run(cli, &config).await {
        Ok(code) => code,
        Err(e) => {
            log_error!(MODULE, "{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, config: &AppConfig) -> Result<ExitCode, String> {
    match cli.command {
        Command::Devices => {
            let enumerator = commands::open_enumerator(config, cli.mock_dir.as_deref())?;
            commands::devices::list(enumerator.as_ref())?;
        }
        Command::Images { model, family } => {
            commands::images::list(config, model.as_deref(), family.as_deref()).await?;
        }
        Command::Install(args) => {
            let enumerator = commands::open_enumerator(config, cli.mock_dir.as_deref())?;
            return commands::install::run(config, enumerator, args).await;
        }
        Command::Cache { action } => {
            let cache = commands::open_cache(config)?;
            commands::cache::run(&cache, action)?;
        }
        Command::Logs => commands::logs::print()?,
    }
    Ok(ExitCode::SUCCESS)
}
