//! `flashkit install`
//!
//! Submits one job and renders its progress on stderr until it ends.
//! Ctrl-C requests cancellation, which is refused during the final device
//! flush.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{ArgGroup, Args};
use tokio::sync::broadcast::error::RecvError;

use flashkit::config::AppConfig;
use flashkit::devices::DeviceEnumerator;
use flashkit::images::Catalog;
use flashkit::orchestrator::{
    ImageSource, InstallOrchestrator, JobOptions, JobOutcome, JobRequest, ProgressEvent, Stage,
};
use flashkit::settings::InstallSettings;
use flashkit::{log_debug, log_info, log_warn, JobError};

const MODULE: &str = "commands::install";

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("source").required(true).args(["image", "path"])))]
pub struct InstallArgs {
    /// Target device id, as listed by `flashkit devices`
    #[arg(long)]
    pub device: String,

    /// Catalog image id
    #[arg(long)]
    pub image: Option<String>,

    /// Local image file, raw or compressed
    #[arg(long)]
    pub path: Option<PathBuf>,

    /// First-boot settings (JSON)
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Permit writing to fixed or system disks
    #[arg(long)]
    pub allow_non_removable: bool,

    /// Read the device back and compare after writing
    #[arg(long)]
    pub verify: bool,
}

pub async fn run(
    config: &AppConfig,
    enumerator: Arc<dyn DeviceEnumerator>,
    args: InstallArgs,
) -> Result<ExitCode, String> {
    let settings = match &args.settings {
        Some(path) => InstallSettings::load(path).map_err(|e| e.to_string())?,
        None => InstallSettings::default(),
    };

    let image = match (args.image, args.path) {
        (Some(id), _) => ImageSource::Catalog(id),
        (None, Some(path)) => ImageSource::Custom(path),
        (None, None) => return Err("Either --image or --path is required".to_string()),
    };

    let catalog = match image {
        ImageSource::Catalog(_) => super::load_catalog(config).await?,
        ImageSource::Custom(_) => Catalog::default(),
    };
    let cache = super::open_cache(config)?;
    let orchestrator =
        InstallOrchestrator::new(cache, enumerator, catalog, config).map_err(|e| e.to_string())?;

    let request = JobRequest::new(args.device, image)
        .with_settings(settings)
        .with_options(JobOptions {
            allow_non_removable: args.allow_non_removable,
            verify_after_write: args.verify,
            ..Default::default()
        });

    let handle = orchestrator.submit(request).map_err(describe)?;
    log_info!(MODULE, "Started job {}", handle.id());

    let mut events = handle.subscribe();
    let mut line = ProgressLine::default();
    let snapshot = handle.snapshot();
    line.draw(snapshot.stage, snapshot.percent, &snapshot.message);

    let wait = handle.wait();
    tokio::pin!(wait);
    let outcome = loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Ok(event) => {
                    line.render(&event);
                    if let Some(outcome) = event.outcome {
                        break outcome;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    log_debug!(MODULE, "Progress display skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break (&mut wait).await,
            },
            outcome = &mut wait => break outcome,
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    log_warn!(MODULE, "Ctrl-C handler failed: {}", e);
                    break (&mut wait).await;
                }
                line.newline();
                if handle.cancel() {
                    eprintln!("Cancelling...");
                } else {
                    eprintln!("Finishing device flush, cannot cancel now");
                }
            }
        }
    };
    line.newline();

    report(&outcome);
    Ok(exit_code(&outcome))
}

fn describe(error: JobError) -> String {
    let hint = error.remediation().hint();
    if hint.is_empty() {
        error.to_string()
    } else {
        format!("{} ({})", error, hint)
    }
}

fn report(outcome: &JobOutcome) {
    match outcome {
        JobOutcome::Succeeded => println!("{}", outcome.summary()),
        JobOutcome::SucceededWithWarnings { failed } => {
            println!("{}", outcome.summary());
            for failure in failed {
                println!("  {}: {}", failure.domain, failure.reason);
            }
        }
        JobOutcome::Failed { .. } | JobOutcome::Cancelled { .. } => {
            eprintln!("{}", outcome.summary())
        }
    }
}

fn exit_code(outcome: &JobOutcome) -> ExitCode {
    match outcome {
        JobOutcome::Succeeded | JobOutcome::SucceededWithWarnings { .. } => ExitCode::SUCCESS,
        // Conventional status for SIGINT
        JobOutcome::Cancelled { .. } => ExitCode::from(130),
        JobOutcome::Failed { .. } => ExitCode::FAILURE,
    }
}

/// Single status line, rewritten in place until the stage changes
#[derive(Default)]
struct ProgressLine {
    stage: Option<Stage>,
    open: bool,
}

impl ProgressLine {
    fn render(&mut self, event: &ProgressEvent) {
        self.draw(event.stage, event.percent, &event.message);
    }

    fn draw(&mut self, stage: Stage, percent: u8, message: &str) {
        if self.stage.is_some() && self.stage != Some(stage) {
            self.newline();
        }
        self.stage = Some(stage);

        let mut stderr = std::io::stderr().lock();
        let _ = write!(stderr, "\r[{:<13}] {:>3}% {:<50}", stage.as_str(), percent, message);
        let _ = stderr.flush();
        self.open = true;
    }

    fn newline(&mut self) {
        if self.open {
            eprintln!();
            self.open = false;
        }
    }
}
