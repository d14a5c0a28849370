use std::{path::PathBuf, process::ExitCode};

use ::tracing::{error, info, info_span};
use clap::Parser;
use config::{DaemonConfig, DEFAULT_CONFIG_PATH, DEFAULT_ROOT_DIR};
use service::Service;

mod config;
mod pb_helpers;
mod service;
mod snapshots_api;
mod tracing;
use tracing::setup_tracing;

const DEFAULT_ADDRESS: &str = "/run/containerd-zvol.sock";

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (built ",
    env!("VERGEN_BUILD_TIMESTAMP"),
    ", rustc ",
    env!("VERGEN_RUSTC_SEMVER"),
    ")"
);

#[derive(Parser)]
#[command(name = "containerd-zvol-snapshotter", version, long_version = LONG_VERSION, about, long_about = None)]
struct Cli {
    #[arg(long, default_value = DEFAULT_ADDRESS, help = "Address for the snapshotter's gRPC server")]
    address: PathBuf,

    #[arg(long, default_value = DEFAULT_CONFIG_PATH, help = "Path to the configuration file")]
    config: PathBuf,

    #[arg(
        long,
        default_value = "info",
        help = "Logging level [trace, debug, info, warn, error], RUST_LOG takes precedence"
    )]
    log_level: String,

    #[arg(long, default_value = DEFAULT_ROOT_DIR, help = "Path to the root directory for this snapshotter")]
    root: PathBuf,

    #[arg(long, help = "ZFS dataset used for snapshots")]
    dataset: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut config = match DaemonConfig::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load config file {}: {:#}", cli.config.display(), err);
            return ExitCode::FAILURE;
        }
    };
    config.apply_overrides(&cli.root, cli.dataset.as_deref());

    let tracing_provider = match setup_tracing(&config, &cli.log_level) {
        Ok(provider) => provider,
        Err(err) => {
            eprintln!("error setting up tracing: {:?}", err);
            return ExitCode::FAILURE;
        }
    };

    let root_span = info_span!("containerd-zvol-snapshotter", dataset = %config.dataset);
    let _guard = root_span.enter();
    info!(version = env!("CARGO_PKG_VERSION"), "starting containerd-zvol-snapshotter");

    let meter_provider = match metrics::init_provider(
        config.telemetry.enable_metrics,
        config.telemetry.endpoint.as_ref(),
        config.telemetry.metrics_interval,
        env!("CARGO_PKG_VERSION"),
    ) {
        Ok(provider) => provider,
        Err(err) => {
            error!("error setting up metrics: {:?}", err);
            return ExitCode::FAILURE;
        }
    };

    let mut code = ExitCode::SUCCESS;
    match Service::new(config, cli.address).await {
        Ok(service) => {
            if let Err(err) = service.start().await {
                error!("failed to serve snapshotter: {:?}", err);
                code = ExitCode::FAILURE;
            }
        }
        Err(err) => {
            error!("error creating service: {:?}", err);
            code = ExitCode::FAILURE;
        }
    }

    if let Some(meter_provider) = meter_provider {
        if let Err(err) = meter_provider.shutdown() {
            error!("error shutting down meter provider: {:?}", err);
        }
    }
    // export traces before shutdown
    if let Some(tracer_provider) = tracing_provider {
        if let Err(err) = tracer_provider.force_flush() {
            error!("error flushing traces: {:?}", err);
        }
        if let Err(err) = tracer_provider.shutdown() {
            error!("error shutting down tracer provider: {:?}", err);
        }
    }
    info!("exiting");
    code
}
