//! velero-e2e entry point
//!
//! Runs the selected backup/restore scenarios against the cluster of the
//! current kubeconfig and exits non-zero when any of them fails.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use velero_e2e::scenario::{self, Outcome, ScenarioKind};
use velero_e2e::{E2eConfig, Error};

#[derive(Parser, Debug)]
#[command(name = "velero-e2e", version, about = "End-to-end backup/restore scenarios for Velero")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "VELERO_E2E_LOG_JSON")]
    log_json: bool,

    #[command(flatten)]
    config: E2eConfig,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run scenarios (all of them when none is given)
    Run {
        #[arg(value_enum)]
        scenarios: Vec<ScenarioKind>,
    },
    /// List the available scenarios
    List,
}

fn init_tracing(json: bool) -> Result<(), Error> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let fmt_layer = if json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let registry = tracing_subscriber::registry().with(env_filter).with(fmt_layer);

    if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let otel_layer = velero_e2e::telemetry::init_telemetry(&registry)?;
        registry.with(otel_layer).init();
        info!("OpenTelemetry tracing initialized");
    } else {
        registry.init();
    }
    Ok(())
}

async fn run(config: E2eConfig, kinds: Vec<ScenarioKind>) -> Result<bool, Error> {
    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling the running scenario");
            on_signal.cancel();
        }
    });

    let config = Arc::new(config);
    let kinds = if kinds.is_empty() {
        ScenarioKind::all().to_vec()
    } else {
        kinds
    };

    let mut failed = 0;
    let mut skipped = 0;
    for kind in &kinds {
        if cancel.is_cancelled() {
            break;
        }
        match scenario::run_kind(*kind, &client, &config, &cancel).await {
            Outcome::Passed => info!("PASS {:?}", kind),
            Outcome::Skipped(reason) => {
                skipped += 1;
                info!("SKIP {:?}: {}", kind, reason);
            }
            Outcome::Failed(e) => {
                failed += 1;
                error!("FAIL {:?}: {}", kind, e);
            }
        }
    }

    info!(
        "{} scenarios: {} failed, {} skipped",
        kinds.len(),
        failed,
        skipped
    );
    Ok(failed == 0 && !cancel.is_cancelled())
}

#[tokio::main]
async fn main() -> ExitCode {
    velero_e2e::install_crypto_provider();
    let cli = Cli::parse();
    if let Err(e) = init_tracing(cli.log_json) {
        eprintln!("failed to initialize tracing: {e}");
        return ExitCode::FAILURE;
    }

    info!("Starting velero-e2e v{}", env!("CARGO_PKG_VERSION"));

    let result = match cli.command {
        Command::List => {
            for value in ScenarioKind::all().iter().filter_map(|k| k.to_possible_value()) {
                let help = value.get_help().map(|h| h.to_string()).unwrap_or_default();
                println!("{:<26} {}", value.get_name(), help);
            }
            Ok(true)
        }
        Command::Run { scenarios } => run(cli.config, scenarios).await,
    };

    velero_e2e::telemetry::shutdown_telemetry();

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
