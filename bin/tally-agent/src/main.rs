//! Tally agent.
//!
//! Samples runtime statistics for the current process on a fixed interval, and periodically reports them to a Tally
//! collector over HTTP.

#![deny(warnings)]
#![deny(missing_docs)]
use std::sync::Arc;

use clap::Parser as _;
use tally_app::prelude::*;
use tally_components::{
    samplers::{PollCountSampler, RuntimeSampler},
    transports::HttpTransport,
};
use tally_core::{
    pipeline::{Pipeline, Termination},
    task::spawn_traced,
};
use tally_error::{ErrorContext as _, GenericError};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;
use self::config::{AgentConfiguration, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = AgentConfiguration::load(&cli)
        .unwrap_or_else(|e| fatal_and_exit(format!("failed to load configuration: {}", e)));

    if let Err(e) = initialize_logging(&config.logging_configuration()) {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
    }

    match run(config).await {
        Ok(()) => info!("Tally agent stopped."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

async fn run(config: AgentConfiguration) -> Result<(), GenericError> {
    let transport = HttpTransport::with_timeout(config.server_address(), config.api_mode(), config.request_timeout())
        .error_context("Failed to create collector transport.")?;

    let pipeline = Pipeline::new(config.pipeline_configuration(), Arc::new(transport))?
        .with_sampler(RuntimeSampler::new())
        .with_sampler(PollCountSampler::default());

    let shutdown = CancellationToken::new();
    spawn_traced(cancel_on_signal(shutdown.clone()));

    let mut running = pipeline.spawn(&shutdown)?;
    info!(server_address = config.server_address(), "Tally agent started.");

    let outcome = running.wait().await;
    match &outcome {
        Ok(Termination::Cancelled) => info!("Received shutdown signal. Draining pipeline..."),
        Ok(Termination::Completed) => warn!("Pipeline stopped unexpectedly. Draining pipeline..."),
        Err(e) => error!(error = %e, "Pipeline failed. Draining pipeline..."),
    }

    shutdown.cancel();
    let grace_period = config.shutdown_grace_period();
    if timeout(grace_period, running.drain()).await.is_err() {
        warn!(?grace_period, "Pipeline did not drain within the shutdown grace period.");
    }

    outcome.map(|_| ()).map_err(Into::into)
}

#[cfg(unix)]
async fn cancel_on_signal(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut terminate, mut quit) = match (signal(SignalKind::terminate()), signal(SignalKind::quit())) {
        (Ok(terminate), Ok(quit)) => (terminate, quit),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "Failed to register signal handlers.");
            return;
        }
    };

    let received = tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => "SIGINT",
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGINT.");
                return;
            }
        },
        _ = terminate.recv() => "SIGTERM",
        _ = quit.recv() => "SIGQUIT",
    };

    info!(signal = received, "Received signal, shutting down.");
    shutdown.cancel();
}

#[cfg(not(unix))]
async fn cancel_on_signal(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!(signal = "ctrl-c", "Received signal, shutting down.");
            shutdown.cancel();
        }
        Err(e) => error!(error = %e, "Failed to listen for ctrl-c."),
    }
}
