//! Service Bus source entry point.
//!
//! This binary is the composition root. Responsibilities:
//!
//! 1. **Load configuration** from the environment ([`config::AppConfig`]).
//! 2. **Wire observability**: JSON logs on stdout and, optionally, an
//!    OpenTelemetry OTLP span exporter ([`telemetry`]).
//! 3. **Validate before listening**: the entity resource ID, the message
//!    processor name, the sink address and the broker credentials are all
//!    checked before the first receive. Any failure exits with status 1.
//! 4. **Construct infrastructure** (`ServiceBusReceiver`, `HttpEventSender`)
//!    and inject it into the `Listener`.
//! 5. **Run until SIGINT/SIGTERM**, then let in-flight messages finish.

mod config;
mod telemetry;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use listener::{broker_http_client, Listener, ServiceBusReceiver};
use pipeline::{build_processor, LoggingObserver, MessageHandler};
use sink::HttpEventSender;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::AppConfig;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("sbsource: loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let providers = match telemetry::init(&config.telemetry()) {
        Ok(providers) => providers,
        Err(e) => {
            eprintln!("sbsource: initializing telemetry: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let result = run(config).await;
    if let Err(e) = &result {
        error!(error = %format!("{e:#}"), "source terminated");
    }
    telemetry::shutdown(providers);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let entity = config.entity()?;
    let processor_kind = config.processor_kind()?;
    info!(
        entity = %entity,
        entity_path = %entity.entity_path(),
        processor = %processor_kind,
        "starting Service Bus source"
    );

    let sender = HttpEventSender::new(config.sender_config()?).context("creating event sender")?;
    let receiver_options = config.receiver_options();
    let broker_http = broker_http_client(&receiver_options).context("creating broker client")?;
    let receiver = ServiceBusReceiver::connect(
        &entity,
        &config.credentials(),
        broker_http,
        receiver_options,
    )
    .context("connecting to Service Bus")?;

    let handler = MessageHandler::new(build_processor(processor_kind, entity.as_str()), Arc::new(sender));
    let listener = Listener::new(
        Arc::new(receiver),
        handler,
        Arc::new(LoggingObserver),
        config.listener_config(),
    );

    let shutdown = CancellationToken::new();
    spawn_signal_handlers(shutdown.clone());

    listener.start(shutdown).await?;
    info!("Service Bus source stopped");
    Ok(())
}

fn spawn_signal_handlers(token: CancellationToken) {
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                ctrl_c_token.cancel();
            }
            Err(e) => error!(error = %e, "Error setting up signal handler"),
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM signal");
                token.cancel();
            }
            Err(e) => error!(error = %e, "Error setting up SIGTERM handler"),
        }
    });
}
