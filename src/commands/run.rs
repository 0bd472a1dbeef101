use anyhow::{Context, Result};
use aprs_weather::config::WeatherConfig;
use aprs_weather::dispatch::{ChannelSink, EntitySink, LogSink};
use aprs_weather::feed_worker;
use aprs_weather::packet_processors::IngestPipeline;
use aprs_weather::station_cache::StationStateReader;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing::{error, info};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

pub async fn handle_run(config: WeatherConfig, json: bool) -> Result<()> {
    info!("Initializing feed metrics...");
    aprs_weather::metrics::initialize_feed_metrics();
    aprs_weather::metrics::initialize_weather_metrics();

    if json {
        let (sink, events) = ChannelSink::channel();
        let printer = tokio::spawn(async move {
            while let Ok(event) = events.recv_async().await {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => error!("Failed to serialize sensor event: {}", e),
                }
            }
        });
        let result = run_with_sink(&config, sink).await;
        // The worker dropped the sink, so the printer drains and exits
        printer.await.context("Event printer task panicked")?;
        result
    } else {
        run_with_sink(&config, LogSink).await
    }
}

async fn run_with_sink<S: EntitySink + 'static>(config: &WeatherConfig, sink: S) -> Result<()> {
    let client_config = config.client_config()?;
    info!(
        "Starting APRS weather feed - server: {}, callsign: {}, filter: {:?}",
        client_config.server_address(),
        client_config.callsign,
        client_config.filter
    );

    let pipeline =
        IngestPipeline::new(sink).with_position_tracking(config.dispatch.track_position);
    let reader = pipeline.reader();

    if let Some(metrics_port) = config.metrics.port {
        let metrics_reader = reader.clone();
        tokio::spawn(
            async move {
                if let Err(e) =
                    aprs_weather::metrics::start_metrics_server(metrics_port, metrics_reader).await
                {
                    error!("Metrics server stopped: {:#}", e);
                }
            }
            .instrument(tracing::info_span!("metrics_server")),
        );
    }

    let cancel = CancellationToken::new();
    let handle = feed_worker::consume(
        client_config,
        pipeline,
        config.consume_options(),
        cancel.clone(),
    )?;

    tokio::spawn(shutdown_on_signal(handle.cancellation_token()));
    tokio::spawn(log_station_stats(reader, cancel.clone()));

    let result = handle.join().await;
    cancel.cancel();
    result.context("APRS feed stopped")?;

    info!("Shutdown complete");
    Ok(())
}

/// Cancel the worker on SIGINT or SIGTERM
async fn shutdown_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to register signal handlers: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
            _ = sigint.recv() => info!("Received SIGINT (Ctrl+C), shutting down..."),
            _ = cancel.cancelled() => return,
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => info!("Received Ctrl+C, shutting down..."),
                Err(err) => {
                    error!("Failed to listen for Ctrl+C: {}", err);
                    return;
                }
            },
            _ = cancel.cancelled() => return,
        }
    }

    cancel.cancel();
}

async fn log_station_stats(reader: StationStateReader, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                info!("Tracking {} weather stations", reader.len());
            }
        }
    }
}
