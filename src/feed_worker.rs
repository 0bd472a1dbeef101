//! The receive loop that drives the ingestion pipeline.
//!
//! One worker per feed. It owns the connection and the packet handler, reads
//! lines in arrival order and hands every APRS line to the handler inline.
//! `immortal` workers reconnect after transport failures with exponential
//! backoff; cancellation always wins over reconnection.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

use crate::aprs_client::{AprsClientConfig, FeedConnection};
use crate::errors::FeedError;
use crate::packet_processors::PacketHandler;

/// How the worker runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Reconnect after transport failures instead of returning them
    pub immortal: bool,
    /// Run on a dedicated OS thread with its own runtime instead of as a
    /// task on the caller's runtime
    pub blocking: bool,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            immortal: true,
            blocking: false,
        }
    }
}

/// Handle on a running worker
pub struct FeedHandle {
    cancel: CancellationToken,
    result: oneshot::Receiver<Result<(), FeedError>>,
}

impl FeedHandle {
    /// Ask the worker to stop. It finishes the packet in progress, drops the
    /// connection and does not reconnect.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the worker to exit.
    ///
    /// `Ok(())` after cancellation; otherwise the authentication or
    /// transport failure that ended it.
    pub async fn join(self) -> Result<(), FeedError> {
        match self.result.await {
            Ok(result) => result,
            Err(_) => Err(FeedError::transport(
                "feed worker terminated without reporting a result",
            )),
        }
    }
}

/// Start a worker for `config`, feeding every APRS line to `handler`.
///
/// Must be called from within a tokio runtime unless `options.blocking` is set.
pub fn consume<H>(
    config: AprsClientConfig,
    handler: H,
    options: ConsumeOptions,
    cancel: CancellationToken,
) -> Result<FeedHandle, FeedError>
where
    H: PacketHandler + 'static,
{
    let (result_tx, result_rx) = oneshot::channel();
    let worker_cancel = cancel.clone();
    let server_address = config.server_address();

    if options.blocking {
        std::thread::Builder::new()
            .name("aprs-feed".to_string())
            .spawn(move || {
                let mut handler = handler;
                let result = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime.block_on(run_feed(
                        &config,
                        &mut handler,
                        options.immortal,
                        &worker_cancel,
                    )),
                    Err(e) => Err(FeedError::transport(format!(
                        "failed to build feed worker runtime: {}",
                        e
                    ))),
                };
                let _ = result_tx.send(result);
            })?;
    } else {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            FeedError::transport(format!(
                "non-blocking feed worker needs a tokio runtime: {}",
                e
            ))
        })?;
        runtime.spawn(async move {
            let mut handler = handler;
            let result = run_feed(&config, &mut handler, options.immortal, &worker_cancel).await;
            let _ = result_tx.send(result);
        });
    }

    info!(
        server = %server_address,
        blocking = options.blocking,
        immortal = options.immortal,
        "Feed worker started"
    );

    Ok(FeedHandle {
        cancel,
        result: result_rx,
    })
}

/// The receive loop itself, run inline on the current task.
///
/// Returns `Ok(())` once cancelled. Authentication failures are returned
/// immediately; transport failures only when not `immortal`.
pub async fn run_feed<H: PacketHandler + ?Sized>(
    config: &AprsClientConfig,
    handler: &mut H,
    immortal: bool,
    cancel: &CancellationToken,
) -> Result<(), FeedError> {
    let mut retry_count: u64 = 0;
    let mut current_delay = config.retry_delay_seconds;

    loop {
        if cancel.is_cancelled() {
            info!("Feed worker cancelled");
            return Ok(());
        }

        if retry_count == 0 {
            info!("Connecting to APRS server at {}", config.server_address());
        } else {
            info!(
                "Reconnecting to APRS server at {} (retry attempt {})",
                config.server_address(),
                retry_count
            );
        }

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Feed worker cancelled while connecting");
                return Ok(());
            }
            connected = FeedConnection::connect(config) => connected,
        };

        let failure = match connected {
            Ok(mut connection) => {
                info!("Streaming from {}", connection.peer_addr());
                let mut delivered: u64 = 0;
                let result = run_session(&mut connection, handler, cancel, &mut delivered).await;
                // Backoff only restarts once a session has produced packets
                if delivered > 0 {
                    retry_count = 0;
                    current_delay = config.retry_delay_seconds;
                }
                match result {
                    Ok(()) => {
                        info!("Feed worker cancelled, closing connection");
                        return Ok(());
                    }
                    Err(e) => {
                        metrics::counter!("aprs.connection.operation_failed_total").increment(1);
                        e
                    }
                }
            }
            Err(e) => e,
        };

        if !failure.is_retryable() {
            error!("APRS feed stopped: {}", failure);
            return Err(failure);
        }
        if !immortal {
            warn!("APRS feed failed and will not reconnect: {}", failure);
            return Err(failure);
        }

        warn!("APRS feed failed: {}", failure);
        retry_count += 1;
        metrics::counter!("aprs.connection.reconnect_total").increment(1);

        if current_delay > 0 {
            info!("Waiting {} seconds before retry", current_delay);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Feed worker cancelled while waiting to reconnect");
                    return Ok(());
                }
                _ = tokio::time::sleep(Duration::from_secs(current_delay)) => {}
            }
        }
        current_delay = next_delay(current_delay, config.max_retry_delay_seconds);
    }
}

/// Exponential backoff; an initial delay of zero retries once immediately
/// and then starts at one second.
fn next_delay(current: u64, max: u64) -> u64 {
    let next = if current == 0 { 1 } else { current.saturating_mul(2) };
    next.min(max)
}

/// Read lines until the connection fails or the worker is cancelled.
/// `delivered` counts the APRS lines handed to `handler`.
async fn run_session<H: PacketHandler + ?Sized>(
    connection: &mut FeedConnection,
    handler: &mut H,
    cancel: &CancellationToken,
    delivered: &mut u64,
) -> Result<(), FeedError> {
    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            line = connection.next_line() => line?,
        };
        let received_at = Utc::now();

        if line.starts_with('#') {
            trace!("Server message: {}", line);
            continue;
        }

        handler.handle_line(&line, received_at);
        *delivered += 1;
    }
}
