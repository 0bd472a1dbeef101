// Integration tests for the feed worker against a mock APRS-IS server.
// They cover the full path from socket to sink: login, routing, caching,
// create/update dispatch, reconnection and cancellation.

mod common;

use std::time::Duration;

use aprs_weather::dispatch::{ChannelSink, SinkEvent};
use aprs_weather::errors::FeedError;
use aprs_weather::feed_worker::{ConsumeOptions, consume};
use aprs_weather::packet::Metric;
use aprs_weather::packet_processors::IngestPipeline;
use common::{MockAprsServer, POSITION_LINE, WEATHER_LINE, WEATHER_LINE_WARMER};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

async fn next_events(events: &flume::Receiver<SinkEvent>, count: usize) -> Vec<SinkEvent> {
    let mut received = Vec::with_capacity(count);
    for _ in 0..count {
        let event = tokio::time::timeout(WAIT, events.recv_async())
            .await
            .expect("timed out waiting for sink event")
            .expect("sink channel closed");
        received.push(event);
    }
    received
}

#[tokio::test]
async fn reconnect_keeps_materialized_metrics() {
    let server = MockAprsServer::bind().await;
    let config = server.client_config().build();

    let (sink, events) = ChannelSink::channel();
    let pipeline = IngestPipeline::new(sink);
    let reader = pipeline.reader();
    let handle = consume(
        config,
        pipeline,
        ConsumeOptions {
            immortal: true,
            blocking: false,
        },
        CancellationToken::new(),
    )
    .unwrap();

    let login = server.serve_session(&[WEATHER_LINE]).await;
    assert!(login.starts_with("user N0CALL pass -1 vers aprs-weather"));

    let first = next_events(&events, 6).await;
    assert!(first.iter().all(|e| e.is_create()));
    assert_eq!(first[0].metric(), Metric::Temperature);
    assert_eq!(first[0].value(), 71.0);

    // The server dropped us; the worker reconnects on its own
    server
        .serve_and_hold(&[WEATHER_LINE_WARMER], Duration::from_millis(500))
        .await;

    let second = next_events(&events, 6).await;
    assert!(second.iter().all(|e| !e.is_create()));
    assert_eq!(second[0].metric(), Metric::Temperature);
    assert_eq!(second[0].value(), 72.0);

    let state = reader.get("K1ABC").unwrap();
    assert_eq!(state.last_packet.value(Metric::Temperature), Some(72.0));

    handle.stop();
    assert!(handle.join().await.is_ok());
}

#[tokio::test]
async fn rejected_login_is_returned_and_not_retried() {
    let server = MockAprsServer::bind().await;
    let config = server.client_config().passcode(Some("12345")).build();

    let (sink, _events) = ChannelSink::channel();
    let handle = consume(
        config,
        IngestPipeline::new(sink),
        ConsumeOptions::default(),
        CancellationToken::new(),
    )
    .unwrap();

    // The mock answers "unverified" although a passcode was sent
    server.serve_session(&[]).await;

    let err = tokio::time::timeout(WAIT, handle.join())
        .await
        .expect("worker did not exit")
        .unwrap_err();
    assert!(matches!(err, FeedError::Authentication { .. }));
    assert!(!server.accepts_within(Duration::from_millis(300)).await);
}

#[tokio::test]
async fn verified_login_with_passcode_is_accepted() {
    let server = MockAprsServer::bind().await.verifying();
    let config = server.client_config().passcode(Some("12345")).build();

    let (sink, events) = ChannelSink::channel();
    let handle = consume(
        config,
        IngestPipeline::new(sink),
        ConsumeOptions {
            immortal: false,
            blocking: false,
        },
        CancellationToken::new(),
    )
    .unwrap();

    let login = server.serve_session(&[WEATHER_LINE]).await;
    assert!(login.starts_with("user N0CALL pass 12345 "));
    assert_eq!(next_events(&events, 6).await.len(), 6);

    // Mortal workers hand the disconnect back to the caller
    let err = tokio::time::timeout(WAIT, handle.join())
        .await
        .expect("worker did not exit")
        .unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn only_weather_reaches_the_sink_in_blocking_mode() {
    let server = MockAprsServer::bind().await;
    let config = server.client_config().build();

    let (sink, events) = ChannelSink::channel();
    let pipeline = IngestPipeline::new(sink);
    let reader = pipeline.reader();
    let handle = consume(
        config,
        pipeline,
        ConsumeOptions {
            immortal: false,
            blocking: true,
        },
        CancellationToken::new(),
    )
    .unwrap();

    server
        .serve_session(&[
            "# aprsc comment",
            "this is not an APRS packet",
            POSITION_LINE,
            WEATHER_LINE,
        ])
        .await;

    let created = next_events(&events, 6).await;
    assert!(created.iter().all(|e| e.station_id() == "K1ABC"));

    let _ = tokio::time::timeout(WAIT, handle.join())
        .await
        .expect("worker did not exit");

    // Nothing but the weather report was published
    assert!(events.try_recv().is_err());
    assert_eq!(reader.station_ids(), vec!["K1ABC"]);
}

#[tokio::test]
async fn cancellation_stops_an_immortal_worker() {
    let server = MockAprsServer::bind().await;
    let config = server.client_config().build();

    let (sink, events) = ChannelSink::channel();
    let cancel = CancellationToken::new();
    let handle = consume(
        config,
        IngestPipeline::new(sink),
        ConsumeOptions::default(),
        cancel.clone(),
    )
    .unwrap();

    let serving = tokio::spawn(async move {
        server
            .serve_and_hold(&[WEATHER_LINE], Duration::from_secs(2))
            .await;
        server
    });

    next_events(&events, 6).await;
    cancel.cancel();

    let result = tokio::time::timeout(WAIT, handle.join())
        .await
        .expect("worker did not stop");
    assert!(result.is_ok());

    // No reconnect after cancellation
    let server = serving.await.unwrap();
    assert!(!server.accepts_within(Duration::from_millis(300)).await);
}

#[tokio::test]
async fn empty_sessions_back_off_instead_of_reconnecting_at_once() {
    let server = MockAprsServer::bind().await;
    let config = server.client_config().build();

    let (sink, _events) = ChannelSink::channel();
    let handle = consume(
        config,
        IngestPipeline::new(sink),
        ConsumeOptions::default(),
        CancellationToken::new(),
    )
    .unwrap();

    // Logged in, then hung up before sending a single packet
    server.serve_session(&[]).await;
    // First retry is immediate, the next one waits a second
    server.serve_session(&[]).await;
    assert!(!server.accepts_within(Duration::from_millis(500)).await);

    handle.stop();
    assert!(tokio::time::timeout(WAIT, handle.join()).await.unwrap().is_ok());
}
