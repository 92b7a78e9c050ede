//! Upstream side: installs the telemetry source, runs the tick scheduler and
//! accepts the JSON-lines feed that fills the live source.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use lib_relay::core::{SchedulerConfig, TickScheduler};
use lib_relay::sources::{FeedPublisher, LiveFeedSource, PathRegistry, PlaybackSource, TelemetryFrame};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::relay_logic::config::Config;
use crate::relay_logic::state::AppState;

/// Installs the configured source. Returns the feed publisher when the live feed
/// was chosen, `None` for playback.
pub fn install_source(config: &Config, state: &AppState) -> anyhow::Result<Option<FeedPublisher>> {
    let registry = Arc::new(PathRegistry::with_defaults());

    if let Some(path) = &config.playback {
        let playback = PlaybackSource::open(path, registry, config.seek_range())
            .with_context(|| format!("Failed to load recording {}", path.display()))?;
        state.source.install(Box::new(playback));
        return Ok(None);
    }

    let (publisher, source) = LiveFeedSource::channel(registry, config.source_silence());
    state.source.install(Box::new(source));
    Ok(Some(publisher))
}

/// Runs the tick scheduler until the server shuts down.
pub async fn run_scheduler(config: Config, state: AppState) {
    let scheduler = TickScheduler::new(
        state.source.clone(),
        Arc::clone(&state.dispatcher),
        SchedulerConfig {
            tick_interval: config.tick_interval(),
            waiting_interval: Duration::from_secs(1),
        },
    );
    scheduler.run(state.cancel.clone()).await;
}

/// Accepts feed connections on the ingest port until cancelled.
pub async fn run_ingest(config: Config, publisher: FeedPublisher, cancel: CancellationToken) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.ingest_port()));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind ingest port {}", addr))?;
    tracing::info!("Ingest feed listening on {}", listener.local_addr()?);
    serve_ingest(listener, publisher, cancel).await;
    Ok(())
}

/// Accept loop. The feed counts as disconnected once its last producer leaves.
pub async fn serve_ingest(listener: TcpListener, publisher: FeedPublisher, cancel: CancellationToken) {
    let producers = Arc::new(AtomicUsize::new(0));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Ingest feed shutting down.");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((socket, peer)) => {
                        let publisher = publisher.clone();
                        let producers = Arc::clone(&producers);
                        let cancel = cancel.clone();
                        producers.fetch_add(1, Ordering::SeqCst);
                        tracing::info!("Feed producer {} connected", peer);
                        tokio::spawn(async move {
                            let reader = BufReader::new(socket);
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                result = ingest_lines(reader, &publisher) => match result {
                                    Ok(frames) => tracing::info!("Feed producer {} left after {} frame(s)", peer, frames),
                                    Err(e) => tracing::warn!("Feed producer {} failed: {}", peer, e),
                                },
                            }
                            if producers.fetch_sub(1, Ordering::SeqCst) == 1 {
                                publisher.disconnect();
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("accept error: {:?}", e);
                    }
                }
            }
        }
    }
}

/// Publishes every well-formed frame line of `reader`. Bad lines are logged and
/// skipped. Returns the number of frames published.
pub async fn ingest_lines<R>(reader: R, publisher: &FeedPublisher) -> std::io::Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut frames = 0;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TelemetryFrame>(&line) {
            Ok(frame) => {
                publisher.publish(frame);
                frames += 1;
            }
            Err(e) => tracing::warn!("Skipping malformed feed line: {}", e),
        }
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_relay::core::{LiveSource, QueryRequest, SharedSource, SourceError, TickPoll};
    use serde_json::json;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn ingest_skips_bad_lines() {
        let (publisher, mut source) = LiveFeedSource::channel(Arc::new(PathRegistry::with_defaults()), None);
        let input: &[u8] = b"{\"tick\": 1, \"values\": {\"/Car/ME/Gear\": 2}}\ngarbage\n\n{\"tick\": 2, \"values\": {\"/Car/ME/Gear\": 3}}\n";
        assert_eq!(ingest_lines(input, &publisher).await.unwrap(), 2);

        source.advance();
        let gear = source.query(&QueryRequest::raw("/Car/ME/Gear")).unwrap();
        assert_eq!(gear.raw, json!(3));
    }

    #[tokio::test]
    async fn playback_install_reports_missing_file() {
        let state = AppState::new(SharedSource::new(), None, Duration::from_millis(50));
        let config = Config {
            playback: Some("/definitely/not/here.jsonl".into()),
            ..Default::default()
        };
        assert!(install_source(&config, &state).is_err());
        assert!(!state.source.is_installed());
    }

    #[tokio::test]
    async fn tcp_feed_reaches_the_source_and_disconnect_stops_it() {
        let state = AppState::new(SharedSource::new(), None, Duration::from_millis(50));
        let publisher = install_source(&Config::default(), &state).unwrap().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve_ingest(listener, publisher, cancel.clone()));

        let mut producer = tokio::net::TcpStream::connect(addr).await.unwrap();
        producer
            .write_all(b"{\"tick\": 5, \"values\": {\"/Car/ME/Rpm\": 7200}, \"units\": {\"/Car/ME/Rpm\": \"rpm\"}}\n")
            .await
            .unwrap();

        let mut up = false;
        for _ in 0..100 {
            if state.source.poll_tick(None, &Vec::new()) != TickPoll::Down {
                up = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(up, "feed never reached the source");
        let rpm = state.source.query(&QueryRequest::raw("/Car/ME/Rpm")).unwrap();
        assert_eq!(rpm.raw, json!(7200));

        drop(producer);
        let mut down = false;
        for _ in 0..100 {
            if state.source.poll_tick(None, &Vec::new()) == TickPoll::Down {
                down = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(down, "disconnect was not observed");
        assert_eq!(
            state.source.query(&QueryRequest::raw("/Car/ME/Rpm")),
            Err(SourceError::NotAvailable)
        );

        cancel.cancel();
        server.await.unwrap();
    }
}
