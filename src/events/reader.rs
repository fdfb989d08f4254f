use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::{
    net::TcpStream,
    sync::watch,
    time::{Instant, MissedTickBehavior, interval_at, sleep},
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

use crate::events::{BusConfig, EventBus, decode_frame};

const BACKOFF_CAP_SECS: u64 = 30;
const BACKOFF_JITTER: f64 = 0.2;
/// Consecutive undecodable frames after which the socket is recycled.
const DECODE_STORM_THRESHOLD: u32 = 10;

/// Un-jittered reconnect delay: 1s, 2s, 4s, ... capped at 30s.
pub fn backoff_base(attempt: u32) -> Duration {
    let secs = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_secs(secs.min(BACKOFF_CAP_SECS))
}

/// Reconnect delay for `attempt` with ±20% jitter applied.
pub fn backoff_delay(attempt: u32) -> Duration {
    let factor = rand::rng().random_range((1.0 - BACKOFF_JITTER)..=(1.0 + BACKOFF_JITTER));
    backoff_base(attempt).mul_f64(factor)
}

enum StreamEnd {
    Shutdown,
    Closed,
    Failed(String),
    DecodeStorm,
}

/// Reader task: keeps one socket open and routes its frames until shutdown.
pub(crate) async fn run(bus: EventBus, config: BusConfig, mut shutdown: watch::Receiver<bool>) {
    let url = match config.stream_url() {
        Ok(url) => url,
        Err(error) => {
            tracing::error!(error = %error, "invalid provider websocket url; event bus disabled");
            return;
        }
    };
    let host = url.host_str().unwrap_or_default().to_owned();
    let mut attempt: u32 = 0;
    let mut outage_reported = false;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let connected = tokio::select! {
            result = connect_async(url.as_str()) => result,
            _ = shutdown.changed() => break,
        };

        match connected {
            Ok((stream, _)) => {
                attempt = 0;
                outage_reported = false;
                bus.set_connected(true);
                tracing::info!(%host, "provider event stream connected");

                let end = read_stream(&bus, stream, config.heartbeat, &mut shutdown).await;
                bus.set_connected(false);
                match end {
                    StreamEnd::Shutdown => break,
                    StreamEnd::Closed => tracing::warn!(%host, "provider event stream closed"),
                    StreamEnd::Failed(error) => {
                        tracing::warn!(%host, error = %error, "provider event stream failed")
                    }
                    StreamEnd::DecodeStorm => tracing::warn!(
                        %host,
                        threshold = DECODE_STORM_THRESHOLD,
                        "too many undecodable frames; reconnecting"
                    ),
                }
            }
            Err(error) => {
                tracing::warn!(%host, attempt, error = %error, "provider event stream connect failed");
            }
        }

        if !outage_reported {
            bus.notify_interrupted();
            outage_reported = true;
        }

        let delay = backoff_delay(attempt);
        attempt = attempt.saturating_add(1);
        bus.metrics().bus_reconnect();
        tracing::debug!(delay_ms = delay.as_millis() as u64, "waiting before reconnecting");

        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    bus.set_connected(false);
    tracing::info!(%host, "provider event stream stopped");
}

async fn read_stream(
    bus: &EventBus,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    heartbeat: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> StreamEnd {
    let (mut write, mut read) = stream.split();
    let heartbeat = heartbeat.max(Duration::from_secs(1));
    let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut decode_failures: u32 = 0;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = write.send(Message::Close(None)).await;
                return StreamEnd::Shutdown;
            }
            _ = ticker.tick() => {
                if let Err(error) = write.send(Message::Ping(Default::default())).await {
                    return StreamEnd::Failed(error.to_string());
                }
            }
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => match decode_frame(&text) {
                    Ok(Some(event)) => {
                        decode_failures = 0;
                        bus.route(event);
                    }
                    Ok(None) => {
                        decode_failures = 0;
                        tracing::debug!("ignoring unrecognized provider frame");
                        bus.metrics().bus_frame_dropped();
                    }
                    Err(error) => {
                        decode_failures += 1;
                        tracing::warn!(error = %error, "failed to decode provider frame");
                        bus.metrics().bus_frame_dropped();
                        if decode_failures >= DECODE_STORM_THRESHOLD {
                            return StreamEnd::DecodeStorm;
                        }
                    }
                },
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(error) = write.send(Message::Pong(payload)).await {
                        return StreamEnd::Failed(error.to_string());
                    }
                }
                Some(Ok(Message::Close(_))) | None => return StreamEnd::Closed,
                Some(Ok(_)) => {}
                Some(Err(error)) => return StreamEnd::Failed(error.to_string()),
            },
        }
    }
}
