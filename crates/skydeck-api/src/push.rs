//! WebSocket push-notification feed with auto-reconnect.
//!
//! Push-capable services (currently Jellyfin) notify on state changes
//! over a WebSocket. This layer never interprets the payloads — every
//! inbound message becomes an opaque [`PushPulse`] that tells the
//! connection supervisor "something changed, fetch soon". Reconnection
//! with exponential backoff + jitter is handled here; the consumer only
//! sees a channel that keeps producing pulses until cancelled.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::AdapterError;

/// Pulses are coalesced by the supervisor's debouncer, so the channel
/// can stay small; a full channel just means a pulse is already pending.
const PULSE_CHANNEL_CAPACITY: usize = 16;

/// An opaque "upstream state changed" notification.
#[derive(Debug, Clone, Copy)]
pub struct PushPulse;

/// Exponential backoff configuration for push reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum reconnection attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

/// Spawn the reconnecting push feed for one endpoint.
///
/// Returns immediately; the first connection attempt happens on the
/// background task. The receiver yields a pulse per upstream message
/// until the token is cancelled or the retry limit is reached.
pub fn spawn_push_feed(
    ws_url: Url,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
) -> mpsc::Receiver<PushPulse> {
    let (pulse_tx, pulse_rx) = mpsc::channel(PULSE_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        push_loop(ws_url, pulse_tx, reconnect, cancel).await;
    });

    pulse_rx
}

/// Main loop: connect → read → on error, backoff → reconnect.
async fn push_loop(
    ws_url: Url,
    pulse_tx: mpsc::Sender<PushPulse>,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = connect_and_read(&ws_url, &pulse_tx, &cancel) => {
                match result {
                    // Clean disconnect (server close frame or stream ended).
                    // Reset attempt counter and reconnect immediately.
                    Ok(()) => {
                        tracing::info!("push feed disconnected cleanly, reconnecting");
                        attempt = 0;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, attempt, "push feed error");

                        if let Some(max) = reconnect.max_retries {
                            if attempt >= max {
                                tracing::error!(
                                    max_retries = max,
                                    "push reconnection limit reached, giving up"
                                );
                                break;
                            }
                        }

                        let delay = calculate_backoff(attempt, &reconnect);
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }

                        attempt += 1;
                    }
                }
            }
        }
    }

    #[allow(unreachable_code)]
    {
        tracing::debug!("push feed loop exiting");
    }
}

/// Establish a single WebSocket connection and pulse on every message
/// until the stream drops.
async fn connect_and_read(
    url: &Url,
    pulse_tx: &mpsc::Sender<PushPulse>,
    cancel: &CancellationToken,
) -> Result<(), AdapterError> {
    tracing::debug!(host = %url.host_str().unwrap_or("?"), "connecting push feed");

    let (ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| AdapterError::PushConnect(e.to_string()))?;

    tracing::info!("push feed connected");

    let (_write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            frame = read.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Text(_) | tungstenite::Message::Binary(_))) => {
                        // Content is deliberately not inspected; a full
                        // channel means a pulse is already waiting.
                        let _ = pulse_tx.try_send(PushPulse);
                    }
                    Some(Ok(tungstenite::Message::Ping(_))) => {
                        // tungstenite answers pongs automatically
                    }
                    Some(Ok(tungstenite::Message::Close(_))) => {
                        tracing::info!("push feed close frame received");
                        return Ok(());
                    }
                    Some(Err(e)) => {
                        return Err(AdapterError::PushConnect(e.to_string()));
                    }
                    None => {
                        tracing::info!("push feed stream ended");
                        return Ok(());
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt, max) + jitter`
///
/// Jitter is ±25% to spread reconnection storms when many supervisors
/// lose the same upstream at once. Seeded deterministically from the
/// attempt number — spread matters here, unpredictability does not.
fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(attempt.min(16) as i32);
    let capped = base.min(config.max_delay.as_secs_f64());

    let jitter_factor = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
    let with_jitter = (capped * jitter_factor).max(0.0);

    Duration::from_secs_f64(with_jitter)
}
