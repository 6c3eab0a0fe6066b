// ── Session supervisor ──
//
// Owns gateway reconnection. Loss signals carry the generation of the
// session that failed; a request for an older generation than the live one
// is stale and dropped, so a burst of failures produces one reconnect.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Bridge, ConnectionState};
use crate::config::ReconnectConfig;

/// Wait for loss of the session with `generation`, then ask for a
/// reconnect.
pub(crate) async fn watch_session(
    lost: CancellationToken,
    cancel: CancellationToken,
    generation: u64,
    reconnect_tx: mpsc::Sender<u64>,
) {
    tokio::select! {
        biased;
        () = cancel.cancelled() => {}
        () = lost.cancelled() => {
            warn!(generation, "gateway connection lost");
            // A full channel already holds a pending request.
            let _ = reconnect_tx.try_send(generation);
        }
    }
}

/// Serve reconnect requests one at a time until `cancel` fires.
pub(crate) async fn supervise(bridge: Bridge, mut rx: mpsc::Receiver<u64>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            request = rx.recv() => {
                let Some(generation) = request else { break };
                let live = bridge.inner.generation.load(Ordering::Acquire);
                if generation < live {
                    debug!(generation, live, "stale reconnect request ignored");
                    continue;
                }
                reconnect(&bridge, &cancel).await;
            }
        }
    }
}

async fn reconnect(bridge: &Bridge, cancel: &CancellationToken) {
    let inner = &bridge.inner;
    bridge.detach(false).await;

    let Some(address) = inner.address.lock().await.clone() else {
        error!("no gateway address to reconnect to");
        let _ = inner.connection_state.send(ConnectionState::Failed);
        return;
    };
    let reconnect = &inner.config.reconnect;
    let mut attempt: u32 = 0;

    loop {
        let _ = inner.connection_state.send(ConnectionState::Reconnecting { attempt });
        let result = match inner
            .pairing
            .establish_session(&address, inner.config.gateway.setup_code.as_ref())
            .await
        {
            Ok(established) => bridge.attach(established).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                inner.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                info!(%address, attempt, "reconnected to gateway");
                return;
            }
            Err(e) if e.needs_operator() => {
                error!(%address, error = %e, "reconnect needs operator action");
                let _ = inner.connection_state.send(ConnectionState::Failed);
                return;
            }
            Err(e) => warn!(%address, attempt, error = %e, "reconnect failed"),
        }

        attempt += 1;
        if let Some(max) = reconnect.max_retries {
            if attempt >= max {
                error!(max_retries = max, "gateway reconnection limit reached, giving up");
                let _ = inner.connection_state.send(ConnectionState::Failed);
                return;
            }
        }

        let delay = calculate_backoff(attempt - 1, reconnect);
        info!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            attempt,
            "Waiting before reconnect"
        );
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// Exponential backoff with deterministic jitter, capped at `max_delay`.
pub(crate) fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
    let capped = base.min(config.max_delay.as_secs_f64());

    // Deterministic "jitter" seeded from the attempt number.
    let jitter_factor = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
    Duration::from_secs_f64((capped * jitter_factor).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_increases_exponentially() {
        let config = ReconnectConfig::default();

        let d0 = calculate_backoff(0, &config);
        let d1 = calculate_backoff(1, &config);
        let d2 = calculate_backoff(2, &config);

        assert!(d1 > d0, "d1 ({d1:?}) should be greater than d0 ({d0:?})");
        assert!(d2 > d1, "d2 ({d2:?}) should be greater than d1 ({d1:?})");
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_retries: None,
        };

        let d10 = calculate_backoff(10, &config);
        // With jitter factor up to 1.25, max effective is 12.5s
        assert!(
            d10 <= Duration::from_secs(13),
            "delay at attempt 10 ({d10:?}) should be capped near max_delay"
        );
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let config = ReconnectConfig::default();
        assert!(calculate_backoff(u32::MAX, &config) <= Duration::from_secs(38));
    }
}
