/*!
 * Reachability probing
 *
 * Before a connector is handed out, a cheap ping is retried until it
 * succeeds. Attempt `n` (counting from 1) that fails for connectivity reasons
 * waits `n * base` plus a random jitter below `base`. Any other failure is a
 * configuration problem and is returned at once. There is no attempt limit.
 */

use crate::config::ProbeSettings;
use crate::engine::Connector;
use crate::error::{ConnectorError, ErrorKind, Result};
use crate::operation::Operation;
use crate::transport::StoreConnection;
use rand::Rng;
use std::time::Duration;
use tracing::{info, warn};

/// Outcome of a successful probe run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    /// Probes sent, including the successful one
    pub attempts: u32,
    /// Total time spent backing off
    pub waited: Duration,
}

/// Delay before retry number `retry` (1-based): `retry * base + [0, base)`
pub fn backoff_delay<R: Rng>(retry: u32, base: Duration, rng: &mut R) -> Duration {
    let base_ms = base.as_millis() as u64;
    let jitter = if base_ms == 0 {
        0
    } else {
        rng.random_range(0..base_ms)
    };
    Duration::from_millis(u64::from(retry) * base_ms + jitter)
}

/// Retries a ping until the end-point answers
#[derive(Debug, Clone)]
pub struct ReachabilityProber {
    base_delay: Duration,
    probe_timeout: Duration,
}

impl ReachabilityProber {
    pub fn new(base_delay: Duration, probe_timeout: Duration) -> Self {
        Self {
            base_delay,
            probe_timeout,
        }
    }

    pub fn from_settings(settings: &ProbeSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.base_delay_millis),
            Duration::from_millis(settings.timeout_millis),
        )
    }

    /// Block until a probe succeeds
    pub async fn await_reachable<C: StoreConnection>(
        &self,
        connector: &Connector<C>,
    ) -> Result<ProbeReport> {
        let mut retry: u32 = 0;
        let mut waited = Duration::ZERO;

        loop {
            match self.probe(connector).await {
                Ok(()) => {
                    let report = ProbeReport {
                        attempts: retry + 1,
                        waited,
                    };
                    info!(
                        endpoint = %connector.endpoint(),
                        attempts = report.attempts,
                        "End-point is reachable"
                    );
                    return Ok(report);
                }
                Err(err) if err.is_connectivity() => {
                    retry += 1;
                    let delay = backoff_delay(retry, self.base_delay, &mut rand::rng());
                    warn!(
                        endpoint = %connector.endpoint(),
                        attempt = retry,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "End-point not reachable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    waited += delay;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn probe<C: StoreConnection>(&self, connector: &Connector<C>) -> Result<()> {
        let op = Operation::ping()
            .bypass_circuit_breaker()
            .with_command_timeout(self.probe_timeout);

        if connector.execute(op, None).await? {
            Ok(())
        } else {
            Err(ConnectorError::new(
                ErrorKind::RemoteError,
                format!("Ping to {} was not answered with PONG", connector.endpoint()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectorConfig;
    use crate::endpoint::EndpointDescriptor;
    use crate::transport::memory::{MemoryConnection, MemoryStore};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn connector(store: &MemoryStore, config: &ConnectorConfig) -> Connector<MemoryConnection> {
        Connector::new(
            EndpointDescriptor::from_config(config).unwrap(),
            Arc::new(store.clone()),
            config,
        )
        .unwrap()
    }

    #[test]
    fn test_backoff_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let base = Duration::from_millis(1000);
        for retry in 1..=5u32 {
            for _ in 0..50 {
                let delay = backoff_delay(retry, base, &mut rng);
                assert!(delay >= base * retry);
                assert!(delay < base * retry + base);
            }
        }
        assert_eq!(backoff_delay(3, Duration::ZERO, &mut rng), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_connectivity_failures() {
        let store = MemoryStore::new("memory:probe");
        let connector = connector(&store, &ConnectorConfig::default());
        store.refuse_connects(2);

        let started = tokio::time::Instant::now();
        let report = ReachabilityProber::new(Duration::from_secs(1), Duration::from_secs(1))
            .await_reachable(&connector)
            .await
            .unwrap();

        assert_eq!(report.attempts, 3);
        // 1s..2s for the first retry, 2s..3s for the second
        assert!(report.waited >= Duration::from_secs(3));
        assert!(report.waited < Duration::from_secs(5));
        assert!(started.elapsed() >= report.waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_ping_is_not_retried() {
        let store = MemoryStore::new("memory:probe-pong");
        let connector = connector(&store, &ConnectorConfig::default());
        store.fail_pings(true);

        let err = ReachabilityProber::new(Duration::from_secs(1), Duration::from_secs(1))
            .await_reachable(&connector)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteError);
        assert_eq!(store.commands(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_uses_short_timeout() {
        let store = MemoryStore::with_timeout("memory:probe-slow", Duration::from_secs(60));
        let connector = connector(&store, &ConnectorConfig::default());
        store.set_latency(Duration::from_secs(10));

        // Every ping times out after 1s; stop the endless loop after a while
        let outcome = tokio::time::timeout(
            Duration::from_secs(30),
            ReachabilityProber::new(Duration::from_secs(1), Duration::from_secs(1))
                .await_reachable(&connector),
        )
        .await;
        assert!(outcome.is_err());
        assert!(store.commands() >= 3);
    }
}
