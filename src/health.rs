//! Health monitor
//!
//! A registered tunnel can look fine at the transport level while the
//! server forwards nothing. After a warm-up the monitor samples the
//! downlink counter twice, one observation window apart, and declares the
//! tunnel stalled when too few datagrams arrived in between.

use crate::proxy::{CounterSource, ProxyCounters};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Health check timing and threshold
#[derive(Debug, Clone)]
pub struct HealthSettings {
    /// Delay between connect and the first sample
    pub warmup: Duration,
    /// Delay between the two samples
    pub window: Duration,
    /// Fewest downlink datagrams per window for a healthy tunnel
    pub min_downlink_datagrams: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            warmup: Duration::from_secs(10),
            window: Duration::from_secs(15),
            min_downlink_datagrams: 5,
        }
    }
}

/// Outcome of one observation window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy { delta: u64 },
    Stalled { delta: u64 },
}

impl HealthVerdict {
    pub fn is_stalled(&self) -> bool {
        matches!(self, HealthVerdict::Stalled { .. })
    }
}

/// Classify the downlink progress between two samples
pub fn evaluate(before: &ProxyCounters, after: &ProxyCounters, min: u64) -> HealthVerdict {
    let delta = after.datagrams_down.saturating_sub(before.datagrams_down);
    if delta < min {
        HealthVerdict::Stalled { delta }
    } else {
        HealthVerdict::Healthy { delta }
    }
}

/// Stall detector for one established session
#[derive(Debug, Clone, Default)]
pub struct HealthMonitor {
    settings: HealthSettings,
}

impl HealthMonitor {
    pub fn new(settings: HealthSettings) -> Self {
        Self { settings }
    }

    /// Run one warm-up and one observation window
    pub async fn observe(&self, source: &dyn CounterSource) -> HealthVerdict {
        tokio::time::sleep(self.settings.warmup).await;
        let before = source.snapshot();

        tokio::time::sleep(self.settings.window).await;
        let after = source.snapshot();

        let verdict = evaluate(&before, &after, self.settings.min_downlink_datagrams);
        debug!("Health check: {:?}", verdict);
        verdict
    }

    /// Observe in the background; a stall is sent once on `verdict_tx`
    ///
    /// Aborting the returned handle cancels the check.
    pub fn spawn(
        self,
        source: Arc<dyn CounterSource>,
        verdict_tx: mpsc::Sender<HealthVerdict>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let verdict = self.observe(source.as_ref()).await;
            match verdict {
                HealthVerdict::Stalled { delta } => {
                    warn!(
                        "Tunnel stalled: {} downlink datagram(s) in {:?}, expected at least {}",
                        delta, self.settings.window, self.settings.min_downlink_datagrams
                    );
                    let _ = verdict_tx.send(verdict).await;
                }
                HealthVerdict::Healthy { delta } => {
                    info!("Tunnel healthy: {} downlink datagram(s) in {:?}", delta, self.settings.window);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Returns the scripted downlink totals, one per snapshot
    struct ScriptedCounters(Mutex<VecDeque<u64>>);

    impl ScriptedCounters {
        fn new(samples: &[u64]) -> Arc<Self> {
            Arc::new(Self(Mutex::new(samples.iter().copied().collect())))
        }
    }

    impl CounterSource for ScriptedCounters {
        fn snapshot(&self) -> ProxyCounters {
            ProxyCounters {
                datagrams_down: self.0.lock().unwrap().pop_front().unwrap_or(0),
                ..Default::default()
            }
        }
    }

    fn fast() -> HealthSettings {
        HealthSettings {
            warmup: Duration::from_millis(10),
            window: Duration::from_millis(20),
            min_downlink_datagrams: 5,
        }
    }

    #[test]
    fn test_evaluate_threshold() {
        let at = |n| ProxyCounters {
            datagrams_down: n,
            ..Default::default()
        };
        assert_eq!(evaluate(&at(10), &at(14), 5), HealthVerdict::Stalled { delta: 4 });
        assert_eq!(evaluate(&at(10), &at(15), 5), HealthVerdict::Healthy { delta: 5 });
        assert_eq!(evaluate(&at(0), &at(0), 5), HealthVerdict::Stalled { delta: 0 });
        assert!(!evaluate(&at(0), &at(0), 0).is_stalled());
    }

    #[tokio::test]
    async fn test_observe_samples_after_warmup() {
        let source = ScriptedCounters::new(&[100, 112]);
        let verdict = HealthMonitor::new(fast()).observe(source.as_ref()).await;
        assert_eq!(verdict, HealthVerdict::Healthy { delta: 12 });
    }

    #[tokio::test]
    async fn test_stall_reported_exactly_once() {
        let source = ScriptedCounters::new(&[7, 9]);
        let (tx, mut rx) = mpsc::channel(4);

        HealthMonitor::new(fast()).spawn(source, tx).await.unwrap();

        assert_eq!(rx.recv().await, Some(HealthVerdict::Stalled { delta: 2 }));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_healthy_reports_nothing() {
        let source = ScriptedCounters::new(&[0, 5]);
        let (tx, mut rx) = mpsc::channel(4);

        HealthMonitor::new(fast()).spawn(source, tx).await.unwrap();

        assert_eq!(rx.recv().await, None);
    }
}
