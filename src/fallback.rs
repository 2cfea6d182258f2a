//! Protocol fallback driver
//!
//! Walks the ledger's candidate order through the establisher until one
//! disguise registers, recording every outcome before moving on.

use crate::disguise::DisguiseProfile;
use crate::ledger::SelectionLedger;
use crate::tunnel::{Destination, Establisher, TunnelError, TunnelSession};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default pause between two candidates
pub const DEFAULT_ATTEMPT_COOLDOWN: Duration = Duration::from_secs(2);

/// One failed candidate
#[derive(Debug)]
pub struct AttemptFailure {
    pub disguise_id: &'static str,
    pub error: TunnelError,
}

/// Every candidate was tried and none registered
#[derive(Debug, Error)]
#[error("All {} disguise attempt(s) to {host} failed: {}", .attempts.len(), summary(.attempts))]
pub struct AllAttemptsFailed {
    pub host: String,
    pub attempts: Vec<AttemptFailure>,
}

impl AllAttemptsFailed {
    /// Compact per-candidate reasons, e.g. `https: Timeout; zoom: ...`
    pub fn summary(&self) -> String {
        summary(&self.attempts)
    }
}

fn summary(attempts: &[AttemptFailure]) -> String {
    attempts
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.disguise_id, self.error)
    }
}

/// Drives the establisher through the candidate order
#[derive(Clone)]
pub struct FallbackDriver {
    establisher: Arc<dyn Establisher>,
    ledger: Arc<SelectionLedger>,
    cooldown: Duration,
    mimicry_enabled: bool,
}

impl FallbackDriver {
    pub fn new(establisher: Arc<dyn Establisher>, ledger: Arc<SelectionLedger>) -> Self {
        Self {
            establisher,
            ledger,
            cooldown: DEFAULT_ATTEMPT_COOLDOWN,
            mimicry_enabled: true,
        }
    }

    /// Pause between candidates
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// With mimicry off only the canonical disguise is tried
    pub fn with_mimicry(mut self, enabled: bool) -> Self {
        self.mimicry_enabled = enabled;
        self
    }

    pub fn ledger(&self) -> &Arc<SelectionLedger> {
        &self.ledger
    }

    /// Register with the first disguise that works
    pub async fn connect(
        &self,
        destination: &Destination,
        auth_token: &str,
    ) -> Result<TunnelSession, AllAttemptsFailed> {
        if !self.mimicry_enabled {
            return self.connect_canonical(destination, auth_token).await;
        }

        let candidates = self.ledger.best_first_order(&destination.host);
        let mut attempts = Vec::with_capacity(candidates.len());

        for (index, disguise) in candidates.iter().copied().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.cooldown).await;
            }

            debug!(
                host = %destination.host,
                disguise = %disguise.id,
                "Attempt {}/{}",
                index + 1,
                candidates.len()
            );

            match self.establisher.establish(destination, disguise, auth_token).await {
                Ok(session) => {
                    self.record(destination, disguise, true).await;
                    info!(host = %destination.host, disguise = %disguise.id, "Tunnel registered");
                    return Ok(session);
                }
                Err(error) => {
                    warn!(host = %destination.host, disguise = %disguise.id, "Attempt failed: {}", error);
                    self.record(destination, disguise, false).await;
                    attempts.push(AttemptFailure {
                        disguise_id: disguise.id,
                        error,
                    });
                }
            }
        }

        Err(AllAttemptsFailed {
            host: destination.host.clone(),
            attempts,
        })
    }

    async fn connect_canonical(
        &self,
        destination: &Destination,
        auth_token: &str,
    ) -> Result<TunnelSession, AllAttemptsFailed> {
        let disguise = self.ledger.catalog().canonical();
        debug!(host = %destination.host, disguise = %disguise.id, "Mimicry disabled, single attempt");

        self.establisher
            .establish(destination, disguise, auth_token)
            .await
            .map_err(|error| AllAttemptsFailed {
                host: destination.host.clone(),
                attempts: vec![AttemptFailure {
                    disguise_id: disguise.id,
                    error,
                }],
            })
    }

    /// Ledger writes are file I/O, so they run on the blocking pool
    async fn record(&self, destination: &Destination, disguise: &'static DisguiseProfile, success: bool) {
        let ledger = self.ledger.clone();
        let host = destination.host.clone();
        let id = disguise.id;

        let result = tokio::task::spawn_blocking(move || {
            if success {
                ledger.record_success(&host, id)
            } else {
                ledger.record_failure(&host, id)
            }
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to persist selection ledger: {}", e),
            Err(e) => warn!("Selection ledger write did not complete: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disguise::Catalog;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Establisher that succeeds only for the listed disguise ids
    struct ScriptedEstablisher {
        accept: HashSet<&'static str>,
        calls: Mutex<Vec<(&'static str, Instant)>>,
    }

    impl ScriptedEstablisher {
        fn accepting(ids: &[&'static str]) -> Self {
            Self {
                accept: ids.iter().copied().collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn called_ids(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().iter().map(|(id, _)| *id).collect()
        }
    }

    #[async_trait]
    impl Establisher for ScriptedEstablisher {
        async fn establish(
            &self,
            _destination: &Destination,
            disguise: &'static DisguiseProfile,
            _auth_token: &str,
        ) -> Result<TunnelSession, TunnelError> {
            self.calls.lock().unwrap().push((disguise.id, Instant::now()));
            if self.accept.contains(disguise.id) {
                let (stream, _peer) = tokio::io::duplex(1024);
                Ok(TunnelSession::new(disguise, Box::new(stream)))
            } else {
                Err(TunnelError::Rejected(403))
            }
        }
    }

    fn destination() -> Destination {
        Destination::parse("vpn.example.com", 8443).unwrap()
    }

    fn driver(establisher: Arc<ScriptedEstablisher>, ledger: Arc<SelectionLedger>) -> FallbackDriver {
        FallbackDriver::new(establisher, ledger).with_cooldown(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_first_success_wins() {
        let order: Vec<&str> = Catalog::builtin().list_all().iter().map(|p| p.id).collect();
        let k = 4;
        let establisher = Arc::new(ScriptedEstablisher::accepting(&[order[k - 1], order[k]]));
        let ledger = Arc::new(SelectionLedger::in_memory(Catalog::builtin()));

        let session = driver(establisher.clone(), ledger.clone())
            .connect(&destination(), "t")
            .await
            .unwrap();

        assert_eq!(session.disguise().id, order[k - 1]);
        assert_eq!(establisher.called_ids(), order[..k].to_vec());

        let host = &destination().host;
        for id in &order[..k - 1] {
            assert_eq!(ledger.stats(host, id).failure_count, 1);
            assert_eq!(ledger.stats(host, id).success_count, 0);
        }
        assert_eq!(ledger.stats(host, order[k - 1]).success_count, 1);
        assert_eq!(ledger.stats(host, order[k]), Default::default());
    }

    #[tokio::test]
    async fn test_reconnect_prefers_last_success() {
        let establisher = Arc::new(ScriptedEstablisher::accepting(&["zoom"]));
        let ledger = Arc::new(SelectionLedger::in_memory(Catalog::builtin()));
        let driver = driver(establisher.clone(), ledger);

        driver.connect(&destination(), "t").await.unwrap();
        establisher.calls.lock().unwrap().clear();

        driver.connect(&destination(), "t").await.unwrap();
        assert_eq!(establisher.called_ids(), vec!["zoom"]);
    }

    #[tokio::test]
    async fn test_outcomes_reach_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("selection.json");
        let establisher = Arc::new(ScriptedEstablisher::accepting(&["teams"]));
        let ledger = Arc::new(SelectionLedger::open_file(Catalog::builtin(), &path).unwrap());

        driver(establisher, ledger)
            .connect(&destination(), "t")
            .await
            .unwrap();

        let host = &destination().host;
        let reopened = SelectionLedger::open_file(Catalog::builtin(), &path).unwrap();
        assert_eq!(reopened.stats(host, "https").failure_count, 1);
        assert_eq!(reopened.stats(host, "teams").success_count, 1);
        assert_eq!(reopened.best_first_order(host)[0].id, "teams");
    }

    #[tokio::test]
    async fn test_cooldown_between_attempts() {
        let cooldown = Duration::from_millis(50);
        let establisher = Arc::new(ScriptedEstablisher::accepting(&[]));
        let ledger = Arc::new(SelectionLedger::in_memory(
            Catalog::with_enabled(&["https", "teams", "zoom"]).unwrap(),
        ));
        let driver = FallbackDriver::new(establisher.clone(), ledger).with_cooldown(cooldown);

        let started = Instant::now();
        let err = driver.connect(&destination(), "t").await.unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err.attempts.len(), 3);
        let calls = establisher.calls.lock().unwrap().clone();
        for pair in calls.windows(2) {
            assert!(pair[1].1.duration_since(pair[0].1) >= cooldown);
        }
        // No cooldown after the last candidate
        assert!(elapsed < cooldown * 3);
    }

    #[tokio::test]
    async fn test_all_attempts_failed_summary() {
        let establisher = Arc::new(ScriptedEstablisher::accepting(&[]));
        let ledger = Arc::new(SelectionLedger::in_memory(
            Catalog::with_enabled(&["https", "doh"]).unwrap(),
        ));

        let err = driver(establisher, ledger)
            .connect(&destination(), "t")
            .await
            .unwrap_err();
        assert_eq!(err.host, "vpn.example.com");
        assert_eq!(
            err.summary(),
            "https: Registration rejected with status 403; doh: Registration rejected with status 403"
        );
        assert!(err.to_string().starts_with("All 2 disguise attempt(s)"));
    }

    #[tokio::test]
    async fn test_mimicry_disabled_single_canonical_attempt() {
        let establisher = Arc::new(ScriptedEstablisher::accepting(&["teams"]));
        let ledger = Arc::new(SelectionLedger::in_memory(Catalog::builtin()));

        let err = driver(establisher.clone(), ledger.clone())
            .with_mimicry(false)
            .connect(&destination(), "t")
            .await
            .unwrap_err();

        assert_eq!(establisher.called_ids(), vec!["https"]);
        assert_eq!(err.attempts.len(), 1);
        assert!(ledger.hosts().is_empty());
    }
}
