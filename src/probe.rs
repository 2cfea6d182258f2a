//! Disguise probe
//!
//! Tries every disguise in the catalog once against a server and reports
//! which ones register. Sessions are closed immediately and the selection
//! ledger is left untouched.

use crate::disguise::Catalog;
use crate::tunnel::{Destination, Establisher, TunnelError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Outcome for one disguise
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub id: String,
    pub display_name: String,
    pub ok: bool,
    /// HTTP status when the server answered
    pub status: Option<u16>,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub tested_at: DateTime<Utc>,
}

/// Report header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeMetadata {
    pub destination: String,
    pub timestamp: DateTime<Utc>,
    pub total: usize,
    pub working: usize,
}

/// Full probe report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub metadata: ProbeMetadata,
    pub results: Vec<ProbeResult>,
}

impl ProbeReport {
    /// Ids of disguises that registered
    pub fn working(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| r.ok)
            .map(|r| r.id.as_str())
            .collect()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Write the report as pretty JSON
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let json = self
            .to_json()
            .map_err(|e| crate::Error::Config(format!("Failed to serialize report: {}", e)))?;
        std::fs::write(path, json)?;
        info!("Probe report saved to {}", path.display());
        Ok(())
    }
}

/// Probe every disguise in `catalog`, `cooldown` apart
pub async fn probe(
    destination: &Destination,
    auth_token: &str,
    catalog: &Catalog,
    establisher: &dyn Establisher,
    cooldown: Duration,
) -> ProbeReport {
    let mut results = Vec::with_capacity(catalog.len());

    for (index, disguise) in catalog.list_all().iter().copied().enumerate() {
        if index > 0 {
            tokio::time::sleep(cooldown).await;
        }

        let started = Instant::now();
        let outcome = establisher.establish(destination, disguise, auth_token).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (ok, status, error) = match outcome {
            Ok(session) => {
                let mut stream = session.into_stream();
                let _ = stream.shutdown().await;
                (true, Some(200), None)
            }
            Err(TunnelError::Rejected(code)) => {
                (false, Some(code), Some(TunnelError::Rejected(code).to_string()))
            }
            Err(e) => (false, None, Some(e.to_string())),
        };

        debug!(disguise = %disguise.id, ok, latency_ms, "Probed");

        results.push(ProbeResult {
            id: disguise.id.to_string(),
            display_name: disguise.display_name.to_string(),
            ok,
            status,
            latency_ms,
            error,
            tested_at: Utc::now(),
        });
    }

    let working = results.iter().filter(|r| r.ok).count();
    info!(
        "Probe of {} complete: {}/{} disguises working",
        destination,
        working,
        results.len()
    );

    ProbeReport {
        metadata: ProbeMetadata {
            destination: destination.to_string(),
            timestamp: Utc::now(),
            total: results.len(),
            working,
        },
        results,
    }
}
