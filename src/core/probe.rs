/// Health checking for the target database engine
///
/// Every entry point probes the server before doing any work; an unreachable
/// server is fatal for the calling operation and is never retried.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::engine::DatabaseEngine;
use crate::core::error::{BackupError, BackupResult};

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Reachable { latency: Duration },
    Unreachable(String),
}

pub struct ConnectionProbe {
    engine: Arc<dyn DatabaseEngine>,
    target: String,
    timeout: Duration,
}

impl ConnectionProbe {
    pub fn new(engine: Arc<dyn DatabaseEngine>, target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            engine,
            target: target.into(),
            timeout,
        }
    }

    /// Run one round-trip query bounded by the probe timeout
    pub async fn probe(&self) -> ProbeOutcome {
        let started = Instant::now();

        match tokio::time::timeout(self.timeout, self.engine.ping()).await {
            Ok(Ok(())) => {
                let latency = started.elapsed();
                tracing::debug!(server = %self.target, latency_ms = latency.as_millis() as u64, "database reachable");
                ProbeOutcome::Reachable { latency }
            }
            Ok(Err(e)) => {
                tracing::warn!(server = %self.target, error = %e, "database probe failed");
                ProbeOutcome::Unreachable(e.to_string())
            }
            Err(_) => {
                tracing::warn!(server = %self.target, timeout_secs = self.timeout.as_secs(), "database probe timed out");
                ProbeOutcome::Unreachable(format!(
                    "no response within {}",
                    humantime::format_duration(self.timeout)
                ))
            }
        }
    }

    /// Probe and turn an unreachable server into a `Connection` error
    pub async fn require(&self) -> BackupResult<Duration> {
        match self.probe().await {
            ProbeOutcome::Reachable { latency } => Ok(latency),
            ProbeOutcome::Unreachable(reason) => Err(BackupError::Connection {
                target: self.target.clone(),
                reason,
            }),
        }
    }
}
