use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::engine::store::WorkflowStore;
use crate::engine::types::{ChangeEvent, ChangeKind, ProcessStatus};
use crate::probes::{ProbeError, ProcessStatusProvider};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// What the process provider said about one workflow this tick.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Reported(ProcessStatus),
    /// The provider has no process for the execution handle.
    UnknownExecution,
    /// No provider, no handle, or the lookup failed or timed out.
    NoData,
}

/// Periodic refresh of derived fields for running workflows.
pub struct RealtimeTicker {
    provider: Option<Arc<dyn ProcessStatusProvider>>,
    probe_timeout: Duration,
}

impl RealtimeTicker {
    pub fn new(provider: Option<Arc<dyn ProcessStatusProvider>>, probe_timeout: Duration) -> Self {
        Self {
            provider,
            probe_timeout,
        }
    }

    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    /// Ask the provider about every `(workflow, execution handle)` target.
    /// Lookups run concurrently, each bounded by the probe timeout, so one
    /// pass takes at most a single timeout.
    pub async fn probe(&self, targets: &[(String, Option<String>)]) -> HashMap<String, ProbeOutcome> {
        let lookups = targets
            .iter()
            .map(|(name, handle)| async move { (name.clone(), self.probe_one(name, handle.as_deref()).await) });

        join_all(lookups).await.into_iter().collect()
    }

    async fn probe_one(&self, name: &str, handle: Option<&str>) -> ProbeOutcome {
        let (Some(provider), Some(handle)) = (&self.provider, handle) else {
            return ProbeOutcome::NoData;
        };

        let lookup = tokio::time::timeout(self.probe_timeout, provider.status(handle)).await;
        match lookup.unwrap_or(Err(ProbeError::Timeout(self.probe_timeout))) {
            Ok(Some(status)) => ProbeOutcome::Reported(status),
            Ok(None) => ProbeOutcome::UnknownExecution,
            Err(e) => {
                warn!(workflow = %name, execution = %handle, error = %e, "Process status lookup failed");
                ProbeOutcome::NoData
            }
        }
    }

    /// Apply probe results and return one event per running record.
    ///
    /// Every running record gets a `metrics` heartbeat so elapsed time keeps
    /// moving for observers; records whose worker died get an `end` event.
    pub fn apply(
        &self,
        store: &mut WorkflowStore,
        outcomes: &HashMap<String, ProbeOutcome>,
        now: DateTime<Utc>,
    ) -> Vec<ChangeEvent> {
        let running: Vec<String> = store
            .running_probes()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        let mut events = Vec::with_capacity(running.len());

        for name in running {
            store.refresh_duration(&name, now);

            let mut kind = ChangeKind::Metrics;
            match outcomes.get(&name) {
                Some(ProbeOutcome::Reported(status)) => {
                    store.record_process_status(&name, status.clone());
                    if !status.running {
                        if store.mark_process_died(&name, now) {
                            kind = ChangeKind::End;
                        }
                    } else if !status.sub_agent_alive {
                        store.mark_waiting_for_agent(&name);
                    }
                }
                Some(ProbeOutcome::UnknownExecution) => {
                    store.record_process_status(&name, ProcessStatus::default());
                }
                Some(ProbeOutcome::NoData) | None => {}
            }

            if let Some(record) = store.snapshot_one(&name) {
                events.push(ChangeEvent::for_record(kind, &record, now));
            }
        }

        if !events.is_empty() {
            debug!(records = events.len(), "Realtime tick");
        }
        events
    }
}
