use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::aggregator::Aggregator;
use crate::engine::eviction::SweepReport;
use crate::engine::hub::{SubscriberId, Subscription};
use crate::engine::types::*;

/// Periods of the background tasks run by the service loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSettings {
    pub sweep_interval: Duration,
    pub tick_interval: Duration,
    pub liveness_interval: Duration,
    pub command_buffer: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(120),
            tick_interval: Duration::from_secs(1),
            liveness_interval: Duration::from_secs(30),
            command_buffer: 1024,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("aggregator service has stopped")]
    Stopped,
}

enum Command {
    Start {
        name: String,
        total_steps: u32,
        execution_id: Option<String>,
        correlation_seed: Option<String>,
        reply: oneshot::Sender<WorkflowHandle>,
    },
    Apply {
        event: LifecycleEvent,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<WorkflowRecord>>,
    },
    SnapshotOne {
        name: String,
        reply: oneshot::Sender<Option<WorkflowRecord>>,
    },
    Delete {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    Subscribe {
        reply: oneshot::Sender<Subscription>,
    },
    Unsubscribe {
        id: SubscriberId,
        reply: oneshot::Sender<bool>,
    },
    Sweep {
        reply: oneshot::Sender<SweepReport>,
    },
    Tick {
        reply: oneshot::Sender<usize>,
    },
}

/// Runs an [`Aggregator`] on a single task.
///
/// Commands, the eviction sweep, the realtime tick and the subscriber
/// liveness sweep are all branches of one `select!` loop, so each runs to
/// completion before the next starts.
pub struct AggregatorService;

impl AggregatorService {
    pub fn spawn(aggregator: Aggregator, settings: ServiceSettings) -> AggregatorHandle {
        let (tx, rx) = mpsc::channel(settings.command_buffer.max(1));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(aggregator, rx, settings, cancel.clone()));

        AggregatorHandle {
            tx,
            cancel,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }
}

fn every(period: Duration) -> tokio::time::Interval {
    // First tick one period from now, not immediately.
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn run(
    mut aggregator: Aggregator,
    mut rx: mpsc::Receiver<Command>,
    settings: ServiceSettings,
    cancel: CancellationToken,
) {
    let mut sweep = every(settings.sweep_interval);
    let mut tick = every(settings.tick_interval);
    let mut liveness = every(settings.liveness_interval);

    info!(
        sweep_secs = settings.sweep_interval.as_secs_f64(),
        tick_ms = settings.tick_interval.as_millis() as u64,
        "Aggregator service started"
    );

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            command = rx.recv() => match command {
                Some(command) => handle(&mut aggregator, command).await,
                None => {
                    debug!("All aggregator handles dropped");
                    break;
                }
            },
            _ = sweep.tick() => {
                aggregator.sweep();
            }
            _ = tick.tick() => {
                aggregator.tick().await;
            }
            _ = liveness.tick() => {
                aggregator.sweep_subscribers();
            }
        }
    }

    aggregator.shutdown();
    info!("Aggregator service stopped");
}

async fn handle(aggregator: &mut Aggregator, command: Command) {
    // A dropped reply receiver only means the caller stopped waiting.
    match command {
        Command::Start {
            name,
            total_steps,
            execution_id,
            correlation_seed,
            reply,
        } => {
            let handle = aggregator.start(&name, total_steps, execution_id, correlation_seed.as_deref());
            let _ = reply.send(handle);
        }
        Command::Apply { event, reply } => {
            let _ = reply.send(aggregator.apply(event));
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(aggregator.snapshot());
        }
        Command::SnapshotOne { name, reply } => {
            let _ = reply.send(aggregator.snapshot_one(&name));
        }
        Command::Delete { name, reply } => {
            let _ = reply.send(aggregator.delete(&name));
        }
        Command::Subscribe { reply } => {
            let _ = reply.send(aggregator.subscribe());
        }
        Command::Unsubscribe { id, reply } => {
            let _ = reply.send(aggregator.unsubscribe(id));
        }
        Command::Sweep { reply } => {
            let _ = reply.send(aggregator.sweep());
        }
        Command::Tick { reply } => {
            let _ = reply.send(aggregator.tick().await);
        }
    }
}

/// Cloneable front door to a running [`AggregatorService`].
#[derive(Clone)]
pub struct AggregatorHandle {
    tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl AggregatorHandle {
    pub async fn start(
        &self,
        name: &str,
        total_steps: u32,
        execution_id: Option<String>,
        correlation_seed: Option<String>,
    ) -> Result<WorkflowHandle, ServiceError> {
        self.request(|reply| Command::Start {
            name: name.to_string(),
            total_steps,
            execution_id,
            correlation_seed,
            reply,
        })
        .await
    }

    /// Apply an inbound event. `Ok(false)` when the workflow is unknown.
    pub async fn apply(&self, event: LifecycleEvent) -> Result<bool, ServiceError> {
        self.request(|reply| Command::Apply { event, reply }).await
    }

    pub async fn step_update(&self, name: &str, step: &str, status: StepStatus) -> Result<bool, ServiceError> {
        self.apply(LifecycleEvent::Step {
            name: name.to_string(),
            step: step.to_string(),
            status,
        })
        .await
    }

    pub async fn patch_metrics(&self, name: &str, fields: MetricsPatch) -> Result<bool, ServiceError> {
        self.apply(LifecycleEvent::Metrics {
            name: name.to_string(),
            fields,
        })
        .await
    }

    pub async fn end(
        &self,
        name: &str,
        result: WorkflowResult,
        duration_ms: Option<i64>,
    ) -> Result<bool, ServiceError> {
        self.apply(LifecycleEvent::End {
            name: name.to_string(),
            result,
            duration_ms,
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<Vec<WorkflowRecord>, ServiceError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn snapshot_one(&self, name: &str) -> Result<Option<WorkflowRecord>, ServiceError> {
        self.request(|reply| Command::SnapshotOne {
            name: name.to_string(),
            reply,
        })
        .await
    }

    pub async fn delete(&self, name: &str) -> Result<bool, ServiceError> {
        self.request(|reply| Command::Delete {
            name: name.to_string(),
            reply,
        })
        .await
    }

    pub async fn subscribe(&self) -> Result<Subscription, ServiceError> {
        self.request(|reply| Command::Subscribe { reply }).await
    }

    pub async fn unsubscribe(&self, id: SubscriberId) -> Result<bool, ServiceError> {
        self.request(|reply| Command::Unsubscribe { id, reply }).await
    }

    /// Run an eviction sweep now instead of waiting for the timer.
    pub async fn sweep_now(&self) -> Result<SweepReport, ServiceError> {
        self.request(|reply| Command::Sweep { reply }).await
    }

    /// Run a realtime tick now instead of waiting for the timer.
    pub async fn tick_now(&self) -> Result<usize, ServiceError> {
        self.request(|reply| Command::Tick { reply }).await
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// Stop the timers, close every subscriber and clear the store.
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(error = %e, "Aggregator task ended abnormally");
        }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, ServiceError> {
        if self.cancel.is_cancelled() {
            return Err(ServiceError::Stopped);
        }
        let (reply, response) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| ServiceError::Stopped)?;
        response.await.map_err(|_| ServiceError::Stopped)
    }
}
