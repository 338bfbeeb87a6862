use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use relay_llm::LivenessProbe;
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

/// Backend reachability as last observed. Starts `Offline` until the first
/// probe resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectivityStatus {
    Online,
    #[default]
    Offline,
}

impl ConnectivityStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Online => "Online",
            Self::Offline => "Offline",
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, Self::Online)
    }
}

struct HeartbeatTask {
    cancel_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Probes backend liveness on a fixed interval.
///
/// Every tick spawns its own probe, so a slow probe never delays the next
/// one. Probes may overlap; whichever resolves last sets the status.
pub struct HeartbeatMonitor {
    probe: Arc<dyn LivenessProbe>,
    interval: Duration,
    status: Arc<watch::Sender<ConnectivityStatus>>,
    task: Mutex<Option<HeartbeatTask>>,
}

impl HeartbeatMonitor {
    pub fn new(probe: Arc<dyn LivenessProbe>, interval: Duration) -> Self {
        let (status, _) = watch::channel(ConnectivityStatus::default());
        Self {
            probe,
            interval,
            status: Arc::new(status),
            task: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn status(&self) -> ConnectivityStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityStatus> {
        self.status.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.lock_task().is_some()
    }

    /// Starts the recurring probe timer. Must be called inside a tokio
    /// runtime; calling it again while running does nothing.
    pub fn start(&self) {
        let mut task = self.lock_task();
        if task.is_some() {
            return;
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let handle = tokio::spawn(run_heartbeat(
            Arc::clone(&self.probe),
            Arc::clone(&self.status),
            self.interval,
            cancel_rx,
        ));
        *task = Some(HeartbeatTask { cancel_tx, handle });

        tracing::info!(interval_ms = self.interval.as_millis() as u64, "heartbeat started");
    }

    /// Stops the timer and aborts probes still in flight.
    pub async fn shutdown(&self) {
        let task = self.lock_task().take();
        let Some(task) = task else {
            return;
        };

        let _ = task.cancel_tx.send(());
        if let Err(error) = task.handle.await {
            tracing::warn!(error = %error, "heartbeat task ended abnormally");
        }
        tracing::info!("heartbeat stopped");
    }

    /// Runs one probe right now and records its outcome.
    pub async fn tick(&self) -> ConnectivityStatus {
        let next = probe_status(self.probe.as_ref()).await;
        record_status(&self.status, next);
        next
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<HeartbeatTask>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.lock_task().take() {
            task.handle.abort();
        }
    }
}

async fn run_heartbeat(
    probe: Arc<dyn LivenessProbe>,
    status: Arc<watch::Sender<ConnectivityStatus>>,
    interval: Duration,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut probes = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut cancel_rx => break,
            _ = ticker.tick() => {
                let probe = Arc::clone(&probe);
                let status = Arc::clone(&status);
                probes.spawn(async move {
                    let next = probe_status(probe.as_ref()).await;
                    record_status(&status, next);
                });
            }
            Some(joined) = probes.join_next(), if !probes.is_empty() => {
                if let Err(error) = joined {
                    tracing::warn!(error = %error, "heartbeat probe task failed");
                }
            }
        }
    }

    probes.shutdown().await;
}

async fn probe_status(probe: &dyn LivenessProbe) -> ConnectivityStatus {
    match probe.probe().await {
        Ok(()) => ConnectivityStatus::Online,
        Err(error) => {
            tracing::debug!(stage = error.stage(), error = %error, "heartbeat probe failed");
            ConnectivityStatus::Offline
        }
    }
}

fn record_status(status: &watch::Sender<ConnectivityStatus>, next: ConnectivityStatus) {
    let previous = status.send_replace(next);
    if previous != next {
        tracing::info!(status = next.label(), "backend connectivity changed");
    }
}
