//! Repeating heartbeat against the orchestrator.
//!
//! A [`HeartbeatTask`] owns a background tokio task that calls
//! [`ControlChannel::heartbeat`] every `interval`. Remote tasks carried by a response are
//! broadcast to internal subscribers (see [`HeartbeatTask::subscribe`]).
//!
//! Rules:
//! - A failed tick is logged and counted; the loop keeps its schedule.
//! - An installed [`LivenessGate`] that reports "not alive" skips the tick entirely: no request
//!   is sent and nothing is logged above debug.
//! - [`HeartbeatTask::stop`] is synchronous and idempotent. Once it returns no new tick starts;
//!   a request already in flight may still complete, but its tasks are not dispatched.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::ControlChannel;
use crate::types::RemoteTask;

const TASKS_CHANNEL_CAPACITY: usize = 16;

/// Decides whether a heartbeat tick may go out.
///
/// Used when the agent runs next to the process it reports for: if that process is gone, the
/// heartbeat must stop even though the agent itself is alive. May block, it is evaluated on the
/// blocking pool.
pub trait LivenessGate: Send + Sync + 'static {
    fn is_alive(&self) -> bool;
}

impl<F> LivenessGate for F
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    fn is_alive(&self) -> bool {
        self()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Idle,
    Running,
    Stopped,
}

enum RunState {
    Idle,
    Running { cancel: CancellationToken },
    Stopped,
}

/// Handle to a heartbeat loop. Cheap to clone; the loop is cancelled when the last handle is
/// dropped.
#[derive(Clone)]
pub struct HeartbeatTask {
    inner: Arc<HeartbeatInner>,
}

struct HeartbeatInner {
    channel: ControlChannel,
    instance_id: String,
    interval: Duration,
    gate: Option<Arc<dyn LivenessGate>>,
    tasks_tx: broadcast::Sender<Vec<RemoteTask>>,
    state: Mutex<RunState>,
}

impl HeartbeatTask {
    pub fn new(
        channel: ControlChannel,
        instance_id: impl Into<String>,
        interval: Duration,
        gate: Option<Arc<dyn LivenessGate>>,
    ) -> Self {
        let (tasks_tx, _) = broadcast::channel(TASKS_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(HeartbeatInner {
                channel,
                instance_id: instance_id.into(),
                interval,
                gate,
                tasks_tx,
                state: Mutex::new(RunState::Idle),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn state(&self) -> HeartbeatState {
        match *self.inner.state.lock() {
            RunState::Idle => HeartbeatState::Idle,
            RunState::Running { .. } => HeartbeatState::Running,
            RunState::Stopped => HeartbeatState::Stopped,
        }
    }

    /// Receive every non-empty task list returned by the orchestrator.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<RemoteTask>> {
        self.inner.tasks_tx.subscribe()
    }

    /// Start ticking. No-op if already running. Must be called within a tokio runtime.
    pub fn start(&self) {
        let mut state = self.inner.state.lock();
        if matches!(*state, RunState::Running { .. }) {
            return;
        }

        let cancel = CancellationToken::new();
        let ticker = Ticker {
            channel: self.inner.channel.clone(),
            instance_id: self.inner.instance_id.clone(),
            interval: self.inner.interval,
            gate: self.inner.gate.clone(),
            tasks_tx: self.inner.tasks_tx.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(ticker.run());

        debug!(
            instance_id = %self.inner.instance_id,
            interval_ms = self.inner.interval.as_millis() as u64,
            "heartbeat started"
        );
        *state = RunState::Running { cancel };
    }

    /// Stop ticking. Safe to call from any thread, any number of times.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        if let RunState::Running { cancel } = &*state {
            cancel.cancel();
            *state = RunState::Stopped;
            debug!(instance_id = %self.inner.instance_id, "heartbeat stopped");
        }
    }
}

impl Drop for HeartbeatInner {
    fn drop(&mut self) {
        if let RunState::Running { cancel } = &*self.state.get_mut() {
            cancel.cancel();
        }
    }
}

/// State moved into the spawned loop. Holds no reference back to the handle so that dropping
/// the last handle ends the loop.
struct Ticker {
    channel: ControlChannel,
    instance_id: String,
    interval: Duration,
    gate: Option<Arc<dyn LivenessGate>>,
    tasks_tx: broadcast::Sender<Vec<RemoteTask>>,
    cancel: CancellationToken,
}

impl Ticker {
    async fn run(self) {
        // First tick fires one interval after start.
        let mut interval = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.tick().await;
        }
    }

    async fn tick(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        let gate_open = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            open = self.gate_open() => open,
        };
        if !gate_open {
            metrics::counter!("orchestrator_heartbeats_total", "outcome" => "skipped").increment(1);
            debug!(instance_id = %self.instance_id, "liveness gate closed, skipping heartbeat");
            return;
        }
        // stop() may have returned while the gate was evaluated.
        if self.cancel.is_cancelled() {
            return;
        }

        match self.channel.heartbeat(&self.instance_id).await {
            Ok(tasks) => {
                metrics::counter!("orchestrator_heartbeats_total", "outcome" => "ok").increment(1);
                if tasks.is_empty() || self.cancel.is_cancelled() {
                    return;
                }
                debug!(
                    instance_id = %self.instance_id,
                    count = tasks.len(),
                    "received remote tasks"
                );
                if let Err(e) = self.tasks_tx.send(tasks) {
                    debug!(dropped = e.0.len(), "no subscribers for remote tasks");
                }
            }
            Err(error) => {
                metrics::counter!("orchestrator_heartbeats_total", "outcome" => "error")
                    .increment(1);
                warn!(
                    instance_id = %self.instance_id,
                    timeout = error.is_timeout(),
                    %error,
                    "error sending heartbeat"
                );
            }
        }
    }

    async fn gate_open(&self) -> bool {
        let Some(gate) = self.gate.clone() else {
            return true;
        };
        match tokio::task::spawn_blocking(move || gate.is_alive()).await {
            Ok(alive) => alive,
            Err(error) => {
                warn!(%error, "liveness gate panicked, skipping heartbeat");
                false
            }
        }
    }
}
