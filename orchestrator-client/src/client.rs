use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::attributes::{init_data_from_env, Attributes, Registration};
use crate::channel::ControlChannel;
use crate::error::ClientError;
use crate::events::{EventBus, LifecycleEvent, DEFAULT_EVENT_CAPACITY};
use crate::heartbeat::{HeartbeatTask, LivenessGate};
use crate::identity::{DeviceIdentity, InstanceIdentity, DEFAULT_MACHINE_ID_PATH};
use crate::modules::ModuleActivator;
use crate::statsd::MetricsLogger;
use crate::types::{InstanceConfig, RemoteTask};

/// Builder for [`OrchestratorClient`].
pub struct ClientBuilder {
    url: String,
    secret: String,
    init_data: Option<Attributes>,
    liveness_gate: Option<Arc<dyn LivenessGate>>,
    request_timeout: Option<Duration>,
    machine_id_path: PathBuf,
    event_capacity: usize,
}

impl ClientBuilder {
    pub fn new(url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            secret: secret.into(),
            init_data: None,
            liveness_gate: None,
            request_timeout: None,
            machine_id_path: PathBuf::from(DEFAULT_MACHINE_ID_PATH),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Attributes used when `init` is called without any. Without this, `init` falls back to
    /// `ORCHESTRATOR_INIT_DATA`.
    pub fn with_init_data(mut self, init_data: Attributes) -> Self {
        self.init_data = Some(init_data);
        self
    }

    /// Evaluated before every heartbeat tick; a closed gate skips the tick.
    pub fn with_liveness_gate(mut self, gate: impl LivenessGate) -> Self {
        self.liveness_gate = Some(Arc::new(gate));
        self
    }

    /// Per-request timeout for every control call. Unset means the transport default.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_machine_id_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.machine_id_path = path.into();
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<OrchestratorClient, ClientError> {
        let channel = ControlChannel::new(&self.url, &self.secret, self.request_timeout)?;
        Ok(OrchestratorClient {
            inner: Arc::new(ClientInner {
                channel,
                identity: DeviceIdentity::new(self.machine_id_path),
                init_data: self.init_data,
                liveness_gate: self.liveness_gate,
                init_lock: tokio::sync::Mutex::new(()),
                state: RwLock::new(InitState::default()),
                heartbeat: Mutex::new(None),
                metrics: MetricsLogger::new(),
                events: EventBus::new(self.event_capacity),
                exit_emitted: AtomicBool::new(false),
                destroyed: CancellationToken::new(),
            }),
        })
    }
}

/// Registers this service instance with the orchestrator and keeps it alive.
///
/// `init` runs the one-time setup (identity, registration, configuration, modules) and fails
/// on the first error. A failed `init` can be retried on the same client; after one succeeds,
/// further calls return [`ClientError::AlreadyInitialized`]. From then on, everything runs in
/// the background: heartbeats, remote task dispatch and, on a remote `exit`, self-destruction.
/// `destroy` is the single teardown entry point and may be called from anywhere, any number of
/// times.
///
/// Cheap to clone; all clones share the same instance.
#[derive(Clone)]
pub struct OrchestratorClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    channel: ControlChannel,
    identity: DeviceIdentity,
    init_data: Option<Attributes>,
    liveness_gate: Option<Arc<dyn LivenessGate>>,
    /// Held for the whole of `init`, so two calls never interleave.
    init_lock: tokio::sync::Mutex<()>,
    state: RwLock<InitState>,
    heartbeat: Mutex<Option<HeartbeatTask>>,
    metrics: MetricsLogger,
    events: EventBus,
    exit_emitted: AtomicBool,
    destroyed: CancellationToken,
}

/// What `init` has established so far. `config` is only set once `init` succeeded; a
/// registration without a config belongs to an `init` that failed and may be retried.
#[derive(Default)]
struct InitState {
    instance: Option<InstanceIdentity>,
    registration: Option<Registration>,
    config: Option<InstanceConfig>,
}

impl OrchestratorClient {
    pub fn builder(url: impl Into<String>, secret: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(url, secret)
    }

    pub fn new(url: impl Into<String>, secret: impl Into<String>) -> Result<Self, ClientError> {
        ClientBuilder::new(url, secret).build()
    }

    /// Register this instance and activate the modules the orchestrator configures for it.
    ///
    /// `attributes` default to the builder's init data (or `ORCHESTRATOR_INIT_DATA`), and
    /// `suffix` defaults to the port. Returns the fetched configuration, which is also
    /// published as [`LifecycleEvent::Init`].
    pub async fn init(
        &self,
        port: Option<u16>,
        attributes: Option<Attributes>,
        suffix: Option<&str>,
    ) -> Result<InstanceConfig, ClientError> {
        let _init = self.inner.init_lock.lock().await;
        if let Some(instance_id) = self.initialized_instance_id() {
            return Err(ClientError::AlreadyInitialized(instance_id));
        }

        let attributes = match attributes {
            Some(attributes) => attributes,
            None => self.resolve_init_data()?,
        };
        let port = port.ok_or(ClientError::RegistrationRequired)?;
        let suffix = suffix.map_or_else(|| port.to_string(), str::to_owned);

        let identity = self.inner.identity.compute_instance_id(&suffix)?;
        let instance_id = identity.instance_id.clone();

        let registration = Registration::new(instance_id.as_str(), Some(port), attributes)?;
        self.inner
            .channel
            .register(&registration)
            .await
            .map_err(ClientError::RegistrationFailed)?;
        info!(instance_id = %instance_id, port, "registered instance");
        {
            let mut state = self.inner.state.write();
            state.instance = Some(identity);
            state.registration = Some(registration);
        }

        let config = self
            .inner
            .channel
            .fetch_config(&instance_id)
            .await
            .map_err(ClientError::ConfigUnavailable)?;
        debug!(instance_id = %instance_id, modules = config.modules.len(), "fetched config");

        let activated = ModuleActivator::new(
            &self.inner.channel,
            &instance_id,
            self.inner.liveness_gate.clone(),
            &self.inner.metrics,
        )
        .activate(&config.modules)
        .await;

        if let Some(heartbeat) = activated.heartbeat {
            let previous = self.inner.heartbeat.lock().replace(heartbeat);
            if let Some(previous) = previous {
                previous.stop();
            }
        }
        if let Some(tasks_rx) = activated.heartbeat_tasks {
            spawn_task_dispatch(Arc::downgrade(&self.inner), tasks_rx);
        }

        self.inner.state.write().config = Some(config.clone());
        self.inner
            .events
            .publish(LifecycleEvent::Init(config.clone()));
        Ok(config)
    }

    /// Stop the heartbeat and unregister from the orchestrator. Never fails; calling it again
    /// repeats the (best-effort) unregister call.
    pub async fn destroy(&self) {
        let heartbeat = self.inner.heartbeat.lock().take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.stop();
        }

        let registered = self
            .inner
            .state
            .read()
            .registration
            .as_ref()
            .map(|registration| registration.instance_id.clone());
        match registered {
            Some(instance_id) => self.inner.channel.unregister(&instance_id).await,
            None => debug!("instance was never registered, nothing to unregister"),
        }

        self.inner.destroyed.cancel();
        info!(instance_id = %self.instance_id().unwrap_or_default(), "client destroyed");
    }

    /// Resolves once `destroy` has completed at least once.
    pub async fn destroyed(&self) {
        self.inner.destroyed.cancelled().await
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events.subscribe()
    }

    pub fn metrics(&self) -> &MetricsLogger {
        &self.inner.metrics
    }

    /// Set once the orchestrator accepted the registration.
    pub fn identity(&self) -> Option<InstanceIdentity> {
        self.inner.state.read().instance.clone()
    }

    pub fn instance_id(&self) -> Option<String> {
        let state = self.inner.state.read();
        state
            .instance
            .as_ref()
            .map(|identity| identity.instance_id.clone())
    }

    /// The registration request actually sent, placeholders already substituted.
    pub fn registration(&self) -> Option<Registration> {
        self.inner.state.read().registration.clone()
    }

    /// Set once `init` succeeded.
    pub fn config(&self) -> Option<InstanceConfig> {
        self.inner.state.read().config.clone()
    }

    pub fn heartbeat_task(&self) -> Option<HeartbeatTask> {
        self.inner.heartbeat.lock().clone()
    }

    fn initialized_instance_id(&self) -> Option<String> {
        let state = self.inner.state.read();
        state.config.as_ref()?;
        state
            .instance
            .as_ref()
            .map(|identity| identity.instance_id.clone())
    }

    fn resolve_init_data(&self) -> Result<Attributes, ClientError> {
        match &self.inner.init_data {
            Some(init_data) => Ok(init_data.clone()),
            None => init_data_from_env(),
        }
    }

    /// Handle one batch of remote tasks. Returns true once an `exit` was acted upon.
    async fn dispatch_tasks(&self, tasks: Vec<RemoteTask>) -> bool {
        let mut exit = None;
        for task in tasks {
            metrics::counter!("orchestrator_remote_tasks_total", "type" => task.kind.clone())
                .increment(1);
            if task.is_exit() {
                if exit.is_none() {
                    exit = Some(task);
                }
            } else {
                debug!(task_type = %task.kind, "ignoring unhandled remote task");
            }
        }

        // exit is always the last action for a batch.
        let Some(task) = exit else {
            return false;
        };
        if self.inner.exit_emitted.swap(true, Ordering::SeqCst) {
            return true;
        }
        info!(
            instance_id = %self.instance_id().unwrap_or_default(),
            "orchestrator requested exit"
        );
        self.inner.events.publish(LifecycleEvent::Exit(task));
        self.destroy().await;
        true
    }
}

/// Forward remote task batches from the heartbeat to the client. Holds only a weak reference so
/// an abandoned client is still dropped (which also ends the heartbeat and this loop).
fn spawn_task_dispatch(
    client: Weak<ClientInner>,
    mut tasks_rx: broadcast::Receiver<Vec<RemoteTask>>,
) {
    tokio::spawn(async move {
        loop {
            let tasks = match tasks_rx.recv().await {
                Ok(tasks) => tasks,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "remote task dispatch lagged behind heartbeat");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let Some(inner) = client.upgrade() else {
                break;
            };
            if (OrchestratorClient { inner }).dispatch_tasks(tasks).await {
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    fn unregistered_client() -> OrchestratorClient {
        OrchestratorClient::builder("http://127.0.0.1:1", "secret")
            .with_init_data(Attributes::new())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_exit_dispatched_once_across_batches() {
        let client = unregistered_client();
        let mut events = client.subscribe();

        let exit = RemoteTask::new("exit");
        assert!(client.dispatch_tasks(vec![exit.clone(), exit.clone()]).await);
        assert!(client.dispatch_tasks(vec![exit]).await);

        assert!(matches!(events.try_recv(), Ok(LifecycleEvent::Exit(_))));
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
        assert!(client.is_destroyed());
    }

    #[tokio::test]
    async fn test_batch_without_exit_is_not_acted_on() {
        let client = unregistered_client();
        let mut events = client.subscribe();

        let acted = client
            .dispatch_tasks(vec![RemoteTask::new("reload"), RemoteTask::new("resize")])
            .await;

        assert!(!acted);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
        assert!(!client.is_destroyed());
    }
}
