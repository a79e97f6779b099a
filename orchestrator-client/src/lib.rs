//! Sidecar client for a service orchestrator: registers a service instance, keeps it alive with
//! periodic heartbeats, acts on remote tasks carried by heartbeat responses, and exposes an
//! optional statsd metrics logger configured by the orchestrator.

mod attributes;
mod channel;
mod client;
mod error;
mod events;
mod heartbeat;
mod identity;
mod modules;
mod statsd;
mod types;

pub use attributes::{
    init_data_from_env, parse_init_data, substitute_placeholders, Attributes, Registration,
    INIT_DATA_ENV, RANDOM_UUID_PLACEHOLDER,
};
pub use channel::ControlChannel;
pub use client::{ClientBuilder, OrchestratorClient};
pub use error::{ClientError, ControlError, ModuleError};
pub use events::{EventBus, LifecycleEvent};
pub use heartbeat::{HeartbeatState, HeartbeatTask, LivenessGate};
pub use identity::{DeviceIdentity, InstanceIdentity, DEFAULT_MACHINE_ID_PATH};
pub use modules::{ActivatedModules, HeartbeatModule, Module, ModuleActivator, StatsdModule};
pub use statsd::{MetricKind, MetricsLogger, StatsdClientConfig, StatsdSink};
pub use types::{InstanceConfig, ModuleSpec, RemoteTask, EXIT_TASK};
