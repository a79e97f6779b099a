use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::channel::ControlChannel;
use crate::error::ModuleError;
use crate::heartbeat::{HeartbeatTask, LivenessGate};
use crate::statsd::{MetricsLogger, StatsdClientConfig, StatsdSink};
use crate::types::{ModuleSpec, RemoteTask};

pub const HEARTBEAT_MODULE: &str = "heartbeat";
pub const STATSD_MODULE: &str = "statsd";

/// A decoded [`ModuleSpec`].
#[derive(Debug, Clone, PartialEq)]
pub enum Module {
    Heartbeat(HeartbeatModule),
    Statsd(StatsdModule),
    /// Forward compatibility: module types this client does not know are skipped.
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatModule {
    pub interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsdModule {
    pub client: StatsdClientConfig,
    pub prefix: Option<String>,
}

#[derive(Deserialize)]
struct HeartbeatModuleConfig {
    /// Milliseconds.
    #[serde(default, alias = "heartbeatInterval")]
    heartbeat_interval: Option<u64>,
}

#[derive(Deserialize)]
struct StatsdModuleConfig {
    #[serde(default)]
    client: Option<StatsdClientConfig>,
    #[serde(default)]
    prefix: Option<String>,
}

impl Module {
    pub fn decode(spec: &ModuleSpec) -> Result<Module, ModuleError> {
        match spec.kind.as_str() {
            HEARTBEAT_MODULE => {
                let config: HeartbeatModuleConfig = decode_config(spec)?;
                match config.heartbeat_interval {
                    Some(ms) if ms > 0 => Ok(Module::Heartbeat(HeartbeatModule {
                        interval: Duration::from_millis(ms),
                    })),
                    _ => Err(ModuleError::MissingInterval),
                }
            }
            STATSD_MODULE => {
                let config: StatsdModuleConfig = decode_config(spec)?;
                let client = config.client.ok_or(ModuleError::MissingStatsdClient)?;
                Ok(Module::Statsd(StatsdModule {
                    client,
                    prefix: config.prefix,
                }))
            }
            other => Ok(Module::Unknown(other.to_owned())),
        }
    }
}

fn decode_config<T: DeserializeOwned>(spec: &ModuleSpec) -> Result<T, ModuleError> {
    let config = match &spec.config {
        Value::Null => Value::Object(Default::default()),
        config => config.clone(),
    };
    serde_json::from_value(config).map_err(|e| ModuleError::InvalidConfig {
        kind: spec.kind.clone(),
        reason: e.to_string(),
    })
}

/// Capabilities produced by [`ModuleActivator::activate`]. The statsd sink is installed into the
/// shared [`MetricsLogger`] directly.
#[derive(Default)]
pub struct ActivatedModules {
    pub heartbeat: Option<HeartbeatTask>,
    /// Subscribed to `heartbeat` before it was started, so no task batch is missed.
    pub heartbeat_tasks: Option<broadcast::Receiver<Vec<RemoteTask>>>,
}

/// Instantiates the capabilities listed in an instance configuration.
pub struct ModuleActivator<'a> {
    channel: &'a ControlChannel,
    instance_id: &'a str,
    liveness_gate: Option<Arc<dyn LivenessGate>>,
    metrics: &'a MetricsLogger,
}

impl<'a> ModuleActivator<'a> {
    pub fn new(
        channel: &'a ControlChannel,
        instance_id: &'a str,
        liveness_gate: Option<Arc<dyn LivenessGate>>,
        metrics: &'a MetricsLogger,
    ) -> Self {
        Self {
            channel,
            instance_id,
            liveness_gate,
            metrics,
        }
    }

    /// Activate modules in list order. Misconfigured and unknown entries are skipped; a later
    /// entry of the same type replaces an earlier one.
    pub async fn activate(&self, modules: &[ModuleSpec]) -> ActivatedModules {
        let mut activated = ActivatedModules::default();

        for spec in modules {
            let module = match Module::decode(spec) {
                Ok(module) => module,
                Err(error) => {
                    warn!(module = %spec.kind, %error, "skipping misconfigured module");
                    continue;
                }
            };

            match module {
                Module::Heartbeat(heartbeat) => {
                    if let Some(previous) = activated.heartbeat.take() {
                        previous.stop();
                    }
                    let task = HeartbeatTask::new(
                        self.channel.clone(),
                        self.instance_id,
                        heartbeat.interval,
                        self.liveness_gate.clone(),
                    );
                    activated.heartbeat_tasks = Some(task.subscribe());
                    task.start();
                    info!(
                        interval_ms = heartbeat.interval.as_millis() as u64,
                        "heartbeat module activated"
                    );
                    activated.heartbeat = Some(task);
                }
                Module::Statsd(statsd) => {
                    match StatsdSink::connect(&statsd.client, statsd.prefix).await {
                        Ok(sink) => self.metrics.install(sink),
                        Err(error) => warn!(%error, "skipping statsd module"),
                    }
                }
                Module::Unknown(kind) => debug!(module = %kind, "skipping unknown module"),
            }
        }

        activated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::HeartbeatState;
    use httpmock::MockServer;
    use serde_json::json;

    fn spec(kind: &str, config: Value) -> ModuleSpec {
        ModuleSpec::new(kind, config)
    }

    #[test]
    fn test_decode_heartbeat() {
        let module = Module::decode(&spec("heartbeat", json!({"heartbeat_interval": 50})));
        assert_eq!(
            module,
            Ok(Module::Heartbeat(HeartbeatModule {
                interval: Duration::from_millis(50)
            }))
        );

        let module = Module::decode(&spec("heartbeat", json!({"heartbeatInterval": 100})));
        assert_eq!(
            module,
            Ok(Module::Heartbeat(HeartbeatModule {
                interval: Duration::from_millis(100)
            }))
        );
    }

    #[test]
    fn test_decode_heartbeat_without_positive_interval() {
        for config in [json!({}), json!(null), json!({"heartbeat_interval": 0})] {
            assert_eq!(
                Module::decode(&spec("heartbeat", config)),
                Err(ModuleError::MissingInterval)
            );
        }
    }

    #[test]
    fn test_decode_heartbeat_with_bad_interval() {
        let result = Module::decode(&spec("heartbeat", json!({"heartbeat_interval": "soon"})));
        assert!(matches!(result, Err(ModuleError::InvalidConfig { .. })));
    }

    #[test]
    fn test_decode_statsd() {
        let module = Module::decode(&spec(
            "statsd",
            json!({
                "client": {"host": "10.0.0.1", "port": 9125, "socketTimeout": 100},
                "prefix": "group.zone"
            }),
        ));
        assert_eq!(
            module,
            Ok(Module::Statsd(StatsdModule {
                client: StatsdClientConfig {
                    host: "10.0.0.1".to_owned(),
                    port: 9125
                },
                prefix: Some("group.zone".to_owned()),
            }))
        );

        assert_eq!(
            Module::decode(&spec("statsd", json!({"prefix": "group.zone"}))),
            Err(ModuleError::MissingStatsdClient)
        );
    }

    #[test]
    fn test_decode_unknown() {
        assert_eq!(
            Module::decode(&spec("tracing", json!({"anything": true}))),
            Ok(Module::Unknown("tracing".to_owned()))
        );
    }

    #[tokio::test]
    async fn test_activate_skips_unknown_and_misconfigured() {
        let server = MockServer::start_async().await;
        let channel = ControlChannel::new(&server.base_url(), "secret", None).unwrap();
        let metrics = MetricsLogger::new();
        let activator = ModuleActivator::new(&channel, "device-8080", None, &metrics);

        let activated = activator
            .activate(&[
                spec("tracing", json!({})),
                spec("heartbeat", json!({})),
                spec("statsd", json!({})),
            ])
            .await;

        assert!(activated.heartbeat.is_none());
        assert!(!metrics.is_configured());
    }

    #[tokio::test]
    async fn test_later_heartbeat_replaces_earlier() {
        let server = MockServer::start_async().await;
        let channel = ControlChannel::new(&server.base_url(), "secret", None).unwrap();
        let metrics = MetricsLogger::new();
        let activator = ModuleActivator::new(&channel, "device-8080", None, &metrics);

        let activated = activator
            .activate(&[
                spec("heartbeat", json!({"heartbeat_interval": 60_000})),
                spec("heartbeat", json!({"heartbeat_interval": 30_000})),
            ])
            .await;

        let heartbeat = activated.heartbeat.expect("heartbeat should be active");
        assert_eq!(heartbeat.interval(), Duration::from_secs(30));
        assert_eq!(heartbeat.state(), HeartbeatState::Running);
        heartbeat.stop();
    }

    #[tokio::test]
    async fn test_activate_statsd_installs_sink() {
        let server = MockServer::start_async().await;
        let channel = ControlChannel::new(&server.base_url(), "secret", None).unwrap();
        let metrics = MetricsLogger::new();
        let activator = ModuleActivator::new(&channel, "device-8080", None, &metrics);

        activator
            .activate(&[spec(
                "statsd",
                json!({"client": {"host": "127.0.0.1", "port": 8125}}),
            )])
            .await;

        assert!(metrics.is_configured());
    }
}
