use std::time::Duration;

use envconfig::Envconfig;
use tracing::Level;

#[derive(Envconfig, Debug, Clone)]
pub struct Config {
    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: Level,

    #[envconfig(from = "REQUEST_TIMEOUT_MS", default = "10000")]
    pub request_timeout_ms: u64,

    #[envconfig(from = "MACHINE_ID_PATH", default = "/var/lib/dbus/machine-id")]
    pub machine_id_path: String,
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
