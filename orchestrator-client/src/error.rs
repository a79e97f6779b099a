use std::path::PathBuf;

use reqwest::StatusCode;
use thiserror::Error;

/// Enumeration of errors surfaced by the one-time setup sequence of `OrchestratorClient`.
///
/// Anything returned from `init` is fatal: the instance is not registered, or registered
/// without a usable configuration. Failures of the background heartbeat and of teardown
/// never show up here, they are logged and swallowed where they happen.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("device identity unavailable: cannot read {path}")]
    IdentityUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("a service port is required to register an instance")]
    RegistrationRequired,
    #[error("orchestrator rejected instance registration")]
    RegistrationFailed(#[source] ControlError),
    #[error("failed to fetch instance configuration")]
    ConfigUnavailable(#[source] ControlError),
    #[error("init data must be a JSON object")]
    InvalidInitData(#[source] serde_json::Error),
    #[error("invalid orchestrator url: {0}")]
    InvalidBaseUrl(String),
    #[error("orchestrator secret is not a valid header value")]
    InvalidSecret,
    #[error("failed to build http client")]
    HttpClient(#[source] reqwest::Error),
    #[error("client is already initialized as {0}")]
    AlreadyInitialized(String),
}

/// A single failed call to the orchestrator's control API.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("orchestrator responded with {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ControlError {
    pub fn is_timeout(&self) -> bool {
        match self {
            ControlError::Request(error) => error.is_timeout(),
            _ => false,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ControlError::Request(error) => error.status(),
            ControlError::Status { status, .. } => Some(*status),
            ControlError::Decode(_) => None,
        }
    }
}

/// A known module type whose configuration cannot be used. The activator logs these and
/// moves on to the next module.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ModuleError {
    #[error("heartbeat module requires a positive heartbeat_interval")]
    MissingInterval,
    #[error("statsd module requires a client configuration")]
    MissingStatsdClient,
    #[error("invalid {kind} module config: {reason}")]
    InvalidConfig { kind: String, reason: String },
    #[error("failed to open statsd socket to {target}: {reason}")]
    StatsdSocket { target: String, reason: String },
}
