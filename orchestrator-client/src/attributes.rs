//! Registration attributes: the open key/value payload sent alongside an instance
//! registration, and the init-data sources it can be resolved from.

use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ClientError;

pub type Attributes = Map<String, Value>;

/// Placeholder value replaced by a fresh random UUID at registration time.
pub const RANDOM_UUID_PLACEHOLDER: &str = "<random-uuid>";

pub const INIT_DATA_ENV: &str = "ORCHESTRATOR_INIT_DATA";

/// Parse an init-data payload. Must be a JSON object; an empty string means no data.
pub fn parse_init_data(raw: &str) -> Result<Attributes, ClientError> {
    if raw.trim().is_empty() {
        return Ok(Attributes::new());
    }
    serde_json::from_str(raw).map_err(ClientError::InvalidInitData)
}

/// Read init data from `ORCHESTRATOR_INIT_DATA`, defaulting to an empty object.
pub fn init_data_from_env() -> Result<Attributes, ClientError> {
    match std::env::var(INIT_DATA_ENV) {
        Ok(raw) => parse_init_data(&raw),
        Err(_) => Ok(Attributes::new()),
    }
}

/// Replace every top-level value equal to [`RANDOM_UUID_PLACEHOLDER`] with a new v4 UUID.
pub fn substitute_placeholders(mut attributes: Attributes) -> Attributes {
    for value in attributes.values_mut() {
        if value.as_str() == Some(RANDOM_UUID_PLACEHOLDER) {
            *value = Value::String(Uuid::new_v4().to_string());
        }
    }
    attributes
}

/// Body of `POST /api/register-instance`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub instance_id: String,
    pub port: u16,
    #[serde(flatten)]
    pub extra: Attributes,
}

impl Registration {
    /// Build a registration request. Placeholders in `extra` are substituted here, once.
    pub fn new(
        instance_id: impl Into<String>,
        port: Option<u16>,
        extra: Attributes,
    ) -> Result<Self, ClientError> {
        let port = port.ok_or(ClientError::RegistrationRequired)?;
        let mut extra = substitute_placeholders(extra);
        // Core fields always win over same-named attributes.
        extra.remove("instanceId");
        extra.remove("port");
        Ok(Self {
            instance_id: instance_id.into(),
            port,
            extra,
        })
    }
}
