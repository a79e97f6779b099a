use std::path::PathBuf;

use crate::error::ClientError;

pub const DEFAULT_MACHINE_ID_PATH: &str = "/var/lib/dbus/machine-id";

/// Derives a stable per-machine identifier from the digest of a machine-unique file.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    machine_id_path: PathBuf,
}

impl DeviceIdentity {
    pub fn new(machine_id_path: impl Into<PathBuf>) -> Self {
        Self {
            machine_id_path: machine_id_path.into(),
        }
    }

    /// Hex md5 digest of the machine id file contents.
    pub fn device_id(&self) -> Result<String, ClientError> {
        let contents = std::fs::read(&self.machine_id_path).map_err(|source| {
            ClientError::IdentityUnavailable {
                path: self.machine_id_path.clone(),
                source,
            }
        })?;
        Ok(format!("{:x}", md5::compute(contents)))
    }

    pub fn compute_instance_id(&self, suffix: &str) -> Result<InstanceIdentity, ClientError> {
        let device_id = self.device_id()?;
        Ok(InstanceIdentity::new(device_id, suffix))
    }
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self::new(DEFAULT_MACHINE_ID_PATH)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    pub device_id: String,
    pub suffix: String,
    pub instance_id: String,
}

impl InstanceIdentity {
    pub fn new(device_id: String, suffix: &str) -> Self {
        let instance_id = format!("{device_id}-{suffix}");
        Self {
            device_id,
            suffix: suffix.to_owned(),
            instance_id,
        }
    }
}
