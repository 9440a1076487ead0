use serde::{Deserialize, Serialize};

/// TCP port of the request/response control connection
pub const CONTROL_PORT: u16 = 11114;
/// TCP port of the streamed sample connection
pub const DATA_PORT: u16 = 11115;

/// Which [`DeviceTransport`](crate::transport::DeviceTransport) backs the device handle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Real module reachable over TCP
    #[default]
    Tcp,

    /// In-memory simulated module, only available with the `sim` feature
    Sim,
}

/// Connection settings for one E-502 module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub address: String,
    pub control_port: u16,
    pub data_port: u16,
    pub backend: Backend,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: "192.168.0.1".to_owned(),
            control_port: CONTROL_PORT,
            data_port: DATA_PORT,
            backend: Backend::Tcp,
        }
    }
}

impl DeviceConfig {
    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn sim() -> Self {
        Self {
            address: "simulated".to_owned(),
            backend: Backend::Sim,
            ..Default::default()
        }
    }
}
