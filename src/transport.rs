use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{Backend, DeviceConfig};
use crate::error::Result;

#[cfg(feature = "sim")]
pub mod sim;
pub mod tcp;

/// Any full-duplex byte stream a module connection can run over
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

pub type BoxedStream = Box<dyn ByteStream>;

/// The two independent connections every module exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Control,
    Data,
}

/// Opens connections to one module, real or simulated
#[async_trait::async_trait]
pub trait DeviceTransport: Send + Sync {
    async fn connect(&self, endpoint: Endpoint) -> Result<BoxedStream>;

    /// Human readable peer description for logs
    fn peer(&self) -> String;
}

/// Pick the transport named by the config
pub fn from_config(config: &DeviceConfig) -> Result<Box<dyn DeviceTransport>> {
    match config.backend {
        Backend::Tcp => Ok(Box::new(tcp::TcpTransport::new(config))),
        #[cfg(feature = "sim")]
        Backend::Sim => Ok(Box::new(sim::SimTransport::new())),
        #[cfg(not(feature = "sim"))]
        Backend::Sim => Err(crate::error::E502Error::InvalidArgument(
            "simulated backend requires the `sim` feature".to_owned(),
        )),
    }
}
