use tokio::net::TcpStream;
use tracing::{error, info};

use crate::config::DeviceConfig;
use crate::error::Result;
use crate::transport::{BoxedStream, DeviceTransport, Endpoint};

/// Socket-backed connection to a physical module
#[derive(Debug, Clone)]
pub struct TcpTransport {
    address: String,
    control_port: u16,
    data_port: u16,
}

impl TcpTransport {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            address: config.address.clone(),
            control_port: config.control_port,
            data_port: config.data_port,
        }
    }

    fn port(&self, endpoint: Endpoint) -> u16 {
        match endpoint {
            Endpoint::Control => self.control_port,
            Endpoint::Data => self.data_port,
        }
    }
}

#[async_trait::async_trait]
impl DeviceTransport for TcpTransport {
    async fn connect(&self, endpoint: Endpoint) -> Result<BoxedStream> {
        let port = self.port(endpoint);
        let stream = TcpStream::connect((self.address.as_str(), port))
            .await
            .map_err(|err| {
                error!("Cannot connect {endpoint:?} channel to {}:{port}: {err}", self.address);
                err
            })?;
        // Control requests are small and latency bound
        stream.set_nodelay(true)?;
        info!("Connected {endpoint:?} channel to {}:{port}", self.address);
        Ok(Box::new(stream))
    }

    fn peer(&self) -> String {
        format!(
            "{} (control {}, data {})",
            self.address, self.control_port, self.data_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_each_endpoint_to_its_port() {
        let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let data = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = DeviceConfig {
            address: "127.0.0.1".to_owned(),
            control_port: control.local_addr().unwrap().port(),
            data_port: data.local_addr().unwrap().port(),
            ..Default::default()
        };
        let transport = TcpTransport::new(&config);

        let mut control_client = transport.connect(Endpoint::Control).await.unwrap();
        let (mut control_peer, _) = control.accept().await.unwrap();
        let mut data_client = transport.connect(Endpoint::Data).await.unwrap();
        let (mut data_peer, _) = data.accept().await.unwrap();

        control_client.write_all(b"c").await.unwrap();
        data_client.write_all(b"d").await.unwrap();
        let mut byte = [0u8; 1];
        control_peer.read_exact(&mut byte).await.unwrap();
        assert_eq!(&byte, b"c");
        data_peer.read_exact(&mut byte).await.unwrap();
        assert_eq!(&byte, b"d");
    }
}
