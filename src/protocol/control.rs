use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{E502Error, ErrorCode, Result};
use crate::transport::BoxedStream;

/// Marker opening every control request
pub const REQUEST_TAG: [u8; 4] = *b"CTL1";
pub const MAX_PAYLOAD_LEN: usize = 512;
pub const MAX_RESPONSE_LEN: usize = 512;

const REQUEST_HEADER_LEN: usize = 20;
const RESPONSE_HEADER_LEN: usize = 12;

/// Control connection opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    ReadRegister = 0x10,
    WriteRegister = 0x11,
    StreamStart = 0x12,
    StreamStop = 0x13,
    StreamIsRunning = 0x15,
    FlashRead = 0x17,
    FlashWrite = 0x18,
    ResetDataSocket = 0x23,
    ModuleInfo = 0x80,
}

impl From<Command> for u32 {
    fn from(value: Command) -> Self {
        value as u32
    }
}

impl TryFrom<u32> for Command {
    type Error = u32;

    fn try_from(value: u32) -> std::result::Result<Self, u32> {
        Ok(match value {
            0x10 => Command::ReadRegister,
            0x11 => Command::WriteRegister,
            0x12 => Command::StreamStart,
            0x13 => Command::StreamStop,
            0x15 => Command::StreamIsRunning,
            0x17 => Command::FlashRead,
            0x18 => Command::FlashWrite,
            0x23 => Command::ResetDataSocket,
            0x80 => Command::ModuleInfo,
            other => return Err(other),
        })
    }
}

/// One decoded control response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub tag: [u8; 4],
    pub code: ErrorCode,
    pub payload: Vec<u8>,
}

/// Request/response framing over the control connection.
///
/// Strictly one request in flight: [`send`](Self::send) refuses to frame a new
/// request until the previous response was consumed with
/// [`receive`](Self::receive). After a transport error the channel is dead and
/// must be replaced.
pub struct ControlChannel<S = BoxedStream> {
    stream: S,
    awaiting_response: bool,
}

impl<S> ControlChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            awaiting_response: false,
        }
    }

    pub async fn send(
        &mut self,
        command: impl Into<u32>,
        parameter: u32,
        payload: &[u8],
        expected_response_len: usize,
    ) -> Result<()> {
        let command = command.into();
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(E502Error::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        if expected_response_len > MAX_RESPONSE_LEN {
            return Err(E502Error::ResponseTooLarge {
                len: expected_response_len,
                max: MAX_RESPONSE_LEN,
            });
        }
        if self.awaiting_response {
            return Err(E502Error::Desynchronized(format!(
                "request {command:#x} issued before the previous response was received"
            )));
        }

        let mut frame = Vec::with_capacity(REQUEST_HEADER_LEN + payload.len());
        frame.extend_from_slice(&REQUEST_TAG);
        frame.extend_from_slice(&command.to_le_bytes());
        frame.extend_from_slice(&parameter.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&(expected_response_len as u32).to_le_bytes());
        frame.extend_from_slice(payload);

        debug!(
            "request: command={command:#x} parameter={parameter:#x} payload={} bytes expect={expected_response_len}",
            payload.len()
        );

        self.awaiting_response = true;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn receive(&mut self) -> Result<Response> {
        let mut header = [0u8; RESPONSE_HEADER_LEN];
        self.stream.read_exact(&mut header).await?;

        let tag = [header[0], header[1], header[2], header[3]];
        let code = ErrorCode(i32::from_le_bytes([header[4], header[5], header[6], header[7]]));
        let len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;
        debug!(
            "response: tag={:?} code={code} len={len}",
            String::from_utf8_lossy(&tag)
        );

        // The payload stays unread, so the channel cannot be reused
        if len > MAX_RESPONSE_LEN {
            return Err(E502Error::Desynchronized(format!(
                "response announces {len} bytes, limit is {MAX_RESPONSE_LEN}"
            )));
        }

        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).await?;
        self.awaiting_response = false;

        Ok(Response { tag, code, payload })
    }

    /// Send a request and wait for its response
    pub async fn request(
        &mut self,
        command: impl Into<u32>,
        parameter: u32,
        payload: &[u8],
        expected_response_len: usize,
    ) -> Result<Response> {
        self.send(command, parameter, payload, expected_response_len)
            .await?;
        self.receive().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    fn response_frame(code: i32, payload: &[u8]) -> Vec<u8> {
        let mut frame = b"CTL1".to_vec();
        frame.extend_from_slice(&code.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    #[tokio::test]
    async fn request_frame_layout() {
        let (host, mut device) = duplex(64);
        let mut channel = ControlChannel::new(host);

        channel
            .send(Command::WriteRegister, 0x30A, &[1, 0, 0, 0], 0)
            .await
            .unwrap();

        let mut frame = [0u8; 24];
        device.read_exact(&mut frame).await.unwrap();
        assert_eq!(&frame[..4], b"CTL1");
        assert_eq!(&frame[4..8], &0x11u32.to_le_bytes());
        assert_eq!(&frame[8..12], &0x30Au32.to_le_bytes());
        assert_eq!(&frame[12..16], &4u32.to_le_bytes());
        assert_eq!(&frame[16..20], &0u32.to_le_bytes());
        assert_eq!(&frame[20..], &[1, 0, 0, 0]);
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_before_writing() {
        let (host, mut device) = duplex(1024);
        let mut channel = ControlChannel::new(host);

        let err = channel
            .send(Command::WriteRegister, 0, &[0u8; 513], 0)
            .await
            .unwrap_err();
        assert!(matches!(err, E502Error::PayloadTooLarge { len: 513, .. }));

        let err = channel
            .send(Command::ReadRegister, 0, &[], 513)
            .await
            .unwrap_err();
        assert!(matches!(err, E502Error::ResponseTooLarge { len: 513, .. }));

        drop(channel);
        let mut written = Vec::new();
        device.read_to_end(&mut written).await.unwrap();
        assert!(written.is_empty());
    }

    #[tokio::test]
    async fn response_survives_single_byte_delivery() {
        let (host, mut device) = duplex(1);
        let mut channel = ControlChannel::new(host);

        let writer = tokio::spawn(async move {
            device
                .write_all(&response_frame(-7, &[0xAA, 0xBB, 0xCC, 0xDD]))
                .await
                .unwrap();
            device
        });

        let response = channel.receive().await.unwrap();
        assert_eq!(&response.tag, b"CTL1");
        assert_eq!(response.code, ErrorCode(-7));
        assert_eq!(response.payload, vec![0xAA, 0xBB, 0xCC, 0xDD]);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn closed_connection_mid_response() {
        let (host, mut device) = duplex(64);
        let mut channel = ControlChannel::new(host);

        device.write_all(&response_frame(0, &[1, 2, 3, 4])[..14]).await.unwrap();
        drop(device);

        assert!(matches!(
            channel.receive().await,
            Err(E502Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn second_request_before_response_is_refused() {
        let (host, mut device) = duplex(256);
        let mut channel = ControlChannel::new(host);

        channel.send(Command::StreamStart, 0, &[], 0).await.unwrap();
        let err = channel
            .send(Command::StreamStop, 0, &[], 0)
            .await
            .unwrap_err();
        assert!(matches!(err, E502Error::Desynchronized(_)));
        assert!(err.is_transport());

        device.write_all(&response_frame(0, &[])).await.unwrap();
        assert_eq!(channel.receive().await.unwrap().code, ErrorCode::OK);
        channel.send(Command::StreamStop, 0, &[], 0).await.unwrap();
    }

    #[tokio::test]
    async fn oversized_response_breaks_the_channel() {
        let (host, mut device) = duplex(1024);
        let mut channel = ControlChannel::new(host);

        let mut frame = b"CTL1".to_vec();
        frame.extend_from_slice(&0i32.to_le_bytes());
        frame.extend_from_slice(&600u32.to_le_bytes());
        device.write_all(&frame).await.unwrap();

        channel.send(Command::ReadRegister, 0x300, &[], 4).await.unwrap();
        let err = channel.receive().await.unwrap_err();
        assert!(matches!(err, E502Error::Desynchronized(_)));
        assert!(err.is_transport());

        let err = channel
            .request(Command::ReadRegister, 0x300, &[], 4)
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn abandoned_request_makes_next_call_a_transport_error() {
        let (host, _device) = duplex(256);
        let mut channel = ControlChannel::new(host);

        // No reply ever arrives, the caller gives up
        let timed_out = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            channel.request(Command::StreamIsRunning, 0, &[], 1),
        )
        .await;
        assert!(timed_out.is_err());

        let err = channel
            .request(Command::StreamIsRunning, 0, &[], 1)
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }
}
