use byteorder::{ByteOrder, LittleEndian};
use ndarray::Array2;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{trace, warn};

use crate::error::{E502Error, ErrorCode, Result};
use crate::protocol::control::{Command, ControlChannel};
use crate::transport::BoxedStream;

/// Samples-major, channels-minor block of streamed values
pub type SampleMatrix = Array2<f32>;

const SAMPLE_SIZE: usize = std::mem::size_of::<f32>();
/// Upper bound of a single socket read
const READ_CHUNK_LEN: usize = 64 * 1024;
const DAC_STREAM_FLAG: u32 = 1 << 16;

/// Which synchronous stream a start/stop request addresses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamDirection {
    /// Module to host, ADC and digital inputs
    #[default]
    Input,
    /// Host to module, DAC output
    Output,
}

impl StreamDirection {
    fn parameter(self) -> u32 {
        match self {
            StreamDirection::Input => 0,
            StreamDirection::Output => DAC_STREAM_FLAG,
        }
    }
}

/// Stream control requests travel over the control connection
impl<S> ControlChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub async fn start_stream(&mut self, direction: StreamDirection) -> Result<ErrorCode> {
        let response = self
            .request(Command::StreamStart, direction.parameter(), &[], 0)
            .await?;
        Ok(response.code)
    }

    pub async fn stop_stream(&mut self, direction: StreamDirection) -> Result<ErrorCode> {
        let response = self
            .request(Command::StreamStop, direction.parameter(), &[], 0)
            .await?;
        Ok(response.code)
    }

    pub async fn is_stream_running(
        &mut self,
        direction: StreamDirection,
    ) -> Result<(bool, ErrorCode)> {
        let response = self
            .request(Command::StreamIsRunning, direction.parameter(), &[], 1)
            .await?;
        let running = response.payload.iter().any(|&b| b != 0);
        Ok((running, response.code))
    }

    /// Ask the module to drop its side of the data connection
    pub async fn request_data_socket_reset(&mut self) -> Result<ErrorCode> {
        let response = self
            .request(Command::ResetDataSocket, 0, &[], 0)
            .await?;
        Ok(response.code)
    }
}

/// Turns the raw data connection into sample matrices.
///
/// Each portion arrives channel-major: all samples of the first logical
/// channel, then all of the second, and so on.
pub struct StreamingReader<S = BoxedStream> {
    stream: S,
}

impl<S> StreamingReader<S>
where
    S: AsyncRead + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Swap in a freshly opened data connection, closing the old one
    pub fn replace_stream(&mut self, stream: S) {
        self.stream = stream;
    }

    pub async fn read_portion(
        &mut self,
        sample_count: i64,
        channel_count: usize,
    ) -> Result<SampleMatrix> {
        let samples = usize::try_from(sample_count).map_err(|_| {
            E502Error::InvalidArgument(format!("invalid data size {sample_count}"))
        })?;
        let total = samples
            .checked_mul(SAMPLE_SIZE)
            .and_then(|n| n.checked_mul(channel_count))
            .ok_or_else(|| {
                E502Error::InvalidArgument(format!(
                    "portion of {samples} samples x {channel_count} channels is too large"
                ))
            })?;

        let mut data = Vec::with_capacity(total);
        let mut chunk = vec![0u8; total.min(READ_CHUNK_LEN)];
        while data.len() < total {
            let wanted = (total - data.len()).min(chunk.len());
            let received = self.stream.read(&mut chunk[..wanted]).await?;
            if received == 0 {
                return Err(E502Error::ConnectionClosed);
            }
            trace!("data chunk of {received} bytes, {} of {total}", data.len() + received);
            data.extend_from_slice(&chunk[..received]);
        }
        if data.len() > total {
            warn!("discarding {} bytes read past the portion end", data.len() - total);
            data.truncate(total);
        }

        let mut values = vec![0f32; samples * channel_count];
        LittleEndian::read_f32_into(&data, &mut values);

        Ok(Array2::from_shape_fn(
            (samples, channel_count),
            |(sample, channel)| values[channel * samples + sample],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, duplex};

    fn channel_major_bytes(samples: usize, channels: usize) -> (Vec<u8>, SampleMatrix) {
        let expected = Array2::from_shape_fn((samples, channels), |(s, c)| {
            c as f32 * 1000.0 + s as f32 * 0.25
        });
        let mut bytes = Vec::new();
        for c in 0..channels {
            for s in 0..samples {
                bytes.extend_from_slice(&expected[[s, c]].to_le_bytes());
            }
        }
        (bytes, expected)
    }

    async fn read_with_pipe_capacity(
        capacity: usize,
        bytes: Vec<u8>,
        samples: i64,
        channels: usize,
    ) -> SampleMatrix {
        let (host, mut device) = duplex(capacity);
        let writer = tokio::spawn(async move {
            device.write_all(&bytes).await.unwrap();
            device
        });
        let mut reader = StreamingReader::new(host);
        let matrix = reader.read_portion(samples, channels).await.unwrap();
        writer.await.unwrap();
        matrix
    }

    #[tokio::test]
    async fn transposes_channel_major_portion() {
        let (bytes, expected) = channel_major_bytes(3, 2);
        let matrix = read_with_pipe_capacity(4096, bytes, 3, 2).await;
        assert_eq!(matrix.dim(), (3, 2));
        assert_eq!(matrix, expected);
        assert_eq!(matrix[[2, 1]], 1000.5);
    }

    #[tokio::test]
    async fn chunked_delivery_matches_single_shot() {
        let (bytes, expected) = channel_major_bytes(100, 3);
        let single = read_with_pipe_capacity(bytes.len(), bytes.clone(), 100, 3).await;
        assert_eq!(single, expected);

        for capacity in [1, 3, 512] {
            let chunked = read_with_pipe_capacity(capacity, bytes.clone(), 100, 3).await;
            assert_eq!(chunked, single, "pipe capacity {capacity}");
        }
    }

    #[tokio::test]
    async fn consecutive_portions_stay_aligned() {
        let (first, first_expected) = channel_major_bytes(4, 2);
        let mut bytes = first.clone();
        bytes.extend(first);

        let (host, mut device) = duplex(7);
        let writer = tokio::spawn(async move { device.write_all(&bytes).await.unwrap() });
        let mut reader = StreamingReader::new(host);
        assert_eq!(reader.read_portion(4, 2).await.unwrap(), first_expected);
        assert_eq!(reader.read_portion(4, 2).await.unwrap(), first_expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn zero_samples_returns_immediately() {
        let (host, _device) = duplex(16);
        let mut reader = StreamingReader::new(host);
        let matrix = tokio::time::timeout(Duration::from_secs(1), reader.read_portion(0, 4))
            .await
            .expect("empty portion must not wait for data")
            .unwrap();
        assert_eq!(matrix.dim(), (0, 4));
    }

    #[tokio::test]
    async fn negative_sample_count_is_rejected() {
        let (host, _device) = duplex(16);
        let mut reader = StreamingReader::new(host);
        assert!(matches!(
            reader.read_portion(-1, 2).await,
            Err(E502Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn closed_data_connection_mid_portion() {
        let (host, mut device) = duplex(64);
        device.write_all(&[0u8; 10]).await.unwrap();
        drop(device);
        let mut reader = StreamingReader::new(host);
        assert!(matches!(
            reader.read_portion(4, 1).await,
            Err(E502Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn stream_requests_encode_direction() {
        let (host, mut device) = duplex(256);
        let mut control = ControlChannel::new(host);

        let responder = tokio::spawn(async move {
            let mut requests = Vec::new();
            for reply in [vec![], vec![1u8]] {
                let mut header = [0u8; 20];
                device.read_exact(&mut header).await.unwrap();
                requests.push(header);
                let mut frame = b"CTL1".to_vec();
                frame.extend_from_slice(&0i32.to_le_bytes());
                frame.extend_from_slice(&(reply.len() as u32).to_le_bytes());
                frame.extend_from_slice(&reply);
                device.write_all(&frame).await.unwrap();
            }
            requests
        });

        assert_eq!(
            control.start_stream(StreamDirection::Output).await.unwrap(),
            ErrorCode::OK
        );
        let (running, code) = control
            .is_stream_running(StreamDirection::Input)
            .await
            .unwrap();
        assert!(running);
        assert!(code.is_ok());

        let requests = responder.await.unwrap();
        assert_eq!(&requests[0][4..8], &0x12u32.to_le_bytes());
        assert_eq!(&requests[0][8..12], &(1u32 << 16).to_le_bytes());
        assert_eq!(&requests[1][4..8], &0x15u32.to_le_bytes());
        assert_eq!(&requests[1][8..12], &0u32.to_le_bytes());
        assert_eq!(&requests[1][16..20], &1u32.to_le_bytes());
    }
}
