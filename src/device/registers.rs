use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::error::{E502Error, ErrorCode, Result};
use crate::protocol::control::{Command, ControlChannel};
use crate::transport::BoxedStream;

// IO_HARD bank, synchronous I/O timing
pub const LCH_TABLE: u32 = 0x200;
pub const LCH_TABLE_MAX_LEN: usize = 64;
pub const LCH_CNT: u32 = 0x300;
pub const ADC_FREQ_DIV: u32 = 0x302;
pub const DIGIN_FREQ_DIV: u32 = 0x306;
pub const GO_SYNC_IO: u32 = 0x30A;
pub const PRELOAD_ADC: u32 = 0x30C;
pub const ASYNC_OUT: u32 = 0x312;

// IO_ARITH bank, post-processing
pub const ARITH_ADC_FREQ_DIV: u32 = 0x412;
pub const IN_STREAM_ENABLE: u32 = 0x419;

pub const MODULE_DATA_LEN: usize = 192;
const REGISTER_LEN: usize = 4;
const MAX_FLASH_TRANSFER: usize = 512;

/// Address of logical channel `slot` in the table, counted from the table base
pub fn channel_table_address(slot: usize) -> u32 {
    LCH_TABLE + 4 * slot as u32
}

/// Payload of a register write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterValue {
    Word(u32),
    Raw(Vec<u8>),
}

impl RegisterValue {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            RegisterValue::Word(word) => word.to_le_bytes().to_vec(),
            RegisterValue::Raw(bytes) => bytes,
        }
    }
}

impl From<u32> for RegisterValue {
    fn from(value: u32) -> Self {
        RegisterValue::Word(value)
    }
}

impl From<bool> for RegisterValue {
    fn from(value: bool) -> Self {
        RegisterValue::Word(value as u32)
    }
}

impl From<Vec<u8>> for RegisterValue {
    fn from(value: Vec<u8>) -> Self {
        RegisterValue::Raw(value)
    }
}

impl From<&[u8]> for RegisterValue {
    fn from(value: &[u8]) -> Self {
        RegisterValue::Raw(value.to_vec())
    }
}

impl<const N: usize> From<[u8; N]> for RegisterValue {
    fn from(value: [u8; N]) -> Self {
        RegisterValue::Raw(value.to_vec())
    }
}

/// Little-endian word from a register payload, missing bytes read as zero
fn decode_word(payload: &[u8]) -> u32 {
    let mut word = [0u8; REGISTER_LEN];
    let len = payload.len().min(REGISTER_LEN);
    word[..len].copy_from_slice(&payload[..len]);
    u32::from_le_bytes(word)
}

fn check_flash_len(len: usize) -> Result<()> {
    if len == 0 || len >= MAX_FLASH_TRANSFER {
        return Err(E502Error::InvalidArgument(format!(
            "flash transfer length {len} must be between 1 and {}",
            MAX_FLASH_TRANSFER - 1
        )));
    }
    Ok(())
}

/// Typed register and flash access on top of the control connection.
///
/// Device status codes come back as values next to the data; only locally
/// detected problems are errors.
pub struct RegisterSpace<S = BoxedStream> {
    channel: ControlChannel<S>,
}

impl<S> RegisterSpace<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(channel: ControlChannel<S>) -> Self {
        Self { channel }
    }

    /// Direct access for requests that are not register operations
    pub fn channel(&mut self) -> &mut ControlChannel<S> {
        &mut self.channel
    }

    pub async fn read_register(&mut self, address: u32) -> Result<(Vec<u8>, ErrorCode)> {
        let response = self
            .channel
            .request(Command::ReadRegister, address, &[], REGISTER_LEN)
            .await?;
        Ok((response.payload, response.code))
    }

    pub async fn write_register(
        &mut self,
        address: u32,
        value: impl Into<RegisterValue>,
    ) -> Result<ErrorCode> {
        let payload = value.into().into_bytes();
        debug!("write register {address:#05x} <- {payload:02x?}");
        let response = self
            .channel
            .request(Command::WriteRegister, address, &payload, 0)
            .await?;
        Ok(response.code)
    }

    pub async fn read_int(&mut self, address: u32) -> Result<(u32, ErrorCode)> {
        let (payload, code) = self.read_register(address).await?;
        Ok((decode_word(&payload), code))
    }

    pub async fn read_flash(&mut self, address: u32, len: usize) -> Result<(Vec<u8>, ErrorCode)> {
        check_flash_len(len)?;
        let response = self
            .channel
            .request(Command::FlashRead, address, &[], len)
            .await?;
        Ok((response.payload, response.code))
    }

    pub async fn write_flash(&mut self, address: u32, data: &[u8]) -> Result<(Vec<u8>, ErrorCode)> {
        check_flash_len(data.len())?;
        let response = self
            .channel
            .request(Command::FlashWrite, address, data, 0)
            .await?;
        Ok((response.payload, response.code))
    }

    /// Raw module descriptor block
    pub async fn read_module_data(&mut self) -> Result<(Vec<u8>, ErrorCode)> {
        let response = self
            .channel
            .request(Command::ModuleInfo, 0, &[], MODULE_DATA_LEN)
            .await?;
        Ok((response.payload, response.code))
    }

    /// The 4-byte capability word, see [`HardwareInfo`](crate::device::hardware_info::HardwareInfo)
    pub async fn read_hardware_word(&mut self) -> Result<(Vec<u8>, ErrorCode)> {
        let response = self
            .channel
            .request(Command::ModuleInfo, 0, &[], REGISTER_LEN)
            .await?;
        Ok((response.payload, response.code))
    }
}
