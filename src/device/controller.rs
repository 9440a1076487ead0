use tracing::{debug, info, warn};
use uom::si::{electric_potential::volt, f64::ElectricPotential};

use crate::config::DeviceConfig;
use crate::device::calibration::{CALIBRATION_FLASH_ADDRESS, CALIBRATION_FLASH_LEN, CalibrationStore};
use crate::device::channel::ChannelSettings;
use crate::device::hardware_info::HardwareInfo;
use crate::device::registers::{
    ADC_FREQ_DIV, ARITH_ADC_FREQ_DIV, ASYNC_OUT, DIGIN_FREQ_DIV, GO_SYNC_IO, IN_STREAM_ENABLE,
    LCH_CNT, LCH_TABLE_MAX_LEN, PRELOAD_ADC, RegisterSpace, channel_table_address,
};
use crate::error::{E502Error, ErrorCode, Result};
use crate::protocol::control::ControlChannel;
use crate::protocol::stream::{SampleMatrix, StreamDirection, StreamingReader};
use crate::transport::{self, DeviceTransport, Endpoint};

pub const ADC_FREQ_DIV_MAX: u32 = 1 << 20;
pub const DIGITAL_LINE_COUNT: usize = 16;

/// DAC code per volt before calibration
const DAC_CODE_PER_VOLT: f64 = 6000.0;
/// Last byte of an asynchronous output word, selects the DAC channel
const DAC_CHANNEL_SELECT: [u8; 2] = [0x40, 0x80];

/// Acquisition lifecycle of one module
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeviceState {
    #[default]
    Idle,
    /// Channel table uploaded
    Configured,
    /// Input pipeline preloaded
    Armed,
    /// Synchronous I/O running, samples flowing on the data connection
    Streaming,
}

/// Handle to one E-502 module.
///
/// Owns both connections; every call needs `&mut self`, which keeps control
/// requests strictly sequential. The acquisition loop is expected to own the
/// controller while streaming.
pub struct DeviceController {
    transport: Box<dyn DeviceTransport>,
    registers: RegisterSpace,
    reader: StreamingReader,
    state: DeviceState,
    channel_table: Vec<ChannelSettings>,
    digital_out: u16,
    calibration: Option<CalibrationStore>,
}

impl DeviceController {
    /// Connect to the module described by `config`
    pub async fn connect(config: &DeviceConfig) -> Result<Self> {
        let transport = transport::from_config(config)?;
        Self::with_transport(transport).await
    }

    pub async fn with_transport(transport: Box<dyn DeviceTransport>) -> Result<Self> {
        info!("Connecting to E-502 at {}", transport.peer());
        let control = transport.connect(Endpoint::Control).await?;
        let data = transport.connect(Endpoint::Data).await?;

        Ok(Self {
            transport,
            registers: RegisterSpace::new(ControlChannel::new(control)),
            reader: StreamingReader::new(data),
            state: DeviceState::Idle,
            channel_table: Vec::new(),
            digital_out: 0,
            calibration: None,
        })
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Logical channels per streamed sample, as last uploaded
    pub fn channel_count(&self) -> usize {
        self.channel_table.len()
    }

    pub fn channel_table(&self) -> &[ChannelSettings] {
        &self.channel_table
    }

    /// Register level access for requests the controller does not wrap
    pub fn registers(&mut self) -> &mut RegisterSpace {
        &mut self.registers
    }

    fn transition(&mut self, next: DeviceState) {
        if self.state != next {
            info!("E-502 state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    /// Upload the logical channel table.
    ///
    /// The module stores the table reversed: the last logical channel sits at
    /// the table base. Every entry is encoded before anything is written.
    pub async fn write_channel_table(&mut self, settings: &[ChannelSettings]) -> Result<ErrorCode> {
        if self.state == DeviceState::Streaming {
            return Err(E502Error::InvalidState {
                operation: "write_channel_table",
                state: self.state,
            });
        }
        if settings.is_empty() || settings.len() > LCH_TABLE_MAX_LEN {
            return Err(E502Error::InvalidArgument(format!(
                "channel table must hold 1 to {LCH_TABLE_MAX_LEN} entries, got {}",
                settings.len()
            )));
        }
        let words = settings
            .iter()
            .map(ChannelSettings::encode)
            .collect::<Result<Vec<_>>>()?;

        let last = words.len() - 1;
        let code = self.registers.write_register(LCH_CNT, last as u32).await?;
        if !code.is_ok() {
            return Ok(code);
        }
        for (slot, word) in words.iter().rev().enumerate() {
            debug!("logical channel {} -> table slot {slot}", last - slot);
            let code = self
                .registers
                .write_register(channel_table_address(slot), *word)
                .await?;
            if !code.is_ok() {
                return Ok(code);
            }
        }

        self.channel_table = settings.to_vec();
        if self.state == DeviceState::Idle {
            self.transition(DeviceState::Configured);
        }
        Ok(ErrorCode::OK)
    }

    /// Read the channel table back from the module, in logical order.
    ///
    /// Stops at the first failing read and returns what was read so far.
    pub async fn read_channel_table(&mut self) -> Result<(Vec<ChannelSettings>, ErrorCode)> {
        let (last, code) = self.registers.read_int(LCH_CNT).await?;
        if !code.is_ok() {
            return Ok((Vec::new(), code));
        }
        let len = (last as usize + 1).min(LCH_TABLE_MAX_LEN);

        let mut settings = Vec::with_capacity(len);
        for logical in 0..len {
            let slot = len - 1 - logical;
            let (word, code) = self.registers.read_int(channel_table_address(slot)).await?;
            if !code.is_ok() {
                return Ok((settings, code));
            }
            settings.push(ChannelSettings::decode(word));
        }
        Ok((settings, ErrorCode::OK))
    }

    /// Same divisor goes to the IO_HARD and IO_ARITH banks
    pub async fn set_adc_frequency_divider(&mut self, divider: u32) -> Result<ErrorCode> {
        if !(1..=ADC_FREQ_DIV_MAX).contains(&divider) {
            return Err(E502Error::InvalidArgument(format!(
                "invalid ADC frequency divider {divider}, must be 1..={ADC_FREQ_DIV_MAX}"
            )));
        }
        let code = self.registers.write_register(ADC_FREQ_DIV, divider - 1).await?;
        if !code.is_ok() {
            return Ok(code);
        }
        self.registers
            .write_register(ARITH_ADC_FREQ_DIV, divider - 1)
            .await
    }

    pub async fn set_digital_frequency_divider(&mut self, divider: u32) -> Result<ErrorCode> {
        if divider == 0 {
            return Err(E502Error::InvalidArgument(
                "invalid digital lines frequency divider 0".to_owned(),
            ));
        }
        self.registers
            .write_register(DIGIN_FREQ_DIV, divider - 1)
            .await
    }

    /// Prime the input multiplexer.
    ///
    /// The multiplexer pipeline has two stages, so the register is written
    /// twice on purpose. Without it the first ADC sample is not aligned with
    /// the start of synchronous I/O.
    pub async fn preload_adc(&mut self) -> Result<ErrorCode> {
        for _ in 0..2 {
            let code = self.registers.write_register(PRELOAD_ADC, 1u32).await?;
            if !code.is_ok() {
                return Ok(code);
            }
        }
        if self.state == DeviceState::Configured {
            self.transition(DeviceState::Armed);
        }
        Ok(ErrorCode::OK)
    }

    pub async fn enable_in_stream(&mut self, from_adc: bool, from_digital: bool) -> Result<ErrorCode> {
        let mask = from_adc as u32 | (from_digital as u32) << 1;
        self.registers.write_register(IN_STREAM_ENABLE, mask).await
    }

    pub async fn start_data_stream(&mut self, direction: StreamDirection) -> Result<ErrorCode> {
        self.registers.channel().start_stream(direction).await
    }

    pub async fn stop_data_stream(&mut self, direction: StreamDirection) -> Result<ErrorCode> {
        let code = self.registers.channel().stop_stream(direction).await?;
        if direction == StreamDirection::Input {
            self.transition(DeviceState::Idle);
        }
        Ok(code)
    }

    pub async fn is_data_stream_running(
        &mut self,
        direction: StreamDirection,
    ) -> Result<(bool, ErrorCode)> {
        self.registers.channel().is_stream_running(direction).await
    }

    /// Start or stop the hardware-clocked acquisition engine
    pub async fn set_sync_io(&mut self, running: bool) -> Result<ErrorCode> {
        if running {
            match self.state {
                DeviceState::Idle => {
                    return Err(E502Error::InvalidState {
                        operation: "set_sync_io",
                        state: self.state,
                    });
                }
                DeviceState::Configured => {
                    warn!("starting synchronous I/O without preloading the ADC")
                }
                DeviceState::Armed | DeviceState::Streaming => {}
            }
        }

        let code = self.registers.write_register(GO_SYNC_IO, running).await?;
        if code.is_ok() {
            match (running, self.state) {
                (true, _) => self.transition(DeviceState::Streaming),
                (false, DeviceState::Streaming) => self.transition(DeviceState::Armed),
                _ => {}
            }
        }
        Ok(code)
    }

    /// Stop synchronous I/O and the input stream.
    ///
    /// Both requests are always issued, even if the first one fails, so the
    /// module does not keep pushing samples nobody reads.
    pub async fn terminate(&mut self) -> Result<ErrorCode> {
        let sync = self.set_sync_io(false).await;
        let stop = self.stop_data_stream(StreamDirection::Input).await;
        self.transition(DeviceState::Idle);

        let (sync, stop) = (sync?, stop?);
        Ok(if sync.is_ok() { stop } else { sync })
    }

    /// Drop and reopen the data connection so the next run starts on a
    /// portion boundary
    pub async fn reset_data_socket(&mut self) -> Result<ErrorCode> {
        if self.state == DeviceState::Streaming {
            return Err(E502Error::InvalidState {
                operation: "reset_data_socket",
                state: self.state,
            });
        }
        let code = self.registers.channel().request_data_socket_reset().await?;
        let data = self.transport.connect(Endpoint::Data).await?;
        self.reader.replace_stream(data);
        debug!("data connection reopened");
        Ok(code)
    }

    /// Read `sample_count` samples of every logical channel
    pub async fn read_portion(&mut self, sample_count: i64) -> Result<SampleMatrix> {
        let channels = self.channel_table.len();
        self.reader.read_portion(sample_count, channels).await
    }

    pub async fn hardware(&mut self) -> Result<(HardwareInfo, ErrorCode)> {
        let (word, code) = self.registers.read_hardware_word().await?;
        if !code.is_ok() {
            return Ok((HardwareInfo::default(), code));
        }
        Ok((HardwareInfo::decode(&word)?, code))
    }

    pub async fn module_data(&mut self) -> Result<(Vec<u8>, ErrorCode)> {
        self.registers.read_module_data().await
    }

    /// Cached calibration, `None` until loaded
    pub fn calibration(&self) -> Option<&CalibrationStore> {
        self.calibration.as_ref()
    }

    /// Read the calibration blob from flash, replacing any cached tables.
    ///
    /// A malformed blob is cached as empty tables.
    pub async fn load_calibration(&mut self) -> Result<ErrorCode> {
        let (blob, code) = self
            .registers
            .read_flash(CALIBRATION_FLASH_ADDRESS, CALIBRATION_FLASH_LEN)
            .await?;
        if !code.is_ok() {
            warn!("calibration flash read failed with device code {code}");
            return Ok(code);
        }

        let store = CalibrationStore::parse(&blob).unwrap_or_else(|err| {
            warn!("discarding calibration: {err}");
            CalibrationStore::default()
        });
        info!(
            "calibration loaded: {} ADC and {} DAC coefficient pairs",
            store.adc.offsets.len(),
            store.dac.offsets.len()
        );
        self.calibration = Some(store);
        Ok(ErrorCode::OK)
    }

    /// Set one of the 16 digital output lines, rewriting the whole mask
    pub async fn write_digital(&mut self, index: usize, on: bool) -> Result<ErrorCode> {
        if index >= DIGITAL_LINE_COUNT {
            return Err(E502Error::InvalidArgument(format!(
                "invalid digital line {index}"
            )));
        }
        if on {
            self.digital_out |= 1 << index;
        } else {
            self.digital_out &= !(1 << index);
        }
        self.registers
            .write_register(ASYNC_OUT, self.digital_out as u32)
            .await
    }

    /// Local mirror of the digital output lines
    pub fn digital_lines(&self) -> u16 {
        self.digital_out
    }

    /// Drive a DAC channel asynchronously, loading calibration on first use
    pub async fn write_analog(&mut self, index: usize, voltage: ElectricPotential) -> Result<ErrorCode> {
        if self.calibration.is_none() {
            let code = self.load_calibration().await?;
            if !code.is_ok() {
                return Ok(code);
            }
        }
        let dac = self
            .calibration
            .as_ref()
            .map(|store| &store.dac)
            .filter(|dac| index < dac.channel_count);
        let (Some((offset, scale)), Some(&select)) = (
            dac.and_then(|dac| dac.coefficients(0, index)),
            DAC_CHANNEL_SELECT.get(index),
        ) else {
            return Err(E502Error::InvalidArgument(format!(
                "DAC channel {index} is not calibrated"
            )));
        };

        // Float to int casts saturate at the i16 bounds
        let code = (voltage.get::<volt>() * scale * DAC_CODE_PER_VOLT + offset).round() as i16;
        let [low, high] = code.to_le_bytes();
        debug!("DAC{index} <- {code}");
        self.registers
            .write_register(ASYNC_OUT, [low, high, 0x00, select])
            .await
    }
}
