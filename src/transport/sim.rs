//! In-memory E-502 that speaks the real wire protocol.
//!
//! Each connection is one half of a [`tokio::io::duplex`] pipe, the other half
//! is served by a spawned task. All tasks share one [`SimDevice`], which tests
//! keep a handle to in order to inspect register writes or inject device
//! error codes.

use std::collections::HashMap;
use std::f32::consts::TAU;
use std::sync::{Arc, Mutex, MutexGuard};

use byteorder::{ByteOrder, LittleEndian};
use chrono::{TimeZone, Utc};
use rand::random_range;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};
use uom::si::electric_potential::volt;

use crate::device::calibration::{
    CALIBRATION_FLASH_ADDRESS, CalibrationStore, CalibrationTable, CalibrationTarget,
};
use crate::device::channel::ChannelSettings;
use crate::device::registers::{
    GO_SYNC_IO, IN_STREAM_ENABLE, LCH_CNT, LCH_TABLE_MAX_LEN, MODULE_DATA_LEN, channel_table_address,
};
use crate::error::Result;
use crate::protocol::control::{Command, REQUEST_TAG};
use crate::transport::{BoxedStream, DeviceTransport, Endpoint};

/// Interval between two generated sample blocks
const SAMPLE_PERIOD: Duration = Duration::from_millis(10);
/// Samples per channel in one generated block
pub const DEFAULT_BLOCK_LEN: usize = 100;
const PIPE_CAPACITY: usize = 64 * 1024;
const FLASH_BASE: u32 = 0x1F_0000;
const FLASH_SIZE: usize = 0x1_0000;
const DAC_STREAM_FLAG: u32 = 1 << 16;

/// Module status code for requests the simulator does not implement
pub const UNSUPPORTED_COMMAND: i32 = -1;
/// Module status code for flash accesses outside the simulated region
pub const FLASH_OUT_OF_RANGE: i32 = -2;

/// E502-X-EU-D, interface logic 1, board revision 2, FPGA 1.5
pub const DEFAULT_HARDWARE_WORD: [u8; 4] = [0x13, 0x02, 0x05, 0x01];

struct SimState {
    registers: HashMap<u32, u32>,
    writes: Vec<(u32, Vec<u8>)>,
    commands: Vec<Command>,
    injected: HashMap<Command, i32>,
    flash: Vec<u8>,
    hardware: [u8; 4],
    in_stream: bool,
    out_stream: bool,
    data_generation: u64,
    data_connections: usize,
    block_len: usize,
    sample_index: u64,
}

/// Shared state of one simulated module
#[derive(Clone)]
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimDevice {
    fn default() -> Self {
        let mut flash = vec![0xFF; FLASH_SIZE];
        let blob = default_calibration_blob();
        let start = (CALIBRATION_FLASH_ADDRESS - FLASH_BASE) as usize;
        flash[start..start + blob.len()].copy_from_slice(&blob);

        Self {
            state: Arc::new(Mutex::new(SimState {
                registers: HashMap::new(),
                writes: Vec::new(),
                commands: Vec::new(),
                injected: HashMap::new(),
                flash,
                hardware: DEFAULT_HARDWARE_WORD,
                in_stream: false,
                out_stream: false,
                data_generation: 0,
                data_connections: 0,
                block_len: DEFAULT_BLOCK_LEN,
                sample_index: 0,
            })),
        }
    }
}

impl SimDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panicking serve task must not take the whole simulator down
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every register write so far, in order: `(address, payload)`
    pub fn writes(&self) -> Vec<(u32, Vec<u8>)> {
        self.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    /// Last word written to `address`
    pub fn register(&self, address: u32) -> Option<u32> {
        self.lock().registers.get(&address).copied()
    }

    /// Opcodes of every control request received
    pub fn commands(&self) -> Vec<Command> {
        self.lock().commands.clone()
    }

    /// Answer every following `command` with `code` and no side effects
    pub fn inject_error(&self, command: Command, code: i32) {
        self.lock().injected.insert(command, code);
    }

    pub fn clear_errors(&self) {
        self.lock().injected.clear();
    }

    pub fn set_hardware_word(&self, word: [u8; 4]) {
        self.lock().hardware = word;
    }

    /// Overwrite the calibration area of the flash
    pub fn set_calibration_blob(&self, blob: &[u8]) {
        let start = (CALIBRATION_FLASH_ADDRESS - FLASH_BASE) as usize;
        let mut state = self.lock();
        let end = (start + blob.len()).min(FLASH_SIZE);
        state.flash[start..end].copy_from_slice(&blob[..end - start]);
    }

    /// Samples per channel in each generated block. Portions read with the
    /// same size stay channel-aligned.
    pub fn set_block_len(&self, block_len: usize) {
        self.lock().block_len = block_len.max(1);
    }

    pub fn is_stream_running(&self) -> bool {
        self.lock().in_stream
    }

    /// How many data connections were opened so far
    pub fn data_connections(&self) -> usize {
        self.lock().data_connections
    }

    fn handle(&self, command: u32, parameter: u32, payload: &[u8], expected: usize) -> (i32, Vec<u8>) {
        let Ok(command) = Command::try_from(command) else {
            warn!("simulated E-502 got unknown command {command:#04x}");
            return (UNSUPPORTED_COMMAND, Vec::new());
        };

        let mut state = self.lock();
        state.commands.push(command);
        if let Some(&code) = state.injected.get(&command) {
            return (code, Vec::new());
        }

        match command {
            Command::ReadRegister => {
                let word = state.registers.get(&parameter).copied().unwrap_or(0);
                (0, word.to_le_bytes().to_vec())
            }
            Command::WriteRegister => {
                let mut word = [0u8; 4];
                let len = payload.len().min(4);
                word[..len].copy_from_slice(&payload[..len]);
                state.registers.insert(parameter, u32::from_le_bytes(word));
                state.writes.push((parameter, payload.to_vec()));
                (0, Vec::new())
            }
            Command::StreamStart | Command::StreamStop => {
                let running = command == Command::StreamStart;
                if parameter & DAC_STREAM_FLAG != 0 {
                    state.out_stream = running;
                } else {
                    state.in_stream = running;
                }
                (0, Vec::new())
            }
            Command::StreamIsRunning => {
                let running = if parameter & DAC_STREAM_FLAG != 0 {
                    state.out_stream
                } else {
                    state.in_stream
                };
                (0, vec![running as u8])
            }
            Command::FlashRead => match flash_range(parameter, expected) {
                Some(range) => (0, state.flash[range].to_vec()),
                None => (FLASH_OUT_OF_RANGE, Vec::new()),
            },
            Command::FlashWrite => match flash_range(parameter, payload.len()) {
                Some(range) => {
                    state.flash[range].copy_from_slice(payload);
                    (0, Vec::new())
                }
                None => (FLASH_OUT_OF_RANGE, Vec::new()),
            },
            Command::ResetDataSocket => {
                state.data_generation += 1;
                (0, Vec::new())
            }
            Command::ModuleInfo if expected == state.hardware.len() => (0, state.hardware.to_vec()),
            Command::ModuleInfo => {
                let mut data = vec![0u8; MODULE_DATA_LEN];
                data[..4].copy_from_slice(b"E502");
                (0, data)
            }
        }
    }

    /// Next sample block if the module is acquiring, channel-major
    fn next_block(&self) -> Option<Vec<u8>> {
        let mut state = self.lock();
        let streaming = state.in_stream
            && state.registers.get(&GO_SYNC_IO).is_some_and(|&go| go != 0)
            && state.registers.get(&IN_STREAM_ENABLE).is_some_and(|&mask| mask & 1 != 0);
        if !streaming {
            return None;
        }

        let channels = state
            .registers
            .get(&LCH_CNT)
            .map_or(1, |&last| (last as usize + 1).min(LCH_TABLE_MAX_LEN));
        let amplitudes = (0..channels)
            .map(|logical| {
                let slot = channels - 1 - logical;
                let word = state.registers.get(&channel_table_address(slot)).copied();
                word.and_then(|word| ChannelSettings::decode(word).voltage_range())
                    .map_or(1.0, |range| range.full_scale().get::<volt>() as f32)
            })
            .collect::<Vec<_>>();

        let samples = state.block_len;
        let first = state.sample_index;
        state.sample_index += samples as u64;
        drop(state);

        let mut values = Vec::with_capacity(samples * channels);
        for (channel, amplitude) in amplitudes.iter().enumerate() {
            for n in 0..samples as u64 {
                let phase = (first + n) as f32 / 100.0 + channel as f32;
                let noise = random_range(-0.01..=0.01);
                values.push(amplitude * (0.8 * (TAU * phase).sin() + noise));
            }
        }
        let mut bytes = vec![0u8; values.len() * 4];
        LittleEndian::write_f32_into(&values, &mut bytes);
        Some(bytes)
    }
}

fn flash_range(address: u32, len: usize) -> Option<std::ops::Range<usize>> {
    let start = address.checked_sub(FLASH_BASE)? as usize;
    let end = start.checked_add(len)?;
    (end <= FLASH_SIZE).then_some(start..end)
}

/// Factory calibration the simulated module ships with
pub fn default_calibration() -> CalibrationStore {
    let timestamp = Utc.with_ymd_and_hms(2021, 3, 15, 12, 0, 0).single();
    CalibrationStore {
        adc: CalibrationTable {
            channel_count: 1,
            range_count: 6,
            offsets: vec![-12.0, -11.5, -11.0, -10.5, -10.0, -9.5],
            scales: vec![1.0015, 1.002, 1.0025, 1.003, 1.0035, 1.004],
            timestamp,
        },
        dac: CalibrationTable {
            channel_count: 2,
            range_count: 1,
            offsets: vec![16.0, -24.0],
            scales: vec![0.5, 0.25],
            timestamp,
        },
    }
}

fn default_calibration_blob() -> Vec<u8> {
    let calibration = default_calibration();
    let mut blob = calibration.adc.encode_record(CalibrationTarget::Adc);
    blob.extend(calibration.dac.encode_record(CalibrationTarget::Dac));
    blob
}

async fn serve_control(device: SimDevice, mut pipe: DuplexStream) {
    loop {
        let mut header = [0u8; 20];
        if pipe.read_exact(&mut header).await.is_err() {
            debug!("simulated control connection closed");
            return;
        }
        if header[..4] != REQUEST_TAG {
            warn!("simulated E-502 got a request with tag {:02x?}", &header[..4]);
            return;
        }
        let command = LittleEndian::read_u32(&header[4..8]);
        let parameter = LittleEndian::read_u32(&header[8..12]);
        let payload_len = LittleEndian::read_u32(&header[12..16]) as usize;
        let expected = LittleEndian::read_u32(&header[16..20]) as usize;

        let mut payload = vec![0u8; payload_len];
        if pipe.read_exact(&mut payload).await.is_err() {
            return;
        }

        let (code, mut reply) = device.handle(command, parameter, &payload, expected);
        reply.truncate(expected);

        let mut frame = Vec::with_capacity(12 + reply.len());
        frame.extend_from_slice(&REQUEST_TAG);
        frame.extend_from_slice(&code.to_le_bytes());
        frame.extend_from_slice(&(reply.len() as u32).to_le_bytes());
        frame.extend_from_slice(&reply);
        if pipe.write_all(&frame).await.is_err() {
            return;
        }
    }
}

async fn serve_data(device: SimDevice, mut pipe: DuplexStream, generation: u64) {
    let mut ticker = time::interval(SAMPLE_PERIOD);
    loop {
        ticker.tick().await;
        if device.lock().data_generation != generation {
            debug!("simulated data connection reset");
            return;
        }
        if let Some(block) = device.next_block() {
            if pipe.write_all(&block).await.is_err() {
                debug!("simulated data connection closed by host");
                return;
            }
        }
    }
}

/// Transport whose connections end in a [`SimDevice`]
#[derive(Clone, Default)]
pub struct SimTransport {
    device: SimDevice,
}

impl SimTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(device: SimDevice) -> Self {
        Self { device }
    }

    pub fn device(&self) -> SimDevice {
        self.device.clone()
    }
}

#[async_trait::async_trait]
impl DeviceTransport for SimTransport {
    async fn connect(&self, endpoint: Endpoint) -> Result<BoxedStream> {
        let (host, pipe) = duplex(PIPE_CAPACITY);
        let device = self.device.clone();
        match endpoint {
            Endpoint::Control => {
                tokio::spawn(serve_control(device, pipe));
            }
            Endpoint::Data => {
                let generation = {
                    let mut state = device.lock();
                    state.data_connections += 1;
                    state.data_generation
                };
                tokio::spawn(serve_data(device, pipe, generation));
            }
        }
        info!("Connected to simulated E-502 {endpoint:?} endpoint");
        Ok(Box::new(host))
    }

    fn peer(&self) -> String {
        "simulated E-502".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::calibration::CALIBRATION_FLASH_LEN;
    use crate::device::channel::{ChannelMode, VoltageRange};
    use crate::device::registers::LCH_TABLE;

    #[test]
    fn default_blob_fills_calibration_area() {
        let blob = default_calibration_blob();
        assert_eq!(blob.len(), CALIBRATION_FLASH_LEN);
        assert_eq!(CalibrationStore::parse(&blob).unwrap(), default_calibration());
    }

    #[test]
    fn unknown_command_reports_unsupported() {
        let device = SimDevice::new();
        assert_eq!(device.handle(0x99, 0, &[], 0), (UNSUPPORTED_COMMAND, vec![]));
    }

    #[test]
    fn injected_error_suppresses_side_effects() {
        let device = SimDevice::new();
        device.inject_error(Command::WriteRegister, -7);
        let (code, _) = device.handle(0x11, LCH_CNT, &[1, 0, 0, 0], 0);
        assert_eq!(code, -7);
        assert!(device.writes().is_empty());
        assert_eq!(device.register(LCH_CNT), None);
    }

    #[test]
    fn block_scales_with_channel_range() {
        let device = SimDevice::new();
        let narrow = ChannelSettings::with(VoltageRange::Bipolar02V, 0, ChannelMode::CommonGroundLow, 1)
            .unwrap()
            .encode()
            .unwrap();
        for (address, value) in [
            (LCH_CNT, 0),
            (LCH_TABLE, narrow),
            (GO_SYNC_IO, 1),
            (IN_STREAM_ENABLE, 1),
        ] {
            device.handle(0x11, address, &value.to_le_bytes(), 0);
        }
        assert!(device.next_block().is_none());

        device.handle(0x12, 0, &[], 0);
        let block = device.next_block().unwrap();
        assert_eq!(block.len(), DEFAULT_BLOCK_LEN * 4);
        let mut values = vec![0f32; DEFAULT_BLOCK_LEN];
        LittleEndian::read_f32_into(&block, &mut values);
        assert!(values.iter().all(|v| v.abs() <= 0.2));
    }
}
