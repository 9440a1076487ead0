use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use uom::si::f64::ElectricPotential;

use crate::device::channel::ChannelSettings;
use crate::device::controller::DIGITAL_LINE_COUNT;
use crate::protocol::stream::SampleMatrix;

/// Everything one acquisition run needs to configure the module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionPlan {
    /// Logical channel table, in logical order
    pub channels: Vec<ChannelSettings>,
    pub adc_frequency_divider: u32,
    pub digital_frequency_divider: Option<u32>,
    /// Samples per channel in every [`AcquisitionMessage::Samples`]
    pub portion_size: i64,
    /// Initial state of the digital output lines
    pub digital_lines: [bool; DIGITAL_LINE_COUNT],
    /// Run until stopped when `None`
    pub duration: Option<Duration>,
}

impl AcquisitionPlan {
    pub fn new(channels: Vec<ChannelSettings>, portion_size: i64) -> Self {
        Self {
            channels,
            adc_frequency_divider: 1,
            digital_frequency_divider: None,
            portion_size,
            digital_lines: [false; DIGITAL_LINE_COUNT],
            duration: None,
        }
    }
}

/// Requests accepted by a running acquisition.
///
/// Output writes are applied between portions, `Stop` takes effect at once.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum AcquisitionCommand {
    WriteDigital { line: usize, on: bool },
    WriteAnalog { channel: usize, voltage: ElectricPotential },
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    Requested,
    DurationElapsed,
    /// Nobody listens for samples anymore
    SinkClosed,
    /// Every command sender was dropped
    CommandsClosed,
}

/// Produced by the acquisition loop for its consumer
#[derive(Debug, Clone, Serialize)]
pub enum AcquisitionMessage {
    /// One portion, samples x logical channels
    Samples(SampleMatrix),
    Stopped { reason: StopReason, portions: usize },
    Failed(String),
}
