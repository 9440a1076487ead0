use std::fmt;

use serde::{Deserialize, Serialize};
use uom::si::{electric_potential::volt, f64::ElectricPotential};

use crate::error::{E502Error, Result};

pub const MAX_PHYSICAL_CHANNEL: u8 = 15;
pub const MAX_AVERAGING: u8 = 128;

const RANGE_MASK: u32 = 0x7;
const PHYSICAL_CHANNEL_SHIFT: u32 = 3;
const PHYSICAL_CHANNEL_MASK: u32 = 0xF;
const MODE_SHIFT: u32 = 7;
const MODE_MASK: u32 = 0x3;
const AVERAGING_SHIFT: u32 = 9;
const AVERAGING_MASK: u32 = 0x7F;

/// ADC input range of a logical channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoltageRange {
    Bipolar10V = 0,
    Bipolar5V = 1,
    Bipolar2V = 2,
    Bipolar1V = 3,
    Bipolar05V = 4,
    Bipolar02V = 5,
}

impl VoltageRange {
    pub const ALL: [VoltageRange; 6] = [
        VoltageRange::Bipolar10V,
        VoltageRange::Bipolar5V,
        VoltageRange::Bipolar2V,
        VoltageRange::Bipolar1V,
        VoltageRange::Bipolar05V,
        VoltageRange::Bipolar02V,
    ];

    /// Upper bound of the symmetric range
    pub fn full_scale(self) -> ElectricPotential {
        let volts = match self {
            VoltageRange::Bipolar10V => 10.0,
            VoltageRange::Bipolar5V => 5.0,
            VoltageRange::Bipolar2V => 2.0,
            VoltageRange::Bipolar1V => 1.0,
            VoltageRange::Bipolar05V => 0.5,
            VoltageRange::Bipolar02V => 0.2,
        };
        ElectricPotential::new::<volt>(volts)
    }
}

impl TryFrom<u8> for VoltageRange {
    type Error = E502Error;

    fn try_from(value: u8) -> Result<Self> {
        VoltageRange::ALL
            .get(value as usize)
            .copied()
            .ok_or_else(|| E502Error::InvalidArgument(format!("invalid channel range {value}")))
    }
}

/// Input wiring of a logical channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelMode {
    Differential = 0,
    /// Inputs 1-16 against common ground
    CommonGroundLow = 1,
    /// Inputs 17-32 against common ground
    CommonGroundHigh = 2,
    /// Internal zero reference
    Zero = 3,
}

impl TryFrom<u8> for ChannelMode {
    type Error = E502Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ChannelMode::Differential),
            1 => Ok(ChannelMode::CommonGroundLow),
            2 => Ok(ChannelMode::CommonGroundHigh),
            3 => Ok(ChannelMode::Zero),
            _ => Err(E502Error::InvalidArgument(format!(
                "invalid channel mode {value}"
            ))),
        }
    }
}

/// One entry of the module's logical channel table.
///
/// Register layout (32 bits, upper 16 reserved):
///
/// | bits  | field                 |
/// |-------|-----------------------|
/// | 2-0   | range (6, 7 reserved) |
/// | 6-3   | physical channel      |
/// | 8-7   | mode                  |
/// | 15-9  | averaging - 1         |
///
/// Fields start unset when built by hand; every field must be set before the
/// entry can be encoded. Decoded entries keep the raw range bits, so a reserved
/// range read back from a module is visible but refuses to encode again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSettings {
    range: Option<u8>,
    physical_channel: Option<u8>,
    mode: Option<u8>,
    averaging: Option<u8>,
}

impl ChannelSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fully specified settings in one go
    pub fn with(
        range: VoltageRange,
        physical_channel: u8,
        mode: ChannelMode,
        averaging: u8,
    ) -> Result<Self> {
        let mut settings = Self::new();
        settings.set_range(range as u8)?;
        settings.set_physical_channel(physical_channel)?;
        settings.set_mode(mode as u8)?;
        settings.set_averaging(averaging)?;
        Ok(settings)
    }

    pub fn decode(value: u32) -> Self {
        Self {
            range: Some((value & RANGE_MASK) as u8),
            physical_channel: Some(((value >> PHYSICAL_CHANNEL_SHIFT) & PHYSICAL_CHANNEL_MASK) as u8),
            mode: Some(((value >> MODE_SHIFT) & MODE_MASK) as u8),
            averaging: Some((((value >> AVERAGING_SHIFT) & AVERAGING_MASK) + 1) as u8),
        }
    }

    pub fn encode(&self) -> Result<u32> {
        let (Some(range), Some(physical_channel), Some(mode), Some(averaging)) =
            (self.range, self.physical_channel, self.mode, self.averaging)
        else {
            return Err(E502Error::InvalidSettings(
                "some or all settings are not defined".to_owned(),
            ));
        };

        if VoltageRange::try_from(range).is_err() {
            return Err(E502Error::InvalidSettings(format!("reserved range {range}")));
        }
        if physical_channel > MAX_PHYSICAL_CHANNEL
            || mode > ChannelMode::Zero as u8
            || !(1..=MAX_AVERAGING).contains(&averaging)
        {
            return Err(E502Error::InvalidSettings(format!("{self}")));
        }

        Ok(range as u32
            | (physical_channel as u32) << PHYSICAL_CHANNEL_SHIFT
            | (mode as u32) << MODE_SHIFT
            | (averaging as u32 - 1) << AVERAGING_SHIFT)
    }

    pub fn range(&self) -> Option<u8> {
        self.range
    }

    /// The range as a known enum value, `None` if unset or reserved
    pub fn voltage_range(&self) -> Option<VoltageRange> {
        self.range.and_then(|r| VoltageRange::try_from(r).ok())
    }

    pub fn set_range(&mut self, range: u8) -> Result<()> {
        VoltageRange::try_from(range)?;
        self.range = Some(range);
        Ok(())
    }

    pub fn physical_channel(&self) -> Option<u8> {
        self.physical_channel
    }

    pub fn set_physical_channel(&mut self, channel: u8) -> Result<()> {
        if channel > MAX_PHYSICAL_CHANNEL {
            return Err(E502Error::InvalidArgument(format!(
                "invalid physical channel number {channel}"
            )));
        }
        self.physical_channel = Some(channel);
        Ok(())
    }

    pub fn mode(&self) -> Option<u8> {
        self.mode
    }

    /// The mode as an enum value, `None` if unset
    pub fn channel_mode(&self) -> Option<ChannelMode> {
        self.mode.and_then(|m| ChannelMode::try_from(m).ok())
    }

    pub fn set_mode(&mut self, mode: u8) -> Result<()> {
        ChannelMode::try_from(mode)?;
        self.mode = Some(mode);
        Ok(())
    }

    pub fn averaging(&self) -> Option<u8> {
        self.averaging
    }

    pub fn set_averaging(&mut self, averaging: u8) -> Result<()> {
        if !(1..=MAX_AVERAGING).contains(&averaging) {
            return Err(E502Error::InvalidArgument(format!(
                "invalid channel averaging {averaging}"
            )));
        }
        self.averaging = Some(averaging);
        Ok(())
    }
}

impl fmt::Display for ChannelSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "range={:?} physical_channel={:?} mode={:?} averaging={:?}",
            self.range, self.physical_channel, self.mode, self.averaging
        )
    }
}
