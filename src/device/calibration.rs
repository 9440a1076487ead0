//! Factory calibration coefficients stored in the module's flash.
//!
//! The blob is a sequence of records. Each record starts with a 48 byte header
//! followed by `range_count * channel_count` coefficient pairs, range-major:
//!
//! | offset | size | field                               |
//! |--------|------|-------------------------------------|
//! | 12     | 4    | target (0 none, 1 ADC, 2 DAC)       |
//! | 32     | 8    | timestamp, seconds since the epoch  |
//! | 40     | 4    | channel count                       |
//! | 44     | 4    | range count                         |
//! | 48     | 16n  | `offset: f64`, `scale: f64` pairs   |
//!
//! All fields are little-endian.

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{E502Error, Result};

pub const CALIBRATION_FLASH_ADDRESS: u32 = 0x1F_0080;
pub const CALIBRATION_FLASH_LEN: usize = 0xE0;

const RECORD_HEADER_LEN: usize = 48;
const TARGET_OFFSET: usize = 12;
const TIMESTAMP_OFFSET: usize = 32;
const CHANNEL_COUNT_OFFSET: usize = 40;
const RANGE_COUNT_OFFSET: usize = 44;
const ENTRY_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CalibrationTarget {
    Adc = 1,
    Dac = 2,
}

impl CalibrationTarget {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(CalibrationTarget::Adc),
            2 => Some(CalibrationTarget::Dac),
            _ => None,
        }
    }
}

/// Offset/scale pairs for one converter, indexed by `range * channel_count + channel`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CalibrationTable {
    pub channel_count: usize,
    pub range_count: usize,
    pub offsets: Vec<f64>,
    pub scales: Vec<f64>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl CalibrationTable {
    /// `(offset, scale)` for a range/channel pair
    pub fn coefficients(&self, range: usize, channel: usize) -> Option<(f64, f64)> {
        if channel >= self.channel_count || range >= self.range_count {
            return None;
        }
        let index = range * self.channel_count + channel;
        Some((*self.offsets.get(index)?, *self.scales.get(index)?))
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Serialize as a single flash record
    pub fn encode_record(&self, target: CalibrationTarget) -> Vec<u8> {
        let entries = self.channel_count * self.range_count;
        let mut record = vec![0u8; RECORD_HEADER_LEN];
        LittleEndian::write_u32(
            &mut record[TARGET_OFFSET..TARGET_OFFSET + 4],
            target as u32,
        );
        LittleEndian::write_i64(
            &mut record[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8],
            self.timestamp.map_or(0, |t| t.timestamp()),
        );
        LittleEndian::write_u32(
            &mut record[CHANNEL_COUNT_OFFSET..CHANNEL_COUNT_OFFSET + 4],
            self.channel_count as u32,
        );
        LittleEndian::write_u32(
            &mut record[RANGE_COUNT_OFFSET..RANGE_COUNT_OFFSET + 4],
            self.range_count as u32,
        );

        record.reserve(entries * ENTRY_LEN);
        for (offset, scale) in self.offsets.iter().zip(&self.scales).take(entries) {
            record.extend_from_slice(&offset.to_le_bytes());
            record.extend_from_slice(&scale.to_le_bytes());
        }
        record
    }
}

/// ADC and DAC calibration read from one flash blob
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CalibrationStore {
    pub adc: CalibrationTable,
    pub dac: CalibrationTable,
}

impl CalibrationStore {
    pub fn parse(blob: &[u8]) -> Result<Self> {
        let mut store = Self::default();
        let mut rest = blob;

        while !rest.is_empty() {
            if rest.len() < RECORD_HEADER_LEN {
                warn!(
                    "ignoring {} trailing calibration bytes shorter than a record header",
                    rest.len()
                );
                break;
            }

            let raw_target = LittleEndian::read_u32(&rest[TARGET_OFFSET..]);
            let target = CalibrationTarget::from_raw(raw_target);
            let timestamp = LittleEndian::read_i64(&rest[TIMESTAMP_OFFSET..]);
            let channel_count = LittleEndian::read_u32(&rest[CHANNEL_COUNT_OFFSET..]) as usize;
            let range_count = LittleEndian::read_u32(&rest[RANGE_COUNT_OFFSET..]) as usize;

            let entries = channel_count.checked_mul(range_count);
            let record_len = entries
                .and_then(|n| n.checked_mul(ENTRY_LEN))
                .and_then(|body| body.checked_add(RECORD_HEADER_LEN))
                .filter(|&len| len <= rest.len());

            let (Some(entries), Some(record_len)) = (entries, record_len) else {
                if let Some(target) = target {
                    return Err(E502Error::InvalidCalibrationData(format!(
                        "{target:?} record declares {range_count} ranges x {channel_count} channels \
                         but only {} bytes remain",
                        rest.len()
                    )));
                }
                // Erased flash after the last record
                debug!(
                    "calibration parsing stopped at unused record (target {raw_target:#x}), {} bytes left",
                    rest.len()
                );
                break;
            };

            match target {
                Some(target) => {
                    let mut table = CalibrationTable {
                        channel_count,
                        range_count,
                        offsets: Vec::with_capacity(entries),
                        scales: Vec::with_capacity(entries),
                        timestamp: DateTime::from_timestamp(timestamp, 0),
                    };
                    for entry in rest[RECORD_HEADER_LEN..record_len].chunks_exact(ENTRY_LEN) {
                        table.offsets.push(LittleEndian::read_f64(&entry[..8]));
                        table.scales.push(LittleEndian::read_f64(&entry[8..]));
                    }

                    let slot = match target {
                        CalibrationTarget::Adc => &mut store.adc,
                        CalibrationTarget::Dac => &mut store.dac,
                    };
                    if !slot.is_empty() {
                        warn!("duplicate {target:?} calibration record replaces the previous one");
                    }
                    debug!("parsed {target:?} calibration: {range_count} ranges x {channel_count} channels");
                    *slot = table;
                }
                None => debug!("skipping calibration record with target {raw_target:#x}"),
            }

            rest = &rest[record_len..];
        }

        Ok(store)
    }

    pub fn table(&self, target: CalibrationTarget) -> &CalibrationTable {
        match target {
            CalibrationTarget::Adc => &self.adc,
            CalibrationTarget::Dac => &self.dac,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.adc.is_empty() && self.dac.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(channel_count: usize, range_count: usize, base: f64) -> CalibrationTable {
        let entries = channel_count * range_count;
        CalibrationTable {
            channel_count,
            range_count,
            offsets: (0..entries).map(|i| base + i as f64).collect(),
            scales: (0..entries).map(|i| (base + i as f64) * 0.5).collect(),
            timestamp: DateTime::from_timestamp(1_600_000_000, 0),
        }
    }

    #[test]
    fn parses_adc_then_dac_records() {
        let adc = table(2, 1, 10.0);
        let dac = table(2, 1, 20.0);
        let mut blob = adc.encode_record(CalibrationTarget::Adc);
        blob.extend(dac.encode_record(CalibrationTarget::Dac));

        let store = CalibrationStore::parse(&blob).unwrap();
        assert_eq!(store.adc.offsets, vec![10.0, 11.0]);
        assert_eq!(store.adc.scales, vec![5.0, 5.5]);
        assert_eq!(store.dac.offsets, vec![20.0, 21.0]);
        assert_eq!(store.dac.coefficients(0, 1), Some((21.0, 10.5)));
        assert_eq!(store.dac.coefficients(1, 0), None);
        assert_eq!(store, CalibrationStore { adc, dac });
    }

    #[test]
    fn range_major_channel_minor_order() {
        let adc = table(3, 2, 0.0);
        let store = CalibrationStore::parse(&adc.encode_record(CalibrationTarget::Adc)).unwrap();
        // range 1, channel 2 is the last entry
        assert_eq!(store.adc.coefficients(1, 2), Some((5.0, 2.5)));
        assert_eq!(store.adc.coefficients(0, 2), Some((2.0, 1.0)));
    }

    #[test]
    fn unknown_target_is_skipped_without_desync() {
        let mut unknown = table(1, 3, 99.0).encode_record(CalibrationTarget::Adc);
        LittleEndian::write_u32(&mut unknown[TARGET_OFFSET..], 0);
        let dac = table(2, 1, 5.0);

        let mut blob = unknown;
        blob.extend(dac.encode_record(CalibrationTarget::Dac));

        let store = CalibrationStore::parse(&blob).unwrap();
        assert!(store.adc.is_empty());
        assert_eq!(store.dac, dac);
    }

    #[test]
    fn erased_flash_tail_ends_parsing() {
        let dac = table(2, 1, 0.0);
        let mut blob = dac.encode_record(CalibrationTarget::Dac);
        blob.resize(CALIBRATION_FLASH_LEN, 0xFF);

        let store = CalibrationStore::parse(&blob).unwrap();
        assert_eq!(store.dac, dac);
        assert!(store.adc.is_empty());
    }

    #[test]
    fn truncated_record_is_an_error() {
        let mut blob = table(2, 2, 0.0).encode_record(CalibrationTarget::Adc);
        blob.truncate(blob.len() - 1);
        assert!(matches!(
            CalibrationStore::parse(&blob),
            Err(E502Error::InvalidCalibrationData(_))
        ));
    }

    #[test]
    fn empty_blob_gives_empty_store() {
        assert!(CalibrationStore::parse(&[]).unwrap().is_empty());
    }
}
