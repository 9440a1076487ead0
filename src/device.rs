pub mod calibration;
pub mod channel;
pub mod controller;
pub mod hardware_info;
pub mod registers;

pub use calibration::{CalibrationStore, CalibrationTable, CalibrationTarget};
pub use channel::{ChannelMode, ChannelSettings, VoltageRange};
pub use controller::{DeviceController, DeviceState};
pub use hardware_info::HardwareInfo;
