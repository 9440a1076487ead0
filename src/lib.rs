//! Host-side driver for the L-Card E-502 data acquisition module over Ethernet.
//!
//! The module exposes two TCP endpoints: a request/response control connection
//! for registers, flash and stream control, and a one-way data connection that
//! carries float32 samples while synchronous I/O runs.

pub mod acquisition;
pub mod config;
pub mod device;
pub mod error;
pub mod messages;
pub mod protocol;
pub mod transport;

pub use config::{Backend, DeviceConfig};
pub use device::{ChannelSettings, DeviceController, DeviceState};
pub use error::{E502Error, ErrorCode, Result};
