pub mod control;
pub mod stream;

pub use control::{Command, ControlChannel, Response};
pub use stream::{SampleMatrix, StreamDirection, StreamingReader};
