//! Simulated transport and capture devices for driving the negotiation core
//! without a media stack.

mod capture;
mod transport;

pub use capture::{SimCaptureDevices, SimCaptureSource};
pub use transport::{SimNetwork, SimOptions, SimTransport};
