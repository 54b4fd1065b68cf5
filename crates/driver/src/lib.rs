//! USB boot-protocol mouse driver
//!
//! Turns interrupt-transfer completions from a USB HID boot mouse into
//! decoded pointer and button reports, while keeping exactly one transfer in
//! flight for every open device.
//!
//! The core ([`usb::TransferBuffer`], [`usb::TransferLoop`],
//! [`usb::DeviceSession`], [`usb::SessionManager`]) only talks to the outside
//! world through [`protocol::BusDevice`] and [`protocol::InputSink`].
//! [`usb::RusbMouse`] and [`input::BridgeSink`] are the collaborators the
//! `usbmouse` binary plugs in.

pub mod config;
pub mod input;
pub mod usb;

pub use config::{DriverConfig, OutputFormat};
pub use input::BridgeSink;
pub use usb::{DeviceSession, SessionManager, SessionPhase, TransferLoop};
