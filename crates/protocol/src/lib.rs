//! Protocol library for usbmouse
//!
//! This crate defines what the driver core and its collaborators agree on:
//! the HID boot-protocol mouse report, descriptor and identity types, the
//! [`BusDevice`] and [`InputSink`] contracts, and the error taxonomy.
//!
//! # Example
//!
//! ```
//! use protocol::DecodedReport;
//!
//! let report = DecodedReport::decode(&[0x03, 0x0A, 0xF6, 0x00]);
//! assert!(report.buttons.left && report.buttons.right);
//! assert_eq!((report.dx, report.dy, report.wheel), (10, -10, 0));
//! ```

pub mod bus;
pub mod error;
pub mod input;
pub mod report;
pub mod types;

pub use bus::{
    BusDevice, CompletionClass, CompletionHandler, DmaAddr, DmaBuffer, InterruptTransfer,
    SubmitError, TransferCompletion, TransferHandle, TransferStatus,
};
pub use error::{BusError, DriverError, InputError, Result, UnsupportedReason};
pub use input::{Capabilities, InputCallbacks, InputDeviceInfo, InputSink, RegistrationHandle};
pub use report::{
    BOOT_REPORT_LEN, Button, DecodedReport, InputEvent, MouseButtons, RelAxis,
    TRANSFER_BUFFER_LEN,
};
pub use types::{
    DeviceIdentity, DeviceLocation, Direction, EndpointDescriptor, EndpointType, InputId,
    InterfaceClass, MouseInfo,
};
