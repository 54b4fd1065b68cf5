//! Common utilities for usbmouse
//!
//! This crate provides functionality shared between the driver library and
//! its binary: error handling, logging setup, the async channel bridge
//! between the USB thread and the Tokio runtime, and test utilities.

pub mod channel;
pub mod error;
pub mod logging;
pub mod sync;
pub mod test_utils;

pub use channel::{
    DEFAULT_QUEUE_DEPTH, DriverBridge, DriverCommand, DriverEvent, DriverWorker,
    create_driver_bridge,
};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use sync::lock;
