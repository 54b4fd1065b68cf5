//! Input-distribution collaborator contract
//!
//! A session registers itself with an [`InputSink`] on attach, emits one
//! [`DecodedReport`] per successful completion, and unregisters on detach.
//! The sink decides when the device is in use and says so through the
//! [`InputCallbacks`] it received at registration.

use crate::error::{DriverError, InputError};
use crate::report::{Button, DecodedReport, RelAxis};
use crate::types::InputId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Handle returned by [`InputSink::register_device`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistrationHandle(pub u32);

/// Event capabilities a device declares at registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub buttons: Vec<Button>,
    pub relative_axes: Vec<RelAxis>,
}

impl Capabilities {
    /// Five buttons plus X, Y and wheel
    pub fn boot_mouse() -> Self {
        Self {
            buttons: Button::ALL.to_vec(),
            relative_axes: RelAxis::ALL.to_vec(),
        }
    }
}

/// Description of a device being registered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDeviceInfo {
    pub name: String,
    pub phys: String,
    pub id: InputId,
    pub capabilities: Capabilities,
}

/// Hooks the sink calls when the first user opens or the last user closes
pub trait InputCallbacks: Send + Sync {
    fn open(&self) -> Result<(), DriverError>;

    fn close(&self);
}

/// Input-distribution subsystem
pub trait InputSink: Send + Sync {
    fn register_device(
        &self,
        info: InputDeviceInfo,
        callbacks: Arc<dyn InputCallbacks>,
    ) -> Result<RegistrationHandle, InputError>;

    /// Deliver one report
    ///
    /// Called from the bus completion context; must not block.
    fn emit(&self, handle: RegistrationHandle, report: &DecodedReport);

    fn unregister_device(&self, handle: RegistrationHandle);
}
