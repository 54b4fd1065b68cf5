//! USB subsystem
//!
//! The driver core and its libusb plumbing:
//! - [`buffer`]: the session's DMA transfer buffer and its check-out discipline
//! - [`controller`]: the interrupt transfer loop and completion policy
//! - [`session`]: attach/open/close/detach of one boot mouse
//! - [`manager`]: sessions keyed by bus location, hot-plug reactions
//! - [`host`]: the `rusb` bus collaborator
//! - [`worker`]: the dedicated USB thread
//!
//! The USB subsystem runs in a dedicated thread (worker) to avoid blocking
//! the Tokio async runtime; completions are delivered on per-device poller
//! threads.

pub mod buffer;
pub mod controller;
pub mod host;
pub mod manager;
pub mod session;
pub mod worker;

// Re-export public types
pub use buffer::TransferBuffer;
pub use controller::{LoopPhase, LoopStats, StopReason, TransferLoop};
pub use host::{RusbMouse, RusbOptions, map_rusb_error, map_transfer_status};
pub use manager::{ManagerOptions, SessionManager};
pub use session::{DeviceSession, SessionPhase};
pub use worker::{DriverWorkerThread, enumerate_boot_mice, spawn_driver_worker};
