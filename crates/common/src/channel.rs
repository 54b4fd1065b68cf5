//! Async channel bridge between Tokio runtime and USB thread

use async_channel::{Receiver, Sender, bounded};
use protocol::{DecodedReport, DeviceLocation, MouseInfo};

/// Default depth of the command and event queues
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Commands from Tokio runtime to USB thread
#[derive(Debug)]
pub enum DriverCommand {
    /// List attached mice
    ListDevices {
        /// Channel to send response back
        response: tokio::sync::oneshot::Sender<Vec<MouseInfo>>,
    },

    /// Close and detach every session, then stop the USB thread
    Shutdown,
}

/// Events from the USB thread
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// A mouse was attached and registered with the input sink
    DeviceAttached {
        /// Full device information
        device: MouseInfo,
    },

    /// A mouse was detached
    DeviceDetached {
        location: DeviceLocation,
        phys: String,
    },

    /// One decoded report
    Report {
        phys: String,
        report: DecodedReport,
    },
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct DriverBridge {
    cmd_tx: Sender<DriverCommand>,
    event_rx: Receiver<DriverEvent>,
}

impl DriverBridge {
    /// Send a command to the USB thread
    pub async fn send_command(&self, cmd: DriverCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event from the USB thread
    pub async fn recv_event(&self) -> crate::Result<DriverEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle for USB thread (blocking)
#[derive(Clone)]
pub struct DriverWorker {
    pub(crate) cmd_rx: Receiver<DriverCommand>,
    /// Event sender, shared by the session manager and the input sink
    pub event_tx: Sender<DriverEvent>,
}

impl DriverWorker {
    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<DriverCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Whether every runtime-side handle has been dropped
    pub fn is_disconnected(&self) -> bool {
        self.cmd_rx.is_closed()
    }
}

/// Create the channel bridge between Tokio and USB thread
///
/// Returns (DriverBridge for Tokio, DriverWorker for USB thread)
pub fn create_driver_bridge(queue_depth: usize) -> (DriverBridge, DriverWorker) {
    let (cmd_tx, cmd_rx) = bounded(queue_depth.max(1));
    let (event_tx, event_rx) = bounded(queue_depth.max(1));

    (
        DriverBridge { cmd_tx, event_rx },
        DriverWorker { cmd_rx, event_tx },
    )
}
