//! Input sink backed by the driver event channel
//!
//! [`BridgeSink`] plays the input-distribution role for the `usbmouse`
//! binary: it keeps track of registered mice and their open/close callbacks
//! and forwards each decoded report to the Tokio side as a
//! [`DriverEvent::Report`].

use async_channel::{Sender, TrySendError};
use common::{DriverEvent, lock};
use protocol::{
    DecodedReport, DriverError, InputCallbacks, InputDeviceInfo, InputError, InputSink,
    RegistrationHandle,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

struct BridgeDevice {
    info: InputDeviceInfo,
    callbacks: Arc<dyn InputCallbacks>,
    opened: bool,
}

#[derive(Default)]
struct BridgeState {
    next_handle: u32,
    devices: HashMap<RegistrationHandle, BridgeDevice>,
}

/// Input sink publishing reports on the driver event channel
pub struct BridgeSink {
    events: Sender<DriverEvent>,
    state: Mutex<BridgeState>,
    dropped: AtomicU64,
    /// Set while the queue is full so the warning is logged once per episode
    congested: AtomicBool,
}

impl BridgeSink {
    pub fn new(events: Sender<DriverEvent>) -> Self {
        Self {
            events,
            state: Mutex::new(BridgeState::default()),
            dropped: AtomicU64::new(0),
            congested: AtomicBool::new(false),
        }
    }

    /// Open a registered device, as its first user would
    pub fn open_device(&self, handle: RegistrationHandle) -> Result<(), DriverError> {
        let callbacks = {
            let state = lock(&self.state);
            let device = state.devices.get(&handle).ok_or(DriverError::SessionGone)?;
            Arc::clone(&device.callbacks)
        };

        callbacks.open()?;

        if let Some(device) = lock(&self.state).devices.get_mut(&handle) {
            device.opened = true;
        }
        Ok(())
    }

    /// Close a registered device, as its last user would
    ///
    /// Closing a device that is not open is a no-op.
    pub fn close_device(&self, handle: RegistrationHandle) -> Result<(), DriverError> {
        let callbacks = {
            let mut state = lock(&self.state);
            let device = state
                .devices
                .get_mut(&handle)
                .ok_or(DriverError::SessionGone)?;
            if !device.opened {
                return Ok(());
            }
            device.opened = false;
            Arc::clone(&device.callbacks)
        };

        callbacks.close();
        Ok(())
    }

    pub fn is_open(&self, handle: RegistrationHandle) -> bool {
        lock(&self.state)
            .devices
            .get(&handle)
            .is_some_and(|device| device.opened)
    }

    pub fn device_count(&self) -> usize {
        lock(&self.state).devices.len()
    }

    /// Reports discarded because the event queue was full
    pub fn dropped_reports(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl InputSink for BridgeSink {
    fn register_device(
        &self,
        info: InputDeviceInfo,
        callbacks: Arc<dyn InputCallbacks>,
    ) -> Result<RegistrationHandle, InputError> {
        if self.events.is_closed() {
            return Err(InputError::Closed);
        }

        let mut state = lock(&self.state);
        state.next_handle += 1;
        let handle = RegistrationHandle(state.next_handle);

        debug!("Registered input device {:?}: {} ({})", handle, info.name, info.phys);
        state.devices.insert(
            handle,
            BridgeDevice {
                info,
                callbacks,
                opened: false,
            },
        );

        Ok(handle)
    }

    fn emit(&self, handle: RegistrationHandle, report: &DecodedReport) {
        let phys = match lock(&self.state).devices.get(&handle) {
            Some(device) => device.info.phys.clone(),
            None => {
                trace!("Dropping report for unregistered device {:?}", handle);
                return;
            }
        };

        match self.events.try_send(DriverEvent::Report {
            phys,
            report: *report,
        }) {
            Ok(()) => {
                self.congested.store(false, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                if !self.congested.swap(true, Ordering::Relaxed) {
                    warn!("Event queue full, dropping mouse reports");
                }
            }
            Err(TrySendError::Closed(_)) => {
                trace!("Event queue closed, dropping report");
            }
        }
    }

    fn unregister_device(&self, handle: RegistrationHandle) {
        let removed = lock(&self.state).devices.remove(&handle);

        match removed {
            Some(device) => {
                debug!("Unregistered input device {:?} ({})", handle, device.info.phys);
                // A device going away with users still attached is closed for them
                if device.opened {
                    device.callbacks.close();
                }
            }
            None => warn!("Unregistering unknown input device {:?}", handle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{Capabilities, InputId};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingCallbacks {
        opens: AtomicUsize,
        closes: AtomicUsize,
    }

    impl InputCallbacks for CountingCallbacks {
        fn open(&self) -> Result<(), DriverError> {
            self.opens.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn info() -> InputDeviceInfo {
        InputDeviceInfo {
            name: "Test Mouse".to_string(),
            phys: "usb-001-1/input0".to_string(),
            id: InputId {
                bustype: 3,
                vendor: 0x046d,
                product: 0xc077,
                version: 0x0100,
            },
            capabilities: Capabilities::boot_mouse(),
        }
    }

    #[test]
    fn test_emit_forwards_report() {
        let (tx, rx) = async_channel::bounded(4);
        let sink = BridgeSink::new(tx);
        let handle = sink
            .register_device(info(), Arc::new(CountingCallbacks::default()))
            .unwrap();

        let report = DecodedReport::decode(&[0x01, 0x05, 0xFB, 0x00]);
        sink.emit(handle, &report);

        match rx.try_recv().unwrap() {
            DriverEvent::Report { phys, report: got } => {
                assert_eq!(phys, "usb-001-1/input0");
                assert_eq!(got, report);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_drops_when_full() {
        let (tx, _rx) = async_channel::bounded(1);
        let sink = BridgeSink::new(tx);
        let handle = sink
            .register_device(info(), Arc::new(CountingCallbacks::default()))
            .unwrap();

        for _ in 0..3 {
            sink.emit(handle, &DecodedReport::default());
        }
        assert_eq!(sink.dropped_reports(), 2);
    }

    #[test]
    fn test_open_close_drive_callbacks() {
        let (tx, _rx) = async_channel::bounded(1);
        let sink = BridgeSink::new(tx);
        let callbacks = Arc::new(CountingCallbacks::default());
        let handle = sink
            .register_device(info(), Arc::clone(&callbacks) as Arc<dyn InputCallbacks>)
            .unwrap();

        sink.open_device(handle).unwrap();
        assert!(sink.is_open(handle));
        sink.close_device(handle).unwrap();
        sink.close_device(handle).unwrap();

        assert_eq!(callbacks.opens.load(Ordering::Relaxed), 1);
        assert_eq!(callbacks.closes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_unregister_closes_open_device() {
        let (tx, _rx) = async_channel::bounded(1);
        let sink = BridgeSink::new(tx);
        let callbacks = Arc::new(CountingCallbacks::default());
        let handle = sink
            .register_device(info(), Arc::clone(&callbacks) as Arc<dyn InputCallbacks>)
            .unwrap();

        sink.open_device(handle).unwrap();
        sink.unregister_device(handle);

        assert_eq!(callbacks.closes.load(Ordering::Relaxed), 1);
        assert_eq!(sink.device_count(), 0);
        assert_eq!(sink.open_device(handle), Err(DriverError::SessionGone));
    }

    #[test]
    fn test_register_fails_when_channel_closed() {
        let (tx, rx) = async_channel::bounded(1);
        drop(rx);
        let sink = BridgeSink::new(tx);

        let result = sink.register_device(info(), Arc::new(CountingCallbacks::default()));
        assert_eq!(result, Err(InputError::Closed));
    }
}
