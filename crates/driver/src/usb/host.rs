//! libusb bus collaborator
//!
//! [`RusbMouse`] implements [`BusDevice`] for a boot mouse reached through
//! `rusb`. It claims the HID boot mouse interface and runs one poller thread
//! that services the single outstanding interrupt transfer. Completion
//! handlers always run on the poller thread (or on the thread cancelling a
//! transfer the poller has not picked up yet), never inside
//! `submit_transfer`.

use common::lock;
use protocol::{
    BusDevice, BusError, CompletionHandler, DeviceIdentity, DeviceLocation, DmaAddr, DmaBuffer,
    EndpointDescriptor, InterfaceClass, InterruptTransfer, SubmitError, TransferCompletion,
    TransferHandle, TransferStatus,
};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// HID class request SET_PROTOCOL
const HID_SET_PROTOCOL: u8 = 0x0B;
/// bmRequestType: host to device, class, interface
const HID_REQUEST_TYPE_OUT: u8 = 0x21;
const HID_BOOT_PROTOCOL: u16 = 0;
const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

/// How [`RusbMouse::open`] prepares the device
#[derive(Debug, Clone)]
pub struct RusbOptions {
    /// Let libusb detach the kernel HID driver while the interface is claimed
    pub detach_kernel_driver: bool,
    /// Send SET_PROTOCOL(boot) after claiming
    pub set_boot_protocol: bool,
    /// Length of one blocking read slice
    pub poll_timeout: Duration,
}

impl Default for RusbOptions {
    fn default() -> Self {
        Self {
            detach_kernel_driver: true,
            set_boot_protocol: true,
            poll_timeout: Duration::from_millis(100),
        }
    }
}

/// The boot mouse interface of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootInterface {
    pub number: u8,
    pub alt_setting: u8,
    /// Non-control endpoints of the interface
    pub endpoints: Vec<EndpointDescriptor>,
}

/// Find the HID boot mouse interface in the active configuration
pub fn find_boot_interface<T: UsbContext>(
    device: &Device<T>,
) -> Result<Option<BootInterface>, rusb::Error> {
    let config = device.active_config_descriptor()?;

    for interface in config.interfaces() {
        for descriptor in interface.descriptors() {
            let class = InterfaceClass {
                class: descriptor.class_code(),
                subclass: descriptor.sub_class_code(),
                protocol: descriptor.protocol_code(),
            };
            if !class.is_boot_mouse() {
                continue;
            }

            let endpoints = descriptor
                .endpoint_descriptors()
                .map(|ep| map_endpoint(&ep))
                .filter(|ep| !ep.is_control())
                .collect();

            return Ok(Some(BootInterface {
                number: descriptor.interface_number(),
                alt_setting: descriptor.setting_number(),
                endpoints,
            }));
        }
    }

    Ok(None)
}

fn map_endpoint(ep: &rusb::EndpointDescriptor) -> EndpointDescriptor {
    let attributes = match ep.transfer_type() {
        rusb::TransferType::Control => 0,
        rusb::TransferType::Isochronous => 1,
        rusb::TransferType::Bulk => 2,
        rusb::TransferType::Interrupt => 3,
    };

    EndpointDescriptor {
        address: ep.address(),
        attributes,
        max_packet_size: ep.max_packet_size() & 0x07FF,
        interval: ep.interval(),
    }
}

/// Topology path of a device, e.g. `usb-001-1.4`
pub fn topology_path<T: UsbContext>(device: &Device<T>) -> String {
    let ports = device
        .port_numbers()
        .ok()
        .filter(|ports| !ports.is_empty())
        .map(|ports| {
            ports
                .iter()
                .map(u8::to_string)
                .collect::<Vec<_>>()
                .join(".")
        })
        .unwrap_or_else(|| device.address().to_string());

    format!("usb-{:03}-{}", device.bus_number(), ports)
}

/// Consecutive failed reads on one device
///
/// The loop resubmits after every recoverable failure, so a device stuck in
/// an error state fails at poll rate. Only the first failure of a streak is
/// worth a warning.
#[derive(Debug, Default)]
struct ErrorStreak {
    status: Option<TransferStatus>,
    count: u64,
}

impl ErrorStreak {
    /// Record a completion; returns whether it starts a new streak
    fn record(&mut self, status: TransferStatus) -> bool {
        if status == TransferStatus::Success {
            self.status = None;
            self.count = 0;
            return false;
        }

        self.count += 1;
        let starts = self.status != Some(status);
        self.status = Some(status);
        starts
    }

    /// Length of a streak that just ended, if one did
    fn recovered(&self, status: TransferStatus) -> Option<u64> {
        (status == TransferStatus::Success && self.count > 0).then_some(self.count)
    }
}

struct PendingTransfer {
    handle: TransferHandle,
    transfer: InterruptTransfer,
    on_complete: CompletionHandler,
}

#[derive(Default)]
struct PollerState {
    next_handle: u64,
    /// Submitted, not yet picked up by the poller
    pending: Option<PendingTransfer>,
    /// Being read by the poller
    active: Option<TransferHandle>,
    cancelling: Option<TransferHandle>,
    shutdown: bool,
}

struct PollerShared {
    handle: DeviceHandle<Context>,
    label: String,
    poll_timeout: Duration,
    state: Mutex<PollerState>,
    /// Signals new work for the poller and finished deliveries for cancellers
    changed: Condvar,
}

impl PollerShared {
    fn run(&self) {
        debug!("{}: poller started", self.label);
        let mut streak = ErrorStreak::default();

        loop {
            let pending = {
                let mut state = lock(&self.state);
                while state.pending.is_none() && !state.shutdown {
                    state = self
                        .changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                match state.pending.take() {
                    Some(pending) => {
                        state.active = Some(pending.handle);
                        pending
                    }
                    None => break,
                }
            };

            let PendingTransfer {
                handle,
                transfer,
                on_complete,
            } = pending;
            let mut buffer = transfer.buffer;
            let length = transfer.length.min(buffer.len());
            let (status, actual_length) =
                self.read(handle, transfer.endpoint.address, &mut buffer.as_mut_slice()[..length]);

            trace!(
                "{}: transfer {:?} completed: {} ({} bytes)",
                self.label, handle, status, actual_length
            );
            self.note_status(&mut streak, status);
            on_complete(TransferCompletion {
                handle,
                status,
                actual_length,
                buffer,
            });

            let mut state = lock(&self.state);
            state.active = None;
            if state.cancelling == Some(handle) {
                state.cancelling = None;
            }
            self.changed.notify_all();
        }

        debug!("{}: poller stopped", self.label);
    }

    fn note_status(&self, streak: &mut ErrorStreak, status: TransferStatus) {
        if let Some(count) = streak.recovered(status) {
            debug!("{}: reads recovered after {} failures", self.label, count);
        }
        match status {
            // Cancellation and unplug end the loop rather than repeat
            TransferStatus::ConnectionReset
            | TransferStatus::NoSuchDevice
            | TransferStatus::ShutdownInProgress => {}
            _ => {
                if streak.record(status) {
                    warn!("{}: interrupt read failing: {}", self.label, status);
                }
            }
        }
    }

    /// Read until data arrives, the transfer is cancelled, or the device fails
    fn read(&self, handle: TransferHandle, endpoint: u8, buf: &mut [u8]) -> (TransferStatus, usize) {
        loop {
            {
                let state = lock(&self.state);
                if state.shutdown {
                    return (TransferStatus::ShutdownInProgress, 0);
                }
                if state.cancelling == Some(handle) {
                    return (TransferStatus::ConnectionReset, 0);
                }
            }

            match self.handle.read_interrupt(endpoint, buf, self.poll_timeout) {
                Ok(len) => return (TransferStatus::Success, len),
                // The device NAKed for the whole slice; keep waiting
                Err(rusb::Error::Timeout) => continue,
                Err(rusb::Error::Pipe) => {
                    // Clear the stall so the resubmitted read can succeed
                    if let Err(e) = self.handle.clear_halt(endpoint) {
                        debug!("{}: clear halt on {:#04x} failed: {}", self.label, endpoint, e);
                    }
                    return (TransferStatus::Stall, 0);
                }
                Err(e) => return (map_transfer_status(e), 0),
            }
        }
    }
}

/// A claimed boot mouse interface
pub struct RusbMouse {
    location: DeviceLocation,
    identity: DeviceIdentity,
    interface: BootInterface,
    shared: Arc<PollerShared>,
    poller: Option<JoinHandle<()>>,
}

impl RusbMouse {
    /// Open `device` and claim its boot mouse interface
    pub fn open(device: &Device<Context>, options: &RusbOptions) -> Result<Self, BusError> {
        let location = DeviceLocation {
            bus: device.bus_number(),
            address: device.address(),
        };
        let interface = find_boot_interface(device)
            .map_err(map_rusb_error)?
            .ok_or_else(|| BusError::Other {
                message: format!("{} has no boot mouse interface", location),
            })?;

        let descriptor = device.device_descriptor().map_err(map_rusb_error)?;
        let mut handle = device.open().map_err(|e| {
            warn!("Failed to open device {}: {}", location, e);
            map_rusb_error(e)
        })?;

        if options.detach_kernel_driver
            && let Err(e) = handle.set_auto_detach_kernel_driver(true)
        {
            debug!("Kernel driver auto-detach unavailable on {}: {}", location, e);
        }

        handle.claim_interface(interface.number).map_err(|e| {
            warn!(
                "Failed to claim interface {} on {}: {}",
                interface.number, location, e
            );
            map_rusb_error(e)
        })?;
        debug!("Claimed interface {} on {}", interface.number, location);

        if interface.alt_setting != 0
            && let Err(e) = handle.set_alternate_setting(interface.number, interface.alt_setting)
        {
            warn!(
                "Failed to select alternate setting {} on {}: {}",
                interface.alt_setting, location, e
            );
        }

        if options.set_boot_protocol
            && let Err(e) = handle.write_control(
                HID_REQUEST_TYPE_OUT,
                HID_SET_PROTOCOL,
                HID_BOOT_PROTOCOL,
                u16::from(interface.number),
                &[],
                CONTROL_TIMEOUT,
            )
        {
            // Most mice default to boot protocol on a fresh configuration
            debug!("SET_PROTOCOL(boot) failed on {}: {}", location, e);
        }

        let read_string = |index: Option<u8>| {
            index.and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
        };
        let identity = DeviceIdentity {
            manufacturer: read_string(descriptor.manufacturer_string_index()),
            product: read_string(descriptor.product_string_index()),
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            release: version_bcd(descriptor.device_version()),
            topology: topology_path(device),
        };

        let shared = Arc::new(PollerShared {
            handle,
            label: identity.phys_path(),
            poll_timeout: options.poll_timeout,
            state: Mutex::new(PollerState {
                next_handle: 1,
                ..Default::default()
            }),
            changed: Condvar::new(),
        });

        let poller = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("usb-poll-{}", location))
                .spawn(move || shared.run())
                .map_err(|e| BusError::Other {
                    message: format!("Failed to spawn poller thread: {}", e),
                })?
        };

        Ok(Self {
            location,
            identity,
            interface,
            shared,
            poller: Some(poller),
        })
    }

    pub fn location(&self) -> DeviceLocation {
        self.location
    }

    pub fn interface_number(&self) -> u8 {
        self.interface.number
    }
}

impl BusDevice for RusbMouse {
    fn endpoints(&self) -> Vec<EndpointDescriptor> {
        self.interface.endpoints.clone()
    }

    fn identity(&self) -> DeviceIdentity {
        self.identity.clone()
    }

    fn allocate_dma_buffer(&self, size: usize) -> Result<DmaBuffer, BusError> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(size)
            .map_err(|_| BusError::NoMemory)?;
        bytes.resize(size, 0u8);

        let bytes = bytes.into_boxed_slice();
        let addr = DmaAddr(bytes.as_ptr().addr() as u64);
        Ok(DmaBuffer::new(addr, bytes))
    }

    fn free_dma_buffer(&self, buffer: DmaBuffer) {
        trace!("{}: freeing buffer {:#x}", self.shared.label, buffer.addr().0);
        drop(buffer);
    }

    fn submit_transfer(
        &self,
        transfer: InterruptTransfer,
        on_complete: CompletionHandler,
    ) -> Result<TransferHandle, SubmitError> {
        let mut state = lock(&self.shared.state);

        let error = if state.shutdown {
            Some(BusError::NoDevice)
        } else if state.pending.is_some() {
            Some(BusError::Busy)
        } else if transfer.length > transfer.buffer.len() || !transfer.endpoint.is_interrupt_in() {
            Some(BusError::InvalidParam)
        } else {
            None
        };
        if let Some(error) = error {
            return Err(SubmitError {
                error,
                buffer: transfer.buffer,
            });
        }

        let handle = TransferHandle(state.next_handle);
        state.next_handle += 1;
        state.pending = Some(PendingTransfer {
            handle,
            transfer,
            on_complete,
        });
        self.shared.changed.notify_all();

        Ok(handle)
    }

    fn cancel_transfer(&self, handle: TransferHandle) {
        let mut state = lock(&self.shared.state);

        // Not picked up yet: complete it here
        let unclaimed = match state.pending.take() {
            Some(pending) if pending.handle == handle => Some(pending),
            other => {
                state.pending = other;
                None
            }
        };
        if let Some(pending) = unclaimed {
            drop(state);
            (pending.on_complete)(TransferCompletion {
                handle,
                status: TransferStatus::ConnectionReset,
                actual_length: 0,
                buffer: pending.transfer.buffer,
            });
            return;
        }

        if state.active == Some(handle) {
            state.cancelling = Some(handle);
            while state.active == Some(handle) {
                state = self
                    .shared
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }
}

impl Drop for RusbMouse {
    fn drop(&mut self) {
        lock(&self.shared.state).shutdown = true;
        self.shared.changed.notify_all();

        if let Some(poller) = self.poller.take()
            && poller.join().is_err()
        {
            warn!("{}: poller thread panicked", self.shared.label);
        }

        // A transfer nobody cancelled still has to hand its buffer back
        let pending = lock(&self.shared.state).pending.take();
        if let Some(pending) = pending {
            (pending.on_complete)(TransferCompletion {
                handle: pending.handle,
                status: TransferStatus::ShutdownInProgress,
                actual_length: 0,
                buffer: pending.transfer.buffer,
            });
        }

        match Arc::get_mut(&mut self.shared) {
            Some(shared) => {
                // libusb reattaches an auto-detached kernel driver on release
                if let Err(e) = shared.handle.release_interface(self.interface.number) {
                    debug!(
                        "Could not release interface {} on {}: {}",
                        self.interface.number, self.location, e
                    );
                } else {
                    debug!(
                        "Released interface {} on {}",
                        self.interface.number, self.location
                    );
                }
            }
            None => warn!("{}: device handle still shared at drop", self.location),
        }
    }
}

fn version_bcd(version: rusb::Version) -> u16 {
    (u16::from(version.major()) << 8)
        | (u16::from(version.minor() & 0x0F) << 4)
        | u16::from(version.sub_minor() & 0x0F)
}

/// Map rusb::Error to protocol::BusError
pub fn map_rusb_error(err: rusb::Error) -> BusError {
    match err {
        rusb::Error::NoDevice | rusb::Error::NotFound => BusError::NoDevice,
        rusb::Error::NoMem => BusError::NoMemory,
        rusb::Error::Busy => BusError::Busy,
        rusb::Error::InvalidParam => BusError::InvalidParam,
        rusb::Error::Access => BusError::Access,
        rusb::Error::Io => BusError::Io,
        _ => BusError::Other {
            message: err.to_string(),
        },
    }
}

/// Map a failed interrupt read to the transfer status it completes with
pub fn map_transfer_status(err: rusb::Error) -> TransferStatus {
    match err {
        rusb::Error::NoDevice => TransferStatus::NoSuchDevice,
        rusb::Error::Pipe => TransferStatus::Stall,
        rusb::Error::Overflow => TransferStatus::Overflow,
        rusb::Error::Io => TransferStatus::ProtocolError,
        rusb::Error::Timeout => TransferStatus::Timeout,
        other => TransferStatus::Other(libusb_code(other)),
    }
}

/// libusb's numeric code for an error
fn libusb_code(err: rusb::Error) -> i32 {
    match err {
        rusb::Error::Io => -1,
        rusb::Error::InvalidParam => -2,
        rusb::Error::Access => -3,
        rusb::Error::NoDevice => -4,
        rusb::Error::NotFound => -5,
        rusb::Error::Busy => -6,
        rusb::Error::Timeout => -7,
        rusb::Error::Overflow => -8,
        rusb::Error::Pipe => -9,
        rusb::Error::Interrupted => -10,
        rusb::Error::NoMem => -11,
        rusb::Error::NotSupported => -12,
        _ => -99,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::CompletionClass;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), BusError::NoDevice);
        assert_eq!(map_rusb_error(rusb::Error::NoMem), BusError::NoMemory);
        assert_eq!(map_rusb_error(rusb::Error::Access), BusError::Access);
        assert_eq!(map_rusb_error(rusb::Error::Io), BusError::Io);
        assert!(matches!(
            map_rusb_error(rusb::Error::NotSupported),
            BusError::Other { .. }
        ));
    }

    #[test]
    fn test_map_transfer_status() {
        assert_eq!(
            map_transfer_status(rusb::Error::NoDevice),
            TransferStatus::NoSuchDevice
        );
        assert_eq!(map_transfer_status(rusb::Error::Pipe), TransferStatus::Stall);
        assert_eq!(
            map_transfer_status(rusb::Error::Overflow),
            TransferStatus::Overflow
        );
        assert_eq!(
            map_transfer_status(rusb::Error::Interrupted),
            TransferStatus::Other(-10)
        );
    }

    #[test]
    fn test_read_errors_classify_as_expected() {
        // Unplugging ends the loop; everything else is retried
        assert_eq!(
            map_transfer_status(rusb::Error::NoDevice).classify(0),
            CompletionClass::DeviceGone
        );
        for err in [rusb::Error::Pipe, rusb::Error::Io, rusb::Error::Overflow] {
            assert_eq!(
                map_transfer_status(err).classify(0),
                CompletionClass::Recoverable
            );
        }
    }

    #[test]
    fn test_error_streak_warns_once() {
        let mut streak = ErrorStreak::default();

        assert!(streak.record(TransferStatus::Stall));
        assert!(!streak.record(TransferStatus::Stall));
        assert!(!streak.record(TransferStatus::Stall));
        // A different failure starts a new streak
        assert!(streak.record(TransferStatus::ProtocolError));

        assert_eq!(streak.recovered(TransferStatus::Success), Some(4));
        assert!(!streak.record(TransferStatus::Success));
        assert_eq!(streak.recovered(TransferStatus::Success), None);
        assert!(streak.record(TransferStatus::Stall));
    }

    #[test]
    fn test_default_options() {
        let options = RusbOptions::default();
        assert!(options.detach_kernel_driver);
        assert!(options.set_boot_protocol);
        assert_eq!(options.poll_timeout, Duration::from_millis(100));
    }
}
