//! Test utilities for usbmouse
//!
//! Provides mock collaborators and helper functions for testing across crates.
//!
//! - [`MockBus`] implements [`BusDevice`]: it counts allocations, frees,
//!   submissions and cancellations, lets a test fail the next allocation or
//!   submissions, and delivers completions only when the test asks for them.
//!   Cancellation honours the bus contract: it waits for a completion that is
//!   being delivered and synthesises a `ConnectionReset` completion for one
//!   that is still pending.
//! - [`RecordingSink`] implements [`InputSink`]: it records registrations and
//!   reports and can drive the open/close callbacks the way an input core does.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{MockBus, create_mock_identity};
//! use protocol::BusDevice;
//!
//! let bus = MockBus::boot_mouse();
//! assert_eq!(bus.endpoints().len(), 1);
//! assert_eq!(create_mock_identity(0x1234, 0x5678).vendor_id, 0x1234);
//! ```

use crate::sync::lock;
use protocol::{
    BusDevice, BusError, CompletionHandler, DecodedReport, DeviceIdentity, DmaAddr, DmaBuffer,
    DriverError, EndpointDescriptor, InputCallbacks, InputDeviceInfo, InputError, InputSink,
    InterruptTransfer, RegistrationHandle, SubmitError, TransferCompletion, TransferHandle,
    TransferStatus,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a mock DeviceIdentity for testing
///
/// # Arguments
/// * `vendor_id` - USB Vendor ID
/// * `product_id` - USB Product ID
pub fn create_mock_identity(vendor_id: u16, product_id: u16) -> DeviceIdentity {
    DeviceIdentity {
        manufacturer: Some("Test Manufacturer".to_string()),
        product: Some("Test Mouse".to_string()),
        vendor_id,
        product_id,
        release: 0x0100,
        topology: "usb-001-1".to_string(),
    }
}

/// Create a mock identity without string descriptors
pub fn create_anonymous_identity(vendor_id: u16, product_id: u16) -> DeviceIdentity {
    DeviceIdentity {
        manufacturer: None,
        product: None,
        ..create_mock_identity(vendor_id, product_id)
    }
}

/// The endpoint a typical low-speed boot mouse reports
pub fn create_boot_mouse_endpoint() -> EndpointDescriptor {
    EndpointDescriptor::interrupt_in(1, 4, 10)
}

/// Counters kept by [`MockBus`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockBusStats {
    pub allocations: usize,
    pub frees: usize,
    pub double_frees: usize,
    pub submissions: usize,
    pub rejected_submissions: usize,
    pub cancels: usize,
    pub completions: usize,
    /// Highest number of transfers ever outstanding at once
    pub max_outstanding: usize,
}

impl MockBusStats {
    /// Buffers allocated and not yet freed
    pub fn live_buffers(&self) -> usize {
        self.allocations - self.frees.min(self.allocations)
    }
}

/// Parameters of a submitted transfer, as seen by the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmittedTransfer {
    pub handle: TransferHandle,
    pub endpoint: u8,
    pub length: usize,
    pub interval: u8,
    pub addr: DmaAddr,
}

struct PendingTransfer {
    handle: TransferHandle,
    transfer: InterruptTransfer,
    on_complete: CompletionHandler,
}

#[derive(Default)]
struct MockBusState {
    next_handle: u64,
    next_addr: u64,
    pending: VecDeque<PendingTransfer>,
    delivering: Option<TransferHandle>,
    live: HashSet<DmaAddr>,
    fail_allocation: Option<BusError>,
    fail_submissions: usize,
    submit_error: Option<BusError>,
    submitted: Vec<SubmittedTransfer>,
    stats: MockBusStats,
}

/// In-memory bus collaborator for one device
pub struct MockBus {
    identity: DeviceIdentity,
    endpoints: Vec<EndpointDescriptor>,
    state: Mutex<MockBusState>,
    delivered: Condvar,
}

impl MockBus {
    pub fn new(identity: DeviceIdentity, endpoints: Vec<EndpointDescriptor>) -> Self {
        Self {
            identity,
            endpoints,
            state: Mutex::new(MockBusState {
                next_handle: 1,
                next_addr: 0x1000,
                ..Default::default()
            }),
            delivered: Condvar::new(),
        }
    }

    /// A well-formed boot mouse with one interrupt IN endpoint
    pub fn boot_mouse() -> Self {
        Self::new(
            create_mock_identity(0x046d, 0xc077),
            vec![create_boot_mouse_endpoint()],
        )
    }

    /// A boot mouse exposing the given endpoints instead
    pub fn with_endpoints(endpoints: Vec<EndpointDescriptor>) -> Self {
        Self::new(create_mock_identity(0x046d, 0xc077), endpoints)
    }

    /// Fail the next DMA allocation with `error`
    pub fn fail_next_allocation(&self, error: BusError) {
        lock(&self.state).fail_allocation = Some(error);
    }

    /// Reject the next `count` submissions with `error`
    pub fn fail_next_submissions(&self, count: usize, error: BusError) {
        let mut state = lock(&self.state);
        state.fail_submissions = count;
        state.submit_error = Some(error);
    }

    pub fn stats(&self) -> MockBusStats {
        lock(&self.state).stats
    }

    /// Every accepted submission, oldest first
    pub fn submitted(&self) -> Vec<SubmittedTransfer> {
        lock(&self.state).submitted.clone()
    }

    /// Number of transfers waiting for a completion
    pub fn outstanding(&self) -> usize {
        lock(&self.state).pending.len()
    }

    pub fn has_pending(&self) -> bool {
        self.outstanding() > 0
    }

    /// Complete the oldest pending transfer
    ///
    /// `data` is copied into the transfer buffer, clipped to the requested
    /// length. Returns `false` when nothing was pending.
    pub fn complete(&self, status: TransferStatus, data: &[u8]) -> bool {
        let pending = {
            let mut state = lock(&self.state);
            match state.pending.pop_front() {
                Some(pending) => {
                    state.delivering = Some(pending.handle);
                    pending
                }
                None => return false,
            }
        };

        let PendingTransfer {
            handle,
            transfer,
            on_complete,
        } = pending;
        let mut buffer = transfer.buffer;
        let actual_length = data.len().min(transfer.length);
        buffer.as_mut_slice()[..actual_length].copy_from_slice(&data[..actual_length]);

        on_complete(TransferCompletion {
            handle,
            status,
            actual_length,
            buffer,
        });

        self.finish_delivery();
        true
    }

    /// Complete the oldest pending transfer with a successful report
    pub fn complete_report(&self, report: [u8; 4]) -> bool {
        self.complete(TransferStatus::Success, &report)
    }

    fn finish_delivery(&self) {
        let mut state = lock(&self.state);
        state.delivering = None;
        state.stats.completions += 1;
        self.delivered.notify_all();
    }
}

impl BusDevice for MockBus {
    fn endpoints(&self) -> Vec<EndpointDescriptor> {
        self.endpoints.clone()
    }

    fn identity(&self) -> DeviceIdentity {
        self.identity.clone()
    }

    fn allocate_dma_buffer(&self, size: usize) -> Result<DmaBuffer, BusError> {
        let mut state = lock(&self.state);
        if let Some(error) = state.fail_allocation.take() {
            return Err(error);
        }

        let addr = DmaAddr(state.next_addr);
        state.next_addr += 0x100;
        state.live.insert(addr);
        state.stats.allocations += 1;

        Ok(DmaBuffer::new(addr, vec![0u8; size].into_boxed_slice()))
    }

    fn free_dma_buffer(&self, buffer: DmaBuffer) {
        let mut state = lock(&self.state);
        if !state.live.remove(&buffer.addr()) {
            state.stats.double_frees += 1;
        }
        state.stats.frees += 1;
    }

    fn submit_transfer(
        &self,
        transfer: InterruptTransfer,
        on_complete: CompletionHandler,
    ) -> Result<TransferHandle, SubmitError> {
        let mut state = lock(&self.state);

        if state.fail_submissions > 0 {
            state.fail_submissions -= 1;
            state.stats.rejected_submissions += 1;
            let error = state.submit_error.clone().unwrap_or(BusError::NoDevice);
            return Err(SubmitError {
                error,
                buffer: transfer.buffer,
            });
        }

        if transfer.length > transfer.buffer.len() {
            state.stats.rejected_submissions += 1;
            return Err(SubmitError {
                error: BusError::InvalidParam,
                buffer: transfer.buffer,
            });
        }

        let handle = TransferHandle(state.next_handle);
        state.next_handle += 1;
        state.submitted.push(SubmittedTransfer {
            handle,
            endpoint: transfer.endpoint.address,
            length: transfer.length,
            interval: transfer.interval,
            addr: transfer.buffer.addr(),
        });
        state.pending.push_back(PendingTransfer {
            handle,
            transfer,
            on_complete,
        });
        state.stats.submissions += 1;
        let outstanding = state.pending.len();
        state.stats.max_outstanding = state.stats.max_outstanding.max(outstanding);

        Ok(handle)
    }

    fn cancel_transfer(&self, handle: TransferHandle) {
        let pending = {
            let mut state = lock(&self.state);
            state.stats.cancels += 1;

            // A completion for this transfer is running right now; wait it out
            while state.delivering == Some(handle) {
                state = self
                    .delivered
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }

            let position = state.pending.iter().position(|p| p.handle == handle);
            match position.and_then(|i| state.pending.remove(i)) {
                Some(pending) => {
                    state.delivering = Some(handle);
                    pending
                }
                None => return,
            }
        };

        (pending.on_complete)(TransferCompletion {
            handle,
            status: TransferStatus::ConnectionReset,
            actual_length: 0,
            buffer: pending.transfer.buffer,
        });

        self.finish_delivery();
    }
}

struct RegisteredDevice {
    info: InputDeviceInfo,
    callbacks: Arc<dyn InputCallbacks>,
    opened: bool,
}

#[derive(Default)]
struct SinkState {
    next_handle: u32,
    devices: HashMap<RegistrationHandle, RegisteredDevice>,
    history: HashMap<RegistrationHandle, Arc<dyn InputCallbacks>>,
    reports: Vec<(RegistrationHandle, DecodedReport)>,
    registrations: usize,
    unregistrations: usize,
    fail_registration: Option<InputError>,
}

/// Input collaborator that records everything it is told
#[derive(Default)]
pub struct RecordingSink {
    state: Mutex<SinkState>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next registration with `error`
    pub fn fail_next_registration(&self, error: InputError) {
        lock(&self.state).fail_registration = Some(error);
    }

    /// Open a registered device, as a first user would
    pub fn open(&self, handle: RegistrationHandle) -> Result<(), DriverError> {
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

    /// Close a registered device, as the last user would
    pub fn close(&self, handle: RegistrationHandle) {
        let callbacks = {
            let mut state = lock(&self.state);
            match state.devices.get_mut(&handle) {
                Some(device) if device.opened => {
                    device.opened = false;
                    Arc::clone(&device.callbacks)
                }
                _ => return,
            }
        };
        callbacks.close();
    }

    /// The callbacks a device registered with, even after it unregistered
    pub fn callbacks(&self, handle: RegistrationHandle) -> Option<Arc<dyn InputCallbacks>> {
        lock(&self.state).history.get(&handle).map(Arc::clone)
    }

    pub fn is_registered(&self, handle: RegistrationHandle) -> bool {
        lock(&self.state).devices.contains_key(&handle)
    }

    /// Info of every currently registered device
    pub fn registered(&self) -> Vec<InputDeviceInfo> {
        lock(&self.state)
            .devices
            .values()
            .map(|d| d.info.clone())
            .collect()
    }

    /// Handle of the most recent registration, if still registered
    pub fn last_handle(&self) -> Option<RegistrationHandle> {
        let state = lock(&self.state);
        state.devices.keys().max_by_key(|h| h.0).copied()
    }

    pub fn reports(&self) -> Vec<DecodedReport> {
        lock(&self.state).reports.iter().map(|(_, r)| *r).collect()
    }

    pub fn reports_for(&self, handle: RegistrationHandle) -> Vec<DecodedReport> {
        lock(&self.state)
            .reports
            .iter()
            .filter(|(h, _)| *h == handle)
            .map(|(_, r)| *r)
            .collect()
    }

    pub fn registration_count(&self) -> usize {
        lock(&self.state).registrations
    }

    pub fn unregistration_count(&self) -> usize {
        lock(&self.state).unregistrations
    }
}

impl InputSink for RecordingSink {
    fn register_device(
        &self,
        info: InputDeviceInfo,
        callbacks: Arc<dyn InputCallbacks>,
    ) -> Result<RegistrationHandle, InputError> {
        let mut state = lock(&self.state);
        if let Some(error) = state.fail_registration.take() {
            return Err(error);
        }

        state.next_handle += 1;
        let handle = RegistrationHandle(state.next_handle);
        state.history.insert(handle, Arc::clone(&callbacks));
        state.devices.insert(
            handle,
            RegisteredDevice {
                info,
                callbacks,
                opened: false,
            },
        );
        state.registrations += 1;
        Ok(handle)
    }

    fn emit(&self, handle: RegistrationHandle, report: &DecodedReport) {
        lock(&self.state).reports.push((handle, *report));
    }

    fn unregister_device(&self, handle: RegistrationHandle) {
        let removed = {
            let mut state = lock(&self.state);
            state.unregistrations += 1;
            state.devices.remove(&handle)
        };

        // An input core closes a device that still has users when it goes away
        if let Some(device) = removed
            && device.opened
        {
            device.callbacks.close();
        }
    }
}

/// Poll `condition` until it holds or `timeout` elapses
///
/// Returns whether the condition was met.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{Capabilities, TRANSFER_BUFFER_LEN};

    struct NoopCallbacks;

    impl InputCallbacks for NoopCallbacks {
        fn open(&self) -> Result<(), DriverError> {
            Ok(())
        }

        fn close(&self) {}
    }

    fn submit(bus: &MockBus, seen: Arc<Mutex<Vec<TransferStatus>>>) -> TransferHandle {
        let buffer = bus.allocate_dma_buffer(TRANSFER_BUFFER_LEN).unwrap();
        bus.submit_transfer(
            InterruptTransfer {
                endpoint: create_boot_mouse_endpoint(),
                buffer,
                length: 4,
                interval: 10,
            },
            Box::new(move |completion| {
                seen.lock().unwrap().push(completion.status);
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_mock_bus_counts_allocations() {
        let bus = MockBus::boot_mouse();
        let buffer = bus.allocate_dma_buffer(8).unwrap();
        assert_eq!(buffer.len(), 8);
        assert_eq!(bus.stats().live_buffers(), 1);

        bus.free_dma_buffer(buffer);
        let stats = bus.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.frees, 1);
        assert_eq!(stats.double_frees, 0);
    }

    #[test]
    fn test_mock_bus_scripted_allocation_failure() {
        let bus = MockBus::boot_mouse();
        bus.fail_next_allocation(BusError::NoMemory);
        assert_eq!(bus.allocate_dma_buffer(8).unwrap_err(), BusError::NoMemory);
        assert!(bus.allocate_dma_buffer(8).is_ok());
    }

    #[test]
    fn test_mock_bus_complete_and_cancel() {
        let bus = MockBus::boot_mouse();
        let seen = Arc::new(Mutex::new(Vec::new()));

        submit(&bus, Arc::clone(&seen));
        assert!(bus.complete_report([1, 2, 3, 4]));
        assert!(!bus.complete_report([1, 2, 3, 4]));

        let handle = submit(&bus, Arc::clone(&seen));
        bus.cancel_transfer(handle);
        // Already completed: no second delivery
        bus.cancel_transfer(handle);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![TransferStatus::Success, TransferStatus::ConnectionReset]
        );
        assert_eq!(bus.stats().completions, 2);
        assert_eq!(bus.outstanding(), 0);
    }

    #[test]
    fn test_recording_sink_open_close() {
        let sink = RecordingSink::new();
        let info = InputDeviceInfo {
            name: "Test".to_string(),
            phys: "usb-001-1/input0".to_string(),
            id: create_mock_identity(1, 2).input_id(),
            capabilities: Capabilities::boot_mouse(),
        };

        let handle = sink.register_device(info, Arc::new(NoopCallbacks)).unwrap();
        assert!(sink.is_registered(handle));
        assert!(sink.open(handle).is_ok());
        sink.close(handle);
        sink.unregister_device(handle);

        assert!(!sink.is_registered(handle));
        assert_eq!(sink.open(handle), Err(DriverError::SessionGone));
        assert_eq!(sink.unregistration_count(), 1);
    }

    #[test]
    fn test_wait_until() {
        assert!(wait_until(Duration::from_millis(10), || true));
        assert!(!wait_until(Duration::from_millis(10), || false));
    }
}
