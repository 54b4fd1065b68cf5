//! Transfer loop controller
//!
//! Keeps exactly one interrupt IN transfer in flight while a session is open.
//! Every completion is classified and either decoded and emitted, skipped, or
//! treated as the end of the device, and the transfer is re-armed from the
//! completion context.
//!
//! The controller state sits behind a mutex that is held while a completion is
//! handled (decode, emit, resubmit) so reports reach the sink in order. It is
//! never held across [`BusDevice::cancel_transfer`], which may wait for a
//! completion that needs the same lock.

use crate::usb::buffer::TransferBuffer;
use common::lock;
use protocol::{
    BOOT_REPORT_LEN, BusDevice, BusError, CompletionClass, CompletionHandler, DecodedReport,
    DriverError, EndpointDescriptor, InputSink, InterruptTransfer, RegistrationHandle,
    SubmitError, TRANSFER_BUFFER_LEN, TransferCompletion, TransferHandle, TransferStatus,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, trace, warn};

/// Why the loop stopped resubmitting on its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The bus reported that the device or the bus went away
    DeviceGone(TransferStatus),
    /// Re-arming after a completion was rejected by the bus
    ResubmitFailed(BusError),
}

/// Observable controller state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopPhase {
    Idle,
    Submitted,
    /// `stop()` is waiting for the bus to give the transfer back
    Cancelling,
    Stopped(StopReason),
}

impl LoopPhase {
    /// Whether a transfer is currently owned by the bus
    pub fn is_active(&self) -> bool {
        matches!(self, LoopPhase::Submitted | LoopPhase::Cancelling)
    }
}

impl std::fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopPhase::Idle => write!(f, "idle"),
            LoopPhase::Submitted => write!(f, "submitted"),
            LoopPhase::Cancelling => write!(f, "cancelling"),
            LoopPhase::Stopped(StopReason::DeviceGone(status)) => {
                write!(f, "stopped ({})", status)
            }
            LoopPhase::Stopped(StopReason::ResubmitFailed(err)) => {
                write!(f, "stopped (resubmit failed: {})", err)
            }
        }
    }
}

/// Counters for one transfer loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub submissions: u64,
    pub completions: u64,
    pub reports: u64,
    pub recoverable_errors: u64,
    pub resubmit_failures: u64,
}

#[derive(Default)]
struct LoopCounters {
    submissions: AtomicU64,
    completions: AtomicU64,
    reports: AtomicU64,
    recoverable_errors: AtomicU64,
    resubmit_failures: AtomicU64,
}

impl LoopCounters {
    fn snapshot(&self) -> LoopStats {
        LoopStats {
            submissions: self.submissions.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
            reports: self.reports.load(Ordering::Relaxed),
            recoverable_errors: self.recoverable_errors.load(Ordering::Relaxed),
            resubmit_failures: self.resubmit_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LoopState {
    Idle,
    Submitted(TransferHandle),
    Cancelling(TransferHandle),
    Stopped(StopReason),
}

struct LoopInner {
    state: LoopState,
    buffer: Option<TransferBuffer>,
}

struct LoopShared {
    bus: Arc<dyn BusDevice>,
    sink: Arc<dyn InputSink>,
    registration: RegistrationHandle,
    endpoint: EndpointDescriptor,
    length: usize,
    /// Device path used in log messages
    label: String,
    inner: Mutex<LoopInner>,
    counters: LoopCounters,
}

impl LoopShared {
    /// Check the buffer out and hand it to the bus
    ///
    /// On rejection the buffer is checked back in before returning.
    fn submit(self: &Arc<Self>, inner: &mut LoopInner) -> Result<TransferHandle, BusError> {
        let slot = inner.buffer.as_mut().ok_or(BusError::Busy)?;
        let buffer = slot.check_out().ok_or(BusError::Busy)?;

        let transfer = InterruptTransfer {
            endpoint: self.endpoint,
            buffer,
            length: self.length,
            interval: self.endpoint.interval,
        };

        let weak: Weak<LoopShared> = Arc::downgrade(self);
        let on_complete: CompletionHandler = Box::new(move |completion| match weak.upgrade() {
            Some(shared) => shared.on_completion(completion),
            None => debug!(
                "Completion {:?} arrived after its transfer loop was dropped",
                completion.handle
            ),
        });

        match self.bus.submit_transfer(transfer, on_complete) {
            Ok(handle) => {
                self.counters.submissions.fetch_add(1, Ordering::Relaxed);
                trace!("{}: submitted transfer {:?}", self.label, handle);
                Ok(handle)
            }
            Err(SubmitError { error, buffer }) => {
                slot.check_in(buffer);
                Err(error)
            }
        }
    }

    fn on_completion(self: &Arc<Self>, completion: TransferCompletion) {
        let TransferCompletion {
            handle,
            status,
            actual_length,
            buffer,
        } = completion;
        self.counters.completions.fetch_add(1, Ordering::Relaxed);

        let mut guard = lock(&self.inner);
        let inner = &mut *guard;

        match inner.buffer.as_mut() {
            Some(slot) => slot.check_in(buffer),
            None => {
                warn!(
                    "{}: completion {:?} after the transfer buffer was retired",
                    self.label, handle
                );
                return;
            }
        }

        match inner.state {
            LoopState::Submitted(current) if current == handle => {}
            LoopState::Cancelling(current) if current == handle => {
                debug!("{}: transfer {:?} cancelled ({})", self.label, handle, status);
                return;
            }
            ref state => {
                warn!(
                    "{}: ignoring completion {:?} in state {:?}",
                    self.label, handle, state
                );
                return;
            }
        }

        inner.state = match status.classify(actual_length) {
            CompletionClass::Report => {
                self.emit(inner, actual_length);
                self.resubmit(inner, status)
            }
            CompletionClass::DeviceGone => {
                debug!("{}: device gone ({}), polling stopped", self.label, status);
                LoopState::Stopped(StopReason::DeviceGone(status))
            }
            CompletionClass::Recoverable => {
                self.counters
                    .recoverable_errors
                    .fetch_add(1, Ordering::Relaxed);
                debug!(
                    "{}: transfer failed ({}, {} bytes), resubmitting",
                    self.label, status, actual_length
                );
                self.resubmit(inner, status)
            }
        };
    }

    fn emit(&self, inner: &LoopInner, actual_length: usize) {
        let report = inner
            .buffer
            .as_ref()
            .and_then(TransferBuffer::contents)
            .and_then(|bytes| DecodedReport::from_bytes(&bytes[..actual_length.min(bytes.len())]));

        if let Some(report) = report {
            trace!("{}: {:?}", self.label, report);
            self.sink.emit(self.registration, &report);
            self.counters.reports.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn resubmit(self: &Arc<Self>, inner: &mut LoopInner, status: TransferStatus) -> LoopState {
        match self.submit(inner) {
            Ok(handle) => LoopState::Submitted(handle),
            Err(err) => {
                self.counters
                    .resubmit_failures
                    .fetch_add(1, Ordering::Relaxed);
                error!(
                    "{}: can't resubmit interrupt transfer after {}: {}",
                    self.label, status, err
                );
                LoopState::Stopped(StopReason::ResubmitFailed(err))
            }
        }
    }
}

/// Owner of the single in-flight interrupt transfer of one session
pub struct TransferLoop {
    shared: Arc<LoopShared>,
}

impl TransferLoop {
    /// Build an idle loop around `buffer`
    ///
    /// Transfers request `min(max_packet_size, 8)` bytes at the endpoint's
    /// advertised interval.
    pub fn new(
        bus: Arc<dyn BusDevice>,
        sink: Arc<dyn InputSink>,
        registration: RegistrationHandle,
        endpoint: EndpointDescriptor,
        buffer: TransferBuffer,
        label: impl Into<String>,
    ) -> Self {
        let length = usize::from(endpoint.max_packet_size).min(TRANSFER_BUFFER_LEN);
        let label = label.into();
        if length < BOOT_REPORT_LEN {
            warn!(
                "{}: endpoint {:#04x} transfers {} bytes, no boot report will fit",
                label, endpoint.address, length
            );
        }

        Self {
            shared: Arc::new(LoopShared {
                bus,
                sink,
                registration,
                endpoint,
                length,
                label,
                inner: Mutex::new(LoopInner {
                    state: LoopState::Idle,
                    buffer: Some(buffer),
                }),
                counters: LoopCounters::default(),
            }),
        }
    }

    /// Number of bytes each transfer requests
    pub fn transfer_length(&self) -> usize {
        self.shared.length
    }

    pub fn phase(&self) -> LoopPhase {
        match &lock(&self.shared.inner).state {
            LoopState::Idle => LoopPhase::Idle,
            LoopState::Submitted(_) => LoopPhase::Submitted,
            LoopState::Cancelling(_) => LoopPhase::Cancelling,
            LoopState::Stopped(reason) => LoopPhase::Stopped(reason.clone()),
        }
    }

    pub fn stats(&self) -> LoopStats {
        self.shared.counters.snapshot()
    }

    /// Submit the first transfer
    ///
    /// Only valid from Idle. A rejected submission leaves the loop Idle.
    pub fn start(&self) -> Result<(), DriverError> {
        let mut inner = lock(&self.shared.inner);

        match inner.state {
            LoopState::Idle => {}
            LoopState::Submitted(_) | LoopState::Cancelling(_) => {
                return Err(DriverError::AlreadyActive);
            }
            LoopState::Stopped(_) => return Err(DriverError::LoopStopped),
        }

        let handle = self
            .shared
            .submit(&mut inner)
            .map_err(DriverError::Submission)?;
        inner.state = LoopState::Submitted(handle);

        debug!("{}: polling started", self.shared.label);
        Ok(())
    }

    /// Cancel the in-flight transfer and wait for the bus to return it
    ///
    /// Ends Idle from any state. Blocks while the bus cancels.
    pub fn stop(&self) {
        let handle = {
            let mut inner = lock(&self.shared.inner);
            match inner.state.clone() {
                LoopState::Submitted(handle) => {
                    inner.state = LoopState::Cancelling(handle);
                    handle
                }
                LoopState::Cancelling(handle) => handle,
                LoopState::Stopped(_) => {
                    inner.state = LoopState::Idle;
                    return;
                }
                LoopState::Idle => return,
            }
        };

        self.shared.bus.cancel_transfer(handle);

        let mut inner = lock(&self.shared.inner);
        if inner.state == LoopState::Cancelling(handle) {
            inner.state = LoopState::Idle;
        }
        debug!("{}: polling stopped", self.shared.label);
    }

    /// Clear a Stopped loop back to Idle so it can be started again
    pub fn reset(&self) {
        let mut inner = lock(&self.shared.inner);
        if let LoopState::Stopped(reason) = &inner.state {
            debug!("{}: resetting loop stopped by {:?}", self.shared.label, reason);
            inner.state = LoopState::Idle;
        }
    }

    /// Stop for good and hand back the transfer buffer
    pub fn retire(self) -> Result<TransferBuffer, DriverError> {
        self.stop();

        let mut inner = lock(&self.shared.inner);
        let buffer = inner.buffer.take().ok_or(DriverError::BufferInFlight)?;
        if buffer.is_checked_out() {
            inner.buffer = Some(buffer);
            return Err(DriverError::BufferInFlight);
        }
        Ok(buffer)
    }
}

impl std::fmt::Debug for TransferLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferLoop")
            .field("device", &self.shared.label)
            .field("phase", &self.phase())
            .finish()
    }
}
