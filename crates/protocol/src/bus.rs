//! Bus collaborator contract
//!
//! The driver never talks to a host controller directly. Everything it needs
//! from the bus side (endpoint discovery, DMA-capable buffers, interrupt
//! transfer submission and cancellation, identity strings) goes through
//! [`BusDevice`], one instance per attached device.
//!
//! Buffers move by value: submitting a transfer hands the [`DmaBuffer`] to the
//! bus, and the buffer comes back either in the [`TransferCompletion`] or in
//! the [`SubmitError`]. A driver therefore cannot free a buffer that an
//! in-flight transfer still references.

use crate::error::BusError;
use crate::report::BOOT_REPORT_LEN;
use crate::types::{DeviceIdentity, EndpointDescriptor};
use serde::{Deserialize, Serialize};

/// Bus address of a DMA-visible buffer
///
/// Obtained together with the buffer; cannot fail once the buffer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DmaAddr(pub u64);

/// A DMA-visible transfer buffer
///
/// Deliberately not `Clone`: there is exactly one owner at any time.
#[derive(Debug)]
pub struct DmaBuffer {
    addr: DmaAddr,
    bytes: Box<[u8]>,
}

impl DmaBuffer {
    /// Wrap memory the bus has made visible to its controller
    pub fn new(addr: DmaAddr, bytes: Box<[u8]>) -> Self {
        Self { addr, bytes }
    }

    pub fn addr(&self) -> DmaAddr {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// Handle identifying one submitted transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferHandle(pub u64);

/// An interrupt IN transfer ready for submission
#[derive(Debug)]
pub struct InterruptTransfer {
    pub endpoint: EndpointDescriptor,
    pub buffer: DmaBuffer,
    /// Number of bytes to request, never larger than the buffer
    pub length: usize,
    /// Polling interval in frames, as advertised by the endpoint
    pub interval: u8,
}

/// Final status of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    Success,
    /// The transfer was unlinked or cancelled
    ConnectionReset,
    /// The device is no longer present
    NoSuchDevice,
    /// The host controller is shutting down
    ShutdownInProgress,
    /// The endpoint halted
    Stall,
    /// The device sent more data than requested
    Overflow,
    /// CRC, bit-stuffing or other low-level protocol error
    ProtocolError,
    /// Fewer bytes than required arrived
    ShortPacket,
    Timeout,
    /// Any other bus-specific error code
    Other(i32),
}

/// How the transfer loop reacts to a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionClass {
    /// A complete report is in the buffer
    Report,
    /// The device or the bus has gone away; never resubmit
    DeviceGone,
    /// This cycle is lost; resubmit
    Recoverable,
}

impl TransferStatus {
    /// Classify a completion carrying `actual_length` bytes
    pub fn classify(self, actual_length: usize) -> CompletionClass {
        match self {
            TransferStatus::Success if actual_length >= BOOT_REPORT_LEN => CompletionClass::Report,
            TransferStatus::ConnectionReset
            | TransferStatus::NoSuchDevice
            | TransferStatus::ShutdownInProgress => CompletionClass::DeviceGone,
            _ => CompletionClass::Recoverable,
        }
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferStatus::Success => write!(f, "success"),
            TransferStatus::ConnectionReset => write!(f, "connection reset"),
            TransferStatus::NoSuchDevice => write!(f, "no such device"),
            TransferStatus::ShutdownInProgress => write!(f, "shutdown in progress"),
            TransferStatus::Stall => write!(f, "endpoint stalled"),
            TransferStatus::Overflow => write!(f, "overflow"),
            TransferStatus::ProtocolError => write!(f, "protocol error"),
            TransferStatus::ShortPacket => write!(f, "short packet"),
            TransferStatus::Timeout => write!(f, "timeout"),
            TransferStatus::Other(code) => write!(f, "error {}", code),
        }
    }
}

/// Completion of one transfer, handing the buffer back to the driver
#[derive(Debug)]
pub struct TransferCompletion {
    pub handle: TransferHandle,
    pub status: TransferStatus,
    /// Number of bytes the device wrote into the buffer
    pub actual_length: usize,
    pub buffer: DmaBuffer,
}

/// Completion callback, invoked exactly once per submitted transfer
pub type CompletionHandler = Box<dyn FnOnce(TransferCompletion) + Send + 'static>;

/// Rejected submission; the buffer returns to the caller
#[derive(Debug)]
pub struct SubmitError {
    pub error: BusError,
    pub buffer: DmaBuffer,
}

/// Bus-side handle for one device
///
/// Implementations must uphold two guarantees the driver depends on:
///
/// - a completion handler is never invoked from inside `submit_transfer`;
/// - once `cancel_transfer` returns, the completion for that transfer has
///   already been delivered and no further completion will fire for it.
pub trait BusDevice: Send + Sync {
    /// Non-control endpoints of the interface the driver is bound to
    fn endpoints(&self) -> Vec<EndpointDescriptor>;

    /// First interrupt IN endpoint of the interface, if any
    fn find_interrupt_in_endpoint(&self) -> Option<EndpointDescriptor> {
        self.endpoints()
            .into_iter()
            .find(EndpointDescriptor::is_interrupt_in)
    }

    /// Identity strings, IDs and topology path
    fn identity(&self) -> DeviceIdentity;

    /// Allocate a DMA-visible buffer of `size` bytes
    fn allocate_dma_buffer(&self, size: usize) -> Result<DmaBuffer, BusError>;

    /// Return a buffer obtained from [`BusDevice::allocate_dma_buffer`]
    fn free_dma_buffer(&self, buffer: DmaBuffer);

    /// Queue an interrupt transfer; `on_complete` fires asynchronously
    fn submit_transfer(
        &self,
        transfer: InterruptTransfer,
        on_complete: CompletionHandler,
    ) -> Result<TransferHandle, SubmitError>;

    /// Cancel a transfer and wait until its completion has been delivered
    ///
    /// Cancelling a transfer that already completed is a no-op.
    fn cancel_transfer(&self, handle: TransferHandle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_success() {
        assert_eq!(TransferStatus::Success.classify(4), CompletionClass::Report);
        assert_eq!(TransferStatus::Success.classify(8), CompletionClass::Report);
        // Success with a short payload is a lost cycle
        assert_eq!(
            TransferStatus::Success.classify(3),
            CompletionClass::Recoverable
        );
    }

    #[test]
    fn test_classify_device_gone() {
        for status in [
            TransferStatus::ConnectionReset,
            TransferStatus::NoSuchDevice,
            TransferStatus::ShutdownInProgress,
        ] {
            assert_eq!(status.classify(0), CompletionClass::DeviceGone);
            assert_eq!(status.classify(4), CompletionClass::DeviceGone);
        }
    }

    #[test]
    fn test_classify_recoverable() {
        for status in [
            TransferStatus::Stall,
            TransferStatus::Overflow,
            TransferStatus::ProtocolError,
            TransferStatus::ShortPacket,
            TransferStatus::Timeout,
            TransferStatus::Other(-71),
        ] {
            assert_eq!(status.classify(4), CompletionClass::Recoverable);
        }
    }

    #[test]
    fn test_dma_buffer_access() {
        let mut buffer = DmaBuffer::new(DmaAddr(0x1000), vec![0u8; 8].into_boxed_slice());
        buffer.as_mut_slice()[..4].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(buffer.len(), 8);
        assert_eq!(buffer.addr(), DmaAddr(0x1000));
        assert_eq!(&buffer.as_slice()[..4], &[1, 2, 3, 4]);
    }
}
