//! Transfer buffer ownership
//!
//! A session's DMA buffer lives in a single slot. Submitting a transfer
//! checks the buffer out of the slot and hands it to the bus; the completion
//! checks it back in. Releasing consumes the [`TransferBuffer`], so a buffer
//! can only be freed once, and only while it sits in the slot.

use protocol::{BusDevice, DmaAddr, DmaBuffer, DriverError, TRANSFER_BUFFER_LEN};
use tracing::{debug, warn};

/// Session-owned DMA buffer with a checked-out flag
#[derive(Debug)]
pub struct TransferBuffer {
    slot: Option<DmaBuffer>,
    addr: DmaAddr,
    capacity: usize,
}

impl TransferBuffer {
    /// Allocate the session's [`TRANSFER_BUFFER_LEN`]-byte buffer
    pub fn allocate(bus: &dyn BusDevice) -> Result<Self, DriverError> {
        let buffer = bus
            .allocate_dma_buffer(TRANSFER_BUFFER_LEN)
            .map_err(DriverError::Allocation)?;

        debug!(
            "Allocated {}-byte transfer buffer at {:#x}",
            buffer.len(),
            buffer.addr().0
        );

        Ok(Self {
            addr: buffer.addr(),
            capacity: buffer.len(),
            slot: Some(buffer),
        })
    }

    pub fn addr(&self) -> DmaAddr {
        self.addr
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether an in-flight transfer currently holds the buffer
    pub fn is_checked_out(&self) -> bool {
        self.slot.is_none()
    }

    /// Bytes currently in the buffer, unless it is checked out
    pub fn contents(&self) -> Option<&[u8]> {
        self.slot.as_ref().map(DmaBuffer::as_slice)
    }

    /// Move the buffer out for a transfer
    ///
    /// Returns `None` while it is already checked out.
    pub fn check_out(&mut self) -> Option<DmaBuffer> {
        self.slot.take()
    }

    /// Return the buffer after a completion or a rejected submission
    pub fn check_in(&mut self, buffer: DmaBuffer) {
        if buffer.addr() != self.addr {
            warn!(
                "Transfer buffer {:#x} returned to slot for {:#x}",
                buffer.addr().0,
                self.addr.0
            );
        }
        if self.slot.replace(buffer).is_some() {
            warn!("Transfer buffer {:#x} checked in twice", self.addr.0);
        }
    }

    /// Give the buffer back to the bus
    ///
    /// Refuses with [`DriverError::BufferInFlight`] while a transfer still
    /// holds the buffer; in that case nothing is freed.
    pub fn release(mut self, bus: &dyn BusDevice) -> Result<(), DriverError> {
        let buffer = self.slot.take().ok_or(DriverError::BufferInFlight)?;
        bus.free_dma_buffer(buffer);
        debug!("Released transfer buffer at {:#x}", self.addr.0);
        Ok(())
    }
}
