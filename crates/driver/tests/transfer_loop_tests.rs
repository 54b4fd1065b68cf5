//! Integration tests for the transfer loop
//!
//! Drives a [`TransferLoop`] against the mock bus and checks:
//! - Report completions are decoded, emitted and re-armed
//! - Recoverable failures resubmit exactly once
//! - Device-gone completions stop the loop for good
//! - A rejected resubmission stops the loop

use common::test_utils::{MockBus, RecordingSink, create_boot_mouse_endpoint};
use protocol::{
    BusDevice, BusError, EndpointDescriptor, InputSink, RegistrationHandle, TransferStatus,
};
use std::sync::Arc;
use usbmouse::usb::{LoopPhase, StopReason, TransferBuffer, TransferLoop};

const HANDLE: RegistrationHandle = RegistrationHandle(7);

fn setup_with(endpoint: EndpointDescriptor) -> (Arc<MockBus>, Arc<RecordingSink>, TransferLoop) {
    let bus = Arc::new(MockBus::with_endpoints(vec![endpoint]));
    let sink = Arc::new(RecordingSink::new());
    let buffer = TransferBuffer::allocate(bus.as_ref()).unwrap();
    let controller = TransferLoop::new(
        Arc::clone(&bus) as Arc<dyn BusDevice>,
        Arc::clone(&sink) as Arc<dyn InputSink>,
        HANDLE,
        endpoint,
        buffer,
        "usb-001-1/input0",
    );
    (bus, sink, controller)
}

fn setup() -> (Arc<MockBus>, Arc<RecordingSink>, TransferLoop) {
    setup_with(create_boot_mouse_endpoint())
}

mod reports {
    use super::*;

    #[test]
    fn test_reports_arrive_in_order() {
        let (bus, sink, controller) = setup();
        controller.start().unwrap();

        assert!(bus.complete_report([0x01, 0x05, 0x00, 0x00]));
        assert!(bus.complete_report([0x00, 0x00, 0xFB, 0x01]));
        assert!(bus.complete_report([0x04, 0x80, 0x7F, 0xFF]));

        let reports = sink.reports_for(HANDLE);
        assert_eq!(reports.len(), 3);
        assert!(reports[0].buttons.left);
        assert_eq!(reports[0].dx, 5);
        assert_eq!((reports[1].dy, reports[1].wheel), (-5, 1));
        assert!(reports[2].buttons.middle);
        assert_eq!((reports[2].dx, reports[2].dy, reports[2].wheel), (-128, 127, -1));

        // Always exactly one transfer in flight
        assert_eq!(bus.outstanding(), 1);
        assert_eq!(bus.stats().max_outstanding, 1);
        assert_eq!(controller.phase(), LoopPhase::Submitted);
    }

    #[test]
    fn test_every_transfer_reuses_the_same_buffer() {
        let (bus, _sink, controller) = setup();
        controller.start().unwrap();

        for _ in 0..5 {
            assert!(bus.complete_report([0, 1, 1, 0]));
        }

        let submitted = bus.submitted();
        assert_eq!(submitted.len(), 6);
        assert!(submitted.iter().all(|s| s.addr == submitted[0].addr));
        assert!(submitted.iter().all(|s| s.interval == 10));
        assert_eq!(bus.stats().allocations, 1);
    }

    #[test]
    fn test_eight_byte_endpoint_requests_eight_bytes() {
        let (bus, sink, controller) = setup_with(EndpointDescriptor::interrupt_in(1, 8, 4));
        assert_eq!(controller.transfer_length(), 8);

        controller.start().unwrap();
        assert_eq!(bus.submitted()[0].length, 8);

        // Trailing vendor bytes are ignored
        assert!(bus.complete(
            TransferStatus::Success,
            &[0x02, 0x01, 0x02, 0x03, 0xAA, 0xBB, 0xCC, 0xDD]
        ));
        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].buttons.right);
        assert_eq!(reports[0].wheel, 3);
    }
}

mod recoverable {
    use super::*;

    #[test]
    fn test_recoverable_error_resubmits_once() {
        let (bus, sink, controller) = setup();
        controller.start().unwrap();

        assert!(bus.complete(TransferStatus::ProtocolError, &[]));

        assert!(sink.reports().is_empty());
        assert_eq!(bus.stats().submissions, 2);
        assert_eq!(bus.outstanding(), 1);
        assert_eq!(controller.phase(), LoopPhase::Submitted);
        assert_eq!(controller.stats().recoverable_errors, 1);
    }

    #[test]
    fn test_short_success_is_recoverable() {
        let (bus, sink, controller) = setup();
        controller.start().unwrap();

        assert!(bus.complete(TransferStatus::Success, &[0x01, 0x02]));

        assert!(sink.reports().is_empty());
        assert_eq!(bus.stats().submissions, 2);
        assert_eq!(controller.stats().recoverable_errors, 1);
    }

    #[test]
    fn test_stall_and_overflow_keep_polling() {
        let (bus, sink, controller) = setup();
        controller.start().unwrap();

        assert!(bus.complete(TransferStatus::Stall, &[]));
        assert!(bus.complete(TransferStatus::Overflow, &[]));
        assert!(bus.complete(TransferStatus::Other(-71), &[]));
        assert!(bus.complete_report([0x01, 0x00, 0x00, 0x00]));

        assert_eq!(sink.reports().len(), 1);
        assert_eq!(controller.stats().recoverable_errors, 3);
        assert_eq!(controller.phase(), LoopPhase::Submitted);
    }
}

mod device_gone {
    use super::*;

    #[test]
    fn test_device_gone_stops_without_resubmit() {
        for status in [
            TransferStatus::ConnectionReset,
            TransferStatus::NoSuchDevice,
            TransferStatus::ShutdownInProgress,
        ] {
            let (bus, sink, controller) = setup();
            controller.start().unwrap();

            assert!(bus.complete(status, &[]));

            assert_eq!(
                controller.phase(),
                LoopPhase::Stopped(StopReason::DeviceGone(status))
            );
            assert_eq!(bus.stats().submissions, 1);
            assert!(!bus.has_pending());
            assert!(sink.reports().is_empty());
        }
    }

    #[test]
    fn test_stopped_loop_restarts_only_after_reset() {
        let (bus, _sink, controller) = setup();
        controller.start().unwrap();
        assert!(bus.complete(TransferStatus::NoSuchDevice, &[]));

        assert!(controller.start().is_err());
        assert_eq!(bus.stats().submissions, 1);

        controller.reset();
        controller.start().unwrap();
        assert_eq!(bus.stats().submissions, 2);
    }
}

mod resubmit_failure {
    use super::*;

    #[test]
    fn test_rejected_resubmit_stops_the_loop() {
        let (bus, sink, controller) = setup();
        controller.start().unwrap();

        bus.fail_next_submissions(1, BusError::NoMemory);
        assert!(bus.complete_report([0x01, 0x01, 0x01, 0x00]));

        // The report that completed is still delivered
        assert_eq!(sink.reports().len(), 1);
        assert_eq!(
            controller.phase(),
            LoopPhase::Stopped(StopReason::ResubmitFailed(BusError::NoMemory))
        );
        assert_eq!(controller.stats().resubmit_failures, 1);
        assert!(!bus.has_pending());

        // The buffer came back, so the loop can be retired cleanly
        let buffer = controller.retire().unwrap();
        buffer.release(bus.as_ref()).unwrap();
        assert_eq!(bus.stats().live_buffers(), 0);
    }

    #[test]
    fn test_failed_start_leaves_loop_idle() {
        let (bus, _sink, controller) = setup();

        bus.fail_next_submissions(1, BusError::Busy);
        assert!(controller.start().is_err());
        assert_eq!(controller.phase(), LoopPhase::Idle);

        controller.start().unwrap();
        assert_eq!(controller.phase(), LoopPhase::Submitted);
    }
}

mod cancellation {
    use super::*;

    #[test]
    fn test_stop_suppresses_resubmission() {
        let (bus, sink, controller) = setup();
        controller.start().unwrap();

        controller.stop();

        assert_eq!(controller.phase(), LoopPhase::Idle);
        assert_eq!(bus.stats().cancels, 1);
        assert_eq!(bus.stats().submissions, 1);
        assert!(!bus.has_pending());
        assert!(sink.reports().is_empty());
    }

    #[test]
    fn test_stop_while_idle_is_noop() {
        let (bus, _sink, controller) = setup();
        controller.stop();
        controller.stop();
        assert_eq!(bus.stats().cancels, 0);
        assert_eq!(controller.phase(), LoopPhase::Idle);
    }
}
