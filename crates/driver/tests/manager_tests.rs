//! Integration tests for the session manager
//!
//! Runs the manager against mock buses and a real [`BridgeSink`]:
//! - VID:PID filtering and duplicate arrivals
//! - Auto-open and open/close by physical path
//! - Removal and shutdown events
//! - Reports reaching the event channel

use async_channel::Receiver;
use common::DriverEvent;
use common::test_utils::{MockBus, create_boot_mouse_endpoint, create_mock_identity};
use protocol::{BusDevice, DeviceLocation, DriverError, EndpointDescriptor};
use std::sync::Arc;
use usbmouse::input::BridgeSink;
use usbmouse::usb::{ManagerOptions, SessionManager, SessionPhase};

fn location(address: u8) -> DeviceLocation {
    DeviceLocation { bus: 1, address }
}

fn mouse(vendor_id: u16, product_id: u16, port: u8) -> Arc<MockBus> {
    let mut identity = create_mock_identity(vendor_id, product_id);
    identity.topology = format!("usb-001-{}", port);
    Arc::new(MockBus::new(identity, vec![create_boot_mouse_endpoint()]))
}

fn manager(options: ManagerOptions) -> (SessionManager, Receiver<DriverEvent>) {
    let (tx, rx) = async_channel::bounded(64);
    let sink = Arc::new(BridgeSink::new(tx.clone()));
    (SessionManager::new(tx, sink, options), rx)
}

fn drain(rx: &Receiver<DriverEvent>) -> Vec<DriverEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

fn as_bus(bus: &Arc<MockBus>) -> Arc<dyn BusDevice> {
    Arc::clone(bus) as Arc<dyn BusDevice>
}

mod arrival {
    use super::*;

    #[test]
    fn test_arrival_publishes_attached_event() {
        let (mut manager, rx) = manager(ManagerOptions::default());
        let bus = mouse(0x046d, 0xc077, 1);

        let info = manager
            .handle_arrival(location(5), as_bus(&bus))
            .unwrap()
            .unwrap();
        assert_eq!(info.phys, "usb-001-1/input0");
        assert_eq!(info.vendor_id, 0x046d);
        assert!(!info.opened);

        let events = drain(&rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            DriverEvent::DeviceAttached { device } if device.location == location(5)
        ));
        assert_eq!(manager.len(), 1);
        assert_eq!(bus.stats().submissions, 0);
    }

    #[test]
    fn test_duplicate_arrival_is_ignored() {
        let (mut manager, rx) = manager(ManagerOptions::default());
        let bus = mouse(0x046d, 0xc077, 1);

        assert!(manager.handle_arrival(location(5), as_bus(&bus)).unwrap().is_some());
        assert!(manager.handle_arrival(location(5), as_bus(&bus)).unwrap().is_none());

        assert_eq!(manager.len(), 1);
        assert_eq!(bus.stats().allocations, 1);
        assert_eq!(drain(&rx).len(), 1);
    }

    #[test]
    fn test_filtered_device_is_not_attached() {
        let options = ManagerOptions {
            filters: vec!["0x1234:*".to_string()],
            auto_open: false,
        };
        let (mut manager, rx) = manager(options);
        let excluded = mouse(0x046d, 0xc077, 1);
        let allowed = mouse(0x1234, 0x0001, 2);

        assert!(manager.handle_arrival(location(5), as_bus(&excluded)).unwrap().is_none());
        assert!(manager.handle_arrival(location(6), as_bus(&allowed)).unwrap().is_some());

        assert_eq!(excluded.stats().allocations, 0);
        assert!(!manager.contains(location(5)));
        assert!(manager.contains(location(6)));
        assert_eq!(drain(&rx).len(), 1);
    }

    #[test]
    fn test_unsupported_device_is_skipped() {
        let (mut manager, rx) = manager(ManagerOptions::default());
        let bus = Arc::new(MockBus::with_endpoints(vec![
            create_boot_mouse_endpoint(),
            EndpointDescriptor::interrupt_in(2, 8, 10),
        ]));

        assert!(matches!(
            manager.handle_arrival(location(5), as_bus(&bus)),
            Err(DriverError::UnsupportedDevice(_))
        ));
        assert!(manager.is_empty());
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn test_auto_open_starts_polling() {
        let options = ManagerOptions {
            filters: Vec::new(),
            auto_open: true,
        };
        let (mut manager, rx) = manager(options);
        let bus = mouse(0x046d, 0xc077, 1);

        let info = manager
            .handle_arrival(location(5), as_bus(&bus))
            .unwrap()
            .unwrap();
        assert!(info.opened);
        assert_eq!(bus.outstanding(), 1);
        drain(&rx);

        assert!(bus.complete_report([0x01, 0x0A, 0xF6, 0x00]));
        let events = drain(&rx);
        match events.as_slice() {
            [DriverEvent::Report { phys, report }] => {
                assert_eq!(phys, "usb-001-1/input0");
                assert!(report.buttons.left);
                assert_eq!((report.dx, report.dy), (10, -10));
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }
}

mod open_close {
    use super::*;

    #[test]
    fn test_open_and_close_by_phys() {
        let (mut manager, _rx) = manager(ManagerOptions::default());
        let bus = mouse(0x046d, 0xc077, 3);
        manager.handle_arrival(location(5), as_bus(&bus)).unwrap();

        let phys = manager.session(location(5)).unwrap().phys().to_string();
        assert_eq!(phys, "usb-001-3/input0");

        manager.open(&phys).unwrap();
        let registration = manager.session(location(5)).unwrap().registration().unwrap();
        assert!(manager.sink().is_open(registration));
        assert_eq!(
            manager.session(location(5)).unwrap().phase(),
            SessionPhase::Opened
        );
        assert!(manager.list()[0].opened);

        manager.close(&phys).unwrap();
        assert_eq!(
            manager.session(location(5)).unwrap().phase(),
            SessionPhase::Closed
        );
        assert!(!bus.has_pending());
    }

    #[test]
    fn test_unknown_device_is_session_gone() {
        let (manager, _rx) = manager(ManagerOptions::default());

        assert_eq!(manager.open("usb-009-9/input0"), Err(DriverError::SessionGone));
        assert_eq!(manager.close("usb-009-9/input0"), Err(DriverError::SessionGone));
        assert!(manager.session(location(9)).is_none());
    }

    #[test]
    fn test_list_is_ordered_by_location() {
        let (mut manager, _rx) = manager(ManagerOptions::default());
        manager.handle_arrival(location(9), as_bus(&mouse(0x0001, 0x0001, 1))).unwrap();
        manager.handle_arrival(location(2), as_bus(&mouse(0x0002, 0x0002, 2))).unwrap();
        manager.handle_arrival(location(4), as_bus(&mouse(0x0003, 0x0003, 3))).unwrap();

        let addresses: Vec<_> = manager.list().iter().map(|m| m.location.address).collect();
        assert_eq!(addresses, vec![2, 4, 9]);
    }
}

mod removal {
    use super::*;

    #[test]
    fn test_removal_detaches_and_publishes() {
        let options = ManagerOptions {
            filters: Vec::new(),
            auto_open: true,
        };
        let (mut manager, rx) = manager(options);
        let bus = mouse(0x046d, 0xc077, 1);
        manager.handle_arrival(location(5), as_bus(&bus)).unwrap();
        drain(&rx);

        assert!(manager.handle_removal(location(5)));
        assert!(!manager.handle_removal(location(5)));

        assert!(manager.is_empty());
        assert_eq!(manager.sink().device_count(), 0);
        assert_eq!(bus.stats().live_buffers(), 0);
        assert!(!bus.has_pending());

        let events = drain(&rx);
        assert!(matches!(
            events.as_slice(),
            [DriverEvent::DeviceDetached { location: l, phys }]
                if *l == location(5) && phys == "usb-001-1/input0"
        ));
    }

    #[test]
    fn test_shutdown_detaches_everything() {
        let options = ManagerOptions {
            filters: Vec::new(),
            auto_open: true,
        };
        let (mut manager, rx) = manager(options);
        let buses: Vec<_> = (1..=3).map(|port| mouse(0x046d, 0xc077, port)).collect();
        for (i, bus) in buses.iter().enumerate() {
            manager.handle_arrival(location(10 + i as u8), as_bus(bus)).unwrap();
        }
        drain(&rx);

        manager.shutdown();

        assert!(manager.is_empty());
        for bus in &buses {
            assert_eq!(bus.stats().allocations, bus.stats().frees);
            assert!(!bus.has_pending());
        }
        let detached = drain(&rx)
            .into_iter()
            .filter(|e| matches!(e, DriverEvent::DeviceDetached { .. }))
            .count();
        assert_eq!(detached, 3);
    }
}
