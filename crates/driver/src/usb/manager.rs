//! Session manager
//!
//! Tracks one [`DeviceSession`] per attached boot mouse, keyed by bus
//! location. Runs in the USB thread, reacting to arrival and removal
//! notifications and to commands from the Tokio runtime.

use crate::input::BridgeSink;
use crate::usb::session::DeviceSession;
use common::DriverEvent;
use protocol::{BusDevice, DeviceLocation, DriverError, InputSink, MouseInfo};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Manager behaviour taken from the `[usb]` configuration section
#[derive(Debug, Clone, Default)]
pub struct ManagerOptions {
    /// VID:PID allow-list; empty allows every boot mouse
    pub filters: Vec<String>,
    /// Open each session as soon as it is attached
    pub auto_open: bool,
}

struct TrackedSession {
    session: DeviceSession,
    vendor_id: u16,
    product_id: u16,
}

/// Registry of attached mice
pub struct SessionManager {
    sessions: BTreeMap<DeviceLocation, TrackedSession>,
    sink: Arc<BridgeSink>,
    event_sender: async_channel::Sender<DriverEvent>,
    options: ManagerOptions,
}

impl SessionManager {
    pub fn new(
        event_sender: async_channel::Sender<DriverEvent>,
        sink: Arc<BridgeSink>,
        options: ManagerOptions,
    ) -> Self {
        Self {
            sessions: BTreeMap::new(),
            sink,
            event_sender,
            options,
        }
    }

    pub fn sink(&self) -> &Arc<BridgeSink> {
        &self.sink
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, location: DeviceLocation) -> bool {
        self.sessions.contains_key(&location)
    }

    /// Session attached at `location`, if any
    pub fn session(&self, location: DeviceLocation) -> Option<&DeviceSession> {
        self.sessions.get(&location).map(|tracked| &tracked.session)
    }

    /// Attach a newly arrived device
    ///
    /// Returns the new session's summary, or `None` when the device was
    /// filtered out or is already tracked. Attach failures are logged and
    /// returned; the device is skipped.
    pub fn handle_arrival(
        &mut self,
        location: DeviceLocation,
        bus: Arc<dyn BusDevice>,
    ) -> Result<Option<MouseInfo>, DriverError> {
        if self.sessions.contains_key(&location) {
            debug!("Device {} already attached, ignoring arrival", location);
            return Ok(None);
        }

        let identity = bus.identity();
        if !Self::check_filter(identity.vendor_id, identity.product_id, &self.options.filters) {
            debug!(
                "Device ignored by filter: {}, vid={:#06x}, pid={:#06x}",
                location, identity.vendor_id, identity.product_id
            );
            return Ok(None);
        }

        let sink: Arc<dyn InputSink> = Arc::clone(&self.sink) as Arc<dyn InputSink>;
        let session = DeviceSession::attach(bus, sink).inspect_err(|e| {
            warn!("Failed to attach device {}: {}", location, e);
        })?;

        self.sessions.insert(
            location,
            TrackedSession {
                session: session.clone(),
                vendor_id: identity.vendor_id,
                product_id: identity.product_id,
            },
        );

        if self.options.auto_open
            && let Some(registration) = session.registration()
            && let Err(e) = self.sink.open_device(registration)
        {
            warn!("Failed to open {}: {}", session.phys(), e);
        }

        let device = self.describe(location).ok_or(DriverError::SessionGone)?;
        self.publish(DriverEvent::DeviceAttached {
            device: device.clone(),
        });

        Ok(Some(device))
    }

    /// Detach and forget the device at `location`
    ///
    /// Returns whether a session was tracked there.
    pub fn handle_removal(&mut self, location: DeviceLocation) -> bool {
        let Some(tracked) = self.sessions.remove(&location) else {
            return false;
        };

        let phys = tracked.session.phys().to_string();
        if let Err(e) = tracked.session.detach() {
            error!("Failed to detach {}: {}", phys, e);
        }

        self.publish(DriverEvent::DeviceDetached { location, phys });
        true
    }

    /// Open the session whose physical path is `phys`
    pub fn open(&self, phys: &str) -> Result<(), DriverError> {
        let registration = self.registration_for(phys)?;
        self.sink.open_device(registration)
    }

    /// Close the session whose physical path is `phys`
    pub fn close(&self, phys: &str) -> Result<(), DriverError> {
        let registration = self.registration_for(phys)?;
        self.sink.close_device(registration)
    }

    /// Summaries of every attached mouse, ordered by location
    pub fn list(&self) -> Vec<MouseInfo> {
        self.sessions
            .keys()
            .filter_map(|location| self.describe(*location))
            .collect()
    }

    /// Close and detach every session
    pub fn shutdown(&mut self) {
        let locations: Vec<_> = self.sessions.keys().copied().collect();
        if !locations.is_empty() {
            info!("Detaching {} mice", locations.len());
        }

        for location in locations {
            if let Some(tracked) = self.sessions.get(&location)
                && let Some(registration) = tracked.session.registration()
                && let Err(e) = self.sink.close_device(registration)
            {
                debug!("Close before detach of {} failed: {}", location, e);
            }
            self.handle_removal(location);
        }
    }

    fn registration_for(&self, phys: &str) -> Result<protocol::RegistrationHandle, DriverError> {
        self.sessions
            .values()
            .find(|tracked| tracked.session.phys() == phys)
            .and_then(|tracked| tracked.session.registration())
            .ok_or(DriverError::SessionGone)
    }

    fn describe(&self, location: DeviceLocation) -> Option<MouseInfo> {
        let tracked = self.sessions.get(&location)?;
        Some(MouseInfo {
            location,
            name: tracked.session.name().to_string(),
            phys: tracked.session.phys().to_string(),
            vendor_id: tracked.vendor_id,
            product_id: tracked.product_id,
            opened: tracked.session.is_open(),
        })
    }

    fn publish(&self, event: DriverEvent) {
        if let Err(e) = self.event_sender.send_blocking(event) {
            debug!("Dropping driver event, receiver gone: {}", e);
        }
    }

    /// Check if a VID/PID pair is allowed by the filters
    ///
    /// Filter format: `0xVID:0xPID`, `0xVID:*` or `*:*`; the `0x` prefix is
    /// optional. An empty list allows everything.
    pub fn check_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
        if filters.is_empty() {
            return true;
        }

        filters.iter().any(|filter| {
            let Some((filter_vid, filter_pid)) = filter.split_once(':') else {
                return false;
            };
            matches_id(filter_vid, vid) && matches_id(filter_pid, pid)
        })
    }
}

fn matches_id(pattern: &str, id: u16) -> bool {
    let pattern = pattern.trim();
    if pattern == "*" {
        return true;
    }

    let digits = pattern
        .strip_prefix("0x")
        .or_else(|| pattern.strip_prefix("0X"))
        .unwrap_or(pattern);
    u16::from_str_radix(digits, 16).is_ok_and(|value| value == id)
}
