//! Device session lifecycle
//!
//! A [`DeviceSession`] ties together the transfer buffer, the transfer loop
//! and the identity of one attached boot mouse:
//!
//! ```text
//! Detached -> Attaching -> Active { Opened <-> Closed } -> Detaching -> Detached
//! ```
//!
//! Sessions are cheap handles over shared state. A handle used after
//! [`DeviceSession::detach`] is stale and every operation on it returns
//! [`DriverError::SessionGone`]. The input sink only ever holds a weak
//! reference through the registered callbacks.

use crate::usb::buffer::TransferBuffer;
use crate::usb::controller::{LoopPhase, LoopStats, TransferLoop};
use common::lock;
use protocol::{
    BOOT_REPORT_LEN, BusDevice, Capabilities, DeviceIdentity, DriverError, EndpointDescriptor,
    InputCallbacks, InputDeviceInfo, InputSink, RegistrationHandle, UnsupportedReason,
};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, info};

/// Observable session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Attaching,
    /// Attached with a transfer in flight
    Opened,
    /// Attached, transfer loop idle or stopped
    Closed,
    Detaching,
    Detached,
}

enum SessionState {
    Attaching,
    Active {
        registration: RegistrationHandle,
        controller: TransferLoop,
    },
    Detaching,
    Detached,
}

struct SessionShared {
    bus: Arc<dyn BusDevice>,
    sink: Arc<dyn InputSink>,
    identity: DeviceIdentity,
    name: String,
    phys: String,
    state: Mutex<SessionState>,
}

/// Handle to one attached boot mouse
#[derive(Clone)]
pub struct DeviceSession {
    shared: Arc<SessionShared>,
}

impl DeviceSession {
    /// Bind to a device and register it with the input sink
    ///
    /// Fails without allocating anything when the device does not expose
    /// exactly one non-control endpoint that is interrupt IN. Every later
    /// failure releases what was acquired before returning.
    pub fn attach(bus: Arc<dyn BusDevice>, sink: Arc<dyn InputSink>) -> Result<Self, DriverError> {
        let endpoint = select_endpoint(bus.as_ref())?;

        let identity = bus.identity();
        let name = identity.display_name();
        let phys = identity.phys_path();

        let shared = Arc::new(SessionShared {
            bus: Arc::clone(&bus),
            sink: Arc::clone(&sink),
            identity,
            name,
            phys,
            state: Mutex::new(SessionState::Attaching),
        });

        let buffer = TransferBuffer::allocate(bus.as_ref())?;

        let info = InputDeviceInfo {
            name: shared.name.clone(),
            phys: shared.phys.clone(),
            id: shared.identity.input_id(),
            capabilities: Capabilities::boot_mouse(),
        };
        let callbacks: Arc<dyn InputCallbacks> = Arc::new(SessionCallbacks {
            session: Arc::downgrade(&shared),
        });

        let registration = match sink.register_device(info, callbacks) {
            Ok(registration) => registration,
            Err(err) => {
                if let Err(release_err) = buffer.release(bus.as_ref()) {
                    error!(
                        "{}: failed to release transfer buffer: {}",
                        shared.phys, release_err
                    );
                }
                return Err(err.into());
            }
        };

        let controller = TransferLoop::new(
            Arc::clone(&bus),
            Arc::clone(&sink),
            registration,
            endpoint,
            buffer,
            shared.phys.clone(),
        );

        *lock(&shared.state) = SessionState::Active {
            registration,
            controller,
        };

        info!("{} on {}", shared.name, shared.phys);
        Ok(Self { shared })
    }

    /// Start polling the device
    ///
    /// A no-op while already polling. A loop stopped by a device-gone
    /// completion or a failed resubmission is reset and restarted.
    pub fn open(&self) -> Result<(), DriverError> {
        let state = lock(&self.shared.state);

        match &*state {
            SessionState::Active { controller, .. } => {
                match controller.phase() {
                    LoopPhase::Submitted | LoopPhase::Cancelling => return Ok(()),
                    LoopPhase::Stopped(reason) => {
                        debug!("{}: restarting loop stopped by {:?}", self.shared.phys, reason);
                        controller.reset();
                    }
                    LoopPhase::Idle => {}
                }

                controller.start().map_err(|err| match err {
                    DriverError::Submission(bus_err) => DriverError::Io(bus_err),
                    other => other,
                })
            }
            SessionState::Attaching => Err(DriverError::NotReady),
            SessionState::Detaching | SessionState::Detached => Err(DriverError::SessionGone),
        }
    }

    /// Stop polling the device
    ///
    /// Closing a closed session is a no-op.
    pub fn close(&self) -> Result<(), DriverError> {
        let state = lock(&self.shared.state);

        match &*state {
            SessionState::Active { controller, .. } => {
                controller.stop();
                Ok(())
            }
            SessionState::Attaching => Err(DriverError::NotReady),
            // detach() already owns the loop and stops it itself
            SessionState::Detaching => Ok(()),
            SessionState::Detached => Err(DriverError::SessionGone),
        }
    }

    /// Tear the session down
    ///
    /// Stops the loop, waits for the bus to give the buffer back, unregisters
    /// from the input sink and releases the buffer. After this returns, no
    /// completion for this session runs and every handle is stale.
    pub fn detach(&self) -> Result<(), DriverError> {
        let (registration, controller) = {
            let mut state = lock(&self.shared.state);
            match std::mem::replace(&mut *state, SessionState::Detaching) {
                SessionState::Active {
                    registration,
                    controller,
                } => (registration, controller),
                other => {
                    let err = match other {
                        SessionState::Attaching => DriverError::NotReady,
                        _ => DriverError::SessionGone,
                    };
                    *state = other;
                    return Err(err);
                }
            }
        };

        controller.stop();
        self.shared.sink.unregister_device(registration);

        let result = controller
            .retire()
            .and_then(|buffer| buffer.release(self.shared.bus.as_ref()));
        if let Err(err) = &result {
            error!("{}: detach could not release buffer: {}", self.shared.phys, err);
        }

        *lock(&self.shared.state) = SessionState::Detached;
        info!("{} disconnected from {}", self.shared.name, self.shared.phys);

        result
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn phys(&self) -> &str {
        &self.shared.phys
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.shared.identity
    }

    /// Current phase
    ///
    /// An attached session is `Opened` only while its loop owns a transfer;
    /// a loop stopped by the device going away or a failed resubmission
    /// reports `Closed`.
    pub fn phase(&self) -> SessionPhase {
        match &*lock(&self.shared.state) {
            SessionState::Attaching => SessionPhase::Attaching,
            SessionState::Active { controller, .. } if controller.phase().is_active() => {
                SessionPhase::Opened
            }
            SessionState::Active { .. } => SessionPhase::Closed,
            SessionState::Detaching => SessionPhase::Detaching,
            SessionState::Detached => SessionPhase::Detached,
        }
    }

    pub fn is_open(&self) -> bool {
        self.phase() == SessionPhase::Opened
    }

    /// Handle the input sink assigned, while attached
    pub fn registration(&self) -> Option<RegistrationHandle> {
        match &*lock(&self.shared.state) {
            SessionState::Active { registration, .. } => Some(*registration),
            _ => None,
        }
    }

    /// Transfer loop state, while attached
    pub fn loop_phase(&self) -> Option<LoopPhase> {
        match &*lock(&self.shared.state) {
            SessionState::Active { controller, .. } => Some(controller.phase()),
            _ => None,
        }
    }

    /// Transfer loop counters, while attached
    pub fn stats(&self) -> Option<LoopStats> {
        match &*lock(&self.shared.state) {
            SessionState::Active { controller, .. } => Some(controller.stats()),
            _ => None,
        }
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("name", &self.shared.name)
            .field("phys", &self.shared.phys)
            .field("phase", &self.phase())
            .finish()
    }
}

/// The one interrupt IN endpoint a boot mouse must expose
///
/// Its packets must be able to hold a whole boot report.
fn select_endpoint(bus: &dyn BusDevice) -> Result<EndpointDescriptor, UnsupportedReason> {
    let endpoints: Vec<_> = bus
        .endpoints()
        .into_iter()
        .filter(|ep| !ep.is_control())
        .collect();

    if endpoints.len() != 1 {
        return Err(UnsupportedReason::EndpointCount(endpoints.len()));
    }

    let endpoint = bus
        .find_interrupt_in_endpoint()
        .ok_or(UnsupportedReason::NotInterruptIn {
            address: endpoints[0].address,
        })?;

    if usize::from(endpoint.max_packet_size) < BOOT_REPORT_LEN {
        return Err(UnsupportedReason::PacketTooSmall {
            address: endpoint.address,
            max_packet_size: endpoint.max_packet_size,
        });
    }

    Ok(endpoint)
}

/// Open/close hooks handed to the input sink
struct SessionCallbacks {
    session: Weak<SessionShared>,
}

impl SessionCallbacks {
    fn session(&self) -> Option<DeviceSession> {
        self.session
            .upgrade()
            .map(|shared| DeviceSession { shared })
    }
}

impl InputCallbacks for SessionCallbacks {
    fn open(&self) -> Result<(), DriverError> {
        self.session().ok_or(DriverError::SessionGone)?.open()
    }

    fn close(&self) {
        if let Some(session) = self.session()
            && let Err(err) = session.close()
        {
            debug!("{}: close callback ignored: {}", session.phys(), err);
        }
    }
}
