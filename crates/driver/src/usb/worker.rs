//! USB worker thread
//!
//! Dedicated thread that owns the libusb context and the session manager.
//! Runs the libusb event loop, turns hot-plug notifications into session
//! arrivals and removals, and answers commands from the Tokio runtime.

use crate::config::DriverConfig;
use crate::input::BridgeSink;
use crate::usb::host::{RusbMouse, RusbOptions, find_boot_interface, topology_path};
use crate::usb::manager::SessionManager;
use common::{DriverCommand, DriverWorker, lock};
use protocol::{BusDevice, DeviceIdentity, DeviceLocation, MouseInfo};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// How long one libusb event pump may block
const EVENT_TIMEOUT: Duration = Duration::from_millis(100);
/// Rescan period when the platform has no hot-plug support
const RESCAN_INTERVAL: Duration = Duration::from_secs(1);

enum HotplugEvent {
    Arrived(Device<Context>),
    Left(DeviceLocation),
}

type HotplugQueue = Arc<Mutex<VecDeque<HotplugEvent>>>;

/// Hot-plug callback handler
///
/// libusb calls it from inside `handle_events`, where the manager cannot be
/// borrowed; it only queues the notification for the worker loop.
struct HotplugCallback {
    queue: HotplugQueue,
}

impl Hotplug<Context> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        lock(&self.queue).push_back(HotplugEvent::Arrived(device));
    }

    fn device_left(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        lock(&self.queue).push_back(HotplugEvent::Left(location_of(&device)));
    }
}

fn location_of<T: UsbContext>(device: &Device<T>) -> DeviceLocation {
    DeviceLocation {
        bus: device.bus_number(),
        address: device.address(),
    }
}

/// USB worker thread
///
/// Manages the USB context, session manager, and event loop.
pub struct DriverWorkerThread {
    context: Context,
    manager: SessionManager,
    worker: DriverWorker,
    rusb_options: RusbOptions,
    filters: Vec<String>,
    hotplug_queue: HotplugQueue,
    hotplug_registration: Option<Registration<Context>>,
}

impl DriverWorkerThread {
    /// Create the worker, attach mice already plugged in and watch for more
    pub fn new(worker: DriverWorker, config: &DriverConfig) -> Result<Self, rusb::Error> {
        let context = Context::new()?;
        let sink = Arc::new(BridgeSink::new(worker.event_tx.clone()));
        let manager =
            SessionManager::new(worker.event_tx.clone(), sink, config.usb.manager_options());

        let mut thread = Self {
            context,
            manager,
            worker,
            rusb_options: config.usb.rusb_options(),
            filters: config.usb.filters.clone(),
            hotplug_queue: Arc::new(Mutex::new(VecDeque::new())),
            hotplug_registration: None,
        };
        thread.initialize()?;

        Ok(thread)
    }

    fn initialize(&mut self) -> Result<(), rusb::Error> {
        self.rescan()?;

        if rusb::has_hotplug() {
            let callback = HotplugCallback {
                queue: Arc::clone(&self.hotplug_queue),
            };
            let registration = HotplugBuilder::new()
                .enumerate(false) // We already enumerated
                .register(&self.context, Box::new(callback))?;
            self.hotplug_registration = Some(registration);
            debug!("Hot-plug callbacks registered");
        } else {
            warn!(
                "libusb has no hot-plug support here, rescanning every {:?}",
                RESCAN_INTERVAL
            );
        }

        info!("Driver initialized with {} mice", self.manager.len());
        Ok(())
    }

    /// Run the USB worker thread event loop
    ///
    /// The loop continues until a Shutdown command is received or the
    /// runtime side of the command channel goes away. Every session is
    /// closed and detached before returning.
    pub fn run(mut self) -> Result<(), rusb::Error> {
        info!("USB worker thread started");
        let mut last_scan = Instant::now();

        loop {
            match self.worker.try_recv_command() {
                Some(DriverCommand::Shutdown) => {
                    info!("USB worker shutting down");
                    break;
                }
                Some(cmd) => self.handle_command(cmd),
                None if self.worker.is_disconnected() => {
                    info!("Runtime gone, USB worker shutting down");
                    break;
                }
                None => {}
            }

            match self.context.handle_events(Some(EVENT_TIMEOUT)) {
                Ok(()) => {}
                Err(rusb::Error::Interrupted) => {
                    debug!("USB event handling interrupted");
                }
                Err(e) => {
                    warn!("Error handling USB events: {}", e);
                    std::thread::sleep(EVENT_TIMEOUT);
                }
            }

            self.process_hotplug_events();

            if self.hotplug_registration.is_none() && last_scan.elapsed() >= RESCAN_INTERVAL {
                if let Err(e) = self.rescan() {
                    warn!("Device rescan failed: {}", e);
                }
                last_scan = Instant::now();
            }
        }

        self.manager.shutdown();
        info!("USB worker thread stopped");
        Ok(())
    }

    fn process_hotplug_events(&mut self) {
        let events: Vec<_> = lock(&self.hotplug_queue).drain(..).collect();

        for event in events {
            match event {
                HotplugEvent::Arrived(device) => self.device_arrived(device),
                HotplugEvent::Left(location) => {
                    self.manager.handle_removal(location);
                }
            }
        }
    }

    /// Reconcile sessions with the devices currently on the bus
    fn rescan(&mut self) -> Result<(), rusb::Error> {
        let devices = self.context.devices()?;
        let mut present = BTreeSet::new();

        for device in devices.iter() {
            let location = location_of(&device);
            present.insert(location);
            if !self.manager.contains(location) {
                self.device_arrived(device);
            }
        }

        let gone: Vec<_> = self
            .manager
            .list()
            .into_iter()
            .map(|mouse| mouse.location)
            .filter(|location| !present.contains(location))
            .collect();
        for location in gone {
            self.manager.handle_removal(location);
        }

        Ok(())
    }

    fn device_arrived(&mut self, device: Device<Context>) {
        let location = location_of(&device);
        if self.manager.contains(location) {
            return;
        }

        match find_boot_interface(&device) {
            Ok(Some(_)) => {}
            Ok(None) => {
                trace!("Device {} has no boot mouse interface", location);
                return;
            }
            Err(e) => {
                debug!("Cannot read configuration of {}: {}", location, e);
                return;
            }
        }

        // Filter before claiming so excluded mice stay with the kernel driver
        if let Ok(desc) = device.device_descriptor()
            && !SessionManager::check_filter(desc.vendor_id(), desc.product_id(), &self.filters)
        {
            debug!(
                "Device ignored by filter: {}, vid={:#06x}, pid={:#06x}",
                location,
                desc.vendor_id(),
                desc.product_id()
            );
            return;
        }

        let bus: Arc<dyn BusDevice> = match RusbMouse::open(&device, &self.rusb_options) {
            Ok(mouse) => Arc::new(mouse),
            Err(e) => {
                warn!("Failed to open boot mouse {}: {}", location, e);
                return;
            }
        };

        // Attach failures are logged by the manager
        if let Ok(Some(mouse)) = self.manager.handle_arrival(location, bus) {
            info!("Attached {} at {}", mouse.name, location);
        }
    }

    /// Handle a command from the Tokio runtime
    fn handle_command(&self, cmd: DriverCommand) {
        // Wrap in catch_unwind to prevent panics from crashing the USB thread
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            answer_command(&self.manager, cmd)
        }));

        if let Err(e) = result {
            error!("Panic in USB command handler: {:?}", e);
        }
    }
}

/// Answer a command from the Tokio runtime
///
/// `Shutdown` is acted on by the worker loop before it gets here.
fn answer_command(manager: &SessionManager, cmd: DriverCommand) {
    match cmd {
        DriverCommand::ListDevices { response } => {
            let devices = manager.list();
            debug!("Listing {} mice", devices.len());
            let _ = response.send(devices);
        }

        DriverCommand::Shutdown => {
            debug!("Ignoring repeated shutdown request");
        }
    }
}

/// Spawn the USB worker thread
///
/// The thread runs until a Shutdown command is received or an error occurs.
pub fn spawn_driver_worker(
    worker: DriverWorker,
    config: DriverConfig,
) -> std::io::Result<std::thread::JoinHandle<Result<(), rusb::Error>>> {
    std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || {
            let worker_thread = DriverWorkerThread::new(worker, &config)?;
            worker_thread.run()
        })
}

/// Boot mice currently on the bus, without claiming them
///
/// Reads string descriptors when the device can be opened; otherwise the
/// name falls back to the VID:PID tag.
pub fn enumerate_boot_mice() -> Result<Vec<MouseInfo>, rusb::Error> {
    let context = Context::new()?;
    let mut mice = Vec::new();

    for device in context.devices()?.iter() {
        if !matches!(find_boot_interface(&device), Ok(Some(_))) {
            continue;
        }
        let Ok(desc) = device.device_descriptor() else {
            continue;
        };

        let strings = device.open().ok().map(|handle| {
            let read = |index: Option<u8>| {
                index.and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
            };
            (
                read(desc.manufacturer_string_index()),
                read(desc.product_string_index()),
            )
        });
        let (manufacturer, product) = strings.unwrap_or((None, None));

        let identity = DeviceIdentity {
            manufacturer,
            product,
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            release: 0,
            topology: topology_path(&device),
        };

        mice.push(MouseInfo {
            location: location_of(&device),
            name: identity.display_name(),
            phys: identity.phys_path(),
            vendor_id: identity.vendor_id,
            product_id: identity.product_id,
            opened: false,
        });
    }

    mice.sort_by_key(|mouse| mouse.location);
    Ok(mice)
}
