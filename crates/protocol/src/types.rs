//! USB and device type definitions
//!
//! Descriptor summaries, device identity, and the naming rules used when a
//! mouse is presented to the input subsystem.

use serde::{Deserialize, Serialize};

/// HID interface class code
pub const CLASS_HID: u8 = 0x03;
/// HID boot interface subclass code
pub const SUBCLASS_BOOT: u8 = 0x01;
/// HID boot protocol code for a mouse
pub const PROTOCOL_MOUSE: u8 = 0x02;

/// Bus type reported in [`InputId`] for USB devices (`BUS_USB`)
pub const BUS_USB: u16 = 0x03;

/// Maximum length of a display name in bytes
pub const MAX_NAME_LEN: usize = 127;
/// Maximum length of a physical path in bytes
pub const MAX_PHYS_LEN: usize = 63;

/// Location of a device on the host: (bus number, device address)
///
/// Stable for as long as the device stays plugged in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceLocation {
    pub bus: u8,
    pub address: u8,
}

impl std::fmt::Display for DeviceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:03}:{:03}", self.bus, self.address)
    }
}

/// Interface class triple (bInterfaceClass, bInterfaceSubClass, bInterfaceProtocol)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceClass {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

impl InterfaceClass {
    /// The only interface class this driver binds to
    pub const BOOT_MOUSE: InterfaceClass = InterfaceClass {
        class: CLASS_HID,
        subclass: SUBCLASS_BOOT,
        protocol: PROTOCOL_MOUSE,
    };

    pub fn is_boot_mouse(&self) -> bool {
        *self == Self::BOOT_MOUSE
    }
}

/// Endpoint transfer type (bits 0-1 of bmAttributes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Endpoint direction (bit 7 of bEndpointAddress)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

/// Endpoint descriptor fields the driver needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// bEndpointAddress, including the direction bit
    pub address: u8,
    /// bmAttributes
    pub attributes: u8,
    /// wMaxPacketSize (payload bits only)
    pub max_packet_size: u16,
    /// bInterval, in frames
    pub interval: u8,
}

impl EndpointDescriptor {
    /// Build an interrupt IN endpoint descriptor
    pub const fn interrupt_in(number: u8, max_packet_size: u16, interval: u8) -> Self {
        Self {
            address: 0x80 | (number & 0x0F),
            attributes: 0x03,
            max_packet_size,
            interval,
        }
    }

    pub const fn number(&self) -> u8 {
        self.address & 0x0F
    }

    pub const fn direction(&self) -> Direction {
        if self.address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub const fn transfer_type(&self) -> EndpointType {
        match self.attributes & 0x03 {
            0 => EndpointType::Control,
            1 => EndpointType::Isochronous,
            2 => EndpointType::Bulk,
            _ => EndpointType::Interrupt,
        }
    }

    pub fn is_control(&self) -> bool {
        self.transfer_type() == EndpointType::Control
    }

    pub fn is_interrupt_in(&self) -> bool {
        self.transfer_type() == EndpointType::Interrupt && self.direction() == Direction::In
    }
}

/// Identity strings and IDs read from the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdDevice
    pub release: u16,
    /// Topology path of the device, e.g. `usb-001-1.4`
    pub topology: String,
}

impl DeviceIdentity {
    /// Human-readable device name
    ///
    /// Manufacturer and product joined by a space when both are present,
    /// either one alone otherwise, and `USB HIDBP Mouse vvvv:pppp` when the
    /// device supplies neither. Blank strings count as missing.
    pub fn display_name(&self) -> String {
        let manufacturer = non_blank(self.manufacturer.as_deref());
        let product = non_blank(self.product.as_deref());

        let name = match (manufacturer, product) {
            (Some(m), Some(p)) => format!("{} {}", m, p),
            (Some(m), None) => m.to_string(),
            (None, Some(p)) => p.to_string(),
            (None, None) => format!(
                "USB HIDBP Mouse {:04x}:{:04x}",
                self.vendor_id, self.product_id
            ),
        };

        truncate_utf8(name, MAX_NAME_LEN)
    }

    /// Physical path the input subsystem reports for this device
    pub fn phys_path(&self) -> String {
        truncate_utf8(format!("{}/input0", self.topology), MAX_PHYS_LEN)
    }

    /// Input device ID derived from the USB descriptor
    pub fn input_id(&self) -> InputId {
        InputId {
            bustype: BUS_USB,
            vendor: self.vendor_id,
            product: self.product_id,
            version: self.release,
        }
    }
}

/// Input device ID (bus type, vendor, product, version)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputId {
    pub bustype: u16,
    pub vendor: u16,
    pub product: u16,
    pub version: u16,
}

/// Summary of an attached mouse, as listed by the driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MouseInfo {
    pub location: DeviceLocation,
    pub name: String,
    pub phys: String,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Whether the interrupt transfer loop is running
    pub opened: bool,
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

/// Truncate to at most `max` bytes without splitting a character
fn truncate_utf8(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}
