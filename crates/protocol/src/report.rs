//! HID boot-protocol mouse report decoding
//!
//! A boot mouse sends a fixed report with no report descriptor:
//!
//! | byte | meaning                                         |
//! |------|-------------------------------------------------|
//! | 0    | button bitmap (bit 0 left ... bit 4 extra)      |
//! | 1    | X displacement, two's complement                |
//! | 2    | Y displacement, two's complement                |
//! | 3    | wheel displacement, two's complement            |
//!
//! Every byte value is a valid encoding, so decoding is total.

use serde::{Deserialize, Serialize};

/// Number of report bytes the boot protocol defines for a mouse
pub const BOOT_REPORT_LEN: usize = 4;

/// Capacity of the transfer buffer and upper bound on the transfer length
pub const TRANSFER_BUFFER_LEN: usize = 8;

const BUTTON_LEFT: u8 = 0x01;
const BUTTON_RIGHT: u8 = 0x02;
const BUTTON_MIDDLE: u8 = 0x04;
const BUTTON_SIDE: u8 = 0x08;
const BUTTON_EXTRA: u8 = 0x10;

/// Button states carried in byte 0 of a boot report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MouseButtons {
    pub left: bool,
    pub right: bool,
    pub middle: bool,
    pub side: bool,
    pub extra: bool,
}

impl MouseButtons {
    /// Project the five defined bits out of the button byte
    ///
    /// Bits 5-7 are vendor specific in the boot protocol and are ignored.
    pub const fn from_byte(bits: u8) -> Self {
        Self {
            left: bits & BUTTON_LEFT != 0,
            right: bits & BUTTON_RIGHT != 0,
            middle: bits & BUTTON_MIDDLE != 0,
            side: bits & BUTTON_SIDE != 0,
            extra: bits & BUTTON_EXTRA != 0,
        }
    }

    /// Button states paired with their input codes, in report order
    pub fn iter(&self) -> impl Iterator<Item = (Button, bool)> {
        [
            (Button::Left, self.left),
            (Button::Right, self.right),
            (Button::Middle, self.middle),
            (Button::Side, self.side),
            (Button::Extra, self.extra),
        ]
        .into_iter()
    }

    /// Number of buttons currently held
    pub fn pressed_count(&self) -> usize {
        self.iter().filter(|(_, pressed)| *pressed).count()
    }
}

/// A decoded boot-protocol mouse report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedReport {
    pub buttons: MouseButtons,
    pub dx: i8,
    pub dy: i8,
    pub wheel: i8,
}

impl DecodedReport {
    /// Decode exactly one boot report
    pub const fn decode(bytes: &[u8; BOOT_REPORT_LEN]) -> Self {
        Self {
            buttons: MouseButtons::from_byte(bytes[0]),
            dx: bytes[1] as i8,
            dy: bytes[2] as i8,
            wheel: bytes[3] as i8,
        }
    }

    /// Decode the leading report bytes of a transfer buffer
    ///
    /// Returns `None` when fewer than [`BOOT_REPORT_LEN`] bytes are available.
    /// Bytes past the report are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let report: &[u8; BOOT_REPORT_LEN] = bytes.get(..BOOT_REPORT_LEN)?.try_into().ok()?;
        Some(Self::decode(report))
    }

    /// Whether the report carries any relative motion
    pub fn has_motion(&self) -> bool {
        self.dx != 0 || self.dy != 0 || self.wheel != 0
    }

    /// Expand the report into one input event frame
    ///
    /// The frame is five key events, three relative events and a closing
    /// [`InputEvent::Sync`], the same sequence an input core receives for a
    /// single boot report.
    pub fn events(&self) -> impl Iterator<Item = InputEvent> + '_ {
        let keys = self
            .buttons
            .iter()
            .map(|(button, pressed)| InputEvent::Key { button, pressed });
        let axes = [
            (RelAxis::X, self.dx),
            (RelAxis::Y, self.dy),
            (RelAxis::Wheel, self.wheel),
        ]
        .into_iter()
        .map(|(axis, value)| InputEvent::Relative {
            axis,
            value: i32::from(value),
        });

        keys.chain(axes).chain(std::iter::once(InputEvent::Sync))
    }
}

impl From<[u8; BOOT_REPORT_LEN]> for DecodedReport {
    fn from(bytes: [u8; BOOT_REPORT_LEN]) -> Self {
        Self::decode(&bytes)
    }
}

/// Mouse buttons a boot device can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Button {
    Left,
    Right,
    Middle,
    Side,
    Extra,
}

impl Button {
    /// All buttons in report bit order
    pub const ALL: [Button; 5] = [
        Button::Left,
        Button::Right,
        Button::Middle,
        Button::Side,
        Button::Extra,
    ];

    /// Linux input key code (`BTN_LEFT` .. `BTN_EXTRA`)
    pub const fn code(self) -> u16 {
        match self {
            Button::Left => 0x110,
            Button::Right => 0x111,
            Button::Middle => 0x112,
            Button::Side => 0x113,
            Button::Extra => 0x114,
        }
    }
}

/// Relative axes a boot device can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelAxis {
    X,
    Y,
    Wheel,
}

impl RelAxis {
    pub const ALL: [RelAxis; 3] = [RelAxis::X, RelAxis::Y, RelAxis::Wheel];

    /// Linux input relative axis code (`REL_X`, `REL_Y`, `REL_WHEEL`)
    pub const fn code(self) -> u16 {
        match self {
            RelAxis::X => 0x00,
            RelAxis::Y => 0x01,
            RelAxis::Wheel => 0x08,
        }
    }
}

/// One element of an input event frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputEvent {
    Key { button: Button, pressed: bool },
    Relative { axis: RelAxis, value: i32 },
    Sync,
}
