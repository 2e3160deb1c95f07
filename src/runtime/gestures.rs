use std::time::Duration;

/// Time since the session's monotonic epoch.
pub type Timestamp = Duration;

pub fn millis_f64(d: Duration) -> f64 {
    d.as_micros() as f64 / 1000.0
}

/// Number of buttons a `ButtonSet` can hold.
pub const DIM_BUTTON: u8 = 32;

/// The wheel "buttons" (4..=7 in 1-indexed host numbering). While smooth
/// scrolling is on, these are carried by the scroll axes instead.
pub const WHEEL_BUTTON_BITS: std::ops::RangeInclusive<u8> = 3..=6;


/// The class of motion the classifier last recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MoveType {
    #[default]
    None,
    Move,
    Scroll,
    Swipe3,
    Swipe4,
    Scale,
    Rotate,
    Drag,
}

impl MoveType {
    /// Only these gesture classes keep (or start) scroll coasting.
    pub fn allows_coasting(self) -> bool {
        matches!(
            self,
            MoveType::Scroll | MoveType::Swipe3 | MoveType::Swipe4 | MoveType::None
        )
    }
}


/// Fixed-size bitset of button states. Bit `i` is host button `i + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ButtonSet(u32);

impl ButtonSet {
    pub const EMPTY: ButtonSet = ButtonSet(0);

    pub fn from_bits(bits: u32) -> Self {
        ButtonSet(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn get(self, index: u8) -> bool {
        index < DIM_BUTTON && self.0 & (1 << index) != 0
    }

    pub fn set(&mut self, index: u8, pressed: bool) {
        if index >= DIM_BUTTON {
            return;
        }
        if pressed {
            self.0 |= 1 << index;
        } else {
            self.0 &= !(1 << index);
        }
    }

    /// Bits that differ from `prev`, in ascending index order, paired with
    /// their new state.
    pub fn changes_since(self, prev: ButtonSet) -> impl Iterator<Item = (u8, bool)> {
        let diff = self.0 ^ prev.0;
        (0..DIM_BUTTON)
            .filter(move |i| diff & (1 << i) != 0)
            .map(move |i| (i, self.get(i)))
    }
}


/// One touching contact, in device units re-centred on the pad's midpoint.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Contact {
    pub tracking_id: i32,
    pub x: i32,
    pub y: i32,
}

/// One decoded frame from the device: every touching contact plus the
/// physical button state at `time`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawSample {
    pub time: Timestamp,
    pub contacts: Vec<Contact>,
    pub buttons: ButtonSet,
}


/// Range of one absolute device axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AxisRange {
    pub minimum: i32,
    pub maximum: i32,
}

impl AxisRange {
    pub fn mid(self) -> i32 {
        (self.minimum + self.maximum) / 2
    }

    pub fn width(self) -> i32 {
        self.maximum - self.minimum
    }
}

/// Device calibration used to translate contacts into absolute positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Calibration {
    pub x: AxisRange,
    pub y: AxisRange,
}

impl Calibration {
    pub fn x_mid(&self) -> i32 {
        self.x.mid()
    }

    pub fn y_mid(&self) -> i32 {
        self.y.mid()
    }
}


/// Per-packet output of gesture classification. It persists across packets:
/// the classifier updates it in place and the emitter and coasting scheduler
/// consume parts of it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GestureSnapshot {
    pub move_dx: f64,
    pub move_dy: f64,
    pub move_type: MoveType,
    /// Units per millisecond.
    pub scroll_speed_x: f64,
    pub scroll_speed_y: f64,
    pub scroll_coast_tick_no: i32,
    pub buttons: ButtonSet,
    pub button_delayed_time: Timestamp,
    pub time: Timestamp,
    pub dt: Duration,
}

impl GestureSnapshot {
    pub fn stop_coasting(&mut self) {
        self.scroll_speed_x = 0.0;
        self.scroll_speed_y = 0.0;
    }
}
