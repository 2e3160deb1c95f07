use std::fmt;
use std::io;
use log::{trace, warn};

use super::coasting;
use super::gestures::{millis_f64, ButtonSet, Calibration, GestureSnapshot, RawSample, WHEEL_BUTTON_BITS};
use crate::init::config::{Configuration, ScrollCoast};

/// Valuator slots of a masked relative motion event:
/// pointer x, pointer y, horizontal scroll, vertical scroll.
pub const NUM_AXES: usize = 4;
pub const AXIS_HSCROLL: usize = 2;
pub const AXIS_VSCROLL: usize = 3;


/// Where outbound events end up. Posting is fire-and-forget; callers log
/// failures and move on.
pub trait EventSink {
    fn post_absolute_motion(&mut self, x: i32, y: i32) -> io::Result<()>;
    fn post_relative_motion(&mut self, dx: f64, dy: f64) -> io::Result<()>;
    fn post_relative_motion_masked(&mut self, mask: &AxisMask) -> io::Result<()>;
    /// `button` is 1-indexed.
    fn post_button(&mut self, button: u8, pressed: bool) -> io::Result<()>;
}


/// A relative motion event where only some of the four axes carry a value.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AxisMask([Option<f64>; NUM_AXES]);

impl AxisMask {
    pub fn set(&mut self, axis: usize, value: f64) {
        self.0[axis] = Some(value);
    }

    pub fn get(&self, axis: usize) -> Option<f64> {
        self.0[axis]
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(Option::is_none)
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressingMode {
    #[default]
    Relative,
    Absolute,
}

/// Raised when the host asks for a mode number that isn't relative (0)
/// or absolute (1).
#[derive(Debug, PartialEq, Eq)]
pub struct BadMode(pub i32);

impl fmt::Display for BadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported addressing mode {}", self.0)
    }
}

impl std::error::Error for BadMode {}

impl TryFrom<i32> for AddressingMode {
    type Error = BadMode;

    fn try_from(mode: i32) -> Result<Self, Self::Error> {
        match mode {
            0 => Ok(AddressingMode::Relative),
            1 => Ok(AddressingMode::Absolute),
            other => Err(BadMode(other)),
        }
    }
}


fn log_post_failure(result: io::Result<()>, what: &str) {
    if let Err(e) = result {
        warn!("Failed to post {what}: {}, {}", e.kind(), e);
    }
}


/// Posts pointer deltas and the scroll axes in one masked event, then
/// consumes the deltas. `delta_t_ms` scales the scroll speeds.
pub(crate) fn set_and_post_mask<S: EventSink>(
    sink: &mut S,
    gs: &mut GestureSnapshot,
    coast: &ScrollCoast,
    delta_t_ms: f64,
) {
    let mut mask = AxisMask::default();

    if gs.move_dx != 0.0 {
        mask.set(0, gs.move_dx);
    }
    if gs.move_dy != 0.0 {
        mask.set(1, gs.move_dy);
    }

    // a zero contribution (no time elapsed) isn't worth an event
    let (scroll_x, scroll_y) = coasting::scroll_axes(gs, coast, delta_t_ms);
    if let Some(dx) = scroll_x.filter(|d| *d != 0.0) {
        mask.set(AXIS_HSCROLL, dx);
    }
    if let Some(dy) = scroll_y.filter(|d| *d != 0.0) {
        mask.set(AXIS_VSCROLL, dy);
    }

    if !mask.is_empty() {
        trace!("Posting masked motion {:?}", mask);
        log_post_failure(sink.post_relative_motion_masked(&mask), "masked motion");
    }

    // once posted, the deltas are spent
    gs.move_dx = 0.0;
    gs.move_dy = 0.0;
}


/// Turns the snapshot into outbound events: motion according to the
/// addressing mode, then one event per button edge against `buttons_prev`.
pub fn handle_gestures<S: EventSink>(
    sink: &mut S,
    gs: &mut GestureSnapshot,
    buttons_prev: &mut ButtonSet,
    latest: &RawSample,
    mode: AddressingMode,
    calibration: &Calibration,
    cfg: &Configuration,
) {
    match mode {
        AddressingMode::Relative if cfg.scroll_smooth => {
            // wheel buttons are carried by the scroll axes, keep them as they were
            for bit in WHEEL_BUTTON_BITS {
                gs.buttons.set(bit, buttons_prev.get(bit));
            }
            let delta_t_ms = millis_f64(gs.dt);
            set_and_post_mask(sink, gs, &cfg.scroll_coast, delta_t_ms);
        }
        AddressingMode::Relative => {
            if gs.move_dx != 0.0 || gs.move_dy != 0.0 {
                log_post_failure(
                    sink.post_relative_motion(gs.move_dx, gs.move_dy),
                    "relative motion"
                );
            }
        }
        AddressingMode::Absolute => {
            // Raw device coordinates, unscaled. Fine as long as the panel
            // matches the display resolution.
            if let Some(first) = latest.contacts.first() {
                log_post_failure(
                    sink.post_absolute_motion(
                        first.x + calibration.x_mid(),
                        first.y + calibration.y_mid()
                    ),
                    "absolute motion"
                );
            }
        }
    }

    gs.move_dx = 0.0;
    gs.move_dy = 0.0;

    for (index, pressed) in gs.buttons.changes_since(*buttons_prev) {
        trace!("button {} {}", index + 1, if pressed { "down" } else { "up" });
        log_post_failure(sink.post_button(index + 1, pressed), "button");
    }
    *buttons_prev = gs.buttons;
}


/// Sink that records everything posted to it. Used by the unit tests here
/// and in the scheduler.
#[cfg(test)]
pub(crate) mod recording {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Posted {
        Absolute(i32, i32),
        Relative(f64, f64),
        Masked(AxisMask),
        Button(u8, bool),
    }

    #[derive(Debug, Default)]
    pub struct RecordingSink {
        pub posted: Vec<Posted>,
        pub fail: bool,
    }

    impl RecordingSink {
        fn record(&mut self, ev: Posted) -> io::Result<()> {
            self.posted.push(ev);
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"));
            }
            Ok(())
        }

        pub fn masks(&self) -> Vec<AxisMask> {
            self.posted.iter()
                .filter_map(|p| match p {
                    Posted::Masked(m) => Some(*m),
                    _ => None,
                })
                .collect()
        }
    }

    impl EventSink for RecordingSink {
        fn post_absolute_motion(&mut self, x: i32, y: i32) -> io::Result<()> {
            self.record(Posted::Absolute(x, y))
        }
        fn post_relative_motion(&mut self, dx: f64, dy: f64) -> io::Result<()> {
            self.record(Posted::Relative(dx, dy))
        }
        fn post_relative_motion_masked(&mut self, mask: &AxisMask) -> io::Result<()> {
            self.record(Posted::Masked(*mask))
        }
        fn post_button(&mut self, button: u8, pressed: bool) -> io::Result<()> {
            self.record(Posted::Button(button, pressed))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::recording::{Posted, RecordingSink};
    use crate::runtime::gestures::{AxisRange, Contact, MoveType};
    use std::time::Duration;

    fn cfg(smooth: bool) -> Configuration {
        Configuration { scroll_smooth: smooth, ..Configuration::default() }
    }

    fn snapshot(dx: f64, dy: f64) -> GestureSnapshot {
        GestureSnapshot { move_dx: dx, move_dy: dy, move_type: MoveType::Move, ..Default::default() }
    }

    fn emit(
        sink: &mut RecordingSink,
        gs: &mut GestureSnapshot,
        prev: &mut ButtonSet,
        latest: &RawSample,
        mode: AddressingMode,
        cfg: &Configuration,
    ) {
        let cal = Calibration {
            x: AxisRange { minimum: 0, maximum: 1000 },
            y: AxisRange { minimum: 0, maximum: 600 },
        };
        handle_gestures(sink, gs, prev, latest, mode, &cal, cfg);
    }

    #[test]
    fn deltas_are_consumed_in_every_mode() {
        let latest = RawSample {
            contacts: vec![Contact { tracking_id: 1, x: 10, y: -20 }],
            ..Default::default()
        };
        for (mode, smooth) in [
            (AddressingMode::Relative, true),
            (AddressingMode::Relative, false),
            (AddressingMode::Absolute, true),
        ] {
            let mut sink = RecordingSink::default();
            let mut prev = ButtonSet::EMPTY;
            let mut gs = snapshot(3.0, -4.0);
            emit(&mut sink, &mut gs, &mut prev, &latest, mode, &cfg(smooth));
            assert_eq!((gs.move_dx, gs.move_dy), (0.0, 0.0), "mode {mode:?}, smooth {smooth}");
        }
    }

    #[test]
    fn plain_relative_motion_without_smooth_scroll() {
        let mut sink = RecordingSink::default();
        let mut prev = ButtonSet::EMPTY;
        let mut gs = snapshot(3.0, -4.0);
        emit(&mut sink, &mut gs, &mut prev, &RawSample::default(), AddressingMode::Relative, &cfg(false));
        assert_eq!(sink.posted, vec![Posted::Relative(3.0, -4.0)]);

        // nothing to move, nothing posted
        emit(&mut sink, &mut gs, &mut prev, &RawSample::default(), AddressingMode::Relative, &cfg(false));
        assert_eq!(sink.posted.len(), 1);
    }

    #[test]
    fn smooth_scroll_combines_pointer_and_scroll_axes() {
        let mut sink = RecordingSink::default();
        let mut prev = ButtonSet::EMPTY;
        let mut gs = GestureSnapshot {
            move_dx: 1.5,
            move_type: MoveType::Scroll,
            scroll_speed_y: 0.5,
            scroll_coast_tick_no: 1,
            dt: Duration::from_millis(10),
            ..Default::default()
        };
        emit(&mut sink, &mut gs, &mut prev, &RawSample::default(), AddressingMode::Relative, &cfg(true));

        let masks = sink.masks();
        assert_eq!(masks.len(), 1);
        assert_eq!(masks[0].get(0), Some(1.5));
        assert_eq!(masks[0].get(1), None);
        assert_eq!(masks[0].get(AXIS_HSCROLL), None);
        assert_eq!(masks[0].get(AXIS_VSCROLL), Some(5.0));
    }

    #[test]
    fn absolute_mode_posts_first_contact_offset_by_midpoint() {
        let mut sink = RecordingSink::default();
        let mut prev = ButtonSet::EMPTY;
        let mut gs = snapshot(7.0, 7.0);
        let latest = RawSample {
            contacts: vec![
                Contact { tracking_id: 4, x: -100, y: 50 },
                Contact { tracking_id: 5, x: 300, y: 300 },
            ],
            ..Default::default()
        };
        emit(&mut sink, &mut gs, &mut prev, &latest, AddressingMode::Absolute, &cfg(true));
        assert_eq!(sink.posted, vec![Posted::Absolute(400, 350)]);
    }

    #[test]
    fn each_changed_bit_posts_exactly_one_edge() {
        let mut sink = RecordingSink::default();
        let mut prev = ButtonSet::EMPTY;
        let mut gs = GestureSnapshot { buttons: ButtonSet::from_bits(0b101), ..Default::default() };
        emit(&mut sink, &mut gs, &mut prev, &RawSample::default(), AddressingMode::Relative, &cfg(false));
        assert_eq!(sink.posted, vec![Posted::Button(1, true), Posted::Button(3, true)]);
        assert_eq!(prev, ButtonSet::from_bits(0b101));

        sink.posted.clear();
        gs.buttons = ButtonSet::from_bits(0b110);
        emit(&mut sink, &mut gs, &mut prev, &RawSample::default(), AddressingMode::Relative, &cfg(false));
        assert_eq!(sink.posted, vec![Posted::Button(1, false), Posted::Button(2, true)]);

        // unchanged bits post nothing
        sink.posted.clear();
        emit(&mut sink, &mut gs, &mut prev, &RawSample::default(), AddressingMode::Relative, &cfg(false));
        assert!(sink.posted.is_empty());
    }

    #[test]
    fn wheel_buttons_are_held_while_smooth_scrolling() {
        let mut sink = RecordingSink::default();
        let mut prev = ButtonSet::EMPTY;
        let mut gs = GestureSnapshot { buttons: ButtonSet::from_bits(1 << 3 | 1), ..Default::default() };
        emit(&mut sink, &mut gs, &mut prev, &RawSample::default(), AddressingMode::Relative, &cfg(true));
        assert_eq!(sink.posted, vec![Posted::Button(1, true)]);
        assert_eq!(prev, ButtonSet::from_bits(1));
    }

    #[test]
    fn failed_posts_are_not_retried() {
        let mut sink = RecordingSink { fail: true, ..Default::default() };
        let mut prev = ButtonSet::EMPTY;
        let mut gs = GestureSnapshot { move_dx: 1.0, buttons: ButtonSet::from_bits(1), ..Default::default() };
        emit(&mut sink, &mut gs, &mut prev, &RawSample::default(), AddressingMode::Relative, &cfg(false));
        assert_eq!(sink.posted, vec![Posted::Relative(1.0, 0.0), Posted::Button(1, true)]);
        assert_eq!(prev, ButtonSet::from_bits(1));
    }

    #[test]
    fn host_mode_numbers() {
        assert_eq!(AddressingMode::try_from(0), Ok(AddressingMode::Relative));
        assert_eq!(AddressingMode::try_from(1), Ok(AddressingMode::Absolute));
        assert_eq!(AddressingMode::try_from(7), Err(BadMode(7)));
    }
}
