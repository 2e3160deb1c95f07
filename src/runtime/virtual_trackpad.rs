// Device setup follows arcnmx's uinput example in the input-linux-rs repo:
// https://github.com/arcnmx/input-linux-rs/blob/main/examples/mouse-movements.rs

use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::fs::OpenOptionsExt,
    thread,
    time::Duration,
};
use input_linux::{
    sys, AbsoluteAxis, AbsoluteEvent, AbsoluteInfo, AbsoluteInfoSetup,
    EventKind, EventTime,
    InputEvent, InputId,
    Key, KeyEvent, KeyState,
    RelativeAxis, RelativeEvent,
    SynchronizeEvent, SynchronizeKind,
    UInputHandle
};
use nix::libc::O_NONBLOCK;
use log::{debug, error, warn};

use super::emitter::{AxisMask, EventSink, AXIS_HSCROLL, AXIS_VSCROLL};
use super::gestures::Calibration;
use crate::init::config::Configuration;


/// Map a 1-indexed host button onto a key code. Buttons 4..=7 are the wheel
/// and handled separately.
fn button_key(button: u8) -> Option<Key> {
    match button {
        1  => Some(Key::ButtonLeft),
        2  => Some(Key::ButtonMiddle),
        3  => Some(Key::ButtonRight),
        8  => Some(Key::Button0),
        9  => Some(Key::Button1),
        10 => Some(Key::Button2),
        11 => Some(Key::Button3),
        12 => Some(Key::Button4),
        13 => Some(Key::Button5),
        14 => Some(Key::Button6),
        15 => Some(Key::Button7),
        _  => None,
    }
}

/// Wheel click for buttons 4..=7: up, down, left, right.
fn wheel_click(button: u8) -> Option<(RelativeAxis, i32)> {
    match button {
        4 => Some((RelativeAxis::Wheel, 1)),
        5 => Some((RelativeAxis::Wheel, -1)),
        6 => Some((RelativeAxis::HorizontalWheel, -1)),
        7 => Some((RelativeAxis::HorizontalWheel, 1)),
        _ => None,
    }
}


/// Carries the fractional part of a relative axis over to the next event,
/// so slow motion isn't rounded away.
#[derive(Debug, Default, Clone, Copy)]
struct Remainder(f64);

impl Remainder {
    fn take_whole(&mut self, value: f64) -> i32 {
        self.0 += value;
        let whole = self.0.trunc();
        self.0 -= whole;
        whole as i32
    }
}


/// A uinput pointer device that the session posts into.
pub struct VirtualTrackpad {
    handle: UInputHandle<File>,
    scroll_dist: f64,
    absolute_capable: bool,
    rem_x: Remainder,
    rem_y: Remainder,
    rem_hscroll: Remainder,
    rem_vscroll: Remainder,
}


pub fn start_handler(calibration: &Calibration, cfg: &Configuration) -> Result<VirtualTrackpad, io::Error> {
    let uinput_file_res = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(O_NONBLOCK)
        .open("/dev/uinput");

    let uinput_file = match uinput_file_res {
        Ok(file) => file,
        Err(e) => {
            error!(
                "You are not yet allowed to write to /dev/uinput.\n\
                Some things to try:\n\
                - Update the udev rules for uinput\n\
                - Log out and log in again\n\
                - Restart your computer\n\
                - FOR ARCH: make sure the uinput kernel module is loaded on boot\n",
            );
            return Err(e);
        }
    };

    let uhandle = UInputHandle::new(uinput_file);

    uhandle.set_evbit(EventKind::Key)?;
    for button in (1..=15).filter_map(button_key) {
        uhandle.set_keybit(button)?;
    }

    uhandle.set_evbit(EventKind::Relative)?;
    uhandle.set_relbit(RelativeAxis::X)?;
    uhandle.set_relbit(RelativeAxis::Y)?;
    uhandle.set_relbit(RelativeAxis::Wheel)?;
    uhandle.set_relbit(RelativeAxis::HorizontalWheel)?;

    // Advertising absolute axes next to relative ones makes some stacks treat
    // the device as a tablet, so only do it when absolute mode is configured.
    let absolute_capable = cfg.absolute_mode;
    let mut abs_setup = Vec::new();
    if absolute_capable {
        uhandle.set_evbit(EventKind::Absolute)?;
        for (axis, range) in [(AbsoluteAxis::X, calibration.x), (AbsoluteAxis::Y, calibration.y)] {
            uhandle.set_absbit(axis)?;
            abs_setup.push(AbsoluteInfoSetup {
                axis,
                info: AbsoluteInfo {
                    value: range.mid(),
                    minimum: range.minimum,
                    maximum: range.maximum,
                    fuzz: 0,
                    flat: 0,
                    resolution: 0,
                },
            });
        }
    }

    let input_id = InputId {
        bustype: sys::BUS_USB,
        vendor: 0x1234,
        product: 0x5679,
        version: 0,
    };
    let device_name = b"Virtual touchpad (created by mtrack-coast)";
    uhandle.create(&input_id, device_name, 0, &abs_setup)?;
    debug!("Virtual touchpad successfully created.");

    // may be needed to let the system catch up
    thread::sleep(Duration::from_millis(500));

    Ok(
        VirtualTrackpad {
            handle: uhandle,
            scroll_dist: cfg.scroll_dist,
            absolute_capable,
            rem_x: Remainder::default(),
            rem_y: Remainder::default(),
            rem_hscroll: Remainder::default(),
            rem_vscroll: Remainder::default(),
        }
    )
}


impl VirtualTrackpad
{
    const ZERO: EventTime = EventTime::new(0, 0);

    fn relative(axis: RelativeAxis, value: i32) -> sys::input_event {
        InputEvent::from(RelativeEvent::new(VirtualTrackpad::ZERO, axis, value)).into_raw()
    }

    fn absolute(axis: AbsoluteAxis, value: i32) -> sys::input_event {
        InputEvent::from(AbsoluteEvent::new(VirtualTrackpad::ZERO, axis, value)).into_raw()
    }

    /// Writes `events` followed by a report, unless there is nothing to write.
    fn write_report(&self, mut events: Vec<sys::input_event>) -> Result<(), io::Error> {
        if events.is_empty() {
            return Ok(());
        }
        events.push(
            InputEvent::from(
                SynchronizeEvent::new(
                    VirtualTrackpad::ZERO,
                    SynchronizeKind::Report,
                    0)
                ).into_raw()
        );
        self.handle.write(&events)?;
        Ok(())
    }

    fn pointer_events(&mut self, dx: f64, dy: f64, events: &mut Vec<sys::input_event>) {
        let (x, y) = (self.rem_x.take_whole(dx), self.rem_y.take_whole(dy));
        if x != 0 {
            events.push(VirtualTrackpad::relative(RelativeAxis::X, x));
        }
        if y != 0 {
            events.push(VirtualTrackpad::relative(RelativeAxis::Y, y));
        }
    }

    pub fn destruct(self) -> Result<(), io::Error> {
        self.handle.dev_destroy()
    }
}


impl EventSink for VirtualTrackpad {

    fn post_absolute_motion(&mut self, x: i32, y: i32) -> io::Result<()> {
        if !self.absolute_capable {
            warn!("absolute motion posted, but the virtual device was created without absolute axes");
            return Ok(());
        }
        self.write_report(vec![
            VirtualTrackpad::absolute(AbsoluteAxis::X, x),
            VirtualTrackpad::absolute(AbsoluteAxis::Y, y),
        ])
    }

    fn post_relative_motion(&mut self, dx: f64, dy: f64) -> io::Result<()> {
        let mut events = Vec::with_capacity(3);
        self.pointer_events(dx, dy, &mut events);
        self.write_report(events)
    }

    fn post_relative_motion_masked(&mut self, mask: &AxisMask) -> io::Result<()> {
        let mut events = Vec::with_capacity(5);
        self.pointer_events(
            mask.get(0).unwrap_or_default(),
            mask.get(1).unwrap_or_default(),
            &mut events
        );

        // Scroll axis values count in scroll_dist units per notch. Positive
        // vertical values scroll down, which is a negative wheel notch.
        if let Some(h) = mask.get(AXIS_HSCROLL) {
            let notches = self.rem_hscroll.take_whole(h / self.scroll_dist);
            if notches != 0 {
                events.push(VirtualTrackpad::relative(RelativeAxis::HorizontalWheel, notches));
            }
        }
        if let Some(v) = mask.get(AXIS_VSCROLL) {
            let notches = self.rem_vscroll.take_whole(v / self.scroll_dist);
            if notches != 0 {
                events.push(VirtualTrackpad::relative(RelativeAxis::Wheel, -notches));
            }
        }

        self.write_report(events)
    }

    fn post_button(&mut self, button: u8, pressed: bool) -> io::Result<()> {
        if let Some((axis, notch)) = wheel_click(button) {
            // a wheel click is a single notch, released implicitly
            if !pressed {
                return Ok(());
            }
            return self.write_report(vec![VirtualTrackpad::relative(axis, notch)]);
        }

        match button_key(button) {
            Some(key) => self.write_report(vec![
                InputEvent::from(
                    KeyEvent::new(
                        VirtualTrackpad::ZERO,
                        key,
                        KeyState::pressed(pressed))
                    ).into_raw(),
            ]),
            None => {
                debug!("button {button} has no key mapping, dropped");
                Ok(())
            }
        }
    }
}
