use std::{
    collections::VecDeque,
    fmt,
    fs::{File, OpenOptions},
    io::{self, ErrorKind},
    os::{
        fd::{AsFd, BorrowedFd, OwnedFd},
        unix::fs::OpenOptionsExt,
    },
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use input::{
    Libinput,
    LibinputInterface,
    event::EventTrait,
    DeviceCapability::{Gesture, Pointer}
};
use input_linux::{
    sys, AbsoluteAxis, EventTime, EvdevHandle,
    InputEvent, SynchronizeEvent, SynchronizeKind,
};
use nix::{
    libc::{CLOCK_MONOTONIC, O_NONBLOCK, O_RDONLY, O_RDWR, O_WRONLY},
    time::{clock_gettime, ClockId},
};
use users::{get_current_uid, get_user_by_uid, get_user_groups};
use log::{debug, error, info, warn};

use crate::runtime::gestures::{AxisRange, ButtonSet, Calibration, Contact, RawSample, Timestamp};
use crate::runtime::session::SampleSource;


#[derive(Debug)]
pub enum DeviceError {
    Open(io::Error),
    Configure(io::Error),
    NotFound,
    PermissionDenied,
}

impl From<io::Error> for DeviceError {
    fn from(err: io::Error) -> Self {
        DeviceError::Open(err)
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::Open(e) => write!(f, "cannot open device: {e}"),
            DeviceError::Configure(e) => write!(f, "cannot configure device: {e}"),
            DeviceError::NotFound => write!(f, "touchpad not found"),
            DeviceError::PermissionDenied => write!(f, "not allowed to read /dev/input"),
        }
    }
}

impl std::error::Error for DeviceError {}


// straight from the docs for input.rs
pub struct Interface;

impl LibinputInterface for Interface {
    fn open_restricted(&mut self, path: &Path, flags: i32) -> Result<OwnedFd, i32> {
        OpenOptions::new()
            .custom_flags(flags)
            .read((flags & O_RDONLY != 0) | (flags & O_RDWR != 0))
            .write((flags & O_WRONLY != 0) | (flags & O_RDWR != 0))
            .open(path)
            .map(|file| file.into())
            .map_err(|err| err.raw_os_error().unwrap_or(nix::libc::EIO))
    }
    fn close_restricted(&mut self, fd: OwnedFd) {
        drop(File::from(fd));
    }
}


// libinput doesn't report why it found nothing, so work it out:
// zero devices seen, or a user outside the 'input' group, means
// permissions. Anything else means there really is no touchpad.
fn diagnose_missing_touchpad(devices_added: usize) -> DeviceError {

    let in_input_group = get_user_by_uid(get_current_uid())
        .and_then(|you| get_user_groups(you.name(), you.primary_group_id()))
        .is_some_and(|groups| groups.iter().any(|group| group.name() == "input"));

    if devices_added == 0 || !in_input_group {
        error!(
            "This program does not have permission to access /dev/input to read \
            touchpad events, most likely because you are not in the user group \
            'input'. If you were just added to it, log out and log in again."
        );
        return DeviceError::PermissionDenied;
    }

    error!(
        "Unable to find a touchpad on this device (devices seen: {devices_added}). \
        Set \"devicePath\" in the config file to pick one by hand."
    );
    DeviceError::NotFound
}


/// Finds the first device libinput reports with both pointer and gesture
/// capabilities, and returns its `/dev/input` node.
pub fn find_touchpad() -> Result<PathBuf, DeviceError> {

    let mut all_inputs: Libinput = Libinput::new_with_udev(Interface);
    if all_inputs.udev_assign_seat("seat0").is_err() {
        return Err(DeviceError::Open(io::Error::new(ErrorKind::Other, "cannot assign udev seat")));
    }

    // find() drops what it skips, so count as we go
    let mut dev_added_count = 0;

    let touchpad = all_inputs.find(|event| {
        dev_added_count += 1;
        event.device().has_capability(Pointer)
        && event.device().has_capability(Gesture)
        // virtual devices only have the pointer capability
    });

    match touchpad {
        Some(tp_add_ev) => {
            let device = tp_add_ev.device();
            info!("Touchpad \"{}\" found at /dev/input/{}", device.name(), device.sysname());
            Ok(PathBuf::from("/dev/input").join(device.sysname()))
        },
        None => Err(diagnose_missing_touchpad(dev_added_count)),
    }
}


const SLOT_FREE: i32 = -1;
const READ_BATCH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    tracking_id: i32,
    x: i32,
    y: i32,
}

impl Default for Slot {
    fn default() -> Self {
        Slot { tracking_id: SLOT_FREE, x: 0, y: 0 }
    }
}


/// What one event did to the frame being assembled.
#[derive(Debug, PartialEq)]
enum Assembled {
    Frame(RawSample),
    /// The kernel dropped events and the slot table was cleared. Reload it
    /// from the device, then emit a frame at the given time.
    Resync(Timestamp),
}


/// Protocol-B slot state, folded into one `RawSample` per `SYN_REPORT`.
///
/// Frames are stamped with the kernel's event time minus `clock_offset`, so
/// several frames drained by one read keep their real spacing.
#[derive(Debug)]
struct FrameAssembler {
    slots: Vec<Slot>,
    current_slot: usize,
    buttons: ButtonSet,
    centre: (i32, i32),
    clock_offset: Duration,
    dropping: bool,
}

impl FrameAssembler {

    fn new(slot_count: usize, calibration: &Calibration, clock_offset: Duration) -> Self {
        FrameAssembler {
            slots: vec![Slot::default(); slot_count.max(1)],
            current_slot: 0,
            buttons: ButtonSet::EMPTY,
            centre: (calibration.x_mid(), calibration.y_mid()),
            clock_offset,
            dropping: false,
        }
    }

    fn push(&mut self, ev: &sys::input_event) -> Option<Assembled> {
        let (kind, code, value) = (i32::from(ev.type_), i32::from(ev.code), ev.value);

        if kind == sys::EV_SYN {
            return match code {
                sys::SYN_DROPPED => {
                    warn!("Kernel input buffer overran, discarding events until the next report");
                    self.dropping = true;
                    None
                },
                sys::SYN_REPORT if self.dropping => {
                    self.dropping = false;
                    self.slots.fill(Slot::default());
                    Some(Assembled::Resync(self.session_time(ev)))
                },
                sys::SYN_REPORT => Some(Assembled::Frame(self.frame(self.session_time(ev)))),
                _ => None,
            };
        }

        if self.dropping {
            return None;
        }

        if kind == sys::EV_ABS {
            if code == sys::ABS_MT_SLOT {
                self.current_slot = usize::try_from(value).unwrap_or(0);
                return None;
            }
            let slot = self.slots.get_mut(self.current_slot)?;
            match code {
                sys::ABS_MT_TRACKING_ID => slot.tracking_id = value,
                sys::ABS_MT_POSITION_X  => slot.x = value,
                sys::ABS_MT_POSITION_Y  => slot.y = value,
                _ => {},
            }
        } else if kind == sys::EV_KEY {
            if let Some(bit) = button_bit(ev.code) {
                self.buttons.set(bit, value != 0);
            }
        }
        None
    }

    fn frame(&self, time: Timestamp) -> RawSample {
        let (x_mid, y_mid) = self.centre;
        RawSample {
            time,
            contacts: self.slots.iter()
                .filter(|s| s.tracking_id != SLOT_FREE)
                .map(|s| Contact { tracking_id: s.tracking_id, x: s.x - x_mid, y: s.y - y_mid })
                .collect(),
            buttons: self.buttons,
        }
    }

    fn session_time(&self, ev: &sys::input_event) -> Timestamp {
        let secs = u64::try_from(ev.time.tv_sec).unwrap_or(0);
        let micros = u64::try_from(ev.time.tv_usec).unwrap_or(0);
        (Duration::from_secs(secs) + Duration::from_micros(micros)).saturating_sub(self.clock_offset)
    }

    /// Overwrites the slot table with per-slot tracking ids and positions.
    fn load_slots(&mut self, ids: &[i32], xs: &[i32], ys: &[i32]) {
        for (slot, ((&tracking_id, &x), &y)) in self.slots.iter_mut().zip(ids.iter().zip(xs).zip(ys)) {
            *slot = Slot { tracking_id, x, y };
        }
    }
}


/// Reads multitouch (protocol B) events from an evdev node and hands them
/// out as one `RawSample` per `SYN_REPORT`.
pub struct EvdevSource {
    handle: EvdevHandle<File>,
    calibration: Calibration,
    assembler: FrameAssembler,
    frames: VecDeque<RawSample>,
    buf: [sys::input_event; READ_BATCH],
}


pub fn open_touchpad(path: &Path, grab: bool, epoch: Instant) -> Result<EvdevSource, DeviceError> {

    let file = OpenOptions::new()
        .read(true)
        .custom_flags(O_NONBLOCK)
        .open(path)?;

    let handle = EvdevHandle::new(file);
    if grab {
        handle.grab(true).map_err(DeviceError::Configure)?;
    }

    let calibration = read_calibration(&handle).map_err(DeviceError::Configure)?;
    let slot_count = handle.absolute_info(AbsoluteAxis::MultitouchSlot)
        .map(|info| usize::try_from(info.maximum + 1).unwrap_or(1))
        .unwrap_or(1);
    let clock_offset = session_clock_offset(&handle, epoch)?;

    debug!("{} opened: {:?}, {} slots", path.display(), calibration, slot_count);

    let blank = InputEvent::from(
        SynchronizeEvent::new(EventTime::new(0, 0), SynchronizeKind::Report, 0)
    ).into_raw();

    Ok(EvdevSource {
        handle,
        calibration,
        assembler: FrameAssembler::new(slot_count, &calibration, clock_offset),
        frames: VecDeque::new(),
        buf: [blank; READ_BATCH],
    })
}

fn read_calibration(handle: &EvdevHandle<File>) -> Result<Calibration, io::Error> {
    let x = handle.absolute_info(AbsoluteAxis::MultitouchPositionX)?;
    let y = handle.absolute_info(AbsoluteAxis::MultitouchPositionY)?;
    Ok(Calibration {
        x: AxisRange { minimum: x.minimum, maximum: x.maximum },
        y: AxisRange { minimum: y.minimum, maximum: y.maximum },
    })
}

// Event timestamps come from the clock picked here; subtracting the
// returned offset puts them on the session clock.
fn session_clock_offset(handle: &EvdevHandle<File>, epoch: Instant) -> Result<Duration, DeviceError> {
    let clock = match handle.set_clock_id(CLOCK_MONOTONIC) {
        Ok(()) => ClockId::CLOCK_MONOTONIC,
        Err(e) => {
            warn!("Could not switch event timestamps to the monotonic clock ({e}), using wall time");
            ClockId::CLOCK_REALTIME
        }
    };
    let now = clock_gettime(clock).map_err(|e| DeviceError::Configure(e.into()))?;
    Ok(Duration::from(now).saturating_sub(epoch.elapsed()))
}


/// Host button bit for a physical button code.
fn button_bit(code: u16) -> Option<u8> {
    match i32::from(code) {
        sys::BTN_LEFT   => Some(0),
        sys::BTN_MIDDLE => Some(1),
        sys::BTN_RIGHT  => Some(2),
        _ => None,
    }
}


fn resync_slots(handle: &EvdevHandle<File>, assembler: &mut FrameAssembler) {
    let n = assembler.slots.len();
    let (mut ids, mut xs, mut ys) = (vec![SLOT_FREE; n], vec![0; n], vec![0; n]);

    let queried = handle.multi_touch_slots(AbsoluteAxis::MultitouchTrackingId, &mut ids)
        .and_then(|_| handle.multi_touch_slots(AbsoluteAxis::MultitouchPositionX, &mut xs))
        .and_then(|_| handle.multi_touch_slots(AbsoluteAxis::MultitouchPositionY, &mut ys));

    match queried {
        Ok(()) => {
            debug!("slot table reloaded after overrun");
            assembler.load_slots(&ids, &xs, &ys);
        },
        Err(e) => warn!("Could not reload touch slots ({e}), treating all contacts as lifted"),
    }
}


impl EvdevSource {

    pub fn calibration(&self) -> Calibration {
        self.calibration
    }

    pub fn release(&self) -> Result<(), io::Error> {
        self.handle.grab(false)
    }
}


impl SampleSource for EvdevSource {

    fn read_next_sample(&mut self) -> Option<RawSample> {
        loop {
            if let Some(frame) = self.frames.pop_front() {
                return Some(frame);
            }

            match self.handle.read(&mut self.buf) {
                Ok(0) => return None,
                Ok(n) => {
                    for ev in &self.buf[..n] {
                        match self.assembler.push(ev) {
                            Some(Assembled::Frame(frame)) => self.frames.push_back(frame),
                            Some(Assembled::Resync(time)) => {
                                resync_slots(&self.handle, &mut self.assembler);
                                self.frames.push_back(self.assembler.frame(time));
                            },
                            None => {},
                        }
                    }
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => return None,
                Err(e) => {
                    warn!("A {} error occured in reading device buffer: {}", e.kind(), e);
                    return None;
                }
            }
        }
    }
}


impl AsFd for EvdevSource {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.handle.as_inner().as_fd()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use input_linux::{AbsoluteEvent, Key, KeyEvent, KeyState};

    #[test]
    fn physical_buttons_map_to_the_first_three_bits() {
        assert_eq!(button_bit(sys::BTN_LEFT as u16), Some(0));
        assert_eq!(button_bit(sys::BTN_MIDDLE as u16), Some(1));
        assert_eq!(button_bit(sys::BTN_RIGHT as u16), Some(2));
        assert_eq!(button_bit(sys::BTN_TOUCH as u16), None);
    }

    #[test]
    fn free_slots_are_marked() {
        assert_eq!(Slot::default().tracking_id, SLOT_FREE);
    }


    const OFFSET_S: i64 = 1_000;

    fn at(ms: i64) -> EventTime {
        EventTime::new(OFFSET_S + ms / 1000, (ms % 1000) * 1000)
    }

    fn abs(ms: i64, axis: AbsoluteAxis, value: i32) -> sys::input_event {
        InputEvent::from(AbsoluteEvent::new(at(ms), axis, value)).into_raw()
    }

    fn key(ms: i64, key: Key, pressed: bool) -> sys::input_event {
        InputEvent::from(KeyEvent::new(at(ms), key, KeyState::pressed(pressed))).into_raw()
    }

    fn syn(ms: i64, kind: SynchronizeKind) -> sys::input_event {
        InputEvent::from(SynchronizeEvent::new(at(ms), kind, 0)).into_raw()
    }

    fn assembler() -> FrameAssembler {
        let cal = Calibration {
            x: AxisRange { minimum: 0, maximum: 1000 },
            y: AxisRange { minimum: 0, maximum: 600 },
        };
        FrameAssembler::new(2, &cal, Duration::from_secs(OFFSET_S as u64))
    }

    fn frames(asm: &mut FrameAssembler, events: &[sys::input_event]) -> Vec<RawSample> {
        events.iter()
            .filter_map(|ev| match asm.push(ev) {
                Some(Assembled::Frame(frame)) => Some(frame),
                _ => None,
            })
            .collect()
    }

    fn ids_and_positions(frame: &RawSample) -> Vec<(i32, i32, i32)> {
        frame.contacts.iter().map(|c| (c.tracking_id, c.x, c.y)).collect()
    }

    #[test]
    fn slots_fold_into_one_centred_frame_per_report() {
        use AbsoluteAxis::*;
        let mut asm = assembler();

        let out = frames(&mut asm, &[
            abs(8, MultitouchSlot, 0),
            abs(8, MultitouchTrackingId, 10),
            abs(8, MultitouchPositionX, 600),
            abs(8, MultitouchPositionY, 300),
            abs(8, MultitouchSlot, 1),
            abs(8, MultitouchTrackingId, 11),
            abs(8, MultitouchPositionX, 400),
            abs(8, MultitouchPositionY, 200),
            syn(8, SynchronizeKind::Report),
            // slot 1 is still selected, switch back explicitly
            abs(16, MultitouchSlot, 0),
            abs(16, MultitouchPositionX, 610),
            syn(16, SynchronizeKind::Report),
            abs(24, MultitouchSlot, 1),
            abs(24, MultitouchTrackingId, -1),
            syn(24, SynchronizeKind::Report),
        ]);

        assert_eq!(out.len(), 3);
        assert_eq!(ids_and_positions(&out[0]), vec![(10, 100, 0), (11, -100, -100)]);
        assert_eq!(ids_and_positions(&out[1]), vec![(10, 110, 0), (11, -100, -100)]);
        assert_eq!(ids_and_positions(&out[2]), vec![(10, 110, 0)]);
    }

    #[test]
    fn frames_read_together_keep_kernel_spacing() {
        use AbsoluteAxis::*;
        let mut asm = assembler();

        // all of it drained by a single read
        let out = frames(&mut asm, &[
            abs(10, MultitouchTrackingId, 1),
            syn(10, SynchronizeKind::Report),
            abs(18, MultitouchPositionY, 20),
            syn(18, SynchronizeKind::Report),
            abs(1_026, MultitouchPositionY, 40),
            syn(1_026, SynchronizeKind::Report),
        ]);

        let times: Vec<Duration> = out.iter().map(|f| f.time).collect();
        assert_eq!(times, vec![
            Duration::from_millis(10),
            Duration::from_millis(18),
            Duration::from_millis(1_026),
        ]);
    }

    #[test]
    fn physical_buttons_ride_along_with_the_frame() {
        let mut asm = assembler();
        let out = frames(&mut asm, &[
            key(5, Key::ButtonLeft, true),
            key(5, Key::ButtonRight, true),
            syn(5, SynchronizeKind::Report),
            key(9, Key::ButtonLeft, false),
            syn(9, SynchronizeKind::Report),
        ]);
        assert_eq!(out[0].buttons, ButtonSet::from_bits(0b101));
        assert_eq!(out[1].buttons, ButtonSet::from_bits(0b100));
        assert!(out[0].contacts.is_empty());
    }

    #[test]
    fn overrun_discards_until_report_and_clears_slots() {
        use AbsoluteAxis::*;
        let mut asm = assembler();
        frames(&mut asm, &[
            abs(0, MultitouchTrackingId, 7),
            syn(0, SynchronizeKind::Report),
        ]);

        assert_eq!(asm.push(&syn(4, SynchronizeKind::Dropped)), None);
        // whatever arrives before the next report is unreliable
        assert_eq!(asm.push(&abs(6, MultitouchPositionX, 900)), None);
        assert_eq!(asm.push(&syn(6, SynchronizeKind::Report)), Some(Assembled::Resync(Duration::from_millis(6))));
        assert!(asm.frame(Duration::from_millis(6)).contacts.is_empty());

        // reloaded from the device: slot 1 still down
        asm.load_slots(&[SLOT_FREE, 12], &[0, 700], &[0, 300]);
        assert_eq!(ids_and_positions(&asm.frame(Duration::from_millis(6))), vec![(12, 200, 0)]);

        let out = frames(&mut asm, &[abs(10, MultitouchSlot, 1), abs(10, MultitouchPositionX, 710), syn(10, SynchronizeKind::Report)]);
        assert_eq!(ids_and_positions(&out[0]), vec![(12, 210, 0)]);
    }
}
