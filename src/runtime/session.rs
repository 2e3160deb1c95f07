use log::{debug, info, trace};

use super::classifier::GestureClassifier;
use super::emitter::{self, AddressingMode, BadMode, EventSink};
use super::gestures::{ButtonSet, Calibration, GestureSnapshot, RawSample, Timestamp};
use super::scheduler::TimerState;
use crate::init::config::Configuration;


/// Anything that hands out decoded device frames until its buffer is empty.
pub trait SampleSource {
    fn read_next_sample(&mut self) -> Option<RawSample>;
}


/// State for one touch device, from the moment it is brought up until it
/// is closed. Everything runs on the caller's thread: the host calls the
/// `on_*` entry points and sleeps until [`Session::next_deadline`] in
/// between.
pub struct Session<C, S> {
    pub(crate) cfg: Configuration,
    pub(crate) calibration: Calibration,
    pub(crate) classifier: C,
    pub(crate) sink: S,
    pub(crate) gs: GestureSnapshot,
    /// Latest decoded frame, for absolute positioning.
    pub(crate) touch: RawSample,
    pub(crate) buttons_prev: ButtonSet,
    pub(crate) mode: AddressingMode,
    pub(crate) timer: TimerState,
    online: bool,
}

impl<C: GestureClassifier, S: EventSink> Session<C, S> {

    pub fn new(cfg: Configuration, calibration: Calibration, classifier: C, sink: S) -> Self {
        let mode = if cfg.absolute_mode {
            AddressingMode::Absolute
        } else {
            AddressingMode::Relative
        };

        Session {
            cfg,
            calibration,
            classifier,
            sink,
            gs: GestureSnapshot::default(),
            touch: RawSample::default(),
            buttons_prev: ButtonSet::EMPTY,
            mode,
            timer: TimerState::Idle,
            online: false,
        }
    }


    /* Lifecycle */

    pub fn on_device_on(&mut self) {
        debug!("device on");
        self.release_timer();
        self.online = true;
    }

    pub fn on_device_off(&mut self) {
        debug!("device off");
        self.release_timer();
        self.buttons_prev = ButtonSet::EMPTY;
        self.online = false;
    }

    /// Tears down whatever is still pending without resolving it.
    pub fn on_device_close(&mut self) {
        debug!("device close");
        self.on_device_off();
    }

    fn release_timer(&mut self) {
        if self.timer != TimerState::Idle {
            debug!("releasing pending timer {:?}", self.timer);
        }
        self.timer = TimerState::Idle;
        self.gs.scroll_coast_tick_no = 0;
        self.gs.stop_coasting();
    }


    /// Takes effect with the next snapshot emitted.
    pub fn set_addressing_mode(&mut self, mode: AddressingMode) {
        match mode {
            AddressingMode::Absolute => info!("switching to absolute mode"),
            AddressingMode::Relative => info!("switching to relative mode"),
        }
        self.mode = mode;
    }

    /// Same as [`Session::set_addressing_mode`], for hosts that speak in
    /// mode numbers.
    pub fn switch_mode(&mut self, raw_mode: i32) -> Result<(), BadMode> {
        let mode = AddressingMode::try_from(raw_mode)?;
        self.set_addressing_mode(mode);
        Ok(())
    }


    /// Drains every buffered sample, emitting each right away, then gives
    /// deferred decisions one chance to resolve with the whole batch seen.
    pub fn on_device_ready<R: SampleSource>(&mut self, source: &mut R, now: Timestamp) {

        if !self.online {
            let dropped = std::iter::from_fn(|| source.read_next_sample()).count();
            trace!("device offline, dropped {dropped} samples");
            return;
        }

        while let Some(sample) = source.read_next_sample() {
            self.classifier.classify(&sample, &mut self.gs);
            self.touch = sample;
            self.emit();
        }

        self.check_resolve_delayed(now);
    }


    pub(crate) fn emit(&mut self) {
        emitter::handle_gestures(
            &mut self.sink,
            &mut self.gs,
            &mut self.buttons_prev,
            &self.touch,
            self.mode,
            &self.calibration,
            &self.cfg
        );
    }


    /* Accessors */

    /// When the host should call [`Session::on_timer_fire`] next, if at all.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.timer.deadline()
    }

    pub fn timer(&self) -> TimerState {
        self.timer
    }

    pub fn mode(&self) -> AddressingMode {
        self.mode
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn gesture(&self) -> &GestureSnapshot {
        &self.gs
    }

    pub fn gesture_mut(&mut self) -> &mut GestureSnapshot {
        &mut self.gs
    }

    pub fn buttons_prev(&self) -> ButtonSet {
        self.buttons_prev
    }

    pub fn classifier(&self) -> &C {
        &self.classifier
    }

    pub fn classifier_mut(&mut self) -> &mut C {
        &mut self.classifier
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::emitter::recording::{Posted, RecordingSink};
    use crate::runtime::gestures::{AxisRange, Contact, MoveType};
    use crate::runtime::scheduler::Resolution;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Moves the pointer by the first contact's coordinates, presses button
    /// 1 when asked to, never defers anything.
    #[derive(Default)]
    struct PassThrough {
        classified: usize,
    }

    impl GestureClassifier for PassThrough {
        fn classify(&mut self, sample: &RawSample, gs: &mut GestureSnapshot) {
            self.classified += 1;
            if let Some(c) = sample.contacts.first() {
                gs.move_dx += f64::from(c.x);
                gs.move_dy += f64::from(c.y);
                gs.move_type = MoveType::Move;
            }
            gs.buttons = sample.buttons;
            gs.time = sample.time;
        }

        fn resolve(&mut self, _gs: &mut GestureSnapshot, _now: Timestamp) -> Resolution {
            Resolution::TooEarly
        }
    }

    struct Batch(VecDeque<RawSample>);

    impl SampleSource for Batch {
        fn read_next_sample(&mut self) -> Option<RawSample> {
            self.0.pop_front()
        }
    }

    fn sample(x: i32, y: i32, buttons: u32) -> RawSample {
        RawSample {
            time: Duration::ZERO,
            contacts: vec![Contact { tracking_id: 1, x, y }],
            buttons: ButtonSet::from_bits(buttons),
        }
    }

    fn session() -> Session<PassThrough, RecordingSink> {
        let cfg = Configuration { scroll_smooth: false, ..Configuration::default() };
        let cal = Calibration {
            x: AxisRange { minimum: 0, maximum: 200 },
            y: AxisRange { minimum: 0, maximum: 100 },
        };
        let mut s = Session::new(cfg, cal, PassThrough::default(), RecordingSink::default());
        s.on_device_on();
        s
    }

    #[test]
    fn every_buffered_sample_is_emitted_in_order() {
        let mut s = session();
        let mut batch = Batch(vec![sample(1, 2, 0), sample(3, 4, 1)].into());
        s.on_device_ready(&mut batch, Duration::ZERO);

        assert_eq!(s.sink().posted, vec![
            Posted::Relative(1.0, 2.0),
            Posted::Relative(3.0, 4.0),
            Posted::Button(1, true),
        ]);
        assert_eq!(s.classifier().classified, 2);
    }

    #[test]
    fn mode_switch_applies_to_the_next_snapshot() {
        let mut s = session();
        s.on_device_ready(&mut Batch(vec![sample(5, 5, 0)].into()), Duration::ZERO);

        s.set_addressing_mode(AddressingMode::Absolute);
        s.on_device_ready(&mut Batch(vec![sample(5, 5, 0)].into()), Duration::ZERO);

        assert_eq!(s.sink().posted, vec![
            Posted::Relative(5.0, 5.0),
            Posted::Absolute(105, 55),
        ]);
        assert_eq!((s.gesture().move_dx, s.gesture().move_dy), (0.0, 0.0));

        s.sink_mut().posted.clear();
        assert!(s.switch_mode(0).is_ok());
        assert_eq!(s.mode(), AddressingMode::Relative);
        assert_eq!(s.switch_mode(3), Err(BadMode(3)));
        assert_eq!(s.mode(), AddressingMode::Relative);
    }

    #[test]
    fn offline_sessions_drop_samples() {
        let mut s = session();
        s.on_device_off();
        let mut batch = Batch(vec![sample(1, 1, 1)].into());
        s.on_device_ready(&mut batch, Duration::ZERO);
        assert!(batch.0.is_empty());
        assert!(s.sink().posted.is_empty());
        assert!(!s.is_online());
    }

    #[test]
    fn turning_off_releases_the_timer_and_coasting() {
        let mut s = session();
        s.timer = TimerState::Coasting { deadline: Duration::from_millis(50) };
        s.gesture_mut().scroll_coast_tick_no = 3;
        s.gesture_mut().scroll_speed_x = 1.0;
        s.buttons_prev = ButtonSet::from_bits(1);

        s.on_device_close();

        assert_eq!(s.timer(), TimerState::Idle);
        assert_eq!(s.next_deadline(), None);
        assert_eq!(s.gesture().scroll_coast_tick_no, 0);
        assert_eq!(s.gesture().scroll_speed_x, 0.0);
        assert_eq!(s.buttons_prev(), ButtonSet::EMPTY);

        // nothing left for a late timer to do
        s.on_timer_fire(Duration::from_millis(50));
        assert!(s.sink().posted.is_empty());
    }
}
