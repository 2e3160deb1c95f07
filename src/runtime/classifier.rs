use std::time::Duration;
use log::{debug, trace};

use super::gestures::{
    millis_f64, Calibration, Contact, GestureSnapshot, MoveType, RawSample, Timestamp,
};
use super::scheduler::Resolution;
use crate::init::config::Configuration;


/// Turns decoded frames into gesture state, and decides when deferred
/// button transitions are final.
pub trait GestureClassifier {
    /// Folds one frame into `gs`. Accumulates pointer deltas rather than
    /// overwriting them.
    fn classify(&mut self, sample: &RawSample, gs: &mut GestureSnapshot);

    /// Whether a deferred decision can be made at `now`. May update `gs`
    /// with the decided state.
    fn resolve(&mut self, gs: &mut GestureSnapshot, now: Timestamp) -> Resolution;
}


/// Shortest frame interval a scroll speed is measured over.
const MIN_SPEED_DT: Duration = Duration::from_millis(1);


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TapState {
    Idle,
    /// Button 1 went down for a tap; it comes back up at `deadline` unless
    /// another touch starts first.
    ReleasePending { deadline: Timestamp },
    /// Touched again inside the release window: a tap-and-hold drag.
    Held,
}


/// Small built-in classifier: one finger points, two fingers scroll, three
/// and four fingers swipe, and a short one-finger touch taps button 1.
///
/// Scroll and swipe speeds are in device units per millisecond. While the
/// fingers are down the coasting budget is 1, so the scroll axes carry the
/// actual distance moved; on lift the full budget from the config is handed
/// over and the end of the gesture is reported as `ResolvedCoast`.
#[derive(Debug)]
pub struct TapClassifier {
    tap_timeout: Duration,
    tap_hold: Duration,
    /// How far, in device units, a touch may travel and still be a tap.
    tap_travel: f64,
    num_of_ticks: i32,

    prev: Option<RawSample>,
    touch_start: Option<(Timestamp, Contact)>,
    max_fingers: usize,
    travelled: f64,
    tap: TapState,
    coast_on_lift: bool,
}

impl TapClassifier {
    pub fn new(cfg: &Configuration, calibration: &Calibration) -> Self {
        TapClassifier {
            tap_timeout: cfg.tap_timeout,
            tap_hold: cfg.tap_hold,
            tap_travel: cfg.tap_threshold * f64::from(calibration.x.width()),
            num_of_ticks: cfg.scroll_coast.num_of_ticks,
            prev: None,
            touch_start: None,
            max_fingers: 0,
            travelled: 0.0,
            tap: TapState::Idle,
            coast_on_lift: false,
        }
    }

    fn tap_button_held(&self) -> bool {
        !matches!(self.tap, TapState::Idle)
    }


    fn touch_began(&mut self, sample: &RawSample, gs: &mut GestureSnapshot) {
        self.touch_start = sample.contacts.first().map(|c| (sample.time, *c));
        self.max_fingers = sample.contacts.len();
        self.travelled = 0.0;
        self.coast_on_lift = false;

        // a new touch stops any coasting still in flight
        gs.stop_coasting();
        gs.scroll_coast_tick_no = 0;
        gs.move_type = MoveType::None;

        if let TapState::ReleasePending { .. } = self.tap {
            if sample.contacts.len() == 1 {
                debug!("touched again inside the tap window, holding");
                self.tap = TapState::Held;
            } else {
                // scrolls and swipes don't drag; finish the tap now
                debug!("multi-finger touch inside the tap window, releasing");
                self.tap = TapState::Idle;
            }
        }
    }


    fn touch_moved(&mut self, prev: &RawSample, sample: &RawSample, gs: &mut GestureSnapshot) {
        let fingers = sample.contacts.len();

        // a multi-finger gesture losing fingers keeps its class and speed
        // until the last one lifts
        if self.max_fingers > 1 && fingers < self.max_fingers {
            gs.dt = Duration::ZERO;
            return;
        }
        self.max_fingers = self.max_fingers.max(fingers);

        if let (Some((_, start)), Some(first)) = (self.touch_start, sample.contacts.first()) {
            let dist = f64::from(first.x - start.x).hypot(f64::from(first.y - start.y));
            self.travelled = self.travelled.max(dist);
        }

        // average displacement of the contacts present in both frames
        let (mut dx, mut dy, mut matched) = (0.0, 0.0, 0_i32);
        for c in &sample.contacts {
            if let Some(p) = prev.contacts.iter().find(|p| p.tracking_id == c.tracking_id) {
                dx += f64::from(c.x - p.x);
                dy += f64::from(c.y - p.y);
                matched += 1;
            }
        }
        if matched == 0 {
            return;
        }
        dx /= f64::from(matched);
        dy /= f64::from(matched);

        match fingers {
            1 => {
                gs.move_dx += dx;
                gs.move_dy += dy;
                gs.move_type = if self.tap == TapState::Held { MoveType::Drag } else { MoveType::Move };
            },
            2..=4 => {
                gs.move_type = match fingers {
                    2 => MoveType::Scroll,
                    3 => MoveType::Swipe3,
                    _ => MoveType::Swipe4,
                };
                // frames closer together than this say nothing about speed
                if gs.dt >= MIN_SPEED_DT {
                    let dt_ms = millis_f64(gs.dt);
                    gs.scroll_speed_x = dx / dt_ms;
                    gs.scroll_speed_y = dy / dt_ms;
                }
                gs.scroll_coast_tick_no = 1;
            },
            _ => {
                gs.move_type = MoveType::None;
                gs.stop_coasting();
            },
        }
    }


    fn touch_ended(&mut self, sample: &RawSample, gs: &mut GestureSnapshot) {

        let coasting_gesture = matches!(
            gs.move_type,
            MoveType::Scroll | MoveType::Swipe3 | MoveType::Swipe4
        );
        if coasting_gesture && (gs.scroll_speed_x != 0.0 || gs.scroll_speed_y != 0.0) {
            trace!("{:?} ended, coasting for {} ticks", gs.move_type, self.num_of_ticks);
            gs.scroll_coast_tick_no = self.num_of_ticks;
            gs.dt = Duration::ZERO;
            self.coast_on_lift = true;
        } else {
            gs.stop_coasting();
            gs.scroll_coast_tick_no = 0;
        }

        let duration = self.touch_start
            .map(|(t, _)| sample.time.saturating_sub(t))
            .unwrap_or_default();

        match self.tap {
            TapState::Held => {
                debug!("tap-and-hold released");
                self.tap = TapState::Idle;
            },
            TapState::Idle if self.max_fingers == 1
                && duration <= self.tap_timeout
                && self.travelled <= self.tap_travel => {

                let deadline = sample.time + self.tap_hold;
                debug!("tap, button 1 released at {:?}", deadline);
                self.tap = TapState::ReleasePending { deadline };
                gs.button_delayed_time = deadline;
            },
            _ => {},
        }

        self.touch_start = None;
        self.max_fingers = 0;
    }
}


impl GestureClassifier for TapClassifier {

    fn classify(&mut self, sample: &RawSample, gs: &mut GestureSnapshot) {

        gs.dt = match self.prev {
            Some(_) => sample.time.saturating_sub(gs.time),
            None => Duration::ZERO,
        };
        gs.time = sample.time;

        let prev = self.prev.take().unwrap_or_default();
        let (was_touching, touching) = (!prev.contacts.is_empty(), !sample.contacts.is_empty());

        match (was_touching, touching) {
            (false, true) => self.touch_began(sample, gs),
            (true, true) => self.touch_moved(&prev, sample, gs),
            (true, false) => self.touch_ended(sample, gs),
            (false, false) => {},
        }

        gs.buttons = sample.buttons;
        if self.tap_button_held() {
            gs.buttons.set(0, true);
        }

        self.prev = Some(sample.clone());
    }


    fn resolve(&mut self, gs: &mut GestureSnapshot, now: Timestamp) -> Resolution {
        match self.tap {
            TapState::ReleasePending { deadline } if now >= deadline => {
                self.tap = TapState::Idle;
                let physical_left = self.prev
                    .as_ref()
                    .is_some_and(|p| p.buttons.get(0));
                gs.buttons.set(0, physical_left);

                if std::mem::take(&mut self.coast_on_lift) {
                    Resolution::ResolvedCoast
                } else {
                    Resolution::ResolvedNoCoast
                }
            },
            TapState::ReleasePending { .. } => Resolution::NotPending,
            _ if self.coast_on_lift => {
                self.coast_on_lift = false;
                Resolution::ResolvedCoast
            },
            _ => Resolution::TooEarly,
        }
    }
}
