//! Scroll coasting: after a scroll or swipe ends, keep scrolling on a fixed
//! cadence until the tick budget in the snapshot runs out.
//!
//! The remaining tick count is used directly as the magnitude multiplier,
//! so a tick's delta is `speed * tick_ms * ticks_left`. The chain is a
//! series of one-shot timers; every tick arms only the next one.

use log::debug;

use super::classifier::GestureClassifier;
use super::emitter::{self, EventSink};
use super::gestures::{millis_f64, GestureSnapshot, Timestamp};
use super::scheduler::TimerState;
use super::session::Session;
use crate::init::config::ScrollCoast;


/// Scroll axis deltas for the current tick, `(horizontal, vertical)`.
///
/// Gesture classes that can't coast zero both speeds and yield nothing.
/// An axis whose speed is at or below `min_speed` is left out.
pub fn scroll_axes(
    gs: &mut GestureSnapshot,
    coast: &ScrollCoast,
    delta_t_ms: f64,
) -> (Option<f64>, Option<f64>) {

    if !gs.move_type.allows_coasting() {
        gs.stop_coasting();
        return (None, None);
    }

    let speed_factor = f64::from(gs.scroll_coast_tick_no);
    let axis = |speed: f64| {
        (speed.abs() > coast.min_speed).then(|| speed * delta_t_ms * speed_factor)
    };

    (axis(gs.scroll_speed_x), axis(gs.scroll_speed_y))
}


impl<C: GestureClassifier, S: EventSink> Session<C, S> {

    /// One coasting tick. Either posts the decayed scroll and re-arms the
    /// timer for the next tick, or, once the budget is spent, stops and
    /// releases the timer.
    pub(crate) fn coast_tick(&mut self, now: Timestamp) {

        debug!(
            "coasting tick: tick_no={} speed_x={}, speed_y={}",
            self.gs.scroll_coast_tick_no,
            self.gs.scroll_speed_x,
            self.gs.scroll_speed_y
        );

        if self.gs.scroll_coast_tick_no <= 0 {
            self.gs.stop_coasting();
            self.timer = TimerState::Idle;
            debug!("coasting finished, timer released");
            return;
        }

        let tick = self.cfg.scroll_coast.tick_ms;
        emitter::set_and_post_mask(
            &mut self.sink,
            &mut self.gs,
            &self.cfg.scroll_coast,
            millis_f64(tick)
        );

        self.gs.scroll_coast_tick_no -= 1;
        self.timer = TimerState::Coasting { deadline: now + tick };
    }
}
