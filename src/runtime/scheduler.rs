//! Delayed resolution of ambiguous button decisions.
//!
//! A tap can't be reported in full the moment the finger lifts: it may turn
//! into a tap-and-hold, so the classifier defers part of it. The session
//! keeps exactly one timer, tagged with the reason it is armed, and
//! re-evaluates the deferred decision either at the end of a packet batch
//! or when that timer expires. Both paths go through
//! [`Session::check_resolve_delayed`], so they share one transition table.

use log::{debug, trace};

use super::classifier::GestureClassifier;
use super::emitter::EventSink;
use super::gestures::Timestamp;
use super::session::Session;


/// What the classifier says about a deferred decision at a given time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Nothing to decide yet; leave everything as it is.
    TooEarly,
    /// A decision is pending and needs a timer to come back to it at
    /// `button_delayed_time`.
    NotPending,
    /// Decided. Emit the final snapshot.
    ResolvedNoCoast,
    /// Decided, and a coasting gesture just ended. Emit, then start coasting.
    ResolvedCoast,
}


/// The session's single timer, tagged with why it is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimerState {
    #[default]
    Idle,
    TapPending { deadline: Timestamp },
    Coasting { deadline: Timestamp },
}

impl TimerState {
    pub fn deadline(&self) -> Option<Timestamp> {
        match *self {
            TimerState::Idle => None,
            TimerState::TapPending { deadline } | TimerState::Coasting { deadline } => Some(deadline),
        }
    }

    pub fn is_tap_pending(&self) -> bool {
        matches!(self, TimerState::TapPending { .. })
    }

    pub fn is_coasting(&self) -> bool {
        matches!(self, TimerState::Coasting { .. })
    }

    fn cancel(&mut self) {
        if *self != TimerState::Idle {
            trace!("cancelling timer {:?}", self);
        }
        *self = TimerState::Idle;
    }
}


impl<C: GestureClassifier, S: EventSink> Session<C, S> {

    /// Asks the classifier whether a deferred decision can be made and acts
    /// on the answer.
    pub(crate) fn check_resolve_delayed(&mut self, now: Timestamp) {

        let resolution = self.classifier.resolve(&mut self.gs, now);
        trace!("resolve at {:?}: {:?} (timer {:?})", now, resolution, self.timer);

        match resolution {
            Resolution::TooEarly => {},
            Resolution::NotPending => {
                if self.timer.is_tap_pending() {
                    return;
                }
                self.timer.cancel();
                let wait = self.gs.button_delayed_time.saturating_sub(self.gs.time);
                debug!("deferring button decision by {:?}", wait);
                self.timer = TimerState::TapPending { deadline: now + wait };
            },
            Resolution::ResolvedNoCoast => {
                self.timer.cancel();
                self.emit();
            },
            Resolution::ResolvedCoast => {
                self.timer.cancel();
                self.emit();
                // first tick runs now, the rest on the timer
                self.coast_tick(now);
            },
        }
    }


    /// Timer expiry. Firings with nothing armed, or before the armed
    /// deadline, do nothing.
    pub fn on_timer_fire(&mut self, now: Timestamp) {

        let deadline = match self.timer.deadline() {
            Some(deadline) => deadline,
            None => {
                debug!("timer fired with nothing armed, ignoring");
                return;
            }
        };

        if now < deadline {
            trace!("timer fired {:?} early, ignoring", deadline - now);
            return;
        }

        match self.timer {
            TimerState::TapPending { .. } => {
                // the one-shot is spent; resolving may arm it again
                self.timer = TimerState::Idle;
                self.check_resolve_delayed(now);
            },
            TimerState::Coasting { .. } => self.coast_tick(now),
            TimerState::Idle => {},
        }
    }
}
