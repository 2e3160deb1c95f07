pub mod classifier;
pub mod coasting;
pub mod emitter;
pub mod gestures;
pub mod scheduler;
pub mod session;
pub mod virtual_trackpad;
