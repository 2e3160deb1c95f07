use std::{
    fmt,
    os::fd::AsFd,
    path::PathBuf,
    sync::{
        Arc, atomic::{AtomicBool, Ordering}
    },
    time::{Duration, Instant},
};
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags},
};
use signal_hook::{self, consts::{SIGINT, SIGTERM}, flag};
use log::{debug, error, info};

use mtrack_coast::{
    init::{config, device::{self, DeviceError, EvdevSource}},
    runtime::{
        classifier::TapClassifier,
        session::Session,
        virtual_trackpad::{self, VirtualTrackpad},
    }
};


/// Longest the loop sleeps without a timer armed, so the exit flag is
/// seen even when no signal interrupts the poll.
const MAX_WAIT: Duration = Duration::from_millis(500);


#[derive(Debug)]
enum MtError {
    Device(DeviceError),
    Io(std::io::Error),
    Poll(Errno),
    DeviceGone,
}

impl From<DeviceError> for MtError {
    fn from(err: DeviceError) -> Self {
        MtError::Device(err)
    }
}

impl From<std::io::Error> for MtError {
    fn from(err: std::io::Error) -> Self {
        MtError::Io(err)
    }
}

impl From<Errno> for MtError {
    fn from(err: Errno) -> Self {
        MtError::Poll(err)
    }
}

impl fmt::Display for MtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MtError::Device(e) => write!(f, "{e}"),
            MtError::Io(e) => write!(f, "{}, {}", e.kind(), e),
            MtError::Poll(e) => write!(f, "polling the device failed: {e}"),
            MtError::DeviceGone => write!(f, "the touchpad went away"),
        }
    }
}


type TouchSession = Session<TapClassifier, VirtualTrackpad>;


fn main() -> Result<(), MtError> {

    let configs = config::init_cfg();

    if let Err(e) = config::init_logger(&configs) {
        println!("[PRE-LOG: WARN]: Logger could not be initialized: {e}");
    }

    // handling SIGINT and SIGTERM
    let should_exit = Arc::new(AtomicBool::new(false));
    flag::register(SIGTERM, Arc::clone(&should_exit))?;
    flag::register(SIGINT,  Arc::clone(&should_exit))?;

    let device_path = match &configs.device_path {
        Some(path) => PathBuf::from(path),
        None => {
            info!("Searching for the touchpad on your device...");
            device::find_touchpad()?
        }
    };

    let epoch = Instant::now();
    let mut source = device::open_touchpad(&device_path, configs.grab, epoch)?;
    let calibration = source.calibration();

    let vtrackpad = virtual_trackpad::start_handler(&calibration, &configs)?;
    let classifier = TapClassifier::new(&configs, &calibration);
    let mut session = Session::new(configs, calibration, classifier, vtrackpad);
    session.on_device_on();

    // match instead of `?` so the virtual device is destroyed either way
    let main_result = run_main_event_loop(&mut session, &mut source, &should_exit, epoch);
    if let Err(e) = &main_result {
        error!("{e}");
    }

    info!("Cleaning up and exiting...");
    session.on_device_close();
    if let Err(e) = source.release() {
        debug!("Could not release the touchpad grab: {e}");
    }
    session.into_sink().destruct()?;

    info!("Clean up successful.");
    main_result
}


// Single-threaded: device input and timer expiry are handled on this
// thread, one at a time. The poll timeout is the time left on the
// session's timer.
fn run_main_event_loop(
    session: &mut TouchSession,
    source: &mut EvdevSource,
    should_exit: &Arc<AtomicBool>,
    epoch: Instant,
) -> Result<(), MtError> {

    info!("mtrack-coast started successfully!");

    while !should_exit.load(Ordering::Relaxed) {

        let wait = match session.next_deadline() {
            Some(deadline) => deadline.saturating_sub(epoch.elapsed()).min(MAX_WAIT),
            None => MAX_WAIT,
        };
        // round up, so a timer isn't polled for again just before it is due
        let timeout_ms = u16::try_from(wait.as_micros().div_ceil(1000)).unwrap_or(u16::MAX);

        let revents = {
            let mut fds = [PollFd::new(source.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, timeout_ms) {
                Ok(_) => fds[0].revents(),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        };

        if let Some(flags) = revents {
            if flags.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
                return Err(MtError::DeviceGone);
            }
            if flags.contains(PollFlags::POLLIN) {
                session.on_device_ready(source, epoch.elapsed());
            }
        }

        let now = epoch.elapsed();
        if session.next_deadline().is_some_and(|deadline| now >= deadline) {
            session.on_timer_fire(now);
        }
    }

    Ok(())
}
