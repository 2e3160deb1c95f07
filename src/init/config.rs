use serde::Deserialize;
use serde_json::from_str;
use std::{
    fs::{read_to_string, OpenOptions},
    io::ErrorKind,
    path::PathBuf,
    time::Duration,
};
use log::SetLoggerError;
use simplelog::{LevelFilter, SimpleLogger, WriteLogger};


// This is simply a wrapper to allow deserialization of the
// logLevel field into a simplelog::LevelFilter.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    #[serde(rename = "off")]
    Off,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "info")]
    Info,
    #[serde(rename = "debug")]
    Debug,
    #[serde(rename = "trace")]
    Trace
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off   => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn  => LevelFilter::Warn,
            LogLevel::Info  => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}


/// Settings for post-release scroll continuation.
#[serde_with::serde_as]
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScrollCoast {
    /// Axes whose speed (units/ms) is at or below this don't coast.
    #[serde(default = "default_min_speed")]
    pub min_speed: f64,

    #[serde(default = "default_tick")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub tick_ms: Duration,

    /// Tick budget handed to the snapshot when a coasting gesture ends.
    #[serde(default = "default_num_of_ticks")]
    pub num_of_ticks: i32,
}

impl Default for ScrollCoast {
    fn default() -> Self {
        ScrollCoast {
            min_speed: default_min_speed(),
            tick_ms: default_tick(),
            num_of_ticks: default_num_of_ticks(),
        }
    }
}


#[serde_with::serde_as]  // this has to be before the #[derive]
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    #[serde(default = "default_true")]
    pub scroll_smooth: bool,

    #[serde(default = "default_scroll_dist")]
    pub scroll_dist: f64,

    #[serde(default)]
    pub scroll_coast: ScrollCoast,

    #[serde(default = "default_tap_timeout")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub tap_timeout: Duration,

    #[serde(default = "default_tap_hold")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub tap_hold: Duration,

    #[serde(default = "default_tap_threshold")]
    pub tap_threshold: f64,

    #[serde(default)]
    pub device_path: Option<String>,

    #[serde(default = "default_true")]
    pub grab: bool,

    #[serde(default)]
    pub absolute_mode: bool,

    #[serde(default = "default_stdout")]
    pub log_file: String,

    #[serde(default = "default_info")]
    pub log_level: LogLevel,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            scroll_smooth: true,
            scroll_dist: default_scroll_dist(),
            scroll_coast: ScrollCoast::default(),
            tap_timeout: default_tap_timeout(),
            tap_hold: default_tap_hold(),
            tap_threshold: default_tap_threshold(),
            device_path: None,
            grab: true,
            absolute_mode: false,
            log_file: default_stdout(),
            log_level: default_info(),
        }
    }
}

// serde wants functions for field defaults, not literals
fn default_true()          -> bool     { true }
fn default_scroll_dist()   -> f64      { 150.0 }
fn default_min_speed()     -> f64      { 0.05 }
fn default_tick()          -> Duration { Duration::from_millis(50) }
fn default_num_of_ticks()  -> i32      { 5 }
fn default_tap_timeout()   -> Duration { Duration::from_millis(200) }
fn default_tap_hold()      -> Duration { Duration::from_millis(100) }
fn default_tap_threshold() -> f64      { 0.05 }
fn default_stdout()        -> String   { "stdout".to_string() }
fn default_info()          -> LogLevel { LogLevel::Info }


pub fn get_config_file_path() -> Result<PathBuf, std::io::Error> {
    let config_folder = match std::env::var_os("XDG_CONFIG_HOME") {
        Some(config_dir) => PathBuf::from(config_dir),
        None => {
            if let Some(home) = std::env::var_os("HOME") {
                PathBuf::from(home).join(".config")
            } else {
                return Err(
                    std::io::Error::new(
                        ErrorKind::NotFound,
                        "Neither $XDG_CONFIG_HOME or $HOME defined in environment"
                    )
                );
            }
        }
    };
    Ok(config_folder.join("mtrack-coast/config.json"))
}


pub fn parse_config_str(json: &str) -> Result<Configuration, serde_json::Error> {
    from_str::<Configuration>(json)
}


// Configs are so optional that their absence should not crash the program,
// so if there is any issue with the JSON config file,
// the following default values will be returned:
//
// {
//     scrollSmooth: true,
//     scrollDist: 150.0,
//     scrollCoast: { minSpeed: 0.05, tickMs: 50, numOfTicks: 5 },
//     tapTimeout: 200,
//     tapHold: 100,
//     tapThreshold: 0.05,
//     grab: true,
//     absoluteMode: false,
//     logFile: "stdout",
//     logLevel: "info",
// }
pub fn parse_config_file() -> Result<Configuration, std::io::Error> {
    let filepath = get_config_file_path()?;
    let jsonfile = read_to_string(&filepath)
        .map_err(|_|
            std::io::Error::new(
                ErrorKind::NotFound,
                format!("Unable to locate JSON file at {:?} ", filepath)
            )
        )?;

    // use serde's error as is
    let config = parse_config_str(&jsonfile)?;

    Ok(config)
}


pub fn init_cfg() -> Configuration {

    println!("[PRE-LOG: INFO]: Loading configuration...");
    match parse_config_file() {
        Ok(cfg) => {
            println!("[PRE-LOG: INFO]: Successfully loaded your configuration (with defaults for unspecified values): \n{:#?}", &cfg);
            cfg
        },
        Err(err) => {
            let cfg = Configuration::default();
            println!("\n[PRE-LOG: WARNING]: {err}\n\nThe configuration file could not be \
                loaded, so the program will continue with defaults of:\n{cfg:#?}",
            );
            cfg
        }
    }
}


pub fn init_logger(cfg: &Configuration) -> Result<(), SetLoggerError> {

    println!("[PRE-LOG: INFO]: Initializing logger...");

    let log_level: LevelFilter = cfg.log_level.into();

    // "stdout" or a file that can't be opened both end up
    // at the console logger below
    if cfg.log_file != "stdout" {

        match OpenOptions::new().append(true).open(&cfg.log_file) {

            Ok(log_file) => {

                WriteLogger::init(
                    log_level,
                    simplelog::Config::default(),
                    log_file
                )?;
                println!(
                    "[PRE-LOG: INFO]: Logger initialized! Logging to '{}' \
                    at {}-level verbosity.", cfg.log_file, log_level
                );
                return Ok(());
            },

            Err(open_err) => println!(
                "[PRE-LOG: WARN]: Failed to open logfile '{}' due to the following error: {}, {}.",
                cfg.log_file,
                open_err.kind(),
                open_err
            )
        };
    }

    SimpleLogger::init(
        log_level,
        simplelog::Config::default()
    )?;
    println!(
        "[PRE-LOG: INFO]: Logger initialized! Logging to console \
        at {log_level}-level verbosity."
    );

    Ok(())
}
