pub mod config;
pub mod device;
