pub mod init;
pub mod runtime;
