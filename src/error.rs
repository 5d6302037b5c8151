//! Crate error type for operations outside the report pipeline.
//!
//! The engine itself never propagates errors across task boundaries; those
//! become message statuses and events. This type covers the settings file,
//! discovery and connection setup paths.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings file error: {0}")]
    Settings(String),
    #[error("no device matching \"{0}\" was found")]
    UnknownDevice(String),
    #[error("device is not connected")]
    NotConnected,
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("firmware image error: {0}")]
    Firmware(String),
}

pub type Result<T> = std::result::Result<T, Error>;
