use std::io;
use std::net::SocketAddr;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Capture stage `{0}` has no piped stdout")]
    MissingStdout(String),

    #[error("Failed to read capture output: {0}")]
    Read(#[source] io::Error),

    #[error("Capture process exited unexpectedly: {0}")]
    ProcessExited(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No suitable capture device found")]
    NoDevice,

    #[error("Slideshow error: {0}")]
    Slideshow(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
