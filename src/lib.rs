pub mod capture;
pub mod error;
pub mod pipeline;
pub mod server;
pub mod supervisor;
pub mod utils;

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use capture::frame::PixelFormat;
use capture::Delimiters;
use serde::{Deserialize, Serialize};

pub use capture::Frame;
pub use error::{RelayError, Result};

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub streams: Vec<StreamConfig>,
    /// Upper bound for each shutdown step (subprocess exit, task join)
    pub shutdown_timeout_ms: u64,
}

/// One independent camera pipeline served on its own port
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub name: String,
    pub bind: IpAddr,
    pub port: u16,
    pub buffer_capacity: usize,
    pub take_timeout_ms: u64,
    pub content_type: String,
    pub max_frame_bytes: usize,
    pub start_marker: Option<Vec<u8>>,
    pub end_marker: Option<Vec<u8>>,
    pub source: SourceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// USB webcam through ffmpeg's v4l2 input
    Webcam(WebcamSource),
    /// Raspberry Pi camera: libcamera-vid raw output transcoded by ffmpeg
    Libcamera(LibcameraSource),
    /// Arbitrary capture stages, each piped into the next
    Command(CommandSource),
    /// Still images from a folder, cycled as a live stream
    Slideshow(SlideshowSource),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebcamSource {
    /// Auto-detected when empty
    pub device: Option<String>,
    /// Passed as `-input_format`; left to ffmpeg when unset
    pub format: Option<PixelFormat>,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub quality: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibcameraSource {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub quality: u8,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSource {
    pub stages: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlideshowSource {
    pub folder: PathBuf,
    pub width: u32,
    pub height: u32,
    pub display_secs: f64,
    /// JPEG quality, 1-100
    pub quality: u8,
    pub repeat: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            streams: vec![StreamConfig::default()],
            shutdown_timeout_ms: 2000,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: "webcam".into(),
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            buffer_capacity: 10,
            take_timeout_ms: 1000,
            content_type: "image/jpeg".into(),
            max_frame_bytes: 8 * 1024 * 1024,
            start_marker: None,
            end_marker: None,
            source: SourceConfig::Webcam(WebcamSource::default()),
        }
    }
}

impl Default for WebcamSource {
    fn default() -> Self {
        Self {
            device: Some("/dev/video0".into()),
            format: None,
            width: 1920,
            height: 1080,
            framerate: 30,
            quality: 5,
        }
    }
}

impl Default for LibcameraSource {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            framerate: 60,
            quality: 5,
        }
    }
}

impl Default for SlideshowSource {
    fn default() -> Self {
        Self {
            folder: PathBuf::from("img/"),
            width: 1920,
            height: 1080,
            display_secs: 1.0,
            quality: 85,
            repeat: false,
        }
    }
}

impl Config {
    /// Load from an optional TOML file, then `CAMRELAY__*` environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let path = path
            .map(str::to_owned)
            .or_else(|| std::env::var("CAMRELAY_CONFIG").ok())
            .unwrap_or_else(|| "camrelay.toml".into());

        let config: Config = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(
                config::Environment::with_prefix("CAMRELAY")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.streams.is_empty() {
            return Err(RelayError::InvalidConfig("no streams configured".into()));
        }

        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        for stream in &self.streams {
            if !names.insert(stream.name.as_str()) {
                return Err(RelayError::InvalidConfig(format!(
                    "duplicate stream name `{}`",
                    stream.name
                )));
            }
            if stream.port != 0 && !ports.insert((stream.bind, stream.port)) {
                return Err(RelayError::InvalidConfig(format!(
                    "stream `{}` reuses port {}",
                    stream.name, stream.port
                )));
            }
            stream.validate()?;
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl StreamConfig {
    fn validate(&self) -> Result<()> {
        let invalid = |what: &str| -> Result<()> {
            Err(RelayError::InvalidConfig(format!(
                "stream `{}`: {what}",
                self.name
            )))
        };

        if self.buffer_capacity == 0 {
            return invalid("buffer_capacity must be at least 1");
        }
        if self.take_timeout_ms == 0 {
            return invalid("take_timeout_ms must be positive");
        }
        if matches!(&self.start_marker, Some(m) if m.is_empty())
            || matches!(&self.end_marker, Some(m) if m.is_empty())
        {
            return invalid("frame markers must not be empty");
        }
        match &self.source {
            SourceConfig::Command(cmd) => {
                if cmd.stages.is_empty() || cmd.stages.iter().any(Vec::is_empty) {
                    return invalid("command stages must be non-empty argument lists");
                }
            }
            SourceConfig::Slideshow(show) => {
                if show.display_secs.is_nan() || show.display_secs <= 0.0 {
                    return invalid("display_secs must be positive");
                }
            }
            SourceConfig::Webcam(_) | SourceConfig::Libcamera(_) => {}
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn take_timeout(&self) -> Duration {
        Duration::from_millis(self.take_timeout_ms)
    }

    pub fn delimiters(&self) -> Result<Delimiters> {
        let jpeg = Delimiters::jpeg();
        Delimiters::new(
            self.start_marker.clone().unwrap_or(jpeg.start),
            self.end_marker.clone().unwrap_or(jpeg.end),
        )
    }
}
