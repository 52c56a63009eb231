use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::signal::ctrl_c;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use v4l::{capability::Flags, video::Capture, Device, FourCC};

use crate::capture::frame::PixelFormat;
use crate::error::{RelayError, Result};

// Detected capture device info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoundDevice {
    pub path: String,
    pub format: PixelFormat,
}

/// Auto-detect the first V4L2 capture device offering MJPEG or YUYV
pub fn auto_detect_device() -> Result<FoundDevice> {
    info!("Auto-detecting capture devices...");

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }

        let formats = dev.enum_formats().unwrap_or_default();
        // Prefer MJPEG, it goes straight through ffmpeg without re-encoding
        if formats.iter().any(|f| f.fourcc == FourCC::new(b"MJPG")) {
            info!("Found MJPEG device: {} - {}", path, caps.card);
            return Ok(FoundDevice {
                path,
                format: PixelFormat::Mjpeg,
            });
        }
        if formats.iter().any(|f| f.fourcc == FourCC::new(b"YUYV")) {
            info!("Found YUYV device: {} - {}", path, caps.card);
            return Ok(FoundDevice {
                path,
                format: PixelFormat::Yuyv4,
            });
        }
    }

    Err(RelayError::NoDevice)
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        match ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Exit the process if still alive after `deadline`. Used once shutdown has
/// started so a stuck subprocess or task cannot hang the relay forever.
pub fn arm_watchdog(deadline: Duration) {
    let spawned = std::thread::Builder::new()
        .name("shutdown-watchdog".into())
        .spawn(move || {
            std::thread::sleep(deadline);
            error!("Shutdown did not finish within {:?}, exiting", deadline);
            std::process::exit(1);
        });
    if let Err(e) = spawned {
        warn!("Failed to start shutdown watchdog: {}", e);
    }
}
