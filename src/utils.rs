use crate::capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device, FourCC};

// Detected capture device info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundDevice {
    pub path: String,
    pub card: String,
    pub format: PixelFormat,
}

/// Capture devices in `/dev/videoN` order, up to `max_devices` probed nodes.
///
/// Metadata nodes and devices without a usable format are skipped, so the
/// position in the list is the camera index.
pub fn capture_devices(max_devices: u32) -> Vec<FoundDevice> {
    use std::path::Path;

    let mut found = Vec::new();
    for i in 0..max_devices {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            debug!(%path, "Device busy or unreadable");
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }
        let Ok(formats) = dev.enum_formats() else {
            continue;
        };
        if let Some(format) = preferred_format(formats.iter().map(|fmt| fmt.fourcc)) {
            info!(%path, card = %caps.card, ?format, "Found capture device");
            found.push(FoundDevice {
                path,
                card: caps.card,
                format,
            });
        }
    }
    found
}

/// Prefer MJPEG, then YUYV.
fn preferred_format(fourccs: impl IntoIterator<Item = FourCC>) -> Option<PixelFormat> {
    let mut best = None;
    for fourcc in fourccs {
        if fourcc == FourCC::new(b"MJPG") {
            return Some(PixelFormat::Mjpeg);
        } else if fourcc == FourCC::new(b"YUYV") {
            best = Some(PixelFormat::Yuyv4);
        }
    }
    best
}
