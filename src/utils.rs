use tracing::{debug, warn};

/// Number of processing workers: the configured maximum, capped so one
/// logical core stays free for grabbing, and never less than one.
pub fn worker_count(max_workers: usize) -> usize {
    max_workers
        .min(num_cpus::get().saturating_sub(1))
        .max(1)
}

/// Pin the calling thread to a CPU core, chosen round-robin by `slot`
pub fn pin_current_thread(slot: usize) -> bool {
    let Some(core_ids) = core_affinity::get_core_ids() else {
        warn!("Unable to enumerate CPU cores, thread not pinned");
        return false;
    };
    let Some(core) = core_ids.get(slot % core_ids.len().max(1)).copied() else {
        return false;
    };
    let pinned = core_affinity::set_for_current(core);
    debug!(slot, core = core.id, pinned, "Pinned thread");
    pinned
}

/// Auto-detect eye cameras, in device order
#[cfg(feature = "v4l2")]
pub fn detect_cameras(max: usize) -> Vec<(String, crate::capture::PixelFormat)> {
    use crate::capture::PixelFormat;
    use std::path::Path;
    use tracing::info;
    use v4l::{capability::Flags, video::Capture, Device, FourCC};

    info!("Auto-detecting capture devices...");

    let mut found = Vec::new();
    for i in 0..10 {
        if found.len() >= max {
            break;
        }
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
        let Ok(formats) = dev.enum_formats() else {
            continue;
        };
        // Prefer raw grayscale, eye cameras are usually monochrome
        let best = formats.iter().find_map(|fmt| {
            if fmt.fourcc == FourCC::new(b"GREY") {
                Some(PixelFormat::Gray8)
            } else if fmt.fourcc == FourCC::new(b"YUYV") {
                Some(PixelFormat::Yuyv4)
            } else if fmt.fourcc == FourCC::new(b"MJPG") {
                Some(PixelFormat::Mjpeg)
            } else {
                None
            }
        });
        if let Some(format) = best {
            info!("Found {:?} device: {} - {}", format, path, caps.card);
            found.push((path, format));
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_count_bounds() {
        assert_eq!(worker_count(0), 1);
        assert_eq!(worker_count(1), 1);
        assert!(worker_count(64) >= 1);
        assert!(worker_count(64) <= num_cpus::get().max(1));
    }
}
