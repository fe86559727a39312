//! Overlay display for the `view` subcommand.
//!
//! Logs every slide change and, when given an output path, keeps the current
//! slide's image in that file so a streaming tool can use it as an image
//! source. The file is removed while nothing is playing.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use slidesync_core::{DataUri, Surface, ViewStatus};
use tracing::{debug, info, warn};

pub struct OverlayDisplay {
    output: Option<PathBuf>,
}

impl OverlayDisplay {
    pub fn new(output: Option<PathBuf>) -> Self {
        Self { output }
    }

    fn write_image(path: &Path, image: &str) -> Result<(), Box<dyn std::error::Error>> {
        let decoded = DataUri::parse(image)?;

        // Write to temp file then rename (atomic)
        let mut temp_name = path.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);
        fs::write(&temp_path, &decoded.bytes)?;
        fs::rename(&temp_path, path)?;

        debug!("Display: wrote {} ({}, {} bytes)", path.display(), decoded.mime, decoded.bytes.len());
        Ok(())
    }
}

impl Surface for OverlayDisplay {
    fn show_slide(&self, position: usize, total: usize, image: &str) {
        info!("Display: slide {}/{} ({} bytes)", position + 1, total, image.len());

        if let Some(path) = &self.output {
            if let Err(e) = Self::write_image(path, image) {
                warn!("Display: could not write {}: {}", path.display(), e);
            }
        }
    }

    fn show_idle(&self) {
        info!("Display: idle");

        if let Some(path) = &self.output {
            match fs::remove_file(path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => {
                    warn!("Display: could not remove {}: {}", path.display(), e)
                }
                _ => {}
            }
        }
    }

    fn show_status(&self, status: &ViewStatus) {
        match status {
            ViewStatus::Linking => info!("Display: linking with panel..."),
            ViewStatus::Connected => info!("Display: connected to panel"),
            ViewStatus::Reconnecting { delay, reason } => {
                info!("Display: {}; reconnecting in {:?}", reason, delay)
            }
        }
    }
}
