use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bytes per pixel of an [`ImageFrame`] buffer.
pub const RGB_CHANNELS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageFrame {
    pub width: u32,
    pub height: u32,
    /// Raw RGB pixel buffer, row-major, no padding.
    pub data: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

impl ImageFrame {
    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            data,
            captured_at: Utc::now(),
        }
    }

    pub fn empty() -> Self {
        Self::from_rgb(0, 0, Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.data.is_empty()
    }

    /// Buffer length matches the declared dimensions.
    pub fn is_consistent(&self) -> bool {
        self.data.len() == self.width as usize * self.height as usize * RGB_CHANNELS
    }
}

/// A captured frame with its timestamp banner, encoded and persisted.
#[derive(Debug, Clone)]
pub struct AnnotatedImage {
    pub width: u32,
    pub height: u32,
    pub jpeg: Vec<u8>,
    pub path: PathBuf,
    pub captured_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_consistency_checks_buffer_length() {
        let frame = ImageFrame::from_rgb(4, 2, vec![0; 24]);
        assert!(frame.is_consistent());
        assert!(!frame.is_empty());

        let short = ImageFrame::from_rgb(4, 2, vec![0; 23]);
        assert!(!short.is_consistent());

        assert!(ImageFrame::empty().is_empty());
    }
}
