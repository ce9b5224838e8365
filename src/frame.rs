//! Luma frame storage and the video source collaborator.

use std::path::Path;

use image::GrayImage;

use crate::camera::{CalibrationError, Resolution};

/// Capture time of a frame, in microseconds of an arbitrary monotonic clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub u64);

/// Owned single-channel image of a fixed size.
///
/// Cloning performs a deep pixel copy.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameBuffer {
    image: GrayImage,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        FrameBuffer {
            image: GrayImage::new(0, 0),
        }
    }
}

impl FrameBuffer {
    /// Allocates a zeroed buffer.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::AllocationFailed`] if the pixel storage cannot be
    /// reserved, [`CalibrationError::InvalidParams`] for an empty resolution.
    pub fn new(resolution: Resolution) -> Result<Self, CalibrationError> {
        if resolution.width == 0 || resolution.height == 0 {
            return Err(CalibrationError::InvalidParams(format!(
                "frame size must be non-zero, got {}x{}",
                resolution.width, resolution.height
            )));
        }
        let bytes = resolution.pixel_count();
        let mut pixels = Vec::new();
        pixels
            .try_reserve_exact(bytes)
            .map_err(|_| CalibrationError::AllocationFailed { bytes })?;
        pixels.resize(bytes, 0u8);

        let image = GrayImage::from_raw(resolution.width, resolution.height, pixels)
            .ok_or(CalibrationError::AllocationFailed { bytes })?;
        Ok(FrameBuffer { image })
    }

    /// Allocates a buffer and fills it from `luma`.
    pub fn from_luma(resolution: Resolution, luma: &[u8]) -> Result<Self, CalibrationError> {
        let mut frame = FrameBuffer::new(resolution)?;
        frame.copy_from_slice(luma)?;
        Ok(frame)
    }

    pub fn from_image(image: GrayImage) -> Self {
        FrameBuffer { image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.image.width(),
            height: self.image.height(),
        }
    }

    pub fn len(&self) -> usize {
        self.image.as_raw().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn image(&self) -> &GrayImage {
        &self.image
    }

    /// Overwrites every pixel with `luma`; the buffer size never changes.
    pub fn copy_from_slice(&mut self, luma: &[u8]) -> Result<(), CalibrationError> {
        let expected = self.len();
        if luma.len() != expected {
            return Err(CalibrationError::FrameSizeMismatch {
                expected,
                actual: luma.len(),
            });
        }
        self.image.copy_from_slice(luma);
        Ok(())
    }

    /// Copies `other` into `self` without reallocating when sizes agree.
    pub fn copy_from(&mut self, other: &FrameBuffer) {
        if self.image.dimensions() == other.image.dimensions() {
            self.image.copy_from_slice(other.as_bytes());
        } else {
            self.image = other.image.clone();
        }
    }
}

/// A frame lent out by a [`FrameSource`].
#[derive(Debug, Clone, Copy)]
pub struct SourceFrame<'a> {
    pub timestamp: Timestamp,
    pub luma: &'a [u8],
}

/// Provider of luma frames at a fixed resolution.
///
/// A checked out frame stays valid until [`FrameSource::checkin_frame`] is
/// called.
pub trait FrameSource {
    fn resolution(&self) -> Resolution;

    /// Returns the newest frame if it is newer than `timestamp` (or any frame
    /// when `timestamp` is `None`). Never blocks.
    fn checkout_frame_if_newer_than(&mut self, timestamp: Option<Timestamp>)
        -> Option<SourceFrame<'_>>;

    fn checkin_frame(&mut self);
}

/// Plays a fixed list of still images as a video, one image per checkout.
pub struct ImageSequenceSource {
    resolution: Resolution,
    frames: Vec<GrayImage>,
    next: usize,
    checked_out: bool,
}

impl ImageSequenceSource {
    /// # Errors
    ///
    /// [`CalibrationError::InvalidParams`] if the list is empty or the images
    /// do not all share one size.
    pub fn from_images(frames: Vec<GrayImage>) -> Result<Self, CalibrationError> {
        let first = frames.first().ok_or_else(|| {
            CalibrationError::InvalidParams("image sequence is empty".to_string())
        })?;
        let resolution = Resolution {
            width: first.width(),
            height: first.height(),
        };
        if let Some(bad) = frames
            .iter()
            .find(|f| f.dimensions() != (resolution.width, resolution.height))
        {
            return Err(CalibrationError::InvalidParams(format!(
                "image sequence mixes {}x{} and {}x{} frames",
                resolution.width,
                resolution.height,
                bad.width(),
                bad.height()
            )));
        }
        Ok(ImageSequenceSource {
            resolution,
            frames,
            next: 0,
            checked_out: false,
        })
    }

    /// Loads every path as an 8-bit luma image.
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> Result<Self, CalibrationError> {
        let mut frames = Vec::with_capacity(paths.len());
        for path in paths {
            let img = image::open(path.as_ref()).map_err(|e| {
                CalibrationError::IOError(format!(
                    "Failed to load image {}: {e}",
                    path.as_ref().display()
                ))
            })?;
            frames.push(img.to_luma8());
        }
        Self::from_images(frames)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// True once every image has been handed out.
    pub fn is_exhausted(&self) -> bool {
        self.next >= self.frames.len()
    }
}

impl FrameSource for ImageSequenceSource {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn checkout_frame_if_newer_than(
        &mut self,
        timestamp: Option<Timestamp>,
    ) -> Option<SourceFrame<'_>> {
        if self.checked_out || self.next >= self.frames.len() {
            return None;
        }
        // Image k carries timestamp k + 1 so that `Timestamp(0)` precedes all.
        let ts = Timestamp(self.next as u64 + 1);
        if timestamp.is_some_and(|last| ts <= last) {
            return None;
        }
        self.checked_out = true;
        Some(SourceFrame {
            timestamp: ts,
            luma: self.frames[self.next].as_raw(),
        })
    }

    fn checkin_frame(&mut self) {
        if self.checked_out {
            self.checked_out = false;
            self.next += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RES: Resolution = Resolution {
        width: 8,
        height: 4,
    };

    #[test]
    fn test_frame_buffer_copy() {
        let mut frame = FrameBuffer::new(RES).unwrap();
        assert_eq!(frame.len(), 32);
        assert!(frame.as_bytes().iter().all(|&b| b == 0));

        let luma: Vec<u8> = (0..32).collect();
        frame.copy_from_slice(&luma).unwrap();
        assert_eq!(frame.as_bytes(), luma.as_slice());
        assert_eq!(frame.image().get_pixel(1, 1).0[0], 9);

        let err = frame.copy_from_slice(&luma[..31]).unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::FrameSizeMismatch {
                expected: 32,
                actual: 31
            }
        ));

        let mut snapshot = FrameBuffer::default();
        snapshot.copy_from(&frame);
        assert_eq!(snapshot, frame);
    }

    #[test]
    fn test_zero_size_frame_is_rejected() {
        let res = Resolution {
            width: 0,
            height: 10,
        };
        assert!(matches!(
            FrameBuffer::new(res),
            Err(CalibrationError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_huge_frame_allocation_fails_cleanly() {
        let res = Resolution {
            width: u32::MAX,
            height: u32::MAX,
        };
        assert!(matches!(
            FrameBuffer::new(res),
            Err(CalibrationError::AllocationFailed { .. })
        ));
    }

    #[test]
    fn test_image_sequence_source() {
        let frames = vec![GrayImage::new(8, 4), GrayImage::from_pixel(8, 4, image::Luma([7]))];
        let mut source = ImageSequenceSource::from_images(frames).unwrap();
        assert_eq!(source.resolution(), RES);

        let first = source.checkout_frame_if_newer_than(None).unwrap();
        assert_eq!(first.timestamp, Timestamp(1));
        let ts = first.timestamp;
        // Only one frame may be out at a time.
        assert!(source.checkout_frame_if_newer_than(None).is_none());
        source.checkin_frame();

        assert!(source
            .checkout_frame_if_newer_than(Some(Timestamp(2)))
            .is_none());
        let second = source.checkout_frame_if_newer_than(Some(ts)).unwrap();
        assert_eq!(second.luma[0], 7);
        source.checkin_frame();
        assert!(source.is_exhausted());
        assert!(source.checkout_frame_if_newer_than(Some(ts)).is_none());
    }

    #[test]
    fn test_mixed_sizes_are_rejected() {
        let frames = vec![GrayImage::new(8, 4), GrayImage::new(4, 8)];
        assert!(ImageSequenceSource::from_images(frames).is_err());
        assert!(ImageSequenceSource::from_images(Vec::new()).is_err());
    }
}
