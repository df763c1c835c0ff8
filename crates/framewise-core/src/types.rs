//! Plain value types shared across the engine.

use std::fmt;

use crate::error::{Error, Result};

/// Index of one frame-in-flight.
///
/// Identifies one physical copy of every per-frame resource and one set of
/// synchronization primitives. Always in `[0, frames_in_flight)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct FrameSlot(usize);

impl FrameSlot {
    /// The first slot.
    pub const ZERO: Self = Self(0);

    /// Create a slot, validating it against the frames-in-flight count.
    pub fn new(index: usize, frames_in_flight: usize) -> Result<Self> {
        if index < frames_in_flight {
            Ok(Self(index))
        } else {
            Err(Error::SlotOutOfRange {
                slot: index,
                frames_in_flight,
            })
        }
    }

    /// Raw slot index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }

    /// The slot that follows this one, wrapping at `frames_in_flight`.
    #[inline]
    pub const fn next(self, frames_in_flight: usize) -> Self {
        Self((self.0 + 1) % frames_in_flight)
    }
}

impl fmt::Display for FrameSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

/// Size of a render target in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    /// Create a new extent.
    #[inline]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns true if either dimension is zero (e.g. a minimised window).
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Aspect ratio (width / height). Zero-height extents report 1.0.
    pub fn aspect_ratio(self) -> f32 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Tag selecting the compiled pipeline a drawable object is rendered with.
///
/// Kinds are plain integers chosen by the application; the pipeline directory
/// maps each registered kind to its GPU pipeline once at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PipelineKind(pub u32);

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipeline kind {}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_wraps_round_robin() {
        let slot = FrameSlot::new(1, 2).unwrap();
        assert_eq!(slot.next(2), FrameSlot::ZERO);
        assert_eq!(FrameSlot::ZERO.next(3).index(), 1);
    }

    #[test]
    fn slot_rejects_out_of_range() {
        assert!(FrameSlot::new(2, 2).is_err());
        assert!(FrameSlot::new(0, 0).is_err());
    }

    #[test]
    fn empty_extent() {
        assert!(Extent::new(0, 600).is_empty());
        assert!(Extent::new(800, 0).is_empty());
        assert!(!Extent::new(800, 600).is_empty());
    }

    #[test]
    fn extent_display() {
        assert_eq!(Extent::new(1920, 1080).to_string(), "1920x1080");
    }

    #[test]
    fn aspect_ratio_of_empty_extent_is_one() {
        assert!((Extent::new(800, 400).aspect_ratio() - 2.0).abs() < f32::EPSILON);
        assert!((Extent::new(800, 0).aspect_ratio() - 1.0).abs() < f32::EPSILON);
    }
}
