/// A single captured video frame, opaque to the scheduling loop.
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// The pixel-level motion kernel: grayscale conversion, MOG2 background
/// subtraction, threshold, and morphology, returning the non-zero pixel
/// count of the resulting mask.
///
/// Kept as a trait because no crate in the corpus implements an OpenCV-style
/// CV backend; the worker's scheduling, warmup, cooldown and dispatch logic
/// is fully implemented and testable against a fake implementation of this
/// trait, independent of whatever real backend eventually satisfies it.
pub trait MotionKernel: Send {
    fn detect(&mut self, frame: &Frame) -> usize;
}

/// A minimal swappable `MotionKernel`: absolute grayscale frame-differencing
/// against the previous frame, thresholded per pixel. Stands in for the full
/// MOG2/erode/dilate/morph-close pipeline the design explicitly leaves as an
/// external, swappable concern; any binary can substitute a real OpenCV-backed
/// kernel later without touching `MotionWorker`.
pub struct FrameDiffKernel {
    pixel_threshold: u8,
    previous: Option<Vec<u8>>,
}

impl FrameDiffKernel {
    pub fn new(pixel_threshold: u8) -> Self {
        Self {
            pixel_threshold,
            previous: None,
        }
    }
}

impl MotionKernel for FrameDiffKernel {
    fn detect(&mut self, frame: &Frame) -> usize {
        let count = match &self.previous {
            Some(prev) if prev.len() == frame.data.len() => frame
                .data
                .iter()
                .zip(prev.iter())
                .filter(|(a, b)| a.abs_diff(**b) > self.pixel_threshold)
                .count(),
            _ => 0,
        };
        self.previous = Some(frame.data.clone());
        count
    }
}

#[cfg(test)]
pub(crate) struct ScriptedKernel {
    pub scores: std::collections::VecDeque<usize>,
}

#[cfg(test)]
impl MotionKernel for ScriptedKernel {
    fn detect(&mut self, _frame: &Frame) -> usize {
        self.scores.pop_front().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_frame_never_reports_motion() {
        let mut kernel = FrameDiffKernel::new(25);
        let frame = Frame { data: vec![200; 16], width: 4, height: 4 };
        assert_eq!(kernel.detect(&frame), 0);
    }

    #[test]
    fn differing_pixels_past_threshold_are_counted() {
        let mut kernel = FrameDiffKernel::new(10);
        kernel.detect(&Frame { data: vec![0; 4], width: 2, height: 2 });
        let score = kernel.detect(&Frame { data: vec![0, 50, 0, 50], width: 2, height: 2 });
        assert_eq!(score, 2);
    }
}
