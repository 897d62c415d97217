//! The data model that travels through the pipeline: frame identity, the
//! region of interest, the per-frame work item, and the decoder's output.

use ndarray::Array2;

use crate::stopwatch::StopWatch;

/// Application-side correlation key. The pipeline itself orders frames by
/// submission (`FrameContext::iteration`), never by this identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameIdentifier {
    pub camera_id: u32,
    pub frame_id: u64,
}

impl FrameIdentifier {
    pub fn new(camera_id: u32, frame_id: u64) -> Self {
        Self { camera_id, frame_id }
    }
}

/// Integer region of interest in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// The full-image ROI handed to the decoder; PostProcess always operates
    /// on the complete accelerator output, regardless of the caller's ROI.
    pub fn unit() -> Self {
        Self::new(0, 0, 1, 1)
    }
}

/// One detected instance: its class, confidence, box, and segmentation mask.
///
/// `mask` is an opaque 2-D float matrix produced by the external decoder —
/// this crate never interprets its values beyond thresholding for
/// `compute_polygon`.
pub struct Segment {
    pub class_id: i32,
    pub label: String,
    pub resolution: (u32, u32),
    pub bbox: (f32, f32, f32, f32),
    pub confidence: f32,
    pub mask: Array2<f32>,
}

impl Segment {
    /// Read a single mask sample, in mask-local (row, col) coordinates.
    pub fn mask_at(&self, row: usize, col: usize) -> f32 {
        self.mask[[row, col]]
    }

    /// Threshold the mask, trace the largest external contour, and return up
    /// to `max_points` `(x, y)` pairs describing it.
    ///
    /// Returns an empty vector if the largest contour has 3 or fewer points
    /// (mirrors the original `segment_compute_polygon` C ABI entry point,
    /// which treats such a contour as degenerate).
    pub fn compute_polygon(&self, threshold: f32, max_points: usize) -> Vec<(i32, i32)> {
        crate::polygon::largest_contour(&self.mask, threshold, max_points)
    }
}

/// The decoder's output for one frame: an ordered list of segments plus the
/// request context they were produced for.
pub struct SegmentationResult {
    pub id: FrameIdentifier,
    pub roi: Rect,
    pub threshold: f32,
    pub segments: Vec<Segment>,
    /// Detections the decoder flagged as confidence-borderline but did not
    /// drop outright.
    pub uncertain_counter: u32,
}

impl SegmentationResult {
    pub fn new(id: FrameIdentifier, roi: Rect, threshold: f32) -> Self {
        Self {
            id,
            roi,
            threshold,
            segments: Vec::new(),
            uncertain_counter: 0,
        }
    }

    pub fn push(&mut self, segment: Segment, uncertain: bool) {
        if uncertain {
            self.uncertain_counter += 1;
        }
        self.segments.push(segment);
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// The unit of work that flows through the pipeline. Owned by exactly one
/// stage at a time; released exactly once on every exit path (successful
/// callback, drop at any stage, or shutdown drain).
pub struct FrameContext {
    pub id: FrameIdentifier,
    pub roi: Rect,
    pub threshold: f32,
    /// Assigned inside the write critical section; the stable identifier
    /// reported to `StageStats`.
    pub iteration: u64,
    pub result: Option<SegmentationResult>,

    pub write_watch: StopWatch,
    pub inference_and_read_watch: StopWatch,
    pub post_process_watch: StopWatch,
    pub total_watch: StopWatch,
}

impl FrameContext {
    pub fn new(id: FrameIdentifier, roi: Rect, threshold: f32) -> Self {
        Self {
            id,
            roi,
            threshold,
            iteration: 0,
            result: None,
            write_watch: StopWatch::new(),
            inference_and_read_watch: StopWatch::new(),
            post_process_watch: StopWatch::new(),
            total_watch: StopWatch::start_new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_identifier_equality_is_by_value() {
        let a = FrameIdentifier::new(1, 42);
        let b = FrameIdentifier::new(1, 42);
        let c = FrameIdentifier::new(2, 42);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn rect_unit_is_normalized_full_frame() {
        let r = Rect::unit();
        assert_eq!(r, Rect::new(0, 0, 1, 1));
    }

    #[test]
    fn segmentation_result_tracks_uncertain_counter() {
        let mut result = SegmentationResult::new(FrameIdentifier::new(1, 0), Rect::unit(), 0.6);
        let make_segment = || Segment {
            class_id: 0,
            label: "person".into(),
            resolution: (4, 4),
            bbox: (0.0, 0.0, 1.0, 1.0),
            confidence: 0.5,
            mask: Array2::zeros((4, 4)),
        };
        result.push(make_segment(), true);
        result.push(make_segment(), false);
        assert_eq!(result.len(), 2);
        assert_eq!(result.uncertain_counter, 1);
    }

    #[test]
    fn frame_context_starts_with_zero_iteration() {
        let ctx = FrameContext::new(FrameIdentifier::new(0, 0), Rect::unit(), 0.6);
        assert_eq!(ctx.iteration, 0);
        assert!(ctx.result.is_none());
    }
}
