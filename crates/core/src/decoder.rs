//! Adapter surface for the YOLOv8 tensor-to-detection decoder.
//!
//! Tensor dequantization, anchor decoding, softmax, NMS, and mask
//! sigmoid/crop are external collaborators — this module only defines the
//! narrow interface PostProcess calls through, plus a [`StubDecoder`] for
//! tests and the CLI demo.

use ndarray::Array2;

use crate::accelerator::OutputBuffer;
use crate::error::PipelineError;
use crate::frame::Rect;

/// Fixed anchor configuration PostProcess always calls the decoder with.
#[derive(Debug, Clone, Copy)]
pub struct AnchorConfig {
    pub strides: [u32; 3],
    pub regression_length: u32,
    pub num_classes: u32,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            strides: [8, 16, 32],
            regression_length: 15,
            num_classes: 80,
        }
    }
}

/// One decoded detection, before it is paired with its mask into a `Segment`.
pub struct Detection {
    pub class_id: i32,
    pub label: String,
    pub confidence: f32,
    pub bbox: (f32, f32, f32, f32),
    /// The decoder's own judgment that this detection sits in a
    /// confidence-borderline band (feeds `SegmentationResult::uncertain_counter`).
    pub uncertain: bool,
}

/// A pure function from raw output tensors to `(detection, mask)` pairs.
pub trait SegmentationDecoder: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn decode(
        &self,
        tensors: &[OutputBuffer],
        network_dims: (u32, u32),
        anchors: AnchorConfig,
        roi: Rect,
        orig_w: u32,
        orig_h: u32,
        threshold: f32,
    ) -> Result<Vec<(Detection, Array2<f32>)>, PipelineError>;
}

/// A fixed-output decoder for tests and the CLI demo: returns `count`
/// synthetic detections with a flat zero mask of `mask_resolution`.
pub struct StubDecoder {
    pub count: usize,
    pub mask_resolution: (u32, u32),
}

impl StubDecoder {
    pub fn new(count: usize, mask_resolution: (u32, u32)) -> Self {
        Self { count, mask_resolution }
    }
}

impl SegmentationDecoder for StubDecoder {
    fn decode(
        &self,
        _tensors: &[OutputBuffer],
        _network_dims: (u32, u32),
        _anchors: AnchorConfig,
        _roi: Rect,
        _orig_w: u32,
        _orig_h: u32,
        threshold: f32,
    ) -> Result<Vec<(Detection, Array2<f32>)>, PipelineError> {
        let (w, h) = self.mask_resolution;
        let mut out = Vec::with_capacity(self.count);
        for i in 0..self.count {
            let confidence = threshold + 0.1;
            let detection = Detection {
                class_id: (i % 80) as i32,
                label: format!("class_{}", i % 80),
                confidence,
                bbox: (0.0, 0.0, 1.0, 1.0),
                uncertain: false,
            };
            out.push((detection, Array2::<f32>::zeros((h as usize, w as usize))));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_decoder_returns_configured_count() {
        let decoder = StubDecoder::new(3, (8, 8));
        let result = decoder
            .decode(&[], (640, 640), AnchorConfig::default(), Rect::unit(), 640, 480, 0.6)
            .unwrap();
        assert_eq!(result.len(), 3);
        for (detection, mask) in &result {
            assert!(detection.confidence > 0.6);
            assert_eq!(mask.dim(), (8, 8));
        }
    }

    #[test]
    fn default_anchor_config_matches_fixed_pipeline_values() {
        let cfg = AnchorConfig::default();
        assert_eq!(cfg.strides, [8, 16, 32]);
        assert_eq!(cfg.regression_length, 15);
        assert_eq!(cfg.num_classes, 80);
    }
}
