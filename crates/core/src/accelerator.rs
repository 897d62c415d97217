//! Adapter surface for the accelerator driver SDK.
//!
//! The real SDK (device open, model load, vstream read/write) is an
//! external collaborator reached only through this narrow trait. A
//! [`SimulatedAccelerator`] implementation is provided for the CLI demo and
//! the integration tests, so the pipeline can be exercised end-to-end
//! without real hardware.

use std::time::Duration;

use crate::error::PipelineError;
use crate::frame::Rect;

/// Per-output-stream quantization metadata the decoder needs to dequantize
/// a tensor plane back to float.
#[derive(Debug, Clone, Copy)]
pub struct QuantInfo {
    pub scale: f32,
    pub zero_point: i32,
}

/// Shape and format of one output tensor plane.
#[derive(Debug, Clone, Copy)]
pub struct OutputShape {
    pub width: u32,
    pub height: u32,
    pub features: u32,
}

/// Static metadata read from the loaded model, used to size channels and
/// buffers before the pipeline starts.
#[derive(Debug, Clone)]
pub struct ModelMetadata {
    pub input_width: u32,
    pub input_height: u32,
    pub input_frame_size: usize,
    pub output_names: Vec<String>,
    pub output_shapes: Vec<OutputShape>,
    pub output_quant: Vec<QuantInfo>,
}

impl ModelMetadata {
    pub fn num_outputs(&self) -> usize {
        self.output_names.len()
    }
}

/// One tensor plane read back from an output stream, along with the
/// metadata PostProcess needs to interpret it.
pub struct OutputBuffer {
    pub name: String,
    pub data: Vec<u8>,
    pub shape: OutputShape,
    pub quant: QuantInfo,
}

/// A single output stream (tensor plane). One reader thread owns each
/// stream exclusively for the pipeline's lifetime.
pub trait OutputStream: Send {
    /// Block for up to `timeout` reading the next output buffer. Retries on
    /// transient timeouts are the caller's responsibility: this call returns
    /// `Ok(None)` on a single timeout rather than erroring.
    fn read(&mut self, timeout: Duration) -> Result<Option<OutputBuffer>, PipelineError>;

    /// Unblock any in-progress or future `read`, used during shutdown.
    fn abort(&mut self);
}

/// The accelerator device: one input stream, `N` output streams.
pub trait AcceleratorDevice: Send {
    fn metadata(&self) -> &ModelMetadata;

    /// Push one converted input buffer. Pairs with exactly one output on
    /// each output stream, in submission order.
    fn write_input(&mut self, buf: &[u8]) -> Result<(), PipelineError>;

    /// Unblock any in-progress or future `write_input`, used during shutdown.
    fn abort_input(&mut self);

    fn output_stream(&mut self, index: usize) -> &mut dyn OutputStream;

    /// Hand exclusive ownership of every output stream to the caller. Called
    /// once, from `start`, so each ReadAndJoin thread can own its stream for
    /// the pipeline's lifetime instead of contending on the device for every
    /// read.
    fn take_output_streams(&mut self) -> Vec<Box<dyn OutputStream>>;

    fn num_outputs(&self) -> usize {
        self.metadata().num_outputs()
    }
}

/// Converts a submitted frame into the device's native input shape. Real
/// implementations do YUV↔RGB conversion and resize — out of scope here;
/// this crate only defines the seam the Write stage calls through.
pub trait FrameConverter: Send + Sync {
    fn convert(
        &self,
        frame: &[u8],
        roi: Rect,
        target_width: u32,
        target_height: u32,
    ) -> Result<Vec<u8>, PipelineError>;
}

/// A converter for callers that already submit frames in the device's native
/// I420 shape: validates the buffer length and passes it through unchanged.
pub struct IdentityConverter;

impl FrameConverter for IdentityConverter {
    fn convert(
        &self,
        frame: &[u8],
        _roi: Rect,
        target_width: u32,
        target_height: u32,
    ) -> Result<Vec<u8>, PipelineError> {
        let expected = (target_width as usize * target_height as usize * 3) / 2;
        if frame.len() != expected {
            return Err(PipelineError::InvalidInput(format!(
                "expected {expected} bytes for a {target_width}x{target_height} I420 frame, got {}",
                frame.len()
            )));
        }
        Ok(frame.to_vec())
    }
}

/// A synthetic accelerator for tests and the CLI demo: emits `N` output
/// streams, each producing an all-zero tensor of the configured shape after
/// `settle` elapses, in the order inputs were written.
pub struct SimulatedAccelerator {
    metadata: ModelMetadata,
    settle: Duration,
    streams: Vec<SimulatedOutputStream>,
}

impl SimulatedAccelerator {
    pub fn new(metadata: ModelMetadata, settle: Duration) -> Self {
        let streams = metadata
            .output_names
            .iter()
            .zip(metadata.output_shapes.iter())
            .zip(metadata.output_quant.iter())
            .map(|((name, shape), quant)| SimulatedOutputStream {
                name: name.clone(),
                shape: *shape,
                quant: *quant,
                settle,
                pending_writes: 0,
                aborted: false,
            })
            .collect();
        Self {
            metadata,
            settle,
            streams,
        }
    }
}

impl AcceleratorDevice for SimulatedAccelerator {
    fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    fn write_input(&mut self, _buf: &[u8]) -> Result<(), PipelineError> {
        for stream in &mut self.streams {
            stream.pending_writes += 1;
        }
        Ok(())
    }

    fn abort_input(&mut self) {}

    fn output_stream(&mut self, index: usize) -> &mut dyn OutputStream {
        &mut self.streams[index]
    }

    fn take_output_streams(&mut self) -> Vec<Box<dyn OutputStream>> {
        std::mem::take(&mut self.streams)
            .into_iter()
            .map(|s| Box::new(s) as Box<dyn OutputStream>)
            .collect()
    }
}

struct SimulatedOutputStream {
    name: String,
    shape: OutputShape,
    quant: QuantInfo,
    settle: Duration,
    pending_writes: u32,
    aborted: bool,
}

impl OutputStream for SimulatedOutputStream {
    fn read(&mut self, timeout: Duration) -> Result<Option<OutputBuffer>, PipelineError> {
        if self.aborted {
            return Err(PipelineError::Cancelled);
        }
        if self.pending_writes == 0 {
            // Nothing written yet; behave like a transient timeout.
            std::thread::sleep(timeout.min(Duration::from_millis(5)));
            return Ok(None);
        }
        std::thread::sleep(self.settle);
        self.pending_writes -= 1;
        let size = (self.shape.width * self.shape.height * self.shape.features) as usize;
        Ok(Some(OutputBuffer {
            name: self.name.clone(),
            data: vec![0u8; size],
            shape: self.shape,
            quant: self.quant,
        }))
    }

    fn abort(&mut self) {
        self.aborted = true;
    }
}
